//! Transaction-signing capability.

use crate::error::Result;

/// Signs destination transactions.
///
/// Key-store decryption and password resolution happen outside the relay
/// core; implementations are constructed with ready-to-use key material.
pub trait Wallet: Send + Sync {
    /// The chain-native account address, as a printable string.
    fn address(&self) -> String;

    /// Signs a 32-byte digest, returning the chain-native signature bytes.
    fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>>;
}
