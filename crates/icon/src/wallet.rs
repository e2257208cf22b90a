//! Native wallet backed by a secp256k1 key.

use alloy_primitives::keccak256;
use btp_types::{RelayError, Result, Wallet};
use secp256k1::{Message, PublicKey, Secp256k1, SecretKey};

/// Signs ICON transactions with a recoverable secp256k1 signature.
pub struct IconWallet {
    secret: SecretKey,
    address: String,
}

impl IconWallet {
    pub fn new(secret: SecretKey) -> Self {
        let secp = Secp256k1::new();
        let public = PublicKey::from_secret_key(&secp, &secret);
        // Account id: last 20 bytes of the hashed uncompressed public key.
        let uncompressed = public.serialize_uncompressed();
        let digest = keccak256(&uncompressed[1..]);
        let address = format!("hx{}", const_hex::encode(&digest[12..]));
        Self { secret, address }
    }

    pub fn from_key_hex(hex: &str) -> Result<Self> {
        let bytes = const_hex::decode(hex.trim().trim_start_matches("0x"))
            .map_err(|e| RelayError::Config(format!("invalid wallet key hex: {e}")))?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|e| RelayError::Config(format!("invalid wallet key: {e}")))?;
        Ok(Self::new(secret))
    }
}

impl Wallet for IconWallet {
    fn address(&self) -> String {
        self.address.clone()
    }

    fn sign(&self, digest: &[u8; 32]) -> Result<Vec<u8>> {
        let secp = Secp256k1::new();
        let message = Message::from_digest(*digest);
        let (recovery_id, compact) = secp
            .sign_ecdsa_recoverable(&message, &self.secret)
            .serialize_compact();
        let mut out = Vec::with_capacity(65);
        out.extend_from_slice(&compact);
        out.push(i32::from(recovery_id) as u8);
        Ok(out)
    }
}
