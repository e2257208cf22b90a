//! Shared vocabulary of the BTP relay: addresses, link status, relay
//! results, and the sender-side capability traits.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod address;
pub mod error;
pub mod result;
pub mod sender;
pub mod status;
pub mod wallet;

pub use address::BtpAddress;
pub use error::{RelayError, Result};
pub use result::{RelayCode, RelayResult};
pub use sender::{Preference, Sender};
pub use status::{BmcLinkStatus, VerifierStatus};
pub use wallet::Wallet;
