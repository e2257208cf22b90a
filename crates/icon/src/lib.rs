//! ICON chain adapters: the trustless BTP-block receiver, the bridge
//! receiver, and the native sender.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod bridge;
pub mod btp2;
pub mod client;
pub mod prover;
pub mod sender;
pub mod wallet;

pub use bridge::IconBridgeReceiver;
pub use btp2::Btp2Receiver;
pub use client::{IconBtpApi, IconClient, IconRpcError};
pub use prover::{MessageProver, SectionProver};
pub use sender::IconSender;
pub use wallet::IconWallet;
