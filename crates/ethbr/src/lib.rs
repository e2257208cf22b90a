//! EVM bridge adapters: event-log receiver and contract-call sender.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod event;
pub mod receiver;
pub mod sender;

pub use receiver::EthBridgeReceiver;
pub use sender::EthSender;
