//! The per-direction relay engine.
//!
//! A [`Link`] pulls receive-status observations from a [`Receiver`],
//! assembles sized relay messages against the destination's link status,
//! pushes them through a [`Sender`](btp_types::Sender), and reacts to the
//! outcomes. The [`relay`] module runs one link per configured direction.

#![cfg_attr(not(test), warn(unused_crate_dependencies))]

pub mod assembler;
pub mod link;
pub mod message;
pub mod receiver;
pub mod relay;

pub use link::{Link, RelayState};
pub use message::{BlockProof, BlockUpdate, ItemKind, MessageProof, RelayMessage, RelayMessageItem};
pub use receiver::{ReceiveStatus, Receiver, ReceiverEvent};
pub use relay::{Direction, Relay};
