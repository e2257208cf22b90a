//! Destination-side capability interface.

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::{
    error::Result,
    result::RelayResult,
    status::BmcLinkStatus,
};

/// Sizing and behavior hints a sender exposes to its link.
#[derive(Debug, Clone, Copy, Default)]
pub struct Preference {
    /// Hard ceiling on a single relay message's encoded bytes before
    /// fragmentation.
    pub tx_size_limit: i64,
    /// Subtracted from `tx_size_limit` when the link sizes items.
    pub margin_for_limit: i64,
    /// Treat non-final success as success.
    pub latest_result: bool,
    /// Keep appending block updates until the buffer overflows instead of
    /// flushing per block.
    pub filled_block_update: bool,
}

/// Submits relay messages to the destination chain and reports outcomes.
///
/// `start` hands back the result stream; exactly one [`RelayResult`] is
/// emitted per message accepted by [`Sender::relay`]. `relay` fails with
/// [`RelayError::InvalidState`](crate::RelayError::InvalidState) while the
/// bounded in-flight queue is full.
#[async_trait]
pub trait Sender: Send + Sync {
    async fn start(&mut self) -> Result<mpsc::Receiver<RelayResult>>;

    /// Closes the result stream.
    fn stop(&self);

    /// Reads the link status from the destination BMC.
    async fn get_status(&self) -> Result<BmcLinkStatus>;

    /// Submits one encoded relay message. Returns as soon as the message is
    /// enqueued; the outcome arrives on the result stream under `id`.
    async fn relay(&self, id: &str, message: &[u8]) -> Result<()>;

    fn preference(&self) -> Preference;
}
