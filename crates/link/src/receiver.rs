//! Source-side capability interface.

use async_trait::async_trait;
use btp_types::{BmcLinkStatus, Result};
use tokio::sync::mpsc;

use crate::message::{BlockProof, BlockUpdate, MessageProof, RelayMessageItem};

/// One observation of the source chain: new evidence exists at `height`,
/// and `seq` is the highest message sequence contained up to and including
/// that height.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceiveStatus {
    pub height: i64,
    pub seq: i64,
}

/// What a receiver emits on its observation stream. An `Err` is terminal
/// for the link; transport hiccups are retried inside the receiver and
/// never surface here.
pub type ReceiverEvent = Result<ReceiveStatus>;

/// Observes a source chain and builds proof items on demand.
///
/// Observations are emitted in strictly increasing height order with
/// non-decreasing sequence numbers. The stream closes on [`Receiver::stop`].
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Begins observing from `max(bls.verifier.height, persisted height)`.
    async fn start(&mut self, bls: &BmcLinkStatus) -> Result<mpsc::Receiver<ReceiverEvent>>;

    fn stop(&self);

    /// Most recent observation; fails if none was made yet.
    fn status(&self) -> Result<ReceiveStatus>;

    /// Builds a non-empty list of block updates whose cumulative encoded
    /// size fits `limit`. An empty list means the next update alone exceeds
    /// `limit`; no update being available at all is an illegal-argument
    /// error (the link only asks while observations are ahead of `bls`).
    async fn build_block_update(&self, bls: &BmcLinkStatus, limit: i64)
    -> Result<Vec<BlockUpdate>>;

    /// Proof for the block at `height` under an already-advanced verifier.
    /// Bridge-mode receivers have nothing to prove and return `None`.
    async fn build_block_proof(&self, bls: &BmcLinkStatus, height: i64)
    -> Result<Option<BlockProof>>;

    /// Proof for messages with sequence numbers strictly greater than
    /// `bls.rx_seq`, drawn from a single source block, greedily packed up
    /// to `limit`. A first event that alone exceeds `limit` still yields a
    /// one-event proof: progress is required over strict size compliance.
    async fn build_message_proof(&self, bls: &BmcLinkStatus, limit: i64)
    -> Result<Option<MessageProof>>;

    /// Serializes assembled items into destination wire bytes.
    fn build_relay_message(&self, items: &[RelayMessageItem]) -> Result<Vec<u8>>;

    /// Source height carrying the proof for `seq`, or 0 when unknown.
    fn height_for_seq(&self, seq: i64) -> i64;

    /// Hands the receiver the finalized-status back-channel; it consumes
    /// the stream to trim its observation backlog and persisted state.
    fn finalized_status(&self, statuses: mpsc::Receiver<BmcLinkStatus>);
}
