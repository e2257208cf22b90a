//! The destination's view of a link.

/// Link status as reported by the destination BMC.
///
/// Monotone non-decreasing across successful relays; mutated only by the
/// link engine, never by an adapter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BmcLinkStatus {
    /// Next outbound sequence the destination expects.
    pub tx_seq: i64,
    /// Last message sequence the destination has accepted.
    pub rx_seq: i64,
    pub verifier: VerifierStatus,
}

/// On-chain verifier state embedded in the link status.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifierStatus {
    /// Last source height the verifier has accepted.
    pub height: i64,
    /// Opaque verifier state.
    pub extra: Vec<u8>,
}

impl BmcLinkStatus {
    pub fn new(height: i64, rx_seq: i64, tx_seq: i64) -> Self {
        Self {
            tx_seq,
            rx_seq,
            verifier: VerifierStatus { height, extra: Vec::new() },
        }
    }
}
