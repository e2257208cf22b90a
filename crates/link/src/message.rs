//! Relay-message items and the assembled relay message.
//!
//! Every item carries the link status it produces when applied, so
//! [`RelayMessageItem::update_link_status`] is uniform across variants and
//! receiver implementations.

use btp_types::BmcLinkStatus;

/// Wire tag of an item inside a relay message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ItemKind {
    BlockUpdate = 0,
    BlockProof = 1,
    MessageProof = 2,
}

/// Advances the verifier from `src_height` to `target_height`.
#[derive(Debug, Clone)]
pub struct BlockUpdate {
    src_height: i64,
    target_height: i64,
    /// Height this update proves a block at, `-1` when the update carries
    /// no proof slot and a separate block proof is required.
    proof_height: i64,
    payload: Vec<u8>,
    next: BmcLinkStatus,
}

impl BlockUpdate {
    pub fn new(bls: &BmcLinkStatus, target_height: i64, proof_height: i64, payload: Vec<u8>) -> Self {
        let mut next = bls.clone();
        next.verifier.height = target_height;
        Self {
            src_height: bls.verifier.height,
            target_height,
            proof_height,
            payload,
            next,
        }
    }

    pub fn src_height(&self) -> i64 {
        self.src_height
    }

    pub fn target_height(&self) -> i64 {
        self.target_height
    }

    pub fn proof_height(&self) -> i64 {
        self.proof_height
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Proves a block at `proof_height` under an already-advanced verifier.
#[derive(Debug, Clone)]
pub struct BlockProof {
    proof_height: i64,
    payload: Vec<u8>,
    next: BmcLinkStatus,
}

impl BlockProof {
    pub fn new(bls: &BmcLinkStatus, proof_height: i64, payload: Vec<u8>) -> Self {
        Self { proof_height, payload, next: bls.clone() }
    }

    pub fn proof_height(&self) -> i64 {
        self.proof_height
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Delivers messages `start_seq..=last_seq`.
#[derive(Debug, Clone)]
pub struct MessageProof {
    start_seq: i64,
    last_seq: i64,
    payload: Vec<u8>,
    next: BmcLinkStatus,
}

impl MessageProof {
    pub fn new(bls: &BmcLinkStatus, start_seq: i64, last_seq: i64, payload: Vec<u8>) -> Self {
        let mut next = bls.clone();
        next.rx_seq = last_seq;
        Self { start_seq, last_seq, payload, next }
    }

    pub fn start_seq(&self) -> i64 {
        self.start_seq
    }

    pub fn last_seq(&self) -> i64 {
        self.last_seq
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// One constituent of a relay message.
#[derive(Debug, Clone)]
pub enum RelayMessageItem {
    BlockUpdate(BlockUpdate),
    BlockProof(BlockProof),
    MessageProof(MessageProof),
}

impl RelayMessageItem {
    pub fn kind(&self) -> ItemKind {
        match self {
            Self::BlockUpdate(_) => ItemKind::BlockUpdate,
            Self::BlockProof(_) => ItemKind::BlockProof,
            Self::MessageProof(_) => ItemKind::MessageProof,
        }
    }

    /// Encoded byte count this item contributes to a relay message.
    pub fn len(&self) -> i64 {
        self.payload().len() as i64
    }

    pub fn payload(&self) -> &[u8] {
        match self {
            Self::BlockUpdate(bu) => &bu.payload,
            Self::BlockProof(bp) => &bp.payload,
            Self::MessageProof(mp) => &mp.payload,
        }
    }

    /// Mutates `bls` to the post-application state of this item.
    pub fn update_link_status(&self, bls: &mut BmcLinkStatus) {
        let next = match self {
            Self::BlockUpdate(bu) => &bu.next,
            Self::BlockProof(bp) => &bp.next,
            Self::MessageProof(mp) => &mp.next,
        };
        bls.verifier.height = next.verifier.height;
        bls.rx_seq = next.rx_seq;
        bls.tx_seq = next.tx_seq;
    }
}

/// A sized, encoded bundle queued for submission.
#[derive(Debug, Clone)]
pub struct RelayMessage {
    /// Stable id derived from the source network and the post-application
    /// status, so retries under the same starting status are idempotent.
    pub id: String,
    /// Status the destination reaches once this message is applied.
    pub bls: BmcLinkStatus,
    /// Encoded wire bytes.
    pub message: Vec<u8>,
    pub items: Vec<RelayMessageItem>,
    /// Whether this message has been handed to the sender.
    pub sending_status: bool,
}

impl RelayMessage {
    pub fn id_for(network_id: &str, bls: &BmcLinkStatus) -> String {
        format!("{network_id}_{:x}_{:x}", bls.verifier.height, bls.rx_seq)
    }
}
