//! Message-proof payload construction.
//!
//! The Merkle binary tree the on-chain verifier walks is built by an
//! external collaborator; [`MessageProver`] is the seam it plugs into.

use alloy_rlp::RlpEncodable;
use btp_types::{RelayError, Result};
use bytes::Bytes;

/// Produces the proof payload for messages `begin..end` (0-based, `end`
/// exclusive) out of a block's full message list.
pub trait MessageProver: Send + Sync {
    fn prove(&self, messages: &[Vec<u8>], begin: usize, end: usize) -> Result<Vec<u8>>;
}

#[derive(RlpEncodable)]
struct MessageSection {
    left_num: u64,
    messages: Vec<Bytes>,
    total: u64,
}

/// Encodes the message slice with its position in the block.
///
/// Suitable for verifiers that accept plain message sections; a
/// Merkle-proof prover replaces this behind the same trait.
#[derive(Debug, Default)]
pub struct SectionProver;

impl MessageProver for SectionProver {
    fn prove(&self, messages: &[Vec<u8>], begin: usize, end: usize) -> Result<Vec<u8>> {
        if begin >= end || end > messages.len() {
            return Err(RelayError::IllegalArgument(format!(
                "proof range {begin}..{end} out of {} messages",
                messages.len()
            )));
        }
        let section = MessageSection {
            left_num: begin as u64,
            messages: messages[begin..end]
                .iter()
                .map(|m| Bytes::copy_from_slice(m))
                .collect(),
            total: messages.len() as u64,
        };
        Ok(alloy_rlp::encode(&section))
    }
}
