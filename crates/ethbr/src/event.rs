//! `Message` event decoding, per-block aggregation, and the bridge wire
//! shapes.

use std::collections::BTreeMap;

use alloy::sol;
use alloy_primitives::{B256, U256, keccak256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use btp_types::{BtpAddress, RelayError, Result};
use bytes::Bytes;

sol! {
    /// Source bridge event carrying one cross-chain message.
    #[derive(Debug)]
    event Message(string indexed _next, uint256 indexed _seq, bytes _msg);
}

/// Topic a destination address matches against: indexed strings arrive as
/// their hash.
pub fn next_topic(dst: &BtpAddress) -> B256 {
    keccak256(dst.to_string().as_bytes())
}

/// One decoded `Message` event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeEvent {
    pub next: B256,
    pub sequence: i64,
    pub message: Vec<u8>,
}

/// Decodes the `bytes _msg` payload out of the event data:
/// offset word, length word, then the padded payload.
pub fn decode_message_data(data: &[u8]) -> Result<Vec<u8>> {
    let err = || RelayError::Codec("malformed Message event data".into());
    if data.len() < 64 {
        return Err(err());
    }
    let offset: usize = U256::from_be_slice(&data[..32]).try_into().map_err(|_| err())?;
    let len_word = data.get(offset..offset + 32).ok_or_else(err)?;
    let length: usize = U256::from_be_slice(len_word).try_into().map_err(|_| err())?;
    data.get(offset + 32..offset + 32 + length)
        .map(<[u8]>::to_vec)
        .ok_or_else(err)
}

/// Decodes a raw log's topics and data into a [`BridgeEvent`].
pub fn parse_log(topics: &[B256], data: &[u8]) -> Result<BridgeEvent> {
    if topics.len() < 3 {
        return Err(RelayError::Codec("Message event with missing topics".into()));
    }
    let sequence: i64 = U256::from_be_bytes(topics[2].0)
        .try_into()
        .map_err(|_| RelayError::Codec("event sequence out of range".into()))?;
    Ok(BridgeEvent {
        next: topics[1],
        sequence,
        message: decode_message_data(data)?,
    })
}

/// Event as it goes on the wire.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct EventWire {
    pub next: Bytes,
    pub sequence: u64,
    pub message: Bytes,
}

pub fn encoded_event_len(event: &EventWire) -> i64 {
    alloy_rlp::encode(event).len() as i64
}

/// Events of one transaction, in block order.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ReceiptRecord {
    pub index: u64,
    pub events: Vec<EventWire>,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct ReceiptWire {
    pub index: u64,
    /// RLP-encoded list of [`EventWire`].
    pub events: Bytes,
    pub height: u64,
}

/// The bridge relay message envelope: receipts only.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BridgeRelayMessage {
    pub receipts: Vec<Bytes>,
}

pub fn encode_receipt_message(receipts: &[ReceiptRecord], height: i64) -> Vec<u8> {
    let wire = BridgeRelayMessage {
        receipts: receipts
            .iter()
            .map(|receipt| {
                let encoded = ReceiptWire {
                    index: receipt.index,
                    events: alloy_rlp::encode(&receipt.events).into(),
                    height: height as u64,
                };
                alloy_rlp::encode(&encoded).into()
            })
            .collect(),
    };
    alloy_rlp::encode(&wire)
}

/// One source block's surviving events, grouped by transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockObservation {
    pub height: i64,
    pub start_seq: i64,
    pub seq: i64,
    pub receipts: Vec<ReceiptRecord>,
}

/// Aggregates one block's decoded events:
/// drops sequences at or below `seen`, drops events not addressed to this
/// relay's destination, groups the survivors by transaction index in
/// ascending order.
pub fn aggregate_block(
    height: i64,
    events: &[(u64, BridgeEvent)],
    seen: i64,
    dst_topic: B256,
) -> Option<BlockObservation> {
    let mut grouped: BTreeMap<u64, Vec<EventWire>> = BTreeMap::new();
    let mut start_seq = i64::MAX;
    let mut seq = seen;
    for (tx_index, event) in events {
        if event.sequence <= seen || event.next != dst_topic {
            continue;
        }
        start_seq = start_seq.min(event.sequence);
        seq = seq.max(event.sequence);
        grouped.entry(*tx_index).or_default().push(EventWire {
            next: Bytes::copy_from_slice(event.next.as_slice()),
            sequence: event.sequence as u64,
            message: Bytes::copy_from_slice(&event.message),
        });
    }
    if grouped.is_empty() {
        return None;
    }
    Some(BlockObservation {
        height,
        start_seq,
        seq,
        receipts: grouped
            .into_iter()
            .map(|(index, events)| ReceiptRecord { index, events })
            .collect(),
    })
}

/// Cached per-block payload persisted for proof rebuild after restart.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct CachedBlock {
    pub start_seq: u64,
    pub seq: u64,
    pub receipts: Vec<ReceiptRecord>,
}
