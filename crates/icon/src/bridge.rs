//! Bridge receiver: synthesizes destination-filterable events out of the
//! BTP message stream. Block updates and block proofs carry no wire bytes;
//! the destination only consumes receipt proofs.

use std::{sync::Arc, time::Duration};

use alloy_primitives::keccak256;
use alloy_rlp::{RlpDecodable, RlpEncodable};
use async_trait::async_trait;
use btp_link::{
    BlockProof, BlockUpdate, ItemKind, MessageProof, ReceiveStatus, Receiver, ReceiverEvent,
    RelayMessageItem,
};
use btp_types::{BmcLinkStatus, BtpAddress, RelayError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    btp2::rpc_err,
    client::{BtpBlockHeader, BtpNotification, BtpRequest, IconBtpApi, IconRpcError},
};

const GET_MESSAGE_INTERVAL: Duration = Duration::from_secs(1);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

/// One bridged event, keyed to its destination by the hashed BTP address.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct EventWire {
    pub next: Bytes,
    pub sequence: u64,
    pub message: Bytes,
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

pub(crate) fn encoded_event_len(event: &EventWire) -> i64 {
    alloy_rlp::encode(event).len() as i64
}

pub(crate) fn encode_receipt_message(events: &[EventWire], index: u64, height: i64) -> Vec<u8> {
    let receipt = ReceiptWire {
        index,
        events: alloy_rlp::encode(&events.to_vec()).into(),
        height: height as u64,
    };
    let wire = BridgeRelayMessage {
        receipts: vec![alloy_rlp::encode(&receipt).into()],
    };
    alloy_rlp::encode(&wire)
}

#[derive(Debug, Clone)]
struct Observation {
    height: i64,
    start_seq: i64,
    seq: i64,
    events: Vec<EventWire>,
}

#[derive(Default)]
struct State {
    network_id: i64,
    offset: i64,
    start_height: i64,
    seq: i64,
    observations: Vec<Observation>,
    monitor: Option<tokio::task::AbortHandle>,
}

/// Receiver for `icon-bridge` sources.
pub struct IconBridgeReceiver<C> {
    src: BtpAddress,
    dst: BtpAddress,
    client: Arc<C>,
    state: Arc<Mutex<State>>,
}

impl<C: IconBtpApi> IconBridgeReceiver<C> {
    pub fn new(src: BtpAddress, dst: BtpAddress, client: C) -> Self {
        Self {
            src,
            dst,
            client: Arc::new(client),
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    fn next_observation(&self, bls: &BmcLinkStatus) -> Option<Observation> {
        let state = self.state.lock();
        let pos = state
            .observations
            .iter()
            .position(|obs| bls.verifier.height <= obs.height)?;
        if state.observations[pos].height == bls.verifier.height {
            state.observations.get(pos + 1).cloned()
        } else {
            Some(state.observations[pos].clone())
        }
    }

    fn observation_for_seq(&self, seq: i64) -> Option<Observation> {
        self.state
            .lock()
            .observations
            .iter()
            .find(|obs| obs.start_seq <= seq && seq <= obs.seq)
            .cloned()
    }
}

#[async_trait]
impl<C: IconBtpApi> Receiver for IconBridgeReceiver<C> {
    async fn start(&mut self, bls: &BmcLinkStatus) -> Result<mpsc::Receiver<ReceiverEvent>> {
        let network_id = self
            .client
            .btp_link_network_id(&self.src, &self.dst)
            .await
            .map_err(rpc_err)?;
        let offset = self
            .client
            .btp_link_offset(&self.src, &self.dst)
            .await
            .map_err(rpc_err)?;
        let start_height = self
            .client
            .btp_network_start_height(network_id)
            .await
            .map_err(rpc_err)?
            + 1;
        info!(src = %self.src, network_id, offset, "bridge receiver starting");
        {
            let mut state = self.state.lock();
            state.network_id = network_id;
            state.offset = offset;
            state.start_height = start_height;
            state.seq = bls.rx_seq;
        }

        let (tx, rx) = mpsc::channel(1);
        let task = tokio::spawn(monitor(
            self.client.clone(),
            self.state.clone(),
            self.dst.clone(),
            tx,
            bls.verifier.height,
        ));
        self.state.lock().monitor = Some(task.abort_handle());
        Ok(rx)
    }

    fn stop(&self) {
        if let Some(handle) = self.state.lock().monitor.take() {
            handle.abort();
        }
    }

    fn status(&self) -> Result<ReceiveStatus> {
        self.state
            .lock()
            .observations
            .last()
            .map(|obs| ReceiveStatus { height: obs.height, seq: obs.seq })
            .ok_or_else(|| RelayError::NotFound("no observation yet".into()))
    }

    async fn build_block_update(
        &self,
        bls: &BmcLinkStatus,
        _limit: i64,
    ) -> Result<Vec<BlockUpdate>> {
        let Some(obs) = self.next_observation(bls) else {
            return Err(RelayError::IllegalArgument(
                "no block update available to create".into(),
            ));
        };
        // Bridge updates only move the tracked height; nothing goes on the
        // wire, so any budget fits.
        Ok(vec![BlockUpdate::new(bls, obs.height, obs.height, Vec::new())])
    }

    async fn build_block_proof(
        &self,
        _bls: &BmcLinkStatus,
        _height: i64,
    ) -> Result<Option<BlockProof>> {
        Ok(None)
    }

    async fn build_message_proof(
        &self,
        bls: &BmcLinkStatus,
        limit: i64,
    ) -> Result<Option<MessageProof>> {
        let Some(obs) = self.observation_for_seq(bls.rx_seq + 1) else {
            return Ok(None);
        };
        let pending: Vec<EventWire> = obs
            .events
            .iter()
            .filter(|event| event.sequence as i64 > bls.rx_seq)
            .cloned()
            .collect();
        let Some(first) = pending.first() else {
            return Ok(None);
        };

        // Greedy packing by encoded event size; the first event ships even
        // when it alone exceeds the budget.
        let mut taken = vec![first.clone()];
        let mut size = encoded_event_len(first);
        if size <= limit {
            for event in &pending[1..] {
                let event_size = encoded_event_len(event);
                if size + event_size > limit {
                    break;
                }
                size += event_size;
                taken.push(event.clone());
            }
        }
        let last_seq = taken.last().expect("at least one event").sequence as i64;
        let payload = encode_receipt_message(&taken, 0, obs.height);
        Ok(Some(MessageProof::new(bls, bls.rx_seq + 1, last_seq, payload)))
    }

    /// Block updates and proofs are elided: the destination only takes the
    /// receipts carried by the last message proof.
    fn build_relay_message(&self, items: &[RelayMessageItem]) -> Result<Vec<u8>> {
        items
            .iter()
            .rev()
            .find(|item| item.kind() == ItemKind::MessageProof)
            .map(|item| item.payload().to_vec())
            .ok_or_else(|| {
                RelayError::IllegalArgument("bridge relay message without a message proof".into())
            })
    }

    fn height_for_seq(&self, seq: i64) -> i64 {
        self.observation_for_seq(seq).map(|obs| obs.height).unwrap_or(0)
    }

    fn finalized_status(&self, mut statuses: mpsc::Receiver<BmcLinkStatus>) {
        let state = self.state.clone();
        tokio::spawn(async move {
            while let Some(bls) = statuses.recv().await {
                debug!(
                    height = bls.verifier.height,
                    rx_seq = bls.rx_seq,
                    "clearing finalized observations"
                );
                state.lock().observations.retain(|obs| {
                    obs.height > bls.verifier.height || obs.seq > bls.rx_seq
                });
            }
        });
    }
}

async fn monitor<C: IconBtpApi>(
    client: Arc<C>,
    state: Arc<Mutex<State>>,
    dst: BtpAddress,
    tx: mpsc::Sender<ReceiverEvent>,
    mut from_height: i64,
) {
    let next_hash = Bytes::copy_from_slice(keccak256(dst.to_string().as_bytes()).as_slice());
    loop {
        let request = {
            let state = state.lock();
            BtpRequest {
                height: from_height + 1,
                network_id: state.network_id,
                proof_flag: 0,
            }
        };
        match client.monitor_btp(&request).await {
            Ok(mut stream) => {
                info!(height = request.height, "bridge block stream connected");
                while let Some(notification) = stream.recv().await {
                    match on_notification(client.as_ref(), &state, &next_hash, notification).await
                    {
                        Ok(Some(rs)) => {
                            from_height = rs.height;
                            if tx.send(Ok(rs)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            let _ = tx.send(Err(e)).await;
                            return;
                        }
                    }
                }
                warn!(height = from_height, "bridge block stream closed, reconnecting");
            }
            Err(e) => {
                debug!(error = %e, "bridge subscription failed");
            }
        }
        if tx.is_closed() {
            return;
        }
        tokio::time::sleep(RECONNECT_INTERVAL).await;
    }
}

async fn on_notification<C: IconBtpApi>(
    client: &C,
    state: &Arc<Mutex<State>>,
    next_hash: &Bytes,
    notification: BtpNotification,
) -> Result<Option<ReceiveStatus>> {
    use base64::Engine;

    let header_bytes = base64::engine::general_purpose::STANDARD
        .decode(&notification.header)
        .map_err(|e| RelayError::Codec(format!("btp header base64: {e}")))?;
    let header: BtpBlockHeader = alloy_rlp::Decodable::decode(&mut header_bytes.as_slice())
        .map_err(|e| RelayError::Codec(format!("btp header rlp: {e}")))?;
    let height = header.main_height as i64;

    let (network_id, start_height) = {
        let state = state.lock();
        (state.network_id, state.start_height)
    };
    if height == start_height {
        return Ok(None);
    }

    let messages = fetch_messages(client, network_id, height).await?;
    let mut state = state.lock();
    let block_first = state.offset + header.first_message_sn() as i64 + 1;

    let mut events = Vec::new();
    for (i, message) in messages.iter().enumerate() {
        let sequence = block_first + i as i64;
        if sequence <= state.seq {
            continue;
        }
        events.push(EventWire {
            next: next_hash.clone(),
            sequence: sequence as u64,
            message: Bytes::copy_from_slice(message),
        });
    }
    // No surviving events means nothing worth relaying from this block.
    if events.is_empty() {
        return Ok(None);
    }

    let start_seq = events.first().expect("non-empty").sequence as i64;
    let seq = events.last().expect("non-empty").sequence as i64;
    state.seq = seq;
    state.observations.push(Observation {
        height,
        start_seq,
        seq,
        events,
    });
    debug!(height, start_seq, seq, "bridge block observed");
    Ok(Some(ReceiveStatus { height, seq }))
}

async fn fetch_messages<C: IconBtpApi>(
    client: &C,
    network_id: i64,
    height: i64,
) -> Result<Vec<Vec<u8>>> {
    loop {
        match client.btp_messages(network_id, height).await {
            Ok(messages) => return Ok(messages),
            Err(IconRpcError::NotFound) => tokio::time::sleep(GET_MESSAGE_INTERVAL).await,
            Err(e) => return Err(rpc_err(e)),
        }
    }
}
