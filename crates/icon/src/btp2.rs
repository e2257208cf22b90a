//! Trustless receiver: consumes the BTP block stream and builds
//! verifier-checkable updates and proofs.

use std::{sync::Arc, time::Duration};

use alloy_rlp::RlpEncodable;
use async_trait::async_trait;
use btp_link::{
    BlockProof, BlockUpdate, MessageProof, ReceiveStatus, Receiver, ReceiverEvent,
    RelayMessageItem,
};
use btp_types::{BmcLinkStatus, BtpAddress, RelayError, Result};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::{
    client::{BtpBlockHeader, BtpBlockUpdate, BtpNotification, BtpRequest, IconBtpApi, IconRpcError},
    prover::MessageProver,
};

/// Poll interval while a block's messages are not yet queryable.
const GET_MESSAGE_INTERVAL: Duration = Duration::from_secs(1);
/// Back-off before reopening a dropped BTP subscription.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy)]
struct Observation {
    height: i64,
    start_seq: i64,
    seq: i64,
}

#[derive(Default)]
struct State {
    network_id: i64,
    offset: i64,
    start_height: i64,
    /// Highest message sequence observed so far.
    seq: i64,
    observations: Vec<Observation>,
    monitor: Option<tokio::task::AbortHandle>,
}

/// Receiver for `icon-btp2` sources.
pub struct Btp2Receiver<C> {
    src: BtpAddress,
    dst: BtpAddress,
    client: Arc<C>,
    prover: Arc<dyn MessageProver>,
    state: Arc<Mutex<State>>,
}

impl<C: IconBtpApi> Btp2Receiver<C> {
    pub fn new(src: BtpAddress, dst: BtpAddress, client: C, prover: Arc<dyn MessageProver>) -> Self {
        Self {
            src,
            dst,
            client: Arc::new(client),
            prover,
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
            state.observations.get(pos + 1).copied()
        } else {
            Some(state.observations[pos])
        }
    }

    fn observation_at(&self, height: i64) -> Option<Observation> {
        self.state
            .lock()
            .observations
            .iter()
            .find(|obs| obs.height == height)
            .copied()
    }

    async fn block_evidence(&self, height: i64) -> Result<Vec<u8>> {
        let network_id = self.state.lock().network_id;
        let header = self
            .client
            .btp_header(network_id, height)
            .await
            .map_err(rpc_err)?;
        let proof = self
            .client
            .btp_proof(network_id, height)
            .await
            .map_err(rpc_err)?;
        Ok(alloy_rlp::encode(BtpBlockUpdate {
            header: header.into(),
            proof: proof.into(),
        }))
    }
}

#[async_trait]
impl<C: IconBtpApi> Receiver for Btp2Receiver<C> {
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
        info!(
            src = %self.src,
            network_id,
            offset,
            start_height,
            "btp2 receiver starting"
        );
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
        limit: i64,
    ) -> Result<Vec<BlockUpdate>> {
        let Some(obs) = self.next_observation(bls) else {
            return Err(RelayError::IllegalArgument(
                "no block update available to create".into(),
            ));
        };
        let payload = self.block_evidence(obs.height).await?;
        if payload.len() as i64 > limit {
            return Ok(Vec::new());
        }
        Ok(vec![BlockUpdate::new(bls, obs.height, obs.height, payload)])
    }

    async fn build_block_proof(
        &self,
        bls: &BmcLinkStatus,
        height: i64,
    ) -> Result<Option<BlockProof>> {
        if height < 1 {
            return Ok(None);
        }
        let payload = self.block_evidence(height).await?;
        Ok(Some(BlockProof::new(bls, height, payload)))
    }

    async fn build_message_proof(
        &self,
        bls: &BmcLinkStatus,
        limit: i64,
    ) -> Result<Option<MessageProof>> {
        let Some(obs) = self.observation_at(bls.verifier.height) else {
            return Ok(None);
        };
        if obs.seq <= bls.rx_seq {
            return Ok(None);
        }
        let network_id = self.state.lock().network_id;
        let messages = self
            .client
            .btp_messages(network_id, obs.height)
            .await
            .map_err(rpc_err)?;
        let count = messages.len() as i64;
        let delivered = bls.rx_seq - (obs.seq - count);
        if !(0..count).contains(&delivered) {
            return Ok(None);
        }

        // Greedy packing: extend the section until the next message would
        // push the encoded proof past the limit. A single message that
        // exceeds the limit on its own still ships.
        let begin = delivered as usize;
        let mut end = begin + 1;
        let mut payload = self.prover.prove(&messages, begin, end)?;
        while (end as i64) < count {
            let candidate = self.prover.prove(&messages, begin, end + 1)?;
            if candidate.len() as i64 > limit {
                break;
            }
            payload = candidate;
            end += 1;
        }
        Ok(Some(MessageProof::new(
            bls,
            bls.rx_seq + 1,
            bls.rx_seq + (end - begin) as i64,
            payload,
        )))
    }

    fn build_relay_message(&self, items: &[RelayMessageItem]) -> Result<Vec<u8>> {
        #[derive(RlpEncodable)]
        struct TypePrefixedMessage {
            kind: u8,
            payload: Bytes,
        }
        #[derive(RlpEncodable)]
        struct BtpRelayMessage {
            messages: Vec<TypePrefixedMessage>,
        }
        let wire = BtpRelayMessage {
            messages: items
                .iter()
                .map(|item| TypePrefixedMessage {
                    kind: item.kind() as u8,
                    payload: Bytes::copy_from_slice(item.payload()),
                })
                .collect(),
        };
        Ok(alloy_rlp::encode(&wire))
    }

    fn height_for_seq(&self, seq: i64) -> i64 {
        self.state
            .lock()
            .observations
            .iter()
            .find(|obs| obs.start_seq <= seq && seq <= obs.seq)
            .map(|obs| obs.height)
            .unwrap_or(0)
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

/// Long-running observation loop: keeps the subscription open, reconnecting
/// from the last observed height until the link goes away.
async fn monitor<C: IconBtpApi>(
    client: Arc<C>,
    state: Arc<Mutex<State>>,
    tx: mpsc::Sender<ReceiverEvent>,
    mut from_height: i64,
) {
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
                info!(height = request.height, "btp block stream connected");
                while let Some(notification) = stream.recv().await {
                    match on_notification(client.as_ref(), &state, notification).await {
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
                warn!(height = from_height, "btp block stream closed, reconnecting");
            }
            Err(e) => {
                debug!(error = %e, "btp subscription failed");
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
    // The network's start block repeats on every fresh subscription.
    if height == start_height {
        return Ok(None);
    }

    let messages = fetch_messages(client, network_id, height).await?;
    let mut state = state.lock();
    if !messages.is_empty() {
        let first = state.offset + header.first_message_sn() as i64 + 1;
        let expected = state.seq + 1;
        if first != expected {
            return Err(RelayError::Gap { expected, got: first });
        }
    }
    let start_seq = state.seq + 1;
    state.seq += messages.len() as i64;
    let obs = Observation { height, start_seq, seq: state.seq };
    state.observations.push(obs);
    debug!(
        height,
        update_number = header.update_number,
        messages = messages.len(),
        seq = state.seq,
        "btp block observed"
    );
    Ok(Some(ReceiveStatus { height, seq: obs.seq }))
}

/// A block's messages lag its notification; poll until the node serves
/// them.
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

pub(crate) fn rpc_err(e: IconRpcError) -> RelayError {
    RelayError::Rpc(e.to_string())
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use btp_types::Wallet;

    use super::*;
    use crate::{
        client::{IconTransaction, TransactionResult, TxHash},
        prover::SectionProver,
    };

    #[derive(Default)]
    pub(crate) struct ScriptIconState {
        pub network_id: i64,
        pub offset: i64,
        pub start_height: i64,
        pub headers: HashMap<i64, Vec<u8>>,
        pub proofs: HashMap<i64, Vec<u8>>,
        pub messages: HashMap<i64, Vec<Vec<u8>>>,
        pub note_tx: Option<mpsc::Sender<BtpNotification>>,
        pub monitor_from: Vec<i64>,
    }

    #[derive(Clone, Default)]
    pub(crate) struct ScriptIcon(pub Arc<Mutex<ScriptIconState>>);

    #[async_trait]
    impl IconBtpApi for ScriptIcon {
        async fn btp_link_network_id(
            &self,
            _src: &BtpAddress,
            _dst: &BtpAddress,
        ) -> Result<i64, IconRpcError> {
            Ok(self.0.lock().network_id)
        }

        async fn btp_link_offset(
            &self,
            _src: &BtpAddress,
            _dst: &BtpAddress,
        ) -> Result<i64, IconRpcError> {
            Ok(self.0.lock().offset)
        }

        async fn btp_network_start_height(&self, _network_id: i64) -> Result<i64, IconRpcError> {
            Ok(self.0.lock().start_height)
        }

        async fn btp_header(&self, _network_id: i64, height: i64) -> Result<Vec<u8>, IconRpcError> {
            self.0.lock().headers.get(&height).cloned().ok_or(IconRpcError::NotFound)
        }

        async fn btp_proof(&self, _network_id: i64, height: i64) -> Result<Vec<u8>, IconRpcError> {
            self.0.lock().proofs.get(&height).cloned().ok_or(IconRpcError::NotFound)
        }

        async fn btp_messages(
            &self,
            _network_id: i64,
            height: i64,
        ) -> Result<Vec<Vec<u8>>, IconRpcError> {
            self.0.lock().messages.get(&height).cloned().ok_or(IconRpcError::NotFound)
        }

        async fn monitor_btp(
            &self,
            request: &BtpRequest,
        ) -> Result<mpsc::Receiver<BtpNotification>, IconRpcError> {
            let (tx, rx) = mpsc::channel(16);
            let mut state = self.0.lock();
            state.monitor_from.push(request.height);
            state.note_tx = Some(tx);
            Ok(rx)
        }

        async fn bmc_status(
            &self,
            _bmc: &BtpAddress,
            _link: &BtpAddress,
        ) -> Result<BmcLinkStatus, IconRpcError> {
            unimplemented!("receiver tests never read the destination")
        }

        async fn sign_transaction(
            &self,
            _wallet: &dyn Wallet,
            _tx: &mut IconTransaction,
        ) -> Result<(), IconRpcError> {
            unimplemented!("receiver tests never sign")
        }

        async fn send_transaction(&self, _tx: &IconTransaction) -> Result<TxHash, IconRpcError> {
            unimplemented!("receiver tests never send")
        }

        async fn transaction_result(
            &self,
            _hash: &TxHash,
        ) -> Result<TransactionResult, IconRpcError> {
            unimplemented!("receiver tests never poll results")
        }
    }

    pub(crate) fn encoded_header(height: i64, first_sn: u64, message_count: u64) -> Vec<u8> {
        alloy_rlp::encode(BtpBlockHeader {
            main_height: height as u64,
            round: 0,
            next_proof_context_hash: Bytes::from_static(&[0x11; 32]),
            network_id: 2,
            update_number: first_sn << 1,
            prev_network_section_hash: Bytes::from_static(&[0x22; 32]),
            message_count,
            message_root: Bytes::from_static(&[0x33; 32]),
        })
    }

    pub(crate) fn notification(height: i64, first_sn: u64, message_count: u64) -> BtpNotification {
        use base64::Engine;
        BtpNotification {
            header: base64::engine::general_purpose::STANDARD
                .encode(encoded_header(height, first_sn, message_count)),
            proof: None,
        }
    }

    fn addr(s: &str) -> BtpAddress {
        s.parse().unwrap()
    }

    fn receiver_with(state: ScriptIconState) -> (Btp2Receiver<ScriptIcon>, ScriptIcon) {
        let client = ScriptIcon(Arc::new(Mutex::new(state)));
        let receiver = Btp2Receiver::new(
            addr("btp://0x2.icon/cx11"),
            addr("btp://0x61.bsc/0x22"),
            client.clone(),
            Arc::new(SectionProver),
        );
        (receiver, client)
    }

    async fn push_note(client: &ScriptIcon, note: BtpNotification) {
        let tx = client.0.lock().note_tx.clone().unwrap();
        tx.send(note).await.unwrap();
    }

    #[tokio::test]
    async fn accumulates_sequences_across_blocks() {
        let mut state = ScriptIconState::default();
        state.messages.insert(110, vec![vec![1; 8], vec![2; 8]]);
        state.messages.insert(120, vec![vec![3; 8]]);
        let (mut receiver, client) = receiver_with(state);

        let mut events = receiver.start(&BmcLinkStatus::new(100, 0, 0)).await.unwrap();
        assert_eq!(client.0.lock().monitor_from, vec![101]);

        push_note(&client, notification(110, 0, 2)).await;
        assert_eq!(
            events.recv().await.unwrap().unwrap(),
            ReceiveStatus { height: 110, seq: 2 }
        );
        push_note(&client, notification(120, 2, 1)).await;
        assert_eq!(
            events.recv().await.unwrap().unwrap(),
            ReceiveStatus { height: 120, seq: 3 }
        );

        assert_eq!(receiver.status().unwrap(), ReceiveStatus { height: 120, seq: 3 });
        assert_eq!(receiver.height_for_seq(1), 110);
        assert_eq!(receiver.height_for_seq(3), 120);
        assert_eq!(receiver.height_for_seq(9), 0);
        receiver.stop();
    }

    #[tokio::test]
    async fn sequence_gap_is_terminal() {
        let mut state = ScriptIconState::default();
        state.messages.insert(110, vec![vec![1; 8]]);
        state.messages.insert(120, vec![vec![9; 8]]);
        let (mut receiver, client) = receiver_with(state);

        let mut events = receiver.start(&BmcLinkStatus::new(100, 0, 0)).await.unwrap();
        push_note(&client, notification(110, 0, 1)).await;
        events.recv().await.unwrap().unwrap();

        // The node reports first sequence 5 where 1 message was delivered.
        push_note(&client, notification(120, 5, 1)).await;
        let err = events.recv().await.unwrap().unwrap_err();
        assert!(matches!(err, RelayError::Gap { expected: 2, got: 6 }));
        receiver.stop();
    }

    #[tokio::test]
    async fn start_block_notification_is_skipped() {
        let mut state = ScriptIconState::default();
        state.start_height = 104;
        state.messages.insert(110, vec![vec![1; 8]]);
        let (mut receiver, client) = receiver_with(state);

        let mut events = receiver.start(&BmcLinkStatus::new(100, 0, 0)).await.unwrap();
        // start() bumps the configured start height by one.
        push_note(&client, notification(105, 0, 0)).await;
        push_note(&client, notification(110, 0, 1)).await;
        assert_eq!(
            events.recv().await.unwrap().unwrap(),
            ReceiveStatus { height: 110, seq: 1 }
        );
        receiver.stop();
    }

    #[tokio::test]
    async fn block_update_respects_the_size_budget() {
        let mut state = ScriptIconState::default();
        state.headers.insert(110, vec![0xaa; 100]);
        state.proofs.insert(110, vec![0xbb; 100]);
        state.messages.insert(110, vec![vec![1; 8]]);
        let (mut receiver, client) = receiver_with(state);

        let bls = BmcLinkStatus::new(100, 0, 0);
        let mut events = receiver.start(&bls).await.unwrap();
        push_note(&client, notification(110, 0, 1)).await;
        events.recv().await.unwrap().unwrap();

        let fitting = receiver.build_block_update(&bls, 4096).await.unwrap();
        assert_eq!(fitting.len(), 1);
        assert_eq!(fitting[0].target_height(), 110);
        assert_eq!(fitting[0].proof_height(), 110);
        assert!(!fitting[0].payload().is_empty());

        let too_small = receiver.build_block_update(&bls, 10).await.unwrap();
        assert!(too_small.is_empty());

        // Nothing beyond the last observation: a design-bug error.
        let ahead = BmcLinkStatus::new(110, 1, 0);
        assert!(matches!(
            receiver.build_block_update(&ahead, 4096).await,
            Err(RelayError::IllegalArgument(_))
        ));
        receiver.stop();
    }

    #[tokio::test]
    async fn message_proof_packs_greedily_within_limit() {
        let mut state = ScriptIconState::default();
        state
            .messages
            .insert(110, vec![vec![1; 100], vec![2; 100], vec![3; 100]]);
        let (mut receiver, client) = receiver_with(state);

        let mut events = receiver.start(&BmcLinkStatus::new(100, 0, 0)).await.unwrap();
        push_note(&client, notification(110, 0, 3)).await;
        events.recv().await.unwrap().unwrap();

        let at_block = BmcLinkStatus::new(110, 0, 0);
        let mp = receiver
            .build_message_proof(&at_block, 250)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((mp.start_seq(), mp.last_seq()), (1, 2));

        // A first message over the limit still makes a one-message proof.
        let tight = receiver
            .build_message_proof(&at_block, 10)
            .await
            .unwrap()
            .unwrap();
        assert_eq!((tight.start_seq(), tight.last_seq()), (1, 1));

        // Everything delivered: nothing to prove.
        let done = BmcLinkStatus::new(110, 3, 0);
        assert!(receiver.build_message_proof(&done, 4096).await.unwrap().is_none());
        receiver.stop();
    }

    #[tokio::test]
    async fn relay_message_wire_prefixes_item_kinds() {
        let (receiver, _client) = receiver_with(ScriptIconState::default());
        let bls = BmcLinkStatus::new(100, 0, 0);
        let items = vec![
            RelayMessageItem::BlockUpdate(BlockUpdate::new(&bls, 110, 110, vec![0xab; 4])),
            RelayMessageItem::MessageProof(MessageProof::new(&bls, 1, 1, vec![0xcd; 4])),
        ];
        let wire = receiver.build_relay_message(&items).unwrap();
        assert!(!wire.is_empty());
        // Tags and payloads survive a round trip through the envelope.
        #[derive(alloy_rlp::RlpDecodable)]
        struct TypePrefixedMessage {
            kind: u8,
            payload: Bytes,
        }
        #[derive(alloy_rlp::RlpDecodable)]
        struct BtpRelayMessage {
            messages: Vec<TypePrefixedMessage>,
        }
        let decoded: BtpRelayMessage =
            alloy_rlp::Decodable::decode(&mut wire.as_slice()).unwrap();
        assert_eq!(decoded.messages.len(), 2);
        assert_eq!(decoded.messages[0].kind, 0);
        assert_eq!(decoded.messages[1].kind, 2);
        assert_eq!(decoded.messages[1].payload.as_ref(), &[0xcd; 4]);
    }
}
