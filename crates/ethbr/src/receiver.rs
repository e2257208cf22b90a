//! Event-log receiver: watches the source bridge contract for `Message`
//! events over websocket or polling, aggregates them per block, and keeps
//! enough state persisted to rebuild proofs after a restart.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use alloy::{
    providers::{Provider, ProviderBuilder},
    rpc::types::Filter,
    sol_types::SolEvent,
};
use alloy_primitives::{Address, B256};
use async_trait::async_trait;
use btp_link::{
    BlockProof, BlockUpdate, ItemKind, MessageProof, ReceiveStatus, Receiver, ReceiverEvent,
    RelayMessageItem,
};
use btp_store::LinkStore;
use btp_types::{BmcLinkStatus, BtpAddress, RelayError, Result};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::event::{
    BlockObservation, BridgeEvent, CachedBlock, Message, ReceiptRecord, aggregate_block,
    encode_receipt_message, encoded_event_len, next_topic, parse_log,
};

const BLOCK_POLL_INTERVAL: Duration = Duration::from_secs(3);
const RECONNECT_INTERVAL: Duration = Duration::from_secs(3);

#[derive(Default)]
struct State {
    /// Highest sequence already aggregated.
    seen: i64,
    observations: Vec<BlockObservation>,
    monitor: Option<tokio::task::AbortHandle>,
}

/// Receiver for `eth-bridge` sources.
pub struct EthBridgeReceiver {
    src: BtpAddress,
    dst: BtpAddress,
    rpc_url: String,
    ws_url: Option<String>,
    /// Observation floor from the chain options, 0 when unset.
    start_height: i64,
    state: Arc<Mutex<State>>,
    store: Arc<Mutex<LinkStore>>,
}

impl EthBridgeReceiver {
    pub fn new(
        src: BtpAddress,
        dst: BtpAddress,
        rpc_url: String,
        ws_url: Option<String>,
        start_height: i64,
        store: LinkStore,
    ) -> Self {
        Self {
            src,
            dst,
            rpc_url,
            ws_url,
            start_height,
            state: Arc::new(Mutex::new(State::default())),
            store: Arc::new(Mutex::new(store)),
        }
    }

    /// Restores the observation backlog from the store and picks the height
    /// observation resumes from. A destination that has accepted nothing
    /// yet invalidates whatever was persisted.
    fn resume(&self, bls: &BmcLinkStatus) -> Result<(Vec<BlockObservation>, i64)> {
        let mut store = self.store.lock();
        if bls.rx_seq < 1 {
            store.reset().map_err(store_err)?;
            return Ok((Vec::new(), bls.verifier.height.max(self.start_height)));
        }

        let mut replayed = Vec::new();
        for (height, payload) in store.blocks_after(bls.verifier.height).map_err(store_err)? {
            let cached: CachedBlock = alloy_rlp::Decodable::decode(&mut payload.as_slice())
                .map_err(|e| RelayError::Codec(format!("cached block {height}: {e}")))?;
            replayed.push(BlockObservation {
                height,
                start_seq: cached.start_seq as i64,
                seq: cached.seq as i64,
                receipts: cached.receipts,
            });
        }
        let begin = bls
            .verifier
            .height
            .max(self.start_height)
            .max(store.last_receive_height());
        Ok((replayed, begin))
    }

    fn observation_for_seq(&self, seq: i64) -> Option<BlockObservation> {
        self.state
            .lock()
            .observations
            .iter()
            .find(|obs| obs.start_seq <= seq && seq <= obs.seq)
            .cloned()
    }

    fn next_observation(&self, bls: &BmcLinkStatus) -> Option<BlockObservation> {
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
}

#[async_trait]
impl Receiver for EthBridgeReceiver {
    async fn start(&mut self, bls: &BmcLinkStatus) -> Result<mpsc::Receiver<ReceiverEvent>> {
        let contract: Address = self
            .src
            .contract_address()
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid bridge contract address: {e}")))?;

        let (replayed, begin) = self.resume(bls)?;
        {
            let mut state = self.state.lock();
            state.seen = bls
                .rx_seq
                .max(replayed.last().map(|obs| obs.seq).unwrap_or(0));
            state.observations = replayed.clone();
        }
        info!(
            src = %self.src,
            begin,
            replayed = replayed.len(),
            "eth bridge receiver starting"
        );

        let (tx, rx) = mpsc::channel(1);
        let watch = Watch {
            contract,
            dst_topic: next_topic(&self.dst),
            rpc_url: self.rpc_url.clone(),
            ws_url: self.ws_url.clone(),
            state: self.state.clone(),
            store: self.store.clone(),
        };
        let task = tokio::spawn(async move {
            for obs in &replayed {
                let rs = ReceiveStatus { height: obs.height, seq: obs.seq };
                if tx.send(Ok(rs)).await.is_err() {
                    return;
                }
            }
            watch.run(tx, begin).await;
        });
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

        // Greedy packing across the block's receipts; the first undelivered
        // event ships even when it alone exceeds the budget.
        let mut receipts = Vec::new();
        let mut size = 0i64;
        let mut last = bls.rx_seq;
        let mut full = false;
        for receipt in &obs.receipts {
            let mut taken = Vec::new();
            for event in &receipt.events {
                if event.sequence as i64 <= bls.rx_seq {
                    continue;
                }
                let event_size = encoded_event_len(event);
                let has_any = last > bls.rx_seq;
                if has_any && size + event_size > limit {
                    full = true;
                    break;
                }
                size += event_size;
                last = event.sequence as i64;
                taken.push(event.clone());
            }
            if !taken.is_empty() {
                receipts.push(ReceiptRecord { index: receipt.index, events: taken });
            }
            if full {
                break;
            }
        }
        if last <= bls.rx_seq {
            return Ok(None);
        }
        let payload = encode_receipt_message(&receipts, obs.height);
        Ok(Some(MessageProof::new(bls, bls.rx_seq + 1, last, payload)))
    }

    /// Only the receipts of the last message proof go on the wire.
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
        let store = self.store.clone();
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
                if let Err(e) = store.lock().prune_through(bls.verifier.height) {
                    warn!(error = %e, "failed to prune the link store");
                }
            }
        });
    }
}

/// The long-running observation side, shared by both transports.
struct Watch {
    contract: Address,
    dst_topic: B256,
    rpc_url: String,
    ws_url: Option<String>,
    state: Arc<Mutex<State>>,
    store: Arc<Mutex<LinkStore>>,
}

impl Watch {
    async fn run(&self, tx: mpsc::Sender<ReceiverEvent>, mut from: i64) {
        loop {
            let outcome = match &self.ws_url {
                Some(ws_url) => self.run_websocket(ws_url, &tx, &mut from).await,
                None => self.run_polling(&tx, &mut from).await,
            };
            if tx.is_closed() {
                return;
            }
            if let Err(e) = outcome {
                debug!(error = %e, from, "observation transport failed, reconnecting");
            }
            tokio::time::sleep(RECONNECT_INTERVAL).await;
        }
    }

    async fn run_websocket(
        &self,
        ws_url: &str,
        tx: &mpsc::Sender<ReceiverEvent>,
        from: &mut i64,
    ) -> Result<()> {
        let provider = ProviderBuilder::new()
            .connect(ws_url)
            .await
            .map_err(|e| RelayError::Rpc(format!("ws connect failed: {e}")))?;
        info!(from = *from, "subscribed to source blocks");
        let subscription = provider
            .subscribe_blocks()
            .await
            .map_err(|e| RelayError::Rpc(format!("subscribe failed: {e}")))?;
        let mut stream = subscription.into_stream();
        while let Some(header) = futures::StreamExt::next(&mut stream).await {
            let tip = header.number as i64;
            if tip > *from {
                self.process_range(&provider, *from + 1, tip, tx).await?;
                *from = tip;
            }
            if tx.is_closed() {
                return Ok(());
            }
        }
        Ok(())
    }

    async fn run_polling(
        &self,
        tx: &mpsc::Sender<ReceiverEvent>,
        from: &mut i64,
    ) -> Result<()> {
        let provider = ProviderBuilder::new().connect_http(
            self.rpc_url
                .parse()
                .map_err(|e| RelayError::Config(format!("invalid rpc url: {e}")))?,
        );
        info!(from = *from, "polling source blocks");
        loop {
            let tip = provider
                .get_block_number()
                .await
                .map_err(|e| RelayError::Rpc(e.to_string()))? as i64;
            if tip > *from {
                self.process_range(&provider, *from + 1, tip, tx).await?;
                *from = tip;
            }
            if tx.is_closed() {
                return Ok(());
            }
            tokio::time::sleep(BLOCK_POLL_INTERVAL).await;
        }
    }

    async fn process_range(
        &self,
        provider: &impl Provider,
        lo: i64,
        hi: i64,
        tx: &mpsc::Sender<ReceiverEvent>,
    ) -> Result<()> {
        let filter = Filter::new()
            .address(self.contract)
            .event_signature(Message::SIGNATURE_HASH)
            .from_block(lo as u64)
            .to_block(hi as u64);
        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| RelayError::Rpc(e.to_string()))?;

        let mut per_block: BTreeMap<i64, Vec<(u64, BridgeEvent)>> = BTreeMap::new();
        for log in logs {
            let Some(height) = log.block_number else { continue };
            let tx_index = log.transaction_index.unwrap_or(0);
            match parse_log(log.topics(), &log.data().data) {
                Ok(event) => {
                    per_block.entry(height as i64).or_default().push((tx_index, event));
                }
                Err(e) => warn!(error = %e, "failed to parse log"),
            }
        }

        for (height, events) in per_block {
            let observation = {
                let state = self.state.lock();
                aggregate_block(height, &events, state.seen, self.dst_topic)
            };
            if let Some(obs) = observation {
                debug!(
                    height,
                    start_seq = obs.start_seq,
                    seq = obs.seq,
                    receipts = obs.receipts.len(),
                    "source block observed"
                );
                {
                    let mut state = self.state.lock();
                    state.seen = obs.seq;
                    state.observations.push(obs.clone());
                }
                {
                    let cached = CachedBlock {
                        start_seq: obs.start_seq as u64,
                        seq: obs.seq as u64,
                        receipts: obs.receipts.clone(),
                    };
                    let mut store = self.store.lock();
                    store.put_block(height, &alloy_rlp::encode(&cached));
                }
                let rs = ReceiveStatus { height: obs.height, seq: obs.seq };
                if tx.send(Ok(rs)).await.is_err() {
                    return Ok(());
                }
            }
        }
        if let Err(e) = self.store.lock().set_last_receive_height(hi) {
            warn!(error = %e, "failed to persist the observed height");
        }
        Ok(())
    }
}

fn store_err(e: btp_store::StoreError) -> RelayError {
    RelayError::Store(e.to_string())
}
