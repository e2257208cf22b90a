//! Native sender: BMC calls with step limit, fragmentation for oversized
//! relay messages, and the transaction retry ladder.

use std::{collections::VecDeque, sync::Arc, time::Duration};

use async_trait::async_trait;
use base64::Engine;
use btp_types::{
    BmcLinkStatus, BtpAddress, Preference, RelayCode, RelayError, RelayResult, Result, Sender,
    Wallet,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::{
    btp2::rpc_err,
    client::{
        BMC_FRAGMENT_METHOD, BMC_RELAY_METHOD, CallData, IconBtpApi, IconRpcError,
        IconTransaction, RESULT_FAILURE_CODE_REVERT, TransactionResult, TxHash,
    },
};

/// Raw transaction payload ceiling of the node.
pub const TX_MAX_DATA_SIZE: i64 = 524_288;
/// Base64 plus envelope overhead eating into the payload ceiling.
pub const TX_OVERHEAD_SCALE: f64 = 0.37;
/// In-flight transactions the sender tracks before pushing back.
pub const MAX_QUEUE_SIZE: usize = 100;
/// How often a missing transaction result is re-queried before giving up.
pub const TX_RESULT_RETRY_LIMIT: u32 = 5;
/// Maximum invocation step limit.
pub const DEFAULT_STEP_LIMIT: i64 = 0x9502_f900;

const SEND_RETRY_INTERVAL: Duration = Duration::from_secs(1);
const GET_RESULT_INTERVAL: Duration = Duration::from_secs(1);

fn default_tx_size_limit() -> i64 {
    ((TX_MAX_DATA_SIZE as f64) / (1.0 + TX_OVERHEAD_SCALE)).ceil() as i64
}

struct Shared {
    queue: Mutex<VecDeque<String>>,
    result_tx: Mutex<Option<mpsc::Sender<RelayResult>>>,
}

/// Sender for ICON destinations.
pub struct IconSender<C> {
    src: BtpAddress,
    dst: BtpAddress,
    client: Arc<C>,
    wallet: Arc<dyn Wallet>,
    step_limit: i64,
    tx_size_limit: i64,
    shared: Arc<Shared>,
}

impl<C: IconBtpApi> IconSender<C> {
    pub fn new(
        src: BtpAddress,
        dst: BtpAddress,
        client: C,
        wallet: Arc<dyn Wallet>,
        step_limit: Option<i64>,
    ) -> Self {
        Self {
            src,
            dst,
            client: Arc::new(client),
            wallet,
            step_limit: step_limit.filter(|l| *l > 0).unwrap_or(DEFAULT_STEP_LIMIT),
            tx_size_limit: default_tx_size_limit(),
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                result_tx: Mutex::new(None),
            }),
        }
    }

    fn transaction(&self, method: &str, params: serde_json::Value) -> IconTransaction {
        IconTransaction {
            version: "0x3".to_owned(),
            from: self.wallet.address(),
            to: self.dst.contract_address().to_owned(),
            nid: self.dst.network_id().to_owned(),
            step_limit: format!("{:#x}", self.step_limit),
            timestamp: None,
            data_type: "call".to_owned(),
            data: CallData { method: method.to_owned(), params },
            signature: None,
            hash: None,
        }
    }

    /// Whole message when it fits, otherwise fragments indexed
    /// `-N, -N+1, .., -1, 0`: the negative head opens a sequence of N
    /// continuation chunks, the zero index completes it.
    async fn submit(&self, message: &[u8]) -> Result<TxHash> {
        let limit = self.tx_size_limit as usize;
        if message.len() <= limit {
            let params = serde_json::json!({
                "_prev": self.src.to_string(),
                "_msg": base64::engine::general_purpose::URL_SAFE.encode(message),
            });
            return self.send_transaction(self.transaction(BMC_RELAY_METHOD, params)).await;
        }

        let mut index = -((message.len() / limit) as i64);
        let mut rest = message;
        while index < 0 {
            self.send_fragment(&rest[..limit], index).await?;
            rest = &rest[limit..];
            index += 1;
        }
        self.send_fragment(rest, 0).await
    }

    async fn send_fragment(&self, chunk: &[u8], index: i64) -> Result<TxHash> {
        let params = serde_json::json!({
            "_prev": self.src.to_string(),
            "_msg": base64::engine::general_purpose::URL_SAFE.encode(chunk),
            "_idx": format!("{index:#x}"),
        });
        self.send_transaction(self.transaction(BMC_FRAGMENT_METHOD, params)).await
    }

    /// The node-facing retry ladder: pool overflow waits and resubmits,
    /// an expired transaction is re-signed, a duplicate already made it.
    async fn send_transaction(&self, mut tx: IconTransaction) -> Result<TxHash> {
        loop {
            self.client
                .sign_transaction(self.wallet.as_ref(), &mut tx)
                .await
                .map_err(rpc_err)?;
            loop {
                match self.client.send_transaction(&tx).await {
                    Ok(hash) => return Ok(hash),
                    Err(IconRpcError::TxPoolOverflow) => {
                        debug!("tx pool overflow, retrying");
                        tokio::time::sleep(SEND_RETRY_INTERVAL).await;
                    }
                    Err(IconRpcError::Duplicate { hash }) => {
                        debug!(%hash, "duplicate transaction treated as submitted");
                        return Ok(hash);
                    }
                    Err(IconRpcError::Expired) => {
                        debug!("transaction expired, re-signing");
                        break;
                    }
                    Err(e) => return Err(rpc_err(e)),
                }
            }
        }
    }
}

#[async_trait]
impl<C: IconBtpApi> Sender for IconSender<C> {
    async fn start(&mut self) -> Result<mpsc::Receiver<RelayResult>> {
        let (tx, rx) = mpsc::channel(1);
        *self.shared.result_tx.lock() = Some(tx);
        Ok(rx)
    }

    fn stop(&self) {
        *self.shared.result_tx.lock() = None;
    }

    async fn get_status(&self) -> Result<BmcLinkStatus> {
        self.client.bmc_status(&self.dst, &self.src).await.map_err(rpc_err)
    }

    async fn relay(&self, id: &str, message: &[u8]) -> Result<()> {
        if self.shared.queue.lock().len() >= MAX_QUEUE_SIZE {
            return Err(RelayError::InvalidState("pending queue full".into()));
        }
        debug!(%id, size = message.len(), "relaying message");
        let hash = self.submit(message).await?;
        self.shared.queue.lock().push_back(id.to_owned());
        tokio::spawn(watch_result(
            self.client.clone(),
            self.shared.clone(),
            id.to_owned(),
            hash,
        ));
        Ok(())
    }

    fn preference(&self) -> Preference {
        Preference {
            tx_size_limit: self.tx_size_limit,
            margin_for_limit: 0,
            latest_result: false,
            filled_block_update: false,
        }
    }
}

async fn watch_result<C: IconBtpApi>(
    client: Arc<C>,
    shared: Arc<Shared>,
    id: String,
    hash: TxHash,
) {
    let code = wait_result(client.as_ref(), &hash).await;
    {
        let mut queue = shared.queue.lock();
        if let Some(pos) = queue.iter().position(|queued| *queued == id) {
            queue.drain(..=pos);
        }
    }
    debug!(%id, %hash, ?code, "relay result");
    let tx = shared.result_tx.lock().clone();
    if let Some(tx) = tx {
        let _ = tx.send(RelayResult { id, code, finalized: true }).await;
    }
}

async fn wait_result<C: IconBtpApi>(client: &C, hash: &TxHash) -> RelayCode {
    let mut retries_left = TX_RESULT_RETRY_LIMIT;
    loop {
        match client.transaction_result(hash).await {
            Ok(result) => return map_result(&result),
            Err(IconRpcError::Pending | IconRpcError::Executing) => {
                tokio::time::sleep(GET_RESULT_INTERVAL).await;
            }
            Err(IconRpcError::NotFound) => {
                if retries_left == 0 {
                    warn!(%hash, "transaction result not found after retries");
                    return RelayCode::BmvUnknown;
                }
                retries_left -= 1;
                tokio::time::sleep(GET_RESULT_INTERVAL).await;
            }
            Err(e) => {
                warn!(%hash, error = %e, "transaction result query failed");
                return RelayCode::BmvUnknown;
            }
        }
    }
}

fn map_result(result: &TransactionResult) -> RelayCode {
    if result.success {
        return RelayCode::Success;
    }
    match result.failure_code {
        Some(code) if code >= RESULT_FAILURE_CODE_REVERT => {
            RelayCode::from_revert(code - RESULT_FAILURE_CODE_REVERT)
        }
        _ => RelayCode::BmvUnknown,
    }
}

#[cfg(test)]
mod tests {
    use btp_types::VerifierStatus;

    use super::*;
    use crate::client::{BtpNotification, BtpRequest};

    #[derive(Default)]
    struct SenderScriptState {
        sent: Vec<IconTransaction>,
        send_responses: VecDeque<Result<TxHash, IconRpcError>>,
        result_responses: VecDeque<Result<TransactionResult, IconRpcError>>,
        sign_count: usize,
        status: BmcLinkStatus,
    }

    #[derive(Clone, Default)]
    struct SenderScript(Arc<Mutex<SenderScriptState>>);

    #[async_trait]
    impl IconBtpApi for SenderScript {
        async fn btp_link_network_id(
            &self,
            _src: &BtpAddress,
            _dst: &BtpAddress,
        ) -> Result<i64, IconRpcError> {
            unimplemented!("sender tests never observe")
        }

        async fn btp_link_offset(
            &self,
            _src: &BtpAddress,
            _dst: &BtpAddress,
        ) -> Result<i64, IconRpcError> {
            unimplemented!("sender tests never observe")
        }

        async fn btp_network_start_height(&self, _network_id: i64) -> Result<i64, IconRpcError> {
            unimplemented!("sender tests never observe")
        }

        async fn btp_header(
            &self,
            _network_id: i64,
            _height: i64,
        ) -> Result<Vec<u8>, IconRpcError> {
            unimplemented!("sender tests never observe")
        }

        async fn btp_proof(
            &self,
            _network_id: i64,
            _height: i64,
        ) -> Result<Vec<u8>, IconRpcError> {
            unimplemented!("sender tests never observe")
        }

        async fn btp_messages(
            &self,
            _network_id: i64,
            _height: i64,
        ) -> Result<Vec<Vec<u8>>, IconRpcError> {
            unimplemented!("sender tests never observe")
        }

        async fn monitor_btp(
            &self,
            _request: &BtpRequest,
        ) -> Result<mpsc::Receiver<BtpNotification>, IconRpcError> {
            unimplemented!("sender tests never observe")
        }

        async fn bmc_status(
            &self,
            _bmc: &BtpAddress,
            _link: &BtpAddress,
        ) -> Result<BmcLinkStatus, IconRpcError> {
            Ok(self.0.lock().status.clone())
        }

        async fn sign_transaction(
            &self,
            _wallet: &dyn Wallet,
            tx: &mut IconTransaction,
        ) -> Result<(), IconRpcError> {
            let mut state = self.0.lock();
            state.sign_count += 1;
            tx.signature = Some(format!("sig-{}", state.sign_count));
            Ok(())
        }

        async fn send_transaction(&self, tx: &IconTransaction) -> Result<TxHash, IconRpcError> {
            let mut state = self.0.lock();
            state.sent.push(tx.clone());
            state
                .send_responses
                .pop_front()
                .unwrap_or_else(|| Ok(format!("0xtx{}", state.sent.len())))
        }

        async fn transaction_result(
            &self,
            _hash: &TxHash,
        ) -> Result<TransactionResult, IconRpcError> {
            self.0.lock().result_responses.pop_front().unwrap_or(Ok(TransactionResult {
                success: true,
                failure_code: None,
                failure_message: None,
            }))
        }
    }

    struct NullWallet;

    impl Wallet for NullWallet {
        fn address(&self) -> String {
            "hx0000000000000000000000000000000000000000".to_owned()
        }

        fn sign(&self, _digest: &[u8; 32]) -> Result<Vec<u8>> {
            Ok(vec![0; 65])
        }
    }

    fn addr(s: &str) -> BtpAddress {
        s.parse().unwrap()
    }

    fn make_sender() -> (IconSender<SenderScript>, SenderScript) {
        let client = SenderScript::default();
        let sender = IconSender::new(
            addr("btp://0x61.bsc/0x22"),
            addr("btp://0x2.icon/cx11"),
            client.clone(),
            Arc::new(NullWallet),
            None,
        );
        (sender, client)
    }

    #[tokio::test]
    async fn small_message_goes_out_as_one_relay_call() {
        let (sender, client) = make_sender();
        sender.submit(&[0xab; 64]).await.unwrap();

        let sent = client.0.lock().sent.clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].data.method, BMC_RELAY_METHOD);
        assert_eq!(sent[0].data.params["_prev"], "btp://0x61.bsc/0x22");
        assert_eq!(sent[0].step_limit, format!("{DEFAULT_STEP_LIMIT:#x}"));
        assert!(sent[0].signature.is_some());
    }

    #[tokio::test]
    async fn oversized_message_fragments_with_signed_head_index() {
        let (mut sender, client) = make_sender();
        sender.tx_size_limit = 100;

        let message: Vec<u8> = (0..=255u8).cycle().take(230).collect();
        sender.submit(&message).await.unwrap();

        let sent = client.0.lock().sent.clone();
        assert_eq!(sent.len(), 3);
        let indices: Vec<&str> = sent
            .iter()
            .map(|tx| {
                assert_eq!(tx.data.method, BMC_FRAGMENT_METHOD);
                tx.data.params["_idx"].as_str().unwrap()
            })
            .collect();
        assert_eq!(indices, vec!["-0x2", "-0x1", "0x0"]);

        // Chunks reassemble to the original message.
        let mut reassembled = Vec::new();
        for tx in &sent {
            let chunk = base64::engine::general_purpose::URL_SAFE
                .decode(tx.data.params["_msg"].as_str().unwrap())
                .unwrap();
            reassembled.extend_from_slice(&chunk);
        }
        assert_eq!(reassembled, message);
    }

    #[tokio::test(start_paused = true)]
    async fn pool_overflow_waits_and_resubmits() {
        let (sender, client) = make_sender();
        client
            .0
            .lock()
            .send_responses
            .extend([Err(IconRpcError::TxPoolOverflow), Ok("0xabc".to_owned())]);

        let hash = sender.submit(&[1; 8]).await.unwrap();
        assert_eq!(hash, "0xabc");
        let state = client.0.lock();
        assert_eq!(state.sent.len(), 2);
        assert_eq!(state.sign_count, 1);
    }

    #[tokio::test]
    async fn expired_transaction_is_resigned() {
        let (sender, client) = make_sender();
        client
            .0
            .lock()
            .send_responses
            .extend([Err(IconRpcError::Expired), Ok("0xdef".to_owned())]);

        sender.submit(&[1; 8]).await.unwrap();
        assert_eq!(client.0.lock().sign_count, 2);
    }

    #[tokio::test]
    async fn duplicate_transaction_counts_as_submitted() {
        let (sender, client) = make_sender();
        client
            .0
            .lock()
            .send_responses
            .push_back(Err(IconRpcError::Duplicate { hash: "0xdup".to_owned() }));

        assert_eq!(sender.submit(&[1; 8]).await.unwrap(), "0xdup");
        assert_eq!(client.0.lock().sent.len(), 1);
    }

    #[tokio::test]
    async fn full_queue_rejects_with_invalid_state() {
        let (sender, client) = make_sender();
        {
            let mut queue = sender.shared.queue.lock();
            for i in 0..MAX_QUEUE_SIZE {
                queue.push_back(format!("id-{i}"));
            }
        }
        let err = sender.relay("id-next", &[1; 8]).await.unwrap_err();
        assert!(err.is_invalid_state());
        assert!(client.0.lock().sent.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn relay_emits_exactly_one_result() {
        let (mut sender, client) = make_sender();
        client.0.lock().result_responses.extend([
            Err(IconRpcError::Pending),
            Ok(TransactionResult { success: true, failure_code: None, failure_message: None }),
        ]);

        let mut results = sender.start().await.unwrap();
        sender.relay("rm-1", &[1; 8]).await.unwrap();

        let result = results.recv().await.unwrap();
        assert_eq!(result.id, "rm-1");
        assert_eq!(result.code, RelayCode::Success);
        assert!(result.finalized);
        assert!(sender.shared.queue.lock().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn revert_results_map_into_the_code_space() {
        let (mut sender, client) = make_sender();
        client.0.lock().result_responses.push_back(Ok(TransactionResult {
            success: false,
            failure_code: Some(RESULT_FAILURE_CODE_REVERT + 26),
            failure_message: Some("NotVerifiable".to_owned()),
        }));

        let mut results = sender.start().await.unwrap();
        sender.relay("rm-2", &[1; 8]).await.unwrap();
        let result = results.recv().await.unwrap();
        assert_eq!(result.code, RelayCode::BmvNotVerifiable);
    }

    #[tokio::test(start_paused = true)]
    async fn missing_result_surfaces_as_unknown_after_retries() {
        let (mut sender, client) = make_sender();
        for _ in 0..=TX_RESULT_RETRY_LIMIT {
            client.0.lock().result_responses.push_back(Err(IconRpcError::NotFound));
        }

        let mut results = sender.start().await.unwrap();
        sender.relay("rm-3", &[1; 8]).await.unwrap();
        let result = results.recv().await.unwrap();
        assert_eq!(result.code, RelayCode::BmvUnknown);
    }

    #[test]
    fn status_reads_through_the_client() {
        let (sender, client) = make_sender();
        client.0.lock().status = BmcLinkStatus {
            tx_seq: 5,
            rx_seq: 3,
            verifier: VerifierStatus { height: 110, extra: vec![1, 2] },
        };
        let status = futures::executor::block_on(sender.get_status()).unwrap();
        assert_eq!(status.rx_seq, 3);
        assert_eq!(status.verifier.height, 110);
    }

    #[test]
    fn size_limit_accounts_for_encoding_overhead() {
        assert_eq!(default_tx_size_limit(), 382_692);
        let (sender, _client) = make_sender();
        let pref = sender.preference();
        assert_eq!(pref.tx_size_limit, 382_692);
        assert!(!pref.latest_result);
        assert!(!pref.filled_block_update);
    }
}
