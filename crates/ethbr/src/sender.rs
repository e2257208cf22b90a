//! EVM sender: `handleRelayMessage` contract calls with receipt watching
//! and revert-code mapping.

use std::{collections::VecDeque, sync::Arc};

use alloy::{
    network::EthereumWallet,
    providers::{Provider, ProviderBuilder},
    rpc::types::TransactionRequest,
    signers::local::PrivateKeySigner,
    sol,
    sol_types::SolCall,
};
use alloy_primitives::{Address, Bytes};
use async_trait::async_trait;
use btp_types::{
    BmcLinkStatus, BtpAddress, Preference, RelayCode, RelayError, RelayResult, Result, Sender,
    VerifierStatus,
};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Shared with the native sender: the destination accepts the same raw
/// payload ceiling before encoding overhead.
const TX_MAX_DATA_SIZE: i64 = 524_288;
const TX_OVERHEAD_SCALE: f64 = 0.37;
/// In-flight transactions tracked before pushing back.
pub const MAX_QUEUE_SIZE: usize = 100;

sol! {
    #[derive(Debug)]
    struct BmcVerifierStatus {
        uint256 height;
        bytes extra;
    }

    #[derive(Debug)]
    struct BmcLinkStatusSol {
        uint256 rxSeq;
        uint256 txSeq;
        BmcVerifierStatus verifier;
        uint256 currentHeight;
    }

    #[derive(Debug)]
    function getStatus(string _link) external view returns (BmcLinkStatusSol memory);

    #[derive(Debug)]
    function handleRelayMessage(string _prev, bytes _msg) external;
}

struct Shared {
    queue: Mutex<VecDeque<String>>,
    result_tx: Mutex<Option<mpsc::Sender<RelayResult>>>,
}

/// Sender for EVM destinations.
pub struct EthSender {
    src: BtpAddress,
    dst: BtpAddress,
    rpc_url: String,
    bmc: Address,
    signer: PrivateKeySigner,
    shared: Arc<Shared>,
}

impl EthSender {
    pub fn new(src: BtpAddress, dst: BtpAddress, rpc_url: String, signer: PrivateKeySigner)
    -> Result<Self> {
        let bmc = dst
            .contract_address()
            .parse()
            .map_err(|e| RelayError::Config(format!("invalid bmc address: {e}")))?;
        Ok(Self {
            src,
            dst,
            rpc_url,
            bmc,
            signer,
            shared: Arc::new(Shared {
                queue: Mutex::new(VecDeque::new()),
                result_tx: Mutex::new(None),
            }),
        })
    }

}

#[async_trait]
impl Sender for EthSender {
    async fn start(&mut self) -> Result<mpsc::Receiver<RelayResult>> {
        let (tx, rx) = mpsc::channel(1);
        *self.shared.result_tx.lock() = Some(tx);
        Ok(rx)
    }

    fn stop(&self) {
        *self.shared.result_tx.lock() = None;
    }

    async fn get_status(&self) -> Result<BmcLinkStatus> {
        let provider = ProviderBuilder::new().connect_http(
            self.rpc_url
                .parse()
                .map_err(|e| RelayError::Config(format!("invalid rpc url: {e}")))?,
        );
        let call = getStatusCall { _link: self.src.to_string() };
        let request = TransactionRequest::default()
            .to(self.bmc)
            .input(call.abi_encode().into());
        let output = provider
            .call(request)
            .await
            .map_err(|e| RelayError::Rpc(format!("getStatus call failed: {e}")))?;
        let status = getStatusCall::abi_decode_returns(&output)
            .map_err(|e| RelayError::Codec(format!("getStatus returns: {e}")))?;
        Ok(BmcLinkStatus {
            tx_seq: status.txSeq.to::<u64>() as i64,
            rx_seq: status.rxSeq.to::<u64>() as i64,
            verifier: VerifierStatus {
                height: status.verifier.height.to::<u64>() as i64,
                extra: status.verifier.extra.to_vec(),
            },
        })
    }

    async fn relay(&self, id: &str, message: &[u8]) -> Result<()> {
        if self.shared.queue.lock().len() >= MAX_QUEUE_SIZE {
            return Err(RelayError::InvalidState("pending queue full".into()));
        }

        let wallet = EthereumWallet::from(self.signer.clone());
        let provider = ProviderBuilder::new().wallet(wallet).connect_http(
            self.rpc_url
                .parse()
                .map_err(|e| RelayError::Config(format!("invalid rpc url: {e}")))?,
        );
        let call = handleRelayMessageCall {
            _prev: self.src.to_string(),
            _msg: Bytes::copy_from_slice(message),
        };
        let request = TransactionRequest::default()
            .to(self.bmc)
            .input(call.abi_encode().into());

        debug!(%id, size = message.len(), bmc = %self.bmc, "relaying message");
        let pending = provider
            .send_transaction(request.clone())
            .await
            .map_err(|e| RelayError::Rpc(format!("handleRelayMessage send failed: {e}")))?;

        self.shared.queue.lock().push_back(id.to_owned());
        let shared = self.shared.clone();
        let id = id.to_owned();
        tokio::spawn(async move {
            let code = match pending.get_receipt().await {
                Ok(receipt) if receipt.status() => RelayCode::Success,
                Ok(receipt) => {
                    // Re-execute the call to pull the revert reason out.
                    let reason = match provider.call(request).await {
                        Err(e) => e.to_string(),
                        Ok(_) => String::new(),
                    };
                    match parse_revert_code(&reason) {
                        Some(revert) => RelayCode::from_revert(revert),
                        None => {
                            warn!(
                                tx = %receipt.transaction_hash,
                                %reason,
                                "relay transaction reverted without a mappable code"
                            );
                            RelayCode::BmvUnknown
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, "relay transaction was dropped");
                    RelayCode::BmvUnknown
                }
            };
            {
                let mut queue = shared.queue.lock();
                if let Some(pos) = queue.iter().position(|queued| *queued == id) {
                    queue.drain(..=pos);
                }
            }
            let tx = shared.result_tx.lock().clone();
            if let Some(tx) = tx {
                let _ = tx.send(RelayResult { id, code, finalized: true }).await;
            }
        });
        Ok(())
    }

    fn preference(&self) -> Preference {
        Preference {
            tx_size_limit: ((TX_MAX_DATA_SIZE as f64) / (1.0 + TX_OVERHEAD_SCALE)).ceil() as i64,
            margin_for_limit: 0,
            latest_result: false,
            filled_block_update: false,
        }
    }
}

/// Pulls the numeric failure code out of a revert reason shaped like
/// `execution reverted: <Name> <code>: <detail>`.
pub(crate) fn parse_revert_code(reason: &str) -> Option<i64> {
    let parts: Vec<&str> = reason.split(':').collect();
    if parts.len() > 2 {
        parts[1].split_whitespace().last()?.parse().ok()
    } else {
        None
    }
}
