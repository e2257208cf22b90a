//! The ICON node API the adapters are written against.
//!
//! [`IconBtpApi`] is the named contract; [`IconClient`] is the thin
//! jsonrpsee-backed implementation. Everything above it (receivers, the
//! sender) only sees the trait, so tests script the node.

use alloy_rlp::{RlpDecodable, RlpEncodable};
use async_trait::async_trait;
use base64::Engine;
use btp_types::{BmcLinkStatus, BtpAddress, VerifierStatus, Wallet};
use bytes::Bytes;
use jsonrpsee::{
    core::client::{ClientT, Subscription, SubscriptionClientT},
    http_client::{HttpClient, HttpClientBuilder},
    rpc_params,
    ws_client::WsClientBuilder,
};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// BMC method invoked with a complete relay message.
pub const BMC_RELAY_METHOD: &str = "handleRelayMessage";
/// BMC method invoked once per fragment of an oversized relay message.
pub const BMC_FRAGMENT_METHOD: &str = "handleFragment";
/// BMC view returning the link status for a source address.
pub const BMC_GET_STATUS_METHOD: &str = "getStatus";

/// On-chain failure codes below this are engine failures, not reverts.
pub const RESULT_FAILURE_CODE_REVERT: i64 = 32;

/// System-error subcodes the send path reacts to.
pub const SYSTEM_CODE_EXPIRED_TRANSACTION: i64 = 2003;
pub const SYSTEM_CODE_DUPLICATE_TRANSACTION: i64 = 2006;

/// JSON-RPC error codes of the node.
pub const RPC_CODE_SYSTEM: i32 = -31000;
pub const RPC_CODE_TX_POOL_OVERFLOW: i32 = -31001;
pub const RPC_CODE_NOT_FOUND: i32 = -31004;
pub const RPC_CODE_PENDING: i32 = -31005;
pub const RPC_CODE_EXECUTING: i32 = -31006;

#[derive(Debug, thiserror::Error)]
pub enum IconRpcError {
    #[error("tx pool overflow")]
    TxPoolOverflow,
    #[error("transaction expired")]
    Expired,
    #[error("duplicate transaction {hash}")]
    Duplicate { hash: String },
    #[error("result pending")]
    Pending,
    #[error("result executing")]
    Executing,
    #[error("not found")]
    NotFound,
    #[error("transport: {0}")]
    Transport(String),
    #[error("codec: {0}")]
    Codec(String),
}

/// Header of a BTP block, RLP-encoded inside notifications.
#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct BtpBlockHeader {
    pub main_height: u64,
    pub round: u32,
    pub next_proof_context_hash: Bytes,
    pub network_id: u64,
    /// `first_message_sn << 1 | next_proof_context_changed`.
    pub update_number: u64,
    pub prev_network_section_hash: Bytes,
    pub message_count: u64,
    pub message_root: Bytes,
}

impl BtpBlockHeader {
    pub fn first_message_sn(&self) -> u64 {
        self.update_number >> 1
    }
}

/// A BTP block update as the verifier consumes it.
#[derive(Debug, Clone, RlpEncodable, RlpDecodable)]
pub struct BtpBlockUpdate {
    pub header: Bytes,
    pub proof: Bytes,
}

/// Subscription request for the BTP block stream.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BtpRequest {
    pub height: i64,
    pub network_id: i64,
    pub proof_flag: i64,
}

/// One notification from the BTP block stream; payloads are base64.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BtpNotification {
    pub header: String,
    #[serde(default)]
    pub proof: Option<String>,
}

pub type TxHash = String;

/// An `icx_sendTransaction` payload; the signature is attached by
/// [`IconBtpApi::sign_transaction`].
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IconTransaction {
    pub version: String,
    pub from: String,
    pub to: String,
    pub nid: String,
    pub step_limit: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<String>,
    pub data_type: String,
    pub data: CallData,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    /// Client-side transaction hash, set when the transaction is signed.
    #[serde(skip)]
    pub hash: Option<TxHash>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CallData {
    pub method: String,
    pub params: serde_json::Value,
}

/// Decoded transaction result, reduced to what the sender reacts to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub success: bool,
    pub failure_code: Option<i64>,
    pub failure_message: Option<String>,
}

/// What the adapters need from an ICON node.
///
/// RPC plumbing, key-store handling, and transaction canonicalization all
/// live behind this boundary.
#[async_trait]
pub trait IconBtpApi: Send + Sync + 'static {
    async fn btp_link_network_id(
        &self,
        src: &BtpAddress,
        dst: &BtpAddress,
    ) -> Result<i64, IconRpcError>;

    /// Sequence offset of the BTP network: `BMC.seq` starts at 1 while the
    /// block's first message sequence number starts at 0.
    async fn btp_link_offset(
        &self,
        src: &BtpAddress,
        dst: &BtpAddress,
    ) -> Result<i64, IconRpcError>;

    async fn btp_network_start_height(&self, network_id: i64) -> Result<i64, IconRpcError>;

    async fn btp_header(&self, network_id: i64, height: i64) -> Result<Vec<u8>, IconRpcError>;

    async fn btp_proof(&self, network_id: i64, height: i64) -> Result<Vec<u8>, IconRpcError>;

    async fn btp_messages(
        &self,
        network_id: i64,
        height: i64,
    ) -> Result<Vec<Vec<u8>>, IconRpcError>;

    /// Opens the BTP block stream; the channel closes when the transport
    /// drops, and the caller reconnects from its last observation.
    async fn monitor_btp(
        &self,
        request: &BtpRequest,
    ) -> Result<mpsc::Receiver<BtpNotification>, IconRpcError>;

    async fn bmc_status(
        &self,
        bmc: &BtpAddress,
        link: &BtpAddress,
    ) -> Result<BmcLinkStatus, IconRpcError>;

    async fn sign_transaction(
        &self,
        wallet: &dyn Wallet,
        tx: &mut IconTransaction,
    ) -> Result<(), IconRpcError>;

    async fn send_transaction(&self, tx: &IconTransaction) -> Result<TxHash, IconRpcError>;

    async fn transaction_result(&self, hash: &TxHash)
    -> Result<TransactionResult, IconRpcError>;
}

/// Per-request deadline on node calls; the BTP subscription itself stays
/// open indefinitely.
const REQUEST_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// jsonrpsee-backed [`IconBtpApi`] implementation.
pub struct IconClient {
    endpoint: String,
    http: HttpClient,
}

impl IconClient {
    pub fn new(endpoint: &str) -> Result<Self, IconRpcError> {
        let http = HttpClientBuilder::default()
            .request_timeout(REQUEST_TIMEOUT)
            .build(endpoint)
            .map_err(|e| IconRpcError::Transport(e.to_string()))?;
        Ok(Self { endpoint: endpoint.to_owned(), http })
    }

    async fn call<R: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: impl jsonrpsee::core::traits::ToRpcParams + Send,
    ) -> Result<R, IconRpcError> {
        self.http.request(method, params).await.map_err(map_rpc_error)
    }
}

fn map_rpc_error(e: jsonrpsee::core::client::Error) -> IconRpcError {
    if let jsonrpsee::core::client::Error::Call(call) = &e {
        match call.code() {
            RPC_CODE_TX_POOL_OVERFLOW => return IconRpcError::TxPoolOverflow,
            RPC_CODE_NOT_FOUND => return IconRpcError::NotFound,
            RPC_CODE_PENDING => return IconRpcError::Pending,
            RPC_CODE_EXECUTING => return IconRpcError::Executing,
            RPC_CODE_SYSTEM => {
                if let Some(sub) = parse_system_subcode(call.message()) {
                    if sub == SYSTEM_CODE_EXPIRED_TRANSACTION {
                        return IconRpcError::Expired;
                    }
                    if sub == SYSTEM_CODE_DUPLICATE_TRANSACTION {
                        return IconRpcError::Duplicate { hash: String::new() };
                    }
                }
            }
            _ => {}
        }
    }
    IconRpcError::Transport(e.to_string())
}

/// System errors carry their subcode as `{NNNN}` at the head of the
/// message.
fn parse_system_subcode(message: &str) -> Option<i64> {
    let rest = message.strip_prefix('{')?;
    let end = rest.find('}')?;
    rest[..end].parse().ok()
}

fn decode_b64(value: &str) -> Result<Vec<u8>, IconRpcError> {
    base64::engine::general_purpose::STANDARD
        .decode(value)
        .map_err(|e| IconRpcError::Codec(e.to_string()))
}

fn hex_i64(value: &str) -> Result<i64, IconRpcError> {
    let raw = value.strip_prefix("0x").unwrap_or(value);
    i64::from_str_radix(raw, 16).map_err(|e| IconRpcError::Codec(e.to_string()))
}

#[async_trait]
impl IconBtpApi for IconClient {
    async fn btp_link_network_id(
        &self,
        src: &BtpAddress,
        dst: &BtpAddress,
    ) -> Result<i64, IconRpcError> {
        let raw: String = self
            .call(
                "btp_getNetworkId",
                rpc_params![src.contract_address(), dst.to_string()],
            )
            .await?;
        hex_i64(&raw)
    }

    async fn btp_link_offset(
        &self,
        src: &BtpAddress,
        dst: &BtpAddress,
    ) -> Result<i64, IconRpcError> {
        let raw: String = self
            .call(
                "btp_getLinkOffset",
                rpc_params![src.contract_address(), dst.to_string()],
            )
            .await?;
        hex_i64(&raw)
    }

    async fn btp_network_start_height(&self, network_id: i64) -> Result<i64, IconRpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct NetworkInfo {
            start_height: String,
        }
        let info: NetworkInfo = self
            .call(
                "btp_getNetworkInfo",
                rpc_params![format!("{network_id:#x}")],
            )
            .await?;
        hex_i64(&info.start_height)
    }

    async fn btp_header(&self, network_id: i64, height: i64) -> Result<Vec<u8>, IconRpcError> {
        let raw: String = self
            .call(
                "btp_getHeader",
                rpc_params![format!("{network_id:#x}"), format!("{height:#x}")],
            )
            .await?;
        decode_b64(&raw)
    }

    async fn btp_proof(&self, network_id: i64, height: i64) -> Result<Vec<u8>, IconRpcError> {
        let raw: String = self
            .call(
                "btp_getProof",
                rpc_params![format!("{network_id:#x}"), format!("{height:#x}")],
            )
            .await?;
        decode_b64(&raw)
    }

    async fn btp_messages(
        &self,
        network_id: i64,
        height: i64,
    ) -> Result<Vec<Vec<u8>>, IconRpcError> {
        let raw: Vec<String> = self
            .call(
                "btp_getMessages",
                rpc_params![format!("{network_id:#x}"), format!("{height:#x}")],
            )
            .await?;
        raw.iter().map(|m| decode_b64(m)).collect()
    }

    async fn monitor_btp(
        &self,
        request: &BtpRequest,
    ) -> Result<mpsc::Receiver<BtpNotification>, IconRpcError> {
        let ws_endpoint = self
            .endpoint
            .replacen("https://", "wss://", 1)
            .replacen("http://", "ws://", 1);
        let ws = WsClientBuilder::default()
            .request_timeout(REQUEST_TIMEOUT)
            .build(&ws_endpoint)
            .await
            .map_err(|e| IconRpcError::Transport(e.to_string()))?;
        let mut subscription: Subscription<BtpNotification> = ws
            .subscribe("btp_subscribe", rpc_params![request.clone()], "btp_unsubscribe")
            .await
            .map_err(map_rpc_error)?;

        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            // Holding the client keeps the socket open for the stream.
            let _ws = ws;
            while let Some(item) = futures::StreamExt::next(&mut subscription).await {
                match item {
                    Ok(notification) => {
                        if tx.send(notification).await.is_err() {
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::debug!(error = %e, "btp subscription decode failure");
                        break;
                    }
                }
            }
        });
        Ok(rx)
    }

    async fn bmc_status(
        &self,
        bmc: &BtpAddress,
        link: &BtpAddress,
    ) -> Result<BmcLinkStatus, IconRpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawVerifier {
            height: String,
            extra: String,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawStatus {
            tx_seq: String,
            rx_seq: String,
            verifier: RawVerifier,
        }
        let call = serde_json::json!({
            "to": bmc.contract_address(),
            "dataType": "call",
            "data": {
                "method": BMC_GET_STATUS_METHOD,
                "params": { "_link": link.to_string() },
            },
        });
        let raw: RawStatus = self.call("icx_call", rpc_params![call]).await?;
        Ok(BmcLinkStatus {
            tx_seq: hex_i64(&raw.tx_seq)?,
            rx_seq: hex_i64(&raw.rx_seq)?,
            verifier: VerifierStatus {
                height: hex_i64(&raw.verifier.height)?,
                extra: decode_b64(&raw.verifier.extra).unwrap_or_default(),
            },
        })
    }

    async fn sign_transaction(
        &self,
        wallet: &dyn Wallet,
        tx: &mut IconTransaction,
    ) -> Result<(), IconRpcError> {
        let micros = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_micros() as u64)
            .unwrap_or(0);
        tx.timestamp = Some(format!("{micros:#x}"));
        tx.signature = None;

        let value =
            serde_json::to_value(&*tx).map_err(|e| IconRpcError::Codec(e.to_string()))?;
        let canonical = format!("icx_sendTransaction.{}", canonicalize(&value));
        let digest = alloy_primitives::keccak256(canonical.as_bytes());
        let signature = wallet
            .sign(&digest.0)
            .map_err(|e| IconRpcError::Codec(e.to_string()))?;
        tx.signature = Some(base64::engine::general_purpose::STANDARD.encode(signature));
        tx.hash = Some(format!("0x{}", const_hex::encode(digest)));
        Ok(())
    }

    async fn send_transaction(&self, tx: &IconTransaction) -> Result<TxHash, IconRpcError> {
        match self.call("icx_sendTransaction", rpc_params![tx.clone()]).await {
            // The node dropped it as already known; the signing hash still
            // identifies the committed transaction.
            Err(IconRpcError::Duplicate { .. }) => Err(IconRpcError::Duplicate {
                hash: tx.hash.clone().unwrap_or_default(),
            }),
            other => other,
        }
    }

    async fn transaction_result(
        &self,
        hash: &TxHash,
    ) -> Result<TransactionResult, IconRpcError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawFailure {
            code: String,
            message: String,
        }
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct RawResult {
            status: String,
            failure: Option<RawFailure>,
        }
        let raw: RawResult = self
            .call(
                "icx_getTransactionResult",
                rpc_params![serde_json::json!({ "txHash": hash })],
            )
            .await?;
        let success = hex_i64(&raw.status)? == 1;
        let (failure_code, failure_message) = match raw.failure {
            Some(f) => (Some(hex_i64(&f.code)?), Some(f.message)),
            None => (None, None),
        };
        Ok(TransactionResult { success, failure_code, failure_message })
    }
}

/// Canonical request text for transaction signing: keys sorted, nested
/// values flattened the way the node hashes them.
fn canonicalize(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut entries: Vec<(&String, &serde_json::Value)> = map.iter().collect();
            entries.sort_by_key(|(k, _)| k.as_str());
            entries
                .iter()
                .map(|(k, v)| format!("{k}.{}", canonicalize(v)))
                .collect::<Vec<_>>()
                .join(".")
        }
        serde_json::Value::Array(items) => items
            .iter()
            .map(canonicalize)
            .collect::<Vec<_>>()
            .join("."),
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "\\0".to_owned(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_sorts_keys_and_flattens() {
        let value = serde_json::json!({
            "to": "cx01",
            "from": "hx02",
            "data": { "method": "handleRelayMessage", "params": { "_prev": "btp://x" } },
        });
        assert_eq!(
            canonicalize(&value),
            "data.method.handleRelayMessage.params._prev.btp://x.from.hx02.to.cx01"
        );
    }

    #[test]
    fn system_subcode_parses_from_braced_prefix() {
        assert_eq!(parse_system_subcode("{2006} duplicate transaction"), Some(2006));
        assert_eq!(parse_system_subcode("plain failure"), None);
    }

    #[test]
    fn block_header_rlp_round_trips() {
        let header = BtpBlockHeader {
            main_height: 110,
            round: 0,
            next_proof_context_hash: Bytes::from_static(&[0xaa; 32]),
            network_id: 2,
            update_number: (7 << 1) | 1,
            prev_network_section_hash: Bytes::from_static(&[0xbb; 32]),
            message_count: 3,
            message_root: Bytes::from_static(&[0xcc; 32]),
        };
        assert_eq!(header.first_message_sn(), 7);

        let encoded = alloy_rlp::encode(&header);
        let decoded = alloy_rlp::Decodable::decode(&mut encoded.as_slice()).unwrap();
        assert_eq!(header, decoded);
    }
}
