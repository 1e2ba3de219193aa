//! JSON-RPC client for the node's public API.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{NodeManagerError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct Slot {
    pub period: u64,
    pub thread: u8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeConfigInfo {
    #[serde(deserialize_with = "amount")]
    pub roll_price: f64,
}

/// Subset of `get_status` the manager relies on.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeStatusInfo {
    #[serde(deserialize_with = "amount")]
    pub minimal_fees: f64,
    pub config: NodeConfigInfo,
    #[serde(default)]
    pub last_slot: Option<Slot>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct DeferredCredit {
    pub slot: Slot,
    #[serde(deserialize_with = "amount")]
    pub amount: f64,
}

/// One entry of `get_addresses`.
#[derive(Debug, Clone, Deserialize)]
pub struct NodeAddress {
    pub address: String,
    #[serde(default)]
    pub thread: u8,
    #[serde(default)]
    pub final_roll_count: u64,
    #[serde(default)]
    pub candidate_roll_count: u64,
    #[serde(deserialize_with = "amount")]
    pub final_balance: f64,
    #[serde(deserialize_with = "amount")]
    pub candidate_balance: f64,
    #[serde(default)]
    pub deferred_credits: Vec<DeferredCredit>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationContent {
    pub expire_period: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OperationDetail {
    pub content: OperationContent,
}

/// One entry of `get_operations`.
#[derive(Debug, Clone, Deserialize)]
pub struct OperationInfo {
    pub id: String,
    #[serde(default)]
    pub is_operation_final: Option<bool>,
    pub operation: OperationDetail,
}

impl OperationInfo {
    pub fn is_final(&self) -> bool {
        self.is_operation_final.unwrap_or(false)
    }

    pub fn expire_period(&self) -> u64 {
        self.operation.content.expire_period
    }
}

/// Remote node API used by the supervisor and the staking engine.
#[async_trait]
pub trait NodeApi: Send + Sync {
    async fn get_status(&self) -> Result<NodeStatusInfo>;
    async fn get_addresses(&self, addresses: &[String]) -> Result<Vec<NodeAddress>>;
    async fn get_operation(&self, operation_id: &str) -> Result<OperationInfo>;
}

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

/// [`NodeApi`] over HTTP JSON-RPC 2.0.
pub struct NodeRpcClient {
    http: reqwest::Client,
    url: String,
}

impl NodeRpcClient {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            http,
            url: url.into(),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T> {
        let body = serde_json::json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": method,
            "params": params,
        });

        let resp = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(classify)?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(NodeManagerError::Rpc(format!("{method}: HTTP {status}: {text}")));
        }

        let parsed: RpcResponse<T> = resp.json().await.map_err(classify)?;
        if let Some(err) = parsed.error {
            return Err(NodeManagerError::Rpc(format!(
                "{method}: {} (code {})",
                err.message, err.code
            )));
        }
        parsed
            .result
            .ok_or_else(|| NodeManagerError::Rpc(format!("{method}: empty result")))
    }
}

#[async_trait]
impl NodeApi for NodeRpcClient {
    async fn get_status(&self) -> Result<NodeStatusInfo> {
        self.call("get_status", serde_json::json!([])).await
    }

    async fn get_addresses(&self, addresses: &[String]) -> Result<Vec<NodeAddress>> {
        self.call("get_addresses", serde_json::json!([addresses]))
            .await
    }

    async fn get_operation(&self, operation_id: &str) -> Result<OperationInfo> {
        let ops: Vec<OperationInfo> = self
            .call("get_operations", serde_json::json!([[operation_id]]))
            .await?;
        ops.into_iter()
            .find(|op| op.id == operation_id)
            .ok_or_else(|| NodeManagerError::NotFound(format!("operation {operation_id}")))
    }
}

/// Separate unreachable/timeout failures so pollers can treat them as transient.
pub(crate) fn classify(err: reqwest::Error) -> NodeManagerError {
    if err.is_connect() {
        NodeManagerError::NodeUnreachable(err.to_string())
    } else if err.is_timeout() {
        NodeManagerError::Timeout(err.to_string())
    } else {
        NodeManagerError::Http(err)
    }
}

/// Amounts come back as decimal strings; accept plain numbers too.
fn amount<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<f64, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Number(n) => Ok(n),
        Raw::Text(s) => s.trim().parse().map_err(serde::de::Error::custom),
    }
}
