use anyhow::Context;
use log::{debug, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::time::{sleep, timeout};

use crate::config::Config;

/// One direction of a public channel as seen in gossip (`listchannels`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GossipChannel {
    pub source: String,
    pub destination: String,
    pub short_channel_id: String,
    #[serde(with = "msat")]
    pub amount_msat: u64,
    pub active: bool,
    pub last_update: u64,
    pub base_fee_millisatoshi: u64,
    pub fee_per_millionth: u64,
    pub delay: u32,
    #[serde(with = "msat")]
    pub htlc_minimum_msat: u64,
    #[serde(default, with = "msat::option")]
    pub htlc_maximum_msat: Option<u64>,
}

/// A node announcement (`listnodes`); only the alias is used.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeAnnouncement {
    pub nodeid: String,
    #[serde(default)]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub id: String,
    #[serde(default)]
    pub alias: Option<String>,
}

/// One of our own channels (`listpeerchannels`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PeerChannel {
    pub peer_id: String,
    pub peer_connected: bool,
    pub state: String,
    #[serde(default)]
    pub short_channel_id: Option<String>,
    #[serde(with = "msat")]
    pub total_msat: u64,
    #[serde(with = "msat")]
    pub to_us_msat: u64,
    #[serde(default, with = "msat::option")]
    pub spendable_msat: Option<u64>,
    #[serde(default, with = "msat::option")]
    pub receivable_msat: Option<u64>,
}

/// A route hop in the shape `sendpay` expects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendPayHop {
    pub id: String,
    pub channel: String,
    pub direction: u8,
    pub amount_msat: u64,
    pub delay: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentSuccess {
    pub payment_hash: String,
    #[serde(default, with = "msat::option")]
    pub amount_msat: Option<u64>,
    #[serde(default, with = "msat::option")]
    pub amount_sent_msat: Option<u64>,
    #[serde(default)]
    pub created_at: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentFailure {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub payment_hash: String,
    #[serde(default)]
    pub erring_index: Option<u32>,
    #[serde(default)]
    pub failcode: Option<u32>,
    #[serde(default)]
    pub failcodename: Option<String>,
    #[serde(default)]
    pub erring_node: Option<String>,
    #[serde(default)]
    pub erring_channel: Option<String>,
    #[serde(default)]
    pub erring_direction: Option<u8>,
    #[serde(default, with = "msat::option")]
    pub amount_msat: Option<u64>,
}

impl PaymentFailure {
    pub const FEE_INSUFFICIENT: &'static str = "WIRE_FEE_INSUFFICIENT";

    pub fn is_fee_insufficient(&self) -> bool {
        self.failcodename.as_deref() == Some(Self::FEE_INSUFFICIENT)
    }
}

/// `sendpay_success` or `sendpay_failure` as lightningd notifies it.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub enum PaymentNotification {
    #[serde(rename = "sendpay_success")]
    Success(PaymentSuccess),
    #[serde(rename = "sendpay_failure")]
    Failure(FailureNotification),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct FailureNotification {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: PaymentFailure,
}

impl FailureNotification {
    pub fn into_failure(self) -> PaymentFailure {
        PaymentFailure {
            code: self.code,
            message: self.message,
            ..self.data
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PaymentStatus {
    Complete(PaymentSuccess),
    Failed(PaymentFailure),
    /// `waitsendpay` gave up; the HTLC may still resolve later.
    TimedOut,
}

/// Trait abstracting the lightningd RPC surface used by the rebalancer.
///
/// This enables mock-based testing without a live node.
#[async_trait::async_trait]
pub trait LightningRpc: Send + Sync {
    async fn get_info(&self) -> anyhow::Result<NodeInfo>;
    async fn list_channels(&self) -> anyhow::Result<Vec<GossipChannel>>;
    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeAnnouncement>>;
    async fn list_peer_channels(&self) -> anyhow::Result<Vec<PeerChannel>>;
    async fn send_pay(&self, route: &[SendPayHop], payment_hash: &str) -> anyhow::Result<()>;
    async fn wait_send_pay(
        &self,
        payment_hash: &str,
        timeout_secs: u64,
    ) -> anyhow::Result<PaymentStatus>;
}

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    #[error("transport error: {0}")]
    Transport(#[from] std::io::Error),
    #[error("call timed out after {0:?}")]
    Timeout(Duration),
    #[error("malformed response: {0}")]
    Malformed(String),
    #[error("rpc error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl RpcError {
    fn is_transient(&self) -> bool {
        matches!(self, RpcError::Transport(_) | RpcError::Timeout(_))
    }
}

/// `waitsendpay` error codes
const WAIT_TIMEOUT: i64 = 200;
const PAY_FAILURE_CODES: [i64; 7] = [202, 203, 204, 205, 206, 207, 209];

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_MS: u64 = 1000;

/// JSON-RPC 2.0 client for lightningd's unix socket, retrying idempotent calls.
pub struct ClnClient {
    socket_path: PathBuf,
    call_timeout: Duration,
    next_id: AtomicU64,
}

impl ClnClient {
    pub fn new(config: &Config) -> anyhow::Result<Self> {
        let socket_path = config.rpc.socket_path.clone();
        if !socket_path.exists() {
            anyhow::bail!("RPC socket not found at: {}", socket_path.display());
        }
        Ok(Self {
            socket_path,
            call_timeout: Duration::from_secs(config.rpc.call_timeout_secs),
            next_id: AtomicU64::new(1),
        })
    }

    async fn call_raw(
        &self,
        method: &str,
        params: Value,
        limit: Duration,
    ) -> Result<Value, RpcError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        let payload =
            serde_json::to_vec(&request).map_err(|e| RpcError::Malformed(e.to_string()))?;

        let exchange = async {
            let mut stream = UnixStream::connect(&self.socket_path).await?;
            stream.write_all(&payload).await?;

            // lightningd terminates every response with a blank line
            let mut buf = Vec::with_capacity(8192);
            let mut chunk = [0u8; 16384];
            loop {
                let n = stream.read(&mut chunk).await?;
                if n == 0 {
                    return Err(RpcError::Malformed(
                        "connection closed before a full response".to_string(),
                    ));
                }
                buf.extend_from_slice(&chunk[..n]);
                if !buf.ends_with(b"\n\n") {
                    continue;
                }
                match serde_json::from_slice::<Value>(&buf) {
                    Ok(value) => return Ok(value),
                    Err(e) if e.is_eof() => continue,
                    Err(e) => return Err(RpcError::Malformed(e.to_string())),
                }
            }
        };

        let mut response = timeout(limit, exchange)
            .await
            .map_err(|_| RpcError::Timeout(limit))??;

        if let Some(error) = response.get_mut("error") {
            let code = error.get("code").and_then(Value::as_i64).unwrap_or(-1);
            let message = error
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string();
            let data = error.get_mut("data").map(Value::take);
            return Err(RpcError::Remote {
                code,
                message,
                data,
            });
        }
        response
            .get_mut("result")
            .map(Value::take)
            .ok_or_else(|| RpcError::Malformed("response without result".to_string()))
    }

    async fn with_retry(&self, method: &str, params: Value) -> anyhow::Result<Value> {
        for attempt in 0..MAX_RETRIES {
            match self.call_raw(method, params.clone(), self.call_timeout).await {
                Ok(resp) => {
                    debug!("{}: success", method);
                    return Ok(resp);
                }
                Err(e) if e.is_transient() && attempt < MAX_RETRIES - 1 => {
                    let delay = RETRY_BASE_MS * 2u64.pow(attempt);
                    warn!(
                        "{}: attempt {} failed ({}), retrying in {}ms",
                        method,
                        attempt + 1,
                        e,
                        delay
                    );
                    sleep(Duration::from_millis(delay)).await;
                }
                Err(e) => return Err(anyhow::anyhow!("{}: {}", method, e)),
            }
        }
        anyhow::bail!("{}: all {} attempts failed", method, MAX_RETRIES)
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> anyhow::Result<T> {
        let value = self.with_retry(method, params).await?;
        serde_json::from_value(value).with_context(|| format!("{}: unexpected response", method))
    }
}

#[derive(Deserialize)]
struct ListChannelsResponse {
    channels: Vec<GossipChannel>,
}

#[derive(Deserialize)]
struct ListNodesResponse {
    nodes: Vec<NodeAnnouncement>,
}

#[derive(Deserialize)]
struct ListPeerChannelsResponse {
    channels: Vec<PeerChannel>,
}

#[async_trait::async_trait]
impl LightningRpc for ClnClient {
    async fn get_info(&self) -> anyhow::Result<NodeInfo> {
        self.call("getinfo", json!({})).await
    }

    async fn list_channels(&self) -> anyhow::Result<Vec<GossipChannel>> {
        let resp: ListChannelsResponse = self.call("listchannels", json!({})).await?;
        Ok(resp.channels)
    }

    async fn list_nodes(&self) -> anyhow::Result<Vec<NodeAnnouncement>> {
        let resp: ListNodesResponse = self.call("listnodes", json!({})).await?;
        Ok(resp.nodes)
    }

    async fn list_peer_channels(&self) -> anyhow::Result<Vec<PeerChannel>> {
        let resp: ListPeerChannelsResponse = self.call("listpeerchannels", json!({})).await?;
        Ok(resp.channels)
    }

    // Not retried: sending twice would be a second payment attempt.
    async fn send_pay(&self, route: &[SendPayHop], payment_hash: &str) -> anyhow::Result<()> {
        let params = json!({ "route": route, "payment_hash": payment_hash });
        self.call_raw("sendpay", params, self.call_timeout)
            .await
            .map(|_| ())
            .map_err(|e| anyhow::anyhow!("sendpay: {}", e))
    }

    async fn wait_send_pay(
        &self,
        payment_hash: &str,
        timeout_secs: u64,
    ) -> anyhow::Result<PaymentStatus> {
        let params = json!({ "payment_hash": payment_hash, "timeout": timeout_secs });
        let limit = Duration::from_secs(timeout_secs) + self.call_timeout;
        match self.call_raw("waitsendpay", params, limit).await {
            Ok(value) => {
                let success: PaymentSuccess = serde_json::from_value(value)
                    .context("waitsendpay: unexpected response")?;
                Ok(PaymentStatus::Complete(success))
            }
            Err(RpcError::Remote { code, .. }) if code == WAIT_TIMEOUT => Ok(PaymentStatus::TimedOut),
            Err(RpcError::Remote {
                code,
                message,
                data,
            }) if PAY_FAILURE_CODES.contains(&code) => {
                let mut failure: PaymentFailure = match data {
                    Some(data) => serde_json::from_value(data).unwrap_or_default(),
                    None => PaymentFailure::default(),
                };
                failure.code = code;
                failure.message = message;
                if failure.payment_hash.is_empty() {
                    failure.payment_hash = payment_hash.to_string();
                }
                Ok(PaymentStatus::Failed(failure))
            }
            Err(RpcError::Timeout(_)) => Ok(PaymentStatus::TimedOut),
            Err(e) => Err(anyhow::anyhow!("waitsendpay: {}", e)),
        }
    }
}

/// Millisatoshi fields arrive either as integers or as `"<n>msat"` strings.
pub mod msat {
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(u64),
        Str(String),
    }

    fn parse<E: serde::de::Error>(raw: Raw) -> Result<u64, E> {
        match raw {
            Raw::Num(n) => Ok(n),
            Raw::Str(s) => s.trim_end_matches("msat").parse().map_err(E::custom),
        }
    }

    pub fn serialize<S: Serializer>(value: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(*value)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        parse(Raw::deserialize(deserializer)?)
    }

    pub mod option {
        use super::{parse, Raw};
        use serde::{Deserialize, Deserializer, Serializer};

        pub fn serialize<S: Serializer>(
            value: &Option<u64>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(v) => serializer.serialize_some(v),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<u64>, D::Error> {
            match Option::<Raw>::deserialize(deserializer)? {
                Some(raw) => parse(raw).map(Some),
                None => Ok(None),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Mock client for integration testing
// ---------------------------------------------------------------------------

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Mock lightningd that returns preset responses and records payments.
    pub struct MockLightning {
        pub info: NodeInfo,
        pub channels: Mutex<Vec<GossipChannel>>,
        pub nodes: Mutex<Vec<NodeAnnouncement>>,
        pub peer_channels: Mutex<Vec<PeerChannel>>,
        /// Scripted outcomes, consumed in order; defaults to success when empty
        pub outcomes: Mutex<VecDeque<PaymentStatus>>,
        pub send_pay_calls: Arc<Mutex<Vec<(Vec<SendPayHop>, String)>>>,
        pub fail_send_pay: Mutex<bool>,
    }

    impl MockLightning {
        pub fn new(node_id: &str) -> Self {
            Self {
                info: NodeInfo {
                    id: node_id.to_string(),
                    alias: Some("mock".to_string()),
                },
                channels: Mutex::new(Vec::new()),
                nodes: Mutex::new(Vec::new()),
                peer_channels: Mutex::new(Vec::new()),
                outcomes: Mutex::new(VecDeque::new()),
                send_pay_calls: Arc::new(Mutex::new(Vec::new())),
                fail_send_pay: Mutex::new(false),
            }
        }

        pub fn push_outcome(&self, outcome: PaymentStatus) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        pub fn sent_routes(&self) -> Vec<Vec<SendPayHop>> {
            self.send_pay_calls
                .lock()
                .unwrap()
                .iter()
                .map(|(route, _)| route.clone())
                .collect()
        }
    }

    #[async_trait::async_trait]
    impl LightningRpc for MockLightning {
        async fn get_info(&self) -> anyhow::Result<NodeInfo> {
            Ok(self.info.clone())
        }

        async fn list_channels(&self) -> anyhow::Result<Vec<GossipChannel>> {
            Ok(self.channels.lock().unwrap().clone())
        }

        async fn list_nodes(&self) -> anyhow::Result<Vec<NodeAnnouncement>> {
            Ok(self.nodes.lock().unwrap().clone())
        }

        async fn list_peer_channels(&self) -> anyhow::Result<Vec<PeerChannel>> {
            Ok(self.peer_channels.lock().unwrap().clone())
        }

        async fn send_pay(&self, route: &[SendPayHop], payment_hash: &str) -> anyhow::Result<()> {
            if *self.fail_send_pay.lock().unwrap() {
                anyhow::bail!("sendpay: rpc error 204: First peer not ready");
            }
            self.send_pay_calls
                .lock()
                .unwrap()
                .push((route.to_vec(), payment_hash.to_string()));
            Ok(())
        }

        async fn wait_send_pay(
            &self,
            payment_hash: &str,
            _timeout_secs: u64,
        ) -> anyhow::Result<PaymentStatus> {
            let scripted = self.outcomes.lock().unwrap().pop_front();
            Ok(match scripted {
                Some(PaymentStatus::Failed(mut failure)) => {
                    failure.payment_hash = payment_hash.to_string();
                    PaymentStatus::Failed(failure)
                }
                Some(other) => other,
                None => PaymentStatus::Complete(PaymentSuccess {
                    payment_hash: payment_hash.to_string(),
                    ..Default::default()
                }),
            })
        }
    }
}
