//! The upstream full node, reached over JSON-RPC.

use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use base64::Engine as _;
use hashxd_primitives::{hash256_from_hex, hash256_to_hex, hex_to_bytes, BlockHeader, Hash256};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;

const RPC_IN_WARMUP: i64 = -28;
const RPC_INVALID_ADDRESS_OR_KEY: i64 = -5;
const RPC_INVALID_PARAMETER: i64 = -8;

#[derive(Clone, Debug)]
pub enum DaemonError {
    /// Network failure, timeout or a node still warming up; worth retrying.
    Transient(String),
    /// The node answered but refused the request or returned unusable data.
    Rejected(String),
}

impl DaemonError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DaemonError::Transient(_))
    }
}

impl fmt::Display for DaemonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonError::Transient(message) => write!(f, "upstream unavailable: {message}"),
            DaemonError::Rejected(message) => write!(f, "upstream rejected request: {message}"),
        }
    }
}

impl std::error::Error for DaemonError {}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Tip {
    pub height: i32,
    pub hash: Hash256,
}

pub trait Daemon: Send + Sync + 'static {
    fn current_tip(&self) -> impl Future<Output = Result<Tip, DaemonError>> + Send;

    /// `None` when the node has no block at `height`.
    fn block_hash(
        &self,
        height: u32,
    ) -> impl Future<Output = Result<Option<Hash256>, DaemonError>> + Send;

    fn get_header(
        &self,
        height: u32,
    ) -> impl Future<Output = Result<Option<BlockHeader>, DaemonError>> + Send;

    fn get_block(&self, hash: &Hash256) -> impl Future<Output = Result<Vec<u8>, DaemonError>> + Send;

    fn mempool_txids(&self) -> impl Future<Output = Result<Vec<Hash256>, DaemonError>> + Send;

    /// `None` once the transaction is unknown to the node.
    fn raw_transaction(
        &self,
        txid: &Hash256,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, DaemonError>> + Send;

    /// Hashes for `[start, start + count)`, stopping at the first missing height.
    fn block_hashes(
        &self,
        start: u32,
        count: u32,
    ) -> impl Future<Output = Result<Vec<Hash256>, DaemonError>> + Send {
        async move {
            let mut hashes = Vec::with_capacity(count as usize);
            for height in start..start.saturating_add(count) {
                match self.block_hash(height).await? {
                    Some(hash) => hashes.push(hash),
                    None => break,
                }
            }
            Ok(hashes)
        }
    }
}

impl<D: Daemon> Daemon for Arc<D> {
    fn current_tip(&self) -> impl Future<Output = Result<Tip, DaemonError>> + Send {
        self.as_ref().current_tip()
    }

    fn block_hash(
        &self,
        height: u32,
    ) -> impl Future<Output = Result<Option<Hash256>, DaemonError>> + Send {
        self.as_ref().block_hash(height)
    }

    fn get_header(
        &self,
        height: u32,
    ) -> impl Future<Output = Result<Option<BlockHeader>, DaemonError>> + Send {
        self.as_ref().get_header(height)
    }

    fn get_block(&self, hash: &Hash256) -> impl Future<Output = Result<Vec<u8>, DaemonError>> + Send {
        self.as_ref().get_block(hash)
    }

    fn mempool_txids(&self) -> impl Future<Output = Result<Vec<Hash256>, DaemonError>> + Send {
        self.as_ref().mempool_txids()
    }

    fn raw_transaction(
        &self,
        txid: &Hash256,
    ) -> impl Future<Output = Result<Option<Vec<u8>>, DaemonError>> + Send {
        self.as_ref().raw_transaction(txid)
    }
}

#[derive(Serialize)]
struct RpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorBody {
    code: i64,
    message: String,
}

enum RpcFailure {
    Daemon(DaemonError),
    Rpc(RpcErrorBody),
}

impl From<RpcFailure> for DaemonError {
    fn from(failure: RpcFailure) -> Self {
        match failure {
            RpcFailure::Daemon(err) => err,
            RpcFailure::Rpc(body) if body.code == RPC_IN_WARMUP => {
                DaemonError::Transient(format!("node warming up: {}", body.message))
            }
            RpcFailure::Rpc(body) => {
                DaemonError::Rejected(format!("rpc error {}: {}", body.code, body.message))
            }
        }
    }
}

pub struct RpcDaemon {
    url: String,
    auth: Option<String>,
    timeout_secs: u64,
    next_id: AtomicU64,
}

impl RpcDaemon {
    pub fn new(url: String, user: Option<String>, password: Option<String>, timeout_secs: u64) -> Self {
        let auth = user.map(|user| {
            let password = password.unwrap_or_default();
            let token = base64::engine::general_purpose::STANDARD.encode(format!("{user}:{password}"));
            format!("Basic {token}")
        });
        Self {
            url,
            auth,
            timeout_secs: timeout_secs.max(1),
            next_id: AtomicU64::new(1),
        }
    }

    async fn call(&self, method: &str, params: Value) -> Result<Value, RpcFailure> {
        let request = RpcRequest {
            jsonrpc: "1.0",
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            method,
            params,
        };
        let body = serde_json::to_string(&request).map_err(|err| {
            RpcFailure::Daemon(DaemonError::Rejected(format!("encode {method}: {err}")))
        })?;
        let url = self.url.clone();
        let auth = self.auth.clone();
        let timeout_secs = self.timeout_secs;
        let method_name = method.to_string();

        let response = tokio::task::spawn_blocking(move || {
            let mut request = minreq::post(url)
                .with_header("Content-Type", "application/json")
                .with_body(body)
                .with_timeout(timeout_secs);
            if let Some(auth) = auth {
                request = request.with_header("Authorization", auth);
            }
            request.send()
        })
        .await
        .map_err(|err| RpcFailure::Daemon(DaemonError::Transient(format!("rpc task failed: {err}"))))?
        .map_err(|err| {
            RpcFailure::Daemon(DaemonError::Transient(format!("{method_name}: {err}")))
        })?;

        if response.status_code == 401 || response.status_code == 403 {
            return Err(RpcFailure::Daemon(DaemonError::Rejected(format!(
                "{method}: HTTP {} (check rpcuser/rpcpassword)",
                response.status_code
            ))));
        }
        let text = response.as_str().map_err(|err| {
            RpcFailure::Daemon(DaemonError::Transient(format!("{method}: {err}")))
        })?;
        let parsed: RpcResponse = match serde_json::from_str(text) {
            Ok(parsed) => parsed,
            Err(err) if response.status_code >= 500 => {
                return Err(RpcFailure::Daemon(DaemonError::Transient(format!(
                    "{method}: HTTP {} ({err})",
                    response.status_code
                ))))
            }
            Err(err) => {
                return Err(RpcFailure::Daemon(DaemonError::Rejected(format!(
                    "{method}: malformed response (HTTP {}): {err}",
                    response.status_code
                ))))
            }
        };
        if let Some(error) = parsed.error {
            return Err(RpcFailure::Rpc(error));
        }
        log_debug!("rpc {method} ok");
        Ok(parsed.result)
    }
}

fn rejected(what: &str) -> DaemonError {
    DaemonError::Rejected(format!("unexpected {what} in upstream response"))
}

fn parse_hash(value: &Value, what: &str) -> Result<Hash256, DaemonError> {
    value
        .as_str()
        .and_then(|hex| hash256_from_hex(hex).ok())
        .ok_or_else(|| rejected(what))
}

fn parse_hex_bytes(value: &Value, what: &str) -> Result<Vec<u8>, DaemonError> {
    value
        .as_str()
        .and_then(|hex| hex_to_bytes(hex).ok())
        .ok_or_else(|| rejected(what))
}

impl Daemon for RpcDaemon {
    async fn current_tip(&self) -> Result<Tip, DaemonError> {
        let info = self.call("getblockchaininfo", json!([])).await?;
        let height = info
            .get("blocks")
            .and_then(Value::as_i64)
            .and_then(|height| i32::try_from(height).ok())
            .ok_or_else(|| rejected("blocks"))?;
        let hash = parse_hash(info.get("bestblockhash").unwrap_or(&Value::Null), "bestblockhash")?;
        Ok(Tip { height, hash })
    }

    async fn block_hash(&self, height: u32) -> Result<Option<Hash256>, DaemonError> {
        match self.call("getblockhash", json!([height])).await {
            Ok(value) => parse_hash(&value, "block hash").map(Some),
            Err(RpcFailure::Rpc(body)) if body.code == RPC_INVALID_PARAMETER => Ok(None),
            Err(failure) => Err(failure.into()),
        }
    }

    async fn get_header(&self, height: u32) -> Result<Option<BlockHeader>, DaemonError> {
        let Some(hash) = self.block_hash(height).await? else {
            return Ok(None);
        };
        let value = self
            .call("getblockheader", json!([hash256_to_hex(&hash), false]))
            .await?;
        let bytes = parse_hex_bytes(&value, "block header")?;
        BlockHeader::consensus_decode(&bytes)
            .map(Some)
            .map_err(|err| DaemonError::Rejected(format!("header {height}: {err}")))
    }

    async fn get_block(&self, hash: &Hash256) -> Result<Vec<u8>, DaemonError> {
        let value = self
            .call("getblock", json!([hash256_to_hex(hash), 0]))
            .await?;
        parse_hex_bytes(&value, "raw block")
    }

    async fn mempool_txids(&self) -> Result<Vec<Hash256>, DaemonError> {
        let value = self.call("getrawmempool", json!([])).await?;
        let entries = value.as_array().ok_or_else(|| rejected("mempool list"))?;
        entries
            .iter()
            .map(|entry| parse_hash(entry, "mempool txid"))
            .collect()
    }

    async fn raw_transaction(&self, txid: &Hash256) -> Result<Option<Vec<u8>>, DaemonError> {
        match self
            .call("getrawtransaction", json!([hash256_to_hex(txid), false]))
            .await
        {
            Ok(value) => parse_hex_bytes(&value, "raw transaction").map(Some),
            Err(RpcFailure::Rpc(body)) if body.code == RPC_INVALID_ADDRESS_OR_KEY => Ok(None),
            Err(failure) => Err(failure.into()),
        }
    }
}

#[derive(Clone, Copy, Debug)]
pub struct Backoff {
    pub initial: Duration,
    pub max: Duration,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(30),
        }
    }
}

impl Backoff {
    fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(2).min(self.max)
    }

    fn jittered(&self, delay: Duration) -> Duration {
        let millis = delay.as_millis() as u64;
        if millis == 0 {
            return delay;
        }
        let jitter = rand::thread_rng().gen_range(0..=millis / 4);
        Duration::from_millis(millis + jitter)
    }
}

/// Retries transient failures with capped exponential backoff. Returns `None`
/// once shutdown is requested; rejections are returned immediately.
pub async fn retry_with_backoff<T, F, Fut>(
    what: &str,
    backoff: Backoff,
    shutdown: &mut watch::Receiver<bool>,
    mut op: F,
) -> Option<Result<T, DaemonError>>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, DaemonError>>,
{
    let mut delay = backoff.initial;
    let mut attempt: u32 = 0;
    loop {
        if *shutdown.borrow() {
            return None;
        }
        match op().await {
            Ok(value) => return Some(Ok(value)),
            Err(err) if err.is_transient() => {
                attempt = attempt.saturating_add(1);
                let wait = backoff.jittered(delay);
                log_warn!("{what} failed (attempt {attempt}): {err}; retrying in {wait:.1?}");
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            return None;
                        }
                    }
                }
                delay = backoff.next_delay(delay);
            }
            Err(err) => return Some(Err(err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;

    fn fast() -> Backoff {
        Backoff {
            initial: Duration::from_millis(1),
            max: Duration::from_millis(4),
        }
    }

    #[tokio::test]
    async fn transient_errors_are_retried_until_success() {
        let (_tx, mut rx) = watch::channel(false);
        let attempts = AtomicUsize::new(0);
        let result = retry_with_backoff("fetch", fast(), &mut rx, || {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 3 {
                    Err(DaemonError::Transient("connection refused".to_string()))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert!(matches!(result, Some(Ok(3))));
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn rejections_are_not_retried() {
        let (_tx, mut rx) = watch::channel(false);
        let attempts = AtomicUsize::new(0);
        let result: Option<Result<(), DaemonError>> =
            retry_with_backoff("fetch", fast(), &mut rx, || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(DaemonError::Rejected("bad".to_string())) }
            })
            .await;
        assert!(matches!(result, Some(Err(DaemonError::Rejected(_)))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn shutdown_abandons_the_retry_loop() {
        let (tx, mut rx) = watch::channel(false);
        tx.send(true).expect("send shutdown");
        let result: Option<Result<(), DaemonError>> =
            retry_with_backoff("fetch", fast(), &mut rx, || async {
                Err(DaemonError::Transient("down".to_string()))
            })
            .await;
        assert!(result.is_none());
    }

    #[test]
    fn backoff_doubles_up_to_the_cap() {
        let backoff = fast();
        let second = backoff.next_delay(backoff.initial);
        assert_eq!(second, Duration::from_millis(2));
        assert_eq!(backoff.next_delay(Duration::from_millis(4)), Duration::from_millis(4));
    }

    #[test]
    fn warmup_errors_are_transient() {
        let err: DaemonError = RpcFailure::Rpc(RpcErrorBody {
            code: RPC_IN_WARMUP,
            message: "Loading block index...".to_string(),
        })
        .into();
        assert!(err.is_transient());
        let err: DaemonError = RpcFailure::Rpc(RpcErrorBody {
            code: -1,
            message: "boom".to_string(),
        })
        .into();
        assert!(!err.is_transient());
    }

    #[test]
    fn basic_auth_header_is_encoded() {
        let daemon = RpcDaemon::new(
            "http://127.0.0.1:8332".to_string(),
            Some("user".to_string()),
            Some("pass".to_string()),
            5,
        );
        assert_eq!(daemon.auth.as_deref(), Some("Basic dXNlcjpwYXNz"));
    }
}
