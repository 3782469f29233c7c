//! Wallet provider backed by a JSON-RPC 2.0 endpoint over HTTP.
//!
//! Works against anything that speaks the EIP-1193 method set over HTTP: a
//! wallet daemon, or a development node with unlocked accounts. Account and
//! network change events are synthesized by polling, since plain HTTP has no
//! push channel.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use alloy_primitives::{Bytes, U256, U64};
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use lendo_core::{Address, ProviderFault, TxHash};

use super::{ProviderEvent, TransactionRequest, TxOutcome, WalletProvider};
use crate::abi::decode_revert_reason;
use crate::config::WalletConfig;

/// EIP-1193 "User Rejected Request".
const USER_REJECTED_CODE: i64 = 4001;

/// Geth/Anvil code for a call that reverted with data.
const EXECUTION_REVERTED_CODE: i64 = 3;

#[derive(Clone)]
pub struct JsonRpcProvider {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    url: String,
    next_id: AtomicU64,
    poll_interval: Duration,
    confirmation_poll: Duration,
    disconnect_after_failures: u32,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<ProviderEvent>>>,
    /// Cancellation handle of the running event watcher, if any
    watcher: Mutex<Option<CancellationToken>>,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Option<RpcErrorObject>,
}

#[derive(Debug, Deserialize)]
struct RpcErrorObject {
    code: i64,
    message: String,
    #[serde(default)]
    data: Option<Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawReceipt {
    #[serde(default)]
    status: Option<U64>,
    #[serde(default)]
    block_number: Option<U64>,
}

#[derive(Debug, Deserialize)]
struct RawTransaction {
    from: Address,
    #[serde(default)]
    to: Option<Address>,
    value: U256,
    input: Bytes,
}

impl JsonRpcProvider {
    pub fn new(url: &str, config: &WalletConfig) -> Result<Self, ProviderFault> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| ProviderFault::Transport(format!("failed to create HTTP client: {e}")))?;

        tracing::debug!(url = %url, "Creating JSON-RPC wallet provider");

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                url: url.to_string(),
                next_id: AtomicU64::new(1),
                poll_interval: Duration::from_millis(config.poll_interval_ms),
                confirmation_poll: Duration::from_millis(config.confirmation_poll_ms),
                disconnect_after_failures: config.disconnect_after_failures.max(1),
                subscribers: Mutex::new(Vec::new()),
                watcher: Mutex::new(None),
            }),
        })
    }

    pub fn url(&self) -> &str {
        &self.inner.url
    }

    /// Replay a reverted transaction at its block to recover the revert reason.
    async fn replay_revert_reason(&self, hash: TxHash, block_number: u64) -> Option<String> {
        let tx: Option<RawTransaction> = match self
            .inner
            .request("eth_getTransactionByHash", json!([hash]))
            .await
        {
            Ok(tx) => tx,
            Err(e) => {
                tracing::debug!(tx_hash = %hash, error = %e, "Could not load reverted transaction");
                return None;
            }
        };
        let tx = tx?;

        let call = json!({
            "from": tx.from,
            "to": tx.to,
            "value": tx.value,
            "data": tx.input,
        });
        let block = format!("{block_number:#x}");
        match self
            .inner
            .request::<Bytes>("eth_call", json!([call, block]))
            .await
        {
            Err(ProviderFault::Reverted { reason }) => reason,
            Ok(_) => {
                tracing::debug!(tx_hash = %hash, "Replay of reverted transaction succeeded");
                None
            }
            Err(e) => {
                tracing::debug!(tx_hash = %hash, error = %e, "Replay of reverted transaction failed");
                None
            }
        }
    }

    fn ensure_watcher(&self) {
        let mut watcher = self.inner.watcher.lock().unwrap_or_else(|e| e.into_inner());
        if watcher.as_ref().is_some_and(|token| !token.is_cancelled()) {
            return;
        }

        let token = CancellationToken::new();
        *watcher = Some(token.clone());
        drop(watcher);

        let inner = Arc::downgrade(&self.inner);
        let url = self.inner.url.clone();
        let interval = self.inner.poll_interval;
        tokio::spawn(async move {
            tracing::info!(url = %url, "Provider event watcher started");
            watch_events(inner, interval, token).await;
            tracing::info!(url = %url, "Provider event watcher stopped");
        });
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(token) = self.watcher.get_mut().ok().and_then(Option::take) {
            token.cancel();
        }
    }
}

impl Inner {
    async fn request<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T, ProviderFault> {
        let start = Instant::now();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let body = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        tracing::trace!(method = %method, id = id, "Sending JSON-RPC request");

        let response = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                tracing::warn!(method = %method, error = %e, "JSON-RPC request failed");
                ProviderFault::Transport(e.to_string())
            })?;

        if !response.status().is_success() {
            return Err(ProviderFault::Transport(format!(
                "{method} returned HTTP {}",
                response.status()
            )));
        }

        let response: RpcResponse = response
            .json()
            .await
            .map_err(|e| ProviderFault::Decode(format!("{method}: {e}")))?;

        tracing::trace!(
            method = %method,
            id = id,
            duration_ms = %start.elapsed().as_millis(),
            "JSON-RPC response received"
        );

        if let Some(error) = response.error {
            return Err(classify_error(error));
        }

        serde_json::from_value(response.result)
            .map_err(|e| ProviderFault::Decode(format!("{method}: {e}")))
    }

    async fn chain_id(&self) -> Result<u64, ProviderFault> {
        let id: U64 = self.request("eth_chainId", json!([])).await?;
        Ok(id.to::<u64>())
    }

    /// Send an event to every live subscriber, dropping the ones that went away.
    /// Returns false once nobody is listening.
    fn emit(&self, event: ProviderEvent) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| tx.send(event.clone()).is_ok());
        !subscribers.is_empty()
    }

    fn has_subscribers(&self) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(|e| e.into_inner());
        subscribers.retain(|tx| !tx.is_closed());
        !subscribers.is_empty()
    }
}

/// Poll accounts and chain id, turning differences into provider events.
///
/// Runs until cancelled, until nobody listens, or until the provider is dropped.
async fn watch_events(inner: Weak<Inner>, interval: Duration, cancel: CancellationToken) {
    let mut last_accounts: Option<Vec<Address>> = None;
    let mut last_chain: Option<u64> = None;
    let mut failures: u32 = 0;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(inner) = inner.upgrade() else { break };
        if !inner.has_subscribers() {
            tracing::debug!("No provider subscribers left, stopping watcher");
            break;
        }

        let accounts = inner.request::<Vec<Address>>("eth_accounts", json!([])).await;
        let chain = match &accounts {
            Ok(_) => inner.chain_id().await,
            Err(e) => Err(e.clone()),
        };

        match (accounts, chain) {
            (Ok(accounts), Ok(chain)) => {
                failures = 0;
                let mut listening = true;
                if let Some(previous) = &last_accounts {
                    if previous != &accounts {
                        tracing::info!(accounts = ?accounts, "Wallet accounts changed");
                        listening = inner.emit(ProviderEvent::AccountsChanged(accounts.clone()));
                    }
                }
                if let Some(previous) = last_chain {
                    if previous != chain && listening {
                        tracing::info!(from = previous, to = chain, "Wallet network changed");
                        listening = inner.emit(ProviderEvent::ChainChanged(chain));
                    }
                }
                if !listening {
                    break;
                }
                last_accounts = Some(accounts);
                last_chain = Some(chain);
            }
            (Err(e), _) | (_, Err(e)) => {
                failures += 1;
                tracing::warn!(error = %e, failures = failures, "Provider poll failed");
                if failures == inner.disconnect_after_failures {
                    tracing::warn!(url = %inner.url, "Provider unreachable, reporting disconnect");
                    last_accounts = None;
                    last_chain = None;
                    if !inner.emit(ProviderEvent::Disconnect) {
                        break;
                    }
                }
            }
        }
    }

    cancel.cancel();
}

fn classify_error(error: RpcErrorObject) -> ProviderFault {
    if error.code == USER_REJECTED_CODE {
        return ProviderFault::Rejected;
    }
    if let Some(fault) = as_revert(&error) {
        return fault;
    }

    // Wallets relay node errors wrapped as `{code: -32603, data: {code, message, data}}`
    let nested = error
        .data
        .clone()
        .and_then(|data| serde_json::from_value::<RpcErrorObject>(data).ok());
    if let Some(fault) = nested.as_ref().and_then(as_revert) {
        return fault;
    }

    ProviderFault::Rpc {
        code: error.code,
        message: error.message,
    }
}

fn as_revert(error: &RpcErrorObject) -> Option<ProviderFault> {
    let lowered = error.message.to_lowercase();
    if error.code != EXECUTION_REVERTED_CODE && !lowered.contains("execution reverted") {
        return None;
    }

    let reason = error
        .data
        .as_ref()
        .and_then(revert_data)
        .and_then(|data| decode_revert_reason(&data))
        .or_else(|| {
            error
                .message
                .split_once("execution reverted: ")
                .map(|(_, reason)| reason.trim().to_string())
                .filter(|reason| !reason.is_empty())
        });
    Some(ProviderFault::Reverted { reason })
}

/// Revert data shows up either as a hex string or nested under `data`.
fn revert_data(value: &Value) -> Option<Bytes> {
    match value {
        Value::String(hex) => hex.parse().ok(),
        Value::Object(map) => map.get("data").and_then(revert_data),
        _ => None,
    }
}

#[async_trait]
impl WalletProvider for JsonRpcProvider {
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderFault> {
        self.inner.request("eth_requestAccounts", json!([])).await
    }

    async fn chain_id(&self) -> Result<u64, ProviderFault> {
        self.inner.chain_id().await
    }

    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ProviderFault> {
        self.inner
            .request("eth_call", json!([{ "to": to, "data": data }, "latest"]))
            .await
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ProviderFault> {
        let params = json!([{
            "from": tx.from,
            "to": tx.to,
            "value": tx.value,
            "data": tx.data,
        }]);
        let hash: TxHash = self.inner.request("eth_sendTransaction", params).await?;
        tracing::info!(tx_hash = %hash, from = %tx.from, "Transaction broadcast");
        Ok(hash)
    }

    async fn wait_for_confirmation(&self, hash: TxHash) -> Result<TxOutcome, ProviderFault> {
        let mut transport_failures: u32 = 0;

        loop {
            match self
                .inner
                .request::<Option<RawReceipt>>("eth_getTransactionReceipt", json!([hash]))
                .await
            {
                Ok(Some(receipt)) => {
                    let block_number = receipt.block_number.map(|n| n.to::<u64>()).unwrap_or_default();
                    if receipt.status == Some(U64::from(1u8)) {
                        tracing::info!(tx_hash = %hash, block = block_number, "Transaction confirmed");
                        return Ok(TxOutcome::Confirmed { block_number });
                    }
                    let reason = self.replay_revert_reason(hash, block_number).await;
                    tracing::warn!(tx_hash = %hash, reason = ?reason, "Transaction reverted");
                    return Ok(TxOutcome::Reverted { reason });
                }
                Ok(None) => {
                    transport_failures = 0;
                    tracing::trace!(tx_hash = %hash, "Receipt not available yet");
                }
                Err(ProviderFault::Transport(e)) => {
                    transport_failures += 1;
                    tracing::warn!(tx_hash = %hash, error = %e, "Receipt poll failed");
                    if transport_failures >= self.inner.disconnect_after_failures {
                        return Err(ProviderFault::Transport(e));
                    }
                }
                Err(e) => return Err(e),
            }

            tokio::time::sleep(self.inner.confirmation_poll).await;
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(tx);
        self.ensure_watcher();
        rx
    }
}
