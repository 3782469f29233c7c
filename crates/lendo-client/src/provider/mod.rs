//! The wallet provider boundary.
//!
//! A provider holds the user's keys, answers read-only calls against the chain
//! and signs and broadcasts transactions on request. It also pushes
//! account/network/disconnect events the way an EIP-1193 wallet does.

pub mod json_rpc;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

use alloy_primitives::{Bytes, U256};
use async_trait::async_trait;
use tokio::sync::mpsc;

use lendo_core::{Address, ProviderFault, TxHash};

pub use self::json_rpc::JsonRpcProvider;

/// Raw events as the wallet emits them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProviderEvent {
    AccountsChanged(Vec<Address>),
    ChainChanged(u64),
    Disconnect,
}

/// A transaction to sign and broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionRequest {
    pub from: Address,
    pub to: Address,
    pub value: U256,
    pub data: Bytes,
}

/// Terminal on-chain state of a broadcast transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TxOutcome {
    Confirmed { block_number: u64 },
    Reverted { reason: Option<String> },
}

#[async_trait]
pub trait WalletProvider: Send + Sync {
    /// Ask the user for account access. May prompt.
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderFault>;

    async fn chain_id(&self) -> Result<u64, ProviderFault>;

    /// Read-only contract call against the latest block.
    async fn call(&self, to: Address, data: Bytes) -> Result<Bytes, ProviderFault>;

    /// Have the wallet sign and broadcast. Resolves once the transaction is accepted.
    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ProviderFault>;

    /// Wait until the transaction reaches a terminal state. No timeout.
    async fn wait_for_confirmation(&self, hash: TxHash) -> Result<TxOutcome, ProviderFault>;

    /// Register for provider events. Each call returns an independent feed.
    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderEvent>;
}
