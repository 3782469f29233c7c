//! # Lendo Client
//!
//! Session and transaction orchestration for a lending ledger reached through
//! a wallet provider.
//!
//! - [`WalletGateway`] owns the wallet session and fans out provider events
//! - [`LedgerReader`] and [`LedgerWriter`] talk to the ledger contract
//! - [`TransactionOrchestrator`] drives operations through their ticket lifecycle
//! - [`DataSyncScheduler`] keeps the ledger snapshot current
//! - [`NotificationCenter`] holds the visible status message
//!
//! [`LendingClient`] wires all of them together.

pub mod abi;
pub mod client;
pub mod config;
pub mod gateway;
pub mod notify;
pub mod orchestrator;
pub mod provider;
pub mod reader;
pub mod sync;
pub mod writer;

pub use crate::client::LendingClient;
pub use crate::config::AppConfig;
pub use crate::gateway::{Connection, WalletGateway};
pub use crate::notify::NotificationCenter;
pub use crate::orchestrator::{failure_message, TransactionOrchestrator};
pub use crate::provider::{JsonRpcProvider, WalletProvider};
pub use crate::reader::LedgerReader;
pub use crate::sync::DataSyncScheduler;
pub use crate::writer::{LedgerWriter, PendingHandle};
