//! # Lendo Core
//!
//! Data models and error types for Lendo, a client for a collateralized
//! lending ledger reached through a wallet provider.
//!
//! This crate carries no I/O: it defines the session and ticket state machines,
//! the ledger snapshot shapes and the exact decimal/wei conversion used on the wire.

pub mod amount;
pub mod error;
pub mod models;

pub use amount::*;
pub use error::*;
pub use models::*;
