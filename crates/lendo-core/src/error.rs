//! Error types for Lendo

use thiserror::Error;

use crate::models::OperationKind;

/// Failures reported by the wallet provider boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProviderFault {
    /// The user declined the prompt (EIP-1193 code 4001).
    #[error("request rejected by user")]
    Rejected,

    /// The ledger refused the call; `reason` is its revert string when it supplied one.
    #[error("execution reverted: {}", reason.as_deref().unwrap_or("no reason given"))]
    Reverted { reason: Option<String> },

    #[error("RPC error {code}: {message}")]
    Rpc { code: i64, message: String },

    #[error("transport error: {0}")]
    Transport(String),

    #[error("malformed response: {0}")]
    Decode(String),
}

/// Errors from decimal/wei conversion and amount input parsing.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AmountError {
    #[error("not a number: {0:?}")]
    Invalid(String),

    #[error("amount must be greater than zero: {0}")]
    NotPositive(String),

    #[error("amount cannot be negative: {0}")]
    Negative(String),

    #[error("amount has more than 18 decimal places: {0}")]
    TooPrecise(String),

    #[error("amount out of range: {0}")]
    Overflow(String),
}

/// Everything that can go wrong while orchestrating a session.
///
/// None of these are fatal: every failure either resolves a ticket to
/// `Failed` or leaves the session and snapshot untouched.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LendoError {
    #[error("No wallet provider detected. Please install or configure one.")]
    ProviderAbsent,

    #[error("Wallet connection request was rejected")]
    UserRejected,

    #[error("Wallet provider error: {0}")]
    Provider(#[source] ProviderFault),

    #[error("Failed to read {call} from the ledger: {source}")]
    RemoteRead {
        call: &'static str,
        #[source]
        source: ProviderFault,
    },

    #[error("{0}")]
    Validation(String),

    #[error("Transaction signing was rejected")]
    SigningRejected,

    #[error("Failed to submit transaction: {0}")]
    Submission(#[source] ProviderFault),

    #[error("{0}")]
    ExecutionReverted(String),

    #[error("A {0} operation is already in progress")]
    DuplicateOperation(OperationKind),

    #[error("Session changed before the operation resolved")]
    Stale,
}

impl LendoError {
    /// Stable machine-readable code, used as the `error_code` log field.
    pub fn code(&self) -> &'static str {
        match self {
            LendoError::ProviderAbsent => "PROVIDER_ABSENT",
            LendoError::UserRejected => "USER_REJECTED",
            LendoError::Provider(_) => "PROVIDER_ERROR",
            LendoError::RemoteRead { .. } => "REMOTE_READ_ERROR",
            LendoError::Validation(_) => "VALIDATION_ERROR",
            LendoError::SigningRejected => "SIGNING_REJECTED",
            LendoError::Submission(_) => "SUBMISSION_ERROR",
            LendoError::ExecutionReverted(_) => "EXECUTION_REVERTED",
            LendoError::DuplicateOperation(_) => "DUPLICATE_OPERATION",
            LendoError::Stale => "STALE",
        }
    }

    /// Error returned when a read fails, keeping the provider fault as the source.
    pub fn remote_read(call: &'static str, source: ProviderFault) -> Self {
        LendoError::RemoteRead { call, source }
    }
}

impl From<AmountError> for LendoError {
    fn from(err: AmountError) -> Self {
        LendoError::Validation(err.to_string())
    }
}

pub type LendoResult<T> = Result<T, LendoError>;
