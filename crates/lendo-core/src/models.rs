//! Data models shared by the session, ledger and orchestration layers.

use chrono::{DateTime, Duration, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::amount::parse_amount;
use crate::error::{AmountError, LendoError};

pub use alloy_primitives::{Address, B256 as TxHash, U256};

// =============================================================================
// Session
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    /// Legal edges of the connection lifecycle.
    ///
    /// `Connecting -> Disconnected` is the failed-connect edge.
    pub fn can_transition_to(self, next: ConnectionState) -> bool {
        matches!(
            (self, next),
            (ConnectionState::Disconnected, ConnectionState::Connecting)
                | (ConnectionState::Connecting, ConnectionState::Connected)
                | (ConnectionState::Connecting, ConnectionState::Disconnected)
                | (ConnectionState::Connected, ConnectionState::Disconnected)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Disconnected => write!(f, "disconnected"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
        }
    }
}

/// The wallet session. Exactly one exists per client and only the wallet
/// gateway writes it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Active account, present only while connected
    pub identity: Option<Address>,

    /// Chain id the provider reported on connect
    pub network_id: Option<u64>,

    pub connection_state: ConnectionState,

    /// Bumped every time a connected session is torn down. In-flight work
    /// compares epochs to know whether its outcome still applies.
    pub epoch: u64,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            identity: None,
            network_id: None,
            connection_state: ConnectionState::Disconnected,
            epoch: 0,
        }
    }
}

impl Session {
    pub fn is_connected(&self) -> bool {
        self.connection_state == ConnectionState::Connected
    }

    /// Disconnected -> Connecting. Returns false if the edge is not legal.
    pub fn begin_connect(&mut self) -> bool {
        if !self.connection_state.can_transition_to(ConnectionState::Connecting) {
            return false;
        }
        self.connection_state = ConnectionState::Connecting;
        true
    }

    /// Connecting -> Connected with the identity and network the provider reported.
    pub fn establish(&mut self, identity: Address, network_id: u64) -> bool {
        if !self.connection_state.can_transition_to(ConnectionState::Connected) {
            return false;
        }
        self.identity = Some(identity);
        self.network_id = Some(network_id);
        self.connection_state = ConnectionState::Connected;
        true
    }

    /// Replace the active identity of a connected session.
    pub fn switch_identity(&mut self, identity: Address) -> bool {
        if !self.is_connected() || self.identity == Some(identity) {
            return false;
        }
        self.identity = Some(identity);
        true
    }

    /// Back to Disconnected. Returns false when already disconnected, which
    /// makes repeated resets a no-op.
    pub fn reset(&mut self) -> bool {
        match self.connection_state {
            ConnectionState::Disconnected => false,
            ConnectionState::Connecting => {
                self.connection_state = ConnectionState::Disconnected;
                true
            }
            ConnectionState::Connected => {
                self.identity = None;
                self.network_id = None;
                self.connection_state = ConnectionState::Disconnected;
                self.epoch += 1;
                true
            }
        }
    }
}

/// Events fanned out by the wallet gateway, in provider emission order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletEvent {
    /// The active account changed; `None` when the wallet exposes no account any more
    IdentityChanged(Option<Address>),
    NetworkChanged(u64),
    ProviderDisconnected,
}

/// Shorten an address for display, e.g. `0x5FbD...0aa3`.
pub fn format_address(address: &Address) -> String {
    let full = address.to_string();
    format!("{}...{}", &full[..6], &full[full.len() - 4..])
}

// =============================================================================
// Ledger State
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoanStatus {
    NoLoan,
    Active,
    Repaid,
}

impl fmt::Display for LoanStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoanStatus::NoLoan => write!(f, "No Loan"),
            LoanStatus::Active => write!(f, "Active"),
            LoanStatus::Repaid => write!(f, "Repaid"),
        }
    }
}

/// A borrower's loan as the ledger reports it. Never mutated locally.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoanRecord {
    pub collateral_amount: Decimal,
    pub loan_amount: Decimal,
    pub is_repaid: bool,
}

impl LoanRecord {
    /// The ledger answers unknown borrowers with a zeroed record.
    pub fn is_empty(&self) -> bool {
        self.collateral_amount.is_zero() && self.loan_amount.is_zero() && !self.is_repaid
    }

    pub fn status(&self) -> LoanStatus {
        if self.collateral_amount <= Decimal::ZERO {
            LoanStatus::NoLoan
        } else if self.is_repaid {
            LoanStatus::Repaid
        } else {
            LoanStatus::Active
        }
    }
}

/// Point-in-time composite read of the ledger. A new snapshot replaces the
/// previous one wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    /// Total balance held by the lending contract
    pub pool_balance: Decimal,

    /// Balance the connected identity has deposited as a lender
    pub lender_balance: Decimal,

    /// The connected identity's loan, `None` when it never borrowed
    pub loan: Option<LoanRecord>,

    /// Interest rate in basis points
    pub interest_rate_bps: u64,

    pub fetched_at: DateTime<Utc>,
}

impl LedgerSnapshot {
    /// Interest rate for display, e.g. 500 bps -> 5.
    pub fn interest_rate_percent(&self) -> Decimal {
        Decimal::from(self.interest_rate_bps) / Decimal::from(100)
    }

    pub fn loan_status(&self) -> LoanStatus {
        self.loan
            .as_ref()
            .map(LoanRecord::status)
            .unwrap_or(LoanStatus::NoLoan)
    }
}

// =============================================================================
// Operations
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationKind {
    Deposit,
    Borrow,
    Repay,
    WithdrawCollateral,
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationKind::Deposit => write!(f, "deposit"),
            OperationKind::Borrow => write!(f, "borrow"),
            OperationKind::Repay => write!(f, "repay"),
            OperationKind::WithdrawCollateral => write!(f, "withdraw_collateral"),
        }
    }
}

impl OperationKind {
    pub const ALL: [OperationKind; 4] = [
        OperationKind::Deposit,
        OperationKind::Borrow,
        OperationKind::Repay,
        OperationKind::WithdrawCollateral,
    ];

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "deposit" => Some(OperationKind::Deposit),
            "borrow" => Some(OperationKind::Borrow),
            "repay" => Some(OperationKind::Repay),
            "withdraw" | "withdraw_collateral" | "withdrawcollateral" => {
                Some(OperationKind::WithdrawCollateral)
            }
            _ => None,
        }
    }

    /// Whether the operation sends value along with the call.
    pub fn carries_amount(&self) -> bool {
        !matches!(self, OperationKind::WithdrawCollateral)
    }

    pub fn success_message(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "Deposit successful!",
            OperationKind::Borrow => "Borrow successful!",
            OperationKind::Repay => "Loan repaid successfully!",
            OperationKind::WithdrawCollateral => "Collateral withdrawn successfully!",
        }
    }

    pub fn failure_label(&self) -> &'static str {
        match self {
            OperationKind::Deposit => "Deposit failed",
            OperationKind::Borrow => "Borrow failed",
            OperationKind::Repay => "Repay failed",
            OperationKind::WithdrawCollateral => "Withdrawal failed",
        }
    }
}

/// One user submission. Discarded once its ticket is terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationRequest {
    pub kind: OperationKind,
    /// Value sent with the call; always `None` for collateral withdrawal
    pub amount: Option<Decimal>,
}

impl OperationRequest {
    pub fn deposit(amount: Decimal) -> Self {
        Self { kind: OperationKind::Deposit, amount: Some(amount) }
    }

    pub fn borrow(collateral: Decimal) -> Self {
        Self { kind: OperationKind::Borrow, amount: Some(collateral) }
    }

    pub fn repay(amount: Decimal) -> Self {
        Self { kind: OperationKind::Repay, amount: Some(amount) }
    }

    pub fn withdraw_collateral() -> Self {
        Self { kind: OperationKind::WithdrawCollateral, amount: None }
    }

    /// Build a request from raw input text. Input is ignored for collateral withdrawal.
    pub fn from_input(kind: OperationKind, input: &str) -> Result<Self, AmountError> {
        if !kind.carries_amount() {
            return Ok(Self::withdraw_collateral());
        }
        Ok(Self { kind, amount: Some(parse_amount(input)?) })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TicketState {
    Validating,
    Submitted,
    Pending,
    Confirmed,
    Failed,
}

impl TicketState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TicketState::Confirmed | TicketState::Failed)
    }

    fn can_advance_to(self, next: TicketState) -> bool {
        matches!(
            (self, next),
            (TicketState::Validating, TicketState::Submitted)
                | (TicketState::Submitted, TicketState::Pending)
                | (TicketState::Pending, TicketState::Confirmed)
                | (TicketState::Validating | TicketState::Submitted | TicketState::Pending, TicketState::Failed)
        )
    }
}

impl fmt::Display for TicketState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TicketState::Validating => write!(f, "validating"),
            TicketState::Submitted => write!(f, "submitted"),
            TicketState::Pending => write!(f, "pending"),
            TicketState::Confirmed => write!(f, "confirmed"),
            TicketState::Failed => write!(f, "failed"),
        }
    }
}

/// Tracking record for one write operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationTicket {
    pub id: Uuid,
    pub kind: OperationKind,
    pub state: TicketState,
    /// Session epoch the ticket was opened in
    pub epoch: u64,
    pub error: Option<LendoError>,
    /// Hash of the broadcast transaction, once there is one
    pub tx_hash: Option<TxHash>,
    pub submitted_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl OperationTicket {
    pub fn new(kind: OperationKind, epoch: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            state: TicketState::Validating,
            epoch,
            error: None,
            tx_hash: None,
            submitted_at: Utc::now(),
            resolved_at: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.state.is_terminal()
    }

    /// Whether the ticket still blocks new requests of its kind in session `epoch`.
    /// Tickets left over from an earlier session never do.
    pub fn blocks(&self, epoch: u64) -> bool {
        !self.is_terminal() && self.epoch >= epoch
    }

    /// Move along the ticket lifecycle. Illegal edges are ignored and reported as false.
    pub fn advance(&mut self, next: TicketState) -> bool {
        if !self.state.can_advance_to(next) {
            return false;
        }
        self.state = next;
        if next.is_terminal() {
            self.resolved_at = Some(Utc::now());
        }
        true
    }

    pub fn fail(&mut self, error: LendoError) -> bool {
        if !self.advance(TicketState::Failed) {
            return false;
        }
        self.error = Some(error);
        true
    }
}

// =============================================================================
// Notifications
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Info => write!(f, "info"),
            Severity::Success => write!(f, "success"),
            Severity::Error => write!(f, "error"),
        }
    }
}

/// A user-facing status message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    /// Sequence number assigned by the notification center
    pub id: u64,
    pub message: String,
    pub severity: Severity,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl Notification {
    pub fn new(id: u64, message: impl Into<String>, severity: Severity, ttl: Duration) -> Self {
        let created_at = Utc::now();
        Self {
            id,
            message: message.into(),
            severity,
            created_at,
            expires_at: created_at + ttl,
        }
    }
}
