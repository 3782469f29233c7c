//! In-memory wallet provider simulating the lending ledger.
//!
//! Transactions execute when their confirmation is awaited, so tests can hold
//! confirmations and observe the window between broadcast and inclusion.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use alloy_primitives::{keccak256, Bytes, U256};
use alloy_sol_types::{SolCall, SolInterface};
use async_trait::async_trait;
use tokio::sync::{mpsc, watch};

use lendo_core::{Address, OperationKind, ProviderFault, TxHash};

use super::{ProviderEvent, TransactionRequest, TxOutcome, WalletProvider};
use crate::abi::{decode_write_call, LendingPool, LendingPoolCalls};

pub const DEFAULT_CHAIN_ID: u64 = 31337;
pub const DEFAULT_INTEREST_RATE_BPS: u64 = 500;

/// Share of collateral paid out as loan, in basis points.
const LOAN_TO_COLLATERAL_BPS: u64 = 5000;
const BPS: u64 = 10_000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MockLoan {
    pub collateral: U256,
    pub loan: U256,
    pub is_repaid: bool,
}

/// The contract side of the simulation.
#[derive(Debug, Clone, Default)]
pub struct MockLedger {
    pub pool_balance: U256,
    pub lenders: HashMap<Address, U256>,
    pub loans: HashMap<Address, MockLoan>,
    pub interest_rate_bps: u64,
}

impl MockLedger {
    pub fn amount_due(loan: &MockLoan, rate_bps: u64) -> U256 {
        loan.loan + loan.loan * U256::from(rate_bps) / U256::from(BPS)
    }

    fn execute(&mut self, kind: OperationKind, from: Address, value: U256) -> Result<(), String> {
        match kind {
            OperationKind::Deposit => {
                if value.is_zero() {
                    return Err("Deposit must be greater than 0".into());
                }
                self.pool_balance += value;
                *self.lenders.entry(from).or_default() += value;
            }
            OperationKind::Borrow => {
                if value.is_zero() {
                    return Err("Collateral must be greater than 0".into());
                }
                if let Some(existing) = self.loans.get(&from) {
                    if !existing.is_repaid {
                        return Err("Existing loan must be repaid first".into());
                    }
                }
                let loan = value * U256::from(LOAN_TO_COLLATERAL_BPS) / U256::from(BPS);
                if self.pool_balance + value < loan {
                    return Err("Insufficient liquidity in pool".into());
                }
                self.pool_balance = self.pool_balance + value - loan;
                self.loans.insert(
                    from,
                    MockLoan {
                        collateral: value,
                        loan,
                        is_repaid: false,
                    },
                );
            }
            OperationKind::Repay => {
                let rate = self.interest_rate_bps;
                let loan = self
                    .loans
                    .get_mut(&from)
                    .filter(|loan| !loan.is_repaid)
                    .ok_or_else(|| "No active loan".to_string())?;
                if value < Self::amount_due(loan, rate) {
                    return Err("Insufficient repayment amount".into());
                }
                loan.is_repaid = true;
                self.pool_balance += value;
            }
            OperationKind::WithdrawCollateral => {
                let loan = self
                    .loans
                    .get(&from)
                    .copied()
                    .ok_or_else(|| "No loan found".to_string())?;
                if !loan.is_repaid {
                    return Err("Loan not repaid".into());
                }
                if self.pool_balance < loan.collateral {
                    return Err("Insufficient liquidity in pool".into());
                }
                self.pool_balance -= loan.collateral;
                self.loans.remove(&from);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentTransaction {
    pub hash: TxHash,
    pub kind: OperationKind,
    pub from: Address,
    pub value: U256,
}

/// Parks callers while closed.
#[derive(Clone)]
struct Gate(Arc<watch::Sender<bool>>);

impl Gate {
    fn open() -> Self {
        Self(Arc::new(watch::channel(false).0))
    }

    fn set_closed(&self, closed: bool) {
        self.0.send_replace(closed);
    }

    async fn pass(&self) {
        let mut closed = self.0.subscribe();
        // The sender lives in self, so the channel cannot close while waiting
        let _ = closed.wait_for(|closed| !*closed).await;
    }
}

struct MockState {
    accounts: Vec<Address>,
    chain_id: u64,
    reject_connect: bool,
    reject_signing: bool,
    fail_reads: bool,
    fail_broadcast: bool,
    /// Simulate the call at broadcast and refuse it when it would revert
    preflight: bool,
    ledger: MockLedger,
    pending: HashMap<TxHash, SentTransaction>,
    sent: Vec<SentTransaction>,
    nonce: u64,
    block_number: u64,
    snapshot_reads: usize,
    connect_requests: usize,
    subscribers: Vec<mpsc::UnboundedSender<ProviderEvent>>,
}

#[derive(Clone)]
pub struct MockProvider {
    state: Arc<Mutex<MockState>>,
    connects: Gate,
    reads: Gate,
    confirmations: Gate,
}

impl MockProvider {
    pub fn new(accounts: Vec<Address>) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                accounts,
                chain_id: DEFAULT_CHAIN_ID,
                reject_connect: false,
                reject_signing: false,
                fail_reads: false,
                fail_broadcast: false,
                preflight: false,
                ledger: MockLedger {
                    interest_rate_bps: DEFAULT_INTEREST_RATE_BPS,
                    ..MockLedger::default()
                },
                pending: HashMap::new(),
                sent: Vec::new(),
                nonce: 0,
                block_number: 0,
                snapshot_reads: 0,
                connect_requests: 0,
                subscribers: Vec::new(),
            })),
            connects: Gate::open(),
            reads: Gate::open(),
            confirmations: Gate::open(),
        }
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_chain_id(&self, chain_id: u64) {
        self.state().chain_id = chain_id;
    }

    pub fn set_reject_connect(&self, reject: bool) {
        self.state().reject_connect = reject;
    }

    pub fn set_reject_signing(&self, reject: bool) {
        self.state().reject_signing = reject;
    }

    pub fn set_fail_reads(&self, fail: bool) {
        self.state().fail_reads = fail;
    }

    /// Make every broadcast fail with a transport error.
    pub fn set_fail_broadcast(&self, fail: bool) {
        self.state().fail_broadcast = fail;
    }

    pub fn set_preflight(&self, preflight: bool) {
        self.state().preflight = preflight;
    }

    pub fn set_pool_balance(&self, balance: U256) {
        self.state().ledger.pool_balance = balance;
    }

    pub fn set_interest_rate(&self, bps: u64) {
        self.state().ledger.interest_rate_bps = bps;
    }

    pub fn set_loan(&self, borrower: Address, loan: MockLoan) {
        self.state().ledger.loans.insert(borrower, loan);
    }

    pub fn ledger(&self) -> MockLedger {
        self.state().ledger.clone()
    }

    /// Keep every confirmation waiting until `release_confirmations`.
    pub fn hold_confirmations(&self) {
        self.confirmations.set_closed(true);
    }

    pub fn release_confirmations(&self) {
        self.confirmations.set_closed(false);
    }

    /// Keep account requests open, as if the wallet prompt were still showing.
    pub fn hold_connect(&self) {
        self.connects.set_closed(true);
    }

    pub fn release_connect(&self) {
        self.connects.set_closed(false);
    }

    /// Keep every read-only call waiting until `release_reads`.
    pub fn hold_reads(&self) {
        self.reads.set_closed(true);
    }

    pub fn release_reads(&self) {
        self.reads.set_closed(false);
    }

    /// Transactions broadcast but not yet executed.
    pub fn pending_count(&self) -> usize {
        self.state().pending.len()
    }

    pub fn sent_transactions(&self) -> Vec<SentTransaction> {
        self.state().sent.clone()
    }

    /// Number of `getContractBalance` reads, one per snapshot fetch.
    pub fn snapshot_reads(&self) -> usize {
        self.state().snapshot_reads
    }

    pub fn connect_requests(&self) -> usize {
        self.state().connect_requests
    }

    pub fn subscriber_count(&self) -> usize {
        let mut state = self.state();
        state.subscribers.retain(|tx| !tx.is_closed());
        state.subscribers.len()
    }

    /// Emit a provider event, updating the simulated wallet the same way.
    pub fn emit(&self, event: ProviderEvent) {
        let mut state = self.state();
        match &event {
            ProviderEvent::AccountsChanged(accounts) => state.accounts = accounts.clone(),
            ProviderEvent::ChainChanged(chain_id) => state.chain_id = *chain_id,
            ProviderEvent::Disconnect => {}
        }
        state.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    fn next_hash(state: &mut MockState) -> TxHash {
        state.nonce += 1;
        keccak256(state.nonce.to_be_bytes())
    }

    fn answer(state: &mut MockState, call: LendingPoolCalls) -> Result<Bytes, ProviderFault> {
        let ledger = &state.ledger;
        let data = match call {
            LendingPoolCalls::getContractBalance(_) => {
                state.snapshot_reads += 1;
                LendingPool::getContractBalanceCall::abi_encode_returns(&(ledger.pool_balance,))
            }
            LendingPoolCalls::lenderBalances(call) => {
                let balance = ledger.lenders.get(&call.lender).copied().unwrap_or_default();
                LendingPool::lenderBalancesCall::abi_encode_returns(&(balance,))
            }
            LendingPoolCalls::borrowerLoans(call) => {
                let loan = ledger.loans.get(&call.borrower).copied().unwrap_or_default();
                LendingPool::borrowerLoansCall::abi_encode_returns(&(
                    loan.collateral,
                    loan.loan,
                    loan.is_repaid,
                ))
            }
            LendingPoolCalls::interestRate(_) => {
                let rate = U256::from(ledger.interest_rate_bps);
                LendingPool::interestRateCall::abi_encode_returns(&(rate,))
            }
            _ => {
                return Err(ProviderFault::Rpc {
                    code: -32000,
                    message: "write call sent as eth_call".into(),
                })
            }
        };
        Ok(Bytes::from(data))
    }
}

#[async_trait]
impl WalletProvider for MockProvider {
    async fn request_accounts(&self) -> Result<Vec<Address>, ProviderFault> {
        self.state().connect_requests += 1;
        self.connects.pass().await;

        let state = self.state();
        if state.reject_connect {
            return Err(ProviderFault::Rejected);
        }
        Ok(state.accounts.clone())
    }

    async fn chain_id(&self) -> Result<u64, ProviderFault> {
        Ok(self.state().chain_id)
    }

    async fn call(&self, _to: Address, data: Bytes) -> Result<Bytes, ProviderFault> {
        tokio::task::yield_now().await;
        self.reads.pass().await;

        let mut state = self.state();
        if state.fail_reads {
            return Err(ProviderFault::Transport("connection refused".into()));
        }
        let call = LendingPoolCalls::abi_decode(&data, true)
            .map_err(|_| ProviderFault::Reverted { reason: None })?;
        Self::answer(&mut state, call)
    }

    async fn send_transaction(&self, tx: TransactionRequest) -> Result<TxHash, ProviderFault> {
        tokio::task::yield_now().await;
        let mut state = self.state();
        if state.reject_signing {
            return Err(ProviderFault::Rejected);
        }
        if state.fail_broadcast {
            return Err(ProviderFault::Transport("connection reset".into()));
        }
        let kind = decode_write_call(&tx.data).ok_or_else(|| ProviderFault::Rpc {
            code: -32602,
            message: "unknown function selector".into(),
        })?;

        if state.preflight {
            let mut dry_run = state.ledger.clone();
            dry_run
                .execute(kind, tx.from, tx.value)
                .map_err(|reason| ProviderFault::Reverted { reason: Some(reason) })?;
        }

        let hash = Self::next_hash(&mut state);
        let sent = SentTransaction {
            hash,
            kind,
            from: tx.from,
            value: tx.value,
        };
        state.pending.insert(hash, sent.clone());
        state.sent.push(sent);
        Ok(hash)
    }

    async fn wait_for_confirmation(&self, hash: TxHash) -> Result<TxOutcome, ProviderFault> {
        self.confirmations.pass().await;

        let mut state = self.state();
        let tx = state.pending.remove(&hash).ok_or_else(|| ProviderFault::Rpc {
            code: -32000,
            message: format!("unknown transaction {hash}"),
        })?;

        state.block_number += 1;
        match state.ledger.execute(tx.kind, tx.from, tx.value) {
            Ok(()) => Ok(TxOutcome::Confirmed {
                block_number: state.block_number,
            }),
            Err(reason) => Ok(TxOutcome::Reverted {
                reason: Some(reason),
            }),
        }
    }

    fn subscribe(&self) -> mpsc::UnboundedReceiver<ProviderEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.state().subscribers.push(tx);
        rx
    }
}
