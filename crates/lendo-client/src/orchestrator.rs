//! Drives write operations from user request to resynchronized state.
//!
//! Each request gets an [`OperationTicket`] that moves through
//! `Validating -> Submitted -> Pending -> Confirmed | Failed`. Only one
//! non-terminal ticket may exist per operation kind and session epoch.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use lendo_core::{
    parse_amount, LendoError, LendoResult, OperationKind, OperationRequest, OperationTicket,
    TicketState,
};

use crate::gateway::WalletGateway;
use crate::notify::NotificationCenter;
use crate::sync::DataSyncScheduler;
use crate::writer::{LedgerWriter, NOT_CONNECTED};

pub const SUBMITTED_MESSAGE: &str = "Transaction submitted, waiting for confirmation...";

pub type TicketTable = BTreeMap<OperationKind, OperationTicket>;

/// User-facing text for a failed operation.
///
/// Ledger revert reasons and validation messages are shown as they are,
/// anything else is prefixed with the operation.
pub fn failure_message(kind: OperationKind, err: &LendoError) -> String {
    match err {
        LendoError::ExecutionReverted(reason) => reason.clone(),
        LendoError::Validation(message) => message.clone(),
        other => format!("{}: {other}", kind.failure_label()),
    }
}

#[derive(Clone)]
pub struct TransactionOrchestrator {
    inner: Arc<OrchestratorInner>,
}

struct OrchestratorInner {
    gateway: WalletGateway,
    writer: LedgerWriter,
    scheduler: DataSyncScheduler,
    notifications: NotificationCenter,
    tickets: watch::Sender<TicketTable>,
    drafts: Mutex<HashMap<OperationKind, Draft>>,
}

/// Typed input for an operation, kept per session epoch like tickets.
struct Draft {
    epoch: u64,
    input: String,
}

/// Fails the ticket if the driving future goes away before it resolved.
struct TicketGuard {
    inner: Arc<OrchestratorInner>,
    kind: OperationKind,
    id: Uuid,
}

impl Drop for TicketGuard {
    fn drop(&mut self) {
        let (kind, id) = (self.kind, self.id);
        let failed = self.inner.tickets.send_if_modified(|tickets| match tickets.get_mut(&kind) {
            Some(ticket) if ticket.id == id => ticket.fail(LendoError::Stale),
            _ => false,
        });
        if failed {
            tracing::warn!(operation = %kind, ticket_id = %id, "Operation abandoned before it resolved");
        }
    }
}

/// How a driven operation ended.
enum Resolution {
    Confirmed { block_number: u64, confirmed_at: Instant },
    Failed(LendoError),
}

impl TransactionOrchestrator {
    pub fn new(
        gateway: WalletGateway,
        writer: LedgerWriter,
        scheduler: DataSyncScheduler,
        notifications: NotificationCenter,
    ) -> Self {
        let (tickets, _) = watch::channel(TicketTable::new());
        Self {
            inner: Arc::new(OrchestratorInner {
                gateway,
                writer,
                scheduler,
                notifications,
                tickets,
                drafts: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn ticket(&self, kind: OperationKind) -> Option<OperationTicket> {
        self.inner.tickets.borrow().get(&kind).cloned()
    }

    pub fn tickets(&self) -> TicketTable {
        self.inner.tickets.borrow().clone()
    }

    pub fn watch_tickets(&self) -> watch::Receiver<TicketTable> {
        self.inner.tickets.subscribe()
    }

    /// Whether an operation of this kind is still in flight.
    pub fn is_busy(&self, kind: OperationKind) -> bool {
        self.ticket(kind).is_some_and(|ticket| !ticket.is_terminal())
    }

    fn drafts(&self) -> MutexGuard<'_, HashMap<OperationKind, Draft>> {
        self.inner.drafts.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_draft(&self, kind: OperationKind, input: impl Into<String>) {
        let draft = Draft {
            epoch: self.inner.gateway.session().epoch,
            input: input.into(),
        };
        self.drafts().insert(kind, draft);
    }

    pub fn draft(&self, kind: OperationKind) -> String {
        self.drafts()
            .get(&kind)
            .map(|draft| draft.input.clone())
            .unwrap_or_default()
    }

    /// Submit the operation described by the current input draft.
    pub async fn submit_draft(&self, kind: OperationKind) -> LendoResult<OperationTicket> {
        let amount = if kind.carries_amount() {
            parse_amount(&self.draft(kind)).ok()
        } else {
            None
        };
        self.execute(OperationRequest { kind, amount }).await
    }

    /// Run the operation on a background task.
    pub fn spawn(&self, request: OperationRequest) -> JoinHandle<LendoResult<OperationTicket>> {
        let this = self.clone();
        tokio::spawn(async move { this.execute(request).await })
    }

    /// Drop tickets and drafts left over from earlier sessions. Outcomes of
    /// their operations still in flight will be discarded.
    ///
    /// Anything opened in the current session is kept, so a late reset cannot
    /// release the guard of an operation that is still running.
    pub fn reset(&self) {
        let epoch = self.inner.gateway.session().epoch;
        let dropped = self.inner.tickets.send_if_modified(|tickets| {
            let before = tickets.len();
            tickets.retain(|_, ticket| ticket.epoch >= epoch);
            tickets.len() != before
        });
        if dropped {
            tracing::debug!(epoch = epoch, "Dropped tickets of earlier sessions");
        }
        self.drafts().retain(|_, draft| draft.epoch >= epoch);
    }

    /// Validate, submit, confirm and resync one operation.
    ///
    /// Returns the resolved ticket. A failed operation returns its error; the
    /// ticket in the table carries the same error.
    pub async fn execute(&self, request: OperationRequest) -> LendoResult<OperationTicket> {
        let kind = request.kind;
        let epoch = self.inner.gateway.session().epoch;

        let ticket = OperationTicket::new(kind, epoch);
        let id = ticket.id;
        let admitted = self.inner.tickets.send_if_modified(|tickets| match tickets.get(&kind) {
            Some(existing) if existing.blocks(epoch) => false,
            _ => {
                tickets.insert(kind, ticket);
                true
            }
        });
        if !admitted {
            tracing::debug!(operation = %kind, "Rejected duplicate operation");
            return Err(LendoError::DuplicateOperation(kind));
        }

        let _guard = TicketGuard {
            inner: self.inner.clone(),
            kind,
            id,
        };

        let resolution = self.drive(&request, id).await;

        if self.inner.gateway.session().epoch != epoch {
            tracing::info!(operation = %kind, ticket_id = %id, "Session changed, discarding outcome");
            self.inner.tickets.send_if_modified(|tickets| {
                let ours = tickets.get(&kind).is_some_and(|t| t.id == id);
                if ours {
                    tickets.remove(&kind);
                }
                ours
            });
            return Err(LendoError::Stale);
        }

        match resolution {
            Resolution::Confirmed {
                block_number,
                confirmed_at,
            } => {
                let resolved = self.update(kind, id, |t| {
                    t.advance(TicketState::Confirmed);
                });
                self.drafts().remove(&kind);

                let scheduler = self.inner.scheduler.clone();
                let refresh =
                    tokio::spawn(async move { scheduler.refresh_since(Some(confirmed_at)).await });
                self.inner.notifications.success(kind.success_message());
                tracing::info!(operation = %kind, ticket_id = %id, block = block_number, "Operation confirmed");

                match refresh.await {
                    Ok(Err(err)) => {
                        tracing::debug!(operation = %kind, error_code = err.code(), "Post-operation refresh did not publish");
                    }
                    Err(err) => tracing::warn!(operation = %kind, error = %err, "Post-operation refresh aborted"),
                    Ok(Ok(_)) => {}
                }
                resolved.ok_or(LendoError::Stale)
            }
            Resolution::Failed(err) => {
                self.update(kind, id, |t| {
                    t.fail(err.clone());
                });
                tracing::warn!(
                    operation = %kind,
                    ticket_id = %id,
                    error = %err,
                    error_code = err.code(),
                    "Operation failed"
                );
                self.inner.notifications.error(failure_message(kind, &err));
                Err(err)
            }
        }
    }

    async fn drive(&self, request: &OperationRequest, id: Uuid) -> Resolution {
        let kind = request.kind;
        if !self.inner.gateway.session().is_connected() {
            return Resolution::Failed(LendoError::Validation(NOT_CONNECTED.into()));
        }

        let loan = self.inner.scheduler.snapshot().and_then(|s| s.loan);
        if let Err(err) = LedgerWriter::validate(request, loan.as_ref()) {
            return Resolution::Failed(err);
        }

        let handle = match self.inner.writer.submit(kind, request.amount).await {
            Ok(handle) => handle,
            Err(err) => return Resolution::Failed(err),
        };
        self.update(kind, id, |t| {
            if t.advance(TicketState::Submitted) {
                t.tx_hash = Some(handle.tx_hash);
            }
        });
        self.inner.notifications.info(SUBMITTED_MESSAGE);

        self.update(kind, id, |t| {
            t.advance(TicketState::Pending);
        });
        tracing::info!(operation = %kind, tx_hash = %handle.tx_hash, "Waiting for confirmation");

        match self.inner.writer.await_confirmation(&handle).await {
            Ok(block_number) => Resolution::Confirmed {
                block_number,
                confirmed_at: Instant::now(),
            },
            Err(err) => Resolution::Failed(err),
        }
    }

    /// Apply a change to this operation's ticket, if it is still in the table.
    fn update(
        &self,
        kind: OperationKind,
        id: Uuid,
        change: impl FnOnce(&mut OperationTicket),
    ) -> Option<OperationTicket> {
        let mut updated = None;
        self.inner.tickets.send_if_modified(|tickets| match tickets.get_mut(&kind) {
            Some(ticket) if ticket.id == id => {
                change(ticket);
                updated = Some(ticket.clone());
                true
            }
            _ => false,
        });
        updated
    }
}
