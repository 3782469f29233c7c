//! The client facade: wires the components together and reacts to session changes.

use std::sync::{Arc, Mutex};

use rust_decimal::Decimal;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use lendo_core::{
    LedgerSnapshot, LendoError, LendoResult, Notification, OperationKind, OperationRequest,
    OperationTicket, Session, WalletEvent,
};

use crate::config::AppConfig;
use crate::gateway::{Connection, WalletGateway};
use crate::notify::NotificationCenter;
use crate::orchestrator::{TicketTable, TransactionOrchestrator};
use crate::provider::{JsonRpcProvider, WalletProvider};
use crate::reader::LedgerReader;
use crate::sync::DataSyncScheduler;
use crate::writer::LedgerWriter;

#[derive(Clone)]
pub struct LendingClient {
    gateway: WalletGateway,
    reader: LedgerReader,
    scheduler: DataSyncScheduler,
    orchestrator: TransactionOrchestrator,
    notifications: NotificationCenter,
    reconnect_on_network_change: bool,
    auto_connect: bool,
    shutdown: CancellationToken,
    worker: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl LendingClient {
    pub fn new(config: &AppConfig, provider: Option<Arc<dyn WalletProvider>>) -> Self {
        let notifications = NotificationCenter::from_config(&config.notifications);
        let gateway = WalletGateway::new(provider, notifications.clone());
        let contract = config.ledger.contract_address;

        let reader = LedgerReader::new(gateway.clone(), contract);
        let writer = LedgerWriter::new(gateway.clone(), contract);
        let scheduler = DataSyncScheduler::new(reader.clone(), gateway.clone(), notifications.clone());
        let orchestrator = TransactionOrchestrator::new(
            gateway.clone(),
            writer,
            scheduler.clone(),
            notifications.clone(),
        );

        Self {
            gateway,
            reader,
            scheduler,
            orchestrator,
            notifications,
            reconnect_on_network_change: config.session.reconnect_on_network_change,
            auto_connect: config.session.auto_connect,
            shutdown: CancellationToken::new(),
            worker: Arc::new(Mutex::new(None)),
        }
    }

    /// Build a client talking to the configured JSON-RPC wallet, if any.
    pub fn from_config(config: &AppConfig) -> LendoResult<Self> {
        let provider: Option<Arc<dyn WalletProvider>> = match &config.wallet.rpc_url {
            Some(url) => Some(Arc::new(
                JsonRpcProvider::new(url, &config.wallet).map_err(LendoError::Provider)?,
            )),
            None => {
                tracing::warn!("No wallet RPC URL configured, running without a provider");
                None
            }
        };
        Ok(Self::new(config, provider))
    }

    /// Start reacting to session changes and wallet events, then auto-connect
    /// when configured to. Calling it again has no effect.
    pub async fn start(&self) {
        {
            let mut worker = self.worker.lock().unwrap_or_else(|e| e.into_inner());
            if worker.is_some() {
                return;
            }
            // Subscribe before spawning so nothing published from here on is missed
            let sessions = self.gateway.watch_session();
            let events = self.gateway.subscribe();
            let this = self.clone();
            *worker = Some(tokio::spawn(async move { this.run(sessions, events).await }));
        }

        if self.auto_connect && self.gateway.has_provider() {
            // Failures are already reported through notifications
            let _ = self.connect().await;
        }
    }

    /// Stop the background worker and drop the session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.gateway.disconnect();
        let worker = self.worker.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }

    async fn run(
        self,
        mut sessions: watch::Receiver<Session>,
        mut events: mpsc::UnboundedReceiver<WalletEvent>,
    ) {
        let mut seen = sessions.borrow_and_update().clone();
        if seen.is_connected() {
            self.trigger_refresh();
        }

        tracing::debug!("Client worker started");
        loop {
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                changed = sessions.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let session = sessions.borrow_and_update().clone();
                    self.on_session_change(&seen, &session);
                    seen = session;
                }
                event = events.recv() => match event {
                    Some(event) => self.on_wallet_event(event),
                    None => break,
                },
            }
        }
        tracing::debug!("Client worker stopped");
    }

    fn on_session_change(&self, previous: &Session, current: &Session) {
        if current.epoch != previous.epoch {
            tracing::info!(epoch = current.epoch, "Session reset, clearing session state");
            self.orchestrator.reset();
            self.scheduler.reset();
        }

        let new_identity = current.epoch != previous.epoch
            || !previous.is_connected()
            || previous.identity != current.identity;
        if current.is_connected() && new_identity {
            self.trigger_refresh();
        }
    }

    fn on_wallet_event(&self, event: WalletEvent) {
        match event {
            WalletEvent::NetworkChanged(network_id) if self.reconnect_on_network_change => {
                tracing::info!(chain_id = network_id, "Reconnecting after network change");
                let this = self.clone();
                tokio::spawn(async move {
                    let _ = this.connect().await;
                });
            }
            other => tracing::debug!(event = ?other, "Wallet event"),
        }
    }

    fn trigger_refresh(&self) {
        let scheduler = self.scheduler.clone();
        tokio::spawn(async move {
            if let Err(err) = scheduler.refresh().await {
                tracing::debug!(error_code = err.code(), "Triggered refresh did not publish");
            }
        });
    }

    // =========================================================================
    // Session
    // =========================================================================

    pub async fn connect(&self) -> LendoResult<Connection> {
        self.gateway.connect().await
    }

    pub fn disconnect(&self) {
        self.gateway.disconnect();
    }

    pub fn session(&self) -> Session {
        self.gateway.session()
    }

    pub fn watch_session(&self) -> watch::Receiver<Session> {
        self.gateway.watch_session()
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WalletEvent> {
        self.gateway.subscribe()
    }

    // =========================================================================
    // Ledger state
    // =========================================================================

    pub fn snapshot(&self) -> Option<LedgerSnapshot> {
        self.scheduler.snapshot()
    }

    pub fn watch_snapshot(&self) -> watch::Receiver<Option<LedgerSnapshot>> {
        self.scheduler.watch()
    }

    pub async fn refresh(&self) -> LendoResult<LedgerSnapshot> {
        self.scheduler.refresh().await
    }

    pub fn reader(&self) -> &LedgerReader {
        &self.reader
    }

    // =========================================================================
    // Operations
    // =========================================================================

    pub async fn deposit(&self, amount: Decimal) -> LendoResult<OperationTicket> {
        self.orchestrator.execute(OperationRequest::deposit(amount)).await
    }

    pub async fn borrow(&self, collateral: Decimal) -> LendoResult<OperationTicket> {
        self.orchestrator.execute(OperationRequest::borrow(collateral)).await
    }

    pub async fn repay(&self, amount: Decimal) -> LendoResult<OperationTicket> {
        self.orchestrator.execute(OperationRequest::repay(amount)).await
    }

    pub async fn withdraw_collateral(&self) -> LendoResult<OperationTicket> {
        self.orchestrator
            .execute(OperationRequest::withdraw_collateral())
            .await
    }

    pub fn spawn(&self, request: OperationRequest) -> JoinHandle<LendoResult<OperationTicket>> {
        self.orchestrator.spawn(request)
    }

    pub fn set_draft(&self, kind: OperationKind, input: impl Into<String>) {
        self.orchestrator.set_draft(kind, input);
    }

    pub fn draft(&self, kind: OperationKind) -> String {
        self.orchestrator.draft(kind)
    }

    pub async fn submit_draft(&self, kind: OperationKind) -> LendoResult<OperationTicket> {
        self.orchestrator.submit_draft(kind).await
    }

    pub fn ticket(&self, kind: OperationKind) -> Option<OperationTicket> {
        self.orchestrator.ticket(kind)
    }

    pub fn tickets(&self) -> TicketTable {
        self.orchestrator.tickets()
    }

    pub fn watch_tickets(&self) -> watch::Receiver<TicketTable> {
        self.orchestrator.watch_tickets()
    }

    // =========================================================================
    // Notifications
    // =========================================================================

    pub fn notification(&self) -> Option<Notification> {
        self.notifications.current()
    }

    pub fn watch_notifications(&self) -> watch::Receiver<Option<Notification>> {
        self.notifications.watch()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::{MockLoan, MockProvider};
    use crate::provider::ProviderEvent;
    use lendo_core::{to_wei, Address, ConnectionState, LoanStatus, TicketState};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    const ALICE: Address = Address::repeat_byte(0x11);
    const BOB: Address = Address::repeat_byte(0x22);

    fn client_with(provider: &MockProvider, auto_connect: bool) -> LendingClient {
        let mut config = AppConfig::defaults().unwrap();
        config.session.auto_connect = auto_connect;
        let dyn_provider: Arc<dyn WalletProvider> = Arc::new(provider.clone());
        LendingClient::new(&config, Some(dyn_provider))
    }

    /// Wait for the next published snapshot matching `f`.
    async fn snapshot_where(
        client: &LendingClient,
        f: impl Fn(&LedgerSnapshot) -> bool,
    ) -> LedgerSnapshot {
        let mut rx = client.watch_snapshot();
        let snapshot = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|s| s.as_ref().is_some_and(&f)),
        )
        .await
        .expect("snapshot timed out")
        .unwrap()
        .clone();
        snapshot.unwrap()
    }

    #[tokio::test]
    async fn test_auto_connect_fetches_snapshot() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.set_pool_balance(to_wei(dec!(42)).unwrap());
        let client = client_with(&provider, true);
        client.start().await;

        assert_eq!(client.session().connection_state, ConnectionState::Connected);
        let snapshot = snapshot_where(&client, |_| true).await;
        assert_eq!(snapshot.pool_balance, dec!(42));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_no_provider() {
        let config = AppConfig::defaults().unwrap();
        let client = LendingClient::from_config(&config).unwrap();
        client.start().await;
        assert_eq!(client.connect().await, Err(LendoError::ProviderAbsent));
        assert!(client.notification().is_some());
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_full_loan_cycle() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.set_pool_balance(to_wei(dec!(10)).unwrap());
        let client = client_with(&provider, true);
        client.start().await;
        snapshot_where(&client, |_| true).await;

        client.borrow(dec!(2)).await.unwrap();
        assert_eq!(client.snapshot().unwrap().loan_status(), LoanStatus::Active);

        client.set_draft(OperationKind::Repay, "1.05");
        client.submit_draft(OperationKind::Repay).await.unwrap();
        assert_eq!(client.snapshot().unwrap().loan_status(), LoanStatus::Repaid);

        let ticket = client.withdraw_collateral().await.unwrap();
        assert_eq!(ticket.state, TicketState::Confirmed);
        assert_eq!(client.snapshot().unwrap().loan, None);
        assert_eq!(
            client.notification().unwrap().message,
            "Collateral withdrawn successfully!"
        );
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_identity_change_refetches() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.set_loan(
            BOB,
            MockLoan {
                collateral: to_wei(dec!(4)).unwrap(),
                loan: to_wei(dec!(2)).unwrap(),
                is_repaid: false,
            },
        );
        let client = client_with(&provider, true);
        client.start().await;
        snapshot_where(&client, |s| s.loan.is_none()).await;

        provider.emit(ProviderEvent::AccountsChanged(vec![BOB]));
        let snapshot = snapshot_where(&client, |s| s.loan.is_some()).await;
        assert_eq!(snapshot.loan.unwrap().collateral_amount, dec!(4));
        assert_eq!(client.session().identity, Some(BOB));
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnect_clears_session_state() {
        let provider = MockProvider::new(vec![ALICE]);
        let client = client_with(&provider, true);
        client.start().await;
        snapshot_where(&client, |_| true).await;
        client.deposit(dec!(1)).await.unwrap();
        assert!(client.ticket(OperationKind::Deposit).is_some());

        let mut snapshots = client.watch_snapshot();
        client.disconnect();
        snapshots.wait_for(|s| s.is_none()).await.unwrap();
        assert!(client.tickets().is_empty());
        assert_eq!(client.session().epoch, 1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_reconnect_keeps_new_session_ticket() {
        let provider = MockProvider::new(vec![ALICE]);
        let client = client_with(&provider, true);
        client.start().await;
        snapshot_where(&client, |_| true).await;

        // The worker has not seen the reset yet when the deposit starts
        client.disconnect();
        client.connect().await.unwrap();
        let first = client.deposit(dec!(1));
        tokio::pin!(first);
        assert!(futures::poll!(&mut first).is_pending());
        assert!(client.orchestrator.is_busy(OperationKind::Deposit));

        let mut sessions = client.watch_session();
        sessions.wait_for(|s| s.epoch == 1).await.unwrap();
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
        let ticket = client.ticket(OperationKind::Deposit).unwrap();
        assert_eq!(ticket.epoch, 1);
        assert!(!ticket.is_terminal());

        assert_eq!(
            client.deposit(dec!(2)).await,
            Err(LendoError::DuplicateOperation(OperationKind::Deposit))
        );
        let ticket = first.await.unwrap();
        assert_eq!(ticket.state, TicketState::Confirmed);
        assert_eq!(provider.sent_transactions().len(), 1);
        client.shutdown().await;
    }

    #[tokio::test]
    async fn test_network_change_reloads_and_reconnects() {
        let provider = MockProvider::new(vec![ALICE]);
        let client = client_with(&provider, true);
        client.start().await;
        snapshot_where(&client, |_| true).await;

        let mut sessions = client.watch_session();
        provider.emit(ProviderEvent::ChainChanged(11155111));
        let session = sessions
            .wait_for(|s| s.is_connected() && s.network_id == Some(11155111))
            .await
            .unwrap()
            .clone();
        assert_eq!(session.epoch, 1);
        assert_eq!(provider.connect_requests(), 2);
        snapshot_where(&client, |_| true).await;
        client.shutdown().await;
    }
}
