//! Wallet gateway: owns the session and translates provider events.
//!
//! The gateway is the only writer of the [`Session`]. Provider events are
//! pumped by a single task so subscribers see them in emission order.

use std::sync::{Arc, Mutex, MutexGuard, Weak};

use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use lendo_core::{Address, LendoError, LendoResult, ProviderFault, Session, WalletEvent};

use crate::notify::NotificationCenter;
use crate::provider::{ProviderEvent, WalletProvider};

/// What a successful connect reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Connection {
    pub identity: Address,
    pub network_id: u64,
}

#[derive(Clone)]
pub struct WalletGateway {
    inner: Arc<GatewayInner>,
}

struct GatewayInner {
    provider: Option<Arc<dyn WalletProvider>>,
    session: watch::Sender<Session>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<WalletEvent>>>,
    /// Cancels the provider event pump of the current connection
    pump: Mutex<Option<CancellationToken>>,
    /// Serializes connect attempts so only one prompt is open at a time
    connecting: tokio::sync::Mutex<()>,
    notifications: NotificationCenter,
}

impl WalletGateway {
    pub fn new(provider: Option<Arc<dyn WalletProvider>>, notifications: NotificationCenter) -> Self {
        let (session, _) = watch::channel(Session::default());
        Self {
            inner: Arc::new(GatewayInner {
                provider,
                session,
                subscribers: Mutex::new(Vec::new()),
                pump: Mutex::new(None),
                connecting: tokio::sync::Mutex::new(()),
                notifications,
            }),
        }
    }

    pub fn has_provider(&self) -> bool {
        self.inner.provider.is_some()
    }

    /// The injected provider, for components that talk to the ledger.
    pub fn provider(&self) -> LendoResult<Arc<dyn WalletProvider>> {
        self.inner.provider.clone().ok_or(LendoError::ProviderAbsent)
    }

    pub fn session(&self) -> Session {
        self.inner.session.borrow().clone()
    }

    pub fn watch_session(&self) -> watch::Receiver<Session> {
        self.inner.session.subscribe()
    }

    pub fn current_identity(&self) -> Option<Address> {
        self.inner.session.borrow().identity
    }

    pub fn current_network(&self) -> Option<u64> {
        self.inner.session.borrow().network_id
    }

    /// Connect to the wallet. Returns the current connection without prompting
    /// again when already connected.
    pub async fn connect(&self) -> LendoResult<Connection> {
        let _connecting = self.inner.connecting.lock().await;

        let session = self.session();
        if let (true, Some(identity), Some(network_id)) =
            (session.is_connected(), session.identity, session.network_id)
        {
            tracing::debug!(wallet = %identity, "Already connected");
            return Ok(Connection { identity, network_id });
        }

        let Some(provider) = self.inner.provider.clone() else {
            let err = LendoError::ProviderAbsent;
            tracing::warn!(error_code = err.code(), "Connect attempted without a wallet provider");
            self.inner.notifications.error(err.to_string());
            return Err(err);
        };

        self.inner.session.send_if_modified(|s| s.begin_connect());
        tracing::info!("Connecting to wallet");

        match request_connection(provider.as_ref()).await {
            Ok(connection) => {
                // Listen before publishing Connected so no event after it is missed
                let pump = self.start_pump(provider.as_ref());
                let established = self
                    .inner
                    .session
                    .send_if_modified(|s| s.establish(connection.identity, connection.network_id));
                if !established {
                    // Disconnected while the prompt was open
                    self.stop_pump(&pump);
                    tracing::info!(wallet = %connection.identity, "Session reset while connecting, dropping connection");
                    return Err(LendoError::Stale);
                }

                tracing::info!(
                    wallet = %connection.identity,
                    chain_id = connection.network_id,
                    "Connected to wallet"
                );
                self.inner.notifications.success("Successfully connected to wallet");
                Ok(connection)
            }
            Err(err) => {
                self.inner.session.send_if_modified(|s| s.reset());
                tracing::warn!(error = %err, error_code = err.code(), "Wallet connection failed");
                self.inner
                    .notifications
                    .error(format!("Failed to connect to wallet. {err}"));
                Err(err)
            }
        }
    }

    /// Drop the session and stop listening to the provider. Idempotent.
    pub fn disconnect(&self) {
        if self.teardown() {
            tracing::info!("Disconnected from wallet");
        }
    }

    /// Register for wallet events. Each subscriber gets its own feed.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<WalletEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers().push(tx);
        rx
    }

    fn subscribers(&self) -> MutexGuard<'_, Vec<mpsc::UnboundedSender<WalletEvent>>> {
        self.inner.subscribers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn publish(&self, event: WalletEvent) {
        self.subscribers().retain(|tx| tx.send(event).is_ok());
    }

    /// Stop the pump and reset the session. Returns true if a session was torn down.
    fn teardown(&self) -> bool {
        if let Some(token) = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
        {
            token.cancel();
        }
        self.inner.session.send_if_modified(|s| s.reset())
    }

    fn stop_pump(&self, token: &CancellationToken) {
        token.cancel();
        let mut pump = self.inner.pump.lock().unwrap_or_else(|e| e.into_inner());
        if pump.as_ref().is_some_and(CancellationToken::is_cancelled) {
            pump.take();
        }
    }

    fn start_pump(&self, provider: &dyn WalletProvider) -> CancellationToken {
        let token = CancellationToken::new();
        if let Some(previous) = self
            .inner
            .pump
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace(token.clone())
        {
            previous.cancel();
        }

        let mut events = provider.subscribe();
        let gateway = Arc::downgrade(&self.inner);
        let pump = token.clone();

        tokio::spawn(async move {
            tracing::debug!("Provider event pump started");
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    event = events.recv() => {
                        let Some(event) = event else { break };
                        let Some(inner) = Weak::upgrade(&gateway) else { break };
                        WalletGateway { inner }.handle_provider_event(event);
                    }
                }
            }
            tracing::debug!("Provider event pump stopped");
        });
        pump
    }

    fn handle_provider_event(&self, event: ProviderEvent) {
        match event {
            ProviderEvent::AccountsChanged(accounts) => match accounts.first().copied() {
                Some(identity) => {
                    if self.inner.session.send_if_modified(|s| s.switch_identity(identity)) {
                        tracing::info!(wallet = %identity, "Account changed");
                        self.inner.notifications.info("Account changed");
                        self.publish(WalletEvent::IdentityChanged(Some(identity)));
                    }
                }
                None => {
                    if self.teardown() {
                        tracing::info!("Wallet exposes no account, session reset");
                        self.inner.notifications.info("Disconnected from wallet");
                        self.publish(WalletEvent::IdentityChanged(None));
                    }
                }
            },
            ProviderEvent::ChainChanged(network_id) => {
                if self.current_network() == Some(network_id) {
                    tracing::debug!(chain_id = network_id, "Network unchanged, ignoring");
                    return;
                }
                tracing::info!(chain_id = network_id, "Network changed, reloading");
                self.teardown();
                self.publish(WalletEvent::NetworkChanged(network_id));
            }
            ProviderEvent::Disconnect => {
                if self.teardown() {
                    tracing::info!("Provider disconnected");
                    self.inner.notifications.info("Disconnected from wallet");
                    self.publish(WalletEvent::ProviderDisconnected);
                }
            }
        }
    }
}

async fn request_connection(provider: &dyn WalletProvider) -> LendoResult<Connection> {
    let accounts = provider.request_accounts().await.map_err(|fault| match fault {
        ProviderFault::Rejected => LendoError::UserRejected,
        other => LendoError::Provider(other),
    })?;
    let identity = accounts.first().copied().ok_or_else(|| {
        LendoError::Provider(ProviderFault::Rpc {
            code: -32000,
            message: "wallet returned no accounts".into(),
        })
    })?;
    let network_id = provider.chain_id().await.map_err(LendoError::Provider)?;
    Ok(Connection { identity, network_id })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::{MockProvider, DEFAULT_CHAIN_ID};
    use lendo_core::{ConnectionState, Severity};
    use std::time::Duration;
    use tokio_test::assert_ok;

    const ALICE: Address = Address::repeat_byte(0x11);
    const BOB: Address = Address::repeat_byte(0x22);

    fn gateway_with(provider: &MockProvider) -> (WalletGateway, NotificationCenter) {
        let notifications = NotificationCenter::new(Duration::from_secs(5));
        let provider: Arc<dyn WalletProvider> = Arc::new(provider.clone());
        (WalletGateway::new(Some(provider), notifications.clone()), notifications)
    }

    /// Let the pump task deliver pending events.
    async fn settle() {
        for _ in 0..10 {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_connect() {
        let provider = MockProvider::new(vec![ALICE]);
        let (gateway, notifications) = gateway_with(&provider);
        let mut states = gateway.watch_session();

        let connection = assert_ok!(gateway.connect().await);
        assert_eq!(connection, Connection { identity: ALICE, network_id: DEFAULT_CHAIN_ID });
        assert_eq!(gateway.current_identity(), Some(ALICE));
        assert_eq!(gateway.current_network(), Some(DEFAULT_CHAIN_ID));
        assert!(states.has_changed().unwrap());
        assert_eq!(states.borrow_and_update().connection_state, ConnectionState::Connected);
        assert_eq!(
            notifications.current().unwrap().message,
            "Successfully connected to wallet"
        );

        // Connecting again does not prompt
        assert_ok!(gateway.connect().await);
        assert_eq!(provider.connect_requests(), 1);
    }

    #[tokio::test]
    async fn test_connect_without_provider() {
        let notifications = NotificationCenter::new(Duration::from_secs(5));
        let gateway = WalletGateway::new(None, notifications.clone());
        assert_eq!(gateway.connect().await, Err(LendoError::ProviderAbsent));
        assert_eq!(gateway.session(), Session::default());
        assert_eq!(notifications.current().unwrap().severity, Severity::Error);
    }

    #[tokio::test]
    async fn test_connect_rejected() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.set_reject_connect(true);
        let (gateway, notifications) = gateway_with(&provider);

        assert_eq!(gateway.connect().await, Err(LendoError::UserRejected));
        assert_eq!(gateway.session().connection_state, ConnectionState::Disconnected);
        assert_eq!(
            notifications.current().unwrap().message,
            "Failed to connect to wallet. Wallet connection request was rejected"
        );
    }

    #[tokio::test]
    async fn test_connect_without_accounts() {
        let provider = MockProvider::new(vec![]);
        let (gateway, _) = gateway_with(&provider);
        let err = gateway.connect().await.unwrap_err();
        assert_eq!(err.code(), "PROVIDER_ERROR");
        assert!(!gateway.session().is_connected());
    }

    #[tokio::test]
    async fn test_disconnect_while_connecting() {
        let provider = MockProvider::new(vec![ALICE]);
        provider.hold_connect();
        let (gateway, notifications) = gateway_with(&provider);
        let mut events = gateway.subscribe();

        let connecting = gateway.clone();
        let connecting = tokio::spawn(async move { connecting.connect().await });
        while provider.connect_requests() == 0 {
            tokio::task::yield_now().await;
        }
        assert_eq!(gateway.session().connection_state, ConnectionState::Connecting);

        gateway.disconnect();
        provider.release_connect();
        assert_eq!(connecting.await.unwrap(), Err(LendoError::Stale));
        assert_eq!(gateway.session(), Session::default());
        assert_eq!(notifications.current(), None);

        settle().await;
        assert_eq!(provider.subscriber_count(), 0);

        // Nothing is listening for the abandoned connection
        provider.emit(ProviderEvent::ChainChanged(1));
        settle().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let provider = MockProvider::new(vec![ALICE]);
        let (gateway, _) = gateway_with(&provider);
        gateway.connect().await.unwrap();

        gateway.disconnect();
        let once = gateway.session();
        gateway.disconnect();
        assert_eq!(gateway.session(), once);
        assert_eq!(once.connection_state, ConnectionState::Disconnected);
        assert_eq!(once.epoch, 1);

        settle().await;
        assert_eq!(provider.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_account_change() {
        let provider = MockProvider::new(vec![ALICE]);
        let (gateway, notifications) = gateway_with(&provider);
        let mut events = gateway.subscribe();
        gateway.connect().await.unwrap();

        provider.emit(ProviderEvent::AccountsChanged(vec![BOB]));
        assert_eq!(events.recv().await, Some(WalletEvent::IdentityChanged(Some(BOB))));
        assert_eq!(gateway.current_identity(), Some(BOB));
        assert_eq!(gateway.session().epoch, 0);
        assert_eq!(notifications.current().unwrap().message, "Account changed");
    }

    #[tokio::test]
    async fn test_empty_accounts_resets_session() {
        let provider = MockProvider::new(vec![ALICE]);
        let (gateway, _) = gateway_with(&provider);
        let mut events = gateway.subscribe();
        gateway.connect().await.unwrap();

        provider.emit(ProviderEvent::AccountsChanged(vec![]));
        assert_eq!(events.recv().await, Some(WalletEvent::IdentityChanged(None)));
        assert!(!gateway.session().is_connected());
    }

    #[tokio::test]
    async fn test_network_change_resets_session() {
        let provider = MockProvider::new(vec![ALICE]);
        let (gateway, _) = gateway_with(&provider);
        let mut events = gateway.subscribe();
        gateway.connect().await.unwrap();

        // Same network is not a change
        provider.emit(ProviderEvent::ChainChanged(DEFAULT_CHAIN_ID));
        provider.emit(ProviderEvent::ChainChanged(1));
        assert_eq!(events.recv().await, Some(WalletEvent::NetworkChanged(1)));

        let session = gateway.session();
        assert_eq!(session.connection_state, ConnectionState::Disconnected);
        assert_eq!(session.epoch, 1);
    }

    #[tokio::test]
    async fn test_events_in_emission_order() {
        let provider = MockProvider::new(vec![ALICE]);
        let (gateway, _) = gateway_with(&provider);
        let mut first = gateway.subscribe();
        let mut second = gateway.subscribe();
        gateway.connect().await.unwrap();

        provider.emit(ProviderEvent::AccountsChanged(vec![BOB]));
        provider.emit(ProviderEvent::AccountsChanged(vec![ALICE]));
        provider.emit(ProviderEvent::Disconnect);

        let expected = [
            WalletEvent::IdentityChanged(Some(BOB)),
            WalletEvent::IdentityChanged(Some(ALICE)),
            WalletEvent::ProviderDisconnected,
        ];
        for event in expected {
            assert_eq!(first.recv().await, Some(event));
            assert_eq!(second.recv().await, Some(event));
        }
    }

    #[tokio::test]
    async fn test_events_ignored_after_disconnect() {
        let provider = MockProvider::new(vec![ALICE]);
        let (gateway, _) = gateway_with(&provider);
        let mut events = gateway.subscribe();
        gateway.connect().await.unwrap();
        gateway.disconnect();
        settle().await;

        provider.emit(ProviderEvent::AccountsChanged(vec![BOB]));
        settle().await;
        assert!(events.try_recv().is_err());
        assert_eq!(gateway.current_identity(), None);
    }
}
