//! Keeps the local ledger snapshot in step with the remote ledger.
//!
//! At most one snapshot fetch is in flight. Triggers that arrive while it runs
//! share its result. A fetch whose session moved on meanwhile (reset, or a
//! different identity) is discarded instead of published, and triggers for
//! the new session wait for it to finish before starting their own.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::watch;
use tokio::time::Instant;

use lendo_core::{Address, LedgerSnapshot, LendoError, LendoResult};

use crate::gateway::WalletGateway;
use crate::notify::NotificationCenter;
use crate::reader::LedgerReader;
use crate::writer::NOT_CONNECTED;

pub const FETCH_FAILED: &str = "Failed to fetch contract data";

type SnapshotFetch = Shared<BoxFuture<'static, LendoResult<LedgerSnapshot>>>;

struct InFlight {
    id: u64,
    epoch: u64,
    identity: Address,
    started_at: Instant,
    fetch: SnapshotFetch,
}

#[derive(Clone)]
pub struct DataSyncScheduler {
    inner: Arc<SyncInner>,
}

struct SyncInner {
    reader: LedgerReader,
    gateway: WalletGateway,
    notifications: NotificationCenter,
    snapshot: watch::Sender<Option<LedgerSnapshot>>,
    /// Session epoch of the published snapshot
    published_epoch: AtomicU64,
    in_flight: Mutex<Option<InFlight>>,
    next_id: AtomicU64,
}

impl DataSyncScheduler {
    pub fn new(reader: LedgerReader, gateway: WalletGateway, notifications: NotificationCenter) -> Self {
        let (snapshot, _) = watch::channel(None);
        Self {
            inner: Arc::new(SyncInner {
                reader,
                gateway,
                notifications,
                snapshot,
                published_epoch: AtomicU64::new(0),
                in_flight: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Latest published snapshot, `None` before the first successful fetch.
    pub fn snapshot(&self) -> Option<LedgerSnapshot> {
        self.inner.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<Option<LedgerSnapshot>> {
        self.inner.snapshot.subscribe()
    }

    /// Fetch the snapshot, joining a fetch already running for the same session.
    pub async fn refresh(&self) -> LendoResult<LedgerSnapshot> {
        self.refresh_since(None).await
    }

    /// Like [`refresh`](Self::refresh), but only joins a fetch started at or
    /// after `since`. An older one is awaited first and then replaced, so the
    /// result reflects everything that happened before `since`.
    pub async fn refresh_since(&self, since: Option<Instant>) -> LendoResult<LedgerSnapshot> {
        loop {
            let (fetch, fresh) = self.join_or_start(since)?;
            let result = fetch.await;
            if fresh {
                return result;
            }
        }
    }

    /// Forget a snapshot published for an earlier session. A fetch still
    /// running for one is discarded when it lands.
    pub fn reset(&self) {
        let epoch = self.inner.gateway.session().epoch;
        let published_epoch = &self.inner.published_epoch;
        let cleared = self.inner.snapshot.send_if_modified(|snapshot| {
            if snapshot.is_some() && published_epoch.load(Ordering::Acquire) < epoch {
                *snapshot = None;
                return true;
            }
            false
        });
        if cleared {
            tracing::debug!(epoch = epoch, "Ledger snapshot cleared");
        }
    }

    fn in_flight(&self) -> MutexGuard<'_, Option<InFlight>> {
        self.inner.in_flight.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn join_or_start(&self, since: Option<Instant>) -> LendoResult<(SnapshotFetch, bool)> {
        let session = self.inner.gateway.session();
        let identity = match (session.is_connected(), session.identity) {
            (true, Some(identity)) => identity,
            _ => return Err(LendoError::Validation(NOT_CONNECTED.into())),
        };

        let mut slot = self.in_flight();
        // A finished fetch whose task died without clearing the slot counts as gone
        if let Some(current) = slot.as_ref().filter(|current| current.fetch.peek().is_none()) {
            if current.epoch != session.epoch || current.identity != identity {
                tracing::debug!(fetch_id = current.id, "Waiting for fetch of a previous session");
                return Ok((current.fetch.clone(), false));
            }
            let fresh = since.map_or(true, |since| current.started_at >= since);
            tracing::debug!(fetch_id = current.id, fresh = fresh, "Joining in-flight snapshot fetch");
            return Ok((current.fetch.clone(), fresh));
        }

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = self.inner.clone();
        let epoch = session.epoch;
        let handle = tokio::spawn(async move { run_fetch(inner, id, epoch, identity).await });
        let fetch = async move { handle.await.unwrap_or(Err(LendoError::Stale)) }
            .boxed()
            .shared();

        *slot = Some(InFlight {
            id,
            epoch,
            identity,
            started_at: Instant::now(),
            fetch: fetch.clone(),
        });
        Ok((fetch, true))
    }
}

async fn run_fetch(inner: Arc<SyncInner>, id: u64, epoch: u64, identity: Address) -> LendoResult<LedgerSnapshot> {
    tracing::debug!(fetch_id = id, wallet = %identity, "Fetching ledger snapshot");
    let result = inner.reader.fetch_snapshot(identity).await;

    {
        let mut slot = inner.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        if slot.as_ref().is_some_and(|current| current.id == id) {
            *slot = None;
        }
    }

    let session = inner.gateway.session();
    if !session.is_connected() || session.epoch != epoch || session.identity != Some(identity) {
        tracing::debug!(
            fetch_id = id,
            wallet = %identity,
            "Session changed during fetch, discarding snapshot"
        );
        return Err(LendoError::Stale);
    }

    match result {
        Ok(snapshot) => {
            inner.snapshot.send_modify(|published| {
                inner.published_epoch.store(epoch, Ordering::Release);
                *published = Some(snapshot.clone());
            });
            Ok(snapshot)
        }
        Err(err) => {
            tracing::warn!(
                fetch_id = id,
                wallet = %identity,
                error = %err,
                error_code = err.code(),
                "Snapshot fetch failed, keeping previous snapshot"
            );
            inner.notifications.error(FETCH_FAILED);
            Err(err)
        }
    }
}
