//! Single-flight refresh coordination.
//!
//! The first caller that needs a fresh credential while the coordinator is
//! `Idle` starts a refresh cycle; every caller arriving while the cycle runs
//! is queued and resolved, in arrival order, with the cycle's outcome.
//!
//! The cycle runs on its own task. A caller that gives up (timeout, dropped
//! future) only removes its own queue entry and can never leave the state
//! stuck in `Refreshing`.
//!
//! Writes to the durable slot (keychain or file) happen after the state lock
//! is released, under a separate `slot_io` lock that is acquired before the
//! state lock is let go. Queueing callers therefore never wait on storage
//! I/O, and slot writes still land in the order they were decided.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::events::{SessionEvents, SessionObserver, SubscriptionId};
use super::executor::{RefreshExchange, RefreshGrant};
use super::RefreshError;
use crate::auth::{AccessCredential, CredentialStore, RefreshCredential, StoreError};

/// Label used for callers that do not belong to a specific request
const UNATTRIBUTED: &str = "(direct)";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshState {
    Idle,
    Refreshing,
}

type Outcome = Result<AccessCredential, RefreshError>;

struct PendingRequest {
    id: u64,
    descriptor: String,
    done: oneshot::Sender<Outcome>,
}

/// A refresh that failed, kept until the next login or successful refresh
struct FailedCycle {
    /// Access credential in the store when the cycle started
    access: Option<AccessCredential>,
    error: RefreshError,
}

/// Change to the durable slot decided under the state lock
enum SlotWrite {
    Keep,
    Save(RefreshCredential),
    Delete,
}

struct Inner {
    state: RefreshState,
    /// Identifies the running cycle; bumped when a cycle starts or is superseded
    cycle: u64,
    /// Access credential the running cycle is replacing
    cycle_access: Option<AccessCredential>,
    last_failure: Option<FailedCycle>,
    pending: VecDeque<PendingRequest>,
    next_waiter: u64,
    /// Session end already reported to observers
    session_ended: bool,
}

impl Inner {
    fn enqueue(&mut self, descriptor: &str) -> (u64, oneshot::Receiver<Outcome>) {
        let (done, rx) = oneshot::channel();
        let id = self.next_waiter;
        self.next_waiter += 1;
        self.pending.push_back(PendingRequest {
            id,
            descriptor: descriptor.to_string(),
            done,
        });
        (id, rx)
    }

    /// Return to `Idle` and hand back everything that was waiting.
    /// Taking the queue here keeps "Idle with waiters" unobservable.
    fn settle(&mut self) -> VecDeque<PendingRequest> {
        self.state = RefreshState::Idle;
        std::mem::take(&mut self.pending)
    }

    /// Abandon a running cycle so its eventual outcome is discarded
    fn supersede(&mut self) -> VecDeque<PendingRequest> {
        if self.state != RefreshState::Refreshing {
            return VecDeque::new();
        }
        debug!(cycle = self.cycle, "Superseding in-flight refresh");
        self.cycle += 1;
        self.settle()
    }
}

/// Resolve waiters in the order they were queued. Waiters whose caller has
/// gone away are skipped silently.
fn drain(pending: VecDeque<PendingRequest>, outcome: &Outcome) {
    for request in pending {
        debug!(waiter = request.id, request = %request.descriptor, ok = outcome.is_ok(), "Resolving queued request");
        let _ = request.done.send(outcome.clone());
    }
}

struct Shared {
    store: Arc<CredentialStore>,
    executor: Arc<dyn RefreshExchange>,
    events: SessionEvents,
    inner: Mutex<Inner>,
    /// Held for every durable slot access
    slot_io: Mutex<()>,
}

impl Shared {
    /// Apply a slot write. `_io` must have been taken while the state lock
    /// that decided the write was still held.
    fn persist(&self, write: SlotWrite, _io: MutexGuard<'_, ()>) -> Result<(), StoreError> {
        match write {
            SlotWrite::Keep => Ok(()),
            SlotWrite::Save(refresh) => self.store.set_refresh(Some(refresh)),
            SlotWrite::Delete => self.store.set_refresh(None),
        }
    }

    async fn run_cycle(self: Arc<Self>, cycle: u64) {
        let stored = {
            let _io = self.slot_io.lock();
            self.store.get_refresh()
        };
        let outcome = match stored {
            Ok(Some(refresh)) => self.executor.exchange(&refresh).await,
            Ok(None) => Err(RefreshError::Missing),
            Err(err) => {
                warn!(error = %err, "Refresh credential unreadable, treating as missing");
                Err(RefreshError::Missing)
            }
        };
        self.finish_cycle(cycle, outcome);
    }

    fn finish_cycle(&self, cycle: u64, outcome: Result<RefreshGrant, RefreshError>) {
        let (pending, result, notify, write, io) = {
            let mut inner = self.inner.lock();
            if inner.state != RefreshState::Refreshing || inner.cycle != cycle {
                debug!(cycle, "Discarding outcome of superseded refresh");
                return;
            }

            let started_with = inner.cycle_access.take();
            let mut notify = false;
            let (result, write) = match outcome {
                Ok(grant) => {
                    self.store.set_access(Some(grant.access.clone()));
                    inner.session_ended = false;
                    inner.last_failure = None;
                    let write = grant.refresh.map_or(SlotWrite::Keep, SlotWrite::Save);
                    (Ok(grant.access), write)
                }
                Err(err) => {
                    self.store.set_access(None);
                    notify = !inner.session_ended;
                    inner.session_ended = true;
                    inner.last_failure = Some(FailedCycle {
                        access: started_with,
                        error: err.clone(),
                    });
                    (Err(err), SlotWrite::Delete)
                }
            };

            (inner.settle(), result, notify, write, self.slot_io.lock())
        };

        if let Err(err) = self.persist(write, io) {
            match result {
                Ok(_) => warn!(error = %err, "Failed to persist rotated refresh credential"),
                Err(_) => warn!(error = %err, "Failed to clear stored refresh credential"),
            }
        }

        match result {
            Ok(_) => info!(cycle, waiters = pending.len(), "Credential refreshed"),
            Err(ref err) => warn!(cycle, waiters = pending.len(), error = %err, "Credential refresh failed"),
        }
        drain(pending, &result);
        if notify {
            self.events.emit();
        }
    }
}

/// A queued caller. Dropping it before it resolves withdraws it from the
/// queue.
struct Waiter {
    id: u64,
    rx: oneshot::Receiver<Outcome>,
    shared: Arc<Shared>,
    settled: bool,
}

impl Waiter {
    async fn wait(mut self) -> Outcome {
        let outcome = (&mut self.rx).await;
        self.settled = true;
        // The sender only disappears without resolving if the runtime tore
        // the cycle task down
        outcome.unwrap_or_else(|_| Err(RefreshError::Network("refresh was aborted".to_string())))
    }
}

impl Drop for Waiter {
    fn drop(&mut self) {
        if self.settled {
            return;
        }
        let mut inner = self.shared.inner.lock();
        let before = inner.pending.len();
        inner.pending.retain(|request| request.id != self.id);
        if inner.pending.len() != before {
            debug!(waiter = self.id, "Queued request cancelled");
        }
    }
}

enum Trigger<'a> {
    /// Always refresh (or join the running refresh)
    Always,
    /// The server rejected this credential; a newer one may already exist
    Rejected(Option<&'a AccessCredential>),
}

/// Guarantees at most one refresh exchange in flight.
///
/// Cheap to clone; clones share state. Construct one per credential store
/// and hand a clone to every [`ApiClient`](crate::api::ApiClient).
#[derive(Clone)]
pub struct Coordinator {
    shared: Arc<Shared>,
}

impl Coordinator {
    pub fn new(store: Arc<CredentialStore>, executor: Arc<dyn RefreshExchange>) -> Self {
        Self {
            shared: Arc::new(Shared {
                store,
                executor,
                events: SessionEvents::new(),
                inner: Mutex::new(Inner {
                    state: RefreshState::Idle,
                    cycle: 0,
                    cycle_access: None,
                    last_failure: None,
                    pending: VecDeque::new(),
                    next_waiter: 0,
                    session_ended: false,
                }),
                slot_io: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &Arc<CredentialStore> {
        &self.shared.store
    }

    pub fn events(&self) -> &SessionEvents {
        &self.shared.events
    }

    pub fn subscribe(&self, observer: Arc<dyn SessionObserver>) -> SubscriptionId {
        self.shared.events.subscribe(observer)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.shared.events.unsubscribe(id)
    }

    pub fn state(&self) -> RefreshState {
        self.shared.inner.lock().state
    }

    /// Number of callers waiting on the running refresh
    pub fn pending_len(&self) -> usize {
        self.shared.inner.lock().pending.len()
    }

    /// Obtain a new access credential, refreshing if no refresh is running
    /// or joining the one that is.
    pub async fn ensure_fresh_credential(&self) -> Result<AccessCredential, RefreshError> {
        self.acquire(UNATTRIBUTED, Trigger::Always).await
    }

    /// Like [`ensure_fresh_credential`](Self::ensure_fresh_credential), for a
    /// request the server rejected while carrying `rejected`. If the store
    /// already holds a different credential, a refresh or login finished
    /// after the request was sent and that credential is returned as is.
    pub async fn ensure_fresh_credential_after(
        &self,
        descriptor: &str,
        rejected: Option<&AccessCredential>,
    ) -> Result<AccessCredential, RefreshError> {
        self.acquire(descriptor, Trigger::Rejected(rejected)).await
    }

    async fn acquire(&self, descriptor: &str, trigger: Trigger<'_>) -> Outcome {
        let waiter = {
            let mut inner = self.shared.inner.lock();

            if inner.state == RefreshState::Idle {
                if let Trigger::Rejected(rejected) = trigger {
                    match self.shared.store.get_access() {
                        Some(current) if Some(&current) != rejected => {
                            debug!(request = %descriptor, "Credential already replaced, skipping refresh");
                            return Ok(current);
                        }
                        Some(_) => {}
                        None => {
                            // Rejected while the refresh that replaced it was failing
                            if let Some(ref failed) = inner.last_failure {
                                if failed.access.as_ref() == rejected {
                                    debug!(request = %descriptor, "Refresh for this credential already failed");
                                    return Err(failed.error.clone());
                                }
                            }
                        }
                    }
                }

                inner.cycle += 1;
                inner.state = RefreshState::Refreshing;
                inner.cycle_access = self.shared.store.get_access();
                let cycle = inner.cycle;
                debug!(cycle, request = %descriptor, "Starting refresh");
                tokio::spawn(Arc::clone(&self.shared).run_cycle(cycle));
            } else {
                debug!(request = %descriptor, waiting = inner.pending.len(), "Refresh in progress, queueing");
            }

            let (id, rx) = inner.enqueue(descriptor);
            Waiter {
                id,
                rx,
                shared: Arc::clone(&self.shared),
                settled: false,
            }
        };

        waiter.wait().await
    }

    /// Install credentials from a successful login. A refresh still in
    /// flight is abandoned and its waiters receive the login credential.
    ///
    /// The access credential is installed even if persisting the refresh
    /// credential fails; the error is returned for the caller to report.
    pub fn begin_session(
        &self,
        access: AccessCredential,
        refresh: RefreshCredential,
    ) -> Result<(), StoreError> {
        let (pending, io) = {
            let mut inner = self.shared.inner.lock();
            self.shared.store.set_access(Some(access.clone()));
            inner.session_ended = false;
            inner.last_failure = None;
            (inner.supersede(), self.shared.slot_io.lock())
        };
        let persisted = self.shared.persist(SlotWrite::Save(refresh), io);

        info!("Session started");
        drain(pending, &Ok(access));
        persisted
    }

    /// Forget all credentials at the user's request. A refresh still in
    /// flight is abandoned and its waiters fail with
    /// [`RefreshError::Missing`]. Observers are not notified.
    pub fn end_session(&self) -> Result<(), StoreError> {
        let (pending, io) = {
            let mut inner = self.shared.inner.lock();
            self.shared.store.set_access(None);
            inner.session_ended = true;
            inner.last_failure = None;
            (inner.supersede(), self.shared.slot_io.lock())
        };
        let cleared = self.shared.persist(SlotWrite::Delete, io);

        info!("Session ended by logout");
        drain(pending, &Err(RefreshError::Missing));
        cleared
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use futures::future::join_all;
    use tokio::sync::Notify;

    use super::*;
    use crate::auth::{MemorySlot, RefreshSlot};
    use crate::refresh::SessionEnded;

    /// Slot whose reads or writes fail like a locked keychain
    struct FailingSlot {
        load_fails: bool,
        saved: MemorySlot,
    }

    /// Slot whose `save` holds until the test releases it
    struct SlowSlot {
        entered: std::sync::mpsc::SyncSender<()>,
        release: Mutex<std::sync::mpsc::Receiver<()>>,
        saved: MemorySlot,
    }

    impl RefreshSlot for SlowSlot {
        fn load(&self) -> Result<Option<RefreshCredential>, StoreError> {
            self.saved.load()
        }

        fn save(&self, refresh: &RefreshCredential) -> Result<(), StoreError> {
            let _ = self.entered.send(());
            let _ = self.release.lock().recv();
            self.saved.save(refresh)
        }

        fn delete(&self) -> Result<(), StoreError> {
            self.saved.delete()
        }
    }

    fn locked() -> StoreError {
        StoreError::Io(std::io::Error::other("keychain locked"))
    }

    impl RefreshSlot for FailingSlot {
        fn load(&self) -> Result<Option<RefreshCredential>, StoreError> {
            if self.load_fails {
                return Err(locked());
            }
            self.saved.load()
        }

        fn save(&self, _refresh: &RefreshCredential) -> Result<(), StoreError> {
            Err(locked())
        }

        fn delete(&self) -> Result<(), StoreError> {
            self.saved.delete()
        }
    }

    /// Exchange that counts calls and, when gated, holds until released
    struct FakeExchange {
        calls: AtomicUsize,
        gate: Option<Arc<Notify>>,
        outcome: Result<RefreshGrant, RefreshError>,
    }

    impl FakeExchange {
        fn new(outcome: Result<RefreshGrant, RefreshError>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                gate: None,
                outcome,
            }
        }

        fn gated(outcome: Result<RefreshGrant, RefreshError>, gate: Arc<Notify>) -> Self {
            Self {
                gate: Some(gate),
                ..Self::new(outcome)
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RefreshExchange for FakeExchange {
        async fn exchange(&self, _refresh: &RefreshCredential) -> Result<RefreshGrant, RefreshError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(ref gate) = self.gate {
                gate.notified().await;
            }
            self.outcome.clone()
        }
    }

    fn grant(access: &str, refresh: Option<&str>) -> Result<RefreshGrant, RefreshError> {
        Ok(RefreshGrant {
            access: AccessCredential::new(access),
            refresh: refresh.map(RefreshCredential::new),
        })
    }

    fn store_with(access: Option<&str>, refresh: Option<&str>) -> Arc<CredentialStore> {
        let slot = match refresh {
            Some(token) => MemorySlot::with_refresh(RefreshCredential::new(token)),
            None => MemorySlot::new(),
        };
        let store = CredentialStore::new(Box::new(slot));
        store.set_access(access.map(AccessCredential::new));
        Arc::new(store)
    }

    fn session_counter(coordinator: &Coordinator) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let observed = Arc::clone(&count);
        coordinator.subscribe(Arc::new(move |_: SessionEnded| {
            observed.fetch_add(1, Ordering::SeqCst);
        }));
        count
    }

    async fn wait_for_pending(coordinator: &Coordinator, expected: usize) {
        for _ in 0..200 {
            if coordinator.pending_len() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!(
            "expected {} pending requests, found {}",
            expected,
            coordinator.pending_len()
        );
    }

    fn spawn_callers(
        coordinator: &Coordinator,
        count: usize,
    ) -> Vec<tokio::task::JoinHandle<Outcome>> {
        (0..count)
            .map(|_| {
                let coordinator = coordinator.clone();
                tokio::spawn(async move { coordinator.ensure_fresh_credential().await })
            })
            .collect()
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_exchange() {
        let gate = Arc::new(Notify::new());
        let exchange = Arc::new(FakeExchange::gated(grant("A2", Some("R2")), Arc::clone(&gate)));
        let store = store_with(Some("A1"), Some("R1"));
        let coordinator = Coordinator::new(Arc::clone(&store), exchange.clone());
        let ended = session_counter(&coordinator);

        let callers = spawn_callers(&coordinator, 8);
        wait_for_pending(&coordinator, 8).await;
        assert_eq!(coordinator.state(), RefreshState::Refreshing);

        gate.notify_one();
        for outcome in join_all(callers).await {
            assert_eq!(outcome.unwrap().unwrap(), AccessCredential::new("A2"));
        }

        assert_eq!(exchange.calls(), 1);
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(coordinator.pending_len(), 0);
        assert_eq!(store.get_access(), Some(AccessCredential::new("A2")));
        assert_eq!(store.get_refresh().unwrap(), Some(RefreshCredential::new("R2")));
        assert_eq!(ended.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_refresh_without_rotation_keeps_refresh_credential() {
        let exchange = Arc::new(FakeExchange::new(grant("A2", None)));
        let store = store_with(None, Some("R1"));
        let coordinator = Coordinator::new(Arc::clone(&store), exchange);

        let access = coordinator.ensure_fresh_credential().await.unwrap();

        assert_eq!(access, AccessCredential::new("A2"));
        assert_eq!(store.get_refresh().unwrap(), Some(RefreshCredential::new("R1")));
    }

    #[tokio::test]
    async fn test_failed_exchange_rejects_everyone_and_ends_session_once() {
        let gate = Arc::new(Notify::new());
        let exchange = Arc::new(FakeExchange::gated(
            Err(RefreshError::Invalid("token_not_valid".into())),
            Arc::clone(&gate),
        ));
        let store = store_with(Some("A1"), Some("R1"));
        let coordinator = Coordinator::new(Arc::clone(&store), exchange.clone());
        let ended = session_counter(&coordinator);

        let callers = spawn_callers(&coordinator, 4);
        wait_for_pending(&coordinator, 4).await;
        gate.notify_one();

        for outcome in join_all(callers).await {
            assert_eq!(
                outcome.unwrap(),
                Err(RefreshError::Invalid("token_not_valid".into()))
            );
        }

        assert_eq!(exchange.calls(), 1);
        assert!(store.get_access().is_none());
        assert!(store.get_refresh().unwrap().is_none());
        assert_eq!(ended.load(Ordering::SeqCst), 1);

        // Nothing left to refresh with
        assert_eq!(
            coordinator.ensure_fresh_credential().await,
            Err(RefreshError::Missing)
        );
        assert_eq!(exchange.calls(), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_late_rejection_after_failed_refresh_gets_same_error() {
        let exchange = Arc::new(FakeExchange::new(Err(RefreshError::Invalid(
            "token_not_valid".into(),
        ))));
        let coordinator = Coordinator::new(store_with(Some("A1"), Some("R1")), exchange.clone());
        let ended = session_counter(&coordinator);
        let stale = AccessCredential::new("A1");

        let first = coordinator
            .ensure_fresh_credential_after("GET /api/foro/reportes/me/", Some(&stale))
            .await;
        let second = coordinator
            .ensure_fresh_credential_after("GET /api/foro/notificaciones/", Some(&stale))
            .await;

        assert_eq!(first, Err(RefreshError::Invalid("token_not_valid".into())));
        assert_eq!(first, second);
        assert_eq!(exchange.calls(), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 1);

        // A login replaces the failed session; its credential gets a real refresh
        coordinator
            .begin_session(AccessCredential::new("L1"), RefreshCredential::new("LR1"))
            .unwrap();
        let login = AccessCredential::new("L1");
        assert!(coordinator
            .ensure_fresh_credential_after("GET /api/usuario/perfil/", Some(&login))
            .await
            .is_err());
        assert_eq!(exchange.calls(), 2);
        assert_eq!(ended.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unreadable_slot_is_missing_without_exchange() {
        let exchange = Arc::new(FakeExchange::new(grant("A2", None)));
        let slot = FailingSlot {
            load_fails: true,
            saved: MemorySlot::new(),
        };
        let store = Arc::new(CredentialStore::new(Box::new(slot)));
        store.set_access(Some(AccessCredential::new("A1")));
        let coordinator = Coordinator::new(Arc::clone(&store), exchange.clone());
        let ended = session_counter(&coordinator);

        assert_eq!(
            coordinator.ensure_fresh_credential().await,
            Err(RefreshError::Missing)
        );
        assert_eq!(exchange.calls(), 0);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert!(store.get_access().is_none());
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn test_unsaved_rotation_still_refreshes() {
        let exchange = Arc::new(FakeExchange::new(grant("A2", Some("R2"))));
        let slot = FailingSlot {
            load_fails: false,
            saved: MemorySlot::with_refresh(RefreshCredential::new("R1")),
        };
        let store = Arc::new(CredentialStore::new(Box::new(slot)));
        let coordinator = Coordinator::new(Arc::clone(&store), exchange.clone());
        let ended = session_counter(&coordinator);

        let access = coordinator.ensure_fresh_credential().await.unwrap();

        assert_eq!(access, AccessCredential::new("A2"));
        assert_eq!(store.get_access(), Some(AccessCredential::new("A2")));
        // The rotated credential could not be written; the old one remains
        assert_eq!(store.get_refresh().unwrap(), Some(RefreshCredential::new("R1")));
        assert_eq!(exchange.calls(), 1);
        assert_eq!(ended.load(Ordering::SeqCst), 0);
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[test]
    fn test_slot_write_does_not_hold_state_lock() {
        let (entered_tx, entered_rx) = std::sync::mpsc::sync_channel(1);
        let (release_tx, release_rx) = std::sync::mpsc::channel();
        let slot = SlowSlot {
            entered: entered_tx,
            release: Mutex::new(release_rx),
            saved: MemorySlot::new(),
        };
        let store = Arc::new(CredentialStore::new(Box::new(slot)));
        let coordinator = Coordinator::new(
            Arc::clone(&store),
            Arc::new(FakeExchange::new(grant("A2", None))),
        );

        let login = {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || {
                coordinator.begin_session(AccessCredential::new("L1"), RefreshCredential::new("LR1"))
            })
        };
        entered_rx.recv_timeout(Duration::from_secs(5)).unwrap();

        // The login is stuck in the keychain write; a request rejected with
        // an older credential still gets the login credential right away
        let (seen_tx, seen_rx) = std::sync::mpsc::channel();
        {
            let coordinator = coordinator.clone();
            std::thread::spawn(move || {
                let stale = AccessCredential::new("A1");
                let access = futures::executor::block_on(
                    coordinator.ensure_fresh_credential_after("GET /api/rutas/", Some(&stale)),
                );
                let _ = seen_tx.send((coordinator.state(), access));
            });
        }
        let (state, access) = seen_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(state, RefreshState::Idle);
        assert_eq!(access, Ok(AccessCredential::new("L1")));

        release_tx.send(()).unwrap();
        login.join().unwrap().unwrap();
        assert_eq!(store.get_refresh().unwrap(), Some(RefreshCredential::new("LR1")));
    }

    #[tokio::test]
    async fn test_missing_refresh_fails_without_exchange() {
        let exchange = Arc::new(FakeExchange::new(grant("A2", None)));
        let coordinator = Coordinator::new(store_with(None, None), exchange.clone());
        let ended = session_counter(&coordinator);

        let outcomes = join_all((0..5).map(|_| coordinator.ensure_fresh_credential())).await;

        for outcome in outcomes {
            assert_eq!(outcome, Err(RefreshError::Missing));
        }
        assert_eq!(exchange.calls(), 0);
        assert_eq!(ended.load(Ordering::SeqCst), 1);
        assert_eq!(coordinator.state(), RefreshState::Idle);
    }

    #[tokio::test]
    async fn test_login_rearms_session_event() {
        let exchange = Arc::new(FakeExchange::new(Err(RefreshError::ServerError(
            "Status 500".into(),
        ))));
        let coordinator = Coordinator::new(store_with(None, Some("R1")), exchange);
        let ended = session_counter(&coordinator);

        assert!(coordinator.ensure_fresh_credential().await.is_err());
        assert_eq!(ended.load(Ordering::SeqCst), 1);

        coordinator
            .begin_session(AccessCredential::new("A1"), RefreshCredential::new("R1"))
            .unwrap();
        assert!(coordinator.ensure_fresh_credential().await.is_err());
        assert_eq!(ended.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_rotated_credential_skips_exchange() {
        let exchange = Arc::new(FakeExchange::new(grant("A3", None)));
        let coordinator = Coordinator::new(store_with(Some("A2"), Some("R2")), exchange.clone());

        let stale = AccessCredential::new("A1");
        let access = coordinator
            .ensure_fresh_credential_after("GET /api/reports/", Some(&stale))
            .await
            .unwrap();
        assert_eq!(access, AccessCredential::new("A2"));
        assert_eq!(exchange.calls(), 0);

        // The current credential itself was rejected, so a refresh is needed
        let current = AccessCredential::new("A2");
        let access = coordinator
            .ensure_fresh_credential_after("GET /api/reports/", Some(&current))
            .await
            .unwrap();
        assert_eq!(access, AccessCredential::new("A3"));
        assert_eq!(exchange.calls(), 1);
    }

    #[tokio::test]
    async fn test_cancelled_waiter_leaves_queue() {
        let gate = Arc::new(Notify::new());
        let exchange = Arc::new(FakeExchange::gated(grant("A2", None), Arc::clone(&gate)));
        let coordinator = Coordinator::new(store_with(None, Some("R1")), exchange.clone());

        let leader = spawn_callers(&coordinator, 1).remove(0);
        wait_for_pending(&coordinator, 1).await;

        let impatient = tokio::time::timeout(
            Duration::from_millis(10),
            coordinator.ensure_fresh_credential(),
        )
        .await;
        assert!(impatient.is_err());
        assert_eq!(coordinator.pending_len(), 1);

        gate.notify_one();
        assert_eq!(leader.await.unwrap().unwrap(), AccessCredential::new("A2"));
        assert_eq!(exchange.calls(), 1);
        assert_eq!(coordinator.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_leader_does_not_strand_refresh() {
        let gate = Arc::new(Notify::new());
        let exchange = Arc::new(FakeExchange::gated(grant("A2", None), Arc::clone(&gate)));
        let store = store_with(None, Some("R1"));
        let coordinator = Coordinator::new(Arc::clone(&store), exchange.clone());

        let leader = tokio::time::timeout(
            Duration::from_millis(10),
            coordinator.ensure_fresh_credential(),
        )
        .await;
        assert!(leader.is_err());
        assert_eq!(coordinator.state(), RefreshState::Refreshing);

        let follower = spawn_callers(&coordinator, 1).remove(0);
        wait_for_pending(&coordinator, 1).await;
        gate.notify_one();

        assert_eq!(follower.await.unwrap().unwrap(), AccessCredential::new("A2"));
        assert_eq!(exchange.calls(), 1);
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert_eq!(store.get_access(), Some(AccessCredential::new("A2")));
    }

    #[tokio::test]
    async fn test_logout_during_refresh_clears_and_idles() {
        let gate = Arc::new(Notify::new());
        let exchange = Arc::new(FakeExchange::gated(grant("A2", Some("R2")), Arc::clone(&gate)));
        let store = store_with(Some("A1"), Some("R1"));
        let coordinator = Coordinator::new(Arc::clone(&store), exchange.clone());
        let ended = session_counter(&coordinator);

        let callers = spawn_callers(&coordinator, 2);
        wait_for_pending(&coordinator, 2).await;

        coordinator.end_session().unwrap();
        assert_eq!(coordinator.state(), RefreshState::Idle);
        for outcome in join_all(callers).await {
            assert_eq!(outcome.unwrap(), Err(RefreshError::Missing));
        }

        // The abandoned exchange completes but must not resurrect the session
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(exchange.calls(), 1);
        assert_eq!(coordinator.state(), RefreshState::Idle);
        assert!(store.get_access().is_none());
        assert!(store.get_refresh().unwrap().is_none());
        assert_eq!(ended.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_login_during_refresh_resolves_waiters_with_login_credential() {
        let gate = Arc::new(Notify::new());
        let exchange = Arc::new(FakeExchange::gated(
            Err(RefreshError::Invalid("expired".into())),
            Arc::clone(&gate),
        ));
        let store = store_with(None, Some("R1"));
        let coordinator = Coordinator::new(Arc::clone(&store), exchange.clone());
        let ended = session_counter(&coordinator);

        let callers = spawn_callers(&coordinator, 3);
        wait_for_pending(&coordinator, 3).await;

        coordinator
            .begin_session(AccessCredential::new("L1"), RefreshCredential::new("LR1"))
            .unwrap();
        for outcome in join_all(callers).await {
            assert_eq!(outcome.unwrap().unwrap(), AccessCredential::new("L1"));
        }

        // The late failure belongs to the abandoned cycle and is ignored
        gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(store.get_access(), Some(AccessCredential::new("L1")));
        assert_eq!(store.get_refresh().unwrap(), Some(RefreshCredential::new("LR1")));
        assert_eq!(ended.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_queue_drains_in_arrival_order() {
        let gate = Arc::new(Notify::new());
        let exchange = Arc::new(FakeExchange::gated(grant("A2", None), Arc::clone(&gate)));
        let coordinator = Coordinator::new(store_with(None, Some("R1")), exchange);

        let order = Arc::new(Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for index in 0..5 {
            let caller = coordinator.clone();
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let outcome = caller.ensure_fresh_credential().await;
                order.lock().push(index);
                outcome
            }));
            wait_for_pending(&coordinator, index + 1).await;
        }

        gate.notify_one();
        for outcome in join_all(handles).await {
            assert!(outcome.unwrap().is_ok());
        }
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
    }
}
