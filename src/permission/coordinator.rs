use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{Notify, broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::cache::{PermissionCache, SubscriptionId, TransitionHandler};
use super::types::{
    ApprovalSession, ApprovalStatus, CoordinatorEvent, CoordinatorState, RetryChoice,
    SessionStatus, TransitionEvent, TransitionKind,
};
use super::ui_trait::{
    ApprovalResponder, ApprovalUI, PrivilegedLauncher, ProcessHandle, RetryPrompter,
    SessionSignal,
};
use crate::store::{FlagStore, WatchCallback};

const EVENT_CHANNEL_SIZE: usize = 16;

const REVOKED_WARNING: &str =
    "Privileged mode permission was revoked. Approval is required again.";

/// How a single approval session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowOutcome {
    Granted,
    Cancelled,
    /// Replaced by a newer session or ended by `dispose`. The user was not asked.
    Superseded,
}

struct ActiveSession {
    id: u64,
    signals: mpsc::UnboundedSender<SessionSignal>,
    process: Option<Box<dyn ProcessHandle>>,
}

struct Inner {
    store: Arc<dyn FlagStore>,
    cache: Arc<PermissionCache>,
    ui: Arc<dyn ApprovalUI>,
    launcher: Arc<dyn PrivilegedLauncher>,
    prompter: Arc<dyn RetryPrompter>,
    state: Mutex<CoordinatorState>,
    session: Mutex<Option<ActiveSession>>,
    next_session_id: AtomicU64,
    events: broadcast::Sender<CoordinatorEvent>,
    subscription: Mutex<Option<SubscriptionId>>,
    refresh_task: Mutex<Option<JoinHandle<()>>>,
    reapproval_task: Mutex<Option<JoinHandle<()>>>,
    approval_loop_active: AtomicBool,
    loop_finished: Notify,
    watch_failure_logged: AtomicBool,
    disposed: AtomicBool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(task) = self.refresh_task.get_mut().take() {
            task.abort();
        }
    }
}

/// Marks an approval loop as running for as long as it is alive.
struct ApprovalLoopGuard {
    inner: Arc<Inner>,
}

impl ApprovalLoopGuard {
    fn enter(inner: &Arc<Inner>) -> Option<Self> {
        inner
            .approval_loop_active
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .ok()
            .map(|_| Self {
                inner: Arc::clone(inner),
            })
    }
}

impl Drop for ApprovalLoopGuard {
    fn drop(&mut self) {
        self.inner
            .approval_loop_active
            .store(false, Ordering::SeqCst);
        self.inner.loop_finished.notify_waiters();
    }
}

struct TransitionRelay {
    coordinator: Weak<Inner>,
}

impl TransitionHandler for TransitionRelay {
    fn handle(&self, event: TransitionEvent) {
        if let Some(inner) = self.coordinator.upgrade() {
            PermissionCoordinator { inner }.on_transition(event);
        }
    }
}

/// Drives the approval workflow around the cached permission flag.
///
/// Two paths can set the flag: an explicit accept in the approval UI, and
/// an outside edit of the settings file picked up by the store's poll. Both
/// end in a cache refresh, and the cache's transition events are what move
/// the coordinator. Only one approval session owns the UI and the launched
/// process at a time; each session is torn down exactly once.
#[derive(Clone)]
pub struct PermissionCoordinator {
    inner: Arc<Inner>,
}

impl PermissionCoordinator {
    #[must_use]
    pub fn new(
        store: Arc<dyn FlagStore>,
        ui: Arc<dyn ApprovalUI>,
        launcher: Arc<dyn PrivilegedLauncher>,
        prompter: Arc<dyn RetryPrompter>,
    ) -> Self {
        let cache = Arc::new(PermissionCache::new(Arc::clone(&store)));
        let (events, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        let inner = Arc::new(Inner {
            store,
            cache,
            ui,
            launcher,
            prompter,
            state: Mutex::new(CoordinatorState::Uninitialized),
            session: Mutex::new(None),
            next_session_id: AtomicU64::new(1),
            events,
            subscription: Mutex::new(None),
            refresh_task: Mutex::new(None),
            reapproval_task: Mutex::new(None),
            approval_loop_active: AtomicBool::new(false),
            loop_finished: Notify::new(),
            watch_failure_logged: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        });

        let relay = Arc::new(TransitionRelay {
            coordinator: Arc::downgrade(&inner),
        });
        let subscription = inner.cache.subscribe(relay);
        *inner.subscription.lock() = Some(subscription);

        Self { inner }
    }

    /// Starts watching the settings file and makes sure permission is
    /// granted, running the approval loop if it is not. Returns `true` once
    /// granted, `false` if the user abandoned or opted out.
    ///
    /// If an approval loop is already running (for example one restarted by a
    /// revocation) this waits for it instead of starting a second one.
    pub async fn initialize_permissions(&self) -> bool {
        if self.is_disposed() {
            debug!("Coordinator disposed, skipping initialization");
            return self.inner.cache.peek() == Some(true);
        }
        if self.inner.approval_loop_active.load(Ordering::SeqCst) {
            debug!("Approval loop already running, waiting for its outcome");
            return self.wait_for_approval_loop().await;
        }
        self.set_state(CoordinatorState::Checking);

        // Watch even when already granted: the flag can be revoked later.
        self.start_watch();

        if self.inner.cache.refresh_and_get().await {
            info!("Privileged mode already permitted");
            self.set_state(CoordinatorState::Granted);
            return true;
        }

        let Some(_guard) = ApprovalLoopGuard::enter(&self.inner) else {
            debug!("Approval loop started concurrently, waiting for its outcome");
            return self.wait_for_approval_loop().await;
        };
        self.set_state(CoordinatorState::NotGranted);
        self.run_approval_loop().await
    }

    /// Cheap check for the hot path. Only the very first call reads the file.
    pub async fn check_permission(&self) -> bool {
        self.inner.cache.get().await
    }

    pub async fn grant_permission(&self) -> bool {
        if let Err(e) = self.inner.store.write(true).await {
            warn!(
                operation = "grant_permission",
                new = true,
                error = %e,
                "Failed to save permission flag"
            );
            return false;
        }

        let granted = self.inner.cache.refresh_and_get().await;
        if granted {
            self.set_state(CoordinatorState::Granted);
        } else {
            warn!(
                operation = "grant_permission",
                "Permission flag was cleared again right after it was saved"
            );
        }
        granted
    }

    /// Opens the approval UI together with the privileged process and waits
    /// for the session to resolve. Any session already open is superseded.
    /// Returns `true` only when the session ended in a grant.
    pub async fn show_approval_flow(&self) -> bool {
        self.run_session().await == FlowOutcome::Granted
    }

    async fn run_session(&self) -> FlowOutcome {
        let (signals, mut signal_rx) = mpsc::unbounded_channel();
        let id = self.inner.next_session_id.fetch_add(1, Ordering::SeqCst);

        // Checked under the slot lock so `dispose` either sees this session or
        // this session sees the disposal.
        let installed = {
            let mut slot = self.inner.session.lock();
            if self.is_disposed() {
                None
            } else {
                Some(slot.replace(ActiveSession {
                    id,
                    signals: signals.clone(),
                    process: None,
                }))
            }
        };
        let Some(previous) = installed else {
            debug!(session = id, "Coordinator disposed, not opening an approval session");
            return FlowOutcome::Superseded;
        };
        if let Some(previous) = previous {
            info!(session = id, superseded = previous.id, "Superseding approval session");
            let _ = previous.signals.send(SessionSignal::Terminated);
            self.release(previous);
        }
        self.set_state(CoordinatorState::AwaitingApproval);

        match self.inner.launcher.launch_visible() {
            Ok(process) => self.attach_process(id, process),
            Err(e) => warn!(
                session = id,
                error = %e,
                "Failed to launch privileged process, continuing with the approval UI only"
            ),
        }

        if let Err(e) = self.inner.ui.show(ApprovalResponder::new(signals)) {
            warn!(session = id, error = %e, "Approval UI unavailable, treating as cancel");
            self.teardown(id);
            self.set_state(CoordinatorState::Cancelled);
            return FlowOutcome::Cancelled;
        }

        if self.is_disposed() {
            self.inner.ui.close();
            return FlowOutcome::Superseded;
        }

        // A grant observed before this session existed will not be reported again.
        if self.inner.cache.peek() == Some(true) {
            info!(session = id, "Permission already granted, closing approval session");
            self.teardown(id);
            self.set_state(CoordinatorState::Granted);
            return FlowOutcome::Granted;
        }

        while let Some(signal) = signal_rx.recv().await {
            match signal {
                SessionSignal::Accept(reply) => {
                    self.inner.ui.set_status(ApprovalStatus::Verifying);
                    let granted = self.grant_permission().await;
                    let _ = reply.send(granted);

                    if granted {
                        info!(session = id, "Approval accepted");
                        self.teardown(id);
                        self.set_state(CoordinatorState::Granted);
                        return FlowOutcome::Granted;
                    }
                    self.inner.ui.set_status(ApprovalStatus::Failed);
                }
                SessionSignal::Cancel => {
                    info!(session = id, "Approval cancelled");
                    self.teardown(id);
                    self.set_state(CoordinatorState::Cancelled);
                    return FlowOutcome::Cancelled;
                }
                SessionSignal::Dismiss => {
                    info!(session = id, "Approval UI closed without a choice");
                    self.teardown(id);
                    self.set_state(CoordinatorState::Cancelled);
                    return FlowOutcome::Cancelled;
                }
                SessionSignal::ExternalGrant => {
                    info!(session = id, "Permission granted outside the approval UI");
                    self.teardown(id);
                    self.set_state(CoordinatorState::Granted);
                    return FlowOutcome::Granted;
                }
                SessionSignal::Terminated => {
                    debug!(session = id, "Approval session terminated");
                    return FlowOutcome::Superseded;
                }
            }
        }

        self.teardown(id);
        FlowOutcome::Superseded
    }

    #[must_use]
    pub fn state(&self) -> CoordinatorState {
        *self.inner.state.lock()
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.inner.events.subscribe()
    }

    #[must_use]
    pub fn cache(&self) -> &Arc<PermissionCache> {
        &self.inner.cache
    }

    #[must_use]
    pub fn has_active_session(&self) -> bool {
        self.inner.session.lock().is_some()
    }

    /// Stops the watch, closes any open session and detaches from the cache.
    pub fn dispose(&self) {
        self.inner.disposed.store(true, Ordering::SeqCst);
        self.inner.store.dispose();

        let refresh_task = self.inner.refresh_task.lock().take();
        if let Some(task) = refresh_task {
            task.abort();
        }
        let reapproval_task = self.inner.reapproval_task.lock().take();
        if let Some(task) = reapproval_task {
            task.abort();
        }

        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            let _ = session.signals.send(SessionSignal::Terminated);
            self.release(session);
        }

        let subscription = self.inner.subscription.lock().take();
        if let Some(id) = subscription {
            self.inner.cache.unsubscribe(id);
        }
        debug!("Permission coordinator disposed");
    }

    async fn run_approval_loop(&self) -> bool {
        let mut session = ApprovalSession::new();

        loop {
            session.begin_attempt();
            debug!(attempt = session.attempts, "Starting approval attempt");

            match self.run_session().await {
                FlowOutcome::Granted => {
                    session.finish(SessionStatus::Granted);
                    info!(
                        attempts = session.attempts,
                        status = %session.status,
                        "Privileged mode approved"
                    );
                    return true;
                }
                FlowOutcome::Superseded => {
                    // Whoever replaced the session owns the outcome now.
                    session.finish(SessionStatus::Superseded);
                    info!(
                        attempts = session.attempts,
                        status = %session.status,
                        "Approval loop ended without asking again"
                    );
                    return false;
                }
                FlowOutcome::Cancelled => session.finish(SessionStatus::Cancelled),
            }

            if self.inner.cache.refresh_and_get().await {
                session.finish(SessionStatus::Granted);
                self.set_state(CoordinatorState::Granted);
                info!(
                    attempts = session.attempts,
                    status = %session.status,
                    "Permission granted between attempts"
                );
                return true;
            }

            match self.inner.prompter.choose(session.attempts).await {
                RetryChoice::Retry => {}
                RetryChoice::Abandon => {
                    session.finish(SessionStatus::GaveUp);
                    self.set_state(CoordinatorState::GaveUp);
                    info!(
                        attempts = session.attempts,
                        status = %session.status,
                        "Privileged mode approval abandoned"
                    );
                    return false;
                }
                RetryChoice::OptOut => {
                    session.finish(SessionStatus::GaveUp);
                    self.set_state(CoordinatorState::GaveUp);
                    info!(
                        attempts = session.attempts,
                        status = %session.status,
                        "User opted out of privileged mode"
                    );
                    let _ = self.inner.events.send(CoordinatorEvent::OptedOut);
                    return false;
                }
            }
        }
    }

    /// Waits until the running approval loop has finished and reports the
    /// flag it left behind.
    async fn wait_for_approval_loop(&self) -> bool {
        loop {
            let finished = self.inner.loop_finished.notified();
            tokio::pin!(finished);
            finished.as_mut().enable();
            if !self.inner.approval_loop_active.load(Ordering::SeqCst) {
                break;
            }
            finished.await;
        }

        let granted = self.inner.cache.refresh_and_get().await;
        if granted {
            self.set_state(CoordinatorState::Granted);
        }
        granted
    }

    fn start_watch(&self) {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();
        let callback: WatchCallback = Arc::new(move || {
            let _ = tx.send(());
        });

        if let Err(e) = self.inner.store.watch(callback) {
            if self.inner.watch_failure_logged.swap(true, Ordering::SeqCst) {
                debug!(error = %e, "File watch still unavailable");
            } else {
                warn!(
                    error = %e,
                    "File watch unavailable, outside permission changes will only be seen on explicit checks"
                );
            }
            return;
        }

        let cache = Arc::clone(&self.inner.cache);
        let task = tokio::spawn(async move {
            while rx.recv().await.is_some() {
                cache.refresh().await;
            }
        });

        let previous = self.inner.refresh_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn on_transition(&self, event: TransitionEvent) {
        match event.kind() {
            TransitionKind::Granted => {
                let delivered = self
                    .inner
                    .session
                    .lock()
                    .as_ref()
                    .is_some_and(|s| s.signals.send(SessionSignal::ExternalGrant).is_ok());

                if !delivered {
                    info!("Permission granted while no approval session was open");
                    self.set_state(CoordinatorState::Granted);
                    let _ = self.inner.events.send(CoordinatorEvent::PermissionGranted);
                }
            }
            TransitionKind::Revoked => {
                warn!(from = event.from, to = event.to, "Privileged mode permission revoked");
                self.set_state(CoordinatorState::NotGranted);
                let _ = self.inner.events.send(CoordinatorEvent::PermissionRevoked);
                self.inner.prompter.warn(REVOKED_WARNING);
                self.spawn_reapproval();
            }
        }
    }

    fn spawn_reapproval(&self) {
        if self.is_disposed() {
            return;
        }
        if self.has_active_session() {
            debug!("Approval session already open, not starting another");
            return;
        }
        let Some(guard) = ApprovalLoopGuard::enter(&self.inner) else {
            debug!("Approval loop already running");
            return;
        };
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!("No async runtime available to restart approval");
            return;
        };

        let coordinator = self.clone();
        let task = runtime.spawn(async move {
            let _guard = guard;
            if coordinator.run_approval_loop().await {
                let _ = coordinator
                    .inner
                    .events
                    .send(CoordinatorEvent::PermissionGranted);
            }
        });

        let previous = self.inner.reapproval_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    fn attach_process(&self, id: u64, process: Box<dyn ProcessHandle>) {
        let orphan = {
            let mut slot = self.inner.session.lock();
            match slot.as_mut() {
                Some(session) if session.id == id => {
                    session.process = Some(process);
                    None
                }
                _ => Some(process),
            }
        };
        if let Some(mut process) = orphan {
            process.dispose();
        }
    }

    fn teardown(&self, id: u64) {
        let session = {
            let mut slot = self.inner.session.lock();
            if slot.as_ref().is_some_and(|s| s.id == id) {
                slot.take()
            } else {
                None
            }
        };
        if let Some(session) = session {
            self.release(session);
        }
    }

    fn release(&self, mut session: ActiveSession) {
        self.inner.ui.close();
        if let Some(mut process) = session.process.take() {
            process.dispose();
        }
        debug!(session = session.id, "Approval session torn down");
    }

    fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    fn set_state(&self, next: CoordinatorState) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), next);
        if previous != next {
            debug!(from = %previous, to = %next, "Coordinator state changed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::test_utils::{
        RecordingLauncher, ScriptedApprovalUI, ScriptedPrompter, UiAction,
    };
    use crate::store::test_utils::MemoryStore;
    use std::time::Duration;

    struct Harness {
        coordinator: PermissionCoordinator,
        store: Arc<MemoryStore>,
        ui: Arc<ScriptedApprovalUI>,
        launcher: Arc<RecordingLauncher>,
        prompter: Arc<ScriptedPrompter>,
    }

    fn harness(
        store: MemoryStore,
        script: impl IntoIterator<Item = UiAction>,
        choices: impl IntoIterator<Item = RetryChoice>,
    ) -> Harness {
        harness_with_launcher(store, script, choices, RecordingLauncher::new())
    }

    fn harness_with_launcher(
        store: MemoryStore,
        script: impl IntoIterator<Item = UiAction>,
        choices: impl IntoIterator<Item = RetryChoice>,
        launcher: RecordingLauncher,
    ) -> Harness {
        let store = Arc::new(store);
        let ui = Arc::new(ScriptedApprovalUI::new(script));
        let launcher = Arc::new(launcher);
        let prompter = Arc::new(ScriptedPrompter::new(choices));
        let coordinator = PermissionCoordinator::new(
            store.clone(),
            ui.clone(),
            launcher.clone(),
            prompter.clone(),
        );
        Harness {
            coordinator,
            store,
            ui,
            launcher,
            prompter,
        }
    }

    async fn wait_until(condition: impl Fn() -> bool) {
        tokio::time::timeout(Duration::from_secs(2), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_initialize_already_granted() {
        let h = harness(MemoryStore::new(true), [], []);

        assert!(h.coordinator.initialize_permissions().await);
        assert_eq!(h.coordinator.state(), CoordinatorState::Granted);
        assert!(h.store.is_watching());
        assert_eq!(h.ui.shows(), 0);
        assert_eq!(h.launcher.launches(), 0);
    }

    #[tokio::test]
    async fn test_initialize_accept() {
        let h = harness(MemoryStore::new(false), [UiAction::Accept], []);

        assert!(h.coordinator.initialize_permissions().await);
        assert!(h.store.read().await);
        assert_eq!(h.coordinator.state(), CoordinatorState::Granted);

        wait_until(|| !h.ui.accept_results().is_empty()).await;
        assert_eq!(h.ui.accept_results(), vec![true]);
        assert_eq!(h.ui.statuses(), vec![ApprovalStatus::Verifying]);
        assert_eq!(h.ui.closes(), 1);
        assert_eq!(h.launcher.launches(), 1);
        assert_eq!(h.launcher.disposals(), 1);
        assert!(h.prompter.asked().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_retry_then_accept() {
        let h = harness(
            MemoryStore::new(false),
            [UiAction::Cancel, UiAction::Accept],
            [RetryChoice::Retry],
        );

        assert!(h.coordinator.initialize_permissions().await);
        assert_eq!(h.prompter.asked(), vec![1]);
        assert_eq!(h.ui.shows(), 2);
        assert_eq!(h.ui.closes(), 2);
        assert_eq!(h.launcher.launches(), 2);
        assert_eq!(h.launcher.disposals(), 2);
    }

    #[tokio::test]
    async fn test_cancel_then_abandon() {
        let h = harness(
            MemoryStore::new(false),
            [UiAction::Cancel, UiAction::Dismiss],
            [RetryChoice::Retry, RetryChoice::Abandon],
        );

        assert!(!h.coordinator.initialize_permissions().await);
        assert_eq!(h.prompter.asked(), vec![1, 2]);
        assert_eq!(h.coordinator.state(), CoordinatorState::GaveUp);
        assert!(!h.store.read().await);
        assert_eq!(h.launcher.disposals(), 2);
        assert!(!h.coordinator.has_active_session());
    }

    #[tokio::test]
    async fn test_opt_out_notifies_consumers() {
        let h = harness(
            MemoryStore::new(false),
            [UiAction::Dismiss],
            [RetryChoice::OptOut],
        );
        let mut events = h.coordinator.subscribe();

        assert!(!h.coordinator.initialize_permissions().await);
        assert_eq!(events.try_recv().unwrap(), CoordinatorEvent::OptedOut);
    }

    #[tokio::test]
    async fn test_ui_unavailable_is_cancel() {
        let h = harness(MemoryStore::new(false), [UiAction::Unavailable], []);

        assert!(!h.coordinator.initialize_permissions().await);
        assert_eq!(h.ui.shows(), 0);
        assert_eq!(h.ui.closes(), 1);
        assert_eq!(h.launcher.launches(), 1);
        assert_eq!(h.launcher.disposals(), 1);
        assert_eq!(h.prompter.asked(), vec![1]);
    }

    #[tokio::test]
    async fn test_launcher_failure_keeps_ui() {
        let h = harness_with_launcher(
            MemoryStore::new(false),
            [UiAction::Accept],
            [],
            RecordingLauncher::failing(),
        );

        assert!(h.coordinator.initialize_permissions().await);
        assert_eq!(h.ui.shows(), 1);
        assert_eq!(h.ui.closes(), 1);
    }

    #[tokio::test]
    async fn test_grant_on_empty_store() {
        let h = harness(MemoryStore::new(false), [], []);
        let mut events = h.coordinator.subscribe();

        assert!(h.coordinator.grant_permission().await);
        assert!(h.store.read().await);
        assert!(h.coordinator.check_permission().await);
        assert!(events.try_recv().is_err());
        assert_eq!(h.ui.shows(), 0);
    }

    #[tokio::test]
    async fn test_grant_write_failure() {
        let h = harness(MemoryStore::new(false), [], []);
        assert!(!h.coordinator.check_permission().await);
        h.store.set_fail_writes(true);

        assert!(!h.coordinator.grant_permission().await);
        assert_eq!(h.coordinator.cache().peek(), Some(false));
        assert_eq!(h.store.writes(), 0);
    }

    #[tokio::test]
    async fn test_check_permission_reads_once() {
        let h = harness(MemoryStore::new(true), [], []);

        for _ in 0..4 {
            assert!(h.coordinator.check_permission().await);
        }
        assert_eq!(h.store.reads(), 1);
    }

    #[tokio::test]
    async fn test_external_grant_closes_open_session() {
        let h = harness(MemoryStore::new(false), [UiAction::Hold], []);

        let coordinator = h.coordinator.clone();
        let init = tokio::spawn(async move { coordinator.initialize_permissions().await });
        wait_until(|| h.ui.shows() == 1).await;
        assert_eq!(h.coordinator.state(), CoordinatorState::AwaitingApproval);

        h.store.set(true);
        assert!(h.store.trigger_watch());

        let granted = tokio::time::timeout(Duration::from_secs(2), init)
            .await
            .unwrap()
            .unwrap();
        assert!(granted);
        assert_eq!(h.ui.closes(), 1);
        assert_eq!(h.launcher.disposals(), 1);
        assert!(h.ui.accept_results().is_empty());
        assert!(!h.coordinator.has_active_session());
    }

    #[tokio::test]
    async fn test_show_flow_resolves_on_refresh_grant() {
        let h = harness(MemoryStore::new(false), [UiAction::Hold], []);
        assert!(!h.coordinator.check_permission().await);

        let coordinator = h.coordinator.clone();
        let flow = tokio::spawn(async move { coordinator.show_approval_flow().await });
        wait_until(|| h.ui.shows() == 1).await;

        h.store.set(true);
        h.coordinator.cache().refresh().await;

        assert!(flow.await.unwrap());
        assert_eq!(h.ui.closes(), 1);
        assert_eq!(h.launcher.disposals(), 1);
    }

    #[tokio::test]
    async fn test_revoke_triggers_reapproval() {
        let h = harness(MemoryStore::new(true), [UiAction::Hold], []);
        assert!(h.coordinator.initialize_permissions().await);
        let mut events = h.coordinator.subscribe();

        h.store.set(false);
        assert!(h.store.trigger_watch());

        wait_until(|| h.ui.shows() == 1).await;
        assert_eq!(events.try_recv().unwrap(), CoordinatorEvent::PermissionRevoked);
        assert_eq!(h.prompter.warnings().len(), 1);
        assert_eq!(h.coordinator.state(), CoordinatorState::AwaitingApproval);

        h.coordinator.dispose();
        assert_eq!(h.ui.closes(), 1);
        assert_eq!(h.launcher.disposals(), 1);
        assert!(h.store.is_disposed());
    }

    #[tokio::test]
    async fn test_revoke_then_external_grant_notifies() {
        let h = harness(MemoryStore::new(true), [UiAction::Hold], []);
        assert!(h.coordinator.initialize_permissions().await);
        let mut events = h.coordinator.subscribe();

        h.store.set(false);
        h.store.trigger_watch();
        wait_until(|| h.ui.shows() == 1).await;

        h.store.set(true);
        h.store.trigger_watch();

        let mut received = Vec::new();
        while received.len() < 2 {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .unwrap()
                .unwrap();
            received.push(event);
        }
        assert_eq!(
            received,
            vec![
                CoordinatorEvent::PermissionRevoked,
                CoordinatorEvent::PermissionGranted
            ]
        );
        assert_eq!(h.ui.closes(), 1);
        assert_eq!(h.coordinator.state(), CoordinatorState::Granted);
    }

    #[tokio::test]
    async fn test_idle_grant_notifies_consumers() {
        let h = harness(
            MemoryStore::new(false),
            [UiAction::Cancel],
            [RetryChoice::Abandon],
        );
        assert!(!h.coordinator.initialize_permissions().await);
        let mut events = h.coordinator.subscribe();

        h.store.set(true);
        h.store.trigger_watch();

        let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, CoordinatorEvent::PermissionGranted);
        assert_eq!(h.coordinator.state(), CoordinatorState::Granted);
        assert!(h.coordinator.check_permission().await);
        assert_eq!(h.ui.shows(), 1);
    }

    #[tokio::test]
    async fn test_watch_failure_degrades_to_explicit_checks() {
        let h = harness(MemoryStore::without_watch(false), [UiAction::Accept], []);

        assert!(h.coordinator.initialize_permissions().await);
        assert!(!h.store.is_watching());
        assert!(h.coordinator.check_permission().await);
    }

    #[tokio::test]
    async fn test_new_session_supersedes_previous() {
        let h = harness(MemoryStore::new(false), [UiAction::Hold, UiAction::Hold], []);

        let coordinator = h.coordinator.clone();
        let first = tokio::spawn(async move { coordinator.show_approval_flow().await });
        wait_until(|| h.ui.shows() == 1).await;

        let coordinator = h.coordinator.clone();
        let second = tokio::spawn(async move { coordinator.show_approval_flow().await });
        wait_until(|| h.ui.shows() == 2).await;

        assert!(!first.await.unwrap());
        assert_eq!(h.ui.closes(), 1);
        assert_eq!(h.launcher.disposals(), 1);

        let responder = h.ui.responder().unwrap();
        assert!(responder.accept().await);
        assert!(second.await.unwrap());
        assert_eq!(h.ui.closes(), 2);
        assert_eq!(h.launcher.disposals(), 2);
    }

    #[tokio::test]
    async fn test_failed_accept_keeps_session_open() {
        let h = harness(MemoryStore::new(false), [UiAction::Accept], []);
        h.store.set_fail_writes(true);

        let coordinator = h.coordinator.clone();
        let flow = tokio::spawn(async move { coordinator.show_approval_flow().await });
        wait_until(|| !h.ui.accept_results().is_empty()).await;

        assert_eq!(h.ui.accept_results(), vec![false]);
        assert_eq!(
            h.ui.statuses(),
            vec![ApprovalStatus::Verifying, ApprovalStatus::Failed]
        );
        assert!(h.coordinator.has_active_session());
        assert_eq!(h.ui.closes(), 0);

        h.store.set_fail_writes(false);
        assert!(h.ui.responder().unwrap().accept().await);
        assert!(flow.await.unwrap());
        assert_eq!(h.ui.closes(), 1);
    }

    #[tokio::test]
    async fn test_dispose_is_idempotent() {
        let h = harness(MemoryStore::new(true), [], []);
        assert!(h.coordinator.initialize_permissions().await);

        h.coordinator.dispose();
        h.coordinator.dispose();

        assert!(h.store.is_disposed());
        assert_eq!(h.ui.closes(), 0);

        h.store.set(false);
        h.coordinator.cache().refresh().await;
        assert_eq!(h.ui.shows(), 0);
        assert!(h.prompter.warnings().is_empty());
    }

    #[tokio::test]
    async fn test_dispose_during_initialize_stops_loop() {
        let h = harness(
            MemoryStore::new(false),
            [UiAction::Hold, UiAction::Hold],
            [RetryChoice::Retry, RetryChoice::Retry],
        );

        let coordinator = h.coordinator.clone();
        let init = tokio::spawn(async move { coordinator.initialize_permissions().await });
        wait_until(|| h.ui.shows() == 1).await;

        h.coordinator.dispose();

        let granted = tokio::time::timeout(Duration::from_secs(2), init)
            .await
            .unwrap()
            .unwrap();
        assert!(!granted);
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(h.ui.shows(), 1);
        assert_eq!(h.ui.closes(), 1);
        assert_eq!(h.launcher.launches(), 1);
        assert_eq!(h.launcher.disposals(), 1);
        assert!(h.prompter.asked().is_empty());
        assert!(!h.coordinator.has_active_session());
    }

    #[tokio::test]
    async fn test_no_session_after_dispose() {
        let h = harness(MemoryStore::new(false), [UiAction::Accept], []);
        h.coordinator.dispose();

        assert!(!h.coordinator.show_approval_flow().await);
        assert!(!h.coordinator.initialize_permissions().await);
        assert_eq!(h.ui.shows(), 0);
        assert_eq!(h.launcher.launches(), 0);
        assert!(!h.store.read().await);
    }

    #[tokio::test]
    async fn test_superseded_loop_does_not_prompt() {
        let h = harness(
            MemoryStore::new(false),
            [UiAction::Hold, UiAction::Hold],
            [RetryChoice::Retry],
        );

        let coordinator = h.coordinator.clone();
        let init = tokio::spawn(async move { coordinator.initialize_permissions().await });
        wait_until(|| h.ui.shows() == 1).await;

        let coordinator = h.coordinator.clone();
        let flow = tokio::spawn(async move { coordinator.show_approval_flow().await });
        wait_until(|| h.ui.shows() == 2).await;

        assert!(!init.await.unwrap());
        assert!(h.prompter.asked().is_empty());
        assert_eq!(h.launcher.launches(), 2);
        assert_eq!(h.launcher.disposals(), 1);

        assert!(h.ui.responder().unwrap().accept().await);
        assert!(flow.await.unwrap());
        assert_eq!(h.ui.shows(), 2);
        assert_eq!(h.launcher.disposals(), 2);
    }

    #[tokio::test]
    async fn test_initialize_waits_for_running_reapproval() {
        let h = harness(MemoryStore::new(true), [UiAction::Hold], []);
        assert!(h.coordinator.initialize_permissions().await);

        h.store.set(false);
        assert!(h.store.trigger_watch());
        wait_until(|| h.ui.shows() == 1).await;

        let coordinator = h.coordinator.clone();
        let second = tokio::spawn(async move { coordinator.initialize_permissions().await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert!(!second.is_finished());
        assert_eq!(h.ui.shows(), 1);
        assert_eq!(h.launcher.launches(), 1);
        assert!(h.prompter.asked().is_empty());

        assert!(h.ui.responder().unwrap().accept().await);
        let granted = tokio::time::timeout(Duration::from_secs(2), second)
            .await
            .unwrap()
            .unwrap();
        assert!(granted);
        assert_eq!(h.ui.shows(), 1);
        assert_eq!(h.launcher.launches(), 1);
        assert_eq!(h.launcher.disposals(), 1);
        assert_eq!(h.coordinator.state(), CoordinatorState::Granted);
    }
}
