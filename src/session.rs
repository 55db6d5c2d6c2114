use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, PlayerError};
use crate::events::{EmbedSignal, SandboxEvent};
use crate::guard::{GuardHandle, HostileMessageFilter, NavigationGuard};
use crate::models::{
    ContentReference, EmbedAddress, PlaybackSessionState, SessionStatus, WatchProgressRecord,
};
use crate::page::{is_same_origin, FrameId, HostPage, MessagePayload};
use crate::reporter::ProgressReporter;
use crate::resolver::StreamUrlResolver;
use crate::scroll::{ScrollLease, ScrollLock};
use crate::settings::SETTINGS;

/// Per-sandbox tunables, defaulting from the global [`SETTINGS`].
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub navigation_poll_interval: Duration,
    pub event_buffer_capacity: usize,
    pub message_filter: HostileMessageFilter,
}

impl Default for SessionConfig {
    fn default() -> Self {
        let message_filter = HostileMessageFilter::from_terms(&SETTINGS.message_denylist)
            .unwrap_or_else(|e| {
                warn!(error = %e, "Configured message denylist is invalid, using the default");
                HostileMessageFilter::default()
            });
        Self {
            navigation_poll_interval: SETTINGS.navigation_poll_interval,
            event_buffer_capacity: SETTINGS.event_buffer_capacity,
            message_filter,
        }
    }
}

/// How a session reached `Closed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    UserClose,
    Teardown,
}

// Guard and scroll lock are always held together.
struct Isolation {
    guard: GuardHandle,
    scroll: ScrollLease,
}

impl Isolation {
    fn release(mut self) {
        self.guard.release();
        self.scroll.restore();
    }
}

struct SessionCore {
    status: SessionStatus,
    address: Option<EmbedAddress>,
    last_error: Option<ErrorKind>,
    isolation: Option<Isolation>,
    isolation_degraded: bool,
    frame: Option<FrameId>,
    reached_playing: bool,
    completion_signaled: bool,
    position_seconds: u64,
    // Bumped on every entry into Resolving; stale lookups compare against it.
    generation: u64,
    resolve_task: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
}

impl SessionCore {
    fn new() -> Self {
        Self {
            status: SessionStatus::Resolving,
            address: None,
            last_error: None,
            isolation: None,
            isolation_degraded: false,
            frame: None,
            reached_playing: false,
            completion_signaled: false,
            position_seconds: 0,
            generation: 0,
            resolve_task: None,
            watchdog: None,
        }
    }

    fn snapshot(&self) -> PlaybackSessionState {
        PlaybackSessionState {
            status: self.status,
            address: self.address.clone(),
            last_error: self.last_error,
            isolation_degraded: self.isolation_degraded,
        }
    }

    fn stop_watchdog(&mut self) {
        if let Some(task) = self.watchdog.take() {
            task.abort();
        }
    }
}

struct SessionShared {
    id: Uuid,
    reference: ContentReference,
    resolver: Arc<dyn StreamUrlResolver>,
    reporter: Arc<dyn ProgressReporter>,
    page: Arc<dyn HostPage>,
    config: SessionConfig,
    state_tx: watch::Sender<PlaybackSessionState>,
    events: broadcast::Sender<SandboxEvent>,
    core: Mutex<SessionCore>,
}

impl SessionShared {
    fn lock(&self) -> MutexGuard<'_, SessionCore> {
        self.core.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, core: &SessionCore) {
        let state = core.snapshot();
        let status = state.status;
        let previous = self.state_tx.send_replace(state);
        if previous.status != status {
            debug!(session = %self.id, from = previous.status.as_str(), to = status.as_str(), "Session transition");
            let _ = self.events.send(SandboxEvent::StatusChanged(status));
        }
    }

    fn begin_resolving(self: &Arc<Self>, core: &mut SessionCore) {
        core.generation += 1;
        let generation = core.generation;
        core.status = SessionStatus::Resolving;
        core.address = None;
        core.last_error = None;
        debug!(session = %self.id, generation, "Resolving embed address");

        let lookup = self.resolver.resolve(self.reference.clone());
        let shared = Arc::clone(self);
        let task = tokio::spawn(async move {
            let outcome = lookup.await;
            shared.finish_resolution(generation, outcome);
        });
        if let Some(stale) = core.resolve_task.replace(task) {
            stale.abort();
        }
        self.publish(core);
    }

    fn finish_resolution(
        self: &Arc<Self>,
        generation: u64,
        outcome: Result<EmbedAddress, PlayerError>,
    ) {
        let mut core = self.lock();
        if core.generation != generation || core.status != SessionStatus::Resolving {
            debug!(session = %self.id, generation, "Discarding superseded resolution result");
            return;
        }
        core.resolve_task = None;

        match outcome {
            Ok(address) => self.enter_playing(&mut core, address),
            Err(e) => {
                warn!(session = %self.id, error = %e, "Embed address resolution failed");
                core.status = SessionStatus::Erred;
                core.last_error = Some(ErrorKind::Resolution);
                self.publish(&core);
            }
        }
    }

    // Isolation is acquired after resolution and before the frame is mounted.
    fn enter_playing(&self, core: &mut SessionCore, address: EmbedAddress) {
        if core.isolation.is_none() {
            let guard = NavigationGuard::new(
                self.page.clone(),
                self.config.message_filter.clone(),
                self.events.clone(),
            )
            .acquire();
            let scroll = ScrollLock::new(self.page.clone()).acquire();
            core.isolation_degraded = guard.is_degraded();
            core.isolation = Some(Isolation { guard, scroll });
        }

        match self.page.mount_frame(&address) {
            Ok(frame) => {
                info!(
                    session = %self.id,
                    url = %address.url,
                    allow = %address.allow_attribute(),
                    "Embed mounted"
                );
                core.frame = Some(frame);
                core.address = Some(address);
                core.status = SessionStatus::Playing;
                core.reached_playing = true;
                core.last_error = core
                    .isolation_degraded
                    .then_some(ErrorKind::GuardAcquisition);
                self.start_watchdog(core);
            }
            Err(e) => {
                warn!(session = %self.id, error = %e, "Embed could not be mounted");
                core.address = Some(address);
                core.status = SessionStatus::Erred;
                core.last_error = Some(ErrorKind::EmbedRuntime);
            }
        }
        self.publish(core);
    }

    fn start_watchdog(&self, core: &mut SessionCore) {
        let page = self.page.clone();
        let events = self.events.clone();
        let period = self.config.navigation_poll_interval;
        let id = self.id;

        let task = tokio::spawn(async move {
            let origin = page.origin();
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let location = page.current_location();
                trace!(session = %id, %location, "Navigation watchdog tick");
                if !is_same_origin(&origin, &location) {
                    warn!(session = %id, %location, "Top-level location left the host origin, going back");
                    page.history_back();
                    let _ = events.send(SandboxEvent::NavigationReverted { location });
                }
            }
        });
        if let Some(previous) = core.watchdog.replace(task) {
            previous.abort();
        }
    }

    fn handle_embed_signal(&self, signal: EmbedSignal) -> PlaybackSessionState {
        let mut core = self.lock();
        match signal {
            EmbedSignal::Loaded => {
                debug!(session = %self.id, "Embed reported ready");
            }
            EmbedSignal::Progress { position_seconds } => {
                if core.status == SessionStatus::Playing {
                    core.position_seconds = position_seconds;
                }
            }
            EmbedSignal::Ended => {
                debug!(session = %self.id, "Embed reported end of content");
            }
            EmbedSignal::Fault { message } => {
                if core.status == SessionStatus::Playing {
                    warn!(session = %self.id, %message, "Embed runtime fault");
                    core.stop_watchdog();
                    core.status = SessionStatus::Erred;
                    core.last_error = Some(ErrorKind::EmbedRuntime);
                    self.publish(&core);
                } else {
                    debug!(session = %self.id, status = core.status.as_str(), "Ignoring embed fault outside playback");
                }
            }
        }
        core.snapshot()
    }

    fn retry(self: &Arc<Self>) -> PlaybackSessionState {
        let mut core = self.lock();
        if core.status != SessionStatus::Erred {
            debug!(session = %self.id, status = core.status.as_str(), "Retry ignored");
            return core.snapshot();
        }
        info!(session = %self.id, last_error = ?core.last_error, "Retrying session");
        core.stop_watchdog();
        if let Some(frame) = core.frame.take() {
            self.page.unmount_frame(frame);
        }
        if core.last_error == Some(ErrorKind::EmbedRuntime) {
            self.resolver.invalidate(&self.reference);
        }
        self.begin_resolving(&mut core);
        core.snapshot()
    }

    /// Run the Closed-entry sequence. Returns the record to hand off, or
    /// `None` when the session was already closed.
    fn enter_closed(&self, reason: CloseReason) -> Option<WatchProgressRecord> {
        let mut core = self.lock();
        if core.status == SessionStatus::Closed {
            debug!(session = %self.id, ?reason, "Session already closed");
            return None;
        }

        if let Some(task) = core.resolve_task.take() {
            task.abort();
        }
        core.stop_watchdog();
        if let Some(frame) = core.frame.take() {
            self.page.unmount_frame(frame);
        }
        if let Some(isolation) = core.isolation.take() {
            isolation.release();
        }
        core.status = SessionStatus::Closed;

        let record = WatchProgressRecord {
            content_id: self.reference.content_id.clone(),
            completed: core.reached_playing && core.completion_signaled,
            position_seconds: core.position_seconds,
            series_coordinates: self.reference.lookup_coordinates(),
        };
        info!(
            session = %self.id,
            ?reason,
            completed = record.completed,
            position = record.position_seconds,
            "Session closed"
        );
        self.publish(&core);
        Some(record)
    }

    // Persistence failures end here: logged and broadcast, never returned.
    fn delivery(&self, record: WatchProgressRecord) -> impl Future<Output = ()> + Send + 'static {
        let report = self.reporter.report(record.clone());
        let events = self.events.clone();
        let id = self.id;
        async move {
            match report.await {
                Ok(()) => {
                    debug!(session = %id, "Watch progress handed off");
                    let _ = events.send(SandboxEvent::ProgressReported(record));
                }
                Err(e) => {
                    warn!(session = %id, kind = %ErrorKind::Persist, error = %e, "Watch progress rejected");
                    let _ = events.send(SandboxEvent::ProgressRejected {
                        reason: e.to_string(),
                    });
                }
            }
        }
    }
}

/// One playback of one content reference: resolve, play behind the guard,
/// close and report progress exactly once.
///
/// Dropping an open session is the same as [`teardown`](Self::teardown):
/// the Closed-entry sequence runs and the record is handed off on the
/// runtime the session was opened on. If that runtime has already shut
/// down, the lost record is logged instead.
pub struct PlaybackSession {
    shared: Arc<SessionShared>,
    runtime: Handle,
}

// Rides along with a hand-off spawned from `Drop`; warns if the runtime
// discards it before delivery finishes.
struct PendingHandoff {
    session: Uuid,
    record: Option<WatchProgressRecord>,
}

impl Drop for PendingHandoff {
    fn drop(&mut self) {
        if let Some(record) = self.record.take() {
            warn!(
                session = %self.session,
                content_id = %record.content_id,
                completed = record.completed,
                position = record.position_seconds,
                "Runtime shut down before watch progress was handed off, record lost"
            );
        }
    }
}

impl PlaybackSession {
    /// Start a session in `Resolving`. Must be called within a Tokio runtime.
    pub fn open(
        reference: ContentReference,
        page: Arc<dyn HostPage>,
        resolver: Arc<dyn StreamUrlResolver>,
        reporter: Arc<dyn ProgressReporter>,
        config: SessionConfig,
    ) -> Self {
        let (state_tx, _) = watch::channel(PlaybackSessionState::resolving());
        let (events, _) = broadcast::channel(config.event_buffer_capacity.max(1));
        let shared = Arc::new(SessionShared {
            id: Uuid::new_v4(),
            reference,
            resolver,
            reporter,
            page,
            config,
            state_tx,
            events,
            core: Mutex::new(SessionCore::new()),
        });
        info!(session = %shared.id, content_id = %shared.reference.content_id, "Opening playback session");

        {
            let mut core = shared.lock();
            shared.begin_resolving(&mut core);
        }
        Self {
            shared,
            runtime: Handle::current(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn reference(&self) -> &ContentReference {
        &self.shared.reference
    }

    pub fn state(&self) -> PlaybackSessionState {
        self.shared.state_tx.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.shared.state_tx.borrow().status
    }

    /// Observe every published state.
    pub fn subscribe(&self) -> watch::Receiver<PlaybackSessionState> {
        self.shared.state_tx.subscribe()
    }

    pub fn event_receiver(&self) -> broadcast::Receiver<SandboxEvent> {
        self.shared.events.subscribe()
    }

    /// Wait until the published state satisfies `predicate`.
    pub async fn wait_until<F>(&self, mut predicate: F) -> PlaybackSessionState
    where
        F: FnMut(&PlaybackSessionState) -> bool,
    {
        let mut rx = self.shared.state_tx.subscribe();
        // The sender lives as long as `self`, so the channel cannot close here.
        let state = match rx.wait_for(|state| predicate(state)).await {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        };
        state
    }

    /// Wait for the current resolution to finish, one way or the other.
    pub async fn settled(&self) -> PlaybackSessionState {
        self.wait_until(|state| state.status != SessionStatus::Resolving)
            .await
    }

    pub fn handle_embed_signal(&self, signal: EmbedSignal) -> PlaybackSessionState {
        self.shared.handle_embed_signal(signal)
    }

    /// Feed a message posted by the embed. Unrecognized messages are ignored.
    pub fn handle_embed_message(&self, payload: &MessagePayload) -> PlaybackSessionState {
        match EmbedSignal::from_message(payload) {
            Some(signal) => self.handle_embed_signal(signal),
            None => self.state(),
        }
    }

    pub fn record_position(&self, position_seconds: u64) -> PlaybackSessionState {
        self.handle_embed_signal(EmbedSignal::Progress { position_seconds })
    }

    /// The caller saw the content finish naturally. Ignored until the
    /// session has reached `Playing` at least once.
    pub fn signal_completion(&self) {
        let mut core = self.shared.lock();
        if core.reached_playing && core.status != SessionStatus::Closed {
            core.completion_signaled = true;
        } else {
            debug!(session = %self.shared.id, status = core.status.as_str(), "Completion ignored before playback");
        }
    }

    /// Re-enter `Resolving` from `Erred`. A no-op in any other state.
    pub fn retry(&self) -> PlaybackSessionState {
        self.shared.retry()
    }

    /// Explicit user close.
    pub async fn close(&self) -> PlaybackSessionState {
        if let Some(record) = self.shared.enter_closed(CloseReason::UserClose) {
            self.shared.delivery(record).await;
        }
        self.state()
    }

    /// The hosting component is going away.
    pub async fn teardown(self) -> PlaybackSessionState {
        if let Some(record) = self.shared.enter_closed(CloseReason::Teardown) {
            self.shared.delivery(record).await;
        }
        self.state()
    }
}

impl Drop for PlaybackSession {
    fn drop(&mut self) {
        let Some(record) = self.shared.enter_closed(CloseReason::Teardown) else {
            return;
        };
        let delivery = self.shared.delivery(record.clone());
        let mut pending = PendingHandoff {
            session: self.shared.id,
            record: Some(record),
        };
        // A shut-down runtime drops the task unpolled instead of running it.
        self.runtime.spawn(async move {
            delivery.await;
            pending.record = None;
        });
    }
}

impl std::fmt::Debug for PlaybackSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PlaybackSession")
            .field("id", &self.shared.id)
            .field("content_id", &self.shared.reference.content_id)
            .field("status", &self.status())
            .finish()
    }
}
