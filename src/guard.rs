use lazy_static::lazy_static;
use regex::Regex;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::error::PlayerError;
use crate::events::SandboxEvent;
use crate::page::{
    is_same_origin, Disposition, HostPage, ListenerId, ListenerKind, ListenerPhase,
    MessagePayload, PageEvent, PageListener, WindowOpener, WindowRef,
};
use crate::settings::DEFAULT_DENYLIST;

lazy_static! {
    static ref DEFAULT_FILTER: HostileMessageFilter =
        HostileMessageFilter::from_terms(DEFAULT_DENYLIST.iter().copied())
            .expect("default denylist is a set of escaped literals");
}

/// Substring heuristic for cross-document messages that try to move the
/// host page. Not a security boundary: an embed can spell its request in
/// ways the denylist does not cover.
#[derive(Debug, Clone)]
pub struct HostileMessageFilter {
    pattern: Option<Regex>,
}

impl HostileMessageFilter {
    pub fn from_terms<I, S>(terms: I) -> Result<Self, PlayerError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let alternatives: Vec<String> = terms
            .into_iter()
            .map(|t| regex::escape(t.as_ref()))
            .filter(|t| !t.is_empty())
            .collect();
        // An empty alternation would match everything.
        if alternatives.is_empty() {
            return Ok(Self { pattern: None });
        }
        Ok(Self {
            pattern: Some(Regex::new(&alternatives.join("|"))?),
        })
    }

    /// Only textual payloads are inspected.
    pub fn is_hostile(&self, payload: &MessagePayload) -> bool {
        match payload {
            MessagePayload::Text(text) => self
                .pattern
                .as_ref()
                .is_some_and(|pattern| pattern.is_match(text)),
            MessagePayload::Structured(_) => false,
        }
    }
}

impl Default for HostileMessageFilter {
    fn default() -> Self {
        DEFAULT_FILTER.clone()
    }
}

/// Window-open replacement that refuses every request.
struct BlockedOpener {
    events: broadcast::Sender<SandboxEvent>,
}

impl WindowOpener for BlockedOpener {
    fn open(&self, url: &str, target: &str) -> Option<WindowRef> {
        warn!(url, target, "Blocked attempt to open a new browsing context");
        let _ = self.events.send(SandboxEvent::WindowOpenBlocked {
            url: url.to_string(),
        });
        None
    }
}

/// Which interceptor a failed installation step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Interceptor {
    UnloadConfirmation,
    HistoryRevert,
    MessageFilter,
    WindowOpen,
}

/// Installs the interceptors that keep an embed from leaving the viewing
/// surface. See [`GuardHandle`] for the release side.
pub struct NavigationGuard {
    page: Arc<dyn HostPage>,
    filter: HostileMessageFilter,
    events: broadcast::Sender<SandboxEvent>,
}

impl NavigationGuard {
    pub fn new(
        page: Arc<dyn HostPage>,
        filter: HostileMessageFilter,
        events: broadcast::Sender<SandboxEvent>,
    ) -> Self {
        Self {
            page,
            filter,
            events,
        }
    }

    /// Install all four interceptors. A step that fails is recorded on the
    /// handle and skipped; the guard never refuses to hand out a handle.
    pub fn acquire(&self) -> GuardHandle {
        let mut handle = GuardHandle {
            page: self.page.clone(),
            registrations: Vec::with_capacity(3),
            previous_opener: None,
            failures: Vec::new(),
            released: false,
        };

        // 1. Confirm before the tab is closed or navigated away from.
        let events = self.events.clone();
        let unload: PageListener = Arc::new(move |event: &PageEvent| match event {
            PageEvent::BeforeUnload => {
                let _ = events.send(SandboxEvent::UnloadConfirmationRequested);
                Disposition::Confirm
            }
            _ => Disposition::Proceed,
        });
        self.install(
            &mut handle,
            Interceptor::UnloadConfirmation,
            ListenerKind::BeforeUnload,
            unload,
        );

        // 2. Revert history changes that leave the host origin.
        let events = self.events.clone();
        let origin = self.page.origin();
        let history: PageListener = Arc::new(move |event: &PageEvent| match event {
            PageEvent::HistoryChange { location } if !is_same_origin(&origin, location) => {
                warn!(%location, "Reverting navigation outside the host origin");
                let _ = events.send(SandboxEvent::NavigationReverted {
                    location: location.clone(),
                });
                Disposition::Revert
            }
            _ => Disposition::Proceed,
        });
        self.install(
            &mut handle,
            Interceptor::HistoryRevert,
            ListenerKind::HistoryChange,
            history,
        );

        // 3. Swallow messages asking for a redirect before anyone else sees them.
        let events = self.events.clone();
        let filter = self.filter.clone();
        let message: PageListener = Arc::new(move |event: &PageEvent| match event {
            PageEvent::Message { origin, payload } if filter.is_hostile(payload) => {
                warn!(%origin, "Suppressed cross-document navigation request");
                let _ = events.send(SandboxEvent::MessageSuppressed {
                    origin: origin.clone(),
                });
                Disposition::Suppress
            }
            _ => Disposition::Proceed,
        });
        self.install(
            &mut handle,
            Interceptor::MessageFilter,
            ListenerKind::Message,
            message,
        );

        // 4. Replace window.open with a no-op that always fails.
        let blocked = Arc::new(BlockedOpener {
            events: self.events.clone(),
        });
        match self.page.replace_window_opener(blocked) {
            Ok(previous) => handle.previous_opener = Some(previous),
            Err(e) => handle.record_failure(Interceptor::WindowOpen, &e, &self.events),
        }

        if handle.is_degraded() {
            warn!(failures = ?handle.failures, "Navigation guard acquired with degraded isolation");
        } else {
            info!("Navigation guard acquired");
        }
        handle
    }

    fn install(
        &self,
        handle: &mut GuardHandle,
        interceptor: Interceptor,
        kind: ListenerKind,
        listener: PageListener,
    ) {
        match self
            .page
            .add_listener(kind, ListenerPhase::Capture, listener)
        {
            Ok(id) => handle.registrations.push(id),
            Err(e) => handle.record_failure(interceptor, &e, &self.events),
        }
    }

    /// Release `handle`. Releasing twice is a no-op.
    pub fn release(&self, handle: &mut GuardHandle) {
        handle.release();
    }
}

impl std::fmt::Debug for NavigationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NavigationGuard")
            .field("filter", &self.filter)
            .finish()
    }
}

/// Interceptor registrations plus the window-open implementation they
/// displaced. Dropping an unreleased handle releases it.
pub struct GuardHandle {
    page: Arc<dyn HostPage>,
    registrations: Vec<ListenerId>,
    previous_opener: Option<Arc<dyn WindowOpener>>,
    failures: Vec<Interceptor>,
    released: bool,
}

impl GuardHandle {
    fn record_failure(
        &mut self,
        interceptor: Interceptor,
        error: &PlayerError,
        events: &broadcast::Sender<SandboxEvent>,
    ) {
        let err = PlayerError::GuardInstall(format!("{:?}: {}", interceptor, error));
        warn!(error = %err, "Interceptor not installed");
        let _ = events.send(SandboxEvent::IsolationDegraded {
            reason: err.to_string(),
        });
        self.failures.push(interceptor);
    }

    pub fn is_degraded(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn failures(&self) -> &[Interceptor] {
        &self.failures
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    /// Remove listeners in reverse install order, then restore window-open.
    pub fn release(&mut self) {
        if self.released {
            debug!("Navigation guard already released");
            return;
        }
        self.released = true;

        for id in self.registrations.drain(..).rev() {
            self.page.remove_listener(id);
        }
        if let Some(previous) = self.previous_opener.take() {
            if let Err(e) = self.page.replace_window_opener(previous) {
                warn!(error = %e, "Could not restore the window-open capability");
            }
        }
        info!("Navigation guard released");
    }
}

impl Drop for GuardHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for GuardHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardHandle")
            .field("registrations", &self.registrations)
            .field("failures", &self.failures)
            .field("released", &self.released)
            .finish()
    }
}
