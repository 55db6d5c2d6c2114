use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, trace};

use crate::error::PlayerError;
use crate::models::EmbedAddress;
use crate::page::{
    Disposition, FrameId, HostPage, ListenerId, ListenerKind, ListenerPhase, MessagePayload,
    PageEvent, PageListener, ViewportStyle, WindowOpener, WindowRef,
};

/// Result of asking the page to unload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnloadOutcome {
    Proceed,
    NeedsConfirmation,
}

/// Result of a top-level navigation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NavigationOutcome {
    Committed,
    Reverted,
}

/// Opener used when nothing has replaced it: every call yields a new window.
#[derive(Debug, Default)]
struct NativeOpener {
    next: Mutex<u64>,
}

impl WindowOpener for NativeOpener {
    fn open(&self, url: &str, target: &str) -> Option<WindowRef> {
        let mut next = self.next.lock().unwrap_or_else(PoisonError::into_inner);
        *next += 1;
        trace!(url, target, window = *next, "Native window opened");
        Some(WindowRef(*next))
    }
}

struct Registration {
    id: ListenerId,
    kind: ListenerKind,
    phase: ListenerPhase,
    listener: PageListener,
}

struct HeadlessState {
    history: Vec<String>,
    listeners: Vec<Registration>,
    next_listener: ListenerId,
    opener: Arc<dyn WindowOpener>,
    native_opener: Arc<dyn WindowOpener>,
    style: ViewportStyle,
    frames: BTreeMap<FrameId, EmbedAddress>,
    next_frame: FrameId,
    refuse_listeners: bool,
    refuse_frames: bool,
}

/// In-memory [`HostPage`] with a history stack, listener table, swappable
/// window opener and mounted frames. Drives headless hosts and tests.
pub struct HeadlessPage {
    origin: String,
    state: Mutex<HeadlessState>,
}

impl HeadlessPage {
    /// A page sitting at `origin` + `/`.
    pub fn new(origin: &str) -> Self {
        let origin = origin.trim_end_matches('/').to_string();
        let native: Arc<dyn WindowOpener> = Arc::new(NativeOpener::default());
        Self {
            state: Mutex::new(HeadlessState {
                history: vec![format!("{}/", origin)],
                listeners: Vec::new(),
                next_listener: 1,
                opener: native.clone(),
                native_opener: native,
                style: ViewportStyle::default(),
                frames: BTreeMap::new(),
                next_frame: 1,
                refuse_listeners: false,
                refuse_frames: false,
            }),
            origin,
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeadlessState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Listeners run outside the lock so they may call back into the page.
    // Capture listeners come first, each phase in registration order.
    fn listeners_for(&self, kind: ListenerKind) -> Vec<PageListener> {
        let state = self.lock();
        let mut ordered = Vec::new();
        for phase in [ListenerPhase::Capture, ListenerPhase::Bubble] {
            for registration in &state.listeners {
                if registration.kind == kind && registration.phase == phase {
                    ordered.push(registration.listener.clone());
                }
            }
        }
        ordered
    }

    fn dispatch(&self, event: &PageEvent) -> Vec<Disposition> {
        let mut verdicts = Vec::new();
        for listener in self.listeners_for(event.kind()) {
            let verdict = listener(event);
            verdicts.push(verdict);
            if verdict == Disposition::Suppress {
                break;
            }
        }
        verdicts
    }

    /// Make installing listeners fail, as a hardened page might.
    pub fn refuse_listeners(&self, refuse: bool) {
        self.lock().refuse_listeners = refuse;
    }

    /// Make mounting frames fail.
    pub fn refuse_frames(&self, refuse: bool) {
        self.lock().refuse_frames = refuse;
    }

    /// Top-level navigation through the history API; listeners may revert it.
    pub fn navigate(&self, location: &str) -> NavigationOutcome {
        self.lock().history.push(location.to_string());
        let verdicts = self.dispatch(&PageEvent::HistoryChange {
            location: location.to_string(),
        });
        if verdicts.contains(&Disposition::Revert) {
            // A listener may already have stepped back itself.
            if self.current_location() == location {
                self.history_back();
            }
            NavigationOutcome::Reverted
        } else {
            NavigationOutcome::Committed
        }
    }

    /// Change the top-level location without any notification, the way an
    /// embed assigning `top.location` would.
    pub fn set_location(&self, location: &str) {
        self.lock().history.push(location.to_string());
    }

    /// Deliver a cross-document message. Returns `true` when it reached the
    /// page's own handlers, `false` when an interceptor suppressed it.
    pub fn post_message(&self, origin: &str, payload: MessagePayload) -> bool {
        let verdicts = self.dispatch(&PageEvent::Message {
            origin: origin.to_string(),
            payload,
        });
        !verdicts.contains(&Disposition::Suppress)
    }

    pub fn request_unload(&self) -> UnloadOutcome {
        let verdicts = self.dispatch(&PageEvent::BeforeUnload);
        if verdicts.contains(&Disposition::Confirm) {
            UnloadOutcome::NeedsConfirmation
        } else {
            UnloadOutcome::Proceed
        }
    }

    /// Call whatever window-open implementation is currently installed.
    pub fn open_window(&self, url: &str, target: &str) -> Option<WindowRef> {
        let opener = self.lock().opener.clone();
        opener.open(url, target)
    }

    /// Whether the original window-open implementation is in place.
    pub fn has_native_opener(&self) -> bool {
        let state = self.lock();
        Arc::ptr_eq(&state.opener, &state.native_opener)
    }

    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    pub fn listener_kinds(&self) -> Vec<ListenerKind> {
        self.lock().listeners.iter().map(|r| r.kind).collect()
    }

    pub fn mounted_frames(&self) -> Vec<(FrameId, EmbedAddress)> {
        self.lock()
            .frames
            .iter()
            .map(|(id, addr)| (*id, addr.clone()))
            .collect()
    }
}

impl HostPage for HeadlessPage {
    fn origin(&self) -> String {
        self.origin.clone()
    }

    fn current_location(&self) -> String {
        self.lock().history.last().cloned().unwrap_or_default()
    }

    fn history_back(&self) {
        let mut state = self.lock();
        if state.history.len() > 1 {
            let left = state.history.pop();
            debug!(?left, "History stepped back");
        }
    }

    fn add_listener(
        &self,
        kind: ListenerKind,
        phase: ListenerPhase,
        listener: PageListener,
    ) -> Result<ListenerId, PlayerError> {
        let mut state = self.lock();
        if state.refuse_listeners {
            return Err(PlayerError::HostPage(format!(
                "{:?} listeners are not permitted",
                kind
            )));
        }
        let id = state.next_listener;
        state.next_listener += 1;
        trace!(id, ?kind, ?phase, "Listener added");
        state.listeners.push(Registration {
            id,
            kind,
            phase,
            listener,
        });
        Ok(id)
    }

    fn remove_listener(&self, id: ListenerId) {
        self.lock().listeners.retain(|r| r.id != id);
    }

    fn replace_window_opener(
        &self,
        opener: Arc<dyn WindowOpener>,
    ) -> Result<Arc<dyn WindowOpener>, PlayerError> {
        let mut state = self.lock();
        Ok(std::mem::replace(&mut state.opener, opener))
    }

    fn viewport_style(&self) -> ViewportStyle {
        self.lock().style
    }

    fn set_viewport_style(&self, style: ViewportStyle) {
        self.lock().style = style;
    }

    fn mount_frame(&self, address: &EmbedAddress) -> Result<FrameId, PlayerError> {
        let mut state = self.lock();
        if state.refuse_frames {
            return Err(PlayerError::HostPage(format!(
                "cannot mount frame for {}",
                address.url
            )));
        }
        let id = state.next_frame;
        state.next_frame += 1;
        state.frames.insert(id, address.clone());
        Ok(id)
    }

    fn unmount_frame(&self, frame: FrameId) {
        self.lock().frames.remove(&frame);
    }
}

impl std::fmt::Debug for HeadlessPage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("HeadlessPage")
            .field("origin", &self.origin)
            .field("location", &state.history.last())
            .field("listeners", &state.listeners.len())
            .field("frames", &state.frames.len())
            .finish()
    }
}
