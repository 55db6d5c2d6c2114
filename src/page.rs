use serde_json::Value;
use std::sync::Arc;
use url::Url;

use crate::error::PlayerError;
use crate::models::EmbedAddress;

pub type ListenerId = u64;
pub type FrameId = u64;

/// Payload of a cross-document message.
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePayload {
    Text(String),
    Structured(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub enum PageEvent {
    BeforeUnload,
    HistoryChange { location: String },
    Message { origin: String, payload: MessagePayload },
}

impl PageEvent {
    pub fn kind(&self) -> ListenerKind {
        match self {
            PageEvent::BeforeUnload => ListenerKind::BeforeUnload,
            PageEvent::HistoryChange { .. } => ListenerKind::HistoryChange,
            PageEvent::Message { .. } => ListenerKind::Message,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    BeforeUnload,
    HistoryChange,
    Message,
}

/// When a listener runs relative to the others of its kind. Every
/// `Capture` listener observes an event before any `Bubble` listener does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerPhase {
    Capture,
    Bubble,
}

/// What a listener asks the page to do with the event it observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Let the event continue to other listeners and its default action.
    Proceed,
    /// Ask the user before leaving the page.
    Confirm,
    /// Undo the navigation by stepping history back.
    Revert,
    /// Stop propagation; no later listener observes the event.
    Suppress,
}

pub type PageListener = Arc<dyn Fn(&PageEvent) -> Disposition + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WindowRef(pub u64);

/// The capability to open new browsing contexts.
pub trait WindowOpener: Send + Sync {
    fn open(&self, url: &str, target: &str) -> Option<WindowRef>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Overflow {
    Visible,
    Auto,
    Scroll,
    Hidden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverscrollBehavior {
    Auto,
    Contain,
    None,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Positioning {
    Static,
    Relative,
    Fixed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewportSizing {
    Content,
    FullViewport,
}

/// Scroll and viewport configuration of the host document.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ViewportStyle {
    pub overflow: Overflow,
    pub overscroll: OverscrollBehavior,
    pub position: Positioning,
    pub sizing: ViewportSizing,
    pub scroll_top: i64,
    pub scroll_left: i64,
}

impl Default for ViewportStyle {
    fn default() -> Self {
        Self {
            overflow: Overflow::Auto,
            overscroll: OverscrollBehavior::Auto,
            position: Positioning::Static,
            sizing: ViewportSizing::Content,
            scroll_top: 0,
            scroll_left: 0,
        }
    }
}

impl ViewportStyle {
    /// The same document pinned in place: no scrolling, no resizing.
    pub fn pinned(&self) -> Self {
        Self {
            overflow: Overflow::Hidden,
            overscroll: OverscrollBehavior::None,
            position: Positioning::Fixed,
            sizing: ViewportSizing::FullViewport,
            ..*self
        }
    }
}

/// Everything the sandbox needs from the page hosting it.
///
/// Implementations must not call back into a session while holding their own
/// locks; listeners are plain functions and only report a [`Disposition`].
pub trait HostPage: Send + Sync {
    /// Origin of the host application, e.g. `https://app.example`.
    fn origin(&self) -> String;

    fn current_location(&self) -> String;

    fn history_back(&self);

    fn add_listener(
        &self,
        kind: ListenerKind,
        phase: ListenerPhase,
        listener: PageListener,
    ) -> Result<ListenerId, PlayerError>;

    fn remove_listener(&self, id: ListenerId);

    /// Install `opener` and return the implementation it replaced.
    fn replace_window_opener(
        &self,
        opener: Arc<dyn WindowOpener>,
    ) -> Result<Arc<dyn WindowOpener>, PlayerError>;

    fn viewport_style(&self) -> ViewportStyle;

    fn set_viewport_style(&self, style: ViewportStyle);

    fn mount_frame(&self, address: &EmbedAddress) -> Result<FrameId, PlayerError>;

    fn unmount_frame(&self, frame: FrameId);
}

/// Whether `location` stays inside `origin`. Relative locations resolve
/// against the origin; anything unparsable counts as foreign.
pub fn is_same_origin(origin: &str, location: &str) -> bool {
    let Ok(base) = Url::parse(origin) else {
        return false;
    };
    match base.join(location) {
        Ok(target) => target.origin() == base.origin(),
        Err(_) => false,
    }
}
