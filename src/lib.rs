mod error;
pub use error::{ErrorKind, PlayerError};
mod events;
pub use events::{EmbedSignal, SandboxEvent};
mod guard;
pub use guard::{GuardHandle, HostileMessageFilter, Interceptor, NavigationGuard};
mod headless;
pub use headless::{HeadlessPage, NavigationOutcome, UnloadOutcome};
mod models;
pub use models::{
    ContentKind, ContentReference, EmbedAddress, EmbedPermission, ExternalIds,
    PlaybackSessionState, SeriesCoordinates, SessionStatus, WatchProgressRecord,
};
pub mod page;
pub use page::{HostPage, MessagePayload, ViewportStyle};
mod reporter;
pub use reporter::{HttpProgressReporter, ProgressReporter};
mod resolver;
pub use resolver::{CachingResolver, HttpStreamUrlResolver, StreamUrlResolver};
mod scroll;
pub use scroll::{ScrollLease, ScrollLock};
mod session;
pub use session::{CloseReason, PlaybackSession, SessionConfig};
mod settings;
pub use settings::{Settings, DEFAULT_DENYLIST, SETTINGS};

use std::sync::Arc;
use tracing::debug;

/// Hosts untrusted embedded players on a page and keeps the page intact.
///
/// A `Sandbox` ties together the page, the URL resolver and the progress
/// reporter, and opens one [`PlaybackSession`] per content reference.
/// Only one session should be open at a time: the guard patches
/// page-wide state and nothing here prevents two sessions from doing so.
///
/// # Logging
///
/// This library uses the `tracing` crate for logging. To enable logs, you'll need to
/// initialize a tracing subscriber in your application.
///
/// Example using `tracing_subscriber`:
/// ```no_run
/// use tracing::Level;
/// use tracing_subscriber::FmtSubscriber;
///
/// // Create a subscriber with the desired log level
/// let subscriber = FmtSubscriber::builder()
///     .with_max_level(Level::DEBUG) // Set to DEBUG, INFO, WARN, or ERROR
///     .finish();
///
/// // Initialize the global subscriber
/// tracing::subscriber::set_global_default(subscriber)
///     .expect("Failed to set tracing subscriber");
/// ```
///
/// The log levels control what information is displayed:
/// - `TRACE`: Navigation watchdog ticks
/// - `DEBUG`: State transitions, stale lookups, guard and scroll bookkeeping
/// - `INFO`: Session lifecycle: open, mount, close, retry
/// - `WARN`: Intercepted embed behavior, degraded isolation, rejected progress
/// - `ERROR`: Failed calls to the URL-generation service
pub struct Sandbox {
    page: Arc<dyn HostPage>,
    resolver: Arc<dyn StreamUrlResolver>,
    reporter: Arc<dyn ProgressReporter>,
    config: SessionConfig,
}

impl Sandbox {
    pub fn new(
        page: Arc<dyn HostPage>,
        resolver: Arc<dyn StreamUrlResolver>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            page,
            resolver,
            reporter,
            config: SessionConfig::default(),
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Open a session for `reference`. Must be called within a Tokio runtime.
    pub fn open_session(&self, reference: ContentReference) -> PlaybackSession {
        debug!(content_id = %reference.content_id, "Sandbox opening session");
        PlaybackSession::open(
            reference,
            self.page.clone(),
            self.resolver.clone(),
            self.reporter.clone(),
            self.config.clone(),
        )
    }

    pub async fn close_session(&self, session: &PlaybackSession) -> PlaybackSessionState {
        session.close().await
    }

    pub fn retry_session(&self, session: &PlaybackSession) -> PlaybackSessionState {
        session.retry()
    }
}

impl std::fmt::Debug for Sandbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sandbox")
            .field("origin", &self.page.origin())
            .field("config", &self.config)
            .finish()
    }
}
