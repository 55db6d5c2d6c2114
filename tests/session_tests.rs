use futures::future::BoxFuture;
use futures::FutureExt;
use mockall::mock;
use serde_json::json;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{sleep, timeout};

use embed_guard::page::{Disposition, ListenerKind, ListenerPhase, PageEvent};
use embed_guard::{
    CachingResolver, ContentReference, EmbedAddress, EmbedSignal, ErrorKind, HeadlessPage,
    HostPage, HttpStreamUrlResolver, MessagePayload, PlayerError, ProgressReporter, Sandbox,
    SandboxEvent, SessionConfig, SessionStatus, StreamUrlResolver, ViewportStyle,
    WatchProgressRecord,
};

const ORIGIN: &str = "https://app.example";
const EMBED_URL: &str = "https://player.example/embed/m1";

mock! {
    pub Resolver {}
    impl StreamUrlResolver for Resolver {
        fn resolve(
            &self,
            reference: ContentReference,
        ) -> BoxFuture<'static, Result<EmbedAddress, PlayerError>>;
    }
}

// Reporter that remembers every record it receives
#[derive(Default)]
struct RecordingReporter {
    records: Mutex<Vec<WatchProgressRecord>>,
    reject: bool,
}

impl RecordingReporter {
    fn rejecting() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            reject: true,
        }
    }

    fn records(&self) -> Vec<WatchProgressRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl ProgressReporter for RecordingReporter {
    fn report(&self, record: WatchProgressRecord) -> BoxFuture<'static, Result<(), PlayerError>> {
        self.records.lock().unwrap().push(record);
        let result = if self.reject {
            Err(PlayerError::PersistRejected("503 Service Unavailable".to_string()))
        } else {
            Ok(())
        };
        futures::future::ready(result).boxed()
    }
}

// Reporter whose hand-off only completes on a Tokio timer
#[derive(Default)]
struct TimedReporter {
    records: Arc<Mutex<Vec<WatchProgressRecord>>>,
}

impl TimedReporter {
    fn records(&self) -> Vec<WatchProgressRecord> {
        self.records.lock().unwrap().clone()
    }
}

impl ProgressReporter for TimedReporter {
    fn report(&self, record: WatchProgressRecord) -> BoxFuture<'static, Result<(), PlayerError>> {
        let records = self.records.clone();
        async move {
            sleep(Duration::from_millis(5)).await;
            records.lock().unwrap().push(record);
            Ok(())
        }
        .boxed()
    }
}

fn resolving_to(url: &'static str) -> MockResolver {
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .returning(move |_| futures::future::ready(Ok(EmbedAddress::new(url))).boxed());
    resolver
}

fn movie() -> ContentReference {
    ContentReference::movie("m1").with_provider_id(42)
}

fn fast_config() -> SessionConfig {
    SessionConfig {
        navigation_poll_interval: Duration::from_millis(10),
        ..SessionConfig::default()
    }
}

fn sandbox(
    page: &Arc<HeadlessPage>,
    resolver: impl StreamUrlResolver + 'static,
    reporter: &Arc<RecordingReporter>,
) -> Sandbox {
    Sandbox::new(page.clone(), Arc::new(resolver), reporter.clone()).with_config(fast_config())
}

// Resolving -> Playing -> Closed with a single progress record
#[tokio::test]
async fn test_open_play_close() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    let state = session.settled().await;
    assert_eq!(state.status, SessionStatus::Playing);
    assert_eq!(state.address, Some(EmbedAddress::new(EMBED_URL)));
    assert_eq!(state.last_error, None);

    // Guard and lock are held, frame is mounted
    assert_eq!(page.listener_count(), 3);
    assert!(!page.has_native_opener());
    assert_eq!(page.mounted_frames().len(), 1);
    assert_eq!(page.mounted_frames()[0].1.url, EMBED_URL);

    let closed = sandbox.close_session(&session).await;
    assert_eq!(closed.status, SessionStatus::Closed);
    assert_eq!(page.listener_count(), 0);
    assert!(page.has_native_opener());
    assert!(page.mounted_frames().is_empty());

    assert_eq!(
        reporter.records(),
        vec![WatchProgressRecord {
            content_id: "m1".to_string(),
            completed: false,
            position_seconds: 0,
            series_coordinates: None,
        }]
    );
}

// Network failure, then a retry that succeeds
#[tokio::test]
async fn test_resolution_failure_then_retry() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().returning(move |_| {
        let result = if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(PlayerError::LookupFailed("connection reset".to_string()))
        } else {
            Ok(EmbedAddress::new(EMBED_URL))
        };
        futures::future::ready(result).boxed()
    });
    let sandbox = sandbox(&page, resolver, &reporter);

    let session = sandbox.open_session(movie());
    let state = session.settled().await;
    assert_eq!(state.status, SessionStatus::Erred);
    assert_eq!(state.last_error, Some(ErrorKind::Resolution));
    // Guard was never acquired
    assert_eq!(page.listener_count(), 0);
    assert!(page.has_native_opener());

    let retried = sandbox.retry_session(&session);
    assert_eq!(retried.status, SessionStatus::Resolving);
    let state = session.settled().await;
    assert_eq!(state.status, SessionStatus::Playing);
    assert_eq!(state.last_error, None);
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    session.close().await;
    assert_eq!(reporter.records().len(), 1);
}

// No identifiers means no lookup and no guard
#[tokio::test]
async fn test_missing_identifiers_never_acquire_guard() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let resolver = HttpStreamUrlResolver::new("http://127.0.0.1:9/embed", None).unwrap();
    let sandbox = sandbox(&page, resolver, &reporter);

    let session = sandbox.open_session(ContentReference::movie("bare"));
    let state = session.settled().await;
    assert_eq!(state.status, SessionStatus::Erred);
    assert_eq!(state.last_error, Some(ErrorKind::Resolution));
    assert_eq!(page.listener_count(), 0);
    assert_eq!(page.viewport_style(), ViewportStyle::default());

    // Closing straight from Erred still hands off one record
    let closed = session.close().await;
    assert_eq!(closed.status, SessionStatus::Closed);
    let records = reporter.records();
    assert_eq!(records.len(), 1);
    assert!(!records[0].completed);
}

// A hostile message during playback is swallowed and playback continues
#[tokio::test]
async fn test_hostile_message_while_playing() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    let mut events = session.event_receiver();
    session.settled().await;

    let delivered = page.post_message(
        "https://player.example",
        MessagePayload::Text("please window.open redirect now".to_string()),
    );
    assert!(!delivered);
    assert_eq!(session.status(), SessionStatus::Playing);
    assert_eq!(page.current_location(), format!("{}/", ORIGIN));

    let mut suppressed = false;
    while let Ok(event) = events.try_recv() {
        if matches!(event, SandboxEvent::MessageSuppressed { .. }) {
            suppressed = true;
        }
    }
    assert!(suppressed);

    session.close().await;
}

// An embed fault keeps the guard engaged until retry or close
#[tokio::test]
async fn test_embed_fault_keeps_guard() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    session.settled().await;

    let state = session.handle_embed_signal(EmbedSignal::Fault {
        message: "media failed to load".to_string(),
    });
    assert_eq!(state.status, SessionStatus::Erred);
    assert_eq!(state.last_error, Some(ErrorKind::EmbedRuntime));
    assert_eq!(page.listener_count(), 3);
    assert!(!page.has_native_opener());

    // Retry reuses the held guard instead of stacking a second one
    session.retry();
    let state = session.settled().await;
    assert_eq!(state.status, SessionStatus::Playing);
    assert_eq!(page.listener_count(), 3);
    assert_eq!(page.mounted_frames().len(), 1);

    session.close().await;
    assert_eq!(page.listener_count(), 0);
    assert!(page.has_native_opener());
    assert_eq!(reporter.records().len(), 1);
}

// Faults posted as messages take the same path
#[tokio::test]
async fn test_embed_error_message() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    session.settled().await;

    let state = session.handle_embed_message(&MessagePayload::Structured(
        json!({ "event": "error", "message": "403" }),
    ));
    assert_eq!(state.status, SessionStatus::Erred);
    assert_eq!(state.last_error, Some(ErrorKind::EmbedRuntime));

    // Unknown messages change nothing
    let state = session.handle_embed_message(&MessagePayload::Text("hello".to_string()));
    assert_eq!(state.status, SessionStatus::Erred);

    session.close().await;
}

// Completion is only reported when signaled after reaching Playing
#[tokio::test]
async fn test_completion_and_position() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let reference = ContentReference::episode("s1", 2, 5).with_alternate_id("tt0903747");
    let session = sandbox.open_session(reference);
    session.settled().await;

    session.record_position(1_312);
    session.signal_completion();
    session.close().await;

    let records = reporter.records();
    assert_eq!(records.len(), 1);
    assert!(records[0].completed);
    assert_eq!(records[0].position_seconds, 1_312);
    assert_eq!(
        records[0].series_coordinates.map(|c| (c.season, c.episode)),
        Some((2, 5))
    );
}

#[tokio::test]
async fn test_completion_ignored_without_playback() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().returning(|_| {
        futures::future::ready(Err(PlayerError::LookupFailed("404".to_string()))).boxed()
    });
    let sandbox = sandbox(&page, resolver, &reporter);

    let session = sandbox.open_session(movie());
    session.settled().await;
    session.signal_completion();
    session.close().await;

    assert!(!reporter.records()[0].completed);
}

// Teardown while still resolving goes through Closed all the same
#[tokio::test]
async fn test_teardown_mid_resolving() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let mut resolver = MockResolver::new();
    resolver
        .expect_resolve()
        .returning(|_| futures::future::pending().boxed());
    let sandbox = sandbox(&page, resolver, &reporter);

    let session = sandbox.open_session(movie());
    assert_eq!(session.status(), SessionStatus::Resolving);

    let state = session.teardown().await;
    assert_eq!(state.status, SessionStatus::Closed);
    assert_eq!(page.listener_count(), 0);
    assert_eq!(reporter.records().len(), 1);
    assert!(!reporter.records()[0].completed);
}

// Dropping a playing session still releases everything and reports once
#[tokio::test]
async fn test_drop_mid_playing() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    session.settled().await;
    assert_eq!(page.listener_count(), 3);

    drop(session);
    assert_eq!(page.listener_count(), 0);
    assert!(page.has_native_opener());

    timeout(Duration::from_secs(2), async {
        while reporter.records().is_empty() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("progress record was never handed off");
    sleep(Duration::from_millis(20)).await;
    assert_eq!(reporter.records().len(), 1);
}

// Closing twice hands off exactly one record
#[tokio::test]
async fn test_close_is_terminal() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    session.settled().await;
    session.close().await;
    session.close().await;

    // No transitions out of Closed
    assert_eq!(session.retry().status, SessionStatus::Closed);
    let state = session.handle_embed_signal(EmbedSignal::Fault {
        message: "late".to_string(),
    });
    assert_eq!(state.status, SessionStatus::Closed);

    drop(session);
    sleep(Duration::from_millis(20)).await;
    assert_eq!(reporter.records().len(), 1);
}

// A rejected report is absorbed; the session still closes
#[tokio::test]
async fn test_rejected_progress_is_absorbed() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::rejecting());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    let mut events = session.event_receiver();
    session.settled().await;

    let state = session.close().await;
    assert_eq!(state.status, SessionStatus::Closed);
    assert_eq!(reporter.records().len(), 1);

    let mut rejected = false;
    while let Ok(event) = events.try_recv() {
        if let SandboxEvent::ProgressRejected { reason } = event {
            assert!(reason.contains("503"));
            rejected = true;
        }
    }
    assert!(rejected);
}

// Retry is only meaningful from Erred
#[tokio::test]
async fn test_retry_ignored_while_playing() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    session.settled().await;

    assert_eq!(session.retry().status, SessionStatus::Playing);
    assert_eq!(page.mounted_frames().len(), 1);
    session.close().await;
}

// The watchdog reverts silent top-level navigation, and stops after close
#[tokio::test]
async fn test_navigation_watchdog() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    session.settled().await;

    page.set_location("https://ads.example/landing");
    timeout(Duration::from_secs(2), async {
        while page.current_location() != format!("{}/", ORIGIN) {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("watchdog never reverted the navigation");
    assert_eq!(session.status(), SessionStatus::Playing);

    session.close().await;
    page.set_location("https://ads.example/landing");
    sleep(Duration::from_millis(60)).await;
    assert_eq!(page.current_location(), "https://ads.example/landing");
}

// Interceptor installation failure still plays, flagged as degraded
#[tokio::test]
async fn test_degraded_isolation_still_plays() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    page.refuse_listeners(true);
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    let state = session.settled().await;
    assert_eq!(state.status, SessionStatus::Playing);
    assert!(state.isolation_degraded);
    assert_eq!(state.last_error, Some(ErrorKind::GuardAcquisition));

    session.close().await;
    assert!(page.has_native_opener());
    assert_eq!(reporter.records().len(), 1);
}

// A frame that cannot be mounted is an embed runtime error
#[tokio::test]
async fn test_mount_failure() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    page.refuse_frames(true);
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    let state = session.settled().await;
    assert_eq!(state.status, SessionStatus::Erred);
    assert_eq!(state.last_error, Some(ErrorKind::EmbedRuntime));
    // The guard stays engaged behind the error overlay
    assert_eq!(page.listener_count(), 3);

    page.refuse_frames(false);
    session.retry();
    assert_eq!(session.settled().await.status, SessionStatus::Playing);

    session.close().await;
    assert_eq!(page.listener_count(), 0);
}

// Status changes are broadcast in order
#[tokio::test]
async fn test_status_events() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);

    let session = sandbox.open_session(movie());
    let mut events = session.event_receiver();
    session.settled().await;
    session.close().await;

    let mut statuses = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let SandboxEvent::StatusChanged(status) = event {
            statuses.push(status);
        }
    }
    assert_eq!(statuses, vec![SessionStatus::Playing, SessionStatus::Closed]);
}

// A host handler registered before the session opens never sees hostile messages
#[tokio::test]
async fn test_hostile_message_hidden_from_existing_handler() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let seen = Arc::new(AtomicUsize::new(0));
    let counter = seen.clone();
    page.add_listener(
        ListenerKind::Message,
        ListenerPhase::Bubble,
        Arc::new(move |_event: &PageEvent| {
            counter.fetch_add(1, Ordering::SeqCst);
            Disposition::Proceed
        }),
    )
    .unwrap();

    let reporter = Arc::new(RecordingReporter::default());
    let sandbox = sandbox(&page, resolving_to(EMBED_URL), &reporter);
    let session = sandbox.open_session(movie());
    session.settled().await;

    let delivered = page.post_message(
        "https://player.example",
        MessagePayload::Text("please window.open redirect now".to_string()),
    );
    assert!(!delivered);
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    assert!(page.post_message(
        "https://player.example",
        MessagePayload::Text("buffering".to_string())
    ));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    session.close().await;
    assert_eq!(page.listener_count(), 1);
}

// Retrying after an embed fault asks for a new address instead of the cached one
#[tokio::test]
async fn test_retry_after_fault_bypasses_cached_address() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());

    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let mut inner = MockResolver::new();
    inner.expect_resolve().returning(move |_| {
        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
        let address = EmbedAddress::new(format!("https://player.example/embed/m1?v={}", n));
        futures::future::ready(Ok(address)).boxed()
    });
    let resolver = CachingResolver::new(Arc::new(inner));
    let sandbox = sandbox(&page, resolver, &reporter);

    let session = sandbox.open_session(movie());
    let first = session.settled().await;
    assert_eq!(first.status, SessionStatus::Playing);

    session.handle_embed_signal(EmbedSignal::Fault {
        message: "media failed to load".to_string(),
    });
    session.retry();
    let second = session.settled().await;

    assert_eq!(second.status, SessionStatus::Playing);
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_ne!(first.address, second.address);
    assert_eq!(page.mounted_frames().len(), 1);
    assert_eq!(page.mounted_frames()[0].1.url, "https://player.example/embed/m1?v=2");

    session.close().await;
}

// Completion signaled while still resolving does not carry over into playback
#[tokio::test]
async fn test_completion_before_playback_is_dropped() {
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(RecordingReporter::default());

    let gate = Arc::new(Notify::new());
    let opened = gate.clone();
    let mut resolver = MockResolver::new();
    resolver.expect_resolve().returning(move |_| {
        let opened = opened.clone();
        async move {
            opened.notified().await;
            Ok::<_, PlayerError>(EmbedAddress::new(EMBED_URL))
        }
        .boxed()
    });
    let sandbox = sandbox(&page, resolver, &reporter);

    let session = sandbox.open_session(movie());
    assert_eq!(session.status(), SessionStatus::Resolving);
    session.signal_completion();

    gate.notify_one();
    assert_eq!(session.settled().await.status, SessionStatus::Playing);
    session.close().await;

    assert!(!reporter.records()[0].completed);
}

// Dropping a session off the runtime still hands off on the runtime it was opened on
#[test]
fn test_drop_outside_runtime_hands_off() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(TimedReporter::default());
    let sandbox = Sandbox::new(
        page.clone(),
        Arc::new(resolving_to(EMBED_URL)),
        reporter.clone(),
    )
    .with_config(fast_config());

    let session = runtime.block_on(async {
        let session = sandbox.open_session(movie());
        session.settled().await;
        session
    });
    assert_eq!(page.listener_count(), 3);

    drop(session);
    assert_eq!(page.listener_count(), 0);
    assert!(page.has_native_opener());

    runtime.block_on(async {
        timeout(Duration::from_secs(2), async {
            while reporter.records().is_empty() {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("progress record was never handed off");
    });
    assert_eq!(reporter.records().len(), 1);
}

// Dropping a session after its runtime is gone releases the page without panicking
#[test]
fn test_drop_after_runtime_shutdown() {
    let runtime = tokio::runtime::Runtime::new().unwrap();
    let page = Arc::new(HeadlessPage::new(ORIGIN));
    let reporter = Arc::new(TimedReporter::default());
    let sandbox = Sandbox::new(
        page.clone(),
        Arc::new(resolving_to(EMBED_URL)),
        reporter.clone(),
    )
    .with_config(fast_config());

    let session = runtime.block_on(async {
        let session = sandbox.open_session(movie());
        session.settled().await;
        session
    });
    drop(runtime);

    drop(session);
    assert_eq!(page.listener_count(), 0);
    assert!(page.has_native_opener());
    assert!(page.mounted_frames().is_empty());
    assert_eq!(page.viewport_style(), ViewportStyle::default());
    assert!(reporter.records().is_empty());
}
