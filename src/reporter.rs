use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::PlayerError;
use crate::models::WatchProgressRecord;
use crate::settings::SETTINGS;

const MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Persists watch progress once a session hands its record off.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, record: WatchProgressRecord) -> BoxFuture<'static, Result<(), PlayerError>>;
}

/// Posts records to the watch-history endpoint as JSON.
#[derive(Clone)]
pub struct HttpProgressReporter {
    client: Arc<Client>,
    endpoint: String,
    attempts: u32,
    backoff: Duration,
}

impl HttpProgressReporter {
    pub fn new(endpoint: &str, custom_client: Option<Arc<Client>>) -> Result<Self, PlayerError> {
        let client = match custom_client {
            Some(client) => client,
            None => Arc::new(
                Client::builder()
                    .timeout(SETTINGS.request_timeout)
                    .connect_timeout(SETTINGS.request_timeout)
                    .build()?,
            ),
        };
        Ok(Self {
            client,
            endpoint: endpoint.to_string(),
            attempts: SETTINGS.report_attempts,
            backoff: SETTINGS.report_backoff,
        })
    }

    /// Override the retry policy. At least one attempt is always made.
    pub fn with_retry(mut self, attempts: u32, backoff: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.backoff = backoff;
        self
    }

    async fn post_once(
        client: &Client,
        endpoint: &str,
        record: &WatchProgressRecord,
    ) -> Result<(), PlayerError> {
        let response = client.post(endpoint).json(record).send().await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        let body_text = response.text().await.unwrap_or_default();
        Err(PlayerError::PersistRejected(format!(
            "{}: {}",
            status, body_text
        )))
    }
}

impl ProgressReporter for HttpProgressReporter {
    fn report(&self, record: WatchProgressRecord) -> BoxFuture<'static, Result<(), PlayerError>> {
        let this = self.clone();
        async move {
            let mut backoff = this.backoff.min(MAX_BACKOFF);
            let mut attempt = 1;
            loop {
                debug!(attempt, content_id = %record.content_id, "Posting watch progress");
                match Self::post_once(&this.client, &this.endpoint, &record).await {
                    Ok(()) => {
                        info!(content_id = %record.content_id, "Watch progress stored");
                        return Ok(());
                    }
                    Err(e) if attempt < this.attempts => {
                        let delay = calculate_backoff_delay(backoff);
                        warn!(error = %e, attempt, "Watch progress post failed, retrying in {:?}", delay);
                        sleep(delay).await;
                        backoff = backoff.saturating_mul(2).min(MAX_BACKOFF);
                        attempt += 1;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
        .boxed()
    }
}

impl std::fmt::Debug for HttpProgressReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpProgressReporter")
            .field("endpoint", &self.endpoint)
            .field("attempts", &self.attempts)
            .finish()
    }
}

/// Helper to calculate backoff delay with jitter
fn calculate_backoff_delay(base_backoff: Duration) -> Duration {
    let jitter_factor = rand::random::<f32>() * 0.6 - 0.3; // -0.3 to +0.3
    let jitter = base_backoff.mul_f32(jitter_factor.abs());
    if jitter_factor >= 0.0 {
        base_backoff + jitter
    } else {
        base_backoff.saturating_sub(jitter)
    }
}
