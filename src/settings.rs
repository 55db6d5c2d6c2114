use once_cell::sync::Lazy;
use std::{env, time::Duration};

/// Holds all tunables, read-once from ENV with fallbacks.
#[derive(Debug)]
pub struct Settings {
    pub navigation_poll_interval: Duration,
    pub event_buffer_capacity: usize,
    pub request_timeout: Duration,
    pub report_attempts: u32,
    pub report_backoff: Duration,
    pub message_denylist: Vec<String>,
}

impl Settings {
    fn from_env() -> Self {
        // optionally load .env
        let _ = dotenvy::dotenv();

        // helper to parse usize
        fn parse_usize(var: &str, default: usize) -> usize {
            env::var(var)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        }

        // helper to parse seconds into Duration
        fn parse_secs(var: &str, default_secs: u64) -> Duration {
            env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or_else(|| Duration::from_secs(default_secs))
        }

        // helper to parse millis into Duration
        fn parse_millis(var: &str, default_ms: u64) -> Duration {
            env::var(var)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .filter(|ms| *ms > 0)
                .map(Duration::from_millis)
                .unwrap_or_else(|| Duration::from_millis(default_ms))
        }

        // helper to parse a comma-separated list
        fn parse_list(var: &str, default: &[&str]) -> Vec<String> {
            let parsed: Vec<String> = env::var(var)
                .ok()
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default();
            if parsed.is_empty() {
                default.iter().map(|s| s.to_string()).collect()
            } else {
                parsed
            }
        }

        Settings {
            navigation_poll_interval: parse_millis("NAVIGATION_POLL_MS", 100),
            event_buffer_capacity: parse_usize("EVENT_BUFFER_CAPACITY", 64).max(1),
            request_timeout: parse_secs("REQUEST_TIMEOUT_SECS", 10),
            report_attempts: parse_usize("REPORT_ATTEMPTS", 3).max(1) as u32,
            report_backoff: parse_millis("REPORT_BACKOFF_MS", 250),
            message_denylist: parse_list("MESSAGE_DENYLIST", DEFAULT_DENYLIST),
        }
    }
}

/// Substrings that mark a cross-document message as a navigation attempt.
pub const DEFAULT_DENYLIST: &[&str] = &["redirect", "location", "window.open"];

/// Global settings instance
pub static SETTINGS: Lazy<Settings> = Lazy::new(Settings::from_env);
