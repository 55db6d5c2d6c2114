use serde_json::Value;

use crate::models::{SessionStatus, WatchProgressRecord};
use crate::page::MessagePayload;

// Events broadcast to subscribers of a session
#[derive(Debug, Clone, PartialEq)]
pub enum SandboxEvent {
    StatusChanged(SessionStatus),
    UnloadConfirmationRequested,
    NavigationReverted { location: String },
    MessageSuppressed { origin: String },
    WindowOpenBlocked { url: String },
    IsolationDegraded { reason: String },
    ProgressReported(WatchProgressRecord),
    ProgressRejected { reason: String },
}

impl SandboxEvent {
    // Get the name of the event type
    pub fn event_type(&self) -> &'static str {
        match self {
            SandboxEvent::StatusChanged(_) => "statusChanged",
            SandboxEvent::UnloadConfirmationRequested => "unloadConfirmationRequested",
            SandboxEvent::NavigationReverted { .. } => "navigationReverted",
            SandboxEvent::MessageSuppressed { .. } => "messageSuppressed",
            SandboxEvent::WindowOpenBlocked { .. } => "windowOpenBlocked",
            SandboxEvent::IsolationDegraded { .. } => "isolationDegraded",
            SandboxEvent::ProgressReported(_) => "progressReported",
            SandboxEvent::ProgressRejected { .. } => "progressRejected",
        }
    }

    /// Returns true for events produced by an interceptor neutralizing the embed.
    pub fn is_interception(&self) -> bool {
        matches!(
            self,
            SandboxEvent::UnloadConfirmationRequested
                | SandboxEvent::NavigationReverted { .. }
                | SandboxEvent::MessageSuppressed { .. }
                | SandboxEvent::WindowOpenBlocked { .. }
        )
    }
}

/// What the embed reports about itself while mounted.
#[derive(Debug, Clone, PartialEq)]
pub enum EmbedSignal {
    Loaded,
    Progress { position_seconds: u64 },
    Ended,
    Fault { message: String },
}

impl EmbedSignal {
    /// Parse a player status message such as
    /// `{"event": "timeupdate", "currentTime": 12.5}`.
    ///
    /// Text payloads holding JSON are accepted too, since many players
    /// stringify before posting. Anything unrecognized yields `None`.
    pub fn from_message(payload: &MessagePayload) -> Option<Self> {
        let value = match payload {
            MessagePayload::Structured(value) => value.clone(),
            MessagePayload::Text(text) => serde_json::from_str::<Value>(text).ok()?,
        };
        let event = value.get("event").and_then(Value::as_str)?;

        match event {
            "ready" | "loaded" => Some(EmbedSignal::Loaded),
            "timeupdate" | "progress" => {
                let seconds = value
                    .get("currentTime")
                    .and_then(Value::as_f64)
                    .filter(|t| t.is_finite() && *t >= 0.0)?;
                Some(EmbedSignal::Progress {
                    position_seconds: seconds.floor() as u64,
                })
            }
            "ended" | "complete" => Some(EmbedSignal::Ended),
            "error" => {
                let message = value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("embed reported an error")
                    .to_string();
                Some(EmbedSignal::Fault { message })
            }
            _ => None,
        }
    }
}
