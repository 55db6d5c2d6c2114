use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::error::ErrorKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Movie,
    Episode,
}

impl ContentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ContentKind::Movie => "movie",
            ContentKind::Episode => "episode",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalIds {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_id: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alternate_id: Option<String>,
}

impl ExternalIds {
    pub fn is_empty(&self) -> bool {
        self.provider_id.is_none() && self.alternate_id.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesCoordinates {
    pub season: u32,
    pub episode: u32,
}

/// Immutable identifier of the content a session plays.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContentReference {
    pub content_id: String,
    pub content_kind: ContentKind,
    #[serde(default)]
    pub external_ids: ExternalIds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_coordinates: Option<SeriesCoordinates>,
}

impl ContentReference {
    pub fn movie(content_id: impl Into<String>) -> Self {
        Self {
            content_id: content_id.into(),
            content_kind: ContentKind::Movie,
            external_ids: ExternalIds::default(),
            series_coordinates: None,
        }
    }

    pub fn episode(content_id: impl Into<String>, season: u32, episode: u32) -> Self {
        Self {
            content_id: content_id.into(),
            content_kind: ContentKind::Episode,
            external_ids: ExternalIds::default(),
            series_coordinates: Some(SeriesCoordinates { season, episode }),
        }
    }

    pub fn with_provider_id(mut self, provider_id: u64) -> Self {
        self.external_ids.provider_id = Some(provider_id);
        self
    }

    pub fn with_alternate_id(mut self, alternate_id: impl Into<String>) -> Self {
        self.external_ids.alternate_id = Some(alternate_id.into());
        self
    }

    /// Coordinates that belong in a lookup; movies never carry them.
    pub fn lookup_coordinates(&self) -> Option<SeriesCoordinates> {
        match self.content_kind {
            ContentKind::Episode => self.series_coordinates,
            ContentKind::Movie => None,
        }
    }
}

/// Capabilities requested for the embed frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EmbedPermission {
    Fullscreen,
    Autoplay,
    PictureInPicture,
    EncryptedMedia,
}

impl EmbedPermission {
    pub const ALL: [EmbedPermission; 4] = [
        EmbedPermission::Fullscreen,
        EmbedPermission::Autoplay,
        EmbedPermission::PictureInPicture,
        EmbedPermission::EncryptedMedia,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            EmbedPermission::Fullscreen => "fullscreen",
            EmbedPermission::Autoplay => "autoplay",
            EmbedPermission::PictureInPicture => "picture-in-picture",
            EmbedPermission::EncryptedMedia => "encrypted-media",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbedAddress {
    pub url: String,
    pub permissions: BTreeSet<EmbedPermission>,
}

impl EmbedAddress {
    /// Address with the full permission set players expect.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            permissions: EmbedPermission::ALL.into_iter().collect(),
        }
    }

    pub fn with_permissions(
        url: impl Into<String>,
        permissions: impl IntoIterator<Item = EmbedPermission>,
    ) -> Self {
        Self {
            url: url.into(),
            permissions: permissions.into_iter().collect(),
        }
    }

    /// Value for the frame's `allow` attribute, e.g. `"fullscreen; autoplay"`.
    pub fn allow_attribute(&self) -> String {
        self.permissions
            .iter()
            .map(|p| p.as_str())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WatchProgressRecord {
    pub content_id: String,
    pub completed: bool,
    pub position_seconds: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub series_coordinates: Option<SeriesCoordinates>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionStatus {
    Resolving,
    Playing,
    Erred,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Resolving => "RESOLVING",
            SessionStatus::Playing => "PLAYING",
            SessionStatus::Erred => "ERRED",
            SessionStatus::Closed => "CLOSED",
        }
    }

    pub fn is_terminal(self) -> bool {
        self == SessionStatus::Closed
    }
}

/// Observable snapshot of a session, published on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybackSessionState {
    pub status: SessionStatus,
    pub address: Option<EmbedAddress>,
    pub last_error: Option<ErrorKind>,
    /// Set when the guard could not install every interceptor.
    pub isolation_degraded: bool,
}

impl PlaybackSessionState {
    pub(crate) fn resolving() -> Self {
        Self {
            status: SessionStatus::Resolving,
            address: None,
            last_error: None,
            isolation_degraded: false,
        }
    }
}
