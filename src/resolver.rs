use futures::future::BoxFuture;
use futures::FutureExt;
use reqwest::Client;
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};
use tracing::{debug, error, info};

use crate::error::PlayerError;
use crate::models::{ContentReference, EmbedAddress};
use crate::settings::SETTINGS;

/// Turns a content reference into an embeddable address.
pub trait StreamUrlResolver: Send + Sync {
    fn resolve(&self, reference: ContentReference)
        -> BoxFuture<'static, Result<EmbedAddress, PlayerError>>;

    /// Drop anything remembered about `reference`, so the next `resolve`
    /// asks for a fresh address. Called after the embed at that address
    /// failed at runtime.
    fn invalidate(&self, _reference: &ContentReference) {}
}

/// Answers from addresses already issued for the exact same reference and
/// only asks `inner` for the rest.
pub struct CachingResolver {
    inner: Arc<dyn StreamUrlResolver>,
    issued: Arc<RwLock<HashMap<ContentReference, EmbedAddress>>>,
}

impl CachingResolver {
    pub fn new(inner: Arc<dyn StreamUrlResolver>) -> Self {
        Self {
            inner,
            issued: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Seed an address the caller already holds, e.g. from cached show data.
    pub fn remember(&self, reference: ContentReference, address: EmbedAddress) {
        self.issued
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(reference, address);
    }

    /// Evict the address issued for `reference`, returning it if present.
    pub fn forget(&self, reference: &ContentReference) -> Option<EmbedAddress> {
        self.issued
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(reference)
    }

    pub fn cached(&self, reference: &ContentReference) -> Option<EmbedAddress> {
        self.issued
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(reference)
            .cloned()
    }
}

impl StreamUrlResolver for CachingResolver {
    fn resolve(
        &self,
        reference: ContentReference,
    ) -> BoxFuture<'static, Result<EmbedAddress, PlayerError>> {
        if let Some(address) = self.cached(&reference) {
            debug!(content_id = %reference.content_id, "Using previously issued embed address");
            return futures::future::ready(Ok(address)).boxed();
        }

        let lookup = self.inner.resolve(reference.clone());
        let issued = self.issued.clone();
        async move {
            let address = lookup.await?;
            issued
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(reference, address.clone());
            Ok(address)
        }
        .boxed()
    }

    fn invalidate(&self, reference: &ContentReference) {
        if let Some(address) = self.forget(reference) {
            debug!(content_id = %reference.content_id, url = %address.url, "Evicted embed address");
        }
        self.inner.invalidate(reference);
    }
}

#[derive(Debug, Deserialize)]
struct GeneratedUrl {
    url: String,
}

/// Client for the URL-generation service.
#[derive(Clone)]
pub struct HttpStreamUrlResolver {
    client: Arc<Client>,
    endpoint: String,
}

impl HttpStreamUrlResolver {
    /// Optionally accepts a custom reqwest client for connection reuse.
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
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Query string for a lookup. Provider id wins over alternate id; series
    /// coordinates are only sent for episodes.
    pub fn lookup_query(reference: &ContentReference) -> Result<String, PlayerError> {
        let ids = &reference.external_ids;
        let mut params: Vec<(&str, String)> = Vec::with_capacity(4);
        match (ids.provider_id, ids.alternate_id.as_deref()) {
            (Some(provider_id), _) => params.push(("provider_id", provider_id.to_string())),
            (None, Some(alternate_id)) if !alternate_id.is_empty() => {
                params.push(("alternate_id", alternate_id.to_string()))
            }
            _ => return Err(PlayerError::MissingIdentifiers),
        }
        params.push(("kind", reference.content_kind.as_str().to_string()));
        if let Some(coords) = reference.lookup_coordinates() {
            params.push(("season", coords.season.to_string()));
            params.push(("episode", coords.episode.to_string()));
        }
        Ok(serde_urlencoded::to_string(&params)?)
    }
}

impl StreamUrlResolver for HttpStreamUrlResolver {
    fn resolve(
        &self,
        reference: ContentReference,
    ) -> BoxFuture<'static, Result<EmbedAddress, PlayerError>> {
        let client = self.client.clone();
        let endpoint = self.endpoint.clone();
        async move {
            let query = Self::lookup_query(&reference)?;
            let url = format!("{}?{}", endpoint, query);
            info!(content_id = %reference.content_id, "Requesting embed address");

            let response = client.get(&url).send().await?;
            if !response.status().is_success() {
                let status = response.status();
                let body_text = response.text().await.unwrap_or_default();
                let error_msg = format!("{}: {}", status, body_text);
                error!(content_id = %reference.content_id, "URL generation failed: {}", error_msg);
                return Err(PlayerError::LookupFailed(error_msg));
            }

            let generated = response.json::<GeneratedUrl>().await?;
            if generated.url.trim().is_empty() {
                return Err(PlayerError::InvalidResponse(
                    "URL generation returned an empty address".to_string(),
                ));
            }
            debug!(url = %generated.url, "Embed address resolved");
            Ok(EmbedAddress::new(generated.url))
        }
        .boxed()
    }
}

impl std::fmt::Debug for HttpStreamUrlResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpStreamUrlResolver")
            .field("endpoint", &self.endpoint)
            .finish()
    }
}
