//! Two-tier album artwork lookup with a process-lifetime cache
//!
//! The connected device is asked first; the public catalog is the fallback.
//! Missing artwork is a placeholder condition, never an error.

use std::sync::Arc;

use anyhow::{Result, anyhow};
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;

use crate::auth::TokenStore;
use crate::device::RemoteDevice;
use crate::model::spotify_client::track_id_from_uri;
use crate::model::{Artwork, ArtworkCache, ConnectionState};

const CATALOG_API_BASE: &str = "https://api.spotify.com/v1";

/// One way of finding artwork for a track.
pub trait ArtworkSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn lookup(&self, track_uri: &str) -> BoxFuture<'static, Result<Option<Artwork>>>;
}

pub struct ArtworkResolver {
    cache: ArtworkCache,
    device: Arc<dyn ArtworkSource>,
    catalog: Arc<dyn ArtworkSource>,
}

impl ArtworkResolver {
    pub fn new(device: Arc<dyn ArtworkSource>, catalog: Arc<dyn ArtworkSource>) -> Self {
        Self {
            cache: ArtworkCache::new(),
            device,
            catalog,
        }
    }

    pub async fn fetch_artwork(&self, track_uri: &str) -> Option<Artwork> {
        if let Some(cached) = self.cache.get(track_uri).await {
            return Some(cached);
        }

        for source in [&self.device, &self.catalog] {
            match source.lookup(track_uri).await {
                Ok(Some(artwork)) => {
                    tracing::debug!(track_uri, source = source.name(), "Artwork resolved");
                    self.cache.insert(track_uri.to_string(), artwork.clone()).await;
                    return Some(artwork);
                }
                Ok(None) => {
                    tracing::trace!(track_uri, source = source.name(), "No artwork");
                }
                Err(e) => {
                    tracing::debug!(track_uri, source = source.name(), error = %e, "Artwork lookup failed");
                }
            }
        }
        None
    }

    pub fn cache(&self) -> &ArtworkCache {
        &self.cache
    }
}

async fn download(http: &reqwest::Client, url: String) -> Result<Artwork> {
    let bytes = http
        .get(&url)
        .send()
        .await?
        .error_for_status()?
        .bytes()
        .await?;
    Ok(Artwork {
        url,
        bytes: Arc::new(bytes.to_vec()),
    })
}

/// Artwork through the live device session. Skipped while disconnected.
pub struct DeviceArtwork {
    device: watch::Receiver<Option<Arc<dyn RemoteDevice>>>,
    connection: watch::Receiver<ConnectionState>,
    http: reqwest::Client,
}

impl DeviceArtwork {
    pub fn new(
        device: watch::Receiver<Option<Arc<dyn RemoteDevice>>>,
        connection: watch::Receiver<ConnectionState>,
        http: reqwest::Client,
    ) -> Self {
        Self {
            device,
            connection,
            http,
        }
    }
}

impl ArtworkSource for DeviceArtwork {
    fn name(&self) -> &'static str {
        "device"
    }

    fn lookup(&self, track_uri: &str) -> BoxFuture<'static, Result<Option<Artwork>>> {
        let device = self.device.borrow().clone();
        let connected = self.connection.borrow().is_connected();
        let http = self.http.clone();
        let track_uri = track_uri.to_string();

        async move {
            let Some(device) = device.filter(|_| connected) else {
                return Ok(None);
            };
            match device.artwork_url(&track_uri).await? {
                Some(url) => Ok(Some(download(&http, url).await?)),
                None => Ok(None),
            }
        }
        .boxed()
    }
}

/// Public catalog lookup authorized with the stored credential.
pub struct CatalogArtwork {
    http: reqwest::Client,
    store: Arc<dyn TokenStore>,
    api_base: String,
}

impl CatalogArtwork {
    pub fn new(http: reqwest::Client, store: Arc<dyn TokenStore>) -> Self {
        Self {
            http,
            store,
            api_base: CATALOG_API_BASE.to_string(),
        }
    }
}

impl ArtworkSource for CatalogArtwork {
    fn name(&self) -> &'static str {
        "catalog"
    }

    fn lookup(&self, track_uri: &str) -> BoxFuture<'static, Result<Option<Artwork>>> {
        let http = self.http.clone();
        let token = self.store.load();
        let url = format!("{}/tracks/{}", self.api_base, track_id_from_uri(track_uri));

        async move {
            let token = token.ok_or_else(|| anyhow!("no stored credential"))?;
            let body: serde_json::Value = http
                .get(&url)
                .bearer_auth(token)
                .send()
                .await?
                .error_for_status()?
                .json()
                .await?;

            let image_url = body["album"]["images"]
                .get(0)
                .and_then(|image| image["url"].as_str())
                .map(|s| s.to_string());

            match image_url {
                Some(image_url) => Ok(Some(download(&http, image_url).await?)),
                None => Ok(None),
            }
        }
        .boxed()
    }
}
