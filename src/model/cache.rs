//! Process-lifetime artwork cache keyed by track URI

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Downloaded album art for one track.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Artwork {
    pub url: String,
    pub bytes: Arc<Vec<u8>>,
}

/// Cache of successful artwork lookups. Failures are never stored.
#[derive(Clone, Default)]
pub struct ArtworkCache {
    images: Arc<RwLock<HashMap<String, Artwork>>>,
}

impl ArtworkCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, track_uri: &str) -> Option<Artwork> {
        self.images.read().await.get(track_uri).cloned()
    }

    pub async fn insert(&self, track_uri: String, artwork: Artwork) {
        self.images.write().await.insert(track_uri, artwork);
    }

    pub async fn len(&self) -> usize {
        self.images.read().await.len()
    }
}
