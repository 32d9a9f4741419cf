//! Upstream metadata service boundary.
//!
//! The streaming core only knows the `MetadataSource` trait; the concrete
//! HTTP implementation talks to the scene library's JSON API and caches
//! resolved scenes in memory. Tests substitute stub implementations.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::config::MetadataConfig;
use crate::errors::MetadataError;
use crate::models::{SceneSource, StreamVariant};

pub mod probe;

/// Resolves a scene id to its on-disk path, duration, codec info, and
/// available pre-generated stream variants.
#[async_trait]
pub trait MetadataSource: Send + Sync {
    async fn resolve_scene(&self, scene_id: &str) -> Result<SceneSource, MetadataError>;
}

#[derive(Debug, Clone, Deserialize)]
struct SceneDto {
    path: String,
    #[serde(default)]
    duration: f64,
    #[serde(default)]
    width: Option<u32>,
    #[serde(default)]
    height: Option<u32>,
    #[serde(default)]
    video_codec: Option<String>,
    #[serde(default)]
    streams: Vec<StreamVariantDto>,
    #[serde(default)]
    is_streamable: bool,
}

#[derive(Debug, Clone, Deserialize)]
struct StreamVariantDto {
    label: String,
    url: String,
}

struct CachedScene {
    scene: SceneSource,
    fetched_at: Instant,
}

/// `MetadataSource` backed by the upstream HTTP API, with a TTL cache.
pub struct HttpMetadataSource {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    cache_ttl: Duration,
    cache: RwLock<HashMap<String, CachedScene>>,
}

impl HttpMetadataSource {
    /// Returns `None` when no upstream base URL is configured; the web layer
    /// then answers 503 until the deployment is completed.
    pub fn from_config(config: &MetadataConfig, client: reqwest::Client) -> Option<Arc<Self>> {
        let base_url = config.base_url.clone()?;
        Some(Arc::new(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            cache_ttl: Duration::from_secs(config.cache_ttl_secs),
            cache: RwLock::new(HashMap::new()),
        }))
    }

    async fn fetch(&self, scene_id: &str) -> Result<SceneSource, MetadataError> {
        let url = format!(
            "{}/scenes/{}",
            self.base_url,
            urlencoding::encode(scene_id)
        );
        let mut request = self.client.get(&url);
        if let Some(ref key) = self.api_key {
            request = request.header("ApiKey", key);
        }

        let response = request.send().await?;
        match response.status() {
            status if status.is_success() => {}
            reqwest::StatusCode::NOT_FOUND => {
                return Err(MetadataError::NotFound {
                    scene_id: scene_id.to_string(),
                });
            }
            status => {
                return Err(MetadataError::Unavailable {
                    message: format!("upstream answered {status} for {url}"),
                });
            }
        }

        let dto: SceneDto = response.json().await.map_err(|e| MetadataError::Decode {
            message: e.to_string(),
        })?;

        Ok(SceneSource {
            path: dto.path,
            duration_secs: dto.duration,
            source_width: dto.width,
            source_height: dto.height,
            source_codec: dto.video_codec,
            variants: dto
                .streams
                .into_iter()
                .map(|s| StreamVariant {
                    label: s.label,
                    manifest_url: s.url,
                })
                .collect(),
            is_streamable: dto.is_streamable,
        })
    }
}

#[async_trait]
impl MetadataSource for HttpMetadataSource {
    async fn resolve_scene(&self, scene_id: &str) -> Result<SceneSource, MetadataError> {
        {
            let cache = self.cache.read().await;
            if let Some(cached) = cache.get(scene_id)
                && cached.fetched_at.elapsed() < self.cache_ttl
            {
                return Ok(cached.scene.clone());
            }
        }

        let scene = self.fetch(scene_id).await?;
        debug!(scene_id, path = %scene.path, "Resolved scene from metadata service");

        let mut cache = self.cache.write().await;
        cache.insert(
            scene_id.to_string(),
            CachedScene {
                scene: scene.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(scene)
    }
}
