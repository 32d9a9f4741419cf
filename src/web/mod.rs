//! Web layer.
//!
//! Thin axum handlers over the streaming core: the stream surface
//! (playlists and segments), the variant proxy surface, and a small admin
//! surface for session inspection. Handlers never hold session locks while
//! writing response bodies.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::{Router, routing::get};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::metadata::MetadataSource;
use crate::metadata::probe::SourceProber;
use crate::pathmap::PathMapper;
use crate::proxy::VariantProxy;
use crate::streaming::{SessionManager, ToolInfo};

pub mod handlers;
pub mod responses;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub manager: Arc<SessionManager>,
    /// Absent until a metadata upstream is configured; the stream surface
    /// answers 503 in the meantime.
    pub metadata: Option<Arc<dyn MetadataSource>>,
    pub path_mapper: Arc<PathMapper>,
    pub variant_proxy: Arc<VariantProxy>,
    pub prober: Option<Arc<SourceProber>>,
    pub ffmpeg: Arc<ToolInfo>,
    pub ffprobe: Arc<ToolInfo>,
}

/// Build the full application router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health::health_check))
        // Streaming surface
        .route(
            "/stream/{scene_id}/master.m3u8",
            get(handlers::stream::master_playlist),
        )
        .route(
            "/stream/{scene_id}/index.m3u8",
            get(handlers::stream::media_playlist),
        )
        .route("/stream/{scene_id}/{segment}", get(handlers::stream::segment))
        // Variant passthrough surface
        .route(
            "/proxy/{scene_id}/{variant}/index.m3u8",
            get(handlers::proxy::playlist),
        )
        .route(
            "/proxy/{scene_id}/{variant}/{segment}",
            get(handlers::proxy::segment),
        )
        // Admin surface
        .route("/sessions", get(handlers::sessions::list))
        .route("/session/{key}/status", get(handlers::sessions::status))
        .route("/session/{key}/segments", get(handlers::sessions::segments))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Web server configuration and setup.
pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr = format!(
            "{}:{}",
            state.config.web.host, state.config.web.port
        )
        .parse()?;
        Ok(Self {
            app: build_router(state),
            addr,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Serve until the shutdown future resolves, then stop accepting
    /// connections.
    pub async fn serve_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<()> {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }
}
