use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scene_proxy::{
    config::Config,
    metadata::{HttpMetadataSource, MetadataSource, probe::SourceProber},
    pathmap::PathMapper,
    proxy::VariantProxy,
    streaming::{SessionManager, check_tool_availability},
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "scene-proxy")]
#[command(version)]
#[command(about = "On-demand HLS transcoding session proxy for scene libraries")]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("scene_proxy={},tower_http=info", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting scene-proxy v{}", env!("CARGO_PKG_VERSION"));

    unsafe { std::env::set_var("CONFIG_FILE", &cli.config) };
    let mut config = Config::load().context("loading configuration")?;
    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }

    tokio::fs::create_dir_all(config.sessions_dir())
        .await
        .with_context(|| {
            format!(
                "creating sessions directory {}",
                config.sessions_dir().display()
            )
        })?;

    let ffmpeg = check_tool_availability(&config.streaming.ffmpeg_command).await;
    let ffprobe = check_tool_availability(&config.streaming.ffprobe_command).await;
    info!(
        "FFmpeg: available={}, version={:?}, command={}",
        ffmpeg.available, ffmpeg.version, ffmpeg.command
    );
    info!(
        "FFprobe: available={}, version={:?}, command={}",
        ffprobe.available, ffprobe.version, ffprobe.command
    );
    if !ffmpeg.available {
        warn!("Transcoder not available; stream requests will fail until it is installed");
    }

    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(
            config.metadata.request_timeout_secs,
        ))
        .build()
        .context("building HTTP client")?;

    let metadata: Option<Arc<dyn MetadataSource>> =
        match HttpMetadataSource::from_config(&config.metadata, client.clone()) {
            Some(source) => {
                info!("Metadata upstream: {:?}", config.metadata.base_url);
                Some(source)
            }
            None => {
                warn!("No metadata upstream configured; stream requests will answer 503");
                None
            }
        };

    let prober = ffprobe
        .available
        .then(|| Arc::new(SourceProber::new(config.streaming.ffprobe_command.clone())));

    let manager = SessionManager::new(&config);
    manager.spawn_sweeper();
    info!("Session manager initialized");

    let state = AppState {
        path_mapper: Arc::new(PathMapper::new(&config.path_mappings)),
        variant_proxy: Arc::new(VariantProxy::new(client)),
        config: Arc::new(config),
        started_at: chrono::Utc::now(),
        manager: manager.clone(),
        metadata,
        prober,
        ffmpeg: Arc::new(ffmpeg),
        ffprobe: Arc::new(ffprobe),
    };

    let server = WebServer::new(state)?;
    info!("Listening on {}", server.addr());
    server.serve_with_shutdown(shutdown_signal()).await?;

    info!("Shutting down, destroying active sessions");
    manager.destroy_all().await;

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!("Shutdown signal received");
}
