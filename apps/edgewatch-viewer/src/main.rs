//! Edgewatch Viewer: headless live viewer for one edge node
//!
//! Negotiates the edge's video stream, follows its tracked-object metadata,
//! runs the overlay render loop and polls the edge's system metrics.
//!
//! ## Usage
//!
//! ```bash
//! # Edge on localhost:8000
//! edgewatch-viewer
//!
//! # Remote edge, custom STUN server
//! EDGEWATCH_EDGE_URL=http://10.0.0.21:8000 \
//! EDGEWATCH_ICE_SERVERS=stun:stun.example.net:3478 \
//! edgewatch-viewer
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::time::{interval, Duration};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use edgewatch::api::HttpEdgeApi;
use edgewatch::media::webrtc::{WebRtcPeer, DEFAULT_STUN_SERVER};
use edgewatch::media::MediaSession;
use edgewatch::metadata::{MetadataConsumer, RetryPolicy};
use edgewatch::overlay::{DrawList, RenderConfig, RenderLoop};
use edgewatch::signaling::SignalingSession;
use edgewatch::ws::{WsMetadataSource, WsSignalingConnector};
use edgewatch::{LoadLevel, METADATA_RETRY_INTERVAL, STATUS_POLL_INTERVAL};

/// Viewer configuration from environment
struct Config {
    edge_url: String,
    ice_servers: Vec<String>,
    render_fps: u32,
    metadata_retry: Duration,
}

impl Config {
    fn from_env() -> Self {
        let edge_url = std::env::var("EDGEWATCH_EDGE_URL")
            .unwrap_or_else(|_| "http://localhost:8000".to_string());

        let ice_servers: Vec<String> = std::env::var("EDGEWATCH_ICE_SERVERS")
            .map(|s| {
                s.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        let ice_servers = if ice_servers.is_empty() {
            vec![DEFAULT_STUN_SERVER.to_string()]
        } else {
            ice_servers
        };

        let render_fps: u32 = std::env::var("EDGEWATCH_RENDER_FPS")
            .ok()
            .and_then(|s| s.parse().ok())
            .filter(|fps| *fps > 0)
            .unwrap_or(60);

        let metadata_retry = std::env::var("EDGEWATCH_METADATA_RETRY_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
            .map(Duration::from_secs)
            .unwrap_or(METADATA_RETRY_INTERVAL);

        Self {
            edge_url,
            ice_servers,
            render_fps,
            metadata_retry,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();

    info!("Edgewatch Viewer starting");
    info!("  Edge: {}", config.edge_url);
    info!("  ICE servers: {:?}", config.ice_servers);
    info!("  Render rate: {} fps", config.render_fps);
    info!("  Metadata retry: {:?}", config.metadata_retry);

    let signaling_connector = Arc::new(WsSignalingConnector::new(&config.edge_url)?);
    let metadata_source = Arc::new(WsMetadataSource::new(&config.edge_url)?);
    let edge_api = HttpEdgeApi::new(&config.edge_url)?;

    // Media + signaling
    let (peer, peer_events) = WebRtcPeer::new(config.ice_servers.clone())
        .await
        .context("Failed to create peer connection")?;
    let media = Arc::new(MediaSession::new(Arc::new(peer), peer_events));
    let session = SignalingSession::new(media.clone());
    session.connect(signaling_connector);

    // Metadata + overlay
    let metadata =
        MetadataConsumer::spawn(metadata_source, RetryPolicy::fixed(config.metadata_retry));
    let render = RenderLoop::new(
        DrawList::new(),
        metadata.subscribe(),
        media.frame_size(),
        RenderConfig {
            fps: config.render_fps,
            ..RenderConfig::default()
        },
    )
    .spawn();

    let cancel = CancellationToken::new();
    let tracker = TaskTracker::new();

    // Signaling state log
    {
        let mut states = session.subscribe();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    changed = states.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *states.borrow_and_update();
                        info!("Signaling: {}", state);
                    }
                }
            }
        });
    }

    // Stream attach log
    {
        let mut attached = media.on_stream_attached();
        let cancel = cancel.clone();
        tracker.spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                stream = attached.wait_for(Option::is_some) => {
                    if let Ok(stream) = stream {
                        if let Some(stream) = stream.as_ref() {
                            info!("Receiving {} track {}", stream.kind(), stream.id());
                        }
                    }
                }
            }
        });
    }

    // Edge metrics poll
    {
        let cancel = cancel.clone();
        tracker.spawn(async move {
            let mut poll = interval(STATUS_POLL_INTERVAL);
            let mut last_level: Option<LoadLevel> = None;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = poll.tick() => {
                        match edge_api.metrics().await {
                            Ok(report) => {
                                let level = report.load_level();
                                if last_level != Some(level) {
                                    info!("Edge load: {}", level);
                                    last_level = Some(level);
                                }
                                for warning in report.metrics.warnings() {
                                    debug!("Metric warning: {}", warning);
                                }
                                if report.should_offload == Some(true) {
                                    debug!("Edge reports it should offload");
                                }
                            }
                            Err(e) => debug!("Metrics poll failed: {:#}", e),
                        }
                    }
                }
            }
        });
    }

    // Main loop: stats until SIGINT
    let mut stats_interval = interval(Duration::from_secs(30));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal");
                cancel.cancel();
                break;
            }
            _ = stats_interval.tick() => {
                let stats = metadata.stats();
                info!(
                    "Stats: signaling {}, media {}, {} objects, {} snapshots ({} malformed, {} reconnects), {} frames drawn",
                    session.state(),
                    media.connection_state(),
                    metadata.latest_snapshot().len(),
                    stats.messages,
                    stats.malformed,
                    stats.reconnects,
                    render.ticks(),
                );
            }
        }
    }

    // Teardown: overlay, metadata, then signaling (which closes the media)
    tracker.close();
    if render.close().await.is_none() {
        warn!("Render loop ended abnormally");
    }
    metadata.close().await;
    session.close().await;

    if tokio::time::timeout(Duration::from_secs(5), tracker.wait()).await.is_err() {
        warn!("Shutdown timed out after 5s");
    }
    info!("Edgewatch Viewer stopped");
    Ok(())
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("edgewatch=info".parse().unwrap())
                .add_directive("edgewatch_viewer=info".parse().unwrap()),
        )
        .init();
}
