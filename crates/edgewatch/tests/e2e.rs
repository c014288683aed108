//! E2E tests for the WebSocket and HTTP adapters
//!
//! Each test starts a small axum server on an ephemeral port that plays the
//! edge or the center, then drives the library against it over real sockets.
//!
//! Run: `cargo test -p edgewatch --test e2e`

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json};
use serde::Deserialize;
use tokio::sync::mpsc;

use edgewatch::api::{HttpCenterApi, HttpEdgeApi};
use edgewatch::media::{MediaSession, PeerConnection, PeerConnectionState, PeerEvent};
use edgewatch::metadata::{MetadataConsumer, RetryPolicy};
use edgewatch::offload::{OffloadCoordinator, OffloadError, StartOutcome, StopOutcome};
use edgewatch::signaling::{SignalingSession, SignalingState};
use edgewatch::ws::{WsMetadataSource, WsSignalingConnector};
use edgewatch::{EdgeId, IceCandidate, LoadLevel, SignalMessage};

// ── Shared helpers ───────────────────────────────────────────────────

/// Serve `app` on an ephemeral port, return the bound address.
async fn serve(app: axum::Router) -> SocketAddr {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn base_url(addr: SocketAddr) -> String {
    format!("http://{}", addr)
}

fn id(s: &str) -> EdgeId {
    EdgeId::new(s)
}

// ═══════════════════════════════════════════════════════════════════════
// Metadata channel
// ═══════════════════════════════════════════════════════════════════════

/// Every connection gets two snapshots and is then closed by the edge.
async fn metadata_ws(
    ws: WebSocketUpgrade,
    State(connections): State<Arc<AtomicUsize>>,
) -> impl IntoResponse {
    connections.fetch_add(1, Ordering::SeqCst);
    ws.on_upgrade(|mut socket: WebSocket| async move {
        let snapshots = [
            r#"[{"track_id":1,"x":10,"y":10,"width":50,"height":40,"speed":72.5,"plate":"12가3456"},
                {"track_id":2,"x":90,"y":10,"width":50,"height":40}]"#,
            r#"[{"track_id":3,"x":20,"y":30,"width":60,"height":45,"speed":41.0}]"#,
        ];
        for snapshot in snapshots {
            if socket.send(Message::Text(snapshot.into())).await.is_err() {
                return;
            }
        }
        let _ = socket.send(Message::Close(None)).await;
    })
}

#[tokio::test]
async fn metadata_consumer_keeps_latest_snapshot_across_reconnects() {
    let connections = Arc::new(AtomicUsize::new(0));
    let app = axum::Router::new()
        .route("/ws/metadata", axum::routing::get(metadata_ws))
        .with_state(connections.clone());
    let addr = serve(app).await;

    let source = Arc::new(WsMetadataSource::new(&base_url(addr)).unwrap());
    let consumer = MetadataConsumer::spawn(source, RetryPolicy::fixed(Duration::from_millis(50)));

    let mut rx = consumer.subscribe();
    tokio::time::timeout(
        Duration::from_secs(5),
        rx.wait_for(|s| s.len() == 1 && s[0].track_id == 3),
    )
    .await
    .expect("no snapshot from edge")
    .unwrap();

    tokio::time::timeout(Duration::from_secs(5), async {
        while connections.load(Ordering::SeqCst) < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("consumer did not reconnect");

    let snapshot = consumer.latest_snapshot();
    assert_eq!(snapshot.len(), 1);
    assert_eq!(snapshot[0].track_id, 3);
    assert_eq!(snapshot[0].plate, None);
    assert!(consumer.stats().messages >= 2);
    assert_eq!(consumer.stats().malformed, 0);

    consumer.close().await;
    assert!(!consumer.is_connected());
}

#[tokio::test]
async fn metadata_consumer_retries_unreachable_edge() {
    // Bind then drop to get a port nobody listens on
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let source = Arc::new(WsMetadataSource::new(&base_url(addr)).unwrap());
    let consumer = MetadataConsumer::spawn(source, RetryPolicy::fixed(Duration::from_millis(20)));

    tokio::time::timeout(Duration::from_secs(5), async {
        while consumer.stats().reconnects < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("consumer gave up retrying");

    assert!(consumer.latest_snapshot().is_empty());
    assert!(!consumer.is_connected());
    consumer.close().await;
}

// ═══════════════════════════════════════════════════════════════════════
// Signaling channel
// ═══════════════════════════════════════════════════════════════════════

const EDGE_OFFER: &str = r#"{"type":"offer","sdp":"v=0 edge-offer"}"#;
const EDGE_CANDIDATE: &str =
    r#"{"type":"ice-candidate","candidate":"candidate:1 1 UDP 2122 10.0.0.7 5000 typ host","sdpMLineIndex":0}"#;

/// Sends an offer, answers the answer with a candidate, and reports
/// everything it receives (plus "closed" at the end) on the channel.
async fn signaling_ws(
    ws: WebSocketUpgrade,
    State(received): State<mpsc::UnboundedSender<String>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |mut socket: WebSocket| async move {
        if socket.send(Message::Text(EDGE_OFFER.into())).await.is_err() {
            return;
        }
        while let Some(Ok(message)) = socket.recv().await {
            match message {
                Message::Text(text) => {
                    let text = text.as_str().to_string();
                    let is_answer = text.contains(r#""type":"answer""#);
                    let _ = received.send(text);
                    if is_answer {
                        let _ = socket.send(Message::Text(EDGE_CANDIDATE.into())).await;
                    }
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
        let _ = received.send("closed".to_string());
    })
}

/// Answers every offer with a fixed SDP and records remote candidates
#[derive(Default)]
struct ScriptedPeer {
    offers: Mutex<Vec<String>>,
    candidates: Mutex<Vec<IceCandidate>>,
}

#[async_trait::async_trait]
impl PeerConnection for ScriptedPeer {
    async fn set_remote_offer(&self, sdp: String) -> Result<()> {
        self.offers.lock().unwrap().push(sdp);
        Ok(())
    }

    async fn create_answer(&self) -> Result<String> {
        Ok("v=0 viewer-answer".to_string())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.candidates.lock().unwrap().push(candidate);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

async fn wait_for_state(rx: &mut tokio::sync::watch::Receiver<SignalingState>, want: SignalingState) {
    tokio::time::timeout(Duration::from_secs(5), rx.wait_for(|s| *s == want))
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {}", want))
        .unwrap();
}

async fn next_received(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("edge received nothing")
        .expect("edge handler gone")
}

#[tokio::test]
async fn signaling_negotiates_with_edge_over_websocket() {
    let (received_tx, mut received) = mpsc::unbounded_channel();
    let app = axum::Router::new()
        .route("/ws/signaling", axum::routing::get(signaling_ws))
        .with_state(received_tx);
    let addr = serve(app).await;

    let peer = Arc::new(ScriptedPeer::default());
    let (peer_events, events_rx) = mpsc::unbounded_channel();
    let media = Arc::new(MediaSession::new(peer.clone(), events_rx));
    let session = SignalingSession::new(media);
    let mut states = session.subscribe();

    let connector = WsSignalingConnector::new(&base_url(addr)).unwrap();
    session.connect(Arc::new(connector));

    wait_for_state(&mut states, SignalingState::NegotiatingAnswer).await;
    assert_eq!(peer.offers.lock().unwrap().as_slice(), ["v=0 edge-offer".to_string()]);

    // The edge sees our answer in wire format
    let answer = SignalMessage::decode(&next_received(&mut received).await).unwrap();
    assert_eq!(
        answer,
        SignalMessage::Answer {
            sdp: "v=0 viewer-answer".into()
        }
    );

    // Local candidate goes out over the same channel
    peer_events
        .send(PeerEvent::LocalCandidate(IceCandidate {
            candidate: "candidate:9 1 UDP 1 192.168.1.2 6000 typ host".into(),
            sdp_mline_index: 0,
        }))
        .unwrap();
    wait_for_state(&mut states, SignalingState::ExchangingCandidates).await;
    let local = SignalMessage::decode(&next_received(&mut received).await).unwrap();
    assert_eq!(local.kind(), "ice-candidate");

    peer_events
        .send(PeerEvent::StateChanged(PeerConnectionState::Connected))
        .unwrap();
    wait_for_state(&mut states, SignalingState::Connected).await;
    assert!(session.media().is_connected());

    // The edge's candidate was applied
    tokio::time::timeout(Duration::from_secs(5), async {
        while peer.candidates.lock().unwrap().is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("edge candidate not applied");
    assert_eq!(peer.candidates.lock().unwrap()[0].sdp_mline_index, 0);

    session.close().await;
    assert_eq!(session.state(), SignalingState::Idle);
    assert_eq!(next_received(&mut received).await, "closed");
}

#[tokio::test]
async fn signaling_fails_when_edge_is_unreachable() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (_peer_events, events_rx) = mpsc::unbounded_channel();
    let media = Arc::new(MediaSession::new(Arc::new(ScriptedPeer::default()), events_rx));
    let session = SignalingSession::new(media);
    let mut states = session.subscribe();
    session.connect(Arc::new(WsSignalingConnector::new(&base_url(addr)).unwrap()));

    wait_for_state(&mut states, SignalingState::Failed).await;
    session.close().await;
}

// ═══════════════════════════════════════════════════════════════════════
// Center and edge HTTP APIs
// ═══════════════════════════════════════════════════════════════════════

/// In-memory center: applies commands to its own status like the real one
#[derive(Default)]
struct FakeCenter {
    active: Mutex<BTreeMap<String, String>>,
    commands: Mutex<Vec<String>>,
    /// Answer polls with 503
    unavailable: AtomicBool,
}

#[derive(Deserialize)]
struct OffloadParams {
    source_edge: String,
    target_edge: String,
}

async fn api_edges(
    State(center): State<Arc<FakeCenter>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if center.unavailable.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    Ok(Json(serde_json::json!({
        "edges": [
            { "id": "edge-1", "status": "online", "metrics": { "gpu_usage": 95.0, "cpu_usage": 40.0 } },
            { "id": "edge-2", "status": "online", "metrics": { "gpu_usage": 12.0, "cpu_usage": 20.0 } },
            { "id": "edge-3", "status": "offline" },
        ]
    })))
}

async fn api_status(
    State(center): State<Arc<FakeCenter>>,
) -> Result<Json<serde_json::Value>, StatusCode> {
    if center.unavailable.load(Ordering::SeqCst) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }
    let active = center.active.lock().unwrap().clone();
    Ok(Json(serde_json::json!({
        "active_offloads": active,
        "edge_count": 3,
        "overloaded_edges": ["edge-1"],
    })))
}

async fn api_offload(
    State(center): State<Arc<FakeCenter>>,
    Query(params): Query<OffloadParams>,
) -> Json<serde_json::Value> {
    center
        .commands
        .lock()
        .unwrap()
        .push(format!("start {} {}", params.source_edge, params.target_edge));
    center
        .active
        .lock()
        .unwrap()
        .insert(params.source_edge.clone(), params.target_edge.clone());
    Json(serde_json::json!({
        "status": "offload_started",
        "source": params.source_edge,
        "target": params.target_edge,
    }))
}

async fn api_stop(
    State(center): State<Arc<FakeCenter>>,
    Path(edge_id): Path<String>,
) -> Json<serde_json::Value> {
    center.commands.lock().unwrap().push(format!("stop {}", edge_id));
    center.active.lock().unwrap().remove(&edge_id);
    Json(serde_json::json!({ "status": "offload_stopped", "edge_id": edge_id }))
}

async fn start_center() -> (Arc<FakeCenter>, SocketAddr) {
    let center = Arc::new(FakeCenter::default());
    let app = axum::Router::new()
        .route("/api/edges", axum::routing::get(api_edges))
        .route("/api/balancer/status", axum::routing::get(api_status))
        .route("/api/balancer/offload", axum::routing::post(api_offload))
        .route("/api/balancer/stop/{edge_id}", axum::routing::post(api_stop))
        .with_state(center.clone());
    let addr = serve(app).await;
    (center, addr)
}

#[tokio::test]
async fn coordinator_round_trip_against_center() {
    let (center, addr) = start_center().await;
    let api = Arc::new(HttpCenterApi::new(&base_url(addr)).unwrap());
    let coordinator = OffloadCoordinator::new(api);

    coordinator.refresh().await;
    assert_eq!(coordinator.edges().len(), 3);
    assert_eq!(coordinator.eligible_sources(), vec![id("edge-1"), id("edge-2")]);
    assert_eq!(coordinator.overloaded_sources(), vec![id("edge-1")]);

    // Local validation never reaches the center
    let err = coordinator
        .start_offload(&id("edge-1"), &id("edge-1"))
        .await
        .unwrap_err();
    assert!(matches!(err, OffloadError::SelfOffload(_)));
    let err = coordinator
        .start_offload(&id("edge-1"), &id("edge-3"))
        .await
        .unwrap_err();
    assert!(matches!(err, OffloadError::EdgeOffline(_)));
    assert!(center.commands.lock().unwrap().is_empty());

    let outcome = coordinator
        .start_offload(&id("edge-1"), &id("edge-2"))
        .await
        .unwrap();
    assert_eq!(outcome, StartOutcome::Started);

    coordinator.refresh().await;
    let status = coordinator.status();
    assert_eq!(status.target_of(&id("edge-1")), Some(&id("edge-2")));
    assert_eq!(status.active_offloads.len(), 1);
    assert_eq!(status.edge_count, Some(3));

    assert_eq!(
        coordinator
            .start_offload(&id("edge-1"), &id("edge-2"))
            .await
            .unwrap(),
        StartOutcome::AlreadyActive
    );

    assert_eq!(
        coordinator.stop_offload(&id("edge-1")).await.unwrap(),
        StopOutcome::Stopped
    );
    assert_eq!(
        coordinator.stop_offload(&id("edge-1")).await.unwrap(),
        StopOutcome::NotActive
    );

    coordinator.refresh().await;
    assert!(coordinator.status().active_offloads.is_empty());
    assert_eq!(
        center.commands.lock().unwrap().as_slice(),
        ["start edge-1 edge-2".to_string(), "stop edge-1".to_string()]
    );
}

#[tokio::test]
async fn unavailable_center_keeps_previous_cache() {
    let (center, addr) = start_center().await;
    let api = Arc::new(HttpCenterApi::new(&base_url(addr)).unwrap());
    let coordinator = OffloadCoordinator::new(api);
    coordinator.refresh().await;
    coordinator
        .start_offload(&id("edge-1"), &id("edge-2"))
        .await
        .unwrap();
    coordinator.refresh().await;
    let edges = coordinator.edges();
    let status = coordinator.status();

    center.unavailable.store(true, Ordering::SeqCst);
    coordinator.refresh().await;
    assert!(coordinator.refresh_status().await.is_err());

    assert_eq!(coordinator.edges(), edges);
    assert_eq!(coordinator.status(), status);
    assert_eq!(status.target_of(&id("edge-1")), Some(&id("edge-2")));

    // The stale cache cannot rule an offload out, so the stop goes through
    assert_eq!(
        coordinator.stop_offload(&id("edge-2")).await.unwrap(),
        StopOutcome::Stopped
    );
    assert_eq!(
        center.commands.lock().unwrap().last().map(String::as_str),
        Some("stop edge-2")
    );
}

#[tokio::test]
async fn edge_metrics_endpoint() {
    let app = axum::Router::new().route(
        "/api/metrics",
        axum::routing::get(|| async {
            Json(serde_json::json!({
                "metrics": { "cpu_usage": 71.5, "gpu_usage": 64.0, "ram_usage": 40.0, "temp": 68.0, "power": 12.5 },
                "load_level": "high",
                "should_offload": false,
            }))
        }),
    );
    let addr = serve(app).await;

    let edge = HttpEdgeApi::new(&base_url(addr)).unwrap();
    let report = edge.metrics().await.unwrap();
    assert_eq!(report.metrics.cpu_usage, Some(71.5));
    assert_eq!(report.metrics.power, Some(12.5));
    assert_eq!(report.load_level(), LoadLevel::High);
    assert_eq!(report.should_offload, Some(false));
    assert!(report.metrics.warnings().is_empty());
}
