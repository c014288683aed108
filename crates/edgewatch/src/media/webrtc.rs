//! `PeerConnection` backed by webrtc-rs.
//!
//! Registers the default codecs and interceptors, answers the edge's offer
//! and forwards connection state, gathered candidates and inbound tracks as
//! [`PeerEvent`]s.

use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_remote::TrackRemote;

use super::{MediaStream, PeerConnection, PeerConnectionState, PeerEvent};
use crate::IceCandidate;

/// Public STUN server used when none is configured
pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

pub struct WebRtcPeer {
    pc: Arc<RTCPeerConnection>,
    /// Inbound track readers
    readers: TaskTracker,
    cancel: CancellationToken,
}

impl WebRtcPeer {
    /// Create a peer connection and the receiving end of its event channel.
    pub async fn new(ice_servers: Vec<String>) -> Result<(Self, mpsc::UnboundedReceiver<PeerEvent>)> {
        let mut media = MediaEngine::default();
        media
            .register_default_codecs()
            .context("Failed to register codecs")?;
        let registry = register_default_interceptors(Registry::new(), &mut media)
            .context("Failed to register interceptors")?;

        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        let pc = api
            .new_peer_connection(RTCConfiguration {
                ice_servers: vec![RTCIceServer {
                    urls: ice_servers,
                    ..Default::default()
                }],
                ..Default::default()
            })
            .await
            .context("Failed to create peer connection")?;
        let pc = Arc::new(pc);

        let (tx, rx) = mpsc::unbounded_channel();

        let state_tx = tx.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            debug!(%state, "Peer connection state changed");
            if let Some(state) = map_state(state) {
                let _ = state_tx.send(PeerEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let candidate_tx = tx.clone();
        pc.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let candidate_tx = candidate_tx.clone();
            Box::pin(async move {
                // None marks the end of gathering
                let Some(candidate) = candidate else { return };
                match candidate.to_json() {
                    Ok(init) => {
                        let _ = candidate_tx.send(PeerEvent::LocalCandidate(IceCandidate {
                            candidate: init.candidate,
                            sdp_mline_index: init.sdp_mline_index.unwrap_or(0),
                        }));
                    }
                    Err(e) => warn!(error = %e, "Failed to serialize local candidate"),
                }
            })
        }));

        let readers = TaskTracker::new();
        let cancel = CancellationToken::new();

        let track_tx = tx;
        let track_readers = readers.clone();
        let track_cancel = cancel.clone();
        pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let stream = MediaStream::new(track.id(), track.kind().to_string());
                let _ = track_tx.send(PeerEvent::TrackAdded(stream.clone()));
                let cancel = track_cancel.clone();
                track_readers.spawn(async move {
                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            read = track.read_rtp() => match read {
                                Ok((packet, _)) => {
                                    stream.publish(packet.payload);
                                }
                                Err(_) => break,
                            },
                        }
                    }
                    debug!(track = stream.id(), "Inbound track ended");
                });
                Box::pin(async {})
            },
        ));

        Ok((
            Self {
                pc,
                readers,
                cancel,
            },
            rx,
        ))
    }
}

fn map_state(state: RTCPeerConnectionState) -> Option<PeerConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(PeerConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(PeerConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(PeerConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(PeerConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(PeerConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(PeerConnectionState::Closed),
        _ => None,
    }
}

#[async_trait::async_trait]
impl PeerConnection for WebRtcPeer {
    async fn set_remote_offer(&self, sdp: String) -> Result<()> {
        let offer = RTCSessionDescription::offer(sdp).context("Invalid offer SDP")?;
        self.pc.set_remote_description(offer).await?;
        Ok(())
    }

    async fn create_answer(&self) -> Result<String> {
        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer.clone()).await?;
        Ok(answer.sdp)
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.pc
            .add_ice_candidate(RTCIceCandidateInit {
                candidate: candidate.candidate,
                sdp_mline_index: Some(candidate.sdp_mline_index),
                ..Default::default()
            })
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.cancel.cancel();
        self.readers.close();
        let closed = self.pc.close().await;
        self.readers.wait().await;
        closed?;
        Ok(())
    }
}

impl Drop for WebRtcPeer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
