//! Media session: the negotiated peer connection and its inbound stream
//!
//! The transport itself sits behind [`PeerConnection`]. A session is created
//! for one negotiation; the signaling driver feeds it the peer's events and
//! consumers observe liveness, the attached stream and the frame size
//! through `watch` channels.

#[cfg(feature = "webrtc")]
pub mod webrtc;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use bytes::Bytes;
use tokio::sync::{broadcast, mpsc, watch};
use tracing::{debug, info, warn};

use crate::IceCandidate;

/// Capacity of the inbound packet broadcast per stream
const PACKET_BUFFER: usize = 256;

/// Coarse connection state reported by the transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl fmt::Display for PeerConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerConnectionState::New => write!(f, "new"),
            PeerConnectionState::Connecting => write!(f, "connecting"),
            PeerConnectionState::Connected => write!(f, "connected"),
            PeerConnectionState::Disconnected => write!(f, "disconnected"),
            PeerConnectionState::Failed => write!(f, "failed"),
            PeerConnectionState::Closed => write!(f, "closed"),
        }
    }
}

/// Asynchronous notification from the transport
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// Connection state changed
    StateChanged(PeerConnectionState),
    /// A local ICE candidate was gathered and should be sent to the remote side
    LocalCandidate(IceCandidate),
    /// An inbound media track started
    TrackAdded(MediaStream),
}

/// Transport-independent peer connection.
///
/// The viewer is always the answering side: the edge offers, we answer.
#[async_trait::async_trait]
pub trait PeerConnection: Send + Sync {
    /// Apply the remote offer as the remote description
    async fn set_remote_offer(&self, sdp: String) -> Result<()>;

    /// Create an answer, apply it as the local description and return its SDP
    async fn create_answer(&self) -> Result<String>;

    /// Add a remote ICE candidate
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    /// Tear down the transport
    async fn close(&self) -> Result<()>;
}

/// Dimensions of the decoded video frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameSize {
    pub width: u32,
    pub height: u32,
}

impl FrameSize {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl Default for FrameSize {
    fn default() -> Self {
        Self::new(1280, 720)
    }
}

impl fmt::Display for FrameSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Handle to an inbound media track.
///
/// Cloning is cheap; all clones share the packet broadcast.
#[derive(Clone)]
pub struct MediaStream {
    id: String,
    kind: String,
    packets: broadcast::Sender<Bytes>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>, kind: impl Into<String>) -> Self {
        let (packets, _) = broadcast::channel(PACKET_BUFFER);
        Self {
            id: id.into(),
            kind: kind.into(),
            packets,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Media kind, e.g. "video"
    pub fn kind(&self) -> &str {
        &self.kind
    }

    /// Subscribe to inbound packet payloads
    pub fn subscribe(&self) -> broadcast::Receiver<Bytes> {
        self.packets.subscribe()
    }

    /// Publish an inbound payload. Returns the number of subscribers reached.
    pub fn publish(&self, payload: Bytes) -> usize {
        self.packets.send(payload).unwrap_or(0)
    }
}

impl fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("subscribers", &self.packets.receiver_count())
            .finish()
    }
}

/// A negotiated (or negotiating) media session
pub struct MediaSession {
    peer: Arc<dyn PeerConnection>,
    events: Mutex<Option<mpsc::UnboundedReceiver<PeerEvent>>>,
    connection: watch::Sender<PeerConnectionState>,
    stream: watch::Sender<Option<MediaStream>>,
    frame_size: watch::Sender<Option<FrameSize>>,
    closed: AtomicBool,
}

impl MediaSession {
    /// Wrap a transport and the receiving end of its event channel
    pub fn new(peer: Arc<dyn PeerConnection>, events: mpsc::UnboundedReceiver<PeerEvent>) -> Self {
        Self {
            peer,
            events: Mutex::new(Some(events)),
            connection: watch::Sender::new(PeerConnectionState::New),
            stream: watch::Sender::new(None),
            frame_size: watch::Sender::new(None),
            closed: AtomicBool::new(false),
        }
    }

    /// True iff the latest connection-state report was `Connected`
    pub fn is_connected(&self) -> bool {
        *self.connection.borrow() == PeerConnectionState::Connected
    }

    /// Latest connection-state report
    pub fn connection_state(&self) -> PeerConnectionState {
        *self.connection.borrow()
    }

    pub fn subscribe_connection(&self) -> watch::Receiver<PeerConnectionState> {
        self.connection.subscribe()
    }

    /// Stream-attached notification; becomes `Some` at most once
    pub fn on_stream_attached(&self) -> watch::Receiver<Option<MediaStream>> {
        self.stream.subscribe()
    }

    pub fn stream(&self) -> Option<MediaStream> {
        self.stream.borrow().clone()
    }

    /// Report the size of the latest decoded frame
    pub fn report_frame_size(&self, size: FrameSize) {
        self.frame_size.send_if_modified(|current| {
            if *current == Some(size) {
                false
            } else {
                debug!(%size, "Frame size changed");
                *current = Some(size);
                true
            }
        });
    }

    /// Latest frame size; `None` until the first frame is decoded
    pub fn frame_size(&self) -> watch::Receiver<Option<FrameSize>> {
        self.frame_size.subscribe()
    }

    /// Apply a remote offer and produce the matching answer SDP
    pub async fn accept_offer(&self, sdp: String) -> Result<String> {
        self.peer
            .set_remote_offer(sdp)
            .await
            .context("Failed to apply remote offer")?;
        self.peer
            .create_answer()
            .await
            .context("Failed to create answer")
    }

    pub async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        self.peer
            .add_ice_candidate(candidate)
            .await
            .context("Failed to add ICE candidate")
    }

    /// Take the peer's event receiver. Only the first caller gets it.
    pub(crate) fn take_events(&self) -> Option<mpsc::UnboundedReceiver<PeerEvent>> {
        self.events.lock().ok().and_then(|mut guard| guard.take())
    }

    /// Update liveness and stream state from a transport event
    pub(crate) fn observe(&self, event: &PeerEvent) {
        match event {
            PeerEvent::StateChanged(state) => {
                if self.closed.load(Ordering::Acquire) {
                    return;
                }
                self.connection.send_replace(*state);
            }
            PeerEvent::TrackAdded(stream) => {
                let attached = self.stream.send_if_modified(|current| {
                    if current.is_some() {
                        false
                    } else {
                        *current = Some(stream.clone());
                        true
                    }
                });
                if attached {
                    info!(track = stream.id(), kind = stream.kind(), "Media stream attached");
                } else {
                    debug!(track = stream.id(), "Ignoring additional media track");
                }
            }
            PeerEvent::LocalCandidate(_) => {}
        }
    }

    /// Close the transport. Safe to call repeatedly or before negotiation.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = self.peer.close().await {
            warn!(error = %e, "Error closing peer connection");
        }
        self.connection.send_replace(PeerConnectionState::Closed);
        debug!("Media session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}
