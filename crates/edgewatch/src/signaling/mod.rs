//! Signaling session: offer/answer/candidate negotiation with an edge
//!
//! One session negotiates one [`MediaSession`]. `connect()` spawns a driver
//! task and returns immediately; state changes are published on a `watch`
//! channel. Messages that do not fit the current state are logged and
//! dropped, never queued. There is no automatic reconnect: once closed, a
//! session is finished and the caller builds a new one to retry.

mod negotiator;

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::Result;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::media::{MediaSession, PeerEvent};
use crate::SignalMessage;

pub(crate) use negotiator::Negotiator;

/// Coarse negotiation state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    /// Not connected (initial, and terminal after `close()`)
    Idle,
    /// Channel open, waiting for the edge's offer
    AwaitingOffer,
    /// Answer sent, waiting for the transport to connect
    NegotiatingAnswer,
    /// Answer sent and local candidates are being trickled
    ExchangingCandidates,
    Connected,
    Disconnected,
    Failed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Idle => "idle",
            SignalingState::AwaitingOffer => "awaiting-offer",
            SignalingState::NegotiatingAnswer => "negotiating-answer",
            SignalingState::ExchangingCandidates => "exchanging-candidates",
            SignalingState::Connected => "connected",
            SignalingState::Disconnected => "disconnected",
            SignalingState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Bidirectional message channel to the remote signaling endpoint
#[async_trait::async_trait]
pub trait SignalingChannel: Send {
    async fn send(&mut self, msg: &SignalMessage) -> Result<()>;

    /// Next raw text message. `None` on graceful close, `Some(Err)` on error.
    async fn recv(&mut self) -> Option<Result<String>>;

    async fn close(&mut self) -> Result<()>;
}

/// Opens a [`SignalingChannel`]
#[async_trait::async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn open(&self) -> Result<Box<dyn SignalingChannel>>;
}

/// A negotiation with one edge
pub struct SignalingSession {
    state: Arc<watch::Sender<SignalingState>>,
    media: Arc<MediaSession>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    started: AtomicBool,
    closed: AtomicBool,
}

impl SignalingSession {
    pub fn new(media: Arc<MediaSession>) -> Self {
        Self {
            state: Arc::new(watch::Sender::new(SignalingState::Idle)),
            media,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Open the signaling channel in the background and start negotiating.
    ///
    /// Returns immediately. A second call, or a call after `close()`, does
    /// nothing.
    pub fn connect(&self, connector: Arc<dyn SignalingConnector>) {
        if self.closed.load(Ordering::Acquire) {
            warn!("Signaling session already closed; build a new session to retry");
            return;
        }
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("Signaling session already connecting");
            return;
        }
        let Some(events) = self.media.take_events() else {
            warn!("Media session events already consumed; cannot negotiate");
            let prev = self.state.send_replace(SignalingState::Failed);
            info!(from = %prev, to = %SignalingState::Failed, "Signaling state changed");
            return;
        };

        let negotiator = Negotiator::new(Arc::clone(&self.state), Arc::clone(&self.media));
        let cancel = self.cancel.clone();
        self.tracker
            .spawn(drive(negotiator, connector, events, cancel));
    }

    pub fn state(&self) -> SignalingState {
        *self.state.borrow()
    }

    /// State-change notifications
    pub fn subscribe(&self) -> watch::Receiver<SignalingState> {
        self.state.subscribe()
    }

    pub fn media(&self) -> &Arc<MediaSession> {
        &self.media
    }

    /// Tear down: media session first, then the signaling channel.
    ///
    /// Safe mid-negotiation, before `connect()`, and more than once.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        // The driver already closed the media if it ran; this covers the rest
        self.media.close().await;
        let prev = self.state.send_replace(SignalingState::Idle);
        info!(from = %prev, "Signaling session closed");
    }
}

impl Drop for SignalingSession {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn next_event(events: &mut Option<mpsc::UnboundedReceiver<PeerEvent>>) -> Option<PeerEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

/// Driver task: owns the channel, applies messages and peer events in
/// arrival order, tears down on cancel.
async fn drive(
    mut negotiator: Negotiator,
    connector: Arc<dyn SignalingConnector>,
    events: mpsc::UnboundedReceiver<PeerEvent>,
    cancel: CancellationToken,
) {
    let mut channel = tokio::select! {
        _ = cancel.cancelled() => {
            negotiator.media().close().await;
            return;
        }
        result = connector.open() => match result {
            Ok(channel) => channel,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "Failed to open signaling channel");
                negotiator.transition(SignalingState::Failed, "channel open failed");
                return;
            }
        }
    };
    negotiator.transition(SignalingState::AwaitingOffer, "channel open");

    let mut events = Some(events);
    let mut channel_open = true;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            msg = channel.recv(), if channel_open => match msg {
                Some(Ok(text)) => negotiator.handle_text(&text, &mut *channel).await,
                Some(Err(e)) => {
                    channel_open = false;
                    negotiator.on_channel_closed(Some(e));
                }
                None => {
                    channel_open = false;
                    negotiator.on_channel_closed(None);
                }
            },
            event = next_event(&mut events) => match event {
                Some(event) => {
                    let channel: Option<&mut dyn SignalingChannel> =
                        if channel_open { Some(&mut *channel) } else { None };
                    negotiator.handle_peer_event(event, channel).await;
                }
                None => {
                    debug!("Peer event stream ended");
                    events = None;
                }
            },
        }
    }

    negotiator.media().close().await;
    if let Err(e) = channel.close().await {
        debug!(error = %e, "Error closing signaling channel");
    }
    debug!("Signaling driver stopped");
}
