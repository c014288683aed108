//! Negotiation state machine.
//!
//! Applies signaling messages and peer events strictly in arrival order.
//! Kept free of task and channel ownership so every transition can be
//! driven directly.

use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{SignalingChannel, SignalingState};
use crate::media::{MediaSession, PeerConnectionState, PeerEvent};
use crate::{IceCandidate, SignalMessage};

/// Remote candidates held while waiting for the offer
const MAX_EARLY_CANDIDATES: usize = 64;

pub(crate) struct Negotiator {
    state: Arc<watch::Sender<SignalingState>>,
    media: Arc<MediaSession>,
    early_candidates: Vec<IceCandidate>,
}

impl Negotiator {
    pub(crate) fn new(state: Arc<watch::Sender<SignalingState>>, media: Arc<MediaSession>) -> Self {
        Self {
            state,
            media,
            early_candidates: Vec::new(),
        }
    }

    pub(crate) fn state(&self) -> SignalingState {
        *self.state.borrow()
    }

    pub(crate) fn media(&self) -> &Arc<MediaSession> {
        &self.media
    }

    pub(crate) fn transition(&self, next: SignalingState, reason: &str) {
        let prev = self.state.send_replace(next);
        if prev != next {
            info!(from = %prev, to = %next, reason, "Signaling state changed");
        }
    }

    /// Decode and apply one raw channel message
    pub(crate) async fn handle_text(&mut self, text: &str, channel: &mut dyn SignalingChannel) {
        match SignalMessage::decode(text) {
            Ok(msg) => self.handle_message(msg, channel).await,
            Err(e) => warn!(error = %e, len = text.len(), "Dropping malformed signaling message"),
        }
    }

    pub(crate) async fn handle_message(
        &mut self,
        msg: SignalMessage,
        channel: &mut dyn SignalingChannel,
    ) {
        let state = self.state();
        match (state, msg) {
            (SignalingState::AwaitingOffer, SignalMessage::Offer { sdp }) => {
                self.answer_offer(sdp, channel).await;
            }
            (
                _,
                SignalMessage::IceCandidate {
                    candidate,
                    sdp_mline_index,
                },
            ) => {
                self.remote_candidate(IceCandidate {
                    candidate,
                    sdp_mline_index,
                })
                .await;
            }
            (state, msg) => {
                debug!(%state, kind = msg.kind(), "Dropping out-of-state signaling message");
            }
        }
    }

    async fn answer_offer(&mut self, sdp: String, channel: &mut dyn SignalingChannel) {
        debug!(len = sdp.len(), "Received offer");
        let answer = match self.media.accept_offer(sdp).await {
            Ok(answer) => answer,
            Err(e) => {
                // Stay in AwaitingOffer; the edge may send a fresh offer
                warn!(error = %format!("{e:#}"), "Rejected offer");
                return;
            }
        };

        if let Err(e) = channel.send(&SignalMessage::Answer { sdp: answer }).await {
            warn!(error = %format!("{e:#}"), "Failed to send answer");
            self.transition(SignalingState::Failed, "answer not delivered");
            return;
        }
        self.transition(SignalingState::NegotiatingAnswer, "answer sent");

        if !self.early_candidates.is_empty() {
            debug!(count = self.early_candidates.len(), "Applying early candidates");
            for candidate in std::mem::take(&mut self.early_candidates) {
                self.apply_candidate(candidate).await;
            }
        }
    }

    async fn remote_candidate(&mut self, candidate: IceCandidate) {
        match self.state() {
            SignalingState::NegotiatingAnswer
            | SignalingState::ExchangingCandidates
            | SignalingState::Connected => self.apply_candidate(candidate).await,
            SignalingState::AwaitingOffer => {
                if self.early_candidates.len() < MAX_EARLY_CANDIDATES {
                    self.early_candidates.push(candidate);
                } else {
                    warn!("Too many candidates before offer, dropping");
                }
            }
            state => debug!(%state, "Dropping candidate for inactive session"),
        }
    }

    async fn apply_candidate(&self, candidate: IceCandidate) {
        if let Err(e) = self.media.add_ice_candidate(candidate).await {
            warn!(error = %format!("{e:#}"), "Dropping unusable remote candidate");
        }
    }

    /// Apply a transport event. `channel` is `None` once signaling has closed.
    pub(crate) async fn handle_peer_event(
        &mut self,
        event: PeerEvent,
        channel: Option<&mut dyn SignalingChannel>,
    ) {
        self.media.observe(&event);
        match event {
            PeerEvent::StateChanged(report) => self.on_connection_state(report),
            PeerEvent::LocalCandidate(candidate) => {
                let state = self.state();
                if !matches!(
                    state,
                    SignalingState::NegotiatingAnswer
                        | SignalingState::ExchangingCandidates
                        | SignalingState::Connected
                ) {
                    debug!(%state, "Dropping local candidate for inactive session");
                    return;
                }
                let Some(channel) = channel else {
                    debug!("Signaling closed, local candidate not sent");
                    return;
                };
                if let Err(e) = channel.send(&SignalMessage::from(candidate)).await {
                    warn!(error = %format!("{e:#}"), "Failed to send local candidate");
                    return;
                }
                if state == SignalingState::NegotiatingAnswer {
                    self.transition(SignalingState::ExchangingCandidates, "local candidate sent");
                }
            }
            PeerEvent::TrackAdded(_) => {}
        }
    }

    fn on_connection_state(&self, report: PeerConnectionState) {
        let state = self.state();
        match report {
            PeerConnectionState::Connected => {
                if matches!(
                    state,
                    SignalingState::NegotiatingAnswer | SignalingState::ExchangingCandidates
                ) {
                    self.transition(SignalingState::Connected, "transport connected");
                } else {
                    debug!(%state, "Ignoring connected report");
                }
            }
            PeerConnectionState::Disconnected | PeerConnectionState::Closed => {
                if !matches!(state, SignalingState::Idle | SignalingState::Failed) {
                    self.transition(SignalingState::Disconnected, "transport disconnected");
                }
            }
            PeerConnectionState::Failed => {
                if state != SignalingState::Idle {
                    self.transition(SignalingState::Failed, "transport failed");
                }
            }
            PeerConnectionState::New | PeerConnectionState::Connecting => {}
        }
    }

    /// The signaling channel ended. Only matters before the media connects.
    pub(crate) fn on_channel_closed(&self, error: Option<anyhow::Error>) {
        let state = self.state();
        match state {
            SignalingState::AwaitingOffer
            | SignalingState::NegotiatingAnswer
            | SignalingState::ExchangingCandidates => match error {
                Some(e) => {
                    warn!(error = %format!("{e:#}"), %state, "Signaling channel failed");
                    self.transition(SignalingState::Failed, "channel error");
                }
                None => self.transition(SignalingState::Disconnected, "channel closed"),
            },
            _ => debug!(%state, "Signaling channel closed"),
        }
    }
}
