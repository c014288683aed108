//! Wire protocol: signaling messages, endpoint paths and shared constants

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Edge: current system metrics
pub const PATH_EDGE_METRICS: &str = "/api/metrics";
/// Edge: tracked-object push channel
pub const PATH_METADATA_WS: &str = "/ws/metadata";
/// Edge: media negotiation channel
pub const PATH_SIGNALING_WS: &str = "/ws/signaling";
/// Center: edge listing
pub const PATH_EDGES: &str = "/api/edges";
/// Center: load balancer status
pub const PATH_BALANCER_STATUS: &str = "/api/balancer/status";
/// Center: start an offload (query: `source_edge`, `target_edge`)
pub const PATH_BALANCER_OFFLOAD: &str = "/api/balancer/offload";
/// Center: stop an offload (followed by `/{edge_id}`)
pub const PATH_BALANCER_STOP: &str = "/api/balancer/stop";

/// Delay before reopening a closed metadata channel
pub const METADATA_RETRY_INTERVAL: Duration = Duration::from_secs(3);
/// Interval between center status polls
pub const STATUS_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// Speeds strictly above this (km/h) are drawn as overspeed
pub const OVERSPEED_KMH: f64 = 60.0;

/// ICE candidate as carried on the signaling channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMLineIndex", default)]
    pub sdp_mline_index: u16,
}

/// Signaling channel message.
///
/// JSON objects tagged by `type`. There are no sequence numbers; the session
/// state machine decides which messages are valid when.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    Offer {
        sdp: String,
    },
    Answer {
        sdp: String,
    },
    IceCandidate {
        candidate: String,
        #[serde(rename = "sdpMLineIndex", default)]
        sdp_mline_index: u16,
    },
}

impl From<IceCandidate> for SignalMessage {
    fn from(c: IceCandidate) -> Self {
        SignalMessage::IceCandidate {
            candidate: c.candidate,
            sdp_mline_index: c.sdp_mline_index,
        }
    }
}

impl SignalMessage {
    /// Short name used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Offer { .. } => "offer",
            SignalMessage::Answer { .. } => "answer",
            SignalMessage::IceCandidate { .. } => "ice-candidate",
        }
    }

    pub fn decode(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn encode(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}
