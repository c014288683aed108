//! Edgewatch - live monitoring of camera-equipped edge nodes
//!
//! This is the library crate shared by the edge viewer and the center
//! dashboard. Feature flags control which transport adapters are compiled:
//!
//! - **Core** (always available): edge/metrics/tracked-object types, the
//!   signaling state machine, media session, metadata consumer, overlay
//!   render loop, offload coordinator and auto-balancer
//! - **`ws`**: WebSocket signaling channel and metadata source
//! - **`http`**: REST clients for the center and edge APIs
//! - **`webrtc`**: `PeerConnection` backed by webrtc-rs

// Core modules (always compiled)
mod grid;
mod model;
mod protocol;

pub mod media;
pub mod metadata;
pub mod offload;
pub mod overlay;
pub mod signaling;

pub use grid::{Slot, ViewGrid, GRID_SLOTS};
pub use model::*;
pub use protocol::*;

// HTTP: center and edge REST clients
#[cfg(feature = "http")]
pub mod api;

// WebSocket: signaling channel and metadata source
#[cfg(feature = "ws")]
pub mod ws;
