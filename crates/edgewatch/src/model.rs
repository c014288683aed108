//! Edge, metrics and tracked-object types

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Identifies an edge node in the system.
///
/// Opaque and stable per edge; used as the primary key everywhere.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EdgeId(String);

impl EdgeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True for the empty id (an unset UI selection)
    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EdgeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for EdgeId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Reachability of an edge as reported by the center
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeStatus {
    Online,
    Offline,
}

/// An edge as returned by the listing endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub status: EdgeStatus,
    #[serde(default)]
    pub metrics: Option<Metrics>,
}

impl Edge {
    pub fn is_online(&self) -> bool {
        self.status == EdgeStatus::Online
    }
}

/// CPU usage above which a metric is shown as a warning (percent)
pub const CPU_WARN_THRESHOLD: f32 = 85.0;
/// GPU usage above which a metric is shown as a warning (percent)
pub const GPU_WARN_THRESHOLD: f32 = 80.0;
/// RAM usage above which a metric is shown as a warning (percent)
pub const RAM_WARN_THRESHOLD: f32 = 90.0;
/// Temperature above which a metric is shown as a warning (Celsius)
pub const TEMP_WARN_THRESHOLD: f32 = 75.0;

/// Health metrics of one edge. Replaced wholesale on each fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metrics {
    /// CPU usage percentage (0-100)
    #[serde(default)]
    pub cpu_usage: Option<f32>,
    /// GPU usage percentage (0-100)
    #[serde(default)]
    pub gpu_usage: Option<f32>,
    /// RAM usage percentage (0-100)
    #[serde(default)]
    pub ram_usage: Option<f32>,
    /// Temperature in Celsius
    #[serde(default)]
    pub temp: Option<f32>,
    /// Power draw in watts
    #[serde(default)]
    pub power: Option<f32>,
}

impl Metrics {
    /// Coarse load classification from the busier of CPU and GPU.
    ///
    /// Missing values count as idle.
    pub fn load_level(&self) -> LoadLevel {
        let load = self
            .cpu_usage
            .unwrap_or(0.0)
            .max(self.gpu_usage.unwrap_or(0.0));
        if load < 50.0 {
            LoadLevel::Low
        } else if load < 70.0 {
            LoadLevel::Medium
        } else if load < 85.0 {
            LoadLevel::High
        } else {
            LoadLevel::Critical
        }
    }

    /// Metrics currently above their display thresholds
    pub fn warnings(&self) -> Vec<MetricWarning> {
        let checks = [
            ("cpu", self.cpu_usage, CPU_WARN_THRESHOLD),
            ("gpu", self.gpu_usage, GPU_WARN_THRESHOLD),
            ("ram", self.ram_usage, RAM_WARN_THRESHOLD),
            ("temp", self.temp, TEMP_WARN_THRESHOLD),
        ];
        checks
            .into_iter()
            .filter_map(|(name, value, threshold)| {
                value
                    .filter(|v| *v > threshold)
                    .map(|value| MetricWarning { name, value, threshold })
            })
            .collect()
    }
}

/// A metric over its display threshold
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricWarning {
    pub name: &'static str,
    pub value: f32,
    pub threshold: f32,
}

impl fmt::Display for MetricWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {:.1} > {:.1}", self.name, self.value, self.threshold)
    }
}

/// Load classification of an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LoadLevel {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for LoadLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadLevel::Low => write!(f, "low"),
            LoadLevel::Medium => write!(f, "medium"),
            LoadLevel::High => write!(f, "high"),
            LoadLevel::Critical => write!(f, "critical"),
        }
    }
}

/// A tracked vehicle in the pixel space of the source frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackedObject {
    pub track_id: i64,
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
    /// Estimated speed in km/h
    #[serde(default)]
    pub speed: Option<f64>,
    /// Recognized license plate
    #[serde(default)]
    pub plate: Option<String>,
}

impl TrackedObject {
    /// Strictly above `limit`; unknown speed is never overspeed.
    pub fn is_overspeed(&self, limit: f64) -> bool {
        self.speed.is_some_and(|s| s > limit)
    }
}

/// Immutable set of tracked objects, replaced atomically on every push
pub type Snapshot = Arc<[TrackedObject]>;

/// The empty snapshot held before any metadata arrives
pub fn empty_snapshot() -> Snapshot {
    Arc::from(Vec::new())
}
