//! Metadata stream consumer
//!
//! Holds the latest tracked-object snapshot pushed by an edge. The push
//! channel is reopened forever after a fixed delay whenever it closes or
//! fails to open; there is no retry limit.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::{empty_snapshot, Snapshot, TrackedObject, METADATA_RETRY_INTERVAL};

/// Delay between the end of one channel and the next open attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub interval: Duration,
}

impl RetryPolicy {
    pub const fn fixed(interval: Duration) -> Self {
        Self { interval }
    }

    /// Zero delay, for tests
    pub const fn immediate() -> Self {
        Self::fixed(Duration::ZERO)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(METADATA_RETRY_INTERVAL)
    }
}

/// Opens the push channel. Each item is one raw text message.
#[async_trait::async_trait]
pub trait MetadataSource: Send + Sync {
    async fn open(&self) -> Result<BoxStream<'static, Result<String>>>;
}

/// Counters since the consumer started
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetadataStats {
    /// Snapshots applied
    pub messages: u64,
    /// Messages that failed to decode
    pub malformed: u64,
    /// Reopen attempts after the first open
    pub reconnects: u64,
}

struct Shared {
    snapshot: watch::Sender<Snapshot>,
    connected: watch::Sender<bool>,
    messages: AtomicU64,
    malformed: AtomicU64,
    reconnects: AtomicU64,
}

impl Shared {
    fn apply(&self, text: &str) {
        match serde_json::from_str::<Vec<TrackedObject>>(text) {
            Ok(objects) => {
                debug!(count = objects.len(), "Snapshot received");
                // Counted before publishing
                self.messages.fetch_add(1, Ordering::Relaxed);
                self.snapshot.send_replace(Snapshot::from(objects));
            }
            Err(e) => {
                self.malformed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %e, len = text.len(), "Malformed metadata message, keeping previous snapshot");
            }
        }
    }
}

/// Background consumer of one edge's metadata channel
pub struct MetadataConsumer {
    shared: Arc<Shared>,
    cancel: CancellationToken,
    tracker: TaskTracker,
    closed: AtomicBool,
}

impl MetadataConsumer {
    /// Start consuming in the background. Must be called inside a Tokio runtime.
    pub fn spawn(source: Arc<dyn MetadataSource>, policy: RetryPolicy) -> Self {
        let shared = Arc::new(Shared {
            snapshot: watch::Sender::new(empty_snapshot()),
            connected: watch::Sender::new(false),
            messages: AtomicU64::new(0),
            malformed: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
        });
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        tracker.spawn(run(shared.clone(), source, policy, cancel.clone()));

        Self {
            shared,
            cancel,
            tracker,
            closed: AtomicBool::new(false),
        }
    }

    /// Whatever snapshot is held right now; never waits
    pub fn latest_snapshot(&self) -> Snapshot {
        self.shared.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<Snapshot> {
        self.shared.snapshot.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.shared.connected.borrow()
    }

    pub fn subscribe_connected(&self) -> watch::Receiver<bool> {
        self.shared.connected.subscribe()
    }

    pub fn stats(&self) -> MetadataStats {
        MetadataStats {
            messages: self.shared.messages.load(Ordering::Relaxed),
            malformed: self.shared.malformed.load(Ordering::Relaxed),
            reconnects: self.shared.reconnects.load(Ordering::Relaxed),
        }
    }

    /// Stop the loop, including a pending retry. The last snapshot stays readable.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.tracker.close();
        self.tracker.wait().await;
        debug!("Metadata consumer closed");
    }
}

impl Drop for MetadataConsumer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

enum ChannelEnd {
    Closed,
    Cancelled,
}

async fn run(
    shared: Arc<Shared>,
    source: Arc<dyn MetadataSource>,
    policy: RetryPolicy,
    cancel: CancellationToken,
) {
    let mut first = true;
    loop {
        if !first {
            shared.reconnects.fetch_add(1, Ordering::Relaxed);
        }
        first = false;

        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = source.open() => opened,
        };

        match opened {
            Ok(stream) => {
                info!("Metadata channel open");
                shared.connected.send_replace(true);
                let end = pump(&shared, stream, &cancel).await;
                shared.connected.send_replace(false);
                if let ChannelEnd::Cancelled = end {
                    break;
                }
            }
            Err(e) => warn!(error = %format!("{e:#}"), "Failed to open metadata channel"),
        }

        debug!(delay = ?policy.interval, "Reopening metadata channel after delay");
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(policy.interval) => {}
        }
    }
    shared.connected.send_replace(false);
    debug!("Metadata loop stopped");
}

async fn pump(
    shared: &Shared,
    mut stream: BoxStream<'static, Result<String>>,
    cancel: &CancellationToken,
) -> ChannelEnd {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => return ChannelEnd::Cancelled,
            next = stream.next() => next,
        };
        match next {
            Some(Ok(text)) => shared.apply(&text),
            Some(Err(e)) => {
                warn!(error = %format!("{e:#}"), "Metadata channel error");
                return ChannelEnd::Closed;
            }
            None => {
                info!("Metadata channel closed");
                return ChannelEnd::Closed;
            }
        }
    }
}
