//! Metrics gateway: normalizes host sensor input into immutable snapshots
//! and fans them out to streaming subscribers.
//!
//! Delivery is per-subscriber latest-wins: each subscription owns a watch
//! channel, so a slow consumer only coalesces its own view of the stream and
//! can never stall production or other subscribers.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::types::{MetricsError, StreamId};

pub mod sampler;

pub use sampler::{SnapshotSource, StaticSource, SysinfoSource};

/// Immutable, timestamped record of host resource utilization. Never mutated
/// after creation; shared by `Arc`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub taken_at: DateTime<Utc>,
    /// Total CPU utilization as a fraction of capacity (0.0 – 1.0).
    pub cpu_load: f64,
    pub mem_used_bytes: u64,
    pub mem_total_bytes: u64,
    pub power: Option<PowerReading>,
    /// Top processes by CPU, when the source includes them.
    #[serde(default)]
    pub processes: Vec<ProcessSample>,
}

/// Optional power/energy indicator attached to a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PowerReading {
    pub battery_pct: Option<f64>,
    pub plugged: bool,
    pub watts: Option<f64>,
}

/// One process entry in a snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessSample {
    pub pid: u32,
    pub name: String,
    /// CPU share of total capacity (0.0 – 1.0).
    pub cpu_share: f64,
    pub rss_bytes: u64,
}

/// A live metrics subscription handed back by `stream_start`.
pub struct StreamSubscription {
    pub id: StreamId,
    /// Latest-wins receiver; `None` until the first sample lands.
    pub receiver: watch::Receiver<Option<Arc<MetricsSnapshot>>>,
}

struct StreamEntry {
    task: JoinHandle<()>,
}

/// Gateway over a `SnapshotSource`: point-in-time pulls plus per-subscriber
/// periodic streams.
pub struct MetricsGateway {
    source: Arc<dyn SnapshotSource>,
    streams: DashMap<StreamId, StreamEntry>,
    latest: arc_swap::ArcSwapOption<MetricsSnapshot>,
}

impl MetricsGateway {
    pub fn new(source: Arc<dyn SnapshotSource>) -> Self {
        Self {
            source,
            streams: DashMap::new(),
            latest: arc_swap::ArcSwapOption::empty(),
        }
    }

    /// Collect a fresh snapshot from the source.
    pub async fn snapshot(&self) -> Result<Arc<MetricsSnapshot>, MetricsError> {
        let snap = Arc::new(self.source.collect().await?);
        self.latest.store(Some(snap.clone()));
        Ok(snap)
    }

    /// The most recently collected snapshot, if any. Cheap; never samples.
    pub fn latest(&self) -> Option<Arc<MetricsSnapshot>> {
        self.latest.load_full()
    }

    /// Start a periodic stream at `interval`. Each subscriber gets its own
    /// sampling task and watch channel.
    pub fn stream_start(
        self: &Arc<Self>,
        interval: Duration,
    ) -> Result<StreamSubscription, MetricsError> {
        if interval.is_zero() {
            return Err(MetricsError::InvalidInterval {
                reason: "interval must be positive".to_string(),
            });
        }

        let id = StreamId::new();
        let (tx, rx) = watch::channel(None);
        // The task must not keep the gateway alive; it winds down once the
        // last external handle is gone.
        let gateway = Arc::downgrade(self);

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tick.tick().await;
                let Some(gateway) = gateway.upgrade() else {
                    break;
                };
                match gateway.snapshot().await {
                    Ok(snap) => {
                        // Receiver dropped means the subscriber went away.
                        if tx.send(Some(snap)).is_err() {
                            gateway.streams.remove(&id);
                            break;
                        }
                    }
                    Err(e) => {
                        tracing::warn!(stream = %id, "snapshot collection failed: {e}");
                    }
                }
            }
        });

        self.streams.insert(id, StreamEntry { task });
        tracing::debug!(stream = %id, interval_ms = interval.as_millis() as u64, "metrics stream started");
        Ok(StreamSubscription { id, receiver: rx })
    }

    /// Stop a stream. No further deliveries occur once this returns.
    pub fn stream_stop(&self, id: StreamId) -> Result<(), MetricsError> {
        match self.streams.remove(&id) {
            Some((_, entry)) => {
                entry.task.abort();
                tracing::debug!(stream = %id, "metrics stream stopped");
                Ok(())
            }
            None => Err(MetricsError::StreamNotFound { stream_id: id }),
        }
    }

    /// Number of active streams.
    pub fn active_streams(&self) -> usize {
        self.streams.len()
    }
}

impl Drop for MetricsGateway {
    fn drop(&mut self) {
        for entry in self.streams.iter() {
            entry.value().task.abort();
        }
    }
}
