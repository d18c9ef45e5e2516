//! Snapshot sources: the seam between the gateway and whatever actually
//! reads sensors. The raw sampling implementation is a collaborator; the
//! rest of the system only ever sees `MetricsSnapshot` values.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use sysinfo::System;

use super::{MetricsSnapshot, ProcessSample};
use crate::types::MetricsError;

/// Produces immutable snapshots on demand.
#[async_trait]
pub trait SnapshotSource: Send + Sync {
    async fn collect(&self) -> Result<MetricsSnapshot, MetricsError>;
}

/// Host-backed source using `sysinfo`. Power readings are not available from
/// this source; a platform-specific collaborator can wrap it to add them.
pub struct SysinfoSource {
    sys: Mutex<System>,
    top_n: usize,
}

impl SysinfoSource {
    pub fn new(top_n: usize) -> Self {
        let mut sys = System::new();
        // Prime CPU counters; the first reading after creation is always 0.
        sys.refresh_cpu();
        Self {
            sys: Mutex::new(sys),
            top_n,
        }
    }
}

#[async_trait]
impl SnapshotSource for SysinfoSource {
    async fn collect(&self) -> Result<MetricsSnapshot, MetricsError> {
        let mut sys = self.sys.lock();
        sys.refresh_cpu();
        sys.refresh_memory();
        sys.refresh_processes();

        let cpu_count = sys.cpus().len().max(1) as f64;
        let cpu_load = f64::from(sys.global_cpu_info().cpu_usage()) / 100.0;

        let mut processes: Vec<ProcessSample> = sys
            .processes()
            .values()
            .map(|p| ProcessSample {
                pid: p.pid().as_u32(),
                name: p.name().to_string(),
                cpu_share: f64::from(p.cpu_usage()) / 100.0 / cpu_count,
                rss_bytes: p.memory(),
            })
            .collect();
        processes.sort_by(|a, b| {
            b.cpu_share
                .partial_cmp(&a.cpu_share)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        processes.truncate(self.top_n);

        Ok(MetricsSnapshot {
            taken_at: Utc::now(),
            cpu_load,
            mem_used_bytes: sys.used_memory(),
            mem_total_bytes: sys.total_memory(),
            power: None,
            processes,
        })
    }
}

/// Source that replays a fixed snapshot with a fresh timestamp. Used in
/// tests and for wiring the system without host access.
pub struct StaticSource {
    base: MetricsSnapshot,
}

impl StaticSource {
    pub fn new(base: MetricsSnapshot) -> Self {
        Self { base }
    }
}

#[async_trait]
impl SnapshotSource for StaticSource {
    async fn collect(&self) -> Result<MetricsSnapshot, MetricsError> {
        let mut snap = self.base.clone();
        snap.taken_at = Utc::now();
        Ok(snap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn sysinfo_source_reports_sane_values() {
        let source = SysinfoSource::new(5);
        let snap = source.collect().await.unwrap();
        assert!(snap.cpu_load >= 0.0);
        assert!(snap.mem_total_bytes > 0);
        assert!(snap.mem_used_bytes <= snap.mem_total_bytes);
        assert!(snap.processes.len() <= 5);
    }

    #[tokio::test]
    async fn static_source_refreshes_timestamp() {
        let base = MetricsSnapshot {
            taken_at: Utc::now() - chrono::Duration::hours(1),
            cpu_load: 0.42,
            mem_used_bytes: 1,
            mem_total_bytes: 2,
            power: None,
            processes: Vec::new(),
        };
        let source = StaticSource::new(base.clone());
        let snap = source.collect().await.unwrap();
        assert_eq!(snap.cpu_load, 0.42);
        assert!(snap.taken_at > base.taken_at);
    }
}
