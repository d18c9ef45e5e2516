//! Policy model and admission decision engine.
//!
//! A `Policy` is a named, versioned set of admission thresholds. The engine
//! is a pure function of (policy, snapshot, profile, now) and is fully
//! deterministic for identical inputs, which is what makes `simulate`
//! trustworthy: a dry run computes exactly the decision the admission loop
//! would.

use chrono::{DateTime, Duration as ChronoDuration, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

use crate::metrics::MetricsSnapshot;
use crate::types::{PolicyError, PolicyVersion, ResourceProfile};

/// A preferred low-cost time-of-day range (UTC) for energy-sensitive work.
/// Ranges may wrap midnight (`start > end`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnergyWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl EnergyWindow {
    pub fn contains(&self, at: DateTime<Utc>) -> bool {
        let t = at.time();
        if self.start < self.end {
            self.start <= t && t < self.end
        } else {
            // Wraps midnight.
            t >= self.start || t < self.end
        }
    }

    /// The concrete occurrence of this window that `at` falls in, or the next
    /// one after `at`.
    pub fn occurrence_at_or_after(&self, at: DateTime<Utc>) -> (DateTime<Utc>, DateTime<Utc>) {
        let day = at.date_naive();
        let start_today = day.and_time(self.start).and_utc();
        let start = if self.contains(at) {
            // Already inside: the window opened today or yesterday.
            if at.time() >= self.start {
                start_today
            } else {
                start_today - ChronoDuration::days(1)
            }
        } else if start_today > at {
            start_today
        } else {
            start_today + ChronoDuration::days(1)
        };
        let mut end = start.date_naive().and_time(self.end).and_utc();
        if end <= start {
            end += ChronoDuration::days(1);
        }
        (start, end)
    }
}

/// Named, versioned admission configuration. Exactly one policy is active at
/// a time; activation replaces the previous version atomically.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Policy {
    pub name: String,
    #[serde(default)]
    pub version: PolicyVersion,
    /// Maximum number of concurrently running tasks.
    pub max_concurrent: usize,
    /// Tolerated CPU overcommit margin: a task is rejected when projected
    /// demand (`cpu_load + cpu_share`) overruns capacity by more than this.
    pub cpu_headroom: f64,
    /// Free memory that must remain after admitting a task, in MiB.
    pub mem_reserve_mb: u64,
    /// Minimum battery percentage for admission while unplugged.
    pub battery_min_pct: Option<f64>,
    /// Preferred windows for energy-sensitive tasks (UTC times of day).
    #[serde(default)]
    pub energy_windows: Vec<EnergyWindow>,
}

impl Policy {
    /// Structural validation. Runs before a policy is made active; a policy
    /// that fails here never reaches the evaluator.
    pub fn validate(&self) -> Result<(), PolicyError> {
        let invalid = |reason: String| PolicyError::InvalidPolicy {
            name: self.name.clone(),
            reason,
        };
        if self.name.trim().is_empty() {
            return Err(invalid("name must not be empty".to_string()));
        }
        if self.max_concurrent == 0 {
            return Err(invalid("max_concurrent must be at least 1".to_string()));
        }
        if !self.cpu_headroom.is_finite() || !(0.0..1.0).contains(&self.cpu_headroom) {
            return Err(invalid(format!(
                "cpu_headroom must be in [0, 1), got {}",
                self.cpu_headroom
            )));
        }
        if let Some(pct) = self.battery_min_pct {
            if !pct.is_finite() || !(0.0..=100.0).contains(&pct) {
                return Err(invalid(format!(
                    "battery_min_pct must be in [0, 100], got {pct}"
                )));
            }
        }
        for window in &self.energy_windows {
            if window.start == window.end {
                return Err(invalid(format!(
                    "energy window start and end coincide at {}",
                    window.start
                )));
            }
        }
        Ok(())
    }

    /// Look up a built-in preset by name.
    pub fn preset(name: &str) -> Result<Policy, PolicyError> {
        let window = |start: &str, end: &str| EnergyWindow {
            start: start.parse().expect("static window time"),
            end: end.parse().expect("static window time"),
        };
        match name {
            "performance" => Ok(Policy {
                name: "performance".to_string(),
                version: PolicyVersion::default(),
                max_concurrent: 4,
                cpu_headroom: 0.25,
                mem_reserve_mb: 512,
                battery_min_pct: Some(10.0),
                energy_windows: Vec::new(),
            }),
            "balanced" => Ok(Policy {
                name: "balanced".to_string(),
                version: PolicyVersion::default(),
                max_concurrent: 2,
                cpu_headroom: 0.15,
                mem_reserve_mb: 2048,
                battery_min_pct: Some(30.0),
                energy_windows: vec![window("22:00:00", "07:00:00")],
            }),
            "battery-saver" => Ok(Policy {
                name: "battery-saver".to_string(),
                version: PolicyVersion::default(),
                max_concurrent: 1,
                cpu_headroom: 0.05,
                mem_reserve_mb: 4096,
                battery_min_pct: Some(50.0),
                energy_windows: vec![window("21:00:00", "08:00:00")],
            }),
            other => Err(PolicyError::UnknownPreset(other.to_string())),
        }
    }
}

/// The outcome of one policy evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Decision {
    pub admit: bool,
    /// Why admission was refused; empty when `admit` is true.
    pub reasons: Vec<String>,
    /// When set, the scheduler should re-evaluate inside this window instead
    /// of discarding the task.
    pub recommended_window: Option<(DateTime<Utc>, DateTime<Utc>)>,
    /// The policy version this decision was computed against.
    pub policy_version: PolicyVersion,
}

impl Decision {
    fn admitted(version: PolicyVersion) -> Self {
        Self {
            admit: true,
            reasons: Vec::new(),
            recommended_window: None,
            policy_version: version,
        }
    }
}

/// Evaluate a task profile against the policy and the current snapshot.
///
/// Pure: no clock reads, no I/O, no shared state. `now` is an input so that
/// simulate and the admission loop produce identical decisions for identical
/// inputs.
pub fn evaluate(
    policy: &Policy,
    snapshot: &MetricsSnapshot,
    profile: &ResourceProfile,
    now: DateTime<Utc>,
) -> Decision {
    let mut reasons = Vec::new();

    let projected = snapshot.cpu_load + profile.cpu_share;
    if projected - 1.0 > policy.cpu_headroom {
        reasons.push(format!(
            "projected CPU demand {:.0}% overruns capacity beyond {:.0}% headroom",
            projected * 100.0,
            policy.cpu_headroom * 100.0
        ));
    }

    let free_mb = snapshot.mem_total_bytes.saturating_sub(snapshot.mem_used_bytes) / (1024 * 1024);
    let needed_mb = profile.memory_mb + policy.mem_reserve_mb;
    if free_mb < needed_mb {
        reasons.push(format!(
            "free memory {free_mb} MiB below required {needed_mb} MiB (task + reserve)"
        ));
    }

    if let (Some(min_pct), Some(power)) = (policy.battery_min_pct, snapshot.power.as_ref()) {
        if !power.plugged {
            if let Some(pct) = power.battery_pct {
                if pct < min_pct {
                    reasons.push(format!(
                        "battery {pct:.0}% below minimum {min_pct:.0}% while unplugged"
                    ));
                }
            }
        }
    }

    let in_window = policy.energy_windows.iter().any(|w| w.contains(now));
    let wants_window = profile.energy_sensitive && !policy.energy_windows.is_empty();
    if wants_window && !in_window {
        reasons.push("outside preferred energy window".to_string());
    }

    if reasons.is_empty() {
        return Decision::admitted(policy.version);
    }

    // Deferral beats rejection for energy-sensitive work: hand back the
    // nearest window so the scheduler re-queues instead of discarding.
    let recommended_window = if wants_window {
        policy
            .energy_windows
            .iter()
            .map(|w| w.occurrence_at_or_after(now))
            .min_by_key(|(start, _)| *start)
    } else {
        None
    };

    Decision {
        admit: false,
        reasons,
        recommended_window,
        policy_version: policy.version,
    }
}
