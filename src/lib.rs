//! edgehelm — a local host copilot: resource-aware task scheduling, admission
//! policies, host metrics, and durable run accounting, exposed as MCP tools.
//!
//! The runtime is layered: the [`metrics`] gateway normalizes host sensor
//! input, the pure [`policy`] evaluator turns snapshots into admission
//! decisions, the [`scheduler`] owns the task lifecycle on top of durable
//! [`storage`], and the [`server`] exposes the whole thing over MCP stdio.

pub mod config;
pub mod metrics;
pub mod policy;
pub mod scheduler;
pub mod server;
pub mod storage;
pub mod types;

pub use config::Config;
pub use metrics::{MetricsGateway, MetricsSnapshot, SnapshotSource};
pub use policy::{Decision, Policy};
pub use scheduler::TaskScheduler;
pub use storage::{SqliteStore, TaskStore};
pub use types::{RuntimeError, RuntimeResult};
