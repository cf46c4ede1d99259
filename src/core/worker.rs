//! Contract between the manager and bot workers.
//!
//! A worker maintains one account's authenticated game connection and runs
//! its scheduled actions; what it does once connected is not this crate's
//! concern. The manager only starts/stops it, reads snapshots, pushes config
//! changes, and drains the event channel handed over at construction.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::core::store::types::{BotStatus, GameProfile, LogEntry};

/// Runtime configuration for one worker.
#[derive(Debug, Clone, PartialEq)]
pub struct BotConfig {
    /// Platform tag (`qq` or `wx`); opaque to the manager.
    pub platform: String,
    pub farm_interval_ms: u64,
    pub friend_interval_ms: u64,
    pub preferred_seed_id: i64,
    /// Optional `HH:MM-HH:MM` window for friend visits.
    pub friend_time_range: Option<String>,
    pub farm_op_min_delay_ms: u64,
    pub farm_op_max_delay_ms: u64,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            platform: "qq".to_string(),
            farm_interval_ms: 10_000,
            friend_interval_ms: 10_000,
            preferred_seed_id: 0,
            friend_time_range: None,
            farm_op_min_delay_ms: 0,
            farm_op_max_delay_ms: 0,
        }
    }
}

/// Partial account/worker config update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigPatch {
    pub platform: Option<String>,
    pub farm_interval_ms: Option<u64>,
    pub friend_interval_ms: Option<u64>,
    pub preferred_seed_id: Option<i64>,
    pub friend_time_range: Option<String>,
    pub farm_op_min_delay_ms: Option<u64>,
    pub farm_op_max_delay_ms: Option<u64>,
    pub auto_start: Option<bool>,
}

impl ConfigPatch {
    pub fn is_empty(&self) -> bool {
        self.platform.is_none()
            && self.farm_interval_ms.is_none()
            && self.friend_interval_ms.is_none()
            && self.preferred_seed_id.is_none()
            && self.friend_time_range.is_none()
            && self.farm_op_min_delay_ms.is_none()
            && self.farm_op_max_delay_ms.is_none()
            && self.auto_start.is_none()
    }

    /// Applies the runtime-relevant fields onto a worker config.
    /// `auto_start` is a store-only flag and is ignored here.
    pub fn apply_to(&self, config: &mut BotConfig) {
        if let Some(ref platform) = self.platform {
            config.platform = platform.clone();
        }
        if let Some(v) = self.farm_interval_ms {
            config.farm_interval_ms = v;
        }
        if let Some(v) = self.friend_interval_ms {
            config.friend_interval_ms = v;
        }
        if let Some(v) = self.preferred_seed_id {
            config.preferred_seed_id = v;
        }
        if let Some(ref range) = self.friend_time_range {
            config.friend_time_range = Some(range.clone());
        }
        if let Some(v) = self.farm_op_min_delay_ms {
            config.farm_op_min_delay_ms = v;
        }
        if let Some(v) = self.farm_op_max_delay_ms {
            config.farm_op_max_delay_ms = v;
        }
    }
}

/// Point-in-time view of a worker.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WorkerSnapshot {
    pub status: BotStatus,
    pub profile: GameProfile,
    pub error_message: String,
    /// Epoch milliseconds of the last successful start.
    pub started_at: Option<u64>,
    pub uptime_secs: u64,
}

/// Events a worker pushes onto its channel. The bridge attaches the uin and
/// republishes them as [`crate::BotEvent`]s.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Log(LogEntry),
    StatusChange { old: BotStatus, new: BotStatus },
    StateUpdate { profile: GameProfile },
}

/// A live bot instance.
///
/// `start` may fail (bad token, connect error); the worker must be left in
/// `error` status and remain safe to `destroy`. `destroy` is a hard teardown
/// and must be safe to call on an already-stopped worker.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn start(&self, session_token: &str) -> anyhow::Result<()>;

    async fn stop(&self);

    async fn destroy(&self);

    fn snapshot(&self) -> WorkerSnapshot;

    /// Live reconfiguration; takes effect on the worker's next cycle.
    fn apply_patch(&self, patch: &ConfigPatch);
}

/// Builds workers. One event channel per worker: the receiver is consumed by
/// a single bridge task, and teardown of that task is tied to the handle's
/// cancellation token rather than listener bookkeeping.
pub trait WorkerFactory: Send + Sync {
    fn build(&self, uin: &str, config: BotConfig) -> (Arc<dyn Worker>, mpsc::Receiver<WorkerEvent>);
}
