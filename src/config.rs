use std::time::Duration;

/// Tunables for the bot manager. The defaults match the cadences the live
/// service runs with; embedders usually only override them in tests.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Fixed interval between QR scan-status polls.
    pub qr_poll_interval_ms: u64,
    /// Hard ceiling on a QR login; past this the session expires
    /// unconditionally. Bounds resource hold time for abandoned logins.
    pub qr_timeout_ms: u64,
    /// Default farm-action cycle for accounts created without one.
    pub default_farm_interval_ms: u64,
    /// Default friend-visit cycle for accounts created without one.
    pub default_friend_interval_ms: u64,
    /// Cadence of the best-effort store flush. Liveness only: a crash loses
    /// at most the writes since the last flush, never corrupts the store.
    pub flush_interval_ms: u64,
    /// Default row count for bounded log history pulls.
    pub log_history_limit: usize,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            qr_poll_interval_ms: 2_000,
            qr_timeout_ms: 180_000,
            default_farm_interval_ms: 10_000,
            default_friend_interval_ms: 10_000,
            flush_interval_ms: 30_000,
            log_history_limit: 100,
        }
    }
}

impl ManagerConfig {
    pub fn qr_poll_interval(&self) -> Duration {
        Duration::from_millis(self.qr_poll_interval_ms)
    }

    pub fn qr_timeout(&self) -> Duration {
        Duration::from_millis(self.qr_timeout_ms)
    }

    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }
}
