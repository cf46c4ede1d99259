/// Durable lifecycle status of an account. Reconciled against live worker
/// presence on read: a stored `running` with no registered worker is
/// reported as `stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BotStatus {
    Stopped,
    Connecting,
    Running,
    Error,
}

impl BotStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BotStatus::Stopped => "stopped",
            BotStatus::Connecting => "connecting",
            BotStatus::Running => "running",
            BotStatus::Error => "error",
        }
    }

    pub fn from_status(value: &str) -> Option<Self> {
        match value {
            "stopped" => Some(BotStatus::Stopped),
            "connecting" => Some(BotStatus::Connecting),
            "running" => Some(BotStatus::Running),
            "error" => Some(BotStatus::Error),
            _ => None,
        }
    }
}

/// Game-state fields reported by a worker. Every field is optional: the
/// worker only fills what the last server push contained, and merges keep
/// the stored value for absent fields.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct GameProfile {
    pub nickname: Option<String>,
    pub gid: Option<i64>,
    pub level: Option<i64>,
    pub gold: Option<i64>,
    pub exp: Option<i64>,
}

impl GameProfile {
    pub fn is_empty(&self) -> bool {
        self.nickname.is_none()
            && self.gid.is_none()
            && self.level.is_none()
            && self.gold.is_none()
            && self.exp.is_none()
    }
}

/// One row of the `users` table.
#[derive(Debug, Clone)]
pub struct AccountRecord {
    pub uin: String,
    pub nickname: String,
    pub gid: i64,
    pub level: i64,
    pub gold: i64,
    pub exp: i64,
    pub status: BotStatus,
    pub platform: String,
    pub farm_interval_ms: u64,
    pub friend_interval_ms: u64,
    pub preferred_seed_id: i64,
    pub friend_time_range: Option<String>,
    pub farm_op_min_delay_ms: u64,
    pub farm_op_max_delay_ms: u64,
    pub auto_start: bool,
    /// Whether an encrypted session token is stored. The token itself is
    /// only surfaced through `AccountStore::decrypted_token`.
    pub has_session: bool,
    pub last_login_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

impl AccountRecord {
    /// Runtime worker config as persisted on this record.
    pub fn bot_config(&self) -> crate::core::worker::BotConfig {
        crate::core::worker::BotConfig {
            platform: self.platform.clone(),
            farm_interval_ms: self.farm_interval_ms,
            friend_interval_ms: self.friend_interval_ms,
            preferred_seed_id: self.preferred_seed_id,
            friend_time_range: self.friend_time_range.clone(),
            farm_op_min_delay_ms: self.farm_op_min_delay_ms,
            farm_op_max_delay_ms: self.farm_op_max_delay_ms,
        }
    }
}

/// Merged durable + live view returned by `list_accounts`.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountView {
    pub uin: String,
    pub nickname: String,
    pub gid: i64,
    pub level: i64,
    pub gold: i64,
    pub exp: i64,
    pub status: BotStatus,
    pub error_message: String,
    pub platform: String,
    pub farm_interval_ms: u64,
    pub friend_interval_ms: u64,
    pub auto_start: bool,
    /// Epoch milliseconds; `None` when no worker is live.
    pub started_at: Option<u64>,
    pub uptime_secs: u64,
    pub created_at: String,
}

/// A log line as emitted by a worker (uin attached by the bridge).
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct LogEntry {
    pub tag: String,
    pub message: String,
    pub level: String,
}

impl LogEntry {
    pub fn info(tag: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            message: message.into(),
            level: "info".to_string(),
        }
    }
}

/// A persisted row of the `bot_logs` table.
#[derive(Debug, Clone, serde::Serialize)]
pub struct StoredLog {
    pub uin: String,
    pub tag: String,
    pub message: String,
    pub level: String,
    pub created_at: String,
}
