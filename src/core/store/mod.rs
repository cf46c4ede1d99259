//! Durable account persistence.
//!
//! One row per account in `users`, log history in `bot_logs`. The session
//! token column is encrypted by [`TokenVault`] before it touches the
//! connection; nothing in this module returns or logs it in clear form
//! except `decrypted_token`. Writes are per-row and independently atomic;
//! `flush` is a best-effort WAL checkpoint, a liveness concern only.

pub mod types;

use std::path::Path;
use std::sync::Arc;

use rusqlite::{Connection, params};
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::core::error::StoreError;
use crate::core::vault::TokenVault;
use crate::core::worker::ConfigPatch;
use self::types::{AccountRecord, BotStatus, GameProfile, LogEntry, StoredLog};

pub struct AccountStore {
    db: Arc<Mutex<Connection>>,
    vault: TokenVault,
}

impl AccountStore {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let db = Connection::open(path)?;
        // journal_mode returns a row, so query_row instead of pragma_update
        db.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
        Self::with_connection(db, TokenVault::new())
    }

    /// In-memory store for tests and throwaway setups.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::with_connection(Connection::open_in_memory()?, TokenVault::new())
    }

    pub fn with_connection(db: Connection, vault: TokenVault) -> Result<Self, StoreError> {
        db.execute(
            "CREATE TABLE IF NOT EXISTS users (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                uin TEXT UNIQUE NOT NULL,
                nickname TEXT DEFAULT '',
                gid INTEGER DEFAULT 0,
                level INTEGER DEFAULT 0,
                gold INTEGER DEFAULT 0,
                exp INTEGER DEFAULT 0,
                status TEXT DEFAULT 'stopped',
                session_data TEXT DEFAULT '',
                platform TEXT DEFAULT 'qq',
                farm_interval INTEGER DEFAULT 10000,
                friend_interval INTEGER DEFAULT 10000,
                preferred_seed_id INTEGER DEFAULT 0,
                friend_time_range TEXT,
                farm_operation_min_delay INTEGER DEFAULT 0,
                farm_operation_max_delay INTEGER DEFAULT 0,
                auto_start INTEGER DEFAULT 0,
                last_login_at TEXT,
                created_at TEXT DEFAULT (datetime('now')),
                updated_at TEXT DEFAULT (datetime('now'))
            )",
            [],
        )?;

        db.execute(
            "CREATE TABLE IF NOT EXISTS bot_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_uin TEXT NOT NULL,
                tag TEXT DEFAULT '',
                message TEXT DEFAULT '',
                level TEXT DEFAULT 'info',
                created_at TEXT DEFAULT (datetime('now'))
            )",
            [],
        )?;

        db.execute("CREATE INDEX IF NOT EXISTS idx_users_uin ON users(uin)", [])?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_logs_uin ON bot_logs(user_uin)",
            [],
        )?;
        db.execute(
            "CREATE INDEX IF NOT EXISTS idx_logs_created ON bot_logs(created_at)",
            [],
        )?;

        info!("account store initialized");
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            vault,
        })
    }

    const ACCOUNT_COLUMNS: &'static str = "uin, nickname, gid, level, gold, exp, status, \
         session_data != '' AS has_session, platform, farm_interval, friend_interval, \
         preferred_seed_id, friend_time_range, farm_operation_min_delay, \
         farm_operation_max_delay, auto_start, last_login_at, created_at, updated_at";

    fn row_to_account(row: &rusqlite::Row<'_>) -> rusqlite::Result<AccountRecord> {
        let status: String = row.get(6)?;
        Ok(AccountRecord {
            uin: row.get(0)?,
            nickname: row.get(1)?,
            gid: row.get(2)?,
            level: row.get(3)?,
            gold: row.get(4)?,
            exp: row.get(5)?,
            // Unknown strings in a hand-edited DB degrade to stopped.
            status: BotStatus::from_status(&status).unwrap_or(BotStatus::Stopped),
            has_session: row.get(7)?,
            platform: row.get(8)?,
            farm_interval_ms: row.get::<_, i64>(9)?.max(0) as u64,
            friend_interval_ms: row.get::<_, i64>(10)?.max(0) as u64,
            preferred_seed_id: row.get(11)?,
            friend_time_range: row.get(12)?,
            farm_op_min_delay_ms: row.get::<_, i64>(13)?.max(0) as u64,
            farm_op_max_delay_ms: row.get::<_, i64>(14)?.max(0) as u64,
            auto_start: row.get(15)?,
            last_login_at: row.get(16)?,
            created_at: row.get(17)?,
            updated_at: row.get(18)?,
        })
    }

    /// All accounts, newest first.
    pub async fn list(&self) -> Result<Vec<AccountRecord>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM users ORDER BY created_at DESC, id DESC",
            Self::ACCOUNT_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::row_to_account)?;

        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    pub async fn get(&self, uin: &str) -> Result<Option<AccountRecord>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM users WHERE uin = ?1",
            Self::ACCOUNT_COLUMNS
        ))?;
        let mut rows = stmt.query_map(params![uin], Self::row_to_account)?;
        match rows.next() {
            Some(row) => Ok(Some(row?)),
            None => Ok(None),
        }
    }

    pub async fn create(
        &self,
        uin: &str,
        platform: &str,
        farm_interval_ms: u64,
        friend_interval_ms: u64,
    ) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO users (uin, platform, farm_interval, friend_interval) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                uin,
                platform,
                farm_interval_ms as i64,
                friend_interval_ms as i64
            ],
        )?;
        info!("[{}] account created (platform {})", uin, platform);
        Ok(())
    }

    pub async fn update_status(&self, uin: &str, status: BotStatus) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE users SET status = ?1, updated_at = datetime('now') WHERE uin = ?2",
            params![status.as_str(), uin],
        )?;
        Ok(())
    }

    /// Merges a worker-reported profile into the row; absent fields keep
    /// their stored values.
    pub async fn update_game_state(
        &self,
        uin: &str,
        profile: &GameProfile,
    ) -> Result<(), StoreError> {
        if profile.is_empty() {
            return Ok(());
        }
        let db = self.db.lock().await;
        db.execute(
            "UPDATE users SET \
                nickname = COALESCE(?1, nickname), \
                gid = COALESCE(?2, gid), \
                level = COALESCE(?3, level), \
                gold = COALESCE(?4, gold), \
                exp = COALESCE(?5, exp), \
                updated_at = datetime('now') \
             WHERE uin = ?6",
            params![
                profile.nickname,
                profile.gid,
                profile.level,
                profile.gold,
                profile.exp,
                uin
            ],
        )?;
        Ok(())
    }

    /// Writes the changed fields of a partial config update.
    pub async fn apply_patch(&self, uin: &str, patch: &ConfigPatch) -> Result<(), StoreError> {
        if patch.is_empty() {
            return Ok(());
        }
        let db = self.db.lock().await;
        db.execute(
            "UPDATE users SET \
                platform = COALESCE(?1, platform), \
                farm_interval = COALESCE(?2, farm_interval), \
                friend_interval = COALESCE(?3, friend_interval), \
                preferred_seed_id = COALESCE(?4, preferred_seed_id), \
                friend_time_range = COALESCE(?5, friend_time_range), \
                farm_operation_min_delay = COALESCE(?6, farm_operation_min_delay), \
                farm_operation_max_delay = COALESCE(?7, farm_operation_max_delay), \
                auto_start = COALESCE(?8, auto_start), \
                updated_at = datetime('now') \
             WHERE uin = ?9",
            params![
                patch.platform,
                patch.farm_interval_ms.map(|v| v as i64),
                patch.friend_interval_ms.map(|v| v as i64),
                patch.preferred_seed_id,
                patch.friend_time_range,
                patch.farm_op_min_delay_ms.map(|v| v as i64),
                patch.farm_op_max_delay_ms.map(|v| v as i64),
                patch.auto_start,
                uin
            ],
        )?;
        Ok(())
    }

    /// Encrypts and stores the session token.
    pub async fn save_token(&self, uin: &str, token: &str) -> Result<(), StoreError> {
        let sealed = self.vault.seal(token)?;
        let db = self.db.lock().await;
        db.execute(
            "UPDATE users SET session_data = ?1, updated_at = datetime('now') WHERE uin = ?2",
            params![sealed, uin],
        )?;
        info!("[{}] session token saved", uin);
        Ok(())
    }

    /// Decrypted session token, `None` when the account has no stored
    /// credential, does not exist, or the stored value no longer decrypts
    /// (rotated key, corrupt row). An unreadable credential is as good as
    /// none; the operator re-authenticates.
    pub async fn decrypted_token(&self, uin: &str) -> Result<Option<String>, StoreError> {
        let sealed: Option<String> = {
            let db = self.db.lock().await;
            let mut stmt = db.prepare("SELECT session_data FROM users WHERE uin = ?1")?;
            let mut rows = stmt.query_map(params![uin], |row| row.get(0))?;
            match rows.next() {
                Some(row) => Some(row?),
                None => None,
            }
        };
        match sealed {
            None => Ok(None),
            Some(s) if s.is_empty() => Ok(None),
            Some(s) => match self.vault.open(&s) {
                Ok(token) => Ok(Some(token)),
                Err(err) => {
                    warn!("[{}] stored session token no longer decrypts: {}", uin, err);
                    Ok(None)
                }
            },
        }
    }

    pub async fn touch_last_login(&self, uin: &str) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "UPDATE users SET last_login_at = datetime('now'), updated_at = datetime('now') \
             WHERE uin = ?1",
            params![uin],
        )?;
        Ok(())
    }

    /// Deletes the account row and its log history. Irreversible.
    pub async fn delete(&self, uin: &str) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute("DELETE FROM users WHERE uin = ?1", params![uin])?;
        db.execute("DELETE FROM bot_logs WHERE user_uin = ?1", params![uin])?;
        info!("[{}] account deleted", uin);
        Ok(())
    }

    /// Accounts flagged for recovery on process start: auto_start set and a
    /// session token present.
    pub async fn list_auto_start(&self) -> Result<Vec<AccountRecord>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(&format!(
            "SELECT {} FROM users WHERE auto_start = 1 AND session_data != ''",
            Self::ACCOUNT_COLUMNS
        ))?;
        let rows = stmt.query_map([], Self::row_to_account)?;

        let mut accounts = Vec::new();
        for row in rows {
            accounts.push(row?);
        }
        Ok(accounts)
    }

    pub async fn add_log(&self, uin: &str, entry: &LogEntry) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.execute(
            "INSERT INTO bot_logs (user_uin, tag, message, level) VALUES (?1, ?2, ?3, ?4)",
            params![uin, entry.tag, entry.message, entry.level],
        )?;
        Ok(())
    }

    /// Bounded history pull, most-recent-last.
    pub async fn recent_logs(&self, uin: &str, limit: usize) -> Result<Vec<StoredLog>, StoreError> {
        let db = self.db.lock().await;
        let mut stmt = db.prepare(
            "SELECT user_uin, tag, message, level, created_at FROM bot_logs \
             WHERE user_uin = ?1 ORDER BY id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![uin, limit as i64], |row| {
            Ok(StoredLog {
                uin: row.get(0)?,
                tag: row.get(1)?,
                message: row.get(2)?,
                level: row.get(3)?,
                created_at: row.get(4)?,
            })
        })?;

        let mut logs = Vec::new();
        for row in rows {
            logs.push(row?);
        }
        logs.reverse();
        Ok(logs)
    }

    /// Drops log rows older than `days_to_keep` days.
    pub async fn prune_logs(&self, days_to_keep: u32) -> Result<usize, StoreError> {
        let db = self.db.lock().await;
        let removed = db.execute(
            "DELETE FROM bot_logs WHERE created_at < datetime('now', ?1)",
            params![format!("-{} days", days_to_keep)],
        )?;
        Ok(removed)
    }

    /// Best-effort checkpoint of the WAL onto durable media. No-op on
    /// in-memory databases.
    pub async fn flush(&self) -> Result<(), StoreError> {
        let db = self.db.lock().await;
        db.query_row("PRAGMA wal_checkpoint(TRUNCATE)", [], |_| Ok(()))?;
        Ok(())
    }
}
