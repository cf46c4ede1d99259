//! Observer-facing event fan-out.
//!
//! One unscoped broadcast channel for dashboard-wide delivery plus one
//! lazily-created channel per account (the `logs:<uin>` topic). Delivery is
//! at-most-once: lagging or absent receivers are the subscriber's problem,
//! and history beyond the live stream is served from the store's log table.

use std::collections::HashMap;
use std::sync::Mutex;

use tokio::sync::broadcast;

use crate::core::store::types::{BotStatus, GameProfile, LogEntry};

/// Everything the manager broadcasts. Serialized form matches the socket
/// payloads the dashboard consumes.
#[derive(Debug, Clone, serde::Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BotEvent {
    Log {
        uin: String,
        #[serde(flatten)]
        entry: LogEntry,
    },
    StatusChange {
        uin: String,
        old: BotStatus,
        new: BotStatus,
    },
    StateUpdate {
        uin: String,
        profile: GameProfile,
    },
    QrExpired {
        uin: String,
        reason: String,
    },
    QrScanned {
        uin: String,
    },
    QrError {
        uin: String,
        reason: String,
    },
    QrCancelled {
        uin: String,
    },
    BotError {
        uin: String,
        error: String,
    },
}

impl BotEvent {
    pub fn uin(&self) -> &str {
        match self {
            BotEvent::Log { uin, .. }
            | BotEvent::StatusChange { uin, .. }
            | BotEvent::StateUpdate { uin, .. }
            | BotEvent::QrExpired { uin, .. }
            | BotEvent::QrScanned { uin }
            | BotEvent::QrError { uin, .. }
            | BotEvent::QrCancelled { uin }
            | BotEvent::BotError { uin, .. } => uin,
        }
    }
}

pub struct EventBus {
    capacity: usize,
    all: broadcast::Sender<BotEvent>,
    accounts: Mutex<HashMap<String, broadcast::Sender<BotEvent>>>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (all, _) = broadcast::channel(capacity);
        Self {
            capacity,
            all,
            accounts: Mutex::new(HashMap::new()),
        }
    }

    /// Dashboard-wide stream: every event for every account.
    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.all.subscribe()
    }

    /// Stream scoped to one account.
    pub fn subscribe_account(&self, uin: &str) -> broadcast::Receiver<BotEvent> {
        let mut accounts = self.accounts.lock().expect("bus lock poisoned");
        accounts
            .entry(uin.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .subscribe()
    }

    /// Publishes to the account topic first, then the broadcast topic.
    /// Subscribers on a single topic observe one account's events in
    /// emission order; send errors (no receivers) are ignored.
    pub fn publish(&self, event: BotEvent) {
        {
            let accounts = self.accounts.lock().expect("bus lock poisoned");
            if let Some(sender) = accounts.get(event.uin()) {
                let _ = sender.send(event.clone());
            }
        }
        let _ = self.all.send(event);
    }

    /// Tears down an account topic. Existing receivers see the stream end.
    pub fn drop_account(&self, uin: &str) {
        let mut accounts = self.accounts.lock().expect("bus lock poisoned");
        accounts.remove(uin);
    }
}
