//! farmhand - supervises a fleet of farm-game bot accounts.
//!
//! One [`BotManager`] owns the registry of live bot workers and in-flight QR
//! login sessions, keeps the sqlite account store in sync with worker
//! lifecycle, and republishes worker events on a per-account broadcast bus.
//! The HTTP/socket surface, the game protocol, and the worker's own scheduled
//! actions live outside this crate and are consumed through the
//! [`AuthGateway`] and [`Worker`] traits.

pub mod config;
pub mod core;
pub mod logging;

pub use crate::core::bus::{BotEvent, EventBus};
pub use crate::core::error::{BotError, StoreError};
pub use crate::core::gateway::{AuthGateway, QrChallenge, ScanStatus};
pub use crate::core::manager::{BotManager, LoginOptions};
pub use crate::core::store::AccountStore;
pub use crate::core::store::types::{
    AccountRecord, AccountView, BotStatus, GameProfile, LogEntry, StoredLog,
};
pub use crate::core::vault::{TokenVault, VaultError};
pub use crate::core::worker::{
    BotConfig, ConfigPatch, Worker, WorkerEvent, WorkerFactory, WorkerSnapshot,
};
pub use crate::config::ManagerConfig;
