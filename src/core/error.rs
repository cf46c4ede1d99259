use thiserror::Error;

use crate::core::vault::VaultError;

/// Caller-facing errors for manager operations.
///
/// `Gateway` and `WorkerStart` describe one account's failure and are never
/// fatal to the manager; the remaining variants are synchronous caller
/// errors with no state mutation behind them.
#[derive(Debug, Error)]
pub enum BotError {
    #[error("a QR login for {0} is already in progress")]
    AlreadyInProgress(String),

    #[error("bot {0} is already running")]
    AlreadyRunning(String),

    #[error("no account or bot instance found for {0}")]
    NotFound(String),

    #[error("no saved session for {0}, a new QR login is required")]
    NoCredential(String),

    #[error("auth gateway failure: {0}")]
    Gateway(String),

    #[error("worker failed to start: {0}")]
    WorkerStart(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the account store and the vault beneath it.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite failure: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("credential vault failure: {0}")]
    Vault(#[from] VaultError),
}
