//! Authentication gateway contract.
//!
//! The gateway issues QR challenges, reports scan status, and exchanges a
//! confirmed scan ticket for an opaque session token. Calls are not assumed
//! idempotent; any failure is surfaced as an opaque error and mapped to
//! `BotError::Gateway` (or a `qrError` event mid-poll) by the manager.

use async_trait::async_trait;

/// A fresh QR challenge: the login code the gateway polls by, and the URL
/// the operator renders for scanning.
#[derive(Debug, Clone, serde::Serialize)]
pub struct QrChallenge {
    pub code: String,
    pub url: String,
}

/// Result of one scan-status poll.
#[derive(Debug, Clone)]
pub enum ScanStatus {
    /// Scanned and confirmed; the ticket is exchanged for a session token.
    Scanned { ticket: String },
    /// Challenge already consumed elsewhere.
    Used,
    /// Gateway-reported scan failure.
    Error,
    /// No change yet, keep polling.
    Wait,
}

#[async_trait]
pub trait AuthGateway: Send + Sync {
    async fn request_challenge(&self) -> anyhow::Result<QrChallenge>;

    async fn poll_scan(&self, code: &str) -> anyhow::Result<ScanStatus>;

    async fn exchange_ticket(&self, ticket: &str) -> anyhow::Result<String>;
}
