//! QR login sessions.
//!
//! One session per account, reserved before any gateway call so concurrent
//! login attempts race on the registry instead of the network. The poll task
//! is the only place a session reaches a terminal state; every terminal
//! action re-checks that the session it started with still owns the slot
//! (cancel wins any race with an in-flight poll or ticket exchange).

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::BotManager;
use crate::config::ManagerConfig;
use crate::core::bus::BotEvent;
use crate::core::error::BotError;
use crate::core::gateway::{QrChallenge, ScanStatus};
use crate::core::store::types::{AccountRecord, BotStatus};
use crate::core::worker::BotConfig;

/// Overrides supplied with a login request. Unset fields fall back to the
/// account's stored config, then to manager defaults.
#[derive(Debug, Clone, Default, serde::Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoginOptions {
    pub platform: Option<String>,
    pub farm_interval_ms: Option<u64>,
    pub friend_interval_ms: Option<u64>,
    pub preferred_seed_id: Option<i64>,
    pub friend_time_range: Option<String>,
    pub farm_op_min_delay_ms: Option<u64>,
    pub farm_op_max_delay_ms: Option<u64>,
}

/// Lifecycle of a QR session. Terminal states are momentary: the session is
/// removed from the registry in the same critical step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QrState {
    /// Slot reserved, challenge request in flight.
    Requested,
    Polling,
    Confirmed,
    Expired,
    ScanError,
    Cancelled,
}

/// Legal state transitions for a QR session.
pub(crate) fn can_transition(from: QrState, to: QrState) -> bool {
    if from == to {
        return true;
    }
    use QrState::*;
    matches!(
        (from, to),
        (Requested, Polling)
            | (Requested, Cancelled)
            | (Polling, Confirmed)
            | (Polling, Expired)
            | (Polling, ScanError)
            | (Polling, Cancelled)
    )
}

pub(crate) struct QrSession {
    /// Identity of this reservation; terminal actions only fire if the slot
    /// still holds the same id.
    pub id: u64,
    pub code: String,
    pub url: String,
    pub config: BotConfig,
    pub state: QrState,
    pub requested_at: Instant,
    pub cancel: CancellationToken,
}

/// What one poll iteration decided. The timeout ceiling beats whatever the
/// gateway answered.
#[derive(Debug)]
pub(crate) enum QrOutcome {
    Confirmed { ticket: String },
    AlreadyUsed,
    Failed { reason: String },
    TimedOut,
    KeepPolling,
}

pub(crate) fn classify_poll(
    result: anyhow::Result<ScanStatus>,
    elapsed: Duration,
    ceiling: Duration,
) -> QrOutcome {
    if elapsed > ceiling {
        return QrOutcome::TimedOut;
    }
    match result {
        Ok(ScanStatus::Scanned { ticket }) => QrOutcome::Confirmed { ticket },
        Ok(ScanStatus::Used) => QrOutcome::AlreadyUsed,
        Ok(ScanStatus::Error) => QrOutcome::Failed {
            reason: "gateway reported scan failure".to_string(),
        },
        Ok(ScanStatus::Wait) => QrOutcome::KeepPolling,
        Err(err) => QrOutcome::Failed {
            reason: err.to_string(),
        },
    }
}

/// Resolves the worker config for a fresh login: stored account config (or
/// manager defaults for a brand-new account), overridden by the request.
pub(crate) fn resolve_login_config(
    opts: &LoginOptions,
    record: Option<&AccountRecord>,
    defaults: &ManagerConfig,
) -> BotConfig {
    let mut config = match record {
        Some(record) => record.bot_config(),
        None => BotConfig {
            farm_interval_ms: defaults.default_farm_interval_ms,
            friend_interval_ms: defaults.default_friend_interval_ms,
            ..BotConfig::default()
        },
    };
    if let Some(ref platform) = opts.platform {
        config.platform = platform.clone();
    }
    if let Some(v) = opts.farm_interval_ms {
        config.farm_interval_ms = v;
    }
    if let Some(v) = opts.friend_interval_ms {
        config.friend_interval_ms = v;
    }
    if let Some(v) = opts.preferred_seed_id {
        config.preferred_seed_id = v;
    }
    if let Some(ref range) = opts.friend_time_range {
        config.friend_time_range = Some(range.clone());
    }
    if let Some(v) = opts.farm_op_min_delay_ms {
        config.farm_op_min_delay_ms = v;
    }
    if let Some(v) = opts.farm_op_max_delay_ms {
        config.farm_op_max_delay_ms = v;
    }
    config
}

impl BotManager {
    /// Reserves the account's login slot, obtains a QR challenge and spawns
    /// the poll task. Returns the challenge for the operator to render.
    pub async fn start_qr_login(
        self: &Arc<Self>,
        uin: &str,
        opts: LoginOptions,
    ) -> Result<QrChallenge, BotError> {
        let (id, cancel) = {
            let mut sessions = self.qr_sessions().lock().await;
            if sessions.contains_key(uin) {
                return Err(BotError::AlreadyInProgress(uin.to_string()));
            }
            let id = self.next_id();
            let cancel = self.root_token().child_token();
            sessions.insert(
                uin.to_string(),
                QrSession {
                    id,
                    code: String::new(),
                    url: String::new(),
                    config: BotConfig::default(),
                    state: QrState::Requested,
                    requested_at: Instant::now(),
                    cancel: cancel.clone(),
                },
            );
            (id, cancel)
        };

        match self.issue_challenge(uin, &opts, id).await {
            Ok(Some(challenge)) => {
                let manager = self.clone();
                let uin = uin.to_string();
                tokio::spawn(async move {
                    manager.run_qr_poll(uin, id, cancel).await;
                });
                Ok(challenge)
            }
            // Cancelled while the challenge was in flight; the reservation
            // is already gone and `qrCancelled` has been emitted.
            Ok(None) => Err(BotError::AlreadyInProgress(uin.to_string())),
            Err(err) => {
                self.discard_session(uin, id).await;
                Err(err)
            }
        }
    }

    /// The challenge currently awaiting a scan, if a login is in flight.
    /// Lets observers re-render the QR code after a reconnect.
    pub async fn qr_challenge(&self, uin: &str) -> Option<QrChallenge> {
        let sessions = self.qr_sessions().lock().await;
        sessions
            .get(uin)
            .filter(|session| session.state == QrState::Polling)
            .map(|session| QrChallenge {
                code: session.code.clone(),
                url: session.url.clone(),
            })
    }

    /// Discards the account's in-flight QR login, if any. Always succeeds;
    /// `qrCancelled` is only emitted when a session actually existed.
    pub async fn cancel_qr_login(&self, uin: &str) -> Result<(), BotError> {
        let removed = {
            let mut sessions = self.qr_sessions().lock().await;
            sessions.remove(uin)
        };
        if let Some(session) = removed {
            debug_assert!(can_transition(session.state, QrState::Cancelled));
            session.cancel.cancel();
            self.bus().publish(BotEvent::QrCancelled {
                uin: uin.to_string(),
            });
            info!("[{}] QR login cancelled", uin);
        }
        Ok(())
    }

    /// The awaited middle of `start_qr_login`: running check, record
    /// resolution and the gateway round trip. `Ok(None)` means the
    /// reservation vanished (cancelled) while we were away.
    async fn issue_challenge(
        &self,
        uin: &str,
        opts: &LoginOptions,
        id: u64,
    ) -> Result<Option<QrChallenge>, BotError> {
        // A confirmed-running worker excludes a new login; a stuck
        // `connecting` one does not (replace-on-start will supersede it).
        if self.handle_status(uin).await == Some(BotStatus::Running) {
            return Err(BotError::AlreadyRunning(uin.to_string()));
        }

        let record = self.store().get(uin).await?;
        let config = resolve_login_config(opts, record.as_ref(), self.config());
        if record.is_none() {
            self.store()
                .create(
                    uin,
                    &config.platform,
                    config.farm_interval_ms,
                    config.friend_interval_ms,
                )
                .await?;
        }

        let challenge = self
            .gateway()
            .request_challenge()
            .await
            .map_err(|err| BotError::Gateway(err.to_string()))?;

        let mut sessions = self.qr_sessions().lock().await;
        match sessions.get_mut(uin) {
            Some(session) if session.id == id => {
                debug_assert!(can_transition(session.state, QrState::Polling));
                session.code = challenge.code.clone();
                session.url = challenge.url.clone();
                session.config = config;
                session.state = QrState::Polling;
                info!("[{}] QR challenge issued", uin);
                Ok(Some(challenge))
            }
            _ => Ok(None),
        }
    }

    async fn run_qr_poll(self: Arc<Self>, uin: String, id: u64, cancel: CancellationToken) {
        let poll_interval = self.config().qr_poll_interval();
        let ceiling = self.config().qr_timeout();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(poll_interval) => {}
            }

            let (code, requested_at) = {
                let sessions = self.qr_sessions().lock().await;
                match sessions.get(&uin) {
                    Some(session) if session.id == id => {
                        (session.code.clone(), session.requested_at)
                    }
                    _ => return,
                }
            };

            if requested_at.elapsed() > ceiling {
                self.expire_session(&uin, id, "timeout").await;
                return;
            }

            let result = self.gateway().poll_scan(&code).await;
            match classify_poll(result, requested_at.elapsed(), ceiling) {
                QrOutcome::KeepPolling => continue,
                QrOutcome::TimedOut => {
                    self.expire_session(&uin, id, "timeout").await;
                    return;
                }
                QrOutcome::AlreadyUsed => {
                    if self.take_session(&uin, id, QrState::Expired).await.is_some() {
                        self.bus().publish(BotEvent::QrExpired {
                            uin: uin.clone(),
                            reason: "already used".to_string(),
                        });
                        info!("[{}] QR challenge already used", uin);
                    }
                    return;
                }
                QrOutcome::Failed { reason } => {
                    if self
                        .take_session(&uin, id, QrState::ScanError)
                        .await
                        .is_some()
                    {
                        warn!("[{}] QR scan failed: {}", uin, reason);
                        self.bus().publish(BotEvent::QrError {
                            uin: uin.clone(),
                            reason,
                        });
                    }
                    return;
                }
                QrOutcome::Confirmed { ticket } => {
                    self.finish_confirmed(&uin, id, &ticket).await;
                    return;
                }
            }
        }
    }

    /// Exchange the ticket, persist the credential and hand over to the
    /// regular start path. The session must still own its slot when the
    /// exchange completes, otherwise a cancel won the race and nothing
    /// happens.
    async fn finish_confirmed(self: &Arc<Self>, uin: &str, id: u64, ticket: &str) {
        let token = match self.gateway().exchange_ticket(ticket).await {
            Ok(token) => token,
            Err(err) => {
                if self.take_session(uin, id, QrState::ScanError).await.is_some() {
                    warn!("[{}] ticket exchange failed: {:#}", uin, err);
                    self.bus().publish(BotEvent::QrError {
                        uin: uin.to_string(),
                        reason: err.to_string(),
                    });
                }
                return;
            }
        };

        let Some(session) = self.take_session(uin, id, QrState::Confirmed).await else {
            return;
        };
        info!("[{}] QR scan confirmed", uin);
        self.bus().publish(BotEvent::QrScanned {
            uin: uin.to_string(),
        });

        if let Err(err) = self.store().save_token(uin, &token).await {
            warn!("[{}] saving session credential failed: {}", uin, err);
            self.bus().publish(BotEvent::QrError {
                uin: uin.to_string(),
                reason: err.to_string(),
            });
            return;
        }
        if let Err(err) = self.store().touch_last_login(uin).await {
            warn!("[{}] recording login time failed: {}", uin, err);
        }

        if let Err(err) = self
            .start_from_session(uin, &token, session.config)
            .await
        {
            warn!("[{}] start after QR login failed: {}", uin, err);
            self.bus().publish(BotEvent::BotError {
                uin: uin.to_string(),
                error: err.to_string(),
            });
        }
    }

    async fn expire_session(&self, uin: &str, id: u64, reason: &str) {
        if self.take_session(uin, id, QrState::Expired).await.is_none() {
            return;
        }
        if let Err(err) = self.store().update_status(uin, BotStatus::Stopped).await {
            warn!("[{}] status write after QR expiry failed: {}", uin, err);
        }
        self.bus().publish(BotEvent::QrExpired {
            uin: uin.to_string(),
            reason: reason.to_string(),
        });
        info!("[{}] QR login expired ({})", uin, reason);
    }

    /// Removes the session if it still owns the slot, asserting the state
    /// transition it is being removed under.
    async fn take_session(&self, uin: &str, id: u64, to: QrState) -> Option<QrSession> {
        let mut sessions = self.qr_sessions().lock().await;
        match sessions.get(uin) {
            Some(session) if session.id == id => {
                debug_assert!(can_transition(session.state, to));
                sessions.remove(uin)
            }
            _ => None,
        }
    }

    async fn discard_session(&self, uin: &str, id: u64) {
        let mut sessions = self.qr_sessions().lock().await;
        if sessions.get(uin).is_some_and(|s| s.id == id) {
            sessions.remove(uin);
        }
    }
}
