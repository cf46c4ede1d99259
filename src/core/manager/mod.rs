//! The session orchestrator.
//!
//! `BotManager` owns the authoritative in-memory registry: one
//! [`BotHandle`] per currently-active account and at most one QR login
//! session per account. All registry mutation goes through the methods
//! here and in `qr.rs`; lock scopes never span an await, so one account's
//! slow gateway call or worker teardown cannot delay another account's
//! operations.

mod bridge;
mod qr;

pub use qr::LoginOptions;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::ManagerConfig;
use crate::core::bus::{BotEvent, EventBus};
use crate::core::error::BotError;
use crate::core::gateway::AuthGateway;
use crate::core::store::AccountStore;
use crate::core::store::types::{AccountRecord, AccountView, BotStatus, StoredLog};
use crate::core::worker::{BotConfig, ConfigPatch, Worker, WorkerFactory, WorkerSnapshot};
use self::qr::QrSession;

/// A registered live worker. Destroyed on stop is NOT enough to evict it:
/// the handle stays addressable for its last snapshot until it is replaced
/// or the account is removed.
pub(crate) struct BotHandle {
    pub worker: Arc<dyn Worker>,
    /// Identity of this registration. Late events and start results are
    /// checked against it, since a replacement worker may already own the
    /// account's slot.
    pub generation: u64,
    /// Cancels the bridge task; cancelled before any orchestrator-initiated
    /// destroy so the bridge can tell teardown from a worker crash.
    pub teardown: CancellationToken,
    /// Set by `stop`. Read views clamp a still-tearing-down worker to
    /// `stopped` so the registry's decision is visible immediately.
    pub stop_requested: AtomicBool,
}

impl BotHandle {
    fn effective_status(&self, snapshot: &WorkerSnapshot) -> BotStatus {
        if self.stop_requested.load(Ordering::Relaxed)
            && matches!(snapshot.status, BotStatus::Running | BotStatus::Connecting)
        {
            BotStatus::Stopped
        } else {
            snapshot.status
        }
    }
}

pub struct BotManager {
    config: ManagerConfig,
    store: Arc<AccountStore>,
    gateway: Arc<dyn AuthGateway>,
    factory: Arc<dyn WorkerFactory>,
    bus: EventBus,
    bots: Mutex<HashMap<String, BotHandle>>,
    qr_sessions: Mutex<HashMap<String, QrSession>>,
    /// Shared counter for handle generations and QR session ids.
    next_id: AtomicU64,
    /// Parent of every per-handle/per-session token; cancelled on shutdown.
    root: CancellationToken,
}

impl BotManager {
    pub fn new(
        config: ManagerConfig,
        store: Arc<AccountStore>,
        gateway: Arc<dyn AuthGateway>,
        factory: Arc<dyn WorkerFactory>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            config,
            store,
            gateway,
            factory,
            bus: EventBus::new(256),
            bots: Mutex::new(HashMap::new()),
            qr_sessions: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            root: CancellationToken::new(),
        });
        manager.clone().spawn_flush_loop();
        manager
    }

    /// Dashboard-wide event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BotEvent> {
        self.bus.subscribe()
    }

    /// Event stream scoped to one account.
    pub fn subscribe_account(&self, uin: &str) -> broadcast::Receiver<BotEvent> {
        self.bus.subscribe_account(uin)
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub(crate) fn store(&self) -> &AccountStore {
        &self.store
    }

    pub(crate) fn gateway(&self) -> &dyn AuthGateway {
        self.gateway.as_ref()
    }

    pub(crate) fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub(crate) fn root_token(&self) -> &CancellationToken {
        &self.root
    }

    pub(crate) fn qr_sessions(&self) -> &Mutex<HashMap<String, QrSession>> {
        &self.qr_sessions
    }

    pub(crate) async fn generation_matches(&self, uin: &str, generation: u64) -> bool {
        let bots = self.bots.lock().await;
        bots.get(uin).is_some_and(|h| h.generation == generation)
    }

    /// Whether an operator `stop` was issued for this registration.
    pub(crate) async fn stop_was_requested(&self, uin: &str, generation: u64) -> bool {
        let bots = self.bots.lock().await;
        bots.get(uin)
            .filter(|h| h.generation == generation)
            .is_some_and(|h| h.stop_requested.load(Ordering::Relaxed))
    }

    // --------------------------------------------------------------------
    //  Read path
    // --------------------------------------------------------------------

    /// Durable records merged with live snapshots, newest account first.
    /// A record claiming `running` with no live handle is reported as
    /// `stopped`; storage is only corrected by explicit lifecycle writes.
    pub async fn list_accounts(&self) -> Result<Vec<AccountView>, BotError> {
        let records = self.store.list().await?;
        let bots = self.bots.lock().await;
        Ok(records
            .into_iter()
            .map(|record| match bots.get(&record.uin) {
                Some(handle) => live_view(record, handle),
                None => offline_view(record),
            })
            .collect())
    }

    pub async fn get_account(&self, uin: &str) -> Result<Option<AccountView>, BotError> {
        let Some(record) = self.store.get(uin).await? else {
            return Ok(None);
        };
        let bots = self.bots.lock().await;
        Ok(Some(match bots.get(uin) {
            Some(handle) => live_view(record, handle),
            None => offline_view(record),
        }))
    }

    /// Bounded log history pull, most-recent-last.
    pub async fn get_logs(
        &self,
        uin: &str,
        limit: Option<usize>,
    ) -> Result<Vec<StoredLog>, BotError> {
        let limit = limit.unwrap_or(self.config.log_history_limit);
        Ok(self.store.recent_logs(uin, limit).await?)
    }

    // --------------------------------------------------------------------
    //  Lifecycle
    // --------------------------------------------------------------------

    /// Registers and starts a worker for `uin` with the given session
    /// token. Replace-on-start: an existing handle is destroyed first, the
    /// new registration always wins. The worker's own start routine runs in
    /// a spawned task; a start failure surfaces as durable `error` status
    /// plus a `botError` event, never as an error to this caller.
    pub async fn start_from_session(
        self: &Arc<Self>,
        uin: &str,
        token: &str,
        config: BotConfig,
    ) -> Result<(), BotError> {
        let generation = self.next_id();
        let (worker, events) = self.factory.build(uin, config);
        let teardown = self.root.child_token();

        let replaced = {
            let mut bots = self.bots.lock().await;
            bots.insert(
                uin.to_string(),
                BotHandle {
                    worker: worker.clone(),
                    generation,
                    teardown: teardown.clone(),
                    stop_requested: AtomicBool::new(false),
                },
            )
        };
        if let Some(old) = replaced {
            old.teardown.cancel();
            let old_worker = old.worker;
            tokio::spawn(async move { old_worker.destroy().await });
            info!("[{}] replacing existing bot instance", uin);
        }

        bridge::spawn(self.clone(), uin.to_string(), generation, events, teardown);

        self.store.update_status(uin, BotStatus::Connecting).await?;
        info!("[{}] bot starting", uin);

        let manager = self.clone();
        let uin = uin.to_string();
        let token = token.to_string();
        tokio::spawn(async move {
            if let Err(err) = worker.start(&token).await {
                if !manager.generation_matches(&uin, generation).await {
                    return;
                }
                let failure = BotError::WorkerStart(err.to_string());
                warn!("[{}] {}", uin, failure);
                if let Err(store_err) = manager.store.update_status(&uin, BotStatus::Error).await {
                    warn!("[{}] status write after start failure: {}", uin, store_err);
                }
                manager.bus.publish(BotEvent::BotError {
                    uin: uin.clone(),
                    error: failure.to_string(),
                });
            }
        });
        Ok(())
    }

    /// Requests worker shutdown and durably marks the account stopped. The
    /// handle stays registered (its last snapshot remains readable); calling
    /// this again is a no-op success.
    pub async fn stop(&self, uin: &str) -> Result<(), BotError> {
        let worker = {
            let bots = self.bots.lock().await;
            match bots.get(uin) {
                Some(handle) => {
                    handle.stop_requested.store(true, Ordering::Relaxed);
                    handle.worker.clone()
                }
                None => return Err(BotError::NotFound(uin.to_string())),
            }
        };
        worker.stop().await;
        self.store.update_status(uin, BotStatus::Stopped).await?;
        info!("[{}] bot stopped", uin);
        Ok(())
    }

    /// Starts the worker again from the persisted session token and the
    /// account's stored scheduling config.
    pub async fn restart(self: &Arc<Self>, uin: &str) -> Result<(), BotError> {
        let record = self
            .store
            .get(uin)
            .await?
            .ok_or_else(|| BotError::NotFound(uin.to_string()))?;
        let token = self
            .store
            .decrypted_token(uin)
            .await?
            .ok_or_else(|| BotError::NoCredential(uin.to_string()))?;
        self.start_from_session(uin, &token, record.bot_config())
            .await
    }

    /// Destroys any live handle and in-flight QR login, then deletes the
    /// durable record and its log history. Irreversible.
    pub async fn remove(&self, uin: &str) -> Result<(), BotError> {
        let handle = { self.bots.lock().await.remove(uin) };
        let session = { self.qr_sessions.lock().await.remove(uin) };
        let record_exists = self.store.get(uin).await?.is_some();

        if handle.is_none() && session.is_none() && !record_exists {
            return Err(BotError::NotFound(uin.to_string()));
        }

        if let Some(handle) = handle {
            handle.teardown.cancel();
            handle.worker.destroy().await;
        }
        if let Some(session) = session {
            session.cancel.cancel();
        }
        self.store.delete(uin).await?;
        self.bus.drop_account(uin);
        info!("[{}] account removed", uin);
        Ok(())
    }

    /// Persists the changed fields and, when a worker is live, applies them
    /// to its runtime config without a restart; they take effect on the
    /// worker's next scheduling cycle. No status change is emitted.
    pub async fn update_config(&self, uin: &str, patch: &ConfigPatch) -> Result<(), BotError> {
        if self.store.get(uin).await?.is_none() {
            return Err(BotError::NotFound(uin.to_string()));
        }
        self.store.apply_patch(uin, patch).await?;

        let worker = {
            let bots = self.bots.lock().await;
            bots.get(uin).map(|h| h.worker.clone())
        };
        if let Some(worker) = worker {
            worker.apply_patch(patch);
            info!("[{}] live config updated", uin);
        }
        Ok(())
    }

    /// Recovery on process start: every account flagged auto-start with a
    /// stored session token is started. Per-account failures are logged and
    /// skipped; returns the number of accounts scheduled.
    pub async fn auto_recover(self: &Arc<Self>) -> Result<usize, BotError> {
        let candidates = self.store.list_auto_start().await?;
        if candidates.is_empty() {
            return Ok(0);
        }
        info!("auto-starting {} account(s)", candidates.len());

        let mut started = 0;
        for record in candidates {
            let uin = record.uin.clone();
            let token = match self.store.decrypted_token(&uin).await {
                Ok(Some(token)) => token,
                Ok(None) => {
                    warn!("[{}] auto-start skipped: no stored session", uin);
                    continue;
                }
                Err(err) => {
                    warn!("[{}] auto-start failed reading credential: {}", uin, err);
                    continue;
                }
            };
            match self
                .start_from_session(&uin, &token, record.bot_config())
                .await
            {
                Ok(()) => {
                    started += 1;
                    info!("[{}] auto-start scheduled", uin);
                }
                Err(err) => warn!("[{}] auto-start failed: {}", uin, err),
            }
        }
        Ok(started)
    }

    /// Destroys every worker, discards QR sessions, stops background tasks
    /// and flushes the store. The manager is inert afterwards.
    pub async fn shutdown(&self) {
        info!("shutting down all bots");
        self.root.cancel();

        let handles: Vec<BotHandle> = {
            let mut bots = self.bots.lock().await;
            bots.drain().map(|(_, handle)| handle).collect()
        };
        for handle in handles {
            handle.teardown.cancel();
            handle.worker.destroy().await;
        }

        let sessions: Vec<QrSession> = {
            let mut sessions = self.qr_sessions.lock().await;
            sessions.drain().map(|(_, session)| session).collect()
        };
        for session in sessions {
            session.cancel.cancel();
        }

        if let Err(err) = self.store.flush().await {
            warn!("final store flush failed: {}", err);
        }
    }

    /// Live workers currently registered. Test and introspection helper.
    pub async fn active_bots(&self) -> Vec<String> {
        let bots = self.bots.lock().await;
        bots.keys().cloned().collect()
    }

    pub(crate) async fn handle_status(&self, uin: &str) -> Option<BotStatus> {
        let bots = self.bots.lock().await;
        bots.get(uin)
            .map(|handle| handle.effective_status(&handle.worker.snapshot()))
    }

    fn spawn_flush_loop(self: Arc<Self>) {
        let cancel = self.root.clone();
        let interval = self.config.flush_interval();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(interval) => {}
                }
                if let Err(err) = self.store.flush().await {
                    warn!("periodic store flush failed: {}", err);
                }
            }
        });
    }
}

fn live_view(record: AccountRecord, handle: &BotHandle) -> AccountView {
    let snapshot = handle.worker.snapshot();
    let status = handle.effective_status(&snapshot);
    AccountView {
        nickname: snapshot
            .profile
            .nickname
            .clone()
            .unwrap_or_else(|| record.nickname.clone()),
        gid: snapshot.profile.gid.unwrap_or(record.gid),
        level: snapshot.profile.level.unwrap_or(record.level),
        gold: snapshot.profile.gold.unwrap_or(record.gold),
        exp: snapshot.profile.exp.unwrap_or(record.exp),
        status,
        error_message: snapshot.error_message,
        started_at: snapshot.started_at,
        uptime_secs: snapshot.uptime_secs,
        uin: record.uin,
        platform: record.platform,
        farm_interval_ms: record.farm_interval_ms,
        friend_interval_ms: record.friend_interval_ms,
        auto_start: record.auto_start,
        created_at: record.created_at,
    }
}

fn offline_view(record: AccountRecord) -> AccountView {
    AccountView {
        // Self-healing read: no live handle means not running, whatever a
        // stale row claims.
        status: if record.status == BotStatus::Running {
            BotStatus::Stopped
        } else {
            record.status
        },
        uin: record.uin,
        nickname: record.nickname,
        gid: record.gid,
        level: record.level,
        gold: record.gold,
        exp: record.exp,
        error_message: String::new(),
        platform: record.platform,
        farm_interval_ms: record.farm_interval_ms,
        friend_interval_ms: record.friend_interval_ms,
        auto_start: record.auto_start,
        started_at: None,
        uptime_secs: 0,
        created_at: record.created_at,
    }
}

#[cfg(test)]
mod tests;
