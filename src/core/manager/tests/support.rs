//! Scripted collaborators for manager tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::config::ManagerConfig;
use crate::core::gateway::{AuthGateway, QrChallenge, ScanStatus};
use crate::core::manager::BotManager;
use crate::core::store::AccountStore;
use crate::core::store::types::{BotStatus, GameProfile};
use crate::core::worker::{
    BotConfig, ConfigPatch, Worker, WorkerEvent, WorkerFactory, WorkerSnapshot,
};

pub const CHALLENGE_CODE: &str = "qr-code-1";
pub const CHALLENGE_URL: &str = "https://gateway.test/qr/1";

/// Gateway with a scripted sequence of poll answers. Once the script runs
/// out, every further poll answers `Wait`.
pub struct MockGateway {
    challenge_fails: bool,
    polls: Mutex<VecDeque<Result<ScanStatus, String>>>,
    tickets: Mutex<HashMap<String, Result<String, String>>>,
}

impl MockGateway {
    pub fn never() -> Self {
        Self {
            challenge_fails: false,
            polls: Mutex::new(VecDeque::new()),
            tickets: Mutex::new(HashMap::new()),
        }
    }

    /// Answers `Wait` for `waits` polls, then confirms with `ticket`, which
    /// exchanges into `token`.
    pub fn confirm_after(waits: usize, ticket: &str, token: &str) -> Self {
        let gateway = Self::never();
        {
            let mut polls = gateway.polls.lock().unwrap();
            for _ in 0..waits {
                polls.push_back(Ok(ScanStatus::Wait));
            }
            polls.push_back(Ok(ScanStatus::Scanned {
                ticket: ticket.to_string(),
            }));
        }
        gateway
            .tickets
            .lock()
            .unwrap()
            .insert(ticket.to_string(), Ok(token.to_string()));
        gateway
    }

    pub fn scripted(answers: Vec<Result<ScanStatus, String>>) -> Self {
        let gateway = Self::never();
        *gateway.polls.lock().unwrap() = answers.into();
        gateway
    }

    pub fn failing_challenge() -> Self {
        Self {
            challenge_fails: true,
            polls: Mutex::new(VecDeque::new()),
            tickets: Mutex::new(HashMap::new()),
        }
    }

    pub fn failing_exchange(ticket: &str, reason: &str) -> Self {
        let gateway = Self::scripted(vec![Ok(ScanStatus::Scanned {
            ticket: ticket.to_string(),
        })]);
        gateway
            .tickets
            .lock()
            .unwrap()
            .insert(ticket.to_string(), Err(reason.to_string()));
        gateway
    }
}

#[async_trait]
impl AuthGateway for MockGateway {
    async fn request_challenge(&self) -> anyhow::Result<QrChallenge> {
        if self.challenge_fails {
            anyhow::bail!("gateway offline");
        }
        Ok(QrChallenge {
            code: CHALLENGE_CODE.to_string(),
            url: CHALLENGE_URL.to_string(),
        })
    }

    async fn poll_scan(&self, _code: &str) -> anyhow::Result<ScanStatus> {
        match self.polls.lock().unwrap().pop_front() {
            Some(Ok(status)) => Ok(status),
            Some(Err(reason)) => Err(anyhow::anyhow!(reason)),
            None => Ok(ScanStatus::Wait),
        }
    }

    async fn exchange_ticket(&self, ticket: &str) -> anyhow::Result<String> {
        match self.tickets.lock().unwrap().get(ticket) {
            Some(Ok(token)) => Ok(token.clone()),
            Some(Err(reason)) => Err(anyhow::anyhow!(reason.clone())),
            None => Err(anyhow::anyhow!("unknown ticket {ticket}")),
        }
    }
}

pub struct MockWorker {
    pub uin: String,
    pub config: Mutex<BotConfig>,
    status: Mutex<BotStatus>,
    pub started_with: Mutex<Option<String>>,
    pub destroyed: AtomicBool,
    fail_start: bool,
    /// Simulates a worker whose async teardown has not finished: `stop`
    /// leaves the snapshot status untouched.
    pub ignore_stop: AtomicBool,
    events: Mutex<Option<mpsc::Sender<WorkerEvent>>>,
}

impl MockWorker {
    fn new(
        uin: &str,
        config: BotConfig,
        events: mpsc::Sender<WorkerEvent>,
        fail_start: bool,
    ) -> Self {
        Self {
            uin: uin.to_string(),
            config: Mutex::new(config),
            status: Mutex::new(BotStatus::Connecting),
            started_with: Mutex::new(None),
            destroyed: AtomicBool::new(false),
            fail_start,
            ignore_stop: AtomicBool::new(false),
            events: Mutex::new(Some(events)),
        }
    }

    /// Send failures are ignored: a replaced worker's bridge has already
    /// dropped the receiver.
    pub async fn emit(&self, event: WorkerEvent) {
        let sender = self.events.lock().unwrap().clone();
        if let Some(sender) = sender {
            let _ = sender.send(event).await;
        }
    }

    /// Drops the event sender, closing the bridge's channel as a crashing
    /// worker would.
    pub fn drop_sender(&self) {
        self.events.lock().unwrap().take();
    }

    fn set_status(&self, status: BotStatus) {
        *self.status.lock().unwrap() = status;
    }
}

#[async_trait]
impl Worker for MockWorker {
    async fn start(&self, session_token: &str) -> anyhow::Result<()> {
        *self.started_with.lock().unwrap() = Some(session_token.to_string());
        if self.fail_start {
            self.set_status(BotStatus::Error);
            anyhow::bail!("login rejected by game server");
        }
        self.set_status(BotStatus::Running);
        self.emit(WorkerEvent::StatusChange {
            old: BotStatus::Connecting,
            new: BotStatus::Running,
        })
        .await;
        Ok(())
    }

    async fn stop(&self) {
        if self.ignore_stop.load(Ordering::Relaxed) {
            return;
        }
        self.set_status(BotStatus::Stopped);
    }

    async fn destroy(&self) {
        self.destroyed.store(true, Ordering::Relaxed);
        self.set_status(BotStatus::Stopped);
    }

    fn snapshot(&self) -> WorkerSnapshot {
        let status = *self.status.lock().unwrap();
        WorkerSnapshot {
            status,
            profile: GameProfile::default(),
            error_message: String::new(),
            started_at: if status == BotStatus::Running {
                Some(1_000)
            } else {
                None
            },
            uptime_secs: 0,
        }
    }

    fn apply_patch(&self, patch: &ConfigPatch) {
        patch.apply_to(&mut self.config.lock().unwrap());
    }
}

#[derive(Default)]
pub struct MockFactory {
    pub fail_start: AtomicBool,
    created: Mutex<Vec<Arc<MockWorker>>>,
}

impl MockFactory {
    pub fn last(&self) -> Arc<MockWorker> {
        self.created
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no worker built yet")
    }

    pub fn built(&self) -> usize {
        self.created.lock().unwrap().len()
    }
}

impl WorkerFactory for MockFactory {
    fn build(&self, uin: &str, config: BotConfig) -> (Arc<dyn Worker>, mpsc::Receiver<WorkerEvent>) {
        let (tx, rx) = mpsc::channel(64);
        let worker = Arc::new(MockWorker::new(
            uin,
            config,
            tx,
            self.fail_start.load(Ordering::Relaxed),
        ));
        self.created.lock().unwrap().push(worker.clone());
        (worker, rx)
    }
}

pub struct Harness {
    pub manager: Arc<BotManager>,
    pub store: Arc<AccountStore>,
    pub factory: Arc<MockFactory>,
}

/// Manager over an in-memory store with test-speed cadences: 10ms polls,
/// 200ms QR ceiling.
pub fn harness(gateway: MockGateway) -> Harness {
    let config = ManagerConfig {
        qr_poll_interval_ms: 10,
        qr_timeout_ms: 200,
        flush_interval_ms: 60_000,
        ..ManagerConfig::default()
    };
    let store = Arc::new(AccountStore::open_in_memory().expect("in-memory store"));
    let factory = Arc::new(MockFactory::default());
    let manager = BotManager::new(config, store.clone(), Arc::new(gateway), factory.clone());
    Harness {
        manager,
        store,
        factory,
    }
}

/// Polls `cond` every 10ms for up to 2s.
pub async fn wait_for<F>(what: &str, mut cond: F)
where
    F: AsyncFnMut() -> bool,
{
    for _ in 0..200 {
        if cond().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for: {what}");
}
