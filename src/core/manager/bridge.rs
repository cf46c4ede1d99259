//! Worker event bridge.
//!
//! One task per registered worker drains its event channel, persists what
//! must be durable and republishes onto the bus. Events from a worker whose
//! generation no longer owns the account slot are dropped; a channel that
//! closes without an orchestrator-initiated teardown is recorded as a crash.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::BotManager;
use crate::core::bus::BotEvent;
use crate::core::store::types::BotStatus;
use crate::core::worker::WorkerEvent;

pub(crate) fn spawn(
    manager: Arc<BotManager>,
    uin: String,
    generation: u64,
    mut events: mpsc::Receiver<WorkerEvent>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => return,
                event = events.recv() => event,
            };
            let Some(event) = event else {
                // The worker dropped its sender. A stopped worker may
                // release its channel too; only a close nobody asked for
                // is a crash.
                if manager.generation_matches(&uin, generation).await
                    && !manager.stop_was_requested(&uin, generation).await
                {
                    warn!("[{}] worker event channel closed unexpectedly", uin);
                    if let Err(err) = manager
                        .store()
                        .update_status(&uin, BotStatus::Error)
                        .await
                    {
                        warn!("[{}] status write after worker loss failed: {}", uin, err);
                    }
                    manager.bus().publish(BotEvent::BotError {
                        uin: uin.clone(),
                        error: "worker terminated unexpectedly".to_string(),
                    });
                }
                return;
            };

            if !manager.generation_matches(&uin, generation).await {
                continue;
            }
            match event {
                WorkerEvent::Log(entry) => {
                    if let Err(err) = manager.store().add_log(&uin, &entry).await {
                        warn!("[{}] log persist failed: {}", uin, err);
                    }
                    manager.bus().publish(BotEvent::Log {
                        uin: uin.clone(),
                        entry,
                    });
                }
                WorkerEvent::StatusChange { old, new } => {
                    if let Err(err) = manager.store().update_status(&uin, new).await {
                        warn!("[{}] status persist failed: {}", uin, err);
                    }
                    manager.bus().publish(BotEvent::StatusChange {
                        uin: uin.clone(),
                        old,
                        new,
                    });
                }
                WorkerEvent::StateUpdate { profile } => {
                    if let Err(err) = manager.store().update_game_state(&uin, &profile).await {
                        warn!("[{}] game state persist failed: {}", uin, err);
                    }
                    manager.bus().publish(BotEvent::StateUpdate {
                        uin: uin.clone(),
                        profile,
                    });
                }
            }
        }
    });
}
