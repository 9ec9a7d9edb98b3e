/// The node event loop.
///
/// A single async task that owns all protocol state and multiplexes over
/// tagged endpoint events, application commands and timers.
use std::sync::Arc;

use meshcast_transport::Signaling;
use tokio::sync::mpsc;

use crate::error::MeshError;
use crate::store::{MessageStore, OutboxEntry};
use crate::types::now_ms;

use super::executor::Executor;
use super::state::RuntimeState;
use super::{NodeInput, RuntimeCommand, RuntimeConfig};

/// Persist a local message and its outbox entry before anything is sent.
async fn persist_local(store: &dyn MessageStore, entry: &OutboxEntry) -> Result<(), MeshError> {
    store.append(&entry.message).await?;
    store.enqueue_outbox(entry).await
}

/// Main event loop. Owns all protocol state.
pub(super) async fn runtime_loop<S: Signaling>(
    mut state: RuntimeState,
    mut executor: Executor<S>,
    store: Arc<dyn MessageStore>,
    config: RuntimeConfig,
    mut cmd_rx: mpsc::Receiver<RuntimeCommand>,
    mut input_rx: mpsc::UnboundedReceiver<NodeInput>,
) {
    let effects = state.startup(now_ms());
    executor.execute(effects).await;

    // ── Timers ──────────────────────────────────────────────────────
    let mut maintenance = tokio::time::interval(config.maintenance_interval);
    let mut pex = tokio::time::interval(config.pex_interval);
    let mut retry = tokio::time::interval(config.retry_interval);

    // Skip the immediate first tick on all intervals
    maintenance.tick().await;
    pex.tick().await;
    retry.tick().await;

    loop {
        tokio::select! {
            // ── 1. Endpoint events and executor feedback ────────────
            Some(input) = input_rx.recv() => {
                let now = now_ms();
                let effects = match input {
                    NodeInput::Channel { local, event } => {
                        state.handle_channel_event(&local, event, now)
                    }
                    NodeInput::HubClaimed { address } => state.handle_hub_claimed(address),
                    NodeInput::HubRejected { address } => state.handle_hub_rejected(address, now),
                    NodeInput::ContentionDue => state.handle_contention_due(now),
                    NodeInput::Requeue(entry) => {
                        state.handle_requeue(entry);
                        Vec::new()
                    }
                    NodeInput::Reregistered(ok) => {
                        state.handle_reregistered(ok);
                        Vec::new()
                    }
                };
                executor.execute(effects).await;
            }

            // ── 2. Application commands ─────────────────────────────
            cmd = cmd_rx.recv() => {
                let Some(cmd) = cmd else {
                    tracing::debug!("all runtime handles dropped");
                    break;
                };
                let now = now_ms();
                match cmd {
                    RuntimeCommand::SendMessage { body, target, reply } => {
                        let entry = state.compose(body, target, now);
                        match persist_local(store.as_ref(), &entry).await {
                            Ok(()) => {
                                let id = entry.message.id.clone();
                                let effects = state.handle_local_stored(entry, now);
                                let _ = reply.send(Ok(id));
                                executor.execute(effects).await;
                            }
                            Err(e) => {
                                tracing::warn!(id = %entry.message.id, "persisting local message failed: {e}");
                                let _ = reply.send(Err(e));
                            }
                        }
                    }
                    RuntimeCommand::History { query, reply } => {
                        let _ = reply.send(store.query_by_time(&query).await);
                    }
                    RuntimeCommand::KnownPeers { reply } => {
                        let _ = reply.send(state.mesh.known_peers());
                    }
                    RuntimeCommand::OpenChannels { reply } => {
                        let _ = reply.send(state.mesh.active_addresses());
                    }
                    RuntimeCommand::Connect { address } => {
                        let effects = state.handle_connect(address, now);
                        executor.execute(effects).await;
                    }
                    RuntimeCommand::Wake => {
                        let effects = state.handle_wake(now);
                        executor.execute(effects).await;
                    }
                    RuntimeCommand::Shutdown => {
                        tracing::info!(address = %state.local, "runtime shutting down");
                        break;
                    }
                }
            }

            // ── 3. Timers ───────────────────────────────────────────
            _ = maintenance.tick() => {
                let effects = state.tick_maintenance(now_ms());
                executor.execute(effects).await;
            }
            _ = pex.tick() => {
                let effects = state.tick_pex();
                executor.execute(effects).await;
            }
            _ = retry.tick() => {
                let effects = state.tick_retry(now_ms());
                executor.execute(effects).await;
            }
        }
    }

    executor.shutdown().await;
}
