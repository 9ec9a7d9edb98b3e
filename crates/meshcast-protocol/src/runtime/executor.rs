//! Effect executor: the only place that touches I/O.
//!
//! - Send / SendWithFallback -> endpoint.send()
//! - Connect -> endpoint.connect() in a background task
//! - Deliver / RemoveOutbox / SavePeer / ForgetPeer / AnswerSync -> store
//! - ClaimHub / ReleaseHub / Reregister -> signaling
//! - Emit -> event_tx

use std::collections::VecDeque;
use std::sync::Arc;

use meshcast_transport::{Endpoint, EventStream, Signaling, TransportConfig, TransportError};
use tokio::sync::mpsc;

use crate::message::WireRecord;
use crate::store::MessageStore;
use crate::types::{ChannelId, NodeAddress, Slot};

use super::effect::RuntimeEffect;
use super::{NodeInput, ProtocolEvent};

pub(super) struct Executor<S: Signaling> {
    signaling: S,
    transport_config: TransportConfig,
    primary: Arc<S::Endpoint>,
    /// Endpoint under the rendezvous address while this node is hub.
    hub: Option<Arc<S::Endpoint>>,
    store: Arc<dyn MessageStore>,
    input_tx: mpsc::UnboundedSender<NodeInput>,
    event_tx: mpsc::Sender<ProtocolEvent>,
}

/// Tag every event of one endpoint with its address and feed it to the loop.
fn spawn_forwarder(
    local: NodeAddress,
    mut events: EventStream,
    input_tx: mpsc::UnboundedSender<NodeInput>,
) {
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            let input = NodeInput::Channel {
                local: local.clone(),
                event,
            };
            if input_tx.send(input).is_err() {
                break;
            }
        }
    });
}

impl<S: Signaling> Executor<S> {
    pub(super) fn new(
        signaling: S,
        transport_config: TransportConfig,
        primary: S::Endpoint,
        events: EventStream,
        store: Arc<dyn MessageStore>,
        input_tx: mpsc::UnboundedSender<NodeInput>,
        event_tx: mpsc::Sender<ProtocolEvent>,
    ) -> Self {
        spawn_forwarder(primary.address().clone(), events, input_tx.clone());
        Self {
            signaling,
            transport_config,
            primary: Arc::new(primary),
            hub: None,
            store,
            input_tx,
            event_tx,
        }
    }

    fn endpoint(&self, slot: Slot) -> Option<&Arc<S::Endpoint>> {
        match slot {
            Slot::Primary => Some(&self.primary),
            Slot::Hub => self.hub.as_ref(),
        }
    }

    fn emit(&self, event: ProtocolEvent) {
        // Never block the loop on a slow consumer.
        if let Err(mpsc::error::TrySendError::Full(event)) = self.event_tx.try_send(event) {
            tracing::warn!(?event, "event channel full, event dropped");
        }
    }

    fn emit_error(&self, description: String) {
        self.emit(ProtocolEvent::Error { description });
    }

    /// Execute effects in order. Fallback branches run in place of the
    /// effect that produced them.
    pub(super) async fn execute(&mut self, effects: Vec<RuntimeEffect>) {
        let mut queue: VecDeque<RuntimeEffect> = effects.into();
        while let Some(effect) = queue.pop_front() {
            match effect {
                RuntimeEffect::Send { channel, record } => {
                    self.send(&channel, &record).await;
                }
                RuntimeEffect::SendWithFallback {
                    channel,
                    record,
                    on_success,
                    on_failure,
                } => {
                    let branch = if self.send(&channel, &record).await {
                        on_success
                    } else {
                        on_failure
                    };
                    for next in branch.into_iter().rev() {
                        queue.push_front(next);
                    }
                }
                RuntimeEffect::Connect { address } => {
                    let endpoint = self.primary.clone();
                    tokio::spawn(async move {
                        if let Err(e) = endpoint.connect(&address).await {
                            tracing::debug!(%address, "connect failed: {e}");
                        }
                    });
                }
                RuntimeEffect::Close { channel } => {
                    if let Some(endpoint) = self.endpoint(channel.slot) {
                        endpoint.close(&channel.remote).await;
                    }
                }
                RuntimeEffect::Deliver(message) => match self.store.append(&message).await {
                    Ok(true) => self.emit(ProtocolEvent::MessageReady {
                        message,
                        local_echo: false,
                    }),
                    Ok(false) => tracing::debug!(id = %message.id, "message already stored"),
                    Err(e) => {
                        tracing::warn!(id = %message.id, "storing message failed: {e}");
                        self.emit_error(format!("store message {}: {e}", message.id));
                    }
                },
                RuntimeEffect::RemoveOutbox { id } => {
                    if let Err(e) = self.store.remove_outbox(&id).await {
                        tracing::warn!(%id, "removing outbox entry failed: {e}");
                        self.emit_error(format!("remove outbox entry {id}: {e}"));
                    }
                }
                RuntimeEffect::Requeue(entry) => {
                    let _ = self.input_tx.send(NodeInput::Requeue(entry));
                }
                RuntimeEffect::SavePeer(peer) => {
                    if let Err(e) = self.store.save_peer(&peer).await {
                        tracing::warn!(address = %peer.address, "saving peer failed: {e}");
                    }
                }
                RuntimeEffect::ForgetPeer(address) => {
                    if let Err(e) = self.store.forget_peer(&address).await {
                        tracing::warn!(%address, "forgetting peer failed: {e}");
                    }
                }
                RuntimeEffect::AnswerSync { channel, query } => {
                    match self.store.query_by_time(&query).await {
                        Ok(messages) => {
                            tracing::debug!(%channel, count = messages.len(), "answering sync");
                            self.send(&channel, &WireRecord::SyncResponse { messages })
                                .await;
                        }
                        Err(e) => {
                            tracing::warn!(%channel, "sync query failed: {e}");
                            self.emit_error(format!("sync query: {e}"));
                        }
                    }
                }
                RuntimeEffect::ClaimHub { address } => self.claim_hub(address).await,
                RuntimeEffect::ReleaseHub => self.release_hub().await,
                RuntimeEffect::ScheduleContention { after } => {
                    let input_tx = self.input_tx.clone();
                    tokio::spawn(async move {
                        tokio::time::sleep(after).await;
                        let _ = input_tx.send(NodeInput::ContentionDue);
                    });
                }
                RuntimeEffect::Reregister => {
                    let ok = match self.primary.reregister().await {
                        Ok(()) => true,
                        Err(e) => {
                            tracing::warn!("re-registration failed: {e}");
                            false
                        }
                    };
                    let _ = self.input_tx.send(NodeInput::Reregistered(ok));
                }
                RuntimeEffect::Emit(event) => self.emit(event),
            }
        }
    }

    /// Serialize and send one record. Returns whether the transport took it.
    async fn send(&self, channel: &ChannelId, record: &WireRecord) -> bool {
        let Some(endpoint) = self.endpoint(channel.slot) else {
            tracing::debug!(%channel, "no endpoint for channel");
            return false;
        };
        let bytes = match record.to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                self.emit_error(format!("serialize {} failed: {e}", record.kind()));
                return false;
            }
        };
        match endpoint.send(&channel.remote, bytes).await {
            Ok(()) => {
                tracing::debug!(%channel, kind = record.kind(), "record sent");
                true
            }
            Err(e) => {
                tracing::debug!(%channel, kind = record.kind(), "send failed: {e}");
                false
            }
        }
    }

    async fn claim_hub(&mut self, address: NodeAddress) {
        match self
            .signaling
            .open(address.clone(), &self.transport_config)
            .await
        {
            Ok((endpoint, events)) => {
                if let Some(old) = self.hub.replace(Arc::new(endpoint)) {
                    old.shutdown().await;
                }
                // Queued before any event of the new endpoint can be.
                let _ = self.input_tx.send(NodeInput::HubClaimed {
                    address: address.clone(),
                });
                spawn_forwarder(address, events, self.input_tx.clone());
            }
            Err(e) => {
                match e {
                    TransportError::AddressUnavailable { .. } => {
                        tracing::debug!(%address, "rendezvous claim lost");
                    }
                    e => tracing::warn!(%address, "rendezvous claim failed: {e}"),
                }
                let _ = self.input_tx.send(NodeInput::HubRejected { address });
            }
        }
    }

    async fn release_hub(&mut self) {
        if let Some(hub) = self.hub.take() {
            tracing::info!(address = %hub.address(), "releasing rendezvous");
            hub.shutdown().await;
        }
    }

    /// Release every endpoint.
    pub(super) async fn shutdown(&mut self) {
        self.release_hub().await;
        self.primary.shutdown().await;
    }
}
