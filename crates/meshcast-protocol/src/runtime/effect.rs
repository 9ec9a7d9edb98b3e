use std::time::Duration;

use crate::message::{Message, WireRecord};
use crate::store::{HistoryQuery, OutboxEntry};
use crate::types::{ChannelId, KnownPeer, MessageId, NodeAddress};

use super::ProtocolEvent;

/// An intention produced by the pure [`RuntimeState`](super::state::RuntimeState).
///
/// Every `handle_*` / `tick_*` method returns `Vec<RuntimeEffect>`; the
/// executor is the only place that turns them into I/O.
#[derive(Debug)]
pub enum RuntimeEffect {
    /// Send one record over a channel.
    Send { channel: ChannelId, record: WireRecord },

    /// Try to send; run `on_success` or `on_failure` depending on the outcome.
    SendWithFallback {
        channel: ChannelId,
        record: WireRecord,
        on_success: Vec<RuntimeEffect>,
        on_failure: Vec<RuntimeEffect>,
    },

    /// Dial from the primary endpoint (in the background).
    Connect { address: NodeAddress },

    Close { channel: ChannelId },

    /// Persist an inbound message, then hand it to the application.
    Deliver(Message),

    RemoveOutbox { id: MessageId },

    /// Put a failed outbox entry back in the in-memory queue.
    Requeue(OutboxEntry),

    SavePeer(KnownPeer),

    ForgetPeer(NodeAddress),

    /// Run `query` against the store and reply with a `SYNC_RESPONSE`.
    AnswerSync { channel: ChannelId, query: HistoryQuery },

    /// Open a second endpoint under the rendezvous address.
    ClaimHub { address: NodeAddress },

    /// Shut the rendezvous endpoint down.
    ReleaseHub,

    /// Wake the election after a randomized backoff.
    ScheduleContention { after: Duration },

    /// Re-register the primary endpoint with signaling.
    Reregister,

    Emit(ProtocolEvent),
}
