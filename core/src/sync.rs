//! One-hop replication between the phone and the watch.
//!
//! Only the device that created an entry sends it, and only when the peer
//! answers a reachability probe. The receiving device stores the entry under
//! its "received from peer" origin, which makes it ineligible for sending, so
//! an entry crosses the link at most once. There is no retry queue and no
//! acknowledgment: anything missed here is left to the managed replication
//! layer underneath.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::db::EntryStore;
use crate::events::{ChangeEvent, EventBus};
use crate::models::{Device, Entry, InsertOutcome, Target};

/// Wire schema of a replicated entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncMessage {
    pub id: Uuid,
    pub name: String,
    #[serde(rename = "timestampISO8601")]
    pub timestamp: DateTime<Utc>,
    pub origin_device: Device,
    #[serde(default = "default_target")]
    pub target: Target,
}

fn default_target() -> Target {
    Target::User
}

impl SyncMessage {
    #[must_use]
    pub fn from_entry(entry: &Entry, origin_device: Device) -> Self {
        Self {
            id: entry.id,
            name: entry.name.clone(),
            timestamp: entry.timestamp,
            origin_device,
            target: entry.target,
        }
    }

    /// Parse an incoming payload. Anything missing a field, carrying an
    /// unparsable id or timestamp, or naming nothing is rejected.
    pub fn parse(raw: serde_json::Value) -> Result<Self> {
        let message: Self = serde_json::from_value(raw).context("malformed sync message")?;
        if message.name.trim().is_empty() {
            anyhow::bail!("sync message {} has an empty name", message.id);
        }
        Ok(message)
    }

    /// The entry as stored on `receiver`. The id is kept verbatim.
    #[must_use]
    pub fn into_received_entry(self, receiver: Device) -> Entry {
        Entry {
            id: self.id,
            name: self.name.trim().to_string(),
            timestamp: self.timestamp,
            target: self.target,
            origin: receiver.received_origin(),
        }
    }
}

/// The message channel to the paired device.
#[async_trait]
pub trait PeerTransport: Send + Sync {
    /// Quick probe; must not block for long.
    async fn is_reachable(&self) -> bool;

    async fn send(&self, message: &SyncMessage) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ForwardOutcome {
    Sent,
    /// The entry was not created on this device (or came from the peer).
    NotEligible,
    NoPeerConfigured,
    PeerUnreachable,
    TransportFailed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReceiveOutcome {
    Inserted,
    AlreadyExisted,
    Malformed,
    /// The local insert failed; the message is gone.
    Dropped,
}

struct ForwardRequest {
    entry: Entry,
    reply: Option<oneshot::Sender<ForwardOutcome>>,
}

struct ReceiveRequest {
    raw: serde_json::Value,
    reply: Option<oneshot::Sender<ReceiveOutcome>>,
}

struct BridgeState {
    device: Device,
    store: Arc<EntryStore>,
    transport: Option<Arc<dyn PeerTransport>>,
    events: EventBus,
}

/// The bridge actor. Incoming messages go through one ordered queue, so two
/// copies of the same message can never race each other's existence check.
/// Forwards have their own queue, polled alongside it, so a send that waits
/// on the peer never holds up what the peer is sending us.
pub struct SyncBridge {
    state: BridgeState,
    forwards: mpsc::UnboundedReceiver<ForwardRequest>,
    receives: mpsc::UnboundedReceiver<ReceiveRequest>,
}

impl SyncBridge {
    pub fn new(
        device: Device,
        store: Arc<EntryStore>,
        transport: Option<Arc<dyn PeerTransport>>,
        events: EventBus,
    ) -> (Self, SyncBridgeHandle) {
        let (forward_tx, forwards) = mpsc::unbounded_channel();
        let (receive_tx, receives) = mpsc::unbounded_channel();
        let bridge = Self {
            state: BridgeState {
                device,
                store,
                transport,
                events,
            },
            forwards,
            receives,
        };
        let handle = SyncBridgeHandle {
            device,
            forwards: forward_tx,
            receives: receive_tx,
        };
        (bridge, handle)
    }

    /// Create the bridge and run it on the current tokio runtime. The task
    /// ends once every handle has been dropped and both queues are drained.
    pub fn spawn(
        device: Device,
        store: Arc<EntryStore>,
        transport: Option<Arc<dyn PeerTransport>>,
        events: EventBus,
    ) -> (SyncBridgeHandle, JoinHandle<()>) {
        let (bridge, handle) = Self::new(device, store, transport, events);
        (handle, tokio::spawn(bridge.run()))
    }

    pub async fn run(self) {
        let Self {
            state,
            mut forwards,
            mut receives,
        } = self;
        tracing::info!(device = %state.device, "sync bridge started");

        let sending = async {
            while let Some(ForwardRequest { entry, reply }) = forwards.recv().await {
                let outcome = state.forward(&entry).await;
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
        };
        let receiving = async {
            while let Some(ReceiveRequest { raw, reply }) = receives.recv().await {
                let outcome = state.receive(raw);
                if let Some(reply) = reply {
                    let _ = reply.send(outcome);
                }
            }
        };
        tokio::join!(sending, receiving);

        tracing::info!(device = %state.device, "sync bridge stopped");
    }
}

impl BridgeState {
    async fn forward(&self, entry: &Entry) -> ForwardOutcome {
        if !entry.origin.is_local_to(self.device) {
            tracing::debug!(
                id = %entry.id,
                origin = %entry.origin,
                "not forwarding: entry was not created here"
            );
            return ForwardOutcome::NotEligible;
        }
        let Some(transport) = &self.transport else {
            return ForwardOutcome::NoPeerConfigured;
        };
        if !transport.is_reachable().await {
            tracing::info!(
                id = %entry.id,
                peer = %self.device.peer(),
                "peer unreachable, skipping forward"
            );
            return ForwardOutcome::PeerUnreachable;
        }
        let message = SyncMessage::from_entry(entry, self.device);
        match transport.send(&message).await {
            Ok(()) => {
                tracing::debug!(id = %entry.id, peer = %self.device.peer(), "entry forwarded");
                ForwardOutcome::Sent
            }
            Err(err) => {
                tracing::warn!(id = %entry.id, "forward to peer failed: {err:#}");
                ForwardOutcome::TransportFailed
            }
        }
    }

    fn receive(&self, raw: serde_json::Value) -> ReceiveOutcome {
        let message = match SyncMessage::parse(raw) {
            Ok(message) => message,
            Err(err) => {
                tracing::debug!("dropping sync message: {err:#}");
                return ReceiveOutcome::Malformed;
            }
        };
        let entry = message.into_received_entry(self.device);
        match self.store.insert(&entry) {
            Ok(InsertOutcome::Created) => {
                tracing::debug!(id = %entry.id, "stored entry from peer");
                self.events.publish(ChangeEvent::EntryCreated(entry));
                ReceiveOutcome::Inserted
            }
            Ok(InsertOutcome::AlreadyExisted) => ReceiveOutcome::AlreadyExisted,
            Err(err) => {
                tracing::warn!(id = %entry.id, "dropping entry from peer: {err}");
                ReceiveOutcome::Dropped
            }
        }
    }
}

#[derive(Clone)]
pub struct SyncBridgeHandle {
    device: Device,
    forwards: mpsc::UnboundedSender<ForwardRequest>,
    receives: mpsc::UnboundedSender<ReceiveRequest>,
}

impl SyncBridgeHandle {
    #[must_use]
    pub fn device(&self) -> Device {
        self.device
    }

    /// Forward and wait for the decision.
    pub async fn forward(&self, entry: Entry) -> Result<ForwardOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.forwards
            .send(ForwardRequest {
                entry,
                reply: Some(reply),
            })
            .map_err(|_| anyhow::anyhow!("sync bridge stopped"))?;
        outcome.await.context("sync bridge stopped")
    }

    /// Queue a forward without waiting.
    pub fn forward_detached(&self, entry: Entry) {
        let id = entry.id;
        if self
            .forwards
            .send(ForwardRequest { entry, reply: None })
            .is_err()
        {
            tracing::warn!(%id, "sync bridge stopped, forward skipped");
        }
    }

    /// Hand an incoming payload to the receive queue and wait for the result.
    pub async fn receive(&self, raw: serde_json::Value) -> Result<ReceiveOutcome> {
        let (reply, outcome) = oneshot::channel();
        self.receives
            .send(ReceiveRequest {
                raw,
                reply: Some(reply),
            })
            .map_err(|_| anyhow::anyhow!("sync bridge stopped"))?;
        outcome.await.context("sync bridge stopped")
    }

    pub fn receive_detached(&self, raw: serde_json::Value) {
        if self
            .receives
            .send(ReceiveRequest { raw, reply: None })
            .is_err()
        {
            tracing::warn!("sync bridge stopped, incoming message dropped");
        }
    }
}
