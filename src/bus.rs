// ABOUTME: Publish/subscribe backbone between gateways and the orchestrator.
// ABOUTME: Two broadcast streams plus the persisted channel-to-session binding table.

use crate::store::SessionStore;
use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::{broadcast, RwLock};

/// A message entering the bus from any gateway, web connection, or API caller.
#[derive(Debug, Clone)]
pub struct BusMessage {
    /// Unique id, used for exactly-once handling at the orchestrator.
    pub id: String,
    pub source: MessageSource,
    pub session_target: SessionTarget,
    /// Human-readable sender identity.
    pub sender: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl BusMessage {
    /// Construct with a fresh id and the current time.
    pub fn new(
        source: MessageSource,
        session_target: SessionTarget,
        sender: impl Into<String>,
        body: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            source,
            session_target,
            sender: sender.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Where a message came from.
#[derive(Debug, Clone)]
pub enum MessageSource {
    /// A chat platform gateway.
    Platform {
        platform_id: String,
        channel_id: String,
    },
    /// The web chat UI.
    Web { connection_id: String },
    /// Webhook/scheduler callers that already know their target.
    Api { token_hint: String },
}

impl MessageSource {
    /// The `(platform, channel)` pair, when this source is a platform channel.
    pub fn channel_key(&self) -> Option<(&str, &str)> {
        match self {
            Self::Platform {
                platform_id,
                channel_id,
            } => Some((platform_id, channel_id)),
            _ => None,
        }
    }
}

/// Where a message routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTarget {
    /// Unbound channel: handled by the DISPATCH command grammar.
    Dispatch,
    /// Bound channel: forwarded to the named agent session.
    Session { name: String },
}

/// A response leaving the bus toward every subscribed gateway.
#[derive(Debug, Clone)]
pub struct BusResponse {
    /// Producing session; empty for control-plane replies.
    pub session_name: String,
    pub content: ResponseContent,
    pub timestamp: DateTime<Utc>,
}

impl BusResponse {
    pub fn chunk(session: impl Into<String>, text: impl Into<String>) -> Self {
        Self::build(session, ResponseContent::Chunk(text.into()))
    }

    pub fn complete(session: impl Into<String>, text: impl Into<String>) -> Self {
        Self::build(session, ResponseContent::Complete(text.into()))
    }

    pub fn error(session: impl Into<String>, text: impl Into<String>) -> Self {
        Self::build(session, ResponseContent::Error(text.into()))
    }

    /// Control-plane reply; carries no session name.
    pub fn notice(text: impl Into<String>) -> Self {
        Self::build("", ResponseContent::SystemNotice(text.into()))
    }

    /// Session-scoped notice (orphan recovery, resets).
    pub fn session_notice(session: impl Into<String>, text: impl Into<String>) -> Self {
        Self::build(session, ResponseContent::SystemNotice(text.into()))
    }

    fn build(session: impl Into<String>, content: ResponseContent) -> Self {
        Self {
            session_name: session.into(),
            content,
            timestamp: Utc::now(),
        }
    }
}

/// Outbound payload variants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseContent {
    /// Streaming partial output.
    Chunk(String),
    /// Final assembled response.
    Complete(String),
    /// Agent or routing failure.
    Error(String),
    /// Control-plane or lifecycle notification.
    SystemNotice(String),
}

/// A persisted channel-to-session binding row.
#[derive(Debug, Clone)]
pub struct ChannelBinding {
    pub platform_id: String,
    pub channel_id: String,
    pub session_name: String,
    pub bound_at: DateTime<Utc>,
}

/// Fan-out message bus.
///
/// Inbound and outbound are independent bounded broadcast streams;
/// publishing never blocks, and a subscriber that falls behind observes a
/// `Lagged` error it must treat as "messages were missed". The binding
/// table serves many concurrent resolves against rare writes, and every
/// write goes through to the store before the call returns.
pub struct MessageBus {
    inbound_tx: broadcast::Sender<BusMessage>,
    outbound_tx: broadcast::Sender<BusResponse>,
    bindings: RwLock<HashMap<(String, String), String>>,
    store: Option<SessionStore>,
}

impl MessageBus {
    /// In-memory bus with no binding persistence (tests, ephemeral runs).
    pub fn new(capacity: usize) -> Self {
        let (inbound_tx, _) = broadcast::channel(capacity);
        let (outbound_tx, _) = broadcast::channel(capacity);
        Self {
            inbound_tx,
            outbound_tx,
            bindings: RwLock::new(HashMap::new()),
            store: None,
        }
    }

    /// Bus with bindings preloaded from `store` and written through on
    /// every bind/unbind, so routing survives restarts.
    pub fn with_store(capacity: usize, store: SessionStore) -> Result<Self> {
        let mut map = HashMap::new();
        for binding in store.load_bindings()? {
            map.insert(
                (binding.platform_id, binding.channel_id),
                binding.session_name,
            );
        }
        tracing::info!(bindings = map.len(), "loaded channel bindings");

        let (inbound_tx, _) = broadcast::channel(capacity);
        let (outbound_tx, _) = broadcast::channel(capacity);
        Ok(Self {
            inbound_tx,
            outbound_tx,
            bindings: RwLock::new(map),
            store: Some(store),
        })
    }

    pub fn publish_inbound(&self, msg: BusMessage) {
        if self.inbound_tx.send(msg).is_err() {
            tracing::debug!("inbound publish with no subscribers");
        }
    }

    pub fn subscribe_inbound(&self) -> broadcast::Receiver<BusMessage> {
        self.inbound_tx.subscribe()
    }

    pub fn publish_response(&self, resp: BusResponse) {
        if self.outbound_tx.send(resp).is_err() {
            tracing::debug!("response publish with no subscribers");
        }
    }

    pub fn subscribe_responses(&self) -> broadcast::Receiver<BusResponse> {
        self.outbound_tx.subscribe()
    }

    /// Bind a platform channel to a session. A channel holds at most one
    /// binding; rebinding replaces it.
    pub async fn bind_channel(
        &self,
        platform_id: &str,
        channel_id: &str,
        session_name: &str,
    ) -> Result<()> {
        {
            let mut map = self.bindings.write().await;
            map.insert(
                (platform_id.to_string(), channel_id.to_string()),
                session_name.to_string(),
            );
        }
        if let Some(store) = &self.store {
            store.bind_channel(platform_id, channel_id, session_name)?;
        }
        tracing::info!(
            platform = platform_id,
            channel = channel_id,
            session = session_name,
            "channel bound"
        );
        Ok(())
    }

    /// Remove a channel's binding. Returns false when nothing was bound.
    pub async fn unbind_channel(&self, platform_id: &str, channel_id: &str) -> Result<bool> {
        let removed = {
            let mut map = self.bindings.write().await;
            map.remove(&(platform_id.to_string(), channel_id.to_string()))
                .is_some()
        };
        if let Some(store) = &self.store {
            store.unbind_channel(platform_id, channel_id)?;
        }
        if removed {
            tracing::info!(platform = platform_id, channel = channel_id, "channel unbound");
        }
        Ok(removed)
    }

    /// Drop every binding pointing at `session_name` (session deletion).
    pub async fn unbind_session(&self, session_name: &str) -> Result<usize> {
        let removed = {
            let mut map = self.bindings.write().await;
            let before = map.len();
            map.retain(|_, bound| bound != session_name);
            before - map.len()
        };
        if let Some(store) = &self.store {
            store.unbind_session(session_name)?;
        }
        Ok(removed)
    }

    /// Resolve an inbound channel to its routing target. Unbound channels
    /// route to DISPATCH; that is the default, not an error.
    pub async fn resolve_target(&self, platform_id: &str, channel_id: &str) -> SessionTarget {
        let map = self.bindings.read().await;
        match map.get(&(platform_id.to_string(), channel_id.to_string())) {
            Some(name) => SessionTarget::Session { name: name.clone() },
            None => SessionTarget::Dispatch,
        }
    }

    /// Every channel currently bound to `session_name` (fan-out set).
    pub async fn bindings_for_session(&self, session_name: &str) -> Vec<(String, String)> {
        let map = self.bindings.read().await;
        map.iter()
            .filter(|(_, bound)| bound.as_str() == session_name)
            .map(|((p, c), _)| (p.clone(), c.clone()))
            .collect()
    }
}
