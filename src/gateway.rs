// ABOUTME: The gateway adapter contract; platform implementations live elsewhere.
// ABOUTME: Adapters translate native events to BusMessages and filter BusResponses.

use crate::bus::MessageBus;
use anyhow::Result;
use std::sync::Arc;

/// Contract every chat-platform adapter satisfies.
///
/// An adapter (a) turns each native inbound event into a `BusMessage`,
/// resolving its target with `MessageBus::resolve_target`, and publishes
/// it; (b) subscribes to the outbound stream and renders every
/// `BusResponse` whose session is bound to one of its channels; (c)
/// starts and stops with the process lifecycle. Scheduler and webhook
/// callers are degenerate gateways: they publish `MessageSource::Api`
/// messages with a known `SessionTarget::Session` and skip resolution.
#[async_trait::async_trait]
pub trait Gateway: Send + Sync {
    /// Stable platform identifier used in bindings ("matrix", "slack").
    fn platform_id(&self) -> &str;

    /// Connect and begin translating events in both directions.
    async fn start(&self, bus: Arc<MessageBus>) -> Result<()>;

    /// Disconnect and stop publishing.
    async fn stop(&self) -> Result<()>;
}

/// Holds the configured adapters and drives their shared lifecycle.
#[derive(Default)]
pub struct GatewayRegistry {
    gateways: Vec<Arc<dyn Gateway>>,
}

impl GatewayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, gateway: Arc<dyn Gateway>) {
        self.gateways.push(gateway);
    }

    pub fn is_empty(&self) -> bool {
        self.gateways.is_empty()
    }

    /// Start every adapter; a failure stops none of the others.
    pub async fn start_all(&self, bus: Arc<MessageBus>) {
        for gateway in &self.gateways {
            match gateway.start(Arc::clone(&bus)).await {
                Ok(()) => {
                    tracing::info!(platform = gateway.platform_id(), "gateway started");
                }
                Err(e) => {
                    tracing::error!(platform = gateway.platform_id(), error = %e, "gateway failed to start");
                }
            }
        }
    }

    pub async fn stop_all(&self) {
        for gateway in &self.gateways {
            if let Err(e) = gateway.stop().await {
                tracing::warn!(platform = gateway.platform_id(), error = %e, "gateway failed to stop");
            }
        }
    }
}
