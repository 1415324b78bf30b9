// ABOUTME: Binary entry point: wires store, bus, warm pool and orchestrator.
// ABOUTME: Gateways attach to the bus; none are started by the core itself.

use anyhow::Result;
use crossbar::bus::MessageBus;
use crossbar::config::Config;
use crossbar::orchestrator::Orchestrator;
use crossbar::store::SessionStore;
use crossbar::warm::{PoolConfig, WarmSessionManager};
use crossbar::AgentRegistry;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    dotenvy::dotenv().ok();
    let config = Config::load()?;
    tracing::info!(
        backend = %config.agent.backend,
        workspace = %config.workspace.root,
        keep_alive_secs = config.pool.keep_alive_secs,
        "starting crossbar"
    );

    let store = SessionStore::new(&config.workspace.root)?;
    let bus = Arc::new(MessageBus::with_store(config.bus.capacity, store.clone())?);

    let pool = Arc::new(WarmSessionManager::new(
        PoolConfig {
            backend_type: config.agent.backend.clone(),
            keep_alive: config.keep_alive(),
            backend_settings: config.backend_settings(),
        },
        AgentRegistry::default(),
    ));

    // Periodic stale-session sweep.
    {
        let pool = Arc::clone(&pool);
        let interval = config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let removed = pool.cleanup_stale().await;
                if removed > 0 {
                    tracing::info!(removed, "stale warm sessions swept");
                }
            }
        });
    }

    // Pre-warm configured sessions so their start-up cost is paid now,
    // not on the first real message.
    for name in &config.pool.pre_warm {
        match store.get_or_create_session(name) {
            Ok((record, _)) => {
                if let Err(e) = pool
                    .get_or_create(name, &record.workspace, record.session_id.as_deref())
                    .await
                {
                    tracing::warn!(session = %name, error = %e, "pre-warm failed");
                }
            }
            Err(e) => {
                tracing::warn!(session = %name, error = %e, "pre-warm lookup failed");
            }
        }
    }

    let orchestrator = Orchestrator::new(Arc::clone(&bus), store, Arc::clone(&pool));

    tracing::info!("crossbar ready; gateways may attach to the bus");
    tokio::select! {
        _ = orchestrator.run() => {
            tracing::warn!("orchestrator loop ended");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown signal received");
        }
    }

    Ok(())
}
