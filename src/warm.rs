// ABOUTME: Warm session pool keeping agent backends alive across requests.
// ABOUTME: Keyed by logical session name; TTL eviction, invalidation, resume fallback.

use anyhow::Result;
use crossbar_agent::{AgentHandle, AgentRegistry};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Pool behavior knobs.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Registry name of the backend to instantiate ("mock", "cli", "acp").
    pub backend_type: String,
    /// Idle time after which `cleanup_stale` removes an entry.
    pub keep_alive: Duration,
    /// Backend config template; the session's working directory is
    /// injected into it per instantiation.
    pub backend_settings: serde_json::Value,
}

/// How `get_or_create` satisfied the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    /// Warm pool hit.
    Reused,
    /// Fresh backend, fresh session.
    Created,
    /// Fresh backend resuming the stored session id.
    Resumed,
    /// Resume failed (orphaned id); fell back to a fresh session. The
    /// caller should tell the user their context was lost.
    Recovered,
}

struct WarmSession {
    handle: AgentHandle,
    session_id: String,
    last_used: Instant,
    invalidated: bool,
    in_flight: Arc<AtomicUsize>,
}

impl WarmSession {
    fn lease(&self, outcome: SessionOutcome) -> SessionLease {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        SessionLease {
            handle: self.handle.clone(),
            session_id: self.session_id.clone(),
            outcome,
            in_flight: Arc::clone(&self.in_flight),
        }
    }
}

/// A checked-out warm session.
///
/// Holding a lease marks the entry as mid-use so the stale sweep skips
/// it; the handle keeps working even if the entry is invalidated or
/// evicted underneath, since eviction only stops new checkouts.
pub struct SessionLease {
    handle: AgentHandle,
    session_id: String,
    outcome: SessionOutcome,
    in_flight: Arc<AtomicUsize>,
}

impl SessionLease {
    pub fn handle(&self) -> &AgentHandle {
        &self.handle
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn outcome(&self) -> SessionOutcome {
        self.outcome
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Keyed pool of live agent backends.
///
/// The map lock is never held across a backend await: creation happens
/// unlocked and is inserted with a double-check, the loser of a
/// same-name race dropping its handle (which tears down that worker).
pub struct WarmSessionManager {
    sessions: RwLock<HashMap<String, WarmSession>>,
    registry: AgentRegistry,
    config: PoolConfig,
}

impl WarmSessionManager {
    pub fn new(config: PoolConfig, registry: AgentRegistry) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            registry,
            config,
        }
    }

    pub fn keep_alive(&self) -> Duration {
        self.config.keep_alive
    }

    /// Checkout the warm session for `name`, creating it if needed.
    ///
    /// `resume` is the stored backend session id, if any; when resuming
    /// fails the pool falls back to a fresh session and tags the lease
    /// [`SessionOutcome::Recovered`]. Pre-warming is this same call made
    /// ahead of need; there is no separate path.
    pub async fn get_or_create(
        &self,
        name: &str,
        workspace: &str,
        resume: Option<&str>,
    ) -> Result<SessionLease> {
        {
            let mut map = self.sessions.write().await;
            if let Some(entry) = map.get_mut(name) {
                if !entry.invalidated {
                    entry.last_used = Instant::now();
                    return Ok(entry.lease(SessionOutcome::Reused));
                }
            }
        }

        let handle = self
            .registry
            .create(&self.config.backend_type, &self.settings_for(workspace))?;
        crate::metrics::record_session_created(&self.config.backend_type);

        let (session_id, outcome) = match resume {
            Some(id) => match handle.load_session(id).await {
                Ok(()) => (id.to_string(), SessionOutcome::Resumed),
                Err(e) => {
                    tracing::warn!(
                        session = name,
                        resume_id = id,
                        error = %e,
                        "resume failed, creating fresh session"
                    );
                    (handle.new_session().await?, SessionOutcome::Recovered)
                }
            },
            None => (handle.new_session().await?, SessionOutcome::Created),
        };

        let mut map = self.sessions.write().await;
        if let Some(existing) = map.get_mut(name) {
            if !existing.invalidated {
                // Lost a same-name creation race; the first insert wins
                // and our handle tears its worker down on drop.
                existing.last_used = Instant::now();
                return Ok(existing.lease(SessionOutcome::Reused));
            }
        }

        let entry = WarmSession {
            handle,
            session_id,
            last_used: Instant::now(),
            invalidated: false,
            in_flight: Arc::new(AtomicUsize::new(0)),
        };
        let lease = entry.lease(outcome);
        map.insert(name.to_string(), entry);

        tracing::info!(session = name, outcome = ?outcome, "warm session ready");
        Ok(lease)
    }

    /// Record a backend-reported session id change for a warm entry.
    pub async fn set_session_id(&self, name: &str, session_id: &str) {
        let mut map = self.sessions.write().await;
        if let Some(entry) = map.get_mut(name) {
            entry.session_id = session_id.to_string();
        }
    }

    /// Mark an entry invalid and drop it from the pool. Existing leases
    /// keep their handles; new checkouts rebuild from scratch.
    pub async fn invalidate(&self, name: &str) {
        let mut map = self.sessions.write().await;
        if let Some(mut entry) = map.remove(name) {
            entry.invalidated = true;
            tracing::info!(session = name, "warm session invalidated");
        }
    }

    /// Unconditional removal. Returns false when nothing was pooled.
    pub async fn evict(&self, name: &str) -> bool {
        let mut map = self.sessions.write().await;
        let removed = map.remove(name).is_some();
        if removed {
            tracing::info!(session = name, "warm session evicted");
        }
        removed
    }

    /// Drop every entry idle past the keep-alive, skipping entries that
    /// are currently mid-use. The in-flight check is best-effort; an
    /// entry leased between the check and the removal simply keeps its
    /// working handle.
    pub async fn cleanup_stale(&self) -> usize {
        let keep_alive = self.config.keep_alive;
        let now = Instant::now();
        let mut map = self.sessions.write().await;
        let before = map.len();
        map.retain(|name, entry| {
            if entry.in_flight.load(Ordering::SeqCst) > 0 {
                return true;
            }
            let idle = now.duration_since(entry.last_used);
            if idle > keep_alive {
                tracing::info!(
                    session = %name,
                    idle_secs = idle.as_secs(),
                    "removing stale warm session"
                );
                false
            } else {
                true
            }
        });
        before - map.len()
    }

    pub async fn contains(&self, name: &str) -> bool {
        self.sessions.read().await.contains_key(name)
    }

    pub async fn warm_names(&self) -> Vec<String> {
        self.sessions.read().await.keys().cloned().collect()
    }

    /// Idle duration of a warm entry, if pooled.
    pub async fn idle_for(&self, name: &str) -> Option<Duration> {
        let map = self.sessions.read().await;
        map.get(name).map(|e| e.last_used.elapsed())
    }

    fn settings_for(&self, workspace: &str) -> serde_json::Value {
        let mut settings = self.config.backend_settings.clone();
        if !settings.is_object() {
            settings = serde_json::json!({});
        }
        settings["working_dir"] = serde_json::Value::String(workspace.to_string());
        settings
    }
}
