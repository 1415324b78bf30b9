// ABOUTME: Single consumer of the inbound bus: dedup, DISPATCH grammar, session routing.
// ABOUTME: Spawns one task per message so a stuck session never stalls the rest.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use crossbar_agent::{AgentEvent, ErrorCode};
use tokio::sync::Mutex;

use crate::bus::{BusMessage, BusResponse, MessageBus, SessionTarget};
use crate::metrics;
use crate::store::{SessionStore, DEFAULT_TRANSCRIPT_TAIL};
use crate::warm::{SessionOutcome, WarmSessionManager};

/// Control-plane commands reachable from unbound channels.
///
/// Anything not starting with the `!` marker, and any marker-prefixed
/// input that is unknown or missing required arguments, parses to
/// `Unknown` and earns a pointer at `!help`.
#[derive(Debug, PartialEq)]
pub enum DispatchCommand {
    Create {
        name: String,
        workspace: Option<String>,
    },
    Delete {
        name: String,
    },
    List,
    Status {
        name: String,
    },
    Join {
        name: String,
    },
    Leave,
    Tell {
        session: String,
        message: String,
    },
    Read {
        session: String,
        count: Option<usize>,
    },
    Broadcast {
        message: String,
    },
    Help,
    Unknown(String),
}

impl DispatchCommand {
    /// Parse a message body. The command word is case-insensitive.
    pub fn parse(input: &str) -> Self {
        let input = input.trim();
        let Some(rest) = input.strip_prefix('!') else {
            return Self::Unknown(input.to_string());
        };

        let (word, args) = match rest.split_once(char::is_whitespace) {
            Some((w, a)) => (w, a.trim()),
            None => (rest, ""),
        };
        let first_arg = args.split_whitespace().next().unwrap_or("");

        match word.to_lowercase().as_str() {
            "create" => {
                if first_arg.is_empty() {
                    return Self::Unknown(input.to_string());
                }
                let workspace = args[first_arg.len()..].trim();
                Self::Create {
                    name: first_arg.to_string(),
                    workspace: (!workspace.is_empty()).then(|| workspace.to_string()),
                }
            }
            "delete" if !first_arg.is_empty() => Self::Delete {
                name: first_arg.to_string(),
            },
            "list" => Self::List,
            "status" if !first_arg.is_empty() => Self::Status {
                name: first_arg.to_string(),
            },
            "join" if !first_arg.is_empty() => Self::Join {
                name: first_arg.to_string(),
            },
            "leave" => Self::Leave,
            "tell" => {
                let message = args[first_arg.len()..].trim();
                if first_arg.is_empty() || message.is_empty() {
                    return Self::Unknown(input.to_string());
                }
                Self::Tell {
                    session: first_arg.to_string(),
                    message: message.to_string(),
                }
            }
            "read" if !first_arg.is_empty() => {
                let count = args[first_arg.len()..]
                    .trim()
                    .split_whitespace()
                    .next()
                    .and_then(|s| s.parse::<usize>().ok());
                Self::Read {
                    session: first_arg.to_string(),
                    count,
                }
            }
            "broadcast" if !args.is_empty() => Self::Broadcast {
                message: args.to_string(),
            },
            "help" => Self::Help,
            _ => Self::Unknown(input.to_string()),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Delete { .. } => "delete",
            Self::List => "list",
            Self::Status { .. } => "status",
            Self::Join { .. } => "join",
            Self::Leave => "leave",
            Self::Tell { .. } => "tell",
            Self::Read { .. } => "read",
            Self::Broadcast { .. } => "broadcast",
            Self::Help => "help",
            Self::Unknown(_) => "unknown",
        }
    }
}

/// Dedup set size cap; past it the set is cleared wholesale. Ids are
/// time-local, so the false-negative window after a reset is negligible.
const DEDUP_CAP: usize = 10_000;

/// The bus's single inbound consumer.
#[derive(Clone)]
pub struct Orchestrator {
    bus: Arc<MessageBus>,
    store: SessionStore,
    pool: Arc<WarmSessionManager>,
    seen_ids: Arc<Mutex<HashSet<String>>>,
}

impl Orchestrator {
    pub fn new(bus: Arc<MessageBus>, store: SessionStore, pool: Arc<WarmSessionManager>) -> Self {
        Self {
            bus,
            store,
            pool,
            seen_ids: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Consume the inbound stream until the bus closes.
    pub async fn run(&self) {
        let mut rx = self.bus.subscribe_inbound();
        loop {
            match rx.recv().await {
                Ok(msg) => {
                    if !self.first_sighting(&msg.id).await {
                        tracing::debug!(msg_id = %msg.id, "dropping duplicate message");
                        metrics::record_duplicate_dropped();
                        continue;
                    }
                    let orch = self.clone();
                    tokio::spawn(async move {
                        orch.handle(msg).await;
                    });
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "orchestrator lagged behind inbound stream");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    tracing::info!("inbound stream closed, orchestrator stopping");
                    break;
                }
            }
        }
    }

    /// True exactly once per message id (modulo the cap-reset window).
    async fn first_sighting(&self, id: &str) -> bool {
        let mut seen = self.seen_ids.lock().await;
        if seen.contains(id) {
            return false;
        }
        if seen.len() >= DEDUP_CAP {
            seen.clear();
        }
        seen.insert(id.to_string());
        true
    }

    async fn handle(&self, msg: BusMessage) {
        match msg.session_target.clone() {
            SessionTarget::Dispatch => self.handle_dispatch(msg).await,
            SessionTarget::Session { name } => self.handle_session(name, msg).await,
        }
    }

    async fn handle_dispatch(&self, msg: BusMessage) {
        let cmd = DispatchCommand::parse(&msg.body);
        metrics::record_command(cmd.label());
        metrics::record_message_routed("dispatch");

        let text = match self.run_dispatch(cmd, &msg).await {
            Ok(text) => text,
            Err(e) => format!("Command failed: {e}"),
        };
        self.bus.publish_response(BusResponse::notice(text));
    }

    async fn run_dispatch(&self, cmd: DispatchCommand, msg: &BusMessage) -> Result<String> {
        match cmd {
            DispatchCommand::Create { name, workspace } => {
                let workspace = workspace.unwrap_or_else(|| {
                    self.store.default_workspace(&name).to_string_lossy().into_owned()
                });
                match self.store.create_session(&name, &workspace, None) {
                    Ok(_) => Ok(format!(
                        "Session '{name}' created (workspace: {workspace}). Bind a channel with !join {name}."
                    )),
                    Err(e) => Ok(format!("Could not create session '{name}': {e}")),
                }
            }

            DispatchCommand::Delete { name } => {
                self.pool.evict(&name).await;
                self.bus.unbind_session(&name).await?;
                if self.store.delete_session(&name)? {
                    Ok(format!("Session '{name}' deleted."))
                } else {
                    Ok(format!("No session named '{name}'."))
                }
            }

            DispatchCommand::List => {
                let sessions = self.store.list_sessions()?;
                if sessions.is_empty() {
                    return Ok("No sessions. Create one with !create <name>.".to_string());
                }
                let mut lines = vec!["Sessions:".to_string()];
                for record in sessions {
                    let warm = if self.pool.contains(&record.name).await {
                        " [warm]"
                    } else {
                        ""
                    };
                    lines.push(format!("  {}{} — {}", record.name, warm, record.workspace));
                }
                Ok(lines.join("\n"))
            }

            DispatchCommand::Status { name } => {
                let Some(record) = self.store.get_session(&name)? else {
                    return Ok(format!("No session named '{name}'."));
                };
                let warm = match self.pool.idle_for(&name).await {
                    Some(idle) => format!("warm (idle {}s)", idle.as_secs()),
                    None => "cold".to_string(),
                };
                let bindings = self.bus.bindings_for_session(&name).await;
                let bound = if bindings.is_empty() {
                    "none".to_string()
                } else {
                    bindings
                        .iter()
                        .map(|(p, c)| format!("{p}:{c}"))
                        .collect::<Vec<_>>()
                        .join(", ")
                };
                Ok(format!(
                    "Session '{name}'\n  state: {warm}\n  backend id: {}\n  workspace: {}\n  channels: {bound}",
                    record.session_id.as_deref().unwrap_or("(none yet)"),
                    record.workspace,
                ))
            }

            DispatchCommand::Join { name } => match msg.source.channel_key() {
                Some((platform, channel)) => {
                    if self.store.get_session(&name)?.is_none() {
                        return Ok(format!(
                            "No session named '{name}'. Create it first with !create {name}."
                        ));
                    }
                    self.bus.bind_channel(platform, channel, &name).await?;
                    Ok(format!("This channel now talks to session '{name}'."))
                }
                None => Ok("!join only works from a platform channel.".to_string()),
            },

            DispatchCommand::Leave => match msg.source.channel_key() {
                Some((platform, channel)) => {
                    if self.bus.unbind_channel(platform, channel).await? {
                        Ok("Channel unbound; messages here go to DISPATCH again.".to_string())
                    } else {
                        Ok("This channel is not bound to any session.".to_string())
                    }
                }
                None => Ok("!leave only works from a platform channel.".to_string()),
            },

            DispatchCommand::Tell { session, message } => {
                // Re-enters the pipeline as a fresh inbound message rather
                // than special-casing delivery.
                let forwarded = BusMessage::new(
                    msg.source.clone(),
                    SessionTarget::Session {
                        name: session.clone(),
                    },
                    msg.sender.clone(),
                    message,
                );
                self.bus.publish_inbound(forwarded);
                Ok(format!("Forwarded to session '{session}'."))
            }

            DispatchCommand::Read { session, count } => {
                let entries = self
                    .store
                    .tail_transcript(&session, count.unwrap_or(DEFAULT_TRANSCRIPT_TAIL))?;
                if entries.is_empty() {
                    return Ok(format!("No transcript for '{session}'."));
                }
                let mut lines = vec![format!("Last {} message(s) in '{session}':", entries.len())];
                for entry in entries {
                    lines.push(format!("  [{}] {}: {}", entry.created_at, entry.sender, entry.body));
                }
                Ok(lines.join("\n"))
            }

            DispatchCommand::Broadcast { message } => {
                let sessions = self.store.list_sessions()?;
                if sessions.is_empty() {
                    return Ok("No sessions to broadcast to.".to_string());
                }
                let count = sessions.len();
                for record in sessions {
                    let forwarded = BusMessage::new(
                        msg.source.clone(),
                        SessionTarget::Session { name: record.name },
                        msg.sender.clone(),
                        message.clone(),
                    );
                    self.bus.publish_inbound(forwarded);
                }
                Ok(format!("Broadcast to {count} session(s)."))
            }

            DispatchCommand::Help => Ok(help_text()),

            DispatchCommand::Unknown(text) => Ok(format!(
                "Unrecognized input: \"{text}\". Type !help for available commands."
            )),
        }
    }

    /// Route a message to its agent session, streaming responses out as
    /// the backend produces them.
    async fn handle_session(&self, name: String, msg: BusMessage) {
        metrics::record_message_routed("session");
        let started = Instant::now();

        if let Err(e) = self.store.append_transcript(&name, &msg.sender, &msg.body) {
            tracing::warn!(session = %name, error = %e, "transcript append failed");
        }

        let record = match self.store.get_or_create_session(&name) {
            Ok((record, created)) => {
                if created {
                    tracing::info!(session = %name, "materialized session on first use");
                }
                record
            }
            Err(e) => {
                self.bus.publish_response(BusResponse::error(
                    &name,
                    format!("failed to register session: {e}"),
                ));
                return;
            }
        };

        let lease = match self
            .pool
            .get_or_create(&name, &record.workspace, record.session_id.as_deref())
            .await
        {
            Ok(lease) => lease,
            Err(e) => {
                tracing::error!(session = %name, error = %e, "warm session unavailable");
                self.bus.publish_response(BusResponse::error(
                    &name,
                    format!("failed to prepare session: {e}"),
                ));
                return;
            }
        };

        match lease.outcome() {
            SessionOutcome::Recovered => {
                self.bus.publish_response(BusResponse::session_notice(
                    &name,
                    "Previous conversation could not be resumed; starting fresh.",
                ));
                self.record_session_id(&name, lease.session_id());
            }
            SessionOutcome::Created => {
                self.record_session_id(&name, lease.session_id());
            }
            SessionOutcome::Reused | SessionOutcome::Resumed => {}
        }

        let mut events = match lease.handle().prompt(lease.session_id(), &msg.body).await {
            Ok(events) => events,
            Err(e) => {
                // The worker is gone; drop the dead entry so the next
                // message rebuilds it.
                self.pool.evict(&name).await;
                self.bus.publish_response(BusResponse::error(
                    &name,
                    format!("failed to reach agent: {e}"),
                ));
                return;
            }
        };

        let mut terminal_seen = false;
        while let Some(event) = events.recv().await {
            match event {
                AgentEvent::Text(text) => {
                    self.bus.publish_response(BusResponse::chunk(&name, text));
                }

                AgentEvent::ToolEnd {
                    name: tool,
                    success,
                    ..
                } => {
                    let mark = if success { "done" } else { "failed" };
                    self.bus
                        .publish_response(BusResponse::chunk(&name, format!("[tool] {tool} {mark}")));
                }

                AgentEvent::ToolStart { name: tool, .. } => {
                    tracing::debug!(session = %name, tool = %tool, "tool started");
                }

                AgentEvent::ToolProgress { .. } | AgentEvent::Custom { .. } => {}

                AgentEvent::SessionChanged { new_session_id } => {
                    tracing::info!(session = %name, new_id = %new_session_id, "backend switched session id");
                    self.record_session_id(&name, &new_session_id);
                    self.pool.set_session_id(&name, &new_session_id).await;
                }

                AgentEvent::Result { text, usage, .. } => {
                    if let Some(usage) = &usage {
                        metrics::record_tokens(usage.input_tokens, usage.output_tokens);
                    }
                    if let Err(e) = self.store.append_transcript(&name, "agent", &text) {
                        tracing::warn!(session = %name, error = %e, "transcript append failed");
                    }
                    self.bus.publish_response(BusResponse::complete(&name, text));
                    terminal_seen = true;
                    break;
                }

                AgentEvent::Error {
                    code,
                    message,
                    recoverable,
                } => {
                    tracing::error!(
                        session = %name,
                        code = %code,
                        recoverable,
                        "agent error: {message}"
                    );
                    metrics::record_agent_error(code.as_str());
                    if code == ErrorCode::SessionOrphaned {
                        self.reset_session(&name, "conversation context was lost").await;
                    } else {
                        self.bus.publish_response(BusResponse::error(
                            &name,
                            format!("agent error [{code}]: {message}"),
                        ));
                    }
                    terminal_seen = true;
                    break;
                }

                AgentEvent::SessionInvalid { reason } => {
                    tracing::warn!(session = %name, reason = %reason, "session invalid");
                    self.reset_session(&name, &reason).await;
                    terminal_seen = true;
                    break;
                }
            }
        }

        if !terminal_seen {
            // Stream ended without Result/Error: the backend died
            // mid-prompt. Evict so the next message gets a new worker.
            tracing::error!(session = %name, "event stream ended without a terminal event");
            metrics::record_agent_error("stream_truncated");
            self.pool.evict(&name).await;
            self.bus.publish_response(BusResponse::error(
                &name,
                "agent stopped responding; the session was reset",
            ));
        }

        metrics::record_prompt_duration(started.elapsed().as_secs_f64());
    }

    /// Invalidate a session whose backend id went stale and tell the user.
    async fn reset_session(&self, name: &str, reason: &str) {
        self.pool.invalidate(name).await;
        if let Err(e) = self.store.clear_session_id(name) {
            tracing::error!(session = %name, error = %e, "failed to clear stored session id");
        }
        self.bus.publish_response(BusResponse::session_notice(
            name,
            format!("Session was reset ({reason}). Please send your message again."),
        ));
    }

    fn record_session_id(&self, name: &str, session_id: &str) {
        if let Err(e) = self.store.update_session_id(name, session_id) {
            tracing::error!(session = %name, error = %e, "failed to store session id");
        }
    }
}

fn help_text() -> String {
    "DISPATCH commands:\n\
     \n\
     !create <name> [workspace]  — register a new agent session\n\
     !delete <name>              — remove a session, its bindings and transcript\n\
     !list                       — list registered sessions\n\
     !status <name>              — show one session's state\n\
     !join <name>                — bind this channel to a session\n\
     !leave                      — unbind this channel\n\
     !tell <session> <text>      — inject a message into another session\n\
     !read <session> [count]     — show a session's recent transcript\n\
     !broadcast <text>           — send a message to every session\n\
     !help                       — this text"
        .to_string()
}
