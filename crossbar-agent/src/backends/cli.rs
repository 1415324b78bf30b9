// ABOUTME: One-shot CLI backend - spawns the agent CLI per prompt and parses
// ABOUTME: its stream-json output lines into AgentEvents.

use crate::backend::AgentBackend;
use crate::event::{AgentEvent, ErrorCode, Usage};
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command as ProcessCommand;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

/// Marker the CLI prints on stderr when asked to resume an unknown session.
const ORPHAN_STDERR_MARKER: &str = "No conversation found with session ID";

/// Configuration for the one-shot CLI backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CliConfig {
    /// Path to the agent CLI binary.
    pub binary: String,
    /// Working directory the CLI runs in.
    pub working_dir: PathBuf,
    /// Per-prompt wall-clock bound; exceeding it yields `ErrorCode::Timeout`.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra arguments appended to every invocation.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    300
}

/// Backend that spawns the CLI once per prompt.
///
/// Sessions created here but never prompted are "fresh": the first prompt
/// passes `--session-id` so the CLI creates the conversation under our id,
/// and every later prompt passes `--resume`. Resumed ids the CLI no longer
/// knows surface as a `SessionInvalid` event from the stderr watcher;
/// `load_session` itself is optimistic since the CLI offers no cheap check.
pub struct CliBackend {
    config: CliConfig,
    fresh: Mutex<HashSet<String>>,
}

impl CliBackend {
    pub fn new(config: CliConfig) -> Result<Self> {
        if config.binary.is_empty() {
            anyhow::bail!("cli backend requires a binary path");
        }
        Ok(Self {
            config,
            fresh: Mutex::new(HashSet::new()),
        })
    }

    /// Wrap this backend in a worker task and return its handle.
    pub fn into_handle(self) -> crate::handle::AgentHandle {
        crate::handle::spawn_backend(self)
    }

    /// Factory for [`crate::registry::AgentRegistry`].
    pub fn factory() -> crate::registry::BackendFactory {
        Box::new(|config| {
            let cfg: CliConfig = serde_json::from_value(config.clone())?;
            Ok(CliBackend::new(cfg)?.into_handle())
        })
    }
}

impl AgentBackend for CliBackend {
    fn name(&self) -> &'static str {
        "cli"
    }

    fn new_session<'a>(&'a self) -> BoxFuture<'a, Result<String>> {
        async move {
            let id = uuid::Uuid::new_v4().to_string();
            self.fresh
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .insert(id.clone());
            Ok(id)
        }
        .boxed()
    }

    fn load_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            // A loaded id is by definition not fresh; the next prompt resumes it.
            self.fresh
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(session_id);
            Ok(())
        }
        .boxed()
    }

    fn prompt<'a>(
        &'a self,
        session_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'a, AgentEvent>>> {
        async move {
            let is_fresh = self
                .fresh
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(session_id);

            let mut args = vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "stream-json".to_string(),
                "--verbose".to_string(),
            ];
            if is_fresh {
                args.push("--session-id".to_string());
            } else {
                args.push("--resume".to_string());
            }
            args.push(session_id.to_string());
            args.extend(self.config.extra_args.iter().cloned());
            args.push(text.to_string());

            let (tx, rx) = mpsc::channel(256);
            let config = self.config.clone();
            tokio::spawn(async move {
                stream_invocation(config, args, tx).await;
            });

            Ok(ReceiverStream::new(rx).boxed())
        }
        .boxed()
    }

    fn cancel<'a>(&'a self, _session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        // Commands are worker-serialized, so by the time a cancel is
        // processed no prompt is in flight; the no-op keeps it idempotent.
        async move { Ok(()) }.boxed()
    }
}

/// Spawn the CLI, stream its stdout into events, and guarantee exactly one
/// terminal event on `tx` however the process ends.
async fn stream_invocation(config: CliConfig, args: Vec<String>, tx: mpsc::Sender<AgentEvent>) {
    tracing::debug!(binary = %config.binary, ?args, "spawning agent CLI");

    let mut child = match ProcessCommand::new(&config.binary)
        .args(&args)
        .current_dir(&config.working_dir)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .kill_on_drop(true)
        .spawn()
    {
        Ok(c) => c,
        Err(e) => {
            let _ = tx
                .send(AgentEvent::Error {
                    code: ErrorCode::BackendError,
                    message: format!("failed to spawn {}: {e}", config.binary),
                    recoverable: false,
                })
                .await;
            return;
        }
    };

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();

    let stderr_tx = tx.clone();
    let stderr_task = tokio::spawn(async move {
        let Some(stderr) = stderr else { return };
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            tracing::warn!(stderr = %line, "agent CLI stderr");
            if line.contains(ORPHAN_STDERR_MARKER) {
                let _ = stderr_tx
                    .send(AgentEvent::SessionInvalid {
                        reason: "session not found by CLI".to_string(),
                    })
                    .await;
            }
        }
    });

    let timeout = std::time::Duration::from_secs(config.timeout_secs);
    let mut saw_terminal = false;

    let read_loop = async {
        let Some(stdout) = stdout else { return };
        let mut lines = BufReader::new(stdout).lines();
        let mut state = ParseState::default();
        while let Ok(Some(line)) = lines.next_line().await {
            if line.is_empty() {
                continue;
            }
            let Ok(json) = serde_json::from_str::<Value>(&line) else {
                tracing::debug!(line = %line, "skipping non-JSON CLI output line");
                continue;
            };
            for event in parse_stream_line(&json, &mut state) {
                if matches!(event, AgentEvent::Result { .. } | AgentEvent::Error { .. }) {
                    saw_terminal = true;
                }
                if tx.send(event).await.is_err() {
                    return;
                }
            }
        }
    };

    let timed_out = tokio::time::timeout(timeout, read_loop).await.is_err();
    if timed_out {
        let _ = child.start_kill();
        let _ = tx
            .send(AgentEvent::Error {
                code: ErrorCode::Timeout,
                message: format!("CLI prompt exceeded {}s", config.timeout_secs),
                recoverable: true,
            })
            .await;
        let _ = stderr_task.await;
        return;
    }

    match child.wait().await {
        Ok(status) if !status.success() && !saw_terminal => {
            let _ = tx
                .send(AgentEvent::Error {
                    code: ErrorCode::BackendError,
                    message: format!("CLI exited with status {:?}", status.code()),
                    recoverable: false,
                })
                .await;
        }
        Ok(_) if !saw_terminal => {
            let _ = tx
                .send(AgentEvent::Error {
                    code: ErrorCode::BackendError,
                    message: "CLI exited without a result".to_string(),
                    recoverable: true,
                })
                .await;
        }
        Err(e) => {
            tracing::warn!(error = %e, "failed to reap CLI process");
        }
        _ => {}
    }

    let _ = stderr_task.await;
}

/// Parser state carried across lines of one invocation.
#[derive(Default)]
struct ParseState {
    accumulated: String,
    /// tool_use id -> (name, start time), for correlating tool_result lines.
    open_tools: HashMap<String, (String, Instant)>,
}

/// Translate one stream-json line into zero or more events.
fn parse_stream_line(json: &Value, state: &mut ParseState) -> Vec<AgentEvent> {
    let Some(kind) = json.get("type").and_then(|t| t.as_str()) else {
        return Vec::new();
    };

    match kind {
        "system" => {
            // The init line carries the session id the CLI actually used.
            if json.get("subtype").and_then(|s| s.as_str()) == Some("init") {
                if let Some(id) = json.get("session_id").and_then(|s| s.as_str()) {
                    return vec![AgentEvent::SessionChanged {
                        new_session_id: id.to_string(),
                    }];
                }
            }
            Vec::new()
        }
        "assistant" => {
            let mut events = Vec::new();
            let content = json
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array());
            for item in content.into_iter().flatten() {
                match item.get("type").and_then(|t| t.as_str()) {
                    Some("text") => {
                        if let Some(text) = item.get("text").and_then(|t| t.as_str()) {
                            if !text.is_empty() {
                                state.accumulated.push_str(text);
                                events.push(AgentEvent::Text(text.to_string()));
                            }
                        }
                    }
                    Some("tool_use") => {
                        let id = item
                            .get("id")
                            .and_then(|i| i.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        let name = item
                            .get("name")
                            .and_then(|n| n.as_str())
                            .unwrap_or("unknown")
                            .to_string();
                        let input = item.get("input").cloned().unwrap_or(Value::Null);
                        state
                            .open_tools
                            .insert(id.clone(), (name.clone(), Instant::now()));
                        events.push(AgentEvent::ToolStart { id, name, input });
                    }
                    _ => {}
                }
            }
            events
        }
        "user" => {
            // Tool results come back wrapped in a user message.
            let mut events = Vec::new();
            let content = json
                .get("message")
                .and_then(|m| m.get("content"))
                .and_then(|c| c.as_array());
            for item in content.into_iter().flatten() {
                if item.get("type").and_then(|t| t.as_str()) != Some("tool_result") {
                    continue;
                }
                let id = item
                    .get("tool_use_id")
                    .and_then(|i| i.as_str())
                    .unwrap_or("unknown")
                    .to_string();
                let success = !item
                    .get("is_error")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                let output = item.get("content").cloned().unwrap_or(Value::Null);
                let (name, duration_ms) = match state.open_tools.remove(&id) {
                    Some((name, started)) => (name, started.elapsed().as_millis() as u64),
                    None => ("unknown".to_string(), 0),
                };
                events.push(AgentEvent::ToolEnd {
                    id,
                    name,
                    output,
                    success,
                    duration_ms,
                });
            }
            events
        }
        "result" => {
            let is_error = json
                .get("is_error")
                .and_then(|v| v.as_bool())
                .unwrap_or(false);
            if is_error {
                let message = json
                    .get("error")
                    .and_then(|e| e.as_str())
                    .unwrap_or("unknown CLI error")
                    .to_string();
                vec![AgentEvent::Error {
                    code: classify_error(&message),
                    message,
                    recoverable: false,
                }]
            } else {
                let text = if state.accumulated.is_empty() {
                    json.get("result")
                        .and_then(|r| r.as_str())
                        .unwrap_or("")
                        .to_string()
                } else {
                    std::mem::take(&mut state.accumulated)
                };
                vec![AgentEvent::Result {
                    text,
                    usage: extract_usage(json),
                    metadata: json.clone(),
                }]
            }
        }
        _ => Vec::new(),
    }
}

fn classify_error(message: &str) -> ErrorCode {
    let lower = message.to_lowercase();
    if lower.contains("timeout") {
        ErrorCode::Timeout
    } else if lower.contains("rate limit") {
        ErrorCode::RateLimited
    } else if lower.contains("permission") {
        ErrorCode::PermissionDenied
    } else if lower.contains("unauthorized") || lower.contains("authentication") {
        ErrorCode::AuthFailed
    } else {
        ErrorCode::BackendError
    }
}

/// Pull token counts and cost out of the final result line, falling back
/// to the per-model aggregate when the flat usage object is absent.
fn extract_usage(json: &Value) -> Option<Usage> {
    let mut usage = Usage::default();
    let mut found = false;

    if let Some(cost) = json.get("total_cost_usd").and_then(|v| v.as_f64()) {
        usage.cost_usd = Some(cost);
        found = true;
    }

    if let Some(obj) = json.get("usage") {
        usage.input_tokens = obj.get("input_tokens").and_then(|v| v.as_u64()).unwrap_or(0);
        usage.output_tokens = obj
            .get("output_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0);
        usage.cache_read_tokens = obj.get("cache_read_input_tokens").and_then(|v| v.as_u64());
        usage.cache_write_tokens = obj
            .get("cache_creation_input_tokens")
            .and_then(|v| v.as_u64());
        found = true;
    }

    if usage.input_tokens == 0 && usage.output_tokens == 0 {
        if let Some(models) = json.get("modelUsage").and_then(|v| v.as_object()) {
            for stats in models.values() {
                usage.input_tokens += stats.get("inputTokens").and_then(|v| v.as_u64()).unwrap_or(0);
                usage.output_tokens += stats
                    .get("outputTokens")
                    .and_then(|v| v.as_u64())
                    .unwrap_or(0);
                found = true;
            }
        }
    }

    found.then_some(usage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn init_line_yields_session_changed() {
        let mut state = ParseState::default();
        let line = json!({"type": "system", "subtype": "init", "session_id": "abc-123"});
        let events = parse_stream_line(&line, &mut state);
        assert_eq!(
            events,
            vec![AgentEvent::SessionChanged {
                new_session_id: "abc-123".to_string()
            }]
        );
    }

    #[test]
    fn assistant_text_accumulates_and_streams() {
        let mut state = ParseState::default();
        let line = json!({"type": "assistant", "message": {"content": [
            {"type": "text", "text": "hello "},
            {"type": "text", "text": "world"}
        ]}});
        let events = parse_stream_line(&line, &mut state);
        assert_eq!(events.len(), 2);
        assert_eq!(state.accumulated, "hello world");
    }

    #[test]
    fn tool_use_then_result_correlates_name() {
        let mut state = ParseState::default();
        let start = json!({"type": "assistant", "message": {"content": [
            {"type": "tool_use", "id": "t9", "name": "Read", "input": {"path": "/tmp/x"}}
        ]}});
        let events = parse_stream_line(&start, &mut state);
        assert!(matches!(
            &events[0],
            AgentEvent::ToolStart { id, name, .. } if id == "t9" && name == "Read"
        ));

        let end = json!({"type": "user", "message": {"content": [
            {"type": "tool_result", "tool_use_id": "t9", "content": "data"}
        ]}});
        let events = parse_stream_line(&end, &mut state);
        assert!(matches!(
            &events[0],
            AgentEvent::ToolEnd { id, name, success: true, .. } if id == "t9" && name == "Read"
        ));
    }

    #[test]
    fn result_line_prefers_accumulated_text() {
        let mut state = ParseState::default();
        state.accumulated = "streamed answer".to_string();
        let line = json!({"type": "result", "result": "fallback", "usage": {
            "input_tokens": 10, "output_tokens": 5
        }});
        let events = parse_stream_line(&line, &mut state);
        match &events[0] {
            AgentEvent::Result { text, usage, .. } => {
                assert_eq!(text, "streamed answer");
                let usage = usage.as_ref().unwrap();
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 5);
            }
            other => panic!("expected Result, got {other:?}"),
        }
    }

    #[test]
    fn error_result_is_classified() {
        let mut state = ParseState::default();
        let line = json!({"type": "result", "is_error": true, "error": "rate limit exceeded"});
        let events = parse_stream_line(&line, &mut state);
        assert!(matches!(
            &events[0],
            AgentEvent::Error { code: ErrorCode::RateLimited, .. }
        ));
    }

    #[test]
    fn model_usage_fallback_aggregates() {
        let line = json!({"type": "result", "modelUsage": {
            "model-a": {"inputTokens": 7, "outputTokens": 3},
            "model-b": {"inputTokens": 5, "outputTokens": 2}
        }});
        let usage = extract_usage(&line).unwrap();
        assert_eq!(usage.input_tokens, 12);
        assert_eq!(usage.output_tokens, 5);
    }
}
