// ABOUTME: Protocol backend - persistent subprocess speaking the agent client
// ABOUTME: protocol over stdio, confined to one dedicated thread (!Send futures).

use crate::event::{AgentEvent, ErrorCode};
use crate::handle::{AgentHandle, Command};
use acp::Agent as _;
use agent_client_protocol as acp;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::thread;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc;
use tokio_util::compat::{TokioAsyncReadCompatExt, TokioAsyncWriteCompatExt};

/// Configuration for the protocol backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcpConfig {
    /// Path to the protocol agent binary (e.g. claude-code-acp).
    pub binary: String,
    /// Working directory for the agent process.
    pub working_dir: PathBuf,
    /// Per-prompt wall-clock bound; exceeding it yields `ErrorCode::Timeout`.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Extra arguments passed to the agent binary.
    #[serde(default)]
    pub extra_args: Vec<String>,
}

fn default_timeout_secs() -> u64 {
    300
}

/// Where protocol callbacks deliver their events.
///
/// The connection outlives any single prompt, so the sender is swapped in
/// per prompt and replaced with a disconnected one afterwards; dropping
/// the old sender is what closes that prompt's stream. Text chunks are
/// mirrored into an accumulator so the terminal `Result` can carry the
/// full response.
#[derive(Clone)]
struct EventSink {
    tx: Arc<RwLock<mpsc::Sender<AgentEvent>>>,
    working_dir: PathBuf,
    accumulated: Arc<Mutex<String>>,
}

impl EventSink {
    fn new(working_dir: PathBuf) -> Self {
        let (disconnected, _) = mpsc::channel(1);
        Self {
            tx: Arc::new(RwLock::new(disconnected)),
            working_dir,
            accumulated: Arc::new(Mutex::new(String::new())),
        }
    }

    fn attach(&self, tx: mpsc::Sender<AgentEvent>) {
        self.accumulated
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.tx.write().unwrap_or_else(|e| e.into_inner()) = tx;
    }

    /// Swap in a disconnected sender, dropping the live one so the
    /// receiver sees end-of-stream.
    fn detach(&self) {
        let (disconnected, _) = mpsc::channel(1);
        *self.tx.write().unwrap_or_else(|e| e.into_inner()) = disconnected;
    }

    fn take_accumulated(&self) -> String {
        std::mem::take(&mut *self.accumulated.lock().unwrap_or_else(|e| e.into_inner()))
    }

    fn emit(&self, event: AgentEvent) {
        if let AgentEvent::Text(text) = &event {
            self.accumulated
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .push_str(text);
        }
        let tx = self.tx.read().unwrap_or_else(|e| e.into_inner());
        match tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(dropped)) => {
                tracing::warn!(event = ?dropped, "event queue full, dropping protocol event");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::debug!("event receiver gone, discarding protocol event");
            }
        }
    }
}

fn content_text(block: acp::ContentBlock) -> String {
    match block {
        acp::ContentBlock::Text(t) => t.text,
        acp::ContentBlock::ResourceLink(r) => r.uri,
        acp::ContentBlock::Image(_) => "<image>".into(),
        acp::ContentBlock::Audio(_) => "<audio>".into(),
        acp::ContentBlock::Resource(_) => "<resource>".into(),
        _ => String::new(),
    }
}

#[async_trait::async_trait(?Send)]
impl acp::Client for EventSink {
    async fn request_permission(
        &self,
        args: acp::RequestPermissionRequest,
    ) -> acp::Result<acp::RequestPermissionResponse> {
        tracing::debug!(
            session_id = %args.session_id,
            tool_call_id = %args.tool_call.tool_call_id,
            "auto-approving permission request"
        );
        let allow = args
            .options
            .iter()
            .find(|opt| matches!(opt.kind, acp::PermissionOptionKind::AllowOnce))
            .or_else(|| args.options.first());
        match allow {
            Some(option) => Ok(acp::RequestPermissionResponse::new(
                acp::RequestPermissionOutcome::Selected(acp::SelectedPermissionOutcome::new(
                    option.option_id.clone(),
                )),
            )),
            None => Ok(acp::RequestPermissionResponse::new(
                acp::RequestPermissionOutcome::Cancelled,
            )),
        }
    }

    async fn session_notification(&self, args: acp::SessionNotification) -> acp::Result<()> {
        match args.update {
            acp::SessionUpdate::AgentMessageChunk(chunk) => {
                let text = content_text(chunk.content);
                if !text.is_empty() {
                    self.emit(AgentEvent::Text(text));
                }
            }
            acp::SessionUpdate::AgentThoughtChunk(chunk) => {
                let text = content_text(chunk.content);
                if !text.is_empty() {
                    self.emit(AgentEvent::Custom {
                        kind: "agent.thought".to_string(),
                        payload: serde_json::json!({ "text": text }),
                    });
                }
            }
            acp::SessionUpdate::ToolCall(tool_call) => {
                self.emit(AgentEvent::ToolStart {
                    id: tool_call.tool_call_id.to_string(),
                    name: tool_call.title.clone(),
                    input: tool_call.raw_input.clone().unwrap_or(serde_json::json!({})),
                });
            }
            other => {
                tracing::debug!(?other, "unhandled session update");
            }
        }
        Ok(())
    }

    async fn write_text_file(
        &self,
        args: acp::WriteTextFileRequest,
    ) -> acp::Result<acp::WriteTextFileResponse> {
        let path = self.working_dir.join(&args.path);
        if !confined_to(&path, &self.working_dir) {
            tracing::warn!(path = %args.path.display(), "write outside working directory refused");
            return Err(acp::Error::invalid_params());
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return Err(acp::Error::internal_error());
            }
        }
        match std::fs::write(&path, &args.content) {
            Ok(()) => Ok(acp::WriteTextFileResponse::new()),
            Err(e) => {
                tracing::error!(path = %path.display(), error = %e, "file write failed");
                Err(acp::Error::internal_error())
            }
        }
    }

    async fn read_text_file(
        &self,
        args: acp::ReadTextFileRequest,
    ) -> acp::Result<acp::ReadTextFileResponse> {
        let path = self.working_dir.join(&args.path);
        let canonical = path.canonicalize().map_err(|e| {
            tracing::warn!(path = %args.path.display(), error = %e, "cannot canonicalize read path");
            acp::Error::invalid_params()
        })?;
        if !canonical.starts_with(&self.working_dir) {
            tracing::warn!(path = %args.path.display(), "read outside working directory refused");
            return Err(acp::Error::invalid_params());
        }
        match std::fs::read_to_string(&canonical) {
            Ok(content) => Ok(acp::ReadTextFileResponse::new(content)),
            Err(e) => {
                tracing::warn!(path = %args.path.display(), error = %e, "file read failed");
                Err(acp::Error::invalid_params())
            }
        }
    }

    async fn create_terminal(
        &self,
        _args: acp::CreateTerminalRequest,
    ) -> acp::Result<acp::CreateTerminalResponse> {
        let shell = std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string());
        let child = tokio::process::Command::new(&shell)
            .current_dir(&self.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| {
                tracing::error!(error = %e, "terminal spawn failed");
                acp::Error::internal_error()
            })?;
        let terminal_id = format!("term-{}", child.id().unwrap_or(0));
        Ok(acp::CreateTerminalResponse::new(acp::TerminalId::new(
            terminal_id,
        )))
    }

    async fn terminal_output(
        &self,
        _args: acp::TerminalOutputRequest,
    ) -> acp::Result<acp::TerminalOutputResponse> {
        Ok(acp::TerminalOutputResponse::new(String::new(), false))
    }

    async fn release_terminal(
        &self,
        _args: acp::ReleaseTerminalRequest,
    ) -> acp::Result<acp::ReleaseTerminalResponse> {
        Ok(acp::ReleaseTerminalResponse::new())
    }

    async fn wait_for_terminal_exit(
        &self,
        _args: acp::WaitForTerminalExitRequest,
    ) -> acp::Result<acp::WaitForTerminalExitResponse> {
        Ok(acp::WaitForTerminalExitResponse::new(
            acp::TerminalExitStatus::new(),
        ))
    }

    async fn kill_terminal_command(
        &self,
        _args: acp::KillTerminalCommandRequest,
    ) -> acp::Result<acp::KillTerminalCommandResponse> {
        Ok(acp::KillTerminalCommandResponse::new())
    }

    async fn ext_method(&self, _args: acp::ExtRequest) -> acp::Result<acp::ExtResponse> {
        Err(acp::Error::method_not_found())
    }

    async fn ext_notification(&self, _args: acp::ExtNotification) -> acp::Result<()> {
        Ok(())
    }
}

/// True when `path` cannot escape `root`, tolerating not-yet-existing files.
fn confined_to(path: &std::path::Path, root: &std::path::Path) -> bool {
    match path.canonicalize() {
        Ok(canonical) => canonical.starts_with(root),
        Err(_) => match path.parent().and_then(|p| p.canonicalize().ok()) {
            Some(parent) => parent.starts_with(root),
            None => true,
        },
    }
}

/// One live protocol connection plus the subprocess behind it.
struct ProtoClient {
    child: Child,
    conn: acp::ClientSideConnection,
    sink: EventSink,
    working_dir: PathBuf,
}

impl Drop for ProtoClient {
    fn drop(&mut self) {
        if let Err(e) = self.child.start_kill() {
            tracing::warn!(error = %e, "failed to kill protocol agent on drop");
        }
    }
}

impl ProtoClient {
    async fn spawn(config: &AcpConfig) -> Result<Self> {
        if config.binary.is_empty() || config.binary.contains('\0') {
            anyhow::bail!("invalid protocol agent binary path");
        }
        if !config.working_dir.exists() {
            anyhow::bail!(
                "working directory does not exist: {}",
                config.working_dir.display()
            );
        }

        tracing::info!(
            binary = %config.binary,
            cwd = %config.working_dir.display(),
            "spawning protocol agent"
        );

        let mut child = ProcessCommand::new(&config.binary)
            .args(&config.extra_args)
            .current_dir(&config.working_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .context("failed to spawn protocol agent")?;

        let stdin = child.stdin.take().context("no stdin pipe on agent")?;
        let stdout = child.stdout.take().context("no stdout pipe on agent")?;

        let sink = EventSink::new(config.working_dir.clone());
        let (conn, io_task) = acp::ClientSideConnection::new(
            sink.clone(),
            stdin.compat_write(),
            stdout.compat(),
            |fut| {
                tokio::task::spawn_local(fut);
            },
        );
        tokio::task::spawn_local(io_task);

        Ok(Self {
            child,
            conn,
            sink,
            working_dir: config.working_dir.clone(),
        })
    }

    async fn initialize(&self) -> Result<()> {
        self.conn
            .initialize(
                acp::InitializeRequest::new(acp::ProtocolVersion::V1)
                    .client_capabilities(acp::ClientCapabilities::default())
                    .client_info(
                        acp::Implementation::new("crossbar-acp", env!("CARGO_PKG_VERSION"))
                            .title("crossbar protocol backend"),
                    ),
            )
            .await
            .context("protocol initialization failed")?;
        tracing::info!("protocol connection initialized");
        Ok(())
    }

    async fn new_session(&self) -> Result<String> {
        let response = self
            .conn
            .new_session(acp::NewSessionRequest::new(self.working_dir.clone()))
            .await
            .context("failed to create protocol session")?;
        let session_id = response.session_id.to_string();
        tracing::info!(session_id = %session_id, "created protocol session");
        Ok(session_id)
    }

    async fn load_session(&self, session_id: &str) -> Result<()> {
        self.conn
            .load_session(acp::LoadSessionRequest::new(
                acp::SessionId::new(session_id.to_string()),
                self.working_dir.clone(),
            ))
            .await
            .with_context(|| format!("failed to load protocol session {session_id}"))?;
        tracing::info!(session_id = %session_id, "loaded protocol session");
        Ok(())
    }

    /// Run one prompt to its terminal event. Always detaches the sink so
    /// the caller's stream ends.
    async fn run_prompt(
        &self,
        session_id: &str,
        text: &str,
        event_tx: mpsc::Sender<AgentEvent>,
        timeout_secs: u64,
    ) {
        self.sink.attach(event_tx);

        let request = acp::PromptRequest::new(
            acp::SessionId::new(session_id.to_string()),
            vec![acp::ContentBlock::Text(acp::TextContent::new(
                text.to_string(),
            ))],
        );
        let timeout = std::time::Duration::from_secs(timeout_secs);

        match tokio::time::timeout(timeout, self.conn.prompt(request)).await {
            Ok(Ok(response)) => {
                self.sink.emit(AgentEvent::Result {
                    text: self.sink.take_accumulated(),
                    usage: None,
                    metadata: serde_json::json!({
                        "stop_reason": format!("{:?}", response.stop_reason),
                    }),
                });
            }
            Ok(Err(e)) => {
                tracing::error!(error = %e, "protocol prompt failed");
                self.sink.emit(AgentEvent::Error {
                    code: ErrorCode::BackendError,
                    message: format!("protocol prompt failed: {e}"),
                    recoverable: false,
                });
            }
            Err(_) => {
                tracing::error!(timeout_secs, "protocol prompt timed out");
                self.sink.emit(AgentEvent::Error {
                    code: ErrorCode::Timeout,
                    message: format!("prompt exceeded {timeout_secs}s"),
                    recoverable: true,
                });
            }
        }

        self.sink.detach();
    }

    async fn cancel(&self, session_id: &str) -> Result<()> {
        self.conn
            .cancel(acp::CancelNotification::new(acp::SessionId::new(
                session_id.to_string(),
            )))
            .await
            .context("failed to send cancel notification")?;
        Ok(())
    }
}

/// Thread body: current-thread runtime + LocalSet so the connection's
/// !Send futures never leave this thread. Exiting drops the command
/// receiver, which makes every later handle call fail fast.
fn run_acp_worker(config: AcpConfig, mut rx: mpsc::Receiver<Command>) {
    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "failed to build protocol worker runtime");
            return;
        }
    };

    rt.block_on(async {
        let local = tokio::task::LocalSet::new();
        local
            .run_until(async {
                let client = match ProtoClient::spawn(&config).await {
                    Ok(c) => c,
                    Err(e) => {
                        tracing::error!(error = %e, "protocol agent spawn failed");
                        return;
                    }
                };
                if let Err(e) = client.initialize().await {
                    tracing::error!(error = %e, "protocol agent initialization failed");
                    return;
                }

                while let Some(cmd) = rx.recv().await {
                    match cmd {
                        Command::NewSession { reply } => {
                            let _ = reply.send(client.new_session().await);
                        }
                        Command::LoadSession { session_id, reply } => {
                            let _ = reply.send(client.load_session(&session_id).await);
                        }
                        Command::Prompt {
                            session_id,
                            text,
                            event_tx,
                            reply,
                        } => {
                            let _ = reply.send(Ok(()));
                            client
                                .run_prompt(&session_id, &text, event_tx, config.timeout_secs)
                                .await;
                        }
                        Command::Cancel { session_id, reply } => {
                            let _ = reply.send(client.cancel(&session_id).await);
                        }
                    }
                }
                tracing::info!("protocol worker shutting down");
            })
            .await;
    });
}

/// Protocol backend entry point.
pub struct AcpBackend {
    config: AcpConfig,
}

impl AcpBackend {
    pub fn new(config: AcpConfig) -> Result<Self> {
        Ok(Self { config })
    }

    /// Start the dedicated worker thread and return a handle to it.
    pub fn into_handle(self) -> AgentHandle {
        let (tx, rx) = mpsc::channel::<Command>(32);
        let config = self.config;
        thread::spawn(move || run_acp_worker(config, rx));
        AgentHandle::new(tx, "acp")
    }

    /// Factory for [`crate::registry::AgentRegistry`].
    pub fn factory() -> crate::registry::BackendFactory {
        Box::new(|config| {
            let cfg: AcpConfig = serde_json::from_value(config.clone())?;
            Ok(AcpBackend::new(cfg)?.into_handle())
        })
    }
}
