// ABOUTME: Clonable Send+Sync handle over a single-owner backend worker.
// ABOUTME: All communication goes through a command queue plus per-prompt event queues.

use crate::backend::AgentBackend;
use crate::event::{AgentEvent, ErrorCode};
use anyhow::{anyhow, Result};
use futures::StreamExt;
use tokio::sync::{mpsc, oneshot};

/// Command queue depth per backend worker.
const COMMAND_BUFFER: usize = 32;

/// Event queue depth per in-flight prompt.
const EVENT_BUFFER: usize = 1024;

/// Requests sent from an [`AgentHandle`] to its backend worker.
///
/// The `reply` channel only acknowledges that the worker accepted the
/// request. Execution failures for `Prompt` arrive as a terminal
/// [`AgentEvent::Error`] on `event_tx`, never through `reply`.
#[derive(Debug)]
pub enum Command {
    NewSession {
        reply: oneshot::Sender<Result<String>>,
    },
    LoadSession {
        session_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Prompt {
        session_id: String,
        text: String,
        event_tx: mpsc::Sender<AgentEvent>,
        reply: oneshot::Sender<Result<()>>,
    },
    Cancel {
        session_id: String,
        reply: oneshot::Sender<Result<()>>,
    },
}

/// Shareable façade over exactly one backend instance.
///
/// Cloning duplicates only the command-queue sender; however many clones
/// exist, there is one worker and one backend. The worker processes
/// commands strictly in submission order, so a `cancel` queued after a
/// `prompt` always observes the prompt as already dispatched. Once the
/// worker exits (backend crash or teardown) every subsequent call fails
/// immediately.
#[derive(Clone)]
pub struct AgentHandle {
    tx: mpsc::Sender<Command>,
    name: &'static str,
}

impl AgentHandle {
    pub fn new(tx: mpsc::Sender<Command>, name: &'static str) -> Self {
        Self { tx, name }
    }

    /// Backend name this handle fronts ("mock", "cli", "acp").
    pub fn name(&self) -> &'static str {
        self.name
    }

    pub async fn new_session(&self) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::NewSession { reply }).await?;
        rx.await.map_err(|_| self.worker_gone())?
    }

    pub async fn load_session(&self, session_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::LoadSession {
            session_id: session_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.worker_gone())?
    }

    /// Submit a prompt. The returned receiver streams events until the
    /// terminal `Result`/`Error`; the await here only covers acceptance.
    pub async fn prompt(&self, session_id: &str, text: &str) -> Result<EventReceiver> {
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);
        let (reply, rx) = oneshot::channel();
        self.send(Command::Prompt {
            session_id: session_id.to_string(),
            text: text.to_string(),
            event_tx,
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.worker_gone())??;
        Ok(EventReceiver::new(event_rx))
    }

    pub async fn cancel(&self, session_id: &str) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Cancel {
            session_id: session_id.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.worker_gone())?
    }

    async fn send(&self, cmd: Command) -> Result<()> {
        self.tx.send(cmd).await.map_err(|_| self.worker_gone())
    }

    fn worker_gone(&self) -> anyhow::Error {
        anyhow!("{} backend worker is no longer running", self.name)
    }
}

/// Receiving end of one prompt's event stream. `Send`, so it can cross
/// task boundaries even when the producing backend cannot.
pub struct EventReceiver {
    rx: mpsc::Receiver<AgentEvent>,
}

impl EventReceiver {
    pub fn new(rx: mpsc::Receiver<AgentEvent>) -> Self {
        Self { rx }
    }

    /// Next event, or `None` once the prompt's channel closes. `None`
    /// before a terminal event means the backend died mid-prompt.
    pub async fn recv(&mut self) -> Option<AgentEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<AgentEvent> {
        self.rx.try_recv().ok()
    }
}

/// Run a `Send` backend on a fresh tokio task and return its handle.
///
/// Backends whose futures cannot leave their thread (the protocol
/// backend) skip this and run an equivalent command loop on their own
/// dedicated-thread runtime instead.
pub fn spawn_backend<B>(backend: B) -> AgentHandle
where
    B: AgentBackend + Send + 'static,
{
    let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
    let name = backend.name();
    tokio::spawn(run_worker(backend, rx));
    AgentHandle::new(tx, name)
}

/// Worker loop: exclusive owner of the backend, processes commands in
/// submission order until the command channel closes.
pub async fn run_worker<B: AgentBackend>(backend: B, mut rx: mpsc::Receiver<Command>) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::NewSession { reply } => {
                let _ = reply.send(backend.new_session().await);
            }
            Command::LoadSession { session_id, reply } => {
                let _ = reply.send(backend.load_session(&session_id).await);
            }
            Command::Prompt {
                session_id,
                text,
                event_tx,
                reply,
            } => {
                // Acknowledge acceptance before doing any work; execution
                // failure travels on the event channel as a terminal Error.
                let _ = reply.send(Ok(()));
                match backend.prompt(&session_id, &text).await {
                    Ok(mut events) => {
                        while let Some(event) = events.next().await {
                            if event_tx.send(event).await.is_err() {
                                tracing::debug!(
                                    backend = backend.name(),
                                    "event receiver dropped, stopping stream"
                                );
                                break;
                            }
                        }
                    }
                    Err(e) => {
                        tracing::error!(backend = backend.name(), error = %e, "prompt failed to start");
                        let _ = event_tx
                            .send(AgentEvent::Error {
                                code: ErrorCode::BackendError,
                                message: e.to_string(),
                                recoverable: false,
                            })
                            .await;
                    }
                }
            }
            Command::Cancel { session_id, reply } => {
                let _ = reply.send(backend.cancel(&session_id).await);
            }
        }
    }
    tracing::debug!(backend = backend.name(), "backend worker shut down");
}
