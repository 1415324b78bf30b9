// ABOUTME: The AgentBackend contract every invocation strategy implements.
// ABOUTME: Explicit boxed futures keep the trait expressible for !Send backends.

use crate::event::AgentEvent;
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;

/// Minimal operation set for any agent-invocation strategy.
///
/// Implementations are free to confine their execution to a single thread
/// (the protocol backend's connection futures are `!Send`); callers never
/// touch a backend directly. [`crate::handle::AgentHandle`] owns the one
/// worker that does, so the boxed signatures here deliberately avoid a
/// `Send` bound on `self`.
pub trait AgentBackend {
    /// Short backend name for logs and the registry ("mock", "cli", "acp").
    fn name(&self) -> &'static str;

    /// Create a fresh session and return its id.
    fn new_session<'a>(&'a self) -> BoxFuture<'a, Result<String>>;

    /// Resume a previously-created session. Fails when the backend no
    /// longer recognizes the id (the orphaned-session case).
    fn load_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>>;

    /// Send a prompt and stream events until a terminal `Result`/`Error`.
    fn prompt<'a>(
        &'a self,
        session_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'a, AgentEvent>>>;

    /// Ask the backend to stop an in-flight prompt. Idempotent; a cancel
    /// with nothing in flight is a successful no-op.
    fn cancel<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>>;
}
