// ABOUTME: Deterministic mock backend replaying pre-registered event scripts.
// ABOUTME: No processes, no timing: tests get the same events every run.
//!
//! # Example
//!
//! ```no_run
//! use crossbar_agent::backends::mock::MockBackend;
//! use crossbar_agent::AgentEvent;
//!
//! # async fn example() {
//! let handle = MockBackend::new()
//!     .on_prompt("ping")
//!     .respond_text("pong")
//!     .into_handle();
//!
//! let session_id = handle.new_session().await.unwrap();
//! let mut events = handle.prompt(&session_id, "ping").await.unwrap();
//! if let Some(AgentEvent::Result { text, .. }) = events.recv().await {
//!     assert_eq!(text, "pong");
//! }
//! # }
//! ```

use crate::backend::AgentBackend;
use crate::event::{AgentEvent, ErrorCode};
use crate::handle::{spawn_backend, AgentHandle};
use anyhow::Result;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::{FutureExt, StreamExt};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

struct Expectation {
    pattern: String,
    events: Vec<AgentEvent>,
}

/// Test backend that matches each prompt against a queue of expectations.
///
/// The first expectation whose pattern is contained in the prompt text is
/// consumed and its events replayed. Unmatched prompts get a fallback
/// `Result` rather than an error, so a forgotten expectation shows up in
/// assertions instead of failure paths.
pub struct MockBackend {
    expectations: Mutex<VecDeque<Expectation>>,
}

/// Process-global session counter so ids are unique across backend
/// instances, matching the real backends' per-session unique ids.
static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

impl MockBackend {
    pub fn new() -> Self {
        Self {
            expectations: Mutex::new(VecDeque::new()),
        }
    }

    /// Begin registering a response for prompts containing `pattern`.
    pub fn on_prompt(self, pattern: &str) -> ExpectationBuilder {
        ExpectationBuilder {
            backend: self,
            pattern: pattern.to_string(),
        }
    }

    /// Wrap this backend in a worker task and return its handle.
    pub fn into_handle(self) -> AgentHandle {
        spawn_backend(self)
    }

    /// Factory for [`crate::registry::AgentRegistry`]; ignores its config.
    pub fn factory() -> crate::registry::BackendFactory {
        Box::new(|_config| Ok(MockBackend::new().into_handle()))
    }

    fn take_matching(&self, text: &str) -> Option<Vec<AgentEvent>> {
        let mut queue = self.expectations.lock().unwrap_or_else(|e| e.into_inner());
        let idx = queue.iter().position(|e| text.contains(&e.pattern))?;
        queue.remove(idx).map(|e| e.events)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentBackend for MockBackend {
    fn name(&self) -> &'static str {
        "mock"
    }

    fn new_session<'a>(&'a self) -> BoxFuture<'a, Result<String>> {
        async move {
            let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
            Ok(format!("mock-session-{n}"))
        }
        .boxed()
    }

    fn load_session<'a>(&'a self, session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move {
            // Ids the mock never handed out count as orphaned, which lets
            // tests exercise the resume-failure recovery path.
            if session_id.starts_with("mock-session-") || session_id.starts_with("resumable-") {
                Ok(())
            } else {
                anyhow::bail!("unknown mock session: {session_id}")
            }
        }
        .boxed()
    }

    fn prompt<'a>(
        &'a self,
        _session_id: &'a str,
        text: &'a str,
    ) -> BoxFuture<'a, Result<BoxStream<'a, AgentEvent>>> {
        async move {
            let events = self.take_matching(text).unwrap_or_else(|| {
                vec![AgentEvent::Result {
                    text: format!("mock: no expectation for '{text}'"),
                    usage: None,
                    metadata: serde_json::json!({}),
                }]
            });
            Ok(futures::stream::iter(events).boxed())
        }
        .boxed()
    }

    fn cancel<'a>(&'a self, _session_id: &'a str) -> BoxFuture<'a, Result<()>> {
        async move { Ok(()) }.boxed()
    }
}

/// Fluent second half of [`MockBackend::on_prompt`].
pub struct ExpectationBuilder {
    backend: MockBackend,
    pattern: String,
}

impl ExpectationBuilder {
    /// Replay an explicit event script for the matched prompt.
    pub fn respond_with(self, events: Vec<AgentEvent>) -> MockBackend {
        self.backend
            .expectations
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Expectation {
                pattern: self.pattern,
                events,
            });
        self.backend
    }

    /// Replay a single `Result` carrying `text`.
    pub fn respond_text(self, text: &str) -> MockBackend {
        self.respond_with(vec![AgentEvent::Result {
            text: text.to_string(),
            usage: None,
            metadata: serde_json::json!({}),
        }])
    }

    /// Replay a terminal `Error`.
    pub fn respond_error(self, code: ErrorCode, message: &str) -> MockBackend {
        self.respond_with(vec![AgentEvent::Error {
            code,
            message: message.to_string(),
            recoverable: false,
        }])
    }
}
