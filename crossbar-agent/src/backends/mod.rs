// ABOUTME: Concrete backend strategies conforming to the AgentBackend contract.
// ABOUTME: mock (tests), cli (one-shot invocations), acp (persistent protocol subprocess).

#[cfg(feature = "acp")]
pub mod acp;
pub mod cli;
pub mod mock;
