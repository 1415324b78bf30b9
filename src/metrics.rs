// ABOUTME: Thin wrappers over the metrics facade so call sites stay one-liners.
// ABOUTME: No exporter is wired here; embedders install their own recorder.

pub fn record_message_routed(target: &str) {
    metrics::counter!("crossbar_messages_routed_total", "target" => target.to_string()).increment(1);
}

pub fn record_duplicate_dropped() {
    metrics::counter!("crossbar_duplicates_dropped_total").increment(1);
}

pub fn record_command(command: &'static str) {
    metrics::counter!("crossbar_dispatch_commands_total", "command" => command).increment(1);
}

pub fn record_session_created(backend: &str) {
    metrics::counter!("crossbar_sessions_created_total", "backend" => backend.to_string()).increment(1);
}

pub fn record_agent_error(code: &str) {
    metrics::counter!("crossbar_agent_errors_total", "code" => code.to_string()).increment(1);
}

pub fn record_prompt_duration(seconds: f64) {
    metrics::histogram!("crossbar_prompt_duration_seconds").record(seconds);
}

pub fn record_tokens(input: u64, output: u64) {
    metrics::counter!("crossbar_agent_tokens_total", "direction" => "input").increment(input);
    metrics::counter!("crossbar_agent_tokens_total", "direction" => "output").increment(output);
}
