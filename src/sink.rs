//! Where remote command output ends up.
//!
//! Output is line oriented and comes in three categories: `info` for stdout,
//! `warn` for stderr and `error` for operation failures. The sink is injected
//! into the client at construction so nothing here reads ambient state.

use std::sync::Mutex;
use std::time::Duration;

pub trait OutputSink: Send + Sync {
    fn info(&self, line: &str);

    fn warn(&self, line: &str);

    fn error(&self, message: &str);

    fn started(&self, command: &str) {
        self.info(&format!("=== Executing: '{}'", command));
    }

    fn finished(&self, command: &str, elapsed: Duration, ok: bool) {
        let outcome = if ok { "ok" } else { "failed" };
        self.info(&format!(
            "=== Finished '{}' in {:.3}s ({})",
            command,
            elapsed.as_secs_f64(),
            outcome
        ));
    }
}

/// Forwards output to the `log` facade under the `sshkit::remote` target.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

const TARGET: &str = "sshkit::remote";

impl OutputSink for LogSink {
    fn info(&self, line: &str) {
        log::info!(target: TARGET, "{}", line);
    }

    fn warn(&self, line: &str) {
        log::warn!(target: TARGET, "{}", line);
    }

    fn error(&self, message: &str) {
        log::error!(target: TARGET, "{}", message);
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum OutputEvent {
    Info(String),
    Warn(String),
    Error(String),
    Started(String),
    Finished { command: String, ok: bool },
}

/// Records every event in arrival order.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<OutputEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, event: OutputEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event);
        }
    }

    pub fn events(&self) -> Vec<OutputEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }

    pub fn info_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Info(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn warn_lines(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Warn(line) => Some(line),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<String> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                OutputEvent::Error(message) => Some(message),
                _ => None,
            })
            .collect()
    }
}

impl OutputSink for MemorySink {
    fn info(&self, line: &str) {
        self.push(OutputEvent::Info(line.to_string()));
    }

    fn warn(&self, line: &str) {
        self.push(OutputEvent::Warn(line.to_string()));
    }

    fn error(&self, message: &str) {
        self.push(OutputEvent::Error(message.to_string()));
    }

    fn started(&self, command: &str) {
        self.push(OutputEvent::Started(command.to_string()));
    }

    fn finished(&self, command: &str, _elapsed: Duration, ok: bool) {
        self.push(OutputEvent::Finished {
            command: command.to_string(),
            ok,
        });
    }
}
