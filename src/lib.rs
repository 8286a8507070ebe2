//! Remote command execution and file upload over SSH.
//!
//! A [`Client`] owns one lazily established connection. Every operation
//! opens its own channel: [`Client::execute`] streams output lines into an
//! [`OutputSink`], [`Client::capture`] returns the combined output,
//! [`Client::execute_interactively`] answers prompts on a pseudo-terminal,
//! and [`Client::upload`] copies a file with the `scp` sink protocol.

pub mod client;
pub mod config;
pub mod drain;
pub mod error;
pub mod exec;
pub mod logging;
pub mod progress;
pub mod prompt;
pub mod pty;
pub mod sink;
pub mod transport;
pub mod upload;

pub use client::Client;
pub use config::{ConnectionConfig, Credential};
pub use error::{Error, ExitStatus, Result, UploadPhase};
pub use exec::ExecutionRequest;
pub use progress::{LogProgress, ProgressDisplay, ProgressWriter, TerminalProgress};
pub use prompt::PromptMap;
pub use pty::PtyRequest;
pub use sink::{LogSink, MemorySink, OutputEvent, OutputSink};
pub use upload::TransferSpec;
