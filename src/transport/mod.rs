//! Seams between the client and the secure transport underneath it.
//!
//! A [`Transport`] dials and authenticates, yielding a [`TransportHandle`]
//! owned exclusively by one [`crate::Client`]. Each operation opens its own
//! [`Channel`] on that handle. Failures are opaque `anyhow::Error` values;
//! the client folds them into the [`crate::Error`] taxonomy.

pub mod russh;

use crate::config::{ConnectionConfig, Credential};
use crate::error::ExitStatus;
use crate::pty::PtyRequest;
use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};

pub use self::russh::RusshTransport;

pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

#[async_trait]
pub trait Transport: Send + Sync {
    /// Dial `config.address()` and authenticate with `credential`.
    async fn dial(
        &self,
        config: &ConnectionConfig,
        credential: &Credential,
    ) -> anyhow::Result<Box<dyn TransportHandle>>;
}

/// An authenticated connection to one remote host.
#[async_trait]
pub trait TransportHandle: Send + Sync {
    async fn open_channel(&self) -> anyhow::Result<Box<dyn Channel>>;

    async fn close(&self) -> anyhow::Result<()>;
}

/// One session channel: a single remote command with its own stdio.
///
/// Streams are taken at most once. Any stream not taken before
/// [`Channel::exec`] is discarded.
#[async_trait]
pub trait Channel: Send {
    /// Ask the remote to forward agent requests back over this connection.
    async fn request_agent_forwarding(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn request_pty(&mut self, pty: &PtyRequest) -> anyhow::Result<()>;

    fn take_stdin(&mut self) -> anyhow::Result<BoxWriter>;

    fn take_stdout(&mut self) -> anyhow::Result<BoxReader>;

    fn take_stderr(&mut self) -> anyhow::Result<BoxReader>;

    /// Start `command`. Returns once the remote accepted or rejected it.
    async fn exec(&mut self, command: &str) -> anyhow::Result<()>;

    /// Wait for the remote command to end.
    async fn wait(&mut self) -> anyhow::Result<ExitStatus>;

    async fn close(&mut self) -> anyhow::Result<()>;
}
