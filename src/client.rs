//! Connection manager and per-operation session factory.

use crate::config::{ConnectionConfig, Credential};
use crate::error::{Error, Result};
use crate::progress::{ProgressDisplay, ProgressFactory, TerminalProgress};
use crate::sink::{LogSink, OutputSink};
use crate::transport::{Channel, RusshTransport, Transport, TransportHandle};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// A lazily connected client for one remote host.
///
/// Operations take `&mut self`, so one client serves one operation at a
/// time. Create one client per concurrent operation.
pub struct Client {
    config: ConnectionConfig,
    credential: Credential,
    transport: Arc<dyn Transport>,
    handle: Option<Box<dyn TransportHandle>>,
    connected: bool,
    properties: HashMap<String, String>,
    sink: Arc<dyn OutputSink>,
    progress: ProgressFactory,
    cancel: CancellationToken,
}

impl Client {
    /// Build a client backed by `russh`. Fails with [`Error::Config`] when
    /// the config carries no usable credential.
    pub fn new(config: ConnectionConfig) -> Result<Self> {
        Self::with_transport(config, Arc::new(RusshTransport))
    }

    pub fn with_transport(config: ConnectionConfig, transport: Arc<dyn Transport>) -> Result<Self> {
        let credential = config.credential()?;
        Ok(Self {
            config,
            credential,
            transport,
            handle: None,
            connected: false,
            properties: HashMap::new(),
            sink: Arc::new(LogSink),
            progress: Arc::new(|| Box::new(TerminalProgress::new()) as Box<dyn ProgressDisplay>),
            cancel: CancellationToken::new(),
        })
    }

    pub fn with_sink(mut self, sink: Arc<dyn OutputSink>) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_progress(mut self, progress: ProgressFactory) -> Self {
        self.progress = progress;
        self
    }

    /// Abort in-flight operations when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    /// Stash a per-connection hint for callers. The transport never reads it.
    pub fn set_property(&mut self, key: &str, value: &str) {
        self.properties.insert(key.to_string(), value.to_string());
    }

    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Dial and authenticate. A no-op when already connected.
    pub async fn connect(&mut self) -> Result<()> {
        self.guard().run(self.establish()).await
    }

    /// Open a new channel, connecting first if needed. The caller owns the
    /// channel and must close it.
    pub async fn new_session(&mut self) -> Result<Box<dyn Channel>> {
        self.guard().run(self.open_session()).await
    }

    /// Tear down the connection. A no-op when never connected.
    pub async fn close(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        if let Some(handle) = self.handle.take() {
            handle.close().await.map_err(Error::Close)?;
        }
        log::info!("SSH disconnected from {}", self.config.address());
        Ok(())
    }

    async fn establish(&mut self) -> Result<()> {
        if self.connected {
            return Ok(());
        }
        let handle = self
            .transport
            .dial(&self.config, &self.credential)
            .await
            .map_err(|source| Error::Connect {
                host: self.config.hostname.clone(),
                source,
            })?;
        self.handle = Some(handle);
        self.connected = true;
        log::info!("SSH connected to {}", self.config.address());
        Ok(())
    }

    pub(crate) async fn open_session(&mut self) -> Result<Box<dyn Channel>> {
        self.establish()
            .await
            .map_err(|e| Error::Session(anyhow::Error::new(e)))?;
        let handle = self
            .handle
            .as_ref()
            .ok_or_else(|| Error::Session(anyhow::anyhow!("not connected")))?;
        let mut channel = handle.open_channel().await.map_err(|e| {
            Error::Session(e.context(format!(
                "failed to create SSH session for {}",
                self.config.hostname
            )))
        })?;
        if self.credential.is_agent() {
            if let Err(e) = channel.request_agent_forwarding().await {
                log::warn!("Agent forwarding request failed: {}", e);
            }
        }
        Ok(channel)
    }

    pub(crate) fn sink(&self) -> Arc<dyn OutputSink> {
        self.sink.clone()
    }

    pub(crate) fn progress_display(&self) -> Box<dyn ProgressDisplay> {
        (self.progress)()
    }

    /// A guard whose deadline starts now. One guard covers every stage of
    /// an operation.
    pub(crate) fn guard(&self) -> Guard {
        Guard {
            cancel: self.cancel.clone(),
            deadline: self.config.operation_timeout().map(|d| Instant::now() + d),
        }
    }
}

/// Close a channel after use. Failures are logged, never returned.
pub(crate) async fn release(mut channel: Box<dyn Channel>) {
    if let Err(e) = channel.close().await {
        log::warn!("Failed to close session: {}", e);
    }
}

/// Races an operation against the client's cancellation token and deadline.
pub(crate) struct Guard {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl Guard {
    pub(crate) async fn run<T, F>(&self, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = self.deadline;
        let bounded = async move {
            match deadline {
                Some(at) => tokio::time::timeout_at(at, fut)
                    .await
                    .map_err(|_| Error::Timeout)?,
                None => fut.await,
            }
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = bounded => result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_guard_passes_result_through() {
        let guard = Guard {
            cancel: CancellationToken::new(),
            deadline: None,
        };
        assert_eq!(guard.run(async { Ok(7) }).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn test_guard_deadline() {
        let guard = Guard {
            cancel: CancellationToken::new(),
            deadline: Some(Instant::now() + Duration::from_millis(20)),
        };
        let result: Result<()> = guard
            .run(async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(Error::Timeout)));
    }

    #[tokio::test]
    async fn test_guard_cancelled() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let guard = Guard {
            cancel,
            deadline: None,
        };
        let result = guard.run(async { Ok(()) }).await;
        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[test]
    fn test_properties() {
        let config = ConnectionConfig::with_password("localhost", 22, "testuser", "testpass");
        let mut client = Client::new(config).unwrap();
        client.set_property("PubkeyAuthentication", "no");
        assert_eq!(client.property("PubkeyAuthentication"), Some("no"));
        assert_eq!(client.property("missing"), None);
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn test_close_without_connection() {
        let config = ConnectionConfig::with_password("localhost", 22, "testuser", "testpass");
        let mut client = Client::new(config).unwrap();
        client.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_unreachable_host() {
        let mut config = ConnectionConfig::with_password("127.0.0.1", 1, "testuser", "testpass");
        config.connect_timeout_secs = 1;
        let mut client = Client::new(config).unwrap();
        assert!(matches!(client.connect().await, Err(Error::Connect { .. })));
        assert!(!client.is_connected());
    }
}
