//! [`Transport`] implementation on top of `russh`.
//!
//! Each channel's messages are pumped by a background task once the command
//! starts: stdout/stderr data is written into in-memory pipes handed to the
//! caller, and bytes written to the stdin pipe are forwarded as channel data.
//! The pump owns the russh channel from then on, so closing a started
//! channel is a request to the pump.

use super::{BoxReader, BoxWriter, Channel, Transport, TransportHandle};
use crate::config::{ConnectionConfig, Credential};
use crate::error::ExitStatus;
use crate::pty::PtyRequest;
use async_trait::async_trait;
use russh::client::{self, Msg};
use russh::keys::{decode_secret_key, ssh_key, PrivateKeyWithHashAlg};
use russh::{ChannelMsg, Disconnect, Pty};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

const PIPE_BUFFER: usize = 64 * 1024;

/// How long `close` waits for the pump to send CLOSE before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Dials real SSH servers.
#[derive(Clone, Debug, Default)]
pub struct RusshTransport;

/// Minimal SSH client handler.
struct ClientHandler {
    forward_agent: bool,
}

impl client::Handler for ClientHandler {
    type Error = anyhow::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &ssh_key::PublicKey,
    ) -> Result<bool, Self::Error> {
        // TODO: verify against known_hosts once callers can supply a hosts file
        log::warn!(
            "Accepting server key {} without verification",
            server_public_key.fingerprint(ssh_key::HashAlg::Sha256)
        );
        Ok(true)
    }

    async fn server_channel_open_agent_forward(
        &mut self,
        channel: russh::Channel<Msg>,
        _session: &mut client::Session,
    ) -> Result<(), Self::Error> {
        if !self.forward_agent {
            log::warn!("Ignoring agent forward channel: forwarding not requested");
            return Ok(());
        }
        tokio::spawn(async move {
            if let Err(e) = bridge_agent(channel).await {
                log::warn!("Agent forward channel failed: {}", e);
            }
        });
        Ok(())
    }
}

#[cfg(unix)]
async fn bridge_agent(channel: russh::Channel<Msg>) -> anyhow::Result<()> {
    let socket = std::env::var("SSH_AUTH_SOCK")?;
    let mut agent = tokio::net::UnixStream::connect(socket).await?;
    let mut stream = channel.into_stream();
    tokio::io::copy_bidirectional(&mut stream, &mut agent).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn bridge_agent(_channel: russh::Channel<Msg>) -> anyhow::Result<()> {
    Err(anyhow::anyhow!("agent forwarding is only supported on unix"))
}

#[async_trait]
impl Transport for RusshTransport {
    async fn dial(
        &self,
        config: &ConnectionConfig,
        credential: &Credential,
    ) -> anyhow::Result<Box<dyn TransportHandle>> {
        let timeout = config.connect_timeout();
        let handle = tokio::time::timeout(timeout, connect(config, credential))
            .await
            .map_err(|_| anyhow::anyhow!("timed out after {:?}", timeout))??;
        Ok(Box::new(RusshHandle { handle }))
    }
}

async fn connect(
    config: &ConnectionConfig,
    credential: &Credential,
) -> anyhow::Result<client::Handle<ClientHandler>> {
    let ssh_config = client::Config::default();
    let handler = ClientHandler {
        forward_agent: credential.is_agent(),
    };

    let mut session = client::connect(
        Arc::new(ssh_config),
        (config.hostname.as_str(), config.port),
        handler,
    )
    .await?;

    let user = config.username.as_str();
    let success = match credential {
        Credential::Password(password) => session
            .authenticate_password(user, password)
            .await?
            .success(),
        Credential::PrivateKey { key, passphrase } => {
            let key_pair = decode_secret_key(key, passphrase.as_deref())?;
            let hash_alg = session.best_supported_rsa_hash().await?.flatten();
            let pk = PrivateKeyWithHashAlg::new(Arc::new(key_pair), hash_alg);
            session.authenticate_publickey(user, pk).await?.success()
        }
        Credential::Agent => authenticate_with_agent(&mut session, user).await?,
    };

    if !success {
        return Err(anyhow::anyhow!("SSH authentication failed"));
    }
    Ok(session)
}

#[cfg(unix)]
async fn authenticate_with_agent(
    session: &mut client::Handle<ClientHandler>,
    user: &str,
) -> anyhow::Result<bool> {
    let mut agent = russh::keys::agent::client::AgentClient::connect_env().await?;
    let identities = agent.request_identities().await?;
    if identities.is_empty() {
        return Err(anyhow::anyhow!("no identities available in SSH agent"));
    }

    for identity in identities {
        let hash_alg = session.best_supported_rsa_hash().await?.flatten();
        match session
            .authenticate_publickey_with(user, identity, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => {}
            Err(e) => log::debug!("Agent identity rejected: {}", e),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn authenticate_with_agent(
    _session: &mut client::Handle<ClientHandler>,
    _user: &str,
) -> anyhow::Result<bool> {
    Err(anyhow::anyhow!("SSH agent auth is only supported on unix"))
}

struct RusshHandle {
    handle: client::Handle<ClientHandler>,
}

#[async_trait]
impl TransportHandle for RusshHandle {
    async fn open_channel(&self) -> anyhow::Result<Box<dyn Channel>> {
        let channel = self.handle.channel_open_session().await?;
        Ok(Box::new(RusshChannel::new(channel)))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.handle
            .disconnect(Disconnect::ByApplication, "", "en")
            .await?;
        Ok(())
    }
}

fn pty_modes(pty: &PtyRequest) -> [(Pty, u32); 3] {
    [
        (Pty::ECHO, u32::from(pty.echo)),
        (Pty::TTY_OP_ISPEED, pty.input_speed),
        (Pty::TTY_OP_OSPEED, pty.output_speed),
    ]
}

/// A session channel whose stdio is exposed as in-memory pipes.
pub struct RusshChannel {
    channel: Option<russh::Channel<Msg>>,
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    stdin_taken: bool,
    stdout_taken: bool,
    stderr_taken: bool,
    pump: Option<JoinHandle<anyhow::Result<ExitStatus>>>,
    /// Dropping or firing this makes the pump send CLOSE and stop.
    closer: Option<oneshot::Sender<()>>,
}

impl RusshChannel {
    fn new(channel: russh::Channel<Msg>) -> Self {
        Self {
            channel: Some(channel),
            stdin: None,
            stdout: None,
            stderr: None,
            stdin_taken: false,
            stdout_taken: false,
            stderr_taken: false,
            pump: None,
            closer: None,
        }
    }

    fn unstarted(&mut self) -> anyhow::Result<&mut russh::Channel<Msg>> {
        self.channel
            .as_mut()
            .ok_or_else(|| anyhow::anyhow!("command already started"))
    }

    fn pipe(&self, taken: bool) -> anyhow::Result<(DuplexStream, DuplexStream)> {
        if taken {
            return Err(anyhow::anyhow!("already taken"));
        }
        if self.channel.is_none() {
            return Err(anyhow::anyhow!("command already started"));
        }
        Ok(tokio::io::duplex(PIPE_BUFFER))
    }
}

/// Wait for the reply to a `want_reply` request. Messages that arrive
/// before the reply are returned so they can be replayed by the pump.
async fn expect_reply(channel: &mut russh::Channel<Msg>) -> anyhow::Result<Vec<ChannelMsg>> {
    let mut early = Vec::new();
    loop {
        match channel.wait().await {
            Some(ChannelMsg::Success) => return Ok(early),
            Some(ChannelMsg::Failure) => return Err(anyhow::anyhow!("request rejected by remote")),
            Some(ChannelMsg::Close) | None => {
                return Err(anyhow::anyhow!("channel closed before reply"))
            }
            Some(msg) => early.push(msg),
        }
    }
}

#[async_trait]
impl Channel for RusshChannel {
    async fn request_agent_forwarding(&mut self) -> anyhow::Result<()> {
        self.unstarted()?.agent_forward(false).await?;
        Ok(())
    }

    async fn request_pty(&mut self, pty: &PtyRequest) -> anyhow::Result<()> {
        let channel = self.unstarted()?;
        channel
            .request_pty(true, &pty.term, pty.cols, pty.rows, 0, 0, &pty_modes(pty))
            .await?;
        let early = expect_reply(channel).await?;
        if !early.is_empty() {
            log::debug!("Discarding {} messages received before pty reply", early.len());
        }
        Ok(())
    }

    fn take_stdin(&mut self) -> anyhow::Result<BoxWriter> {
        let (caller, pump) = self.pipe(self.stdin_taken)?;
        self.stdin_taken = true;
        self.stdin = Some(pump);
        Ok(Box::new(caller))
    }

    fn take_stdout(&mut self) -> anyhow::Result<BoxReader> {
        let (caller, pump) = self.pipe(self.stdout_taken)?;
        self.stdout_taken = true;
        self.stdout = Some(pump);
        Ok(Box::new(caller))
    }

    fn take_stderr(&mut self) -> anyhow::Result<BoxReader> {
        let (caller, pump) = self.pipe(self.stderr_taken)?;
        self.stderr_taken = true;
        self.stderr = Some(pump);
        Ok(Box::new(caller))
    }

    async fn exec(&mut self, command: &str) -> anyhow::Result<()> {
        let channel = self.unstarted()?;
        channel.exec(true, command).await?;
        let early = expect_reply(channel).await?;

        let channel = self
            .channel
            .take()
            .ok_or_else(|| anyhow::anyhow!("command already started"))?;
        let pipes = Pipes {
            stdout: self.stdout.take(),
            stderr: self.stderr.take(),
            status: None,
        };
        let stdin = self.stdin.take();
        let (closer, close_rx) = oneshot::channel();
        self.closer = Some(closer);
        self.pump = Some(tokio::spawn(pump(channel, stdin, pipes, early, close_rx)));
        Ok(())
    }

    async fn wait(&mut self) -> anyhow::Result<ExitStatus> {
        // The handle stays in place while awaiting so a cancelled wait
        // still leaves the pump reachable from `close`.
        let result = match self.pump.as_mut() {
            Some(pump) => pump.await,
            None if self.channel.is_some() => return Err(anyhow::anyhow!("command not started")),
            None => return Err(anyhow::anyhow!("command already waited on")),
        };
        self.pump = None;
        result?
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        if let Some(closer) = self.closer.take() {
            // Fails only when the pump already finished.
            let _ = closer.send(());
        }
        if let Some(mut pump) = self.pump.take() {
            if tokio::time::timeout(CLOSE_GRACE, &mut pump).await.is_err() {
                log::warn!("Channel pump did not stop within {:?}", CLOSE_GRACE);
                pump.abort();
            }
        }
        if let Some(channel) = self.channel.take() {
            channel.close().await?;
        }
        Ok(())
    }
}

struct Pipes {
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    status: Option<ExitStatus>,
}

impl Pipes {
    async fn forward(pipe: &mut Option<DuplexStream>, data: &[u8]) {
        if let Some(writer) = pipe {
            // Reader went away; keep pumping so the exit status still arrives.
            if writer.write_all(data).await.is_err() {
                *pipe = None;
            }
        }
    }

    /// Returns false once the channel is closed.
    async fn handle(&mut self, msg: ChannelMsg) -> bool {
        match msg {
            ChannelMsg::Data { data } => Self::forward(&mut self.stdout, &data).await,
            ChannelMsg::ExtendedData { data, ext: 1 } => {
                Self::forward(&mut self.stderr, &data).await
            }
            ChannelMsg::ExitStatus { exit_status } => {
                self.status = Some(ExitStatus::Code(exit_status));
            }
            ChannelMsg::ExitSignal {
                signal_name,
                core_dumped,
                error_message,
                ..
            } => {
                self.status = Some(ExitStatus::Signal {
                    name: format!("{:?}", signal_name),
                    core_dumped,
                    message: error_message,
                });
            }
            ChannelMsg::Eof => {
                self.stdout = None;
                self.stderr = None;
            }
            ChannelMsg::Close => return false,
            _ => {}
        }
        true
    }
}

async fn read_stdin(stdin: Option<&mut DuplexStream>, buf: &mut [u8]) -> std::io::Result<usize> {
    match stdin {
        Some(stdin) => stdin.read(buf).await,
        None => Ok(0),
    }
}

async fn pump(
    mut channel: russh::Channel<Msg>,
    mut stdin: Option<DuplexStream>,
    mut pipes: Pipes,
    early: Vec<ChannelMsg>,
    mut close_rx: oneshot::Receiver<()>,
) -> anyhow::Result<ExitStatus> {
    let mut open = true;
    for msg in early {
        open = pipes.handle(msg).await && open;
    }

    let mut stdin_open = true;
    let mut buf = vec![0u8; PIPE_BUFFER];
    while open {
        tokio::select! {
            r = read_stdin(stdin.as_mut(), &mut buf), if stdin_open => {
                match r {
                    Ok(0) => {
                        stdin_open = false;
                        stdin = None;
                        channel.eof().await?;
                    }
                    Ok(n) => channel.data(&buf[..n]).await?,
                    Err(e) => {
                        log::warn!("stdin pipe failed: {}", e);
                        stdin_open = false;
                        stdin = None;
                        channel.eof().await?;
                    }
                }
            }
            msg = channel.wait() => {
                open = match msg {
                    Some(msg) => pipes.handle(msg).await,
                    None => false,
                };
            }
            // Either an explicit close or the owning channel was dropped.
            _ = &mut close_rx => {
                log::debug!("Closing channel with the remote command still running");
                channel.close().await?;
                break;
            }
        }
    }

    Ok(pipes.status.take().unwrap_or(ExitStatus::Missing))
}
