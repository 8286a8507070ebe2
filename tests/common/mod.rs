//! Scriptable in-memory transport for driving `Client` without a server.

#![allow(dead_code)]

use async_trait::async_trait;
use sshkit::config::{ConnectionConfig, Credential};
use sshkit::transport::{BoxReader, BoxWriter, Channel, Transport, TransportHandle};
use sshkit::{Client, ExitStatus, MemorySink, PtyRequest};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// One thing the fake remote command does, in order.
#[derive(Clone, Debug)]
pub enum Step {
    Stdout(Vec<u8>),
    Stderr(Vec<u8>),
    Sleep(Duration),
    /// Block until stdin has received at least this many bytes in total.
    AwaitStdin(usize),
    /// Block until the client closes stdin.
    AwaitStdinEof,
}

#[derive(Clone, Debug)]
pub struct Script {
    pub steps: Vec<Step>,
    pub exit: Result<ExitStatus, String>,
    /// Report the exit status immediately; steps keep running afterwards.
    pub exit_early: bool,
    pub fail_exec: Option<String>,
    pub fail_pty: Option<String>,
    pub fail_stdout: Option<String>,
}

impl Script {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps,
            exit: Ok(ExitStatus::Code(0)),
            exit_early: false,
            fail_exec: None,
            fail_pty: None,
            fail_stdout: None,
        }
    }

    pub fn exit(mut self, status: ExitStatus) -> Self {
        self.exit = Ok(status);
        self
    }

    pub fn wait_error(mut self, message: &str) -> Self {
        self.exit = Err(message.to_string());
        self
    }

    pub fn exit_early(mut self) -> Self {
        self.exit_early = true;
        self
    }

    pub fn fail_exec(mut self, message: &str) -> Self {
        self.fail_exec = Some(message.to_string());
        self
    }

    pub fn fail_pty(mut self, message: &str) -> Self {
        self.fail_pty = Some(message.to_string());
        self
    }

    pub fn fail_stdout(mut self, message: &str) -> Self {
        self.fail_stdout = Some(message.to_string());
        self
    }
}

pub fn stdout(text: &str) -> Step {
    Step::Stdout(text.as_bytes().to_vec())
}

pub fn stderr(text: &str) -> Step {
    Step::Stderr(text.as_bytes().to_vec())
}

/// Everything the fake observed.
#[derive(Default)]
pub struct Record {
    pub dials: AtomicUsize,
    pub closes: AtomicUsize,
    pub channels_opened: AtomicUsize,
    pub channels_closed: AtomicUsize,
    pub agent_requests: AtomicUsize,
    pub commands: Mutex<Vec<String>>,
    pub ptys: Mutex<Vec<PtyRequest>>,
    pub stdin: Mutex<Vec<u8>>,
}

impl Record {
    pub fn dials(&self) -> usize {
        self.dials.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    pub fn stdin(&self) -> Vec<u8> {
        self.stdin.lock().unwrap().clone()
    }

    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn channels_opened(&self) -> usize {
        self.channels_opened.load(Ordering::SeqCst)
    }

    pub fn channels_closed(&self) -> usize {
        self.channels_closed.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
pub struct FakeTransport {
    pub record: Arc<Record>,
    pub fail_dial: Option<String>,
    pub dial_delay: Option<Duration>,
    scripts: Mutex<VecDeque<Script>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(self, script: Script) -> Self {
        self.scripts.lock().unwrap().push_back(script);
        self
    }

    pub fn with_dial_delay(mut self, delay: Duration) -> Self {
        self.dial_delay = Some(delay);
        self
    }

    pub fn failing(message: &str) -> Self {
        Self {
            fail_dial: Some(message.to_string()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn dial(
        &self,
        _config: &ConnectionConfig,
        _credential: &Credential,
    ) -> anyhow::Result<Box<dyn TransportHandle>> {
        self.record.dials.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.dial_delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(message) = &self.fail_dial {
            return Err(anyhow::anyhow!(message.clone()));
        }
        let scripts = self.scripts.lock().unwrap().drain(..).collect();
        Ok(Box::new(FakeHandle {
            record: self.record.clone(),
            scripts: Mutex::new(scripts),
        }))
    }
}

struct FakeHandle {
    record: Arc<Record>,
    scripts: Mutex<VecDeque<Script>>,
}

#[async_trait]
impl TransportHandle for FakeHandle {
    async fn open_channel(&self) -> anyhow::Result<Box<dyn Channel>> {
        self.record.channels_opened.fetch_add(1, Ordering::SeqCst);
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::new(Vec::new()));
        Ok(Box::new(FakeChannel {
            record: self.record.clone(),
            script: Some(script),
            stdin: None,
            stdout: None,
            stderr: None,
            run: None,
            exit: None,
        }))
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.record.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FakeChannel {
    record: Arc<Record>,
    script: Option<Script>,
    stdin: Option<DuplexStream>,
    stdout: Option<DuplexStream>,
    stderr: Option<DuplexStream>,
    run: Option<JoinHandle<()>>,
    exit: Option<Result<ExitStatus, String>>,
}

fn pipe(slot: &mut Option<DuplexStream>) -> anyhow::Result<DuplexStream> {
    if slot.is_some() {
        return Err(anyhow::anyhow!("already taken"));
    }
    let (caller, remote) = tokio::io::duplex(64 * 1024);
    *slot = Some(remote);
    Ok(caller)
}

#[async_trait]
impl Channel for FakeChannel {
    async fn request_agent_forwarding(&mut self) -> anyhow::Result<()> {
        self.record.agent_requests.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn request_pty(&mut self, pty: &PtyRequest) -> anyhow::Result<()> {
        self.record.ptys.lock().unwrap().push(pty.clone());
        match self.script.as_ref().and_then(|s| s.fail_pty.clone()) {
            Some(message) => Err(anyhow::anyhow!(message)),
            None => Ok(()),
        }
    }

    fn take_stdin(&mut self) -> anyhow::Result<BoxWriter> {
        Ok(Box::new(pipe(&mut self.stdin)?))
    }

    fn take_stdout(&mut self) -> anyhow::Result<BoxReader> {
        if let Some(message) = self.script.as_ref().and_then(|s| s.fail_stdout.clone()) {
            return Err(anyhow::anyhow!(message));
        }
        Ok(Box::new(pipe(&mut self.stdout)?))
    }

    fn take_stderr(&mut self) -> anyhow::Result<BoxReader> {
        Ok(Box::new(pipe(&mut self.stderr)?))
    }

    async fn exec(&mut self, command: &str) -> anyhow::Result<()> {
        self.record.commands.lock().unwrap().push(command.to_string());
        let script = self
            .script
            .take()
            .ok_or_else(|| anyhow::anyhow!("command already started"))?;
        if let Some(message) = script.fail_exec {
            return Err(anyhow::anyhow!(message));
        }

        let (len_tx, len_rx) = watch::channel((0usize, false));
        if let Some(mut stdin) = self.stdin.take() {
            let record = self.record.clone();
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    match stdin.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let total = {
                                let mut seen = record.stdin.lock().unwrap();
                                seen.extend_from_slice(&buf[..n]);
                                seen.len()
                            };
                            let _ = len_tx.send((total, false));
                        }
                    }
                }
                let total = record.stdin.lock().unwrap().len();
                let _ = len_tx.send((total, true));
            });
        } else {
            let _ = len_tx.send((0, true));
        }

        let mut out = self.stdout.take();
        let mut err = self.stderr.take();
        let steps = script.steps;
        self.exit = Some(script.exit);
        let early = script.exit_early;
        let run = tokio::spawn(async move {
            let mut len_rx = len_rx;
            for step in steps {
                match step {
                    Step::Stdout(bytes) => write_to(&mut out, &bytes).await,
                    Step::Stderr(bytes) => write_to(&mut err, &bytes).await,
                    Step::Sleep(delay) => tokio::time::sleep(delay).await,
                    Step::AwaitStdin(n) => {
                        let _ = len_rx.wait_for(|(len, eof)| *len >= n || *eof).await;
                    }
                    Step::AwaitStdinEof => {
                        let _ = len_rx.wait_for(|(_, eof)| *eof).await;
                    }
                }
            }
        });
        if early {
            // Exit reported now; output keeps flowing on the detached task.
            drop(run);
        } else {
            self.run = Some(run);
        }
        Ok(())
    }

    async fn wait(&mut self) -> anyhow::Result<ExitStatus> {
        if let Some(run) = self.run.take() {
            let _ = run.await;
        }
        match self.exit.take() {
            Some(Ok(status)) => Ok(status),
            Some(Err(message)) => Err(anyhow::anyhow!(message)),
            None => Err(anyhow::anyhow!("command not started")),
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.record.channels_closed.fetch_add(1, Ordering::SeqCst);
        if let Some(run) = self.run.take() {
            run.abort();
        }
        Ok(())
    }
}

async fn write_to(pipe: &mut Option<DuplexStream>, bytes: &[u8]) {
    if let Some(writer) = pipe {
        if writer.write_all(bytes).await.is_err() {
            *pipe = None;
        }
    }
}

pub fn password_config() -> ConnectionConfig {
    ConnectionConfig::with_password("fake.host", 22, "testuser", "testpass")
}

/// A client over `transport` recording output into the returned sink.
pub fn client_with(transport: Arc<FakeTransport>) -> (Client, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let client = Client::with_transport(password_config(), transport)
        .unwrap()
        .with_sink(sink.clone())
        .with_progress(Arc::new(|| {
            Box::new(sshkit::LogProgress) as Box<dyn sshkit::ProgressDisplay>
        }));
    (client, sink)
}

/// Cancel `client`'s token from a background task after `delay`.
pub fn cancel_after(client: &Client, delay: Duration) {
    let token = client.cancellation_token();
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        token.cancel();
    });
}
