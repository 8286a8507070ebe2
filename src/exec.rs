//! Remote command execution.

use crate::client::{release, Client};
use crate::drain::spawn_drain;
use crate::error::{Error, ExitStatus, Result};
use crate::prompt::{answer_prompts, Prompt, PromptMap};
use crate::pty::PtyRequest;
use crate::sink::OutputSink;
use crate::transport::{BoxReader, Channel};
use std::io;
use std::sync::Arc;
use std::time::Instant;
use tokio::io::AsyncReadExt;
use tokio::task::JoinHandle;

const CAPTURE_CHUNK: usize = 8192;

/// A command to run, optionally answering prompts it prints.
#[derive(Clone, Debug, Default)]
pub struct ExecutionRequest {
    pub command: String,
    pub prompts: Option<PromptMap>,
}

impl ExecutionRequest {
    pub fn new(command: &str) -> Self {
        Self {
            command: command.to_string(),
            prompts: None,
        }
    }

    pub fn with_prompts(mut self, prompts: PromptMap) -> Self {
        self.prompts = Some(prompts);
        self
    }
}

impl Client {
    /// Run `request` interactively when it carries prompts, plainly otherwise.
    pub async fn run(&mut self, request: &ExecutionRequest) -> Result<()> {
        match &request.prompts {
            Some(prompts) => self.execute_interactively(&request.command, prompts).await,
            None => self.execute(&request.command).await,
        }
    }

    /// Run `command`, streaming stdout lines to the sink's `info` channel and
    /// stderr lines to `warn`. Returns once the command exited zero and both
    /// streams are fully drained.
    pub async fn execute(&mut self, command: &str) -> Result<()> {
        let sink = self.sink();
        let start = Instant::now();
        sink.started(command);
        let result = self.execute_session(command).await;
        sink.finished(command, start.elapsed(), result.is_ok());
        result
    }

    /// Run `command` to completion and return its combined stdout and stderr
    /// with surrounding whitespace trimmed.
    pub async fn capture(&mut self, command: &str) -> Result<String> {
        let guard = self.guard();
        let mut channel = guard.run(self.open_session()).await?;
        let result = guard.run(run_captured(channel.as_mut(), command)).await;
        release(channel).await;
        result
    }

    /// Run `command` on a pseudo-terminal, answering prompts from `prompts`
    /// as they appear on stdout.
    pub async fn execute_interactively(&mut self, command: &str, prompts: &PromptMap) -> Result<()> {
        let prompts = prompts.compile()?;
        let sink = self.sink();
        let start = Instant::now();
        sink.started(command);
        let result = self.interactive_session(command, &prompts).await;
        if let Err(e) = &result {
            sink.error(&e.to_string());
        }
        sink.finished(command, start.elapsed(), result.is_ok());
        result
    }

    // The channel is released on every outcome, including cancellation and
    // deadline expiry of the guarded body.
    async fn execute_session(&mut self, command: &str) -> Result<()> {
        let guard = self.guard();
        let mut channel = guard.run(self.open_session()).await?;
        let result = guard
            .run(run_streamed(channel.as_mut(), command, self.sink()))
            .await;
        release(channel).await;
        result
    }

    async fn interactive_session(&mut self, command: &str, prompts: &[Prompt]) -> Result<()> {
        let guard = self.guard();
        let mut channel = guard.run(self.open_session()).await?;
        let result = guard
            .run(run_interactive(channel.as_mut(), command, prompts, self.sink()))
            .await;
        release(channel).await;
        result
    }
}

fn stdout_of(channel: &mut dyn Channel) -> Result<BoxReader> {
    channel.take_stdout().map_err(|source| Error::Stream {
        stream: "stdout",
        source,
    })
}

fn stderr_of(channel: &mut dyn Channel) -> Result<BoxReader> {
    channel.take_stderr().map_err(|source| Error::Stream {
        stream: "stderr",
        source,
    })
}

fn check_exit(status: anyhow::Result<ExitStatus>) -> Result<()> {
    match status {
        Ok(status) if status.success() => Ok(()),
        Ok(status) => Err(Error::Exit(status)),
        Err(e) => Err(Error::Wait(e)),
    }
}

async fn join_drains(drains: Vec<JoinHandle<()>>) {
    for drain in drains {
        if let Err(e) = drain.await {
            log::warn!("Output drain task failed: {}", e);
        }
    }
}

fn abort_drains(drains: &[JoinHandle<()>]) {
    for drain in drains {
        drain.abort();
    }
}

async fn run_streamed(
    channel: &mut dyn Channel,
    command: &str,
    sink: Arc<dyn OutputSink>,
) -> Result<()> {
    let stdout = stdout_of(channel)?;
    let stderr = stderr_of(channel)?;

    let drains = vec![
        spawn_drain(stdout, sink.clone(), |s, line| s.info(line)),
        spawn_drain(stderr, sink, |s, line| s.warn(line)),
    ];

    if let Err(e) = channel.exec(command).await {
        abort_drains(&drains);
        return Err(Error::Start(e));
    }

    let status = channel.wait().await;
    join_drains(drains).await;
    check_exit(status)
}

async fn run_captured(channel: &mut dyn Channel, command: &str) -> Result<String> {
    let mut stdout = stdout_of(channel)?;
    let mut stderr = stderr_of(channel)?;

    channel.exec(command).await.map_err(Error::Start)?;

    let mut combined = Vec::new();
    read_combined(&mut stdout, &mut stderr, &mut combined)
        .await
        .map_err(Error::Scan)?;

    check_exit(channel.wait().await)?;
    Ok(String::from_utf8_lossy(&combined).trim().to_string())
}

/// Interleave both streams into `out` in arrival order.
async fn read_combined(
    stdout: &mut BoxReader,
    stderr: &mut BoxReader,
    out: &mut Vec<u8>,
) -> io::Result<()> {
    let mut out_buf = vec![0u8; CAPTURE_CHUNK];
    let mut err_buf = vec![0u8; CAPTURE_CHUNK];
    let mut out_open = true;
    let mut err_open = true;

    while out_open || err_open {
        tokio::select! {
            r = stdout.read(&mut out_buf), if out_open => match r? {
                0 => out_open = false,
                n => out.extend_from_slice(&out_buf[..n]),
            },
            r = stderr.read(&mut err_buf), if err_open => match r? {
                0 => err_open = false,
                n => out.extend_from_slice(&err_buf[..n]),
            },
        }
    }
    Ok(())
}

async fn run_interactive(
    channel: &mut dyn Channel,
    command: &str,
    prompts: &[Prompt],
    sink: Arc<dyn OutputSink>,
) -> Result<()> {
    channel
        .request_pty(&PtyRequest::interactive())
        .await
        .map_err(Error::Pty)?;

    let stdin = channel.take_stdin().map_err(|source| Error::Stream {
        stream: "stdin",
        source,
    })?;
    let stdout = stdout_of(channel)?;
    let stderr = stderr_of(channel)?;

    let drains = vec![spawn_drain(stderr, sink.clone(), |s, line| s.warn(line))];

    if let Err(e) = channel.exec(command).await {
        abort_drains(&drains);
        return Err(Error::Start(e));
    }

    if let Err(e) = answer_prompts(stdout, stdin, prompts, sink.as_ref()).await {
        abort_drains(&drains);
        return Err(Error::Scan(e));
    }

    let status = channel.wait().await;
    join_drains(drains).await;
    check_exit(status)
}
