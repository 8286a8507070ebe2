//! Error taxonomy for connection, execution and transfer failures.

use std::fmt;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// How a remote process ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ExitStatus {
    Code(u32),
    Signal {
        name: String,
        core_dumped: bool,
        message: String,
    },
    /// The channel closed without reporting an exit status.
    Missing,
}

impl ExitStatus {
    pub fn success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }

    pub fn code(&self) -> Option<u32> {
        match self {
            ExitStatus::Code(code) => Some(*code),
            _ => None,
        }
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Code(code) => write!(f, "process exited with status {}", code),
            ExitStatus::Signal { name, message, .. } if message.is_empty() => {
                write!(f, "process killed by signal {}", name)
            }
            ExitStatus::Signal { name, message, .. } => {
                write!(f, "process killed by signal {}: {}", name, message)
            }
            ExitStatus::Missing => f.write_str("process exited without reporting a status"),
        }
    }
}

/// Phase of an upload in which a failure happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UploadPhase {
    Prepare,
    Open,
    Stat,
    Session,
    Stdin,
    Stdout,
    Start,
    Write,
    Wait,
}

impl fmt::Display for UploadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            UploadPhase::Prepare => "failed to prepare upload",
            UploadPhase::Open => "failed to open local file",
            UploadPhase::Stat => "failed to stat the local file",
            UploadPhase::Session => "failed to create session",
            UploadPhase::Stdin => "failed to create stdin pipe",
            UploadPhase::Stdout => "failed to create stdout pipe",
            UploadPhase::Start => "failed to start session",
            UploadPhase::Write => "failed to copy io",
            UploadPhase::Wait => "error on session wait",
        };
        f.write_str(s)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid config: {0}")]
    Config(String),

    #[error("failed to connect to {host}: {source}")]
    Connect {
        host: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("create session: {0}")]
    Session(#[source] anyhow::Error),

    #[error("failed to request pty: {0}")]
    Pty(#[source] anyhow::Error),

    #[error("{stream} pipe: {source}")]
    Stream {
        stream: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("session start: {0}")]
    Start(#[source] anyhow::Error),

    #[error("session wait: {0}")]
    Wait(#[source] anyhow::Error),

    #[error("session wait: {0}")]
    Exit(ExitStatus),

    #[error("scan output: {0}")]
    Scan(#[source] std::io::Error),

    #[error("invalid prompt pattern {pattern:?}: {source}")]
    Prompt {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    #[error("{phase}: {source}")]
    Upload {
        phase: UploadPhase,
        #[source]
        source: anyhow::Error,
    },

    #[error("failed to close SSH connection: {0}")]
    Close(#[source] anyhow::Error),

    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out")]
    Timeout,
}

impl Error {
    pub(crate) fn upload(phase: UploadPhase, source: impl Into<anyhow::Error>) -> Self {
        Error::Upload {
            phase,
            source: source.into(),
        }
    }

    /// Phase tag for upload failures.
    pub fn upload_phase(&self) -> Option<UploadPhase> {
        match self {
            Error::Upload { phase, .. } => Some(*phase),
            _ => None,
        }
    }
}
