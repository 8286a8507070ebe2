//! Connection descriptor and credential resolution.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;

const DEFAULT_PORT: u16 = 22;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 30;

/// SSH connection configuration.
///
/// Field names follow the JSON layout used by existing deployment configs.
/// Empty strings are treated as "not set".
#[derive(Clone, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub hostname: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub username: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub password: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key_filename: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub private_key_passphrase: String,
    #[serde(default)]
    pub use_agent: bool,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation_timeout_secs: Option<u64>,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_connect_timeout() -> u64 {
    DEFAULT_CONNECT_TIMEOUT_SECS
}

/// How the client proves its identity to the remote host.
#[derive(Clone)]
pub enum Credential {
    Password(String),
    /// Private key material (OpenSSH or PEM text) with an optional passphrase.
    PrivateKey {
        key: String,
        passphrase: Option<String>,
    },
    /// Signers offered by the agent behind `$SSH_AUTH_SOCK`, forwarded to the remote.
    Agent,
}

impl Credential {
    pub fn is_agent(&self) -> bool {
        matches!(self, Credential::Agent)
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::Password(_) => f.write_str("Password(***)"),
            Credential::PrivateKey { passphrase, .. } => f
                .debug_struct("PrivateKey")
                .field("key", &"***")
                .field("passphrase", &passphrase.as_ref().map(|_| "***"))
                .finish(),
            Credential::Agent => f.write_str("Agent"),
        }
    }
}

impl ConnectionConfig {
    fn base(hostname: &str, port: u16, username: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            port,
            username: username.to_string(),
            password: String::new(),
            private_key_filename: String::new(),
            private_key_passphrase: String::new(),
            use_agent: false,
            connect_timeout_secs: DEFAULT_CONNECT_TIMEOUT_SECS,
            operation_timeout_secs: None,
        }
    }

    pub fn with_password(hostname: &str, port: u16, username: &str, password: &str) -> Self {
        Self {
            password: password.to_string(),
            ..Self::base(hostname, port, username)
        }
    }

    pub fn with_private_key(
        hostname: &str,
        port: u16,
        username: &str,
        key_file: impl AsRef<Path>,
        passphrase: Option<&str>,
    ) -> Self {
        Self {
            private_key_filename: key_file.as_ref().to_string_lossy().into_owned(),
            private_key_passphrase: passphrase.unwrap_or_default().to_string(),
            ..Self::base(hostname, port, username)
        }
    }

    pub fn with_agent(hostname: &str, port: u16, username: &str) -> Self {
        Self {
            use_agent: true,
            ..Self::base(hostname, port, username)
        }
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| Error::Config(format!("parse config: {}", e)))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("read {}: {}", path.display(), e)))?;
        Self::from_json_str(&data)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.hostname, self.port)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn operation_timeout(&self) -> Option<Duration> {
        self.operation_timeout_secs.map(Duration::from_secs)
    }

    /// Resolve the single credential this config describes.
    ///
    /// Precedence is agent, then private key, then password. A key file is
    /// read here; parsing is left to the transport.
    pub fn credential(&self) -> Result<Credential> {
        if self.hostname.is_empty() {
            return Err(Error::Config("hostname is empty".to_string()));
        }
        if self.use_agent {
            return Ok(Credential::Agent);
        }
        if !self.private_key_filename.is_empty() {
            let key = std::fs::read_to_string(&self.private_key_filename).map_err(|e| {
                Error::Config(format!(
                    "read private key {}: {}",
                    self.private_key_filename, e
                ))
            })?;
            let passphrase = if self.private_key_passphrase.is_empty() {
                None
            } else {
                Some(self.private_key_passphrase.clone())
            };
            return Ok(Credential::PrivateKey { key, passphrase });
        }
        if !self.password.is_empty() {
            return Ok(Credential::Password(self.password.clone()));
        }
        Err(Error::Config(
            "both password and private key are empty".to_string(),
        ))
    }
}

impl fmt::Debug for ConnectionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionConfig")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &(!self.password.is_empty()).then_some("***"))
            .field("private_key_filename", &self.private_key_filename)
            .field("use_agent", &self.use_agent)
            .field("connect_timeout_secs", &self.connect_timeout_secs)
            .field("operation_timeout_secs", &self.operation_timeout_secs)
            .finish()
    }
}
