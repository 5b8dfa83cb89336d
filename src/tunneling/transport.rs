use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

#[cfg(test)]
use mockall::automock;

use crate::{config::TunnelConfig, storage::StorageError};

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("cannot spawn `{binary}`: {source}")]
    Spawn {
        binary: String,
        source: std::io::Error,
    },
    #[error("io error: {1}")]
    Io(std::io::Error, String),
    #[error("ssh error: {0}")]
    Ssh(#[from] russh::Error),
    #[error("private key error: {1}")]
    PrivateKey(russh::keys::Error, String),
    #[error("relay rejected authentication for {0}")]
    AuthRejected(String),
    #[error("relay refused to forward port {0}")]
    ForwardRefused(u16),
    #[error("host key for {0} has changed!")]
    NastyKey(String),
    #[error("host key for {0} is not known and the policy is strict")]
    UnknownKey(String),
    #[error("storage layer error: {0}")]
    StorageLayer(String),
}
impl From<std::io::Error> for TransportError {
    fn from(value: std::io::Error) -> Self {
        let str = value.to_string();
        Self::Io(value, str)
    }
}
impl From<russh::keys::Error> for TransportError {
    fn from(value: russh::keys::Error) -> Self {
        let str_val = value.to_string();
        Self::PrivateKey(value, str_val)
    }
}
impl From<StorageError> for TransportError {
    fn from(err: StorageError) -> Self {
        TransportError::StorageLayer(err.to_string())
    }
}

/// How a transport session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// the transport exited with status 0 on its own
    Clean,
    /// non-zero status, killed by a signal, or never came up
    Failed { code: Option<i32> },
    /// ended because a stop was requested
    Stopped,
}

impl ExitKind {
    pub fn from_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ExitKind::Clean,
            code => ExitKind::Failed { code },
        }
    }
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitKind::Clean => write!(f, "clean exit"),
            ExitKind::Failed { code: Some(code) } => write!(f, "failed with status {code}"),
            ExitKind::Failed { code: None } => write!(f, "failed"),
            ExitKind::Stopped => write!(f, "stopped"),
        }
    }
}

/// Opens one forwarding session to the relay. Returns once the session
/// counts as established.
#[cfg_attr(test, automock)]
#[async_trait]
pub(crate) trait Transport: Send + Sync {
    async fn connect(
        &self,
        config: &TunnelConfig,
    ) -> Result<Box<dyn TransportSession>, TransportError>;
}

/// A live forwarding session.
#[async_trait]
pub(crate) trait TransportSession: Send {
    /// Resolves when the session ends. Cancel-safe.
    async fn wait(&mut self) -> ExitKind;
    /// Forcefully ends the session. Calling it twice is a no-op.
    async fn terminate(&mut self);
}
