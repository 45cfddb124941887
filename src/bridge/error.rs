use super::codec::CodecError;
use crate::{config::ConfigError, node::NodeError};
use std::{fmt, sync::PoisonError};

pub type BridgeResult<T> = core::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// Line that could not be decoded as a stratum message.
    Codec(CodecError),
    Config(ConfigError),
    Io(std::io::Error),
    Node(NodeError),
    // Locking Errors
    PoisonLock,
    /// The other end of an internal channel is gone.
    ChannelClosed,
    /// A miner did not drain its queue within the write timeout.
    SendTimeout,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Error::Codec(e) => write!(f, "Codec {}", e),
            Error::Config(e) => write!(f, "Config {}", e),
            Error::Io(e) => write!(f, "Io {}", e),
            Error::Node(e) => write!(f, "Node {}", e),
            Error::PoisonLock => write!(f, "PoisonLock"),
            Error::ChannelClosed => write!(f, "ChannelClosed"),
            Error::SendTimeout => write!(f, "SendTimeout"),
        }
    }
}

impl std::error::Error for Error {}

impl From<CodecError> for Error {
    fn from(e: CodecError) -> Self {
        Self::Codec(e)
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Codec(CodecError::MalformedMessage(e.to_string()))
    }
}

impl From<ConfigError> for Error {
    fn from(e: ConfigError) -> Self {
        Self::Config(e)
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<NodeError> for Error {
    fn from(e: NodeError) -> Self {
        Self::Node(e)
    }
}

impl<T> From<PoisonError<T>> for Error {
    fn from(_: PoisonError<T>) -> Self {
        Self::PoisonLock
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_value: tokio::sync::mpsc::error::SendError<T>) -> Self {
        Self::ChannelClosed
    }
}

impl<T> From<tokio::sync::mpsc::error::SendTimeoutError<T>> for Error {
    fn from(value: tokio::sync::mpsc::error::SendTimeoutError<T>) -> Self {
        match value {
            tokio::sync::mpsc::error::SendTimeoutError::Timeout(_) => Self::SendTimeout,
            tokio::sync::mpsc::error::SendTimeoutError::Closed(_) => Self::ChannelClosed,
        }
    }
}
