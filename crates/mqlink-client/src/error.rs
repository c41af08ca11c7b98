//! Client error types.

use std::io;

use mqlink_core::{ConnectRefusal, ProtocolError};
use thiserror::Error;

/// Client error type.
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Protocol error: {0}")]
    Protocol(ProtocolError),

    #[error("Connection refused: {0}")]
    ConnectionRefused(ConnectRefusal),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Connection timeout")]
    ConnectionTimeout,

    #[error("Not connected")]
    NotConnected,

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<ProtocolError> for ClientError {
    fn from(err: ProtocolError) -> Self {
        match err {
            ProtocolError::ConnectRefused(refusal) => ClientError::ConnectionRefused(refusal),
            other => ClientError::Protocol(other),
        }
    }
}

impl From<config::ConfigError> for ClientError {
    fn from(err: config::ConfigError) -> Self {
        ClientError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
