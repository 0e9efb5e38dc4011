//! Error taxonomy for the client engine.
//!
//! Each layer has its own error enum so callers can match on exactly the
//! failures an operation can produce:
//!
//! - [`ConfigError`]: rejected at [`Client::new`](crate::Client::new), before any I/O.
//! - [`ConnectError`]: DNS/TCP/TLS/registration failures returned from `connect`.
//! - [`SendError`]: a command could not be encoded or queued. The connection stays up.
//! - [`DecodeError`]: a malformed inbound line. Recovered locally by the read loop.
//!
//! Handler panics have no error type: they are caught at the dispatch boundary
//! and logged.

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Invalid client configuration.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("server address must not be empty")]
    EmptyServer,
    #[error("nickname must not be empty")]
    EmptyNick,
    #[error("invalid nickname {0:?}")]
    InvalidNick(String),
    #[error("invalid username {0:?}")]
    InvalidUser(String),
    #[error("SASL credentials must have a non-empty user and password")]
    InvalidSasl,
    #[error("invalid rate limit: {0}")]
    InvalidRateLimit(String),
    #[error("invalid reconnect policy: {0}")]
    InvalidReconnect(String),
    #[error("invalid ignore mask {0:?}")]
    InvalidIgnoreMask(String),
}

/// Which part of connection setup ran out of time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Connect,
    Tls,
    Handshake,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stage::Connect => f.write_str("tcp connect"),
            Stage::Tls => f.write_str("tls handshake"),
            Stage::Handshake => f.write_str("registration"),
        }
    }
}

/// Failure to establish a registered connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("failed to resolve {host}: {source}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },
    #[error("no addresses found for {0}")]
    NoAddress(String),
    #[error("tcp connect to {addr} failed: {source}")]
    Tcp {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("invalid TLS server name {0:?}")]
    InvalidServerName(String),
    #[error("TLS handshake with {addr} failed: {source}")]
    Tls {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("{stage} timed out after {after:?}")]
    Timeout { stage: Stage, after: Duration },
    #[error("SASL authentication rejected: {0}")]
    AuthRejected(String),
    #[error("registration failed: {0}")]
    Handshake(String),
    #[error("i/o error during registration: {0}")]
    Io(#[from] io::Error),
    #[error("already connected")]
    AlreadyConnected,
    #[error("client has been stopped")]
    Stopped,
    #[error("superseded by a newer connect, close or stop")]
    Superseded,
}

/// A command could not be encoded or queued.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    #[error("line is {len} bytes, limit is {max}")]
    LineTooLong { len: usize, max: usize },
    #[error("invalid target {0:?}")]
    InvalidTarget(String),
    #[error("invalid parameter {0:?}")]
    InvalidParam(String),
    #[error("line contains CR, LF or NUL")]
    InvalidCharacter,
    #[error("not connected")]
    NotConnected,
}

/// A raw line that does not follow the `[:prefix] COMMAND params` grammar.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("empty line")]
    Empty,
    #[error("missing command")]
    MissingCommand,
    #[error("prefix without a command")]
    DanglingPrefix,
}

/// Umbrella error for callers that don't care which layer failed.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
    #[error(transparent)]
    Send(#[from] SendError),
}
