//! crabirc: an asynchronous IRC client engine.
//!
//! Build a [`Client`] from a [`ClientConfig`], register handlers on
//! [`Client::handlers`], then [`connect`](Client::connect) and
//! [`run`](Client::run). Handlers receive decoded [`Event`]s and talk back
//! through [`Client::cmd`].

pub mod client;
pub mod config;
pub mod error;
pub mod irc;
pub mod logging;

pub use client::{Client, ClientState, Handler, HandlerId, Handlers, Status, Topic};
pub use config::ClientConfig;
pub use error::{ConfigError, ConnectError, DecodeError, Error, SendError};
pub use irc::commands::Commands;
pub use irc::event::{Command, Event, Source};
pub use irc::format::strip_raw;
pub use irc::glob::{glob, Glob};
pub use logging::Sink;
