//! IRC protocol layer: framing, events, validation, typed commands and the
//! connection lifecycle.

pub mod codec;
pub mod commands;
pub(crate) mod connection;
pub mod event;
pub mod format;
pub mod glob;
pub(crate) mod manager;
