//! The client facade: one configured connection to one IRC server.

pub mod handler;
pub mod state;

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{trace, warn};

use crate::config::ClientConfig;
use crate::error::{ConfigError, ConnectError, SendError};
use crate::irc::codec::{encode_with, try_decode, EncodeOptions};
use crate::irc::commands::Commands;
use crate::irc::event::{Command, Event};
use crate::irc::format::strip_raw;
use crate::irc::glob::Glob;
use crate::irc::manager::{self, ConnectionManager};
use crate::logging::Sink;

pub use handler::{Handler, HandlerId, Handlers, Topic};
pub use state::{ClientState, Status};

/// A handle to an IRC client. Cheap to clone; clones share the connection,
/// the handlers and the state.
///
/// ```no_run
/// # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
/// use crabirc::{Client, ClientConfig, Command};
///
/// let client = Client::new(ClientConfig::new("irc.libera.chat", "crabbot"))?;
/// client.handlers().add(Command::Connected, |c: &Client, _: &crabirc::Event| {
///     let _ = c.cmd().join(["#crabirc"]);
/// });
/// client.connect().await?;
/// client.run().await;
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<Inner>,
}

pub(crate) struct Inner {
    pub(crate) config: ClientConfig,
    pub(crate) handlers: Handlers,
    pub(crate) state: watch::Sender<ClientState>,
    pub(crate) manager: ConnectionManager,
    ignore: Vec<Glob>,
}

impl Client {
    /// Validate `config` and build an unconnected client. No I/O happens
    /// here apart from opening the raw log file, if one is configured.
    pub fn new(config: ClientConfig) -> Result<Self, ConfigError> {
        let mut config = config.prepare()?;
        if config.debug.is_none() {
            if let Some(path) = &config.raw_log {
                match Sink::file(path) {
                    Ok(sink) => config.debug = Some(sink),
                    Err(e) => warn!(path = %path, error = %e, "cannot open raw log"),
                }
            }
        }

        let ignore = config
            .ignore
            .iter()
            .map(|mask| Glob::new(mask.trim()).case_insensitive(true))
            .collect();
        let state = watch::channel(ClientState::new(&config.nick)).0;
        let handlers = Handlers::new(config.debug.clone());

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                handlers,
                state,
                manager: ConnectionManager::new(),
                ignore,
            }),
        })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    pub fn handlers(&self) -> &Handlers {
        &self.inner.handlers
    }

    /// Typed command builder for the live connection.
    pub fn cmd(&self) -> Commands<'_> {
        Commands::new(self)
    }

    pub fn status(&self) -> Status {
        self.inner.manager.status()
    }

    /// Receiver that observes every status change.
    pub fn watch_status(&self) -> watch::Receiver<Status> {
        self.inner.manager.watch_status()
    }

    /// Snapshot of the client state.
    pub fn state(&self) -> ClientState {
        self.inner.state.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.inner.state.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.status() == Status::Connected
    }

    /// Current nickname as the server knows it.
    pub fn nick(&self) -> String {
        self.inner.state.borrow().nick.clone()
    }

    /// Joined channels, lower-cased and sorted.
    pub fn channels(&self) -> Vec<String> {
        self.inner.state.borrow().channels.iter().cloned().collect()
    }

    pub fn is_in_channel(&self, channel: &str) -> bool {
        self.inner.state.borrow().in_channel(channel)
    }

    pub fn has_capability(&self, cap: &str) -> bool {
        self.inner.state.borrow().capabilities.contains(cap)
    }

    /// Server name from the welcome reply, falling back to the configured host.
    pub fn server(&self) -> String {
        self.inner
            .state
            .borrow()
            .server_name
            .clone()
            .unwrap_or_else(|| self.inner.config.server.clone())
    }

    /// Round trip of the last idle PING, if one has completed.
    pub fn lag(&self) -> Option<std::time::Duration> {
        self.inner.state.borrow().lag
    }

    /// Connect and register. Returns once the server has welcomed us.
    ///
    /// On failure the error is returned. When automatic reconnect is on,
    /// retries keep going in the background.
    pub async fn connect(&self) -> Result<(), ConnectError> {
        manager::connect(self).await
    }

    /// Wait until the client is idle: no live connection and no pending
    /// retry. Returns immediately if never connected.
    pub async fn run(&self) {
        self.inner.manager.wait_idle().await
    }

    /// Send QUIT and drop the connection. Safe to call from a handler and
    /// safe to call twice. Cancels pending retries.
    pub fn close(&self) {
        manager::close(self, None)
    }

    /// [`close`](Self::close) with a QUIT reason other than the configured
    /// one.
    pub fn close_with(&self, reason: &str) {
        manager::close(self, Some(reason))
    }

    /// Like [`close`](Self::close), but waits for queued lines to be
    /// flushed and the connection tasks to end.
    pub async fn close_and_wait(&self) {
        manager::close_and_wait(self, None).await
    }

    /// Close the current connection (if any) and connect again.
    pub async fn reconnect(&self) -> Result<(), ConnectError> {
        manager::reconnect(self).await
    }

    /// Close and disable automatic reconnect until the next
    /// [`connect`](Self::connect).
    pub fn stop(&self) {
        manager::stop(self)
    }

    /// Queue one already-formatted line. It must parse and fit in a
    /// protocol line.
    pub fn send_raw(&self, line: &str) -> Result<(), SendError> {
        let line = line.trim_end_matches(['\r', '\n']);
        if line.contains(['\r', '\n', '\0']) {
            return Err(SendError::InvalidCharacter);
        }
        let event = try_decode(line).map_err(|_| SendError::InvalidParam(line.to_string()))?;
        if event.source.is_some() {
            return Err(SendError::InvalidParam(line.to_string()));
        }
        let max = crate::irc::codec::MAX_LINE_LEN;
        if line.len() + 2 > max {
            return Err(SendError::LineTooLong {
                len: line.len() + 2,
                max,
            });
        }
        self.send_line(line.to_string())
    }

    /// Encode with the client's truncation setting and queue.
    pub(crate) fn send(
        &self,
        command: &str,
        params: &[&str],
        trailing: Option<&str>,
    ) -> Result<(), SendError> {
        let line = self.encode(command, params, trailing)?;
        self.send_line(line)
    }

    pub(crate) fn encode(
        &self,
        command: &str,
        params: &[&str],
        trailing: Option<&str>,
    ) -> Result<String, SendError> {
        let opts = EncodeOptions {
            truncate: self.inner.config.truncate_long_lines,
        };
        encode_with(command, params, trailing, opts)
    }

    pub(crate) fn send_line(&self, line: String) -> Result<(), SendError> {
        self.inner.manager.send(line)
    }

    /// Queue already-encoded lines back to back, or none of them.
    pub(crate) fn send_lines(&self, lines: Vec<String>) -> Result<(), SendError> {
        self.inner.manager.send_all(lines)
    }

    fn is_ignored(&self, event: &Event) -> bool {
        if self.inner.ignore.is_empty() {
            return false;
        }
        if !matches!(
            event.command,
            Command::Privmsg | Command::Notice | Command::Invite
        ) {
            return false;
        }
        match &event.source {
            Some(source) if !source.is_server() => {
                let mask = source.to_string();
                self.inner.ignore.iter().any(|g| g.matches(&mask))
            }
            _ => false,
        }
    }

    /// Update state, then hand the event to the output sink and handlers.
    pub(crate) fn process(&self, event: &Event) {
        self.inner.state.send_if_modified(|s| s.apply(event));
        if self.is_ignored(event) {
            trace!(source = ?event.source, "ignored");
            return;
        }
        if let Some(out) = &self.inner.config.out {
            if let Some(pretty) = event.pretty() {
                out.write_line(&strip_raw(&pretty));
            }
        }
        self.inner.handlers.dispatch(self, event);
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("server", &self.inner.config.address())
            .field("status", &self.status())
            .field("nick", &self.nick())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::codec::decode;
    use parking_lot::Mutex;

    fn client_with(f: impl FnOnce(&mut ClientConfig)) -> Client {
        let mut cfg = ClientConfig::new("irc.example.net", "test");
        f(&mut cfg);
        Client::new(cfg).unwrap()
    }

    #[test]
    fn new_rejects_invalid_config() {
        let err = Client::new(ClientConfig::new("", "test")).unwrap_err();
        assert_eq!(err, ConfigError::EmptyServer);
    }

    #[test]
    fn fresh_client_is_disconnected() {
        let client = client_with(|_| {});
        assert_eq!(client.status(), Status::Disconnected);
        assert_eq!(client.nick(), "test");
        assert_eq!(client.server(), "irc.example.net");
        assert!(client.channels().is_empty());
        assert_eq!(client.cmd().message("#chan", "hi"), Err(SendError::NotConnected));
        assert_eq!(client.send_raw("PRIVMSG #chan :hi"), Err(SendError::NotConnected));
    }

    #[test]
    fn send_raw_validates_before_queueing() {
        let client = client_with(|_| {});
        assert_eq!(
            client.send_raw("PRIVMSG #a :x\r\nQUIT"),
            Err(SendError::InvalidCharacter)
        );
        assert!(matches!(client.send_raw(""), Err(SendError::InvalidParam(_))));
        assert!(matches!(
            client.send_raw(&format!("PRIVMSG #a :{}", "x".repeat(600))),
            Err(SendError::LineTooLong { .. })
        ));
    }

    #[test]
    fn process_updates_state_and_dispatches() {
        let client = client_with(|_| {});
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        client.handlers().add(Topic::All, move |c: &Client, e: &Event| {
            seen2.lock().push((e.command.clone(), c.is_in_channel("#dev")));
        });

        client.process(&decode(":irc.example.net 001 test :Welcome"));
        client.process(&decode(":test!u@h JOIN #dev"));
        assert!(client.state().registered);
        // state is applied before handlers run
        assert_eq!(seen.lock().last(), Some(&(Command::Join, true)));
    }

    #[test]
    fn ignore_list_suppresses_messages_only() {
        let client = client_with(|c| c.ignore = vec!["spam*!*@*".into()]);
        let count = Arc::new(Mutex::new(0));
        let count2 = count.clone();
        client.handlers().add(Topic::All, move |_: &Client, _: &Event| *count2.lock() += 1);

        client.process(&decode(":SpamBot!x@y PRIVMSG #a :buy"));
        client.process(&decode(":spambot!x@y JOIN #a"));
        client.process(&decode(":friend!x@y PRIVMSG #a :hello"));
        assert_eq!(*count.lock(), 2);
    }

    #[test]
    fn out_sink_gets_plain_pretty_lines() {
        let buf = Arc::new(Mutex::new(Vec::<u8>::new()));
        struct Shared(Arc<Mutex<Vec<u8>>>);
        impl std::io::Write for Shared {
            fn write(&mut self, b: &[u8]) -> std::io::Result<usize> {
                self.0.lock().extend_from_slice(b);
                Ok(b.len())
            }
            fn flush(&mut self) -> std::io::Result<()> {
                Ok(())
            }
        }
        let sink = Sink::new(Shared(buf.clone()));
        let client = client_with(|c| c.out = Some(sink));
        client.process(&decode(":nick!u@h PRIVMSG #chan :\x02bold\x02 text"));
        let written = String::from_utf8(buf.lock().clone()).unwrap();
        assert!(written.contains("bold text"));
        assert!(!written.contains('\x02'));
    }

    #[test]
    fn close_when_idle_is_a_no_op() {
        let client = client_with(|_| {});
        client.close();
        client.close();
        client.stop();
        assert_eq!(client.status(), Status::Disconnected);
    }
}
