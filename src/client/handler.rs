//! Event bus: per-client handler registry and dispatch.
//!
//! Handlers for a specific [`Command`] run first, in registration order, then
//! the [`Topic::All`] handlers, also in registration order. A panicking
//! handler is caught and logged; the remaining handlers still run.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::error;

use crate::client::Client;
use crate::irc::event::{Command, Event};
use crate::logging::Sink;

/// Something that reacts to events.
///
/// Closures `Fn(&Client, &Event)` implement this, so most code registers a
/// closure directly. Handlers run inside the read loop: long work should be
/// moved to a spawned task.
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, client: &Client, event: &Event);
}

impl<F> Handler for F
where
    F: Fn(&Client, &Event) + Send + Sync + 'static,
{
    fn handle(&self, client: &Client, event: &Event) {
        self(client, event)
    }
}

/// What a handler subscribes to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Topic {
    Command(Command),
    /// Every dispatched event, after the command-specific handlers.
    All,
}

impl From<Command> for Topic {
    fn from(command: Command) -> Self {
        Topic::Command(command)
    }
}

/// Opaque token returned by [`Handlers::add`], used for removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

#[derive(Clone)]
struct Entry {
    id: HandlerId,
    handler: Arc<dyn Handler>,
}

pub struct Handlers {
    next_id: AtomicU64,
    entries: RwLock<HashMap<Topic, Vec<Entry>>>,
    debug: Option<Sink>,
}

impl Handlers {
    pub(crate) fn new(debug: Option<Sink>) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            entries: RwLock::new(HashMap::new()),
            debug,
        }
    }

    /// Register a closure.
    pub fn add<T, F>(&self, topic: T, handler: F) -> HandlerId
    where
        T: Into<Topic>,
        F: Fn(&Client, &Event) + Send + Sync + 'static,
    {
        self.add_handler(topic, handler)
    }

    /// Register a handler object.
    pub fn add_handler<T, H>(&self, topic: T, handler: H) -> HandlerId
    where
        T: Into<Topic>,
        H: Handler,
    {
        let id = HandlerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let entry = Entry {
            id,
            handler: Arc::new(handler),
        };
        self.entries.write().entry(topic.into()).or_default().push(entry);
        id
    }

    /// Remove a handler. Returns false if the id is unknown or was already
    /// removed.
    pub fn remove(&self, id: HandlerId) -> bool {
        let mut entries = self.entries.write();
        for list in entries.values_mut() {
            if let Some(pos) = list.iter().position(|e| e.id == id) {
                list.remove(pos);
                return true;
            }
        }
        false
    }

    /// Drop every handler for `topic`.
    pub fn clear(&self, topic: impl Into<Topic>) {
        self.entries.write().remove(&topic.into());
    }

    pub fn clear_all(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run every matching handler for `event`.
    ///
    /// The handler lists are snapshotted first: handlers added or removed
    /// while dispatching take effect from the next event.
    pub(crate) fn dispatch(&self, client: &Client, event: &Event) {
        let (specific, wildcard) = {
            let entries = self.entries.read();
            let specific = entries
                .get(&Topic::Command(event.command.clone()))
                .cloned()
                .unwrap_or_default();
            let wildcard = entries.get(&Topic::All).cloned().unwrap_or_default();
            (specific, wildcard)
        };

        for entry in specific.iter().chain(wildcard.iter()) {
            let result = panic::catch_unwind(AssertUnwindSafe(|| entry.handler.handle(client, event)));
            if let Err(payload) = result {
                let reason = panic_message(payload.as_ref());
                error!(
                    handler = entry.id.0,
                    command = %event.command,
                    "handler panicked: {}",
                    reason
                );
                if let Some(sink) = &self.debug {
                    sink.write_line(&format!(
                        "handler {} panicked on {}: {}",
                        entry.id.0, event.command, reason
                    ));
                }
            }
        }
    }
}

impl std::fmt::Debug for Handlers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handlers").field("len", &self.len()).finish()
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::irc::codec::decode;
    use parking_lot::Mutex;

    fn client() -> Client {
        Client::new(ClientConfig::new("irc.example.net", "test")).unwrap()
    }

    fn recorder() -> (Arc<Mutex<Vec<&'static str>>>, impl Fn(&'static str) -> Box<dyn Fn(&Client, &Event) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log2 = log.clone();
        let make = move |name: &'static str| {
            let log = log2.clone();
            Box::new(move |_: &Client, _: &Event| log.lock().push(name)) as Box<dyn Fn(&Client, &Event) + Send + Sync>
        };
        (log, make)
    }

    #[test]
    fn specific_before_wildcard_in_registration_order() {
        let client = client();
        let (log, make) = recorder();
        let handlers = client.handlers();
        handlers.add(Topic::All, make("all-1"));
        handlers.add(Command::Privmsg, make("privmsg-1"));
        handlers.add(Command::Join, make("join"));
        handlers.add(Topic::All, make("all-2"));
        handlers.add(Command::Privmsg, make("privmsg-2"));

        handlers.dispatch(&client, &decode(":a!b@c PRIVMSG #chan :hi"));
        assert_eq!(*log.lock(), vec!["privmsg-1", "privmsg-2", "all-1", "all-2"]);
    }

    #[test]
    fn panicking_handler_is_isolated() {
        let client = client();
        let (log, make) = recorder();
        let handlers = client.handlers();
        handlers.add(Command::Privmsg, |_: &Client, _: &Event| panic!("boom"));
        handlers.add(Command::Privmsg, make("second"));
        handlers.add(Topic::All, make("wildcard"));

        handlers.dispatch(&client, &decode(":a!b@c PRIVMSG #chan :hi"));
        handlers.dispatch(&client, &decode(":a!b@c PRIVMSG #chan :again"));
        assert_eq!(*log.lock(), vec!["second", "wildcard", "second", "wildcard"]);
    }

    #[test]
    fn remove_by_id() {
        let client = client();
        let (log, make) = recorder();
        let handlers = client.handlers();
        let gone = handlers.add(Command::Privmsg, make("gone"));
        handlers.add(Command::Privmsg, make("kept"));
        assert_eq!(handlers.len(), 2);
        assert!(handlers.remove(gone));
        assert!(!handlers.remove(gone));

        handlers.dispatch(&client, &decode(":a!b@c PRIVMSG #chan :hi"));
        assert_eq!(*log.lock(), vec!["kept"]);
    }

    #[test]
    fn handler_may_register_during_dispatch() {
        let client = client();
        let (log, make) = recorder();
        let late = Arc::new(Mutex::new(Some(make("late"))));
        client.handlers().add(Command::Privmsg, move |c: &Client, _: &Event| {
            if let Some(h) = late.lock().take() {
                c.handlers().add(Command::Privmsg, h);
            }
        });

        let event = decode(":a!b@c PRIVMSG #chan :hi");
        client.handlers().dispatch(&client, &event);
        assert!(log.lock().is_empty());
        client.handlers().dispatch(&client, &event);
        assert_eq!(*log.lock(), vec!["late"]);
    }

    #[test]
    fn clear_topic() {
        let client = client();
        let (log, make) = recorder();
        client.handlers().add(Command::Join, make("join"));
        client.handlers().add(Topic::All, make("all"));
        client.handlers().clear(Command::Join);
        client.handlers().dispatch(&client, &decode(":a!b@c JOIN #x"));
        assert_eq!(*log.lock(), vec!["all"]);
    }
}
