//! Per-client bookkeeping kept in sync with the server.

use chrono::{DateTime, Utc};
use std::collections::BTreeSet;
use std::time::Duration;

use crate::irc::event::{Command, Event};

const RPL_WELCOME: u16 = 1;

/// Connection lifecycle. Only the connection manager moves between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Disconnected,
    Connecting,
    Connected,
    Closing,
}

/// Snapshot of what the client knows about itself on the network.
///
/// Channel names are stored ASCII lower-cased.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientState {
    pub nick: String,
    pub channels: BTreeSet<String>,
    pub capabilities: BTreeSet<String>,
    /// Name the server used in its welcome reply.
    pub server_name: Option<String>,
    pub registered: bool,
    pub connected_at: Option<DateTime<Utc>>,
    /// Round trip of the last client-initiated PING.
    pub lag: Option<Duration>,
}

impl ClientState {
    pub fn new(nick: &str) -> Self {
        Self {
            nick: nick.to_string(),
            ..Default::default()
        }
    }

    pub fn is_me(&self, nick: &str) -> bool {
        nick.eq_ignore_ascii_case(&self.nick)
    }

    pub fn in_channel(&self, channel: &str) -> bool {
        self.channels.contains(&channel.to_ascii_lowercase())
    }

    /// Forget everything tied to a session. The nick is kept so the next
    /// registration starts from the last known one.
    pub(crate) fn reset_session(&mut self) {
        self.channels.clear();
        self.capabilities.clear();
        self.server_name = None;
        self.registered = false;
        self.connected_at = None;
        self.lag = None;
    }

    pub(crate) fn mark_registered(&mut self, nick: &str, server_name: Option<String>) {
        self.nick = nick.to_string();
        self.server_name = server_name;
        self.registered = true;
        self.connected_at = Some(Utc::now());
    }

    /// Update state for events that change it. Returns true if anything
    /// changed.
    pub(crate) fn apply(&mut self, event: &Event) -> bool {
        let Some(nick) = event.nick() else {
            return match &event.command {
                Command::Numeric(RPL_WELCOME) => self.apply_welcome(event),
                _ => false,
            };
        };
        let from_me = self.is_me(nick);

        match &event.command {
            Command::Numeric(RPL_WELCOME) => self.apply_welcome(event),
            Command::Nick if from_me => match event.last() {
                Some(new) => {
                    self.nick = new.to_string();
                    true
                }
                None => false,
            },
            Command::Join if from_me => match event.params.first().map(String::as_str).or(event.trailing.as_deref()) {
                Some(channel) => self.channels.insert(channel.to_ascii_lowercase()),
                None => false,
            },
            Command::Part if from_me => match event.params.first().map(String::as_str).or(event.trailing.as_deref()) {
                Some(channel) => self.channels.remove(&channel.to_ascii_lowercase()),
                None => false,
            },
            Command::Kick => match (event.params.first(), event.params.get(1)) {
                (Some(channel), Some(victim)) if self.is_me(victim) => {
                    self.channels.remove(&channel.to_ascii_lowercase())
                }
                _ => false,
            },
            Command::Cap => self.apply_cap(event),
            _ => false,
        }
    }

    fn apply_welcome(&mut self, event: &Event) -> bool {
        match event.params.first() {
            Some(nick) => {
                let server = event.nick().map(str::to_string);
                self.mark_registered(nick, server);
                true
            }
            None => false,
        }
    }

    /// `CAP <nick> ACK|DEL :caps`. A leading `-` in an ACK removes the cap.
    fn apply_cap(&mut self, event: &Event) -> bool {
        let Some(sub) = event.params.get(1) else {
            return false;
        };
        let caps = event.last().unwrap_or("");
        let mut changed = false;
        match sub.to_ascii_uppercase().as_str() {
            "ACK" => {
                for cap in caps.split_whitespace() {
                    changed |= match cap.strip_prefix('-') {
                        Some(removed) => self.capabilities.remove(removed),
                        None => self.capabilities.insert(cap.to_string()),
                    };
                }
            }
            "DEL" => {
                for cap in caps.split_whitespace() {
                    changed |= self.capabilities.remove(cap);
                }
            }
            _ => {}
        }
        changed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::irc::codec::decode;

    fn registered() -> ClientState {
        let mut state = ClientState::new("test");
        state.apply(&decode(":irc.example.net 001 test :Welcome"));
        state
    }

    #[test]
    fn welcome_registers() {
        let mut state = ClientState::new("wanted");
        assert!(state.apply(&decode(":irc.example.net 001 wanted_ :Welcome")));
        assert!(state.registered);
        assert_eq!(state.nick, "wanted_");
        assert_eq!(state.server_name.as_deref(), Some("irc.example.net"));
        assert!(state.connected_at.is_some());
    }

    #[test]
    fn join_part_kick_bookkeeping() {
        let mut state = registered();
        state.apply(&decode(":test!u@h JOIN #Dev"));
        state.apply(&decode(":test!u@h JOIN :#rust"));
        state.apply(&decode(":other!u@h JOIN #ignored"));
        assert!(state.in_channel("#dev"));
        assert!(state.in_channel("#RUST"));
        assert!(!state.in_channel("#ignored"));

        state.apply(&decode(":test!u@h PART #dev :bye"));
        assert!(!state.in_channel("#dev"));

        state.apply(&decode(":op!u@h KICK #rust other :not you"));
        assert!(state.in_channel("#rust"));
        state.apply(&decode(":op!u@h KICK #rust test :you"));
        assert!(state.channels.is_empty());
    }

    #[test]
    fn nick_change_only_for_self() {
        let mut state = registered();
        assert!(!state.apply(&decode(":other!u@h NICK :renamed")));
        assert_eq!(state.nick, "test");
        assert!(state.apply(&decode(":TEST!u@h NICK :renamed")));
        assert_eq!(state.nick, "renamed");
    }

    #[test]
    fn capabilities() {
        let mut state = registered();
        state.apply(&decode(":srv CAP test ACK :sasl multi-prefix"));
        assert!(state.capabilities.contains("sasl"));
        assert!(state.capabilities.contains("multi-prefix"));
        state.apply(&decode(":srv CAP test ACK :-multi-prefix"));
        assert!(!state.capabilities.contains("multi-prefix"));
        state.apply(&decode(":srv CAP test DEL :sasl"));
        assert!(state.capabilities.is_empty());
    }

    #[test]
    fn reset_keeps_nick() {
        let mut state = registered();
        state.apply(&decode(":test!u@h JOIN #dev"));
        state.reset_session();
        assert_eq!(state.nick, "test");
        assert!(state.channels.is_empty());
        assert!(!state.registered);
    }
}
