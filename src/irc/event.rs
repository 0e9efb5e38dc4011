//! Parsed protocol messages.

use std::fmt;
use std::str::FromStr;

use crate::error::DecodeError;

/// Protocol verb of an [`Event`].
///
/// Known verbs get their own variant so subscriptions can't silently miss
/// because of a typo. Anything else lands in [`Command::Other`], upper-cased.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Command {
    Privmsg,
    Notice,
    Join,
    Part,
    Quit,
    Nick,
    Ping,
    Pong,
    Error,
    Kick,
    Mode,
    Topic,
    Invite,
    Cap,
    Authenticate,
    Away,
    Pass,
    User,
    /// Three-digit server reply.
    Numeric(u16),
    Other(String),
    /// Synthetic: registration completed.
    Connected,
    /// Synthetic: the session ended.
    Disconnected,
    /// Synthetic: the raw line could not be parsed.
    Unparseable,
}

impl Command {
    pub fn as_str(&self) -> std::borrow::Cow<'_, str> {
        use std::borrow::Cow;
        let s = match self {
            Command::Privmsg => "PRIVMSG",
            Command::Notice => "NOTICE",
            Command::Join => "JOIN",
            Command::Part => "PART",
            Command::Quit => "QUIT",
            Command::Nick => "NICK",
            Command::Ping => "PING",
            Command::Pong => "PONG",
            Command::Error => "ERROR",
            Command::Kick => "KICK",
            Command::Mode => "MODE",
            Command::Topic => "TOPIC",
            Command::Invite => "INVITE",
            Command::Cap => "CAP",
            Command::Authenticate => "AUTHENTICATE",
            Command::Away => "AWAY",
            Command::Pass => "PASS",
            Command::User => "USER",
            Command::Numeric(n) => return Cow::Owned(format!("{n:03}")),
            Command::Other(s) => s.as_str(),
            Command::Connected => "CLIENT_CONNECTED",
            Command::Disconnected => "CLIENT_DISCONNECTED",
            Command::Unparseable => "CLIENT_UNPARSEABLE",
        };
        Cow::Borrowed(s)
    }

    /// True for the events the engine generates itself.
    pub fn is_synthetic(&self) -> bool {
        matches!(self, Command::Connected | Command::Disconnected | Command::Unparseable)
    }
}

impl From<&str> for Command {
    fn from(s: &str) -> Self {
        let upper = s.to_ascii_uppercase();
        match upper.as_str() {
            "PRIVMSG" => Command::Privmsg,
            "NOTICE" => Command::Notice,
            "JOIN" => Command::Join,
            "PART" => Command::Part,
            "QUIT" => Command::Quit,
            "NICK" => Command::Nick,
            "PING" => Command::Ping,
            "PONG" => Command::Pong,
            "ERROR" => Command::Error,
            "KICK" => Command::Kick,
            "MODE" => Command::Mode,
            "TOPIC" => Command::Topic,
            "INVITE" => Command::Invite,
            "CAP" => Command::Cap,
            "AUTHENTICATE" => Command::Authenticate,
            "AWAY" => Command::Away,
            "PASS" => Command::Pass,
            "USER" => Command::User,
            _ if upper.len() == 3 && upper.bytes().all(|b| b.is_ascii_digit()) => {
                // three ASCII digits always fit in u16
                Command::Numeric(upper.parse().unwrap_or_default())
            }
            _ => Command::Other(upper),
        }
    }
}

impl FromStr for Command {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Command::from(s))
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_str())
    }
}

/// Origin of a message: `nick!user@host`, or a bare server name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Source {
    pub name: String,
    pub ident: Option<String>,
    pub host: Option<String>,
}

impl Source {
    pub fn parse(raw: &str) -> Self {
        let (rest, host) = match raw.split_once('@') {
            Some((rest, host)) => (rest, Some(host.to_string())),
            None => (raw, None),
        };
        let (name, ident) = match rest.split_once('!') {
            Some((name, ident)) => (name.to_string(), Some(ident.to_string())),
            None => (rest.to_string(), None),
        };
        Self { name, ident, host }
    }

    /// A bare name containing a dot with no ident/host is a server.
    pub fn is_server(&self) -> bool {
        self.ident.is_none() && self.host.is_none() && self.name.contains('.')
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)?;
        if let Some(ident) = &self.ident {
            write!(f, "!{ident}")?;
        }
        if let Some(host) = &self.host {
            write!(f, "@{host}")?;
        }
        Ok(())
    }
}

/// A decoded protocol line. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub source: Option<Source>,
    pub command: Command,
    /// Middle parameters, without the trailing one.
    pub params: Vec<String>,
    /// The colon-prefixed last parameter, which may contain spaces.
    pub trailing: Option<String>,
    raw: String,
    error: Option<DecodeError>,
}

impl Event {
    pub(crate) fn new(
        source: Option<Source>,
        command: Command,
        params: Vec<String>,
        trailing: Option<String>,
        raw: String,
    ) -> Self {
        Self {
            source,
            command,
            params,
            trailing,
            raw,
            error: None,
        }
    }

    pub(crate) fn unparseable(raw: &str, error: DecodeError) -> Self {
        Self {
            source: None,
            command: Command::Unparseable,
            params: Vec::new(),
            trailing: None,
            raw: raw.to_string(),
            error: Some(error),
        }
    }

    /// Build one of the engine's own events.
    pub(crate) fn synthetic(command: Command, trailing: Option<String>) -> Self {
        let raw = match &trailing {
            Some(t) => format!("{command} :{t}"),
            None => command.to_string(),
        };
        Self::new(None, command, Vec::new(), trailing, raw)
    }

    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn is_unparseable(&self) -> bool {
        self.error.is_some()
    }

    pub fn decode_error(&self) -> Option<&DecodeError> {
        self.error.as_ref()
    }

    /// Nickname (or server name) of the sender.
    pub fn nick(&self) -> Option<&str> {
        self.source.as_ref().map(|s| s.name.as_str())
    }

    /// The trailing parameter if present, otherwise the last middle parameter.
    pub fn last(&self) -> Option<&str> {
        self.trailing
            .as_deref()
            .or_else(|| self.params.last().map(String::as_str))
    }

    /// Middle parameters followed by the trailing one.
    pub fn all_params(&self) -> Vec<&str> {
        let mut all: Vec<&str> = self.params.iter().map(String::as_str).collect();
        if let Some(t) = &self.trailing {
            all.push(t);
        }
        all
    }

    /// First parameter is a channel name.
    pub fn is_from_channel(&self) -> bool {
        self.params
            .first()
            .is_some_and(|p| p.starts_with(['#', '&', '+', '!']))
    }

    /// `PRIVMSG` carrying a CTCP ACTION (`/me`).
    pub fn is_action(&self) -> bool {
        self.command == Command::Privmsg && self.action_text().is_some()
    }

    fn action_text(&self) -> Option<&str> {
        self.trailing
            .as_deref()?
            .strip_prefix("\x01ACTION ")
            .map(|t| t.strip_suffix('\x01').unwrap_or(t))
    }

    /// Human-readable rendering for the commands where one makes sense.
    ///
    /// Returns `None` for everything else; use the `Display` impl for the raw
    /// line instead.
    pub fn pretty(&self) -> Option<String> {
        let nick = self.nick().unwrap_or("*");
        let target = self.params.first().map(String::as_str).unwrap_or("");
        let text = self.trailing.as_deref().unwrap_or("");

        match &self.command {
            Command::Privmsg if self.is_action() => {
                Some(format!("[{target}] * {nick} {}", self.action_text().unwrap_or("")))
            }
            Command::Privmsg => Some(format!("[{target}] <{nick}> {text}")),
            Command::Notice => Some(format!("[{target}] -{nick}- {text}")),
            Command::Join => {
                let channel = self.last().unwrap_or("");
                Some(format!("[{channel}] *** {nick} has joined"))
            }
            Command::Part if self.trailing.is_some() && !self.params.is_empty() => {
                Some(format!("[{target}] *** {nick} has left ({text})"))
            }
            Command::Part => {
                let channel = self.last().unwrap_or("");
                Some(format!("[{channel}] *** {nick} has left"))
            }
            Command::Quit => Some(format!("*** {nick} has quit ({text})")),
            Command::Nick => Some(format!("*** {nick} is now known as {}", self.last().unwrap_or(""))),
            Command::Kick => {
                let victim = self.params.get(1).map(String::as_str).unwrap_or("");
                Some(format!("[{target}] *** {victim} was kicked by {nick} ({text})"))
            }
            Command::Topic => Some(format!("[{target}] *** {nick} changed the topic to: {text}")),
            Command::Mode => Some(format!(
                "[{target}] *** {nick} sets mode {}",
                self.all_params().into_iter().skip(1).collect::<Vec<_>>().join(" ")
            )),
            Command::Invite => Some(format!("*** {nick} invited you to {}", self.last().unwrap_or(""))),
            Command::Error => Some(format!("*** error: {text}")),
            Command::Numeric(1..=5) | Command::Numeric(372 | 375 | 376) => {
                Some(format!("*** {}", self.last().unwrap_or("")))
            }
            Command::Connected => Some(format!("*** connected to {text}")),
            Command::Disconnected => Some(format!("*** disconnected: {text}")),
            _ => None,
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}
