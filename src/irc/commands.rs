//! Typed outbound commands.
//!
//! Every method validates its arguments before anything is queued, so an
//! invalid call never puts a partial line on the wire. Message text longer
//! than one protocol line is split into several lines.

use crate::client::Client;
use crate::error::SendError;
use crate::irc::codec::{split_payload, MAX_LINE_LEN};
use crate::irc::format::{is_valid_channel, is_valid_nick, is_valid_target};

/// Room kept for the host part of our own prefix, which the server prepends
/// when it relays our messages and which we cannot know in advance.
const HOST_RESERVE: usize = 63;

/// Borrowed command builder, see [`Client::cmd`].
pub struct Commands<'a> {
    client: &'a Client,
}

impl<'a> Commands<'a> {
    pub(crate) fn new(client: &'a Client) -> Self {
        Self { client }
    }

    /// Join channels, batching as many as fit into each line.
    pub fn join<I, S>(&self, channels: I) -> Result<(), SendError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channels: Vec<String> = channels.into_iter().map(|c| c.as_ref().to_string()).collect();
        for channel in &channels {
            check_channel(channel)?;
        }
        let lines = batch_list(&channels, MAX_LINE_LEN - 2 - "JOIN ".len())
            .iter()
            .map(|batch| self.client.encode("JOIN", &[batch.as_str()], None))
            .collect::<Result<Vec<_>, _>>()?;
        self.client.send_lines(lines)
    }

    /// Join keyed channels, `(channel, key)` pairs.
    pub fn join_with_keys(&self, pairs: &[(&str, &str)]) -> Result<(), SendError> {
        for (channel, key) in pairs {
            check_channel(channel)?;
            if key.is_empty() || key.contains([' ', ',']) {
                return Err(SendError::InvalidParam(key.to_string()));
            }
        }
        let max = MAX_LINE_LEN - 2 - "JOIN  ".len();
        let mut lines = Vec::new();
        let mut channels = String::new();
        let mut keys = String::new();
        for (channel, key) in pairs {
            let grown = channels.len() + keys.len() + channel.len() + key.len() + 2;
            if !channels.is_empty() && grown > max {
                lines.push(self.client.encode("JOIN", &[&channels, &keys], None)?);
                channels.clear();
                keys.clear();
            }
            if !channels.is_empty() {
                channels.push(',');
                keys.push(',');
            }
            channels.push_str(channel);
            keys.push_str(key);
        }
        if !channels.is_empty() {
            lines.push(self.client.encode("JOIN", &[&channels, &keys], None)?);
        }
        self.client.send_lines(lines)
    }

    /// Leave channels, batched like [`join`](Self::join).
    pub fn part<I, S>(&self, channels: I, reason: Option<&str>) -> Result<(), SendError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let channels: Vec<String> = channels.into_iter().map(|c| c.as_ref().to_string()).collect();
        for channel in &channels {
            check_channel(channel)?;
        }
        let reserve = reason.map_or(0, |r| r.len() + 2);
        let max = (MAX_LINE_LEN - 2 - "PART ".len()).saturating_sub(reserve).max(64);
        let lines = batch_list(&channels, max)
            .iter()
            .map(|batch| self.client.encode("PART", &[batch.as_str()], reason))
            .collect::<Result<Vec<_>, _>>()?;
        self.client.send_lines(lines)
    }

    /// PRIVMSG, split over several lines if needed.
    pub fn message(&self, target: &str, text: &str) -> Result<(), SendError> {
        self.split_send("PRIVMSG", target, text)
    }

    pub fn notice(&self, target: &str, text: &str) -> Result<(), SendError> {
        self.split_send("NOTICE", target, text)
    }

    /// CTCP ACTION (`/me`). Embedded `\x01` is stripped from `text`.
    pub fn action(&self, target: &str, text: &str) -> Result<(), SendError> {
        check_target(target)?;
        let clean = text.replace('\x01', "");
        let budget = self.payload_budget("PRIVMSG", target).saturating_sub("\x01ACTION \x01".len());
        let lines = split_payload(&clean, budget)
            .iter()
            .map(|chunk| {
                self.client
                    .encode("PRIVMSG", &[target], Some(&format!("\x01ACTION {chunk}\x01")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        self.client.send_lines(lines)
    }

    /// CTCP request, e.g. `VERSION`.
    pub fn ctcp(&self, target: &str, command: &str, args: Option<&str>) -> Result<(), SendError> {
        check_target(target)?;
        self.client.send("PRIVMSG", &[target], Some(&ctcp_body(command, args)))
    }

    /// CTCP reply, sent as a NOTICE.
    pub fn ctcp_reply(&self, target: &str, command: &str, args: Option<&str>) -> Result<(), SendError> {
        check_target(target)?;
        self.client.send("NOTICE", &[target], Some(&ctcp_body(command, args)))
    }

    pub fn nick(&self, nick: &str) -> Result<(), SendError> {
        check_nick(nick)?;
        self.client.send("NICK", &[nick], None)
    }

    /// Query the topic with `None`, set it otherwise. `Some("")` clears it.
    pub fn topic(&self, channel: &str, text: Option<&str>) -> Result<(), SendError> {
        check_channel(channel)?;
        self.client.send("TOPIC", &[channel], text)
    }

    pub fn kick(&self, channel: &str, nick: &str, reason: Option<&str>) -> Result<(), SendError> {
        check_channel(channel)?;
        check_nick(nick)?;
        self.client.send("KICK", &[channel, nick], reason)
    }

    /// `MODE target modes args..`, e.g. `mode("#chan", "+o", &["nick"])`.
    pub fn mode(&self, target: &str, modes: &str, args: &[&str]) -> Result<(), SendError> {
        check_target(target)?;
        let mut params = vec![target];
        if !modes.is_empty() {
            params.push(modes);
        }
        params.extend_from_slice(args);
        self.client.send("MODE", &params, None)
    }

    pub fn whois(&self, nick: &str) -> Result<(), SendError> {
        check_nick(nick)?;
        self.client.send("WHOIS", &[nick], None)
    }

    pub fn who(&self, target: &str) -> Result<(), SendError> {
        check_target(target)?;
        self.client.send("WHO", &[target], None)
    }

    pub fn list(&self) -> Result<(), SendError> {
        self.client.send("LIST", &[], None)
    }

    pub fn invite(&self, nick: &str, channel: &str) -> Result<(), SendError> {
        check_channel(channel)?;
        check_nick(nick)?;
        self.client.send("INVITE", &[nick, channel], None)
    }

    /// Mark away with a message, or come back with `None`.
    pub fn away(&self, message: Option<&str>) -> Result<(), SendError> {
        self.client.send("AWAY", &[], message.filter(|m| !m.is_empty()))
    }

    /// QUIT with a reason. The server closes the link afterwards; use
    /// [`Client::close`] to also tear the connection down locally.
    pub fn quit(&self, reason: Option<&str>) -> Result<(), SendError> {
        let reason = reason.unwrap_or(&self.client.config().quit_message);
        self.client.send("QUIT", &[], Some(reason))
    }

    pub fn ping(&self, token: &str) -> Result<(), SendError> {
        self.client.send("PING", &[], Some(token))
    }

    /// Any command with arbitrary parameters.
    pub fn raw(&self, command: &str, params: &[&str], trailing: Option<&str>) -> Result<(), SendError> {
        self.client.send(command, params, trailing)
    }

    /// Every chunk is encoded before the first one is queued.
    fn split_send(&self, command: &str, target: &str, text: &str) -> Result<(), SendError> {
        check_target(target)?;
        let lines = split_payload(text, self.payload_budget(command, target))
            .iter()
            .map(|chunk| self.client.encode(command, &[target], Some(chunk)))
            .collect::<Result<Vec<_>, _>>()?;
        self.client.send_lines(lines)
    }

    /// Bytes left for the text of `COMMAND target :text` once the server
    /// has prefixed it with `:nick!user@host `.
    fn payload_budget(&self, command: &str, target: &str) -> usize {
        let nick = self.client.nick();
        let prefix = 1 + nick.len() + 1 + self.client.config().user().len() + 1 + HOST_RESERVE + 1;
        let fixed = prefix + command.len() + 1 + target.len() + 2 + 2;
        MAX_LINE_LEN.saturating_sub(fixed).max(32)
    }
}

fn ctcp_body(command: &str, args: Option<&str>) -> String {
    let command = command.replace('\x01', "").to_ascii_uppercase();
    match args.map(|a| a.replace('\x01', "")) {
        Some(args) if !args.is_empty() => format!("\x01{command} {args}\x01"),
        _ => format!("\x01{command}\x01"),
    }
}

fn check_channel(channel: &str) -> Result<(), SendError> {
    if is_valid_channel(channel) {
        Ok(())
    } else {
        Err(SendError::InvalidTarget(channel.to_string()))
    }
}

fn check_nick(nick: &str) -> Result<(), SendError> {
    if is_valid_nick(nick) {
        Ok(())
    } else {
        Err(SendError::InvalidTarget(nick.to_string()))
    }
}

fn check_target(target: &str) -> Result<(), SendError> {
    if is_valid_target(target) {
        Ok(())
    } else {
        Err(SendError::InvalidTarget(target.to_string()))
    }
}

/// Join items with commas into as few strings of at most `max` bytes as
/// possible, keeping their order.
fn batch_list(items: &[String], max: usize) -> Vec<String> {
    let mut batches = Vec::new();
    let mut current = String::new();
    for item in items {
        if !current.is_empty() && current.len() + 1 + item.len() > max {
            batches.push(std::mem::take(&mut current));
        }
        if !current.is_empty() {
            current.push(',');
        }
        current.push_str(item);
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}
