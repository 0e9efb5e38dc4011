//! Line codec: protocol lines to [`Event`]s and back.
//!
//! [`encode`] and [`decode`] are pure string functions. [`IrcCodec`] frames a
//! byte stream into lines for `tokio_util::codec::Framed*`.

use std::io;

use bytes::{BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};
use tracing::warn;

use crate::error::{DecodeError, SendError};
use crate::irc::event::{Command, Event, Source};

/// Protocol ceiling for one line, CRLF included.
pub const MAX_LINE_LEN: usize = 512;

/// Inbound lines may carry up to 8191 bytes of IRCv3 tags in front of the
/// 512-byte message.
pub const MAX_INBOUND_LEN: usize = 8191 + MAX_LINE_LEN;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EncodeOptions {
    /// Cut an overlong trailing parameter instead of failing.
    pub truncate: bool,
}

/// Build one protocol line (without CRLF). Fails instead of truncating.
pub fn encode(command: &str, params: &[&str], trailing: Option<&str>) -> Result<String, SendError> {
    encode_with(command, params, trailing, EncodeOptions::default())
}

pub fn encode_with(
    command: &str,
    params: &[&str],
    trailing: Option<&str>,
    opts: EncodeOptions,
) -> Result<String, SendError> {
    if command.is_empty() || !command.bytes().all(|b| b.is_ascii_alphanumeric()) {
        return Err(SendError::InvalidParam(command.to_string()));
    }
    for param in params {
        if has_forbidden(param) {
            return Err(SendError::InvalidCharacter);
        }
        if param.is_empty() || param.contains(' ') || param.starts_with(':') {
            return Err(SendError::InvalidParam(param.to_string()));
        }
    }
    if trailing.is_some_and(has_forbidden) {
        return Err(SendError::InvalidCharacter);
    }

    let mut line = String::with_capacity(MAX_LINE_LEN);
    line.push_str(command);
    for param in params {
        line.push(' ');
        line.push_str(param);
    }
    let head_len = line.len();
    if let Some(trailing) = trailing {
        line.push_str(" :");
        line.push_str(trailing);
    }

    if line.len() + 2 <= MAX_LINE_LEN {
        return Ok(line);
    }

    let budget = (MAX_LINE_LEN - 2).saturating_sub(head_len + 2);
    match trailing {
        Some(trailing) if opts.truncate && head_len + 2 < MAX_LINE_LEN - 2 => {
            line.truncate(head_len + 2);
            line.push_str(&trailing[..floor_char_boundary(trailing, budget)]);
            Ok(line)
        }
        _ => Err(SendError::LineTooLong {
            len: line.len() + 2,
            max: MAX_LINE_LEN,
        }),
    }
}

fn has_forbidden(s: &str) -> bool {
    s.contains(['\r', '\n', '\0'])
}

fn floor_char_boundary(s: &str, mut index: usize) -> usize {
    if index >= s.len() {
        return s.len();
    }
    while !s.is_char_boundary(index) {
        index -= 1;
    }
    index
}

/// Parse a raw line. Never fails: malformed input becomes an unparseable
/// event so one bad line can't take the connection down.
pub fn decode(raw: &str) -> Event {
    try_decode(raw).unwrap_or_else(|err| Event::unparseable(raw.trim_end_matches(['\r', '\n']), err))
}

pub fn try_decode(raw: &str) -> Result<Event, DecodeError> {
    let line = raw.trim_end_matches(['\r', '\n']);
    let mut rest = line.trim_start_matches(' ');
    if rest.is_empty() {
        return Err(DecodeError::Empty);
    }

    // IRCv3 message tags are not interpreted, only skipped.
    if rest.starts_with('@') {
        let (_, after) = rest.split_once(' ').ok_or(DecodeError::MissingCommand)?;
        rest = after.trim_start_matches(' ');
    }

    let mut source = None;
    if let Some(after_colon) = rest.strip_prefix(':') {
        let (prefix, after) = after_colon
            .split_once(' ')
            .ok_or(DecodeError::DanglingPrefix)?;
        if prefix.is_empty() {
            return Err(DecodeError::DanglingPrefix);
        }
        source = Some(Source::parse(prefix));
        rest = after.trim_start_matches(' ');
    }

    let (command, mut rest) = match rest.split_once(' ') {
        Some((command, after)) => (command, after),
        None => (rest, ""),
    };
    if command.is_empty() {
        return Err(DecodeError::MissingCommand);
    }

    let mut params = Vec::new();
    let mut trailing = None;
    loop {
        rest = rest.trim_start_matches(' ');
        if rest.is_empty() {
            break;
        }
        if let Some(t) = rest.strip_prefix(':') {
            trailing = Some(t.to_string());
            break;
        }
        match rest.split_once(' ') {
            Some((param, after)) => {
                params.push(param.to_string());
                rest = after;
            }
            None => {
                params.push(rest.to_string());
                break;
            }
        }
    }

    Ok(Event::new(
        source,
        Command::from(command),
        params,
        trailing,
        line.to_string(),
    ))
}

/// Split `text` into chunks of at most `max_bytes`, preferring whitespace
/// boundaries. Embedded newlines always start a new chunk.
pub fn split_payload(text: &str, max_bytes: usize) -> Vec<String> {
    let max_bytes = max_bytes.max(1);
    let mut chunks = Vec::new();

    for piece in text.split('\n') {
        let mut piece = piece.trim_end_matches('\r');
        if piece.is_empty() {
            continue;
        }
        while piece.len() > max_bytes {
            let limit = floor_char_boundary(piece, max_bytes);
            let cut = match piece[..limit].rfind(char::is_whitespace) {
                Some(ws) if ws > 0 => ws,
                _ if limit == 0 => piece.chars().next().map_or(piece.len(), char::len_utf8),
                _ => limit,
            };
            chunks.push(piece[..cut].to_string());
            piece = piece[cut..].trim_start();
        }
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
    }

    if chunks.is_empty() {
        chunks.push(String::new());
    }
    chunks
}

/// Newline-delimited framing for a socket.
///
/// Decoding is lenient: invalid UTF-8 is replaced, overlong lines are
/// dropped with a warning, and a partial line at end of stream is discarded.
/// Encoding is strict and refuses lines over [`MAX_LINE_LEN`].
#[derive(Debug)]
pub struct IrcCodec {
    next_index: usize,
    max_inbound: usize,
    discarding: bool,
}

impl IrcCodec {
    pub fn new() -> Self {
        Self::with_max_inbound(MAX_INBOUND_LEN)
    }

    pub fn with_max_inbound(max_inbound: usize) -> Self {
        Self {
            next_index: 0,
            max_inbound,
            discarding: false,
        }
    }
}

impl Default for IrcCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for IrcCodec {
    type Item = String;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        loop {
            let Some(offset) = src[self.next_index..].iter().position(|b| *b == b'\n') else {
                if src.len() > self.max_inbound {
                    if !self.discarding {
                        warn!(len = src.len(), "discarding overlong inbound line");
                    }
                    src.clear();
                    self.discarding = true;
                }
                self.next_index = src.len();
                return Ok(None);
            };

            let line = src.split_to(self.next_index + offset + 1);
            self.next_index = 0;
            if self.discarding {
                // tail of a line we already dropped
                self.discarding = false;
                continue;
            }
            if line.len() > self.max_inbound {
                warn!(len = line.len(), "discarding overlong inbound line");
                continue;
            }

            let text = String::from_utf8_lossy(&line);
            let text = text.trim_end_matches(['\r', '\n']);
            if text.is_empty() {
                continue;
            }
            return Ok(Some(text.to_string()));
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<String>, io::Error> {
        match self.decode(src)? {
            Some(line) => Ok(Some(line)),
            None => {
                // an unterminated line at EOF is never dispatched
                src.clear();
                self.next_index = 0;
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for IrcCodec {
    type Error = io::Error;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), io::Error> {
        if has_forbidden(&line) {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, SendError::InvalidCharacter));
        }
        if line.len() + 2 > MAX_LINE_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                SendError::LineTooLong {
                    len: line.len() + 2,
                    max: MAX_LINE_LEN,
                },
            ));
        }
        dst.reserve(line.len() + 2);
        dst.put_slice(line.as_bytes());
        dst.put_slice(b"\r\n");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_privmsg_with_prefix() {
        let e = decode(":nick!u@h PRIVMSG #chan :hello world");
        assert_eq!(e.command, Command::Privmsg);
        assert_eq!(e.source.as_ref().map(|s| s.to_string()).as_deref(), Some("nick!u@h"));
        assert_eq!(e.params, vec!["#chan"]);
        assert_eq!(e.trailing.as_deref(), Some("hello world"));
        assert_eq!(e.raw(), ":nick!u@h PRIVMSG #chan :hello world");
    }

    #[test]
    fn decode_strips_terminator_and_tags() {
        let e = decode("@time=2024-01-01T00:00:00Z :srv.example 001 me :Welcome home\r\n");
        assert_eq!(e.command, Command::Numeric(1));
        assert_eq!(e.params, vec!["me"]);
        assert_eq!(e.trailing.as_deref(), Some("Welcome home"));
        assert_eq!(e.nick(), Some("srv.example"));
    }

    #[test]
    fn decode_without_trailing() {
        let e = decode("MODE #dev +o alice");
        assert!(e.source.is_none());
        assert_eq!(e.params, vec!["#dev", "+o", "alice"]);
        assert_eq!(e.trailing, None);

        let e = decode("PING :token");
        assert_eq!(e.command, Command::Ping);
        assert_eq!(e.last(), Some("token"));
    }

    #[test]
    fn decode_trailing_keeps_colons_and_spaces() {
        let e = decode(":a!b@c PRIVMSG #x :  spaced :colon: text ");
        assert_eq!(e.trailing.as_deref(), Some("  spaced :colon: text "));
    }

    #[test]
    fn malformed_lines_are_tagged_not_fatal() {
        assert!(decode("").is_unparseable());
        assert!(decode("\r\n").is_unparseable());
        assert_eq!(try_decode(":onlyprefix"), Err(DecodeError::DanglingPrefix));
        assert_eq!(try_decode("@tags-only"), Err(DecodeError::MissingCommand));
        let bad = decode(":prefix-only");
        assert_eq!(bad.command, Command::Unparseable);
        assert_eq!(bad.decode_error(), Some(&DecodeError::DanglingPrefix));
    }

    #[test]
    fn encode_round_trip() {
        let cases: &[(&str, &[&str], Option<&str>)] = &[
            ("PRIVMSG", &["#chan"], Some("hello world")),
            ("JOIN", &["#a,#b", "key1,key2"], None),
            ("QUIT", &[], Some("")),
            ("TOPIC", &["#dev"], Some(":starts with colon")),
        ];
        for (cmd, params, trailing) in cases {
            let line = encode(cmd, params, *trailing).unwrap();
            let e = decode(&line);
            assert_eq!(e.command, Command::from(*cmd));
            assert_eq!(e.params, params.iter().map(|s| s.to_string()).collect::<Vec<_>>());
            assert_eq!(e.trailing.as_deref(), *trailing);
            assert_eq!(e.raw(), line);
        }
    }

    #[test]
    fn encode_rejects_overlong() {
        let text = "x".repeat(600);
        let err = encode("PRIVMSG", &["#chan"], Some(&text)).unwrap_err();
        assert!(matches!(err, SendError::LineTooLong { max: 512, .. }));

        // exactly 510 bytes of content plus CRLF is allowed
        let fill = "y".repeat(510 - "PRIVMSG #c :".len());
        let line = encode("PRIVMSG", &["#c"], Some(&fill)).unwrap();
        assert_eq!(line.len(), 510);
        let over = format!("{fill}y");
        assert!(encode("PRIVMSG", &["#c"], Some(&over)).is_err());
    }

    #[test]
    fn encode_truncates_when_asked() {
        let text = "é".repeat(400);
        let line = encode_with("PRIVMSG", &["#chan"], Some(&text), EncodeOptions { truncate: true }).unwrap();
        assert!(line.len() <= 510);
        assert!(line.starts_with("PRIVMSG #chan :é"));
    }

    #[test]
    fn encode_rejects_injection() {
        assert_eq!(
            encode("PRIVMSG", &["#chan"], Some("hi\r\nQUIT :pwned")),
            Err(SendError::InvalidCharacter)
        );
        assert!(matches!(encode("PRIVMSG", &["a b"], Some("x")), Err(SendError::InvalidParam(_))));
        assert!(matches!(encode("PRIVMSG", &[":x"], None), Err(SendError::InvalidParam(_))));
        assert!(matches!(encode("", &[], None), Err(SendError::InvalidParam(_))));
    }

    #[test]
    fn split_prefers_whitespace() {
        let chunks = split_payload("aaa bbb ccc ddd", 8);
        assert_eq!(chunks, vec!["aaa bbb", "ccc ddd"]);
        for c in &chunks {
            assert!(c.len() <= 8);
        }
    }

    #[test]
    fn split_long_words_and_newlines() {
        assert_eq!(split_payload("abcdefghij", 4), vec!["abcd", "efgh", "ij"]);
        assert_eq!(split_payload("one\r\ntwo\n\nthree", 100), vec!["one", "two", "three"]);
        assert_eq!(split_payload("", 10), vec![""]);
        let multibyte = split_payload("ééééé", 3);
        assert!(multibyte.iter().all(|c| c.len() <= 3 && !c.is_empty()));
        assert_eq!(multibyte.concat(), "ééééé");
    }

    #[test]
    fn codec_frames_lines() {
        let mut codec = IrcCodec::new();
        let mut buf = BytesMut::from(&b"PING :a\r\nPRIVMSG #x :hi\nPART"[..]);
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING :a"));
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PRIVMSG #x :hi"));
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        // unterminated tail is dropped at EOF
        assert_eq!(codec.decode_eof(&mut buf).unwrap(), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn codec_skips_overlong_and_recovers() {
        let mut codec = IrcCodec::with_max_inbound(16);
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[b'x'; 40]);
        assert_eq!(codec.decode(&mut buf).unwrap(), None);
        buf.extend_from_slice(b"xxx\r\nPING :ok\r\n");
        assert_eq!(codec.decode(&mut buf).unwrap().as_deref(), Some("PING :ok"));
    }

    #[test]
    fn codec_encodes_crlf() {
        let mut codec = IrcCodec::new();
        let mut out = BytesMut::new();
        codec.encode("NICK test".to_string(), &mut out).unwrap();
        assert_eq!(&out[..], b"NICK test\r\n");
        assert!(codec.encode("x".repeat(600), &mut out).is_err());
    }
}
