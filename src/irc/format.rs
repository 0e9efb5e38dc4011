//! mIRC formatting removal and client-side name validation.

/// Bold, color, reverse, italic, strikethrough, monospace, underline, reset.
const BOLD: char = '\x02';
const COLOR: char = '\x03';
const HEX_COLOR: char = '\x04';
const RESET: char = '\x0f';
const MONOSPACE: char = '\x11';
const REVERSE: char = '\x16';
const ITALIC: char = '\x1d';
const STRIKE: char = '\x1e';
const UNDERLINE: char = '\x1f';

/// Strip mIRC formatting codes and other non-printable characters.
///
/// Color codes take up to two digits for the foreground and, after a comma,
/// up to two for the background. Hex colors take six hex digits each.
pub fn strip_raw(text: &str) -> String {
    let chars: Vec<char> = text.chars().collect();
    let mut out = String::with_capacity(text.len());
    let mut i = 0;

    while i < chars.len() {
        match chars[i] {
            COLOR => {
                i += 1;
                i = skip_color(&chars, i, 2, |c| c.is_ascii_digit());
            }
            HEX_COLOR => {
                i += 1;
                i = skip_color(&chars, i, 6, |c| c.is_ascii_hexdigit());
            }
            BOLD | RESET | MONOSPACE | REVERSE | ITALIC | STRIKE | UNDERLINE => i += 1,
            c if c.is_control() && c != '\t' => i += 1,
            c => {
                out.push(c);
                i += 1;
            }
        }
    }
    out
}

fn skip_color(chars: &[char], mut i: usize, width: usize, digit: impl Fn(char) -> bool) -> usize {
    let fg_start = i;
    while i < chars.len() && i - fg_start < width && digit(chars[i]) {
        i += 1;
    }
    if i > fg_start && i + 1 < chars.len() && chars[i] == ',' && digit(chars[i + 1]) {
        i += 1;
        let bg_start = i;
        while i < chars.len() && i - bg_start < width && digit(chars[i]) {
            i += 1;
        }
    }
    i
}

const MAX_CHANNEL_LEN: usize = 50;
const MAX_NICK_LEN: usize = 30;

/// `#`, `&`, `+` or `!` followed by 1..=49 bytes without space, comma, BEL,
/// NUL, CR or LF.
pub fn is_valid_channel(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some('#' | '&' | '+' | '!') => {}
        _ => return false,
    }
    if name.len() < 2 || name.len() > MAX_CHANNEL_LEN {
        return false;
    }
    chars.all(|c| !matches!(c, ' ' | ',' | '\x07' | '\0' | '\r' | '\n' | ':'))
}

fn is_special(c: char) -> bool {
    matches!(c, '[' | ']' | '\\' | '`' | '_' | '^' | '{' | '|' | '}')
}

/// RFC 2812 nickname: letter or special first, then letters, digits,
/// specials and `-`.
pub fn is_valid_nick(nick: &str) -> bool {
    if nick.is_empty() || nick.len() > MAX_NICK_LEN {
        return false;
    }
    let mut chars = nick.chars();
    let first = chars.next().unwrap_or(' ');
    if !(first.is_ascii_alphabetic() || is_special(first)) {
        return false;
    }
    chars.all(|c| c.is_ascii_alphanumeric() || is_special(c) || c == '-')
}

/// Ident: printable, no spaces, `@` or control characters.
pub fn is_valid_user(user: &str) -> bool {
    !user.is_empty() && user.chars().all(|c| c.is_ascii_graphic() && c != '@')
}

/// A message target is either a channel or a nickname.
pub fn is_valid_target(target: &str) -> bool {
    is_valid_channel(target) || is_valid_nick(target)
}
