//! Wildcard matching for ignore lists and nick masks.
//!
//! Only two metacharacters exist: `*` matches zero or more characters and `?`
//! matches exactly one. Matching is anchored to the whole string.

/// Case-sensitive glob match of `text` against `pattern`.
pub fn glob(text: &str, pattern: &str) -> bool {
    let text: Vec<char> = text.chars().collect();
    let pattern: Vec<char> = pattern.chars().collect();
    matches(&text, &pattern)
}

/// A reusable pattern with matching options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Glob {
    pattern: Vec<char>,
    case_insensitive: bool,
}

impl Glob {
    pub fn new(pattern: &str) -> Self {
        Self {
            pattern: pattern.chars().collect(),
            case_insensitive: false,
        }
    }

    /// ASCII case folding on both sides, applied at match time. IRC
    /// casemapping extras are not applied.
    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.case_insensitive = yes;
        self
    }

    pub fn matches(&self, text: &str) -> bool {
        if !self.case_insensitive {
            let text: Vec<char> = text.chars().collect();
            return matches(&text, &self.pattern);
        }
        let text: Vec<char> = text.chars().map(|c| c.to_ascii_lowercase()).collect();
        let pattern: Vec<char> = self.pattern.iter().map(|c| c.to_ascii_lowercase()).collect();
        matches(&text, &pattern)
    }
}

fn matches(text: &[char], pattern: &[char]) -> bool {
    let mut p = 0;
    let mut t = 0;
    // position of the last '*' seen, and the text index it is currently absorbing up to
    let mut star: Option<usize> = None;
    let mut resume = 0;

    while t < text.len() {
        if p < pattern.len() && pattern[p] == '*' {
            star = Some(p);
            resume = t;
            p += 1;
        } else if p < pattern.len() && (pattern[p] == '?' || pattern[p] == text[t]) {
            p += 1;
            t += 1;
        } else if let Some(sp) = star {
            p = sp + 1;
            resume += 1;
            t = resume;
        } else {
            return false;
        }
    }

    while p < pattern.len() && pattern[p] == '*' {
        p += 1;
    }
    p == pattern.len()
}
