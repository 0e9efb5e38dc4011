//! Configuration data model.
//!
//! All structs derive `Serialize`/`Deserialize` for TOML persistence. Every
//! optional field has a default so a config only needs `server` and `nick`.
//! Defaults that depend on other fields (port, user, real name) are filled in
//! by [`ClientConfig::prepare`], which [`Client::new`](crate::Client::new) calls.

use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;
use std::time::Duration;

use crate::error::ConfigError;
use crate::irc::format::{is_valid_nick, is_valid_user};
use crate::logging::Sink;

pub const DEFAULT_PORT: u16 = 6667;
pub const DEFAULT_TLS_PORT: u16 = 6697;

/// Everything a [`Client`](crate::Client) needs. Immutable once the client
/// is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Hostname or IP address of the IRC server.
    pub server: String,
    /// Defaults to 6697 with TLS, 6667 without.
    #[serde(default)]
    pub port: Option<u16>,
    /// Server password sent with `PASS`.
    #[serde(default)]
    pub password: Option<String>,
    pub nick: String,
    /// Tried in order when the server rejects `nick` during registration.
    #[serde(default)]
    pub alt_nicks: Vec<String>,
    /// Ident. Defaults to `nick`.
    #[serde(default)]
    pub user: Option<String>,
    /// Real name. Defaults to `nick`.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub sasl: Option<SaslConfig>,
    #[serde(default)]
    pub tls: TlsConfig,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Extra capabilities to request during registration.
    #[serde(default)]
    pub capabilities: Vec<String>,
    /// Channels joined right after registration.
    #[serde(default)]
    pub channels: Vec<String>,
    /// Glob masks matched against `nick!user@host`. Messages from matching
    /// sources are not dispatched to handlers.
    #[serde(default)]
    pub ignore: Vec<String>,
    /// Cut overlong outbound lines instead of rejecting them.
    #[serde(default)]
    pub truncate_long_lines: bool,
    #[serde(default = "default_quit_message")]
    pub quit_message: String,
    /// File that receives raw traffic when no `debug` sink is given.
    #[serde(default)]
    pub raw_log: Option<String>,
    /// Receives pretty-printed events.
    #[serde(skip)]
    pub out: Option<Sink>,
    /// Receives raw traffic and handler failures.
    #[serde(skip)]
    pub debug: Option<Sink>,
}

impl ClientConfig {
    /// Minimal config; everything else takes its default.
    pub fn new(server: impl Into<String>, nick: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            port: None,
            password: None,
            nick: nick.into(),
            alt_nicks: Vec::new(),
            user: None,
            name: None,
            sasl: None,
            tls: TlsConfig::default(),
            reconnect: ReconnectPolicy::default(),
            rate_limit: RateLimitConfig::default(),
            timeouts: TimeoutConfig::default(),
            capabilities: Vec::new(),
            channels: Vec::new(),
            ignore: Vec::new(),
            truncate_long_lines: false,
            quit_message: default_quit_message(),
            raw_log: None,
            out: None,
            debug: None,
        }
    }

    /// Apply derived defaults and validate.
    pub fn prepare(mut self) -> Result<Self, ConfigError> {
        self.server = self.server.trim().to_string();
        self.nick = self.nick.trim().to_string();
        if self.port.is_none() {
            self.port = Some(if self.tls.enabled { DEFAULT_TLS_PORT } else { DEFAULT_PORT });
        }
        if self.user.as_deref().map_or(true, str::is_empty) {
            self.user = Some(self.nick.clone());
        }
        if self.name.as_deref().map_or(true, str::is_empty) {
            self.name = Some(self.nick.clone());
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.is_empty() {
            return Err(ConfigError::EmptyServer);
        }
        if self.nick.is_empty() {
            return Err(ConfigError::EmptyNick);
        }
        for nick in std::iter::once(&self.nick).chain(&self.alt_nicks) {
            if !is_valid_nick(nick) {
                return Err(ConfigError::InvalidNick(nick.clone()));
            }
        }
        if let Some(user) = &self.user {
            if !is_valid_user(user) {
                return Err(ConfigError::InvalidUser(user.clone()));
            }
        }
        if let Some(sasl) = &self.sasl {
            if sasl.user.is_empty() || sasl.pass.is_empty() {
                return Err(ConfigError::InvalidSasl);
            }
        }
        if self.rate_limit.enabled {
            if self.rate_limit.burst == 0 {
                return Err(ConfigError::InvalidRateLimit("burst must be at least 1".into()));
            }
            if self.rate_limit.period_ms == 0 {
                return Err(ConfigError::InvalidRateLimit("period must be non-zero".into()));
            }
        }
        if self.reconnect.multiplier < 1.0 || !self.reconnect.multiplier.is_finite() {
            return Err(ConfigError::InvalidReconnect("multiplier must be >= 1".into()));
        }
        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(ConfigError::InvalidReconnect(
                "max delay is shorter than the initial delay".into(),
            ));
        }
        if let Some(mask) = self.ignore.iter().find(|m| m.trim().is_empty()) {
            return Err(ConfigError::InvalidIgnoreMask(mask.clone()));
        }
        Ok(())
    }

    pub fn port(&self) -> u16 {
        self.port
            .unwrap_or(if self.tls.enabled { DEFAULT_TLS_PORT } else { DEFAULT_PORT })
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(&self.nick)
    }

    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.nick)
    }

    /// `host:port`, for display and logging.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server, self.port())
    }
}

/// SASL PLAIN credentials.
#[derive(Clone, Serialize, Deserialize)]
pub struct SaslConfig {
    pub user: String,
    pub pass: String,
}

impl std::fmt::Debug for SaslConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SaslConfig")
            .field("user", &self.user)
            .field("pass", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    /// Skip certificate verification (self-signed servers).
    #[serde(default)]
    pub accept_invalid_certs: bool,
}

/// Supervised reconnect with exponential backoff and jitter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectPolicy {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Fraction of the delay added as random jitter, `0.0..=1.0`.
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: false,
            initial_delay_ms: default_initial_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter: default_jitter(),
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    /// Delay before retry number `attempt` (1-based), without jitter.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(32) as i32;
        let ms = (self.initial_delay_ms as f64) * self.multiplier.powi(exp);
        Duration::from_millis(ms.min(self.max_delay_ms as f64) as u64)
    }

    pub fn allows(&self, attempt: u32) -> bool {
        self.enabled && self.max_attempts.map_or(true, |max| attempt <= max)
    }
}

/// Outbound flood control. Sends queue while limited, they are never dropped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Lines that may be sent back to back.
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// One more line is allowed every `period_ms`.
    #[serde(default = "default_period")]
    pub period_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            burst: default_burst(),
            period_ms: default_period(),
        }
    }
}

impl RateLimitConfig {
    pub fn quota(&self) -> Option<governor::Quota> {
        if !self.enabled {
            return None;
        }
        let burst = NonZeroU32::new(self.burst)?;
        governor::Quota::with_period(Duration::from_millis(self.period_ms))
            .map(|q| q.allow_burst(burst))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    #[serde(default = "default_connect_timeout")]
    pub connect_ms: u64,
    #[serde(default = "default_handshake_timeout")]
    pub handshake_ms: u64,
    /// Silence before the client sends its own PING.
    #[serde(default = "default_idle_timeout")]
    pub idle_ms: u64,
    /// Further silence after that PING before the connection is dropped.
    #[serde(default = "default_ping_timeout")]
    pub ping_timeout_ms: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect_ms: default_connect_timeout(),
            handshake_ms: default_handshake_timeout(),
            idle_ms: default_idle_timeout(),
            ping_timeout_ms: default_ping_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn connect(&self) -> Duration {
        Duration::from_millis(self.connect_ms)
    }
    pub fn handshake(&self) -> Duration {
        Duration::from_millis(self.handshake_ms)
    }
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}

fn default_true() -> bool {
    true
}
fn default_quit_message() -> String {
    "crabirc".to_string()
}
fn default_initial_delay() -> u64 {
    5_000
}
fn default_max_delay() -> u64 {
    300_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter() -> f64 {
    0.1
}
fn default_burst() -> u32 {
    5
}
fn default_period() -> u64 {
    2_000
}
fn default_connect_timeout() -> u64 {
    30_000
}
fn default_handshake_timeout() -> u64 {
    60_000
}
fn default_idle_timeout() -> u64 {
    120_000
}
fn default_ping_timeout() -> u64 {
    60_000
}
