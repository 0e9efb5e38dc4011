//! Network transport, registration handshake, and the per-session read and
//! write loops.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::client::Client;
use crate::config::ClientConfig;
use crate::error::{ConnectError, SendError, Stage};
use crate::irc::codec::{decode, encode, IrcCodec};
use crate::irc::event::{Command, Event};
use crate::irc::manager;
use crate::logging::{log_traffic, Direction};

const ERR_ERRONEUSNICKNAME: u16 = 432;
const ERR_NICKNAMEINUSE: u16 = 433;
const ERR_NICKCOLLISION: u16 = 436;
const ERR_UNAVAILRESOURCE: u16 = 437;
const ERR_PASSWDMISMATCH: u16 = 464;
const RPL_WELCOME: u16 = 1;
const ERR_NICKLOCKED: u16 = 902;
const RPL_SASLSUCCESS: u16 = 903;
const ERR_SASLFAIL: u16 = 904;
const ERR_SASLTOOLONG: u16 = 905;
const ERR_SASLABORTED: u16 = 906;

const SASL_CHUNK: usize = 400;

/// Anything the engine can speak IRC over.
pub(crate) trait IrcStream: AsyncRead + AsyncWrite + Unpin + Send {}
impl<T: AsyncRead + AsyncWrite + Unpin + Send> IrcStream for T {}

pub(crate) type BoxedStream = Box<dyn IrcStream>;
pub(crate) type LineReader = FramedRead<ReadHalf<BoxedStream>, IrcCodec>;
pub(crate) type LineWriter = FramedWrite<WriteHalf<BoxedStream>, IrcCodec>;

pub(crate) fn split(stream: BoxedStream) -> (LineReader, LineWriter) {
    let (r, w) = tokio::io::split(stream);
    (
        FramedRead::new(r, IrcCodec::new()),
        FramedWrite::new(w, IrcCodec::new()),
    )
}

/// Resolve, connect and optionally wrap in TLS.
pub(crate) async fn establish(config: &ClientConfig) -> Result<BoxedStream, ConnectError> {
    let host = config.server.clone();
    let addr = config.address();
    let limit = config.timeouts.connect();

    let addrs: Vec<SocketAddr> = timeout(limit, tokio::net::lookup_host((host.as_str(), config.port())))
        .await
        .map_err(|_| ConnectError::Timeout {
            stage: Stage::Connect,
            after: limit,
        })?
        .map_err(|source| ConnectError::Dns {
            host: host.clone(),
            source,
        })?
        .collect();
    if addrs.is_empty() {
        return Err(ConnectError::NoAddress(host));
    }

    let tcp = timeout(limit, connect_any(&addrs))
        .await
        .map_err(|_| ConnectError::Timeout {
            stage: Stage::Connect,
            after: limit,
        })?
        .map_err(|source| ConnectError::Tcp {
            addr: addr.clone(),
            source,
        })?;
    let _ = tcp.set_nodelay(true);
    debug!(server = %addr, tls = config.tls.enabled, "tcp connected");

    if !config.tls.enabled {
        return Ok(Box::new(tcp));
    }

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    let tls_config = if config.tls.accept_invalid_certs {
        rustls_insecure_config()
    } else {
        rustls_default_config()
    };
    let connector = TlsConnector::from(Arc::new(tls_config));
    let server_name = rustls::pki_types::ServerName::try_from(host.clone())
        .map_err(|_| ConnectError::InvalidServerName(host.clone()))?;
    let tls = timeout(limit, connector.connect(server_name, tcp))
        .await
        .map_err(|_| ConnectError::Timeout {
            stage: Stage::Tls,
            after: limit,
        })?
        .map_err(|source| ConnectError::Tls { addr, source })?;
    Ok(Box::new(tls))
}

async fn connect_any(addrs: &[SocketAddr]) -> std::io::Result<TcpStream> {
    let mut last_err = None;
    for addr in addrs {
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, "no address")))
}

fn rustls_default_config() -> rustls::ClientConfig {
    let root_store = rustls::RootCertStore::from_iter(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth()
}

fn rustls_insecure_config() -> rustls::ClientConfig {
    rustls::ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
        .with_no_client_auth()
}

#[derive(Debug)]
struct InsecureVerifier;

impl rustls::client::danger::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::aws_lc_rs::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

async fn write_now(
    client: &Client,
    writer: &mut LineWriter,
    line: Result<String, SendError>,
) -> Result<(), ConnectError> {
    let line = line.map_err(|e| ConnectError::Handshake(format!("cannot encode registration line: {e}")))?;
    log_traffic(client.config().debug.as_ref(), Direction::Outbound, &line);
    writer.send(line).await?;
    Ok(())
}

/// Nick to try after the server rejected `attempt - 1` candidates.
fn nick_candidate(config: &ClientConfig, attempt: usize) -> Option<String> {
    if attempt == 0 {
        return Some(config.nick.clone());
    }
    if let Some(alt) = config.alt_nicks.get(attempt - 1) {
        return Some(alt.clone());
    }
    let underscores = attempt - config.alt_nicks.len();
    (underscores <= 3).then(|| format!("{}{}", config.nick, "_".repeat(underscores)))
}

/// `AUTHENTICATE` payload lines for SASL PLAIN.
fn sasl_plain_lines(user: &str, pass: &str) -> Vec<String> {
    let payload = base64::engine::general_purpose::STANDARD.encode(format!("{user}\0{user}\0{pass}"));
    let mut lines: Vec<String> = payload
        .as_bytes()
        .chunks(SASL_CHUNK)
        .map(|chunk| format!("AUTHENTICATE {}", String::from_utf8_lossy(chunk)))
        .collect();
    if payload.is_empty() || payload.len() % SASL_CHUNK == 0 {
        lines.push("AUTHENTICATE +".to_string());
    }
    lines
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Sasl {
    Off,
    Requested,
    Started,
    Done,
}

/// Run registration until `001`. Every inbound line is also processed as a
/// normal event, so handlers see MOTD notices and the like.
pub(crate) async fn register(
    client: &Client,
    reader: &mut LineReader,
    writer: &mut LineWriter,
) -> Result<(), ConnectError> {
    let config = client.config();

    let mut caps: Vec<String> = config.capabilities.clone();
    let mut sasl = Sasl::Off;
    if config.sasl.is_some() {
        sasl = Sasl::Requested;
        if !caps.iter().any(|c| c.eq_ignore_ascii_case("sasl")) {
            caps.push("sasl".to_string());
        }
    }

    if let Some(pass) = &config.password {
        let line = if pass.contains(' ') {
            encode("PASS", &[], Some(pass))
        } else {
            encode("PASS", &[pass], None)
        };
        write_now(client, writer, line).await?;
    }
    if !caps.is_empty() {
        write_now(client, writer, encode("CAP", &["REQ"], Some(&caps.join(" ")))).await?;
    }
    let mut nick_attempt = 0;
    write_now(client, writer, encode("NICK", &[&config.nick], None)).await?;
    write_now(
        client,
        writer,
        encode("USER", &[config.user(), "0", "*"], Some(config.name())),
    )
    .await?;

    loop {
        let line = match reader.next().await {
            Some(Ok(line)) => line,
            Some(Err(e)) => return Err(ConnectError::Io(e)),
            None => {
                return Err(ConnectError::Handshake(
                    "connection closed during registration".into(),
                ))
            }
        };
        log_traffic(config.debug.as_ref(), Direction::Inbound, &line);
        let event = decode(&line);
        if event.is_unparseable() {
            warn!(line = %line, "skipping malformed line during registration");
            continue;
        }

        if event.command == Command::Ping {
            write_now(client, writer, pong_for(&event)).await?;
        }
        client.process(&event);

        match &event.command {
            Command::Cap => {
                let sub = event.params.get(1).map(|s| s.to_ascii_uppercase());
                let listed: Vec<&str> = event.last().unwrap_or("").split_whitespace().collect();
                match sub.as_deref() {
                    Some("ACK") if sasl == Sasl::Requested && listed.iter().any(|c| c.eq_ignore_ascii_case("sasl")) => {
                        sasl = Sasl::Started;
                        write_now(client, writer, encode("AUTHENTICATE", &["PLAIN"], None)).await?;
                    }
                    Some("NAK") if sasl == Sasl::Requested && listed.iter().any(|c| c.eq_ignore_ascii_case("sasl")) => {
                        return Err(ConnectError::AuthRejected(
                            "server refused the sasl capability".into(),
                        ));
                    }
                    Some("ACK" | "NAK") if sasl != Sasl::Started => {
                        write_now(client, writer, encode("CAP", &["END"], None)).await?;
                    }
                    _ => {}
                }
            }
            Command::Authenticate if sasl == Sasl::Started && event.last() == Some("+") => {
                if let Some(creds) = &config.sasl {
                    for line in sasl_plain_lines(&creds.user, &creds.pass) {
                        write_now(client, writer, Ok(line)).await?;
                    }
                }
            }
            Command::Numeric(RPL_SASLSUCCESS) => {
                sasl = Sasl::Done;
                write_now(client, writer, encode("CAP", &["END"], None)).await?;
            }
            Command::Numeric(ERR_NICKLOCKED | ERR_SASLFAIL | ERR_SASLTOOLONG | ERR_SASLABORTED) => {
                return Err(ConnectError::AuthRejected(
                    event.last().unwrap_or("authentication failed").to_string(),
                ));
            }
            Command::Numeric(ERR_PASSWDMISMATCH) => {
                return Err(ConnectError::AuthRejected(
                    event.last().unwrap_or("password incorrect").to_string(),
                ));
            }
            Command::Numeric(
                ERR_ERRONEUSNICKNAME | ERR_NICKNAMEINUSE | ERR_NICKCOLLISION | ERR_UNAVAILRESOURCE,
            ) => {
                nick_attempt += 1;
                let Some(nick) = nick_candidate(config, nick_attempt) else {
                    return Err(ConnectError::Handshake("no usable nickname".into()));
                };
                debug!(nick = %nick, "nickname rejected, trying another");
                write_now(client, writer, encode("NICK", &[&nick], None)).await?;
            }
            Command::Numeric(RPL_WELCOME) => return Ok(()),
            Command::Error => {
                return Err(ConnectError::Handshake(
                    event.last().unwrap_or("server closed the link").to_string(),
                ));
            }
            _ => {}
        }
    }
}

pub(crate) fn pong_for(ping: &Event) -> Result<String, SendError> {
    encode("PONG", &[], Some(ping.last().unwrap_or("")))
}

/// Drain the outbound queue onto the socket, one line at a time.
///
/// Ends when every sender is gone (the queue is drained first, so a queued
/// QUIT still goes out) or when a write fails, in which case the session is
/// cancelled so the read loop notices.
pub(crate) async fn write_loop(
    client: Client,
    mut writer: LineWriter,
    mut queue: mpsc::UnboundedReceiver<String>,
    cancel: CancellationToken,
) {
    let limiter = client
        .config()
        .rate_limit
        .quota()
        .map(governor::RateLimiter::direct);
    let debug_sink = client.config().debug.clone();

    while let Some(line) = queue.recv().await {
        if let Some(limiter) = &limiter {
            if limiter.check().is_err() {
                debug!(queued = queue.len(), "rate limited, delaying send");
                limiter.until_ready().await;
            }
        }
        log_traffic(debug_sink.as_ref(), Direction::Outbound, &line);
        if let Err(e) = writer.send(line).await {
            warn!(error = %e, "write failed");
            cancel.cancel();
            return;
        }
    }
    let _ = writer.close().await;
}

/// Read, decode and dispatch until the stream ends or the session is
/// cancelled. Always dispatches a final `Disconnected` event.
pub(crate) async fn read_loop(
    client: Client,
    session_id: u64,
    mut reader: LineReader,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
) {
    let timeouts = client.config().timeouts.clone();
    let debug_sink = client.config().debug.clone();
    let mut ping_sent: Option<(String, Instant)> = None;

    let reason = loop {
        let wait = if ping_sent.is_some() {
            timeouts.ping_timeout()
        } else {
            timeouts.idle()
        };
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => break "connection closed".to_string(),
            next = timeout(wait, reader.next()) => next,
        };

        let line = match next {
            Err(_) if ping_sent.is_some() => break "ping timeout".to_string(),
            Err(_) => {
                let token = chrono::Utc::now().timestamp_millis().to_string();
                debug!("read idle, pinging server");
                if let Ok(line) = encode("PING", &[], Some(&token)) {
                    let _ = outbound.send(line);
                }
                ping_sent = Some((token, Instant::now()));
                continue;
            }
            Ok(None) => break "connection closed by server".to_string(),
            Ok(Some(Err(e))) => break format!("read error: {e}"),
            Ok(Some(Ok(line))) => line,
        };

        log_traffic(debug_sink.as_ref(), Direction::Inbound, &line);
        let event = decode(&line);
        if event.is_unparseable() {
            warn!(line = %line, error = ?event.decode_error(), "skipping malformed line");
            continue;
        }

        // any traffic proves liveness
        if let Some((token, sent)) = ping_sent.take() {
            if event.command == Command::Pong && event.last() == Some(token.as_str()) {
                let lag = sent.elapsed();
                client.inner.state.send_modify(|s| s.lag = Some(lag));
            }
        }
        if event.command == Command::Ping {
            if let Ok(pong) = pong_for(&event) {
                let _ = outbound.send(pong);
            }
        }

        client.process(&event);
    };

    drop(outbound);
    manager::session_ended(&client, session_id, reason);
}
