//! Scripted IRC server for integration tests.
//!
//! Each test binds its own listener on an ephemeral port and plays the server
//! side of the conversation line by line.

#![allow(dead_code)]

use crabirc::{Client, ClientConfig, Event, Topic};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::time::timeout;

pub const STEP: Duration = Duration::from_secs(5);

pub struct FakeServer {
    listener: TcpListener,
    pub port: u16,
}

impl FakeServer {
    pub async fn bind() -> anyhow::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        Ok(Self { listener, port })
    }

    pub async fn accept(&self) -> anyhow::Result<Peer> {
        let (stream, _) = timeout(STEP, self.listener.accept()).await??;
        let (read_half, write_half) = stream.into_split();
        Ok(Peer {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
        })
    }

    /// Accept within `dur`, or `None` if nobody connects.
    pub async fn try_accept(&self, dur: Duration) -> Option<Peer> {
        let (stream, _) = timeout(dur, self.listener.accept()).await.ok()?.ok()?;
        let (read_half, write_half) = stream.into_split();
        Some(Peer {
            lines: BufReader::new(read_half).lines(),
            writer: write_half,
        })
    }

    /// Config pointing at this server, with flood control off and short
    /// timeouts.
    pub fn config(&self) -> ClientConfig {
        let mut cfg = ClientConfig::new("127.0.0.1", "test");
        cfg.port = Some(self.port);
        cfg.rate_limit.enabled = false;
        cfg.timeouts.connect_ms = 2_000;
        cfg.timeouts.handshake_ms = 2_000;
        cfg
    }
}

/// The server end of one accepted connection.
pub struct Peer {
    lines: Lines<BufReader<OwnedReadHalf>>,
    writer: OwnedWriteHalf,
}

impl Peer {
    pub async fn send(&mut self, line: &str) -> anyhow::Result<()> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Next line from the client, `None` at EOF.
    pub async fn recv(&mut self) -> anyhow::Result<Option<String>> {
        Ok(timeout(STEP, self.lines.next_line()).await??)
    }

    /// Skip lines until one starts with `prefix`.
    pub async fn expect(&mut self, prefix: &str) -> anyhow::Result<String> {
        loop {
            match self.recv().await? {
                Some(line) if line.starts_with(prefix) => return Ok(line),
                Some(_) => continue,
                None => anyhow::bail!("connection closed while waiting for {prefix:?}"),
            }
        }
    }

    /// Everything the client sends until it closes the connection.
    pub async fn drain(&mut self) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(Ok(Some(line))) = timeout(STEP, self.lines.next_line()).await {
            seen.push(line);
        }
        seen
    }

    /// Wait for NICK/USER and welcome `nick`.
    pub async fn register(&mut self, nick: &str) -> anyhow::Result<()> {
        self.expect("USER ").await?;
        self.send(&format!(":irc.test 001 {nick} :Welcome to the test network"))
            .await
    }
}

/// Forward every event on `topic` into a channel.
pub fn capture(client: &Client, topic: impl Into<Topic>) -> mpsc::UnboundedReceiver<Event> {
    let (tx, rx) = mpsc::unbounded_channel();
    client.handlers().add(topic, move |_: &Client, e: &Event| {
        let _ = tx.send(e.clone());
    });
    rx
}

pub async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
    timeout(STEP, rx.recv())
        .await
        .expect("timed out waiting for event")
        .expect("handler channel closed")
}

/// Connect `client` while `peer` registers it. Returns the server side.
pub async fn connect(client: &Client, server: &FakeServer) -> Peer {
    let (result, peer) = tokio::join!(client.connect(), async {
        let mut peer = server.accept().await.unwrap();
        peer.register(&client.config().nick).await.unwrap();
        peer
    });
    result.unwrap();
    peer
}
