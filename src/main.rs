//! Small demo bot built on the public crabirc API.
//!
//! Usage: `crabirc-bot [config.toml]`. Without an argument the config is read
//! from the user config directory. Log verbosity follows `RUST_LOG`.

use anyhow::{Context, Result};
use crabirc::{config, strip_raw, Client, Command, Event, Topic};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_writer(std::io::stderr)
        .init();

    let cfg = match std::env::args().nth(1) {
        Some(path) => config::load_config_from(&PathBuf::from(path))?,
        None => config::load_config()?,
    };
    let client = Client::new(cfg).context("Invalid configuration")?;

    client.handlers().add(Command::Privmsg, on_privmsg);
    client.handlers().add(Topic::All, |_: &Client, e: &Event| {
        if let Some(line) = e.pretty() {
            println!("{}", strip_raw(&line));
        }
    });

    client
        .connect()
        .await
        .with_context(|| format!("Failed to connect to {}", client.config().address()))?;
    client.run().await;
    Ok(())
}

/// `!hello`, `!stop` and `!restart`.
fn on_privmsg(client: &Client, event: &Event) {
    let Some(text) = event.trailing.as_deref() else {
        return;
    };
    let reply_to = match (event.params.first(), event.nick()) {
        (Some(target), _) if event.is_from_channel() => target.clone(),
        (_, Some(nick)) => nick.to_string(),
        _ => return,
    };

    if text.starts_with("!hello") {
        if let Err(e) = client.cmd().message(&reply_to, "hello world!") {
            tracing::warn!(error = %e, "reply failed");
        }
    } else if text.starts_with("!stop") {
        client.stop();
    } else if text.starts_with("!restart") {
        let client = client.clone();
        tokio::spawn(async move {
            if let Err(e) = client.reconnect().await {
                tracing::error!(error = %e, "restart failed");
            }
        });
    }
}
