//! Connection lifecycle: connect, close, reconnect and stop.
//!
//! A *session* is one registered connection: an outbound queue, a writer task,
//! a reader task, and the token that cancels them. At most one session exists
//! per client. Every public lifecycle call bumps a generation counter so that
//! a pending retry from an older generation gives up instead of racing a newer
//! request. Bumping the generation also cancels its abort token, which
//! unblocks an attempt that is still resolving, connecting or registering.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use rand::RngExt;

use crate::client::{Client, Status};
use crate::error::{ConnectError, SendError, Stage};
use crate::irc::codec::encode;
use crate::irc::connection;
use crate::irc::event::{Command, Event};

/// How long `close_and_wait` lets the writer flush before aborting it.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// The current generation and the token that aborts its pending attempt.
struct Generation {
    id: u64,
    abort: CancellationToken,
}

struct Session {
    id: u64,
    outbound: mpsc::UnboundedSender<String>,
    cancel: CancellationToken,
    writer: JoinHandle<()>,
    reader: Option<JoinHandle<()>>,
}

pub(crate) struct ConnectionManager {
    status: watch::Sender<Status>,
    session: Mutex<Option<Session>>,
    /// Serialises connect, reconnect and retry attempts.
    lifecycle: tokio::sync::Mutex<()>,
    generation: Mutex<Generation>,
    next_session: AtomicU64,
    stopped: AtomicBool,
    /// True while a session is up or a retry is pending. `run` waits on it.
    active: watch::Sender<bool>,
}

impl ConnectionManager {
    pub(crate) fn new() -> Self {
        Self {
            status: watch::channel(Status::Disconnected).0,
            session: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
            generation: Mutex::new(Generation {
                id: 0,
                abort: CancellationToken::new(),
            }),
            next_session: AtomicU64::new(1),
            stopped: AtomicBool::new(false),
            active: watch::channel(false).0,
        }
    }

    pub(crate) fn status(&self) -> Status {
        *self.status.borrow()
    }

    pub(crate) fn watch_status(&self) -> watch::Receiver<Status> {
        self.status.subscribe()
    }

    fn set_status(&self, status: Status) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            debug!(from = ?*current, to = ?status, "status");
            *current = status;
            true
        });
    }

    fn bump_generation(&self) -> u64 {
        let mut current = self.generation.lock();
        current.abort.cancel();
        current.abort = CancellationToken::new();
        current.id += 1;
        current.id
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.lock().id == generation
    }

    /// Token cancelled once `generation` is superseded. Already cancelled if
    /// it is stale.
    fn abort_token(&self, generation: u64) -> CancellationToken {
        let current = self.generation.lock();
        if current.id == generation {
            current.abort.clone()
        } else {
            let stale = CancellationToken::new();
            stale.cancel();
            stale
        }
    }

    /// Clear `active` unless a newer request or a live session owns it.
    fn go_idle_if_current(&self, generation: u64) {
        let current = self.generation.lock();
        if current.id == generation && self.session.lock().is_none() {
            self.active.send_replace(false);
        }
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Queue a line on the live session.
    pub(crate) fn send(&self, line: String) -> Result<(), SendError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(SendError::NotConnected)?;
        session
            .outbound
            .send(line)
            .map_err(|_| SendError::NotConnected)
    }

    /// Queue several lines under one lock, so no other sender interleaves.
    pub(crate) fn send_all(&self, lines: Vec<String>) -> Result<(), SendError> {
        let session = self.session.lock();
        let session = session.as_ref().ok_or(SendError::NotConnected)?;
        for line in lines {
            session
                .outbound
                .send(line)
                .map_err(|_| SendError::NotConnected)?;
        }
        Ok(())
    }

    /// Wait until no session is up and no retry is pending.
    pub(crate) async fn wait_idle(&self) {
        let mut active = self.active.subscribe();
        let _ = active.wait_for(|running| !running).await;
    }
}

pub(crate) async fn connect(client: &Client) -> Result<(), ConnectError> {
    let manager = &client.inner.manager;
    manager.stopped.store(false, Ordering::SeqCst);
    let generation = manager.bump_generation();

    let _guard = manager.lifecycle.lock().await;
    if !manager.is_current(generation) {
        return Err(ConnectError::Superseded);
    }
    if manager.session.lock().is_some() {
        return Err(ConnectError::AlreadyConnected);
    }
    attempt_or_schedule(client, generation).await
}

pub(crate) async fn reconnect(client: &Client) -> Result<(), ConnectError> {
    let manager = &client.inner.manager;
    manager.stopped.store(false, Ordering::SeqCst);
    let generation = manager.bump_generation();

    let _guard = manager.lifecycle.lock().await;
    if !manager.is_current(generation) {
        return Err(ConnectError::Superseded);
    }
    if let Some(session) = take_session(client, None) {
        info!("reconnecting");
        finish(session).await;
    }
    attempt_or_schedule(client, generation).await
}

async fn attempt_or_schedule(client: &Client, generation: u64) -> Result<(), ConnectError> {
    match attempt(client, generation).await {
        Ok(()) => Ok(()),
        Err(e @ (ConnectError::Superseded | ConnectError::Stopped)) => {
            debug!(error = %e, "connect abandoned");
            Err(e)
        }
        Err(e) => {
            warn!(server = %client.config().address(), error = %e, "connect failed");
            schedule_retry(client, generation, 1);
            Err(e)
        }
    }
}

/// Close the session with a QUIT. Does not wait for the socket to drain.
pub(crate) fn close(client: &Client, reason: Option<&str>) {
    let manager = &client.inner.manager;
    let generation = manager.bump_generation();
    if let Some(session) = take_session(client, reason) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(finish(session));
            }
            Err(_) => drop(session),
        }
    }
    manager.go_idle_if_current(generation);
}

pub(crate) async fn close_and_wait(client: &Client, reason: Option<&str>) {
    let manager = &client.inner.manager;
    let generation = manager.bump_generation();
    if let Some(session) = take_session(client, reason) {
        finish(session).await;
    }
    manager.go_idle_if_current(generation);
}

/// Close and refuse automatic reconnects until the next explicit connect.
pub(crate) fn stop(client: &Client) {
    client.inner.manager.stopped.store(true, Ordering::SeqCst);
    close(client, None);
}

/// Detach the live session, queue the QUIT and cancel the reader. The writer
/// keeps running until the queue is drained.
fn take_session(client: &Client, reason: Option<&str>) -> Option<Session> {
    let manager = &client.inner.manager;
    let session = manager.session.lock().take()?;
    manager.set_status(Status::Closing);
    let reason = reason.unwrap_or(&client.config().quit_message);
    if let Ok(quit) = encode("QUIT", &[], Some(reason)) {
        let _ = session.outbound.send(quit);
    }
    session.cancel.cancel();
    client.inner.state.send_modify(|s| s.reset_session());
    manager.set_status(Status::Disconnected);
    Some(session)
}

/// Let the writer flush and both tasks end, aborting whatever overstays.
async fn finish(session: Session) {
    let Session {
        id,
        outbound,
        writer,
        reader,
        ..
    } = session;
    drop(outbound);
    let mut writer = writer;
    if timeout(CLOSE_GRACE, &mut writer).await.is_err() {
        debug!(session = id, "writer did not drain in time");
        writer.abort();
    }
    if let Some(mut reader) = reader {
        if timeout(CLOSE_GRACE, &mut reader).await.is_err() {
            reader.abort();
        }
    }
}

/// One full connection attempt. Caller holds the lifecycle lock.
async fn attempt(client: &Client, generation: u64) -> Result<(), ConnectError> {
    let manager = &client.inner.manager;
    let config = client.config();
    if manager.is_stopped() {
        return Err(ConnectError::Stopped);
    }

    let abort = manager.abort_token(generation);

    manager.set_status(Status::Connecting);
    client.inner.state.send_modify(|s| s.reset_session());
    info!(server = %config.address(), "connecting");

    let registering = async {
        let stream = connection::establish(config).await?;
        let (mut reader, mut writer) = connection::split(stream);
        let limit = config.timeouts.handshake();
        timeout(limit, connection::register(client, &mut reader, &mut writer))
            .await
            .map_err(|_| ConnectError::Timeout {
                stage: Stage::Handshake,
                after: limit,
            })??;
        Ok::<_, ConnectError>((reader, writer))
    };
    let registered = tokio::select! {
        biased;
        _ = abort.cancelled() => Err(if manager.is_stopped() {
            ConnectError::Stopped
        } else {
            ConnectError::Superseded
        }),
        result = registering => result,
    };

    let (reader, writer) = match registered {
        Ok(halves) => halves,
        Err(e) => {
            manager.set_status(Status::Disconnected);
            return Err(e);
        }
    };

    let id = manager.next_session.fetch_add(1, Ordering::Relaxed);
    let (outbound, queue) = mpsc::unbounded_channel();
    let cancel = CancellationToken::new();
    {
        // a close that bumps the generation either lands before this block
        // and we give up, or after it and finds the session to take
        let current = manager.generation.lock();
        if current.id != generation || manager.is_stopped() {
            drop(current);
            manager.set_status(Status::Disconnected);
            return Err(ConnectError::Superseded);
        }
        let writer = tokio::spawn(connection::write_loop(
            client.clone(),
            writer,
            queue,
            cancel.clone(),
        ));
        *manager.session.lock() = Some(Session {
            id,
            outbound: outbound.clone(),
            cancel: cancel.clone(),
            writer,
            reader: None,
        });
        manager.set_status(Status::Connected);
        manager.active.send_replace(true);
    }
    info!(server = %config.address(), nick = %client.nick(), "registered");

    client.process(&Event::synthetic(Command::Connected, Some(config.address())));
    if !config.channels.is_empty() {
        if let Err(e) = client.cmd().join(&config.channels) {
            warn!(error = %e, "auto-join failed");
        }
    }

    let reader = tokio::spawn(connection::read_loop(
        client.clone(),
        id,
        reader,
        outbound,
        cancel,
    ));
    if let Some(session) = manager.session.lock().as_mut().filter(|s| s.id == id) {
        session.reader = Some(reader);
    }
    Ok(())
}

/// Called by a read loop on its way out.
pub(crate) fn session_ended(client: &Client, id: u64, reason: String) {
    let manager = &client.inner.manager;
    let lost = {
        let mut slot = manager.session.lock();
        if slot.as_ref().is_some_and(|s| s.id == id) {
            slot.take()
        } else {
            None
        }
    };

    if let Some(session) = &lost {
        warn!(session = id, reason = %reason, "connection lost");
        session.cancel.cancel();
        client.inner.state.send_modify(|s| s.reset_session());
        manager.set_status(Status::Disconnected);
    } else {
        debug!(session = id, "session closed");
    }

    // taken before dispatch so a handler that closes cancels the retry
    let generation = manager.generation.lock().id;
    client.process(&Event::synthetic(Command::Disconnected, Some(reason)));

    if let Some(session) = lost {
        let client = client.clone();
        // the old socket is fully gone before any retry starts
        tokio::spawn(async move {
            finish(Session {
                reader: None,
                ..session
            })
            .await;
            schedule_retry(&client, generation, 1);
        });
    }
}

/// Start a supervised retry loop, or mark the client idle if retries are off.
/// A stale generation does nothing: whoever superseded it owns `active`.
fn schedule_retry(client: &Client, generation: u64, attempt: u32) {
    let manager = &client.inner.manager;
    let policy = &client.config().reconnect;
    let current = manager.generation.lock();
    if current.id != generation {
        debug!("retry superseded before it was scheduled");
        return;
    }
    if !policy.allows(attempt) || manager.is_stopped() {
        if manager.session.lock().is_none() {
            manager.active.send_replace(false);
        }
        return;
    }
    manager.active.send_replace(true);
    drop(current);
    tokio::spawn(supervise(client.clone(), generation, attempt));
}

async fn supervise(client: Client, generation: u64, mut attempt: u32) {
    let manager = &client.inner.manager;
    let policy = client.config().reconnect.clone();
    let abort = manager.abort_token(generation);

    loop {
        if !policy.allows(attempt) {
            info!(attempts = attempt - 1, "giving up on reconnect");
            break;
        }
        let delay = with_jitter(policy.base_delay(attempt), policy.jitter);
        info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
        tokio::select! {
            _ = abort.cancelled() => {
                debug!("reconnect superseded");
                break;
            }
            _ = tokio::time::sleep(delay) => {}
        }

        let _guard = manager.lifecycle.lock().await;
        if !manager.is_current(generation) || manager.is_stopped() {
            debug!("reconnect superseded");
            break;
        }
        if manager.session.lock().is_some() {
            break;
        }
        match self::attempt(&client, generation).await {
            Ok(()) | Err(ConnectError::Superseded | ConnectError::Stopped) => break,
            Err(e) => {
                warn!(attempt, error = %e, "reconnect failed");
                attempt += 1;
            }
        }
    }

    manager.go_idle_if_current(generation);
}

fn with_jitter(base: Duration, jitter: f64) -> Duration {
    let jitter = jitter.clamp(0.0, 1.0);
    if jitter == 0.0 || base.is_zero() {
        return base;
    }
    let extra = base.as_secs_f64() * jitter * rand::rng().random_range(0.0..1.0);
    base + Duration::from_secs_f64(extra)
}
