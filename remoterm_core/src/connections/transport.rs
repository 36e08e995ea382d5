use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tokio::time::{timeout, Instant};

use super::errors::{ConnectionError, ConnectionErrorKind};

/// Where the terminal backend lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub url: String,
}

/// What the backend needs to accept the transport itself.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub token: Option<String>,
}

/// One unit read from the link.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Inbound {
    Frame(Vec<u8>),
    /// Answer to a [`Connection::ping`].
    Pong,
}

/// A single open, message-framed link (WebSocket, test fake, ...).
#[async_trait]
pub trait Connection: Send {
    /// Write exactly one frame.
    async fn send(&mut self, frame: &[u8]) -> Result<(), ConnectionError>;
    /// Next frame or pong. `Ok(None)` means the remote closed cleanly.
    /// Must be cancel-safe: it is raced against outbound writes.
    async fn recv(&mut self) -> Result<Option<Inbound>, ConnectionError>;
    /// Ask the remote for a [`Inbound::Pong`].
    async fn ping(&mut self) -> Result<(), ConnectionError>;
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// Opens links. A new link is opened for every (re)connect.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<Box<dyn Connection>, ConnectionError>;
}

/// Lifecycle notifications. `attempt` identifies one connect call.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    Connecting { attempt: u64 },
    Connected { attempt: u64 },
    Disconnecting { attempt: u64 },
    /// Emitted exactly once per attempt, however the attempt ended.
    Disconnected {
        attempt: u64,
        error: Option<ConnectionError>,
    },
    Error { attempt: u64, error: ConnectionError },
}

enum IoEvent {
    Write(Vec<u8>, oneshot::Sender<Result<(), ConnectionError>>),
    Ping(oneshot::Sender<Result<Duration, ConnectionError>>),
    Stop,
}

/// The I/O task of an open link.
///
/// The task owns the `Connection`, serializes every outbound write, forwards
/// inbound frames to the single inbound channel and answers pings.
struct OpenLink {
    attempt: u64,
    io_tx: mpsc::Sender<IoEvent>,
    io_task: tokio::task::JoinHandle<()>,
}

/// A connect call that has not settled yet.
struct PendingConnect {
    attempt: u64,
    cancel: Arc<Notify>,
    /// Closed once the attempt has left `Connecting`.
    settled: watch::Receiver<()>,
}

enum Link {
    Idle,
    Connecting(PendingConnect),
    Open(OpenLink),
}

struct Inner {
    connector: Arc<dyn Connector>,
    connect_timeout: Duration,
    link: Mutex<Link>,
    next_attempt: AtomicU64,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    inbound_rx: Mutex<Option<mpsc::Receiver<Vec<u8>>>>,
    events_tx: broadcast::Sender<TransportEvent>,
}

/// Owns the one physical connection to the backend.
///
/// Cloning is cheap and every clone drives the same link. Inbound frames
/// from all links, across reconnects, arrive on one channel that exactly one
/// consumer claims with [`TransportConnection::take_inbound`].
#[derive(Clone)]
pub struct TransportConnection {
    inner: Arc<Inner>,
}

/// Puts the link back to `Idle` if a connect future is dropped or
/// cancelled mid-flight. Waiters in `disconnect` wake when it goes away.
struct ConnectingGuard<'a> {
    inner: &'a Inner,
    attempt: u64,
    armed: bool,
    _settled: watch::Sender<()>,
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut link = self.inner.link.lock();
        if matches!(&*link, Link::Connecting(pending) if pending.attempt == self.attempt) {
            *link = Link::Idle;
            drop(link);
            debug!("Connect attempt {} cancelled", self.attempt);
            let _ = self.inner.events_tx.send(TransportEvent::Disconnected {
                attempt: self.attempt,
                error: Some(ConnectionError::new(
                    ConnectionErrorKind::Cancelled,
                    "connect cancelled",
                )),
            });
        }
    }
}

impl TransportConnection {
    pub fn new(connector: Arc<dyn Connector>, connect_timeout: Duration) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(1024);
        let (events_tx, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                connector,
                connect_timeout,
                link: Mutex::new(Link::Idle),
                next_attempt: AtomicU64::new(0),
                inbound_tx,
                inbound_rx: Mutex::new(Some(inbound_rx)),
                events_tx,
            }),
        }
    }

    /// Claim the inbound frame stream. Only the first caller gets it.
    pub fn take_inbound(&self) -> Option<mpsc::Receiver<Vec<u8>>> {
        self.inner.inbound_rx.lock().take()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        matches!(&*self.inner.link.lock(), Link::Open(open) if !open.io_task.is_finished())
    }

    /// Attempt id of the currently open link.
    pub fn current_attempt(&self) -> Option<u64> {
        match &*self.inner.link.lock() {
            Link::Open(open) if !open.io_task.is_finished() => Some(open.attempt),
            _ => None,
        }
    }

    fn emit(&self, event: TransportEvent) {
        debug!("Transport event: {:?}", event);
        let _ = self.inner.events_tx.send(event);
    }

    /// Open the link and return its attempt id. A no-op if already
    /// connected; fails if another connect is still in flight. A pending
    /// connect is cancelled by [`disconnect`](Self::disconnect).
    pub async fn connect(
        &self,
        endpoint: &Endpoint,
        credentials: &Credentials,
    ) -> Result<u64, ConnectionError> {
        let cancel = Arc::new(Notify::new());
        let (settled_tx, settled_rx) = watch::channel(());
        let attempt = {
            let mut link = self.inner.link.lock();
            match &*link {
                Link::Open(open) if !open.io_task.is_finished() => {
                    debug!("connect() while already connected; nothing to do");
                    return Ok(open.attempt);
                }
                Link::Connecting(pending) => {
                    return Err(ConnectionError::new(
                        ConnectionErrorKind::ConnectInProgress,
                        format!("attempt {} is still running", pending.attempt),
                    ));
                }
                _ => {}
            }
            let attempt = self.inner.next_attempt.fetch_add(1, Ordering::SeqCst) + 1;
            *link = Link::Connecting(PendingConnect {
                attempt,
                cancel: cancel.clone(),
                settled: settled_rx,
            });
            attempt
        };
        let mut guard = ConnectingGuard {
            inner: &self.inner,
            attempt,
            armed: true,
            _settled: settled_tx,
        };

        info!("Connecting to {} (attempt {})", endpoint.url, attempt);
        self.emit(TransportEvent::Connecting { attempt });

        let opened = tokio::select! {
            result = timeout(
                self.inner.connect_timeout,
                self.inner.connector.open(endpoint, credentials),
            ) => match result {
                Ok(result) => result,
                Err(_) => Err(ConnectionError::timeout("connect")),
            },
            _ = cancel.notified() => {
                // the armed guard resets the link and reports the end
                return Err(ConnectionError::new(
                    ConnectionErrorKind::Cancelled,
                    format!("attempt {attempt} was cancelled"),
                ));
            }
        };

        guard.armed = false;
        match opened {
            Ok(conn) => {
                {
                    // the I/O task cannot report its end before `Connected` is out
                    let mut link = self.inner.link.lock();
                    *link = Link::Open(self.spawn_io(attempt, conn));
                    info!("Connected to {} (attempt {})", endpoint.url, attempt);
                    self.emit(TransportEvent::Connected { attempt });
                }
                Ok(attempt)
            }
            Err(e) => {
                *self.inner.link.lock() = Link::Idle;
                error!("Connect to {} failed: {}", endpoint.url, e);
                self.emit(TransportEvent::Error {
                    attempt,
                    error: e.clone(),
                });
                self.emit(TransportEvent::Disconnected {
                    attempt,
                    error: Some(e.clone()),
                });
                Err(e)
            }
        }
    }

    fn spawn_io(&self, attempt: u64, conn: Box<dyn Connection>) -> OpenLink {
        // Channel public API -> I/O task.
        let (io_tx, io_rx) = mpsc::channel::<IoEvent>(32);
        let io_task = tokio::spawn(run_io(
            Arc::downgrade(&self.inner),
            attempt,
            conn,
            io_rx,
            self.inner.inbound_tx.clone(),
            self.inner.events_tx.clone(),
        ));
        OpenLink {
            attempt,
            io_tx,
            io_task,
        }
    }

    fn open_sender(&self) -> Result<mpsc::Sender<IoEvent>, ConnectionError> {
        match &*self.inner.link.lock() {
            Link::Open(open) if !open.io_task.is_finished() => Ok(open.io_tx.clone()),
            _ => Err(ConnectionError::not_connected()),
        }
    }

    /// Write one frame. Fails fast when not connected; nothing is queued
    /// for later delivery.
    pub async fn send(&self, frame: Vec<u8>) -> Result<(), ConnectionError> {
        let io_tx = self.open_sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        io_tx
            .send(IoEvent::Write(frame, reply_tx))
            .await
            .map_err(|_| ConnectionError::not_connected())?;
        reply_rx
            .await
            .map_err(|_| ConnectionError::connection_lost("link closed before the write completed"))?
    }

    /// Round trip of one ping. Callers apply their own timeout.
    pub async fn ping(&self) -> Result<Duration, ConnectionError> {
        let io_tx = self.open_sender()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        io_tx
            .send(IoEvent::Ping(reply_tx))
            .await
            .map_err(|_| ConnectionError::not_connected())?;
        reply_rx
            .await
            .map_err(|_| ConnectionError::connection_lost("link closed before the pong arrived"))?
    }

    /// Close the link and wait for its I/O task to finish. A connect still
    /// in flight is cancelled first and awaited.
    pub async fn disconnect(&self) {
        self.close_where(|_| true).await;
    }

    /// Like [`disconnect`](Self::disconnect), but only if `attempt` is the
    /// open link. Leaves a newer link alone.
    pub async fn disconnect_attempt(&self, attempt: u64) {
        self.close_where(|open| open == attempt).await;
    }

    async fn close_where(&self, matches_open: impl Fn(u64) -> bool) {
        loop {
            let step = {
                let mut link = self.inner.link.lock();
                if let Link::Connecting(pending) = &*link {
                    debug!("Cancelling connect attempt {}", pending.attempt);
                    pending.cancel.notify_one();
                    Ok(pending.settled.clone())
                } else {
                    match std::mem::replace(&mut *link, Link::Idle) {
                        Link::Open(open) if matches_open(open.attempt) => Err(open),
                        other => {
                            *link = other;
                            return;
                        }
                    }
                }
            };
            match step {
                Ok(mut settled) => {
                    // ends once the pending connect has settled; it may
                    // have settled into an open link, so look again
                    while settled.changed().await.is_ok() {}
                }
                Err(open) => {
                    self.stop_open(open).await;
                    return;
                }
            }
        }
    }

    async fn stop_open(&self, open: OpenLink) {
        info!("Disconnecting (attempt {})", open.attempt);
        self.emit(TransportEvent::Disconnecting {
            attempt: open.attempt,
        });
        let _ = open.io_tx.send(IoEvent::Stop).await;
        let _ = open.io_task.await;
    }
}

async fn run_io(
    inner: Weak<Inner>,
    attempt: u64,
    mut conn: Box<dyn Connection>,
    mut io_rx: mpsc::Receiver<IoEvent>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    events_tx: broadcast::Sender<TransportEvent>,
) {
    info!("I/O task started for attempt {}.", attempt);
    let mut pending_ping: Option<(Instant, oneshot::Sender<Result<Duration, ConnectionError>>)> =
        None;
    let mut failure: Option<ConnectionError> = None;

    loop {
        // Awaits the next outbound event and the next inbound unit concurrently
        tokio::select! {
            event = io_rx.recv() => {
                match event {
                    Some(IoEvent::Write(frame, reply)) => {
                        debug!("Write: {} bytes (attempt {})", frame.len(), attempt);
                        let result = conn.send(&frame).await;
                        let write_error = result.as_ref().err().cloned();
                        let _ = reply.send(result);
                        if let Some(e) = write_error {
                            error!("Write error on attempt {}: {}", attempt, e);
                            failure = Some(e);
                            break;
                        }
                    }
                    Some(IoEvent::Ping(reply)) => match conn.ping().await {
                        // a newer ping replaces one whose caller already gave up
                        Ok(()) => pending_ping = Some((Instant::now(), reply)),
                        Err(e) => {
                            let _ = reply.send(Err(e));
                        }
                    },
                    Some(IoEvent::Stop) | None => {
                        info!("Stop received for attempt {}. Exiting task.", attempt);
                        break;
                    }
                }
            },
            result = conn.recv() => {
                match result {
                    Ok(Some(Inbound::Frame(frame))) => {
                        debug!("Read {} bytes (attempt {})", frame.len(), attempt);
                        if inbound_tx.send(frame).await.is_err() {
                            warn!("No inbound consumer; dropping frame");
                        }
                    }
                    Ok(Some(Inbound::Pong)) => {
                        if let Some((sent_at, reply)) = pending_ping.take() {
                            let _ = reply.send(Ok(sent_at.elapsed()));
                        }
                    }
                    Ok(None) => {
                        info!("Remote closed the link (attempt {})", attempt);
                        failure = Some(ConnectionError::connection_lost("closed by remote"));
                        break;
                    }
                    Err(e) => {
                        warn!("Read error on attempt {}: {}", attempt, e);
                        failure = Some(e);
                        break;
                    }
                }
            }
        }
    }

    if let Err(e) = conn.close().await {
        debug!("Close after attempt {} reported: {}", attempt, e);
    }
    if let Some(inner) = inner.upgrade() {
        let mut link = inner.link.lock();
        if matches!(&*link, Link::Open(open) if open.attempt == attempt) {
            *link = Link::Idle;
        }
    }
    let _ = events_tx.send(TransportEvent::Disconnected {
        attempt,
        error: failure,
    });
    info!("I/O task ended for attempt {}.", attempt);
}
