//! Connection lifecycle: connect, supervise, back off, reconnect.
//!
//! ```text
//! disconnected --connect--> connecting --ok--> connected
//! connecting --failure--> error --retry--> connecting
//! connected --lost (retryable) | unhealthy--> reconnecting --ok--> connected
//! connected --lost (terminal) | disconnect--> disconnected
//! reconnecting --attempts exhausted--> error --clear_error--> disconnected
//! reconnecting --cancel_retry--> disconnected
//! ```
//!
//! Every transition replaces the published [`ConnectionState`] as a whole.

use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc, watch};

use super::backoff::BackoffPolicy;
use super::health::{HealthMetrics, HealthMonitor, HealthSignal};
use crate::config::{ClientConfig, HealthConfig};
use crate::connections::errors::{ConnectionError, ConnectionErrorKind};
use crate::connections::transport::{Credentials, Endpoint, TransportConnection, TransportEvent};
use crate::storage::ConnectionProfile;

#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionPhase {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting {
        /// When the scheduled attempt fires, for countdowns.
        next_retry_at: SystemTime,
        delay: Duration,
    },
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionState {
    pub phase: ConnectionPhase,
    pub profile: Option<Arc<ConnectionProfile>>,
    pub last_error: Option<ConnectionError>,
    /// Reconnect attempts since the last time the link was up.
    pub attempt: u32,
}

impl ConnectionState {
    fn initial() -> Self {
        Self {
            phase: ConnectionPhase::Disconnected,
            profile: None,
            last_error: None,
            attempt: 0,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.phase == ConnectionPhase::Connected
    }

    pub fn next_retry_at(&self) -> Option<SystemTime> {
        match self.phase {
            ConnectionPhase::Reconnecting { next_retry_at, .. } => Some(next_retry_at),
            _ => None,
        }
    }
}

struct Control {
    /// Bumped by every user command; stale timers and attempts compare
    /// against it and back off.
    generation: u64,
    retry_timer: Option<tokio::task::JoinHandle<()>>,
    health_task: Option<tokio::task::JoinHandle<()>>,
    /// Transport attempt id of the link we consider ours while connected.
    link: Option<u64>,
}

impl Control {
    fn cancel_timer(&mut self) {
        if let Some(timer) = self.retry_timer.take() {
            timer.abort();
        }
    }

    fn stop_health(&mut self) {
        if let Some(task) = self.health_task.take() {
            task.abort();
        }
        self.link = None;
    }
}

struct Inner {
    transport: TransportConnection,
    endpoint: Endpoint,
    credentials: Credentials,
    policy: BackoffPolicy,
    health_config: HealthConfig,
    control: Mutex<Control>,
    state_tx: watch::Sender<Arc<ConnectionState>>,
    transitions_tx: broadcast::Sender<Arc<ConnectionState>>,
    metrics_tx: watch::Sender<HealthMetrics>,
    signal_tx: mpsc::UnboundedSender<HealthSignal>,
    supervisor: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let control = self.control.get_mut();
        control.cancel_timer();
        control.stop_health();
        if let Some(task) = self.supervisor.get_mut().take() {
            task.abort();
        }
    }
}

/// Owns the [`ConnectionState`] of one logical connection.
///
/// Must be created inside a tokio runtime. Cloning merely increases the
/// reference count; observers use [`subscribe`](Self::subscribe) or
/// [`transitions`](Self::transitions).
#[derive(Clone)]
pub struct ConnectionStateMachine {
    inner: Arc<Inner>,
}

impl ConnectionStateMachine {
    pub fn new(transport: TransportConnection, config: &ClientConfig) -> Self {
        let (state_tx, _) = watch::channel(Arc::new(ConnectionState::initial()));
        let (transitions_tx, _) = broadcast::channel(64);
        let (metrics_tx, _) = watch::channel(HealthMetrics::default());
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let events = transport.subscribe_events();

        let inner = Arc::new(Inner {
            transport,
            endpoint: Endpoint {
                url: config.backend.url.clone(),
            },
            credentials: Credentials {
                token: config.backend.token.clone(),
            },
            policy: BackoffPolicy::from_config(&config.retry),
            health_config: config.health.clone(),
            control: Mutex::new(Control {
                generation: 0,
                retry_timer: None,
                health_task: None,
                link: None,
            }),
            state_tx,
            transitions_tx,
            metrics_tx,
            signal_tx,
            supervisor: Mutex::new(None),
        });
        let supervisor = tokio::spawn(supervise(Arc::downgrade(&inner), events, signal_rx));
        *inner.supervisor.lock() = Some(supervisor);
        Self { inner }
    }

    pub fn state(&self) -> Arc<ConnectionState> {
        self.inner.state_tx.borrow().clone()
    }

    /// Latest state, always current.
    pub fn subscribe(&self) -> watch::Receiver<Arc<ConnectionState>> {
        self.inner.state_tx.subscribe()
    }

    /// Every transition, in order.
    pub fn transitions(&self) -> broadcast::Receiver<Arc<ConnectionState>> {
        self.inner.transitions_tx.subscribe()
    }

    /// Metrics of the current link; reset on every connect.
    pub fn health(&self) -> watch::Receiver<HealthMetrics> {
        self.inner.metrics_tx.subscribe()
    }

    pub fn transport(&self) -> &TransportConnection {
        &self.inner.transport
    }

    /// Connect for `profile`, superseding whatever was going on before.
    ///
    /// A pending retry timer is cancelled and a connect still in flight is
    /// abandoned before the new attempt starts.
    pub async fn connect(&self, profile: ConnectionProfile) -> Result<(), ConnectionError> {
        self.connect_from(profile, 0).await
    }

    async fn connect_from(
        &self,
        profile: ConnectionProfile,
        attempt: u32,
    ) -> Result<(), ConnectionError> {
        let profile = Arc::new(profile);
        let current = self.state();
        if current.is_connected()
            && current.profile.as_deref() == Some(&*profile)
            && self.inner.transport.is_connected()
        {
            debug!("Already connected for profile '{}'", profile.name);
            return Ok(());
        }

        let generation = {
            let mut control = self.inner.control.lock();
            control.generation += 1;
            control.cancel_timer();
            control.stop_health();
            self.inner.publish(ConnectionState {
                phase: ConnectionPhase::Connecting,
                profile: Some(profile.clone()),
                last_error: None,
                attempt,
            });
            control.generation
        };

        if let Err(e) = profile.validate() {
            warn!("Profile '{}' is not usable: {}", profile.name, e);
            self.inner.publish_error(e.clone());
            return Err(e);
        }
        // a link opened for another profile must not be reused, and an
        // older attempt still opening one is abandoned
        self.inner.transport.disconnect().await;
        self.inner.attempt_connect(generation, false).await
    }

    /// `error --retry--> connecting`. The attempt counter carries over until
    /// the link is up again.
    pub async fn retry(&self) -> Result<(), ConnectionError> {
        let current = self.state();
        match (&current.phase, &current.profile) {
            (ConnectionPhase::Error, Some(profile)) => {
                let profile = ConnectionProfile::clone(profile);
                self.connect_from(profile, current.attempt).await
            }
            _ => Err(ConnectionError::new(
                ConnectionErrorKind::InvalidState,
                "retry is only possible after an error",
            )),
        }
    }

    /// `error --clear_error--> disconnected`. No-op in other phases.
    pub fn clear_error(&self) {
        let _control = self.inner.control.lock();
        let current = self.state();
        if current.phase == ConnectionPhase::Error {
            self.inner.publish(ConnectionState {
                phase: ConnectionPhase::Disconnected,
                last_error: None,
                ..ConnectionState::clone(&current)
            });
        }
    }

    /// Abort a scheduled reconnect. Returns `false` if none was pending.
    pub fn cancel_retry(&self) -> bool {
        let mut control = self.inner.control.lock();
        let current = self.state();
        if !matches!(current.phase, ConnectionPhase::Reconnecting { .. }) {
            return false;
        }
        control.generation += 1;
        control.cancel_timer();
        info!("Reconnect cancelled after {} attempt(s)", current.attempt);
        self.inner.publish(ConnectionState {
            phase: ConnectionPhase::Disconnected,
            ..ConnectionState::clone(&current)
        });
        true
    }

    /// User-initiated disconnect from any phase.
    pub async fn disconnect(&self) {
        {
            let mut control = self.inner.control.lock();
            control.generation += 1;
            control.cancel_timer();
            control.stop_health();
            let current = self.state();
            self.inner.publish(ConnectionState {
                phase: ConnectionPhase::Disconnected,
                ..ConnectionState::clone(&current)
            });
        }
        self.inner.transport.disconnect().await;
    }
}

impl Inner {
    fn current(&self) -> Arc<ConnectionState> {
        self.state_tx.borrow().clone()
    }

    fn is_current(&self, generation: u64) -> bool {
        self.control.lock().generation == generation
    }

    fn publish(&self, state: ConnectionState) {
        debug!("Connection state -> {:?} (attempt {})", state.phase, state.attempt);
        let state = Arc::new(state);
        self.state_tx.send_replace(state.clone());
        let _ = self.transitions_tx.send(state);
    }

    fn publish_error(&self, error: ConnectionError) {
        let current = self.current();
        self.publish(ConnectionState {
            phase: ConnectionPhase::Error,
            profile: current.profile.clone(),
            last_error: Some(error),
            attempt: current.attempt,
        });
    }

    /// One connect attempt on behalf of `generation`.
    async fn attempt_connect(
        self: &Arc<Self>,
        generation: u64,
        reconnecting: bool,
    ) -> Result<(), ConnectionError> {
        let result = loop {
            match self.transport.connect(&self.endpoint, &self.credentials).await {
                // an abandoned attempt may still be settling
                Err(e) if e.kind == ConnectionErrorKind::ConnectInProgress
                    && self.is_current(generation) =>
                {
                    debug!("Waiting out an older connect attempt");
                    self.transport.disconnect().await;
                }
                other => break other,
            }
        };

        let mut control = self.control.lock();
        if control.generation != generation {
            drop(control);
            debug!("Connect attempt of generation {} was superseded", generation);
            if let Ok(link) = result {
                let transport = self.transport.clone();
                tokio::spawn(async move { transport.disconnect_attempt(link).await });
            }
            return Err(ConnectionError::new(
                ConnectionErrorKind::Cancelled,
                "superseded by a newer request",
            ));
        }

        match result {
            Ok(link) => {
                control.link = Some(link);
                let current = self.current();
                info!(
                    "Connected{}",
                    current
                        .profile
                        .as_ref()
                        .map(|p| format!(" for profile '{}'", p.name))
                        .unwrap_or_default()
                );
                self.publish(ConnectionState {
                    phase: ConnectionPhase::Connected,
                    profile: current.profile.clone(),
                    last_error: None,
                    attempt: 0,
                });
                self.metrics_tx.send_replace(HealthMetrics::default());
                control.health_task = Some(
                    HealthMonitor::new(
                        link,
                        Arc::new(self.transport.clone()),
                        self.health_config.clone(),
                        self.metrics_tx.clone(),
                        self.signal_tx.clone(),
                    )
                    .spawn(),
                );
                drop(control);
                // the link may have died before we were listening for it
                if !self.transport.is_connected() {
                    self.on_link_lost(link, None);
                }
                Ok(())
            }
            Err(e) if reconnecting && e.retryable => {
                drop(control);
                warn!("Reconnect attempt failed: {}", e);
                self.schedule_reconnect(e.clone());
                Err(e)
            }
            Err(e) => {
                drop(control);
                error!("Connect failed: {}", e);
                self.publish_error(e.clone());
                Err(e)
            }
        }
    }

    /// Enter `reconnecting` (or `error` once attempts run out) and arm the
    /// single retry timer.
    fn schedule_reconnect(self: &Arc<Self>, cause: ConnectionError) {
        let mut control = self.control.lock();
        control.cancel_timer();
        let current = self.current();
        let attempt = current.attempt + 1;

        if attempt > self.policy.max_attempts {
            let exhausted = ConnectionError {
                technical: format!(
                    "gave up after {} reconnect attempts; last error: {}",
                    current.attempt, cause.technical
                ),
                retryable: false,
                ..cause
            };
            error!("{}", exhausted);
            self.publish(ConnectionState {
                phase: ConnectionPhase::Error,
                profile: current.profile.clone(),
                last_error: Some(exhausted),
                attempt: current.attempt,
            });
            return;
        }

        let delay = self.policy.next_delay(attempt);
        warn!(
            "Connection lost: {}. Reconnecting in {:?} (attempt {}/{})",
            cause, delay, attempt, self.policy.max_attempts
        );
        self.publish(ConnectionState {
            phase: ConnectionPhase::Reconnecting {
                next_retry_at: SystemTime::now() + delay,
                delay,
            },
            profile: current.profile.clone(),
            last_error: Some(cause),
            attempt,
        });

        let generation = control.generation;
        let weak = Arc::downgrade(self);
        control.retry_timer = Some(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                // stale link, if any, goes first so connect() opens a new one
                inner.transport.disconnect().await;
                let _ = inner.attempt_connect(generation, true).await;
            }
        }));
    }

    /// The transport reported the end of `link`.
    fn on_link_lost(self: &Arc<Self>, link: u64, error: Option<ConnectionError>) {
        {
            let mut control = self.control.lock();
            if control.link != Some(link) || !self.current().is_connected() {
                return;
            }
            control.stop_health();
        }
        let error = error.unwrap_or_else(|| ConnectionError::connection_lost("link closed"));
        if error.retryable {
            self.schedule_reconnect(error);
        } else {
            warn!("Connection ended: {}", error);
            let current = self.current();
            self.publish(ConnectionState {
                phase: ConnectionPhase::Disconnected,
                profile: current.profile.clone(),
                last_error: Some(error),
                attempt: current.attempt,
            });
        }
    }

    /// Health probes kept failing on `link`; replace it before the
    /// transport notices.
    async fn on_unhealthy(self: &Arc<Self>, link: u64, failures: u32) {
        {
            let mut control = self.control.lock();
            if control.link != Some(link) || !self.current().is_connected() {
                return;
            }
            control.stop_health();
        }
        self.schedule_reconnect(ConnectionError::new(
            ConnectionErrorKind::Timeout,
            format!("{failures} consecutive health probes failed"),
        ));
        self.transport.disconnect_attempt(link).await;
    }
}

async fn supervise(
    inner: Weak<Inner>,
    mut events: broadcast::Receiver<TransportEvent>,
    mut signals: mpsc::UnboundedReceiver<HealthSignal>,
) {
    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match event {
                    Ok(TransportEvent::Disconnected { attempt, error }) => {
                        inner.on_link_lost(attempt, error);
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!("Supervisor missed {} transport events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            signal = signals.recv() => {
                let Some(inner) = inner.upgrade() else { break };
                match signal {
                    Some(HealthSignal::Unhealthy { link, consecutive_failures }) => {
                        inner.on_unhealthy(link, consecutive_failures).await;
                    }
                    None => break,
                }
            }
        }
    }
    debug!("Connection supervisor ended.");
}
