use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;

use super::session_registry::{RouteOutcome, Session, SessionId, SessionRegistry, SessionState};
use super::SessionError;
use crate::config::SessionConfig;
use crate::connections::errors::ConnectionError;
use crate::connections::transport::{TransportConnection, TransportEvent};
use crate::protocol::{decode, encode, Message};
use crate::storage::{AuthMethod, ConnectionProfile};

/// What the backend needs to open the remote shell; sent as the
/// `session_create` payload.
#[derive(Debug, Serialize)]
struct SessionTarget<'a> {
    profile_id: &'a str,
    host: &'a str,
    port: u16,
    username: &'a str,
    auth: &'a AuthMethod,
}

impl<'a> From<&'a ConnectionProfile> for SessionTarget<'a> {
    fn from(p: &'a ConnectionProfile) -> Self {
        Self {
            profile_id: &p.id,
            host: &p.host,
            port: p.port,
            username: &p.username,
            auth: &p.auth,
        }
    }
}

/// Removes a session whose creation did not complete, including when the
/// `create_session` future is dropped.
struct PendingSession<'a> {
    registry: &'a SessionRegistry,
    id: SessionId,
    armed: bool,
}

impl Drop for PendingSession<'_> {
    fn drop(&mut self) {
        if self.armed && self.registry.remove(&self.id).is_some() {
            debug!("Discarded unfinished session '{}'", self.id);
        }
    }
}

struct ServiceInner {
    transport: TransportConnection,
    registry: Arc<SessionRegistry>,
    create_timeout: Duration,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Drop for ServiceInner {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// Terminal sessions multiplexed over one transport connection.
///
/// A demultiplexing task consumes the transport's inbound stream and routes
/// every frame by `session_id` into the registry; subscribers read from
/// per-session unbounded channels so a slow reader never stalls the loop.
/// Cloning merely increases the reference count.
#[derive(Clone)]
pub struct TerminalSessionService {
    inner: Arc<ServiceInner>,
}

impl TerminalSessionService {
    /// Claims the transport's inbound stream; a transport can back only one
    /// service.
    pub fn new(transport: TransportConnection, config: &SessionConfig) -> Result<Self, SessionError> {
        let inbound = transport.take_inbound().ok_or(SessionError::InboundClaimed)?;
        let registry = Arc::new(SessionRegistry::new(config.max_buffered_chunks));

        let demux = tokio::spawn(run_demux(inbound, registry.clone()));
        let reannounce = tokio::spawn(run_reannounce(
            transport.subscribe_events(),
            transport.clone(),
            registry.clone(),
        ));

        Ok(Self {
            inner: Arc::new(ServiceInner {
                transport,
                registry,
                create_timeout: config.create_timeout,
                tasks: vec![demux, reannounce],
            }),
        })
    }

    pub fn transport(&self) -> &TransportConnection {
        &self.inner.transport
    }

    /// Open a session and wait for the backend to acknowledge it.
    ///
    /// On rejection or timeout the session passes through `Error` and is
    /// removed, so a failed or cancelled call never leaves a record behind.
    pub async fn create_session(
        &self,
        profile: Option<&ConnectionProfile>,
    ) -> Result<SessionId, SessionError> {
        if !self.inner.transport.is_connected() {
            return Err(ConnectionError::not_connected().into());
        }
        let id = uuid::Uuid::new_v4().to_string();
        let payload = profile
            .map(|p| serde_json::to_string(&SessionTarget::from(p)))
            .transpose()
            .map_err(|e| SessionError::Rejected {
                id: id.clone(),
                reason: format!("cannot encode session target: {e}"),
            })?;

        let (ack_tx, ack_rx) = oneshot::channel();
        let registry: &SessionRegistry = &self.inner.registry;
        registry.insert(
            &id,
            profile.map(|p| p.id.clone()),
            payload.clone(),
            self.inner.transport.current_attempt(),
            ack_tx,
        )?;
        let mut pending = PendingSession {
            registry,
            id: id.clone(),
            armed: true,
        };

        info!("Creating session '{}'", id);
        let frame = encode(&Message::SessionCreate {
            session_id: id.clone(),
            data: payload,
        });
        self.inner.transport.send(frame).await?;

        match timeout(self.inner.create_timeout, ack_rx).await {
            Ok(Ok(Ok(()))) => {
                pending.armed = false;
                info!("Session '{}' is running", id);
                Ok(id)
            }
            Ok(Ok(Err(reason))) => {
                warn!("Backend rejected session '{}': {}", id, reason);
                Err(SessionError::Rejected { id, reason })
            }
            Ok(Err(_)) => Err(SessionError::Rejected {
                id: id.clone(),
                reason: "session closed before it was acknowledged".into(),
            }),
            Err(_) => {
                registry.fail(&id, "timed out waiting for the backend");
                let close = encode(&Message::SessionClose {
                    session_id: id.clone(),
                });
                if let Err(e) = self.inner.transport.send(close).await {
                    debug!("Could not withdraw session '{}': {}", id, e);
                }
                Err(SessionError::Timeout(id.clone()))
            }
        }
    }

    async fn send_to_running(&self, session_id: &str, message: Message) -> Result<(), SessionError> {
        self.inner.registry.ensure_running(session_id)?;
        debug!("{} for session '{}'", message.type_name(), session_id);
        self.inner.transport.send(encode(&message)).await?;
        Ok(())
    }

    pub async fn send_terminal_data(&self, session_id: &str, text: &str) -> Result<(), SessionError> {
        self.send_to_running(
            session_id,
            Message::TerminalInput {
                session_id: session_id.to_string(),
                data: text.to_string(),
            },
        )
        .await
    }

    /// Out-of-band command such as `SIGINT`.
    pub async fn send_terminal_control(
        &self,
        session_id: &str,
        command: &str,
    ) -> Result<(), SessionError> {
        self.send_to_running(
            session_id,
            Message::TerminalControl {
                session_id: session_id.to_string(),
                data: command.to_string(),
            },
        )
        .await
    }

    pub async fn resize_terminal(
        &self,
        session_id: &str,
        cols: u16,
        rows: u16,
    ) -> Result<(), SessionError> {
        if cols == 0 || rows == 0 {
            return Err(SessionError::InvalidSize { cols, rows });
        }
        self.send_to_running(
            session_id,
            Message::TerminalResize {
                session_id: session_id.to_string(),
                cols,
                rows,
            },
        )
        .await
    }

    /// Close a session. Closing an unknown or already closed id is a no-op.
    pub async fn close_session(&self, session_id: &str) -> Result<(), SessionError> {
        if self.inner.registry.remove(session_id).is_none() {
            debug!("close_session('{}'): nothing to close", session_id);
            return Ok(());
        }
        info!("Closed session '{}'", session_id);
        let frame = encode(&Message::SessionClose {
            session_id: session_id.to_string(),
        });
        if let Err(e) = self.inner.transport.send(frame).await {
            // the record is gone either way; the backend drops it with the link
            warn!("Could not notify backend about closing '{}': {}", session_id, e);
        }
        Ok(())
    }

    /// Output stream of one session, in arrival order. Ends when the session
    /// is closed.
    pub fn subscribe(&self, session_id: &str) -> Result<mpsc::UnboundedReceiver<String>, SessionError> {
        self.inner
            .registry
            .subscribe(session_id)
            .ok_or_else(|| SessionError::UnknownSession(session_id.to_string()))
    }

    pub fn get_session_messages(&self, session_id: &str) -> Vec<String> {
        self.inner.registry.messages(session_id)
    }

    pub fn session_state(&self, session_id: &str) -> Option<SessionState> {
        self.inner.registry.state(session_id)
    }

    pub fn session(&self, session_id: &str) -> Option<Session> {
        self.inner.registry.snapshot(session_id)
    }

    pub fn session_ids(&self) -> Vec<SessionId> {
        self.inner.registry.ids()
    }
}

/// The one consumer of inbound frames. Never waits on subscribers.
async fn run_demux(mut inbound: mpsc::Receiver<Vec<u8>>, registry: Arc<SessionRegistry>) {
    info!("Session demultiplexer started.");
    while let Some(frame) = inbound.recv().await {
        let message = match decode(&frame) {
            Ok(message) => message,
            Err(e) => {
                warn!("Dropping undecodable frame ({} bytes): {}", frame.len(), e);
                continue;
            }
        };
        match message {
            Message::TerminalOutput { session_id, data } => {
                if registry.route_output(&session_id, data) == RouteOutcome::UnknownSession {
                    warn!("Dropping output for unknown session '{}'", session_id);
                }
            }
            Message::SessionCreate { session_id, .. } => {
                if !registry.acknowledge(&session_id) {
                    debug!("Ignoring unexpected ack for '{}'", session_id);
                }
            }
            Message::SessionClose { session_id } => {
                if registry.remove(&session_id).is_some() {
                    info!("Backend closed session '{}'", session_id);
                }
            }
            Message::Error { session_id, data } if session_id.is_empty() => {
                error!("Backend error: {}", data);
            }
            Message::Error { session_id, data } => {
                if registry.fail(&session_id, &data) {
                    warn!("Session '{}' failed: {}", session_id, data);
                } else {
                    warn!("Error for unknown session '{}': {}", session_id, data);
                }
            }
            other @ (Message::TerminalInput { .. }
            | Message::TerminalControl { .. }
            | Message::TerminalResize { .. }) => {
                warn!(
                    "Dropping client-bound '{}' frame for '{}'",
                    other.type_name(),
                    other.session_id()
                );
            }
        }
    }
    info!("Session demultiplexer ended.");
}

/// After a reconnect, ask the backend to reopen the sessions it knew on an
/// earlier link. Sessions first announced on the new link are left alone.
async fn run_reannounce(
    mut events: broadcast::Receiver<TransportEvent>,
    transport: TransportConnection,
    registry: Arc<SessionRegistry>,
) {
    loop {
        match events.recv().await {
            Ok(TransportEvent::Connected { attempt }) => {
                let sessions = registry.prepare_reannounce(attempt);
                if sessions.is_empty() {
                    continue;
                }
                info!(
                    "Link {} is up; re-announcing {} session(s)",
                    attempt,
                    sessions.len()
                );
                for (session_id, data) in sessions {
                    let frame = encode(&Message::SessionCreate {
                        session_id: session_id.clone(),
                        data,
                    });
                    if let Err(e) = transport.send(frame).await {
                        registry.fail(&session_id, &e.to_string());
                    }
                }
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Missed {} transport events", n);
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
