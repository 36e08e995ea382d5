pub mod backoff;
pub mod health;
pub mod session_registry;
pub mod session_service;
pub mod state_machine;

use thiserror::Error;

use crate::connections::errors::ConnectionError;

pub use backoff::BackoffPolicy;
pub use health::{ConnectionQuality, HealthMetrics, HealthMonitor, HealthTracker, LatencyProbe};
pub use session_registry::{Session, SessionId, SessionState};
pub use session_service::TerminalSessionService;
pub use state_machine::{ConnectionPhase, ConnectionState, ConnectionStateMachine};

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("unknown session '{0}'")]
    UnknownSession(String),
    #[error("session '{id}' is not running ({state:?})")]
    SessionNotRunning { id: String, state: SessionState },
    #[error("session '{0}' already exists")]
    DuplicateSession(String),
    #[error("backend rejected session '{id}': {reason}")]
    Rejected { id: String, reason: String },
    #[error("session '{0}' was not acknowledged in time")]
    Timeout(String),
    #[error("invalid terminal size {cols}x{rows}")]
    InvalidSize { cols: u16, rows: u16 },
    #[error("the transport's inbound stream is already in use")]
    InboundClaimed,
    #[error(transparent)]
    Transport(#[from] ConnectionError),
}
