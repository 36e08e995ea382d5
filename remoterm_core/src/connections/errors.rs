use std::fmt::{self, Display};
use std::time::SystemTime;

use tokio_tungstenite::tungstenite;

/// Classification of everything that can go wrong while reaching the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionErrorKind {
    AuthenticationFailed,
    InvalidKey,
    MissingCredentials,
    HostUnreachable,
    ConnectionRefused,
    Timeout,
    ConnectionLost,
    Protocol,
    Configuration,
    NotConnected,
    ConnectInProgress,
    InvalidState,
    Cancelled,
    Io,
}

impl ConnectionErrorKind {
    /// Transport-level failures are retried with backoff; credential and
    /// configuration problems need the user to fix something first.
    pub fn is_retryable(self) -> bool {
        match self {
            ConnectionErrorKind::HostUnreachable
            | ConnectionErrorKind::ConnectionRefused
            | ConnectionErrorKind::Timeout
            | ConnectionErrorKind::ConnectionLost
            | ConnectionErrorKind::Protocol
            | ConnectionErrorKind::Io => true,
            ConnectionErrorKind::AuthenticationFailed
            | ConnectionErrorKind::InvalidKey
            | ConnectionErrorKind::MissingCredentials
            | ConnectionErrorKind::Configuration
            | ConnectionErrorKind::NotConnected
            | ConnectionErrorKind::ConnectInProgress
            | ConnectionErrorKind::InvalidState
            | ConnectionErrorKind::Cancelled => false,
        }
    }

    fn headline(self) -> &'static str {
        match self {
            ConnectionErrorKind::AuthenticationFailed => "Authentication failed",
            ConnectionErrorKind::InvalidKey => "Private key rejected",
            ConnectionErrorKind::MissingCredentials => "Missing credentials",
            ConnectionErrorKind::HostUnreachable => "Host unreachable",
            ConnectionErrorKind::ConnectionRefused => "Connection refused",
            ConnectionErrorKind::Timeout => "Timed out",
            ConnectionErrorKind::ConnectionLost => "Connection lost",
            ConnectionErrorKind::Protocol => "Protocol error",
            ConnectionErrorKind::Configuration => "Invalid configuration",
            ConnectionErrorKind::NotConnected => "Not connected",
            ConnectionErrorKind::ConnectInProgress => "Connect already in progress",
            ConnectionErrorKind::InvalidState => "Not possible right now",
            ConnectionErrorKind::Cancelled => "Cancelled",
            ConnectionErrorKind::Io => "I/O error",
        }
    }

    fn suggestions(self) -> Vec<String> {
        let hints: &[&str] = match self {
            ConnectionErrorKind::AuthenticationFailed => &[
                "Check the username and password of the profile",
                "Verify the backend access token",
            ],
            ConnectionErrorKind::InvalidKey => &[
                "Make sure the private key file exists and is readable",
                "Check the key passphrase",
            ],
            ConnectionErrorKind::MissingCredentials => {
                &["Add a password or a private key to the profile"]
            }
            ConnectionErrorKind::HostUnreachable => &[
                "Check your network connection",
                "Verify the host name and port",
            ],
            ConnectionErrorKind::ConnectionRefused => {
                &["Make sure the backend is running and accepts connections"]
            }
            ConnectionErrorKind::Timeout => &[
                "The network may be slow, try again",
                "Increase the connect timeout in the configuration",
            ],
            ConnectionErrorKind::ConnectionLost => &["The connection will be retried automatically"],
            ConnectionErrorKind::Protocol => &["Make sure the backend speaks a compatible protocol"],
            ConnectionErrorKind::Configuration => &["Edit the profile and fix the invalid fields"],
            ConnectionErrorKind::NotConnected => &["Connect before sending data"],
            ConnectionErrorKind::ConnectInProgress => &["Wait for the current attempt to finish"],
            ConnectionErrorKind::InvalidState => &[],
            ConnectionErrorKind::Cancelled => &[],
            ConnectionErrorKind::Io => &["Try again"],
        };
        hints.iter().map(|s| s.to_string()).collect()
    }
}

/// A classified connection failure.
///
/// Cloneable so the same error can be stored in `ConnectionState`, published
/// on event channels and returned to the caller.
#[derive(Debug, Clone)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub technical: String,
    pub retryable: bool,
    pub suggestions: Vec<String>,
    pub timestamp: SystemTime,
}

impl ConnectionError {
    pub fn new(kind: ConnectionErrorKind, technical: impl Into<String>) -> Self {
        Self {
            kind,
            message: kind.headline().to_string(),
            technical: technical.into(),
            retryable: kind.is_retryable(),
            suggestions: kind.suggestions(),
            timestamp: SystemTime::now(),
        }
    }

    pub fn not_connected() -> Self {
        Self::new(ConnectionErrorKind::NotConnected, "transport is not connected")
    }

    pub fn timeout(what: &str) -> Self {
        Self::new(ConnectionErrorKind::Timeout, format!("{what} timed out"))
    }

    pub fn connection_lost(technical: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::ConnectionLost, technical)
    }

    pub fn protocol(technical: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Protocol, technical)
    }

    pub fn configuration(technical: impl Into<String>) -> Self {
        Self::new(ConnectionErrorKind::Configuration, technical)
    }
}

impl PartialEq for ConnectionError {
    fn eq(&self, other: &Self) -> bool {
        self.kind == other.kind && self.technical == other.technical
    }
}

/// Convert from std::io::Error.
impl From<std::io::Error> for ConnectionError {
    fn from(err: std::io::Error) -> ConnectionError {
        use std::io::ErrorKind;
        let kind = match err.kind() {
            ErrorKind::ConnectionRefused => ConnectionErrorKind::ConnectionRefused,
            ErrorKind::TimedOut => ConnectionErrorKind::Timeout,
            ErrorKind::NotFound | ErrorKind::AddrNotAvailable => {
                ConnectionErrorKind::HostUnreachable
            }
            ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof => ConnectionErrorKind::ConnectionLost,
            _ => ConnectionErrorKind::Io,
        };
        ConnectionError::new(kind, err.to_string())
    }
}

/// Convert from the WebSocket layer so `?` works inside the WS transport.
impl From<tungstenite::Error> for ConnectionError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Io(io) => io.into(),
            tungstenite::Error::Http(ref response)
                if response.status() == 401 || response.status() == 403 =>
            {
                ConnectionError::new(ConnectionErrorKind::AuthenticationFailed, err.to_string())
            }
            tungstenite::Error::Url(_) => ConnectionError::configuration(err.to_string()),
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
                ConnectionError::connection_lost(err.to_string())
            }
            other => ConnectionError::protocol(other.to_string()),
        }
    }
}

impl Display for ConnectionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.message, self.technical)
    }
}

impl std::error::Error for ConnectionError {}
