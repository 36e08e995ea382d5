use std::sync::Arc;

use crate::config::ClientConfig;
use crate::connections::errors::ConnectionError;
use crate::connections::transport::{Connector, TransportConnection};
use crate::connections::ws::WsConnector;
use crate::core::{ConnectionStateMachine, SessionError, TerminalSessionService};
use crate::storage::ConnectionProfile;

/// One backend connection with its lifecycle and its sessions.
///
/// The state machine and the session service share the same transport;
/// hand clones of either to whoever needs to observe or drive them.
#[derive(Clone)]
pub struct RemoteTerminal {
    connection: ConnectionStateMachine,
    sessions: TerminalSessionService,
}

impl RemoteTerminal {
    /// WebSocket client for `config.backend`. Must be called inside a tokio
    /// runtime.
    pub fn new(config: &ClientConfig) -> Result<Self, SessionError> {
        Self::with_connector(Arc::new(WsConnector), config)
    }

    pub fn with_connector(
        connector: Arc<dyn Connector>,
        config: &ClientConfig,
    ) -> Result<Self, SessionError> {
        let transport = TransportConnection::new(connector, config.backend.connect_timeout);
        let sessions = TerminalSessionService::new(transport.clone(), &config.session)?;
        let connection = ConnectionStateMachine::new(transport, config);
        Ok(Self {
            connection,
            sessions,
        })
    }

    pub fn connection(&self) -> &ConnectionStateMachine {
        &self.connection
    }

    pub fn sessions(&self) -> &TerminalSessionService {
        &self.sessions
    }

    pub async fn connect(&self, profile: ConnectionProfile) -> Result<(), ConnectionError> {
        self.connection.connect(profile).await
    }

    /// Close every session, then the link.
    pub async fn shutdown(&self) {
        for id in self.sessions.session_ids() {
            let _ = self.sessions.close_session(&id).await;
        }
        self.connection.disconnect().await;
    }
}
