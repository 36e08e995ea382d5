pub mod client;
pub mod config;
pub mod connections;
pub mod core;
pub mod protocol;
pub mod storage;
pub mod sync;
pub mod utils;

// re‑export ergonomic entry points
pub use client::RemoteTerminal;
pub use config::ClientConfig;
pub use connections::{ConnectionError, ConnectionErrorKind, TransportConnection};
pub use core::{
    ConnectionPhase, ConnectionState, ConnectionStateMachine, SessionError, TerminalSessionService,
};
pub use storage::{ConnectionProfile, FileProfileStore, ProfileRepository};
pub use sync::{HttpProfileApi, ProfileSyncEngine, SyncStrategy};
