pub mod errors;
pub mod transport;
pub mod ws;

pub use errors::{ConnectionError, ConnectionErrorKind};
pub use transport::{
    Connection, Connector, Credentials, Endpoint, Inbound, TransportConnection, TransportEvent,
};
