pub mod ws_connection;

pub use ws_connection::{WsConnection, WsConnector, PROTOCOL_HEADER};
