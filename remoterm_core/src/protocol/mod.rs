pub mod codec;

pub use codec::{decode, encode, DecodeError, Message, PROTOCOL_VERSION};
