//! The reliable-stream side of the protocol: the receive/send buffers, the
//! two-stage handshake state machines and the worker loops. When the
//! negotiated transport is TCP, the stream stays open as the data plane;
//! for UDP it closes once the datagram channel reaches OPEN.

pub mod client;
pub mod conn;
pub mod server;
pub mod worker;

pub use conn::{StreamConn, StreamState};
