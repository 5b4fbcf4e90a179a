//! The reliable-datagram transport: connection state machines for both
//! endpoints, the packet scheduler and the worker loops pumping a UDP
//! socket.

pub mod client;
pub mod conn;
pub mod server;
pub mod worker;

pub use conn::{DgramConn, DgramState, Role};

/// A serialized datagram ready for the socket, with enough bookkeeping to
/// commit or roll back the send.
#[derive(Debug)]
pub struct OutPacket {
    pub bytes: Vec<u8>,
    pub pay_id: Option<u32>,
    pub ack: bool,
}
