//! Core of the Verse protocol: wire codec, command queues, the reliable
//! datagram transport, the stream handshake and the session registry. Scene
//! data stays opaque; the crate moves typed commands between peers and hands
//! them to the embedding application through per-session queues.

#![allow(clippy::len_without_is_empty)]
#![allow(clippy::new_without_default)]

pub mod cmd;
pub mod dgram;
pub mod error;
pub mod history;
pub mod negotiate;
pub mod registry;
pub mod session;
pub mod stream;
pub mod url;
pub mod wire;

/// Protocol version carried in the high nibble of every packet and message.
pub const PROTOCOL_VERSION: u8 = 1;

/// Hard ceiling on a single datagram.
pub const MAX_PACKET_SIZE: usize = 65535;

/// At most this many system commands in one packet or message.
pub const MAX_SYSTEM_COMMAND_COUNT: usize = 64;

/// Payload budget of one datagram: 1500 minus IP and UDP headers.
pub const DEFAULT_MTU: usize = 1452;

pub type UserId = u16;
pub type AvatarId = u32;
pub type SessionId = u32;
