//! Typed commands and the per-session queues that carry them. System
//! commands (ids 0..=31) drive the protocol itself; node commands (ids 32..)
//! are the opaque scene stream; fake commands never touch the wire and
//! signal connection events between the core and the embedding application.

pub mod node;
pub mod queue;
pub mod sys;

pub use node::NodeCmd;
pub use sys::SysCmd;

use crate::error::TerminateReason;
use crate::{AvatarId, UserId};

/// Commands that flow through the session queues but are never serialized.
#[derive(Debug, Clone, PartialEq)]
pub enum FakeCmd {
    /// Handshake finished; the session is live.
    ConnectAccept { user_id: UserId, avatar_id: AvatarId },
    /// Connection is going away, or should go away when pushed outgoing.
    ConnectTerminate { reason: TerminateReason },
    /// The core asks the embedding application for credentials.
    UserAuthenticate { username: String, methods: Vec<u8> },
    /// The application requests a new frame rate; repeated in CHANGE_L(FPS)
    /// until the peer confirms.
    Fps { fps: f32 },
}

/// One entry of an outgoing priority bucket.
#[derive(Debug, Clone, PartialEq)]
pub enum OutCmd {
    Node(NodeCmd),
    Fake(FakeCmd),
}

/// One entry of the incoming FIFO queue.
#[derive(Debug, Clone, PartialEq)]
pub enum InCmd {
    Node(NodeCmd),
    Fake(FakeCmd),
}
