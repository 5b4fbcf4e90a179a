//! Feature negotiation: the symmetric CHANGE_L/R propose and CONFIRM_L/R
//! commit protocol used on both the stream handshake and the datagram
//! channel. Each connection state installs its own `Negotiator`
//! implementation; a rejecting negotiator fails the whole packet's
//! negotiation and the sender retries.

use crate::cmd::sys::Negotiate;

/// Feature ids of the negotiation command family.
pub const FTR_RESERVED: u8 = 0;
pub const FTR_FC_ID: u8 = 1;
pub const FTR_CC_ID: u8 = 2;
pub const FTR_HOST_URL: u8 = 3;
pub const FTR_TOKEN: u8 = 4;
pub const FTR_DED: u8 = 5;
pub const FTR_RWIN_SCALE: u8 = 6;
pub const FTR_FPS: u8 = 7;
pub const FTR_CMD_COMPRESS: u8 = 8;
pub const FTR_CLIENT_NAME: u8 = 9;
pub const FTR_CLIENT_VERSION: u8 = 10;

/// Flow-control methods.
pub const FC_RESERVED: u8 = 0;
pub const FC_NONE: u8 = 1;
pub const FC_TCP_LIKE: u8 = 2;

/// Congestion-control methods.
pub const CC_RESERVED: u8 = 0;
pub const CC_NONE: u8 = 1;
pub const CC_TCP_LIKE: u8 = 2;

/// Command-compression methods.
pub const CMPR_RESERVED: u8 = 0;
pub const CMPR_NONE: u8 = 1;
pub const CMPR_ADDR_SHARE: u8 = 2;

/// Wire type of a feature's values.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ValueKind {
    Uint8,
    Real32,
    String8,
}

/// Value type of each feature. Unknown ids decode as raw octets and are
/// skipped by every negotiator.
#[inline]
pub fn value_kind(feature: u8) -> ValueKind {
    match feature {
        FTR_FPS => ValueKind::Real32,
        FTR_HOST_URL | FTR_TOKEN | FTR_DED | FTR_CLIENT_NAME | FTR_CLIENT_VERSION => {
            ValueKind::String8
        }
        _ => ValueKind::Uint8,
    }
}

#[inline]
pub fn known_feature(feature: u8) -> bool {
    feature >= FTR_FC_ID && feature <= FTR_CLIENT_VERSION
}

/// Direction a negotiation command talks about, from the receiver's point
/// of view. A received CHANGE_L proposes values for the peer→local
/// direction; a received CHANGE_R proposes for local→peer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Dir {
    Local,
    Remote,
}

/// The four negotiation operations, payload attached.
#[derive(Debug)]
pub enum NegotiateOp<'a> {
    Change(Dir, &'a Negotiate),
    Confirm(Dir, &'a Negotiate),
}

impl<'a> NegotiateOp<'a> {
    #[inline]
    pub fn cmd(&self) -> &'a Negotiate {
        match self {
            NegotiateOp::Change(_, cmd) => cmd,
            NegotiateOp::Confirm(_, cmd) => cmd,
        }
    }
}

/// Per-state negotiation behavior. Implementations validate or commit one
/// feature at a time and return false to reject the packet's negotiation.
pub trait Negotiator {
    fn handle(&mut self, op: NegotiateOp) -> bool;
}

/// Feeds every negotiation command of a packet or message through one
/// negotiator. The first rejection fails the whole negotiation; commands
/// outside the negotiation family pass through untouched.
pub fn apply(negotiator: &mut dyn Negotiator, cmds: &[crate::cmd::sys::SysCmd]) -> bool {
    use crate::cmd::sys::SysCmd;

    for cmd in cmds {
        let accepted = match cmd {
            SysCmd::ChangeL(n) => negotiator.handle(NegotiateOp::Change(Dir::Local, n)),
            SysCmd::ChangeR(n) => negotiator.handle(NegotiateOp::Change(Dir::Remote, n)),
            SysCmd::ConfirmL(n) => negotiator.handle(NegotiateOp::Confirm(Dir::Local, n)),
            SysCmd::ConfirmR(n) => negotiator.handle(NegotiateOp::Confirm(Dir::Remote, n)),
            _ => true,
        };

        if !accepted {
            return false;
        }
    }

    true
}

/// Picks one method out of a proposed preference list, in the proposal's
/// order, restricted to the methods this endpoint supports.
#[inline]
pub fn pick_method(proposed: &[u8], supported: &[u8]) -> Option<u8> {
    proposed
        .iter()
        .find(|method| supported.contains(method))
        .copied()
}
