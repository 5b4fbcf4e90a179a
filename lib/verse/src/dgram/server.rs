//! Server side of the datagram handshake: LISTEN → RESPOND → OPEN, with
//! CLOSEREQ teardown handled by the shared scheduler.

use crate::cmd::sys::{Negotiate, SysCmd, Values};
use crate::dgram::conn::{DgramConn, DgramState};
use crate::dgram::OutPacket;
use crate::error::NetworkResult;
use crate::negotiate::{
    self, Dir, NegotiateOp, Negotiator, CC_NONE, CC_TCP_LIKE, CMPR_ADDR_SHARE, CMPR_NONE, FC_NONE,
    FTR_CC_ID, FTR_CMD_COMPRESS, FTR_FC_ID, FTR_RWIN_SCALE, FTR_TOKEN,
};
use crate::session::Session;
use crate::wire::packet::{Packet, ACK_FLAG, ANK_FLAG, FIN_FLAG, PAY_FLAG, SYN_FLAG};
use crate::MAX_SYSTEM_COMMAND_COUNT;
use std::io::Cursor;
use std::time::Instant;
use tempo::pacing::STATE_TIMEOUT;

fn serialize(conn: &DgramConn, packet: &Packet) -> NetworkResult<OutPacket> {
    let mut buffer = vec![0u8; conn.mtu];
    let written;
    {
        let mut stream = Cursor::new(&mut buffer[..]);
        written = packet.pack(&mut stream)?;
    }
    buffer.truncate(written);

    Ok(OutPacket {
        bytes: buffer,
        pay_id: None,
        ack: false,
    })
}

/// Negotiation rules for the client's PAY|SYN in LISTEN. A cookie mismatch
/// rejects the whole packet, which the caller drops without any response.
struct ListenNegotiator<'a> {
    conn: &'a mut DgramConn,
    session: &'a Session,
}

impl<'a> Negotiator for ListenNegotiator<'a> {
    fn handle(&mut self, op: NegotiateOp) -> bool {
        let cmd = op.cmd();

        if !negotiate::known_feature(cmd.feature) {
            return true;
        }

        match op {
            NegotiateOp::Change(Dir::Local, cmd) => match cmd.feature {
                FTR_TOKEN => cmd.first_string8() == self.session.host_cookie.as_deref(),
                FTR_CC_ID => {
                    let proposed = match &cmd.values {
                        Values::Uint8(v) => v,
                        _ => return false,
                    };
                    match negotiate::pick_method(proposed, &[CC_NONE, CC_TCP_LIKE]) {
                        Some(method) => {
                            self.conn.cc_meth = method;
                            true
                        }
                        None => false,
                    }
                }
                FTR_RWIN_SCALE => match cmd.first_uint8() {
                    Some(scale) => {
                        self.conn.rwin_peer_scale = scale;
                        true
                    }
                    None => false,
                },
                FTR_CMD_COMPRESS => {
                    let proposed = match &cmd.values {
                        Values::Uint8(v) => v,
                        _ => return false,
                    };
                    match negotiate::pick_method(proposed, &[CMPR_ADDR_SHARE, CMPR_NONE]) {
                        Some(method) => {
                            self.conn.peer_cmd_cmpr = method;
                            true
                        }
                        None => false,
                    }
                }
                _ => true,
            },
            NegotiateOp::Change(Dir::Remote, cmd) => match cmd.feature {
                FTR_CC_ID => {
                    let proposed = match &cmd.values {
                        Values::Uint8(v) => v,
                        _ => return false,
                    };
                    match negotiate::pick_method(proposed, &[CC_NONE, CC_TCP_LIKE]) {
                        // Symmetry: both directions use one method.
                        Some(method) => method == self.conn.cc_meth,
                        None => false,
                    }
                }
                FTR_CMD_COMPRESS => {
                    let proposed = match &cmd.values {
                        Values::Uint8(v) => v,
                        _ => return false,
                    };
                    match negotiate::pick_method(proposed, &[CMPR_ADDR_SHARE, CMPR_NONE]) {
                        Some(method) => {
                            self.conn.host_cmd_cmpr = method;
                            true
                        }
                        None => false,
                    }
                }
                _ => true,
            },
            NegotiateOp::Confirm(_, _) => true,
        }
    }
}

/// Negotiation rules for the client's PAY|ACK|ANK in RESPOND.
struct RespondNegotiator<'a> {
    conn: &'a mut DgramConn,
    session: &'a Session,
}

impl<'a> Negotiator for RespondNegotiator<'a> {
    fn handle(&mut self, op: NegotiateOp) -> bool {
        let cmd = op.cmd();

        if !negotiate::known_feature(cmd.feature) {
            return true;
        }

        match op {
            NegotiateOp::Confirm(Dir::Local, cmd) => match cmd.feature {
                // The client confirms with the cookie it generated itself.
                FTR_TOKEN => cmd.first_string8() == self.session.peer_cookie.as_deref(),
                FTR_FC_ID => cmd.first_uint8() == Some(self.conn.fc_meth),
                FTR_RWIN_SCALE => {
                    match cmd.first_uint8() {
                        Some(scale) if scale == self.conn.rwin_host_scale => (),
                        _ => self.conn.rwin_host_scale = 0,
                    }
                    true
                }
                _ => true,
            },
            NegotiateOp::Confirm(Dir::Remote, cmd) => match cmd.feature {
                FTR_FC_ID => cmd.first_uint8() == Some(self.conn.fc_meth),
                _ => true,
            },
            NegotiateOp::Change(_, _) => true,
        }
    }
}

/// Handles a datagram in LISTEN. Only a well-formed PAY|SYN with the
/// negotiated cookie moves the connection to RESPOND; everything else is
/// dropped without a response so address spoofing learns nothing.
pub fn handle_syn(
    conn: &mut DgramConn,
    session: &mut Session,
    packet: &Packet,
    now: Instant,
) -> bool {
    if packet.header.flags != PAY_FLAG | SYN_FLAG {
        conn.corrupted_packets += 1;
        return false;
    }

    // A handshake parked too long in LISTEN is no longer trusted.
    match session.cookie_accepted {
        Some(accepted) if now.duration_since(accepted) <= STATE_TIMEOUT => (),
        _ => return false,
    }

    {
        let mut negotiator = ListenNegotiator {
            conn: &mut *conn,
            session: &*session,
        };
        if !negotiate::apply(&mut negotiator, &packet.sys_cmds) {
            return false;
        }
    }

    conn.record_received_payload(packet.header.payload_id, now);
    conn.update_peer_window(packet.header.window);
    conn.set_state(DgramState::Respond, now);

    true
}

/// The RESPOND packet: PAY|ACK|SYN acknowledging the SYN, confirming the
/// server cookie and proposing flow control and window scale.
pub fn respond_packet(conn: &mut DgramConn, session: &Session) -> NetworkResult<OutPacket> {
    let mut packet = Packet::new(PAY_FLAG | ACK_FLAG | SYN_FLAG);

    packet.header.window = conn.advertised_window();
    packet.header.payload_id = conn.host_id;
    packet.header.ack_nak_id = conn.count_s_ack;

    packet.sys_cmds = conn.ack_nak.to_sys_cmds(MAX_SYSTEM_COMMAND_COUNT - 12);

    if let Some(cookie) = &session.host_cookie {
        packet.sys_cmds.push(SysCmd::ConfirmL(Negotiate::string8(FTR_TOKEN, &[cookie])));
    }
    if let Some(cookie) = &session.peer_cookie {
        packet.sys_cmds.push(SysCmd::ChangeL(Negotiate::string8(FTR_TOKEN, &[cookie])));
    }

    packet.sys_cmds.push(SysCmd::ConfirmL(Negotiate::uint8(FTR_CC_ID, &[conn.cc_meth])));
    packet.sys_cmds.push(SysCmd::ConfirmR(Negotiate::uint8(FTR_CC_ID, &[conn.cc_meth])));
    packet.sys_cmds.push(SysCmd::ChangeL(Negotiate::uint8(FTR_FC_ID, &[conn.fc_meth])));
    packet.sys_cmds.push(SysCmd::ChangeR(Negotiate::uint8(FTR_FC_ID, &[conn.fc_meth])));
    packet
        .sys_cmds
        .push(SysCmd::ChangeL(Negotiate::uint8(FTR_RWIN_SCALE, &[conn.rwin_host_scale])));
    packet
        .sys_cmds
        .push(SysCmd::ConfirmL(Negotiate::uint8(FTR_RWIN_SCALE, &[conn.rwin_peer_scale])));
    packet
        .sys_cmds
        .push(SysCmd::ConfirmL(Negotiate::uint8(FTR_CMD_COMPRESS, &[conn.peer_cmd_cmpr])));
    packet
        .sys_cmds
        .push(SysCmd::ConfirmR(Negotiate::uint8(FTR_CMD_COMPRESS, &[conn.host_cmd_cmpr])));

    let out = serialize(conn, &packet)?;

    conn.ack_pending = false;
    conn.last_acked_pay = conn.last_r_pay;
    conn.count_s_ack = conn.count_s_ack.wrapping_add(1);

    Ok(out)
}

/// Handles the client's confirmation in RESPOND. Returns true when the
/// connection is OPEN; the worker then connects the socket to the peer.
pub fn handle_respond_reply(
    conn: &mut DgramConn,
    session: &mut Session,
    packet: &Packet,
    now: Instant,
) -> bool {
    if !packet.header.has(ACK_FLAG) {
        conn.corrupted_packets += 1;
        return false;
    }

    let acked = packet
        .sys_cmds
        .iter()
        .any(|cmd| matches!(cmd, SysCmd::Ack { pay_id } if *pay_id == conn.host_id));

    if !acked {
        conn.corrupted_packets += 1;
        return false;
    }

    {
        let mut negotiator = RespondNegotiator {
            conn: &mut *conn,
            session: &*session,
        };
        if !negotiate::apply(&mut negotiator, &packet.sys_cmds) {
            conn.corrupted_packets += 1;
            return false;
        }
    }

    conn.handle_ack_nak_run(&packet.sys_cmds, now, session);

    if packet.header.has(PAY_FLAG) {
        conn.record_received_payload(packet.header.payload_id, now);
    }

    conn.update_peer_window(packet.header.window);
    conn.set_state(DgramState::Open, now);

    // The RESPOND packet consumed one payload id.
    conn.count_s_pay = 1;

    session.deliver_accept();

    true
}

/// The single ACK|FIN answer to a peer FIN, after which the connection is
/// CLOSED.
pub fn fin_reply_packet(conn: &mut DgramConn, now: Instant) -> NetworkResult<OutPacket> {
    let mut packet = Packet::new(PAY_FLAG | ACK_FLAG | FIN_FLAG | ANK_FLAG);

    packet.header.window = conn.advertised_window();
    packet.header.payload_id = conn.next_pay_id();
    packet.header.ack_nak_id = conn.count_s_ack;
    packet.header.ank_id = conn.ank_id;
    packet.sys_cmds = conn.ack_nak.to_sys_cmds(MAX_SYSTEM_COMMAND_COUNT);

    let out = serialize(conn, &packet)?;

    conn.ack_pending = false;
    conn.last_acked_pay = conn.last_r_pay;
    conn.count_s_ack = conn.count_s_ack.wrapping_add(1);
    conn.set_state(DgramState::Closed, now);

    Ok(out)
}
