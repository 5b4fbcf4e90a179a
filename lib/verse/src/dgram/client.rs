//! Client side of the datagram handshake: REQUEST → PARTOPEN → OPEN, and
//! the CLOSING teardown.

use crate::dgram::conn::{DgramConn, DgramState};
use crate::dgram::OutPacket;
use crate::error::NetworkResult;
use crate::negotiate::{
    self, Dir, NegotiateOp, Negotiator, CC_NONE, CC_TCP_LIKE, CMPR_ADDR_SHARE, CMPR_NONE, FC_NONE,
    FC_TCP_LIKE, FTR_CC_ID, FTR_CMD_COMPRESS, FTR_FC_ID, FTR_RWIN_SCALE, FTR_TOKEN,
};
use crate::cmd::sys::{Negotiate, SysCmd};
use crate::session::Session;
use crate::wire::packet::{Packet, ACK_FLAG, ANK_FLAG, FIN_FLAG, PAY_FLAG, SYN_FLAG};
use crate::MAX_SYSTEM_COMMAND_COUNT;
use std::io::Cursor;
use std::time::Instant;

/// Serializes a handshake packet into an MTU-bounded buffer. Handshake
/// packets keep fixed payload ids across retransmissions, so they bypass
/// the send-commit bookkeeping.
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

/// The REQUEST packet: PAY|SYN carrying the negotiated cookie and the
/// client's proposals for congestion control, window scale and command
/// compression.
pub fn request_packet(conn: &mut DgramConn, session: &Session) -> NetworkResult<OutPacket> {
    let mut packet = Packet::new(PAY_FLAG | SYN_FLAG);

    packet.header.window = conn.advertised_window();
    packet.header.payload_id = conn.host_id;

    if let Some(cookie) = &session.peer_cookie {
        packet.sys_cmds.push(SysCmd::ChangeL(Negotiate::string8(FTR_TOKEN, &[cookie])));
    }

    packet.sys_cmds.push(SysCmd::ChangeL(Negotiate::uint8(FTR_CC_ID, &[CC_NONE])));
    packet.sys_cmds.push(SysCmd::ChangeR(Negotiate::uint8(FTR_CC_ID, &[CC_NONE])));
    packet
        .sys_cmds
        .push(SysCmd::ChangeL(Negotiate::uint8(FTR_RWIN_SCALE, &[conn.rwin_host_scale])));
    packet
        .sys_cmds
        .push(SysCmd::ChangeL(Negotiate::uint8(FTR_CMD_COMPRESS, &[CMPR_ADDR_SHARE, CMPR_NONE])));
    packet
        .sys_cmds
        .push(SysCmd::ChangeR(Negotiate::uint8(FTR_CMD_COMPRESS, &[CMPR_ADDR_SHARE, CMPR_NONE])));

    serialize(conn, &packet)
}

/// Negotiation rules while waiting in REQUEST for the server's
/// PAY|ACK|SYN.
struct RequestNegotiator<'a> {
    conn: &'a mut DgramConn,
    session: &'a Session,
}

impl<'a> Negotiator for RequestNegotiator<'a> {
    fn handle(&mut self, op: NegotiateOp) -> bool {
        let cmd = op.cmd();

        if !negotiate::known_feature(cmd.feature) {
            return true;
        }

        match op {
            NegotiateOp::Change(Dir::Local, cmd) => match cmd.feature {
                // The server echoes back the cookie this client generated.
                FTR_TOKEN => cmd.first_string8() == self.session.host_cookie.as_deref(),
                FTR_FC_ID => {
                    match negotiate::pick_method(
                        match &cmd.values {
                            crate::cmd::sys::Values::Uint8(v) => v,
                            _ => return false,
                        },
                        &[FC_NONE, FC_TCP_LIKE],
                    ) {
                        Some(method) => {
                            self.conn.fc_meth = method;
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
                _ => true,
            },
            NegotiateOp::Change(Dir::Remote, cmd) => match cmd.feature {
                FTR_FC_ID => {
                    match negotiate::pick_method(
                        match &cmd.values {
                            crate::cmd::sys::Values::Uint8(v) => v,
                            _ => return false,
                        },
                        &[FC_NONE, FC_TCP_LIKE],
                    ) {
                        // Both directions must converge on one method.
                        Some(method) => method == self.conn.fc_meth,
                        None => false,
                    }
                }
                _ => true,
            },
            NegotiateOp::Confirm(Dir::Local, cmd) => match cmd.feature {
                FTR_TOKEN => cmd.first_string8() == self.session.peer_cookie.as_deref(),
                FTR_CC_ID => match cmd.first_uint8() {
                    Some(method) if method == CC_NONE || method == CC_TCP_LIKE => {
                        self.conn.cc_meth = method;
                        true
                    }
                    _ => false,
                },
                FTR_RWIN_SCALE => {
                    match cmd.first_uint8() {
                        Some(scale) if scale == self.conn.rwin_host_scale => (),
                        // Not confirmed as proposed: fall back to no scaling.
                        _ => self.conn.rwin_host_scale = 0,
                    }
                    true
                }
                FTR_CMD_COMPRESS => match cmd.first_uint8() {
                    Some(method) if method == CMPR_NONE || method == CMPR_ADDR_SHARE => {
                        self.conn.host_cmd_cmpr = method;
                        true
                    }
                    _ => false,
                },
                _ => true,
            },
            NegotiateOp::Confirm(Dir::Remote, cmd) => match cmd.feature {
                FTR_CC_ID => match cmd.first_uint8() {
                    Some(method) if method == self.conn.cc_meth => true,
                    _ => false,
                },
                FTR_CMD_COMPRESS => match cmd.first_uint8() {
                    Some(method) if method == CMPR_NONE || method == CMPR_ADDR_SHARE => {
                        self.conn.peer_cmd_cmpr = method;
                        true
                    }
                    _ => false,
                },
                _ => true,
            },
        }
    }
}

/// Handles the server's answer in REQUEST. Returns true when the
/// connection advanced to PARTOPEN.
pub fn handle_request_reply(
    conn: &mut DgramConn,
    session: &mut Session,
    packet: &Packet,
    now: Instant,
) -> bool {
    // The reply must acknowledge our SYN payload id, ACK command first.
    if packet.header.flags != PAY_FLAG | ACK_FLAG | SYN_FLAG {
        conn.corrupted_packets += 1;
        return false;
    }

    match packet.sys_cmds.first() {
        Some(SysCmd::Ack { pay_id }) if *pay_id == conn.host_id => (),
        _ => {
            conn.corrupted_packets += 1;
            return false;
        }
    }

    {
        let mut negotiator = RequestNegotiator {
            conn: &mut *conn,
            session: &*session,
        };
        if !negotiate::apply(&mut negotiator, &packet.sys_cmds) {
            conn.corrupted_packets += 1;
            return false;
        }
    }

    conn.handle_ack_nak_run(&packet.sys_cmds, now, session);
    conn.record_received_payload(packet.header.payload_id, now);
    conn.update_peer_window(packet.header.window);
    conn.set_state(DgramState::PartOpen, now);

    true
}

/// The PARTOPEN packet: PAY|ACK|ANK acknowledging the server's RESPOND
/// and confirming cookie, flow control and window scale.
pub fn partopen_packet(conn: &mut DgramConn, session: &Session) -> NetworkResult<OutPacket> {
    let mut packet = Packet::new(PAY_FLAG | ACK_FLAG | ANK_FLAG);

    packet.header.window = conn.advertised_window();
    packet.header.payload_id = conn.host_id.wrapping_add(1);
    packet.header.ack_nak_id = conn.count_s_ack;
    packet.header.ank_id = conn.ank_id;

    packet.sys_cmds = conn.ack_nak.to_sys_cmds(MAX_SYSTEM_COMMAND_COUNT - 8);

    if let Some(cookie) = &session.host_cookie {
        packet.sys_cmds.push(SysCmd::ConfirmL(Negotiate::string8(FTR_TOKEN, &[cookie])));
    }

    packet.sys_cmds.push(SysCmd::ConfirmL(Negotiate::uint8(FTR_FC_ID, &[conn.fc_meth])));
    packet.sys_cmds.push(SysCmd::ConfirmR(Negotiate::uint8(FTR_FC_ID, &[conn.fc_meth])));
    packet
        .sys_cmds
        .push(SysCmd::ConfirmL(Negotiate::uint8(FTR_RWIN_SCALE, &[conn.rwin_peer_scale])));

    let out = serialize(conn, &packet)?;

    conn.ack_pending = false;
    conn.last_acked_pay = conn.last_r_pay;
    conn.count_s_ack = conn.count_s_ack.wrapping_add(1);

    Ok(out)
}

/// Handles the server's answer in PARTOPEN. Returns true when the
/// connection is OPEN.
pub fn handle_partopen_reply(
    conn: &mut DgramConn,
    session: &mut Session,
    packet: &Packet,
    now: Instant,
) -> bool {
    if !packet.header.has(ACK_FLAG) || !packet.header.has(ANK_FLAG) {
        conn.corrupted_packets += 1;
        return false;
    }

    let partopen_id = conn.host_id.wrapping_add(1);
    let acked = packet
        .sys_cmds
        .iter()
        .any(|cmd| matches!(cmd, SysCmd::Ack { pay_id } if *pay_id == partopen_id));

    if !acked {
        conn.corrupted_packets += 1;
        return false;
    }

    conn.handle_ack_nak_run(&packet.sys_cmds, now, session);
    conn.update_peer_window(packet.header.window);
    conn.set_state(DgramState::Open, now);

    // Handshake consumed two payload ids.
    conn.count_s_pay = 2;

    // The accept signal reaches the application before any node command
    // the opening packet may carry.
    session.deliver_accept();

    if packet.header.has(PAY_FLAG) {
        conn.handle_open_packet(packet, now, session);
    }

    true
}

/// The CLOSING packet: PAY|FIN, retransmitted until the server answers
/// ACK|FIN.
pub fn closing_packet(conn: &mut DgramConn) -> NetworkResult<OutPacket> {
    let mut packet = Packet::new(PAY_FLAG | FIN_FLAG | ANK_FLAG);

    packet.header.window = conn.advertised_window();
    packet.header.payload_id = conn.next_pay_id();
    packet.header.ank_id = conn.ank_id;

    if conn.ack_nak.count() > 0 {
        packet.header.flags |= ACK_FLAG;
        packet.header.ack_nak_id = conn.count_s_ack;
        packet.sys_cmds = conn.ack_nak.to_sys_cmds(MAX_SYSTEM_COMMAND_COUNT);
    }

    serialize(conn, &packet)
}

/// Handles the server's teardown answer in CLOSING. Returns true when the
/// connection reached CLOSED.
pub fn handle_closing_reply(conn: &mut DgramConn, packet: &Packet, now: Instant) -> bool {
    if packet.header.has(ACK_FLAG) && packet.header.has(FIN_FLAG) {
        conn.set_state(DgramState::Closed, now);
        return true;
    }

    conn.corrupted_packets += 1;
    false
}
