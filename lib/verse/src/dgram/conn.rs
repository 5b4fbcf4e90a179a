use crate::cmd::node::{self, DEFAULT_PRIORITY};
use crate::cmd::queue::{prio_weight, Popped};
use crate::cmd::sys::{Negotiate, SysCmd};
use crate::cmd::{FakeCmd, InCmd};
use crate::dgram::OutPacket;
use crate::error::{NetworkResult, TerminateReason};
use crate::history::{AckNakHistory, SentPacketHistory};
use crate::negotiate::{CC_NONE, CMPR_ADDR_SHARE, FC_NONE, FTR_FPS};
use crate::session::Session;
use crate::wire::packet::{Packet, PacketHeader, ACK_FLAG, ANK_FLAG, FIN_FLAG, PAY_FLAG};
use crate::MAX_SYSTEM_COMMAND_COUNT;
use rand::Rng;
use std::io::Cursor;
use std::time::Instant;
use tempo::pacing::RESEND_TIMEOUT;
use tempo::time::elapsed_usecs;

/// Smoothing factor of the SRTT recurrence.
const RTT_ALPHA: f64 = 0.9;

/// Sanity bound on one ACK/NAK run; anything wider is treated as corrupt.
const MAX_ACK_RUN_SPAN: u32 = 65536;

/// Received payload needs a FPS confirmation on the next send.
const TMP_FLAG_FPS_CONFIRM: u8 = 0x01;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Role {
    Client,
    Server,
}

/// Endpoint states of the datagram connection. Request/PartOpen/Closing
/// belong to the client side, Listen/Respond/CloseReq to the server side.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DgramState {
    Reserved,
    Request,
    PartOpen,
    Listen,
    Respond,
    Open,
    CloseReq,
    Closing,
    Closed,
}

/// Verdict on one received payload id.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum PayloadVerdict {
    Accepted,
    Unordered,
}

/// The reliable layer over unordered datagrams: ids, windows, histories
/// and the per-state bookkeeping of one endpoint.
pub struct DgramConn {
    pub role: Role,
    pub state: DgramState,
    pub state_began: Instant,
    pub state_attempts: u16,

    /// Random seed of outgoing payload ids.
    pub host_id: u32,
    /// First received payload id; zero until the first payload arrives.
    pub peer_id: u32,

    pub last_r_pay: u32,
    pub last_r_ack: u32,
    pub ank_id: u32,
    pub count_s_pay: u32,
    pub count_s_ack: u32,
    pub last_acked_pay: u32,

    pub fc_meth: u8,
    pub cc_meth: u8,
    pub host_cmd_cmpr: u8,
    pub peer_cmd_cmpr: u8,

    /// Smoothed round-trip time, microseconds.
    pub srtt: u64,
    pub cwin: u32,
    pub rwin_host: u32,
    pub rwin_peer: u32,
    pub rwin_host_scale: u8,
    pub rwin_peer_scale: u8,
    pub sent_size: u32,

    pub tv_pay_recv: Instant,
    pub tv_pay_send: Instant,
    pub tv_ack_recv: Instant,
    pub tv_ack_send: Instant,

    pub packet_history: SentPacketHistory,
    pub ack_nak: AckNakHistory,

    /// A received payload packet still awaits its acknowledgement.
    pub ack_pending: bool,
    pub corrupted_packets: u64,
    pub tmp_flags: u8,

    pub mtu: usize,
}

impl DgramConn {
    pub fn new(role: Role, mtu: usize, now: Instant) -> DgramConn {
        let host_id = loop {
            let seed: u32 = rand::thread_rng().gen();
            if seed != 0 {
                break seed;
            }
        };

        DgramConn {
            role,
            state: match role {
                Role::Client => DgramState::Reserved,
                Role::Server => DgramState::Listen,
            },
            state_began: now,
            state_attempts: 0,
            host_id,
            peer_id: 0,
            last_r_pay: 0,
            last_r_ack: 0,
            ank_id: 0,
            count_s_pay: 0,
            count_s_ack: 0,
            last_acked_pay: 0,
            fc_meth: FC_NONE,
            cc_meth: CC_NONE,
            host_cmd_cmpr: CMPR_ADDR_SHARE,
            peer_cmd_cmpr: CMPR_ADDR_SHARE,
            srtt: 0,
            cwin: 0xFFFF_FFFF,
            rwin_host: 0xFFFF_FFFF,
            rwin_peer: 0xFFFF_FFFF,
            rwin_host_scale: 0,
            rwin_peer_scale: 0,
            sent_size: 0,
            tv_pay_recv: now,
            tv_pay_send: now,
            tv_ack_recv: now,
            tv_ack_send: now,
            packet_history: SentPacketHistory::new(),
            ack_nak: AckNakHistory::new(),
            ack_pending: false,
            corrupted_packets: 0,
            tmp_flags: 0,
            mtu,
        }
    }

    /// Enters a new state, resetting the attempt counter and the state
    /// clock.
    pub fn set_state(&mut self, state: DgramState, now: Instant) {
        self.state = state;
        self.state_began = now;
        self.state_attempts = 0;
    }

    #[inline]
    pub fn cmp_state(&self, state: DgramState) -> bool {
        self.state == state
    }

    /// Window floors per negotiated method. TCP_LIKE advertises the same
    /// ceiling as NONE; the wire contract does not change when a real
    /// slow-start lands here.
    pub fn refresh_windows(&mut self) {
        self.rwin_host = 0xFFFF_FFFF;
        self.cwin = 0xFFFF_FFFF;
    }

    /// The pre-shifted window advertised in every outgoing header.
    #[inline]
    pub fn advertised_window(&self) -> u16 {
        (self.rwin_host >> self.rwin_host_scale).min(u32::from(u16::max_value())) as u16
    }

    /// Send window: what the peer can accept against what congestion
    /// control allows, minus unacknowledged bytes.
    #[inline]
    pub fn send_window(&self) -> usize {
        let window = self.cwin.min(self.rwin_peer);
        window.saturating_sub(self.sent_size) as usize
    }

    /// Records a received peer window from a packet header.
    #[inline]
    pub fn update_peer_window(&mut self, raw: u16) {
        self.rwin_peer = u32::from(raw) << self.rwin_peer_scale;
    }

    /// Next outgoing payload id.
    #[inline]
    pub fn next_pay_id(&self) -> u32 {
        self.host_id.wrapping_add(self.count_s_pay)
    }

    /// Classifies a received payload id against the in-order expectation
    /// and updates the ACK/NAK vector.
    pub fn record_received_payload(&mut self, pay_id: u32, now: Instant) -> PayloadVerdict {
        if self.peer_id == 0 {
            self.peer_id = pay_id;
            self.last_r_pay = pay_id;
            self.ack_nak.push_ack(pay_id);
            self.ack_pending = true;
            self.tv_pay_recv = now;
            return PayloadVerdict::Accepted;
        }

        let diff = pay_id.wrapping_sub(self.last_r_pay);

        if diff == 0 || diff > u32::max_value() / 2 {
            return PayloadVerdict::Unordered;
        }

        if diff > 1 {
            // Gap: everything between the expectation and this packet is
            // missing.
            self.ack_nak.push_nak(self.last_r_pay.wrapping_add(1));
        }

        self.last_r_pay = pay_id;
        self.ack_nak.push_ack(pay_id);
        self.ack_pending = true;
        self.tv_pay_recv = now;

        PayloadVerdict::Accepted
    }

    /// Processes the leading ACK/NAK run of a received packet: SRTT from
    /// the smallest round trip in the run, acknowledged packets leave the
    /// history, lost commands still alive go back to the head of their
    /// bucket, the final ACK of the run becomes the new ANK id.
    pub fn handle_ack_nak_run(&mut self, cmds: &[SysCmd], now: Instant, session: &mut Session) {
        let run: Vec<(bool, u32)> = cmds
            .iter()
            .map_while(|cmd| match cmd {
                SysCmd::Ack { pay_id } => Some((true, *pay_id)),
                SysCmd::Nak { pay_id } => Some((false, *pay_id)),
                _ => None,
            })
            .collect();

        if run.is_empty() {
            return;
        }

        // The smallest RTT among acknowledged packets still in history.
        if run[0].0 {
            let mut rtt = u64::max_value();
            for &(is_ack, pay_id) in &run {
                if is_ack {
                    if let Some(record) = self.packet_history.find_packet(pay_id) {
                        rtt = rtt.min(elapsed_usecs(record.sent_at, now));
                    }
                }
            }

            if rtt < u64::max_value() {
                self.srtt = if self.srtt == 0 {
                    rtt
                } else {
                    (RTT_ALPHA * self.srtt as f64 + (1.0 - RTT_ALPHA) * rtt as f64) as u64
                };
            }
        }

        let mut freed = 0u32;

        for (index, &(is_ack, pay_id)) in run.iter().enumerate() {
            let next = run.get(index + 1).map(|&(_, id)| id);

            if is_ack {
                match next {
                    Some(end) => {
                        let span = end.wrapping_sub(pay_id);
                        if span > MAX_ACK_RUN_SPAN {
                            self.corrupted_packets += 1;
                            return;
                        }
                        let mut id = pay_id;
                        while id != end {
                            freed += self.packet_history.remove_acked(id);
                            id = id.wrapping_add(1);
                        }
                    }
                    None => {
                        freed += self.packet_history.remove_acked(pay_id);
                        self.ank_id = pay_id;
                    }
                }
            } else {
                let end = match next {
                    Some(end) => end,
                    // A NAK is never the last entry of a well-formed run.
                    None => pay_id.wrapping_add(1),
                };

                let span = end.wrapping_sub(pay_id);
                if span > MAX_ACK_RUN_SPAN {
                    self.corrupted_packets += 1;
                    return;
                }

                let mut id = pay_id;
                while id != end {
                    let (_, size) = self.packet_history.remove_naked(id, &mut session.out_queue);
                    freed += size;
                    id = id.wrapping_add(1);
                }
            }
        }

        self.sent_size = self.sent_size.saturating_sub(freed);
        self.tv_ack_recv = now;
    }

    /// Handles a packet in OPEN or CLOSEREQ: the ACK pipeline, windows,
    /// inline FPS negotiation and delivery of the node-command body.
    ///
    /// Returns true when the packet carried FIN and the connection should
    /// answer ACK|FIN and close.
    pub fn handle_open_packet(&mut self, packet: &Packet, now: Instant, session: &mut Session) -> bool {
        let header = &packet.header;

        if header.has(ACK_FLAG) {
            self.handle_ack_nak_run(&packet.sys_cmds, now, session);
            self.last_r_ack = header.ack_nak_id;
        }

        if header.has(ANK_FLAG) {
            self.ack_nak.trim(header.ank_id);
        }

        self.update_peer_window(header.window);

        // Inline negotiation: only the frame rate changes mid-connection.
        for cmd in &packet.sys_cmds {
            match cmd {
                SysCmd::ChangeL(negotiate) if negotiate.feature == FTR_FPS => {
                    if let Some(fps) = negotiate.first_real32() {
                        session.fps_peer = fps;
                        self.tmp_flags |= TMP_FLAG_FPS_CONFIRM;
                    }
                }
                SysCmd::ConfirmL(negotiate) if negotiate.feature == FTR_FPS => {
                    if let Some(fps) = negotiate.first_real32() {
                        session.fps_peer = fps;
                    }
                }
                _ => (),
            }
        }

        if header.has(PAY_FLAG) {
            match self.record_received_payload(header.payload_id, now) {
                PayloadVerdict::Accepted => {
                    for cmd in &packet.node_cmds {
                        session.in_queue.push(InCmd::Node(cmd.clone()));
                    }
                }
                PayloadVerdict::Unordered => (),
            }
        }

        header.has(FIN_FLAG)
    }

    /// Builds the next packet in OPEN or CLOSEREQ: the priority scheduler
    /// of the outgoing queue under `min(cwin, rwin_peer)`, piggybacked
    /// ACK/NAK commands and keep-alives. Returns None when there is
    /// nothing to say.
    pub fn build_open_packet(&mut self, now: Instant, session: &mut Session) -> NetworkResult<Option<OutPacket>> {
        let mut flags = 0u8;
        let mut keep_alive = false;

        if session.out_queue.count() > 0 {
            flags |= PAY_FLAG;
        } else if now.duration_since(self.tv_pay_send) > RESEND_TIMEOUT {
            flags |= PAY_FLAG;
            keep_alive = true;
        }

        if self.state == DgramState::CloseReq {
            flags |= FIN_FLAG;
        }

        let send_acks = self.ack_nak.count() > 0 && (flags & PAY_FLAG != 0 || self.ack_pending);
        if send_acks {
            flags |= ACK_FLAG;
        }

        // Nothing to send and nothing to acknowledge: cancel.
        if flags & (PAY_FLAG | ACK_FLAG) == 0 {
            return Ok(None);
        }

        flags |= ANK_FLAG;

        self.refresh_windows();

        let mut header = PacketHeader::new(flags);
        header.window = self.advertised_window();
        header.ank_id = self.ank_id;
        header.payload_id = if flags & PAY_FLAG != 0 { self.next_pay_id() } else { 0 };
        header.ack_nak_id = if flags & ACK_FLAG != 0 { self.count_s_ack } else { 0 };

        let mut sys_cmds: Vec<SysCmd> = Vec::new();

        if send_acks {
            sys_cmds.extend(self.ack_nak.to_sys_cmds(MAX_SYSTEM_COMMAND_COUNT - 2));
        }

        // Repeat the FPS proposal until the peer confirms; answer a peer
        // proposal exactly once.
        if (session.fps_host - session.fps_peer).abs() > f32::EPSILON {
            sys_cmds.push(SysCmd::ChangeL(Negotiate::real32(FTR_FPS, &[session.fps_host])));
        } else if self.tmp_flags & TMP_FLAG_FPS_CONFIRM != 0 {
            sys_cmds.push(SysCmd::ConfirmL(Negotiate::real32(FTR_FPS, &[session.fps_peer])));
            self.tmp_flags &= !TMP_FLAG_FPS_CONFIRM;
        }

        let mut buffer = vec![0u8; self.mtu];
        let mut written;
        {
            let mut stream = Cursor::new(&mut buffer[..]);
            written = header.pack(&mut stream)?;
            for cmd in &sys_cmds {
                written += cmd.pack(&mut stream)?;
            }
        }

        let pay_id = if flags & PAY_FLAG != 0 {
            let pay_id = header.payload_id;
            self.packet_history.add_packet(pay_id, now);

            if !keep_alive {
                written = self.pack_prio_queues(&mut buffer, written, pay_id, now, session);
            }

            Some(pay_id)
        } else {
            None
        };

        buffer.truncate(written);

        Ok(Some(OutPacket {
            bytes: buffer,
            pay_id,
            ack: send_acks,
        }))
    }

    /// Two-pass weighted-fair selection: buckets at or above the default
    /// priority split the window by exponential weight, then what remains
    /// goes to the low buckets the same way.
    fn pack_prio_queues(
        &mut self,
        buffer: &mut [u8],
        mut pos: usize,
        pay_id: u32,
        now: Instant,
        session: &mut Session,
    ) -> usize {
        let swin = self.send_window().min(self.mtu);

        let max_prio = match session.out_queue.max_prio() {
            Some(prio) => prio,
            None => return pos,
        };
        let min_prio = session.out_queue.min_prio().unwrap_or(DEFAULT_PRIORITY);

        let sum_high = session.out_queue.prio_sum_high();
        let available = swin.saturating_sub(pos);

        for prio in (DEFAULT_PRIORITY..=max_prio).rev() {
            if session.out_queue.count_prio(prio) == 0 || pos >= swin {
                continue;
            }
            let prio_win = (available as f32 * prio_weight(prio) / sum_high) as usize;
            pos = self.pack_bucket(buffer, pos, prio, prio_win, pay_id, now, session);
        }

        if pos < swin && min_prio < DEFAULT_PRIORITY {
            let sum_low = session.out_queue.prio_sum_low();
            let available = swin.saturating_sub(pos);

            for prio in (min_prio..DEFAULT_PRIORITY).rev() {
                if session.out_queue.count_prio(prio) == 0 || pos >= swin {
                    continue;
                }
                let prio_win = (available as f32 * prio_weight(prio) / sum_low) as usize;
                pos = self.pack_bucket(buffer, pos, prio, prio_win, pay_id, now, session);
            }
        }

        pos
    }

    /// Packs one bucket into the buffer under its share of the window.
    /// Fake commands are consumed here: they drive state instead of bytes.
    fn pack_bucket(
        &mut self,
        buffer: &mut [u8],
        mut pos: usize,
        prio: u8,
        prio_win: usize,
        pay_id: u32,
        now: Instant,
        session: &mut Session,
    ) -> usize {
        let mut bucket_budget = prio_win;
        let compress = self.host_cmd_cmpr == CMPR_ADDR_SHARE;

        while session.out_queue.count_prio(prio) > 0 && bucket_budget > 0 && pos < self.mtu {
            let budget = bucket_budget.min(self.mtu - pos);

            let popped = match session.out_queue.pop(prio, budget, compress) {
                Some(popped) => popped,
                None => break,
            };

            match popped {
                Popped::Fake(FakeCmd::ConnectTerminate { .. }) => {
                    let next = match self.role {
                        Role::Server => DgramState::CloseReq,
                        Role::Client => DgramState::Closing,
                    };
                    self.set_state(next, now);
                }
                Popped::Fake(FakeCmd::Fps { fps }) => {
                    session.fps_host = fps;
                }
                Popped::Fake(_) => (),
                Popped::Group { cmds, share } => {
                    let mut stream = Cursor::new(&mut buffer[pos..]);
                    match node::pack_group(&mut stream, &cmds, share) {
                        Ok(written) => {
                            pos += written;
                            bucket_budget = bucket_budget.saturating_sub(written);
                            for cmd in cmds {
                                self.packet_history.add_cmd(pay_id, cmd);
                            }
                        }
                        Err(_) => {
                            // No room after all; the group was already
                            // removed, keep it for the next packet.
                            for cmd in cmds.into_iter().rev() {
                                session.out_queue.push_node_head(cmd);
                            }
                            break;
                        }
                    }
                }
            }
        }

        pos
    }

    /// Marks a packet as handed to the network.
    pub fn commit_send(&mut self, packet: &OutPacket, now: Instant) {
        if let Some(pay_id) = packet.pay_id {
            self.count_s_pay = self.count_s_pay.wrapping_add(1);
            self.tv_pay_send = now;
            self.sent_size = self.sent_size.saturating_add(packet.bytes.len() as u32);
            self.packet_history.set_size(pay_id, packet.bytes.len() as u32);
        }

        if packet.ack {
            self.count_s_ack = self.count_s_ack.wrapping_add(1);
            self.tv_ack_send = now;
            self.ack_pending = false;
            self.last_acked_pay = self.last_r_pay;
        }
    }

    /// Rolls a packet back after the socket refused it; live commands
    /// return to their buckets.
    pub fn abort_send(&mut self, packet: &OutPacket, session: &mut Session) {
        if let Some(pay_id) = packet.pay_id {
            let _ = self.packet_history.remove_naked(pay_id, &mut session.out_queue);
        }
    }

    /// Delivers the teardown signal and closes.
    pub fn terminate(&mut self, reason: TerminateReason, now: Instant, session: &mut Session) {
        session.deliver_terminate(reason);
        self.set_state(DgramState::Closed, now);
    }
}
