//! Worker loops pumping one UDP socket for one datagram connection. Each
//! worker blocks in a bounded poll whose timeout follows the connection
//! state: exponential backoff through the handshake, the negotiated frame
//! rate once OPEN.

use crate::dgram::conn::{DgramConn, DgramState, Role};
use crate::dgram::{client, server};
use crate::error::{ErrorUtils, NetworkResult, TerminateReason};
use crate::session::SharedSession;
use crate::url::addr_eq_port;
use crate::wire::packet::Packet;
use crate::MAX_PACKET_SIZE;
use mio::net::UdpSocket;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tempo::logging::{self, Logger};
use tempo::pacing::{Pacing, STATE_TIMEOUT};

const SOCKET_TOKEN: mio::Token = mio::Token(0);

/// Shared plumbing of both datagram workers.
struct Pump {
    socket: UdpSocket,
    poll: mio::Poll,
    events: mio::Events,
    peer: Option<SocketAddr>,
    max_attempts: u16,
    log: Logger,
}

impl Pump {
    fn new(socket: UdpSocket, peer: Option<SocketAddr>, max_attempts: u16, log: Logger) -> NetworkResult<Pump> {
        let poll = mio::Poll::new()?;
        poll.register(&socket, SOCKET_TOKEN, mio::Ready::readable(), mio::PollOpt::edge())?;

        Ok(Pump {
            socket,
            poll,
            events: mio::Events::with_capacity(64),
            peer,
            max_attempts,
            log,
        })
    }

    /// Blocks until the socket is readable or the timeout passes.
    fn wait(&mut self, timeout: Duration) -> NetworkResult<()> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(())
    }

    /// Receives every queued datagram, parsing each into a packet. Bad
    /// datagrams and datagrams from strangers count as corrupt and are
    /// dropped without touching connection state.
    fn drain<F: FnMut(Packet, SocketAddr)>(&mut self, conn: &mut DgramConn, mut handle: F) {
        let mut buffer = [0u8; MAX_PACKET_SIZE];

        loop {
            let (size, from) = match self.socket.recv_from(&mut buffer) {
                Ok(received) => received,
                Err(_) => break,
            };

            if let Some(peer) = &self.peer {
                if !addr_eq_port(peer, &from) {
                    conn.corrupted_packets += 1;
                    continue;
                }
            }

            match Packet::unpack(&buffer[..size]) {
                Ok((packet, corrupt)) => {
                    if corrupt > 0 {
                        conn.corrupted_packets += 1;
                        logging::debug!(self.log, "trailing garbage in datagram";
                                        "octets" => corrupt);
                    }
                    handle(packet, from);
                }
                Err(_) => {
                    conn.corrupted_packets += 1;
                }
            }
        }
    }

    fn send(&self, bytes: &[u8], to: &SocketAddr) -> NetworkResult<usize> {
        self.socket.send_to(bytes, to).map_err(Into::into)
    }
}

/// Runs the server side of one datagram connection to completion. The
/// socket is already bound to the allocated data-plane port; the session
/// carries the cookies negotiated on the stream.
pub fn server_loop(
    socket: UdpSocket,
    session: SharedSession,
    mtu: usize,
    max_attempts: u16,
    log: Logger,
) -> NetworkResult<()> {
    let now = Instant::now();
    let mut conn = DgramConn::new(Role::Server, mtu, now);
    let mut pump = Pump::new(socket, None, max_attempts, log)?;

    logging::debug!(pump.log, "datagram worker listening"; "host_id" => conn.host_id);

    loop {
        let fps = {
            let state = session.state.lock().expect("Session poisoned");
            state.fps_host
        };
        let pacing = Pacing::new(fps);

        let timeout = match conn.state {
            DgramState::Open | DgramState::CloseReq => pacing.open_wait(),
            _ => pacing.backoff(conn.state_attempts),
        };

        pump.wait(timeout)?;

        let now = Instant::now();
        let mut delivered = false;

        // Receive phase.
        {
            let mut state = session.state.lock().expect("Session poisoned");
            let conn_ref = &mut conn;

            let mut incoming: Vec<(Packet, SocketAddr)> = Vec::new();
            pump.drain(conn_ref, |packet, from| incoming.push((packet, from)));

            for (packet, from) in incoming {
                match conn_ref.state {
                    DgramState::Listen => {
                        if server::handle_syn(conn_ref, &mut state, &packet, now) {
                            pump.peer = Some(from);
                        }
                    }
                    DgramState::Respond => {
                        if server::handle_respond_reply(conn_ref, &mut state, &packet, now) {
                            // Plain UDP narrows the socket to the peer once
                            // the handshake holds.
                            if let Err(error) = pump.socket.connect(from) {
                                logging::warn!(pump.log, "socket connect failed";
                                               "error" => %error);
                            }
                            delivered = true;
                        }
                    }
                    DgramState::Open | DgramState::CloseReq => {
                        let fin = conn_ref.handle_open_packet(&packet, now, &mut state);
                        delivered = true;

                        if fin {
                            if let Ok(reply) = server::fin_reply_packet(conn_ref, now) {
                                let _ = pump.send(&reply.bytes, &from);
                            }
                            state.deliver_terminate(TerminateReason::Server);
                        }
                    }
                    _ => (),
                }
            }
        }

        if delivered {
            session.data_signal.post();
        }

        // Send phase.
        let mut state = session.state.lock().expect("Session poisoned");

        match conn.state {
            DgramState::Respond => {
                if conn.state_attempts >= pump.max_attempts {
                    conn.terminate(TerminateReason::Timeout, now, &mut state);
                } else if let Some(peer) = pump.peer {
                    let out = server::respond_packet(&mut conn, &state)?;
                    if pump.send(&out.bytes, &peer).has_failed() {
                        conn.terminate(TerminateReason::Error, now, &mut state);
                    }
                    conn.state_attempts += 1;
                }
            }
            DgramState::Open | DgramState::CloseReq => {
                if let Some(peer) = pump.peer {
                    if let Some(out) = conn.build_open_packet(now, &mut state)? {
                        match pump.send(&out.bytes, &peer) {
                            Ok(_) => conn.commit_send(&out, now),
                            Err(_) => conn.abort_send(&out, &mut state),
                        }
                    }
                }
            }
            _ => (),
        }

        // Timeout supervision.
        match conn.state {
            DgramState::Listen | DgramState::Respond => {
                if now.duration_since(conn.state_began) > STATE_TIMEOUT {
                    conn.terminate(TerminateReason::Timeout, now, &mut state);
                }
            }
            DgramState::Open | DgramState::CloseReq => {
                if now.duration_since(conn.tv_pay_recv) > STATE_TIMEOUT {
                    conn.terminate(TerminateReason::Timeout, now, &mut state);
                }
            }
            _ => (),
        }

        if conn.state == DgramState::Closed {
            logging::debug!(pump.log, "datagram worker closing";
                            "corrupted_packets" => conn.corrupted_packets);
            session.data_signal.post();
            return Ok(());
        }
    }
}

/// Runs the client side of one datagram connection to completion against
/// `server_addr`.
pub fn client_loop(
    socket: UdpSocket,
    server_addr: SocketAddr,
    session: SharedSession,
    mtu: usize,
    max_attempts: u16,
    log: Logger,
) -> NetworkResult<()> {
    let now = Instant::now();
    let mut conn = DgramConn::new(Role::Client, mtu, now);
    conn.set_state(DgramState::Request, now);

    let mut pump = Pump::new(socket, Some(server_addr), max_attempts, log)?;

    logging::debug!(pump.log, "datagram worker connecting";
                    "server" => %server_addr,
                    "host_id" => conn.host_id);

    loop {
        let now = Instant::now();

        let fps = {
            let state = session.state.lock().expect("Session poisoned");
            state.fps_host
        };
        let pacing = Pacing::new(fps);

        // Send phase first: handshake states open with a transmission.
        {
            let mut state = session.state.lock().expect("Session poisoned");

            match conn.state {
                DgramState::Request => {
                    if conn.state_attempts >= pump.max_attempts {
                        conn.terminate(TerminateReason::HostUnknown, now, &mut state);
                    } else {
                        let out = client::request_packet(&mut conn, &state)?;
                        let _ = pump.send(&out.bytes, &server_addr);
                        conn.state_attempts += 1;
                    }
                }
                DgramState::PartOpen => {
                    if conn.state_attempts >= pump.max_attempts {
                        conn.terminate(TerminateReason::Timeout, now, &mut state);
                    } else {
                        let out = client::partopen_packet(&mut conn, &state)?;
                        let _ = pump.send(&out.bytes, &server_addr);
                        conn.state_attempts += 1;
                    }
                }
                DgramState::Closing => {
                    if conn.state_attempts >= pump.max_attempts {
                        conn.terminate(TerminateReason::Timeout, now, &mut state);
                    } else {
                        let out = client::closing_packet(&mut conn)?;
                        let _ = pump.send(&out.bytes, &server_addr);
                        conn.state_attempts += 1;
                    }
                }
                DgramState::Open => {
                    if let Some(out) = conn.build_open_packet(now, &mut state)? {
                        match pump.send(&out.bytes, &server_addr) {
                            Ok(_) => conn.commit_send(&out, now),
                            Err(_) => conn.abort_send(&out, &mut state),
                        }
                    }
                }
                _ => (),
            }
        }

        if conn.state == DgramState::Closed {
            session.data_signal.post();
            return Ok(());
        }

        let timeout = match conn.state {
            DgramState::Open => pacing.open_wait(),
            _ => pacing.backoff(conn.state_attempts),
        };

        pump.wait(timeout)?;

        let now = Instant::now();
        let mut delivered = false;

        {
            let mut state = session.state.lock().expect("Session poisoned");
            let conn_ref = &mut conn;

            let mut incoming: Vec<(Packet, SocketAddr)> = Vec::new();
            pump.drain(conn_ref, |packet, from| incoming.push((packet, from)));

            for (packet, _) in incoming {
                match conn_ref.state {
                    DgramState::Request => {
                        client::handle_request_reply(conn_ref, &mut state, &packet, now);
                    }
                    DgramState::PartOpen => {
                        if client::handle_partopen_reply(conn_ref, &mut state, &packet, now) {
                            delivered = true;
                        }
                    }
                    DgramState::Open => {
                        let fin = conn_ref.handle_open_packet(&packet, now, &mut state);
                        delivered = true;

                        if fin {
                            if let Ok(reply) = server::fin_reply_packet(conn_ref, now) {
                                let _ = pump.send(&reply.bytes, &server_addr);
                            }
                            state.deliver_terminate(TerminateReason::Server);
                        }
                    }
                    DgramState::Closing => {
                        if client::handle_closing_reply(conn_ref, &packet, now) {
                            state.deliver_terminate(TerminateReason::Server);
                        }
                    }
                    _ => (),
                }
            }

            // Timeout supervision.
            match conn.state {
                DgramState::Request | DgramState::PartOpen | DgramState::Closing => {
                    if now.duration_since(conn.state_began) > STATE_TIMEOUT {
                        conn.terminate(TerminateReason::Timeout, now, &mut state);
                    }
                }
                DgramState::Open => {
                    if now.duration_since(conn.tv_pay_recv) > STATE_TIMEOUT {
                        conn.terminate(TerminateReason::Timeout, now, &mut state);
                    }
                }
                _ => (),
            }
        }

        if delivered {
            session.data_signal.post();
        }

        if conn.state == DgramState::Closed {
            session.data_signal.post();
            return Ok(());
        }
    }
}
