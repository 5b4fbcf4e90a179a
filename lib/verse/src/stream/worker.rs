//! Worker loops pumping one TCP stream: the handshake on both sides, and
//! the message-based data plane when the negotiated transport stays on the
//! stream.

use crate::cmd::queue::Popped;
use crate::cmd::{FakeCmd, InCmd};
use crate::dgram;
use crate::error::{ErrorType, NetworkError, NetworkResult, TerminateReason};
use crate::session::{Session, SharedSession, TransportFlag};
use crate::stream::client::{self, ClientConfig};
use crate::stream::conn::{StreamConn, StreamState};
use crate::stream::server::{self, StreamHost};
use crate::url::VerseUrl;
use crate::wire::message::Message;
use crate::cmd::node::DEFAULT_PRIORITY;
use mio::net::TcpStream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tempo::logging::{self, Logger};
use tempo::pacing::{Pacing, STATE_TIMEOUT};

const STREAM_TOKEN: mio::Token = mio::Token(0);

/// Budget of one data-plane message body.
const DATA_MESSAGE_BUDGET: usize = 32768;

struct StreamPump {
    stream: TcpStream,
    poll: mio::Poll,
    events: mio::Events,
    log: Logger,
}

impl StreamPump {
    fn new(stream: TcpStream, log: Logger) -> NetworkResult<StreamPump> {
        let poll = mio::Poll::new()?;
        poll.register(
            &stream,
            STREAM_TOKEN,
            mio::Ready::readable() | mio::Ready::writable(),
            mio::PollOpt::edge(),
        )?;

        Ok(StreamPump {
            stream,
            poll,
            events: mio::Events::with_capacity(16),
            log,
        })
    }

    fn wait(&mut self, timeout: Duration) -> NetworkResult<()> {
        self.poll.poll(&mut self.events, Some(timeout))?;
        Ok(())
    }

    fn flush(&mut self, conn: &mut StreamConn) -> NetworkResult<()> {
        if !conn.send_buffer.is_empty() {
            conn.send_buffer.egress(&mut self.stream)?;
        }
        Ok(())
    }
}

/// Packs pending outgoing node commands into one data-plane message,
/// highest priority buckets first.
fn build_data_message(session: &mut Session) -> Option<Message> {
    if session.out_queue.count() == 0 {
        return None;
    }

    let mut message = Message::new();
    let mut budget = DATA_MESSAGE_BUDGET;

    let max_prio = session.out_queue.max_prio()?;
    let min_prio = session.out_queue.min_prio().unwrap_or(DEFAULT_PRIORITY);

    for prio in (min_prio..=max_prio).rev() {
        while session.out_queue.count_prio(prio) > 0 && budget > 64 {
            match session.out_queue.pop(prio, budget, false) {
                Some(Popped::Group { cmds, .. }) => {
                    for cmd in cmds {
                        budget = budget.saturating_sub(cmd.wire_len());
                        message.node_cmds.push(cmd);
                    }
                }
                Some(Popped::Fake(FakeCmd::Fps { fps })) => {
                    session.fps_host = fps;
                }
                Some(Popped::Fake(_)) => (),
                None => break,
            }
        }
    }

    if message.node_cmds.is_empty() {
        None
    } else {
        Some(message)
    }
}

/// Runs the server side of one accepted stream connection to completion.
pub fn server_loop(
    stream: TcpStream,
    session: SharedSession,
    host: Arc<dyn StreamHost + Send + Sync>,
    log: Logger,
) -> NetworkResult<()> {
    let now = Instant::now();
    let mut conn = StreamConn::new(StreamState::RespondMethods, now);
    let mut pump = StreamPump::new(stream, log)?;

    logging::debug!(pump.log, "stream worker accepted connection");

    loop {
        let fps = {
            let state = session.state.lock().expect("Session poisoned");
            state.fps_host
        };
        let pacing = Pacing::new(fps);

        let timeout = match conn.state {
            StreamState::StreamOpen => pacing.open_wait(),
            _ => Duration::from_millis(250),
        };

        pump.wait(timeout)?;

        let now = Instant::now();

        match pump_server_once(&mut conn, &mut pump, &session, host.as_ref(), now) {
            Ok(true) => continue,
            Ok(false) => return Ok(()),
            Err(NetworkError::Wait) => continue,
            Err(NetworkError::Fatal(ErrorType::StreamClosed)) => {
                let mut state = session.state.lock().expect("Session poisoned");
                // EOF during the data phase is a peer teardown, not an
                // error.
                if conn.state != StreamState::StreamOpen {
                    state.deliver_terminate(TerminateReason::Error);
                }
                session.data_signal.post();
                return Ok(());
            }
            Err(error) => {
                let mut state = session.state.lock().expect("Session poisoned");
                state.deliver_terminate(TerminateReason::Error);
                session.data_signal.post();
                return Err(error);
            }
        }
    }
}

/// One cycle of the server stream worker. Returns false when the stream
/// finished its work and the worker should exit.
fn pump_server_once(
    conn: &mut StreamConn,
    pump: &mut StreamPump,
    session: &SharedSession,
    host: &dyn StreamHost,
    now: Instant,
) -> NetworkResult<bool> {
    let mut state = session.state.lock().expect("Session poisoned");

    conn.recv_buffer.ingress(&mut pump.stream)?;

    let mut delivered = false;
    let mut close_after_flush = false;

    loop {
        let message = match conn.read_message() {
            Ok(message) => message,
            Err(NetworkError::Wait) => break,
            Err(error) => return Err(error),
        };

        if conn.state == StreamState::StreamOpen {
            for cmd in &message.node_cmds {
                state.in_queue.push(InCmd::Node(cmd.clone()));
                delivered = true;
            }
            continue;
        }

        let step = server::handle_message(conn, &mut state, &message, host, session, now)?;

        for reply in &step.replies {
            conn.write_message(reply)?;
        }

        if step.stream_open && state.transport == TransportFlag::Tcp {
            state.deliver_accept();
            delivered = true;
        }

        if step.close {
            close_after_flush = true;
        }
    }

    // Data plane on the stream: drain the outgoing queue.
    if conn.state == StreamState::StreamOpen && state.transport == TransportFlag::Tcp {
        while let Some(message) = build_data_message(&mut state) {
            if conn.write_message(&message).is_err() {
                break;
            }
        }
    }

    pump.flush(conn)?;

    if delivered {
        session.data_signal.post();
    }

    // A UDP session keeps the stream only until the datagram channel is
    // up.
    if conn.state == StreamState::StreamOpen && state.transport == TransportFlag::Udp && state.dgram_open
    {
        logging::debug!(pump.log, "data plane open, closing stream");
        return Ok(false);
    }

    if close_after_flush {
        conn.set_state(StreamState::Closed, now);
        return Ok(false);
    }

    // No message within the state timeout ends the handshake.
    if conn.state != StreamState::StreamOpen && now.duration_since(conn.state_began) > STATE_TIMEOUT {
        logging::warn!(pump.log, "stream handshake timed out"; "state" => ?conn.state);
        state.deliver_terminate(TerminateReason::Timeout);
        session.data_signal.post();
        return Ok(false);
    }

    Ok(true)
}

/// Runs the client side: dial, authenticate, negotiate, then either hand
/// off to the datagram worker or stay as the data plane.
pub fn client_loop(
    server_addr: SocketAddr,
    session: SharedSession,
    config: ClientConfig,
    max_attempts: u16,
    log: Logger,
) -> NetworkResult<()> {
    let stream = TcpStream::connect(&server_addr)?;
    let now = Instant::now();
    let mut conn = StreamConn::new(StreamState::UsrauthNone, now);
    let mut pump = StreamPump::new(stream, log)?;

    {
        let mut state = session.state.lock().expect("Session poisoned");
        let hello = client::initial_message(&config, &mut state);
        conn.write_message(&hello)?;
    }

    logging::debug!(pump.log, "stream worker dialing"; "server" => %server_addr);

    let mut data_plane: Option<VerseUrl> = None;

    loop {
        pump.wait(Duration::from_millis(250))?;
        pump.flush(&mut conn)?;

        let now = Instant::now();
        let mut state = session.state.lock().expect("Session poisoned");

        match conn.recv_buffer.ingress(&mut pump.stream) {
            Ok(_) => (),
            Err(NetworkError::Wait) => (),
            Err(error) => {
                state.deliver_terminate(TerminateReason::ServerDown);
                session.data_signal.post();
                return Err(error);
            }
        }

        loop {
            let message = match conn.read_message() {
                Ok(message) => message,
                Err(NetworkError::Wait) => break,
                Err(error) => return Err(error),
            };

            if conn.state == StreamState::StreamOpen {
                for cmd in &message.node_cmds {
                    state.in_queue.push(InCmd::Node(cmd.clone()));
                }
                session.data_signal.post();
                continue;
            }

            let step = client::handle_message(&mut conn, &mut state, &message, &config, now);

            for reply in &step.replies {
                conn.write_message(reply)?;
            }

            if let Some(reason) = step.failed {
                pump.flush(&mut conn)?;
                state.deliver_terminate(reason);
                session.data_signal.post();
                return Ok(());
            }

            if step.stream_open {
                state.deliver_accept();
                session.data_signal.post();
            }

            if step.data_plane.is_some() {
                data_plane = step.data_plane.clone();
            }
        }

        if conn.state == StreamState::StreamOpen && state.transport == TransportFlag::Tcp {
            while let Some(message) = build_data_message(&mut state) {
                if conn.write_message(&message).is_err() {
                    break;
                }
            }
        }

        pump.flush(&mut conn)?;

        // UDP hand-off: flush the URL confirmation, then run the datagram
        // handshake while the server still holds the stream open.
        if let Some(url) = &data_plane {
            if state.transport == TransportFlag::Udp {
                drop(state);

                let port = match url.port {
                    crate::url::UrlPort::Number(port) => port,
                    crate::url::UrlPort::Any => {
                        return Err(NetworkError::Fatal(ErrorType::UrlParse));
                    }
                };

                let dgram_addr = SocketAddr::new(server_addr.ip(), port);
                let local: SocketAddr = match server_addr {
                    SocketAddr::V4(_) => "0.0.0.0:0".parse()?,
                    SocketAddr::V6(_) => "[::]:0".parse()?,
                };
                let socket = mio::net::UdpSocket::bind(&local)?;

                logging::debug!(pump.log, "handing off to datagram worker"; "addr" => %dgram_addr);

                return dgram::worker::client_loop(
                    socket,
                    dgram_addr,
                    Arc::clone(&session),
                    crate::DEFAULT_MTU,
                    max_attempts,
                    pump.log.clone(),
                );
            }
        }

        if conn.state != StreamState::StreamOpen
            && now.duration_since(conn.state_began) > STATE_TIMEOUT
        {
            state.deliver_terminate(TerminateReason::Timeout);
            session.data_signal.post();
            return Ok(());
        }
    }
}
