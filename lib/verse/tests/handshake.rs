//! Drives a complete session through both handshake stages without any
//! sockets: stream authentication and negotiation, the datagram three-way
//! handshake, one payload exchange, then graceful teardown.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Instant;

use verse::cmd::node::NodeCmd;
use verse::cmd::queue::Popped;
use verse::cmd::sys::SysCmd;
use verse::cmd::{FakeCmd, InCmd};
use verse::dgram::conn::{DgramConn, DgramState, Role};
use verse::dgram::{client as dgram_client, server as dgram_server};
use verse::error::{NetworkResult, TerminateReason};
use verse::session::{DataSignal, Session, SessionHandle, SharedSession, TransportFlag};
use verse::stream::client::{self as stream_client, ClientConfig};
use verse::stream::server::{self as stream_server, StreamHost};
use verse::stream::{StreamConn, StreamState};
use verse::url::{Security, Transport, UrlPort, VerseUrl};
use verse::wire::message::Message;
use verse::wire::packet::{Packet, PAY_FLAG};
use verse::{AvatarId, UserId, DEFAULT_MTU};

struct TestHost;

impl StreamHost for TestHost {
    fn check_auth(&self, username: &str, password: &str) -> Option<(UserId, AvatarId)> {
        if username == "singer" && password == "verse4ever" {
            Some((1001, 7))
        } else {
            None
        }
    }

    fn ded(&self) -> String {
        "ded-v1".to_owned()
    }

    fn hostname(&self) -> String {
        "server.example".to_owned()
    }

    fn provision(
        &self,
        _session: &SharedSession,
        _state: &mut Session,
        requested: &VerseUrl,
    ) -> NetworkResult<VerseUrl> {
        Ok(VerseUrl::new(
            requested.transport,
            requested.security,
            "server.example",
            UrlPort::Number(20001),
        ))
    }
}

fn shared_session(id: u32) -> SharedSession {
    SessionHandle::shared(Session::new(id, "test"), Arc::new(DataSignal::new()))
}

fn client_config() -> ClientConfig {
    ClientConfig {
        username: "singer".to_owned(),
        password: "verse4ever".to_owned(),
        client_name: Some("probe".to_owned()),
        client_version: Some("0.1".to_owned()),
        requested_url: VerseUrl::new(Transport::Udp, Security::Dtls, "server.example", UrlPort::Any),
    }
}

/// Serializes then reparses a message, as the wire would.
fn over_the_wire(message: &Message) -> Message {
    let mut buffer = vec![0u8; 4096];
    let written;
    {
        let mut stream = Cursor::new(&mut buffer[..]);
        written = message.pack(&mut stream).unwrap();
    }

    let (parsed, consumed) = Message::unpack(&buffer[..written]).unwrap();
    assert_eq!(consumed, written);
    parsed
}

fn parse_packet(bytes: &[u8]) -> Packet {
    let (packet, corrupt) = Packet::unpack(bytes).unwrap();
    assert_eq!(corrupt, 0, "Datagram carried trailing garbage");
    packet
}

/// The queued commands of a session's incoming queue, drained.
fn drain_in_queue(session: &SharedSession) -> Vec<InCmd> {
    let mut state = session.state.lock().unwrap();
    let mut drained = Vec::new();
    while let Some(cmd) = state.in_queue.pop() {
        drained.push(cmd);
    }
    drained
}

#[test]
fn test_full_session_lifecycle_udp_dtls() {
    let now = Instant::now();
    let host = TestHost;

    let client_session = shared_session(1);
    let server_session = shared_session(2);

    let mut client_stream = StreamConn::new(StreamState::UsrauthNone, now);
    let mut server_stream = StreamConn::new(StreamState::RespondMethods, now);

    let config = client_config();

    // --- Stage one: the stream handshake. -------------------------------

    // USRAUTH_NONE: method discovery.
    let hello = {
        let mut state = client_session.state.lock().unwrap();
        stream_client::initial_message(&config, &mut state)
    };

    let reply = {
        let mut state = server_session.state.lock().unwrap();
        let step = stream_server::handle_message(
            &mut server_stream,
            &mut state,
            &over_the_wire(&hello),
            &host,
            &server_session,
            now,
        )
        .unwrap();
        assert_eq!(step.replies.len(), 1);
        step.replies.into_iter().next().unwrap()
    };
    assert_eq!(server_stream.state, StreamState::RespondUsrauth);

    // USRAUTH_DATA: password round.
    let password_msg = {
        let mut state = client_session.state.lock().unwrap();
        let step = stream_client::handle_message(
            &mut client_stream,
            &mut state,
            &over_the_wire(&reply),
            &config,
            now,
        );
        step.replies.into_iter().next().expect("Password message expected")
    };
    assert_eq!(client_stream.state, StreamState::UsrauthData);

    let success = {
        let mut state = server_session.state.lock().unwrap();
        let step = stream_server::handle_message(
            &mut server_stream,
            &mut state,
            &over_the_wire(&password_msg),
            &host,
            &server_session,
            now,
        )
        .unwrap();
        step.replies.into_iter().next().unwrap()
    };
    assert_eq!(server_stream.state, StreamState::NegotiateCookieDed);

    // NEGOTIATE_COOKIE_DED: cookies cross, the URL is proposed.
    let proposal = {
        let mut state = client_session.state.lock().unwrap();
        let step = stream_client::handle_message(
            &mut client_stream,
            &mut state,
            &over_the_wire(&success),
            &config,
            now,
        );
        step.replies.into_iter().next().expect("Cookie/DED proposal expected")
    };
    assert_eq!(client_stream.state, StreamState::NegotiateCookieDed);

    let committed = {
        let mut state = server_session.state.lock().unwrap();
        let step = stream_server::handle_message(
            &mut server_stream,
            &mut state,
            &over_the_wire(&proposal),
            &host,
            &server_session,
            now,
        )
        .unwrap();
        step.replies.into_iter().next().unwrap()
    };
    assert_eq!(server_stream.state, StreamState::NegotiateNewhost);

    // NEGOTIATE_NEWHOST: the concrete URL is accepted.
    let (acceptance, data_plane) = {
        let mut state = client_session.state.lock().unwrap();
        let step = stream_client::handle_message(
            &mut client_stream,
            &mut state,
            &over_the_wire(&committed),
            &config,
            now,
        );
        (
            step.replies.into_iter().next().expect("URL acceptance expected"),
            step.data_plane.expect("Concrete URL expected"),
        )
    };

    assert_eq!(data_plane.to_string(), "verse-udp-dtls://server.example:20001");

    let step = {
        let mut state = server_session.state.lock().unwrap();
        stream_server::handle_message(
            &mut server_stream,
            &mut state,
            &over_the_wire(&acceptance),
            &host,
            &server_session,
            now,
        )
        .unwrap()
    };
    assert!(step.stream_open);
    assert!(step.close, "UDP transport releases the stream");

    // Both sides hold matching secrets now.
    {
        let client_state = client_session.state.lock().unwrap();
        let server_state = server_session.state.lock().unwrap();

        assert_eq!(client_state.host_cookie, server_state.peer_cookie);
        assert_eq!(client_state.peer_cookie, server_state.host_cookie);
        assert_eq!(client_state.ded, server_state.ded);
        assert_eq!(server_state.transport, TransportFlag::Udp);
        assert_eq!(client_state.user_id, 1001);
    }

    // --- Stage two: the datagram handshake. -----------------------------

    let mut client_conn = DgramConn::new(Role::Client, DEFAULT_MTU, now);
    client_conn.set_state(DgramState::Request, now);
    let mut server_conn = DgramConn::new(Role::Server, DEFAULT_MTU, now);
    server_conn.rwin_host_scale = 2;

    let mut client_pay_ids: Vec<u32> = Vec::new();
    let mut server_pay_ids: Vec<u32> = Vec::new();

    // REQUEST -> LISTEN.
    let syn = {
        let state = client_session.state.lock().unwrap();
        dgram_client::request_packet(&mut client_conn, &state).unwrap()
    };
    let syn_packet = parse_packet(&syn.bytes);
    client_pay_ids.push(syn_packet.header.payload_id);

    {
        let mut state = server_session.state.lock().unwrap();
        assert!(dgram_server::handle_syn(&mut server_conn, &mut state, &syn_packet, now));
    }
    assert_eq!(server_conn.state, DgramState::Respond);

    // RESPOND -> PARTOPEN.
    let respond = {
        let state = server_session.state.lock().unwrap();
        dgram_server::respond_packet(&mut server_conn, &state).unwrap()
    };
    let respond_packet = parse_packet(&respond.bytes);
    server_pay_ids.push(respond_packet.header.payload_id);

    {
        let mut state = client_session.state.lock().unwrap();
        assert!(dgram_client::handle_request_reply(
            &mut client_conn,
            &mut state,
            &respond_packet,
            now
        ));
    }
    assert_eq!(client_conn.state, DgramState::PartOpen);

    // The advertised window recovers through the negotiated scale.
    assert_eq!(client_conn.rwin_peer_scale, 2);
    assert_eq!(
        client_conn.rwin_peer,
        u32::from(respond_packet.header.window) << 2
    );

    // PARTOPEN -> OPEN on the server.
    let partopen = {
        let state = client_session.state.lock().unwrap();
        dgram_client::partopen_packet(&mut client_conn, &state).unwrap()
    };
    let partopen_packet = parse_packet(&partopen.bytes);
    client_pay_ids.push(partopen_packet.header.payload_id);

    {
        let mut state = server_session.state.lock().unwrap();
        assert!(dgram_server::handle_respond_reply(
            &mut server_conn,
            &mut state,
            &partopen_packet,
            now
        ));
    }
    assert_eq!(server_conn.state, DgramState::Open);

    // Server's first OPEN packet carries payload and completes the client
    // handshake.
    let first_open = {
        let mut state = server_session.state.lock().unwrap();
        state
            .out_queue
            .push_node(NodeCmd::new(40, vec![0, 0, 0, 1], vec![0xAB, 0xCD]));

        let out = server_conn.build_open_packet(now, &mut state).unwrap().unwrap();
        server_conn.commit_send(&out, now);
        out
    };
    let first_open_packet = parse_packet(&first_open.bytes);
    server_pay_ids.push(first_open_packet.header.payload_id);
    assert!(first_open_packet.header.has(PAY_FLAG));
    assert_eq!(first_open_packet.node_cmds.len(), 1);

    {
        let mut state = client_session.state.lock().unwrap();
        assert!(dgram_client::handle_partopen_reply(
            &mut client_conn,
            &mut state,
            &first_open_packet,
            now
        ));
    }
    assert_eq!(client_conn.state, DgramState::Open);

    // CONNECT_ACCEPT arrives exactly once, before any node command.
    let delivered = drain_in_queue(&client_session);
    assert!(matches!(
        delivered[0],
        InCmd::Fake(FakeCmd::ConnectAccept { user_id: 1001, avatar_id: 7 })
    ));
    assert!(matches!(&delivered[1], InCmd::Node(cmd) if cmd.id == 40));
    assert_eq!(
        delivered
            .iter()
            .filter(|cmd| matches!(cmd, InCmd::Fake(FakeCmd::ConnectAccept { .. })))
            .count(),
        1
    );

    // Client acks the payload on its next packet.
    let client_ack = {
        let mut state = client_session.state.lock().unwrap();
        state.out_queue.push_node(NodeCmd::new(41, vec![9], vec![1]));

        let out = client_conn.build_open_packet(now, &mut state).unwrap().unwrap();
        client_conn.commit_send(&out, now);
        out
    };
    let client_ack_packet = parse_packet(&client_ack.bytes);
    client_pay_ids.push(client_ack_packet.header.payload_id);
    assert!(client_ack_packet
        .sys_cmds
        .iter()
        .any(|cmd| matches!(cmd, SysCmd::Ack { pay_id } if *pay_id == first_open_packet.header.payload_id)));

    {
        let mut state = server_session.state.lock().unwrap();
        server_conn.handle_open_packet(&client_ack_packet, now, &mut state);
    }
    assert_eq!(server_conn.packet_history.len(), 0, "Payload acknowledged");

    // --- Teardown: CLOSING -> CLOSED. -----------------------------------

    {
        let mut state = client_session.state.lock().unwrap();
        state.out_queue.push_fake(FakeCmd::ConnectTerminate {
            reason: TerminateReason::Reserved,
        });
        let _ = client_conn.build_open_packet(now, &mut state).unwrap();
    }
    assert_eq!(client_conn.state, DgramState::Closing);

    let fin = dgram_client::closing_packet(&mut client_conn).unwrap();
    let fin_packet = parse_packet(&fin.bytes);
    client_pay_ids.push(fin_packet.header.payload_id);

    {
        let mut state = server_session.state.lock().unwrap();
        let saw_fin = server_conn.handle_open_packet(&fin_packet, now, &mut state);
        assert!(saw_fin);
    }

    let fin_reply = dgram_server::fin_reply_packet(&mut server_conn, now).unwrap();
    assert_eq!(server_conn.state, DgramState::Closed);

    let fin_reply_packet = parse_packet(&fin_reply.bytes);
    assert!(dgram_client::handle_closing_reply(&mut client_conn, &fin_reply_packet, now));
    assert_eq!(client_conn.state, DgramState::Closed);

    // Payload ids are monotonic per direction.
    for ids in [&client_pay_ids, &server_pay_ids] {
        for window in ids.windows(2) {
            assert!(window[1] > window[0], "Ids not monotonic: {:?}", ids);
        }
    }
}

#[test]
fn test_retransmit_on_nak_obsolescence_wins() {
    let now = Instant::now();
    let session = shared_session(3);
    let mut conn = DgramConn::new(Role::Client, DEFAULT_MTU, now);
    conn.set_state(DgramState::Open, now);

    // Packet 1 carries A1 (address X) and B (address Y).
    let packet1_id;
    {
        let mut state = session.state.lock().unwrap();
        state.out_queue.push_node(NodeCmd::new(40, vec![0xEE], vec![1]));
        state.out_queue.push_node(NodeCmd::new(40, vec![0xFF], vec![2]));

        let out = conn.build_open_packet(now, &mut state).unwrap().unwrap();
        packet1_id = out.pay_id.unwrap();
        conn.commit_send(&out, now);
    }

    // Packet 2 carries A2, overwriting address X.
    {
        let mut state = session.state.lock().unwrap();
        state.out_queue.push_node(NodeCmd::new(40, vec![0xEE], vec![3]));

        let out = conn.build_open_packet(now, &mut state).unwrap().unwrap();
        conn.commit_send(&out, now);
    }

    // The peer NAKs packet 1 and acks packet 2 implicitly via the run end.
    {
        let mut state = session.state.lock().unwrap();
        conn.handle_ack_nak_run(
            &[
                SysCmd::Nak { pay_id: packet1_id },
                SysCmd::Ack { pay_id: packet1_id.wrapping_add(1) },
            ],
            now,
            &mut state,
        );

        // Only B returns to the queue; A1 is obsolete.
        let popped = state.out_queue.pop(128, 4096, true).unwrap();
        match popped {
            Popped::Group { cmds, .. } => {
                assert_eq!(cmds.len(), 1);
                assert_eq!(cmds[0].addr, vec![0xFF]);
                assert_eq!(cmds[0].data, vec![2]);
            }
            other => panic!("Unexpected pop {:?}", other),
        }
        assert_eq!(state.out_queue.count(), 0);
    }
}
