//! Client side of the stream handshake: authenticate, negotiate cookies
//! and DED, accept the concrete data-plane URL.

use crate::cmd::sys::{Negotiate, SysCmd, UA_METHOD_NONE, UA_METHOD_PASSWORD};
use crate::error::TerminateReason;
use crate::negotiate::{FTR_CLIENT_NAME, FTR_CLIENT_VERSION, FTR_DED, FTR_HOST_URL, FTR_TOKEN};
use crate::session::{SecurityFlag, Session, TransportFlag};
use crate::stream::conn::{StreamConn, StreamState};
use crate::url::{Security, Transport, VerseUrl};
use crate::wire::message::Message;
use std::time::Instant;
use tempo::token;

/// What the embedding application provides before dialing a server.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub username: String,
    pub password: String,
    pub client_name: Option<String>,
    pub client_version: Option<String>,
    /// Desired transport and security; the port is usually `*`.
    pub requested_url: VerseUrl,
}

/// Outcome of one client handshake step.
#[derive(Default)]
pub struct ClientStep {
    pub replies: Vec<Message>,
    /// The server committed this URL; the datagram channel may start.
    pub data_plane: Option<VerseUrl>,
    /// The stream itself is now the data plane.
    pub stream_open: bool,
    pub failed: Option<TerminateReason>,
}

/// The opening message of the handshake: ask for authentication methods,
/// announce who is calling.
pub fn initial_message(config: &ClientConfig, session: &mut Session) -> Message {
    session.username = Some(config.username.clone());

    let mut message = Message::new();

    message.sys_cmds.push(SysCmd::UserAuthRequest {
        username: config.username.clone(),
        method: UA_METHOD_NONE,
        data: String::new(),
    });

    if let Some(name) = &config.client_name {
        message
            .sys_cmds
            .push(SysCmd::ChangeL(Negotiate::string8(FTR_CLIENT_NAME, &[name])));
    }
    if let Some(version) = &config.client_version {
        message
            .sys_cmds
            .push(SysCmd::ChangeL(Negotiate::string8(FTR_CLIENT_VERSION, &[version])));
    }

    message
}

/// Advances the client handshake with one received message.
pub fn handle_message(
    conn: &mut StreamConn,
    session: &mut Session,
    message: &Message,
    config: &ClientConfig,
    now: Instant,
) -> ClientStep {
    match conn.state {
        StreamState::UsrauthNone => usrauth_none(conn, session, message, config, now),
        StreamState::UsrauthData => usrauth_data(conn, session, message, config, now),
        StreamState::NegotiateCookieDed => negotiate_cookie_ded(conn, session, message, now),
        _ => ClientStep::default(),
    }
}

/// The server answered with its supported methods; submit the password.
fn usrauth_none(
    conn: &mut StreamConn,
    session: &mut Session,
    message: &Message,
    config: &ClientConfig,
    now: Instant,
) -> ClientStep {
    let mut step = ClientStep::default();

    for cmd in &message.sys_cmds {
        if let SysCmd::UserAuthFailure { methods } = cmd {
            if !methods.contains(&UA_METHOD_PASSWORD) {
                step.failed = Some(TerminateReason::AuthFailed);
                conn.set_state(StreamState::Closing, now);
                return step;
            }

            let reply = Message::with_cmds(vec![SysCmd::UserAuthRequest {
                username: config.username.clone(),
                method: UA_METHOD_PASSWORD,
                data: config.password.clone(),
            }]);

            conn.set_state(StreamState::UsrauthData, now);
            step.replies.push(reply);
            return step;
        }
    }

    let _ = session;
    conn.corrupted_messages += 1;
    step
}

/// Authentication verdict: success carries identity plus the server cookie
/// and DED; the client answers with its URL request and a fresh cookie.
fn usrauth_data(
    conn: &mut StreamConn,
    session: &mut Session,
    message: &Message,
    config: &ClientConfig,
    now: Instant,
) -> ClientStep {
    let mut step = ClientStep::default();
    let mut succeeded = false;

    for cmd in &message.sys_cmds {
        match cmd {
            SysCmd::UserAuthSuccess { user_id, avatar_id } => {
                session.user_id = *user_id;
                session.avatar_id = *avatar_id;
                succeeded = true;
            }
            SysCmd::UserAuthFailure { .. } => {
                step.failed = Some(TerminateReason::AuthFailed);
                conn.set_state(StreamState::Closing, now);
                return step;
            }
            SysCmd::ChangeR(n) if n.feature == FTR_TOKEN => {
                if session.peer_cookie.is_none() {
                    if let Some(cookie) = n.first_string8() {
                        session.peer_cookie = Some(cookie.to_owned());
                    }
                }
            }
            SysCmd::ChangeL(n) if n.feature == FTR_DED => {
                if session.ded.is_none() {
                    if let Some(ded) = n.first_string8() {
                        session.ded = Some(ded.to_owned());
                    }
                }
            }
            _ => (),
        }
    }

    if !(succeeded && session.peer_cookie.is_some() && session.ded.is_some()) {
        conn.corrupted_messages += 1;
        return step;
    }

    session.host_cookie = Some(token::new_cookie());
    session.cookie_accepted = Some(now);

    let reply = Message::with_cmds(vec![
        SysCmd::ChangeR(Negotiate::string8(FTR_HOST_URL, &[&config.requested_url.to_string()])),
        SysCmd::ChangeR(Negotiate::string8(
            FTR_TOKEN,
            &[session.host_cookie.as_deref().expect("Cookie just generated")],
        )),
        SysCmd::ConfirmR(Negotiate::string8(
            FTR_TOKEN,
            &[session.peer_cookie.as_deref().expect("Cookie received above")],
        )),
        SysCmd::ConfirmL(Negotiate::string8(
            FTR_DED,
            &[session.ded.as_deref().expect("DED received above")],
        )),
    ]);

    conn.set_state(StreamState::NegotiateCookieDed, now);
    step.replies.push(reply);
    step
}

/// The server commits the concrete URL; accept it and hand control to the
/// data plane.
fn negotiate_cookie_ded(
    conn: &mut StreamConn,
    session: &mut Session,
    message: &Message,
    now: Instant,
) -> ClientStep {
    let mut step = ClientStep::default();

    let mut concrete: Option<VerseUrl> = None;
    let mut cookie_confirmed = false;

    for cmd in &message.sys_cmds {
        match cmd {
            SysCmd::ChangeL(n) if n.feature == FTR_HOST_URL => {
                if concrete.is_none() {
                    if let Some(text) = n.first_string8() {
                        concrete = VerseUrl::parse(text).ok();
                    }
                }
            }
            SysCmd::ConfirmR(n) if n.feature == FTR_TOKEN => {
                if n.values.len() == 1 && n.first_string8() == session.host_cookie.as_deref() {
                    cookie_confirmed = true;
                }
            }
            _ => (),
        }
    }

    let url = match concrete {
        Some(url) if cookie_confirmed => url,
        _ => {
            conn.corrupted_messages += 1;
            return step;
        }
    };

    session.host_url = Some(url.clone());
    session.transport = match url.transport {
        Transport::Udp => TransportFlag::Udp,
        Transport::Tcp => TransportFlag::Tcp,
        Transport::WebSocket => TransportFlag::WebSocket,
    };
    session.security = match url.security {
        Security::None => SecurityFlag::None,
        Security::Dtls => SecurityFlag::Dtls,
        Security::Tls => SecurityFlag::Tls,
    };

    let reply = Message::with_cmds(vec![SysCmd::ConfirmL(Negotiate::string8(
        FTR_HOST_URL,
        &[&url.to_string()],
    ))]);
    step.replies.push(reply);

    if url.transport == Transport::Tcp || url.transport == Transport::WebSocket {
        conn.set_state(StreamState::StreamOpen, now);
        step.stream_open = true;
    } else {
        conn.set_state(StreamState::NegotiateNewhost, now);
    }

    step.data_plane = Some(url);
    step
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::url::{Security, Transport, UrlPort};

    fn config() -> ClientConfig {
        ClientConfig {
            username: "singer".to_owned(),
            password: "verse4ever".to_owned(),
            client_name: Some("probe".to_owned()),
            client_version: Some("0.1".to_owned()),
            requested_url: VerseUrl::new(Transport::Udp, Security::Dtls, "server.example", UrlPort::Any),
        }
    }

    fn setup() -> (StreamConn, Session) {
        let conn = StreamConn::new(StreamState::UsrauthNone, Instant::now());
        let session = Session::new(5, "server.example");
        (conn, session)
    }

    #[test]
    fn test_initial_message_asks_for_methods() {
        let (_, mut session) = setup();
        let message = initial_message(&config(), &mut session);

        assert!(matches!(
            &message.sys_cmds[0],
            SysCmd::UserAuthRequest { method, .. } if *method == UA_METHOD_NONE
        ));
        assert_eq!(session.username.as_deref(), Some("singer"));
    }

    #[test]
    fn test_methods_reply_triggers_password() {
        let (mut conn, mut session) = setup();

        let reply = Message::with_cmds(vec![SysCmd::UserAuthFailure {
            methods: vec![UA_METHOD_PASSWORD],
        }]);

        let step = handle_message(&mut conn, &mut session, &reply, &config(), Instant::now());

        assert_eq!(conn.state, StreamState::UsrauthData);
        assert!(matches!(
            &step.replies[0].sys_cmds[0],
            SysCmd::UserAuthRequest { method, data, .. }
                if *method == UA_METHOD_PASSWORD && data == "verse4ever"
        ));
    }

    #[test]
    fn test_success_sends_cookie_ded_proposal() {
        let (mut conn, mut session) = setup();
        conn.set_state(StreamState::UsrauthData, Instant::now());

        let reply = Message::with_cmds(vec![
            SysCmd::UserAuthSuccess { user_id: 1001, avatar_id: 42 },
            SysCmd::ChangeR(Negotiate::string8(FTR_TOKEN, &["server-cookie-16"])),
            SysCmd::ChangeL(Negotiate::string8(FTR_DED, &["ded-v1"])),
        ]);

        let step = handle_message(&mut conn, &mut session, &reply, &config(), Instant::now());

        assert_eq!(conn.state, StreamState::NegotiateCookieDed);
        assert_eq!(session.user_id, 1001);
        assert_eq!(session.peer_cookie.as_deref(), Some("server-cookie-16"));
        assert!(session.host_cookie.is_some());

        let cmds = &step.replies[0].sys_cmds;
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            SysCmd::ChangeR(n) if n.feature == FTR_HOST_URL
        )));
        assert!(cmds.iter().any(|cmd| matches!(
            cmd,
            SysCmd::ConfirmR(n) if n.feature == FTR_TOKEN
                && n.first_string8() == Some("server-cookie-16")
        )));
    }

    #[test]
    fn test_auth_failure_terminates() {
        let (mut conn, mut session) = setup();
        conn.set_state(StreamState::UsrauthData, Instant::now());

        let reply = Message::with_cmds(vec![SysCmd::UserAuthFailure { methods: vec![] }]);
        let step = handle_message(&mut conn, &mut session, &reply, &config(), Instant::now());

        assert_eq!(step.failed, Some(TerminateReason::AuthFailed));
        assert_eq!(conn.state, StreamState::Closing);
    }

    #[test]
    fn test_concrete_url_accepted() {
        let (mut conn, mut session) = setup();
        conn.set_state(StreamState::NegotiateCookieDed, Instant::now());
        session.host_cookie = Some("client-cookie-16".to_owned());

        let reply = Message::with_cmds(vec![
            SysCmd::ConfirmR(Negotiate::string8(FTR_HOST_URL, &[])),
            SysCmd::ChangeL(Negotiate::string8(FTR_HOST_URL, &["verse-udp-dtls://server.example:20001"])),
            SysCmd::ConfirmR(Negotiate::string8(FTR_TOKEN, &["client-cookie-16"])),
        ]);

        let step = handle_message(&mut conn, &mut session, &reply, &config(), Instant::now());

        let url = step.data_plane.unwrap();
        assert_eq!(url.to_string(), "verse-udp-dtls://server.example:20001");
        assert_eq!(conn.state, StreamState::NegotiateNewhost);
        assert!(matches!(
            &step.replies[0].sys_cmds[0],
            SysCmd::ConfirmL(n) if n.feature == FTR_HOST_URL
        ));
    }

    #[test]
    fn test_unconfirmed_cookie_makes_no_progress() {
        let (mut conn, mut session) = setup();
        conn.set_state(StreamState::NegotiateCookieDed, Instant::now());
        session.host_cookie = Some("client-cookie-16".to_owned());

        let reply = Message::with_cmds(vec![
            SysCmd::ChangeL(Negotiate::string8(FTR_HOST_URL, &["verse-udp-dtls://server.example:20001"])),
            SysCmd::ConfirmR(Negotiate::string8(FTR_TOKEN, &["badbadbadbadbad!"])),
        ]);

        let step = handle_message(&mut conn, &mut session, &reply, &config(), Instant::now());

        assert!(step.data_plane.is_none());
        assert_eq!(conn.state, StreamState::NegotiateCookieDed);
    }
}
