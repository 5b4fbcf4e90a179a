//! Server side of the stream handshake: authentication, cookie/DED
//! negotiation and the commitment to a concrete data-plane URL.

use crate::cmd::sys::{Negotiate, SysCmd, UA_METHOD_NONE, UA_METHOD_PASSWORD};
use crate::error::{ErrorType, NetworkError, NetworkResult};
use crate::negotiate::{FTR_CLIENT_NAME, FTR_CLIENT_VERSION, FTR_DED, FTR_HOST_URL, FTR_TOKEN};
use crate::session::{SecurityFlag, Session, SharedSession, TransportFlag};
use crate::stream::conn::{StreamConn, StreamState};
use crate::url::{Security, Transport, VerseUrl};
use crate::wire::message::Message;
use crate::{AvatarId, UserId};
use std::time::Instant;
use tempo::token;

/// How many failed password attempts close the stream.
pub const MAX_USER_AUTH_ATTEMPTS: u32 = 3;

/// Everything the stream handshake needs from the surrounding service:
/// the user database, the announced identity and data-plane provisioning.
pub trait StreamHost {
    /// Authentication methods offered to clients.
    fn auth_methods(&self) -> Vec<u8> {
        vec![UA_METHOD_PASSWORD]
    }

    /// Password check against the user database.
    fn check_auth(&self, username: &str, password: &str) -> Option<(UserId, AvatarId)>;

    /// The data exchange definition announced to every client.
    fn ded(&self) -> String;

    /// Hostname clients should dial for the data plane.
    fn hostname(&self) -> String;

    /// Reserves the data plane for the session (for UDP: allocates a port
    /// and spawns the datagram worker before the reply leaves), returning
    /// the concrete URL. `session` is already locked as `state`; the
    /// handle is for the spawned worker, never for locking here.
    fn provision(
        &self,
        session: &SharedSession,
        state: &mut Session,
        requested: &VerseUrl,
    ) -> NetworkResult<VerseUrl>;
}

/// Outcome of one server handshake step.
#[derive(Default)]
pub struct ServerStep {
    pub replies: Vec<Message>,
    /// The stream should close after flushing the replies.
    pub close: bool,
    /// The handshake is complete and the stream is now the data plane.
    pub stream_open: bool,
}

/// Advances the server handshake with one received message. `session` is
/// the locked state of `shared`.
pub fn handle_message(
    conn: &mut StreamConn,
    session: &mut Session,
    message: &Message,
    host: &dyn StreamHost,
    shared: &SharedSession,
    now: Instant,
) -> NetworkResult<ServerStep> {
    match conn.state {
        StreamState::RespondMethods => respond_methods(conn, session, message, host, now),
        StreamState::RespondUsrauth => respond_usrauth(conn, session, message, host, now),
        StreamState::NegotiateCookieDed => {
            negotiate_cookie_ded(conn, session, message, host, shared, now)
        }
        StreamState::NegotiateNewhost => negotiate_newhost(conn, session, message, now),
        StreamState::StreamOpen => Ok(ServerStep::default()),
        _ => Err(NetworkError::Fatal(ErrorType::Teardown)),
    }
}

/// First contact: the client asks which authentication methods exist.
fn respond_methods(
    conn: &mut StreamConn,
    session: &mut Session,
    message: &Message,
    host: &dyn StreamHost,
    now: Instant,
) -> NetworkResult<ServerStep> {
    let mut step = ServerStep::default();
    let mut reply = Message::new();
    let mut asked = false;

    for cmd in &message.sys_cmds {
        match cmd {
            SysCmd::UserAuthRequest { username, method, .. } if *method == UA_METHOD_NONE => {
                session.username = Some(username.clone());
                asked = true;
            }
            SysCmd::ChangeL(n) if n.feature == FTR_CLIENT_NAME => {
                if let Some(name) = n.first_string8() {
                    session.client_name = Some(name.to_owned());
                    reply
                        .sys_cmds
                        .push(SysCmd::ConfirmL(Negotiate::string8(FTR_CLIENT_NAME, &[name])));
                }
            }
            SysCmd::ChangeL(n) if n.feature == FTR_CLIENT_VERSION => {
                if let Some(version) = n.first_string8() {
                    session.client_version = Some(version.to_owned());
                    reply
                        .sys_cmds
                        .push(SysCmd::ConfirmL(Negotiate::string8(FTR_CLIENT_VERSION, &[version])));
                }
            }
            _ => (),
        }
    }

    if !asked {
        conn.corrupted_messages += 1;
        step.close = true;
        return Ok(step);
    }

    reply.sys_cmds.insert(
        0,
        SysCmd::UserAuthFailure {
            methods: host.auth_methods(),
        },
    );

    conn.set_state(StreamState::RespondUsrauth, now);
    step.replies.push(reply);

    Ok(step)
}

/// The client submits credentials; success hands out identity, cookie and
/// DED, failure counts against MAX_USER_AUTH_ATTEMPTS.
fn respond_usrauth(
    conn: &mut StreamConn,
    session: &mut Session,
    message: &Message,
    host: &dyn StreamHost,
    now: Instant,
) -> NetworkResult<ServerStep> {
    let mut step = ServerStep::default();

    for cmd in &message.sys_cmds {
        if let SysCmd::UserAuthRequest { username, method, data } = cmd {
            if *method != UA_METHOD_PASSWORD {
                continue;
            }

            match host.check_auth(username, data) {
                Some((user_id, avatar_id)) => {
                    session.username = Some(username.clone());
                    session.user_id = user_id;
                    session.avatar_id = avatar_id;
                    session.host_cookie = Some(token::new_cookie());
                    session.ded = Some(host.ded());

                    let mut reply = Message::new();
                    reply.sys_cmds.push(SysCmd::UserAuthSuccess { user_id, avatar_id });
                    reply.sys_cmds.push(SysCmd::ChangeR(Negotiate::string8(
                        FTR_TOKEN,
                        &[session.host_cookie.as_deref().expect("Cookie just generated")],
                    )));
                    reply.sys_cmds.push(SysCmd::ChangeL(Negotiate::string8(
                        FTR_DED,
                        &[session.ded.as_deref().expect("DED just assigned")],
                    )));

                    conn.set_state(StreamState::NegotiateCookieDed, now);
                    step.replies.push(reply);
                    return Ok(step);
                }
                None => {
                    session.auth_attempts += 1;

                    let reply = Message::with_cmds(vec![SysCmd::UserAuthFailure { methods: vec![] }]);
                    step.replies.push(reply);

                    if session.auth_attempts >= MAX_USER_AUTH_ATTEMPTS {
                        step.close = true;
                        conn.set_state(StreamState::Closing, now);
                    }

                    return Ok(step);
                }
            }
        }
    }

    conn.corrupted_messages += 1;
    Ok(step)
}

/// The client proposes a data-plane URL and its own cookie, and confirms
/// the server cookie and the DED. A complete proposal provisions the data
/// plane and commits the concrete URL.
fn negotiate_cookie_ded(
    conn: &mut StreamConn,
    session: &mut Session,
    message: &Message,
    host: &dyn StreamHost,
    shared: &SharedSession,
    now: Instant,
) -> NetworkResult<ServerStep> {
    let mut step = ServerStep::default();

    let mut url_proposed: Option<VerseUrl> = None;
    let mut peer_cookie_proposed = false;
    let mut host_cookie_confirmed = false;
    let mut ded_confirmed = false;

    for cmd in &message.sys_cmds {
        match cmd {
            SysCmd::ChangeR(n) if n.feature == FTR_HOST_URL => {
                // Only the first proposed URL counts.
                if url_proposed.is_none() {
                    if let Some(text) = n.first_string8() {
                        url_proposed = VerseUrl::parse(text).ok();
                    }
                }
            }
            SysCmd::ChangeR(n) if n.feature == FTR_TOKEN => {
                if let Some(cookie) = n.first_string8() {
                    session.peer_cookie = Some(cookie.to_owned());
                    peer_cookie_proposed = true;
                }
            }
            SysCmd::ConfirmR(n) if n.feature == FTR_TOKEN => {
                if n.values.len() == 1 && n.first_string8() == session.host_cookie.as_deref() {
                    session.cookie_accepted = Some(now);
                    host_cookie_confirmed = true;
                }
            }
            SysCmd::ConfirmL(n) if n.feature == FTR_DED => {
                if n.values.len() == 1 && n.first_string8() == session.ded.as_deref() {
                    ded_confirmed = true;
                }
            }
            SysCmd::ChangeL(n) if n.feature == FTR_CLIENT_NAME => {
                if let Some(name) = n.first_string8() {
                    session.client_name = Some(name.to_owned());
                }
            }
            SysCmd::ChangeL(n) if n.feature == FTR_CLIENT_VERSION => {
                if let Some(version) = n.first_string8() {
                    session.client_version = Some(version.to_owned());
                }
            }
            _ => (),
        }
    }

    let requested = match url_proposed {
        Some(url) if peer_cookie_proposed && host_cookie_confirmed && ded_confirmed => url,
        _ => {
            conn.corrupted_messages += 1;
            return Ok(step);
        }
    };

    // Plain TCP is never served; everything else maps onto session flags.
    let flags = match (requested.transport, requested.security) {
        (Transport::Udp, Security::None) => (TransportFlag::Udp, SecurityFlag::None),
        (Transport::Udp, Security::Dtls) => (TransportFlag::Udp, SecurityFlag::Dtls),
        (Transport::Tcp, Security::Tls) => (TransportFlag::Tcp, SecurityFlag::Tls),
        (Transport::WebSocket, Security::Tls) => (TransportFlag::WebSocket, SecurityFlag::Tls),
        _ => {
            let reply = Message::with_cmds(vec![SysCmd::ConfirmR(Negotiate::string8(FTR_HOST_URL, &[]))]);
            step.replies.push(reply);
            step.close = true;
            conn.set_state(StreamState::Closing, now);
            return Ok(step);
        }
    };

    session.transport = flags.0;
    session.security = flags.1;

    // The datagram worker must be listening before the client learns the
    // concrete URL.
    let concrete = host.provision(shared, session, &requested)?;
    session.host_url = Some(concrete.clone());

    let mut reply = Message::new();
    // The proposed URL is not confirmed as-is; the concrete one follows.
    reply.sys_cmds.push(SysCmd::ConfirmR(Negotiate::string8(FTR_HOST_URL, &[])));
    reply
        .sys_cmds
        .push(SysCmd::ChangeL(Negotiate::string8(FTR_HOST_URL, &[&concrete.to_string()])));
    reply.sys_cmds.push(SysCmd::ConfirmR(Negotiate::string8(
        FTR_TOKEN,
        &[session.peer_cookie.as_deref().expect("Cookie proposed above")],
    )));

    if let Some(name) = &session.client_name {
        reply
            .sys_cmds
            .push(SysCmd::ConfirmL(Negotiate::string8(FTR_CLIENT_NAME, &[name])));
    }
    if let Some(version) = &session.client_version {
        reply
            .sys_cmds
            .push(SysCmd::ConfirmL(Negotiate::string8(FTR_CLIENT_VERSION, &[version])));
    }

    conn.set_state(StreamState::NegotiateNewhost, now);
    step.replies.push(reply);

    Ok(step)
}

/// The client accepts the concrete URL; TCP keeps the stream as the data
/// plane, UDP leaves it open only until the datagram channel is up.
fn negotiate_newhost(
    conn: &mut StreamConn,
    session: &mut Session,
    message: &Message,
    now: Instant,
) -> NetworkResult<ServerStep> {
    let mut step = ServerStep::default();

    let accepted = message.sys_cmds.iter().any(|cmd| match cmd {
        SysCmd::ConfirmL(n) if n.feature == FTR_HOST_URL => {
            n.values.len() == 1
                && n.first_string8() == session.host_url.as_ref().map(|url| url.to_string()).as_deref()
        }
        _ => false,
    });

    if !accepted {
        conn.corrupted_messages += 1;
        return Ok(step);
    }

    conn.set_state(StreamState::StreamOpen, now);
    step.stream_open = true;

    if session.transport != TransportFlag::Tcp && session.transport != TransportFlag::WebSocket {
        // The datagram worker takes over from here.
        step.close = true;
    }

    Ok(step)
}
