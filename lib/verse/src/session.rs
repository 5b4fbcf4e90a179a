//! The long-lived association between two peers: negotiated identity,
//! cookies, fps, and the pair of queues the embedding application talks to.

use crate::cmd::queue::{InQueue, OutQueue};
use crate::cmd::{FakeCmd, InCmd};
use crate::error::TerminateReason;
use crate::url::VerseUrl;
use crate::{AvatarId, SessionId, UserId};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};
use tempo::pacing::DEFAULT_FPS;

/// Data-plane transport of a session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TransportFlag {
    Udp,
    Tcp,
    WebSocket,
}

/// Security layer of a session.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SecurityFlag {
    None,
    Tls,
    Dtls,
}

/// Counted wakeup signal for the process-wide data thread. Producers post
/// once per delivered command batch; the consumer drains ready sessions.
pub struct DataSignal {
    count: Mutex<u64>,
    ready: Condvar,
}

impl DataSignal {
    pub fn new() -> DataSignal {
        DataSignal {
            count: Mutex::new(0),
            ready: Condvar::new(),
        }
    }

    pub fn post(&self) {
        let mut count = self.count.lock().expect("Data signal poisoned");
        *count += 1;
        self.ready.notify_one();
    }

    /// Waits until a post arrives or the timeout passes. Returns true when
    /// a post was consumed.
    pub fn wait(&self, timeout: Duration) -> bool {
        let mut count = self.count.lock().expect("Data signal poisoned");

        while *count == 0 {
            let (guard, result) = self
                .ready
                .wait_timeout(count, timeout)
                .expect("Data signal poisoned");
            count = guard;

            if result.timed_out() && *count == 0 {
                return false;
            }
        }

        *count -= 1;
        true
    }
}

/// Mutable per-session protocol state. Shared between the stream worker,
/// the datagram worker and the embedding application behind one mutex.
pub struct Session {
    pub id: SessionId,
    pub peer_hostname: String,

    pub username: Option<String>,
    pub user_id: UserId,
    pub avatar_id: AvatarId,
    pub auth_attempts: u32,

    /// Cookie generated by this endpoint.
    pub host_cookie: Option<String>,
    /// Cookie generated by the peer.
    pub peer_cookie: Option<String>,
    /// When the peer cookie was accepted; gates how long a pending
    /// datagram handshake stays valid.
    pub cookie_accepted: Option<Instant>,

    pub ded: Option<String>,
    pub host_url: Option<VerseUrl>,

    pub transport: TransportFlag,
    pub security: SecurityFlag,

    pub fps_host: f32,
    pub fps_peer: f32,

    pub client_name: Option<String>,
    pub client_version: Option<String>,

    pub out_queue: OutQueue,
    pub in_queue: InQueue,

    /// The datagram channel reached OPEN; a UDP session's stream may now
    /// close.
    pub dgram_open: bool,

    terminated: bool,
}

impl Session {
    pub fn new(id: SessionId, peer_hostname: &str) -> Session {
        Session {
            id,
            peer_hostname: peer_hostname.to_owned(),
            username: None,
            user_id: 0,
            avatar_id: 0,
            auth_attempts: 0,
            host_cookie: None,
            peer_cookie: None,
            cookie_accepted: None,
            ded: None,
            host_url: None,
            transport: TransportFlag::Udp,
            security: SecurityFlag::None,
            fps_host: DEFAULT_FPS,
            fps_peer: DEFAULT_FPS,
            client_name: None,
            client_version: None,
            out_queue: OutQueue::new(),
            in_queue: InQueue::new(),
            dgram_open: false,
            terminated: false,
        }
    }

    /// Resets negotiated state so the slot can serve a new connection.
    pub fn clear(&mut self) {
        let id = self.id;
        *self = Session::new(id, "");
    }

    /// Delivers the connection-accepted signal to the application.
    pub fn deliver_accept(&mut self) {
        self.dgram_open = true;
        self.in_queue.push(InCmd::Fake(FakeCmd::ConnectAccept {
            user_id: self.user_id,
            avatar_id: self.avatar_id,
        }));
    }

    /// Delivers CONNECT_TERMINATE exactly once, whatever path got here
    /// first.
    pub fn deliver_terminate(&mut self, reason: TerminateReason) {
        if !self.terminated {
            self.terminated = true;
            self.in_queue
                .push(InCmd::Fake(FakeCmd::ConnectTerminate { reason }));
        }
    }
}

/// A session shared across worker threads plus the process-wide data
/// signal.
pub struct SessionHandle {
    pub state: Mutex<Session>,
    pub data_signal: Arc<DataSignal>,
}

pub type SharedSession = Arc<SessionHandle>;

impl SessionHandle {
    pub fn shared(session: Session, data_signal: Arc<DataSignal>) -> SharedSession {
        Arc::new(SessionHandle {
            state: Mutex::new(session),
            data_signal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_terminate_delivered_once() {
        let mut session = Session::new(1, "localhost");

        session.deliver_terminate(TerminateReason::Timeout);
        session.deliver_terminate(TerminateReason::Error);

        assert!(session.in_queue.pop().is_some());
        assert!(session.in_queue.pop().is_none());
    }

    #[test]
    fn test_data_signal_wakes_consumer() {
        let signal = Arc::new(DataSignal::new());
        let poster = Arc::clone(&signal);

        let handle = thread::spawn(move || poster.post());

        assert!(signal.wait(Duration::from_secs(5)));
        handle.join().unwrap();
    }

    #[test]
    fn test_data_signal_times_out() {
        let signal = DataSignal::new();
        assert!(!signal.wait(Duration::from_millis(10)));
    }
}
