//! Session slots, the data-plane port pool and the acceptor loop that
//! hands fresh stream connections to per-session workers.

use crate::session::{DataSignal, Session, SessionHandle, SharedSession};
use crate::SessionId;
use indexmap::IndexSet;
use mio::net::{TcpListener, TcpStream};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempo::logging::{self, Logger};

/// Pre-reserved ephemeral ports for UDP data planes, [low, high).
pub struct PortPool {
    low: u16,
    used: Vec<bool>,
}

impl PortPool {
    pub fn new(low: u16, high: u16) -> PortPool {
        assert!(low < high, "Port range must be non-empty");

        PortPool {
            low,
            used: vec![false; usize::from(high - low)],
        }
    }

    /// Marks and returns the first free port.
    pub fn allocate(&mut self) -> Option<u16> {
        let index = self.used.iter().position(|used| !used)?;
        self.used[index] = true;
        Some(self.low + index as u16)
    }

    /// Returns a port to the pool. Freeing a port twice or freeing a port
    /// outside the range is a no-op.
    pub fn free(&mut self, port: u16) {
        if port >= self.low {
            if let Some(slot) = self.used.get_mut(usize::from(port - self.low)) {
                *slot = false;
            }
        }
    }

    pub fn available(&self) -> usize {
        self.used.iter().filter(|used| !**used).count()
    }
}

/// The fixed array of session slots. A slot is acquired by the acceptor
/// when a stream connection arrives and released when its workers finish.
/// Slot index + 1 is the session id.
pub struct SessionRegistry {
    slots: Vec<SharedSession>,
    live: IndexSet<usize>,
    data_signal: Arc<DataSignal>,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> SessionRegistry {
        let data_signal = Arc::new(DataSignal::new());

        let slots = (0..max_sessions)
            .map(|index| {
                SessionHandle::shared(
                    Session::new(index as SessionId + 1, ""),
                    Arc::clone(&data_signal),
                )
            })
            .collect();

        SessionRegistry {
            slots,
            live: IndexSet::new(),
            data_signal,
        }
    }

    #[inline]
    pub fn data_signal(&self) -> Arc<DataSignal> {
        Arc::clone(&self.data_signal)
    }

    /// Claims a free slot for a new connection.
    pub fn acquire(&mut self, peer_hostname: &str) -> Option<(SessionId, SharedSession)> {
        let index = (0..self.slots.len()).find(|index| !self.live.contains(index))?;
        self.live.insert(index);

        let slot = &self.slots[index];
        let id;
        {
            let mut session = slot.state.lock().expect("Session poisoned");
            id = session.id;
            session.clear();
            session.peer_hostname = peer_hostname.to_owned();
        }

        Some((id, Arc::clone(slot)))
    }

    /// Frees a slot once its workers are gone.
    pub fn release(&mut self, id: SessionId) {
        if id >= 1 {
            self.live.remove(&(id as usize - 1));
        }
    }

    /// All currently busy sessions, for the data thread and shutdown.
    pub fn active(&self) -> Vec<SharedSession> {
        self.live
            .iter()
            .map(|&index| Arc::clone(&self.slots[index]))
            .collect()
    }
}

const LISTENER_TOKEN: mio::Token = mio::Token(0);
const ACCEPT_WAIT: Duration = Duration::from_millis(250);

/// The acceptor loop: every inbound stream connection either lands in a
/// free session slot and is handed to `spawn`, or is accepted and
/// immediately dropped when the server is full. Runs until `shutdown` is
/// set.
pub fn acceptor_loop<F>(
    listener: TcpListener,
    registry: &std::sync::Mutex<SessionRegistry>,
    shutdown: &AtomicBool,
    log: &Logger,
    mut spawn: F,
) -> crate::error::NetworkResult<()>
where
    F: FnMut(SessionId, SharedSession, TcpStream, SocketAddr),
{
    let poll = mio::Poll::new()?;
    poll.register(&listener, LISTENER_TOKEN, mio::Ready::readable(), mio::PollOpt::edge())?;
    let mut events = mio::Events::with_capacity(16);

    logging::info!(log, "acceptor listening");

    while !shutdown.load(Ordering::SeqCst) {
        poll.poll(&mut events, Some(ACCEPT_WAIT))?;

        loop {
            let (stream, peer) = match listener.accept() {
                Ok(accepted) => accepted,
                Err(_) => break,
            };

            let claimed = registry
                .lock()
                .expect("Registry poisoned")
                .acquire(&peer.ip().to_string());

            match claimed {
                Some((id, session)) => {
                    logging::info!(log, "session accepted";
                                   "session_id" => id,
                                   "peer" => %peer);
                    spawn(id, session, stream, peer);
                }
                None => {
                    // Server full: accept and close immediately.
                    logging::warn!(log, "server full, dropping connection"; "peer" => %peer);
                    drop(stream);
                }
            }
        }
    }

    logging::info!(log, "acceptor shutting down");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_pool_roundtrip() {
        let mut pool = PortPool::new(20000, 20004);

        assert_eq!(pool.available(), 4);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        let c = pool.allocate().unwrap();
        let d = pool.allocate().unwrap();

        assert_eq!(vec![a, b, c, d], vec![20000, 20001, 20002, 20003]);
        assert_eq!(pool.allocate(), None);

        pool.free(b);
        pool.free(d);
        pool.free(a);
        pool.free(c);

        assert_eq!(pool.available(), 4);
    }

    #[test]
    fn test_no_port_handed_out_twice() {
        let mut pool = PortPool::new(30000, 30002);

        let a = pool.allocate().unwrap();
        let b = pool.allocate().unwrap();
        assert_ne!(a, b);

        pool.free(a);
        let again = pool.allocate().unwrap();
        assert_eq!(again, a);
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_double_free_is_noop() {
        let mut pool = PortPool::new(40000, 40002);
        let a = pool.allocate().unwrap();

        pool.free(a);
        pool.free(a);
        pool.free(50000);

        assert_eq!(pool.available(), 2);
        assert_eq!(pool.allocate().unwrap(), a);
        assert!(pool.allocate().is_some());
        assert_eq!(pool.allocate(), None);
    }

    #[test]
    fn test_registry_slots_bounded() {
        let mut registry = SessionRegistry::new(2);

        let first = registry.acquire("a").unwrap();
        let _second = registry.acquire("b").unwrap();
        assert!(registry.acquire("c").is_none());

        registry.release(first.0);
        assert!(registry.acquire("d").is_some());
    }

    #[test]
    fn test_acquire_resets_session() {
        let mut registry = SessionRegistry::new(1);

        let (id, session) = registry.acquire("first").unwrap();
        {
            let mut state = session.state.lock().unwrap();
            state.user_id = 99;
            state.host_cookie = Some("stale".to_owned());
        }
        registry.release(id);

        let (_, session) = registry.acquire("second").unwrap();
        let state = session.state.lock().unwrap();
        assert_eq!(state.user_id, 0);
        assert!(state.host_cookie.is_none());
        assert_eq!(state.peer_hostname, "second");
    }
}
