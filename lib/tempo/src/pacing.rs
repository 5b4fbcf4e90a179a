use rand::Rng;
use std::time::Duration;

/// Frames per second assumed until negotiation changes it.
pub const DEFAULT_FPS: f32 = 60.0;

/// Upper bound on each handshake state and on payload silence in OPEN.
pub const STATE_TIMEOUT: Duration = Duration::from_secs(30);

/// Base of the retransmission backoff in handshake states.
pub const INIT_TIMEOUT: Duration = Duration::from_secs(1);

/// Cap of the random backoff component, seconds.
pub const MAX_BACK_OFF: u64 = 32;

/// A keep-alive payload packet is due once this much time passed since the
/// last payload send.
pub const RESEND_TIMEOUT: Duration = Duration::from_secs(1);

/// Poll cadence in OPEN when the negotiated fps would wait longer than this.
pub const OPEN_POLL: Duration = Duration::from_millis(10);

/// Single source of wait intervals so the scheduler, keep-alives and state
/// timeouts advance in lockstep.
#[derive(Debug, Copy, Clone)]
pub struct Pacing {
    fps: f32,
}

impl Pacing {
    #[inline]
    pub fn new(fps: f32) -> Pacing {
        let fps = if fps > 0.0 { fps } else { DEFAULT_FPS };
        Pacing { fps }
    }

    #[inline]
    pub fn fps(&self) -> f32 {
        self.fps
    }

    #[inline]
    pub fn set_fps(&mut self, fps: f32) {
        if fps > 0.0 {
            self.fps = fps;
        }
    }

    /// Duration of one frame at the negotiated fps.
    #[inline]
    pub fn frame(&self) -> Duration {
        Duration::from_micros((1_000_000.0 / self.fps) as u64)
    }

    /// Wait interval for a worker in OPEN: one frame, floored at the poll
    /// cadence so a very low fps cannot starve the ack pipeline.
    #[inline]
    pub fn open_wait(&self) -> Duration {
        let frame = self.frame();
        if frame < OPEN_POLL {
            OPEN_POLL
        } else {
            frame
        }
    }

    /// Backoff before retransmission attempt `attempt` in handshake states:
    /// INIT_TIMEOUT + random(0, min(2^attempt - 1, MAX_BACK_OFF)) seconds.
    pub fn backoff(&self, attempt: u16) -> Duration {
        let ceiling = match 2u64.checked_pow(u32::from(attempt)) {
            Some(pow) => (pow - 1).min(MAX_BACK_OFF),
            None => MAX_BACK_OFF,
        };

        let jitter = match ceiling {
            0 => 0,
            n => rand::thread_rng().gen_range(0..=n),
        };

        INIT_TIMEOUT + Duration::from_secs(jitter)
    }
}
