//! Periodic status fan-out.

use tracing::trace;

use crate::dispatch::render_status;
use crate::peripheral::{Board, PeripheralDriver};
use crate::session::{SessionTable, Transport};

/// Fixed-period timer driven by an externally supplied clock.
#[derive(Debug, Clone, Copy)]
pub struct Every {
    period_ms: u64,
    last_ms: u64,
}

impl Every {
    /// The first deadline is one full period after `start_ms`.
    pub fn new(period_ms: u64, start_ms: u64) -> Self {
        Self {
            period_ms,
            last_ms: start_ms,
        }
    }

    pub fn period_ms(&self) -> u64 {
        self.period_ms
    }

    /// Returns true (and re-arms) once at least a full period has elapsed.
    pub fn due(&mut self, now_ms: u64) -> bool {
        if now_ms.saturating_sub(self.last_ms) >= self.period_ms {
            self.last_ms = now_ms;
            true
        } else {
            false
        }
    }
}

/// Sends one status snapshot to every authenticated session.
#[derive(Debug, Clone, Copy)]
pub struct Broadcaster {
    timer: Every,
}

impl Broadcaster {
    pub fn new(interval_ms: u64, start_ms: u64) -> Self {
        Self {
            timer: Every::new(interval_ms, start_ms),
        }
    }

    /// Broadcast if the interval has elapsed. Returns the number of sessions
    /// the snapshot was queued for.
    pub fn tick<T, D>(
        &mut self,
        table: &mut SessionTable<T>,
        board: &mut Board<D>,
        now_ms: u64,
    ) -> Option<usize>
    where
        T: Transport,
        D: PeripheralDriver,
    {
        self.timer
            .due(now_ms)
            .then(|| broadcast_status(table, board, now_ms))
    }
}

/// Serialize one snapshot and queue it for every authenticated session.
///
/// Write failures are ignored here; a dead session is removed by the next
/// reaper pass.
pub fn broadcast_status<T, D>(
    table: &mut SessionTable<T>,
    board: &mut Board<D>,
    now_ms: u64,
) -> usize
where
    T: Transport,
    D: PeripheralDriver,
{
    if !table.iter().any(|s| s.is_authenticated()) {
        return 0;
    }

    let line = render_status(&board.snapshot(now_ms));
    let mut delivered = 0;
    table.for_each_authenticated(|session| match session.send_line(&line) {
        Ok(()) => delivered += 1,
        Err(e) => trace!("Status to {} not sent: {}", session.display_id(), e),
    });
    delivered
}
