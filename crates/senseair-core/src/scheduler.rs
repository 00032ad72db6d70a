//! Deferred work for the cooperative main loop
//!
//! The state machines never block. Whenever they need to wait (the settle
//! delay between a command and its response, or the backoff before a retry)
//! they ask a [`Scheduler`] to wake them up later and return immediately. The
//! pending continuation itself lives in the machine's state; the scheduler only
//! carries a [`Wake`] tag naming which machine to resume.
//!
//! [`TimerQueue`] is a ready-made scheduler for host loops that own a
//! millisecond clock: the firmware main loop and the desktop simulator.

use log::error;

/// Names the state machine a deferred continuation resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wake {
    Setup,
    Measurement,
}

impl Wake {
    const ALL: [Wake; 2] = [Wake::Setup, Wake::Measurement];

    const fn slot(self) -> usize {
        match self {
            Wake::Setup => 0,
            Wake::Measurement => 1,
        }
    }
}

/// Something the main loop should hand to the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Event {
    /// The poll interval elapsed.
    Poll,
    /// A deferred continuation is due.
    Wake(Wake),
}

/// Single-shot deferred invocation on the caller's thread.
pub trait Scheduler {
    /// Resume `wake` once, no earlier than `delay_ms` from now.
    fn after(&mut self, delay_ms: u32, wake: Wake);
}

/// Fixed-slot timer queue driven by an external millisecond clock.
///
/// Each machine has at most one pending continuation, so one slot per [`Wake`]
/// is enough. The periodic poll tick is tracked alongside.
#[derive(Debug, Clone)]
pub struct TimerQueue {
    now_ms: u64,
    poll_interval_ms: u64,
    next_poll_ms: u64,
    pending: [Option<u64>; 2],
}

impl TimerQueue {
    /// Create a queue whose first poll tick is one interval after `now_ms`.
    pub fn new(now_ms: u64, poll_interval_ms: u64) -> Self {
        let poll_interval_ms = poll_interval_ms.max(1);
        Self {
            now_ms,
            poll_interval_ms,
            next_poll_ms: now_ms + poll_interval_ms,
            pending: [None; 2],
        }
    }

    /// Advance the clock. Time never runs backwards.
    pub fn set_now(&mut self, now_ms: u64) {
        self.now_ms = self.now_ms.max(now_ms);
    }

    pub fn now(&self) -> u64 {
        self.now_ms
    }

    /// Next due event, deferred continuations first in deadline order.
    pub fn pop_due(&mut self) -> Option<Event> {
        let due = Wake::ALL
            .iter()
            .filter_map(|wake| {
                self.pending[wake.slot()]
                    .filter(|deadline| *deadline <= self.now_ms)
                    .map(|deadline| (deadline, *wake))
            })
            .min_by_key(|(deadline, _)| *deadline);

        if let Some((_, wake)) = due {
            self.pending[wake.slot()] = None;
            return Some(Event::Wake(wake));
        }

        if self.next_poll_ms <= self.now_ms {
            self.next_poll_ms += self.poll_interval_ms;
            // Missed ticks are not replayed.
            if self.next_poll_ms <= self.now_ms {
                self.next_poll_ms = self.now_ms + self.poll_interval_ms;
            }
            return Some(Event::Poll);
        }

        None
    }

    /// Earliest pending continuation deadline, ignoring the poll tick.
    pub fn next_wake(&self) -> Option<u64> {
        self.pending.iter().flatten().copied().min()
    }

    /// Earliest instant at which [`pop_due`](Self::pop_due) returns something.
    pub fn next_deadline(&self) -> u64 {
        self.next_wake()
            .map_or(self.next_poll_ms, |wake| wake.min(self.next_poll_ms))
    }

    /// Whether `wake` has a continuation waiting.
    pub fn is_pending(&self, wake: Wake) -> bool {
        self.pending[wake.slot()].is_some()
    }

    /// No continuation is waiting on either machine.
    pub fn is_idle(&self) -> bool {
        self.pending.iter().all(Option::is_none)
    }
}

impl Scheduler for TimerQueue {
    fn after(&mut self, delay_ms: u32, wake: Wake) {
        let slot = &mut self.pending[wake.slot()];
        if slot.is_some() {
            error!("{:?} already has a pending continuation, replacing it", wake);
        }
        *slot = Some(self.now_ms + u64::from(delay_ms));
    }
}
