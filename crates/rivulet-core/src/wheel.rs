//! Hierarchical timer wheels.
//!
//! Scheduled activations are organised by deadline into three
//! progressively coarser wheels (250 ms, 1 s, 1 min by default). This
//! is **bucketed scheduling**, not exact scheduling: an entry scheduled
//! with delay `d` fires no earlier than `d` and no later than
//! `d + base_tick + level_tick` of the level it landed on.
//!
//! # Model
//!
//! Each level has a base granularity (`tick`) and an enumerated set of
//! recognised durations, all multiples of `tick`. Every duration owns a
//! ring of `duration / tick` slots; an entry is appended to the slot
//! the ring cursor last visited, so it fires after one full revolution,
//! approximately `duration` later. Coarser levels advance at their own
//! cadence relative to the base tick.
//!
//! # Invariants
//!
//! - Level *i*+1's tick is a multiple of level *i*'s.
//! - Entries within a slot fire in scheduling order.
//! - One-shot wake entries are always removed after firing; interval
//!   entries stay in place unless the visit callback removes them.

use std::time::Duration;

use smallvec::SmallVec;

/// What to do with an interval entry after its slot fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerDecision {
    /// Leave the entry in its slot; it fires again after the next
    /// revolution.
    Keep,
    /// Remove the entry from the wheel.
    Remove,
}

/// An entry waiting in a wheel slot.
#[derive(Debug, Clone, Copy)]
struct Entry<T> {
    payload: T,
    /// One-shot wake entry (removed after firing) rather than a
    /// repeating interval.
    wake: bool,
}

/// A ring of slots for one recognised duration.
#[derive(Debug)]
struct Ring<T> {
    duration: Duration,
    cursor: u64,
    slots: Vec<SmallVec<[Entry<T>; 4]>>,
}

/// One wheel level: a tick granularity plus its duration rings.
#[derive(Debug)]
struct Level<T> {
    tick: Duration,
    /// How many base ticks per tick of this level.
    cadence: u64,
    rings: Vec<Ring<T>>,
}

impl<T> Level<T> {
    fn max_duration(&self) -> Duration {
        self.rings.last().map_or(Duration::ZERO, |r| r.duration)
    }
}

/// Configuration for one wheel level.
#[derive(Debug, Clone)]
pub struct WheelLevelConfig {
    /// Base granularity of the level.
    pub tick: Duration,
    /// Recognised durations, ascending, each a multiple of `tick`.
    pub durations: Vec<Duration>,
}

/// The hierarchical timer wheel.
///
/// Single-threaded: lives inside one reactor and is only touched from
/// the reactor thread.
pub struct TimerWheel<T> {
    base_tick: Duration,
    levels: Vec<Level<T>>,
    len: usize,
}

impl<T: Copy> TimerWheel<T> {
    /// Builds a wheel from level configurations.
    ///
    /// # Panics
    ///
    /// Panics if `levels` is empty, a level has no durations, a
    /// duration is not a positive multiple of its level tick, or a
    /// level tick is not a multiple of the base tick.
    #[must_use]
    pub fn new(levels: &[WheelLevelConfig]) -> Self {
        assert!(!levels.is_empty(), "at least one wheel level required");
        let base_tick = levels[0].tick;
        assert!(base_tick > Duration::ZERO, "base tick must be positive");

        let levels = levels
            .iter()
            .map(|cfg| {
                assert!(!cfg.durations.is_empty(), "level needs durations");
                let tick_ns = cfg.tick.as_nanos();
                assert!(
                    tick_ns > 0 && tick_ns % base_tick.as_nanos() == 0,
                    "level tick must be a multiple of the base tick"
                );
                let cadence = (tick_ns / base_tick.as_nanos()) as u64;
                let rings = cfg
                    .durations
                    .iter()
                    .map(|&duration| {
                        let n = duration.as_nanos() / tick_ns;
                        assert!(
                            n > 0 && duration.as_nanos() % tick_ns == 0,
                            "duration must be a positive multiple of the level tick"
                        );
                        Ring {
                            duration,
                            cursor: 0,
                            slots: vec![SmallVec::new(); n as usize],
                        }
                    })
                    .collect();
                Level {
                    tick: cfg.tick,
                    cadence,
                    rings,
                }
            })
            .collect();

        Self {
            base_tick,
            levels,
            len: 0,
        }
    }

    /// The default three-level cadence: 250 ms / 1 s / 1 min, with
    /// sub-second durations on level 1, whole seconds on level 2 and
    /// whole minutes on level 3.
    #[must_use]
    pub fn with_default_levels() -> Self {
        Self::new(&Self::default_levels())
    }

    /// The default level configuration (see
    /// [`with_default_levels`](Self::with_default_levels)).
    #[must_use]
    pub fn default_levels() -> Vec<WheelLevelConfig> {
        Self::levels_for_tick(Duration::from_millis(250))
    }

    /// The default cadence scaled to an arbitrary base tick: level 2
    /// ticks at 4x the base with durations up to one level-3 tick,
    /// level 3 at 240x with sixty durations. With a 250 ms base this is
    /// exactly the 250 ms / 1 s / 1 min default.
    #[must_use]
    pub fn levels_for_tick(tick: Duration) -> Vec<WheelLevelConfig> {
        vec![
            WheelLevelConfig {
                tick,
                durations: vec![tick, tick * 2, tick * 3],
            },
            WheelLevelConfig {
                tick: tick * 4,
                durations: (1..=60).map(|k| tick * 4 * k).collect(),
            },
            WheelLevelConfig {
                tick: tick * 240,
                durations: (1..=60).map(|k| tick * 240 * k).collect(),
            },
        ]
    }

    /// Returns the base tick duration (level 1's granularity).
    #[must_use]
    pub fn base_tick(&self) -> Duration {
        self.base_tick
    }

    /// Returns the number of entries currently waiting.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if no entries are waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Schedules `payload` to fire roughly `delay` from now.
    ///
    /// Picks the first level whose maximum duration covers `delay`,
    /// then the first duration within it that covers `delay`; delays
    /// beyond the coarsest duration are clamped to it. Returns the
    /// effective duration of the chosen ring.
    pub fn schedule(&mut self, payload: T, delay: Duration, wake: bool) -> Duration {
        let level_idx = self
            .levels
            .iter()
            .position(|l| l.max_duration() >= delay)
            .unwrap_or(self.levels.len() - 1);
        let level = &mut self.levels[level_idx];
        let ring_idx = level
            .rings
            .iter()
            .position(|r| r.duration >= delay)
            .unwrap_or(level.rings.len() - 1);
        let ring = &mut level.rings[ring_idx];

        let len = ring.slots.len() as u64;
        // The slot the cursor last visited: one full revolution away.
        let slot = (ring.cursor % len) as usize;
        ring.slots[slot].push(Entry { payload, wake });
        self.len += 1;
        ring.duration
    }

    /// Advances the wheel by one base tick.
    ///
    /// `tick_no` is the absolute tick number from the shared ticker; a
    /// level advances when `tick_no` is a multiple of its cadence. For
    /// every due entry, `visit(payload, wake, ring_duration)` runs in
    /// scheduling order. Wake entries are removed regardless of the
    /// decision; interval entries honour it.
    pub fn advance<F>(&mut self, tick_no: u64, mut visit: F)
    where
        F: FnMut(T, bool, Duration) -> TimerDecision,
    {
        for level in &mut self.levels {
            if tick_no % level.cadence != 0 {
                continue;
            }
            for ring in &mut level.rings {
                let len = ring.slots.len() as u64;
                ring.cursor = ring.cursor.wrapping_add(1);
                let slot = &mut ring.slots[(ring.cursor % len) as usize];
                if slot.is_empty() {
                    continue;
                }
                let mut kept: SmallVec<[Entry<T>; 4]> = SmallVec::new();
                for entry in slot.drain(..) {
                    let decision = visit(entry.payload, entry.wake, ring.duration);
                    if !entry.wake && decision == TimerDecision::Keep {
                        kept.push(entry);
                    } else {
                        self.len -= 1;
                    }
                }
                *slot = kept;
            }
        }
    }
}

impl<T> std::fmt::Debug for TimerWheel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerWheel")
            .field("base_tick", &self.base_tick)
            .field("levels", &self.levels.len())
            .field("len", &self.len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_wheel() -> TimerWheel<u32> {
        // Base 10ms with 10/20/40ms durations, coarse level at 100ms.
        TimerWheel::new(&[
            WheelLevelConfig {
                tick: Duration::from_millis(10),
                durations: vec![
                    Duration::from_millis(10),
                    Duration::from_millis(20),
                    Duration::from_millis(40),
                ],
            },
            WheelLevelConfig {
                tick: Duration::from_millis(100),
                durations: vec![Duration::from_millis(100), Duration::from_millis(200)],
            },
        ])
    }

    /// Runs `ticks` base ticks and collects (tick_no, payload) firings.
    fn run(wheel: &mut TimerWheel<u32>, ticks: u64, keep: bool) -> Vec<(u64, u32)> {
        let mut fired = Vec::new();
        for t in 1..=ticks {
            wheel.advance(t, |p, _wake, _d| {
                fired.push((t, p));
                if keep {
                    TimerDecision::Keep
                } else {
                    TimerDecision::Remove
                }
            });
        }
        fired
    }

    #[test]
    fn one_shot_fires_within_bound() {
        let mut wheel = small_wheel();
        let eff = wheel.schedule(1, Duration::from_millis(20), true);
        assert_eq!(eff, Duration::from_millis(20));

        let fired = run(&mut wheel, 10, false);
        assert_eq!(fired.len(), 1);
        let (tick, payload) = fired[0];
        assert_eq!(payload, 1);
        // d = 2 ticks; bound is d..=d + base + level tick (2..=4 ticks).
        assert!((2..=4).contains(&tick), "fired at tick {tick}");
        assert!(wheel.is_empty());
    }

    #[test]
    fn interval_entry_repeats_when_kept() {
        let mut wheel = small_wheel();
        wheel.schedule(7, Duration::from_millis(20), false);

        let fired = run(&mut wheel, 8, true);
        // 20ms ring revolves every 2 base ticks; expect ~4 firings.
        assert!(fired.len() >= 3, "only fired {} times", fired.len());
        assert!(fired.iter().all(|&(_, p)| p == 7));
        assert_eq!(wheel.len(), 1);
    }

    #[test]
    fn remove_decision_unschedules_interval() {
        let mut wheel = small_wheel();
        wheel.schedule(3, Duration::from_millis(10), false);
        let fired = run(&mut wheel, 10, false);
        assert_eq!(fired.len(), 1);
        assert!(wheel.is_empty());
    }

    #[test]
    fn coarse_level_advances_on_cadence() {
        let mut wheel = small_wheel();
        wheel.schedule(9, Duration::from_millis(100), true);

        let fired = run(&mut wheel, 25, false);
        assert_eq!(fired.len(), 1);
        let (tick, _) = fired[0];
        // 100ms = 10 base ticks; level tick = 10 base ticks.
        assert!((10..=21).contains(&tick), "fired at tick {tick}");
    }

    #[test]
    fn over_horizon_delay_clamps_to_coarsest_ring() {
        let mut wheel = small_wheel();
        let eff = wheel.schedule(5, Duration::from_secs(10), true);
        assert_eq!(eff, Duration::from_millis(200));
    }

    #[test]
    fn slot_order_is_fifo() {
        let mut wheel = small_wheel();
        for p in 0..4 {
            wheel.schedule(p, Duration::from_millis(10), true);
        }
        let fired = run(&mut wheel, 4, false);
        let payloads: Vec<u32> = fired.iter().map(|&(_, p)| p).collect();
        assert_eq!(payloads, vec![0, 1, 2, 3]);
    }

    #[test]
    fn default_levels_are_well_formed() {
        let wheel: TimerWheel<u32> = TimerWheel::with_default_levels();
        assert_eq!(wheel.base_tick(), Duration::from_millis(250));
        assert!(wheel.is_empty());
    }
}
