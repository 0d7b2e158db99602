//! Phase-granularity event queue.
//!
//! Events are keyed by phase number and fire at phase boundaries.
//! Periodic events return their period from `fire` and are reinserted;
//! one-shot events return `None` and are dropped. Events own whatever
//! state they need (an `Arc` to a cache, a stats writer); the queue never
//! hands out simulator context.
//!
//! `tick` pops events before firing them, so a callback can never reenter
//! the queue mid-update; new events land via `insert` between phases.

use std::collections::BTreeMap;

/// A scheduled phase event.
pub trait PhaseEvent: Send {
    /// Run the event at a phase boundary. Return `Some(period)` to fire
    /// again `period` phases later, `None` to be dropped.
    fn fire(&mut self, cur_phase: u64) -> Option<u64>;
}

/// Ordered multimap phase -> events.
#[derive(Default)]
pub struct EventQueue {
    events: BTreeMap<u64, Vec<Box<dyn PhaseEvent>>>,
}

impl EventQueue {
    pub fn new() -> Self {
        EventQueue::default()
    }

    /// Schedule `ev` to fire `delay` phases from `cur_phase`.
    pub fn insert(&mut self, ev: Box<dyn PhaseEvent>, cur_phase: u64, delay: u64) {
        self.events.entry(cur_phase + delay).or_default().push(ev);
    }

    /// Fire everything scheduled for `cur_phase`. An event left over from
    /// an earlier phase is a scheduling bug.
    pub fn tick(&mut self, cur_phase: u64) {
        while let Some((&phase, _)) = self.events.first_key_value() {
            if phase > cur_phase {
                break;
            }
            if phase != cur_phase {
                panic!("event should have fired on phase {phase}, now at {cur_phase}");
            }
            let batch = self.events.remove(&phase).unwrap();
            for mut ev in batch {
                if let Some(period) = ev.fire(cur_phase) {
                    assert!(period > 0, "periodic events need a nonzero period");
                    self.events.entry(cur_phase + period).or_default().push(ev);
                }
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

/// Fires a closure every `period` phases.
pub struct PeriodicEvent<F: FnMut(u64) + Send> {
    period: u64,
    f: F,
}

impl<F: FnMut(u64) + Send> PeriodicEvent<F> {
    pub fn new(period: u64, f: F) -> Self {
        assert!(period > 0);
        PeriodicEvent { period, f }
    }
}

impl<F: FnMut(u64) + Send> PhaseEvent for PeriodicEvent<F> {
    fn fire(&mut self, cur_phase: u64) -> Option<u64> {
        (self.f)(cur_phase);
        Some(self.period)
    }
}

/// Hits an exact target of a monotonically growing quantity (instruction
/// count, cycles) without per-phase polling: the re-arm period shrinks
/// exponentially as the target nears, bounded below by one phase, so even
/// a badly overestimated rate costs only a few extra firings.
pub struct AdaptiveEvent<G, F>
where
    G: FnMut() -> u64 + Send,
    F: FnMut() + Send,
{
    get: G,
    on_target: F,
    target: u64,
    max_rate: u64,
}

impl<G, F> AdaptiveEvent<G, F>
where
    G: FnMut() -> u64 + Send,
    F: FnMut() + Send,
{
    /// `max_rate` is the most the quantity can grow per phase.
    pub fn new(mut get: G, on_target: F, target: u64, max_rate: u64) -> (Self, u64) {
        assert!(max_rate > 0);
        let start = get();
        assert!(target >= start);
        let first_delay = ((target - start) / max_rate).max(1);
        (
            AdaptiveEvent {
                get,
                on_target,
                target,
                max_rate,
            },
            first_delay,
        )
    }
}

impl<G, F> PhaseEvent for AdaptiveEvent<G, F>
where
    G: FnMut() -> u64 + Send,
    F: FnMut() + Send,
{
    fn fire(&mut self, _cur_phase: u64) -> Option<u64> {
        let cur = (self.get)();
        if cur >= self.target {
            assert!(
                cur - self.target <= self.max_rate,
                "target overshot by more than one phase's growth; max_rate was wrong"
            );
            (self.on_target)();
            None
        } else {
            Some(((self.target - cur) / self.max_rate).max(1))
        }
    }
}
