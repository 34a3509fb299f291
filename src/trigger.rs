//! The periodic trigger fires some maintenance roughly every `period`
//! events (e.g., sweeping abandoned temporary files every ~100
//! writes).  Each countdown is drawn from a uniform over `[1,
//! 2 * period]`, so a program that always restarts after the same
//! number of writes still gets its maintenance eventually.
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;

use rand::Rng;

#[derive(Debug)]
pub(crate) struct PeriodicTrigger {
    period: u64,
    // Events left before the next trigger; never zero once set.
    countdown: AtomicU64,
}

fn draw(period: u64) -> u64 {
    rand::thread_rng().gen_range(1..=period.saturating_mul(2))
}

impl PeriodicTrigger {
    /// Returns a `PeriodicTrigger` that fires roughly every `period`
    /// events.  A zero period means every event.
    pub fn new(period: u64) -> PeriodicTrigger {
        let period = period.max(1);

        PeriodicTrigger {
            period,
            countdown: AtomicU64::new(draw(period)),
        }
    }

    /// Observes one event.  Returns true when maintenance is due.
    pub fn event(&self) -> bool {
        let decremented = self
            .countdown
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |current| {
                if current > 1 {
                    Some(current - 1)
                } else {
                    None
                }
            });

        match decremented {
            Ok(_) => false,
            Err(_) => {
                // Racing threads may both reset; one extra sweep is harmless.
                self.countdown.store(draw(self.period), Ordering::Relaxed);
                true
            }
        }
    }
}

/// A period of 1 fires on every event.
#[test]
fn test_always() {
    let trigger = PeriodicTrigger::new(1);

    // The first countdown is in [1, 2], so two events always fire once.
    let fired = (0..2).filter(|_| trigger.event()).count();
    assert!(fired >= 1);

    let zero = PeriodicTrigger::new(0);
    assert!((0..2).any(|_| zero.event()));
}

/// Over many events, the trigger should fire about 1 / period of the
/// time; check loose bounds.
#[test]
fn test_rate() {
    let trigger = PeriodicTrigger::new(10);
    let fired = (0..100_000).filter(|_| trigger.event()).count();

    assert!(fired > 5_000, "fired = {}", fired);
    assert!(fired < 20_000, "fired = {}", fired);
}

/// The trigger never goes 2 * period events without firing.
#[test]
fn test_bounded_gap() {
    let trigger = PeriodicTrigger::new(5);
    let mut gap = 0;

    for _ in 0..10_000 {
        if trigger.event() {
            gap = 0;
        } else {
            gap += 1;
            assert!(gap < 10);
        }
    }
}
