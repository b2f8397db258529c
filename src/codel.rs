//! An implementation of the Controlled Delay algorithm.
//!
//! Refer to https://queue.acm.org/appendices/codel.html for
//! additional context.
//!
//! This variant watches the head-of-line delay of the checkout wait
//! queue. It tracks the *minimum* delay observed over a measurement
//! interval; a queue is only declared overloaded when even its best
//! observation misses the target, at which point the broker is allowed to
//! shed waiters older than twice the target.

use tokio::time::{Duration, Instant};

/// Controlled Delay (or "CoDel") state for a wait queue.
///
/// This algorithm works with the following parameters:
/// - Target: the maximum acceptable time an entry should sit at the head
///   of the queue.
/// - Interval: a window of time over which the delay is sampled.
///
/// While observing a queue for an interval:
/// - If any entry leaves the queue faster than the target, the queue is
///   working as expected.
/// - If no entry beats the target for a whole interval, the queue is
///   overloaded and the oldest entries should be dropped.
#[derive(Debug)]
pub(crate) struct ControlledDelay {
    target: Duration,
    interval: Duration,

    /// Minimum head-of-line delay observed in the current window.
    delay: Duration,

    /// True when drops are authorized.
    slow: bool,

    /// The next instant a new measurement window may begin.
    next_check: Instant,
}

impl ControlledDelay {
    pub(crate) fn new(target: Duration, interval: Duration, now: Instant) -> Self {
        Self {
            target,
            interval,
            delay: Duration::ZERO,
            slow: false,
            next_check: now + interval,
        }
    }

    pub(crate) fn next_check(&self) -> Instant {
        self.next_check
    }

    pub(crate) fn is_slow(&self) -> bool {
        self.slow
    }

    /// The minimum delay seen in the current window.
    #[cfg(test)]
    pub(crate) fn min_delay(&self) -> Duration {
        self.delay
    }

    /// Entries older than this are shed while the queue is slow.
    pub(crate) fn drop_threshold(&self) -> Duration {
        self.target * 2
    }

    /// Start a new measurement window from a dequeue, seeded with the age
    /// of the current queue head. Returns whether the queue is now slow.
    pub(crate) fn begin_interval(&mut self, now: Instant, head_age: Duration) -> bool {
        self.slow = head_age > self.target;
        self.delay = head_age;
        self.next_check = now + self.interval;
        self.slow
    }

    /// Record the delay of an entry that was successfully handed off,
    /// keeping the window minimum.
    pub(crate) fn note_popped(&mut self, waited: Duration) {
        if waited < self.delay {
            self.delay = waited;
        }
    }

    /// A poll tick observed a stalled queue head of the given age.
    ///
    /// Returns true when the stall should trigger shedding: both the
    /// window minimum and the fresh observation must miss the target, and
    /// a full interval must have elapsed since the last decision.
    pub(crate) fn on_poll(&mut self, now: Instant, head_age: Duration) -> bool {
        if now < self.next_check {
            return false;
        }
        self.slow = head_age > self.target && self.delay > self.target;
        self.delay = head_age;
        self.next_check = now + self.interval;
        self.slow
    }

    /// The wait queue emptied; there is no delay to speak of.
    pub(crate) fn queue_cleared(&mut self) {
        self.delay = Duration::ZERO;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Functions depending on "now" take it as an input parameter, so the
    // tests here fabricate a timeline from a single anchor.

    fn ms(ms: u64) -> Duration {
        Duration::from_millis(ms)
    }

    struct Timeline {
        anchor: Instant,
    }

    impl Timeline {
        fn new() -> Self {
            Self {
                anchor: Instant::now(),
            }
        }

        fn at(&self, offset_ms: u64) -> Instant {
            self.anchor + ms(offset_ms)
        }

        fn codel(&self) -> ControlledDelay {
            ControlledDelay::new(ms(50), ms(1000), self.at(0))
        }
    }

    #[test]
    fn starts_fast_with_a_full_interval_of_grace() {
        let t = Timeline::new();
        let cd = t.codel();
        assert!(!cd.is_slow());
        assert_eq!(cd.min_delay(), ms(0));
        assert_eq!(cd.next_check(), t.at(1000));
    }

    #[test]
    fn popped_delays_keep_the_window_minimum() {
        let t = Timeline::new();
        let mut cd = t.codel();

        // A 90ms wait observed mid-window does not raise the minimum,
        // which is still the 0 the window started with.
        cd.note_popped(ms(90));
        assert_eq!(cd.min_delay(), ms(0));
        assert!(!cd.is_slow());

        // A fresh window seeded above target tracks downward only.
        cd.begin_interval(t.at(1200), ms(200));
        assert_eq!(cd.min_delay(), ms(200));
        cd.note_popped(ms(30));
        assert_eq!(cd.min_delay(), ms(30));
        cd.note_popped(ms(120));
        assert_eq!(cd.min_delay(), ms(30));
    }

    #[test]
    fn interval_start_flags_an_overlong_head() {
        let t = Timeline::new();
        let mut cd = t.codel();

        assert!(cd.begin_interval(t.at(1500), ms(200)));
        assert!(cd.is_slow());
        assert_eq!(cd.next_check(), t.at(2500));

        // A healthy head flips it back.
        assert!(!cd.begin_interval(t.at(2600), ms(10)));
        assert!(!cd.is_slow());
    }

    #[test]
    fn polls_need_two_bad_windows_to_shed() {
        let t = Timeline::new();
        let mut cd = t.codel();

        // First poll: the head is 1000ms old, but the window minimum is
        // still zero, so only the observation is recorded.
        assert!(!cd.on_poll(t.at(1000), ms(1000)));
        assert!(!cd.is_slow());
        assert_eq!(cd.min_delay(), ms(1000));

        // Second poll, one interval later: both the minimum and the fresh
        // observation miss the target.
        assert!(cd.on_poll(t.at(2000), ms(2000)));
        assert!(cd.is_slow());
    }

    #[test]
    fn polls_inside_the_window_change_nothing() {
        let t = Timeline::new();
        let mut cd = t.codel();

        cd.on_poll(t.at(1000), ms(1000));
        let next = cd.next_check();

        assert!(!cd.on_poll(t.at(1400), ms(1400)));
        assert_eq!(cd.next_check(), next);
        assert_eq!(cd.min_delay(), ms(1000));
    }

    #[test]
    fn a_recovered_queue_leaves_slow_mode() {
        let t = Timeline::new();
        let mut cd = t.codel();

        cd.on_poll(t.at(1000), ms(1000));
        assert!(cd.on_poll(t.at(2000), ms(2000)));

        // Head-of-line delay back under target: the next poll clears slow
        // mode even though the previous window was bad.
        assert!(!cd.on_poll(t.at(3000), ms(20)));
        assert!(!cd.is_slow());
    }

    #[test]
    fn clearing_the_queue_resets_the_minimum() {
        let t = Timeline::new();
        let mut cd = t.codel();

        cd.begin_interval(t.at(1100), ms(400));
        cd.queue_cleared();
        assert_eq!(cd.min_delay(), ms(0));

        // The next poll sees a sub-target minimum and cannot shed.
        assert!(!cd.on_poll(t.at(2200), ms(500)));
    }

    #[test]
    fn drop_threshold_is_twice_target() {
        let t = Timeline::new();
        let cd = t.codel();
        assert_eq!(cd.drop_threshold(), ms(100));
    }
}
