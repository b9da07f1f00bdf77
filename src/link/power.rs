//! Wake/sleep event detection
//!
//! Hosts disagree on which suspend signal they assert, so both the gadget
//! `suspended` flag and the controller's DSTS.SuspSts bit are watched and a
//! transition on either one counts. Accepting an event is idempotent, which
//! makes the redundant triggers harmless.

use std::time::{Duration, Instant};

use super::observer::Signal;

/// Host power event derived from two signal samples
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerEvent {
    None,
    Sleep,
    Wake,
    Unknown,
}

/// Classify a pair of signal transitions
///
/// Wake wins over sleep; `Unknown` only when neither current signal is
/// readable.
pub fn determine_event(
    prev_suspend: Signal,
    cur_suspend: Signal,
    prev_dsts: Signal,
    cur_dsts: Signal,
) -> PowerEvent {
    let fell = |prev: Signal, cur: Signal| prev == Signal::Set && cur == Signal::Clear;
    let rose = |prev: Signal, cur: Signal| prev == Signal::Clear && cur == Signal::Set;

    if fell(prev_suspend, cur_suspend) || fell(prev_dsts, cur_dsts) {
        PowerEvent::Wake
    } else if rose(prev_suspend, cur_suspend) || rose(prev_dsts, cur_dsts) {
        PowerEvent::Sleep
    } else if cur_suspend == Signal::Unknown && cur_dsts == Signal::Unknown {
        PowerEvent::Unknown
    } else {
        PowerEvent::None
    }
}

/// What accepting an event did to the power state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOutcome {
    /// No event, or an event that matched the current state
    Unchanged,
    /// Host went to sleep
    Slept,
    /// Host woke up
    Woke,
}

/// Global host power state
#[derive(Debug, Clone)]
pub struct PowerState {
    pub last_suspend_flag: Signal,
    pub last_dsts_bit: Signal,
    pub host_is_sleeping: bool,
    pub wake_detected_at: Option<Instant>,
}

impl Default for PowerState {
    fn default() -> Self {
        Self {
            last_suspend_flag: Signal::Unknown,
            last_dsts_bit: Signal::Unknown,
            host_is_sleeping: false,
            wake_detected_at: None,
        }
    }
}

impl PowerState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the signals seen at startup
    ///
    /// A host that is already suspended when the daemon starts is treated as
    /// asleep, so its wake is detected and it is never reset while asleep.
    pub fn baseline(&mut self, suspend: Signal, dsts: Signal) {
        self.last_suspend_flag = suspend;
        self.last_dsts_bit = dsts;
        self.host_is_sleeping = suspend.is_set() || dsts.is_set();
        self.wake_detected_at = None;
    }

    /// Re-baseline after a gadget reset and arm the wake timer, so the
    /// freshly enumerated link gets post-wake turbo treatment
    pub fn rearm(&mut self, suspend: Signal, dsts: Signal, now: Instant) {
        self.last_suspend_flag = suspend;
        self.last_dsts_bit = dsts;
        self.host_is_sleeping = false;
        self.wake_detected_at = Some(now);
    }

    /// Feed the current signals
    ///
    /// The last-seen signals are always updated, so an unchanged pair never
    /// fires twice. Sleep is only accepted while awake and wake only while
    /// asleep.
    pub fn apply(&mut self, suspend: Signal, dsts: Signal, now: Instant) -> (PowerEvent, PowerOutcome) {
        let event = determine_event(self.last_suspend_flag, suspend, self.last_dsts_bit, dsts);
        self.last_suspend_flag = suspend;
        self.last_dsts_bit = dsts;

        let outcome = match event {
            PowerEvent::Wake if self.host_is_sleeping => {
                self.host_is_sleeping = false;
                self.wake_detected_at = Some(now);
                PowerOutcome::Woke
            }
            PowerEvent::Sleep if !self.host_is_sleeping => {
                self.host_is_sleeping = true;
                self.wake_detected_at = None;
                PowerOutcome::Slept
            }
            _ => PowerOutcome::Unchanged,
        };
        (event, outcome)
    }

    /// Time since the last wake (or post-reset re-arm)
    pub fn since_wake(&self, now: Instant) -> Option<Duration> {
        self.wake_detected_at
            .map(|at| now.saturating_duration_since(at))
    }

    pub fn in_turbo_window(&self, now: Instant, window: Duration) -> bool {
        self.since_wake(now).is_some_and(|elapsed| elapsed < window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Signal::{Clear, Set, Unknown};

    const ALL: [Signal; 3] = [Clear, Set, Unknown];

    #[test]
    fn test_wake_on_either_signal() {
        assert_eq!(determine_event(Set, Clear, Clear, Clear), PowerEvent::Wake);
        assert_eq!(determine_event(Clear, Clear, Set, Clear), PowerEvent::Wake);
        assert_eq!(determine_event(Unknown, Unknown, Set, Clear), PowerEvent::Wake);
    }

    #[test]
    fn test_sleep_on_either_signal() {
        assert_eq!(determine_event(Clear, Set, Clear, Clear), PowerEvent::Sleep);
        assert_eq!(determine_event(Clear, Clear, Clear, Set), PowerEvent::Sleep);
        assert_eq!(determine_event(Unknown, Unknown, Clear, Set), PowerEvent::Sleep);
    }

    #[test]
    fn test_wake_has_priority() {
        // Suspend flag rises while DSTS falls
        assert_eq!(determine_event(Clear, Set, Set, Clear), PowerEvent::Wake);
    }

    #[test]
    fn test_unknown_and_none() {
        assert_eq!(determine_event(Set, Unknown, Clear, Unknown), PowerEvent::Unknown);
        assert_eq!(determine_event(Clear, Clear, Unknown, Unknown), PowerEvent::None);
        // No transition from Unknown
        assert_eq!(determine_event(Unknown, Set, Unknown, Clear), PowerEvent::None);
        assert_eq!(determine_event(Unknown, Clear, Unknown, Set), PowerEvent::None);
    }

    #[test]
    fn test_unchanged_inputs_never_fire() {
        for s in ALL {
            for d in ALL {
                let event = determine_event(s, s, d, d);
                assert!(
                    !matches!(event, PowerEvent::Wake | PowerEvent::Sleep),
                    "({}, {}) fired {:?}",
                    s,
                    d,
                    event
                );
            }
        }
    }

    #[test]
    fn test_determine_event_is_pure() {
        for a in ALL {
            for b in ALL {
                for c in ALL {
                    for d in ALL {
                        assert_eq!(determine_event(a, b, c, d), determine_event(a, b, c, d));
                    }
                }
            }
        }
    }

    #[test]
    fn test_repeated_sleep_accepted_once() {
        let now = Instant::now();
        let mut power = PowerState::new();
        power.baseline(Clear, Clear);

        assert_eq!(power.apply(Set, Clear, now), (PowerEvent::Sleep, PowerOutcome::Slept));
        assert!(power.host_is_sleeping);
        assert_eq!(power.apply(Set, Clear, now), (PowerEvent::None, PowerOutcome::Unchanged));
        // DSTS follows later: a second Sleep event, ignored while asleep
        assert_eq!(power.apply(Set, Set, now), (PowerEvent::Sleep, PowerOutcome::Unchanged));
    }

    #[test]
    fn test_wake_stamps_and_sleep_clears() {
        let now = Instant::now();
        let mut power = PowerState::new();
        power.baseline(Set, Set);
        assert!(power.host_is_sleeping);

        let (_, outcome) = power.apply(Clear, Set, now);
        assert_eq!(outcome, PowerOutcome::Woke);
        assert_eq!(power.wake_detected_at, Some(now));

        // DSTS catches up: redundant wake ignored, stamp kept
        let later = now + Duration::from_secs(1);
        let (event, outcome) = power.apply(Clear, Clear, later);
        assert_eq!(event, PowerEvent::Wake);
        assert_eq!(outcome, PowerOutcome::Unchanged);
        assert_eq!(power.wake_detected_at, Some(now));

        let (_, outcome) = power.apply(Set, Clear, later);
        assert_eq!(outcome, PowerOutcome::Slept);
        assert_eq!(power.wake_detected_at, None);
    }

    #[test]
    fn test_wake_ignored_when_awake() {
        let now = Instant::now();
        let mut power = PowerState::new();
        power.last_suspend_flag = Set;
        power.last_dsts_bit = Set;

        let (event, outcome) = power.apply(Clear, Clear, now);
        assert_eq!(event, PowerEvent::Wake);
        assert_eq!(outcome, PowerOutcome::Unchanged);
        assert_eq!(power.wake_detected_at, None);
    }

    #[test]
    fn test_turbo_window() {
        let now = Instant::now();
        let mut power = PowerState::new();
        assert!(!power.in_turbo_window(now, Duration::from_secs(15)));

        power.rearm(Clear, Clear, now);
        assert!(power.in_turbo_window(now + Duration::from_secs(14), Duration::from_secs(15)));
        assert!(!power.in_turbo_window(now + Duration::from_secs(15), Duration::from_secs(15)));
    }
}
