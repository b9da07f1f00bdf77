//! Reset decision engine
//!
//! An ordered decision tree, first match wins:
//!
//! 1. Post-wake turbo: shortly after a wake (or a reset) a link that worked
//!    before is reset on the first failure, after a short grace period.
//! 2. Not attached: the cable or host looks gone; be patient.
//! 3. Was connected: reset after a few consecutive failures.
//! 4. Never connected: never reset. A host that never brought the link up
//!    (no driver, tethering disabled) would otherwise be reset forever.

use std::fmt;
use std::time::Instant;
use tracing::debug;

use crate::config::PolicyConfig;
use crate::link::UsbState;

/// Target of the verbose decision trace channel
pub const TRACE_TARGET: &str = "usbnet_keeper::trace";

/// Why a check failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotAttached,
    NoIp,
    NoPing,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::NotAttached => "not-attached",
            Self::NoIp => "no-ip",
            Self::NoPing => "no-ping",
        })
    }
}

/// Per-interface failure counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Counters {
    pub fail_no_ip: u32,
    pub fail_no_ping: u32,
    pub not_attached: u32,
}

impl Counters {
    /// Counter matching a failure kind
    pub fn relevant(&self, kind: FailureKind) -> u32 {
        match kind {
            FailureKind::NotAttached => self.not_attached,
            FailureKind::NoIp => self.fail_no_ip,
            FailureKind::NoPing => self.fail_no_ping,
        }
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Branch of the decision tree that produced a decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionPath {
    PostWakeGrace,
    PostWakeTurbo,
    NotAttached,
    Reconnect,
    NeverConnected,
}

impl fmt::Display for DecisionPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PostWakeGrace => "post-wake-grace",
            Self::PostWakeTurbo => "post-wake-turbo",
            Self::NotAttached => "not-attached",
            Self::Reconnect => "reconnect",
            Self::NeverConnected => "never-connected",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decision {
    pub path: DecisionPath,
    pub reset: bool,
    pub counter: u32,
    /// Threshold the counter was compared against; 0 when none applies
    pub threshold: u32,
}

/// Everything the engine needs to know about one link
#[derive(Debug, Clone, Copy)]
pub struct LinkSnapshot<'a> {
    pub iface: &'a str,
    pub usb_state: UsbState,
    pub counters: Counters,
    /// The link has reached Connected at least once (persisted)
    pub was_connected: bool,
}

pub struct ResetPolicy {
    config: PolicyConfig,
}

impl ResetPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    /// Walk the decision tree. Pure: time is passed in.
    pub fn decide(
        &self,
        link: &LinkSnapshot<'_>,
        kind: FailureKind,
        wake_at: Option<Instant>,
        now: Instant,
    ) -> Decision {
        let counter = link.counters.relevant(kind);

        if let Some(wake_at) = wake_at.filter(|_| kind != FailureKind::NotAttached) {
            let elapsed = now.saturating_duration_since(wake_at);
            let fast = self.config.post_wake_fast_threshold;

            if elapsed < self.config.grace_period() {
                return Decision {
                    path: DecisionPath::PostWakeGrace,
                    reset: false,
                    counter,
                    threshold: fast,
                };
            }
            // A never-connected link gets no fast path; it falls through
            if elapsed < self.config.turbo_window() && link.was_connected {
                return Decision {
                    path: DecisionPath::PostWakeTurbo,
                    reset: counter >= fast,
                    counter,
                    threshold: fast,
                };
            }
        }

        if link.usb_state == UsbState::NotAttached {
            let counter = link.counters.not_attached;
            let threshold = self.config.not_attached_threshold;
            return Decision {
                path: DecisionPath::NotAttached,
                reset: counter >= threshold,
                counter,
                threshold,
            };
        }

        if link.was_connected {
            let threshold = self.config.reconnect_threshold;
            return Decision {
                path: DecisionPath::Reconnect,
                reset: counter >= threshold,
                counter,
                threshold,
            };
        }

        Decision {
            path: DecisionPath::NeverConnected,
            reset: false,
            counter,
            threshold: 0,
        }
    }

    /// [`decide`](Self::decide) plus the decision trace
    pub fn should_reset(
        &self,
        link: &LinkSnapshot<'_>,
        kind: FailureKind,
        wake_at: Option<Instant>,
        now: Instant,
    ) -> bool {
        let decision = self.decide(link, kind, wake_at, now);
        let since_wake_ms = wake_at.map(|w| now.saturating_duration_since(w).as_millis() as u64);

        debug!(
            target: TRACE_TARGET,
            iface = link.iface,
            kind = %kind,
            usb_state = %link.usb_state,
            was_connected = link.was_connected,
            path = %decision.path,
            counter = decision.counter,
            threshold = decision.threshold,
            since_wake_ms = ?since_wake_ms,
            reset = decision.reset,
            "reset decision"
        );
        decision.reset
    }
}
