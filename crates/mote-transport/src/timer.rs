//! Two-stage handshake timer
//!
//! The handshake engine asks for an intermediate interval (drives its own
//! flight retransmission) and a final budget (gives up the handshake). The host
//! only offers one-shot timers, so each intermediate firing spends one interval
//! from the remaining budget and re-arms until the budget is gone. Final expiry
//! is reported exactly once.

use mote_core::effects::TimerStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Armed {
    intermediate_ms: u32,
    remaining_ms: u32,
}

/// What the owner must ask the host scheduler to do after `arm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerCommand {
    /// Request a one-shot timer of this many milliseconds
    Start(u32),
    /// Cancel the outstanding one-shot timer
    Cancel,
}

/// Interpretation of a host timer firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerFiring {
    /// Intermediate interval elapsed; re-arm with this interval
    Intermediate {
        /// Interval to request again
        rearm_ms: u32,
    },
    /// The final budget is spent
    Final,
    /// The timer was not armed; ignore the firing
    Stale,
}

/// Two-stage timer state for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandshakeTimer {
    armed: Option<Armed>,
    status: TimerStatus,
}

impl Default for HandshakeTimer {
    fn default() -> Self {
        Self {
            armed: None,
            status: TimerStatus::Cancelled,
        }
    }
}

impl HandshakeTimer {
    /// Arm the timer; a zero final budget cancels it
    pub fn arm(&mut self, intermediate_ms: u32, final_ms: u32) -> TimerCommand {
        if final_ms == 0 {
            self.cancel();
            return TimerCommand::Cancel;
        }
        let intermediate_ms = if intermediate_ms == 0 || intermediate_ms > final_ms {
            final_ms
        } else {
            intermediate_ms
        };
        self.armed = Some(Armed {
            intermediate_ms,
            remaining_ms: final_ms,
        });
        self.status = TimerStatus::Running;
        TimerCommand::Start(intermediate_ms)
    }

    /// Disarm without reporting expiry
    pub fn cancel(&mut self) {
        self.armed = None;
        self.status = TimerStatus::Cancelled;
    }

    /// Account for one host firing
    pub fn fire(&mut self) -> TimerFiring {
        let Some(armed) = self.armed.as_mut() else {
            return TimerFiring::Stale;
        };

        if armed.remaining_ms > armed.intermediate_ms {
            armed.remaining_ms -= armed.intermediate_ms;
            self.status = TimerStatus::IntermediateExpired;
            TimerFiring::Intermediate {
                rearm_ms: armed.intermediate_ms,
            }
        } else {
            self.armed = None;
            self.status = TimerStatus::FinalExpired;
            TimerFiring::Final
        }
    }

    /// Status as reported to the handshake engine
    pub fn status(&self) -> TimerStatus {
        self.status
    }

    /// Whether a host timer is outstanding
    pub fn is_armed(&self) -> bool {
        self.armed.is_some()
    }

    /// Budget left before final expiry, if armed
    pub fn remaining_ms(&self) -> Option<u32> {
        self.armed.map(|armed| armed.remaining_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intermediate_firings_spend_budget() {
        let mut timer = HandshakeTimer::default();
        assert_eq!(timer.arm(1000, 3500), TimerCommand::Start(1000));
        assert_eq!(timer.status(), TimerStatus::Running);

        for remaining in [2500, 1500, 500] {
            assert_eq!(timer.fire(), TimerFiring::Intermediate { rearm_ms: 1000 });
            assert_eq!(timer.remaining_ms(), Some(remaining));
            assert_eq!(timer.status(), TimerStatus::IntermediateExpired);
        }

        assert_eq!(timer.fire(), TimerFiring::Final);
        assert_eq!(timer.status(), TimerStatus::FinalExpired);
        assert!(!timer.is_armed());
    }

    #[test]
    fn test_final_reported_once() {
        let mut timer = HandshakeTimer::default();
        timer.arm(500, 500);
        assert_eq!(timer.fire(), TimerFiring::Final);
        assert_eq!(timer.fire(), TimerFiring::Stale);
        assert_eq!(timer.status(), TimerStatus::FinalExpired);
    }

    #[test]
    fn test_zero_final_cancels() {
        let mut timer = HandshakeTimer::default();
        timer.arm(1000, 4000);
        assert_eq!(timer.arm(1000, 0), TimerCommand::Cancel);
        assert_eq!(timer.status(), TimerStatus::Cancelled);
        assert_eq!(timer.fire(), TimerFiring::Stale);
    }

    #[test]
    fn test_intermediate_clamped_to_budget() {
        let mut timer = HandshakeTimer::default();
        assert_eq!(timer.arm(0, 800), TimerCommand::Start(800));
        assert_eq!(timer.arm(5000, 800), TimerCommand::Start(800));
        assert_eq!(timer.fire(), TimerFiring::Final);
    }
}
