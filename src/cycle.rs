//! The integration cycle: idle -> integrating -> finalizing -> idle.

use hifitime::{Duration, Epoch};
use thiserror::Error;

/// Longest integration accepted: one stellar day \[seconds\].
pub const MAX_INTEGRATION_SECONDS: f64 = 86164.0905;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CycleError {
    #[error("an integration is already in progress")]
    Busy,

    #[error("integration duration {0} s must be positive and at most one stellar day")]
    BadDuration(f64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CycleState {
    Idle,
    Integrating { start: Epoch, requested: Duration },
    Finalizing { start: Epoch, requested: Duration },
}

#[derive(Debug, Clone)]
pub struct IntegrationCycle {
    state: CycleState,
}

impl Default for IntegrationCycle {
    fn default() -> Self {
        IntegrationCycle {
            state: CycleState::Idle,
        }
    }
}

impl IntegrationCycle {
    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn is_integrating(&self) -> bool {
        matches!(self.state, CycleState::Integrating { .. })
    }

    pub fn is_idle(&self) -> bool {
        matches!(self.state, CycleState::Idle)
    }

    /// Begin integrating for `seconds`. Only one cycle can be active; a
    /// request while integrating or finalizing leaves that cycle untouched.
    pub fn start(&mut self, seconds: f64, now: Epoch) -> Result<(), CycleError> {
        if !self.is_idle() {
            return Err(CycleError::Busy);
        }
        if !(seconds > 0.0 && seconds <= MAX_INTEGRATION_SECONDS) {
            return Err(CycleError::BadDuration(seconds));
        }
        self.state = CycleState::Integrating {
            start: now,
            requested: Duration::from_seconds(seconds),
        };
        Ok(())
    }

    /// Drop an integration without producing anything. Returns whether there
    /// was one to abort.
    pub fn abort(&mut self) -> bool {
        if self.is_integrating() {
            self.state = CycleState::Idle;
            true
        } else {
            false
        }
    }

    pub fn elapsed(&self, now: Epoch) -> Option<Duration> {
        match self.state {
            CycleState::Integrating { start, .. } => Some(now - start),
            _ => None,
        }
    }

    /// Seconds left in the current integration; negative once overdue.
    pub fn remaining(&self, now: Epoch) -> Option<f64> {
        match self.state {
            CycleState::Integrating { start, requested } => {
                Some((requested - (now - start)).to_seconds())
            }
            _ => None,
        }
    }

    pub fn is_due(&self, now: Epoch) -> bool {
        self.remaining(now).map_or(false, |r| r <= 0.0)
    }

    /// Move an integrating cycle to finalizing, returning its start time and
    /// requested length.
    pub fn begin_finalize(&mut self) -> Option<(Epoch, Duration)> {
        match self.state {
            CycleState::Integrating { start, requested } => {
                self.state = CycleState::Finalizing { start, requested };
                Some((start, requested))
            }
            _ => None,
        }
    }

    pub fn finish(&mut self) {
        if matches!(self.state, CycleState::Finalizing { .. }) {
            self.state = CycleState::Idle;
        }
    }
}
