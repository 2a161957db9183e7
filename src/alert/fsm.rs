use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::config::Threshold;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    Normal,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Normal => write!(f, "normal"),
            Self::Warning => write!(f, "warning"),
            Self::Critical => write!(f, "critical"),
        }
    }
}

/// Read-only view of one state machine
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlertState {
    pub severity: Severity,
    /// Capture time the current severity was entered
    pub since: Duration,
    /// Consecutive cycles above the warning threshold
    pub consecutive_breaches: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: Severity,
    pub to: Severity,
}

/// Hysteresis state machine for one (interface, metric).
///
/// Stepping up needs `required` consecutive cycles strictly above the
/// target threshold; a value above critical also counts toward warning, so
/// a sustained critical breach can go straight from Normal to Critical.
/// Stepping down happens on the first cycle below the lower threshold minus
/// the hysteresis margin.
#[derive(Debug, Clone)]
pub struct AlertFsm {
    severity: Severity,
    since: Duration,
    warning_streak: u32,
    critical_streak: u32,
    required: u32,
}

impl AlertFsm {
    pub fn new(required: u32, at: Duration) -> Self {
        Self {
            severity: Severity::Normal,
            since: at,
            warning_streak: 0,
            critical_streak: 0,
            required: required.max(1),
        }
    }

    pub fn severity(&self) -> Severity {
        self.severity
    }

    pub fn state(&self) -> AlertState {
        AlertState {
            severity: self.severity,
            since: self.since,
            consecutive_breaches: self.warning_streak,
        }
    }

    /// Feed one evaluation cycle's value
    pub fn observe(&mut self, value: f64, threshold: &Threshold, at: Duration) -> Option<Transition> {
        if value > threshold.critical {
            self.critical_streak += 1;
        } else {
            self.critical_streak = 0;
        }
        if value > threshold.warning {
            self.warning_streak += 1;
        } else {
            self.warning_streak = 0;
        }

        let earned = if self.critical_streak >= self.required {
            Severity::Critical
        } else if self.warning_streak >= self.required {
            Severity::Warning
        } else {
            Severity::Normal
        };

        let next = if earned > self.severity {
            earned
        } else {
            match self.severity {
                Severity::Critical if value < threshold.warning - threshold.hysteresis => {
                    Severity::Normal
                }
                Severity::Critical if value < threshold.critical - threshold.hysteresis => {
                    Severity::Warning
                }
                Severity::Warning if value < threshold.warning - threshold.hysteresis => {
                    Severity::Normal
                }
                current => current,
            }
        };

        if next == self.severity {
            return None;
        }
        let transition = Transition {
            from: self.severity,
            to: next,
        };
        self.severity = next;
        self.since = at;
        Some(transition)
    }
}
