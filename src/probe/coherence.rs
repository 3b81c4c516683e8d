//! Coherence specifications: how often a shadow's source is probed again.
//!
//! # Text Form
//!
//! Used in configuration (`probe.default_coherence`). All durations are in
//! milliseconds:
//!
//! ```text
//! one-time-only
//! periodic(60000)
//! adaptive-periodic(3600000,604800000,1.1)   fallback, max, factor
//! ```
//!
//! # Adaptive Schedule
//!
//! ```text
//! start:      delay = fallback
//! unchanged:  streak += 1; delay = min(max, delay × factor^streak)
//! changed:    streak  = 0; delay = max(fallback, delay ÷ factor)
//! failed:     nothing changes
//! ```
//!
//! Quiet sources back off quickly toward `max_delay`; a single change only
//! tightens the interval by one factor, so a noisy source converges on
//! `fallback_delay` over several runs.

use crate::error::{MeshError, Result};
use crate::probe::RunOutcome;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Polling policy for a shadow.
#[derive(Debug, Clone, PartialEq)]
pub enum CoherenceSpecification {
    /// Probe once, never again unless forced.
    OneTimeOnly,

    /// Probe every `period`.
    Periodic { period: Duration },

    /// Probe between `fallback_delay` and `max_delay`, backing off while the
    /// source does not change.
    AdaptivePeriodic {
        fallback_delay: Duration,
        max_delay: Duration,
        adaptive_factor: f64,
    },
}

impl Default for CoherenceSpecification {
    fn default() -> Self {
        CoherenceSpecification::AdaptivePeriodic {
            fallback_delay: Duration::from_secs(60 * 60),
            max_delay: Duration::from_secs(7 * 24 * 60 * 60),
            adaptive_factor: 1.1,
        }
    }
}

impl CoherenceSpecification {
    pub fn validate(&self) -> Result<()> {
        match self {
            CoherenceSpecification::OneTimeOnly => Ok(()),
            CoherenceSpecification::Periodic { period } => {
                if period.is_zero() {
                    return Err(MeshError::Config("periodic coherence needs a non-zero period".to_string()));
                }
                Ok(())
            }
            CoherenceSpecification::AdaptivePeriodic {
                fallback_delay,
                max_delay,
                adaptive_factor,
            } => {
                if fallback_delay.is_zero() || fallback_delay > max_delay {
                    return Err(MeshError::Config(format!(
                        "adaptive coherence needs 0 < fallback ({:?}) <= max ({:?})",
                        fallback_delay, max_delay
                    )));
                }
                if !adaptive_factor.is_finite() || *adaptive_factor < 1.0 {
                    return Err(MeshError::Config(format!(
                        "adaptive factor must be at least 1.0, got {}",
                        adaptive_factor
                    )));
                }
                Ok(())
            }
        }
    }
}

impl fmt::Display for CoherenceSpecification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CoherenceSpecification::OneTimeOnly => write!(f, "one-time-only"),
            CoherenceSpecification::Periodic { period } => {
                write!(f, "periodic({})", period.as_millis())
            }
            CoherenceSpecification::AdaptivePeriodic {
                fallback_delay,
                max_delay,
                adaptive_factor,
            } => write!(
                f,
                "adaptive-periodic({},{},{})",
                fallback_delay.as_millis(),
                max_delay.as_millis(),
                adaptive_factor
            ),
        }
    }
}

impl FromStr for CoherenceSpecification {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let invalid = || MeshError::Config(format!("invalid coherence specification: {:?}", s));

        if s == "one-time-only" {
            return Ok(CoherenceSpecification::OneTimeOnly);
        }
        let (name, args) = s
            .strip_suffix(')')
            .and_then(|rest| rest.split_once('('))
            .ok_or_else(invalid)?;
        let args: Vec<&str> = args.split(',').map(str::trim).collect();
        let millis = |raw: &str| raw.parse::<u64>().map(Duration::from_millis).map_err(|_| invalid());

        let spec = match (name.trim(), args.as_slice()) {
            ("periodic", [period]) => CoherenceSpecification::Periodic {
                period: millis(period)?,
            },
            ("adaptive-periodic", [fallback, max, factor]) => CoherenceSpecification::AdaptivePeriodic {
                fallback_delay: millis(fallback)?,
                max_delay: millis(max)?,
                adaptive_factor: factor.parse().map_err(|_| invalid())?,
            },
            _ => return Err(invalid()),
        };
        spec.validate()?;
        Ok(spec)
    }
}

/// Next-run bookkeeping for one shadow.
#[derive(Debug, Clone)]
pub struct RunSchedule {
    specification: CoherenceSpecification,
    delay: Option<Duration>,
    unchanged_streak: u32,
}

impl RunSchedule {
    pub fn new(specification: CoherenceSpecification) -> Self {
        let delay = initial_delay(&specification);
        Self {
            specification,
            delay,
            unchanged_streak: 0,
        }
    }

    pub fn specification(&self) -> &CoherenceSpecification {
        &self.specification
    }

    /// Delay before the next scheduled run; `None` = no further run.
    pub fn next_delay(&self) -> Option<Duration> {
        self.delay
    }

    /// Switch policy, starting its schedule afresh.
    pub fn set_specification(&mut self, specification: CoherenceSpecification) {
        if specification != self.specification {
            *self = Self::new(specification);
        }
    }

    /// Fold a run's outcome into the schedule and return the next delay.
    pub fn record(&mut self, outcome: &RunOutcome) -> Option<Duration> {
        match (&self.specification, outcome) {
            (_, RunOutcome::Failed(_)) => {}
            (CoherenceSpecification::OneTimeOnly, _) => self.delay = None,
            (CoherenceSpecification::Periodic { period }, _) => self.delay = Some(*period),
            (
                CoherenceSpecification::AdaptivePeriodic {
                    fallback_delay,
                    max_delay,
                    adaptive_factor,
                },
                outcome,
            ) => {
                // Nanosecond floats, rounded back, so exact factors stay exact.
                let current = self.delay.unwrap_or(*fallback_delay).as_nanos() as f64;
                let next = if outcome.is_changed() {
                    self.unchanged_streak = 0;
                    (current / adaptive_factor).max(fallback_delay.as_nanos() as f64)
                } else {
                    self.unchanged_streak = self.unchanged_streak.saturating_add(1);
                    let exponent = i32::try_from(self.unchanged_streak).unwrap_or(i32::MAX);
                    (current * adaptive_factor.powi(exponent)).min(max_delay.as_nanos() as f64)
                };
                self.delay = Some(Duration::from_nanos(next.round() as u64));
            }
        }
        self.delay
    }
}

fn initial_delay(specification: &CoherenceSpecification) -> Option<Duration> {
    match specification {
        CoherenceSpecification::OneTimeOnly => None,
        CoherenceSpecification::Periodic { period } => Some(*period),
        CoherenceSpecification::AdaptivePeriodic { fallback_delay, .. } => Some(*fallback_delay),
    }
}
