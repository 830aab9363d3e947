//! System clock adjustment
//!
//! [`AdjustmentPolicy`] decides between slewing and stepping; a
//! [`ClockAdjuster`] carries the decision out on the running platform.

mod platform;

pub use self::platform::{platform_clock, SystemClock};

use std::fmt;

use tracing::info;

use crate::core::ClockError;
use crate::protocol::Timestamp;

/// Platform capability to read and adjust the system clock
pub trait ClockAdjuster: Send + Sync {
    /// Current wall-clock time
    fn now(&self) -> Timestamp;

    /// Gradually shifts the clock by `offset_ms` (positive moves it forward)
    fn slew(&self, offset_ms: f64) -> Result<(), ClockError>;

    /// Sets the clock to `to` immediately
    fn step(&self, to: Timestamp) -> Result<(), ClockError>;
}

/// How an offset is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdjustMode {
    /// Gradual rate adjustment, time never jumps
    Slew,
    /// Immediate absolute set
    Step,
}

impl fmt::Display for AdjustMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdjustMode::Slew => write!(f, "slew"),
            AdjustMode::Step => write!(f, "step"),
        }
    }
}

/// The outcome of one adjustment
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustmentDecision {
    pub offset_ms: f64,
    pub mode: AdjustMode,
    /// False in dry-run mode
    pub applied: bool,
}

/// Slew-or-step policy
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdjustmentPolicy {
    /// Offsets up to this magnitude (inclusive) are slewed
    pub slew_threshold_ms: f64,
    /// Decide and log but leave the clock alone
    pub dry_run: bool,
}

impl Default for AdjustmentPolicy {
    fn default() -> Self {
        AdjustmentPolicy {
            slew_threshold_ms: 500.0,
            dry_run: false,
        }
    }
}

impl AdjustmentPolicy {
    pub fn new(slew_threshold_ms: f64, dry_run: bool) -> Self {
        AdjustmentPolicy {
            slew_threshold_ms,
            dry_run,
        }
    }

    /// Picks the adjustment mode for `offset_ms`
    pub fn mode_for(&self, offset_ms: f64) -> AdjustMode {
        if offset_ms.abs() <= self.slew_threshold_ms {
            AdjustMode::Slew
        } else {
            AdjustMode::Step
        }
    }

    /// Applies `offset_ms` to `clock` (positive means the local clock is
    /// behind). Privilege failures are returned as-is and never retried.
    pub fn apply(
        &self,
        clock: &dyn ClockAdjuster,
        offset_ms: f64,
    ) -> Result<AdjustmentDecision, ClockError> {
        let mode = self.mode_for(offset_ms);

        if self.dry_run {
            info!(offset_ms, %mode, "dry run: would adjust clock");
            return Ok(AdjustmentDecision {
                offset_ms,
                mode,
                applied: false,
            });
        }

        match mode {
            AdjustMode::Slew => {
                info!(offset_ms, "slewing clock");
                clock.slew(offset_ms)?;
            }
            AdjustMode::Step => {
                let target = clock.now().offset_by_ms(offset_ms);
                info!(offset_ms, %target, "stepping clock");
                clock.step(target)?;
            }
        }

        Ok(AdjustmentDecision {
            offset_ms,
            mode,
            applied: true,
        })
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::sync::Mutex;

    /// Records adjustments instead of making them
    #[derive(Debug, Default)]
    pub struct MockClock {
        pub now: i64,
        pub fail_with: Option<ClockError>,
        pub slewed: Mutex<Vec<f64>>,
        pub stepped: Mutex<Vec<Timestamp>>,
    }

    impl ClockAdjuster for MockClock {
        fn now(&self) -> Timestamp {
            Timestamp::from_nanos(self.now)
        }

        fn slew(&self, offset_ms: f64) -> Result<(), ClockError> {
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            self.slewed.lock().unwrap().push(offset_ms);
            Ok(())
        }

        fn step(&self, to: Timestamp) -> Result<(), ClockError> {
            if let Some(e) = &self.fail_with {
                return Err(e.clone());
            }
            self.stepped.lock().unwrap().push(to);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::mock::MockClock;
    use super::*;

    #[test]
    fn test_threshold_is_inclusive() {
        let policy = AdjustmentPolicy::default();
        assert_eq!(policy.mode_for(500.0), AdjustMode::Slew);
        assert_eq!(policy.mode_for(-500.0), AdjustMode::Slew);
        assert_eq!(policy.mode_for(500.001), AdjustMode::Step);
        assert_eq!(policy.mode_for(-500.001), AdjustMode::Step);
        assert_eq!(policy.mode_for(0.0), AdjustMode::Slew);
    }

    #[test]
    fn test_slew_invokes_primitive() {
        let clock = MockClock::default();
        let decision = AdjustmentPolicy::default().apply(&clock, 12.5).unwrap();
        assert_eq!(decision.mode, AdjustMode::Slew);
        assert!(decision.applied);
        assert_eq!(*clock.slewed.lock().unwrap(), vec![12.5]);
        assert!(clock.stepped.lock().unwrap().is_empty());
    }

    #[test]
    fn test_step_sets_absolute_time() {
        let clock = MockClock {
            now: 1_000_000_000,
            ..Default::default()
        };
        let decision = AdjustmentPolicy::default().apply(&clock, -750.0).unwrap();
        assert_eq!(decision.mode, AdjustMode::Step);
        assert_eq!(
            *clock.stepped.lock().unwrap(),
            vec![Timestamp::from_nanos(250_000_000)]
        );
    }

    #[test]
    fn test_dry_run_leaves_clock_alone() {
        let clock = MockClock::default();
        let policy = AdjustmentPolicy::new(500.0, true);
        let decision = policy.apply(&clock, 900.0).unwrap();
        assert_eq!(decision.mode, AdjustMode::Step);
        assert!(!decision.applied);
        assert!(clock.slewed.lock().unwrap().is_empty());
        assert!(clock.stepped.lock().unwrap().is_empty());
    }

    #[test]
    fn test_errors_surface() {
        let clock = MockClock {
            fail_with: Some(ClockError::PermissionDenied),
            ..Default::default()
        };
        let policy = AdjustmentPolicy::default();
        assert_eq!(policy.apply(&clock, 1.0), Err(ClockError::PermissionDenied));

        let clock = MockClock {
            fail_with: Some(ClockError::UnsupportedPlatform),
            ..Default::default()
        };
        assert_eq!(policy.apply(&clock, 600.0), Err(ClockError::UnsupportedPlatform));

        // A refused slew is reported as an error, never as an applied correction
        let refusal = ClockError::SlewOutOfRange {
            offset_us: 800_000,
            max_us: 500_000,
        };
        let clock = MockClock {
            fail_with: Some(refusal.clone()),
            ..Default::default()
        };
        let policy = AdjustmentPolicy::new(1000.0, false);
        assert_eq!(policy.apply(&clock, 800.0), Err(refusal));
    }
}
