use tracing::debug;

use super::ClockAdjuster;
use crate::core::ClockError;
use crate::protocol::Timestamp;

/// The running system's clock
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

/// Selects the clock implementation for the current platform
pub fn platform_clock() -> Box<dyn ClockAdjuster> {
    debug!(os = std::env::consts::OS, "using system clock");
    Box::new(SystemClock)
}

impl ClockAdjuster for SystemClock {
    fn now(&self) -> Timestamp {
        Timestamp::now()
    }

    fn slew(&self, offset_ms: f64) -> Result<(), ClockError> {
        imp::slew(offset_ms)
    }

    fn step(&self, to: Timestamp) -> Result<(), ClockError> {
        imp::step(to)
    }
}

#[cfg(any(target_os = "linux", target_os = "macos"))]
fn last_os_error() -> ClockError {
    match std::io::Error::last_os_error().raw_os_error() {
        Some(libc::EPERM) => ClockError::PermissionDenied,
        Some(errno) => ClockError::Os(errno),
        None => ClockError::Os(-1),
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use nix::errno::Errno;
    use nix::sys::time::TimeSpec;
    use nix::time::{clock_settime, ClockId};

    use super::*;
    use crate::core::MAX_SLEW_MS;

    /// PLL offset in microseconds. The kernel silently clamps anything past
    /// the slew limit, so larger offsets are refused instead.
    pub(super) fn slew_offset_us(offset_ms: f64) -> Result<libc::c_long, ClockError> {
        let offset_us = (offset_ms * 1000.0).round() as i64;
        let max_us = (MAX_SLEW_MS * 1000.0) as i64;
        if offset_us.abs() > max_us {
            return Err(ClockError::SlewOutOfRange { offset_us, max_us });
        }
        Ok(offset_us as libc::c_long)
    }

    pub(super) fn slew(offset_ms: f64) -> Result<(), ClockError> {
        let offset = slew_offset_us(offset_ms)?;

        // SAFETY: timex is plain data; zeroed means "change nothing"
        let mut tx: libc::timex = unsafe { std::mem::zeroed() };
        // ADJ_OFFSET is ignored while the PLL is disabled
        tx.modes = libc::ADJ_OFFSET | libc::ADJ_MICRO | libc::ADJ_STATUS;
        tx.status = libc::STA_PLL;
        tx.offset = offset;

        // SAFETY: tx is a valid, initialized timex
        let ret = unsafe { libc::adjtimex(&mut tx) };
        if ret < 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub(super) fn step(to: Timestamp) -> Result<(), ClockError> {
        let spec = TimeSpec::new(to.secs() as libc::time_t, to.subsec_nanos() as libc::c_long);
        clock_settime(ClockId::CLOCK_REALTIME, spec).map_err(|e| match e {
            Errno::EPERM => ClockError::PermissionDenied,
            other => ClockError::Os(other as i32),
        })
    }
}

#[cfg(target_os = "macos")]
mod imp {
    use super::*;

    pub(super) fn slew(offset_ms: f64) -> Result<(), ClockError> {
        let micros = (offset_ms * 1000.0).round() as i64;
        let delta = libc::timeval {
            tv_sec: (micros / 1_000_000) as libc::time_t,
            tv_usec: (micros % 1_000_000) as libc::suseconds_t,
        };

        // SAFETY: delta is a valid timeval; the old-delta pointer may be null
        let ret = unsafe { libc::adjtime(&delta, std::ptr::null_mut()) };
        if ret != 0 {
            return Err(last_os_error());
        }
        Ok(())
    }

    pub(super) fn step(to: Timestamp) -> Result<(), ClockError> {
        let tv = libc::timeval {
            tv_sec: to.secs() as libc::time_t,
            tv_usec: (to.subsec_nanos() / 1000) as libc::suseconds_t,
        };

        // SAFETY: tv is a valid timeval; the timezone pointer may be null
        let ret = unsafe { libc::settimeofday(&tv, std::ptr::null()) };
        if ret != 0 {
            return Err(last_os_error());
        }
        Ok(())
    }
}

#[cfg(not(any(target_os = "linux", target_os = "macos")))]
mod imp {
    use super::*;

    pub(super) fn slew(_offset_ms: f64) -> Result<(), ClockError> {
        Err(ClockError::UnsupportedPlatform)
    }

    pub(super) fn step(_to: Timestamp) -> Result<(), ClockError> {
        Err(ClockError::UnsupportedPlatform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_now_tracks_system_time() {
        let clock = platform_clock();
        let before = Timestamp::now();
        let now = clock.now();
        assert!(now >= before);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_slew_beyond_kernel_limit_is_refused() {
        assert_eq!(imp::slew_offset_us(500.0), Ok(500_000));
        assert_eq!(imp::slew_offset_us(-0.25), Ok(-250));
        assert_eq!(
            imp::slew_offset_us(800.0),
            Err(ClockError::SlewOutOfRange {
                offset_us: 800_000,
                max_us: 500_000
            })
        );
        // Refused before the kernel is ever asked, privileged or not
        assert!(matches!(
            SystemClock.slew(-800.0),
            Err(ClockError::SlewOutOfRange { .. })
        ));
    }

    #[cfg(any(target_os = "linux", target_os = "macos"))]
    #[test]
    fn test_unprivileged_step_is_refused() {
        // SAFETY: geteuid has no preconditions
        if unsafe { libc::geteuid() } == 0 {
            return;
        }
        let clock = SystemClock;
        assert_eq!(clock.step(clock.now()), Err(ClockError::PermissionDenied));
    }
}
