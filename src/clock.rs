//! Clock sources and wall-clock formatting helpers.

use std::{fmt::Display, fmt::Write, time::Duration};

use chrono::Local;

use crate::errors::{ClockError, OsBoundaryError};

/// Clock a timer counts down against.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ClockSource {
    /// Settable system-wide wall clock.
    #[default]
    Realtime,
    /// Clock that cannot be set and only moves forward.
    Monotonic,
}

impl ClockSource {
    pub fn clock_id(&self) -> libc::clockid_t {
        match self {
            ClockSource::Realtime => libc::CLOCK_REALTIME,
            ClockSource::Monotonic => libc::CLOCK_MONOTONIC,
        }
    }
    pub fn now(&self) -> Result<Duration, OsBoundaryError> {
        read_clock(self.clock_id())
    }
    pub fn resolution(&self) -> Result<Duration, OsBoundaryError> {
        let mut res = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        if unsafe { libc::clock_getres(self.clock_id(), &mut res) } == -1 {
            return Err(OsBoundaryError::last("clock_getres"));
        }
        Ok(to_duration(&res))
    }
}

impl Display for ClockSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Realtime => write!(f, "realtime"),
            Self::Monotonic => write!(f, "monotonic"),
        }
    }
}

/// CPU-time clock of a process.
#[derive(Clone, Copy, Debug)]
pub struct CpuClock {
    pid: libc::pid_t,
    id: libc::clockid_t,
}

impl CpuClock {
    pub fn for_pid(pid: libc::pid_t) -> Result<Self, OsBoundaryError> {
        let mut id: libc::clockid_t = 0;
        // returns the error number instead of setting errno
        let rc = unsafe { libc::clock_getcpuclockid(pid, &mut id) };
        if rc != 0 {
            return Err(OsBoundaryError::from_errno("clock_getcpuclockid", rc));
        }
        Ok(Self { pid, id })
    }
    pub fn pid(&self) -> libc::pid_t {
        self.pid
    }
    pub fn clock_id(&self) -> libc::clockid_t {
        self.id
    }
    /// CPU time consumed so far by the process.
    pub fn now(&self) -> Result<Duration, OsBoundaryError> {
        read_clock(self.id)
    }
}

/// Formats the current local time with a strftime-style format, e.g. `"%T"`.
pub fn format_now(format: &str) -> Result<String, ClockError> {
    let mut out = String::new();
    write!(out, "{}", Local::now().format(format))
        .map_err(|_| ClockError::InvalidFormat(format.to_string()))?;
    Ok(out)
}

fn read_clock(id: libc::clockid_t) -> Result<Duration, OsBoundaryError> {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    if unsafe { libc::clock_gettime(id, &mut ts) } == -1 {
        return Err(OsBoundaryError::last("clock_gettime"));
    }
    Ok(to_duration(&ts))
}

pub(crate) fn to_duration(ts: &libc::timespec) -> Duration {
    Duration::new(ts.tv_sec.max(0) as u64, ts.tv_nsec.clamp(0, 999_999_999) as u32)
}

pub(crate) fn to_timespec(d: Duration) -> libc::timespec {
    libc::timespec {
        tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
        tv_nsec: d.subsec_nanos() as _,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_now() {
        let t = format_now("%T").unwrap();
        assert_eq!(t.len(), 8);
        assert_eq!(t.as_bytes()[2], b':');
        assert!(format_now("%Q").is_err());
    }

    #[test]
    fn test_monotonic_moves_forward() {
        let a = ClockSource::Monotonic.now().unwrap();
        let b = ClockSource::Monotonic.now().unwrap();
        assert!(b >= a);
        assert!(ClockSource::Realtime.resolution().unwrap() > Duration::ZERO);
    }

    #[test]
    fn test_own_cpu_clock() {
        let clock = CpuClock::for_pid(0).unwrap();
        assert_eq!(clock.pid(), 0);
        assert!(clock.now().is_ok());
    }

    #[test]
    fn test_timespec_conversion() {
        let d = Duration::new(5, 5_000_000);
        assert_eq!(to_duration(&to_timespec(d)), d);
    }
}
