use std::{fmt::Display, io};

use thiserror::Error;

use crate::TimerHandle;

/// Field of an interval spec that failed to parse.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpecField {
    InitialSecs,
    InitialNanos,
    RepeatSecs,
    RepeatNanos,
}

impl Display for SpecField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SpecField::InitialSecs => write!(f, "initial seconds"),
            SpecField::InitialNanos => write!(f, "initial nanoseconds"),
            SpecField::RepeatSecs => write!(f, "interval seconds"),
            SpecField::RepeatNanos => write!(f, "interval nanoseconds"),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("invalid number in {0}")]
    InvalidNumber(SpecField),
    #[error("negative value in {0}")]
    NegativeValue(SpecField),
    #[error("{0} must be below 1000000000")]
    NanosecondsOutOfRange(SpecField),
}

/// A failed call across the OS boundary, with the `errno` it reported.
#[derive(Debug, Error)]
#[error("{call} failed")]
pub struct OsBoundaryError {
    call: &'static str,
    #[source]
    source: io::Error,
}

impl OsBoundaryError {
    pub fn new(call: &'static str, source: io::Error) -> Self {
        Self { call, source }
    }
    /// Builds the error from the calling thread's current `errno`.
    pub fn last(call: &'static str) -> Self {
        Self::new(call, io::Error::last_os_error())
    }
    pub fn from_errno(call: &'static str, errno: i32) -> Self {
        Self::new(call, io::Error::from_raw_os_error(errno))
    }
    pub fn call(&self) -> &'static str {
        self.call
    }
    pub fn io_error(&self) -> &io::Error {
        &self.source
    }
    /// `true` when the OS refused to allocate another timer.
    pub fn is_resource_exhausted(&self) -> bool {
        matches!(
            self.source.raw_os_error(),
            Some(libc::EAGAIN) | Some(libc::ENOMEM)
        )
    }
}

#[derive(Debug, Error)]
pub enum TimerError {
    #[error("no timer available")]
    ResourceExhausted(#[source] OsBoundaryError),
    #[error("initial expiration of zero would leave the timer disarmed")]
    InvalidInterval,
    #[error("unknown timer handle {0}")]
    UnknownHandle(TimerHandle),
    #[error("spec #{index} is malformed")]
    Parse {
        index: usize,
        #[source]
        source: ParseError,
    },
    #[error(transparent)]
    Os(#[from] OsBoundaryError),
    #[error("timer registry : build error, no expiration callback set")]
    BuildErrorNoCallbackSet,
    #[error("timer registry : build error, no timer backend set")]
    BuildErrorNoBackendSet,
}

impl TimerError {
    /// Sorts an OS failure into resource exhaustion or plain passthrough.
    pub(crate) fn from_os(err: OsBoundaryError) -> Self {
        if err.is_resource_exhausted() {
            TimerError::ResourceExhausted(err)
        } else {
            TimerError::Os(err)
        }
    }
}

#[derive(Debug, Error)]
pub enum ClockError {
    #[error("invalid time format string {0:?}")]
    InvalidFormat(String),
    #[error(transparent)]
    Os(#[from] OsBoundaryError),
}
