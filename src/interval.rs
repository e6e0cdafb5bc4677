//! Interval specs of the form `secs[/nsecs][:int-secs[/int-nsecs]]`.

use std::{fmt::Display, str::FromStr, time::Duration};

use crate::errors::{ParseError, SpecField};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Initial expiration and repeat period of a countdown timer.
///
/// A zero `repeat` makes the timer one-shot.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub struct Interval {
    initial: Duration,
    repeat: Duration,
}

impl Interval {
    pub const fn new(initial: Duration, repeat: Duration) -> Self {
        Self { initial, repeat }
    }
    pub const fn one_shot(initial: Duration) -> Self {
        Self::new(initial, Duration::ZERO)
    }
    pub const fn periodic(initial: Duration, repeat: Duration) -> Self {
        Self::new(initial, repeat)
    }
    pub fn initial(&self) -> Duration {
        self.initial
    }
    pub fn repeat(&self) -> Duration {
        self.repeat
    }
    pub fn is_one_shot(&self) -> bool {
        self.repeat.is_zero()
    }
    pub(crate) fn with_initial(self, initial: Duration) -> Self {
        Self { initial, ..self }
    }
}

/// Canonical `sec/nsec:sec/nsec` form, accepted back by [`parse`].
impl Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}/{}:{}/{}",
            self.initial.as_secs(),
            self.initial.subsec_nanos(),
            self.repeat.as_secs(),
            self.repeat.subsec_nanos()
        )
    }
}

impl FromStr for Interval {
    type Err = ParseError;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse(s)
    }
}

/// Parses `secs[/nsecs][:int-secs[/int-nsecs]]`.
///
/// Missing nanoseconds default to zero and a missing interval part yields a one-shot
/// interval. Every present field must be a non-negative base-10 integer.
pub fn parse(spec: &str) -> Result<Interval, ParseError> {
    let (initial, repeat) = match spec.split_once(':') {
        Some((initial, repeat)) => (initial, Some(repeat)),
        None => (spec, None),
    };
    let initial = parse_duration(initial, SpecField::InitialSecs, SpecField::InitialNanos)?;
    let repeat = match repeat {
        Some(repeat) => parse_duration(repeat, SpecField::RepeatSecs, SpecField::RepeatNanos)?,
        None => Duration::ZERO,
    };
    Ok(Interval::new(initial, repeat))
}

fn parse_duration(
    text: &str,
    secs_field: SpecField,
    nanos_field: SpecField,
) -> Result<Duration, ParseError> {
    let (secs, nanos) = match text.split_once('/') {
        Some((secs, nanos)) => (secs, Some(nanos)),
        None => (text, None),
    };
    let secs = parse_number(secs, secs_field)?;
    let nanos = match nanos {
        Some(nanos) => parse_number(nanos, nanos_field)?,
        None => 0,
    };
    if nanos >= NANOS_PER_SEC {
        return Err(ParseError::NanosecondsOutOfRange(nanos_field));
    }
    Ok(Duration::new(secs, nanos as u32))
}

fn parse_number(text: &str, field: SpecField) -> Result<u64, ParseError> {
    let digits = match text.strip_prefix('-') {
        Some(rest) if is_digits(rest) => return Err(ParseError::NegativeValue(field)),
        Some(_) => return Err(ParseError::InvalidNumber(field)),
        None => text,
    };
    if !is_digits(digits) {
        return Err(ParseError::InvalidNumber(field));
    }
    // only overflow can fail past the digit check
    digits.parse().map_err(|_| ParseError::InvalidNumber(field))
}

fn is_digits(text: &str) -> bool {
    !text.is_empty() && text.bytes().all(|b| b.is_ascii_digit())
}
