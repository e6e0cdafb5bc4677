mod backend;
pub mod clock;
mod config;
mod dispatch_loop;
mod errors;
mod interval;
mod posix;
#[cfg(test)]
mod test;
mod timer_table;

pub use backend::{ManualBackend, NotificationEvent, NotifySpec, OsTimerId, TimerBackend, Wakeup};
pub use clock::ClockSource;
pub use config::{DEFAULT_CAPACITY, RegistryConfig};
pub use dispatch_loop::{Dispatcher, Stop};
pub use errors::{ClockError, OsBoundaryError, ParseError, SpecField, TimerError};
pub use interval::{Interval, parse};
pub use posix::{MAX_LISTENERS, PosixTimers};
pub use timer_table::{
    TimerHandle, TimerPayload, TimerRecord, TimerRegistry, TimerRegistryBuilder, TimerState,
};

pub mod prelude {
    pub use super::{
        ClockSource, Dispatcher, Interval, NotificationEvent, RegistryConfig, Stop, TimerError,
        TimerHandle, TimerRecord, TimerRegistry, parse,
    };
}
