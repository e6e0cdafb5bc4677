use std::thread::JoinHandle;

use log::{debug, info};

use crate::{
    backend::{TimerBackend, Wakeup},
    errors::OsBoundaryError,
    timer_table::{TimerPayload, TimerRegistry},
};

/// Why a dispatcher loop returned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Stop {
    /// A termination signal (SIGINT, SIGTERM) was caught.
    Terminated(i32),
    /// No timer was left armed.
    Idle,
}

/// Drains OS notifications and feeds them to [`TimerRegistry::on_notification`].
///
/// The signal handler only records that an expiration happened; resolving it, updating
/// the record and running the user callback all happen here, in ordinary thread context.
pub struct Dispatcher<P: TimerPayload> {
    registry: TimerRegistry<P>,
}

impl<P: TimerPayload> Dispatcher<P> {
    pub fn new(registry: TimerRegistry<P>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &TimerRegistry<P> {
        &self.registry
    }

    /// Blocks dispatching notifications until a termination signal arrives.
    pub fn run(&self) -> Result<Stop, OsBoundaryError> {
        self.dispatch(false)
    }

    /// Like [`Dispatcher::run`], but also returns once every timer has expired or been
    /// canceled.
    pub fn run_until_idle(&self) -> Result<Stop, OsBoundaryError> {
        self.dispatch(true)
    }

    /// Runs [`Dispatcher::run`] on a separate thread.
    pub fn spawn(self) -> JoinHandle<Result<Stop, OsBoundaryError>> {
        std::thread::spawn(move || self.run())
    }

    fn dispatch(&self, stop_when_idle: bool) -> Result<Stop, OsBoundaryError> {
        info!(
            "Dispatching timer notifications for {} timers",
            self.registry.len()
        );
        let backend = self.registry.backend().clone();
        backend.enter_dispatch()?;
        let stop = self.dispatch_loop(backend.as_ref(), stop_when_idle);
        match (backend.leave_dispatch(), stop) {
            // caught after the last wakeup was read
            (Some(signal), Ok(Stop::Idle)) => {
                info!("Caught termination signal {signal}, dispatcher stopping");
                Ok(Stop::Terminated(signal))
            }
            (_, stop) => stop,
        }
    }

    fn dispatch_loop(
        &self,
        backend: &dyn TimerBackend,
        stop_when_idle: bool,
    ) -> Result<Stop, OsBoundaryError> {
        loop {
            if stop_when_idle && self.registry.armed_count() == 0 {
                info!("No timer left armed, dispatcher stopping");
                return Ok(Stop::Idle);
            }
            match backend.wait()? {
                Wakeup::Notifications(events) => {
                    debug!("Dispatching {} notifications", events.len());
                    for event in &events {
                        self.registry.on_notification(event);
                    }
                }
                Wakeup::Shutdown(signal) => {
                    info!("Caught termination signal {signal}, dispatcher stopping");
                    return Ok(Stop::Terminated(signal));
                }
            }
        }
    }
}
