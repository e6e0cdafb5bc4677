pub use manual::ManualBackend;
pub use notification::{NotificationEvent, NotifySpec, OsTimerId, Wakeup};

use crate::{Interval, clock::ClockSource, errors::OsBoundaryError};

/// The operating-system side of a timer registry.
///
/// Implementations create countdown timers that report expirations carrying the
/// [`TimerHandle`](crate::TimerHandle) given in [`NotifySpec`], and hand those reports
/// back from [`TimerBackend::wait`]. `wait` runs in the dispatcher's context, never in
/// the context the OS delivers the expiration on.
pub trait TimerBackend: Send + Sync {
    fn create(&self, clock: ClockSource, spec: NotifySpec) -> Result<OsTimerId, OsBoundaryError>;
    /// Arms the timer, or disarms it when `interval.initial()` is zero.
    fn set(&self, id: OsTimerId, interval: &Interval) -> Result<(), OsBoundaryError>;
    fn delete(&self, id: OsTimerId) -> Result<(), OsBoundaryError>;
    /// Expirations missed since the previous call for this timer.
    fn overrun(&self, id: OsTimerId) -> u64;
    /// Blocks until at least one notification or a termination request is pending.
    /// A pending termination request is reported before any notification.
    fn wait(&self) -> Result<Wakeup, OsBoundaryError>;

    /// Called when a dispatcher starts waiting on this backend.
    fn enter_dispatch(&self) -> Result<(), OsBoundaryError> {
        Ok(())
    }

    /// Called when a dispatcher stops waiting. Returns a termination request that
    /// arrived but was not yet reported by [`TimerBackend::wait`].
    fn leave_dispatch(&self) -> Option<i32> {
        None
    }
}

mod notification {
    use std::fmt::Display;

    use chrono::{DateTime, Local};

    use crate::TimerHandle;

    /// Backend-specific identity of a created OS timer.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct OsTimerId(pub(crate) usize);

    impl OsTimerId {
        pub fn new(raw: usize) -> Self {
            Self(raw)
        }
        pub fn raw(&self) -> usize {
            self.0
        }
    }

    impl Display for OsTimerId {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /// How a timer reports expiration: the signal to raise and the payload to carry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct NotifySpec {
        pub signal: i32,
        pub token: TimerHandle,
    }

    /// One expiration as reported by the OS boundary.
    #[derive(Clone, Debug)]
    pub struct NotificationEvent {
        signal: i32,
        payload: TimerHandle,
        timestamp: DateTime<Local>,
    }

    impl NotificationEvent {
        pub fn new(signal: i32, payload: TimerHandle) -> Self {
            Self {
                signal,
                payload,
                timestamp: Local::now(),
            }
        }
        pub fn signal(&self) -> i32 {
            self.signal
        }
        pub fn payload(&self) -> TimerHandle {
            self.payload
        }
        pub fn timestamp(&self) -> DateTime<Local> {
            self.timestamp
        }
    }

    #[derive(Debug)]
    pub enum Wakeup {
        Notifications(Vec<NotificationEvent>),
        /// A termination signal was caught.
        Shutdown(i32),
    }
}

mod manual {
    use std::{
        collections::HashMap,
        sync::{
            Mutex, MutexGuard,
            atomic::{AtomicI32, Ordering},
        },
    };

    use crossbeam_channel::{Receiver, Sender, unbounded};

    use super::{NotificationEvent, NotifySpec, OsTimerId, TimerBackend, Wakeup};
    use crate::{Interval, TimerHandle, clock::ClockSource, errors::OsBoundaryError};

    struct ManualTimer {
        spec: NotifySpec,
        clock: ClockSource,
        interval: Interval,
        pending_overrun: u64,
    }

    impl ManualTimer {
        fn is_armed(&self) -> bool {
            !self.interval.initial().is_zero()
        }
    }

    #[derive(Default)]
    struct ManualState {
        next_id: usize,
        timers: HashMap<usize, ManualTimer>,
    }

    /// In-memory backend whose expirations are triggered by hand.
    ///
    /// Useful to drive a [`TimerRegistry`](crate::TimerRegistry) deterministically,
    /// without real clocks or signals.
    pub struct ManualBackend {
        state: Mutex<ManualState>,
        capacity: usize,
        shutdown: AtomicI32,
        sender: Sender<Wakeup>,
        receiver: Receiver<Wakeup>,
    }

    impl ManualBackend {
        pub fn new(capacity: usize) -> Self {
            let (sender, receiver) = unbounded();
            Self {
                state: Mutex::new(ManualState::default()),
                capacity,
                shutdown: AtomicI32::new(0),
                sender,
                receiver,
            }
        }

        fn state(&self) -> MutexGuard<'_, ManualState> {
            self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
        }

        fn find(state: &ManualState, token: TimerHandle) -> Option<usize> {
            state
                .timers
                .iter()
                .find(|(_, t)| t.spec.token == token)
                .map(|(id, _)| *id)
        }

        /// Simulates an expiration of the timer created for `token`, with `overrun`
        /// expirations missed before it. One-shot timers disarm themselves.
        ///
        /// Returns `false` when no armed timer carries `token`.
        pub fn fire(&self, token: TimerHandle, overrun: u64) -> bool {
            let mut state = self.state();
            let Some(id) = Self::find(&state, token) else {
                return false;
            };
            let Some(timer) = state.timers.get_mut(&id) else {
                return false;
            };
            if !timer.is_armed() {
                return false;
            }
            timer.pending_overrun += overrun;
            if timer.interval.is_one_shot() {
                timer.interval = Interval::default();
            }
            let event = NotificationEvent::new(timer.spec.signal, token);
            let _ = self.sender.send(Wakeup::Notifications(vec![event]));
            true
        }

        /// Delivers an arbitrary event, whether or not a timer backs it.
        pub fn inject(&self, event: NotificationEvent) {
            let _ = self.sender.send(Wakeup::Notifications(vec![event]));
        }

        /// Records a termination request. It is reported ahead of any expiration
        /// still queued.
        pub fn request_shutdown(&self, signal: i32) {
            self.shutdown.store(signal, Ordering::Release);
            let _ = self.sender.send(Wakeup::Shutdown(signal));
        }

        fn take_shutdown(&self) -> Option<i32> {
            match self.shutdown.swap(0, Ordering::AcqRel) {
                0 => None,
                signal => Some(signal),
            }
        }

        pub fn live_timers(&self) -> usize {
            self.state().timers.len()
        }

        pub fn is_armed(&self, token: TimerHandle) -> bool {
            let state = self.state();
            Self::find(&state, token)
                .and_then(|id| state.timers.get(&id))
                .is_some_and(ManualTimer::is_armed)
        }

        pub fn clock_of(&self, token: TimerHandle) -> Option<ClockSource> {
            let state = self.state();
            Self::find(&state, token)
                .and_then(|id| state.timers.get(&id))
                .map(|t| t.clock)
        }

        pub fn interval_of(&self, token: TimerHandle) -> Option<Interval> {
            let state = self.state();
            Self::find(&state, token)
                .and_then(|id| state.timers.get(&id))
                .map(|t| t.interval)
        }
    }

    impl TimerBackend for ManualBackend {
        fn create(
            &self,
            clock: ClockSource,
            spec: NotifySpec,
        ) -> Result<OsTimerId, OsBoundaryError> {
            let mut state = self.state();
            if state.timers.len() >= self.capacity {
                return Err(OsBoundaryError::from_errno("timer_create", libc::EAGAIN));
            }
            let id = state.next_id;
            state.next_id += 1;
            state.timers.insert(
                id,
                ManualTimer {
                    spec,
                    clock,
                    interval: Interval::default(),
                    pending_overrun: 0,
                },
            );
            Ok(OsTimerId(id))
        }

        fn set(&self, id: OsTimerId, interval: &Interval) -> Result<(), OsBoundaryError> {
            match self.state().timers.get_mut(&id.0) {
                Some(timer) => {
                    timer.interval = *interval;
                    Ok(())
                }
                None => Err(OsBoundaryError::from_errno("timer_settime", libc::EINVAL)),
            }
        }

        fn delete(&self, id: OsTimerId) -> Result<(), OsBoundaryError> {
            match self.state().timers.remove(&id.0) {
                Some(_) => Ok(()),
                None => Err(OsBoundaryError::from_errno("timer_delete", libc::EINVAL)),
            }
        }

        fn overrun(&self, id: OsTimerId) -> u64 {
            self.state()
                .timers
                .get_mut(&id.0)
                .map(|t| std::mem::take(&mut t.pending_overrun))
                .unwrap_or(0)
        }

        fn wait(&self) -> Result<Wakeup, OsBoundaryError> {
            loop {
                if let Some(signal) = self.take_shutdown() {
                    return Ok(Wakeup::Shutdown(signal));
                }
                match self.receiver.recv() {
                    // only a wakeup, the flag carries the request
                    Ok(Wakeup::Shutdown(_)) => continue,
                    Ok(wakeup) => return Ok(wakeup),
                    Err(_) => return Err(OsBoundaryError::from_errno("wait", libc::EPIPE)),
                }
            }
        }

        fn leave_dispatch(&self) -> Option<i32> {
            self.take_shutdown()
        }
    }
}
