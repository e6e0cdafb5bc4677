pub use handle::{TimerHandle, TimerPayload};
pub use main_type::{TimerRegistry, TimerRegistryBuilder};
pub use timer_record::{TimerRecord, TimerState};

mod main_type {
    use std::{
        fmt::Debug,
        marker::PhantomData,
        sync::{
            Arc,
            atomic::{AtomicU64, Ordering},
        },
        time::Duration,
    };

    use dashmap::DashMap;
    use log::{debug, warn};

    use crate::{
        Interval,
        backend::{NotificationEvent, NotifySpec, OsTimerId, TimerBackend},
        clock::ClockSource,
        config::RegistryConfig,
        dispatch_loop::Dispatcher,
        errors::TimerError,
        interval::parse,
        posix::PosixTimers,
    };

    use super::{
        handle::{TimerHandle, TimerPayload},
        timer_record::{TimerRecord, TimerState},
    };

    type ExpirationCallback<P> =
        Arc<dyn Fn(&TimerRecord<P>, &NotificationEvent) + Send + Sync + 'static>;

    struct Entry<P: TimerPayload> {
        record: TimerRecord<P>,
        os_id: OsTimerId,
    }

    struct RegistryInner<P: TimerPayload> {
        records: DashMap<TimerHandle, Entry<P>>,
        backend: Arc<dyn TimerBackend>,
        on_expiration: ExpirationCallback<P>,
        config: RegistryConfig,
        next_order: AtomicU64,
    }

    impl<P: TimerPayload> Drop for RegistryInner<P> {
        fn drop(&mut self) {
            for entry in self.records.iter() {
                if let Err(e) = self.backend.delete(entry.os_id) {
                    warn!("Failed to release timer {} on teardown: {e}", entry.key());
                }
            }
            self.records.clear();
        }
    }

    pub struct TimerRegistryBuilder<P: TimerPayload> {
        on_expiration: Option<ExpirationCallback<P>>,
        backend: Option<Arc<dyn TimerBackend>>,
        config: RegistryConfig,
        phantom_data: PhantomData<P>,
    }
    impl<P: TimerPayload> TimerRegistryBuilder<P> {
        /// Callback invoked once per delivered expiration, from the dispatcher's context.
        pub fn on_expiration(
            &mut self,
            callback: impl Fn(&TimerRecord<P>, &NotificationEvent) + Send + Sync + 'static,
        ) -> &mut Self {
            self.on_expiration = Some(Arc::new(callback));
            self
        }
        /// Replaces the default signal-driven [`PosixTimers`] backend.
        pub fn backend(&mut self, backend: Arc<dyn TimerBackend>) -> &mut Self {
            self.backend = Some(backend);
            self
        }
        pub fn build(&mut self) -> Result<TimerRegistry<P>, TimerError> {
            let Some(on_expiration) = self.on_expiration.take() else {
                return Err(TimerError::BuildErrorNoCallbackSet);
            };
            let backend: Arc<dyn TimerBackend> = match self.backend.take() {
                Some(backend) => backend,
                None => Arc::new(PosixTimers::new(&self.config)?),
            };
            Ok(TimerRegistry {
                inner: Arc::new(RegistryInner {
                    records: DashMap::new(),
                    backend,
                    on_expiration,
                    config: std::mem::take(&mut self.config),
                    next_order: AtomicU64::new(0),
                }),
            })
        }
    }

    /// Owns every armed timer and resolves OS expirations back to their records.
    ///
    /// Clones share the same table. Timers still registered when the last clone is
    /// dropped are released.
    pub struct TimerRegistry<P: TimerPayload> {
        inner: Arc<RegistryInner<P>>,
    }
    impl<P: TimerPayload> Clone for TimerRegistry<P> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl<P: TimerPayload> TimerRegistry<P> {
        /// Creates a new [`TimerRegistryBuilder<P>`] to configure and build a [`TimerRegistry<P>`].
        ///
        /// `P` is the payload stored with every timer and handed back to the expiration
        /// callback.
        ///
        /// ### Example
        /// ```rust,no_run
        /// use sigtimer::{RegistryConfig, TimerRegistry};
        ///
        /// let registry = TimerRegistry::<u32>::new(RegistryConfig::default())
        ///     .on_expiration(|record, event| {
        ///         println!("signal {} for payload {}", event.signal(), record.payload());
        ///     })
        ///     .build()
        ///     .unwrap();
        /// registry.arm("5:2".parse().unwrap(), 1234).unwrap();
        /// ```
        pub fn new(config: RegistryConfig) -> TimerRegistryBuilder<P> {
            TimerRegistryBuilder {
                on_expiration: None,
                backend: None,
                config,
                phantom_data: PhantomData::<P>,
            }
        }

        pub fn config(&self) -> &RegistryConfig {
            &self.inner.config
        }

        /// Arms a timer on the configured default clock.
        pub fn arm(&self, interval: Interval, payload: P) -> Result<TimerHandle, TimerError> {
            self.arm_with_clock(self.inner.config.get_clock(), interval, payload)
        }

        /// Creates an OS timer on `clock`, registers its record and starts it.
        ///
        /// A zero initial expiration is refused with [`TimerError::InvalidInterval`] unless
        /// [`RegistryConfig::allow_immediate_expiration`] is set, since the OS would read it
        /// as "disarmed".
        pub fn arm_with_clock(
            &self,
            clock: ClockSource,
            interval: Interval,
            payload: P,
        ) -> Result<TimerHandle, TimerError> {
            let interval = self.checked_interval(interval)?;
            let inner = &self.inner;
            let handle = TimerHandle::next();
            let spec = NotifySpec {
                signal: inner.config.get_signal(),
                token: handle,
            };
            let os_id = inner
                .backend
                .create(clock, spec)
                .map_err(TimerError::from_os)?;
            let creation_order = inner.next_order.fetch_add(1, Ordering::Relaxed);

            // registered before arming so the first expiration always resolves
            inner.records.insert(
                handle,
                Entry {
                    record: TimerRecord::new(handle, interval, clock, payload, creation_order),
                    os_id,
                },
            );
            if let Err(e) = inner.backend.set(os_id, &interval) {
                inner.records.remove(&handle);
                if let Err(del) = inner.backend.delete(os_id) {
                    warn!("Failed to release timer {handle} after arming error: {del}");
                }
                return Err(TimerError::from_os(e));
            }
            debug!("Armed timer {handle} [{interval}] on {clock} clock, os id {os_id}");
            Ok(handle)
        }

        /// Parses and arms each spec in order, stopping at the first malformed one.
        ///
        /// Timers armed before the failing spec stay armed. `payload` receives the spec's
        /// index and parsed interval.
        pub fn arm_specs<S: AsRef<str>>(
            &self,
            specs: &[S],
            mut payload: impl FnMut(usize, &Interval) -> P,
        ) -> Result<Vec<TimerHandle>, TimerError> {
            let mut handles = Vec::with_capacity(specs.len());
            for (index, spec) in specs.iter().enumerate() {
                let interval =
                    parse(spec.as_ref()).map_err(|source| TimerError::Parse { index, source })?;
                let p = payload(index, &interval);
                handles.push(self.arm(interval, p)?);
            }
            Ok(handles)
        }

        /// Restarts an armed or expired timer with a new interval.
        pub fn rearm(&self, handle: TimerHandle, interval: Interval) -> Result<(), TimerError> {
            let interval = self.checked_interval(interval)?;
            let mut entry = self
                .inner
                .records
                .get_mut(&handle)
                .ok_or(TimerError::UnknownHandle(handle))?;
            self.inner
                .backend
                .set(entry.os_id, &interval)
                .map_err(TimerError::from_os)?;
            entry.record.interval = interval;
            entry.record.state = TimerState::Armed;
            debug!("Re-armed timer {handle} [{interval}]");
            Ok(())
        }

        /// Disarms and releases a timer. A notification already in flight for it is dropped.
        pub fn cancel(&self, handle: TimerHandle) -> Result<(), TimerError> {
            let (_, entry) = self
                .inner
                .records
                .remove(&handle)
                .ok_or(TimerError::UnknownHandle(handle))?;
            if let Err(e) = self.inner.backend.delete(entry.os_id) {
                self.inner.records.insert(handle, entry);
                return Err(TimerError::from_os(e));
            }
            debug!("Canceled timer {handle}");
            Ok(())
        }

        /// Cancels every timer, in creation order. Keeps going past failures and reports
        /// the first one.
        pub fn shutdown(&self) -> Result<(), TimerError> {
            let mut first_err = None;
            for handle in self.handles() {
                match self.cancel(handle) {
                    Ok(()) | Err(TimerError::UnknownHandle(_)) => {}
                    Err(e) => {
                        warn!("Failed to cancel timer {handle}: {e}");
                        first_err.get_or_insert(e);
                    }
                }
            }
            first_err.map_or(Ok(()), Err)
        }

        /// Resolves an expiration to its record and runs the expiration callback.
        ///
        /// Notifications for unknown, canceled or already expired timers are dropped.
        pub fn on_notification(&self, event: &NotificationEvent) {
            let handle = event.payload();
            let snapshot = {
                let Some(mut entry) = self.inner.records.get_mut(&handle) else {
                    warn!(
                        "Dropping signal {} notification for unknown timer {handle}",
                        event.signal()
                    );
                    return;
                };
                if entry.record.state != TimerState::Armed {
                    debug!("Dropping notification for expired timer {handle}");
                    return;
                }
                let overrun = self.inner.backend.overrun(entry.os_id);
                let record = &mut entry.record;
                record.overrun_count += overrun;
                record.notifications += 1;
                if record.interval.is_one_shot() {
                    record.state = TimerState::Expired;
                }
                record.clone()
            };
            // map guard released, the callback may arm or cancel
            (*self.inner.on_expiration)(&snapshot, event);
        }

        pub fn get(&self, handle: TimerHandle) -> Option<TimerRecord<P>> {
            self.inner.records.get(&handle).map(|e| e.record.clone())
        }

        pub fn contains(&self, handle: TimerHandle) -> bool {
            self.inner.records.contains_key(&handle)
        }

        /// Live handles sorted by creation order.
        pub fn handles(&self) -> Vec<TimerHandle> {
            let mut ordered: Vec<(u64, TimerHandle)> = self
                .inner
                .records
                .iter()
                .map(|e| (e.record.creation_order, *e.key()))
                .collect();
            ordered.sort_unstable();
            ordered.into_iter().map(|(_, h)| h).collect()
        }

        pub fn len(&self) -> usize {
            self.inner.records.len()
        }

        pub fn is_empty(&self) -> bool {
            self.inner.records.is_empty()
        }

        /// Number of timers that can still expire.
        pub fn armed_count(&self) -> usize {
            self.inner
                .records
                .iter()
                .filter(|e| e.record.state == TimerState::Armed)
                .count()
        }

        pub fn dispatcher(&self) -> Dispatcher<P> {
            Dispatcher::new(self.clone())
        }

        pub(crate) fn backend(&self) -> &Arc<dyn TimerBackend> {
            &self.inner.backend
        }

        fn checked_interval(&self, interval: Interval) -> Result<Interval, TimerError> {
            if !interval.initial().is_zero() {
                return Ok(interval);
            }
            if !self.inner.config.is_immediate_expiration_allowed() {
                return Err(TimerError::InvalidInterval);
            }
            // smallest non-zero expiration, fires on the next clock tick
            Ok(interval.with_initial(Duration::from_nanos(1)))
        }
    }

    impl<P: TimerPayload + Debug> Debug for TimerRegistry<P> {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("TimerRegistry")
                .field("config", &self.inner.config)
                .field("timers", &self.len())
                .finish()
        }
    }
}

mod timer_record {
    use crate::{Interval, clock::ClockSource};

    use super::handle::{TimerHandle, TimerPayload};

    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub enum TimerState {
        /// Counting down, or periodic and still running.
        Armed,
        /// One-shot timer whose single expiration was delivered.
        Expired,
    }

    /// Registry metadata of one OS timer.
    ///
    /// Callbacks receive a snapshot taken when the notification was resolved.
    #[derive(Clone, Debug)]
    pub struct TimerRecord<P: TimerPayload> {
        pub(crate) handle: TimerHandle,
        pub(crate) interval: Interval,
        pub(crate) clock: ClockSource,
        pub(crate) payload: P,
        pub(crate) overrun_count: u64,
        pub(crate) creation_order: u64,
        pub(crate) notifications: u64,
        pub(crate) state: TimerState,
    }

    impl<P: TimerPayload> TimerRecord<P> {
        pub(crate) fn new(
            handle: TimerHandle,
            interval: Interval,
            clock: ClockSource,
            payload: P,
            creation_order: u64,
        ) -> Self {
            Self {
                handle,
                interval,
                clock,
                payload,
                overrun_count: 0,
                creation_order,
                notifications: 0,
                state: TimerState::Armed,
            }
        }
        pub fn handle(&self) -> TimerHandle {
            self.handle
        }
        pub fn interval(&self) -> Interval {
            self.interval
        }
        pub fn clock(&self) -> ClockSource {
            self.clock
        }
        pub fn payload(&self) -> &P {
            &self.payload
        }
        /// Total expirations the OS reported as missed across all notifications.
        pub fn overrun_count(&self) -> u64 {
            self.overrun_count
        }
        pub fn creation_order(&self) -> u64 {
            self.creation_order
        }
        /// Notifications delivered so far, including the one being handled.
        pub fn notifications(&self) -> u64 {
            self.notifications
        }
        pub fn state(&self) -> TimerState {
            self.state
        }
    }
}

mod handle {
    use std::{
        fmt::Display,
        sync::atomic::{AtomicU64, Ordering},
    };

    /// Zero stays free to mark a slot with no live timer.
    static NEXT_HANDLE: AtomicU64 = AtomicU64::new(1);

    /// Opaque identity of a timer, never reused within the process, even across
    /// [`TimerRegistry`](crate::TimerRegistry) instances.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
    pub struct TimerHandle(u64);

    impl TimerHandle {
        pub(crate) fn next() -> Self {
            Self(NEXT_HANDLE.fetch_add(1, Ordering::Relaxed))
        }
        pub(crate) fn from_raw(raw: u64) -> Self {
            Self(raw)
        }
        pub fn raw(&self) -> u64 {
            self.0
        }
    }

    impl Display for TimerHandle {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{}", self.0)
        }
    }

    /// Data stored with a timer and handed back on each expiration.
    ///
    /// Implemented for every `Clone + Send + Sync + 'static` type, so plain integers,
    /// strings or `Arc`s all work.
    pub trait TimerPayload: Clone + Send + Sync + 'static {}

    impl<T: Clone + Send + Sync + 'static> TimerPayload for T {}
}
