//! Signal-driven POSIX timers (`timer_create` with `SIGEV_SIGNAL`).
//!
//! Each timer owns a slot in a process-wide notification table. The slot index travels
//! as the `sigev_value` payload. The signal handler only updates the slot's atomic
//! counters and pokes the self-pipe of the [`PosixTimers`] that created the timer;
//! [`PosixTimers::wait`](crate::TimerBackend::wait) turns that backend's counters into
//! [`NotificationEvent`]s on the dispatcher's thread.

use std::{
    io, mem,
    os::fd::RawFd,
    ptr,
    sync::{
        Mutex, MutexGuard, OnceLock,
        atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering},
    },
};

use libc::{c_int, c_void};
use log::{debug, warn};

use crate::{
    Interval,
    backend::{NotificationEvent, NotifySpec, OsTimerId, TimerBackend, Wakeup},
    clock::{ClockSource, to_timespec},
    config::RegistryConfig,
    errors::OsBoundaryError,
    timer_table::TimerHandle,
};

/// Live [`PosixTimers`] instances a process can hold at once.
pub const MAX_LISTENERS: usize = 16;

const TERMINATION_SIGNALS: [c_int; 2] = [libc::SIGINT, libc::SIGTERM];

static TABLE: OnceLock<NotifyTable> = OnceLock::new();

/// `si_code` of a signal raised by a POSIX timer expiration.
const SI_TIMER: c_int = -2;

#[derive(Default)]
struct Slot {
    claimed: AtomicBool,
    /// Raw [`TimerHandle`] of the live timer, zero while notifications must be ignored.
    token: AtomicU64,
    /// Index of the listener that created the timer.
    owner: AtomicUsize,
    timer: AtomicUsize,
    signal: AtomicI32,
    fired: AtomicU64,
    overrun: AtomicU64,
}

impl Slot {
    fn timer(&self) -> libc::timer_t {
        self.timer.load(Ordering::Acquire) as libc::timer_t
    }
    fn release(&self) {
        self.token.store(0, Ordering::Release);
        self.timer.store(0, Ordering::Release);
        self.fired.store(0, Ordering::Release);
        self.overrun.store(0, Ordering::Release);
        self.claimed.store(false, Ordering::Release);
    }
}

/// Wakeup channel of one [`PosixTimers`].
struct Listener {
    claimed: AtomicBool,
    /// Write end of the self-pipe, `-1` while unused.
    wake_write: AtomicI32,
    shutdown: AtomicI32,
}

impl Default for Listener {
    fn default() -> Self {
        Self {
            claimed: AtomicBool::new(false),
            wake_write: AtomicI32::new(-1),
            shutdown: AtomicI32::new(0),
        }
    }
}

impl Listener {
    /// Only async-signal-safe calls.
    fn wake(&self) {
        let fd = self.wake_write.load(Ordering::Acquire);
        if fd >= 0 {
            let byte = 1u8;
            unsafe { libc::write(fd, (&byte as *const u8).cast(), 1) };
        }
    }
}

struct NotifyTable {
    slots: Box<[Slot]>,
    listeners: Box<[Listener]>,
    stale: AtomicU64,
}

impl NotifyTable {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| Slot::default()).collect(),
            listeners: (0..MAX_LISTENERS).map(|_| Listener::default()).collect(),
            stale: AtomicU64::new(0),
        }
    }

    fn claim_listener(&self) -> Option<usize> {
        self.listeners.iter().position(|listener| {
            listener
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })
    }

    fn claim(&self, token: TimerHandle, owner: usize) -> Option<usize> {
        let index = self.slots.iter().position(|slot| {
            slot.claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        })?;
        let slot = &self.slots[index];
        slot.fired.store(0, Ordering::Release);
        slot.overrun.store(0, Ordering::Release);
        slot.owner.store(owner, Ordering::Release);
        slot.token.store(token.raw(), Ordering::Release);
        Some(index)
    }

    fn slot(&self, id: OsTimerId, call: &'static str) -> Result<&Slot, OsBoundaryError> {
        self.slots
            .get(id.raw())
            .filter(|slot| slot.claimed.load(Ordering::Acquire))
            .ok_or_else(|| OsBoundaryError::from_errno(call, libc::EINVAL))
    }

    /// Collects what is pending for `owner`. A termination request wins over timer
    /// events, which stay counted in their slots for a later call.
    ///
    /// Events come out grouped by slot, not in delivery order.
    fn drain(&self, owner: usize) -> Option<Wakeup> {
        let listener = &self.listeners[owner];
        match listener.shutdown.swap(0, Ordering::AcqRel) {
            0 => {}
            signal => return Some(Wakeup::Shutdown(signal)),
        }
        let mut events = Vec::new();
        let mut stale = self.stale.swap(0, Ordering::AcqRel);
        for slot in self.slots.iter() {
            if !slot.claimed.load(Ordering::Acquire) || slot.owner.load(Ordering::Acquire) != owner
            {
                continue;
            }
            let fired = slot.fired.swap(0, Ordering::AcqRel);
            if fired == 0 {
                continue;
            }
            let token = slot.token.load(Ordering::Acquire);
            if token == 0 {
                stale += fired;
                continue;
            }
            let signal = slot.signal.load(Ordering::Acquire);
            for _ in 0..fired {
                events.push(NotificationEvent::new(signal, TimerHandle::from_raw(token)));
            }
        }
        if stale > 0 {
            warn!("Dropped {stale} signals that matched no live timer");
        }
        (!events.is_empty()).then_some(Wakeup::Notifications(events))
    }
}

extern "C" fn on_timer_signal(_signal: c_int, info: *mut libc::siginfo_t, _ctx: *mut c_void) {
    let Some(table) = TABLE.get() else {
        return;
    };
    let errno = unsafe { *libc::__errno_location() };
    let info = unsafe { &*info };
    let slot = if info.si_code == SI_TIMER {
        let index = unsafe { info.si_value().sival_ptr } as usize;
        table
            .slots
            .get(index)
            .filter(|slot| slot.token.load(Ordering::Acquire) != 0)
    } else {
        None
    };
    match slot {
        Some(slot) => {
            let overrun = unsafe { libc::timer_getoverrun(slot.timer()) };
            if overrun > 0 {
                slot.overrun.fetch_add(overrun as u64, Ordering::AcqRel);
            }
            slot.fired.fetch_add(1, Ordering::AcqRel);
            if let Some(listener) = table.listeners.get(slot.owner.load(Ordering::Acquire)) {
                listener.wake();
            }
        }
        None => {
            table.stale.fetch_add(1, Ordering::AcqRel);
        }
    }
    unsafe { *libc::__errno_location() = errno };
}

extern "C" fn on_termination(signal: c_int) {
    let Some(table) = TABLE.get() else {
        return;
    };
    let errno = unsafe { *libc::__errno_location() };
    for listener in table.listeners.iter() {
        if listener.wake_write.load(Ordering::Acquire) >= 0 {
            listener.shutdown.store(signal, Ordering::Release);
            listener.wake();
        }
    }
    unsafe { *libc::__errno_location() = errno };
}

fn install_handler(
    signal: c_int,
    handler: usize,
    flags: c_int,
) -> Result<libc::sigaction, OsBoundaryError> {
    let mut sa: libc::sigaction = unsafe { mem::zeroed() };
    sa.sa_sigaction = handler;
    sa.sa_flags = flags | libc::SA_RESTART;
    unsafe { libc::sigemptyset(&mut sa.sa_mask) };
    let mut previous: libc::sigaction = unsafe { mem::zeroed() };
    if unsafe { libc::sigaction(signal, &sa, &mut previous) } == -1 {
        return Err(OsBoundaryError::last("sigaction"));
    }
    Ok(previous)
}

fn restore_handler(signal: c_int, previous: &libc::sigaction) {
    if unsafe { libc::sigaction(signal, previous, ptr::null_mut()) } == -1 {
        warn!(
            "Failed to restore handler for signal {signal}: {}",
            io::Error::last_os_error()
        );
    }
}

fn notify_table(capacity: usize) -> &'static NotifyTable {
    let table = TABLE.get_or_init(|| NotifyTable::new(capacity));
    if table.slots.len() != capacity {
        warn!(
            "Notification table already sized for {} timers, ignoring capacity {capacity}",
            table.slots.len()
        );
    }
    table
}

fn open_pipe() -> Result<(RawFd, RawFd), OsBoundaryError> {
    let mut fds: [c_int; 2] = [0; 2];
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } == -1 {
        return Err(OsBoundaryError::last("pipe2"));
    }
    // a full pipe must never block the signal handler
    let flags = unsafe { libc::fcntl(fds[1], libc::F_GETFL) };
    if flags == -1 || unsafe { libc::fcntl(fds[1], libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1
    {
        let err = OsBoundaryError::last("fcntl");
        unsafe {
            libc::close(fds[0]);
            libc::close(fds[1]);
        }
        return Err(err);
    }
    Ok((fds[0], fds[1]))
}

#[derive(Default)]
struct Termination {
    depth: usize,
    previous: Vec<(c_int, libc::sigaction)>,
}

/// [`TimerBackend`] over `timer_create`/`timer_settime` with signal notification.
///
/// Instances share one process-wide slot table, sized by the first [`RegistryConfig`]
/// used, but each has its own wakeup pipe and only ever sees its own timers. At most
/// [`MAX_LISTENERS`] instances can be alive at once.
pub struct PosixTimers {
    table: &'static NotifyTable,
    listener: usize,
    wake_read: RawFd,
    wake_write: RawFd,
    handle_termination: bool,
    installed: Mutex<Vec<c_int>>,
    termination: Mutex<Termination>,
}

impl PosixTimers {
    /// Sets up the notification table and installs the handler for the configured signal.
    ///
    /// SIGINT/SIGTERM handlers, when enabled, are only installed while a dispatcher waits.
    pub fn new(config: &RegistryConfig) -> Result<Self, OsBoundaryError> {
        let table = notify_table(config.get_capacity());
        let listener = table
            .claim_listener()
            .ok_or_else(|| OsBoundaryError::from_errno("pipe2", libc::EAGAIN))?;
        let (wake_read, wake_write) = match open_pipe() {
            Ok(fds) => fds,
            Err(e) => {
                table.listeners[listener]
                    .claimed
                    .store(false, Ordering::Release);
                return Err(e);
            }
        };
        table.listeners[listener]
            .shutdown
            .store(0, Ordering::Release);
        table.listeners[listener]
            .wake_write
            .store(wake_write, Ordering::Release);
        let timers = Self {
            table,
            listener,
            wake_read,
            wake_write,
            handle_termination: config.is_termination_handled(),
            installed: Mutex::new(Vec::new()),
            termination: Mutex::new(Termination::default()),
        };
        timers.ensure_installed(config.get_signal())?;
        Ok(timers)
    }

    fn ensure_installed(&self, signal: c_int) -> Result<(), OsBoundaryError> {
        let mut installed = lock(&self.installed);
        if !installed.contains(&signal) {
            install_handler(signal, on_timer_signal as usize, libc::SA_SIGINFO)?;
            debug!("Installed timer handler for signal {signal}");
            installed.push(signal);
        }
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Drop for PosixTimers {
    fn drop(&mut self) {
        let listener = &self.table.listeners[self.listener];
        listener.wake_write.store(-1, Ordering::Release);
        listener.shutdown.store(0, Ordering::Release);
        unsafe {
            libc::close(self.wake_read);
            libc::close(self.wake_write);
        }
        listener.claimed.store(false, Ordering::Release);
    }
}

impl TimerBackend for PosixTimers {
    fn create(&self, clock: ClockSource, spec: NotifySpec) -> Result<OsTimerId, OsBoundaryError> {
        self.ensure_installed(spec.signal)?;
        let index = self
            .table
            .claim(spec.token, self.listener)
            .ok_or_else(|| OsBoundaryError::from_errno("timer_create", libc::EAGAIN))?;
        let slot = &self.table.slots[index];
        slot.signal.store(spec.signal, Ordering::Release);

        let mut sev: libc::sigevent = unsafe { mem::zeroed() };
        sev.sigev_notify = libc::SIGEV_SIGNAL;
        sev.sigev_signo = spec.signal;
        sev.sigev_value = libc::sigval {
            sival_ptr: index as *mut c_void,
        };
        let mut timer: libc::timer_t = ptr::null_mut();
        if unsafe { libc::timer_create(clock.clock_id(), &mut sev, &mut timer) } == -1 {
            let err = OsBoundaryError::last("timer_create");
            slot.release();
            return Err(err);
        }
        slot.timer.store(timer as usize, Ordering::Release);
        Ok(OsTimerId::new(index))
    }

    fn set(&self, id: OsTimerId, interval: &Interval) -> Result<(), OsBoundaryError> {
        let slot = self.table.slot(id, "timer_settime")?;
        let spec = libc::itimerspec {
            it_interval: to_timespec(interval.repeat()),
            it_value: to_timespec(interval.initial()),
        };
        if unsafe { libc::timer_settime(slot.timer(), 0, &spec, ptr::null_mut()) } == -1 {
            return Err(OsBoundaryError::last("timer_settime"));
        }
        // expirations of the previous setting are not reported against the new one
        slot.fired.store(0, Ordering::Release);
        slot.overrun.store(0, Ordering::Release);
        Ok(())
    }

    fn delete(&self, id: OsTimerId) -> Result<(), OsBoundaryError> {
        let slot = self.table.slot(id, "timer_delete")?;
        // in-flight signals for this slot now count as stale
        slot.token.store(0, Ordering::Release);
        let rc = unsafe { libc::timer_delete(slot.timer()) };
        let err = (rc == -1).then(|| OsBoundaryError::last("timer_delete"));
        slot.release();
        err.map_or(Ok(()), Err)
    }

    fn overrun(&self, id: OsTimerId) -> u64 {
        self.table
            .slots
            .get(id.raw())
            .map(|slot| slot.overrun.swap(0, Ordering::AcqRel))
            .unwrap_or(0)
    }

    fn wait(&self) -> Result<Wakeup, OsBoundaryError> {
        let mut buf = [0u8; 64];
        loop {
            if let Some(wakeup) = self.table.drain(self.listener) {
                return Ok(wakeup);
            }
            let n = unsafe { libc::read(self.wake_read, buf.as_mut_ptr().cast(), buf.len()) };
            if n == -1 {
                let err = io::Error::last_os_error();
                if err.kind() != io::ErrorKind::Interrupted {
                    return Err(OsBoundaryError::new("read", err));
                }
            }
        }
    }

    fn enter_dispatch(&self) -> Result<(), OsBoundaryError> {
        if !self.handle_termination {
            return Ok(());
        }
        let mut termination = lock(&self.termination);
        if termination.depth == 0 {
            for signal in TERMINATION_SIGNALS {
                match install_handler(signal, on_termination as usize, 0) {
                    Ok(previous) => termination.previous.push((signal, previous)),
                    Err(e) => {
                        for (signal, previous) in termination.previous.drain(..) {
                            restore_handler(signal, &previous);
                        }
                        return Err(e);
                    }
                }
            }
        }
        termination.depth += 1;
        Ok(())
    }

    fn leave_dispatch(&self) -> Option<i32> {
        if self.handle_termination {
            let mut termination = lock(&self.termination);
            termination.depth = termination.depth.saturating_sub(1);
            if termination.depth == 0 {
                // default dispositions are back before the last request is read
                for (signal, previous) in termination.previous.drain(..) {
                    restore_handler(signal, &previous);
                }
            }
        }
        match self.table.listeners[self.listener]
            .shutdown
            .swap(0, Ordering::AcqRel)
        {
            0 => None,
            signal => Some(signal),
        }
    }
}
