use crate::clock::ClockSource;

/// Default number of simultaneously live timers the notification table can track.
pub const DEFAULT_CAPACITY: usize = 64;

#[derive(Clone, Debug)]
pub struct RegistryConfig {
    signal: i32,
    clock: ClockSource,
    capacity: usize,
    allow_immediate: bool,
    handle_termination: bool,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            signal: libc::SIGUSR1,
            clock: ClockSource::Realtime,
            capacity: DEFAULT_CAPACITY,
            allow_immediate: false,
            handle_termination: true,
        }
    }
}
impl RegistryConfig {
    pub fn new() -> Self {
        Self::default()
    }
    pub fn get_signal(&self) -> i32 {
        self.signal
    }
    pub fn get_clock(&self) -> ClockSource {
        self.clock
    }
    pub fn get_capacity(&self) -> usize {
        self.capacity
    }
    pub fn is_immediate_expiration_allowed(&self) -> bool {
        self.allow_immediate
    }
    pub fn is_termination_handled(&self) -> bool {
        self.handle_termination
    }
    /// Signal delivered on every expiration.
    pub fn signal(mut self, signal: i32) -> Self {
        self.signal = signal;
        self
    }
    /// Clock used by [`TimerRegistry::arm`](crate::TimerRegistry::arm).
    pub fn clock(mut self, clock: ClockSource) -> Self {
        self.clock = clock;
        self
    }
    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = capacity;
        self
    }
    /// Lets a zero initial expiration through; the timer then fires as soon as possible.
    pub fn allow_immediate_expiration(mut self, allow: bool) -> Self {
        self.allow_immediate = allow;
        self
    }
    /// When set, SIGINT and SIGTERM stop a waiting dispatcher loop instead of killing the
    /// process. Outside dispatch they keep their previous disposition.
    pub fn handle_termination(mut self, handle: bool) -> Self {
        self.handle_termination = handle;
        self
    }
}
