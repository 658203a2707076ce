//! A single-threaded reactor multiplexing descriptor readiness, one-shot
//! timers, and deferred callbacks over one mio poll.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::io;
use std::os::unix::io::RawFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use mio::unix::SourceFd;
use mio::{Events, Interest, Poll, Token, Waker};

use crate::config::LoopConfig;
use crate::error::{LoopError, Result};
use crate::timer::TimerEntry;

/// Token reserved for the cross-thread waker; descriptor tokens are the fd
/// itself, which can never collide with it.
const WAKER_TOKEN: Token = Token(usize::MAX);

/// Bitmask of descriptor interest and observed readiness.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct EventSet(u8);

impl EventSet {
    pub const NONE: EventSet = EventSet(0);
    pub const READ: EventSet = EventSet(0b001);
    pub const WRITE: EventSet = EventSet(0b010);
    pub const ERROR: EventSet = EventSet(0b100);

    pub fn contains(self, other: EventSet) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn remove(self, other: EventSet) -> EventSet {
        EventSet(self.0 & !other.0)
    }

    /// The poll registration this interest translates to. Error conditions
    /// are always reported by the OS; an error-only registration still needs
    /// a readable filter to observe hangups.
    fn to_interest(self) -> Interest {
        match (self.contains(Self::READ), self.contains(Self::WRITE)) {
            (true, true) => Interest::READABLE | Interest::WRITABLE,
            (false, true) => Interest::WRITABLE,
            _ => Interest::READABLE,
        }
    }
}

impl std::ops::BitOr for EventSet {
    type Output = EventSet;

    fn bitor(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for EventSet {
    fn bitor_assign(&mut self, rhs: EventSet) {
        self.0 |= rhs.0;
    }
}

impl std::ops::BitAnd for EventSet {
    type Output = EventSet;

    fn bitand(self, rhs: EventSet) -> EventSet {
        EventSet(self.0 & rhs.0)
    }
}

/// Handle returned by [`EventLoop::add_timeout`], used to cancel the timer
/// before it fires.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct TimerHandle(u64);

type IoHandler = Box<dyn FnMut(RawFd, EventSet) + Send>;
type Callback = Box<dyn FnOnce() + Send>;
type ErrorHook = Box<dyn Fn(&str) + Send>;

struct HandlerEntry {
    /// Shared so the registry lock is released before the handler runs.
    handler: Arc<Mutex<IoHandler>>,
    events: EventSet,
}

struct TimerState {
    heap: BinaryHeap<TimerEntry>,
    /// Live callbacks by timer id. Cancellation removes the entry here; the
    /// matching heap node is discarded when it surfaces.
    callbacks: HashMap<u64, Callback>,
    next_id: u64,
    seq: u64,
}

/// The main reactor type.
///
/// One thread calls [`start`](EventLoop::start) and becomes the loop thread;
/// every handler, timer callback, and deferred callback runs to completion on
/// it. [`add_callback`](EventLoop::add_callback) is the only operation that
/// may be invoked from other threads — it wakes a blocked poll through an
/// internal waker.
pub struct EventLoop {
    poll: Mutex<Poll>,
    registry: mio::Registry,
    waker: Waker,
    config: LoopConfig,
    handlers: Mutex<HashMap<RawFd, HandlerEntry>>,
    timers: Mutex<TimerState>,
    callbacks: Mutex<VecDeque<Callback>>,
    error_hook: Mutex<ErrorHook>,
    running: AtomicBool,
    stop_requested: AtomicBool,
}

/// Process-wide default loop for callers that want implicit sharing.
/// Explicitly constructed loops never touch this slot.
static DEFAULT_INSTANCE: OnceLock<Arc<EventLoop>> = OnceLock::new();

impl EventLoop {
    /// Creates a reactor with default configuration.
    pub fn new() -> Result<Arc<Self>> {
        Self::with_config(LoopConfig::default())
    }

    /// Creates a reactor with the given configuration.
    ///
    /// # Errors
    /// Returns `LoopError::Init` if the OS polling primitive or the wake
    /// channel cannot be set up.
    pub fn with_config(config: LoopConfig) -> Result<Arc<Self>> {
        let poll = Poll::new().map_err(LoopError::Init)?;
        let registry = poll.registry().try_clone().map_err(LoopError::Init)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(LoopError::Init)?;

        Ok(Arc::new(Self {
            poll: Mutex::new(poll),
            registry,
            waker,
            config,
            handlers: Mutex::new(HashMap::new()),
            timers: Mutex::new(TimerState {
                heap: BinaryHeap::new(),
                callbacks: HashMap::new(),
                next_id: 0,
                seq: 0,
            }),
            callbacks: Mutex::new(VecDeque::new()),
            error_hook: Mutex::new(Box::new(|message| log::error!("{}", message))),
            running: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
        }))
    }

    /// Returns the process-wide default reactor, creating it on first call.
    ///
    /// Components that can take an explicit loop should prefer one; this is
    /// for callers that want implicit sharing across a process.
    pub fn instance() -> Result<Arc<Self>> {
        if let Some(shared) = DEFAULT_INSTANCE.get() {
            return Ok(shared.clone());
        }
        let fresh = Self::new()?;
        Ok(DEFAULT_INSTANCE.get_or_init(|| fresh).clone())
    }

    /// True iff the process-wide default has been created, without creating it.
    pub fn initialized() -> bool {
        DEFAULT_INSTANCE.get().is_some()
    }

    /// The loop's effective configuration.
    pub fn config(&self) -> &LoopConfig {
        &self.config
    }

    /// Registers `handler` to be called when `fd` reports readiness matching
    /// `events`. A prior registration for the same fd is replaced.
    pub fn add_handler<H>(&self, fd: RawFd, handler: H, events: EventSet) -> Result<()>
    where
        H: FnMut(RawFd, EventSet) + Send + 'static,
    {
        let mut handlers = self.handlers.lock().map_err(|_| LoopError::LockPoisoned)?;
        let replaced = handlers
            .insert(
                fd,
                HandlerEntry {
                    handler: Arc::new(Mutex::new(Box::new(handler))),
                    events,
                },
            )
            .is_some();

        let mut source = SourceFd(&fd);
        let registration = if replaced {
            self.registry
                .reregister(&mut source, Token(fd as usize), events.to_interest())
        } else {
            self.registry
                .register(&mut source, Token(fd as usize), events.to_interest())
        };
        registration.map_err(|source| {
            handlers.remove(&fd);
            LoopError::Registration { fd, source }
        })
    }

    /// Changes the interest mask for an already registered descriptor.
    pub fn update_handler(&self, fd: RawFd, events: EventSet) -> Result<()> {
        let mut handlers = self.handlers.lock().map_err(|_| LoopError::LockPoisoned)?;
        let entry = handlers.get_mut(&fd).ok_or(LoopError::UnknownHandler(fd))?;
        entry.events = events;

        let mut source = SourceFd(&fd);
        self.registry
            .reregister(&mut source, Token(fd as usize), events.to_interest())
            .map_err(|source| LoopError::Registration { fd, source })
    }

    /// Drops the registration for `fd`. Unknown descriptors are a no-op.
    pub fn remove_handler(&self, fd: RawFd) -> Result<()> {
        let mut handlers = self.handlers.lock().map_err(|_| LoopError::LockPoisoned)?;
        if handlers.remove(&fd).is_some() {
            let mut source = SourceFd(&fd);
            if let Err(err) = self.registry.deregister(&mut source) {
                // the descriptor may already be closed; epoll then dropped it
                log::debug!("deregistering fd {} failed: {}", fd, err);
            }
        }
        Ok(())
    }

    /// Schedules `callback` to run once `deadline` has passed. The callback
    /// never fires early; it may fire late if the loop is busy.
    pub fn add_timeout<F>(&self, deadline: Instant, callback: F) -> Result<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut timers = self.timers.lock().map_err(|_| LoopError::LockPoisoned)?;
        let id = timers.next_id;
        timers.next_id += 1;
        let seq = timers.seq;
        timers.seq += 1;
        timers.heap.push(TimerEntry { deadline, seq, id });
        timers.callbacks.insert(id, Box::new(callback));
        Ok(TimerHandle(id))
    }

    /// Schedules `callback` to run `delay` from now.
    pub fn call_later<F>(&self, delay: Duration, callback: F) -> Result<TimerHandle>
    where
        F: FnOnce() + Send + 'static,
    {
        self.add_timeout(Instant::now() + delay, callback)
    }

    /// Cancels a pending timeout. Removing a handle that already fired, or
    /// was never known, is a no-op.
    pub fn remove_timeout(&self, handle: TimerHandle) {
        if let Ok(mut timers) = self.timers.lock() {
            timers.callbacks.remove(&handle.0);
        }
    }

    /// Enqueues `callback` for the next loop iteration.
    ///
    /// This is the only operation that is safe to call from a thread other
    /// than the loop thread; it interrupts a blocked poll so the callback
    /// runs promptly.
    pub fn add_callback<F>(&self, callback: F) -> Result<()>
    where
        F: FnOnce() + Send + 'static,
    {
        {
            let mut queue = self.callbacks.lock().map_err(|_| LoopError::LockPoisoned)?;
            queue.push_back(Box::new(callback));
        }
        self.waker.wake().map_err(LoopError::Io)?;
        Ok(())
    }

    /// Installs the hook that observes panics escaping handlers, timer
    /// callbacks, and deferred callbacks. The default logs and continues.
    pub fn set_error_hook<F>(&self, hook: F)
    where
        F: Fn(&str) + Send + 'static,
    {
        let mut slot = match self.error_hook.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *slot = Box::new(hook);
    }

    /// True only while a `start` call is actively looping.
    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Requests termination. Takes effect at the end of the current
    /// iteration; dispatches already in flight complete first.
    pub fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        if let Err(err) = self.waker.wake() {
            log::warn!("failed to wake reactor for stop: {}", err);
        }
    }

    /// Runs the reactor until [`stop`](EventLoop::stop) is observed.
    pub fn start(&self) -> Result<()> {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.running.store(true, Ordering::SeqCst);
        let result = self.run_loop();
        self.running.store(false, Ordering::SeqCst);
        result
    }

    fn run_loop(&self) -> Result<()> {
        let mut events = Events::with_capacity(self.config.events_capacity);
        loop {
            let timeout = self.next_poll_timeout()?;
            {
                let mut poll = self.poll.lock().map_err(|_| LoopError::LockPoisoned)?;
                if let Err(err) = poll.poll(&mut events, timeout) {
                    if err.kind() != io::ErrorKind::Interrupted {
                        return Err(LoopError::Polling(err));
                    }
                }
            }
            self.dispatch_io(&events)?;
            self.dispatch_timers()?;
            self.dispatch_callbacks()?;
            if self.stop_requested.load(Ordering::SeqCst) {
                return Ok(());
            }
        }
    }

    /// Zero if deferred callbacks are waiting, else the time until the
    /// earliest live timer, else indefinite.
    fn next_poll_timeout(&self) -> Result<Option<Duration>> {
        {
            let queue = self.callbacks.lock().map_err(|_| LoopError::LockPoisoned)?;
            if !queue.is_empty() {
                return Ok(Some(Duration::ZERO));
            }
        }
        let mut timers = self.timers.lock().map_err(|_| LoopError::LockPoisoned)?;
        loop {
            let head = match timers.heap.peek() {
                Some(entry) => {
                    if timers.callbacks.contains_key(&entry.id) {
                        Some(entry.deadline)
                    } else {
                        None
                    }
                }
                None => return Ok(None),
            };
            match head {
                Some(deadline) => {
                    return Ok(Some(deadline.saturating_duration_since(Instant::now())));
                }
                // cancelled; discard the stale heap node and look again
                None => {
                    timers.heap.pop();
                }
            }
        }
    }

    fn dispatch_io(&self, events: &Events) -> Result<()> {
        for event in events.iter() {
            let token = event.token();
            if token == WAKER_TOKEN {
                // the wake-up itself carries no work; the deferred queue is
                // drained later in this same iteration
                continue;
            }
            let fd = token.0 as RawFd;

            let mut observed = EventSet::NONE;
            if event.is_readable() || event.is_read_closed() {
                observed |= EventSet::READ;
            }
            if event.is_writable() || event.is_write_closed() {
                observed |= EventSet::WRITE;
            }
            if event.is_error() {
                observed |= EventSet::ERROR;
            }
            if observed.is_empty() {
                continue;
            }

            let handler = {
                let handlers = self.handlers.lock().map_err(|_| LoopError::LockPoisoned)?;
                match handlers.get(&fd) {
                    Some(entry) => entry.handler.clone(),
                    // stale event for a descriptor removed earlier this pass
                    None => continue,
                }
            };

            self.invoke_isolated(&format!("I/O handler for fd {}", fd), || {
                let mut guard = match handler.lock() {
                    Ok(guard) => guard,
                    Err(poisoned) => poisoned.into_inner(),
                };
                (*guard)(fd, observed);
            });
        }
        Ok(())
    }

    /// Pops and invokes every timer due as of now, in deadline order.
    /// Timers scheduled by these callbacks run in a later iteration.
    fn dispatch_timers(&self) -> Result<()> {
        let now = Instant::now();
        let mut due: Vec<(u64, Callback)> = Vec::new();
        {
            let mut timers = self.timers.lock().map_err(|_| LoopError::LockPoisoned)?;
            loop {
                let expired = match timers.heap.peek() {
                    Some(entry) => entry.deadline <= now,
                    None => false,
                };
                if !expired {
                    break;
                }
                let entry = match timers.heap.pop() {
                    Some(entry) => entry,
                    None => break,
                };
                if let Some(callback) = timers.callbacks.remove(&entry.id) {
                    due.push((entry.id, callback));
                }
            }
        }
        for (id, callback) in due {
            self.invoke_isolated(&format!("timer {}", id), || callback());
        }
        Ok(())
    }

    /// Drains a snapshot of the deferred queue. Callbacks enqueued while
    /// draining run next iteration, so a callback storm cannot starve the
    /// descriptors.
    fn dispatch_callbacks(&self) -> Result<()> {
        let batch: Vec<Callback> = {
            let mut queue = self.callbacks.lock().map_err(|_| LoopError::LockPoisoned)?;
            queue.drain(..).collect()
        };
        for callback in batch {
            self.invoke_isolated("deferred callback", || callback());
        }
        Ok(())
    }

    /// Runs one dispatch, containing any panic to it. The failure is handed
    /// to the error hook; the loop and every other registration carry on.
    fn invoke_isolated(&self, what: &str, dispatch: impl FnOnce()) {
        if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(dispatch)) {
            let message = format!("{} panicked: {}", what, panic_message(payload.as_ref()));
            let hook = match self.error_hook.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            (*hook)(&message);
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.as_str()
    } else {
        "opaque panic payload"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::os::unix::io::AsRawFd;
    use std::os::unix::net::UnixStream;
    use std::sync::mpsc;
    use std::thread;

    /// Tests that the process-wide default is created once and shared, and
    /// that explicitly constructed loops never populate it.
    #[test]
    fn test_instance_singleton() {
        let fresh = EventLoop::new().unwrap();
        assert!(!EventLoop::initialized());
        drop(fresh);

        let first = EventLoop::instance().unwrap();
        let second = EventLoop::instance().unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(EventLoop::initialized());
    }

    /// Tests that a registered descriptor receives READ events with the
    /// right fd and mask, and that running() is scoped to start().
    #[test]
    fn test_add_handler_dispatches_read_events() {
        let io_loop = EventLoop::new().unwrap();
        let (mut reader, mut writer) = UnixStream::pair().unwrap();
        reader.set_nonblocking(true).unwrap();
        let fd = reader.as_raw_fd();

        let (tx, rx) = mpsc::channel();
        let lp = io_loop.clone();
        io_loop
            .add_handler(
                fd,
                move |got_fd, events| {
                    assert_eq!(got_fd, fd);
                    assert!(events.contains(EventSet::READ));
                    assert!(lp.running());
                    let mut buf = [0u8; 16];
                    let n = reader.read(&mut buf).unwrap();
                    tx.send(buf[..n].to_vec()).unwrap();
                    lp.stop();
                },
                EventSet::READ,
            )
            .unwrap();

        io_loop
            .add_callback(move || {
                writer.write_all(b"ho").unwrap();
            })
            .unwrap();

        assert!(!io_loop.running());
        io_loop.start().unwrap();
        assert!(!io_loop.running());
        assert_eq!(rx.recv().unwrap(), b"ho");
    }

    /// Tests the one-sided timeout guarantee: never early, not absurdly late
    /// under normal load.
    #[test]
    fn test_add_timeout_fires_after_deadline() {
        let io_loop = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let start = Instant::now();

        let lp = io_loop.clone();
        io_loop
            .add_timeout(start + Duration::from_millis(100), move || {
                tx.send(Instant::now()).unwrap();
                lp.stop();
            })
            .unwrap();
        io_loop.start().unwrap();

        let elapsed = rx.recv().unwrap() - start;
        assert!(elapsed >= Duration::from_millis(100), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(600), "fired late: {:?}", elapsed);
    }

    /// Tests that timers sharing a deadline fire in insertion order.
    #[test]
    fn test_equal_deadlines_fire_in_insertion_order() {
        let io_loop = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::channel();
        let deadline = Instant::now() + Duration::from_millis(30);

        for i in 1..=3 {
            let tx = tx.clone();
            io_loop.add_timeout(deadline, move || tx.send(i).unwrap()).unwrap();
        }
        let lp = io_loop.clone();
        io_loop.add_timeout(deadline, move || lp.stop()).unwrap();
        io_loop.start().unwrap();

        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert_eq!(rx.try_recv().unwrap(), 3);
    }

    /// Tests cancellation: a removed timer never fires, and removing the
    /// same handle again is a no-op.
    #[test]
    fn test_remove_timeout_is_a_noop_when_unknown() {
        let io_loop = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let cancelled_tx = tx.clone();
        let handle = io_loop
            .call_later(Duration::from_millis(20), move || {
                cancelled_tx.send("cancelled").unwrap();
            })
            .unwrap();
        let lp = io_loop.clone();
        io_loop
            .call_later(Duration::from_millis(60), move || {
                tx.send("kept").unwrap();
                lp.stop();
            })
            .unwrap();

        io_loop.remove_timeout(handle);
        io_loop.remove_timeout(handle);
        io_loop.start().unwrap();

        assert_eq!(rx.recv().unwrap(), "kept");
        assert!(rx.try_recv().is_err());
    }

    /// Tests that add_callback from a foreign thread interrupts an
    /// otherwise idle, timer-less poll promptly.
    #[test]
    fn test_add_callback_wakes_blocked_poll() {
        let io_loop = EventLoop::new().unwrap();
        let start = Instant::now();

        let lp = io_loop.clone();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            let stopper = lp.clone();
            lp.add_callback(move || stopper.stop()).unwrap();
        });

        io_loop.start().unwrap();
        producer.join().unwrap();

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed < Duration::from_secs(2), "poll was not woken: {:?}", elapsed);
    }

    /// Tests that a panicking dispatch is isolated: the loop survives,
    /// later timers still fire, and the error hook sees the panic.
    #[test]
    fn test_panic_in_timer_is_isolated() {
        let io_loop = EventLoop::new().unwrap();
        let (hook_tx, hook_rx) = mpsc::channel();
        io_loop.set_error_hook(move |message| {
            let _ = hook_tx.send(message.to_string());
        });

        let (tx, rx) = mpsc::channel();
        io_loop
            .call_later(Duration::from_millis(10), || panic!("boom"))
            .unwrap();
        let lp = io_loop.clone();
        io_loop
            .call_later(Duration::from_millis(60), move || {
                tx.send("survived").unwrap();
                lp.stop();
            })
            .unwrap();

        io_loop.start().unwrap();

        assert_eq!(rx.recv().unwrap(), "survived");
        let report = hook_rx.recv().unwrap();
        assert!(report.contains("boom"), "unexpected hook report: {}", report);
    }

    /// Tests EventSet mask algebra used by handlers and streams.
    #[test]
    fn test_event_set_operations() {
        let mask = EventSet::READ | EventSet::ERROR;
        assert!(mask.contains(EventSet::READ));
        assert!(!mask.contains(EventSet::WRITE));
        assert!(mask.contains(EventSet::READ | EventSet::ERROR));

        let without_error = mask.remove(EventSet::ERROR);
        assert_eq!(without_error, EventSet::READ);
        assert!(EventSet::NONE.is_empty());
    }
}
