//! Timer plumbing: the heap node the reactor orders deadlines with, and a
//! repeating callback built on the reactor's one-shot timeout primitive.

use std::cmp::Ordering;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::reactor::{EventLoop, TimerHandle};

/// Node in the reactor's timer heap.
pub(crate) struct TimerEntry {
    pub(crate) deadline: Instant,
    /// Insertion sequence; breaks ties between equal deadlines so firing
    /// order is deterministic.
    pub(crate) seq: u64,
    pub(crate) id: u64,
}

impl PartialEq for TimerEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.seq == other.seq
    }
}

impl Eq for TimerEntry {}

impl Ord for TimerEntry {
    // reversed so the max-heap pops the earliest deadline, earliest
    // insertion first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

impl PartialOrd for TimerEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Repeats a callback at a fixed interval on an [`EventLoop`].
///
/// The k-th firing targets `anchor + k * interval`, where the anchor is the
/// moment [`start`](PeriodicCallback::start) was called. Rescheduling is
/// keyed off the previous target rather than the current time, so latency in
/// the callback body does not accumulate as drift across repetitions.
pub struct PeriodicCallback {
    io_loop: Arc<EventLoop>,
    interval: Duration,
    callback: Mutex<Box<dyn FnMut() + Send>>,
    state: Mutex<PeriodicState>,
    /// Scheduled timer callbacks hold this instead of a strong reference,
    /// so an abandoned PeriodicCallback can collect with a firing in flight.
    weak_self: Weak<PeriodicCallback>,
}

struct PeriodicState {
    running: bool,
    /// `anchor + k * interval` for the next firing.
    next_deadline: Instant,
    scheduled: Option<TimerHandle>,
}

impl PeriodicCallback {
    pub fn new<F>(io_loop: Arc<EventLoop>, interval: Duration, callback: F) -> Arc<Self>
    where
        F: FnMut() + Send + 'static,
    {
        Arc::new_cyclic(|weak_self| Self {
            io_loop,
            interval,
            callback: Mutex::new(Box::new(callback)),
            state: Mutex::new(PeriodicState {
                running: false,
                next_deadline: Instant::now(),
                scheduled: None,
            }),
            weak_self: weak_self.clone(),
        })
    }

    /// Anchors the schedule at now and arms the first firing one interval
    /// out. Starting an already running callback is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut state = self.lock_state();
        if state.running {
            return Ok(());
        }
        state.running = true;
        state.next_deadline = Instant::now() + self.interval;
        self.schedule(&mut state)
    }

    /// Cancels the pending firing, if any. Idempotent.
    pub fn stop(&self) {
        let mut state = self.lock_state();
        state.running = false;
        if let Some(handle) = state.scheduled.take() {
            self.io_loop.remove_timeout(handle);
        }
    }

    pub fn running(&self) -> bool {
        self.lock_state().running
    }

    fn schedule(&self, state: &mut PeriodicState) -> Result<()> {
        let weak = self.weak_self.clone();
        let handle = self.io_loop.add_timeout(state.next_deadline, move || {
            if let Some(periodic) = Weak::upgrade(&weak) {
                periodic.fire();
            }
        })?;
        state.scheduled = Some(handle);
        Ok(())
    }

    fn fire(&self) {
        {
            let state = self.lock_state();
            if !state.running {
                return;
            }
        }

        {
            let mut callback = match self.callback.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            (*callback)();
        }

        let mut state = self.lock_state();
        // the callback may have stopped us
        if !state.running {
            return;
        }
        state.scheduled = None;
        state.next_deadline += self.interval;
        if let Err(err) = self.schedule(&mut state) {
            log::error!("failed to reschedule periodic callback: {}", err);
            state.running = false;
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, PeriodicState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::thread;

    /// Tests that each firing lands inside its anchored window:
    /// `[anchor + k*interval, anchor + k*interval + 0.5s)`.
    #[test]
    fn test_periodic_fires_on_anchored_schedule() {
        let io_loop = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let lp = io_loop.clone();
        let mut count = 0u32;
        let start = Instant::now();
        let periodic = PeriodicCallback::new(io_loop.clone(), Duration::from_millis(100), move || {
            count += 1;
            tx.send(Instant::now()).unwrap();
            if count == 4 {
                lp.stop();
            }
        });
        periodic.start().unwrap();
        io_loop.start().unwrap();
        periodic.stop();

        for k in 1..=4u32 {
            let fired = rx.recv().unwrap();
            let target = start + Duration::from_millis(100) * k;
            assert!(fired >= target, "firing {} was early", k);
            assert!(
                fired < target + Duration::from_millis(500),
                "firing {} drifted too far",
                k
            );
        }
    }

    /// Tests the anti-drift property: a callback body that eats most of the
    /// interval does not push later firings off the anchored schedule.
    #[test]
    fn test_periodic_does_not_accumulate_drift() {
        let io_loop = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let lp = io_loop.clone();
        let mut count = 0u32;
        let start = Instant::now();
        let periodic = PeriodicCallback::new(io_loop.clone(), Duration::from_millis(150), move || {
            tx.send(Instant::now()).unwrap();
            count += 1;
            if count == 3 {
                lp.stop();
            } else {
                thread::sleep(Duration::from_millis(100));
            }
        });
        periodic.start().unwrap();
        io_loop.start().unwrap();
        periodic.stop();

        let third = rx.iter().take(3).last().unwrap();
        let elapsed = third - start;
        // rescheduling from `now` instead of the anchor would put the third
        // firing past 750ms
        assert!(elapsed >= Duration::from_millis(450), "fired early: {:?}", elapsed);
        assert!(elapsed < Duration::from_millis(650), "drift accumulated: {:?}", elapsed);
    }

    /// Tests that stop before the first firing cancels it and that stopping
    /// twice is harmless.
    #[test]
    fn test_periodic_stop_cancels_pending_firing() {
        let io_loop = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let periodic = PeriodicCallback::new(io_loop.clone(), Duration::from_millis(30), move || {
            tx.send(()).unwrap();
        });
        periodic.start().unwrap();
        assert!(periodic.running());
        periodic.stop();
        periodic.stop();
        assert!(!periodic.running());

        let lp = io_loop.clone();
        io_loop
            .call_later(Duration::from_millis(100), move || lp.stop())
            .unwrap();
        io_loop.start().unwrap();

        assert!(rx.try_recv().is_err());
    }

    /// Tests that a callback can stop its own cycle.
    #[test]
    fn test_periodic_stops_from_inside_callback() {
        let io_loop = EventLoop::new().unwrap();
        let (tx, rx) = mpsc::channel();

        let periodic_slot: Arc<Mutex<Option<Arc<PeriodicCallback>>>> =
            Arc::new(Mutex::new(None));
        let slot = periodic_slot.clone();
        let mut count = 0u32;
        let periodic = PeriodicCallback::new(io_loop.clone(), Duration::from_millis(20), move || {
            count += 1;
            tx.send(count).unwrap();
            if count == 2 {
                if let Some(periodic) = slot.lock().unwrap().as_ref() {
                    periodic.stop();
                }
            }
        });
        *periodic_slot.lock().unwrap() = Some(periodic.clone());
        periodic.start().unwrap();

        let lp2 = io_loop.clone();
        io_loop
            .call_later(Duration::from_millis(120), move || lp2.stop())
            .unwrap();
        io_loop.start().unwrap();

        assert_eq!(rx.try_recv().unwrap(), 1);
        assert_eq!(rx.try_recv().unwrap(), 2);
        assert!(rx.try_recv().is_err());
        assert!(!periodic.running());
    }
}
