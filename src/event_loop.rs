//! Main-thread event loop with a repeating-timer wheel.
//!
//! [`EventLoop::dispatch`] is the single pump the application drives: it
//! advances the timers, runs the main-thread half of the dispatch strategy
//! and delivers every translated event to the sink. Protocol processors hold
//! an [`EventLoopHandle`] to post events and arm timers from whichever thread
//! their callbacks run on.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tracing::trace;

use crate::event::{Event, EventSink};
use crate::strategy::{ActionQueue, DispatchStrategy};

/// Callback invoked every time its timer fires.
pub type TimerCallback = Box<dyn FnMut() + Send>;

/// Owner-side handle to an armed timer.
///
/// Dropping the handle cancels the timer. A cancelled timer never fires
/// again, even if a tick was already in flight when the handle was dropped.
#[derive(Debug)]
pub struct TimerHandle {
    alive: Arc<AtomicBool>,
}

impl TimerHandle {
    /// Explicit cancellation, identical to dropping the handle.
    pub fn cancel(self) {}
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

struct TimerEntry {
    remaining: Duration,
    interval: Duration,
    alive: Arc<AtomicBool>,
    callback: TimerCallback,
}

impl fmt::Debug for TimerEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TimerEntry")
            .field("remaining", &self.remaining)
            .field("interval", &self.interval)
            .field("alive", &self.alive.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

/// Repeating timers ordered by time to next fire.
///
/// The wheel never spawns a thread. It only advances when [`TimerWheel::tick`]
/// is called with the elapsed wall time, which keeps it fully deterministic
/// under test.
#[derive(Debug, Default)]
pub(crate) struct TimerWheel {
    entries: Vec<TimerEntry>,
}

impl TimerWheel {
    /// Arms a repeating timer. The first fire happens after `initial`, every
    /// subsequent fire after `interval`.
    pub(crate) fn add(
        &mut self,
        initial: Duration,
        interval: Duration,
        callback: TimerCallback,
    ) -> TimerHandle {
        let alive = Arc::new(AtomicBool::new(true));
        self.entries.push(TimerEntry {
            remaining: initial,
            interval,
            alive: alive.clone(),
            callback,
        });
        self.sort();
        TimerHandle { alive }
    }

    /// Time until the earliest live timer fires, if any are armed.
    pub(crate) fn next_deadline(&self) -> Option<Duration> {
        self.entries
            .iter()
            .filter(|e| e.alive.load(Ordering::SeqCst))
            .map(|e| e.remaining)
            .min()
    }

    /// Advances all timers by `elapsed` and collects the ones that are due.
    ///
    /// Due timers are returned instead of run so the caller can invoke the
    /// callbacks without holding the wheel's lock. Each due timer fires once
    /// per tick and is re-armed with its interval. Ties fire earliest
    /// deadline first, then in arming order.
    fn advance(&mut self, elapsed: Duration) -> Vec<TimerEntry> {
        self.entries.retain(|e| e.alive.load(Ordering::SeqCst));

        let mut due = Vec::new();
        let mut remaining_entries = Vec::with_capacity(self.entries.len());
        for mut entry in self.entries.drain(..) {
            if entry.remaining <= elapsed {
                entry.remaining = entry.interval;
                due.push(entry);
            } else {
                entry.remaining -= elapsed;
                remaining_entries.push(entry);
            }
        }
        self.entries = remaining_entries;
        due
    }

    fn sort(&mut self) {
        // Stable, so simultaneous deadlines keep arming order.
        self.entries.sort_by_key(|e| e.remaining);
    }
}

/// Shared wheel access plus the tick driver.
#[derive(Debug)]
pub(crate) struct Timers {
    wheel: Mutex<TimerWheel>,
}

impl Timers {
    pub(crate) fn new() -> Timers {
        Timers {
            wheel: Mutex::new(TimerWheel::default()),
        }
    }

    pub(crate) fn add(
        &self,
        initial: Duration,
        interval: Duration,
        callback: TimerCallback,
    ) -> TimerHandle {
        self.wheel.lock().unwrap().add(initial, interval, callback)
    }

    pub(crate) fn next_deadline(&self) -> Option<Duration> {
        self.wheel.lock().unwrap().next_deadline()
    }

    /// Fires everything that became due over `elapsed`.
    ///
    /// Callbacks run outside the wheel lock, so they may arm or cancel
    /// timers. Fired entries are merged back afterwards unless their handle
    /// was dropped from inside a callback.
    pub(crate) fn tick(&self, elapsed: Duration) {
        let mut due = self.wheel.lock().unwrap().advance(elapsed);
        if due.is_empty() {
            return;
        }
        trace!(count = due.len(), "firing timers");
        for entry in &mut due {
            if entry.alive.load(Ordering::SeqCst) {
                (entry.callback)();
            }
        }

        let mut wheel = self.wheel.lock().unwrap();
        for entry in due {
            if entry.alive.load(Ordering::SeqCst) {
                wheel.entries.push(entry);
            }
        }
        wheel.sort();
    }
}

/// Cloneable handle protocol processors use to reach the loop.
#[derive(Debug, Clone)]
pub struct EventLoopHandle {
    actions: ActionQueue,
    timers: Arc<Timers>,
    sink: Arc<dyn EventSink>,
}

impl EventLoopHandle {
    pub(crate) fn new(actions: ActionQueue, sink: Arc<dyn EventSink>) -> EventLoopHandle {
        EventLoopHandle {
            actions,
            timers: Arc::new(Timers::new()),
            sink,
        }
    }

    /// Delivers an event to the application sink on the main thread.
    ///
    /// Under the threaded discipline this defers through the action queue;
    /// under the read-guard discipline callbacks already run on the main
    /// thread and the event is delivered in place.
    pub fn post_event(&self, event: Event) {
        let sink = self.sink.clone();
        self.actions.push(Box::new(move || sink.event(event)));
    }

    /// Reports a keyboard focus change to the sink, same delivery rules as
    /// [`EventLoopHandle::post_event`].
    pub fn post_focus_change(&self, focused: bool) {
        let sink = self.sink.clone();
        self.actions.push(Box::new(move || sink.focus_changed(focused)));
    }

    /// Arms a repeating timer, first fire after `initial`, then every
    /// `interval`. Timer callbacks run inside [`EventLoop::dispatch`].
    pub fn add_timer(
        &self,
        initial: Duration,
        interval: Duration,
        callback: TimerCallback,
    ) -> TimerHandle {
        self.timers.add(initial, interval, callback)
    }

    pub(crate) fn tick_timers(&self, elapsed: Duration) {
        self.timers.tick(elapsed);
    }

    /// Immediate-delivery handle for driving processors without a live
    /// connection.
    #[cfg(test)]
    pub(crate) fn new_immediate(sink: Arc<dyn EventSink>) -> EventLoopHandle {
        let actions = ActionQueue::new();
        actions.set_mode(crate::strategy::Mode::Immediate);
        EventLoopHandle::new(actions, sink)
    }
}

/// The main-thread pump the application drives.
pub struct EventLoop {
    handle: EventLoopHandle,
    strategy: Arc<dyn DispatchStrategy>,
    last_tick: Instant,
}

impl fmt::Debug for EventLoop {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventLoop")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

impl EventLoop {
    pub(crate) fn new(handle: EventLoopHandle, strategy: Arc<dyn DispatchStrategy>) -> EventLoop {
        EventLoop {
            handle,
            strategy,
            last_tick: Instant::now(),
        }
    }

    /// A handle for posting events and arming timers.
    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }

    /// Runs one dispatch pass: advance timers by the wall time since the
    /// previous pass, deliver pending protocol callbacks and deferred
    /// closures, then flush outbound requests.
    ///
    /// The application should call this at least as often as the deadline
    /// reported by [`EventLoop::next_timeout`], otherwise repeat timers fire
    /// late.
    pub fn dispatch(&mut self) {
        let now = Instant::now();
        let elapsed = now - self.last_tick;
        self.last_tick = now;

        self.handle.tick_timers(elapsed);
        self.strategy.dispatch_from_main();
    }

    /// Time until the next armed timer is due, as a poll timeout for the
    /// caller's own wait loop. `None` means no timer is armed.
    pub fn next_timeout(&self) -> Option<Duration> {
        let deadline = self.handle.timers.next_deadline()?;
        Some(deadline.saturating_sub(self.last_tick.elapsed()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recording_timer(log: &Arc<Mutex<Vec<u64>>>, id: u64) -> TimerCallback {
        let log = log.clone();
        Box::new(move || log.lock().unwrap().push(id))
    }

    #[test]
    fn due_timers_fire_earliest_deadline_first() {
        let timers = Timers::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let _t50 = timers.add(
            Duration::from_millis(50),
            Duration::from_millis(50),
            recording_timer(&log, 50),
        );
        let _t10 = timers.add(
            Duration::from_millis(10),
            Duration::from_millis(10),
            recording_timer(&log, 10),
        );
        let _t30 = timers.add(
            Duration::from_millis(30),
            Duration::from_millis(30),
            recording_timer(&log, 30),
        );

        timers.tick(Duration::from_millis(40));
        assert_eq!(*log.lock().unwrap(), vec![10, 30]);
    }

    #[test]
    fn fired_timer_is_rearmed_with_its_interval() {
        let timers = Timers::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _t = timers.add(
            Duration::from_millis(100),
            Duration::from_millis(25),
            recording_timer(&log, 1),
        );

        timers.tick(Duration::from_millis(100));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(timers.next_deadline(), Some(Duration::from_millis(25)));

        timers.tick(Duration::from_millis(25));
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[test]
    fn simultaneous_deadlines_fire_in_arming_order() {
        let timers = Timers::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let _a = timers.add(
            Duration::from_millis(20),
            Duration::from_millis(20),
            recording_timer(&log, 1),
        );
        let _b = timers.add(
            Duration::from_millis(20),
            Duration::from_millis(20),
            recording_timer(&log, 2),
        );

        timers.tick(Duration::from_millis(20));
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn dropped_handle_cancels_before_fire() {
        let timers = Timers::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let handle = timers.add(
            Duration::from_millis(10),
            Duration::from_millis(10),
            recording_timer(&log, 1),
        );

        drop(handle);
        timers.tick(Duration::from_millis(50));
        assert!(log.lock().unwrap().is_empty());
        assert_eq!(timers.next_deadline(), None);
    }

    #[test]
    fn callback_may_arm_a_new_timer() {
        let timers = Arc::new(Timers::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let nested_handle = Arc::new(Mutex::new(None));

        let inner_timers = timers.clone();
        let inner_log = log.clone();
        let inner_slot = nested_handle.clone();
        let _t = timers.add(
            Duration::from_millis(10),
            Duration::from_millis(1000),
            Box::new(move || {
                inner_log.lock().unwrap().push(1);
                let handle = inner_timers.add(
                    Duration::from_millis(5),
                    Duration::from_millis(5),
                    recording_timer(&inner_log, 2),
                );
                *inner_slot.lock().unwrap() = Some(handle);
            }),
        );

        timers.tick(Duration::from_millis(10));
        timers.tick(Duration::from_millis(5));
        assert_eq!(*log.lock().unwrap(), vec![1, 2]);
    }

    #[test]
    fn callback_may_cancel_itself() {
        let timers = Arc::new(Timers::new());
        let fired = Arc::new(Mutex::new(0u32));
        let self_handle: Arc<Mutex<Option<TimerHandle>>> = Arc::new(Mutex::new(None));

        let inner_fired = fired.clone();
        let inner_slot = self_handle.clone();
        let handle = timers.add(
            Duration::from_millis(10),
            Duration::from_millis(10),
            Box::new(move || {
                *inner_fired.lock().unwrap() += 1;
                inner_slot.lock().unwrap().take();
            }),
        );
        *self_handle.lock().unwrap() = Some(handle);

        timers.tick(Duration::from_millis(10));
        timers.tick(Duration::from_millis(10));
        assert_eq!(*fired.lock().unwrap(), 1);
    }
}
