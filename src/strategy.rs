//! How wire bytes become dispatched callbacks.
//!
//! Two interchangeable disciplines, selected once at bring-up:
//!
//! - [`ThreadedStrategy`] lets the poll thread run a blocking dispatch, so
//!   protocol listener callbacks execute on the poll thread. Application
//!   visible payloads are therefore wrapped into closures and funneled
//!   through a mutex-guarded [`ActionQueue`] that only the main thread
//!   drains.
//! - [`ReadGuardStrategy`] uses the two-phase read-guard cycle: the poll
//!   thread only ingests bytes and every callback is dispatched by the main
//!   thread, so deferred closures can simply run in place.
//!
//! Both guarantee that no listener callback runs concurrently with the main
//! thread's dispatch logic, that outbound requests are flushed after each
//! dispatch pass, and that the poll thread can always be woken for shutdown.

use std::os::fd::OwnedFd;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use tracing::{debug, error, warn};
use wayland_client::backend::{ReadEventsGuard, WaylandError};
use wayland_client::{Connection, EventQueue};

use crate::poll::PollThread;

/// A deferred unit of cross-thread work.
pub type Action = Box<dyn FnOnce() + Send>;

/// Which dispatch discipline to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// Blocking dispatch on the poll thread, callbacks deferred through the
    /// action queue. The compatibility discipline.
    Threaded,
    /// Two-phase read on the poll thread, callbacks dispatched on the main
    /// thread. The default.
    #[default]
    ReadGuard,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Deferred,
    Immediate,
}

/// Ordered queue of deferred closures, shared between the poll thread and
/// the main thread.
///
/// In immediate mode (read-guard discipline) a pushed action runs in place,
/// because callback invocation never happens off the main thread there.
#[derive(Clone)]
pub(crate) struct ActionQueue {
    inner: Arc<ActionQueueInner>,
}

struct ActionQueueInner {
    mode: Mutex<Mode>,
    pending: Mutex<Vec<Action>>,
}

impl std::fmt::Debug for ActionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ActionQueue")
            .field("mode", &*self.inner.mode.lock().unwrap())
            .field("pending", &self.inner.pending.lock().unwrap().len())
            .finish()
    }
}

impl ActionQueue {
    /// A new queue in deferred mode. Bring-up runs in deferred mode until a
    /// strategy takes over, so nothing executes on an unexpected thread.
    pub(crate) fn new() -> ActionQueue {
        ActionQueue {
            inner: Arc::new(ActionQueueInner {
                mode: Mutex::new(Mode::Deferred),
                pending: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn set_mode(&self, mode: Mode) {
        *self.inner.mode.lock().unwrap() = mode;
    }

    /// Queues the action, or runs it in place in immediate mode.
    pub(crate) fn push(&self, action: Action) {
        let mode = *self.inner.mode.lock().unwrap();
        match mode {
            Mode::Deferred => self.inner.pending.lock().unwrap().push(action),
            // Never holds a lock here: the action may push again.
            Mode::Immediate => action(),
        }
    }

    /// Drains the queue and runs every action in insertion order.
    ///
    /// The lock is dropped before the first action runs, so actions may push
    /// new ones without deadlocking; those run on the next drain.
    pub(crate) fn drain_and_run(&self) {
        let drained = std::mem::take(&mut *self.inner.pending.lock().unwrap());
        for action in drained {
            action();
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.pending.lock().unwrap().len()
    }
}

/// One dispatch discipline, driving a connection's event queue.
///
/// Deferral itself is not part of the trait: producers push closures through
/// their clone of the shared [`ActionQueue`], and the strategy only controls
/// the queue's mode and when it drains.
pub(crate) trait DispatchStrategy: Send + Sync {
    /// Runs the main-thread half of the discipline: deliver pending
    /// callbacks and deferred closures, then flush outbound requests.
    fn dispatch_from_main(&self);
}

fn flush(conn: &Connection) {
    if let Err(err) = conn.flush() {
        match err {
            WaylandError::Io(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                // Kernel buffer full; the next dispatch pass retries.
                debug!("flush would block, retrying next dispatch");
            }
            err => warn!("could not flush connection: {err}"),
        }
    }
}

fn socket_fd(conn: &Connection) -> std::io::Result<OwnedFd> {
    let backend = conn.backend();
    let fd = backend.poll_fd();
    fd.try_clone_to_owned()
}

/// Legacy discipline: the poll thread both reads the socket and invokes
/// listener callbacks.
pub(crate) struct ThreadedStrategy {
    conn: Connection,
    actions: ActionQueue,
    _poll: PollThread,
}

impl std::fmt::Debug for ThreadedStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadedStrategy").finish_non_exhaustive()
    }
}

impl ThreadedStrategy {
    /// Takes ownership of the queue and dispatch state and moves them to the
    /// poll thread. From here on, all listener callbacks run there.
    pub(crate) fn start<S: Send + 'static>(
        conn: Connection,
        mut queue: EventQueue<S>,
        mut state: S,
        actions: ActionQueue,
    ) -> std::io::Result<ThreadedStrategy> {
        actions.set_mode(Mode::Deferred);
        let fd = socket_fd(&conn)?;

        let poll = PollThread::spawn(
            fd,
            || {},
            move || {
                // The outer poll saw the socket readable, so this does not
                // block beyond draining the ready data.
                if let Err(err) = queue.blocking_dispatch(&mut state) {
                    error!("dispatch failed: {err}");
                }
            },
        )?;

        Ok(ThreadedStrategy {
            conn,
            actions,
            _poll: poll,
        })
    }
}

impl DispatchStrategy for ThreadedStrategy {
    fn dispatch_from_main(&self) {
        self.actions.drain_and_run();
        flush(&self.conn);
    }
}

struct DrainGate {
    generation: Mutex<u64>,
    drained: Condvar,
    stop: AtomicBool,
}

impl DrainGate {
    // Blocks until the main thread completes a dispatch pass (or shutdown
    // begins), identified by a generation bump.
    fn wait(&self) {
        let mut generation = self.generation.lock().unwrap();
        let seen = *generation;
        while *generation == seen && !self.stop.load(Ordering::SeqCst) {
            generation = self.drained.wait(generation).unwrap();
        }
    }

    fn bump(&self) {
        *self.generation.lock().unwrap() += 1;
        self.drained.notify_all();
    }
}

struct QueueInner<S> {
    queue: EventQueue<S>,
    state: S,
}

/// Modern discipline: the poll thread only ingests bytes, callbacks run on
/// the main thread.
pub(crate) struct ReadGuardStrategy<S: 'static> {
    conn: Connection,
    actions: ActionQueue,
    inner: Arc<Mutex<QueueInner<S>>>,
    gate: Arc<DrainGate>,
    poll: Option<PollThread>,
}

impl<S> std::fmt::Debug for ReadGuardStrategy<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadGuardStrategy").finish_non_exhaustive()
    }
}

impl<S: Send + 'static> ReadGuardStrategy<S> {
    pub(crate) fn start(
        conn: Connection,
        queue: EventQueue<S>,
        state: S,
        actions: ActionQueue,
    ) -> std::io::Result<ReadGuardStrategy<S>> {
        actions.set_mode(Mode::Immediate);
        let fd = socket_fd(&conn)?;

        let inner = Arc::new(Mutex::new(QueueInner { queue, state }));
        let gate = Arc::new(DrainGate {
            generation: Mutex::new(0),
            drained: Condvar::new(),
            stop: AtomicBool::new(false),
        });
        let guard_slot: Arc<Mutex<Option<ReadEventsGuard>>> = Arc::new(Mutex::new(None));

        let before_inner = inner.clone();
        let before_gate = gate.clone();
        let before_slot = guard_slot.clone();
        let ready_slot = guard_slot.clone();

        let poll = PollThread::spawn(
            fd,
            move || {
                // Acquire the read guard for this cycle. A failed prepare
                // means callbacks are already pending; blocking now would
                // starve them, so wait for the main thread to drain first.
                while !before_gate.stop.load(Ordering::SeqCst) {
                    let guard = before_inner.lock().unwrap().queue.prepare_read();
                    match guard {
                        Some(guard) => {
                            *before_slot.lock().unwrap() = Some(guard);
                            return;
                        }
                        None => before_gate.wait(),
                    }
                }
            },
            move || {
                let Some(guard) = ready_slot.lock().unwrap().take() else {
                    return;
                };
                match guard.read() {
                    Ok(_) => {}
                    Err(WaylandError::Io(err)) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => error!("could not read compositor events: {err}"),
                }
            },
        )?;

        Ok(ReadGuardStrategy {
            conn,
            actions,
            inner,
            gate,
            poll: Some(poll),
        })
    }
}

impl<S: Send + 'static> DispatchStrategy for ReadGuardStrategy<S> {
    fn dispatch_from_main(&self) {
        // Leftovers queued before this strategy took over.
        self.actions.drain_and_run();
        {
            let mut inner = self.inner.lock().unwrap();
            let QueueInner { queue, state } = &mut *inner;
            if let Err(err) = queue.dispatch_pending(state) {
                error!("dispatch failed: {err}");
            }
        }
        flush(&self.conn);
        self.gate.bump();
    }
}

impl<S: 'static> Drop for ReadGuardStrategy<S> {
    fn drop(&mut self) {
        // Wake the poll thread out of the drain gate before asking it to
        // exit, otherwise the join below could wait forever.
        self.gate.stop.store(true, Ordering::SeqCst);
        self.gate.bump();
        self.poll.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::thread;

    #[test]
    fn deferred_actions_run_in_insertion_order() {
        let queue = ActionQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = log.clone();
            queue.push(Box::new(move || log.lock().unwrap().push(i)));
        }
        assert_eq!(log.lock().unwrap().len(), 0);
        queue.drain_and_run();
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn immediate_mode_runs_in_place() {
        let queue = ActionQueue::new();
        queue.set_mode(Mode::Immediate);
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        queue.push(Box::new(move || flag.store(true, Ordering::SeqCst)));
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn reentrant_push_from_action_does_not_deadlock() {
        let queue = ActionQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let inner_ran = ran.clone();
        let queue_in_action = queue.clone();
        queue.push(Box::new(move || {
            inner_ran.fetch_add(1, Ordering::SeqCst);
            let inner_ran = inner_ran.clone();
            queue_in_action.push(Box::new(move || {
                inner_ran.fetch_add(1, Ordering::SeqCst);
            }));
        }));
        queue.drain_and_run();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        queue.drain_and_run();
        assert_eq!(ran.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn concurrent_pushes_neither_drop_nor_duplicate() {
        crate::init_test_logging();
        let queue = ActionQueue::new();
        let counter = Arc::new(AtomicUsize::new(0));
        const PER_THREAD: usize = 1000;

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                let counter = counter.clone();
                thread::spawn(move || {
                    for _ in 0..PER_THREAD {
                        let counter = counter.clone();
                        queue.push(Box::new(move || {
                            counter.fetch_add(1, Ordering::SeqCst);
                        }));
                    }
                })
            })
            .collect();

        // Drain concurrently with the producers, like a live main loop.
        while Arc::strong_count(&counter) > 1 || queue.len() > 0 {
            queue.drain_and_run();
            if counter.load(Ordering::SeqCst) == 4 * PER_THREAD {
                break;
            }
            thread::yield_now();
        }
        for handle in handles {
            handle.join().unwrap();
        }
        queue.drain_and_run();
        assert_eq!(counter.load(Ordering::SeqCst), 4 * PER_THREAD);
    }

    #[test]
    fn per_thread_order_is_preserved() {
        let queue = ActionQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        let producer = {
            let queue = queue.clone();
            let log = log.clone();
            thread::spawn(move || {
                for i in 0..100u32 {
                    let log = log.clone();
                    queue.push(Box::new(move || log.lock().unwrap().push(i)));
                }
            })
        };
        producer.join().unwrap();
        queue.drain_and_run();
        let log = log.lock().unwrap();
        assert_eq!(log.len(), 100);
        assert!(log.windows(2).all(|w| w[0] < w[1]));
    }
}
