//! Background readiness-wait thread with cooperative shutdown.
//!
//! [`PollThread`] blocks in `poll(2)` on the compositor socket and an
//! internal self-pipe. Socket readiness invokes the injected `on_ready`
//! callback, a byte on the pipe ends the loop. The thread is joined on drop,
//! so the callbacks never outlive the owner.

use std::os::fd::OwnedFd;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use rustix::event::{poll, PollFd, PollFlags};
use rustix::pipe::{pipe_with, PipeFlags};
use tracing::{debug, warn};

/// A worker thread blocked on readiness of a socket and a shutdown pipe.
#[derive(Debug)]
pub struct PollThread {
    shutdown: Option<OwnedFd>,
    thread: Option<JoinHandle<()>>,
}

impl PollThread {
    /// Spawns the worker.
    ///
    /// `before_poll` runs at the top of every iteration, before blocking.
    /// `on_ready` runs whenever `socket` becomes readable. Failing to create
    /// the shutdown pipe fails the spawn.
    pub fn spawn<B, R>(socket: OwnedFd, mut before_poll: B, mut on_ready: R) -> std::io::Result<PollThread>
    where
        B: FnMut() + Send + 'static,
        R: FnMut() + Send + 'static,
    {
        let (pipe_read, pipe_write) = pipe_with(PipeFlags::CLOEXEC)?;

        let thread = thread::Builder::new()
            .name("waywin-poll".into())
            .spawn(move || loop {
                before_poll();

                let mut fds = [
                    PollFd::new(&socket, PollFlags::IN),
                    PollFd::new(&pipe_read, PollFlags::IN),
                ];
                if let Err(err) = poll(&mut fds, -1) {
                    warn!("poll on compositor socket failed: {err}");
                    continue;
                }

                let socket_events = fds[0].revents();
                let shutdown_events = fds[1].revents();

                if !shutdown_events.is_empty() {
                    debug!("poll thread received shutdown signal");
                    return;
                }
                if socket_events.intersects(PollFlags::ERR | PollFlags::HUP) {
                    // Only the shutdown signal terminates the loop; a dead
                    // socket is reported and we keep waiting for it. Back
                    // off so a persistent error condition cannot spin.
                    warn!("error condition on compositor socket: {socket_events:?}");
                    thread::sleep(Duration::from_millis(10));
                    continue;
                }
                if socket_events.contains(PollFlags::IN) {
                    on_ready();
                }
            })?;

        Ok(PollThread {
            shutdown: Some(pipe_write),
            thread: Some(thread),
        })
    }
}

impl Drop for PollThread {
    fn drop(&mut self) {
        if let Some(pipe) = self.shutdown.take() {
            if let Err(err) = rustix::io::write(&pipe, &[0u8]) {
                warn!("could not signal poll thread shutdown: {err}");
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("poll thread panicked before shutdown");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Instant;

    #[test]
    fn shutdown_joins_without_socket_traffic() {
        crate::init_test_logging();
        let (read, _write) = pipe_with(PipeFlags::CLOEXEC).unwrap();
        let ready = Arc::new(AtomicUsize::new(0));
        let ready_in_thread = ready.clone();
        let thread = PollThread::spawn(read, || {}, move || {
            ready_in_thread.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        let start = Instant::now();
        drop(thread);
        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(ready.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn readable_socket_invokes_on_ready() {
        crate::init_test_logging();
        let (read, write) = pipe_with(PipeFlags::CLOEXEC).unwrap();
        let ready = Arc::new(AtomicUsize::new(0));
        let ready_in_thread = ready.clone();
        // Drain the byte so the loop blocks again instead of spinning.
        let read_fd = read.try_clone().unwrap();
        let thread = PollThread::spawn(read, || {}, move || {
            let mut buf = [0u8; 8];
            let _ = rustix::io::read(&read_fd, &mut buf);
            ready_in_thread.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        rustix::io::write(&write, &[1u8]).unwrap();
        let deadline = Instant::now() + Duration::from_secs(5);
        while ready.load(Ordering::SeqCst) == 0 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(ready.load(Ordering::SeqCst), 1);
        drop(thread);
    }
}
