//! Backend bring-up and the public entry point.
//!
//! [`Backend::new`] performs the whole synchronous bring-up sequence:
//! connect, bind globals, collect outputs, map the window, settle the input
//! devices, then start the background reader. After that the application
//! owns the pump via [`Backend::dispatch`].

use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::{debug, info};
use wayland_client::{DispatchError, QueueHandle};

use crate::connection::{ConnectError, Connection};
use crate::event::EventSink;
use crate::event_loop::{EventLoop, EventLoopHandle};
use crate::output::Output;
use crate::registry::GlobalObserver;
use crate::state::WinState;
use crate::strategy::{
    ActionQueue, DispatchMode, DispatchStrategy, ReadGuardStrategy, ThreadedStrategy,
};
use crate::window::Window;

/// Bring-up configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Explicit compositor socket name, `None` to discover from the
    /// environment.
    pub socket_name: Option<String>,
    /// Window title announced to the compositor.
    pub title: String,
    /// Map the window fullscreen instead of as a plain toplevel.
    pub fullscreen: bool,
    /// Which dispatch discipline drives the connection.
    pub dispatch_mode: DispatchMode,
}

impl Default for Options {
    fn default() -> Options {
        Options {
            socket_name: None,
            title: String::new(),
            fullscreen: false,
            dispatch_mode: DispatchMode::default(),
        }
    }
}

/// Errors during backend bring-up.
#[derive(Debug, Error)]
pub enum BackendError {
    /// No usable compositor; callers treat this as "try another windowing
    /// system".
    #[error(transparent)]
    Connect(#[from] ConnectError),
    /// A bring-up round-trip failed, usually a protocol error.
    #[error("initial round-trip failed: {0}")]
    Dispatch(#[from] DispatchError),
    /// The compositor lacks globals the backend cannot run without.
    #[error("compositor is missing required globals: {0:?}")]
    MissingGlobals(Vec<&'static str>),
    /// The compositor bound our output globals but never advertised any
    /// output, leaving mode selection impossible.
    #[error("no outputs received from compositor")]
    NoOutputs,
    /// The background reader could not be started.
    #[error("could not start the poll thread: {0}")]
    PollThread(#[from] std::io::Error),
}

/// A fully brought-up Wayland windowing backend.
///
/// Field order is drop order: the window's protocol objects go first, then
/// the pump (which joins the poll thread), and the connection last.
#[derive(Debug)]
pub struct Backend {
    window: Window,
    event_loop: EventLoop,
    outputs: Arc<Mutex<Vec<Output>>>,
    qh: QueueHandle<WinState>,
    conn: Connection,
}

impl Backend {
    /// Connects and brings up the backend, delivering events to `sink`.
    pub fn new(options: Options, sink: Arc<dyn EventSink>) -> Result<Backend, BackendError> {
        Backend::with_observer(options, sink, Box::new(()))
    }

    /// Like [`Backend::new`], with an observer for globals the backend does
    /// not bind itself.
    pub fn with_observer(
        options: Options,
        sink: Arc<dyn EventSink>,
        observer: Box<dyn GlobalObserver>,
    ) -> Result<Backend, BackendError> {
        let conn = Connection::connect(options.socket_name.as_deref())?;
        let mut queue = conn.new_event_queue::<WinState>();
        let qh = queue.handle();

        let actions = ActionQueue::new();
        let handle = EventLoopHandle::new(actions.clone(), sink);
        let outputs = Arc::new(Mutex::new(Vec::new()));
        let mut state = WinState::new(handle.clone(), outputs.clone(), observer);

        // First round-trip: the registry burst, which issues the binds.
        let _registry = conn.wayland().display().get_registry(&qh, ());
        conn.roundtrip(&mut queue, &mut state)?;

        let missing = state.missing_required();
        if !missing.is_empty() {
            return Err(BackendError::MissingGlobals(missing));
        }

        // Second round-trip: the initial event bursts of everything we just
        // bound (output geometry and modes, seat capabilities).
        conn.roundtrip(&mut queue, &mut state)?;
        if outputs.lock().unwrap().is_empty() {
            return Err(BackendError::NoOutputs);
        }
        debug!(outputs = outputs.lock().unwrap().len(), "initial output set complete");

        let compositor = state
            .take_compositor()
            .ok_or(BackendError::MissingGlobals(vec!["wl_compositor"]))?;
        let shell = state
            .take_shell()
            .ok_or(BackendError::MissingGlobals(vec!["wl_shell"]))?;

        let surface = compositor.create_surface(&qh);
        let mut shell_surface = shell.get_shell_surface(&surface, &qh);
        if !options.title.is_empty() {
            shell_surface.set_title(&options.title);
        }
        if options.fullscreen {
            let outputs_guard = outputs.lock().unwrap();
            shell_surface.set_fullscreen(outputs_guard.first().map(|o| o.wl_output()));
        } else {
            shell_surface.set_toplevel();
        }
        surface.commit();
        let window = Window::new(surface, shell_surface, compositor);

        // Third round-trip: settle the input devices created from the seat
        // capabilities, most importantly the keymap.
        conn.roundtrip(&mut queue, &mut state)?;

        let strategy: Arc<dyn DispatchStrategy> = match options.dispatch_mode {
            DispatchMode::Threaded => Arc::new(ThreadedStrategy::start(
                conn.wayland().clone(),
                queue,
                state,
                actions,
            )?),
            DispatchMode::ReadGuard => Arc::new(ReadGuardStrategy::start(
                conn.wayland().clone(),
                queue,
                state,
                actions,
            )?),
        };
        let event_loop = EventLoop::new(handle, strategy);
        info!(mode = ?options.dispatch_mode, "backend up");

        Ok(Backend {
            window,
            event_loop,
            outputs,
            qh,
            conn,
        })
    }

    /// Runs one dispatch pass, see
    /// [`EventLoop::dispatch`](crate::event_loop::EventLoop::dispatch).
    pub fn dispatch(&mut self) {
        self.event_loop.dispatch();
    }

    /// Time until the next armed timer is due, as a poll timeout for the
    /// caller's own wait loop.
    pub fn next_timeout(&self) -> Option<std::time::Duration> {
        self.event_loop.next_timeout()
    }

    /// A handle for posting events and arming timers.
    pub fn handle(&self) -> EventLoopHandle {
        self.event_loop.handle()
    }

    /// The application window.
    pub fn window(&self) -> &Window {
        &self.window
    }

    /// Mutable access to the window, for role and title changes.
    pub fn window_mut(&mut self) -> &mut Window {
        &mut self.window
    }

    /// Resizes the window and re-declares its opaque region.
    pub fn set_window_size(&mut self, width: i32, height: i32) {
        self.window.set_size(&self.qh, width, height);
    }

    /// Runs `f` over the currently known outputs.
    pub fn with_outputs<R>(&self, f: impl FnOnce(&[Output]) -> R) -> R {
        f(&self.outputs.lock().unwrap())
    }

    /// The connection, for callers that need to integrate the socket into
    /// their own readiness loop.
    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}
