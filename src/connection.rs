//! Compositor connection and synchronization round-trips.

use std::os::unix::net::UnixStream;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};
use wayland_client::protocol::wl_callback::WlCallback;
use wayland_client::{DispatchError, EventQueue};

/// Errors establishing the compositor connection.
///
/// Connecting is the compatibility probe of the whole backend: callers treat
/// a failure here as "no usable compositor" and fall back to another
/// windowing system rather than aborting.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// `XDG_RUNTIME_DIR` is not set, so a named socket cannot be located.
    #[error("XDG_RUNTIME_DIR is not set in the environment")]
    NoRuntimeDir,
    /// A named socket exists but could not be opened.
    #[error("could not open compositor socket {path}: {source}")]
    Socket {
        /// Full path of the socket that failed to open.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },
    /// The connection handshake with the compositor failed.
    #[error("could not connect to the compositor: {0}")]
    Handshake(#[from] wayland_client::ConnectError),
}

/// An established connection to the compositor.
///
/// Exclusively owned by the backend. Requests buffered at drop time are
/// flushed on a best-effort basis before the socket closes.
#[derive(Debug)]
pub struct Connection {
    conn: wayland_client::Connection,
    sync_outstanding: AtomicBool,
}

/// User data of an in-flight `wl_display.sync` callback.
#[derive(Debug, Clone)]
pub struct SyncToken {
    fired: Arc<AtomicBool>,
}

impl SyncToken {
    /// Marks the round-trip as completed. Called from the `wl_callback`
    /// listener.
    pub(crate) fn fire(&self) {
        self.fired.store(true, Ordering::SeqCst);
    }
}

impl Connection {
    /// Connects to the compositor.
    ///
    /// An explicit `name` connects to `$XDG_RUNTIME_DIR/<name>`; otherwise
    /// the socket is discovered from the environment (`WAYLAND_DISPLAY`,
    /// `WAYLAND_SOCKET`).
    pub fn connect(name: Option<&str>) -> Result<Connection, ConnectError> {
        match name {
            Some(name) => Connection::connect_named(std::env::var_os("XDG_RUNTIME_DIR"), name),
            None => {
                let conn = wayland_client::Connection::connect_to_env()?;
                info!("connected to wayland compositor");
                Ok(Connection::from_wayland(conn))
            }
        }
    }

    /// Connects to `<runtime_dir>/<name>`. The directory is injected so the
    /// lookup does not depend on process-global state.
    fn connect_named(
        runtime_dir: Option<std::ffi::OsString>,
        name: &str,
    ) -> Result<Connection, ConnectError> {
        let dir = runtime_dir.ok_or(ConnectError::NoRuntimeDir)?;
        let path = PathBuf::from(dir).join(name);
        debug!("connecting to explicitly named socket {}", path.display());
        let stream =
            UnixStream::connect(&path).map_err(|source| ConnectError::Socket { path, source })?;
        let conn = wayland_client::Connection::from_socket(stream)?;
        info!("connected to wayland compositor");
        Ok(Connection::from_wayland(conn))
    }

    fn from_wayland(conn: wayland_client::Connection) -> Connection {
        Connection {
            conn,
            sync_outstanding: AtomicBool::new(false),
        }
    }

    /// The underlying protocol connection.
    pub fn wayland(&self) -> &wayland_client::Connection {
        &self.conn
    }

    /// Creates an event queue whose callbacks target `S`.
    pub fn new_event_queue<S>(&self) -> EventQueue<S> {
        self.conn.new_event_queue()
    }

    /// Blocks until the compositor has processed every request sent so far.
    ///
    /// Issues a `wl_display.sync` token and pumps the queue until the token
    /// fires. There is deliberately no timeout: an unresponsive compositor
    /// blocks here just like any other blocking dispatch would.
    ///
    /// # Panics
    ///
    /// Panics if a round-trip is already in flight on this connection. The
    /// token is issued and retired on the same thread, so overlap is always
    /// a caller bug.
    pub fn roundtrip<S>(&self, queue: &mut EventQueue<S>, state: &mut S) -> Result<(), DispatchError>
    where
        S: wayland_client::Dispatch<WlCallback, SyncToken> + 'static,
    {
        self.begin_sync();
        let fired = Arc::new(AtomicBool::new(false));
        self.conn.display().sync(
            &queue.handle(),
            SyncToken {
                fired: fired.clone(),
            },
        );

        let mut result = Ok(());
        while !fired.load(Ordering::SeqCst) {
            if let Err(err) = queue.blocking_dispatch(state) {
                result = Err(err);
                break;
            }
        }
        self.end_sync();
        result
    }

    fn begin_sync(&self) {
        assert!(
            !self.sync_outstanding.swap(true, Ordering::SeqCst),
            "a synchronization round-trip is already in flight on this connection"
        );
    }

    fn end_sync(&self) {
        self.sync_outstanding.store(false, Ordering::SeqCst);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(err) = self.conn.flush() {
            warn!("could not flush connection on shutdown: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn paired_connection() -> Connection {
        let (client, _server) = UnixStream::pair().unwrap();
        Connection {
            conn: wayland_client::Connection::from_socket(client).unwrap(),
            sync_outstanding: AtomicBool::new(false),
        }
    }

    #[test]
    fn sync_token_can_be_reacquired_after_release() {
        let conn = paired_connection();
        conn.begin_sync();
        conn.end_sync();
        conn.begin_sync();
        conn.end_sync();
    }

    #[test]
    #[should_panic(expected = "already in flight")]
    fn overlapping_sync_tokens_panic() {
        let conn = paired_connection();
        conn.begin_sync();
        conn.begin_sync();
    }

    #[test]
    fn missing_runtime_dir_is_reported() {
        let result = Connection::connect_named(None, "wayland-test-0");
        assert!(matches!(result, Err(ConnectError::NoRuntimeDir)));
    }

    #[test]
    fn unopenable_socket_reports_its_path() {
        let dir = std::env::temp_dir().join("waywin-no-such-dir");
        let result = Connection::connect_named(Some(dir.clone().into()), "wayland-test-0");
        match result {
            Err(ConnectError::Socket { path, .. }) => {
                assert_eq!(path, dir.join("wayland-test-0"));
            }
            other => panic!("unexpected result {other:?}"),
        }
    }
}
