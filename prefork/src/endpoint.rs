//! The request-serving endpoint collaborator.
//!
//! The spawner only needs four things from an endpoint: a public name, a
//! namespace flag, a blocking service loop, and a cleanup hook. The
//! [`BasicEndpoint`] here is a minimal Unix-socket implementation of that
//! contract, used by the CLI and the integration tests; production
//! embedders supply their own.

use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};

use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};

use crate::lifecycle;

/// A worker's request-serving endpoint.
pub trait Endpoint {
    /// Public name clients connect to.
    fn endpoint_name(&self) -> &str;

    /// Whether the name lives in the Linux abstract socket namespace.
    fn uses_abstract_namespace(&self) -> bool;

    /// Blocks serving requests until shutdown is requested or the worker's
    /// owner disappears.
    fn run_service_loop(&mut self) -> io::Result<()>;

    /// Always runs after the service loop, on any exit path.
    fn cleanup(&mut self);
}

/// Builds an endpoint inside a freshly forked worker.
///
/// `owner_pipe` is the worker-side end of the liveness pipe; the endpoint
/// keeps it open for as long as the service loop runs and may poll it to
/// notice that the worker's owner dropped the other end.
pub trait EndpointFactory {
    /// Creates the endpoint. The socket must exist before this returns,
    /// since the worker transmits the name immediately afterwards.
    fn create(&self, owner_pipe: OwnedFd) -> io::Result<Box<dyn Endpoint>>;
}

/// Per-connection handler for [`BasicEndpoint`].
pub type ConnectionHandler = fn(UnixStream);

/// Distinguishes endpoint sockets created by one process.
static ENDPOINT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Minimal endpoint: a Unix listener dispatching each accepted connection
/// to a handler function, one at a time.
///
/// On Linux the socket lives in the abstract namespace, so nothing is left
/// on disk; elsewhere it is a pathname socket under the temp directory.
#[derive(Debug)]
pub struct BasicEndpoint {
    listener: UnixListener,
    name: String,
    abstract_namespace: bool,
    socket_path: Option<PathBuf>,
    owner_pipe: OwnedFd,
    handler: ConnectionHandler,
}

impl BasicEndpoint {
    /// Binds a fresh endpoint socket for this worker.
    pub fn bind(owner_pipe: OwnedFd, handler: ConnectionHandler) -> io::Result<Self> {
        let seq = ENDPOINT_SEQ.fetch_add(1, Ordering::Relaxed);
        let requested = format!("prefork.{}.{seq}", std::process::id());
        let (listener, name, abstract_namespace, socket_path) = bind_listener(requested)?;
        Ok(Self {
            listener,
            name,
            abstract_namespace,
            socket_path,
            owner_pipe,
            handler,
        })
    }
}

/// Binds the endpoint socket in the abstract namespace.
#[cfg(target_os = "linux")]
fn bind_listener(name: String) -> io::Result<(UnixListener, String, bool, Option<PathBuf>)> {
    use std::os::fd::AsRawFd;

    use nix::sys::socket::{
        AddressFamily, Backlog, SockFlag, SockType, UnixAddr, bind, listen, socket,
    };

    let fd = socket(
        AddressFamily::Unix,
        SockType::Stream,
        SockFlag::SOCK_CLOEXEC,
        None,
    )
    .map_err(io::Error::from)?;
    let addr = UnixAddr::new_abstract(name.as_bytes()).map_err(io::Error::from)?;
    bind(fd.as_raw_fd(), &addr).map_err(io::Error::from)?;
    let backlog = Backlog::new(16).map_err(io::Error::from)?;
    listen(&fd, backlog).map_err(io::Error::from)?;
    Ok((UnixListener::from(fd), name, true, None))
}

/// Binds the endpoint socket as a pathname socket under the temp directory.
#[cfg(not(target_os = "linux"))]
fn bind_listener(name: String) -> io::Result<(UnixListener, String, bool, Option<PathBuf>)> {
    let path = std::env::temp_dir().join(format!("{name}.sock"));
    let listener = UnixListener::bind(&path)?;
    let name = path.to_string_lossy().into_owned();
    Ok((listener, name, false, Some(path)))
}

impl Endpoint for BasicEndpoint {
    fn endpoint_name(&self) -> &str {
        &self.name
    }

    fn uses_abstract_namespace(&self) -> bool {
        self.abstract_namespace
    }

    fn run_service_loop(&mut self) -> io::Result<()> {
        loop {
            if lifecycle::shutdown_requested() {
                return Ok(());
            }

            let mut fds = [
                PollFd::new(self.listener.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.owner_pipe.as_fd(), PollFlags::empty()),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                // A termination signal interrupted the wait; re-check
                // the shutdown flag.
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
                Ok(_) => {}
            }

            let owner_gone = fds[1]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLERR | PollFlags::POLLHUP));
            if owner_gone {
                tracing::debug!(endpoint = %self.name, "owner pipe closed, shutting down");
                return Ok(());
            }

            let accept_ready = fds[0]
                .revents()
                .is_some_and(|r| r.contains(PollFlags::POLLIN));
            if accept_ready {
                match self.listener.accept() {
                    Ok((stream, _addr)) => (self.handler)(stream),
                    Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                    Err(e) => return Err(e),
                }
            }
        }
    }

    fn cleanup(&mut self) {
        if let Some(path) = self.socket_path.take() {
            let _ = std::fs::remove_file(path);
        }
    }
}

/// Factory producing [`BasicEndpoint`]s with a fixed connection handler.
#[derive(Debug, Clone, Copy)]
pub struct BasicEndpointFactory {
    handler: ConnectionHandler,
}

impl BasicEndpointFactory {
    /// Creates a factory dispatching connections to `handler`.
    #[must_use]
    pub fn new(handler: ConnectionHandler) -> Self {
        Self { handler }
    }
}

impl EndpointFactory for BasicEndpointFactory {
    fn create(&self, owner_pipe: OwnedFd) -> io::Result<Box<dyn Endpoint>> {
        Ok(Box::new(BasicEndpoint::bind(owner_pipe, self.handler)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::pipe;

    #[test]
    fn bind_produces_connectable_name() {
        let (_r, w) = pipe().unwrap();
        let endpoint = BasicEndpoint::bind(w, |_stream| {}).unwrap();
        assert!(!endpoint.endpoint_name().is_empty());
        #[cfg(target_os = "linux")]
        assert!(endpoint.uses_abstract_namespace());
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn abstract_socket_accepts_connections() {
        use std::os::fd::AsRawFd;

        use nix::sys::socket::{
            AddressFamily, SockFlag, SockType, UnixAddr, connect, socket,
        };

        let (_r, w) = pipe().unwrap();
        let endpoint = BasicEndpoint::bind(w, |_stream| {}).unwrap();

        let client = socket(
            AddressFamily::Unix,
            SockType::Stream,
            SockFlag::empty(),
            None,
        )
        .unwrap();
        let addr = UnixAddr::new_abstract(endpoint.endpoint_name().as_bytes()).unwrap();
        connect(client.as_raw_fd(), &addr).unwrap();
    }
}
