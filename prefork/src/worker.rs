//! Handle to a spawned worker process.

use std::os::fd::{AsFd, BorrowedFd, OwnedFd};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use prefork_proto::WorkerHello;

/// Identity of a successfully spawned worker, as returned by a spawn call.
///
/// The caller owns the read end of the worker's liveness pipe: the worker
/// keeps the write end open until it dies, so end-of-stream here means the
/// worker is gone. Dropping this handle releases the pipe, which the
/// worker's endpoint treats as a shutdown request from its owner.
#[derive(Debug)]
pub struct Worker {
    pid: i32,
    endpoint_name: String,
    abstract_namespace: bool,
    owner_pipe: OwnedFd,
}

impl Worker {
    /// Builds the handle from a received greeting and pipe descriptor.
    pub(crate) fn new(hello: WorkerHello, owner_pipe: OwnedFd) -> Self {
        Self {
            pid: hello.pid,
            endpoint_name: hello.endpoint_name,
            abstract_namespace: hello.abstract_namespace,
            owner_pipe,
        }
    }

    /// Process id of the worker.
    pub fn pid(&self) -> i32 {
        self.pid
    }

    /// Public name of the worker's request-serving endpoint.
    pub fn endpoint_name(&self) -> &str {
        &self.endpoint_name
    }

    /// Whether the endpoint name lives in the abstract socket namespace.
    pub fn uses_abstract_namespace(&self) -> bool {
        self.abstract_namespace
    }

    /// The read end of the worker's liveness pipe.
    pub fn owner_pipe(&self) -> BorrowedFd<'_> {
        self.owner_pipe.as_fd()
    }

    /// Non-blocking liveness probe via the owner pipe.
    pub fn is_alive(&self) -> bool {
        let mut fds = [PollFd::new(self.owner_pipe.as_fd(), PollFlags::empty())];
        match poll(&mut fds, PollTimeout::ZERO) {
            Ok(0) => true,
            Ok(_) => !fds[0]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLHUP | PollFlags::POLLERR)),
            Err(_) => false,
        }
    }

    /// Blocks until the worker process terminates.
    pub fn wait_until_exit(&self) -> std::io::Result<()> {
        loop {
            let mut fds = [PollFd::new(self.owner_pipe.as_fd(), PollFlags::empty())];
            match poll(&mut fds, PollTimeout::NONE) {
                Err(nix::errno::Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
                Ok(_) => {}
            }
            if fds[0]
                .revents()
                .is_some_and(|r| r.intersects(PollFlags::POLLHUP | PollFlags::POLLERR))
            {
                return Ok(());
            }
        }
    }

    /// Releases the owner pipe to the caller, consuming the handle.
    #[must_use]
    pub fn into_owner_pipe(self) -> OwnedFd {
        self.owner_pipe
    }
}
