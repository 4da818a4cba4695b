//! Process lifecycle primitives: double-forking, pre-fork hygiene, and
//! termination-signal classification.

use std::panic::{self, AssertUnwindSafe};
use std::process;
use std::sync::atomic::{AtomicBool, Ordering};

use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::{self, ForkResult};

use crate::error::Result;

/// Signal requesting a graceful worker shutdown.
pub const SOFT_TERMINATION_SIGNAL: Signal = Signal::SIGUSR1;

/// Signal requesting an immediate worker shutdown.
pub const HARD_TERMINATION_SIGNAL: Signal = Signal::SIGTERM;

/// Set by the termination-signal handlers, read by service loops.
static SHUTDOWN_REQUESTED: AtomicBool = AtomicBool::new(false);

/// Spawns `body` two fork generations down and reaps the intermediate.
///
/// The intermediate child's sole job is to fork the real process and exit
/// immediately; waiting on it here means the grandchild is reparented to
/// the OS reaper and never becomes a zombie of the caller. `body` must
/// terminate its process; if it returns, the grandchild exits 0, and a
/// panic in it exits 1.
#[allow(unsafe_code)]
pub fn double_fork<F>(label: &str, body: F) -> Result<()>
where
    F: FnOnce(),
{
    // SAFETY: the child branches only fork again or run `body`, which owns
    // the process from that point on and never returns to the caller's
    // stack.
    match unsafe { unistd::fork() }? {
        ForkResult::Parent { child } => {
            // Only the intermediate generation is waited on.
            let status = waitpid(child, None)?;
            if !matches!(status, WaitStatus::Exited(_, 0)) {
                tracing::warn!(label, ?status, "intermediate fork exited abnormally");
            }
            Ok(())
        }
        ForkResult::Child => {
            let code = match unsafe { unistd::fork() } {
                Ok(ForkResult::Parent { .. }) => 0,
                Ok(ForkResult::Child) => {
                    match panic::catch_unwind(AssertUnwindSafe(body)) {
                        Ok(()) => 0,
                        Err(_) => {
                            tracing::error!(label, "spawned process body panicked");
                            1
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(label, error = %e, "second fork failed");
                    1
                }
            };
            process::exit(code);
        }
    }
}

/// Pre-fork hygiene for a long-lived fork source.
///
/// On glibc returns the allocator's free pages to the OS so a forked child
/// starts with fewer dirty copy-on-write pages. Purely an optimization;
/// a no-op on runtimes without such a knob.
#[allow(unsafe_code)]
pub fn prepare_forking_image() {
    #[cfg(all(target_os = "linux", target_env = "gnu"))]
    // SAFETY: malloc_trim only walks the allocator's own free lists.
    unsafe {
        libc::malloc_trim(0);
    }
}

/// Signal handler shared by both termination signals.
extern "C" fn flag_shutdown(_signal: libc::c_int) {
    SHUTDOWN_REQUESTED.store(true, Ordering::SeqCst);
}

/// Installs handlers for the two designated termination signals.
///
/// Both handlers only set a flag; `SA_RESTART` is deliberately omitted so
/// a blocking accept or poll returns `EINTR` and the service loop can
/// observe [`shutdown_requested`]. Every other fatal signal keeps its
/// default disposition and terminates the worker abnormally.
#[allow(unsafe_code)]
pub fn install_termination_handlers() -> Result<()> {
    let action = SigAction::new(
        SigHandler::Handler(flag_shutdown),
        SaFlags::empty(),
        SigSet::empty(),
    );
    for sig in [SOFT_TERMINATION_SIGNAL, HARD_TERMINATION_SIGNAL] {
        // SAFETY: the handler performs a single atomic store.
        unsafe { signal::sigaction(sig, &action) }?;
    }
    Ok(())
}

/// Whether a designated termination signal has been received.
pub fn shutdown_requested() -> bool {
    SHUTDOWN_REQUESTED.load(Ordering::SeqCst)
}

/// Sets the current process's visible name, where the platform allows it.
#[allow(unsafe_code)]
pub fn set_process_title(title: &str) {
    #[cfg(target_os = "linux")]
    if let Ok(name) = std::ffi::CString::new(title) {
        // SAFETY: prctl copies the string; the kernel truncates it to its
        // 15-character task-name limit.
        unsafe {
            libc::prctl(libc::PR_SET_NAME, name.as_ptr(), 0, 0, 0);
        }
    }
    #[cfg(not(target_os = "linux"))]
    let _ = title;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::io::Read;
    use std::os::unix::net::UnixStream;

    #[test]
    #[serial]
    fn double_fork_runs_body_in_grandchild() {
        let (mut ours, theirs) = UnixStream::pair().unwrap();
        let own_pid = unistd::getpid();

        double_fork("test", move || {
            use std::io::Write;
            let mut stream = theirs;
            assert_ne!(unistd::getpid(), own_pid);
            let pid = unistd::getpid().as_raw().to_be_bytes();
            stream.write_all(&pid).unwrap();
        })
        .unwrap();

        // The closure's copy of `theirs` is dropped in this process once
        // double_fork returns, so read_exact cannot hang on our own fd.
        let mut buf = [0u8; 4];
        ours.read_exact(&mut buf).unwrap();
        let grandchild = i32::from_be_bytes(buf);
        assert_ne!(grandchild, own_pid.as_raw());
    }

    #[test]
    #[serial]
    fn double_fork_reaps_intermediate() {
        // After double_fork returns, the intermediate is already waited
        // on; a second targeted wait must find no unreaped child.
        double_fork("test", || {}).unwrap();
        let leftover = waitpid(
            unistd::Pid::from_raw(-1),
            Some(nix::sys::wait::WaitPidFlag::WNOHANG),
        );
        assert!(matches!(
            leftover,
            Ok(WaitStatus::StillAlive) | Err(nix::errno::Errno::ECHILD)
        ));
    }

    #[test]
    fn shutdown_flag_starts_clear() {
        assert!(!shutdown_requested());
    }
}
