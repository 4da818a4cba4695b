//! Wires a freshly forked process into a running request-serving worker.

use std::io;
use std::os::fd::AsFd;
use std::path::Path;
use std::process;

use nix::unistd;
use prefork_proto::{Channel, WorkerHello};

use crate::boot::BootProcedure;
use crate::endpoint::EndpointFactory;
use crate::lifecycle;

/// Turns the current (just-forked, warm or cold) process into a serving
/// worker and reports its identity over `channel`. Never returns.
///
/// If anything fails before the identity is transmitted, the process exits
/// with the channel unsent, which the waiting parent observes as a closed
/// channel with no data.
pub fn launch(
    channel: Channel,
    boot: &dyn BootProcedure,
    endpoints: &dyn EndpointFactory,
    app_root: &Path,
) -> ! {
    let code = match run(channel, boot, endpoints) {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(app_root = %app_root.display(), error = %e, "worker failed");
            1
        }
    };
    process::exit(code);
}

/// Worker setup and service loop; the exit code is decided by [`launch`].
fn run(
    mut channel: Channel,
    boot: &dyn BootProcedure,
    endpoints: &dyn EndpointFactory,
) -> io::Result<()> {
    lifecycle::set_process_title("prefork-worker");

    // The write end stays open in this process for exactly as long as it
    // lives; the read end travels to the worker's owner, whose poll sees
    // end-of-stream the moment this process dies.
    let (owner_read, owner_write) = unistd::pipe()?;

    // The fork shares any connection handles opened during boot with the
    // fork source; give the application a chance to reopen them.
    boot.after_fork();

    let mut endpoint = endpoints.create(owner_write)?;
    lifecycle::install_termination_handlers().map_err(|e| io::Error::other(e.to_string()))?;

    // The endpoint socket exists at this point, so the name is safe to
    // advertise. Status-before-identity ordering is the caller's concern;
    // nothing was written on `channel` before this.
    let hello = WorkerHello::new(
        unistd::getpid().as_raw(),
        endpoint.endpoint_name(),
        endpoint.uses_abstract_namespace(),
    );
    channel.send(&hello)?;
    channel.send_fd(owner_read.as_fd())?;
    drop(owner_read);
    drop(channel);

    let served = endpoint.run_service_loop();
    endpoint.cleanup();
    served
}
