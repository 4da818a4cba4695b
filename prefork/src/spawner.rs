//! The spawner server: owns one preloaded application image and answers
//! repeated spawn requests, plus the one-shot cold-spawn path that boots
//! without a preloader.

use std::fs;
use std::io;
use std::os::fd::{AsFd, AsRawFd};
use std::path::{Path, PathBuf};
use std::process;

use nix::sys::wait::waitpid;
use nix::unistd::{self, ForkResult, Pid};
use prefork_proto::{Channel, SpawnRequest, WorkerHello};

use crate::boot::BootProcedure;
use crate::endpoint::EndpointFactory;
use crate::error::{Error, Result};
use crate::lifecycle;
use crate::loader::ImageLoader;
use crate::privilege::PrivilegeSpec;
use crate::sequencer;
use crate::status;
use crate::worker::Worker;

/// Relative path checked (and used as the de-escalation reference) inside
/// an application root by default.
pub const DEFAULT_ENTRY_FILE: &str = "config/app.toml";

/// Immutable identity of one managed application.
#[derive(Debug, Clone)]
pub struct SpawnerOptions {
    app_root: PathBuf,
    environment: String,
    lower_privilege: bool,
    fallback_user: String,
    entry_file: PathBuf,
}

impl SpawnerOptions {
    /// Options for the application rooted at `app_root`, with the
    /// production environment, no privilege lowering, and the default
    /// entry file.
    pub fn new(app_root: impl Into<PathBuf>) -> Self {
        Self {
            app_root: app_root.into(),
            environment: "production".to_owned(),
            lower_privilege: false,
            fallback_user: "nobody".to_owned(),
            entry_file: PathBuf::from(DEFAULT_ENTRY_FILE),
        }
    }

    /// Sets the environment name exported to the boot procedure.
    #[must_use]
    pub fn environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into();
        self
    }

    /// Enables or disables privilege de-escalation before boot.
    #[must_use]
    pub fn lower_privilege(mut self, enabled: bool) -> Self {
        self.lower_privilege = enabled;
        self
    }

    /// Sets the fallback unprivileged username for de-escalation.
    #[must_use]
    pub fn fallback_user(mut self, user: impl Into<String>) -> Self {
        self.fallback_user = user.into();
        self
    }

    /// Sets the entry file checked at construction and used as the
    /// de-escalation ownership reference, relative to the root.
    #[must_use]
    pub fn entry_file(mut self, entry_file: impl Into<PathBuf>) -> Self {
        self.entry_file = entry_file.into();
        self
    }

    /// The application root.
    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    /// Checks that the root exists and superficially resembles an
    /// application (the entry file is present).
    ///
    /// Spawning performs this check itself before creating any process;
    /// it is public so embedders can validate configuration up front.
    pub fn validate(&self) -> Result<()> {
        let invalid = |reason: String| Error::InvalidAppRoot {
            root: self.app_root.clone(),
            reason,
        };

        let meta = fs::metadata(&self.app_root)
            .map_err(|e| invalid(format!("cannot stat application root: {e}")))?;
        if !meta.is_dir() {
            return Err(invalid("not a directory".to_owned()));
        }
        let entry = self.app_root.join(&self.entry_file);
        if !entry.exists() {
            return Err(invalid(format!(
                "missing entry file {}",
                self.entry_file.display()
            )));
        }
        Ok(())
    }

    /// De-escalation spec for the booting process, if enabled.
    fn privilege_spec(&self) -> Option<PrivilegeSpec> {
        self.lower_privilege.then(|| PrivilegeSpec {
            entry_file: self.app_root.join(&self.entry_file),
            fallback_user: self.fallback_user.clone(),
        })
    }
}

/// A running preloader and the control channel to it.
///
/// Construction boots the application image once inside a forked preloader
/// process; every [`spawn`](Self::spawn) after that is a cheap
/// copy-on-write fork of that warm image.
#[derive(Debug)]
pub struct Spawner {
    app_root: PathBuf,
    preloader: Pid,
    channel: Option<Channel>,
}

impl Spawner {
    /// Starts the preloader and boots the application image inside it.
    ///
    /// A boot failure is reported back over the control channel, reaped,
    /// and raised here as the corresponding typed error; the server never
    /// comes up half-booted.
    #[allow(unsafe_code)]
    pub fn start(
        options: SpawnerOptions,
        boot: impl BootProcedure,
        endpoints: impl EndpointFactory,
    ) -> Result<Self> {
        options.validate()?;
        let (parent_end, child_end) = Channel::pair()?;

        // SAFETY: the child branch never returns to the caller's stack;
        // it either becomes the preloader's serve loop or exits.
        match unsafe { unistd::fork() }? {
            ForkResult::Child => {
                drop(parent_end);
                preloader_main(child_end, &options, &boot, &endpoints)
            }
            ForkResult::Parent { child } => {
                drop(child_end);
                let mut channel = parent_end;
                tracing::debug!(
                    app_root = %options.app_root.display(),
                    preloader = child.as_raw(),
                    "preloader forked, waiting for boot report"
                );
                match status::receive_and_raise(&mut channel, &options.app_root) {
                    Ok(()) => Ok(Self {
                        app_root: options.app_root,
                        preloader: child,
                        channel: Some(channel),
                    }),
                    Err(e) => {
                        drop(channel);
                        let _ = waitpid(child, None);
                        Err(e)
                    }
                }
            }
        }
    }

    /// Forks one worker from the preloaded image.
    ///
    /// Every failure to talk to the preloader surfaces as
    /// [`Error::SpawnerUnavailable`]; no retry is attempted.
    pub fn spawn(&mut self) -> Result<Worker> {
        let channel = self.channel.as_mut().ok_or_else(|| Error::SpawnerUnavailable {
            source: io::Error::new(io::ErrorKind::NotConnected, "spawner already stopped"),
        })?;

        let unavailable = |source: io::Error| Error::SpawnerUnavailable { source };
        channel.send(&SpawnRequest::Spawn).map_err(unavailable)?;
        let hello: WorkerHello = channel.recv().map_err(unavailable)?;
        let owner_pipe = channel.recv_fd().map_err(unavailable)?;
        tracing::debug!(pid = hello.pid, endpoint = %hello.endpoint_name, "worker spawned");
        Ok(Worker::new(hello, owner_pipe))
    }

    /// Root of the application this server preloaded.
    pub fn app_root(&self) -> &Path {
        &self.app_root
    }

    /// Process id of the preloader.
    pub fn preloader_pid(&self) -> i32 {
        self.preloader.as_raw()
    }

    /// Shuts the preloader down and reaps it.
    pub fn stop(mut self) -> Result<()> {
        self.shutdown()
    }

    /// Closes the control channel and reaps the preloader.
    fn shutdown(&mut self) -> Result<()> {
        if let Some(channel) = self.channel.take() {
            // EOF on the control channel ends the serve loop.
            drop(channel);
            waitpid(self.preloader, None)?;
        }
        Ok(())
    }
}

impl Drop for Spawner {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

/// Body of the preloader process. Never returns.
fn preloader_main(
    mut channel: Channel,
    options: &SpawnerOptions,
    boot: &dyn BootProcedure,
    endpoints: &dyn EndpointFactory,
) -> ! {
    lifecycle::set_process_title("prefork-preload");
    let loader = ImageLoader::new(&options.environment, &options.app_root);
    let privilege = options.privilege_spec();

    let booted = status::report(&mut channel, || loader.load(boot, privilege.as_ref()));
    match booted {
        Ok(true) => {
            serve(channel, options, boot, endpoints);
            process::exit(0);
        }
        Ok(false) | Err(_) => process::exit(1),
    }
}

/// Serve loop: one warm fork per request, until the owner goes away.
fn serve(
    mut channel: Channel,
    options: &SpawnerOptions,
    boot: &dyn BootProcedure,
    endpoints: &dyn EndpointFactory,
) {
    loop {
        match channel.recv::<SpawnRequest>() {
            Ok(SpawnRequest::Spawn) => {
                if let Err(e) = handle_spawn(&mut channel, options, boot, endpoints) {
                    // Exiting closes the control channel, which the
                    // blocked client observes as "spawner gone".
                    tracing::error!(error = %e, "worker handoff failed");
                    break;
                }
            }
            Ok(other) => {
                tracing::error!(?other, "unexpected request on control channel");
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
            Err(e) => {
                tracing::error!(error = %e, "control channel failed");
                break;
            }
        }
    }
}

/// Forks one worker from the warm image and relays its identity.
#[allow(unsafe_code)]
fn handle_spawn(
    channel: &mut Channel,
    options: &SpawnerOptions,
    boot: &dyn BootProcedure,
    endpoints: &dyn EndpointFactory,
) -> Result<()> {
    let (mut ours, theirs) = Channel::pair()?;

    let control_fd = channel.as_raw_fd();
    let parent_fd = ours.as_raw_fd();
    let app_root = options.app_root.clone();

    lifecycle::prepare_forking_image();
    lifecycle::double_fork("worker", move || {
        // Drop inherited copies of the spawner-side channel ends so the
        // worker cannot keep them alive past the preloader's death.
        // SAFETY: this forked child owns its fd table; the parent's
        // descriptors are unaffected.
        unsafe {
            libc::close(control_fd);
            libc::close(parent_fd);
        }
        sequencer::launch(theirs, boot, endpoints, &app_root);
    })?;

    // The closure (and with it this process's copy of `theirs`) is gone
    // once double_fork returns, so the reads below see EOF if the worker
    // dies before reporting.
    let hello: WorkerHello = ours.recv()?;
    let owner_pipe = ours.recv_fd()?;
    channel.send(&hello)?;
    channel.send_fd(owner_pipe.as_fd())?;
    Ok(())
}

/// Boots the application from scratch in a freshly forked process, with no
/// preloader, and returns the resulting worker.
///
/// The caller must not already hold conflicting application state of its
/// own; that precondition is the embedding framework's obligation and is
/// deliberately not enforced here.
#[allow(unsafe_code)]
pub fn spawn_cold(
    options: SpawnerOptions,
    boot: impl BootProcedure,
    endpoints: impl EndpointFactory,
) -> Result<Worker> {
    options.validate()?;
    let (mut ours, theirs) = Channel::pair()?;
    let parent_fd = ours.as_raw_fd();
    let app_root = options.app_root.clone();

    lifecycle::double_fork("cold-spawn", move || {
        // SAFETY: as in handle_spawn; this child's fd table is its own.
        unsafe {
            libc::close(parent_fd);
        }
        let mut channel = theirs;
        lifecycle::set_process_title("prefork-boot");
        let loader = ImageLoader::new(&options.environment, &options.app_root);
        let privilege = options.privilege_spec();
        match status::report(&mut channel, || loader.load(&boot, privilege.as_ref())) {
            // Same process carries on into serving: there is no separate
            // preloader to keep alive in a cold spawn.
            Ok(true) => sequencer::launch(channel, &boot, &endpoints, &options.app_root),
            Ok(false) | Err(_) => process::exit(1),
        }
    })?;

    status::receive_and_raise(&mut ours, &app_root)?;
    let hello: WorkerHello = ours.recv().map_err(closed_or_io)?;
    let owner_pipe = ours.recv_fd().map_err(closed_or_io)?;
    tracing::debug!(pid = hello.pid, endpoint = %hello.endpoint_name, "cold worker spawned");
    Ok(Worker::new(hello, owner_pipe))
}

/// Maps a premature channel close to the connection-closed error.
fn closed_or_io(e: io::Error) -> Error {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        Error::ConnectionClosed
    } else {
        Error::Io(e)
    }
}
