//! The opaque application boot collaborator.
//!
//! The spawner never looks inside the framework's boot sequence; it only
//! drives a [`BootProcedure`] and classifies how it ended. Whatever global
//! state the procedure creates (database handles, caches, loaded code)
//! becomes part of the booting process's image: the copy-on-write fork
//! source in a preloader, discarded state in a cold-spawn child.

use prefork_proto::Fault;

/// How a boot attempt failed.
#[derive(Debug)]
#[non_exhaustive]
pub enum BootError {
    /// A recoverable application-level fault.
    Fault(Fault),
    /// The application asked the booting process to exit.
    Exit(i32),
}

impl BootError {
    /// An application fault with a category name and message.
    #[must_use]
    pub fn fault(class: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Fault(Fault::new(class, message))
    }

    /// A deliberate request to terminate the booting process.
    #[must_use]
    pub fn exit(code: i32) -> Self {
        Self::Exit(code)
    }
}

impl From<Fault> for BootError {
    fn from(fault: Fault) -> Self {
        Self::Fault(fault)
    }
}

impl From<std::io::Error> for BootError {
    fn from(err: std::io::Error) -> Self {
        Self::fault("Io", err.to_string())
    }
}

/// A zero-argument application boot procedure.
///
/// `boot` runs at most once per process and either returns normally,
/// reports an application-domain fault, or requests process exit.
pub trait BootProcedure {
    /// Executes the application's boot sequence in the current process.
    fn boot(&self) -> Result<(), BootError>;

    /// Runs in a freshly forked worker before it starts serving.
    ///
    /// Database connections opened during boot are shared with the fork
    /// source after `fork()`; reopen them here so two processes never
    /// interleave writes on one handle.
    fn after_fork(&self) {}
}

impl<F> BootProcedure for F
where
    F: Fn() -> Result<(), BootError>,
{
    fn boot(&self) -> Result<(), BootError> {
        self()
    }
}
