//! Error types for prefork operations.

use std::path::PathBuf;

/// Alias for `Result<T, prefork::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the spawner.
///
/// Faults that originate inside a forked child never cross the process
/// boundary natively; they arrive as a serialized status message and are
/// reconstructed here, so a failed spawn always yields exactly one typed
/// error with enough context to diagnose it.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// The application root is missing or does not look like an application.
    #[error("invalid application root {root:?}: {reason}")]
    InvalidAppRoot {
        /// The rejected root path.
        root: PathBuf,
        /// Why the root was rejected.
        reason: String,
    },

    /// The application boot procedure raised a fault.
    #[error("application at {app_root:?} failed to start: {class}: {message}")]
    Boot {
        /// Root of the application whose boot failed.
        app_root: PathBuf,
        /// Category name of the originating fault.
        class: String,
        /// Message text of the originating fault.
        message: String,
    },

    /// The application exited during startup instead of completing boot.
    #[error("application at {app_root:?} exited during startup")]
    BootExited {
        /// Root of the application whose boot was aborted.
        app_root: PathBuf,
    },

    /// The preloader process is gone or its control channel failed.
    #[error("spawner exited unexpectedly: {source}")]
    SpawnerUnavailable {
        /// The underlying channel failure.
        #[source]
        source: std::io::Error,
    },

    /// A channel closed before a status or worker identity was fully read.
    #[error("connection closed before the peer reported anything")]
    ConnectionClosed,

    /// An I/O error in the caller's own spawn handling.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// An OS-level failure outside the swallowed privilege-switch cases.
    #[cfg(unix)]
    #[error(transparent)]
    Errno(#[from] nix::errno::Errno),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_error_carries_class_and_message_verbatim() {
        let err = Error::Boot {
            app_root: PathBuf::from("/srv/app"),
            class: "ConfigError".into(),
            message: "missing config".into(),
        };
        let text = err.to_string();
        assert!(text.contains("ConfigError"));
        assert!(text.contains("missing config"));
        assert!(text.contains("/srv/app"));
    }

    #[test]
    fn boot_exited_mentions_startup() {
        let err = Error::BootExited {
            app_root: PathBuf::from("/srv/app"),
        };
        assert!(err.to_string().contains("exited during startup"));
    }
}
