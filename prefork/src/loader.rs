//! Drives the opaque application boot procedure inside the current process.

use std::env;
use std::path::PathBuf;

use crate::boot::{BootError, BootProcedure};
use crate::privilege::{self, PrivilegeSpec};

/// Environment variable carrying the target environment name into the
/// application's boot sequence.
pub const ENV_NAME_VAR: &str = "APP_ENV";

/// Boots an application image in the current process.
///
/// Run at most once per process, always under
/// [`report`](crate::status::report) so the outcome is observed exactly
/// once. Everything the boot procedure leaves behind in process memory is
/// the preloaded image when this runs in a preloader, or worker state when
/// it runs in a cold-spawn child.
#[derive(Debug, Clone)]
pub struct ImageLoader {
    environment: String,
    app_root: PathBuf,
}

impl ImageLoader {
    /// Creates a loader for the given environment name and application root.
    pub fn new(environment: impl Into<String>, app_root: impl Into<PathBuf>) -> Self {
        Self {
            environment: environment.into(),
            app_root: app_root.into(),
        }
    }

    /// Exports the environment name, moves into the application root,
    /// optionally lowers privilege, and invokes the boot procedure.
    ///
    /// Directory and privilege failures are mapped to [`BootError::Fault`]
    /// so they cross the process boundary as serialized faults like any
    /// other boot failure.
    #[allow(unsafe_code)]
    pub fn load(
        &self,
        boot: &dyn BootProcedure,
        privilege: Option<&PrivilegeSpec>,
    ) -> Result<(), BootError> {
        // SAFETY: runs in a freshly forked, single-threaded child.
        unsafe { env::set_var(ENV_NAME_VAR, &self.environment) };

        env::set_current_dir(&self.app_root)?;

        if let Some(spec) = privilege {
            privilege::lower_privilege(&spec.entry_file, &spec.fallback_user)
                .map_err(|e| BootError::fault("PrivilegeError", e.to_string()))?;
        }

        boot.boot()
    }
}
