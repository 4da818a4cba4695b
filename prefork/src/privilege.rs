//! Privilege de-escalation before running application code.
//!
//! A spawner often starts as root so it can bind sockets or read
//! configuration, but the application itself should run as the user who
//! owns it. The target identity is taken from the owner of the
//! application's entry file, with a configured fallback when that owner is
//! unusable. Switching *to* root is never permitted.

use std::ffi::CString;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::sys::stat;
use nix::unistd::{self, Uid, User};

use crate::error::Result;

/// Configuration for one de-escalation attempt.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct PrivilegeSpec {
    /// Absolute path of the application's entry file; its owner is the
    /// preferred target identity.
    pub entry_file: PathBuf,
    /// Username to switch to when the entry-file owner is root or unknown.
    pub fallback_user: String,
}

impl PrivilegeSpec {
    /// Creates a de-escalation spec from an entry file and fallback user.
    #[must_use]
    pub fn new(entry_file: impl Into<PathBuf>, fallback_user: impl Into<String>) -> Self {
        Self {
            entry_file: entry_file.into(),
            fallback_user: fallback_user.into(),
        }
    }
}

/// Switches the current process to an unprivileged identity.
///
/// Resolution order: the entry file's owner, then `fallback_user`. A
/// candidate is skipped if it is unknown to the user database or is the
/// superuser. If no candidate remains, or the switch itself fails with
/// `EPERM`, de-escalation is abandoned silently and the process keeps its
/// current identity. Any other failure during the switch propagates.
pub fn lower_privilege(entry_file: &Path, fallback_user: &str) -> Result<()> {
    let owner_uid = Uid::from_raw(stat::stat(entry_file)?.st_uid);

    let resolve_and_switch = || -> nix::Result<bool> {
        if switch_to(User::from_uid(owner_uid)?)? {
            return Ok(true);
        }
        switch_to(User::from_name(fallback_user)?)
    };

    match resolve_and_switch() {
        Ok(switched) => {
            if !switched {
                tracing::debug!(
                    entry_file = %entry_file.display(),
                    "no usable unprivileged identity, continuing as-is"
                );
            }
            Ok(())
        }
        // Not privileged enough to switch at all; spawning proceeds
        // at the current level.
        Err(Errno::EPERM) => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Attempts the actual identity switch. Returns `Ok(false)` when the
/// candidate is unusable (unknown, or the superuser).
#[allow(unsafe_code)]
fn switch_to(user: Option<User>) -> nix::Result<bool> {
    let Some(user) = user else {
        return Ok(false);
    };
    if user.uid.is_root() {
        return Ok(false);
    }

    let name = CString::new(user.name.as_str()).map_err(|_| Errno::EINVAL)?;
    unistd::initgroups(&name, user.gid)?;
    unistd::setgid(user.gid)?;
    unistd::setuid(user.uid)?;

    // SAFETY: runs in a freshly forked, single-threaded child.
    unsafe { std::env::set_var("HOME", &user.dir) };

    tracing::debug!(user = %user.name, uid = user.uid.as_raw(), "lowered privilege");
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;

    // These run unprivileged, so no switch can actually happen; they pin
    // down the resolution and swallow-EPERM behavior.

    #[test]
    fn failed_attempt_is_swallowed() {
        // Unprivileged: switching to the binary's owner fails with EPERM,
        // which is swallowed. As root: the root-owned binary is refused
        // and the unknown fallback leaves the identity untouched.
        let exe = std::env::current_exe().unwrap();
        lower_privilege(&exe, "prefork-no-such-user").unwrap();
    }

    #[test]
    fn root_owned_entry_falls_back_without_switching() {
        // "/" is root-owned; root is refused as a target, and a fallback
        // that does not exist leaves privileges untouched.
        lower_privilege(Path::new("/"), "prefork-no-such-user").unwrap();
    }

    #[test]
    fn missing_entry_file_propagates() {
        let err = lower_privilege(Path::new("/prefork-does-not-exist"), "nobody");
        assert!(err.is_err());
    }

    #[test]
    fn root_is_never_a_switch_target() {
        let switched = switch_to(User::from_uid(Uid::from_raw(0)).unwrap()).unwrap();
        assert!(!switched);
    }
}
