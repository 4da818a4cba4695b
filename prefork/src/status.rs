//! Boot-outcome reporting across a process boundary.
//!
//! A forked child runs its boot attempt through [`report`], which writes
//! exactly one [`StatusMessage`] before any other traffic on the channel.
//! The waiting parent calls [`receive_and_raise`] to turn that message back
//! into a typed error, so faults never cross the boundary as anything but
//! serialized payloads.

use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::process;

use prefork_proto::{Channel, Fault, StatusMessage};

use crate::boot::BootError;
use crate::error::{Error, Result};

/// Runs a boot attempt and reports its outcome on `channel`.
///
/// Returns `Ok(true)` iff the attempt succeeded. A panicking attempt is
/// reported as an application fault with class `"panic"`. A deliberate
/// exit request is reported and then honored: the current process
/// terminates with the requested code, so the exit is never swallowed.
pub fn report<F>(channel: &mut Channel, attempt: F) -> io::Result<bool>
where
    F: FnOnce() -> std::result::Result<(), BootError>,
{
    match panic::catch_unwind(AssertUnwindSafe(attempt)) {
        Ok(Ok(())) => {
            channel.send(&StatusMessage::Success)?;
            Ok(true)
        }
        Ok(Err(BootError::Fault(fault))) => {
            channel.send(&StatusMessage::Exception(fault))?;
            Ok(false)
        }
        Ok(Err(BootError::Exit(code))) => {
            let _ = channel.send(&StatusMessage::Exit);
            process::exit(code);
        }
        Err(payload) => {
            let fault = Fault::new("panic", panic_message(payload.as_ref()));
            channel.send(&StatusMessage::Exception(fault))?;
            Ok(false)
        }
    }
}

/// Extracts a printable message from a panic payload.
fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Reads one status message and reconstructs any reported failure.
///
/// A channel closed before the message arrives means the child died
/// without reporting; that surfaces as [`Error::ConnectionClosed`].
pub fn receive_and_raise(channel: &mut Channel, app_root: &Path) -> Result<()> {
    match channel.recv::<StatusMessage>() {
        Ok(StatusMessage::Success) => Ok(()),
        Ok(StatusMessage::Exception(fault)) => Err(Error::Boot {
            app_root: app_root.to_path_buf(),
            class: fault.class,
            message: fault.message,
        }),
        Ok(StatusMessage::Exit) => Err(Error::BootExited {
            app_root: app_root.to_path_buf(),
        }),
        Ok(other) => Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected status message: {other:?}"),
        ))),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Err(Error::ConnectionClosed),
        Err(e) => Err(Error::Io(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn root() -> PathBuf {
        PathBuf::from("/srv/app")
    }

    #[test]
    fn success_roundtrip() {
        let (mut child, mut parent) = Channel::pair().unwrap();
        assert!(report(&mut child, || Ok(())).unwrap());
        receive_and_raise(&mut parent, &root()).unwrap();
    }

    #[test]
    fn fault_is_reconstructed_with_class_and_message() {
        let (mut child, mut parent) = Channel::pair().unwrap();
        let booted = report(&mut child, || {
            Err(BootError::fault("ConfigError", "missing config"))
        })
        .unwrap();
        assert!(!booted);

        let err = receive_and_raise(&mut parent, &root()).unwrap_err();
        let text = err.to_string();
        assert!(text.contains("ConfigError"));
        assert!(text.contains("missing config"));
    }

    #[test]
    fn panic_is_reported_as_fault() {
        let (mut child, mut parent) = Channel::pair().unwrap();
        let booted = report(&mut child, || panic!("boot blew up")).unwrap();
        assert!(!booted);

        let err = receive_and_raise(&mut parent, &root()).unwrap_err();
        assert!(err.to_string().contains("boot blew up"));
    }

    #[test]
    fn closed_channel_is_connection_closed() {
        let (child, mut parent) = Channel::pair().unwrap();
        drop(child);
        let err = receive_and_raise(&mut parent, &root()).unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }
}
