//! Bidirectional message channel over a Unix socket pair.
//!
//! Carries the length-prefixed frames from [`crate::codec`] in-band and
//! single file descriptors out-of-band via `SCM_RIGHTS` control messages.
//! Both sides of a [`Channel::pair`] survive `fork()`; each process drops
//! the end it does not use.

use std::io::{self, IoSlice, IoSliceMut};
use std::os::fd::{AsRawFd, BorrowedFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;

use nix::cmsg_space;
use nix::sys::socket::{
    ControlMessage, ControlMessageOwned, MsgFlags, UnixAddr, recvmsg, sendmsg,
};
use serde::{Deserialize, Serialize};

/// Marker byte carried in-band alongside an `SCM_RIGHTS` transfer, so the
/// descriptor always occupies exactly one read on the receiving side.
const FD_MARKER: u8 = b'F';

/// One end of a spawner control or handoff channel.
#[derive(Debug)]
pub struct Channel {
    stream: UnixStream,
}

impl AsRawFd for Channel {
    fn as_raw_fd(&self) -> RawFd {
        self.stream.as_raw_fd()
    }
}

impl Channel {
    /// Creates a connected pair of channel ends.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a, b) = UnixStream::pair()?;
        Ok((Self { stream: a }, Self { stream: b }))
    }

    /// Sends one framed message.
    pub fn send<M: Serialize>(&mut self, msg: &M) -> io::Result<()> {
        crate::codec::send(&mut self.stream, msg)
    }

    /// Receives one framed message.
    ///
    /// Returns [`io::ErrorKind::UnexpectedEof`] if the peer closed the
    /// channel before sending anything.
    pub fn recv<T: for<'de> Deserialize<'de>>(&mut self) -> io::Result<T> {
        crate::codec::recv(&mut self.stream)
    }

    /// Transfers a duplicate of `fd` to the peer out-of-band.
    pub fn send_fd(&mut self, fd: BorrowedFd<'_>) -> io::Result<()> {
        let marker = [FD_MARKER];
        let iov = [IoSlice::new(&marker)];
        let fds = [fd.as_raw_fd()];
        let cmsg = [ControlMessage::ScmRights(&fds)];
        sendmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &iov,
            &cmsg,
            MsgFlags::empty(),
            None,
        )
        .map_err(io::Error::from)?;
        Ok(())
    }

    /// Receives one descriptor transferred with [`Channel::send_fd`].
    #[allow(unsafe_code)]
    pub fn recv_fd(&mut self) -> io::Result<OwnedFd> {
        let mut marker = [0u8; 1];
        let mut iov = [IoSliceMut::new(&mut marker)];
        let mut cmsg_buffer = cmsg_space!([RawFd; 1]);
        let msg = recvmsg::<UnixAddr>(
            self.stream.as_raw_fd(),
            &mut iov,
            Some(&mut cmsg_buffer),
            MsgFlags::MSG_CMSG_CLOEXEC,
        )
        .map_err(io::Error::from)?;

        if msg.bytes == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "channel closed before descriptor transfer",
            ));
        }

        for cmsg in msg.cmsgs().map_err(io::Error::from)? {
            if let ControlMessageOwned::ScmRights(fds) = cmsg {
                if let Some(&fd) = fds.first() {
                    // SAFETY: the kernel installed `fd` into this process
                    // for us; nothing else owns it yet.
                    return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
                }
            }
        }

        Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "message carried no descriptor",
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{Fault, StatusMessage};
    use std::io::{Read, Write};

    #[test]
    fn pair_roundtrip() {
        let (mut a, mut b) = Channel::pair().unwrap();
        a.send(&StatusMessage::Exception(Fault::new("LoadError", "boom")))
            .unwrap();
        match b.recv::<StatusMessage>().unwrap() {
            StatusMessage::Exception(f) => assert_eq!(f.message, "boom"),
            other => panic!("expected Exception, got {other:?}"),
        }
    }

    #[test]
    fn recv_after_close_is_eof() {
        let (a, mut b) = Channel::pair().unwrap();
        drop(a);
        let err = b.recv::<StatusMessage>().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn descriptor_transfer() {
        use std::os::fd::AsFd;

        let (mut a, mut b) = Channel::pair().unwrap();
        let (mut read_side, write_side) = UnixStream::pair().unwrap();

        a.send_fd(write_side.as_fd()).unwrap();
        let received = b.recv_fd().unwrap();
        drop(write_side);

        // Writing through the received duplicate must reach the peer.
        let mut received_stream = UnixStream::from(received);
        received_stream.write_all(b"ping").unwrap();
        drop(received_stream);

        let mut buf = Vec::new();
        read_side.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, b"ping");
    }
}
