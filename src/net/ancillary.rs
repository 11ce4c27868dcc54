//! Descriptor passing over UNIX sockets with `SCM_RIGHTS`.

use crate::{error::Error, net::Fd};
use nix::{
    cmsg_space,
    sys::{
        socket::{recvmsg, sendmsg, ControlMessage, ControlMessageOwned, MsgFlags},
        uio::IoVec,
    },
};
use std::os::unix::io::{AsRawFd, RawFd};

/// Send one open descriptor along with a single marker byte.
pub fn send_fd<T: AsRawFd>(socket: &T, fd: &Fd) -> Result<(), Error> {
    let marker = [0u8; 1];
    let iov = [IoVec::from_slice(&marker)];
    let fds = [fd.as_raw_fd()];
    let cmsgs = [ControlMessage::ScmRights(&fds)];

    let length = sendmsg(socket.as_raw_fd(), &iov, &cmsgs, MsgFlags::empty(), None)?;
    if length != marker.len() {
        return Err(Error::ShortMessage);
    }

    Ok(())
}

/// Receive one descriptor; any additional descriptors are closed.
pub fn recv_fd<T: AsRawFd>(socket: &T) -> Result<Fd, Error> {
    let mut marker = [0u8; 1];
    let iov = [IoVec::from_mut_slice(&mut marker)];
    let mut cmsg_buffer = cmsg_space!([RawFd; 1]);

    let message = recvmsg(
        socket.as_raw_fd(),
        &iov,
        Some(&mut cmsg_buffer),
        MsgFlags::MSG_CMSG_CLOEXEC,
    )?;
    if message.bytes != marker.len() {
        return Err(Error::ShortMessage);
    }

    let mut result = None;
    for cmsg in message.cmsgs() {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                let fd = Fd::from(fd);

                // Only the first one is returned, the others are
                // closed when dropped.
                if result.is_none() {
                    result = Some(fd);
                }
            }
        }
    }

    if message.flags.contains(MsgFlags::MSG_CTRUNC) {
        return Err(Error::ShortMessage);
    }

    result.ok_or(Error::MissingFd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{
        io::{Read, Write},
        os::unix::{
            io::{FromRawFd, IntoRawFd},
            net::UnixStream,
        },
    };

    #[test]
    fn test_fd_passing() {
        let (a, b) = UnixStream::pair().unwrap();
        let (mut left, right) = UnixStream::pair().unwrap();

        let fd = Fd::from(right.into_raw_fd());
        send_fd(&a, &fd).unwrap();
        drop(fd);

        let received = recv_fd(&b).unwrap();
        let mut stream = unsafe { UnixStream::from_raw_fd(received.into_raw_fd()) };
        left.write_all(b"hello").unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_missing_fd() {
        let (mut a, b) = UnixStream::pair().unwrap();
        a.write_all(&[0u8]).unwrap();
        assert!(matches!(recv_fd(&b), Err(Error::MissingFd)));
    }
}
