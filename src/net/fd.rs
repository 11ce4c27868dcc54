//! Owned, droppable file descriptors.

use crate::error::Error;
use derive_more::From;
use nix::{
    fcntl::{fcntl, FcntlArg, FdFlag, OFlag},
    sys::stat::{fstat, FileStat},
    unistd::{close, dup},
};
use std::{
    mem,
    os::unix::io::{AsRawFd, FromRawFd, IntoRawFd, RawFd},
};

/// Wrapper for `RawFd` that closes the file descriptor when dropped.
#[derive(Debug, From, PartialEq)]
pub struct Fd(RawFd);

impl Fd {
    /// Duplicate the file descriptor into an independent `Fd`.
    pub fn duplicate(&self) -> Result<Self, Error> {
        dup(self.0).map(Self::from).map_err(Error::from)
    }

    /// Return the status of the open file.
    pub fn stat(&self) -> Result<FileStat, Error> {
        fstat(self.0).map_err(Error::from)
    }

    /// Switch the descriptor between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), Error> {
        let mut flags = OFlag::from_bits_truncate(fcntl(self.0, FcntlArg::F_GETFL)?);
        flags.set(OFlag::O_NONBLOCK, nonblocking);
        fcntl(self.0, FcntlArg::F_SETFL(flags))?;
        Ok(())
    }

    /// Set or clear the close-on-exec flag.
    pub fn set_cloexec(&self, cloexec: bool) -> Result<(), Error> {
        set_cloexec(self.0, cloexec)
    }
}

pub(crate) fn set_cloexec(fd: RawFd, add: bool) -> Result<(), Error> {
    let mut flags = FdFlag::from_bits_truncate(fcntl(fd, FcntlArg::F_GETFD)?);
    flags.set(FdFlag::FD_CLOEXEC, add);
    fcntl(fd, FcntlArg::F_SETFD(flags))?;
    Ok(())
}

impl Drop for Fd {
    fn drop(&mut self) {
        let _ = close(self.0);
    }
}

impl IntoRawFd for Fd {
    fn into_raw_fd(self) -> RawFd {
        let fd = self.0;
        mem::forget(self);
        fd
    }
}

impl AsRawFd for Fd {
    fn as_raw_fd(&self) -> RawFd {
        self.0
    }
}

impl FromRawFd for Fd {
    unsafe fn from_raw_fd(fd: RawFd) -> Self {
        Self(fd)
    }
}
