//! Narrow view into a traced process.
//!
//! All access to the other process goes through [`Tracee`]: a register
//! snapshot, copies of its memory, and rewriting the pending syscall.
//! Failures are ordinary errors; a process that vanished reports
//! [`Error::ProcessGone`].

use super::regs::Registers;
use crate::error::Error;
use nix::unistd::Pid;

/// Upper bound for a single remote copy.
pub const MAX_REMOTE_READ: usize = 8192;

pub trait Tracee {
    fn pid(&self) -> Pid;

    /// Registers of the syscall the process is stopped in.
    fn registers(&self) -> Result<Registers, Error>;

    /// Copy `len` bytes at `addr` out of the process.
    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error>;

    /// Replace the number of the pending syscall.
    fn set_syscall(&self, nr: u64) -> Result<(), Error>;
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        use nix::{errno::Errno, sys::ptrace};
        use std::mem;

        const WORD: u64 = mem::size_of::<libc::c_long>() as u64;

        /// Access to a process stopped under `ptrace(2)`.
        #[derive(Debug)]
        pub struct PtraceView {
            pid: Pid,
        }

        impl PtraceView {
            pub fn new(pid: Pid) -> Self {
                Self { pid }
            }
        }

        fn gone(err: Errno) -> Error {
            match err {
                Errno::ESRCH => Error::ProcessGone,
                err => err.into(),
            }
        }

        impl Tracee for PtraceView {
            fn pid(&self) -> Pid {
                self.pid
            }

            fn registers(&self) -> Result<Registers, Error> {
                ptrace::getregs(self.pid).map(Registers::from).map_err(gone)
            }

            fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
                if len > MAX_REMOTE_READ {
                    return Err(Error::BufferTooLarge(len as i64, MAX_REMOTE_READ));
                }
                let end = addr.checked_add(len as u64).ok_or(Errno::EFAULT)?;

                // All reads must be word-aligned.
                let mut buf = Vec::with_capacity(len + 2 * WORD as usize);
                let mut word = addr & !(WORD - 1);
                while word < end {
                    let value = ptrace::read(self.pid, word as ptrace::AddressType).map_err(gone)?;
                    buf.extend_from_slice(&value.to_ne_bytes());
                    word += WORD;
                }

                let offset = (addr & (WORD - 1)) as usize;
                Ok(buf[offset..offset + len].to_vec())
            }

            fn set_syscall(&self, nr: u64) -> Result<(), Error> {
                let mut regs = ptrace::getregs(self.pid).map_err(gone)?;
                regs.orig_rax = nr;
                ptrace::setregs(self.pid, regs).map_err(gone)
            }
        }
    }
}
