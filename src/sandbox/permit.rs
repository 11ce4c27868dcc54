//! Policy builder: one `permit_*` method per capability.

use super::{
    regs::{nr, SocketOp},
    table::Table,
    Sandbox,
};
use crate::error::Error;

/// `O_LARGEFILE` as the kernel reports it on 64-bit targets.
const KERNEL_O_LARGEFILE: u64 = 0o100000;

/// Open flags that never grant write access.
const OPEN_FLAGS_READONLY: u64 = (libc::O_NONBLOCK
    | libc::O_CLOEXEC
    | libc::O_DIRECTORY
    | libc::O_NOFOLLOW
    | libc::O_NOCTTY) as u64
    | KERNEL_O_LARGEFILE;

/// Open flags of uploads and appends.
const OPEN_FLAGS_WRITABLE: u64 = OPEN_FLAGS_READONLY
    | (libc::O_WRONLY | libc::O_RDWR | libc::O_CREAT | libc::O_EXCL | libc::O_TRUNC | libc::O_APPEND)
        as u64;

/// File status flags that may be changed with `F_SETFL`.
const SETFL_FLAGS: u64 = (libc::O_ACCMODE | libc::O_NONBLOCK | libc::O_APPEND) as u64
    | KERNEL_O_LARGEFILE;

/// Syscall grants that are frozen into a [`Sandbox`].
///
/// Nothing is allowed by default; every method adds exactly the calls
/// it is named after.
#[derive(Debug, Default)]
pub struct Policy {
    table: Table,
}

impl Policy {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn into_table(self) -> Table {
        self.table
    }

    /// Grant a syscall without looking at its arguments.
    pub fn permit(&mut self, nr: u64) -> &mut Self {
        self.table.allow(nr, None);
        self
    }

    /// Grant a syscall if `validator` accepts its arguments.
    pub fn permit_with<F>(&mut self, nr: u64, validator: F) -> &mut Self
    where
        F: Fn(&Sandbox) -> Result<(), Error> + 'static,
    {
        self.table.allow(nr, Some(Box::new(validator)));
        self
    }

    pub fn permit_socket_op(&mut self, op: SocketOp) -> &mut Self {
        self.table.allow_socket_op(op, None);
        self
    }

    pub fn permit_socket_op_with<F>(&mut self, op: SocketOp, validator: F) -> &mut Self
    where
        F: Fn(&Sandbox) -> Result<(), Error> + 'static,
    {
        self.table.allow_socket_op(op, Some(Box::new(validator)));
        self
    }

    pub fn permit_exit(&mut self) -> &mut Self {
        self.permit(nr::EXIT).permit(nr::EXIT_GROUP)
    }

    pub fn permit_read(&mut self) -> &mut Self {
        self.permit(nr::READ)
    }

    pub fn permit_write(&mut self) -> &mut Self {
        self.permit(nr::WRITE)
    }

    /// `recvfrom(2)`, used by `recv(3)` on connected sockets.
    pub fn permit_recv(&mut self) -> &mut Self {
        self.permit_socket_op(SocketOp::RecvFrom)
    }

    /// Heap and private mappings; shared or executable mappings are
    /// rejected.
    pub fn permit_memory(&mut self) -> &mut Self {
        self.permit(nr::BRK)
            .permit(nr::MUNMAP)
            .permit(nr::MREMAP)
            .permit(nr::MADVISE)
            .permit_with(nr::MMAP, validate_mmap)
            .permit_with(nr::MPROTECT, validate_mprotect)
    }

    pub fn permit_query_time(&mut self) -> &mut Self {
        self.permit(nr::TIME)
            .permit(nr::GETTIMEOFDAY)
            .permit(nr::CLOCK_GETTIME)
    }

    pub fn permit_signals(&mut self) -> &mut Self {
        self.permit(nr::RT_SIGACTION)
            .permit(nr::RT_SIGPROCMASK)
            .permit(nr::RT_SIGRETURN)
    }

    pub fn permit_alarm(&mut self) -> &mut Self {
        self.permit(nr::ALARM)
    }

    /// Sleeping, including the resumption of a sleep that was
    /// interrupted by a signal.
    pub fn permit_sleep(&mut self) -> &mut Self {
        self.permit(nr::NANOSLEEP)
            .permit(nr::CLOCK_NANOSLEEP)
            .permit(nr::RESTART_SYSCALL)
    }

    pub fn permit_getpid(&mut self) -> &mut Self {
        self.permit(nr::GETPID)
    }

    /// `open(2)` and `openat(2)` without any write access.
    pub fn permit_open_readonly(&mut self) -> &mut Self {
        self.permit_with(nr::OPEN, |sandbox| {
            validate_open_flags(sandbox.get_arg(1)?, false)
        })
        .permit_with(nr::OPENAT, |sandbox| {
            validate_open_flags(sandbox.get_arg(2)?, false)
        })
    }

    /// `open(2)` and `openat(2)` including creation and truncation.
    pub fn permit_open_writable(&mut self) -> &mut Self {
        self.permit_with(nr::OPEN, |sandbox| {
            validate_open_flags(sandbox.get_arg(1)?, true)
        })
        .permit_with(nr::OPENAT, |sandbox| {
            validate_open_flags(sandbox.get_arg(2)?, true)
        })
    }

    pub fn permit_close(&mut self) -> &mut Self {
        self.permit(nr::CLOSE)
    }

    pub fn permit_file_stats(&mut self) -> &mut Self {
        self.permit(nr::STAT)
            .permit(nr::LSTAT)
            .permit(nr::FSTAT)
            .permit(nr::NEWFSTATAT)
            .permit(nr::STATX)
    }

    pub fn permit_readlink(&mut self) -> &mut Self {
        self.permit(nr::READLINK).permit(nr::READLINKAT)
    }

    pub fn permit_getcwd(&mut self) -> &mut Self {
        self.permit(nr::GETCWD)
    }

    pub fn permit_chdir(&mut self) -> &mut Self {
        self.permit(nr::CHDIR)
    }

    pub fn permit_getdents(&mut self) -> &mut Self {
        self.permit(nr::GETDENTS).permit(nr::GETDENTS64)
    }

    pub fn permit_seek(&mut self) -> &mut Self {
        self.permit(nr::LSEEK)
    }

    pub fn permit_shutdown(&mut self) -> &mut Self {
        self.permit_socket_op(SocketOp::Shutdown)
    }

    /// Descriptor and status flag queries, and toggling non-blocking
    /// or append mode.
    pub fn permit_fcntl(&mut self) -> &mut Self {
        self.permit_with(nr::FCNTL, |sandbox| {
            validate_fcntl(sandbox.get_arg(1)?, sandbox.get_arg(2)?)
        })
    }

    pub fn permit_umask(&mut self) -> &mut Self {
        self.permit(nr::UMASK)
    }

    pub fn permit_mkdir(&mut self) -> &mut Self {
        self.permit(nr::MKDIR).permit(nr::MKDIRAT)
    }

    pub fn permit_unlink(&mut self) -> &mut Self {
        self.permit(nr::UNLINK).permit(nr::UNLINKAT)
    }

    pub fn permit_rmdir(&mut self) -> &mut Self {
        self.permit(nr::RMDIR)
    }

    pub fn permit_rename(&mut self) -> &mut Self {
        self.permit(nr::RENAME)
            .permit(nr::RENAMEAT)
            .permit(nr::RENAMEAT2)
    }

    pub fn permit_ftruncate(&mut self) -> &mut Self {
        self.permit(nr::FTRUNCATE)
    }

    pub fn permit_utime(&mut self) -> &mut Self {
        self.permit(nr::UTIME)
            .permit(nr::UTIMES)
            .permit(nr::UTIMENSAT)
    }

    pub fn permit_chmod(&mut self) -> &mut Self {
        self.permit(nr::CHMOD)
    }

    pub fn permit_fchmod(&mut self) -> &mut Self {
        self.permit(nr::FCHMOD)
    }

    pub fn permit_fchown(&mut self) -> &mut Self {
        self.permit(nr::FCHOWN)
    }

    pub fn permit_sendfile(&mut self) -> &mut Self {
        self.permit(nr::SENDFILE)
    }

    pub fn permit_poll(&mut self) -> &mut Self {
        self.permit(nr::POLL)
    }

    pub fn permit_getrandom(&mut self) -> &mut Self {
        self.permit(nr::GETRANDOM)
    }

    /// Receiving descriptors from a private channel.
    pub fn permit_recvmsg(&mut self) -> &mut Self {
        self.permit_socket_op(SocketOp::RecvMsg)
    }

    /// Passing descriptors over a private channel.
    pub fn permit_sendmsg(&mut self) -> &mut Self {
        self.permit_socket_op(SocketOp::SendMsg)
    }

    /// `sendto(2)` on an already connected socket, as used by
    /// `syslog(3)` after `openlog(3)` with `LOG_NDELAY`.
    pub fn permit_syslog(&mut self) -> &mut Self {
        self.permit_socket_op_with(SocketOp::SendTo, |sandbox| {
            match sandbox.get_socketcall_arg(4)? {
                0 => Ok(()),
                _ => Err(Error::Rejected("sendto with a destination address")),
            }
        })
    }
}

fn validate_mmap(sandbox: &Sandbox) -> Result<(), Error> {
    let prot = sandbox.get_arg(2)?;
    let flags = sandbox.get_arg(3)?;
    if flags & libc::MAP_SHARED as u64 != 0 {
        return Err(Error::Rejected("shared mapping"));
    }
    if prot & libc::PROT_EXEC as u64 != 0 {
        return Err(Error::Rejected("executable mapping"));
    }
    Ok(())
}

fn validate_mprotect(sandbox: &Sandbox) -> Result<(), Error> {
    if sandbox.get_arg(2)? & libc::PROT_EXEC as u64 != 0 {
        return Err(Error::Rejected("executable mapping"));
    }
    Ok(())
}

pub(crate) fn validate_open_flags(flags: u64, writable: bool) -> Result<(), Error> {
    let allowed = if writable {
        OPEN_FLAGS_WRITABLE
    } else {
        OPEN_FLAGS_READONLY
    };
    if flags & !allowed != 0 {
        return Err(Error::Rejected("open flags"));
    }
    match flags & libc::O_ACCMODE as u64 {
        mode if mode == libc::O_RDONLY as u64 => Ok(()),
        mode if writable && (mode == libc::O_WRONLY as u64 || mode == libc::O_RDWR as u64) => {
            Ok(())
        }
        _ => Err(Error::Rejected("open access mode")),
    }
}

pub(crate) fn validate_fcntl(cmd: u64, arg: u64) -> Result<(), Error> {
    match cmd as libc::c_int {
        libc::F_GETFL | libc::F_GETFD => Ok(()),
        libc::F_SETFD if arg & !(libc::FD_CLOEXEC as u64) == 0 => Ok(()),
        libc::F_SETFL if arg & !SETFL_FLAGS == 0 => Ok(()),
        _ => Err(Error::Rejected("fcntl command")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_flags() {
        let rdonly = libc::O_RDONLY as u64;
        let cloexec = libc::O_CLOEXEC as u64;
        let upload = (libc::O_WRONLY | libc::O_CREAT | libc::O_TRUNC) as u64;

        assert!(validate_open_flags(rdonly | cloexec, false).is_ok());
        assert!(validate_open_flags(upload, false).is_err());
        assert!(validate_open_flags(libc::O_RDWR as u64, false).is_err());
        assert!(validate_open_flags(upload | cloexec, true).is_ok());
        assert!(validate_open_flags(libc::O_ACCMODE as u64, true).is_err());
        assert!(validate_open_flags(libc::O_PATH as u64, true).is_err());
    }

    #[test]
    fn test_fcntl() {
        assert!(validate_fcntl(libc::F_GETFL as u64, 0).is_ok());
        assert!(validate_fcntl(libc::F_SETFL as u64, libc::O_NONBLOCK as u64).is_ok());
        assert!(validate_fcntl(libc::F_SETFL as u64, libc::O_ASYNC as u64).is_err());
        assert!(validate_fcntl(libc::F_SETFD as u64, libc::FD_CLOEXEC as u64).is_ok());
        assert!(validate_fcntl(libc::F_DUPFD as u64, 0).is_err());
        assert!(validate_fcntl(libc::F_SETOWN as u64, 0).is_err());
    }

    #[test]
    fn test_grants_are_explicit() {
        let mut policy = Policy::new();
        policy.permit_exit().permit_write();
        let table = policy.into_table();
        let mut allowed = table.allowed_syscalls().collect::<Vec<_>>();
        allowed.sort_unstable();
        assert_eq!(allowed, vec![nr::WRITE, nr::EXIT, nr::EXIT_GROUP]);
        assert_eq!(table.allowed_socket_ops().count(), 0);
    }

    #[test]
    fn test_sleep_can_be_resumed() {
        let mut policy = Policy::new();
        policy.permit_sleep();
        let table = policy.into_table();
        assert!(table.is_allowed(nr::NANOSLEEP));
        assert!(table.is_allowed(nr::CLOCK_NANOSLEEP));
        assert!(table.is_allowed(nr::RESTART_SYSCALL));
    }
}
