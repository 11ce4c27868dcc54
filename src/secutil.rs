//! Dropping privileges of the untrusted processes.

use crate::{error::Error, net::set_cloexec};
use arrayvec::ArrayVec;
use close_fds::close_open_fds;
use nix::{
    sys::{
        resource::{setrlimit, Resource},
        signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal},
    },
    unistd::{self, chdir, chroot, User},
};
use std::{
    os::unix::io::RawFd,
    path::{Path, PathBuf},
};

/// Descriptors that survive [`change_credentials`].
pub type KeepFds = ArrayVec<RawFd, 8>;

/// Look up a local account by name.
pub fn lookup_user(name: &str) -> Result<User, Error> {
    User::from_name(name)?.ok_or_else(|| Error::UserNotFound(name.to_string().into()))
}

/// How a process gives up its privileges.
#[derive(Debug, Default)]
pub struct Credentials {
    /// Account to switch to.
    pub user: String,
    /// Directory to confine the process to.
    pub chroot: Option<PathBuf>,
    /// Forbid the creation of new processes.
    pub no_fork: bool,
    /// Limit of open descriptors.
    pub max_files: Option<u64>,
    /// Inherited descriptors that stay open; all others are closed.
    pub keep_fds: KeepFds,
}

impl Credentials {
    pub fn new(user: &str) -> Self {
        Self {
            user: user.to_string(),
            ..Default::default()
        }
    }

    pub fn chroot<P: AsRef<Path>>(mut self, dir: P) -> Self {
        self.chroot = Some(dir.as_ref().to_path_buf());
        self
    }

    pub fn no_fork(mut self) -> Self {
        self.no_fork = true;
        self
    }

    pub fn max_files(mut self, max_files: Option<u64>) -> Self {
        self.max_files = max_files;
        self
    }

    /// Keep an inherited descriptor open.
    pub fn keep(mut self, fd: RawFd) -> Result<Self, Error> {
        self.keep_fds
            .try_push(fd)
            .map_err(|_| Error::Bug("too many descriptors to keep"))?;
        Ok(self)
    }
}

/// Switch the current process to the configured account.
///
/// The process also exits with status 1 when its parent goes away, so
/// an unprivileged child never outlives the broker serving it.
pub fn change_credentials(credentials: &Credentials) -> Result<(), Error> {
    let user = lookup_user(&credentials.user)?;

    // Close everything that was inherited by accident.
    let mut keep = credentials.keep_fds.clone();
    keep.sort_unstable();
    unsafe {
        close_open_fds(libc::STDERR_FILENO + 1, &keep);
    }
    for fd in &keep {
        set_cloexec(*fd, true)?;
    }

    if let Some(dir) = &credentials.chroot {
        chroot(dir.as_path()).map_err(|err| Error::Privdrop("chroot", err.into()))?;
        chdir("/").map_err(|err| Error::Privdrop("chdir", err.into()))?;
    }

    // Set the supplementary groups.
    unistd::setgroups(&[user.gid]).map_err(|err| Error::Privdrop("setgroups", err.into()))?;

    // Drop the privileges.
    unistd::setresgid(user.gid, user.gid, user.gid)
        .map_err(|err| Error::Privdrop("setresgid", err.into()))?;
    unistd::setresuid(user.uid, user.uid, user.uid)
        .map_err(|err| Error::Privdrop("setresuid", err.into()))?;

    if credentials.no_fork {
        forbid_fork()?;
    }
    if let Some(max_files) = credentials.max_files {
        setrlimit(Resource::RLIMIT_NOFILE, Some(max_files), Some(max_files))
            .map_err(|err| Error::Privdrop("setrlimit", err.into()))?;
    }

    die_with_parent()
}

/// Prevent the current process from creating new processes.
pub fn forbid_fork() -> Result<(), Error> {
    setrlimit(Resource::RLIMIT_NPROC, Some(0), Some(0))
        .map_err(|err| Error::Privdrop("setrlimit", err.into()))
}

extern "C" fn parent_died(_: libc::c_int) {
    unsafe { libc::_exit(1) }
}

/// Exit with status 1 once the parent process is gone.
///
/// The kernel delivers `SIGTERM` on the parent's death.  The request is
/// cleared by credential changes, so it is made after the privilege
/// drop.
pub fn die_with_parent() -> Result<(), Error> {
    let parent = unistd::getppid();

    let action = SigAction::new(
        SigHandler::Handler(parent_died),
        SaFlags::empty(),
        SigSet::empty(),
    );
    unsafe { sigaction(Signal::SIGTERM, &action) }
        .map_err(|err| Error::Privdrop("sigaction", err.into()))?;

    let ret = unsafe { libc::prctl(libc::PR_SET_PDEATHSIG, Signal::SIGTERM as libc::c_ulong) };
    if ret == -1 {
        return Err(Error::Privdrop("prctl", nix::Error::last().into()));
    }

    // The parent may have exited before the request was made.
    if unistd::getppid() != parent {
        unsafe { libc::_exit(1) }
    }
    Ok(())
}
