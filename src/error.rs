use crate::sandbox::Violation;
use derive_more::{Display, From};
use ftp_privsep_log::crit;
use std::{borrow::Cow, io, process};

/// Common errors.
#[derive(Debug, Display, From)]
pub enum Error {
    #[display(fmt = "I/O error: {}", "_0")]
    IoError(io::Error),
    #[display(fmt = "{}", "_0")]
    UnixError(nix::Error),
    #[display(fmt = "Sandbox violation: {}", "_0")]
    Violation(Violation),
    #[display(fmt = "Traced process is gone")]
    #[from(ignore)]
    ProcessGone,
    #[display(fmt = "Sandbox state read outside of a syscall event")]
    #[from(ignore)]
    NoEvent,
    #[display(fmt = "Syscall rejected: {}", "_0")]
    #[from(ignore)]
    Rejected(&'static str),
    #[display(fmt = "Sandbox is not available on this target")]
    #[from(ignore)]
    SandboxUnavailable,
    #[display(fmt = "Short message on private channel")]
    #[from(ignore)]
    ShortMessage,
    #[display(fmt = "Buffer of {} bytes exceeds the limit of {}", "_0", "_1")]
    BufferTooLarge(i64, usize),
    #[display(fmt = "Unexpected command {}", "_0")]
    #[from(ignore)]
    UnexpectedCommand(u8),
    #[display(fmt = "No file descriptor received")]
    #[from(ignore)]
    MissingFd,
    #[display(fmt = "Channel context already set")]
    #[from(ignore)]
    ContextAlreadySet,
    #[display(fmt = "Channel context not set")]
    #[from(ignore)]
    NoContext,
    #[display(fmt = "Refusing to chown: {}", "_0")]
    #[from(ignore)]
    InvalidChownTarget(&'static str),
    #[display(fmt = "Data connection from a foreign peer")]
    #[from(ignore)]
    ForeignPeer,
    #[display(fmt = "Operation timed out")]
    #[from(ignore)]
    Timeout,
    #[display(fmt = "Username '{}' not found", "_0")]
    UserNotFound(Cow<'static, str>),
    #[display(fmt = "Failed to drop privileges ({}) - {}", "_0", "_1")]
    Privdrop(&'static str, Box<dyn std::error::Error + Send + Sync>),
    #[display(fmt = "TLS error: {}", "_0")]
    #[from(ignore)]
    Tls(String),
    #[display(fmt = "Configuration error: {}", "_0")]
    #[from(ignore)]
    Config(String),
    #[display(fmt = "Bug: {}", "_0")]
    #[from(ignore)]
    Bug(&'static str),
}

impl std::error::Error for Error {}

impl Error {
    /// Returns true if the peer process went away.
    ///
    /// Tracing calls and channel reads fail this way when the other
    /// side exited; callers treat it as a normal end of work.
    pub fn is_gone(&self) -> bool {
        match self {
            Self::ProcessGone => true,
            Self::UnixError(errno) => *errno == nix::errno::Errno::ESRCH,
            Self::IoError(err) => matches!(
                err.kind(),
                io::ErrorKind::UnexpectedEof
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

/// Terminate the current process after a fatal error.
pub fn die(err: Error) -> ! {
    crit!("fatal: {}", err);
    process::exit(1)
}

/// Terminate the current process after detecting a programming error.
pub fn bug(what: &'static str) -> ! {
    die(Error::Bug(what))
}
