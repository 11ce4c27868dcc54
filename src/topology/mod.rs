//! Process layouts of one FTP session.
//!
//! Every role is a function that is the whole body of a forked
//! process and ends by exiting it.  The roles only talk through the
//! private channels that were created before the fork.
//!
//! The FTP command layer plugs in as a [`Protocol`] and reaches the
//! privileged side only through [`PrivilegedOps`]; it never learns
//! which topology is running.

pub mod one_process;
pub mod two_process;

use crate::{
    broker::AcceptFailure,
    config::Config,
    error::{die, Error},
    net::Fd,
    sandbox::{Policy, Sandbox},
    secutil::{self, KeepFds},
    session::Session,
    tls::TlsState,
};
use std::process;

pub use {one_process::OneProcess, two_process::TwoProcess};

/// Privileged operations available to the FTP command layer.
pub trait PrivilegedOps {
    /// Try to log in `session.user` with `pass`.
    ///
    /// Returns `Ok(false)` if the login was refused.  After `Ok(true)`
    /// the caller has to return from [`Protocol::prelogin`].
    fn login(&self, session: &mut Session, pass: &str) -> Result<bool, Error>;

    /// Connect a data socket to the address of the last `PORT` command.
    fn get_priv_data_sock(&self, session: &mut Session) -> Result<Option<Fd>, Error>;

    /// Start a passive listener and return its port.
    fn pasv_listen(&self, session: &mut Session) -> Result<u16, Error>;

    fn pasv_active(&self, session: &Session) -> Result<bool, Error>;

    /// Accept the passive data connection.
    fn get_pasv_fd(&self, session: &mut Session) -> Result<Result<Fd, AcceptFailure>, Error>;

    fn pasv_cleanup(&self, session: &mut Session) -> Result<(), Error>;

    /// Re-own an uploaded file to the configured upload owner.
    fn chown_upload(&self, session: &Session, fd: &Fd) -> Result<bool, Error>;
}

/// The FTP command layer.
pub trait Protocol {
    /// Handle commands until a login succeeded (`Ok(true)`) or the
    /// client went away (`Ok(false)`).
    fn prelogin(&mut self, session: &mut Session, ops: &dyn PrivilegedOps) -> Result<bool, Error>;

    /// Serve the logged in session until the client went away.
    fn postlogin(&mut self, session: &mut Session, ops: &dyn PrivilegedOps) -> Result<(), Error>;

    /// Descriptors of the client connection that survive privilege drops.
    fn keep_fds(&self) -> KeepFds;

    /// Hand over the TLS session of the control connection after a
    /// login, if the control connection is encrypted.
    fn take_tls(&mut self) -> Option<TlsState> {
        None
    }
}

/// Run `role` in a sandboxed child and trace it, or run it directly.
fn confine<F: FnOnce() -> Result<(), Error>>(
    policy: Policy,
    config: &Config,
    role: F,
) -> Result<(), Error> {
    if !config.sandbox_enable {
        return role();
    }

    let mut sandbox = Sandbox::new(policy)?;
    sandbox.launch(|| exit(role()))?;
    // The tracer itself never needs another process.
    secutil::forbid_fork()?;
    sandbox.run()
}

/// Exit the current role.
fn exit(result: Result<(), Error>) -> ! {
    match result {
        Ok(()) => process::exit(0),
        Err(err) => die(err),
    }
}
