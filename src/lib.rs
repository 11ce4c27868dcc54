//! Privilege separation and syscall sandboxing for an FTP server.
//!
//! This crate is the security core of a vsftpd-style FTP server.  It
//! does not parse FTP commands; the command layer plugs in as a
//! [`topology::Protocol`] and asks for everything that needs
//! privileges through [`topology::PrivilegedOps`].
//!
//! Every session runs in one of two process layouts:
//!
//! - The two-process model forks a privileged parent and an
//!   unprivileged child that drops its identity and confines itself to
//!   an empty jail.  The parent performs a small fixed set of
//!   privileged operations, one [`broker`] request at a time, and
//!   re-validates every argument it gets.  After a login the layout
//!   is forked again for the authenticated identity.
//! - The one-process model serves anonymous sessions in a single
//!   process that gave up all privileges before the first client
//!   command.
//!
//! In both layouts the untrusted process can additionally run under a
//! `ptrace(2)` based [`sandbox`] with an allow-list [`policy`] that
//! checks syscall arguments against facts that were established
//! before the sandbox started, e.g. the addresses of the control
//! connection.
//!
//! When the control connection is encrypted, the TLS session stays in
//! the pre-login process, which becomes a [`tls::slave`] serving the
//! post-login process over another private channel.
//!
//! # Examples
//!
//! ```ignore
//! use ftp_privsep::{login::DenyAll, topology, Config, Session};
//!
//! let config: Config = serde_json::from_str(&settings)?;
//! config.validate()?;
//! let _guard = ftp_privsep_log::sync_logger("ftpd", &config)?;
//!
//! let session = Session::from_control(&control, &config)?;
//! if config.one_process_model {
//!     topology::one_process::start(session, &config, &mut protocol)
//! } else {
//!     topology::two_process::start(session, &config, &DenyAll, &mut protocol)
//! }
//! ```

pub mod broker;
pub mod channel;
pub mod config;
mod error;
pub mod executor;
pub mod login;
pub mod net;
pub mod policy;
pub mod privops;
pub mod sandbox;
pub mod secutil;
pub mod session;
pub mod tls;
pub mod topology;

pub use {
    channel::Channel,
    config::Config,
    error::{bug, die, Error},
    session::Session,
};
