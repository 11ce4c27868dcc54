//! Per-connection state shared by the roles of one FTP session.
//!
//! Every process gets its own copy through `fork(2)`; changes are only
//! communicated through the private channels.

use crate::{
    channel::Channel,
    config::Config,
    error::Error,
    net::{socket, Fd},
    secutil::lookup_user,
};
use nix::unistd::Uid;
use std::net::SocketAddr;

/// Local identities that the privileged side checks against.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Identities {
    /// Owner of anonymous sessions (`ftp_username`).
    pub anon_ftp_uid: Option<Uid>,
    /// Owner of guest sessions (`guest_username`).
    pub guest_user_uid: Option<Uid>,
    /// Target owner of anonymous uploads (`chown_username`).
    pub anon_upload_chown_uid: Option<Uid>,
}

impl Identities {
    /// Resolve the configured account names; a missing account is a
    /// startup error.
    pub fn resolve(config: &Config) -> Result<Self, Error> {
        let uid = |enabled: bool, name: &str| -> Result<Option<Uid>, Error> {
            if enabled {
                lookup_user(name).map(|user| Some(user.uid))
            } else {
                Ok(None)
            }
        };

        Ok(Self {
            anon_ftp_uid: uid(config.anonymous_enable, &config.ftp_username)?,
            guest_user_uid: uid(config.guest_enable, &config.guest_username)?,
            anon_upload_chown_uid: uid(config.chown_uploads, &config.chown_username)?,
        })
    }
}

#[derive(Debug)]
pub struct Session {
    /// Local address of the control connection.
    pub local_addr: SocketAddr,
    /// Remote address of the control connection.
    pub remote_addr: SocketAddr,
    /// Target of the last `PORT`/`EPRT` command.
    pub port_addr: Option<SocketAddr>,
    /// The passive listener; at most one is active.
    pub pasv_listener: Option<Fd>,
    /// The open data connection.
    pub data_fd: Option<Fd>,
    pub data_progress: bool,
    pub data_timeout: bool,
    pub user: Option<String>,
    /// Sanitized password of an anonymous login.
    pub anon_identity: Option<String>,
    pub is_anonymous: bool,
    pub is_guest: bool,
    pub control_ssl: bool,
    pub data_ssl: bool,
    pub identities: Identities,
    /// Channel to the privileged parent.
    pub parent: Option<Channel>,
    /// Channel to the TLS slave.
    pub slave: Option<Channel>,
}

impl Session {
    pub fn new(local_addr: SocketAddr, remote_addr: SocketAddr) -> Self {
        Self {
            local_addr,
            remote_addr,
            port_addr: None,
            pasv_listener: None,
            data_fd: None,
            data_progress: false,
            data_timeout: false,
            user: None,
            anon_identity: None,
            is_anonymous: false,
            is_guest: false,
            control_ssl: false,
            data_ssl: false,
            identities: Identities::default(),
            parent: None,
            slave: None,
        }
    }

    /// Create the session of an accepted control connection.
    pub fn from_control(control: &Fd, config: &Config) -> Result<Self, Error> {
        let mut session = Self::new(socket::local_addr(control)?, socket::peer_addr(control)?);
        session.identities = Identities::resolve(config)?;
        Ok(session)
    }

    /// The channel to the privileged parent.
    pub fn parent(&self) -> Result<&Channel, Error> {
        self.parent.as_ref().ok_or(Error::Bug("no channel to the parent"))
    }

    /// The channel to the TLS slave.
    pub fn slave(&self) -> Result<&Channel, Error> {
        self.slave.as_ref().ok_or(Error::Bug("no channel to the TLS slave"))
    }
}
