//! The privileged operations themselves.
//!
//! The executor runs them on behalf of the unprivileged child in the
//! two-process model; in the one-process model the sandboxed process
//! calls them directly and the sandbox policy confines the syscalls.

use crate::{
    broker::AcceptFailure,
    config::Config,
    error::Error,
    net::{socket, Fd},
    session::Session,
};
use ftp_privsep_log::{debug, info, warn};
use nix::{errno::Errno, sys::stat::SFlag, unistd::Uid};
use rand::Rng;
use std::{net::SocketAddr, os::unix::io::AsRawFd, thread, time::Duration};

/// Attempts to find a free passive port.
const PASV_BIND_TRIES: usize = 9;

/// Lowest passive port.
const PASV_MIN_PORT: u16 = 1024;

/// Bind a data socket to the local control address and connect it to
/// `remote`.
///
/// Returns `Ok(None)` if the connection could not be established; bind
/// failures other than a transient `EADDRINUSE` are fatal.
pub fn get_ftp_port_sock(
    session: &Session,
    config: &Config,
    remote: SocketAddr,
) -> Result<Option<Fd>, Error> {
    let port = if config.connect_from_port_20 {
        config.ftp_data_port
    } else {
        0
    };
    let mut local = session.local_addr;
    local.set_port(port);

    let fd = socket::tcp_socket(&local)?;
    socket::set_reuseaddr(&fd)?;

    let mut retried = false;
    loop {
        match socket::bind(&fd, &local) {
            Ok(()) => break,
            Err(Error::UnixError(Errno::EADDRINUSE)) if !retried => {
                // The previous data connection may still hold the port.
                retried = true;
                let delay = rand::thread_rng().gen_range(1000..2000);
                debug!("data port {} in use, retrying in {}ms", port, delay);
                thread::sleep(Duration::from_millis(delay));
            }
            Err(err) => return Err(err),
        }
    }

    match socket::connect_timeout(&fd, &remote, config.connect_timeout()) {
        Ok(()) => Ok(Some(fd)),
        Err(err) => {
            info!("failed to connect data socket to {}: {}", remote, err);
            Ok(None)
        }
    }
}

/// Range of the passive ports.
pub fn pasv_port_range(config: &Config) -> (u16, u16) {
    let min = if config.pasv_min_port > PASV_MIN_PORT {
        config.pasv_min_port
    } else {
        PASV_MIN_PORT
    };
    let max = if config.pasv_max_port >= min && config.pasv_max_port != 0 {
        config.pasv_max_port
    } else {
        u16::MAX
    };
    (min, max)
}

/// Open the passive listener on a random port and return the port.
pub fn pasv_listen(session: &mut Session, config: &Config) -> Result<u16, Error> {
    if session.pasv_listener.is_some() {
        return Err(Error::Bug("passive listener already active"));
    }

    let (min, max) = pasv_port_range(config);
    let mut rng = rand::thread_rng();

    for _ in 0..PASV_BIND_TRIES {
        let port = rng.gen_range(min..=max);
        let mut local = session.local_addr;
        local.set_port(port);

        let fd = socket::tcp_socket(&local)?;
        socket::set_reuseaddr(&fd)?;
        match socket::bind(&fd, &local) {
            Ok(()) => {
                socket::listen(&fd, 1)?;
                session.pasv_listener = Some(fd);
                return Ok(port);
            }
            Err(Error::UnixError(Errno::EADDRINUSE)) | Err(Error::UnixError(Errno::EACCES)) => {
                continue
            }
            Err(err) => return Err(err),
        }
    }

    Err(Errno::EADDRINUSE.into())
}

pub fn pasv_active(session: &Session) -> bool {
    session.pasv_listener.is_some()
}

pub fn pasv_cleanup(session: &mut Session) {
    session.pasv_listener = None;
}

/// Accept the passive data connection; the listener is closed afterwards.
pub fn accept_pasv(session: &mut Session, config: &Config) -> Result<Fd, AcceptFailure> {
    let listener = session.pasv_listener.take().ok_or(AcceptFailure::Failed)?;

    let (fd, peer) = match socket::accept_timeout(&listener, config.accept_timeout()) {
        Ok(accepted) => accepted,
        Err(err) => {
            info!("failed to accept passive data connection: {}", err);
            return Err(AcceptFailure::Failed);
        }
    };

    if !config.pasv_promiscuous && peer.ip() != session.remote_addr.ip() {
        warn!(
            "passive data connection from {} does not match control peer {}",
            peer,
            session.remote_addr.ip()
        );
        return Err(AcceptFailure::ForeignPeer);
    }

    Ok(fd)
}

/// Re-own an uploaded file to the configured upload owner.
///
/// Only a regular file that is still owned by the anonymous or guest
/// identity is touched; anything else is refused with
/// [`Error::InvalidChownTarget`].  A failing `fchown(2)` returns
/// `Ok(false)`.
pub fn do_file_chown(session: &Session, fd: &Fd) -> Result<bool, Error> {
    let identities = &session.identities;
    let target = identities
        .anon_upload_chown_uid
        .ok_or(Error::InvalidChownTarget("no upload owner configured"))?;

    let stat = fd.stat()?;
    let owner = Uid::from_raw(stat.st_uid);
    if owner == target {
        return Ok(true);
    }

    if SFlag::from_bits_truncate(stat.st_mode) & SFlag::S_IFMT != SFlag::S_IFREG {
        return Err(Error::InvalidChownTarget("not a regular file"));
    }
    if Some(owner) != identities.anon_ftp_uid && Some(owner) != identities.guest_user_uid {
        return Err(Error::InvalidChownTarget("unexpected owner"));
    }

    let ret = unsafe { libc::fchown(fd.as_raw_fd(), target.as_raw(), !0) };
    if let Err(err) = Errno::result(ret) {
        warn!("failed to chown upload: {}", err);
        return Ok(false);
    }

    Ok(true)
}
