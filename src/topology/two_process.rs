//! Two-process model.
//!
//! ```text
//! privileged parent ---- login_loop ---- pre-login child (nopriv, jail)
//!        |                                   `- TLS slave after login
//!        `- fork after login
//! privileged parent ---- serve ---------- post-login child (user)
//! ```
//!
//! The parents keep the privileges and only act on broker requests.
//! Both children drop their privileges right after the fork and run
//! under the sandbox when it is enabled.

use super::{confine, exit, PrivilegedOps, Protocol};
use crate::{
    broker::{self, AcceptFailure, PrivReply, PrivRequest},
    channel::Channel,
    config::Config,
    error::Error,
    executor,
    login::Authenticator,
    net::Fd,
    policy::{self, Stage},
    secutil::{change_credentials, lookup_user, Credentials},
    session::Session,
    tls::slave::Slave,
};
use ftp_privsep_log::{debug, info};
use nix::{
    sys::wait::waitpid,
    unistd::{fork, ForkResult, Pid},
};

/// Privileged operations forwarded to the parent.
#[derive(Debug, Clone, Copy)]
pub struct TwoProcess<'a> {
    config: &'a Config,
}

impl<'a> TwoProcess<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }

    fn call(&self, session: &Session, request: PrivRequest) -> Result<PrivReply, Error> {
        broker::call(session.parent()?, &request)
    }
}

fn mismatch() -> Error {
    Error::Bug("mismatched broker reply")
}

impl PrivilegedOps for TwoProcess<'_> {
    fn login(&self, session: &mut Session, pass: &str) -> Result<bool, Error> {
        let request = PrivRequest::Login {
            user: session.user.clone().unwrap_or_default(),
            pass: pass.to_string(),
            control_ssl: session.control_ssl,
            data_ssl: session.data_ssl,
        };
        match self.call(session, request)? {
            PrivReply::Login(ok) => Ok(ok),
            _ => Err(mismatch()),
        }
    }

    fn get_priv_data_sock(&self, session: &mut Session) -> Result<Option<Fd>, Error> {
        if !self.config.port_enable {
            return Err(Error::Rejected("PORT mode is disabled"));
        }
        // The parent only connects to the control peer, so the port is
        // all it needs.
        let port = session
            .port_addr
            .ok_or(Error::Bug("no PORT address"))?
            .port();
        match self.call(session, PrivRequest::GetDataSock { port })? {
            PrivReply::DataSock(fd) => Ok(fd),
            _ => Err(mismatch()),
        }
    }

    fn pasv_listen(&self, session: &mut Session) -> Result<u16, Error> {
        match self.call(session, PrivRequest::PasvListen)? {
            PrivReply::PasvListen(port) => Ok(port),
            _ => Err(mismatch()),
        }
    }

    fn pasv_active(&self, session: &Session) -> Result<bool, Error> {
        match self.call(session, PrivRequest::PasvActive)? {
            PrivReply::PasvActive(active) => Ok(active),
            _ => Err(mismatch()),
        }
    }

    fn get_pasv_fd(&self, session: &mut Session) -> Result<Result<Fd, AcceptFailure>, Error> {
        match self.call(session, PrivRequest::PasvAccept)? {
            PrivReply::PasvAccept(result) => Ok(result),
            _ => Err(mismatch()),
        }
    }

    fn pasv_cleanup(&self, session: &mut Session) -> Result<(), Error> {
        match self.call(session, PrivRequest::PasvCleanup)? {
            PrivReply::PasvCleanup => Ok(()),
            _ => Err(mismatch()),
        }
    }

    fn chown_upload(&self, session: &Session, fd: &Fd) -> Result<bool, Error> {
        match self.call(session, PrivRequest::Chown(fd.duplicate()?))? {
            PrivReply::Chown(ok) => Ok(ok),
            _ => Err(mismatch()),
        }
    }
}

/// Serve one session in the two-process model; never returns.
pub fn start(
    session: Session,
    config: &Config,
    auth: &dyn Authenticator,
    protocol: &mut dyn Protocol,
) -> ! {
    exit(split(session, config, auth, protocol))
}

fn split(
    mut session: Session,
    config: &Config,
    auth: &dyn Authenticator,
    protocol: &mut dyn Protocol,
) -> Result<(), Error> {
    // The slave channel connects the pre-login child, which keeps the
    // TLS session, to the post-login child.
    let slave = if config.ssl_enable {
        Some(Channel::new()?)
    } else {
        None
    };
    let mut channel = Channel::new()?;

    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            channel.set_parent_context()?;
            debug!("pre-login child {}", child);
            privileged_parent(session, config, auth, protocol, channel, slave, child)
        }
        ForkResult::Child => {
            channel.set_child_context()?;
            session.parent = Some(channel);
            prelogin_child(session, config, protocol, slave)
        }
    }
}

fn privileged_parent(
    mut session: Session,
    config: &Config,
    auth: &dyn Authenticator,
    protocol: &mut dyn Protocol,
    channel: Channel,
    slave: Option<Channel>,
    prelogin: Pid,
) -> Result<(), Error> {
    let login = executor::login_loop(&mut session, config, auth, &channel)?;
    drop(channel);
    if login.is_none() {
        let _ = waitpid(prelogin, None);
        return Ok(());
    }

    let mut channel = Channel::new()?;
    match unsafe { fork() }? {
        ForkResult::Parent { child } => {
            channel.set_parent_context()?;
            drop(slave);
            info!(
                "user '{}' logged in, post-login child {}",
                session.user.as_deref().unwrap_or("?"),
                child
            );
            executor::serve(&mut session, config, &channel)?;
            let _ = waitpid(child, None);
            // The pre-login child may still have served as the TLS slave.
            let _ = waitpid(prelogin, None);
            Ok(())
        }
        ForkResult::Child => {
            channel.set_child_context()?;
            session.parent = Some(channel);
            postlogin_child(session, config, protocol, slave)
        }
    }
}

/// Drop the privileges, keeping the client connection and `channels`.
fn drop_privileges(
    credentials: Credentials,
    config: &Config,
    protocol: &dyn Protocol,
    channels: &[Option<&Channel>],
) -> Result<(), Error> {
    let mut credentials = credentials.max_files(config.max_files);
    if !config.sandbox_enable {
        credentials = credentials.no_fork();
    }
    let channels = channels.iter().copied().flatten().flat_map(Channel::raw_fds);
    for fd in protocol.keep_fds().into_iter().chain(channels) {
        credentials = credentials.keep(fd)?;
    }
    change_credentials(&credentials)
}

fn prelogin_child(
    session: Session,
    config: &Config,
    protocol: &mut dyn Protocol,
    mut slave: Option<Channel>,
) -> Result<(), Error> {
    if let Some(slave) = slave.as_mut() {
        slave.set_parent_context()?;
    }

    let credentials = Credentials::new(&config.nopriv_user).chroot(&config.secure_chroot_dir);
    drop_privileges(
        credentials,
        config,
        protocol,
        &[session.parent.as_ref(), slave.as_ref()],
    )?;

    let policy = policy::build(Stage::Prelogin, &session, config);
    confine(policy, config, move || {
        prelogin(session, config, protocol, slave)
    })
}

fn prelogin(
    mut session: Session,
    config: &Config,
    protocol: &mut dyn Protocol,
    slave: Option<Channel>,
) -> Result<(), Error> {
    let ops = TwoProcess::new(config);
    if !protocol.prelogin(&mut session, &ops)? {
        return Ok(());
    }

    // The parent continues with a new channel.
    session.parent = None;

    match slave {
        Some(channel) if session.control_ssl => {
            let state = protocol
                .take_tls()
                .ok_or(Error::Bug("encrypted control connection without TLS state"))?;
            debug!("becoming the TLS slave");
            Slave::new(channel, state).run()
        }
        _ => Ok(()),
    }
}

/// Credentials of the logged in identity.
fn postlogin_credentials(session: &Session, config: &Config) -> Result<Credentials, Error> {
    if session.is_anonymous {
        let root = match &config.anon_root {
            Some(root) => root.clone(),
            None => lookup_user(&config.ftp_username)?.dir,
        };
        return Ok(Credentials::new(&config.ftp_username).chroot(root));
    }

    let name = if session.is_guest {
        config.guest_username.clone()
    } else {
        session.user.clone().ok_or(Error::Bug("login without a user"))?
    };
    let mut credentials = Credentials::new(&name);
    if config.chroot_local_user {
        credentials = credentials.chroot(lookup_user(&name)?.dir);
    }
    Ok(credentials)
}

fn postlogin_child(
    mut session: Session,
    config: &Config,
    protocol: &mut dyn Protocol,
    slave: Option<Channel>,
) -> Result<(), Error> {
    session.slave = match slave {
        Some(mut channel) if session.control_ssl => {
            channel.set_child_context()?;
            Some(channel)
        }
        _ => None,
    };

    let credentials = postlogin_credentials(&session, config)?;
    drop_privileges(
        credentials,
        config,
        protocol,
        &[session.parent.as_ref(), session.slave.as_ref()],
    )?;

    let policy = policy::build(Stage::Postlogin, &session, config);
    confine(policy, config, move || {
        let ops = TwoProcess::new(config);
        protocol.postlogin(&mut session, &ops)
    })
}
