//! One-process model.
//!
//! The session process drops every privilege before it reads anything
//! from the client and then serves the whole session, pre- and
//! post-login, under one sandbox policy.  Without a second privilege
//! transition only anonymous sessions can be served.

use super::{confine, exit, PrivilegedOps, Protocol};
use crate::{
    broker::AcceptFailure,
    config::Config,
    error::Error,
    login::{self, do_login, DenyAll, LoginResult},
    net::Fd,
    policy::{self, Stage},
    privops,
    secutil::{change_credentials, lookup_user, Credentials},
    session::Session,
};
use ftp_privsep_log::info;
use std::thread;

/// Privileged operations performed by the session process itself.
#[derive(Debug, Clone, Copy)]
pub struct OneProcess<'a> {
    config: &'a Config,
}

impl<'a> OneProcess<'a> {
    pub fn new(config: &'a Config) -> Self {
        Self { config }
    }
}

impl PrivilegedOps for OneProcess<'_> {
    fn login(&self, session: &mut Session, pass: &str) -> Result<bool, Error> {
        let user = session.user.clone().unwrap_or_default();
        let result = do_login(session, self.config, &DenyAll, &user, pass);
        match result {
            LoginResult::Anon => info!(
                "anonymous login, identity '{}'",
                session.anon_identity.as_deref().unwrap_or("?")
            ),
            LoginResult::Real => return Err(Error::Bug("real login in the one-process model")),
            LoginResult::Fail => info!("failed login for user '{}'", user),
        }

        let delay = login::delay(self.config, result);
        if !delay.is_zero() {
            thread::sleep(delay);
        }
        Ok(result == LoginResult::Anon)
    }

    fn get_priv_data_sock(&self, session: &mut Session) -> Result<Option<Fd>, Error> {
        if !self.config.port_enable {
            return Err(Error::Rejected("PORT mode is disabled"));
        }
        let remote = session.port_addr.ok_or(Error::Bug("no PORT address"))?;
        privops::get_ftp_port_sock(session, self.config, remote)
    }

    fn pasv_listen(&self, session: &mut Session) -> Result<u16, Error> {
        if !self.config.pasv_enable {
            return Err(Error::Rejected("PASV mode is disabled"));
        }
        privops::pasv_listen(session, self.config)
    }

    fn pasv_active(&self, session: &Session) -> Result<bool, Error> {
        Ok(privops::pasv_active(session))
    }

    fn get_pasv_fd(&self, session: &mut Session) -> Result<Result<Fd, AcceptFailure>, Error> {
        Ok(privops::accept_pasv(session, self.config))
    }

    fn pasv_cleanup(&self, session: &mut Session) -> Result<(), Error> {
        privops::pasv_cleanup(session);
        Ok(())
    }

    fn chown_upload(&self, session: &Session, fd: &Fd) -> Result<bool, Error> {
        privops::do_file_chown(session, fd)
    }
}

/// Serve one anonymous session in a single process; never returns.
pub fn start(session: Session, config: &Config, protocol: &mut dyn Protocol) -> ! {
    exit(confined(session, config, protocol))
}

fn confined(session: Session, config: &Config, protocol: &mut dyn Protocol) -> Result<(), Error> {
    if !config.one_process_model || config.local_enable || config.guest_enable {
        return Err(Error::Config(
            "one_process_model only supports anonymous sessions".into(),
        ));
    }

    let root = match &config.anon_root {
        Some(root) => root.clone(),
        None => lookup_user(&config.ftp_username)?.dir,
    };
    let mut credentials = Credentials::new(&config.ftp_username)
        .chroot(root)
        .max_files(config.max_files);
    if !config.sandbox_enable {
        credentials = credentials.no_fork();
    }
    for fd in protocol.keep_fds() {
        credentials = credentials.keep(fd)?;
    }
    change_credentials(&credentials)?;

    let policy = policy::build(Stage::OneProcess, &session, config);
    confine(policy, config, move || serve(session, config, protocol))
}

fn serve(mut session: Session, config: &Config, protocol: &mut dyn Protocol) -> Result<(), Error> {
    let ops = OneProcess::new(config);
    if protocol.prelogin(&mut session, &ops)? {
        protocol.postlogin(&mut session, &ops)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpStream;

    fn session() -> Session {
        Session::new(
            "127.0.0.1:21".parse().unwrap(),
            "127.0.0.1:40000".parse().unwrap(),
        )
    }

    fn config() -> Config {
        Config {
            one_process_model: true,
            delay_failed_login: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_anonymous_login() {
        let config = config();
        let ops = OneProcess::new(&config);

        let mut session = session();
        session.user = Some("anonymous".to_string());
        assert!(ops.login(&mut session, "x@y.com").unwrap());
        assert!(session.is_anonymous);
        assert_eq!(session.user.as_deref(), Some("ftp"));

        let mut session = self::session();
        session.user = Some("alice".to_string());
        assert!(!ops.login(&mut session, "secret").unwrap());
        assert!(!session.is_anonymous);
    }

    #[test]
    fn test_passive_lifecycle() {
        let config = Config {
            accept_timeout: 5,
            ..config()
        };
        let ops = OneProcess::new(&config);
        let mut session = session();

        assert!(!ops.pasv_active(&session).unwrap());
        let port = ops.pasv_listen(&mut session).unwrap();
        assert!(port >= 1024);
        assert!(ops.pasv_active(&session).unwrap());

        let client = TcpStream::connect(("127.0.0.1", port)).unwrap();
        let fd = ops.get_pasv_fd(&mut session).unwrap().unwrap();
        assert!(fd.stat().is_ok());
        assert!(!ops.pasv_active(&session).unwrap());
        drop(client);

        assert_eq!(
            ops.get_pasv_fd(&mut session).unwrap().err(),
            Some(AcceptFailure::Failed)
        );
        ops.pasv_listen(&mut session).unwrap();
        ops.pasv_cleanup(&mut session).unwrap();
        assert!(!ops.pasv_active(&session).unwrap());
    }

    #[test]
    fn test_disabled_modes() {
        let config = Config {
            port_enable: false,
            pasv_enable: false,
            ..config()
        };
        let ops = OneProcess::new(&config);
        let mut session = session();
        session.port_addr = Some("127.0.0.1:2000".parse().unwrap());
        assert!(matches!(
            ops.get_priv_data_sock(&mut session),
            Err(Error::Rejected(_))
        ));
        assert!(matches!(
            ops.pasv_listen(&mut session),
            Err(Error::Rejected(_))
        ));
    }
}
