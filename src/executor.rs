//! The loops of the privileged parent.
//!
//! Both loops handle exactly one request at a time.  They end when the
//! child closes its end of the channel; any malformed or unexpected
//! request is returned as an error and terminates the parent.

use crate::{
    broker::{PrivCommand, PrivReply, PrivRequest},
    channel::Channel,
    config::Config,
    error::Error,
    login::{self, do_login, Authenticator, LoginResult},
    privops,
    session::Session,
};
use ftp_privsep_log::{debug, info};
use std::thread;

/// Serve login requests until one succeeds.
///
/// Returns `None` if the child went away before a successful login.
pub fn login_loop(
    session: &mut Session,
    config: &Config,
    auth: &dyn Authenticator,
    channel: &Channel,
) -> Result<Option<LoginResult>, Error> {
    while let Some(request) = PrivRequest::recv(channel)? {
        let (user, pass, control_ssl, data_ssl) = match request {
            PrivRequest::Login {
                user,
                pass,
                control_ssl,
                data_ssl,
            } => (user, pass, control_ssl, data_ssl),
            request => return Err(Error::UnexpectedCommand(request.command().into())),
        };

        // TLS flags of a server without TLS are ignored.
        session.control_ssl = control_ssl && config.ssl_enable;
        session.data_ssl = data_ssl && config.ssl_enable;

        let result = do_login(session, config, auth, &user, &pass);
        match result {
            LoginResult::Fail => info!("failed login for user '{}'", user),
            LoginResult::Anon => info!(
                "anonymous login, identity '{}'",
                session.anon_identity.as_deref().unwrap_or("?")
            ),
            LoginResult::Real => info!("login for user '{}'", user),
        }
        let delay = login::delay(config, result);
        if !delay.is_zero() {
            thread::sleep(delay);
        }

        PrivReply::Login(result != LoginResult::Fail).send(channel)?;
        if result != LoginResult::Fail {
            return Ok(Some(result));
        }
    }

    Ok(None)
}

/// Perform one post-login request.
pub fn handle_request(
    session: &mut Session,
    config: &Config,
    request: PrivRequest,
) -> Result<PrivReply, Error> {
    let reply = match request {
        PrivRequest::Login { .. } => {
            return Err(Error::UnexpectedCommand(PrivCommand::Login.into()))
        }
        PrivRequest::GetDataSock { port } => {
            if !config.port_enable {
                return Err(Error::Rejected("PORT mode is disabled"));
            }
            let mut remote = session.remote_addr;
            remote.set_port(port);
            PrivReply::DataSock(privops::get_ftp_port_sock(session, config, remote)?)
        }
        PrivRequest::Chown(fd) => PrivReply::Chown(privops::do_file_chown(session, &fd)?),
        PrivRequest::PasvCleanup => {
            privops::pasv_cleanup(session);
            PrivReply::PasvCleanup
        }
        PrivRequest::PasvActive => PrivReply::PasvActive(privops::pasv_active(session)),
        PrivRequest::PasvListen => {
            if !config.pasv_enable {
                return Err(Error::Rejected("PASV mode is disabled"));
            }
            PrivReply::PasvListen(privops::pasv_listen(session, config)?)
        }
        PrivRequest::PasvAccept => PrivReply::PasvAccept(privops::accept_pasv(session, config)),
    };

    Ok(reply)
}

/// Serve post-login requests until the child closes the channel.
pub fn serve(session: &mut Session, config: &Config, channel: &Channel) -> Result<(), Error> {
    while let Some(request) = PrivRequest::recv(channel)? {
        debug!("privileged request {}", request.command().as_ref());
        handle_request(session, config, request)?.send(channel)?;
    }

    debug!("child closed the privileged channel");
    Ok(())
}
