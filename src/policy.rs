//! Sandbox policies of the FTP roles.
//!
//! The network validators only trust facts that were established before
//! the sandbox started: the address family and addresses of the control
//! connection.  Whatever the sandboxed process asks for is compared
//! against those.

use crate::{
    config::Config,
    error::Error,
    net::socket::{self, RawSockAddr},
    sandbox::{Policy, Sandbox, SocketOp},
    session::Session,
};
use std::net::SocketAddr;

/// Processes that run under a sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// The unprivileged child before login.
    Prelogin,
    /// The child after login in the two-process model; all networking
    /// goes through the broker.
    Postlogin,
    /// The single process of the one-process model.
    OneProcess,
}

/// Build the complete policy of a stage.
pub fn build(stage: Stage, session: &Session, config: &Config) -> Policy {
    let mut policy = Policy::new();
    baseline(&mut policy);

    if config.syslog_enable {
        policy.permit_syslog();
    }

    match stage {
        Stage::Prelogin => {
            if config.ssl_enable {
                // The pre-login child becomes the TLS slave and receives
                // the data connections for the handshake.
                policy.permit_recvmsg();
            }
        }
        Stage::Postlogin => {
            policy.permit_sendfile().permit_sendmsg().permit_recvmsg();
            permit_writes(&mut policy, session, config);
        }
        Stage::OneProcess => {
            policy.permit_sendfile().permit_poll().permit_getrandom();
            permit_writes(&mut policy, session, config);
            permit_network(&mut policy, session, config);
        }
    }

    policy
}

fn baseline(policy: &mut Policy) {
    policy
        .permit_exit()
        .permit_memory()
        .permit_read()
        .permit_write()
        .permit_recv()
        .permit_query_time()
        .permit_signals()
        .permit_alarm()
        .permit_sleep()
        .permit_getpid()
        .permit_open_readonly()
        .permit_close()
        .permit_file_stats()
        .permit_readlink()
        .permit_getcwd()
        .permit_chdir()
        .permit_getdents()
        .permit_seek()
        .permit_shutdown()
        .permit_fcntl()
        .permit_umask()
        .permit_socket_op_with(SocketOp::SetSockOpt, validate_sockopt)
        .permit_socket_op_with(SocketOp::GetSockOpt, validate_sockopt);
}

/// Filesystem changes allowed by the configuration for this identity.
fn permit_writes(policy: &mut Policy, session: &Session, config: &Config) {
    if !config.write_enable {
        return;
    }

    // The one-process model only ever serves anonymous sessions, and
    // the policy is built before the login.
    if session.is_anonymous || config.one_process_model {
        if !config.anon_writes() {
            return;
        }
        if config.anon_upload_enable {
            policy.permit_open_writable();
            if config.chown_uploads {
                policy.permit_fchown();
            }
        }
        if config.anon_mkdir_write_enable {
            policy.permit_mkdir();
        }
        if config.anon_other_write_enable {
            policy
                .permit_unlink()
                .permit_rmdir()
                .permit_rename()
                .permit_ftruncate();
            if config.mdtm_write {
                policy.permit_utime();
            }
        }
    } else {
        policy
            .permit_open_writable()
            .permit_mkdir()
            .permit_unlink()
            .permit_rmdir()
            .permit_rename()
            .permit_ftruncate();
        if config.mdtm_write {
            policy.permit_utime();
        }
        if config.chmod_enable {
            policy.permit_chmod().permit_fchmod();
        }
    }
}

/// Socket calls of the one-process model, each one checked against the
/// addresses of the control connection.
fn permit_network(policy: &mut Policy, session: &Session, config: &Config) {
    let local = session.local_addr;
    let remote = session.remote_addr;
    let data_port = if config.connect_from_port_20 {
        Some(config.ftp_data_port)
    } else {
        None
    };

    policy
        .permit_socket_op_with(SocketOp::Socket, move |sandbox| {
            validate_socket(
                &local,
                sandbox.get_socketcall_arg(0)?,
                sandbox.get_socketcall_arg(1)?,
                sandbox.get_socketcall_arg(2)?,
            )
        })
        .permit_socket_op_with(SocketOp::Bind, move |sandbox| {
            let addr = read_sockaddr(sandbox, &local)?;
            validate_bind(&local, data_port, &RawSockAddr::new(&addr))
        })
        .permit_socket_op_with(SocketOp::Connect, move |sandbox| {
            let addr = read_sockaddr(sandbox, &remote)?;
            validate_connect(&remote, &RawSockAddr::new(&addr))
        })
        .permit_socket_op(SocketOp::Listen)
        .permit_socket_op(SocketOp::Accept)
        .permit_socket_op(SocketOp::Accept4)
        .permit_socket_op(SocketOp::GetSockName)
        .permit_socket_op(SocketOp::GetPeerName);
}

/// Copy the `struct sockaddr` argument of `bind(2)`/`connect(2)`; its
/// length has to be exactly that of `expected`.
fn read_sockaddr(sandbox: &Sandbox, expected: &SocketAddr) -> Result<Vec<u8>, Error> {
    let len = sandbox.get_socketcall_arg(2)? as usize;
    if len != socket::sockaddr_len(expected) {
        return Err(Error::Rejected("socket address length"));
    }
    sandbox.get_buf(sandbox.get_socketcall_arg(1)?, len)
}

fn family(addr: &SocketAddr) -> u64 {
    socket::family(addr) as u64
}

pub fn validate_socket(
    local: &SocketAddr,
    domain: u64,
    kind: u64,
    protocol: u64,
) -> Result<(), Error> {
    if domain != family(local) {
        return Err(Error::Rejected("socket family"));
    }
    let flags = (libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC) as u64;
    if kind & !flags != libc::SOCK_STREAM as u64 {
        return Err(Error::Rejected("socket type"));
    }
    if protocol != 0 && protocol != libc::IPPROTO_TCP as u64 {
        return Err(Error::Rejected("socket protocol"));
    }
    Ok(())
}

pub fn validate_bind(
    local: &SocketAddr,
    data_port: Option<u16>,
    addr: &RawSockAddr<'_>,
) -> Result<(), Error> {
    if addr.family().map(|family| family as u64) != Some(family(local)) {
        return Err(Error::Rejected("bind family"));
    }
    if !addr.same_ip(&local.ip()) {
        return Err(Error::Rejected("bind address"));
    }
    match addr.port() {
        Some(0) => Ok(()),
        Some(port) if port >= 1024 => Ok(()),
        Some(port) if Some(port) == data_port => Ok(()),
        _ => Err(Error::Rejected("bind port")),
    }
}

pub fn validate_connect(remote: &SocketAddr, addr: &RawSockAddr<'_>) -> Result<(), Error> {
    if addr.family().map(|family| family as u64) != Some(family(remote)) {
        return Err(Error::Rejected("connect family"));
    }
    if !addr.same_ip(&remote.ip()) {
        return Err(Error::Rejected("connect address"));
    }
    Ok(())
}

/// Socket options that may be queried or changed.
pub fn is_allowed_sockopt(level: libc::c_int, name: libc::c_int) -> bool {
    match level {
        libc::SOL_SOCKET => matches!(
            name,
            libc::SO_KEEPALIVE
                | libc::SO_REUSEADDR
                | libc::SO_OOBINLINE
                | libc::SO_LINGER
                | libc::SO_ERROR
        ),
        libc::IPPROTO_TCP => name == libc::TCP_NODELAY,
        libc::IPPROTO_IP => name == libc::IP_TOS,
        _ => false,
    }
}

fn validate_sockopt(sandbox: &Sandbox) -> Result<(), Error> {
    let level = sandbox.get_socketcall_arg(1)? as libc::c_int;
    let name = sandbox.get_socketcall_arg(2)? as libc::c_int;
    if !is_allowed_sockopt(level, name) {
        return Err(Error::Rejected("socket option"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::nr;

    fn session() -> Session {
        Session::new(
            "192.0.2.1:21".parse().unwrap(),
            "198.51.100.7:40000".parse().unwrap(),
        )
    }

    #[test]
    fn test_baseline_has_no_network() {
        let table = build(Stage::Postlogin, &session(), &Config::default()).into_table();
        for nr in &[nr::SOCKET, nr::BIND, nr::CONNECT, nr::LISTEN, nr::ACCEPT4] {
            assert!(!table.is_allowed(*nr), "syscall {} allowed", nr);
        }
        for nr in &[nr::FORK, nr::VFORK, nr::CLONE, nr::CLONE3, nr::EXECVE, nr::KILL] {
            assert!(!table.is_allowed(*nr), "syscall {} allowed", nr);
        }
        assert!(table.is_allowed(nr::SENDMSG));
        assert!(!table.is_allowed(nr::MKDIR));
    }

    #[test]
    fn test_writes_follow_config() {
        let mut session = session();
        session.is_anonymous = true;
        let config = Config {
            write_enable: true,
            anon_mkdir_write_enable: true,
            ..Default::default()
        };
        let table = build(Stage::Postlogin, &session, &config).into_table();
        assert!(table.is_allowed(nr::MKDIR));
        assert!(!table.is_allowed(nr::UNLINK));
        assert!(!table.is_allowed(nr::CHMOD));
    }

    #[test]
    fn test_one_process_network() {
        let table = build(Stage::OneProcess, &session(), &Config::default()).into_table();
        for nr in &[nr::SOCKET, nr::BIND, nr::CONNECT, nr::LISTEN, nr::ACCEPT4, nr::POLL] {
            assert!(table.is_allowed(*nr), "syscall {} denied", nr);
        }
        assert!(!table.is_allowed(nr::SOCKETPAIR));
    }

    #[test]
    fn test_validate_socket() {
        let local: SocketAddr = "192.0.2.1:21".parse().unwrap();
        let inet = libc::AF_INET as u64;
        let stream = (libc::SOCK_STREAM | libc::SOCK_CLOEXEC) as u64;
        assert!(validate_socket(&local, inet, stream, 0).is_ok());
        assert!(validate_socket(&local, libc::AF_INET6 as u64, stream, 0).is_err());
        assert!(validate_socket(&local, inet, libc::SOCK_DGRAM as u64, 0).is_err());
        assert!(validate_socket(&local, inet, libc::SOCK_RAW as u64, 0).is_err());
        assert!(validate_socket(&local, inet, stream, libc::IPPROTO_UDP as u64).is_err());
    }

    #[test]
    fn test_validate_bind() {
        let local: SocketAddr = "192.0.2.1:21".parse().unwrap();
        let check = |addr: &str, data_port| {
            let bytes = socket::encode_sockaddr(&addr.parse().unwrap());
            validate_bind(&local, data_port, &RawSockAddr::new(&bytes))
        };

        assert!(check("192.0.2.1:0", None).is_ok());
        assert!(check("192.0.2.1:50000", None).is_ok());
        assert!(check("192.0.2.1:20", Some(20)).is_ok());
        assert!(check("192.0.2.1:20", None).is_err());
        assert!(check("192.0.2.1:22", Some(20)).is_err());
        assert!(check("192.0.2.2:50000", None).is_err());
        assert!(check("[::1]:50000", None).is_err());
    }

    #[test]
    fn test_sockopts() {
        assert!(is_allowed_sockopt(libc::SOL_SOCKET, libc::SO_KEEPALIVE));
        assert!(is_allowed_sockopt(libc::IPPROTO_TCP, libc::TCP_NODELAY));
        assert!(!is_allowed_sockopt(libc::SOL_SOCKET, libc::SO_BINDTODEVICE));
        assert!(!is_allowed_sockopt(libc::IPPROTO_IP, libc::IP_HDRINCL));
    }
}
