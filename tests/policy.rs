use ftp_privsep::{
    net::socket::encode_sockaddr,
    policy::{self, Stage},
    sandbox::{nr, regs::SYSCALL_INSN, Policy, Registers, Sandbox, Table, Tracee, Violation},
    Config, Error, Session,
};
use nix::unistd::Pid;
use std::net::SocketAddr;

/// A stopped process with a fixed register set and memory.
struct Stopped {
    regs: Registers,
    memory: Vec<u8>,
}

impl Tracee for Stopped {
    fn pid(&self) -> Pid {
        Pid::from_raw(i32::MAX)
    }

    fn registers(&self) -> Result<Registers, Error> {
        Ok(self.regs)
    }

    fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        // Every call was issued by a `syscall` instruction.
        if addr == self.regs.ip.wrapping_sub(2) && len == SYSCALL_INSN.len() {
            return Ok(SYSCALL_INSN.to_vec());
        }
        let start = addr as usize;
        self.memory
            .get(start..start + len)
            .map(<[u8]>::to_vec)
            .ok_or(Error::ProcessGone)
    }

    fn set_syscall(&self, _nr: u64) -> Result<(), Error> {
        Ok(())
    }
}

const LOCAL: &str = "192.0.2.1:21";
const REMOTE: &str = "198.51.100.7:40000";

fn session() -> Session {
    Session::new(LOCAL.parse().unwrap(), REMOTE.parse().unwrap())
}

/// Enter `nr` with a socket address as argument 1 in a one-process
/// sandbox.
fn enter_with_addr(nr: u64, addr: &str, config: &Config) -> Result<(), Error> {
    let addr: SocketAddr = addr.parse().unwrap();
    let memory = encode_sockaddr(&addr);
    let regs = Registers::syscall(nr, &[3, 0, memory.len() as u64]);
    enter(regs, memory, config)
}

fn enter(regs: Registers, memory: Vec<u8>, config: &Config) -> Result<(), Error> {
    let policy = policy::build(Stage::OneProcess, &session(), config);
    let mut sandbox = Sandbox::with_tracee(policy, Box::new(Stopped { regs, memory }));
    sandbox.handle_syscall_entry()
}

#[test]
fn test_connect_only_to_peer() {
    let config = Config::default();

    assert!(enter_with_addr(nr::CONNECT, "198.51.100.7:2000", &config).is_ok());

    // One byte off in the address.
    assert!(matches!(
        enter_with_addr(nr::CONNECT, "198.51.100.8:2000", &config),
        Err(Error::Violation(Violation::Validator {
            nr: nr::CONNECT,
            reason: "connect address"
        }))
    ));
    assert!(matches!(
        enter_with_addr(nr::CONNECT, "[::ffff:198.51.100.7]:2000", &config),
        Err(Error::Violation(Violation::Validator {
            nr: nr::CONNECT,
            ..
        }))
    ));
}

#[test]
fn test_bind_only_local_address() {
    let config = Config::default();

    assert!(enter_with_addr(nr::BIND, "192.0.2.1:0", &config).is_ok());
    assert!(enter_with_addr(nr::BIND, "192.0.2.1:40001", &config).is_ok());
    assert!(matches!(
        enter_with_addr(nr::BIND, "192.0.2.1:20", &config),
        Err(Error::Violation(Violation::Validator {
            reason: "bind port",
            ..
        }))
    ));
    assert!(matches!(
        enter_with_addr(nr::BIND, "0.0.0.0:40001", &config),
        Err(Error::Violation(Violation::Validator {
            reason: "bind address",
            ..
        }))
    ));
}

#[test]
fn test_socket_family() {
    let config = Config::default();
    let inet = libc::AF_INET as u64;
    let stream = libc::SOCK_STREAM as u64;

    let regs = Registers::syscall(nr::SOCKET, &[inet, stream, 0]);
    assert!(enter(regs, vec![], &config).is_ok());

    let regs = Registers::syscall(nr::SOCKET, &[libc::AF_UNIX as u64, stream, 0]);
    assert!(matches!(
        enter(regs, vec![], &config),
        Err(Error::Violation(Violation::Validator { nr: nr::SOCKET, .. }))
    ));

    let regs = Registers::syscall(nr::SOCKET, &[libc::AF_PACKET as u64, libc::SOCK_RAW as u64, 0]);
    assert!(enter(regs, vec![], &config).is_err());
}

#[test]
fn test_sockopt_allow_list() {
    let config = Config::default();

    let regs = Registers::syscall(
        nr::SETSOCKOPT,
        &[3, libc::SOL_SOCKET as u64, libc::SO_KEEPALIVE as u64],
    );
    assert!(enter(regs, vec![], &config).is_ok());

    let regs = Registers::syscall(
        nr::SETSOCKOPT,
        &[3, libc::SOL_SOCKET as u64, libc::SO_BINDTODEVICE as u64],
    );
    assert!(enter(regs, vec![], &config).is_err());
}

#[test]
fn test_vanished_process_is_not_a_violation() {
    // The address can not be read any more.
    let regs = Registers::syscall(nr::CONNECT, &[3, 0, 16]);
    assert!(matches!(
        enter(regs, vec![], &Config::default()),
        Err(Error::ProcessGone)
    ));
}

#[test]
fn test_process_creation_always_denied() {
    let config = Config {
        write_enable: true,
        anon_upload_enable: true,
        anon_mkdir_write_enable: true,
        anon_other_write_enable: true,
        ssl_enable: true,
        syslog_enable: true,
        ..Default::default()
    };

    for stage in &[Stage::Prelogin, Stage::Postlogin, Stage::OneProcess] {
        let regs = Registers::syscall(nr::CLONE, &[libc::CLONE_UNTRACED as u64]);
        let policy = policy::build(*stage, &session(), &config);
        let tracee = Stopped {
            regs,
            memory: vec![],
        };
        let mut sandbox = Sandbox::with_tracee(policy, Box::new(tracee));
        assert!(matches!(
            sandbox.handle_syscall_entry(),
            Err(Error::Violation(Violation::Disallowed(nr::CLONE)))
        ));
    }
}

/// Syscalls no configuration may ever grant.
const FORBIDDEN: &[u64] = &[
    nr::FORK,
    nr::VFORK,
    nr::CLONE,
    nr::CLONE3,
    nr::EXECVE,
    nr::KILL,
    nr::SOCKETPAIR,
];

fn idle() -> Box<Stopped> {
    Box::new(Stopped {
        regs: Registers::default(),
        memory: vec![],
    })
}

#[test]
fn test_empty_policy() {
    let sandbox = Sandbox::with_tracee(Policy::new(), idle());
    assert_eq!(sandbox.table().allowed_syscalls().count(), 0);
    assert_eq!(sandbox.table().allowed_socket_ops().count(), 0);
}

#[test]
fn test_allow_list() {
    let config = Config {
        local_enable: true,
        write_enable: true,
        anon_upload_enable: true,
        anon_mkdir_write_enable: true,
        anon_other_write_enable: true,
        chown_uploads: true,
        ssl_enable: true,
        syslog_enable: true,
        ..Default::default()
    };
    let mut anonymous = session();
    anonymous.is_anonymous = true;

    for session in &[session(), anonymous] {
        for stage in &[Stage::Prelogin, Stage::Postlogin, Stage::OneProcess] {
            let policy = policy::build(*stage, session, &config);
            let sandbox = Sandbox::with_tracee(policy, idle());
            let table: &Table = sandbox.table();
            for nr in table.allowed_syscalls() {
                assert!(!FORBIDDEN.contains(&nr), "syscall {} granted", nr);
            }
            for nr in FORBIDDEN {
                assert!(!table.is_allowed(*nr), "syscall {} allowed", nr);
            }
        }
    }
}
