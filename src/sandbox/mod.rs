//! Syscall sandbox built on `ptrace(2)`.
//!
//! A [`Policy`] is populated with `permit_*` grants and then frozen into
//! a [`Sandbox`].  [`Sandbox::launch`] forks the process to confine;
//! the child stops itself at the attach point before it runs any of the
//! confined code, and [`Sandbox::run`] then traces it until it exits.
//! Every syscall is decided at entry: numbers outside of the table or
//! without a grant kill the process, granted calls run their argument
//! validator first.
//!
//! The sandbox only supports x86_64 Linux.  Everywhere else
//! [`Sandbox::new`] fails with [`Error::SandboxUnavailable`].

mod permit;
pub mod regs;
mod table;
mod tracee;

use crate::error::Error;
use derive_more::Display;
use ftp_privsep_log::{debug, warn};
use nix::unistd::Pid;

pub use {
    permit::Policy,
    regs::{nr, Registers, SocketOp},
    table::{Rule, Table, Validator},
    tracee::{Tracee, MAX_REMOTE_READ},
};

/// The reason why a sandboxed process was killed.
#[derive(Debug, Display, Clone, Copy, PartialEq)]
pub enum Violation {
    #[display(fmt = "syscall {} is out of bounds", "_0")]
    UnknownSyscall(u64),
    #[display(fmt = "syscall {} is not allowed", "_0")]
    Disallowed(u64),
    #[display(fmt = "socket operation {} is not allowed", "_0")]
    DisallowedSocketOp(u64),
    #[display(fmt = "malformed socket operation selector {}", "_0")]
    BadSocketOp(u64),
    #[display(fmt = "syscall {} failed validation: {}", nr, reason)]
    Validator { nr: u64, reason: &'static str },
    #[display(fmt = "syscall issued from a foreign ABI (cs {:#x}, ip {:#x})", cs, ip)]
    ForeignAbi { cs: u64, ip: u64 },
}

/// Returns true if the sandbox can be used on this target.
pub fn is_available() -> bool {
    cfg!(all(target_os = "linux", target_arch = "x86_64"))
}

/// Per-event state; only valid while one syscall entry is handled.
#[derive(Debug)]
struct Event {
    regs: Registers,
    socket_op: Option<SocketOp>,
}

/// A frozen policy and the process it confines.
pub struct Sandbox {
    table: Table,
    tracee: Option<Box<dyn Tracee>>,
    event: Option<Event>,
    in_syscall: bool,
}

impl Sandbox {
    /// Freeze the policy for a process that is launched later.
    pub fn new(policy: Policy) -> Result<Self, Error> {
        if !is_available() {
            return Err(Error::SandboxUnavailable);
        }
        Ok(Self::with_table(policy.into_table(), None))
    }

    /// Enforce the policy on an already stopped process view.
    pub fn with_tracee(policy: Policy, tracee: Box<dyn Tracee>) -> Self {
        Self::with_table(policy.into_table(), Some(tracee))
    }

    fn with_table(table: Table, tracee: Option<Box<dyn Tracee>>) -> Self {
        Self {
            table,
            tracee,
            event: None,
            in_syscall: false,
        }
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    /// The confined process, once launched.
    pub fn pid(&self) -> Option<Pid> {
        self.tracee.as_ref().map(|tracee| tracee.pid())
    }

    fn tracee(&self) -> Result<&dyn Tracee, Error> {
        self.tracee
            .as_deref()
            .ok_or(Error::Bug("sandbox has no traced process"))
    }

    fn event(&self) -> Result<&Event, Error> {
        self.event.as_ref().ok_or(Error::NoEvent)
    }

    /// Number of the syscall being decided.
    pub fn syscall_nr(&self) -> Result<u64, Error> {
        Ok(self.event()?.regs.nr)
    }

    /// Argument `n` (0-based) of the syscall being decided.
    pub fn get_arg(&self, n: usize) -> Result<u64, Error> {
        self.event()?
            .regs
            .args
            .get(n)
            .copied()
            .ok_or(Error::Bug("syscall argument out of range"))
    }

    /// Argument `n` of the socket operation being decided.
    ///
    /// Direct socket syscalls carry the operation arguments in
    /// registers, in the same order as the `socketcall(2)` array.
    pub fn get_socketcall_arg(&self, n: usize) -> Result<u64, Error> {
        if self.event()?.socket_op.is_none() {
            return Err(Error::NoEvent);
        }
        self.get_arg(n)
    }

    /// Copy `len` bytes of the process memory at `addr`.
    pub fn get_buf(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
        self.event()?;
        self.tracee()?.read_bytes(addr, len)
    }

    /// Read one native-endian 64 bit value of the process memory.
    pub fn get_long(&self, addr: u64) -> Result<u64, Error> {
        let buf = self.get_buf(addr, 8)?;
        let mut value = [0u8; 8];
        value.copy_from_slice(&buf);
        Ok(u64::from_ne_bytes(value))
    }

    /// Decide the syscall the process is currently entering.
    pub fn handle_syscall_entry(&mut self) -> Result<(), Error> {
        let regs = self.tracee()?.registers()?;
        self.check_abi(&regs)?;

        let socket_op = SocketOp::from_syscall(regs.nr);
        self.event = Some(Event { regs, socket_op });
        let result = self.check(&regs, socket_op);
        self.event = None;

        result
    }

    /// Refuse syscalls that did not enter through the 64-bit table.
    ///
    /// `int 0x80` keeps the 64-bit code segment but is dispatched with
    /// the 32-bit numbers, so the instruction that entered the kernel is
    /// read back as well.
    fn check_abi(&self, regs: &Registers) -> Result<(), Error> {
        let foreign = Violation::ForeignAbi {
            cs: regs.cs,
            ip: regs.ip,
        };
        if regs.cs != regs::USER_CS_64 {
            return Err(foreign.into());
        }
        match self.tracee()?.read_bytes(regs.ip.wrapping_sub(2), 2) {
            Ok(insn) if insn[..] == regs::SYSCALL_INSN => Ok(()),
            Ok(insn) => {
                debug!("syscall {} entered by {:02x?}", regs.nr, insn);
                Err(foreign.into())
            }
            Err(err) if err.is_gone() => Err(Error::ProcessGone),
            Err(_) => Err(foreign.into()),
        }
    }

    fn check(&self, regs: &Registers, socket_op: Option<SocketOp>) -> Result<(), Error> {
        let rule = match socket_op {
            Some(op) => self.table.socket_op(op.selector())?,
            None => self.table.syscall(regs.nr)?,
        };
        let validator = match &rule.validator {
            Some(validator) => validator,
            None => return Ok(()),
        };

        match validator(self) {
            Ok(()) => Ok(()),
            Err(err) if err.is_gone() => Err(Error::ProcessGone),
            Err(Error::Rejected(reason)) => Err(Violation::Validator { nr: regs.nr, reason }.into()),
            Err(err) => {
                debug!("syscall {} validator failed: {}", regs.nr, err);
                Err(Violation::Validator {
                    nr: regs.nr,
                    reason: "unreadable argument",
                }
                .into())
            }
        }
    }
}

cfg_if::cfg_if! {
    if #[cfg(all(target_os = "linux", target_arch = "x86_64"))] {
        use nix::{
            errno::Errno,
            sys::{
                ptrace,
                signal::{kill, Signal},
                wait::{waitpid, WaitPidFlag, WaitStatus},
            },
            unistd::{fork, getpid, ForkResult},
        };
        use tracee::PtraceView;

        /// Exit code of a child that could not be attached.
        const ATTACH_FAILED: i32 = 127;

        impl Sandbox {
            /// Stop the current process until the tracer attached.
            ///
            /// `kill(2)` is used instead of `raise(3)`, which also
            /// changes the signal mask.
            pub fn attach_point() -> Result<(), Error> {
                ptrace::traceme()?;
                kill(getpid(), Signal::SIGSTOP)?;
                Ok(())
            }

            /// Fork the process to confine; the child runs `f` once
            /// it is traced and exits with its return value.
            pub fn launch<F: FnOnce() -> i32>(&mut self, f: F) -> Result<Pid, Error> {
                if self.tracee.is_some() {
                    return Err(Error::Bug("sandbox launched twice"));
                }

                let child = match unsafe { fork() }? {
                    ForkResult::Child => {
                        let code = match Self::attach_point() {
                            Ok(()) => f(),
                            Err(_) => ATTACH_FAILED,
                        };
                        unsafe { libc::_exit(code) }
                    }
                    ForkResult::Parent { child } => child,
                };

                loop {
                    match waitpid(child, Some(WaitPidFlag::__WALL)) {
                        Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => break,
                        Ok(WaitStatus::Exited(_, ATTACH_FAILED)) => return Err(Errno::EPERM.into()),
                        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                            return Err(Error::ProcessGone)
                        }
                        Ok(_) | Err(Errno::EINTR) => continue,
                        Err(err) => return Err(err.into()),
                    }
                }

                // Process creation is traced as well, so no child can
                // race past the policy.
                let options = ptrace::Options::PTRACE_O_TRACESYSGOOD
                    | ptrace::Options::PTRACE_O_TRACEFORK
                    | ptrace::Options::PTRACE_O_TRACEVFORK
                    | ptrace::Options::PTRACE_O_TRACECLONE
                    | ptrace::Options::PTRACE_O_EXITKILL;
                if let Err(err) = ptrace::setoptions(child, options) {
                    let _ = kill(child, Signal::SIGKILL);
                    let _ = waitpid(child, Some(WaitPidFlag::__WALL));
                    return Err(err.into());
                }

                debug!("sandbox attached to process {}", child);
                self.tracee = Some(Box::new(PtraceView::new(child)));
                self.in_syscall = false;

                Ok(child)
            }

            fn resume(&self, pid: Pid, signal: Option<Signal>) -> Result<(), Error> {
                ptrace::syscall(pid, signal).map_err(|err| match err {
                    Errno::ESRCH => Error::ProcessGone,
                    err => err.into(),
                })
            }

            /// Trace the launched process until it is gone.
            ///
            /// Returns normally when the process exited or was killed,
            /// and with [`Error::Violation`] after it was killed for
            /// breaking the policy.
            pub fn run(&mut self) -> Result<(), Error> {
                let pid = self.pid().ok_or(Error::Bug("sandbox not launched"))?;
                let mut signal = None;

                loop {
                    match self.resume(pid, signal.take()) {
                        Ok(()) => {}
                        Err(err) if err.is_gone() => return Ok(()),
                        Err(err) => return Err(err),
                    }

                    let status = loop {
                        match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                            Err(Errno::EINTR) => continue,
                            Err(Errno::ECHILD) => return Ok(()),
                            result => break result?,
                        }
                    };

                    match status {
                        WaitStatus::Exited(_, code) => {
                            debug!("sandboxed process {} exited with {}", pid, code);
                            return Ok(());
                        }
                        WaitStatus::Signaled(_, sig, _) => {
                            debug!("sandboxed process {} killed by {}", pid, sig);
                            return Ok(());
                        }
                        WaitStatus::PtraceSyscall(_) if self.in_syscall => {
                            // Exits are not inspected.
                            self.in_syscall = false;
                        }
                        WaitStatus::PtraceSyscall(_) => {
                            self.in_syscall = true;
                            match self.handle_syscall_entry() {
                                Ok(()) => {}
                                Err(err) if err.is_gone() => return Ok(()),
                                Err(err) => {
                                    warn!("killing sandboxed process {}: {}", pid, err);
                                    self.kill_processes();
                                    return Err(err);
                                }
                            }
                        }
                        WaitStatus::Stopped(_, sig) => match sig {
                            Signal::SIGSTOP | Signal::SIGTSTP | Signal::SIGTTIN | Signal::SIGTTOU => {
                                // Job control stops are not passed through.
                                debug!("sandboxed process {} got {}, killing", pid, sig);
                                self.kill_processes();
                                return Ok(());
                            }
                            sig => signal = Some(sig),
                        },
                        WaitStatus::PtraceEvent(..)
                        | WaitStatus::Continued(_)
                        | WaitStatus::StillAlive => {}
                    }
                }
            }

            /// Kill the traced process.
            ///
            /// When it is stopped at a syscall entry, the pending call is
            /// first replaced by `exit_group` so that it can never run.
            pub fn kill_processes(&mut self) {
                let tracee = match self.tracee.take() {
                    Some(tracee) => tracee,
                    None => return,
                };
                let pid = tracee.pid();

                if self.in_syscall {
                    let _ = tracee.set_syscall(nr::EXIT_GROUP);
                }
                let _ = kill(pid, Signal::SIGKILL);

                loop {
                    match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                        Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => break,
                        Ok(_) | Err(Errno::EINTR) => continue,
                        Err(_) => break,
                    }
                }
                self.in_syscall = false;
            }
        }
    } else {
        impl Sandbox {
            pub fn attach_point() -> Result<(), Error> {
                Err(Error::SandboxUnavailable)
            }

            pub fn launch<F: FnOnce() -> i32>(&mut self, _f: F) -> Result<Pid, Error> {
                Err(Error::SandboxUnavailable)
            }

            pub fn run(&mut self) -> Result<(), Error> {
                Err(Error::SandboxUnavailable)
            }

            pub fn kill_processes(&mut self) {
                self.tracee = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct Mock {
        regs: Registers,
        memory: Vec<u8>,
        /// The instruction that entered the kernel.
        insn: Option<[u8; 2]>,
        rewritten: Rc<Cell<Option<u64>>>,
    }

    impl Tracee for Mock {
        fn pid(&self) -> Pid {
            Pid::from_raw(i32::MAX)
        }

        fn registers(&self) -> Result<Registers, Error> {
            Ok(self.regs)
        }

        fn read_bytes(&self, addr: u64, len: usize) -> Result<Vec<u8>, Error> {
            if let Some(insn) = self.insn.filter(|_| addr == self.regs.ip.wrapping_sub(2)) {
                return Ok(insn[..len.min(2)].to_vec());
            }
            let start = addr as usize;
            self.memory
                .get(start..start + len)
                .map(<[u8]>::to_vec)
                .ok_or(Error::UnixError(nix::errno::Errno::EFAULT))
        }

        fn set_syscall(&self, nr: u64) -> Result<(), Error> {
            self.rewritten.set(Some(nr));
            Ok(())
        }
    }

    /// Where the mock process issued its syscall.
    const TEXT: u64 = 0x40_1000;

    fn entered_by(policy: Policy, mut regs: Registers, insn: [u8; 2]) -> Sandbox {
        regs.ip = TEXT + 2;
        Sandbox::with_tracee(
            policy,
            Box::new(Mock {
                regs,
                memory: (0u8..64).collect(),
                insn: Some(insn),
                rewritten: Default::default(),
            }),
        )
    }

    fn sandbox(policy: Policy, regs: Registers) -> Sandbox {
        entered_by(policy, regs, regs::SYSCALL_INSN)
    }

    #[test]
    fn test_no_event_outside_of_entry() {
        let sandbox = sandbox(Policy::new(), Registers::syscall(nr::READ, &[0]));
        assert!(matches!(sandbox.get_arg(0), Err(Error::NoEvent)));
        assert!(matches!(sandbox.get_buf(0, 4), Err(Error::NoEvent)));
        assert!(matches!(sandbox.syscall_nr(), Err(Error::NoEvent)));
    }

    #[test]
    fn test_default_deny() {
        let mut sandbox = sandbox(Policy::new(), Registers::syscall(nr::FORK, &[]));
        assert!(matches!(
            sandbox.handle_syscall_entry(),
            Err(Error::Violation(Violation::Disallowed(nr::FORK)))
        ));

        let mut sandbox = self::sandbox(Policy::new(), Registers::syscall(1000, &[]));
        assert!(matches!(
            sandbox.handle_syscall_entry(),
            Err(Error::Violation(Violation::UnknownSyscall(1000)))
        ));
    }

    #[test]
    fn test_foreign_abi() {
        let mut regs = Registers::syscall(nr::READ, &[]);
        regs.cs = 0x23;
        let mut policy = Policy::new();
        policy.permit_read();
        let mut sandbox = sandbox(policy, regs);
        assert!(matches!(
            sandbox.handle_syscall_entry(),
            Err(Error::Violation(Violation::ForeignAbi { cs: 0x23, .. }))
        ));
    }

    #[test]
    fn test_int80_is_foreign() {
        // munmap in the 64-bit table, execve in the 32-bit one.
        let mut policy = Policy::new();
        policy.permit_memory();

        let mut sandbox = entered_by(policy, Registers::syscall(nr::MUNMAP, &[]), [0xcd, 0x80]);
        assert!(matches!(
            sandbox.handle_syscall_entry(),
            Err(Error::Violation(Violation::ForeignAbi {
                cs: regs::USER_CS_64,
                ip,
            })) if ip == TEXT + 2
        ));

        // sysenter
        let mut policy = Policy::new();
        policy.permit_memory();
        let mut sandbox = entered_by(policy, Registers::syscall(nr::MUNMAP, &[]), [0x0f, 0x34]);
        assert!(sandbox.handle_syscall_entry().is_err());

        let mut policy = Policy::new();
        policy.permit_memory();
        let mut sandbox = self::sandbox(policy, Registers::syscall(nr::MUNMAP, &[]));
        sandbox.handle_syscall_entry().unwrap();
    }

    #[test]
    fn test_unreadable_instruction() {
        let mut policy = Policy::new();
        policy.permit_read();
        let mut sandbox = Sandbox::with_tracee(
            policy,
            Box::new(Mock {
                regs: Registers::syscall(nr::READ, &[]),
                memory: vec![],
                insn: None,
                rewritten: Default::default(),
            }),
        );
        assert!(matches!(
            sandbox.handle_syscall_entry(),
            Err(Error::Violation(Violation::ForeignAbi { .. }))
        ));
    }

    #[test]
    fn test_validator_sees_event() {
        let mut policy = Policy::new();
        policy.permit_with(nr::WRITE, |sandbox| {
            if sandbox.get_arg(0)? != 2 {
                return Err(Error::Rejected("not stderr"));
            }
            if sandbox.get_long(8)? != u64::from_ne_bytes([8, 9, 10, 11, 12, 13, 14, 15]) {
                return Err(Error::Rejected("unexpected memory"));
            }
            Ok(())
        });

        let mut sandbox = sandbox(policy, Registers::syscall(nr::WRITE, &[2]));
        sandbox.handle_syscall_entry().unwrap();
        assert!(matches!(sandbox.get_arg(0), Err(Error::NoEvent)));
    }

    #[test]
    fn test_validator_rejects() {
        let mut policy = Policy::new();
        policy.permit_with(nr::WRITE, |sandbox| match sandbox.get_arg(0)? {
            1 | 2 => Ok(()),
            _ => Err(Error::Rejected("not stdout or stderr")),
        });

        let mut sandbox = sandbox(policy, Registers::syscall(nr::WRITE, &[5]));
        assert!(matches!(
            sandbox.handle_syscall_entry(),
            Err(Error::Violation(Violation::Validator {
                nr: nr::WRITE,
                reason: "not stdout or stderr"
            }))
        ));
    }

    #[test]
    fn test_unreadable_argument() {
        let mut policy = Policy::new();
        policy.permit_with(nr::WRITE, |sandbox| sandbox.get_buf(4096, 16).map(drop));

        let mut sandbox = sandbox(policy, Registers::syscall(nr::WRITE, &[1]));
        assert!(matches!(
            sandbox.handle_syscall_entry(),
            Err(Error::Violation(Violation::Validator { nr: nr::WRITE, .. }))
        ));
    }

    #[test]
    fn test_socketcall_arg() {
        let mut policy = Policy::new();
        policy.permit_socket_op_with(SocketOp::Listen, |sandbox| {
            if sandbox.get_socketcall_arg(1)? > 1 {
                return Err(Error::Rejected("backlog too large"));
            }
            Ok(())
        });

        let mut sandbox = self::sandbox(policy, Registers::syscall(nr::LISTEN, &[3, 1]));
        sandbox.handle_syscall_entry().unwrap();

        let mut policy = Policy::new();
        policy.permit_with(nr::READ, |sandbox| sandbox.get_socketcall_arg(0).map(drop));
        let mut sandbox = self::sandbox(policy, Registers::syscall(nr::READ, &[0]));
        assert!(sandbox.handle_syscall_entry().is_err());
    }
}
