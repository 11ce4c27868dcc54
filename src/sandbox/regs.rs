//! The x86_64 syscall vocabulary of the sandbox.
//!
//! The numbers are those of the 64-bit Linux syscall table.  A 64-bit
//! process can still enter the 32-bit table with `int 0x80`, so a
//! syscall only counts as 64-bit if it runs in the 64-bit code segment
//! and was issued by the `syscall` instruction.

/// Code segment selector of 64-bit user mode.
pub const USER_CS_64: u64 = 0x33;

/// Encoding of the `syscall` instruction.
pub const SYSCALL_INSN: [u8; 2] = [0x0f, 0x05];

/// Snapshot of the registers that describe one syscall.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Registers {
    /// The syscall number (`orig_rax`).
    pub nr: u64,
    /// Arguments in syscall order (`rdi, rsi, rdx, r10, r8, r9`).
    pub args: [u64; 6],
    /// Code segment of the calling instruction.
    pub cs: u64,
    /// Instruction pointer, just past the instruction that entered the
    /// kernel.
    pub ip: u64,
}

impl Registers {
    /// A syscall issued from 64-bit mode.
    pub fn syscall(nr: u64, args: &[u64]) -> Self {
        let mut regs = Self {
            nr,
            cs: USER_CS_64,
            ..Default::default()
        };
        for (slot, arg) in regs.args.iter_mut().zip(args) {
            *slot = *arg;
        }
        regs
    }
}

#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
impl From<libc::user_regs_struct> for Registers {
    fn from(regs: libc::user_regs_struct) -> Self {
        Self {
            nr: regs.orig_rax,
            args: [regs.rdi, regs.rsi, regs.rdx, regs.r10, regs.r8, regs.r9],
            cs: regs.cs,
            ip: regs.rip,
        }
    }
}

/// Syscall numbers.
pub mod nr {
    pub const READ: u64 = 0;
    pub const WRITE: u64 = 1;
    pub const OPEN: u64 = 2;
    pub const CLOSE: u64 = 3;
    pub const STAT: u64 = 4;
    pub const FSTAT: u64 = 5;
    pub const LSTAT: u64 = 6;
    pub const POLL: u64 = 7;
    pub const LSEEK: u64 = 8;
    pub const MMAP: u64 = 9;
    pub const MPROTECT: u64 = 10;
    pub const MUNMAP: u64 = 11;
    pub const BRK: u64 = 12;
    pub const RT_SIGACTION: u64 = 13;
    pub const RT_SIGPROCMASK: u64 = 14;
    pub const RT_SIGRETURN: u64 = 15;
    pub const MREMAP: u64 = 25;
    pub const MADVISE: u64 = 28;
    pub const NANOSLEEP: u64 = 35;
    pub const ALARM: u64 = 37;
    pub const GETPID: u64 = 39;
    pub const SENDFILE: u64 = 40;
    pub const SOCKET: u64 = 41;
    pub const CONNECT: u64 = 42;
    pub const ACCEPT: u64 = 43;
    pub const SENDTO: u64 = 44;
    pub const RECVFROM: u64 = 45;
    pub const SENDMSG: u64 = 46;
    pub const RECVMSG: u64 = 47;
    pub const SHUTDOWN: u64 = 48;
    pub const BIND: u64 = 49;
    pub const LISTEN: u64 = 50;
    pub const GETSOCKNAME: u64 = 51;
    pub const GETPEERNAME: u64 = 52;
    pub const SOCKETPAIR: u64 = 53;
    pub const SETSOCKOPT: u64 = 54;
    pub const GETSOCKOPT: u64 = 55;
    pub const CLONE: u64 = 56;
    pub const FORK: u64 = 57;
    pub const VFORK: u64 = 58;
    pub const EXECVE: u64 = 59;
    pub const EXIT: u64 = 60;
    pub const KILL: u64 = 62;
    pub const FCNTL: u64 = 72;
    pub const FTRUNCATE: u64 = 77;
    pub const GETDENTS: u64 = 78;
    pub const GETCWD: u64 = 79;
    pub const CHDIR: u64 = 80;
    pub const RENAME: u64 = 82;
    pub const MKDIR: u64 = 83;
    pub const RMDIR: u64 = 84;
    pub const UNLINK: u64 = 87;
    pub const READLINK: u64 = 89;
    pub const CHMOD: u64 = 90;
    pub const FCHMOD: u64 = 91;
    pub const FCHOWN: u64 = 93;
    pub const UMASK: u64 = 95;
    pub const GETTIMEOFDAY: u64 = 96;
    pub const UTIME: u64 = 132;
    pub const TIME: u64 = 201;
    pub const GETDENTS64: u64 = 217;
    pub const RESTART_SYSCALL: u64 = 219;
    pub const CLOCK_GETTIME: u64 = 228;
    pub const CLOCK_NANOSLEEP: u64 = 230;
    pub const EXIT_GROUP: u64 = 231;
    pub const UTIMES: u64 = 235;
    pub const OPENAT: u64 = 257;
    pub const MKDIRAT: u64 = 258;
    pub const NEWFSTATAT: u64 = 262;
    pub const UNLINKAT: u64 = 263;
    pub const RENAMEAT: u64 = 264;
    pub const READLINKAT: u64 = 267;
    pub const UTIMENSAT: u64 = 280;
    pub const ACCEPT4: u64 = 288;
    pub const RECVMMSG: u64 = 299;
    pub const SENDMMSG: u64 = 307;
    pub const RENAMEAT2: u64 = 316;
    pub const GETRANDOM: u64 = 318;
    pub const STATX: u64 = 332;
    pub const CLONE3: u64 = 435;
}

/// Socket operations, numbered like the `SYS_*` selectors of
/// `linux/net.h` that multiplex them through `socketcall(2)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SocketOp {
    Socket = 1,
    Bind = 2,
    Connect = 3,
    Listen = 4,
    Accept = 5,
    GetSockName = 6,
    GetPeerName = 7,
    SocketPair = 8,
    Send = 9,
    Recv = 10,
    SendTo = 11,
    RecvFrom = 12,
    Shutdown = 13,
    SetSockOpt = 14,
    GetSockOpt = 15,
    SendMsg = 16,
    RecvMsg = 17,
    Accept4 = 18,
}

impl SocketOp {
    /// Size of the socket operation table.
    pub const TABLE_SIZE: usize = 19;

    /// Selector of the socket operation behind a direct socket syscall.
    pub fn from_syscall(nr: u64) -> Option<Self> {
        Some(match nr {
            nr::SOCKET => Self::Socket,
            nr::BIND => Self::Bind,
            nr::CONNECT => Self::Connect,
            nr::LISTEN => Self::Listen,
            nr::ACCEPT => Self::Accept,
            nr::GETSOCKNAME => Self::GetSockName,
            nr::GETPEERNAME => Self::GetPeerName,
            nr::SOCKETPAIR => Self::SocketPair,
            nr::SENDTO => Self::SendTo,
            nr::RECVFROM => Self::RecvFrom,
            nr::SHUTDOWN => Self::Shutdown,
            nr::SETSOCKOPT => Self::SetSockOpt,
            nr::GETSOCKOPT => Self::GetSockOpt,
            nr::SENDMSG => Self::SendMsg,
            nr::RECVMSG => Self::RecvMsg,
            nr::ACCEPT4 => Self::Accept4,
            _ => return None,
        })
    }

    pub fn selector(self) -> u64 {
        self as u64
    }
}
