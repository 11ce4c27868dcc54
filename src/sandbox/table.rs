//! The allow-list of syscalls and socket operations.

use super::{regs::SocketOp, Sandbox, Violation};
use crate::error::Error;
use std::fmt;

/// Argument check run at syscall entry.
///
/// A validator returns `Err(Error::Rejected(..))` to deny the call.
pub type Validator = Box<dyn Fn(&Sandbox) -> Result<(), Error>>;

/// A granted syscall or socket operation.
pub struct Rule {
    pub validator: Option<Validator>,
}

impl fmt::Debug for Rule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rule")
            .field("validator", &self.validator.is_some())
            .finish()
    }
}

/// Bounded rule tables; an empty slot is a denied call.
#[derive(Debug)]
pub struct Table {
    syscalls: Vec<Option<Rule>>,
    socket_ops: Vec<Option<Rule>>,
}

impl Default for Table {
    fn default() -> Self {
        Self {
            syscalls: (0..Self::SIZE).map(|_| None).collect(),
            socket_ops: (0..SocketOp::TABLE_SIZE).map(|_| None).collect(),
        }
    }
}

impl Table {
    /// Number of syscall slots.
    pub const SIZE: usize = 512;

    fn syscall_slot(&mut self, nr: u64) -> &mut Option<Rule> {
        // The numbers are compile-time constants of the vocabulary.
        let nr = nr as usize;
        assert!(nr < Self::SIZE, "syscall number out of table bounds");
        &mut self.syscalls[nr]
    }

    /// Grant a syscall.  A later grant replaces the earlier validator.
    pub fn allow(&mut self, nr: u64, validator: Option<Validator>) {
        *self.syscall_slot(nr) = Some(Rule { validator });
    }

    /// Grant a socket operation.
    pub fn allow_socket_op(&mut self, op: SocketOp, validator: Option<Validator>) {
        self.socket_ops[op as usize] = Some(Rule { validator });
    }

    pub fn is_allowed(&self, nr: u64) -> bool {
        match SocketOp::from_syscall(nr) {
            Some(op) => self.socket_op(op.selector()).is_ok(),
            None => self.syscall(nr).is_ok(),
        }
    }

    /// Look up the rule for a syscall number.
    pub fn syscall(&self, nr: u64) -> Result<&Rule, Violation> {
        match self.syscalls.get(nr as usize) {
            None => Err(Violation::UnknownSyscall(nr)),
            Some(None) => Err(Violation::Disallowed(nr)),
            Some(Some(rule)) => Ok(rule),
        }
    }

    /// Look up the rule for a socket operation selector.
    pub fn socket_op(&self, selector: u64) -> Result<&Rule, Violation> {
        match self.socket_ops.get(selector as usize) {
            None | Some(None) if selector == 0 || selector >= SocketOp::TABLE_SIZE as u64 => {
                Err(Violation::BadSocketOp(selector))
            }
            None | Some(None) => Err(Violation::DisallowedSocketOp(selector)),
            Some(Some(rule)) => Ok(rule),
        }
    }

    /// Syscall numbers that have a rule.
    pub fn allowed_syscalls(&self) -> impl Iterator<Item = u64> + '_ {
        self.syscalls
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.is_some())
            .map(|(nr, _)| nr as u64)
    }

    /// Socket operation selectors that have a rule.
    pub fn allowed_socket_ops(&self) -> impl Iterator<Item = u64> + '_ {
        self.socket_ops
            .iter()
            .enumerate()
            .filter(|(_, rule)| rule.is_some())
            .map(|(selector, _)| selector as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::regs::nr;

    #[test]
    fn test_empty_table_denies() {
        let table = Table::default();
        for nr in 0..Table::SIZE as u64 {
            assert!(!table.is_allowed(nr));
        }
        assert_eq!(table.allowed_syscalls().count(), 0);
    }

    #[test]
    fn test_lookup() {
        let mut table = Table::default();
        table.allow(nr::READ, None);
        table.allow_socket_op(SocketOp::Bind, None);

        assert!(table.syscall(nr::READ).is_ok());
        assert!(table.is_allowed(nr::BIND));
        assert!(!table.is_allowed(nr::CONNECT));
        assert_eq!(
            table.syscall(nr::WRITE).unwrap_err(),
            Violation::Disallowed(nr::WRITE)
        );
        assert_eq!(
            table.syscall(4096).unwrap_err(),
            Violation::UnknownSyscall(4096)
        );
        assert_eq!(
            table.socket_op(SocketOp::Listen.selector()).unwrap_err(),
            Violation::DisallowedSocketOp(4)
        );
        assert_eq!(table.socket_op(0).unwrap_err(), Violation::BadSocketOp(0));
        assert_eq!(table.socket_op(99).unwrap_err(), Violation::BadSocketOp(99));
    }
}
