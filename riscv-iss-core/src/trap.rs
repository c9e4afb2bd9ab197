//! Trap and interrupt engine: exception/interrupt numbering, priority, and delegation-aware trap
//! entry target computation.
//!
//! Exception and interrupt code numbering is grounded directly on
//! `original_source/vp/src/core/common/trap.h`'s `ExceptionCode` enum. Delegation and priority
//! ordering follow the RISC-V privileged spec as the source encodes it in its `prepare_trap`/`run`
//! trap-dispatch logic.

use crate::PrivilegeLevel;

/// Asynchronous interrupt causes, numbered as the low bits of `mcause`/`scause` (the high "is an
/// interrupt" bit is added by [`Trap::cause`]).
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum InterruptCode {
    UserSoftware = 0,
    SupervisorSoftware = 1,
    MachineSoftware = 3,
    UserTimer = 4,
    SupervisorTimer = 5,
    MachineTimer = 7,
    UserExternal = 8,
    SupervisorExternal = 9,
    MachineExternal = 11,
}

impl InterruptCode {
    /// Priority order for simultaneously-pending interrupts, highest first, per the privileged
    /// spec (and as ordered in the source's pending-interrupt scan).
    pub const PRIORITY: [InterruptCode; 9] = [
        InterruptCode::MachineExternal,
        InterruptCode::MachineSoftware,
        InterruptCode::MachineTimer,
        InterruptCode::SupervisorExternal,
        InterruptCode::SupervisorSoftware,
        InterruptCode::SupervisorTimer,
        InterruptCode::UserExternal,
        InterruptCode::UserSoftware,
        InterruptCode::UserTimer,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }

    /// The privilege level an interrupt of this kind is naturally handled at (before delegation).
    pub fn natural_privilege(self) -> PrivilegeLevel {
        match self {
            InterruptCode::MachineSoftware
            | InterruptCode::MachineTimer
            | InterruptCode::MachineExternal => PrivilegeLevel::Machine,
            InterruptCode::SupervisorSoftware
            | InterruptCode::SupervisorTimer
            | InterruptCode::SupervisorExternal => PrivilegeLevel::Supervisor,
            InterruptCode::UserSoftware | InterruptCode::UserTimer | InterruptCode::UserExternal => {
                PrivilegeLevel::User
            }
        }
    }
}

/// Synchronous exception causes, numbered per `original_source/vp/src/core/common/trap.h`.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
#[repr(u8)]
pub enum Exception {
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAddressMisaligned = 6,
    StoreAccessFault = 7,
    UserEcall = 8,
    SupervisorEcall = 9,
    MachineEcall = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
}

impl Exception {
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn ecall_from(privilege: PrivilegeLevel) -> Self {
        match privilege {
            PrivilegeLevel::User => Exception::UserEcall,
            PrivilegeLevel::Supervisor => Exception::SupervisorEcall,
            PrivilegeLevel::Machine => Exception::MachineEcall,
        }
    }

    /// Whether this exception carries a faulting address in `mtval`/`stval` (access/page faults
    /// and misaligned accesses all do; `Breakpoint` and illegal-instruction carry other payloads).
    pub fn carries_address(self) -> bool {
        matches!(
            self,
            Exception::InstructionAddressMisaligned
                | Exception::InstructionAccessFault
                | Exception::LoadAddressMisaligned
                | Exception::LoadAccessFault
                | Exception::StoreAddressMisaligned
                | Exception::StoreAccessFault
                | Exception::InstructionPageFault
                | Exception::LoadPageFault
                | Exception::StorePageFault
        )
    }
}

/// A trap: either a synchronous exception or an asynchronous interrupt, plus the value to load
/// into `mtval`/`stval` on entry.
#[derive(Debug, Copy, Clone)]
pub struct Trap {
    pub cause: TrapCause,
    pub tval: u64,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrapCause {
    Exception(Exception),
    Interrupt(InterruptCode),
}

impl Trap {
    pub fn exception(exception: Exception, tval: u64) -> Self {
        Self {
            cause: TrapCause::Exception(exception),
            tval,
        }
    }

    pub fn interrupt(code: InterruptCode) -> Self {
        Self {
            cause: TrapCause::Interrupt(code),
            tval: 0,
        }
    }

    /// Encodes the value to be written to `xcause`: the interrupt bit in the MSB of an XLEN-wide
    /// word, with the exception/interrupt code in the low bits.
    pub fn cause_value(&self, xlen_bits: u32) -> u64 {
        let interrupt_bit = 1u64 << (xlen_bits - 1);
        match self.cause {
            TrapCause::Exception(e) => e.code() as u64,
            TrapCause::Interrupt(i) => interrupt_bit | i.code() as u64,
        }
    }
}

/// Scans `mip & mie` (already ANDed by the caller) for the highest-priority pending-and-enabled
/// interrupt, per [`InterruptCode::PRIORITY`].
///
/// `pending_enabled` has bit `n` set iff interrupt code `n` is both pending and locally enabled.
pub fn highest_priority_pending(pending_enabled: u64) -> Option<InterruptCode> {
    InterruptCode::PRIORITY
        .into_iter()
        .find(|code| pending_enabled & (1 << code.code()) != 0)
}

/// Computes the privilege level a trap should be handled at, given the current privilege level and
/// the `medeleg`/`mideleg` (or `sedeleg`/`sideleg`, folded in by the caller) delegation masks.
///
/// A trap is only ever delegated to a *less* privileged level than the one it would otherwise be
/// taken at (Machine); delegation to a level at or below the current privilege level has no effect
/// on machine-mode-vs-not routing (the privileged spec's delegation rule).
pub fn target_privilege(trap: &Trap, current: PrivilegeLevel, deleg_mask: u64) -> PrivilegeLevel {
    let code = match trap.cause {
        TrapCause::Exception(e) => e.code(),
        TrapCause::Interrupt(i) => i.code(),
    };
    let delegated_to_s = deleg_mask & (1 << code) != 0;
    if delegated_to_s && current <= PrivilegeLevel::Supervisor {
        PrivilegeLevel::Supervisor
    } else {
        PrivilegeLevel::Machine
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn machine_external_outranks_machine_timer() {
        let pending = (1 << InterruptCode::MachineTimer.code()) | (1 << InterruptCode::MachineExternal.code());
        assert_eq!(
            highest_priority_pending(pending),
            Some(InterruptCode::MachineExternal)
        );
    }

    #[test]
    fn no_pending_interrupts_is_none() {
        assert_eq!(highest_priority_pending(0), None);
    }

    #[test]
    fn delegated_exception_routes_to_supervisor() {
        let trap = Trap::exception(Exception::LoadPageFault, 0x1000);
        let mask = 1 << Exception::LoadPageFault.code();
        assert_eq!(
            target_privilege(&trap, PrivilegeLevel::User, mask),
            PrivilegeLevel::Supervisor
        );
    }

    #[test]
    fn delegation_ignored_when_already_above_target() {
        let trap = Trap::exception(Exception::LoadPageFault, 0x1000);
        let mask = 1 << Exception::LoadPageFault.code();
        assert_eq!(
            target_privilege(&trap, PrivilegeLevel::Machine, mask),
            PrivilegeLevel::Machine
        );
    }

    #[test]
    fn cause_value_sets_interrupt_bit() {
        let trap = Trap::interrupt(InterruptCode::MachineTimer);
        assert_eq!(trap.cause_value(64), (1u64 << 63) | 7);
    }
}
