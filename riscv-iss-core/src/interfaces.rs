//! External interface traits a host embeds the core behind.
//!
//! These are deliberately Rust trait boundaries rather than a wire protocol: a `Hart` is generic
//! over its memory and interrupt controller so the same interpreter serves an in-process test
//! double, a full system bus, or a remote TCP-backed memory model.

use crate::trap::Exception;

/// Instruction fetch port.
///
/// Kept distinct from [`DataMemory`] because a host may back instruction and data space with
/// different devices (e.g. a boot ROM overlay visible only to fetch), matching the source's split
/// between instruction and data bus masters.
pub trait InstructionMemory {
    /// Fetches `len` bytes (2 or 4) at physical address `addr`, little-endian.
    ///
    /// Returns `Err` with an `InstructionAccessFault` or `InstructionPageFault` on failure; the
    /// caller is responsible for turning that into a trap.
    fn fetch(&mut self, addr: u64, len: u32) -> Result<u64, Exception>;
}

/// Data load/store port.
pub trait DataMemory {
    fn load(&mut self, addr: u64, len: u32) -> Result<u64, Exception>;
    fn store(&mut self, addr: u64, len: u32, value: u64) -> Result<(), Exception>;

    /// Returns a host pointer usable for direct memory access to the page containing `addr`, if
    /// this backend supports it, used by the Load/Store Cache's opportunistic DMI installation
    /// (grounded on `lscache.h`'s `get_last_dmi_page_host_addr`).
    ///
    /// The default implementation disables DMI by always returning `None`.
    fn dmi_page(&mut self, _addr: u64) -> Option<*mut u8> {
        None
    }

    /// Invalidates any cached address-translation state held by the backend, in response to
    /// `sfence.vma`.
    fn flush_tlb(&mut self, _addr: Option<u64>, _asid: Option<u32>) {}
}

/// Exposes pending local interrupt lines: software, timer, and external interrupts per privilege
/// level, mirrored into `mip` every step.
pub trait InterruptController {
    fn machine_software_pending(&self) -> bool {
        false
    }
    fn machine_timer_pending(&self) -> bool {
        false
    }
    fn machine_external_pending(&self) -> bool {
        false
    }
    fn supervisor_software_pending(&self) -> bool {
        false
    }
    fn supervisor_external_pending(&self) -> bool {
        false
    }
}

/// Blanket implementation so hosts that do not model interrupts at all can use `()`.
impl InterruptController for () {}

/// Environment call / syscall emulation hook for user-mode-only (no-OS) execution, used by the
/// test harness and CLI to short-circuit `ECALL` without a real supervisor.
pub trait SyscallEmulator {
    /// Called when `ECALL` is executed from user mode while this hook is installed. Returning
    /// `true` means the call was handled (the hart should simply advance past it); `false` means
    /// fall through to the normal trap.
    fn handle_ecall(&mut self, hart_id: u64) -> bool;
}

/// Minimal debug hook surface: breakpoint checks and single-step notification, independent of any
/// particular wire protocol (a GDB remote protocol is explicitly out of scope here).
pub trait DebugTarget {
    fn is_breakpoint(&self, pc: u64) -> bool {
        let _ = pc;
        false
    }

    fn on_retire(&mut self, hart_id: u64, pc: u64) {
        let _ = (hart_id, pc);
    }
}

impl DebugTarget for () {}
