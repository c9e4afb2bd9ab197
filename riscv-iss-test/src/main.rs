//! Conformance-test runner: loads a compiled riscv-tests/riscv-arch-test ELF, runs it to
//! completion, and dumps the `begin_signature`..`end_signature` memory region to a file in the
//! format `riscof` compares against a golden reference.
//!
//! Grounded on a signature-dumping `main.rs`: same `--signature`/ELF argument shape, same
//! `begin_signature`/`end_signature` symbol lookup and 16/4-byte alignment assertions, same
//! one-word-per-line hex output. Adapted to this crate's `Hart`/memory-trait boundary instead of
//! a `Board`/`Simulator`/`SimulationAllocator` stack, and to this instruction set's termination
//! convention: a write to the conventional `tohost` address rather than board-level power-down.

use std::fs::File;
use std::io::{Read, Write};

use clap::Parser;
use goblin::elf::program_header::PT_LOAD;

use riscv_iss_core::hart::{Hart, HartStatus};
use riscv_iss_core::interfaces::{DataMemory, InstructionMemory, SyscallEmulator};
use riscv_iss_core::trap::Exception;
use riscv_iss_core::{Config, ExtensionSet, Xlen};

#[derive(Parser, Debug)]
#[command(version, about = "Runs a riscv-tests/riscv-arch-test ELF and dumps its signature.")]
struct Args {
    /// Signature file to write the `begin_signature..end_signature` region to.
    #[arg(long, short)]
    signature: Option<String>,

    /// Maximum number of instructions to retire before declaring the test hung.
    #[arg(long, default_value_t = 10_000_000)]
    max_steps: u64,

    /// Elf file to run.
    elf: String,
}

/// Conventional `tohost` physical address riscv-tests/riscv-arch-test programs write to on exit;
/// any nonzero write there ends the test, per the shared `riscv_test.h` convention.
const TOHOST_ADDR: u64 = 0x8000_1000;

fn main() -> std::io::Result<()> {
    let args = Args::parse();

    let mut buf = Vec::new();
    File::open(&args.elf)?.read_to_end(&mut buf)?;
    let elf = goblin::elf::Elf::parse(&buf).expect("failed to parse elf file");

    let mut mem = SignatureMemory::new(64 * 1024 * 1024);
    for header in elf.program_headers.iter().filter(|h| h.p_type == PT_LOAD) {
        mem.load_physical(header.p_paddr, &buf[header.file_range()]);
    }

    let config = Config {
        xlen: Xlen::Rv64,
        reset_vector: elf.entry,
        extensions: ExtensionSet::RV_GC,
        wfi_blocks: false,
        ..Config::default()
    };
    let mut hart = Hart::new(config);
    let mut syscalls = NoEcallHandling;

    let mut steps = 0u64;
    while !mem.halted {
        match hart.step(&mut mem, &(), &mut syscalls, &mut ()) {
            HartStatus::Runnable => {}
            HartStatus::HitBreakpoint => break,
            HartStatus::Terminated => break,
        }
        steps += 1;
        if steps >= args.max_steps {
            panic!("test did not halt within {} instructions", args.max_steps);
        }
    }

    if let Some(path) = args.signature {
        dump_signature(&elf, &mem, &path)?;
    }

    Ok(())
}

fn dump_signature(elf: &goblin::elf::Elf, mem: &SignatureMemory, path: &str) -> std::io::Result<()> {
    let mut signature_start = None;
    let mut signature_end = None;
    for sym in elf.syms.iter() {
        let Some(name) = elf.strtab.get_at(sym.st_name) else {
            continue;
        };
        if name == "begin_signature" {
            signature_start = Some(sym.st_value);
        } else if name == "end_signature" {
            signature_end = Some(sym.st_value);
        }
    }
    let signature_start = signature_start.expect("missing symbol `begin_signature`");
    let signature_end = signature_end.expect("missing symbol `end_signature`");

    assert!(signature_start % 16 == 0);
    assert!(signature_end % 4 == 0);
    assert!(signature_start <= signature_end);

    let mut file = File::create(path)?;
    for address in (signature_start..signature_end).step_by(4) {
        let word = mem.read_physical_word(address);
        writeln!(file, "{word:08x}")?;
    }
    Ok(())
}

/// Flat physical memory that also watches the conventional `tohost` address for a nonzero write
/// to signal test completion, since this crate has no board-level power-down concept.
struct SignatureMemory {
    bytes: Vec<u8>,
    halted: bool,
}

impl SignatureMemory {
    fn new(size: usize) -> Self {
        Self { bytes: vec![0u8; size], halted: false }
    }

    fn load_physical(&mut self, addr: u64, data: &[u8]) {
        let start = addr as usize;
        let end = start + data.len();
        if end > self.bytes.len() {
            self.bytes.resize(end, 0);
        }
        self.bytes[start..end].copy_from_slice(data);
    }

    fn read_physical_word(&self, addr: u64) -> u32 {
        let start = addr as usize;
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&self.bytes[start..start + 4]);
        u32::from_le_bytes(buf)
    }
}

impl InstructionMemory for SignatureMemory {
    fn fetch(&mut self, addr: u64, len: u32) -> Result<u64, Exception> {
        self.load(addr, len).map_err(|_| Exception::InstructionAccessFault)
    }
}

impl DataMemory for SignatureMemory {
    fn load(&mut self, addr: u64, len: u32) -> Result<u64, Exception> {
        let start = addr as usize;
        let end = start + len as usize;
        if end > self.bytes.len() {
            return Err(Exception::LoadAccessFault);
        }
        let mut buf = [0u8; 8];
        buf[..len as usize].copy_from_slice(&self.bytes[start..end]);
        Ok(u64::from_le_bytes(buf))
    }

    fn store(&mut self, addr: u64, len: u32, value: u64) -> Result<(), Exception> {
        let start = addr as usize;
        let end = start + len as usize;
        if end > self.bytes.len() {
            return Err(Exception::StoreAccessFault);
        }
        self.bytes[start..end].copy_from_slice(&value.to_le_bytes()[..len as usize]);
        if addr == TOHOST_ADDR && value != 0 {
            self.halted = true;
        }
        Ok(())
    }
}

struct NoEcallHandling;
impl SyscallEmulator for NoEcallHandling {
    fn handle_ecall(&mut self, _hart_id: u64) -> bool {
        false
    }
}
