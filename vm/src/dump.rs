//! Machine fault reports
//!
//! A [`VmException`] is not an architectural trap: it is raised when the
//! emulator itself can no longer continue (a broken host-side invariant, a
//! panic inside the interpreter) and carries enough state to write the
//! post-mortem dump file.

use std::collections::BTreeMap;
use std::fmt;

use riscv::csr::csr_name;
use riscv::instr::{self, FREGISTER_NAMES, REGISTER_NAMES};

use crate::fpu::FpReg;

#[derive(Debug, Clone)]
pub struct VmException {
    pub hart_id: u32,
    pub regs: [u64; 32],
    pub fregs: [FpReg; 32],
    pub csrs: BTreeMap<u16, u64>,
    pub virtual_pc: u64,
    /// The last successfully translated pc, when one exists.
    pub physical_pc: Option<u32>,
    /// The last fetched instruction word, when one exists.
    pub instruction: Option<u32>,
    pub message: String,
}

impl fmt::Display for VmException {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "hart {}: {}", self.hart_id, self.message)
    }
}

impl std::error::Error for VmException {}

impl VmException {
    /// Render the human-readable dump file contents.
    pub fn dump(&self) -> String {
        use fmt::Write;

        let mut out = String::new();
        let _ = writeln!(out, "=== rvemu fault dump ===");
        let _ = writeln!(out, "hart: {}", self.hart_id);
        let _ = writeln!(out, "reason: {}", self.message);
        let _ = writeln!(out);

        let _ = writeln!(out, "registers:");
        for (i, value) in self.regs.iter().enumerate() {
            let _ = writeln!(
                out,
                "  x{i:<2} {:<4} = {value:#018x} ({})",
                REGISTER_NAMES[i], *value as i64
            );
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "fp registers:");
        for (i, reg) in self.fregs.iter().enumerate() {
            let shown: f64 = if reg.is_double {
                f64::from_bits(reg.bits)
            } else {
                f32::from_bits(reg.bits as u32) as f64
            };
            let _ = writeln!(
                out,
                "  f{i:<2} {:<5} = {:#018x} ({shown})",
                FREGISTER_NAMES[i], reg.bits
            );
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "csrs:");
        for (addr, value) in &self.csrs {
            let name = csr_name(*addr).unwrap_or_else(|| format!("csr_{addr:#05x}"));
            let _ = writeln!(out, "  {name:<16} ({addr:#05x}) = {value:#018x}");
        }
        let _ = writeln!(out);

        let _ = writeln!(out, "virtual pc:  {:#018x}", self.virtual_pc);
        match self.physical_pc {
            Some(pa) => {
                let _ = writeln!(out, "physical pc: {pa:#010x}");
            }
            None => {
                let _ = writeln!(out, "physical pc: <not translated>");
            }
        }
        match self.instruction {
            Some(word) => {
                let _ = writeln!(
                    out,
                    "instruction: {word:#010x}  {}",
                    instr::decode(word)
                );
            }
            None => {
                let _ = writeln!(out, "instruction: <not fetched>");
            }
        }

        out
    }
}
