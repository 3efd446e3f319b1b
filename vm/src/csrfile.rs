//! The per-hart CSR file
//!
//! A sparse map from 12 bit CSR address to 64 bit value, plus the view
//! registers that alias other storage: `sstatus` masks `mstatus`, `sip`/`sie`
//! filter `mip`/`mie` through `mideleg`, `fflags`/`frm` slice `fcsr`, and the
//! user counters shadow their machine twins. `mip` itself lives in an atomic
//! shared with the hart's signal block so other threads can post interrupts.
//!
//! [`CsrFile::read`]/[`CsrFile::write`] enforce the access rules (privilege
//! from address bits 9:8, read-only from bits 11:10) and the per-register
//! write masks; the `get`/`set` pair is the unchecked path used by the trap
//! machinery itself.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use riscv::csr::{self, InterruptBits, SatpData};
use riscv::PrivilegeLevel;

use crate::mem::MachineTimer;
use crate::Fault;

/// `marchid` spells "VMAC", `mimpid` spells "HINE".
const MARCHID_VALUE: u64 =
    ((b'V' as u64) << 24) | ((b'M' as u64) << 16) | ((b'A' as u64) << 8) | b'C' as u64;
const MIMPID_VALUE: u64 =
    ((b'H' as u64) << 24) | ((b'I' as u64) << 16) | ((b'N' as u64) << 8) | b'E' as u64;

/// Interrupt bits that exist on this machine.
const VALID_INTERRUPTS: u64 = InterruptBits::all().bits();

#[derive(Debug)]
pub struct CsrFile {
    csrs: HashMap<u16, u64>,
    mip: Arc<AtomicU64>,
    timer: Arc<MachineTimer>,
    hart_id: u32,
}

impl CsrFile {
    pub fn new(hart_id: u32, mip: Arc<AtomicU64>, timer: Arc<MachineTimer>) -> Self {
        let mut file = CsrFile {
            csrs: HashMap::new(),
            mip,
            timer,
            hart_id,
        };
        file.reset();
        file
    }

    /// Bring every backed CSR to its reset value.
    pub fn reset(&mut self) {
        self.csrs.clear();
        for csr in backed_csrs() {
            self.csrs.insert(csr, 0);
        }

        self.csrs.insert(csr::MVENDORID, 0);
        self.csrs.insert(csr::MARCHID, MARCHID_VALUE);
        self.csrs.insert(csr::MIMPID, MIMPID_VALUE);
        self.csrs.insert(csr::MHARTID, self.hart_id as u64);
        self.csrs.insert(csr::MCONFIGPTR, 0);
        self.csrs.insert(csr::MISA, csr::MISA_VALUE);

        self.mip.store(0, Ordering::Release);
    }

    /// Whether the machine implements the CSR at all.
    pub fn is_defined(&self, addr: u16) -> bool {
        match addr {
            csr::FFLAGS | csr::FRM => true,
            csr::SSTATUS | csr::SIE | csr::SIP | csr::MIP => true,
            csr::CYCLE | csr::TIME | csr::INSTRET => true,
            a if (csr::HPMCOUNTER3..csr::CYCLE + csr::PERF_COUNTER_MAX).contains(&a) => true,
            a => self.csrs.contains_key(&a),
        }
    }

    /// A guest-initiated read.
    pub fn read(&self, addr: u16, privilege: PrivilegeLevel, word: u32) -> Result<u64, Fault> {
        if privilege < csr::required_privilege(addr) || !self.is_defined(addr) {
            return Err(Fault::illegal_instruction(word));
        }
        Ok(self.get(addr))
    }

    /// A guest-initiated write.
    pub fn write(
        &mut self,
        addr: u16,
        value: u64,
        privilege: PrivilegeLevel,
        word: u32,
    ) -> Result<(), Fault> {
        if privilege < csr::required_privilege(addr)
            || csr::is_read_only(addr)
            || !self.is_defined(addr)
        {
            return Err(Fault::illegal_instruction(word));
        }
        self.set(addr, value);
        Ok(())
    }

    /// Unchecked read used internally; resolves the view registers.
    pub(crate) fn get(&self, addr: u16) -> u64 {
        match addr {
            csr::FFLAGS => self.raw(csr::FCSR) & csr::FFLAG_MASK,
            csr::FRM => (self.raw(csr::FCSR) >> 5) & 0b111,
            csr::SSTATUS => self.raw(csr::MSTATUS) & csr::SSTATUS_VISIBLE,
            csr::MIP => self.mip.load(Ordering::Acquire),
            csr::SIP => self.mip.load(Ordering::Acquire) & self.raw(csr::MIDELEG),
            csr::SIE => self.raw(csr::MIE) & self.raw(csr::MIDELEG),
            csr::CYCLE => self.raw(csr::MCYCLE),
            csr::TIME => self.timer.time(),
            csr::INSTRET => self.raw(csr::MINSTRET),
            a if (csr::HPMCOUNTER3..csr::CYCLE + csr::PERF_COUNTER_MAX).contains(&a) => {
                self.raw(csr::MCYCLE + (a - csr::CYCLE))
            }
            a => self.raw(a),
        }
    }

    /// Unchecked write used internally; applies the per-register masks and
    /// resolves the view registers.
    pub(crate) fn set(&mut self, addr: u16, value: u64) {
        match addr {
            csr::FFLAGS => {
                let fcsr = (self.raw(csr::FCSR) & !csr::FFLAG_MASK) | (value & csr::FFLAG_MASK);
                self.csrs.insert(csr::FCSR, fcsr);
            }
            csr::FRM => {
                let fcsr = (self.raw(csr::FCSR) & !(0b111 << 5)) | ((value & 0b111) << 5);
                self.csrs.insert(csr::FCSR, fcsr);
            }
            csr::FCSR => {
                self.csrs.insert(csr::FCSR, value & 0xff);
            }
            csr::MSTATUS => {
                let merged = (self.raw(csr::MSTATUS) & !csr::MSTATUS_WRITABLE)
                    | (value & csr::MSTATUS_WRITABLE);
                // SD is read-only and summarizes FS
                let merged = csr::with_fs(merged, csr::fs(merged));
                self.csrs.insert(csr::MSTATUS, merged);
            }
            csr::SSTATUS => {
                let merged = (self.raw(csr::MSTATUS) & !csr::SSTATUS_WRITABLE)
                    | (value & csr::SSTATUS_WRITABLE);
                let merged = csr::with_fs(merged, csr::fs(merged));
                self.csrs.insert(csr::MSTATUS, merged);
            }
            csr::MIP => {
                // only the supervisor pending bits are software writable
                let mask = InterruptBits::SUPERVISOR.bits();
                let old = self.mip.load(Ordering::Acquire);
                self.mip
                    .store((old & !mask) | (value & mask), Ordering::Release);
            }
            csr::SIP => {
                let mask = InterruptBits::SupervisorSoftware.bits() & self.raw(csr::MIDELEG);
                let old = self.mip.load(Ordering::Acquire);
                self.mip
                    .store((old & !mask) | (value & mask), Ordering::Release);
            }
            csr::MIE => {
                self.csrs.insert(csr::MIE, value & VALID_INTERRUPTS);
            }
            csr::SIE => {
                let mask = self.raw(csr::MIDELEG);
                let merged = (self.raw(csr::MIE) & !mask) | (value & mask);
                self.csrs.insert(csr::MIE, merged & VALID_INTERRUPTS);
            }
            csr::MIDELEG => {
                // only supervisor interrupts can be delegated
                self.csrs
                    .insert(csr::MIDELEG, value & InterruptBits::SUPERVISOR.bits());
            }
            csr::MEPC | csr::SEPC => {
                self.csrs.insert(addr, value & !1);
            }
            a => {
                if self.csrs.contains_key(&a) {
                    self.csrs.insert(a, value);
                }
            }
        }
    }

    fn raw(&self, addr: u16) -> u64 {
        self.csrs.get(&addr).copied().unwrap_or(0)
    }

    pub fn hart_id(&self) -> u32 {
        self.hart_id
    }

    pub fn satp(&self) -> SatpData {
        SatpData::from(self.get(csr::SATP))
    }

    pub fn mstatus(&self) -> u64 {
        self.raw(csr::MSTATUS)
    }

    /// Bump the cycle and retired-instruction counters unless inhibited.
    pub fn retire_instruction(&mut self) {
        let inhibit = self.raw(csr::MCOUNTINHIBIT);
        if inhibit & 0b001 == 0 {
            let cycles = self.raw(csr::MCYCLE).wrapping_add(1);
            self.csrs.insert(csr::MCYCLE, cycles);
        }
        if inhibit & 0b100 == 0 {
            let retired = self.raw(csr::MINSTRET).wrapping_add(1);
            self.csrs.insert(csr::MINSTRET, retired);
        }
    }

    /// Every defined CSR with its current value, ordered by address.
    pub fn snapshot(&self) -> BTreeMap<u16, u64> {
        let mut map = BTreeMap::new();
        for addr in [csr::FFLAGS, csr::FRM, csr::CYCLE, csr::TIME, csr::INSTRET] {
            map.insert(addr, self.get(addr));
        }
        for addr in [csr::SSTATUS, csr::SIE, csr::SIP, csr::MIP] {
            map.insert(addr, self.get(addr));
        }
        for addr in self.csrs.keys() {
            map.insert(*addr, self.get(*addr));
        }
        map
    }
}

/// All CSR addresses with dedicated storage behind them.
fn backed_csrs() -> Vec<u16> {
    let mut list = vec![csr::FCSR];

    list.extend([
        csr::STVEC,
        csr::SCOUNTEREN,
        csr::SENVCFG,
        csr::SSCRATCH,
        csr::SEPC,
        csr::SCAUSE,
        csr::STVAL,
        csr::SATP,
        csr::MSTATUS,
        csr::MISA,
        csr::MEDELEG,
        csr::MIDELEG,
        csr::MIE,
        csr::MTVEC,
        csr::MCOUNTEREN,
        csr::MENVCFG,
        csr::MCOUNTINHIBIT,
        csr::MSCRATCH,
        csr::MEPC,
        csr::MCAUSE,
        csr::MTVAL,
        csr::MTINST,
        csr::MTVAL2,
        csr::MSECCFG,
        csr::MCYCLE,
        csr::MINSTRET,
    ]);

    for n in 3..csr::PERF_COUNTER_MAX {
        list.push(csr::MCYCLE + n);
    }
    for n in 3..csr::PERF_EVENT_MAX {
        list.push(csr::MCOUNTINHIBIT + n);
    }
    for n in 0..csr::PMPCFG_MAX {
        list.push(csr::PMPCFG0 + n);
    }
    for n in 0..csr::PMPADDR_MAX {
        list.push(csr::PMPADDR0 + n);
    }

    list
}
