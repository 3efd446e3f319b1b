//! A single hardware thread
//!
//! [`Hart`] owns the architectural state: integer and floating point
//! registers, the CSR file, privilege level, pc and the TLB. Cross-thread
//! control (pause, stop, posted interrupts, restart requests) arrives
//! through the shared [`HartSignals`] block and is only acted upon at
//! instruction boundaries.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use riscv::csr::{self, MStatusFlags};
use riscv::instr;
use riscv::trap::{Interrupt, TrapEvent};
use riscv::PrivilegeLevel;

use crate::csrfile::CsrFile;
use crate::dump::VmException;
use crate::ecall::EcallTable;
use crate::fpu::FpRegisters;
use crate::mem::{MachineTimer, Memory, MemoryError};
use crate::translate::{AccessType, Translator};
use crate::Fault;

/// The shared control block of one hart.
///
/// Everything here may be touched from any thread; the owning hart samples
/// it between instructions.
#[derive(Debug)]
pub struct HartSignals {
    running: AtomicBool,
    paused: AtomicBool,
    mip: Arc<AtomicU64>,
    /// Retired instruction count, for the instructions-per-second display.
    ticks: AtomicU64,
    restart: Mutex<Option<(u64, u32)>>,
    wake_lock: Mutex<()>,
    wake: Condvar,
}

impl HartSignals {
    pub fn new() -> Self {
        HartSignals {
            running: AtomicBool::new(false),
            paused: AtomicBool::new(false),
            mip: Arc::new(AtomicU64::new(0)),
            ticks: AtomicU64::new(0),
            restart: Mutex::new(None),
            wake_lock: Mutex::new(()),
            wake: Condvar::new(),
        }
    }

    pub fn mip(&self) -> Arc<AtomicU64> {
        self.mip.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn start(&self) {
        self.running.store(true, Ordering::Release);
        self.notify();
    }

    pub fn stop(&self) {
        self.running.store(false, Ordering::Release);
        self.notify();
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::Release);
        self.notify();
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub(crate) fn retire(&self) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
    }

    /// Post an interrupt; the owning hart samples it before its next
    /// instruction, and a hart parked in WFI wakes up.
    pub fn raise_interrupt(&self, interrupt: Interrupt) {
        self.mip.fetch_or(1 << interrupt.code(), Ordering::AcqRel);
        self.notify();
    }

    /// Queue a restart; applied by the hart at its next step boundary.
    pub fn request_restart(&self, pc: u64, source_hart: u32) {
        *lock_ignore_poison(&self.restart) = Some((pc, source_hart));
        self.notify();
    }

    pub(crate) fn take_restart(&self) -> Option<(u64, u32)> {
        lock_ignore_poison(&self.restart).take()
    }

    /// Whether a restart is queued; a paused hart still has to service it.
    pub(crate) fn has_restart(&self) -> bool {
        lock_ignore_poison(&self.restart).is_some()
    }

    pub(crate) fn notify(&self) {
        let _guard = lock_ignore_poison(&self.wake_lock);
        self.wake.notify_all();
    }

    /// Park the calling thread until something pokes the hart. The timeout
    /// bounds the window in which a notification can be missed.
    pub(crate) fn wait_for_wake(&self, timeout: Duration) {
        let guard = lock_ignore_poison(&self.wake_lock);
        let _guard = self
            .wake
            .wait_timeout(guard, timeout)
            .map(|(g, _)| g)
            .unwrap_or_else(|poisoned| poisoned.into_inner().0);
    }
}

impl Default for HartSignals {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_ignore_poison<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Why a run slice returned.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum SliceOutcome {
    /// The slice ran to its instruction budget.
    Ran,
    /// The hart is parked in WFI with nothing pending.
    Waiting,
    /// A pause request (or breakpoint) took effect.
    Paused,
    /// The hart was stopped.
    Stopped,
}

/// One snapshot of the register-visible state, for debuggers and the GUI.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub regs: [u64; 32],
    pub fregs: [crate::fpu::FpReg; 32],
    pub pc: u64,
    pub privilege: PrivilegeLevel,
}

pub struct Hart {
    pub(crate) regs: [u64; 32],
    pub(crate) fregs: FpRegisters,
    pub(crate) csrs: CsrFile,
    pub(crate) privilege: PrivilegeLevel,
    pub(crate) pc: u64,
    pub(crate) translator: Translator,
    pub(crate) memory: Arc<Memory>,
    pub(crate) ecalls: Arc<EcallTable>,
    pub(crate) signals: Arc<HartSignals>,
    timer: Arc<MachineTimer>,
    breakpoints: HashSet<u64>,
    pub(crate) pause_on_break: bool,
    pause_on_restart: bool,
    pub(crate) waiting_for_interrupt: bool,
    /// Fetch context of the last attempted instruction, kept for fault dumps.
    last_physical_pc: Option<u32>,
    last_instruction: Option<u32>,
}

impl Hart {
    pub fn new(
        memory: Arc<Memory>,
        ecalls: Arc<EcallTable>,
        timer: Arc<MachineTimer>,
        signals: Arc<HartSignals>,
        hart_id: u32,
        starting_pc: u64,
    ) -> Self {
        Hart {
            regs: [0; 32],
            fregs: FpRegisters::new(),
            csrs: CsrFile::new(hart_id, signals.mip(), timer.clone()),
            privilege: PrivilegeLevel::Machine,
            pc: starting_pc,
            translator: Translator::new(),
            memory,
            ecalls,
            signals,
            timer,
            breakpoints: HashSet::new(),
            pause_on_break: false,
            pause_on_restart: false,
            waiting_for_interrupt: false,
            last_physical_pc: None,
            last_instruction: None,
        }
    }

    pub fn hart_id(&self) -> u32 {
        self.csrs.hart_id()
    }

    pub fn pc(&self) -> u64 {
        self.pc
    }

    pub fn set_pc(&mut self, pc: u64) {
        self.pc = pc;
    }

    pub fn privilege(&self) -> PrivilegeLevel {
        self.privilege
    }

    pub fn reg(&self, r: usize) -> u64 {
        self.regs[r & 31]
    }

    pub fn set_reg(&mut self, r: usize, value: u64) {
        if r & 31 != 0 {
            self.regs[r & 31] = value;
        }
    }

    pub fn fregs(&self) -> &FpRegisters {
        &self.fregs
    }

    pub fn fregs_mut(&mut self) -> &mut FpRegisters {
        &mut self.fregs
    }

    pub fn csrs(&self) -> &CsrFile {
        &self.csrs
    }

    pub fn csrs_mut(&mut self) -> &mut CsrFile {
        &mut self.csrs
    }

    pub fn set_pause_on_break(&mut self, value: bool) {
        self.pause_on_break = value;
    }

    pub fn set_pause_on_restart(&mut self, value: bool) {
        self.pause_on_restart = value;
    }

    pub fn is_waiting_for_interrupt(&self) -> bool {
        self.waiting_for_interrupt
    }

    pub fn set_breakpoint(&mut self, address: u64) {
        self.breakpoints.insert(address);
    }

    pub fn clear_breakpoint(&mut self, address: u64) {
        self.breakpoints.remove(&address);
    }

    pub fn is_breakpoint(&self, address: u64) -> bool {
        self.breakpoints.contains(&address)
    }

    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            regs: self.regs,
            fregs: self.fregs.snapshot(),
            pc: self.pc,
            privilege: self.privilege,
        }
    }

    pub fn csr_snapshot(&self) -> std::collections::BTreeMap<u16, u64> {
        self.csrs.snapshot()
    }

    /// Build the fault report for a host-side failure.
    pub fn capture_exception(&self, message: String) -> VmException {
        VmException {
            hart_id: self.hart_id(),
            regs: self.regs,
            fregs: self.fregs.snapshot(),
            csrs: self.csrs.snapshot(),
            virtual_pc: self.pc,
            physical_pc: self.last_physical_pc,
            instruction: self.last_instruction,
            message,
        }
    }

    /// Reset everything a restart rebuilds: CSR file, translation state,
    /// privilege and the wait flag. Register contents survive, the handoff
    /// protocol passes arguments through them.
    fn reset_derived_state(&mut self) {
        self.csrs.reset();
        self.translator.flush();
        self.privilege = PrivilegeLevel::Machine;
        self.waiting_for_interrupt = false;
        self.timer.reset_time_cmp();
    }

    pub(crate) fn apply_restart(&mut self, entry: u64, source_hart: u32) {
        log::debug!(
            "hart {} restarting at {entry:#x} (from hart {source_hart})",
            self.hart_id()
        );
        self.reset_derived_state();
        self.pc = entry;
        if self.pause_on_restart {
            self.signals.pause();
        } else {
            self.signals.unpause();
        }
    }

    /// Translate on behalf of an instruction, mapping the fault kinds.
    pub(crate) fn translate(
        &mut self,
        vaddr: u64,
        access: AccessType,
        is_amo: bool,
    ) -> Result<u32, Fault> {
        self.translator.translate(
            &self.memory,
            &self.csrs,
            self.privilege,
            vaddr,
            access,
            is_amo,
        )
    }

    /// Convert a physical memory failure into the architectural cause for
    /// the given access type, with the faulting virtual address in `xtval`.
    pub(crate) fn memory_fault(&self, error: MemoryError, vaddr: u64, access: AccessType) -> Fault {
        let cause = match error {
            MemoryError::Misaligned(..) => access.misaligned(),
            _ => access.access_fault(),
        };
        Fault::new(cause, vaddr)
    }

    /// Which interrupt, if any, must be taken before the next instruction.
    fn pending_interrupt(&self) -> Option<Interrupt> {
        let pending = self.csrs.get(csr::MIP) & self.csrs.get(csr::MIE);
        if pending == 0 {
            return None;
        }

        let mideleg = self.csrs.get(csr::MIDELEG);
        let mstatus = self.csrs.mstatus();

        // machine level interrupts always take precedence; they are masked
        // only while machine mode runs with MIE clear
        let machine_pending = pending & !mideleg;
        let machine_enabled = self.privilege < PrivilegeLevel::Machine
            || mstatus & MStatusFlags::MIE.bits() != 0;
        if machine_enabled && machine_pending != 0 {
            return first_by_priority(machine_pending);
        }

        // delegated interrupts reach supervisor mode unless it masked them
        let supervisor_pending = pending & mideleg;
        let supervisor_enabled = match self.privilege {
            PrivilegeLevel::Machine => false,
            PrivilegeLevel::Supervisor => mstatus & MStatusFlags::SIE.bits() != 0,
            PrivilegeLevel::User => true,
        };
        if supervisor_enabled && supervisor_pending != 0 {
            return first_by_priority(supervisor_pending);
        }

        None
    }

    /// Trap entry per the privileged specification: consult delegation,
    /// save pc/cause/tval, push the interrupt-enable stack, redirect.
    pub(crate) fn enter_trap(&mut self, event: TrapEvent, tval: u64) {
        let code = event.code();
        let deleg = if event.is_interrupt() {
            self.csrs.get(csr::MIDELEG)
        } else {
            self.csrs.get(csr::MEDELEG)
        };
        let delegated = self.privilege <= PrivilegeLevel::Supervisor
            && code < 64
            && (deleg >> code) & 1 != 0;

        log::trace!(
            "hart {} trap {:?} tval {tval:#x} at pc {:#x} -> {} mode",
            self.hart_id(),
            event,
            self.pc,
            if delegated { "supervisor" } else { "machine" }
        );

        let old_privilege = self.privilege;
        let mut mstatus = self.csrs.mstatus();

        if delegated {
            self.csrs.set(csr::SEPC, self.pc);
            self.csrs.set(csr::SCAUSE, event.cause());
            self.csrs.set(csr::STVAL, tval);

            let sie = mstatus & MStatusFlags::SIE.bits() != 0;
            mstatus &= !(MStatusFlags::SIE.bits() | MStatusFlags::SPIE.bits());
            if sie {
                mstatus |= MStatusFlags::SPIE.bits();
            }
            mstatus = csr::with_spp(mstatus, old_privilege);
            self.csrs.set(csr::MSTATUS, mstatus);

            self.privilege = PrivilegeLevel::Supervisor;
            self.pc = trap_vector(self.csrs.get(csr::STVEC), event);
        } else {
            self.csrs.set(csr::MEPC, self.pc);
            self.csrs.set(csr::MCAUSE, event.cause());
            self.csrs.set(csr::MTVAL, tval);

            let mie = mstatus & MStatusFlags::MIE.bits() != 0;
            mstatus &= !(MStatusFlags::MIE.bits() | MStatusFlags::MPIE.bits());
            if mie {
                mstatus |= MStatusFlags::MPIE.bits();
            }
            mstatus = csr::with_mpp(mstatus, old_privilege);
            self.csrs.set(csr::MSTATUS, mstatus);

            self.privilege = PrivilegeLevel::Machine;
            self.pc = trap_vector(self.csrs.get(csr::MTVEC), event);
        }

        if self.privilege != old_privilege {
            self.translator.flush();
        }
    }

    /// Execute at most one instruction.
    fn single_step(&mut self, check_breakpoint: bool) -> SliceOutcome {
        if let Some((entry, source)) = self.signals.take_restart() {
            self.apply_restart(entry, source);
            if self.signals.is_paused() {
                return SliceOutcome::Paused;
            }
        }

        if self.waiting_for_interrupt {
            if self.csrs.get(csr::MIP) == 0 {
                return SliceOutcome::Waiting;
            }
            self.waiting_for_interrupt = false;
        }

        // an enabled pending interrupt is taken instead of executing
        if let Some(interrupt) = self.pending_interrupt() {
            self.enter_trap(TrapEvent::Interrupt(interrupt), 0);
            return SliceOutcome::Ran;
        }

        if check_breakpoint && self.breakpoints.contains(&self.pc) {
            self.signals.pause();
            return SliceOutcome::Paused;
        }

        let word = match self.fetch() {
            Ok(word) => word,
            Err(fault) => {
                self.enter_trap(TrapEvent::Exception(fault.cause), fault.tval);
                return SliceOutcome::Ran;
            }
        };

        let instruction = instr::decode(word);
        match self.execute(&instruction, word) {
            Ok(()) => {
                self.csrs.retire_instruction();
                self.signals.retire();
            }
            Err(fault) => {
                self.enter_trap(TrapEvent::Exception(fault.cause), fault.tval);
            }
        }

        SliceOutcome::Ran
    }

    fn fetch(&mut self) -> Result<u32, Fault> {
        self.last_physical_pc = None;
        self.last_instruction = None;

        if self.pc & 3 != 0 {
            return Err(Fault::new(AccessType::Execute.misaligned(), self.pc));
        }

        let pa = self.translate(self.pc, AccessType::Execute, false)?;
        self.last_physical_pc = Some(pa);

        let word = self
            .memory
            .read_word(pa)
            .map_err(|e| self.memory_fault(e, self.pc, AccessType::Execute))?;
        self.last_instruction = Some(word);
        Ok(word)
    }

    /// Run up to `budget` instructions, honoring stop/pause requests and
    /// WFI at every boundary. The first instruction of a slice does not
    /// check breakpoints so that a paused hart can be stepped past one.
    pub fn run_slice(&mut self, budget: u64) -> SliceOutcome {
        for i in 0..budget {
            if !self.signals.is_running() {
                return SliceOutcome::Stopped;
            }
            if i > 0 && self.signals.is_paused() {
                return SliceOutcome::Paused;
            }

            match self.single_step(i > 0) {
                SliceOutcome::Ran => {}
                outcome => return outcome,
            }
        }
        SliceOutcome::Ran
    }

    /// The debugger entry point: run up to `steps` instructions, returning
    /// how many boundaries were crossed before a pause/halt intervened.
    pub fn step(&mut self, steps: u64) -> u64 {
        for i in 0..steps {
            if i > 0 && self.signals.is_paused() {
                return i;
            }
            match self.single_step(i > 0) {
                SliceOutcome::Ran => {}
                _ => return i,
            }
        }
        steps
    }
}

fn first_by_priority(bits: u64) -> Option<Interrupt> {
    const ORDER: [Interrupt; 6] = [
        Interrupt::MachineExternal,
        Interrupt::MachineSoftware,
        Interrupt::MachineTimer,
        Interrupt::SupervisorExternal,
        Interrupt::SupervisorSoftware,
        Interrupt::SupervisorTimer,
    ];
    ORDER.into_iter().find(|i| bits & (1 << i.code()) != 0)
}

/// Resolve the target pc of a trap: direct mode jumps to the base,
/// vectored mode offsets asynchronous causes by 4 entries each.
fn trap_vector(tvec: u64, event: TrapEvent) -> u64 {
    let base = tvec & !0b11;
    if event.is_interrupt() && tvec & 0b11 == 1 {
        base + 4 * event.code()
    } else {
        base
    }
}
