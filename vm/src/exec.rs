//! Instruction execution
//!
//! One `match` over the decoded instruction, dispatched once per step. Every
//! arm either completes (the default `pc + 4` advance applies, unless the arm
//! redirected control flow itself) or returns a [`Fault`] that the caller
//! feeds into the trap machinery.

use riscv::csr::{self, FloatState, MStatusFlags};
use riscv::instr::{reg, Instruction, Kind};
use riscv::trap::Exception;
use riscv::PrivilegeLevel;

use crate::ecall::EcallContext;
use crate::fpu;
use crate::hart::Hart;
use crate::mem::AmoOp;
use crate::translate::AccessType;
use crate::Fault;

fn sext32(value: u32) -> u64 {
    value as i32 as i64 as u64
}

impl Hart {
    fn x(&self, r: u8) -> u64 {
        self.regs[r as usize & 31]
    }

    fn set_x(&mut self, r: u8, value: u64) {
        if r & 31 != 0 {
            self.regs[r as usize & 31] = value;
        }
    }

    fn load_byte(&mut self, va: u64) -> Result<u8, Fault> {
        let pa = self.translate(va, AccessType::Read, false)?;
        self.memory
            .read_byte(pa)
            .map_err(|e| self.memory_fault(e, va, AccessType::Read))
    }

    fn load_half(&mut self, va: u64) -> Result<u16, Fault> {
        let pa = self.translate(va, AccessType::Read, false)?;
        self.memory
            .read_half(pa)
            .map_err(|e| self.memory_fault(e, va, AccessType::Read))
    }

    fn load_word(&mut self, va: u64) -> Result<u32, Fault> {
        let pa = self.translate(va, AccessType::Read, false)?;
        self.memory
            .read_word(pa)
            .map_err(|e| self.memory_fault(e, va, AccessType::Read))
    }

    /// 64 bit load; both halves translate separately so that a doubleword
    /// spanning a page boundary still resolves correctly.
    fn load_long(&mut self, va: u64) -> Result<u64, Fault> {
        let lo = self.load_word(va)? as u64;
        let hi = self.load_word(va.wrapping_add(4))? as u64;
        Ok(lo | (hi << 32))
    }

    fn store_byte(&mut self, va: u64, value: u8) -> Result<(), Fault> {
        let pa = self.translate(va, AccessType::Write, false)?;
        self.memory
            .write_byte(pa, value)
            .map_err(|e| self.memory_fault(e, va, AccessType::Write))
    }

    fn store_half(&mut self, va: u64, value: u16) -> Result<(), Fault> {
        let pa = self.translate(va, AccessType::Write, false)?;
        self.memory
            .write_half(pa, value)
            .map_err(|e| self.memory_fault(e, va, AccessType::Write))
    }

    fn store_word(&mut self, va: u64, value: u32) -> Result<(), Fault> {
        let pa = self.translate(va, AccessType::Write, false)?;
        self.memory
            .write_word(pa, value)
            .map_err(|e| self.memory_fault(e, va, AccessType::Write))
    }

    fn store_long(&mut self, va: u64, value: u64) -> Result<(), Fault> {
        self.store_word(va, value as u32)?;
        self.store_word(va.wrapping_add(4), (value >> 32) as u32)
    }

    /// Atomics require natural alignment; memory only checks words.
    fn check_amo_alignment(&self, va: u64, width: u64) -> Result<(), Fault> {
        if va & (width - 1) != 0 {
            return Err(Fault::new(AccessType::Write.misaligned(), va));
        }
        Ok(())
    }

    fn amo_word(&mut self, va: u64, op: AmoOp, value: u32) -> Result<u32, Fault> {
        self.check_amo_alignment(va, 4)?;
        let pa = self.translate(va, AccessType::Write, true)?;
        self.memory
            .amo_word(pa, op, value)
            .map_err(|e| self.memory_fault(e, va, AccessType::Write))
    }

    fn amo_long(&mut self, va: u64, op: AmoOp, value: u64) -> Result<u64, Fault> {
        self.check_amo_alignment(va, 8)?;
        let pa = self.translate(va, AccessType::Write, true)?;
        self.memory
            .amo_long(pa, op, value)
            .map_err(|e| self.memory_fault(e, va, AccessType::Write))
    }

    /// F/D instructions are only legal while `mstatus.FS` is on.
    fn require_fpu(&self, word: u32) -> Result<(), Fault> {
        if csr::fs(self.csrs.mstatus()) == FloatState::Off {
            return Err(Fault::illegal_instruction(word));
        }
        Ok(())
    }

    fn set_fs_dirty(&mut self) {
        let mstatus = csr::with_fs(self.csrs.mstatus(), FloatState::Dirty);
        self.csrs.set(csr::MSTATUS, mstatus);
    }

    fn accrue_fflags(&mut self, flags: u64) {
        if flags != 0 {
            let old = self.csrs.get(csr::FFLAGS);
            self.csrs.set(csr::FFLAGS, old | flags);
        }
    }

    /// Resolve the rounding mode of an instruction, consulting `frm` for
    /// the dynamic encoding. Reserved modes raise illegal-instruction
    /// before the operation runs.
    fn resolve_rm(&self, rm: u8, word: u32) -> Result<u8, Fault> {
        let resolved = if rm == csr::RM_DYNAMIC {
            (self.csrs.get(csr::FRM) & 0b111) as u8
        } else {
            rm
        };
        if resolved > csr::RM_RMM {
            return Err(Fault::illegal_instruction(word));
        }
        Ok(resolved)
    }

    fn csr_read(&mut self, instr: &Instruction, word: u32) -> Result<u64, Fault> {
        let addr = instr.csr();
        if matches!(addr, csr::FFLAGS | csr::FRM | csr::FCSR) {
            self.require_fpu(word)?;
        }
        self.csrs.read(addr, self.privilege, word)
    }

    fn csr_write(&mut self, instr: &Instruction, value: u64, word: u32) -> Result<(), Fault> {
        let addr = instr.csr();
        self.csrs.write(addr, value, self.privilege, word)?;
        match addr {
            // a new address space takes effect immediately
            csr::SATP => self.translator.flush(),
            csr::FFLAGS | csr::FRM | csr::FCSR => self.set_fs_dirty(),
            _ => {}
        }
        Ok(())
    }

    /// Deliver a synthesized trap (the CUST.MTRAP/CUST.STRAP debug aids):
    /// the recorded previous privilege is taken from the instruction, the
    /// return address is the following instruction.
    fn synthesize_trap(&mut self, to_supervisor: bool, cause: u64, recorded: PrivilegeLevel) {
        let old_privilege = self.privilege;
        self.privilege = recorded;
        self.pc = self.pc.wrapping_add(4);

        let event = riscv::trap::TrapEvent::Exception(Exception::from(cause));
        if to_supervisor {
            let mut mstatus = self.csrs.mstatus();
            self.csrs.set(csr::SEPC, self.pc);
            self.csrs.set(csr::SCAUSE, event.cause());
            self.csrs.set(csr::STVAL, 0);
            let sie = mstatus & MStatusFlags::SIE.bits() != 0;
            mstatus &= !(MStatusFlags::SIE.bits() | MStatusFlags::SPIE.bits());
            if sie {
                mstatus |= MStatusFlags::SPIE.bits();
            }
            mstatus = csr::with_spp(mstatus, recorded);
            self.csrs.set(csr::MSTATUS, mstatus);
            self.privilege = PrivilegeLevel::Supervisor;
            self.pc = self.csrs.get(csr::STVEC) & !0b11;
        } else {
            let mut mstatus = self.csrs.mstatus();
            self.csrs.set(csr::MEPC, self.pc);
            self.csrs.set(csr::MCAUSE, event.cause());
            self.csrs.set(csr::MTVAL, 0);
            let mie = mstatus & MStatusFlags::MIE.bits() != 0;
            mstatus &= !(MStatusFlags::MIE.bits() | MStatusFlags::MPIE.bits());
            if mie {
                mstatus |= MStatusFlags::MPIE.bits();
            }
            mstatus = csr::with_mpp(mstatus, recorded);
            self.csrs.set(csr::MSTATUS, mstatus);
            self.privilege = PrivilegeLevel::Machine;
            self.pc = self.csrs.get(csr::MTVEC) & !0b11;
        }

        if self.privilege != old_privilege {
            self.translator.flush();
        }
    }

    /// Execute one decoded instruction. On success the pc has advanced (or
    /// been redirected); on error nothing architectural happened except
    /// side effects the ISA permits before the fault.
    pub(crate) fn execute(&mut self, instr: &Instruction, word: u32) -> Result<(), Fault> {
        use Kind::*;

        let mut next_pc = self.pc.wrapping_add(4);

        match instr.kind {
            Lui => self.set_x(instr.rd, instr.imm as u64),
            Auipc => self.set_x(instr.rd, self.pc.wrapping_add(instr.imm as u64)),

            Jal => {
                self.set_x(instr.rd, next_pc);
                next_pc = self.pc.wrapping_add(instr.imm as u64);
            }
            Jalr => {
                let target = self.x(instr.rs1).wrapping_add(instr.imm as u64) & !1;
                self.set_x(instr.rd, next_pc);
                next_pc = target;
            }

            Beq | Bne | Blt | Bge | Bltu | Bgeu => {
                let a = self.x(instr.rs1);
                let b = self.x(instr.rs2);
                let taken = match instr.kind {
                    Beq => a == b,
                    Bne => a != b,
                    Blt => (a as i64) < (b as i64),
                    Bge => (a as i64) >= (b as i64),
                    Bltu => a < b,
                    _ => a >= b,
                };
                if taken {
                    next_pc = self.pc.wrapping_add(instr.imm as u64);
                }
            }

            Lb => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                let value = self.load_byte(va)? as i8 as i64 as u64;
                self.set_x(instr.rd, value);
            }
            Lh => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                let value = self.load_half(va)? as i16 as i64 as u64;
                self.set_x(instr.rd, value);
            }
            Lw => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                let value = sext32(self.load_word(va)?);
                self.set_x(instr.rd, value);
            }
            Lbu => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                let value = self.load_byte(va)? as u64;
                self.set_x(instr.rd, value);
            }
            Lhu => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                let value = self.load_half(va)? as u64;
                self.set_x(instr.rd, value);
            }
            Lwu => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                let value = self.load_word(va)? as u64;
                self.set_x(instr.rd, value);
            }
            Ld => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                let value = self.load_long(va)?;
                self.set_x(instr.rd, value);
            }

            Sb => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                self.store_byte(va, self.x(instr.rs2) as u8)?;
            }
            Sh => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                self.store_half(va, self.x(instr.rs2) as u16)?;
            }
            Sw => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                self.store_word(va, self.x(instr.rs2) as u32)?;
            }
            Sd => {
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                self.store_long(va, self.x(instr.rs2))?;
            }

            Addi => self.set_x(instr.rd, self.x(instr.rs1).wrapping_add(instr.imm as u64)),
            Slti => self.set_x(instr.rd, ((self.x(instr.rs1) as i64) < instr.imm) as u64),
            Sltiu => self.set_x(instr.rd, (self.x(instr.rs1) < instr.imm as u64) as u64),
            Xori => self.set_x(instr.rd, self.x(instr.rs1) ^ instr.imm as u64),
            Ori => self.set_x(instr.rd, self.x(instr.rs1) | instr.imm as u64),
            Andi => self.set_x(instr.rd, self.x(instr.rs1) & instr.imm as u64),
            Slli => self.set_x(instr.rd, self.x(instr.rs1) << (instr.imm & 0x3f)),
            Srli => self.set_x(instr.rd, self.x(instr.rs1) >> (instr.imm & 0x3f)),
            Srai => self.set_x(
                instr.rd,
                ((self.x(instr.rs1) as i64) >> (instr.imm & 0x3f)) as u64,
            ),

            Addiw => self.set_x(
                instr.rd,
                sext32((self.x(instr.rs1) as u32).wrapping_add(instr.imm as u32)),
            ),
            Slliw => self.set_x(
                instr.rd,
                sext32((self.x(instr.rs1) as u32) << (instr.imm & 0x1f)),
            ),
            Srliw => self.set_x(
                instr.rd,
                sext32((self.x(instr.rs1) as u32) >> (instr.imm & 0x1f)),
            ),
            Sraiw => self.set_x(
                instr.rd,
                sext32(((self.x(instr.rs1) as u32 as i32) >> (instr.imm & 0x1f)) as u32),
            ),

            Add => self.set_x(instr.rd, self.x(instr.rs1).wrapping_add(self.x(instr.rs2))),
            Sub => self.set_x(instr.rd, self.x(instr.rs1).wrapping_sub(self.x(instr.rs2))),
            Sll => self.set_x(instr.rd, self.x(instr.rs1) << (self.x(instr.rs2) & 0x3f)),
            Slt => self.set_x(
                instr.rd,
                ((self.x(instr.rs1) as i64) < (self.x(instr.rs2) as i64)) as u64,
            ),
            Sltu => self.set_x(instr.rd, (self.x(instr.rs1) < self.x(instr.rs2)) as u64),
            Xor => self.set_x(instr.rd, self.x(instr.rs1) ^ self.x(instr.rs2)),
            Srl => self.set_x(instr.rd, self.x(instr.rs1) >> (self.x(instr.rs2) & 0x3f)),
            Sra => self.set_x(
                instr.rd,
                ((self.x(instr.rs1) as i64) >> (self.x(instr.rs2) & 0x3f)) as u64,
            ),
            Or => self.set_x(instr.rd, self.x(instr.rs1) | self.x(instr.rs2)),
            And => self.set_x(instr.rd, self.x(instr.rs1) & self.x(instr.rs2)),

            Addw => self.set_x(
                instr.rd,
                sext32((self.x(instr.rs1) as u32).wrapping_add(self.x(instr.rs2) as u32)),
            ),
            Subw => self.set_x(
                instr.rd,
                sext32((self.x(instr.rs1) as u32).wrapping_sub(self.x(instr.rs2) as u32)),
            ),
            Sllw => self.set_x(
                instr.rd,
                sext32((self.x(instr.rs1) as u32) << (self.x(instr.rs2) & 0x1f)),
            ),
            Srlw => self.set_x(
                instr.rd,
                sext32((self.x(instr.rs1) as u32) >> (self.x(instr.rs2) & 0x1f)),
            ),
            Sraw => self.set_x(
                instr.rd,
                sext32(((self.x(instr.rs1) as u32 as i32) >> (self.x(instr.rs2) & 0x1f)) as u32),
            ),

            Mul => self.set_x(instr.rd, self.x(instr.rs1).wrapping_mul(self.x(instr.rs2))),
            Mulh => {
                let product =
                    (self.x(instr.rs1) as i64 as i128) * (self.x(instr.rs2) as i64 as i128);
                self.set_x(instr.rd, (product >> 64) as u64);
            }
            Mulhsu => {
                let product = (self.x(instr.rs1) as i64 as i128) * (self.x(instr.rs2) as i128);
                self.set_x(instr.rd, (product >> 64) as u64);
            }
            Mulhu => {
                let product = (self.x(instr.rs1) as u128) * (self.x(instr.rs2) as u128);
                self.set_x(instr.rd, (product >> 64) as u64);
            }
            Div => {
                let a = self.x(instr.rs1) as i64;
                let b = self.x(instr.rs2) as i64;
                let q = if b == 0 {
                    -1
                } else if a == i64::MIN && b == -1 {
                    i64::MIN
                } else {
                    a / b
                };
                self.set_x(instr.rd, q as u64);
            }
            Divu => {
                let b = self.x(instr.rs2);
                let q = if b == 0 {
                    u64::MAX
                } else {
                    self.x(instr.rs1) / b
                };
                self.set_x(instr.rd, q);
            }
            Rem => {
                let a = self.x(instr.rs1) as i64;
                let b = self.x(instr.rs2) as i64;
                let r = if b == 0 {
                    a
                } else if a == i64::MIN && b == -1 {
                    0
                } else {
                    a % b
                };
                self.set_x(instr.rd, r as u64);
            }
            Remu => {
                let a = self.x(instr.rs1);
                let b = self.x(instr.rs2);
                self.set_x(instr.rd, if b == 0 { a } else { a % b });
            }
            Mulw => self.set_x(
                instr.rd,
                sext32((self.x(instr.rs1) as u32).wrapping_mul(self.x(instr.rs2) as u32)),
            ),
            Divw => {
                let a = self.x(instr.rs1) as u32 as i32;
                let b = self.x(instr.rs2) as u32 as i32;
                let q = if b == 0 {
                    -1
                } else if a == i32::MIN && b == -1 {
                    i32::MIN
                } else {
                    a / b
                };
                self.set_x(instr.rd, q as i64 as u64);
            }
            Divuw => {
                let a = self.x(instr.rs1) as u32;
                let b = self.x(instr.rs2) as u32;
                let q = if b == 0 { u32::MAX } else { a / b };
                self.set_x(instr.rd, sext32(q));
            }
            Remw => {
                let a = self.x(instr.rs1) as u32 as i32;
                let b = self.x(instr.rs2) as u32 as i32;
                let r = if b == 0 {
                    a
                } else if a == i32::MIN && b == -1 {
                    0
                } else {
                    a % b
                };
                self.set_x(instr.rd, r as i64 as u64);
            }
            Remuw => {
                let a = self.x(instr.rs1) as u32;
                let b = self.x(instr.rs2) as u32;
                self.set_x(instr.rd, sext32(if b == 0 { a } else { a % b }));
            }

            // sequential consistency makes the fences pure retirements
            Fence | SfenceWInval | SfenceInvalIr => {
                if matches!(instr.kind, SfenceWInval | SfenceInvalIr)
                    && self.privilege == PrivilegeLevel::User
                {
                    return Err(Fault::illegal_instruction(word));
                }
            }

            SfenceVma | SinvalVma | SinvalGvma => {
                if self.privilege == PrivilegeLevel::User {
                    return Err(Fault::illegal_instruction(word));
                }
                self.translator.flush();
            }

            Ecall => {
                let number = self.x(reg::A0 as u8);
                let ecalls = self.ecalls.clone();
                let memory = self.memory.clone();
                let handled = ecalls.dispatch(
                    number,
                    EcallContext {
                        hart_id: self.csrs.hart_id(),
                        memory: &memory,
                        regs: &mut self.regs,
                        fregs: &mut self.fregs,
                    },
                );

                if !handled {
                    let cause = match self.privilege {
                        PrivilegeLevel::User => Exception::EnvCallFromUMode,
                        PrivilegeLevel::Supervisor => Exception::EnvCallFromSMode,
                        PrivilegeLevel::Machine => Exception::EnvCallFromMMode,
                    };
                    return Err(Fault::new(cause, 0));
                }

                // a handler may have restarted this very hart; the new entry
                // point replaces the sequential pc
                if let Some((entry, source)) = self.signals.take_restart() {
                    self.apply_restart(entry, source);
                    next_pc = entry;
                }
            }

            Ebreak => {
                if self.pause_on_break {
                    self.signals.pause();
                }
                return Err(Fault::new(Exception::Breakpoint, self.pc));
            }

            Wfi => {
                self.waiting_for_interrupt = true;
            }

            Mret => {
                if self.privilege != PrivilegeLevel::Machine {
                    return Err(Fault::illegal_instruction(word));
                }
                let mut mstatus = self.csrs.mstatus();
                let new_privilege = csr::mpp(mstatus);

                // pop the machine interrupt-enable stack
                let mpie = mstatus & MStatusFlags::MPIE.bits() != 0;
                mstatus &= !MStatusFlags::MIE.bits();
                if mpie {
                    mstatus |= MStatusFlags::MIE.bits();
                }
                mstatus |= MStatusFlags::MPIE.bits();
                mstatus = csr::with_mpp(mstatus, PrivilegeLevel::User);
                self.csrs.set(csr::MSTATUS, mstatus);

                next_pc = self.csrs.get(csr::MEPC);
                if new_privilege != self.privilege {
                    self.translator.flush();
                }
                self.privilege = new_privilege;
            }

            Sret => {
                if self.privilege == PrivilegeLevel::User {
                    return Err(Fault::illegal_instruction(word));
                }
                let mut mstatus = self.csrs.mstatus();
                let new_privilege = csr::spp(mstatus);

                let spie = mstatus & MStatusFlags::SPIE.bits() != 0;
                mstatus &= !MStatusFlags::SIE.bits();
                if spie {
                    mstatus |= MStatusFlags::SIE.bits();
                }
                mstatus |= MStatusFlags::SPIE.bits();
                mstatus = csr::with_spp(mstatus, PrivilegeLevel::User);
                self.csrs.set(csr::MSTATUS, mstatus);

                next_pc = self.csrs.get(csr::SEPC);
                if new_privilege != self.privilege {
                    self.translator.flush();
                }
                self.privilege = new_privilege;
            }

            Csrrw => {
                let old = self.csr_read(instr, word)?;
                self.csr_write(instr, self.x(instr.rs1), word)?;
                self.set_x(instr.rd, old);
            }
            Csrrs => {
                let old = self.csr_read(instr, word)?;
                if instr.rs1 != 0 {
                    self.csr_write(instr, old | self.x(instr.rs1), word)?;
                }
                self.set_x(instr.rd, old);
            }
            Csrrc => {
                let old = self.csr_read(instr, word)?;
                if instr.rs1 != 0 {
                    self.csr_write(instr, old & !self.x(instr.rs1), word)?;
                }
                self.set_x(instr.rd, old);
            }
            Csrrwi => {
                let old = self.csr_read(instr, word)?;
                self.csr_write(instr, instr.rs1 as u64, word)?;
                self.set_x(instr.rd, old);
            }
            Csrrsi => {
                let old = self.csr_read(instr, word)?;
                if instr.rs1 != 0 {
                    self.csr_write(instr, old | instr.rs1 as u64, word)?;
                }
                self.set_x(instr.rd, old);
            }
            Csrrci => {
                let old = self.csr_read(instr, word)?;
                if instr.rs1 != 0 {
                    self.csr_write(instr, old & !(instr.rs1 as u64), word)?;
                }
                self.set_x(instr.rd, old);
            }

            LrW => {
                let va = self.x(instr.rs1);
                self.check_amo_alignment(va, 4)?;
                let pa = self.translate(va, AccessType::Read, true)?;
                let value = self
                    .memory
                    .read_word_reserved(pa, self.csrs.hart_id())
                    .map_err(|e| self.memory_fault(e, va, AccessType::Read))?;
                self.set_x(instr.rd, sext32(value));
            }
            ScW => {
                let va = self.x(instr.rs1);
                self.check_amo_alignment(va, 4)?;
                let pa = self.translate(va, AccessType::Write, true)?;
                let stored = self
                    .memory
                    .write_word_conditional(pa, self.x(instr.rs2) as u32, self.csrs.hart_id())
                    .map_err(|e| self.memory_fault(e, va, AccessType::Write))?;
                self.set_x(instr.rd, (!stored) as u64);
            }
            LrD => {
                let va = self.x(instr.rs1);
                self.check_amo_alignment(va, 8)?;
                let pa = self.translate(va, AccessType::Read, true)?;
                let value = self
                    .memory
                    .read_long_reserved(pa, self.csrs.hart_id())
                    .map_err(|e| self.memory_fault(e, va, AccessType::Read))?;
                self.set_x(instr.rd, value);
            }
            ScD => {
                let va = self.x(instr.rs1);
                self.check_amo_alignment(va, 8)?;
                let pa = self.translate(va, AccessType::Write, true)?;
                let stored = self
                    .memory
                    .write_long_conditional(pa, self.x(instr.rs2), self.csrs.hart_id())
                    .map_err(|e| self.memory_fault(e, va, AccessType::Write))?;
                self.set_x(instr.rd, (!stored) as u64);
            }

            AmoSwapW | AmoAddW | AmoXorW | AmoAndW | AmoOrW | AmoMinW | AmoMaxW | AmoMinuW
            | AmoMaxuW => {
                let op = amo_op(instr.kind);
                let va = self.x(instr.rs1);
                let old = self.amo_word(va, op, self.x(instr.rs2) as u32)?;
                self.set_x(instr.rd, sext32(old));
            }
            AmoSwapD | AmoAddD | AmoXorD | AmoAndD | AmoOrD | AmoMinD | AmoMaxD | AmoMinuD
            | AmoMaxuD => {
                let op = amo_op(instr.kind);
                let va = self.x(instr.rs1);
                let old = self.amo_long(va, op, self.x(instr.rs2))?;
                self.set_x(instr.rd, old);
            }

            Flw => {
                self.require_fpu(word)?;
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                let bits = self.load_word(va)?;
                self.fregs.set_f32_bits(instr.rd, bits);
                self.set_fs_dirty();
            }
            Fld => {
                self.require_fpu(word)?;
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                let bits = self.load_long(va)?;
                self.fregs.set_f64_bits(instr.rd, bits);
                self.set_fs_dirty();
            }
            Fsw => {
                self.require_fpu(word)?;
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                self.store_word(va, self.fregs.f32_bits(instr.rs2))?;
            }
            Fsd => {
                self.require_fpu(word)?;
                let va = self.x(instr.rs1).wrapping_add(instr.imm as u64);
                self.store_long(va, self.fregs.f64_bits(instr.rs2))?;
            }

            FmaddS | FmsubS | FnmsubS | FnmaddS => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let a = self.fregs.f32(instr.rs1);
                let b = self.fregs.f32(instr.rs2);
                let c = self.fregs.f32(instr.rs3);
                let result = match instr.kind {
                    FmaddS => a.mul_add(b, c),
                    FmsubS => a.mul_add(b, -c),
                    FnmsubS => (-a).mul_add(b, c),
                    _ => (-a).mul_add(b, -c),
                };
                self.accrue_fflags(fpu::arith_flags_f32(&[a, b, c], result));
                self.fregs.set_f32(instr.rd, result);
                self.set_fs_dirty();
            }
            FmaddD | FmsubD | FnmsubD | FnmaddD => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let a = self.fregs.f64(instr.rs1);
                let b = self.fregs.f64(instr.rs2);
                let c = self.fregs.f64(instr.rs3);
                let result = match instr.kind {
                    FmaddD => a.mul_add(b, c),
                    FmsubD => a.mul_add(b, -c),
                    FnmsubD => (-a).mul_add(b, c),
                    _ => (-a).mul_add(b, -c),
                };
                self.accrue_fflags(fpu::arith_flags_f64(&[a, b, c], result));
                self.fregs.set_f64(instr.rd, result);
                self.set_fs_dirty();
            }

            FaddS | FsubS | FmulS | FdivS => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let a = self.fregs.f32(instr.rs1);
                let b = self.fregs.f32(instr.rs2);
                let result = match instr.kind {
                    FaddS => a + b,
                    FsubS => a - b,
                    FmulS => a * b,
                    _ => a / b,
                };
                let flags = if instr.kind == FdivS {
                    fpu::div_flags_f32(a, b, result)
                } else {
                    fpu::arith_flags_f32(&[a, b], result)
                };
                self.accrue_fflags(flags);
                self.fregs.set_f32(instr.rd, result);
                self.set_fs_dirty();
            }
            FaddD | FsubD | FmulD | FdivD => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let a = self.fregs.f64(instr.rs1);
                let b = self.fregs.f64(instr.rs2);
                let result = match instr.kind {
                    FaddD => a + b,
                    FsubD => a - b,
                    FmulD => a * b,
                    _ => a / b,
                };
                let flags = if instr.kind == FdivD {
                    fpu::div_flags_f64(a, b, result)
                } else {
                    fpu::arith_flags_f64(&[a, b], result)
                };
                self.accrue_fflags(flags);
                self.fregs.set_f64(instr.rd, result);
                self.set_fs_dirty();
            }

            FsqrtS => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let a = self.fregs.f32(instr.rs1);
                let result = a.sqrt();
                self.accrue_fflags(fpu::sqrt_flags_f32(a, result));
                self.fregs.set_f32(instr.rd, result);
                self.set_fs_dirty();
            }
            FsqrtD => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let a = self.fregs.f64(instr.rs1);
                let result = a.sqrt();
                self.accrue_fflags(fpu::sqrt_flags_f64(a, result));
                self.fregs.set_f64(instr.rd, result);
                self.set_fs_dirty();
            }

            FsgnjS | FsgnjnS | FsgnjxS => {
                self.require_fpu(word)?;
                let a = self.fregs.f32_bits(instr.rs1);
                let b = self.fregs.f32_bits(instr.rs2);
                let sign = match instr.kind {
                    FsgnjS => b & 0x8000_0000,
                    FsgnjnS => !b & 0x8000_0000,
                    _ => (a ^ b) & 0x8000_0000,
                };
                self.fregs.set_f32_bits(instr.rd, (a & 0x7fff_ffff) | sign);
                self.set_fs_dirty();
            }
            FsgnjD | FsgnjnD | FsgnjxD => {
                self.require_fpu(word)?;
                let a = self.fregs.f64_bits(instr.rs1);
                let b = self.fregs.f64_bits(instr.rs2);
                let sign = match instr.kind {
                    FsgnjD => b & (1 << 63),
                    FsgnjnD => !b & (1 << 63),
                    _ => (a ^ b) & (1 << 63),
                };
                self.fregs.set_f64_bits(instr.rd, (a & !(1 << 63)) | sign);
                self.set_fs_dirty();
            }

            FminS | FmaxS => {
                self.require_fpu(word)?;
                let a = self.fregs.f32(instr.rs1);
                let b = self.fregs.f32(instr.rs2);
                let (result, flags) = if instr.kind == FminS {
                    fpu::fmin_f32(a, b)
                } else {
                    fpu::fmax_f32(a, b)
                };
                self.accrue_fflags(flags);
                self.fregs.set_f32(instr.rd, result);
                self.set_fs_dirty();
            }
            FminD | FmaxD => {
                self.require_fpu(word)?;
                let a = self.fregs.f64(instr.rs1);
                let b = self.fregs.f64(instr.rs2);
                let (result, flags) = if instr.kind == FminD {
                    fpu::fmin_f64(a, b)
                } else {
                    fpu::fmax_f64(a, b)
                };
                self.accrue_fflags(flags);
                self.fregs.set_f64(instr.rd, result);
                self.set_fs_dirty();
            }

            FeqS | FltS | FleS => {
                self.require_fpu(word)?;
                let a = self.fregs.f32(instr.rs1);
                let b = self.fregs.f32(instr.rs2);
                let (result, signaling) = match instr.kind {
                    FeqS => (a == b, false),
                    FltS => (a < b, true),
                    _ => (a <= b, true),
                };
                self.accrue_fflags(fpu::compare_flags_f32(a, b, signaling));
                self.set_x(instr.rd, result as u64);
                self.set_fs_dirty();
            }
            FeqD | FltD | FleD => {
                self.require_fpu(word)?;
                let a = self.fregs.f64(instr.rs1);
                let b = self.fregs.f64(instr.rs2);
                let (result, signaling) = match instr.kind {
                    FeqD => (a == b, false),
                    FltD => (a < b, true),
                    _ => (a <= b, true),
                };
                self.accrue_fflags(fpu::compare_flags_f64(a, b, signaling));
                self.set_x(instr.rd, result as u64);
                self.set_fs_dirty();
            }

            FclassS => {
                self.require_fpu(word)?;
                let value = self.fregs.f32(instr.rs1);
                self.set_x(instr.rd, fpu::fclass_f32(value));
            }
            FclassD => {
                self.require_fpu(word)?;
                let value = self.fregs.f64(instr.rs1);
                self.set_x(instr.rd, fpu::fclass_f64(value));
            }

            FcvtWS | FcvtWuS | FcvtLS | FcvtLuS => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let value = self.fregs.f32(instr.rs1);
                let (result, flags) = match instr.kind {
                    FcvtWS => {
                        let (v, f) = fpu::f32_to_i32(value);
                        (v as i64 as u64, f)
                    }
                    FcvtWuS => {
                        let (v, f) = fpu::f32_to_u32(value);
                        (sext32(v), f)
                    }
                    FcvtLS => {
                        let (v, f) = fpu::f32_to_i64(value);
                        (v as u64, f)
                    }
                    _ => fpu::f32_to_u64(value),
                };
                self.accrue_fflags(flags);
                self.set_x(instr.rd, result);
                self.set_fs_dirty();
            }
            FcvtWD | FcvtWuD | FcvtLD | FcvtLuD => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let value = self.fregs.f64(instr.rs1);
                let (result, flags) = match instr.kind {
                    FcvtWD => {
                        let (v, f) = fpu::f64_to_i32(value);
                        (v as i64 as u64, f)
                    }
                    FcvtWuD => {
                        let (v, f) = fpu::f64_to_u32(value);
                        (sext32(v), f)
                    }
                    FcvtLD => {
                        let (v, f) = fpu::f64_to_i64(value);
                        (v as u64, f)
                    }
                    _ => fpu::f64_to_u64(value),
                };
                self.accrue_fflags(flags);
                self.set_x(instr.rd, result);
                self.set_fs_dirty();
            }

            FcvtSW | FcvtSWu | FcvtSL | FcvtSLu => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let x = self.x(instr.rs1);
                let (wide, result) = match instr.kind {
                    FcvtSW => (x as u32 as i32 as i128, x as u32 as i32 as f32),
                    FcvtSWu => (x as u32 as i128, x as u32 as f32),
                    FcvtSL => (x as i64 as i128, x as i64 as f32),
                    _ => (x as i128, x as f32),
                };
                self.accrue_fflags(fpu::int_to_float_flags(wide, result as f64));
                self.fregs.set_f32(instr.rd, result);
                self.set_fs_dirty();
            }
            FcvtDW | FcvtDWu | FcvtDL | FcvtDLu => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let x = self.x(instr.rs1);
                let (wide, result) = match instr.kind {
                    FcvtDW => (x as u32 as i32 as i128, x as u32 as i32 as f64),
                    FcvtDWu => (x as u32 as i128, x as u32 as f64),
                    FcvtDL => (x as i64 as i128, x as i64 as f64),
                    _ => (x as i128, x as f64),
                };
                self.accrue_fflags(fpu::int_to_float_flags(wide, result));
                self.fregs.set_f64(instr.rd, result);
                self.set_fs_dirty();
            }

            FcvtSD => {
                self.require_fpu(word)?;
                self.resolve_rm(instr.rm, word)?;
                let value = self.fregs.f64(instr.rs1);
                let result = value as f32;
                let mut flags = fpu::arith_flags_f64(&[value], value);
                if result.is_infinite() && value.is_finite() {
                    flags |= csr::FFLAG_OF | csr::FFLAG_NX;
                } else if result.is_finite() && (result as f64) != value {
                    flags |= csr::FFLAG_NX;
                }
                self.accrue_fflags(flags);
                self.fregs.set_f32(instr.rd, result);
                self.set_fs_dirty();
            }
            FcvtDS => {
                self.require_fpu(word)?;
                let value = self.fregs.f32(instr.rs1);
                self.fregs.set_f64(instr.rd, value as f64);
                self.set_fs_dirty();
            }

            FmvXW => {
                self.require_fpu(word)?;
                self.set_x(instr.rd, sext32(self.fregs.f32_bits(instr.rs1)));
            }
            FmvXD => {
                self.require_fpu(word)?;
                self.set_x(instr.rd, self.fregs.f64_bits(instr.rs1));
            }
            FmvWX => {
                self.require_fpu(word)?;
                self.fregs.set_f32_bits(instr.rd, self.x(instr.rs1) as u32);
                self.set_fs_dirty();
            }
            FmvDX => {
                self.require_fpu(word)?;
                self.fregs.set_f64_bits(instr.rd, self.x(instr.rs1));
                self.set_fs_dirty();
            }

            CustTva => {
                let va = self.x(instr.rs1);
                let result = match self.translate(va, AccessType::Read, false) {
                    Ok(pa) => pa as u64,
                    Err(_) => 1,
                };
                self.set_x(instr.rd, result);
            }
            CustMtrap => {
                let cause = self.x(instr.rs1);
                let recorded = PrivilegeLevel::from_bits(self.x(instr.rs2) as u8);
                self.synthesize_trap(false, cause, recorded);
                next_pc = self.pc;
            }
            CustStrap => {
                let cause = self.x(instr.rs1);
                let recorded = PrivilegeLevel::from_bits(self.x(instr.rs2) as u8);
                self.synthesize_trap(true, cause, recorded);
                next_pc = self.pc;
            }

            Invalid => return Err(Fault::illegal_instruction(word)),
        }

        self.pc = next_pc;
        Ok(())
    }
}

fn amo_op(kind: Kind) -> AmoOp {
    use Kind::*;
    match kind {
        AmoSwapW | AmoSwapD => AmoOp::Swap,
        AmoAddW | AmoAddD => AmoOp::Add,
        AmoXorW | AmoXorD => AmoOp::Xor,
        AmoAndW | AmoAndD => AmoOp::And,
        AmoOrW | AmoOrD => AmoOp::Or,
        AmoMinW | AmoMinD => AmoOp::Min,
        AmoMaxW | AmoMaxD => AmoOp::Max,
        AmoMinuW | AmoMinuD => AmoOp::MinU,
        _ => AmoOp::MaxU,
    }
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use riscv::encode;
    use riscv::instr::{
        OP_ATOMIC, OP_BRANCH, OP_JALR, OP_LOAD, OP_LUI, OP_MATH, OP_MATH_IMMEDIATE, OP_STORE,
        OP_SYSTEM,
    };
    use riscv::pte::{vpn_segments, EntryFlags};
    use riscv::trap::INTERRUPT_BIT;
    use riscv::{csr as csrdef, PrivilegeLevel};

    use crate::ecall::EcallTable;
    use crate::hart::{Hart, HartSignals};
    use crate::mem::{MachineTimer, Memory, Region};

    use super::*;

    fn build_memory(base: u32, size: u32) -> Arc<Memory> {
        let mut memory = Memory::new();
        memory.add_region(Region::ram(base, size));
        Arc::new(memory)
    }

    fn build_hart(memory: Arc<Memory>, id: u32, pc: u64) -> Hart {
        Hart::new(
            memory,
            Arc::new(EcallTable::new()),
            Arc::new(MachineTimer::new()),
            Arc::new(HartSignals::new()),
            id,
            pc,
        )
    }

    fn hart_with_program(base: u64, program: &[u32]) -> Hart {
        let memory = build_memory(base as u32, 0x10_0000);
        memory.write_words(base as u32, program).unwrap();
        build_hart(memory, 0, base)
    }

    fn enable_fpu(hart: &mut Hart) {
        let mstatus = csr::with_fs(hart.csrs().mstatus(), FloatState::Initial);
        hart.csrs_mut().set(csrdef::MSTATUS, mstatus);
    }

    #[test]
    fn test_lui_sanity() {
        let mut hart = hart_with_program(0x1000, &[encode::u(OP_LUI, 10, 0x1)]);
        hart.step(1);
        assert_eq!(hart.reg(reg::A0), 0x1000);
        assert_eq!(hart.pc(), 0x1004);
    }

    #[test]
    fn test_auipc_at_high_address() {
        let memory = build_memory(0xfffe_0000, 0x1000);
        let auipc = encode::u(riscv::instr::OP_AUIPC, 11, 0x12345);
        memory.write_word(0xfffe_0000, auipc).unwrap();

        let mut hart = build_hart(memory, 0, 0xfffe_0000);
        hart.step(1);
        assert_eq!(hart.reg(reg::A1), 0xfffe_0000u64 + 0x1234_5000);
        assert_eq!(hart.pc(), 0xfffe_0004);
    }

    #[test]
    fn test_branch_taken_and_not_taken() {
        let base = 0x1000u64;
        let beq = encode::b(OP_BRANCH, 0b000, 5, 6, 0x100);
        let mut hart = hart_with_program(base, &[beq]);

        hart.set_reg(5, 42);
        hart.set_reg(6, 42);
        hart.step(1);
        assert_eq!(hart.pc(), base + 0x100);

        hart.set_pc(base);
        hart.set_reg(6, 43);
        hart.step(1);
        assert_eq!(hart.pc(), base + 4);
    }

    #[test]
    fn test_jal_links_and_jumps() {
        let mut hart = hart_with_program(0x1000, &[encode::j(riscv::instr::OP_JAL, 1, 0x80)]);
        hart.step(1);
        assert_eq!(hart.reg(reg::RA), 0x1004);
        assert_eq!(hart.pc(), 0x1080);
    }

    #[test]
    fn test_jalr_clears_low_bit() {
        let mut hart = hart_with_program(0x1000, &[encode::i(OP_JALR, 1, 0b000, 5, 1)]);
        hart.set_reg(5, 0x2004);
        hart.step(1);
        // target (0x2004 + 1) & !1
        assert_eq!(hart.pc(), 0x2004);
        assert_eq!(hart.reg(reg::RA), 0x1004);
    }

    #[test]
    fn test_register_zero_stays_zero() {
        let mut hart = hart_with_program(
            0x1000,
            &[encode::i(OP_MATH_IMMEDIATE, 0, 0b000, 0, 5)],
        );
        hart.step(1);
        assert_eq!(hart.reg(0), 0);
        assert_eq!(hart.pc(), 0x1004);
    }

    #[test]
    fn test_store_load_roundtrip() {
        // sw t0, 0(sp); lw t1, 0(sp); sd t0, 8(sp); ld t2, 8(sp)
        let program = [
            encode::s(OP_STORE, 0b010, 2, 5, 0),
            encode::i(OP_LOAD, 6, 0b010, 2, 0),
            encode::s(OP_STORE, 0b011, 2, 5, 8),
            encode::i(OP_LOAD, 7, 0b011, 2, 8),
        ];
        let mut hart = hart_with_program(0x1000, &program);
        hart.set_reg(reg::SP, 0x8000);
        hart.set_reg(5, 0x8844_2211_9966_3355);

        hart.step(4);
        // lw sign extends bit 31
        assert_eq!(hart.reg(6), 0xffff_ffff_9966_3355);
        assert_eq!(hart.reg(7), 0x8844_2211_9966_3355);
    }

    #[test]
    fn test_unsigned_division_by_zero() {
        let divu = encode::r(OP_MATH, 10, 0b101, 11, 12, 0b0000001);
        let mut hart = hart_with_program(0x1000, &[divu]);
        hart.set_reg(reg::A1, 0xdead_beef);
        hart.set_reg(reg::A2, 0);

        hart.step(1);
        assert_eq!(hart.reg(reg::A0), u64::MAX);
        // no trap: execution advanced normally
        assert_eq!(hart.pc(), 0x1004);
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 0);
    }

    #[test]
    fn test_signed_division_edges() {
        let div = encode::r(OP_MATH, 10, 0b100, 11, 12, 0b0000001);
        let rem = encode::r(OP_MATH, 13, 0b110, 11, 12, 0b0000001);
        let mut hart = hart_with_program(0x1000, &[div, rem]);
        hart.set_reg(reg::A1, i64::MIN as u64);
        hart.set_reg(reg::A2, -1i64 as u64);

        hart.step(2);
        assert_eq!(hart.reg(reg::A0), i64::MIN as u64);
        assert_eq!(hart.reg(reg::A3), 0);
    }

    #[test]
    fn test_lr_sc_contention() {
        let memory = build_memory(0x1000, 0x10_0000);
        // hart a: lr.w t0, (a0); sc.w t1, t2, (a0)
        memory
            .write_words(
                0x1000,
                &[
                    encode::r(OP_ATOMIC, 5, 0b010, 10, 0, 0b0001000),
                    encode::r(OP_ATOMIC, 6, 0b010, 10, 7, 0b0001100),
                ],
            )
            .unwrap();
        // hart b: sw t3, 0(a0)
        memory
            .write_words(0x2000, &[encode::s(OP_STORE, 0b010, 10, 28, 0)])
            .unwrap();
        memory.write_word(0x4000, 100).unwrap();

        let mut hart_a = build_hart(memory.clone(), 0, 0x1000);
        let mut hart_b = build_hart(memory.clone(), 1, 0x2000);
        hart_a.set_reg(reg::A0, 0x4000);
        hart_a.set_reg(7, 1111);
        hart_b.set_reg(reg::A0, 0x4000);
        hart_b.set_reg(28, 2222);

        hart_a.step(1);
        assert_eq!(hart_a.reg(5), 100);

        // hart b's ordinary store lands between lr and sc
        hart_b.step(1);

        hart_a.step(1);
        assert_eq!(hart_a.reg(6), 1, "sc must fail");
        assert_eq!(memory.read_word(0x4000).unwrap(), 2222);
    }

    #[test]
    fn test_amo_returns_old_value() {
        let amoadd = encode::r(OP_ATOMIC, 5, 0b010, 10, 6, 0b0000000);
        let mut hart = hart_with_program(0x1000, &[amoadd]);
        hart.set_reg(reg::A0, 0x4000);
        hart.set_reg(6, 2);
        hart.memory.write_word(0x4000, 40).unwrap();

        hart.step(1);
        assert_eq!(hart.reg(5), 40);
        assert_eq!(hart.memory.read_word(0x4000).unwrap(), 42);
    }

    #[test]
    fn test_amo_d_form() {
        let amoswap_d = encode::r(OP_ATOMIC, 5, 0b011, 10, 6, 0b0000100);
        let mut hart = hart_with_program(0x1000, &[amoswap_d]);
        hart.set_reg(reg::A0, 0x4008);
        hart.set_reg(6, 0x1122_3344_5566_7788);
        hart.memory.write_long(0x4008, 0xaaaa_bbbb_cccc_dddd).unwrap();

        hart.step(1);
        assert_eq!(hart.reg(5), 0xaaaa_bbbb_cccc_dddd);
        assert_eq!(
            hart.memory.read_long(0x4008).unwrap(),
            0x1122_3344_5566_7788
        );
    }

    #[test]
    fn test_misaligned_amo_traps() {
        let amoadd = encode::r(OP_ATOMIC, 5, 0b010, 10, 6, 0b0000000);
        let mut hart = hart_with_program(0x1000, &[amoadd]);
        hart.set_reg(reg::A0, 0x4002);

        hart.step(1);
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 6);
        assert_eq!(hart.csrs().get(csrdef::MTVAL), 0x4002);
    }

    #[test]
    fn test_csrrc_clears_bits() {
        let csrrc = encode::i(OP_SYSTEM, 6, 0b011, 5, csrdef::SSCRATCH as u32);
        let mut hart = hart_with_program(0x1000, &[csrrc]);
        hart.csrs_mut().set(csrdef::SSCRATCH, 0xaaaa_5555);
        hart.set_reg(5, 0x0000_ffff);

        hart.step(1);
        assert_eq!(hart.reg(6), 0xaaaa_5555);
        assert_eq!(hart.csrs().get(csrdef::SSCRATCH), 0xaaaa_0000);
    }

    #[test]
    fn test_csr_privilege_violation_traps() {
        // csrrw from user mode into mscratch
        let csrrw = encode::i(OP_SYSTEM, 6, 0b001, 5, csrdef::MSCRATCH as u32);
        let mut hart = hart_with_program(0x1000, &[csrrw]);
        hart.privilege = PrivilegeLevel::User;

        hart.step(1);
        // illegal instruction delivered to machine mode
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 2);
        assert_eq!(hart.csrs().get(csrdef::MEPC), 0x1000);
        assert_eq!(hart.privilege(), PrivilegeLevel::Machine);
    }

    #[test]
    fn test_trap_entry_and_mret_roundtrip() {
        // an illegal word at 0x1000, the handler at 0x2000 does mret
        let mut hart = hart_with_program(0x1000, &[0xffff_ffff]);
        hart.memory.write_word(0x2000, 0x30200073).unwrap();
        hart.csrs_mut().set(csrdef::MTVEC, 0x2000);
        let mstatus = hart.csrs().mstatus() | MStatusFlags::MIE.bits();
        hart.csrs_mut().set(csrdef::MSTATUS, mstatus);

        hart.step(1);
        let mstatus = hart.csrs().mstatus();
        assert_eq!(hart.pc(), 0x2000);
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 2);
        assert_eq!(hart.csrs().get(csrdef::MEPC), 0x1000);
        // the interrupt-enable stack was pushed
        assert_eq!(mstatus & MStatusFlags::MIE.bits(), 0);
        assert_ne!(mstatus & MStatusFlags::MPIE.bits(), 0);
        assert_eq!(csr::mpp(mstatus), PrivilegeLevel::Machine);

        hart.step(1);
        let mstatus = hart.csrs().mstatus();
        assert_eq!(hart.pc(), 0x1000);
        assert_eq!(hart.privilege(), PrivilegeLevel::Machine);
        assert_ne!(mstatus & MStatusFlags::MIE.bits(), 0);
        assert_eq!(csr::mpp(mstatus), PrivilegeLevel::User);
    }

    #[test]
    fn test_delegated_trap_reaches_supervisor() {
        let mut hart = hart_with_program(0x1000, &[0xffff_ffff]);
        hart.csrs_mut().set(csrdef::MEDELEG, 1 << 2);
        hart.csrs_mut().set(csrdef::STVEC, 0x3000);
        hart.privilege = PrivilegeLevel::User;

        hart.step(1);
        assert_eq!(hart.privilege(), PrivilegeLevel::Supervisor);
        assert_eq!(hart.pc(), 0x3000);
        assert_eq!(hart.csrs().get(csrdef::SCAUSE), 2);
        assert_eq!(hart.csrs().get(csrdef::SEPC), 0x1000);
        assert_eq!(csr::spp(hart.csrs().mstatus()), PrivilegeLevel::User);
    }

    #[test]
    fn test_instruction_page_fault_on_execute() {
        let memory = build_memory(0x1000, 0x100_0000);
        let root: u32 = 0x0000_8000;

        let map = |va: u32, pa: u32, flags: EntryFlags| {
            let vpn = vpn_segments(va);
            let l0 = root + 0x1000 + (vpn[1] << 12);
            memory
                .write_word(root + 4 * vpn[1], (l0 >> 12) << 10 | EntryFlags::Valid.bits())
                .unwrap();
            memory
                .write_word(
                    l0 + 4 * vpn[0],
                    (pa >> 12) << 10 | (flags | EntryFlags::Valid).bits(),
                )
                .unwrap();
        };

        // code page is executable, the jump target page is read-only
        map(0x0040_0000, 0x0040_0000, EntryFlags::RWX);
        map(0x0080_0000, 0x0080_0000, EntryFlags::Read);

        // jalr x0, 0(a0)
        memory
            .write_word(0x0040_0000, encode::i(OP_JALR, 0, 0b000, 10, 0))
            .unwrap();

        let mut hart = build_hart(memory, 0, 0x0040_0000);
        hart.csrs_mut().set(
            csrdef::SATP,
            u64::from(csrdef::SatpData {
                ppn: root >> 12,
                asid: 0,
                enabled: true,
            }),
        );
        hart.privilege = PrivilegeLevel::Supervisor;
        hart.set_reg(reg::A0, 0x0080_0000);

        hart.step(1);
        assert_eq!(hart.pc(), 0x0080_0000);

        hart.step(1);
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 12);
        assert_eq!(hart.csrs().get(csrdef::MEPC), 0x0080_0000);
        assert_eq!(hart.csrs().get(csrdef::MTVAL), 0x0080_0000);
    }

    #[test]
    fn test_interrupt_taken_before_instruction() {
        let nop = encode::i(OP_MATH_IMMEDIATE, 0, 0b000, 0, 0);
        let mut hart = hart_with_program(0x1000, &[nop]);
        hart.csrs_mut().set(csrdef::MTVEC, 0x5000);
        hart.csrs_mut()
            .set(csrdef::MIE, csrdef::InterruptBits::MachineTimer.bits());
        let mstatus = hart.csrs().mstatus() | MStatusFlags::MIE.bits();
        hart.csrs_mut().set(csrdef::MSTATUS, mstatus);

        hart.signals.raise_interrupt(riscv::trap::Interrupt::MachineTimer);
        hart.step(1);

        assert_eq!(hart.csrs().get(csrdef::MCAUSE), INTERRUPT_BIT | 7);
        assert_eq!(hart.csrs().get(csrdef::MEPC), 0x1000);
        // direct mode: the base address, regardless of cause
        assert_eq!(hart.pc(), 0x5000);
    }

    #[test]
    fn test_vectored_interrupt_dispatch() {
        let nop = encode::i(OP_MATH_IMMEDIATE, 0, 0b000, 0, 0);
        let mut hart = hart_with_program(0x1000, &[nop]);
        hart.csrs_mut().set(csrdef::MTVEC, 0x5000 | 1);
        hart.csrs_mut()
            .set(csrdef::MIE, csrdef::InterruptBits::MachineTimer.bits());
        let mstatus = hart.csrs().mstatus() | MStatusFlags::MIE.bits();
        hart.csrs_mut().set(csrdef::MSTATUS, mstatus);

        hart.signals.raise_interrupt(riscv::trap::Interrupt::MachineTimer);
        hart.step(1);
        assert_eq!(hart.pc(), 0x5000 + 4 * 7);
    }

    #[test]
    fn test_wfi_parks_until_interrupt() {
        let wfi = encode::i(OP_SYSTEM, 0, 0b000, 0, 0x105);
        let nop = encode::i(OP_MATH_IMMEDIATE, 0, 0b000, 0, 0);
        let mut hart = hart_with_program(0x1000, &[wfi, nop]);
        hart.signals.start();

        hart.step(1);
        assert!(hart.is_waiting_for_interrupt());
        assert_eq!(hart.pc(), 0x1004);

        // with nothing pending the hart refuses to advance
        assert_eq!(hart.step(1), 0);

        // any pending bit wakes it, enabled or not
        hart.signals.raise_interrupt(riscv::trap::Interrupt::MachineTimer);
        hart.step(1);
        assert!(!hart.is_waiting_for_interrupt());
        assert_eq!(hart.pc(), 0x1008);
    }

    #[test]
    fn test_ebreak_raises_breakpoint_and_pauses() {
        let ebreak = encode::i(OP_SYSTEM, 0, 0b000, 0, 1);
        let mut hart = hart_with_program(0x1000, &[ebreak]);
        hart.set_pause_on_break(true);
        hart.csrs_mut().set(csrdef::MTVEC, 0x6000);

        hart.step(1);
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 3);
        assert_eq!(hart.csrs().get(csrdef::MTVAL), 0x1000);
        assert!(hart.signals.is_paused());
    }

    #[test]
    fn test_unhandled_ecall_traps_by_mode() {
        let ecall = encode::i(OP_SYSTEM, 0, 0b000, 0, 0);
        let mut hart = hart_with_program(0x1000, &[ecall]);
        hart.set_reg(reg::A0, 0x7777); // no handler registered

        hart.step(1);
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 11);
        assert_eq!(hart.csrs().get(csrdef::MTVAL), 0);
    }

    #[test]
    fn test_counters_retire() {
        let nop = encode::i(OP_MATH_IMMEDIATE, 0, 0b000, 0, 0);
        let mut hart = hart_with_program(0x1000, &[nop, nop, nop]);
        hart.step(3);
        assert_eq!(hart.csrs().get(csrdef::MINSTRET), 3);
        assert_eq!(hart.csrs().get(csrdef::MCYCLE), 3);

        hart.csrs_mut().set(csrdef::MCOUNTINHIBIT, 0b101);
        hart.set_pc(0x1000);
        hart.step(1);
        assert_eq!(hart.csrs().get(csrdef::MINSTRET), 3);
    }

    #[test]
    fn test_fpu_off_makes_float_illegal() {
        let fadd = encode::r(riscv::instr::OP_FLOAT, 0, 0b000, 1, 2, 0b0000000);
        let mut hart = hart_with_program(0x1000, &[fadd]);

        hart.step(1);
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 2);
    }

    #[test]
    fn test_float_arithmetic_sets_dirty() {
        let fadd = encode::r(riscv::instr::OP_FLOAT, 3, 0b000, 1, 2, 0b0000000);
        let mut hart = hart_with_program(0x1000, &[fadd]);
        enable_fpu(&mut hart);
        hart.fregs_mut().set_f32(1, 1.5);
        hart.fregs_mut().set_f32(2, 2.25);

        hart.step(1);
        assert_eq!(hart.fregs().f32(3), 3.75);
        assert_eq!(csr::fs(hart.csrs().mstatus()), FloatState::Dirty);
    }

    #[test]
    fn test_invalid_rounding_mode_is_illegal() {
        // static rm = 5 is reserved
        let fadd = encode::r(riscv::instr::OP_FLOAT, 3, 0b101, 1, 2, 0b0000000);
        let mut hart = hart_with_program(0x1000, &[fadd]);
        enable_fpu(&mut hart);

        hart.step(1);
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 2);
    }

    #[test]
    fn test_float_division_by_zero_accrues_dz() {
        let fdiv = encode::r(riscv::instr::OP_FLOAT, 3, 0b000, 1, 2, 0b0001100);
        let mut hart = hart_with_program(0x1000, &[fdiv]);
        enable_fpu(&mut hart);
        hart.fregs_mut().set_f32(1, 1.0);
        hart.fregs_mut().set_f32(2, 0.0);

        hart.step(1);
        assert!(hart.fregs().f32(3).is_infinite());
        assert_eq!(
            hart.csrs().get(csrdef::FFLAGS) & csrdef::FFLAG_DZ,
            csrdef::FFLAG_DZ
        );
    }

    #[test]
    fn test_nan_result_is_canonical() {
        // 0.0 / 0.0
        let fdiv = encode::r(riscv::instr::OP_FLOAT, 3, 0b000, 1, 2, 0b0001100);
        let mut hart = hart_with_program(0x1000, &[fdiv]);
        enable_fpu(&mut hart);
        hart.fregs_mut().set_f32(1, 0.0);
        hart.fregs_mut().set_f32(2, 0.0);

        hart.step(1);
        assert_eq!(hart.fregs().f32_bits(3), crate::fpu::CANONICAL_NAN_F32);
    }

    #[test]
    fn test_cust_tva_translates() {
        let tva = encode::r(riscv::instr::OP_CUST, 5, 0, 10, 0, 0);
        let mut hart = hart_with_program(0x1000, &[tva, tva]);

        // bare mode: identity
        hart.set_reg(reg::A0, 0x2000);
        hart.step(1);
        assert_eq!(hart.reg(5), 0x2000);

        // an untranslatable address reports bit 0
        hart.set_reg(reg::A0, 0x1_0000_0000);
        hart.step(1);
        assert_eq!(hart.reg(5), 1);
    }

    #[test]
    fn test_cust_mtrap_synthesizes_machine_trap() {
        let mtrap = encode::r(riscv::instr::OP_CUST, 0, 0, 10, 11, 1);
        let mut hart = hart_with_program(0x1000, &[mtrap]);
        hart.csrs_mut().set(csrdef::MTVEC, 0x7000);
        hart.set_reg(reg::A0, 5);
        hart.set_reg(reg::A1, PrivilegeLevel::Supervisor.bits() as u64);

        hart.step(1);
        assert_eq!(hart.pc(), 0x7000);
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 5);
        // the handler returns past the synthesizing instruction
        assert_eq!(hart.csrs().get(csrdef::MEPC), 0x1004);
        assert_eq!(
            csr::mpp(hart.csrs().mstatus()),
            PrivilegeLevel::Supervisor
        );
    }

    #[test]
    fn test_sfence_flushes_and_retires() {
        let sfence = encode::r(OP_SYSTEM, 0, 0b000, 0, 0, 0b0001001);
        let mut hart = hart_with_program(0x1000, &[sfence]);
        hart.step(1);
        assert_eq!(hart.pc(), 0x1004);

        // from user mode it is illegal
        let mut hart = hart_with_program(0x1000, &[sfence]);
        hart.privilege = PrivilegeLevel::User;
        hart.step(1);
        assert_eq!(hart.csrs().get(csrdef::MCAUSE), 2);
    }

    #[test]
    fn test_breakpoint_pauses_before_execution() {
        let nop = encode::i(OP_MATH_IMMEDIATE, 0, 0b000, 0, 0);
        let mut hart = hart_with_program(0x1000, &[nop, nop, nop]);
        hart.signals.start();
        hart.set_breakpoint(0x1008);

        assert_eq!(hart.step(5), 2);
        assert_eq!(hart.pc(), 0x1008);
        assert!(hart.signals.is_paused());

        // stepping again runs past the breakpoint
        hart.signals.unpause();
        assert_eq!(hart.step(1), 1);
        assert_eq!(hart.pc(), 0x100c);
    }
}
