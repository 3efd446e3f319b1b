//! Virtual address translation
//!
//! A software walker for the two-level Sv32 tables described by `satp`,
//! fronted by a 16 entry TLB with round-robin replacement. Translation is
//! bypassed entirely in machine mode and while `satp` selects Bare.
//!
//! The cache keys on the virtual page number (the superpage number for 4 MiB
//! leaves) and stores the leaf entry together with its physical location so
//! the accessed/dirty bits can be written back without a second walk.

use riscv::csr::{self, MStatusFlags};
use riscv::pte::{vpn_segments, EntryFlags, PageTableEntry};
use riscv::trap::Exception;
use riscv::PrivilegeLevel;

use crate::csrfile::CsrFile;
use crate::mem::{AmoOp, Memory};
use crate::Fault;

pub const TLB_CACHE_SIZE: usize = 16;

/// What the access wants to do with the translated address.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AccessType {
    Read,
    Write,
    Execute,
}

impl AccessType {
    /// The page fault cause matching this access type.
    pub fn page_fault(self) -> Exception {
        match self {
            AccessType::Read => Exception::LoadPageFault,
            AccessType::Write => Exception::StorePageFault,
            AccessType::Execute => Exception::InstructionPageFault,
        }
    }

    /// The access fault cause matching this access type.
    pub fn access_fault(self) -> Exception {
        match self {
            AccessType::Read => Exception::LoadAccessFault,
            AccessType::Write => Exception::StoreAccessFault,
            AccessType::Execute => Exception::InstructionAccessFault,
        }
    }

    /// The misalignment cause matching this access type.
    pub fn misaligned(self) -> Exception {
        match self {
            AccessType::Read => Exception::LoadAddressMisaligned,
            AccessType::Write => Exception::StoreAddressMisaligned,
            AccessType::Execute => Exception::InstructionAddressMisaligned,
        }
    }
}

#[derive(Debug, Copy, Clone)]
struct TlbSlot {
    valid: bool,
    superpage: bool,
    /// Virtual page number, or superpage number for 4 MiB leaves.
    tag: u32,
    /// The cached leaf entry.
    entry: PageTableEntry,
    /// Physical address of the leaf entry, for A/D write-back.
    entry_address: u32,
}

impl TlbSlot {
    const EMPTY: TlbSlot = TlbSlot {
        valid: false,
        superpage: false,
        tag: 0,
        entry: PageTableEntry::from_raw(0),
        entry_address: 0,
    };

    fn matches(&self, vaddr: u32) -> bool {
        self.valid
            && if self.superpage {
                self.tag == vaddr >> 22
            } else {
                self.tag == vaddr >> 12
            }
    }
}

#[derive(Debug)]
pub struct Translator {
    cache: [TlbSlot; TLB_CACHE_SIZE],
    round_robin: usize,
}

impl Translator {
    pub fn new() -> Self {
        Translator {
            cache: [TlbSlot::EMPTY; TLB_CACHE_SIZE],
            round_robin: 0,
        }
    }

    /// Drop every cached translation. Required after SFENCE.VMA and friends,
    /// stores to `satp`, and privilege level changes.
    pub fn flush(&mut self) {
        self.cache = [TlbSlot::EMPTY; TLB_CACHE_SIZE];
    }

    /// Resolve a virtual address for the given access, performing permission
    /// checks and A/D maintenance. Returns the physical address.
    pub fn translate(
        &mut self,
        memory: &Memory,
        csrs: &CsrFile,
        privilege: PrivilegeLevel,
        vaddr: u64,
        access: AccessType,
        is_amo: bool,
    ) -> Result<u32, Fault> {
        let mstatus = csrs.mstatus();

        // MPRV redirects data accesses to the privilege stacked in MPP
        let mut effective = privilege;
        if access != AccessType::Execute
            && privilege == PrivilegeLevel::Machine
            && mstatus & MStatusFlags::MPRIV.bits() != 0
        {
            effective = csr::mpp(mstatus);
        }

        let satp = csrs.satp();
        if effective == PrivilegeLevel::Machine || !satp.enabled {
            return u32::try_from(vaddr).map_err(|_| Fault::new(access.access_fault(), vaddr));
        }

        // only the low 32 bits of the virtual address take part in Sv32
        let va = vaddr as u32;
        let fault = || Fault::new(access.page_fault(), vaddr);

        let slot = match self.lookup(va, is_amo) {
            Some(slot) => slot,
            None => self.walk(memory, satp.ppn, va).ok_or_else(fault)?,
        };

        self.check_permissions(slot, effective, mstatus, access)
            .then_some(())
            .ok_or_else(fault)?;

        self.update_accessed_dirty(memory, slot, access)
            .ok_or_else(fault)?;

        Ok(self.cache[slot].entry.translate(va, self.cache[slot].superpage))
    }

    fn lookup(&self, va: u32, is_amo: bool) -> Option<usize> {
        if is_amo {
            // AMO permission decisions must come from the live tables
            return None;
        }
        self.cache.iter().position(|slot| slot.matches(va))
    }

    /// Walk the tables and install the leaf in the next round-robin slot.
    /// Returns the slot index, or `None` for any walk failure.
    fn walk(&mut self, memory: &Memory, root_ppn: u32, va: u32) -> Option<usize> {
        let vpn = vpn_segments(va);
        let root = root_ppn << 12;

        let e1_address = root.checked_add(4 * vpn[1])?;
        let e1 = PageTableEntry::from_raw(memory.read_word(e1_address).ok()?);
        if !e1.is_valid() || e1.is_malformed() {
            return None;
        }

        let (leaf, leaf_address, superpage) = if e1.is_leaf() {
            // a first level leaf maps 4 MiB and must be aligned to it
            if e1.ppn0() != 0 {
                return None;
            }
            (e1, e1_address, true)
        } else {
            let e0_address = e1.table_address().checked_add(4 * vpn[0])?;
            let e0 = PageTableEntry::from_raw(memory.read_word(e0_address).ok()?);
            if !e0.is_valid() || e0.is_malformed() || !e0.is_leaf() {
                return None;
            }
            (e0, e0_address, false)
        };

        let index = self.round_robin;
        self.round_robin = (self.round_robin + 1) % TLB_CACHE_SIZE;

        log::trace!(
            "tlb install [{index}] va {va:#010x} -> {:?} (super {superpage})",
            leaf
        );

        self.cache[index] = TlbSlot {
            valid: true,
            superpage,
            tag: if superpage { va >> 22 } else { va >> 12 },
            entry: leaf,
            entry_address: leaf_address,
        };
        Some(index)
    }

    fn check_permissions(
        &self,
        slot: usize,
        privilege: PrivilegeLevel,
        mstatus: u64,
        access: AccessType,
    ) -> bool {
        let flags = self.cache[slot].entry.flags();
        let user_page = flags.contains(EntryFlags::User);

        match privilege {
            PrivilegeLevel::User => {
                if !user_page {
                    return false;
                }
            }
            _ => {
                if user_page {
                    // supervisor touches user pages only via SUM, never for
                    // instruction fetch
                    if access == AccessType::Execute
                        || mstatus & MStatusFlags::SUM.bits() == 0
                    {
                        return false;
                    }
                }
            }
        }

        match access {
            AccessType::Execute => flags.contains(EntryFlags::Execute),
            AccessType::Read => {
                flags.contains(EntryFlags::Read)
                    || (flags.contains(EntryFlags::Execute)
                        && mstatus & MStatusFlags::MXR.bits() != 0)
            }
            AccessType::Write => flags.contains(EntryFlags::Write),
        }
    }

    /// Mark the leaf accessed (and dirty on writes) in guest memory, under
    /// the region lock of the table.
    fn update_accessed_dirty(
        &mut self,
        memory: &Memory,
        slot: usize,
        access: AccessType,
    ) -> Option<()> {
        let mut wanted = EntryFlags::Accessed;
        if access == AccessType::Write {
            wanted |= EntryFlags::Dirty;
        }

        if self.cache[slot].entry.flags().contains(wanted) {
            return Some(());
        }

        let entry_address = self.cache[slot].entry_address;
        memory.amo_word(entry_address, AmoOp::Or, wanted.bits()).ok()?;
        self.cache[slot].entry = self.cache[slot].entry.with_flags(wanted);
        Some(())
    }
}

impl Default for Translator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mem::Region;
    use riscv::csr::SatpData;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    use crate::mem::MachineTimer;

    const ROOT: u32 = 0x0000_4000;

    fn machine() -> (Memory, CsrFile) {
        let mut memory = Memory::new();
        memory.add_region(Region::ram(0x1000, 0x100_0000));
        let csrs = CsrFile::new(
            0,
            Arc::new(AtomicU64::new(0)),
            Arc::new(MachineTimer::new()),
        );
        (memory, csrs)
    }

    fn enable_sv32(csrs: &mut CsrFile) {
        csrs.set(
            riscv::csr::SATP,
            SatpData {
                ppn: ROOT >> 12,
                asid: 0,
                enabled: true,
            }
            .into(),
        );
    }

    fn map_page(memory: &Memory, va: u32, pa: u32, flags: EntryFlags) {
        let vpn = vpn_segments(va);
        // second level table lives right after the root table
        let l0_table = ROOT + 0x1000 + (vpn[1] << 12);

        let e1 = (l0_table >> 12) << 10 | EntryFlags::Valid.bits();
        memory.write_word(ROOT + 4 * vpn[1], e1).unwrap();

        let e0 = (pa >> 12) << 10 | (flags | EntryFlags::Valid).bits();
        memory.write_word(l0_table + 4 * vpn[0], e0).unwrap();
    }

    #[test]
    fn test_machine_mode_bypasses_translation() {
        let (memory, mut csrs) = machine();
        enable_sv32(&mut csrs);
        let mut tr = Translator::new();

        let pa = tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Machine,
                0xdead_b000,
                AccessType::Read,
                false,
            )
            .unwrap();
        assert_eq!(pa, 0xdead_b000);
    }

    #[test]
    fn test_bare_mode_rejects_wide_addresses() {
        let (memory, csrs) = machine();
        let mut tr = Translator::new();

        let fault = tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Machine,
                0x1_0000_0000,
                AccessType::Read,
                false,
            )
            .unwrap_err();
        assert_eq!(fault.cause, Exception::LoadAccessFault);
    }

    #[test]
    fn test_two_level_walk() {
        let (memory, mut csrs) = machine();
        enable_sv32(&mut csrs);
        let mut tr = Translator::new();

        map_page(&memory, 0x0040_0000, 0x0080_0000, EntryFlags::RWX);

        let pa = tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0abc,
                AccessType::Read,
                false,
            )
            .unwrap();
        assert_eq!(pa, 0x0080_0abc);

        // a second translation takes the cached path and agrees
        let pa2 = tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0abc,
                AccessType::Read,
                false,
            )
            .unwrap();
        assert_eq!(pa, pa2);
    }

    #[test]
    fn test_execute_needs_x() {
        let (memory, mut csrs) = machine();
        enable_sv32(&mut csrs);
        let mut tr = Translator::new();

        map_page(&memory, 0x0040_0000, 0x0080_0000, EntryFlags::Read);

        let fault = tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0000,
                AccessType::Execute,
                false,
            )
            .unwrap_err();
        assert_eq!(fault.cause, Exception::InstructionPageFault);
        assert_eq!(fault.tval, 0x0040_0000);
    }

    #[test]
    fn test_mxr_makes_executable_readable() {
        let (memory, mut csrs) = machine();
        enable_sv32(&mut csrs);
        let mut tr = Translator::new();

        map_page(&memory, 0x0040_0000, 0x0080_0000, EntryFlags::Execute);

        assert!(tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0000,
                AccessType::Read,
                false,
            )
            .is_err());

        let mstatus = csrs.mstatus() | MStatusFlags::MXR.bits();
        csrs.set(riscv::csr::MSTATUS, mstatus);
        tr.flush();

        assert!(tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0000,
                AccessType::Read,
                false,
            )
            .is_ok());
    }

    #[test]
    fn test_user_page_supervisor_access_needs_sum() {
        let (memory, mut csrs) = machine();
        enable_sv32(&mut csrs);
        let mut tr = Translator::new();

        map_page(
            &memory,
            0x0040_0000,
            0x0080_0000,
            EntryFlags::Read | EntryFlags::User,
        );

        assert!(tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0000,
                AccessType::Read,
                false,
            )
            .is_err());

        let mstatus = csrs.mstatus() | MStatusFlags::SUM.bits();
        csrs.set(riscv::csr::MSTATUS, mstatus);
        tr.flush();

        assert!(tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0000,
                AccessType::Read,
                false,
            )
            .is_ok());

        // but never for instruction fetches
        let fault = tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0000,
                AccessType::Execute,
                false,
            )
            .unwrap_err();
        assert_eq!(fault.cause, Exception::InstructionPageFault);
    }

    #[test]
    fn test_user_needs_user_bit() {
        let (memory, mut csrs) = machine();
        enable_sv32(&mut csrs);
        let mut tr = Translator::new();

        map_page(&memory, 0x0040_0000, 0x0080_0000, EntryFlags::RWX);

        let fault = tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::User,
                0x0040_0000,
                AccessType::Read,
                false,
            )
            .unwrap_err();
        assert_eq!(fault.cause, Exception::LoadPageFault);
    }

    #[test]
    fn test_superpage_translation_and_alignment() {
        let (memory, mut csrs) = machine();
        enable_sv32(&mut csrs);
        let mut tr = Translator::new();

        // map the 4 MiB superpage at va 0x0080_0000 to pa 0x0040_0000
        let vpn1 = 0x0080_0000 >> 22;
        let e1 = ((0x0040_0000u32 >> 12) << 10) | (EntryFlags::RWX | EntryFlags::Valid).bits();
        memory.write_word(ROOT + 4 * vpn1, e1).unwrap();

        let pa = tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0090_1234,
                AccessType::Read,
                false,
            )
            .unwrap();
        assert_eq!(pa, 0x0050_1234);

        // a misaligned superpage (ppn0 != 0) faults
        let vpn1 = 0x00c0_0000 >> 22;
        let bad = ((0x0040_1000u32 >> 12) << 10) | (EntryFlags::RWX | EntryFlags::Valid).bits();
        memory.write_word(ROOT + 4 * vpn1, bad).unwrap();
        assert!(tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x00c0_0000,
                AccessType::Read,
                false,
            )
            .is_err());
    }

    #[test]
    fn test_accessed_dirty_write_back() {
        let (memory, mut csrs) = machine();
        enable_sv32(&mut csrs);
        let mut tr = Translator::new();

        map_page(&memory, 0x0040_0000, 0x0080_0000, EntryFlags::RWX);
        let vpn = vpn_segments(0x0040_0000);
        let entry_address = ROOT + 0x1000 + (vpn[1] << 12) + 4 * vpn[0];

        tr.translate(
            &memory,
            &csrs,
            PrivilegeLevel::Supervisor,
            0x0040_0000,
            AccessType::Read,
            false,
        )
        .unwrap();
        let entry = PageTableEntry::from_raw(memory.read_word(entry_address).unwrap());
        assert!(entry.flags().contains(EntryFlags::Accessed));
        assert!(!entry.flags().contains(EntryFlags::Dirty));

        tr.translate(
            &memory,
            &csrs,
            PrivilegeLevel::Supervisor,
            0x0040_0000,
            AccessType::Write,
            false,
        )
        .unwrap();
        let entry = PageTableEntry::from_raw(memory.read_word(entry_address).unwrap());
        assert!(entry.flags().contains(EntryFlags::Dirty));
    }

    #[test]
    fn test_amo_bypasses_cache() {
        let (memory, mut csrs) = machine();
        enable_sv32(&mut csrs);
        let mut tr = Translator::new();

        map_page(&memory, 0x0040_0000, 0x0080_0000, EntryFlags::RWX);
        tr.translate(
            &memory,
            &csrs,
            PrivilegeLevel::Supervisor,
            0x0040_0000,
            AccessType::Write,
            false,
        )
        .unwrap();

        // revoke write permission behind the cache's back
        let vpn = vpn_segments(0x0040_0000);
        let entry_address = ROOT + 0x1000 + (vpn[1] << 12) + 4 * vpn[0];
        let e0 = ((0x0080_0000u32 >> 12) << 10) | (EntryFlags::Read | EntryFlags::Valid).bits();
        memory.write_word(entry_address, e0).unwrap();

        // a cached ordinary write still succeeds, the amo path must not
        assert!(tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0000,
                AccessType::Write,
                false,
            )
            .is_ok());
        assert!(tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0000,
                AccessType::Write,
                true,
            )
            .is_err());
    }

    #[test]
    fn test_round_robin_eviction() {
        let (memory, mut csrs) = machine();
        enable_sv32(&mut csrs);
        let mut tr = Translator::new();

        // fill more slots than the cache holds
        for i in 0..(TLB_CACHE_SIZE as u32 + 2) {
            let va = 0x0040_0000 + i * 0x1000;
            map_page(&memory, va, 0x0080_0000 + i * 0x1000, EntryFlags::RWX);
            tr.translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                va as u64,
                AccessType::Read,
                false,
            )
            .unwrap();
        }

        // the first mapping was evicted but still translates via a re-walk
        let pa = tr
            .translate(
                &memory,
                &csrs,
                PrivilegeLevel::Supervisor,
                0x0040_0000,
                AccessType::Read,
                false,
            )
            .unwrap();
        assert_eq!(pa, 0x0080_0000);
    }
}
