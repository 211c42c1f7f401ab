// SPDX-License-Identifier: Apache-2.0

//! Software MMU: the page-table walker.
//!
//! Walks are plain multi-level PTE fetches against the physical address
//! space. A successful walk yields the physical address; the hart installs
//! the containing page into the right TLB when it is RAM-backed. The walker
//! itself is stateless; everything privilege-dependent (effective mode
//! under MPRV, SUM, MXR) comes in as arguments.

use crate::mem::{read_le, AddressSpace};
use crate::trap::{Exception, Privilege, Trap};
use crate::{PAGE_MASK, PAGE_SHIFT};

/// Access kind; doubles as the TLB set index.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Exec = 0,
    Read = 1,
    Write = 2,
}

impl Access {
    pub fn page_fault(self) -> Exception {
        match self {
            Access::Exec => Exception::InstructionPageFault,
            Access::Read => Exception::LoadPageFault,
            Access::Write => Exception::StorePageFault,
        }
    }

    pub fn access_fault(self) -> Exception {
        match self {
            Access::Exec => Exception::InstructionAccessFault,
            Access::Read => Exception::LoadAccessFault,
            Access::Write => Exception::StoreAccessFault,
        }
    }

    pub fn misaligned(self) -> Exception {
        match self {
            Access::Exec => Exception::InstructionAddressMisaligned,
            Access::Read => Exception::LoadAddressMisaligned,
            Access::Write => Exception::StoreAddressMisaligned,
        }
    }
}

/// Translation modes, per the satp MODE field.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MmuMode {
    Bare,
    Sv32,
    Sv39,
    Sv48,
    Sv57,
}

impl MmuMode {
    /// Decode a satp MODE value. `None` for unsupported encodings, which a
    /// WARL satp write must ignore.
    pub fn from_satp(rv64: bool, mode: u64) -> Option<MmuMode> {
        match (rv64, mode) {
            (_, 0) => Some(MmuMode::Bare),
            (false, 1) => Some(MmuMode::Sv32),
            (true, 8) => Some(MmuMode::Sv39),
            (true, 9) => Some(MmuMode::Sv48),
            (true, 10) => Some(MmuMode::Sv57),
            _ => None,
        }
    }

    fn levels(self) -> u32 {
        match self {
            MmuMode::Bare => 0,
            MmuMode::Sv32 => 2,
            MmuMode::Sv39 => 3,
            MmuMode::Sv48 => 4,
            MmuMode::Sv57 => 5,
        }
    }

    fn vpn_bits(self) -> u32 {
        if self == MmuMode::Sv32 { 10 } else { 9 }
    }

    fn pte_size(self) -> u64 {
        if self == MmuMode::Sv32 { 4 } else { 8 }
    }

    /// Bits of usable virtual address, for the canonical-form check.
    fn va_bits(self) -> u32 {
        PAGE_SHIFT + self.levels() * self.vpn_bits()
    }
}

bitflags! {
    pub struct Pte: u64 {
        const V = 1 << 0;
        const R = 1 << 1;
        const W = 1 << 2;
        const X = 1 << 3;
        const U = 1 << 4;
        const G = 1 << 5;
        const A = 1 << 6;
        const D = 1 << 7;
    }
}

/// RV64 PTE bits 63:54 (N, PBMT, reserved) must read zero without the
/// corresponding extensions.
const PTE_RV64_RESERVED: u64 = 0xFFC0_0000_0000_0000;

/// Walk the page table for `vaddr`.
///
/// `prv` is the *effective* privilege of the access (MPRV already applied);
/// the caller never asks the walker to translate for M-mode, which is Bare
/// by construction. Returns the physical address of the accessed byte.
pub fn walk(
    mem: &AddressSpace,
    mode: MmuMode,
    root: u64,
    vaddr: u64,
    access: Access,
    prv: Privilege,
    sum: bool,
    mxr: bool,
) -> Result<u64, Trap> {
    if mode == MmuMode::Bare {
        return Ok(vaddr);
    }
    let fault = || Trap::new(access.page_fault(), vaddr);

    // Canonical form: on RV64, virtual address bits above the translated
    // range must be a sign extension of the top translated bit.
    if mode != MmuMode::Sv32 {
        let shift = 64 - mode.va_bits();
        if ((vaddr << shift) as i64 >> shift) as u64 != vaddr {
            return Err(fault());
        }
    }

    let vpn_bits = mode.vpn_bits();
    let vpn_mask = (1u64 << vpn_bits) - 1;
    let pte_size = mode.pte_size();
    let mut table = root;

    for level in (0..mode.levels()).rev() {
        let vpn = (vaddr >> (PAGE_SHIFT + level * vpn_bits)) & vpn_mask;
        let pte_addr = table + vpn * pte_size;
        let mut buf = [0u8; 8];
        if !mem.read_phys(pte_addr, &mut buf[..pte_size as usize]) {
            // PTE fetch outside RAM/MMIO is an access fault for the
            // original access type.
            return Err(Trap::new(access.access_fault(), vaddr));
        }
        let raw = read_le(&buf[..pte_size as usize]);
        if mode != MmuMode::Sv32 && raw & PTE_RV64_RESERVED != 0 {
            return Err(fault());
        }
        let pte = Pte::from_bits_truncate(raw);
        if !pte.contains(Pte::V) || (pte.contains(Pte::W) && !pte.contains(Pte::R)) {
            return Err(fault());
        }
        let ppn = (raw >> 10) & ((1u64 << 44) - 1);

        if !pte.intersects(Pte::R | Pte::X) {
            // Pointer to the next level. A/D/U on a non-leaf are reserved.
            if pte.intersects(Pte::A | Pte::D | Pte::U) {
                return Err(fault());
            }
            table = ppn << PAGE_SHIFT;
            continue;
        }

        // Leaf. Permission checks first, then superpage alignment, then
        // the A/D update.
        let allowed = match access {
            Access::Exec => pte.contains(Pte::X),
            Access::Read => pte.contains(Pte::R) || (mxr && pte.contains(Pte::X)),
            Access::Write => pte.contains(Pte::W),
        };
        if !allowed {
            return Err(fault());
        }
        match prv {
            Privilege::User => {
                if !pte.contains(Pte::U) {
                    return Err(fault());
                }
            }
            Privilege::Supervisor => {
                // S never executes U pages; S loads/stores to U pages only
                // under SUM.
                if pte.contains(Pte::U) && (access == Access::Exec || !sum) {
                    return Err(fault());
                }
            }
            Privilege::Machine => unreachable!("M-mode accesses are bare"),
        }
        let span_mask = (1u64 << (level * vpn_bits)) - 1;
        if ppn & span_mask != 0 {
            // Misaligned superpage.
            return Err(fault());
        }

        let mut set = Pte::A;
        if access == Access::Write {
            set |= Pte::D;
        }
        if !pte.contains(set) {
            // Update A/D in memory with an atomic OR so a racing walk on
            // another hart can't lose the bits.
            let ok = if pte_size == 4 {
                mem.amo_u32(pte_addr, &mut |v| v | set.bits() as u32).is_some()
            } else {
                mem.amo_u64(pte_addr, &mut |v| v | set.bits()).is_some()
            };
            if !ok {
                return Err(Trap::new(access.access_fault(), vaddr));
            }
        }

        let offset = vaddr & ((span_mask << PAGE_SHIFT) | PAGE_MASK);
        return Ok((ppn << PAGE_SHIFT) | offset);
    }
    Err(fault())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::write_le;

    const RAM: u64 = 0x8000_0000;

    fn space() -> AddressSpace {
        AddressSpace::new(RAM, 0x10_0000).unwrap()
    }

    fn set_pte64(mem: &AddressSpace, table: u64, idx: u64, ppn: u64, flags: Pte) {
        let mut buf = [0u8; 8];
        write_le(&mut buf, (ppn << 10) | flags.bits());
        assert!(mem.write_phys(table + idx * 8, &buf));
    }

    fn pte64(mem: &AddressSpace, table: u64, idx: u64) -> u64 {
        let mut buf = [0u8; 8];
        assert!(mem.read_phys(table + idx * 8, &mut buf));
        read_le(&buf)
    }

    /// One 4 KiB page mapped at va 0x4000_0000 -> RAM+0x5000 via Sv39.
    fn map_leaf(mem: &AddressSpace, flags: Pte) -> (u64, u64) {
        let root = RAM + 0x1000;
        let l1 = RAM + 0x2000;
        let l0 = RAM + 0x3000;
        let va = 0x4000_0000u64;
        set_pte64(mem, root, (va >> 30) & 0x1ff, l1 >> 12, Pte::V);
        set_pte64(mem, l1, (va >> 21) & 0x1ff, l0 >> 12, Pte::V);
        set_pte64(mem, l0, (va >> 12) & 0x1ff, (RAM + 0x5000) >> 12, flags);
        (root, va)
    }

    #[test]
    fn sv39_walk_and_accessed_bit() {
        let mem = space();
        let (root, va) = map_leaf(&mem, Pte::V | Pte::R | Pte::W);
        let pa = walk(&mem, MmuMode::Sv39, root, va + 0x123, Access::Read, Privilege::Supervisor, false, false)
            .unwrap();
        assert_eq!(pa, RAM + 0x5123);
        // The walk set A; a store also sets D.
        let l0 = RAM + 0x3000;
        assert_ne!(pte64(&mem, l0, (va >> 12) & 0x1ff) & Pte::A.bits(), 0);
        assert_eq!(pte64(&mem, l0, (va >> 12) & 0x1ff) & Pte::D.bits(), 0);
        walk(&mem, MmuMode::Sv39, root, va, Access::Write, Privilege::Supervisor, false, false).unwrap();
        assert_ne!(pte64(&mem, l0, (va >> 12) & 0x1ff) & Pte::D.bits(), 0);
    }

    #[test]
    fn perms_and_mxr_and_sum() {
        let mem = space();
        let (root, va) = map_leaf(&mem, Pte::V | Pte::X | Pte::U);
        // Execute-only: reads fault unless MXR.
        let err =
            walk(&mem, MmuMode::Sv39, root, va, Access::Read, Privilege::User, false, false).unwrap_err();
        assert_eq!(err.cause, Exception::LoadPageFault);
        assert_eq!(err.tval, va);
        walk(&mem, MmuMode::Sv39, root, va, Access::Read, Privilege::User, false, true).unwrap();
        // U page from S: needs SUM for data, never executable.
        let err = walk(&mem, MmuMode::Sv39, root, va, Access::Read, Privilege::Supervisor, false, true)
            .unwrap_err();
        assert_eq!(err.cause, Exception::LoadPageFault);
        walk(&mem, MmuMode::Sv39, root, va, Access::Read, Privilege::Supervisor, true, true).unwrap();
        let err = walk(&mem, MmuMode::Sv39, root, va, Access::Exec, Privilege::Supervisor, true, true)
            .unwrap_err();
        assert_eq!(err.cause, Exception::InstructionPageFault);
    }

    #[test]
    fn superpage_alignment() {
        let mem = space();
        let root = RAM + 0x1000;
        let va = 0x4000_0000u64;
        // 1 GiB leaf at level 2 with misaligned ppn faults.
        set_pte64(&mem, root, (va >> 30) & 0x1ff, (RAM + 0x5000) >> 12, Pte::V | Pte::R);
        let err =
            walk(&mem, MmuMode::Sv39, root, va, Access::Read, Privilege::Supervisor, false, false)
                .unwrap_err();
        assert_eq!(err.cause, Exception::LoadPageFault);
        // Aligned gigapage translates with the low 30 bits passed through.
        set_pte64(&mem, root, (va >> 30) & 0x1ff, RAM >> 12, Pte::V | Pte::R);
        let pa = walk(&mem, MmuMode::Sv39, root, va + 0x1_2345, Access::Read, Privilege::Supervisor, false, false)
            .unwrap();
        assert_eq!(pa, RAM + 0x1_2345);
    }

    #[test]
    fn non_canonical_addresses_fault() {
        let mem = space();
        let (root, _) = map_leaf(&mem, Pte::V | Pte::R);
        let err = walk(
            &mem,
            MmuMode::Sv39,
            root,
            1u64 << 40,
            Access::Read,
            Privilege::Supervisor,
            false,
            false,
        )
        .unwrap_err();
        assert_eq!(err.cause, Exception::LoadPageFault);
    }

    #[test]
    fn reserved_bits_fault() {
        let mem = space();
        let root = RAM + 0x1000;
        let va = 0x4000_0000u64;
        let mut buf = [0u8; 8];
        write_le(&mut buf, (1u64 << 63) | ((RAM >> 12) << 10) | (Pte::V | Pte::R).bits());
        assert!(mem.write_phys(root + ((va >> 30) & 0x1ff) * 8, &buf));
        let err =
            walk(&mem, MmuMode::Sv39, root, va, Access::Read, Privilege::Supervisor, false, false)
                .unwrap_err();
        assert_eq!(err.cause, Exception::LoadPageFault);
    }

    #[test]
    fn sv32_two_level_walk() {
        let mem = space();
        let root = RAM + 0x1000;
        let l0 = RAM + 0x2000;
        let va = 0x4001_2000u64;
        let mut buf = [0u8; 4];
        write_le(&mut buf, ((l0 >> 12) << 10) | Pte::V.bits());
        assert!(mem.write_phys(root + ((va >> 22) & 0x3ff) * 4, &buf));
        write_le(&mut buf, (((RAM + 0x6000) >> 12) << 10) | (Pte::V | Pte::R | Pte::U).bits());
        assert!(mem.write_phys(l0 + ((va >> 12) & 0x3ff) * 4, &buf));
        let pa = walk(&mem, MmuMode::Sv32, root, va + 0x44, Access::Read, Privilege::User, false, false)
            .unwrap();
        assert_eq!(pa, RAM + 0x6044);
    }

    #[test]
    fn satp_mode_decoding() {
        assert_eq!(MmuMode::from_satp(true, 8), Some(MmuMode::Sv39));
        assert_eq!(MmuMode::from_satp(true, 1), None);
        assert_eq!(MmuMode::from_satp(false, 1), Some(MmuMode::Sv32));
        assert_eq!(MmuMode::from_satp(false, 8), None);
        assert_eq!(MmuMode::from_satp(true, 0), Some(MmuMode::Bare));
    }
}
