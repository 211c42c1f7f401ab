// SPDX-License-Identifier: Apache-2.0

//! A extension: LR/SC and AMOs.
//!
//! AMOs are physical read-modify-writes over the address map: host atomics
//! on RAM cells, a synthesized read/write pair under the region mutex on
//! MMIO. The LR/SC reservation records the physical address and the value
//! LR observed; SC is a compare-and-swap, so a clobbering store from any
//! hart fails the pair even when the reservation bookkeeping survived.

use super::*;
use crate::decode::*;
use crate::hart::{Hart, Reservation};
use crate::mmu::Access;
use crate::trap::{Exception, Trap};

pub fn populate<const RV64: bool>(dec: &mut Decoder) {
    dec.set(OP_AMO, 2, amo_w::<RV64>);
    if RV64 {
        dec.set(OP_AMO, 3, amo_d);
    }
}

const F5_LR: u32 = 0x02;
const F5_SC: u32 = 0x03;
const F5_AMOSWAP: u32 = 0x01;
const F5_AMOADD: u32 = 0x00;
const F5_AMOXOR: u32 = 0x04;
const F5_AMOAND: u32 = 0x0C;
const F5_AMOOR: u32 = 0x08;
const F5_AMOMIN: u32 = 0x10;
const F5_AMOMAX: u32 = 0x14;
const F5_AMOMINU: u32 = 0x18;
const F5_AMOMAXU: u32 = 0x1C;

fn amo_w<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)));
    if addr & 3 != 0 {
        return Err(Trap::new(Exception::StoreAddressMisaligned, addr));
    }
    let funct5 = insn >> 27;
    match funct5 {
        F5_LR => {
            if rs2(insn) != 0 {
                return Err(Trap::illegal(insn));
            }
            let paddr = hart.translate_phys(addr, Access::Read)?;
            let value = hart.load_u32(addr)? as i32 as i64 as u64;
            hart.reservation = Some(Reservation { paddr, value, wide: false });
            hart.set_x(rd(insn), value);
        }
        F5_SC => {
            let res = hart.reservation.take();
            let paddr = hart.translate_phys(addr, Access::Write)?;
            let success = match res {
                Some(res) if !res.wide && res.paddr == paddr => {
                    let new = hart.x(rs2(insn)) as u32;
                    hart.mem
                        .cas_u32(paddr, res.value as u32, new)
                        .ok_or(Trap::new(Exception::StoreAccessFault, addr))?
                }
                _ => false,
            };
            hart.set_x(rd(insn), (!success) as u64);
        }
        _ => {
            let src = hart.x(rs2(insn)) as u32;
            let op: fn(u32, u32) -> u32 = match funct5 {
                F5_AMOSWAP => |_old, src| src,
                F5_AMOADD => |old, src| old.wrapping_add(src),
                F5_AMOXOR => |old, src| old ^ src,
                F5_AMOAND => |old, src| old & src,
                F5_AMOOR => |old, src| old | src,
                F5_AMOMIN => |old, src| (old as i32).min(src as i32) as u32,
                F5_AMOMAX => |old, src| (old as i32).max(src as i32) as u32,
                F5_AMOMINU => |old, src| old.min(src),
                F5_AMOMAXU => |old, src| old.max(src),
                _ => return Err(Trap::illegal(insn)),
            };
            let paddr = hart.translate_phys(addr, Access::Write)?;
            let old = hart
                .mem
                .amo_u32(paddr, &mut |v| op(v, src))
                .ok_or(Trap::new(Exception::StoreAccessFault, addr))?;
            hart.set_x(rd(insn), old as i32 as i64 as u64);
        }
    }
    hart.advance(4);
    Ok(())
}

fn amo_d(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)));
    if addr & 7 != 0 {
        return Err(Trap::new(Exception::StoreAddressMisaligned, addr));
    }
    let funct5 = insn >> 27;
    match funct5 {
        F5_LR => {
            if rs2(insn) != 0 {
                return Err(Trap::illegal(insn));
            }
            let paddr = hart.translate_phys(addr, Access::Read)?;
            let value = hart.load_u64(addr)?;
            hart.reservation = Some(Reservation { paddr, value, wide: true });
            hart.set_x(rd(insn), value);
        }
        F5_SC => {
            let res = hart.reservation.take();
            let paddr = hart.translate_phys(addr, Access::Write)?;
            let success = match res {
                Some(res) if res.wide && res.paddr == paddr => hart
                    .mem
                    .cas_u64(paddr, res.value, hart.x(rs2(insn)))
                    .ok_or(Trap::new(Exception::StoreAccessFault, addr))?,
                _ => false,
            };
            hart.set_x(rd(insn), (!success) as u64);
        }
        _ => {
            let src = hart.x(rs2(insn));
            let op: fn(u64, u64) -> u64 = match funct5 {
                F5_AMOSWAP => |_old, src| src,
                F5_AMOADD => |old, src| old.wrapping_add(src),
                F5_AMOXOR => |old, src| old ^ src,
                F5_AMOAND => |old, src| old & src,
                F5_AMOOR => |old, src| old | src,
                F5_AMOMIN => |old, src| (old as i64).min(src as i64) as u64,
                F5_AMOMAX => |old, src| (old as i64).max(src as i64) as u64,
                F5_AMOMINU => |old, src| old.min(src),
                F5_AMOMAXU => |old, src| old.max(src),
                _ => return Err(Trap::illegal(insn)),
            };
            let paddr = hart.translate_phys(addr, Access::Write)?;
            let old = hart
                .mem
                .amo_u64(paddr, &mut |v| op(v, src))
                .ok_or(Trap::new(Exception::StoreAccessFault, addr))?;
            hart.set_x(rd(insn), old);
        }
    }
    hart.advance(4);
    Ok(())
}
