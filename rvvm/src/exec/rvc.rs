// SPDX-License-Identifier: Apache-2.0

//! C extension: compressed instructions.
//!
//! Handlers decode the compressed immediates directly and execute in place
//! rather than re-encoding to 32-bit forms; each one advances `pc` by 2.

use super::*;
use crate::decode::*;
use crate::fpu;
use crate::hart::Hart;
use crate::trap::{Exception, Trap};

pub fn populate<const RV64: bool>(dec: &mut Decoder, fpu_on: bool) {
    // Quadrant 0.
    dec.set_c(0, 0, c_addi4spn);
    dec.set_c(0, 2, c_lw);
    dec.set_c(0, 6, c_sw);
    if RV64 {
        dec.set_c(0, 3, c_ld);
        dec.set_c(0, 7, c_sd);
    }
    if fpu_on {
        dec.set_c(0, 1, c_fld);
        dec.set_c(0, 5, c_fsd);
        if !RV64 {
            dec.set_c(0, 3, c_flw);
            dec.set_c(0, 7, c_fsw);
        }
    }

    // Quadrant 1.
    dec.set_c(1, 0, c_addi::<RV64>);
    if RV64 {
        dec.set_c(1, 1, c_addiw);
    } else {
        dec.set_c(1, 1, c_jal);
    }
    dec.set_c(1, 2, c_li::<RV64>);
    dec.set_c(1, 3, c_lui_addi16sp::<RV64>);
    dec.set_c(1, 4, c_misc_alu::<RV64>);
    dec.set_c(1, 5, c_j);
    dec.set_c(1, 6, c_beqz);
    dec.set_c(1, 7, c_bnez);

    // Quadrant 2.
    dec.set_c(2, 0, c_slli::<RV64>);
    dec.set_c(2, 2, c_lwsp);
    dec.set_c(2, 4, c_jr_mv_add::<RV64>);
    dec.set_c(2, 6, c_swsp);
    if RV64 {
        dec.set_c(2, 3, c_ldsp);
        dec.set_c(2, 7, c_sdsp);
    }
    if fpu_on {
        dec.set_c(2, 1, c_fldsp);
        dec.set_c(2, 5, c_fsdsp);
        if !RV64 {
            dec.set_c(2, 3, c_flwsp);
            dec.set_c(2, 7, c_fswsp);
        }
    }
}

// Register fields: the prime forms address x8..x15.

#[inline]
fn rdp(insn: u32) -> usize {
    8 + ((insn >> 2) & 7) as usize
}

#[inline]
fn rs1p(insn: u32) -> usize {
    8 + ((insn >> 7) & 7) as usize
}

#[inline]
fn rfull(insn: u32) -> usize {
    ((insn >> 7) & 31) as usize
}

#[inline]
fn rs2full(insn: u32) -> usize {
    ((insn >> 2) & 31) as usize
}

/// CI-format 6-bit signed immediate: insn[12] | insn[6:2].
#[inline]
fn imm6(insn: u32) -> u64 {
    sext((((insn >> 7) & 0x20) | ((insn >> 2) & 0x1F)) as u64, 6)
}

/// CL/CS scaled offsets.
#[inline]
fn off_w(insn: u32) -> u64 {
    // uimm[5:3]=insn[12:10], uimm[2]=insn[6], uimm[6]=insn[5]
    (((insn >> 7) & 0x38) | ((insn >> 4) & 0x4) | ((insn << 1) & 0x40)) as u64
}

#[inline]
fn off_d(insn: u32) -> u64 {
    // uimm[5:3]=insn[12:10], uimm[7:6]=insn[6:5]
    (((insn >> 7) & 0x38) | ((insn << 1) & 0xC0)) as u64
}

/// CJ-format 12-bit signed jump offset.
fn imm_cj(insn: u32) -> u64 {
    let imm = ((insn >> 1) & 0x800)
        | ((insn >> 7) & 0x10)
        | ((insn >> 1) & 0x300)
        | ((insn << 2) & 0x400)
        | ((insn >> 1) & 0x40)
        | ((insn << 1) & 0x80)
        | ((insn >> 2) & 0xE)
        | ((insn << 3) & 0x20);
    sext(imm as u64, 12)
}

/// CB-format 9-bit signed branch offset.
fn imm_cb(insn: u32) -> u64 {
    let imm = ((insn >> 4) & 0x100)
        | ((insn >> 7) & 0x18)
        | ((insn << 1) & 0xC0)
        | ((insn >> 2) & 0x6)
        | ((insn << 3) & 0x20);
    sext(imm as u64, 9)
}

fn c_addi4spn(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let imm = (((insn >> 1) & 0x3C0)
        | ((insn >> 7) & 0x30)
        | ((insn >> 2) & 0x8)
        | ((insn >> 4) & 0x4)) as u64;
    if imm == 0 {
        // Covers the canonical all-zero illegal encoding.
        return Err(Trap::illegal(insn));
    }
    let val = hart.x(2).wrapping_add(imm);
    hart.set_x(rdp(insn), val);
    hart.advance(2);
    Ok(())
}

fn c_lw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1p(insn)).wrapping_add(off_w(insn)));
    let val = hart.load_u32(addr)? as i32 as i64 as u64;
    hart.set_x(rdp(insn), val);
    hart.advance(2);
    Ok(())
}

fn c_ld(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1p(insn)).wrapping_add(off_d(insn)));
    let val = hart.load_u64(addr)?;
    hart.set_x(rdp(insn), val);
    hart.advance(2);
    Ok(())
}

fn c_sw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1p(insn)).wrapping_add(off_w(insn)));
    hart.store_u32(addr, hart.x(rdp(insn)) as u32)?;
    hart.advance(2);
    Ok(())
}

fn c_sd(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1p(insn)).wrapping_add(off_d(insn)));
    hart.store_u64(addr, hart.x(rdp(insn)))?;
    hart.advance(2);
    Ok(())
}

fn c_fld(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1p(insn)).wrapping_add(off_d(insn)));
    let val = hart.load_u64(addr)?;
    hart.fregs[rdp(insn)] = val;
    hart.csr.set_fs_dirty();
    hart.advance(2);
    Ok(())
}

fn c_fsd(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1p(insn)).wrapping_add(off_d(insn)));
    hart.store_u64(addr, hart.fregs[rdp(insn)])?;
    hart.advance(2);
    Ok(())
}

fn c_flw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1p(insn)).wrapping_add(off_w(insn)));
    let val = hart.load_u32(addr)?;
    hart.fregs[rdp(insn)] = fpu::nan_box(val);
    hart.csr.set_fs_dirty();
    hart.advance(2);
    Ok(())
}

fn c_fsw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1p(insn)).wrapping_add(off_w(insn)));
    hart.store_u32(addr, hart.fregs[rdp(insn)] as u32)?;
    hart.advance(2);
    Ok(())
}

fn c_addi<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    // rd=0 or imm=0 are C.NOP/hints; execute as a plain no-op add.
    let r = rfull(insn);
    let val = hart.x(r).wrapping_add(imm6(insn));
    hart.set_x(r, sext_xlen::<RV64>(val));
    hart.advance(2);
    Ok(())
}

fn c_addiw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let r = rfull(insn);
    if r == 0 {
        return Err(Trap::illegal(insn));
    }
    let val = hart.x(r).wrapping_add(imm6(insn)) as i32 as i64 as u64;
    hart.set_x(r, val);
    hart.advance(2);
    Ok(())
}

fn c_jal(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let target = hart.pc.wrapping_add(imm_cj(insn));
    hart.set_x(1, hart.pc.wrapping_add(2));
    hart.set_pc(target);
    Ok(())
}

fn c_li<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    hart.set_x(rfull(insn), sext_xlen::<RV64>(imm6(insn)));
    hart.advance(2);
    Ok(())
}

fn c_lui_addi16sp<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let r = rfull(insn);
    if r == 2 {
        // C.ADDI16SP: imm[9|4|6|8:7|5] scaled by 16.
        let imm = sext(
            (((insn >> 3) & 0x200)
                | ((insn >> 2) & 0x10)
                | ((insn << 1) & 0x40)
                | ((insn << 4) & 0x180)
                | ((insn << 3) & 0x20)) as u64,
            10,
        );
        if imm == 0 {
            return Err(Trap::illegal(insn));
        }
        let val = hart.x(2).wrapping_add(imm);
        hart.set_x(2, sext_xlen::<RV64>(val));
    } else {
        let imm = sext((((insn << 5) & 0x2_0000) | ((insn << 10) & 0x1_F000)) as u64, 18);
        if imm == 0 {
            return Err(Trap::illegal(insn));
        }
        hart.set_x(r, sext_xlen::<RV64>(imm));
    }
    hart.advance(2);
    Ok(())
}

fn c_shamt<const RV64: bool>(insn: u32) -> Result<u32, Trap> {
    let sh = ((insn >> 7) & 0x20) | ((insn >> 2) & 0x1F);
    if !RV64 && sh & 0x20 != 0 {
        return Err(Trap::illegal(insn));
    }
    Ok(sh)
}

fn c_misc_alu<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let r = rs1p(insn);
    match (insn >> 10) & 3 {
        0 => {
            let sh = c_shamt::<RV64>(insn)?;
            let val =
                if RV64 { hart.x(r) >> sh } else { ((hart.x(r) as u32) >> sh) as u64 };
            hart.set_x(r, sext_xlen::<RV64>(val));
        }
        1 => {
            let sh = c_shamt::<RV64>(insn)?;
            let val = if RV64 {
                ((hart.x(r) as i64) >> sh) as u64
            } else {
                ((hart.x(r) as i32) >> sh) as i64 as u64
            };
            hart.set_x(r, sext_xlen::<RV64>(val));
        }
        2 => {
            let val = hart.x(r) & imm6(insn);
            hart.set_x(r, sext_xlen::<RV64>(val));
        }
        _ => {
            let b = hart.x(rdp(insn));
            let a = hart.x(r);
            let wide = insn & (1 << 12) != 0;
            let val = match ((insn >> 5) & 3, wide) {
                (0, false) => sext_xlen::<RV64>(a.wrapping_sub(b)),
                (1, false) => sext_xlen::<RV64>(a ^ b),
                (2, false) => sext_xlen::<RV64>(a | b),
                (3, false) => sext_xlen::<RV64>(a & b),
                (0, true) if RV64 => (a as u32).wrapping_sub(b as u32) as i32 as i64 as u64,
                (1, true) if RV64 => (a as u32).wrapping_add(b as u32) as i32 as i64 as u64,
                _ => return Err(Trap::illegal(insn)),
            };
            hart.set_x(r, val);
        }
    }
    hart.advance(2);
    Ok(())
}

fn c_j(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let target = hart.pc.wrapping_add(imm_cj(insn));
    hart.set_pc(target);
    Ok(())
}

fn c_beqz(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if hart.x(rs1p(insn)) == 0 {
        let target = hart.pc.wrapping_add(imm_cb(insn));
        hart.set_pc(target);
    } else {
        hart.advance(2);
    }
    Ok(())
}

fn c_bnez(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if hart.x(rs1p(insn)) != 0 {
        let target = hart.pc.wrapping_add(imm_cb(insn));
        hart.set_pc(target);
    } else {
        hart.advance(2);
    }
    Ok(())
}

fn c_slli<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let r = rfull(insn);
    let sh = c_shamt::<RV64>(insn)?;
    let val = hart.x(r) << sh;
    hart.set_x(r, sext_xlen::<RV64>(val));
    hart.advance(2);
    Ok(())
}

/// CI-format stack loads.
fn off_lwsp(insn: u32) -> u64 {
    // uimm[5]=insn[12], uimm[4:2]=insn[6:4], uimm[7:6]=insn[3:2]
    (((insn >> 7) & 0x20) | ((insn >> 2) & 0x1C) | ((insn << 4) & 0xC0)) as u64
}

fn off_ldsp(insn: u32) -> u64 {
    // uimm[5]=insn[12], uimm[4:3]=insn[6:5], uimm[8:6]=insn[4:2]
    (((insn >> 7) & 0x20) | ((insn >> 2) & 0x18) | ((insn << 4) & 0x1C0)) as u64
}

/// CSS-format stack stores.
fn off_swsp(insn: u32) -> u64 {
    // uimm[5:2]=insn[12:9], uimm[7:6]=insn[8:7]
    (((insn >> 7) & 0x3C) | ((insn >> 1) & 0xC0)) as u64
}

fn off_sdsp(insn: u32) -> u64 {
    // uimm[5:3]=insn[12:10], uimm[8:6]=insn[9:7]
    (((insn >> 7) & 0x38) | ((insn >> 1) & 0x1C0)) as u64
}

fn c_lwsp(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let r = rfull(insn);
    if r == 0 {
        return Err(Trap::illegal(insn));
    }
    let addr = hart.vaddr(hart.x(2).wrapping_add(off_lwsp(insn)));
    let val = hart.load_u32(addr)? as i32 as i64 as u64;
    hart.set_x(r, val);
    hart.advance(2);
    Ok(())
}

fn c_ldsp(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let r = rfull(insn);
    if r == 0 {
        return Err(Trap::illegal(insn));
    }
    let addr = hart.vaddr(hart.x(2).wrapping_add(off_ldsp(insn)));
    let val = hart.load_u64(addr)?;
    hart.set_x(r, val);
    hart.advance(2);
    Ok(())
}

fn c_fldsp(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(2).wrapping_add(off_ldsp(insn)));
    let val = hart.load_u64(addr)?;
    hart.fregs[rfull(insn)] = val;
    hart.csr.set_fs_dirty();
    hart.advance(2);
    Ok(())
}

fn c_flwsp(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(2).wrapping_add(off_lwsp(insn)));
    let val = hart.load_u32(addr)?;
    hart.fregs[rfull(insn)] = fpu::nan_box(val);
    hart.csr.set_fs_dirty();
    hart.advance(2);
    Ok(())
}

fn c_jr_mv_add<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let r = rfull(insn);
    let r2 = rs2full(insn);
    if insn & (1 << 12) == 0 {
        if r2 == 0 {
            if r == 0 {
                return Err(Trap::illegal(insn));
            }
            hart.set_pc(hart.x(r) & !1);
        } else {
            hart.set_x(r, hart.x(r2));
            hart.advance(2);
        }
    } else if r2 == 0 {
        if r == 0 {
            return Err(Trap::new(Exception::Breakpoint, hart.pc));
        }
        let target = hart.x(r) & !1;
        hart.set_x(1, hart.pc.wrapping_add(2));
        hart.set_pc(target);
    } else {
        let val = hart.x(r).wrapping_add(hart.x(r2));
        hart.set_x(r, sext_xlen::<RV64>(val));
        hart.advance(2);
    }
    Ok(())
}

fn c_swsp(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(2).wrapping_add(off_swsp(insn)));
    hart.store_u32(addr, hart.x(rs2full(insn)) as u32)?;
    hart.advance(2);
    Ok(())
}

fn c_sdsp(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(2).wrapping_add(off_sdsp(insn)));
    hart.store_u64(addr, hart.x(rs2full(insn)))?;
    hart.advance(2);
    Ok(())
}

fn c_fsdsp(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(2).wrapping_add(off_sdsp(insn)));
    hart.store_u64(addr, hart.fregs[rs2full(insn)])?;
    hart.advance(2);
    Ok(())
}

fn c_fswsp(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(2).wrapping_add(off_swsp(insn)));
    hart.store_u32(addr, hart.fregs[rs2full(insn)] as u32)?;
    hart.advance(2);
    Ok(())
}
