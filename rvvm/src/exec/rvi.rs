// SPDX-License-Identifier: Apache-2.0

//! Base integer instruction set (RV32I/RV64I) plus Zifencei.

use super::*;
use crate::decode::*;
use crate::hart::Hart;
use crate::trap::{Exception, Trap};

pub fn populate<const RV64: bool>(dec: &mut Decoder) {
    dec.set_all(OP_LUI, lui::<RV64>);
    dec.set_all(OP_AUIPC, auipc::<RV64>);
    dec.set_all(OP_JAL, jal::<RV64>);
    dec.set(OP_JALR, 0, jalr::<RV64>);

    dec.set(OP_BRANCH, 0, beq::<RV64>);
    dec.set(OP_BRANCH, 1, bne::<RV64>);
    dec.set(OP_BRANCH, 4, blt::<RV64>);
    dec.set(OP_BRANCH, 5, bge::<RV64>);
    dec.set(OP_BRANCH, 6, bltu::<RV64>);
    dec.set(OP_BRANCH, 7, bgeu::<RV64>);

    dec.set(OP_LOAD, 0, lb);
    dec.set(OP_LOAD, 1, lh);
    dec.set(OP_LOAD, 2, lw);
    dec.set(OP_LOAD, 4, lbu);
    dec.set(OP_LOAD, 5, lhu);
    dec.set(OP_STORE, 0, sb);
    dec.set(OP_STORE, 1, sh);
    dec.set(OP_STORE, 2, sw);
    if RV64 {
        dec.set(OP_LOAD, 3, ld);
        dec.set(OP_LOAD, 6, lwu);
        dec.set(OP_STORE, 3, sd);
    }

    dec.set(OP_IMM, 0, addi::<RV64>);
    dec.set(OP_IMM, 1, slli::<RV64>);
    dec.set(OP_IMM, 2, slti);
    dec.set(OP_IMM, 3, sltiu);
    dec.set(OP_IMM, 4, xori::<RV64>);
    dec.set(OP_IMM, 5, srli_srai::<RV64>);
    dec.set(OP_IMM, 6, ori::<RV64>);
    dec.set(OP_IMM, 7, andi::<RV64>);

    dec.set_f7(OP_OP, 0, 0, add_sub::<RV64>);
    dec.set_f7(OP_OP, 1, 0, sll::<RV64>);
    dec.set_f7(OP_OP, 2, 0, slt);
    dec.set_f7(OP_OP, 3, 0, sltu);
    dec.set_f7(OP_OP, 4, 0, xor::<RV64>);
    dec.set_f7(OP_OP, 5, 0, srl_sra::<RV64>);
    dec.set_f7(OP_OP, 6, 0, or::<RV64>);
    dec.set_f7(OP_OP, 7, 0, and::<RV64>);

    if RV64 {
        dec.set(OP_IMM_32, 0, addiw);
        dec.set(OP_IMM_32, 1, slliw);
        dec.set(OP_IMM_32, 5, srliw_sraiw);
        dec.set_f7(OP_OP_32, 0, 0, addw_subw);
        dec.set_f7(OP_OP_32, 1, 0, sllw);
        dec.set_f7(OP_OP_32, 5, 0, srlw_sraw);
    }

    dec.set(OP_MISC_MEM, 0, fence);
    dec.set(OP_MISC_MEM, 1, fence_i);
}

fn lui<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    hart.set_x(rd(insn), sext_xlen::<RV64>(imm_u(insn)));
    hart.advance(4);
    Ok(())
}

fn auipc<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    hart.set_x(rd(insn), sext_xlen::<RV64>(hart.pc.wrapping_add(imm_u(insn))));
    hart.advance(4);
    Ok(())
}

/// Jump targets keep the low bit clear; with the C extension enabled only
/// a set bit 0 is misaligned.
fn jump<const RV64: bool>(hart: &mut Hart, target: u64, link: usize) -> Result<(), Trap> {
    let target = sext_xlen::<RV64>(target) & !1;
    hart.set_x(link, sext_xlen::<RV64>(hart.pc.wrapping_add(4)));
    hart.set_pc(target);
    Ok(())
}

fn jal<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let target = hart.pc.wrapping_add(imm_j(insn));
    jump::<RV64>(hart, target, rd(insn))
}

fn jalr<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let target = hart.x(rs1(insn)).wrapping_add(imm_i(insn));
    jump::<RV64>(hart, target, rd(insn))
}

macro_rules! branch {
    ($name:ident, $ty:ty, $op:tt) => {
        fn $name<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
            if (hart.x(rs1(insn)) as $ty) $op (hart.x(rs2(insn)) as $ty) {
                let target = hart.pc.wrapping_add(imm_b(insn));
                if target & 1 != 0 {
                    return Err(Trap::new(Exception::InstructionAddressMisaligned, target));
                }
                hart.set_pc(target);
            } else {
                hart.advance(4);
            }
            Ok(())
        }
    };
}

branch!(beq, u64, ==);
branch!(bne, u64, !=);
branch!(blt, i64, <);
branch!(bge, i64, >=);
branch!(bltu, u64, <);
branch!(bgeu, u64, >=);

// Loads sign- or zero-extend into the register invariant; on RV32 the
// register image is always the 32-bit value sign-extended.

fn lb(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_i(insn)));
    let val = hart.load_u8(addr)? as i8 as i64 as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn lh(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_i(insn)));
    let val = hart.load_u16(addr)? as i16 as i64 as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn lw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_i(insn)));
    let val = hart.load_u32(addr)? as i32 as i64 as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn ld(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_i(insn)));
    let val = hart.load_u64(addr)?;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn lbu(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_i(insn)));
    let val = hart.load_u8(addr)? as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn lhu(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_i(insn)));
    let val = hart.load_u16(addr)? as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn lwu(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_i(insn)));
    let val = hart.load_u32(addr)? as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn sb(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_s(insn)));
    hart.store_u8(addr, hart.x(rs2(insn)) as u8)?;
    hart.advance(4);
    Ok(())
}

fn sh(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_s(insn)));
    hart.store_u16(addr, hart.x(rs2(insn)) as u16)?;
    hart.advance(4);
    Ok(())
}

fn sw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_s(insn)));
    hart.store_u32(addr, hart.x(rs2(insn)) as u32)?;
    hart.advance(4);
    Ok(())
}

fn sd(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_s(insn)));
    hart.store_u64(addr, hart.x(rs2(insn)))?;
    hart.advance(4);
    Ok(())
}

fn addi<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let val = hart.x(rs1(insn)).wrapping_add(imm_i(insn));
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn slti(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let val = ((hart.x(rs1(insn)) as i64) < imm_i(insn) as i64) as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn sltiu(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let val = (hart.x(rs1(insn)) < imm_i(insn)) as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn xori<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let val = hart.x(rs1(insn)) ^ imm_i(insn);
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn ori<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let val = hart.x(rs1(insn)) | imm_i(insn);
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn andi<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let val = hart.x(rs1(insn)) & imm_i(insn);
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

/// Shift-amount field. The funct bits around the arithmetic-shift bit
/// (bit 30) are reserved and must be zero.
fn shamt<const RV64: bool>(insn: u32) -> Result<u32, Trap> {
    if RV64 {
        if (insn >> 26) & 0b10_1111 != 0 {
            return Err(Trap::illegal(insn));
        }
        Ok((insn >> 20) & 0x3F)
    } else {
        if (insn >> 25) & 0b101_1111 != 0 {
            return Err(Trap::illegal(insn));
        }
        Ok((insn >> 20) & 0x1F)
    }
}

fn slli<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if insn & (1 << 30) != 0 {
        return Err(Trap::illegal(insn));
    }
    let sh = shamt::<RV64>(insn)?;
    let val = hart.x(rs1(insn)) << sh;
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn srli_srai<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let sh = shamt::<RV64>(insn)?;
    let src = hart.x(rs1(insn));
    let val = if insn & (1 << 30) != 0 {
        if RV64 { ((src as i64) >> sh) as u64 } else { ((src as i32) >> sh) as i64 as u64 }
    } else if RV64 {
        src >> sh
    } else {
        ((src as u32) >> sh) as u64
    };
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn add_sub<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let (a, b) = (hart.x(rs1(insn)), hart.x(rs2(insn)));
    let val = match funct7(insn) {
        0x00 => a.wrapping_add(b),
        0x20 => a.wrapping_sub(b),
        _ => return Err(Trap::illegal(insn)),
    };
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn sll<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if funct7(insn) != 0 {
        return Err(Trap::illegal(insn));
    }
    let sh = hart.x(rs2(insn)) as u32 & if RV64 { 0x3F } else { 0x1F };
    let val = hart.x(rs1(insn)) << sh;
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn slt(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if funct7(insn) != 0 {
        return Err(Trap::illegal(insn));
    }
    let val = ((hart.x(rs1(insn)) as i64) < hart.x(rs2(insn)) as i64) as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn sltu(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if funct7(insn) != 0 {
        return Err(Trap::illegal(insn));
    }
    let val = (hart.x(rs1(insn)) < hart.x(rs2(insn))) as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn xor<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if funct7(insn) != 0 {
        return Err(Trap::illegal(insn));
    }
    let val = hart.x(rs1(insn)) ^ hart.x(rs2(insn));
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn srl_sra<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let sh = hart.x(rs2(insn)) as u32 & if RV64 { 0x3F } else { 0x1F };
    let src = hart.x(rs1(insn));
    let val = match funct7(insn) {
        0x00 => {
            if RV64 { src >> sh } else { ((src as u32) >> sh) as u64 }
        }
        0x20 => {
            if RV64 { ((src as i64) >> sh) as u64 } else { ((src as i32) >> sh) as i64 as u64 }
        }
        _ => return Err(Trap::illegal(insn)),
    };
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn or<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if funct7(insn) != 0 {
        return Err(Trap::illegal(insn));
    }
    let val = hart.x(rs1(insn)) | hart.x(rs2(insn));
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn and<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if funct7(insn) != 0 {
        return Err(Trap::illegal(insn));
    }
    let val = hart.x(rs1(insn)) & hart.x(rs2(insn));
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

// RV64-only 32-bit operations.

fn addiw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let val = hart.x(rs1(insn)).wrapping_add(imm_i(insn)) as i32 as i64 as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn slliw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if funct7(insn) != 0 {
        return Err(Trap::illegal(insn));
    }
    let sh = (insn >> 20) & 0x1F;
    let val = ((hart.x(rs1(insn)) as u32) << sh) as i32 as i64 as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn srliw_sraiw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let sh = (insn >> 20) & 0x1F;
    let src = hart.x(rs1(insn)) as u32;
    let val = match funct7(insn) {
        0x00 => (src >> sh) as i32 as i64 as u64,
        0x20 => ((src as i32) >> sh) as i64 as u64,
        _ => return Err(Trap::illegal(insn)),
    };
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn addw_subw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let (a, b) = (hart.x(rs1(insn)) as u32, hart.x(rs2(insn)) as u32);
    let val = match funct7(insn) {
        0x00 => a.wrapping_add(b),
        0x20 => a.wrapping_sub(b),
        _ => return Err(Trap::illegal(insn)),
    };
    hart.set_x(rd(insn), val as i32 as i64 as u64);
    hart.advance(4);
    Ok(())
}

fn sllw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    if funct7(insn) != 0 {
        return Err(Trap::illegal(insn));
    }
    let sh = hart.x(rs2(insn)) as u32 & 0x1F;
    let val = ((hart.x(rs1(insn)) as u32) << sh) as i32 as i64 as u64;
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn srlw_sraw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let sh = hart.x(rs2(insn)) as u32 & 0x1F;
    let src = hart.x(rs1(insn)) as u32;
    let val = match funct7(insn) {
        0x00 => (src >> sh) as i32 as i64 as u64,
        0x20 => ((src as i32) >> sh) as i64 as u64,
        _ => return Err(Trap::illegal(insn)),
    };
    hart.set_x(rd(insn), val);
    hart.advance(4);
    Ok(())
}

/// The interpreter retires one instruction at a time per hart, so a full
/// host fence covers every FENCE flavour.
fn fence(hart: &mut Hart, _insn: u32) -> Result<(), Trap> {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    hart.advance(4);
    Ok(())
}

/// Instructions are always fetched from backing RAM, never from a decoded
/// cache, so FENCE.I only needs the host fence.
fn fence_i(hart: &mut Hart, _insn: u32) -> Result<(), Trap> {
    std::sync::atomic::fence(std::sync::atomic::Ordering::SeqCst);
    hart.advance(4);
    Ok(())
}
