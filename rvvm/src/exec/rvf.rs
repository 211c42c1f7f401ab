// SPDX-License-Identifier: Apache-2.0

//! F and D extensions.
//!
//! Only wired into the decoder while `mstatus.FS` enables the unit, so an
//! FPU instruction with the unit off lands on the illegal handler without
//! any per-dispatch check.

use super::*;
use crate::decode::*;
use crate::fpu::{self, box32, box64, unbox32};
use crate::hart::Hart;
use crate::trap::Trap;

pub fn populate<const RV64: bool>(dec: &mut Decoder) {
    dec.set(OP_LOAD_FP, 2, flw);
    dec.set(OP_LOAD_FP, 3, fld);
    dec.set(OP_STORE_FP, 2, fsw);
    dec.set(OP_STORE_FP, 3, fsd);
    dec.set_all(OP_FP, op_fp::<RV64>);
    dec.set_all(OP_MADD, fmadd::<RV64>);
    dec.set_all(OP_MSUB, fmadd::<RV64>);
    dec.set_all(OP_NMSUB, fmadd::<RV64>);
    dec.set_all(OP_NMADD, fmadd::<RV64>);
}

/// Resolve the rounding mode field: 7 selects the dynamic `frm`, 5 and 6
/// are reserved.
fn resolve_rm(hart: &Hart, insn: u32) -> Result<u32, Trap> {
    let rm = funct3(insn);
    let rm = if rm == 7 { (hart.csr.fcsr >> 5) & 7 } else { rm };
    if rm > 4 { Err(Trap::illegal(insn)) } else { Ok(rm) }
}

fn set_f(hart: &mut Hart, r: usize, bits: u64) {
    hart.fregs[r] = bits;
    hart.csr.set_fs_dirty();
}

fn accrue(hart: &mut Hart, flags: u32) {
    if flags != 0 {
        hart.csr.fcsr |= flags & 0x1F;
        hart.csr.set_fs_dirty();
    }
}

fn flw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_i(insn)));
    let val = hart.load_u32(addr)?;
    set_f(hart, rd(insn), fpu::nan_box(val));
    hart.advance(4);
    Ok(())
}

fn fld(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_i(insn)));
    let val = hart.load_u64(addr)?;
    set_f(hart, rd(insn), val);
    hart.advance(4);
    Ok(())
}

fn fsw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_s(insn)));
    hart.store_u32(addr, hart.fregs[rs2(insn)] as u32)?;
    hart.advance(4);
    Ok(())
}

fn fsd(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let addr = hart.vaddr(hart.x(rs1(insn)).wrapping_add(imm_s(insn)));
    hart.store_u64(addr, hart.fregs[rs2(insn)])?;
    hart.advance(4);
    Ok(())
}

/// R4-format fused multiply-add family; the opcode picks the sign scheme.
fn fmadd<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    resolve_rm(hart, insn)?;
    let opcode = (insn >> 2) & 0x1F;
    let fmt = (insn >> 25) & 3;
    match fmt {
        0 => {
            let a = unbox32(hart.fregs[rs1(insn)]);
            let b = unbox32(hart.fregs[rs2(insn)]);
            let c = unbox32(hart.fregs[rs3(insn)]);
            let (a, c) = match opcode {
                OP_MADD => (a, c),
                OP_MSUB => (a, -c),
                OP_NMSUB => (-a, c),
                _ => (-a, -c),
            };
            let (r, flags) = fpu::s::fma(a, b, c);
            accrue(hart, flags);
            set_f(hart, rd(insn), box32(r));
        }
        1 => {
            let a = f64::from_bits(hart.fregs[rs1(insn)]);
            let b = f64::from_bits(hart.fregs[rs2(insn)]);
            let c = f64::from_bits(hart.fregs[rs3(insn)]);
            let (a, c) = match opcode {
                OP_MADD => (a, c),
                OP_MSUB => (a, -c),
                OP_NMSUB => (-a, c),
                _ => (-a, -c),
            };
            let (r, flags) = fpu::d::fma(a, b, c);
            accrue(hart, flags);
            set_f(hart, rd(insn), box64(r));
        }
        _ => return Err(Trap::illegal(insn)),
    }
    hart.advance(4);
    Ok(())
}

fn op_fp<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    let f7 = funct7(insn);
    let f3 = funct3(insn);
    let r1 = hart.fregs[rs1(insn)];
    let r2 = hart.fregs[rs2(insn)];
    match f7 {
        // Arithmetic.
        0x00 | 0x04 | 0x08 | 0x0C => {
            resolve_rm(hart, insn)?;
            let (a, b) = (unbox32(r1), unbox32(r2));
            let (r, flags) = match f7 {
                0x00 => fpu::s::add(a, b),
                0x04 => fpu::s::sub(a, b),
                0x08 => fpu::s::mul(a, b),
                _ => fpu::s::div(a, b),
            };
            accrue(hart, flags);
            set_f(hart, rd(insn), box32(r));
        }
        0x01 | 0x05 | 0x09 | 0x0D => {
            resolve_rm(hart, insn)?;
            let (a, b) = (f64::from_bits(r1), f64::from_bits(r2));
            let (r, flags) = match f7 {
                0x01 => fpu::d::add(a, b),
                0x05 => fpu::d::sub(a, b),
                0x09 => fpu::d::mul(a, b),
                _ => fpu::d::div(a, b),
            };
            accrue(hart, flags);
            set_f(hart, rd(insn), box64(r));
        }
        0x2C if rs2(insn) == 0 => {
            resolve_rm(hart, insn)?;
            let (r, flags) = fpu::s::sqrt(unbox32(r1));
            accrue(hart, flags);
            set_f(hart, rd(insn), box32(r));
        }
        0x2D if rs2(insn) == 0 => {
            resolve_rm(hart, insn)?;
            let (r, flags) = fpu::d::sqrt(f64::from_bits(r1));
            accrue(hart, flags);
            set_f(hart, rd(insn), box64(r));
        }

        // Sign injection operates on raw (unboxed) bit patterns.
        0x10 => {
            let a = unbox32(r1).to_bits();
            let b = unbox32(r2).to_bits();
            let sign = 1u32 << 31;
            let r = match f3 {
                0 => (a & !sign) | (b & sign),
                1 => (a & !sign) | (!b & sign),
                2 => a ^ (b & sign),
                _ => return Err(Trap::illegal(insn)),
            };
            set_f(hart, rd(insn), fpu::nan_box(r));
        }
        0x11 => {
            let sign = 1u64 << 63;
            let r = match f3 {
                0 => (r1 & !sign) | (r2 & sign),
                1 => (r1 & !sign) | (!r2 & sign),
                2 => r1 ^ (r2 & sign),
                _ => return Err(Trap::illegal(insn)),
            };
            set_f(hart, rd(insn), r);
        }

        0x14 => {
            let (a, b) = (unbox32(r1), unbox32(r2));
            let (r, flags) = match f3 {
                0 => fpu::s::min(a, b),
                1 => fpu::s::max(a, b),
                _ => return Err(Trap::illegal(insn)),
            };
            accrue(hart, flags);
            set_f(hart, rd(insn), box32(r));
        }
        0x15 => {
            let (a, b) = (f64::from_bits(r1), f64::from_bits(r2));
            let (r, flags) = match f3 {
                0 => fpu::d::min(a, b),
                1 => fpu::d::max(a, b),
                _ => return Err(Trap::illegal(insn)),
            };
            accrue(hart, flags);
            set_f(hart, rd(insn), box64(r));
        }

        // Float/float conversions.
        0x20 if rs2(insn) == 1 => {
            resolve_rm(hart, insn)?;
            let (r, flags) = fpu::demote(f64::from_bits(r1));
            accrue(hart, flags);
            set_f(hart, rd(insn), box32(r));
        }
        0x21 if rs2(insn) == 0 => {
            let a = unbox32(r1);
            let flags = if fpu::s::is_snan(a) { fpu::FFLAG_NV } else { 0 };
            accrue(hart, flags);
            set_f(hart, rd(insn), box64(a as f64));
        }

        // Comparisons write an integer register.
        0x50 => {
            let (a, b) = (unbox32(r1), unbox32(r2));
            let (r, flags) = match f3 {
                2 => fpu::s::feq(a, b),
                1 => fpu::s::flt(a, b),
                0 => fpu::s::fle(a, b),
                _ => return Err(Trap::illegal(insn)),
            };
            accrue(hart, flags);
            hart.set_x(rd(insn), r as u64);
        }
        0x51 => {
            let (a, b) = (f64::from_bits(r1), f64::from_bits(r2));
            let (r, flags) = match f3 {
                2 => fpu::d::feq(a, b),
                1 => fpu::d::flt(a, b),
                0 => fpu::d::fle(a, b),
                _ => return Err(Trap::illegal(insn)),
            };
            accrue(hart, flags);
            hart.set_x(rd(insn), r as u64);
        }

        // Float -> integer.
        0x60 | 0x61 => {
            let rm = resolve_rm(hart, insn)?;
            let v = if f7 == 0x60 { unbox32(r1) as f64 } else { f64::from_bits(r1) };
            let (val, flags) = match rs2(insn) {
                0 => {
                    let (r, f) = fpu::to_signed(v, rm, 32);
                    (r as i32 as i64 as u64, f)
                }
                1 => {
                    let (r, f) = fpu::to_unsigned(v, rm, 32);
                    (r as u32 as i32 as i64 as u64, f)
                }
                2 if RV64 => {
                    let (r, f) = fpu::to_signed(v, rm, 64);
                    (r as u64, f)
                }
                3 if RV64 => fpu::to_unsigned(v, rm, 64),
                _ => return Err(Trap::illegal(insn)),
            };
            accrue(hart, flags);
            hart.set_x(rd(insn), val);
        }

        // Integer -> float.
        0x68 | 0x69 => {
            resolve_rm(hart, insn)?;
            let x = hart.x(rs1(insn));
            let single = f7 == 0x68;
            let (bits, flags) = match rs2(insn) {
                0 => {
                    if single {
                        let (r, f) = fpu::int_to_f32(x as i32 as i64);
                        (box32(r), f)
                    } else {
                        let (r, f) = fpu::int_to_f64(x as i32 as i64);
                        (box64(r), f)
                    }
                }
                1 => {
                    if single {
                        let (r, f) = fpu::uint_to_f32(x as u32 as u64);
                        (box32(r), f)
                    } else {
                        let (r, f) = fpu::uint_to_f64(x as u32 as u64);
                        (box64(r), f)
                    }
                }
                2 if RV64 => {
                    if single {
                        let (r, f) = fpu::int_to_f32(x as i64);
                        (box32(r), f)
                    } else {
                        let (r, f) = fpu::int_to_f64(x as i64);
                        (box64(r), f)
                    }
                }
                3 if RV64 => {
                    if single {
                        let (r, f) = fpu::uint_to_f32(x);
                        (box32(r), f)
                    } else {
                        let (r, f) = fpu::uint_to_f64(x);
                        (box64(r), f)
                    }
                }
                _ => return Err(Trap::illegal(insn)),
            };
            accrue(hart, flags);
            set_f(hart, rd(insn), bits);
        }

        // Bit moves and classification.
        0x70 if rs2(insn) == 0 => match f3 {
            0 => hart.set_x(rd(insn), r1 as u32 as i32 as i64 as u64),
            1 => hart.set_x(rd(insn), fpu::s::classify(unbox32(r1))),
            _ => return Err(Trap::illegal(insn)),
        },
        0x71 if rs2(insn) == 0 => match f3 {
            0 if RV64 => hart.set_x(rd(insn), r1),
            1 => hart.set_x(rd(insn), fpu::d::classify(f64::from_bits(r1))),
            _ => return Err(Trap::illegal(insn)),
        },
        0x78 if rs2(insn) == 0 && f3 == 0 => {
            set_f(hart, rd(insn), fpu::nan_box(hart.x(rs1(insn)) as u32));
        }
        0x79 if RV64 && rs2(insn) == 0 && f3 == 0 => {
            set_f(hart, rd(insn), hart.x(rs1(insn)));
        }
        _ => return Err(Trap::illegal(insn)),
    }
    hart.advance(4);
    Ok(())
}
