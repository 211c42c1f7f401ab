// SPDX-License-Identifier: Apache-2.0

//! M extension: multiply and divide.

use super::*;
use crate::decode::*;
use crate::hart::Hart;
use crate::trap::Trap;

pub fn populate<const RV64: bool>(dec: &mut Decoder) {
    dec.set_f7(OP_OP, 0, 1, mul::<RV64>);
    dec.set_f7(OP_OP, 1, 1, mulh::<RV64>);
    dec.set_f7(OP_OP, 2, 1, mulhsu::<RV64>);
    dec.set_f7(OP_OP, 3, 1, mulhu::<RV64>);
    dec.set_f7(OP_OP, 4, 1, div::<RV64>);
    dec.set_f7(OP_OP, 5, 1, divu::<RV64>);
    dec.set_f7(OP_OP, 6, 1, rem::<RV64>);
    dec.set_f7(OP_OP, 7, 1, remu::<RV64>);
    if RV64 {
        dec.set_f7(OP_OP_32, 0, 1, mulw);
        dec.set_f7(OP_OP_32, 4, 1, divw);
        dec.set_f7(OP_OP_32, 5, 1, divuw);
        dec.set_f7(OP_OP_32, 6, 1, remw);
        dec.set_f7(OP_OP_32, 7, 1, remuw);
    }
}

fn check_f7(insn: u32) -> Result<(), Trap> {
    if funct7(insn) != 1 { Err(Trap::illegal(insn)) } else { Ok(()) }
}

fn mul<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let val = hart.x(rs1(insn)).wrapping_mul(hart.x(rs2(insn)));
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn mulh<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let (a, b) = (hart.x(rs1(insn)), hart.x(rs2(insn)));
    let val = if RV64 {
        ((a as i64 as i128 * b as i64 as i128) >> 64) as u64
    } else {
        ((a as i32 as i64 * b as i32 as i64) >> 32) as u64
    };
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn mulhsu<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let (a, b) = (hart.x(rs1(insn)), hart.x(rs2(insn)));
    let val = if RV64 {
        ((a as i64 as i128 * b as u128 as i128) >> 64) as u64
    } else {
        ((a as i32 as i64 * b as u32 as i64) >> 32) as u64
    };
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn mulhu<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let (a, b) = (hart.x(rs1(insn)), hart.x(rs2(insn)));
    let val = if RV64 {
        ((a as u128 * b as u128) >> 64) as u64
    } else {
        ((a as u32 as u64 * b as u32 as u64) >> 32) as u64
    };
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

/// Signed division per the ISA: x/0 = -1, overflow (MIN / -1) = MIN.
fn sdiv(a: i64, b: i64) -> i64 {
    if b == 0 {
        -1
    } else if a == i64::MIN && b == -1 {
        a
    } else {
        a / b
    }
}

fn srem(a: i64, b: i64) -> i64 {
    if b == 0 {
        a
    } else if a == i64::MIN && b == -1 {
        0
    } else {
        a % b
    }
}

fn div<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let (a, b) = (hart.x(rs1(insn)), hart.x(rs2(insn)));
    let val = if RV64 {
        sdiv(a as i64, b as i64) as u64
    } else {
        sdiv32(a as i32, b as i32) as i64 as u64
    };
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn divu<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let (a, b) = (hart.x(rs1(insn)), hart.x(rs2(insn)));
    let val = if RV64 {
        if b == 0 { u64::MAX } else { a / b }
    } else {
        let (a, b) = (a as u32, b as u32);
        (if b == 0 { u32::MAX } else { a / b }) as u64
    };
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn rem<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let (a, b) = (hart.x(rs1(insn)), hart.x(rs2(insn)));
    let val = if RV64 {
        srem(a as i64, b as i64) as u64
    } else {
        srem32(a as i32, b as i32) as i64 as u64
    };
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn remu<const RV64: bool>(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let (a, b) = (hart.x(rs1(insn)), hart.x(rs2(insn)));
    let val = if RV64 {
        if b == 0 { a } else { a % b }
    } else {
        let (a, b) = (a as u32, b as u32);
        (if b == 0 { a } else { a % b }) as u64
    };
    hart.set_x(rd(insn), sext_xlen::<RV64>(val));
    hart.advance(4);
    Ok(())
}

fn sdiv32(a: i32, b: i32) -> i32 {
    if b == 0 {
        -1
    } else if a == i32::MIN && b == -1 {
        a
    } else {
        a / b
    }
}

fn srem32(a: i32, b: i32) -> i32 {
    if b == 0 {
        a
    } else if a == i32::MIN && b == -1 {
        0
    } else {
        a % b
    }
}

fn mulw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let val = (hart.x(rs1(insn)) as u32).wrapping_mul(hart.x(rs2(insn)) as u32);
    hart.set_x(rd(insn), val as i32 as i64 as u64);
    hart.advance(4);
    Ok(())
}

fn divw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let val = sdiv32(hart.x(rs1(insn)) as i32, hart.x(rs2(insn)) as i32);
    hart.set_x(rd(insn), val as i64 as u64);
    hart.advance(4);
    Ok(())
}

fn divuw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let (a, b) = (hart.x(rs1(insn)) as u32, hart.x(rs2(insn)) as u32);
    let val = if b == 0 { u32::MAX } else { a / b };
    hart.set_x(rd(insn), val as i32 as i64 as u64);
    hart.advance(4);
    Ok(())
}

fn remw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let val = srem32(hart.x(rs1(insn)) as i32, hart.x(rs2(insn)) as i32);
    hart.set_x(rd(insn), val as i64 as u64);
    hart.advance(4);
    Ok(())
}

fn remuw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    check_f7(insn)?;
    let (a, b) = (hart.x(rs1(insn)) as u32, hart.x(rs2(insn)) as u32);
    let val = if b == 0 { a } else { a % b };
    hart.set_x(rd(insn), val as i32 as i64 as u64);
    hart.advance(4);
    Ok(())
}
