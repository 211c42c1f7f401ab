// SPDX-License-Identifier: Apache-2.0

//! SYSTEM opcode: environment calls, trap returns, WFI, SFENCE.VMA and the
//! Zicsr instructions.

use super::*;
use crate::csr::{CsrOp, STATUS_TSR, STATUS_TVM, STATUS_TW};
use crate::decode::*;
use crate::hart::Hart;
use crate::trap::{Exception, Privilege, Trap};

pub fn populate<const RV64: bool>(dec: &mut Decoder) {
    dec.set(OP_SYSTEM, 0, system_priv);
    dec.set(OP_SYSTEM, 1, csrrw);
    dec.set(OP_SYSTEM, 2, csrrs);
    dec.set(OP_SYSTEM, 3, csrrc);
    dec.set(OP_SYSTEM, 5, csrrwi);
    dec.set(OP_SYSTEM, 6, csrrsi);
    dec.set(OP_SYSTEM, 7, csrrci);
}

const INSN_ECALL: u32 = 0x0000_0073;
const INSN_EBREAK: u32 = 0x0010_0073;
const INSN_SRET: u32 = 0x1020_0073;
const INSN_MRET: u32 = 0x3020_0073;
const INSN_WFI: u32 = 0x1050_0073;
const F7_SFENCE_VMA: u32 = 0x09;

fn system_priv(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    match insn {
        INSN_ECALL => {
            return Err(Trap::new(Exception::ecall_from(hart.privilege()), 0));
        }
        INSN_EBREAK => {
            return Err(Trap::new(Exception::Breakpoint, hart.pc));
        }
        INSN_SRET => {
            if hart.privilege() < Privilege::Supervisor
                || (hart.privilege() == Privilege::Supervisor
                    && hart.csr.status & STATUS_TSR != 0)
            {
                return Err(Trap::illegal(insn));
            }
            hart.do_sret();
            return Ok(());
        }
        INSN_MRET => {
            if hart.privilege() != Privilege::Machine {
                return Err(Trap::illegal(insn));
            }
            hart.do_mret();
            return Ok(());
        }
        INSN_WFI => {
            if hart.privilege() < Privilege::Machine && hart.csr.status & STATUS_TW != 0 {
                return Err(Trap::illegal(insn));
            }
            hart.do_wfi();
            hart.advance(4);
            return Ok(());
        }
        _ => {}
    }
    if funct7(insn) == F7_SFENCE_VMA && rd(insn) == 0 {
        if hart.privilege() < Privilege::Supervisor
            || (hart.privilege() == Privilege::Supervisor && hart.csr.status & STATUS_TVM != 0)
        {
            return Err(Trap::illegal(insn));
        }
        if rs1(insn) == 0 {
            hart.tlb.flush();
        } else {
            let va = hart.vaddr(hart.x(rs1(insn)));
            hart.tlb.flush_page(va);
        }
        hart.advance(4);
        return Ok(());
    }
    Err(Trap::illegal(insn))
}

/// Shared tail of every CSR instruction: run the operation, fault on
/// failure, retire the old value into rd. `read` is false for CSRRW/CSRRWI
/// with `rd = x0`, where the ISA suppresses the CSR read and any side
/// effect it would have.
fn csr_insn(hart: &mut Hart, insn: u32, operand: u64, op: CsrOp, read: bool) -> Result<(), Trap> {
    let id = insn >> 20;
    let mut value = operand;
    if !hart.csr_access(id, &mut value, op, read) {
        return Err(Trap::illegal(insn));
    }
    hart.set_x(rd(insn), value);
    hart.advance(4);
    Ok(())
}

fn csrrw(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    csr_insn(hart, insn, hart.x(rs1(insn)), CsrOp::Swap, rd(insn) != 0)
}

fn csrrs(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    csr_insn(hart, insn, hart.x(rs1(insn)), CsrOp::SetBits, true)
}

fn csrrc(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    csr_insn(hart, insn, hart.x(rs1(insn)), CsrOp::ClearBits, true)
}

fn csrrwi(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    csr_insn(hart, insn, rs1(insn) as u64, CsrOp::Swap, rd(insn) != 0)
}

fn csrrsi(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    csr_insn(hart, insn, rs1(insn) as u64, CsrOp::SetBits, true)
}

fn csrrci(hart: &mut Hart, insn: u32) -> Result<(), Trap> {
    csr_insn(hart, insn, rs1(insn) as u64, CsrOp::ClearBits, true)
}
