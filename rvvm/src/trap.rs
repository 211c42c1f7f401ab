// SPDX-License-Identifier: Apache-2.0

//! Trap causes and privilege levels.
//!
//! A [`Trap`] is the value threaded back through the interpreter when an
//! instruction cannot complete: instruction handlers return
//! `Result<(), Trap>` and the dispatch loop performs the actual trap entry.
//! Interrupts never appear as `Trap` values; they are selected at the loop
//! head from the pending/enable bits.

use core::fmt;

use num_derive::FromPrimitive;
use num_traits::FromPrimitive;

/// RISC-V privilege modes. H-mode is not implemented, so the encoding gap
/// at 2 stays unused.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, FromPrimitive)]
pub enum Privilege {
    User = 0,
    Supervisor = 1,
    Machine = 3,
}

impl Privilege {
    /// Decode a two-bit privilege field, mapping the reserved encoding to
    /// the next lower supported mode (WARL behaviour for xPP writes).
    pub fn from_bits(bits: u64) -> Privilege {
        Privilege::from_u64(bits & 3).unwrap_or(Privilege::Supervisor)
    }
}

impl fmt::Display for Privilege {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Privilege::User => write!(f, "U"),
            Privilege::Supervisor => write!(f, "S"),
            Privilege::Machine => write!(f, "M"),
        }
    }
}

/// Synchronous exception causes, numbered per the privileged ISA.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Exception {
    InstructionAddressMisaligned = 0,
    InstructionAccessFault = 1,
    IllegalInstruction = 2,
    Breakpoint = 3,
    LoadAddressMisaligned = 4,
    LoadAccessFault = 5,
    StoreAddressMisaligned = 6,
    StoreAccessFault = 7,
    EcallFromUmode = 8,
    EcallFromSmode = 9,
    EcallFromMmode = 11,
    InstructionPageFault = 12,
    LoadPageFault = 13,
    StorePageFault = 15,
}

impl Exception {
    pub fn code(self) -> u64 { self as u64 }

    /// The environment-call cause for the given originating privilege.
    pub fn ecall_from(prv: Privilege) -> Exception {
        match prv {
            Privilege::User => Exception::EcallFromUmode,
            Privilege::Supervisor => Exception::EcallFromSmode,
            Privilege::Machine => Exception::EcallFromMmode,
        }
    }
}

impl fmt::Display for Exception {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Exception::InstructionAddressMisaligned => "instruction address misaligned",
            Exception::InstructionAccessFault => "instruction access fault",
            Exception::IllegalInstruction => "illegal instruction",
            Exception::Breakpoint => "breakpoint",
            Exception::LoadAddressMisaligned => "load address misaligned",
            Exception::LoadAccessFault => "load access fault",
            Exception::StoreAddressMisaligned => "store/AMO address misaligned",
            Exception::StoreAccessFault => "store/AMO access fault",
            Exception::EcallFromUmode => "environment call from U-mode",
            Exception::EcallFromSmode => "environment call from S-mode",
            Exception::EcallFromMmode => "environment call from M-mode",
            Exception::InstructionPageFault => "instruction page fault",
            Exception::LoadPageFault => "load page fault",
            Exception::StorePageFault => "store/AMO page fault",
        };
        write!(f, "{}", name)
    }
}

/// Interrupt causes. The numeric value doubles as the `mip`/`mie` bit
/// position.
#[derive(Clone, Copy, Debug, PartialEq, Eq, FromPrimitive)]
pub enum Interrupt {
    SupervisorSoftware = 1,
    MachineSoftware = 3,
    SupervisorTimer = 5,
    MachineTimer = 7,
    SupervisorExternal = 9,
    MachineExternal = 11,
}

impl Interrupt {
    pub fn code(self) -> u64 { self as u64 }

    pub fn mask(self) -> u64 { 1 << (self as u64) }

    /// Fixed claim priority: external before software before timer, machine
    /// level before supervisor level.
    pub const PRIORITY: [Interrupt; 6] = [
        Interrupt::MachineExternal,
        Interrupt::MachineSoftware,
        Interrupt::MachineTimer,
        Interrupt::SupervisorExternal,
        Interrupt::SupervisorSoftware,
        Interrupt::SupervisorTimer,
    ];
}

impl fmt::Display for Interrupt {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Interrupt::SupervisorSoftware => "supervisor software interrupt",
            Interrupt::MachineSoftware => "machine software interrupt",
            Interrupt::SupervisorTimer => "supervisor timer interrupt",
            Interrupt::MachineTimer => "machine timer interrupt",
            Interrupt::SupervisorExternal => "supervisor external interrupt",
            Interrupt::MachineExternal => "machine external interrupt",
        };
        write!(f, "{}", name)
    }
}

/// All interrupt bits that may legally be pending in `mip`.
pub const IRQ_MASK_ALL: u64 = (1 << 1) | (1 << 3) | (1 << 5) | (1 << 7) | (1 << 9) | (1 << 11);

/// Interrupt bits delegatable to S-mode.
pub const IRQ_MASK_S: u64 = (1 << 1) | (1 << 5) | (1 << 9);

/// A synchronous trap: the cause plus the value that lands in `xtval`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Trap {
    pub cause: Exception,
    pub tval: u64,
}

impl Trap {
    pub fn new(cause: Exception, tval: u64) -> Trap { Trap { cause, tval } }

    /// Illegal instruction, with the offending encoding as `tval`.
    pub fn illegal(insn: u32) -> Trap {
        Trap { cause: Exception::IllegalInstruction, tval: insn as u64 }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} (tval {:#x})", self.cause, self.tval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exception_codes_match_isa() {
        assert_eq!(Exception::IllegalInstruction.code(), 2);
        assert_eq!(Exception::LoadAccessFault.code(), 5);
        assert_eq!(Exception::EcallFromMmode.code(), 11);
        assert_eq!(Exception::StorePageFault.code(), 15);
    }

    #[test]
    fn interrupt_bits() {
        assert_eq!(Interrupt::MachineTimer.mask(), 1 << 7);
        assert_eq!(IRQ_MASK_S & Interrupt::MachineSoftware.mask(), 0);
        for irq in Interrupt::PRIORITY {
            assert_ne!(IRQ_MASK_ALL & irq.mask(), 0);
        }
    }

    #[test]
    fn privilege_order() {
        assert!(Privilege::User < Privilege::Supervisor);
        assert!(Privilege::Supervisor < Privilege::Machine);
        assert_eq!(Privilege::from_bits(2), Privilege::Supervisor);
        assert_eq!(Privilege::from_bits(3), Privilege::Machine);
    }
}
