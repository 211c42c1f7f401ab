// SPDX-License-Identifier: Apache-2.0

//! Control-and-status register file.
//!
//! All CSR traffic funnels through [`Hart::csr_op`]: privilege and
//! read-only gates come straight from the id bits, RV32 operands are
//! zero-extended on the way in and results sign-extended on the way out,
//! and each register's arm applies its WARL mask and side effects. A
//! `false` return means the operation failed and the caller must raise an
//! illegal-instruction trap.

use std::sync::Mutex;

use lazy_static::lazy_static;
use rand::{RngCore, SeedableRng};
use rand_chacha::ChaCha8Rng;

use crate::hart::Hart;
use crate::mmu::MmuMode;
use crate::trap::{Privilege, IRQ_MASK_ALL, IRQ_MASK_S};

// Unprivileged.
pub const CSR_FFLAGS: u32 = 0x001;
pub const CSR_FRM: u32 = 0x002;
pub const CSR_FCSR: u32 = 0x003;
pub const CSR_SEED: u32 = 0x015;
pub const CSR_CYCLE: u32 = 0xC00;
pub const CSR_TIME: u32 = 0xC01;
pub const CSR_INSTRET: u32 = 0xC02;
pub const CSR_CYCLEH: u32 = 0xC80;
pub const CSR_TIMEH: u32 = 0xC81;
pub const CSR_INSTRETH: u32 = 0xC82;

// Supervisor.
pub const CSR_SSTATUS: u32 = 0x100;
pub const CSR_SIE: u32 = 0x104;
pub const CSR_STVEC: u32 = 0x105;
pub const CSR_SCOUNTEREN: u32 = 0x106;
pub const CSR_SENVCFG: u32 = 0x10A;
pub const CSR_SSCRATCH: u32 = 0x140;
pub const CSR_SEPC: u32 = 0x141;
pub const CSR_SCAUSE: u32 = 0x142;
pub const CSR_STVAL: u32 = 0x143;
pub const CSR_SIP: u32 = 0x144;
pub const CSR_STIMECMP: u32 = 0x14D;
pub const CSR_STIMECMPH: u32 = 0x15D;
pub const CSR_SATP: u32 = 0x180;

// Machine.
pub const CSR_MSTATUS: u32 = 0x300;
pub const CSR_MISA: u32 = 0x301;
pub const CSR_MEDELEG: u32 = 0x302;
pub const CSR_MIDELEG: u32 = 0x303;
pub const CSR_MIE: u32 = 0x304;
pub const CSR_MTVEC: u32 = 0x305;
pub const CSR_MCOUNTEREN: u32 = 0x306;
pub const CSR_MENVCFG: u32 = 0x30A;
pub const CSR_MSTATUSH: u32 = 0x310;
pub const CSR_MENVCFGH: u32 = 0x31A;
pub const CSR_MSCRATCH: u32 = 0x340;
pub const CSR_MEPC: u32 = 0x341;
pub const CSR_MCAUSE: u32 = 0x342;
pub const CSR_MTVAL: u32 = 0x343;
pub const CSR_MIP: u32 = 0x344;
pub const CSR_MSECCFG: u32 = 0x747;
pub const CSR_MCYCLE: u32 = 0xB00;
pub const CSR_MINSTRET: u32 = 0xB02;
pub const CSR_MCYCLEH: u32 = 0xB80;
pub const CSR_MINSTRETH: u32 = 0xB82;
pub const CSR_MVENDORID: u32 = 0xF11;
pub const CSR_MARCHID: u32 = 0xF12;
pub const CSR_MIMPID: u32 = 0xF13;
pub const CSR_MHARTID: u32 = 0xF14;

// mstatus bits.
pub const STATUS_SIE: u64 = 1 << 1;
pub const STATUS_MIE: u64 = 1 << 3;
pub const STATUS_SPIE: u64 = 1 << 5;
pub const STATUS_MPIE: u64 = 1 << 7;
pub const STATUS_SPP: u64 = 1 << 8;
pub const STATUS_MPP: u64 = 3 << 11;
pub const STATUS_FS: u64 = 3 << 13;
pub const STATUS_MPRV: u64 = 1 << 17;
pub const STATUS_SUM: u64 = 1 << 18;
pub const STATUS_MXR: u64 = 1 << 19;
pub const STATUS_TVM: u64 = 1 << 20;
pub const STATUS_TW: u64 = 1 << 21;
pub const STATUS_TSR: u64 = 1 << 22;
pub const STATUS_UXL: u64 = 3 << 32;
pub const STATUS_SXL: u64 = 3 << 34;

const STATUS_FS_DIRTY: u64 = 3 << 13;

/// Bits a machine-mode status write may touch (XL fields handled apart).
const MSTATUS_WRITABLE: u64 = STATUS_SIE
    | STATUS_MIE
    | STATUS_SPIE
    | STATUS_MPIE
    | STATUS_SPP
    | STATUS_MPP
    | STATUS_FS
    | STATUS_MPRV
    | STATUS_SUM
    | STATUS_MXR
    | STATUS_TVM
    | STATUS_TW
    | STATUS_TSR;

/// The sstatus window onto mstatus.
const SSTATUS_WRITABLE: u64 =
    STATUS_SIE | STATUS_SPIE | STATUS_SPP | STATUS_FS | STATUS_SUM | STATUS_MXR;
const SSTATUS_READABLE: u64 = SSTATUS_WRITABLE | STATUS_UXL;

/// Status bits whose edges invalidate cached translations.
const STATUS_TRANSLATION: u64 = STATUS_MPRV | STATUS_MPP | STATUS_SUM | STATUS_MXR;

/// misa extension bits: IMAFDC + S + U.
const MISA_EXTENSIONS: u64 = (1 << 0)  // A
    | (1 << 2)   // C
    | (1 << 3)   // D
    | (1 << 5)   // F
    | (1 << 8)   // I
    | (1 << 12)  // M
    | (1 << 18)  // S
    | (1 << 20); // U

/// Exceptions delegatable via medeleg: everything implemented except
/// environment calls from M-mode.
const MEDELEG_MASK: u64 = 0xFFFF & !(1 << 11);

const MENVCFG_STCE: u64 = 1 << 63;
const MSECCFG_USEED: u64 = 1 << 8;
const MSECCFG_SSEED: u64 = 1 << 9;

const COUNTEREN_CY: u32 = 1 << 0;
const COUNTEREN_TM: u32 = 1 << 1;
const COUNTEREN_IR: u32 = 1 << 2;
const COUNTEREN_MASK: u32 = COUNTEREN_CY | COUNTEREN_TM | COUNTEREN_IR;

lazy_static! {
    /// Entropy source for the `seed` CSR.
    static ref SEED_RNG: Mutex<ChaCha8Rng> = Mutex::new(ChaCha8Rng::from_entropy());
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CsrOp {
    Swap,
    SetBits,
    ClearBits,
}

fn apply(op: CsrOp, old: u64, operand: u64) -> u64 {
    match op {
        CsrOp::Swap => operand,
        CsrOp::SetBits => old | operand,
        CsrOp::ClearBits => old & !operand,
    }
}

/// Architectural CSR state owned by the hart thread. Interrupt-pending
/// bits live in `HartShared` instead, since they are written cross-thread.
pub struct CsrFile {
    pub status: u64,
    pub ie: u64,
    pub edeleg: u64,
    pub ideleg: u64,
    pub mtvec: u64,
    pub stvec: u64,
    pub mscratch: u64,
    pub sscratch: u64,
    pub mepc: u64,
    pub sepc: u64,
    pub mcause: u64,
    pub scause: u64,
    pub mtval: u64,
    pub stval: u64,
    pub mcounteren: u32,
    pub scounteren: u32,
    pub menvcfg: u64,
    pub senvcfg: u64,
    pub mseccfg: u64,
    pub satp: u64,
    pub fcsr: u32,
    pub mcycle: u64,
    pub minstret: u64,
    pub hartid: u64,
    /// misa MXL selects RV64 M-mode when set.
    pub mxl64: bool,
}

impl CsrFile {
    pub fn new(rv64: bool, hartid: u64) -> CsrFile {
        let mut status = 0;
        if rv64 {
            // SXL/UXL reset to the widest supported XLEN.
            status |= 2 << 32 | 2 << 34;
        }
        // FS starts Initial so bare-metal guests can touch the FPU without
        // a status dance.
        status |= 1 << 13;
        CsrFile {
            status,
            ie: 0,
            edeleg: 0,
            ideleg: 0,
            mtvec: 0,
            stvec: 0,
            mscratch: 0,
            sscratch: 0,
            mepc: 0,
            sepc: 0,
            mcause: 0,
            scause: 0,
            mtval: 0,
            stval: 0,
            mcounteren: 0,
            scounteren: 0,
            menvcfg: 0,
            senvcfg: 0,
            mseccfg: 0,
            satp: 0,
            fcsr: 0,
            mcycle: 0,
            minstret: 0,
            hartid,
            mxl64: rv64,
        }
    }

    /// Raw status store for the trap/xRET paths, which compute their own
    /// field updates.
    pub fn set_status_raw(&mut self, status: u64) {
        self.status = status;
    }

    pub fn isa_rv64(&self) -> bool { self.mxl64 }

    pub fn fpu_enabled(&self) -> bool {
        self.status & STATUS_FS != 0
    }

    /// Sstc supervisor timer comparator enable.
    pub fn stce(&self) -> bool {
        self.menvcfg & MENVCFG_STCE != 0
    }

    /// mstatus as seen at `xlen`, with SD derived from FS.
    pub fn read_status(&self, rv64: bool) -> u64 {
        let mut val = self.status;
        if self.status & STATUS_FS == STATUS_FS_DIRTY {
            val |= 1 << if rv64 { 63 } else { 31 };
        }
        val
    }

    pub fn read_misa(&self, rv64: bool) -> u64 {
        let mxl = if self.mxl64 { 2u64 } else { 1 };
        MISA_EXTENSIONS | (mxl << if rv64 { 62 } else { 30 })
    }

    /// Mark the FPU state dirty (f-register or fcsr write).
    pub fn set_fs_dirty(&mut self) {
        self.status |= STATUS_FS_DIRTY;
    }
}

impl Hart {
    /// Counter visibility for `cycle`/`time`/`instret` at the current
    /// privilege.
    fn counter_allowed(&self, bit: u32) -> bool {
        match self.prv {
            Privilege::Machine => true,
            Privilege::Supervisor => self.csr.mcounteren & bit != 0,
            Privilege::User => self.csr.mcounteren & self.csr.scounteren & bit != 0,
        }
    }

    fn seed_allowed(&self) -> bool {
        match self.prv {
            Privilege::Machine => true,
            Privilege::Supervisor => self.csr.mseccfg & MSECCFG_SSEED != 0,
            Privilege::User => self.csr.mseccfg & MSECCFG_USEED != 0,
        }
    }

    /// Apply a status write through `writable`, handling every side effect:
    /// WARL masking of MPP and the XL fields, translation flushes, decoder
    /// rebuilds on FS/XLEN edges and interrupt re-evaluation.
    fn write_status(&mut self, new: u64, writable: u64) {
        let old = self.csr.status;
        let mut merged = (old & !writable) | (new & writable);
        // MPP is WARL over {U, S, M}.
        if writable & STATUS_MPP != 0 && (merged >> 11) & 3 == 2 {
            merged = (merged & !STATUS_MPP) | (old & STATUS_MPP);
        }
        // XL fields: WARL over {1, 2}, writable only on an RV64 machine.
        if self.rv64_machine {
            for field in [STATUS_UXL, STATUS_SXL] {
                let shift = field.trailing_zeros();
                let v = (new & field) >> shift;
                if writable & field == 0 || (v != 1 && v != 2) {
                    merged = (merged & !field) | (old & field);
                }
            }
        } else {
            merged &= !(STATUS_UXL | STATUS_SXL);
        }
        self.csr.status = merged;
        if (old ^ merged) & STATUS_TRANSLATION != 0 {
            self.tlb.flush();
        }
        if (old & STATUS_FS == 0) != (merged & STATUS_FS == 0) {
            self.rebuild_decoder();
        }
        self.update_xlen();
        if (old ^ merged) & (STATUS_MIE | STATUS_SIE) != 0 {
            // Re-check pending interrupts once this instruction retires.
            self.shared.kick();
        }
    }

    fn write_satp(&mut self, new: u64) {
        let (mode_bits, ppn_mask) = if self.rv64 {
            (new >> 60, (1u64 << 44) - 1)
        } else {
            (new >> 31, (1u64 << 22) - 1)
        };
        let mode = match MmuMode::from_satp(self.rv64, mode_bits) {
            Some(mode) => mode,
            // Unsupported mode: the entire write is ignored (WARL).
            None => return,
        };
        let old = self.csr.satp;
        self.csr.satp = new;
        self.mmu_mode = mode;
        self.root_pt = (new & ppn_mask) << crate::PAGE_SHIFT;
        // Covers bare<->virtual transitions and ASID changes alike.
        if old != new {
            self.tlb.flush();
        }
    }

    /// The single CSR entry point. `value` carries the operand in and the
    /// old CSR value out. Returns `false` when the access must raise an
    /// illegal-instruction trap.
    pub fn csr_op(&mut self, id: u32, value: &mut u64, op: CsrOp) -> bool {
        self.csr_access(id, value, op, true)
    }

    /// Like [`Hart::csr_op`], but with the read leg made explicit: CSRRW
    /// and CSRRWI with `rd = x0` must not read the CSR, which matters for
    /// registers whose read has a side effect (`seed`). Privilege and
    /// legality checks still apply either way.
    pub(crate) fn csr_access(&mut self, id: u32, value: &mut u64, op: CsrOp, read: bool) -> bool {
        if ((id >> 8) & 3) > self.prv as u32 {
            return false;
        }
        let read_only = id >> 10 == 3;
        if read_only && (op == CsrOp::Swap || *value != 0) {
            return false;
        }
        if !self.rv64 {
            *value &= 0xFFFF_FFFF;
        }
        let ok = self.csr_dispatch(id, value, op, read);
        if ok && !self.rv64 {
            *value = *value as u32 as i32 as i64 as u64;
        }
        ok
    }

    fn csr_dispatch(&mut self, id: u32, value: &mut u64, op: CsrOp, read: bool) -> bool {
        let operand = *value;
        // A set/clear with a zero operand is a pure read and must not run
        // write side effects.
        let wr = op == CsrOp::Swap || operand != 0;
        match id {
            CSR_FFLAGS => {
                if !self.csr.fpu_enabled() {
                    return false;
                }
                let old = (self.csr.fcsr & 0x1F) as u64;
                if wr {
                    self.csr.fcsr = (self.csr.fcsr & !0x1F) | (apply(op, old, operand) as u32 & 0x1F);
                    self.csr.set_fs_dirty();
                }
                *value = old;
            }
            CSR_FRM => {
                if !self.csr.fpu_enabled() {
                    return false;
                }
                let old = ((self.csr.fcsr >> 5) & 7) as u64;
                if wr {
                    let new = apply(op, old, operand) as u32 & 7;
                    self.csr.fcsr = (self.csr.fcsr & !(7 << 5)) | (new << 5);
                    self.csr.set_fs_dirty();
                }
                *value = old;
            }
            CSR_FCSR => {
                if !self.csr.fpu_enabled() {
                    return false;
                }
                let old = (self.csr.fcsr & 0xFF) as u64;
                if wr {
                    self.csr.fcsr = apply(op, old, operand) as u32 & 0xFF;
                    self.csr.set_fs_dirty();
                }
                *value = old;
            }
            CSR_SEED => {
                // Zkr requires a write on every access.
                if op != CsrOp::Swap || !self.seed_allowed() {
                    return false;
                }
                // The read is the side effect here: a suppressed read
                // (rd = x0) must not consume entropy.
                if read {
                    let entropy = SEED_RNG.lock().unwrap().next_u32() as u64 & 0xFFFF;
                    // OPST = ES16: 16 valid entropy bits.
                    *value = (0b10 << 30) | entropy;
                } else {
                    *value = 0;
                }
            }
            CSR_CYCLE => {
                if !self.counter_allowed(COUNTEREN_CY) {
                    return false;
                }
                *value = self.csr.mcycle;
            }
            CSR_TIME => {
                if !self.counter_allowed(COUNTEREN_TM) {
                    return false;
                }
                *value = self.shared.timer().now();
            }
            CSR_INSTRET => {
                if !self.counter_allowed(COUNTEREN_IR) {
                    return false;
                }
                *value = self.csr.minstret;
            }
            CSR_CYCLEH if !self.rv64 => {
                if !self.counter_allowed(COUNTEREN_CY) {
                    return false;
                }
                *value = self.csr.mcycle >> 32;
            }
            CSR_TIMEH if !self.rv64 => {
                if !self.counter_allowed(COUNTEREN_TM) {
                    return false;
                }
                *value = self.shared.timer().now() >> 32;
            }
            CSR_INSTRETH if !self.rv64 => {
                if !self.counter_allowed(COUNTEREN_IR) {
                    return false;
                }
                *value = self.csr.minstret >> 32;
            }

            CSR_SSTATUS => {
                let old = self.csr.read_status(self.rv64) & (SSTATUS_READABLE | 1 << 63 | 1 << 31);
                if wr {
                    self.write_status(apply(op, old, operand), SSTATUS_WRITABLE);
                }
                *value = old;
            }
            CSR_SIE => {
                let old = self.csr.ie & self.csr.ideleg;
                if wr {
                    let new = apply(op, old, operand) & self.csr.ideleg & IRQ_MASK_S;
                    self.csr.ie = (self.csr.ie & !self.csr.ideleg) | new;
                    self.shared.kick();
                }
                *value = old;
            }
            CSR_STVEC => {
                let old = self.csr.stvec;
                if wr {
                    self.csr.stvec = apply(op, old, operand) & !2;
                }
                *value = old;
            }
            CSR_SCOUNTEREN => {
                let old = self.csr.scounteren as u64;
                if wr {
                    self.csr.scounteren = apply(op, old, operand) as u32 & COUNTEREN_MASK;
                }
                *value = old;
            }
            CSR_SENVCFG => {
                let old = self.csr.senvcfg;
                if wr {
                    // FIOM only.
                    self.csr.senvcfg = apply(op, old, operand) & 1;
                }
                *value = old;
            }
            CSR_SSCRATCH => {
                let old = self.csr.sscratch;
                if wr {
                    self.csr.sscratch = apply(op, old, operand);
                }
                *value = old;
            }
            CSR_SEPC => {
                let old = self.csr.sepc;
                if wr {
                    self.csr.sepc = apply(op, old, operand) & !1;
                }
                *value = old;
            }
            CSR_SCAUSE => {
                let old = self.csr.scause;
                if wr {
                    self.csr.scause = apply(op, old, operand);
                }
                *value = old;
            }
            CSR_STVAL => {
                let old = self.csr.stval;
                if wr {
                    self.csr.stval = apply(op, old, operand);
                }
                *value = old;
            }
            CSR_SIP => {
                let pending = self.shared.pending_bits(self.csr.stce());
                let old = pending & self.csr.ideleg;
                if wr {
                    // Only SSIP is software-writable from S.
                    let writable = crate::trap::Interrupt::SupervisorSoftware.mask() & self.csr.ideleg;
                    let new = apply(op, old, operand);
                    self.shared.ip_set(new & writable);
                    self.shared.ip_clear(!new & writable);
                    self.shared.kick();
                }
                *value = old;
            }
            CSR_STIMECMP if self.rv64 => {
                if !self.csr.stce() && self.prv < Privilege::Machine {
                    return false;
                }
                let old = self.shared.stimecmp().get();
                if wr {
                    self.shared.stimecmp().set(apply(op, old, operand));
                    // Arm or retract the supervisor timer immediately.
                    self.shared.request_event(crate::hart::EV_TIMER);
                }
                *value = old;
            }
            CSR_STIMECMP if !self.rv64 => {
                if !self.csr.stce() && self.prv < Privilege::Machine {
                    return false;
                }
                let cmp = self.shared.stimecmp().get();
                let old = cmp & 0xFFFF_FFFF;
                if wr {
                    self.shared.stimecmp().set((cmp & !0xFFFF_FFFF) | (apply(op, old, operand) & 0xFFFF_FFFF));
                    self.shared.request_event(crate::hart::EV_TIMER);
                }
                *value = old;
            }
            CSR_STIMECMPH if !self.rv64 => {
                if !self.csr.stce() && self.prv < Privilege::Machine {
                    return false;
                }
                let cmp = self.shared.stimecmp().get();
                let old = cmp >> 32;
                if wr {
                    self.shared.stimecmp().set((cmp & 0xFFFF_FFFF) | (apply(op, old, operand) << 32));
                    self.shared.request_event(crate::hart::EV_TIMER);
                }
                *value = old;
            }
            CSR_SATP => {
                if self.prv == Privilege::Supervisor && self.csr.status & STATUS_TVM != 0 {
                    return false;
                }
                let old = self.csr.satp;
                if wr {
                    self.write_satp(apply(op, old, operand));
                }
                *value = old;
            }

            CSR_MSTATUS => {
                let old = self.csr.read_status(self.rv64);
                if wr {
                    self.write_status(apply(op, old, operand), MSTATUS_WRITABLE | STATUS_UXL | STATUS_SXL);
                }
                *value = old;
            }
            CSR_MSTATUSH if !self.rv64 => {
                // Little-endian only: MBE/SBE are hardwired to zero.
                *value = 0;
            }
            CSR_MISA => {
                let old = self.csr.read_misa(self.rv64);
                if wr && self.rv64_machine {
                    let mxl_shift = if self.rv64 { 62 } else { 30 };
                    match (apply(op, old, operand) >> mxl_shift) & 3 {
                        1 => self.csr.mxl64 = false,
                        2 => self.csr.mxl64 = true,
                        _ => {}
                    }
                    self.update_xlen();
                }
                *value = old;
            }
            CSR_MEDELEG => {
                let old = self.csr.edeleg;
                if wr {
                    self.csr.edeleg = apply(op, old, operand) & MEDELEG_MASK;
                }
                *value = old;
            }
            CSR_MIDELEG => {
                let old = self.csr.ideleg;
                if wr {
                    self.csr.ideleg = apply(op, old, operand) & IRQ_MASK_S;
                }
                *value = old;
            }
            CSR_MIE => {
                let old = self.csr.ie;
                if wr {
                    self.csr.ie = apply(op, old, operand) & IRQ_MASK_ALL;
                    self.shared.kick();
                }
                *value = old;
            }
            CSR_MTVEC => {
                let old = self.csr.mtvec;
                if wr {
                    self.csr.mtvec = apply(op, old, operand) & !2;
                }
                *value = old;
            }
            CSR_MCOUNTEREN => {
                let old = self.csr.mcounteren as u64;
                if wr {
                    self.csr.mcounteren = apply(op, old, operand) as u32 & COUNTEREN_MASK;
                }
                *value = old;
            }
            CSR_MENVCFG => {
                let old = self.csr.menvcfg;
                if wr {
                    if self.rv64 {
                        self.csr.menvcfg = apply(op, old, operand) & (MENVCFG_STCE | 1);
                    } else {
                        // RV32 window covers the low word only; STCE lives
                        // in menvcfgh.
                        let new = apply(op, old & 0xFFFF_FFFF, operand) & 1;
                        self.csr.menvcfg = (old & !0xFFFF_FFFF) | new;
                    }
                    self.shared.kick();
                }
                *value = old;
            }
            CSR_MENVCFGH if !self.rv64 => {
                let old = self.csr.menvcfg >> 32;
                if wr {
                    let new = apply(op, old, operand) & (1 << 31);
                    self.csr.menvcfg = (self.csr.menvcfg & 0xFFFF_FFFF) | (new << 32);
                    self.shared.kick();
                }
                *value = old;
            }
            CSR_MSCRATCH => {
                let old = self.csr.mscratch;
                if wr {
                    self.csr.mscratch = apply(op, old, operand);
                }
                *value = old;
            }
            CSR_MEPC => {
                let old = self.csr.mepc;
                if wr {
                    self.csr.mepc = apply(op, old, operand) & !1;
                }
                *value = old;
            }
            CSR_MCAUSE => {
                let old = self.csr.mcause;
                if wr {
                    self.csr.mcause = apply(op, old, operand);
                }
                *value = old;
            }
            CSR_MTVAL => {
                let old = self.csr.mtval;
                if wr {
                    self.csr.mtval = apply(op, old, operand);
                }
                *value = old;
            }
            CSR_MIP => {
                let old = self.shared.pending_bits(self.csr.stce());
                if wr {
                    // MSIP and MTIP come from the CLINT and the comparator;
                    // software may drive the supervisor bits and SEIP.
                    let writable = (1 << 1) | (1 << 5) | (1 << 9);
                    let new = apply(op, old, operand);
                    self.shared.ip_set(new & writable);
                    self.shared.ip_clear(!new & writable);
                    self.shared.kick();
                }
                *value = old;
            }
            CSR_MSECCFG => {
                let old = self.csr.mseccfg;
                if wr {
                    self.csr.mseccfg = apply(op, old, operand) & (MSECCFG_USEED | MSECCFG_SSEED);
                }
                *value = old;
            }
            CSR_MCYCLE => {
                let old = self.csr.mcycle;
                if wr {
                    self.csr.mcycle = apply(op, old, operand);
                }
                *value = old;
            }
            CSR_MINSTRET => {
                let old = self.csr.minstret;
                if wr {
                    self.csr.minstret = apply(op, old, operand);
                }
                *value = old;
            }
            CSR_MCYCLEH if !self.rv64 => {
                let old = self.csr.mcycle >> 32;
                if wr {
                    self.csr.mcycle =
                        (self.csr.mcycle & 0xFFFF_FFFF) | (apply(op, old, operand) << 32);
                }
                *value = old;
            }
            CSR_MINSTRETH if !self.rv64 => {
                let old = self.csr.minstret >> 32;
                if wr {
                    self.csr.minstret =
                        (self.csr.minstret & 0xFFFF_FFFF) | (apply(op, old, operand) << 32);
                }
                *value = old;
            }
            CSR_MVENDORID | CSR_MARCHID | CSR_MIMPID => {
                *value = 0;
            }
            CSR_MHARTID => {
                *value = self.csr.hartid;
            }
            _ => return false,
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hart::HartShared;
    use crate::mem::AddressSpace;
    use std::sync::Arc;

    fn hart(rv64: bool) -> Hart {
        let mem = Arc::new(AddressSpace::new(crate::RAM_BASE, 0x10000).unwrap());
        Hart::new(mem, Arc::new(HartShared::new(3)), rv64)
    }

    fn swap(hart: &mut Hart, id: u32, val: u64) -> Option<u64> {
        let mut v = val;
        hart.csr_op(id, &mut v, CsrOp::Swap).then(|| v)
    }

    fn read(hart: &mut Hart, id: u32) -> Option<u64> {
        let mut v = 0;
        hart.csr_op(id, &mut v, CsrOp::SetBits).then(|| v)
    }

    #[test]
    fn unknown_csr_fails() {
        let mut hart = hart(true);
        assert!(read(&mut hart, 0x123).is_none());
    }

    #[test]
    fn privilege_gate() {
        let mut hart = hart(true);
        hart.prv = Privilege::User;
        assert!(read(&mut hart, CSR_MSTATUS).is_none());
        assert!(read(&mut hart, CSR_SSCRATCH).is_none());
        hart.prv = Privilege::Supervisor;
        assert!(read(&mut hart, CSR_SSCRATCH).is_some());
        assert!(read(&mut hart, CSR_MSTATUS).is_none());
    }

    #[test]
    fn read_only_rejects_writes() {
        let mut hart = hart(true);
        assert!(swap(&mut hart, CSR_MHARTID, 0).is_none());
        let mut v = 1;
        assert!(!hart.csr_op(CSR_MHARTID, &mut v, CsrOp::SetBits));
        // A zero set/clear is a plain read.
        assert_eq!(read(&mut hart, CSR_MHARTID), Some(3));
        assert_eq!(read(&mut hart, CSR_MVENDORID), Some(0));
    }

    #[test]
    fn scratch_swap_round_trip() {
        let mut hart = hart(true);
        assert_eq!(swap(&mut hart, CSR_MSCRATCH, 0x1234), Some(0));
        assert_eq!(swap(&mut hart, CSR_MSCRATCH, 0), Some(0x1234));
        let mut v = 0xF0;
        assert!(hart.csr_op(CSR_MSCRATCH, &mut v, CsrOp::SetBits));
        let mut v = 0x10;
        assert!(hart.csr_op(CSR_MSCRATCH, &mut v, CsrOp::ClearBits));
        assert_eq!(read(&mut hart, CSR_MSCRATCH), Some(0xE0));
    }

    #[test]
    fn mstatus_sd_is_read_only_and_mpp_warl() {
        let mut hart = hart(true);
        let before = read(&mut hart, CSR_MSTATUS).unwrap();
        // Scenario: writing only the SD bit changes nothing it shouldn't.
        let old = swap(&mut hart, CSR_MSTATUS, 1 << 63).unwrap();
        assert_eq!(old, before);
        let now = read(&mut hart, CSR_MSTATUS).unwrap();
        assert_eq!(now & STATUS_FS, 0, "FS was cleared by the write");
        assert_eq!(now & (1 << 63), 0, "SD follows FS, not the write");
        // MPP=2 is reserved; the old value is kept.
        swap(&mut hart, CSR_MSTATUS, 3 << 11).unwrap();
        swap(&mut hart, CSR_MSTATUS, 2 << 11).unwrap();
        assert_eq!(read(&mut hart, CSR_MSTATUS).unwrap() & STATUS_MPP, 3 << 11);
    }

    #[test]
    fn fs_dirty_sets_sd() {
        let mut hart = hart(true);
        swap(&mut hart, CSR_FCSR, 0x1).unwrap();
        let status = read(&mut hart, CSR_MSTATUS).unwrap();
        assert_eq!(status & STATUS_FS, STATUS_FS);
        assert_ne!(status & (1 << 63), 0);
    }

    #[test]
    fn fflags_frm_fcsr_views() {
        let mut hart = hart(true);
        swap(&mut hart, CSR_FCSR, 0b101_11011).unwrap();
        assert_eq!(read(&mut hart, CSR_FFLAGS), Some(0b11011));
        assert_eq!(read(&mut hart, CSR_FRM), Some(0b101));
        swap(&mut hart, CSR_FRM, 0b010).unwrap();
        assert_eq!(read(&mut hart, CSR_FCSR), Some(0b010_11011));
        // FS off: the whole FPU CSR window is illegal.
        hart.write_status(hart.csr.status & !STATUS_FS, STATUS_FS);
        assert!(read(&mut hart, CSR_FFLAGS).is_none());
    }

    #[test]
    fn sstatus_is_a_window() {
        let mut hart = hart(true);
        swap(&mut hart, CSR_MSTATUS, STATUS_MIE | STATUS_SIE | STATUS_SUM).unwrap();
        let sview = read(&mut hart, CSR_SSTATUS).unwrap();
        assert_ne!(sview & STATUS_SIE, 0);
        assert_ne!(sview & STATUS_SUM, 0);
        assert_eq!(sview & STATUS_MIE, 0, "MIE must not leak into sstatus");
        // Writing sstatus cannot touch MIE.
        swap(&mut hart, CSR_SSTATUS, 0).unwrap();
        assert_ne!(read(&mut hart, CSR_MSTATUS).unwrap() & STATUS_MIE, 0);
    }

    #[test]
    fn satp_warl_ignores_bad_mode() {
        let mut hart = hart(true);
        let ppn = (crate::RAM_BASE + 0x1000) >> 12;
        assert_eq!(swap(&mut hart, CSR_SATP, (8 << 60) | ppn), Some(0));
        assert_eq!(hart.mmu_mode, MmuMode::Sv39);
        assert_eq!(hart.root_pt, crate::RAM_BASE + 0x1000);
        // Sv32 on RV64 is unsupported: write ignored wholesale.
        swap(&mut hart, CSR_SATP, 1 << 60).unwrap();
        assert_eq!(hart.mmu_mode, MmuMode::Sv39);
        assert_eq!(read(&mut hart, CSR_SATP), Some((8 << 60) | ppn));
    }

    #[test]
    fn satp_tvm_traps_from_s() {
        let mut hart = hart(true);
        swap(&mut hart, CSR_MSTATUS, STATUS_TVM).unwrap();
        hart.prv = Privilege::Supervisor;
        assert!(read(&mut hart, CSR_SATP).is_none());
    }

    #[test]
    fn time_gating_by_counteren() {
        let mut hart = hart(true);
        assert!(read(&mut hart, CSR_TIME).is_some());
        hart.prv = Privilege::Supervisor;
        assert!(read(&mut hart, CSR_TIME).is_none());
        hart.prv = Privilege::Machine;
        swap(&mut hart, CSR_MCOUNTEREN, COUNTEREN_TM as u64).unwrap();
        hart.prv = Privilege::Supervisor;
        assert!(read(&mut hart, CSR_TIME).is_some());
        hart.prv = Privilege::User;
        assert!(read(&mut hart, CSR_TIME).is_none());
    }

    #[test]
    fn stimecmp_arms_supervisor_timer() {
        let mut hart = hart(true);
        // Sstc disabled: S-mode access is illegal.
        hart.prv = Privilege::Supervisor;
        assert!(read(&mut hart, CSR_STIMECMP).is_none());
        hart.prv = Privilege::Machine;
        swap(&mut hart, CSR_MENVCFG, MENVCFG_STCE).unwrap();
        hart.prv = Privilege::Supervisor;
        swap(&mut hart, CSR_STIMECMP, 0).unwrap();
        assert_ne!(
            hart.shared.pending_bits(true) & crate::trap::Interrupt::SupervisorTimer.mask(),
            0
        );
        swap(&mut hart, CSR_STIMECMP, u64::MAX).unwrap();
        assert_eq!(
            hart.shared.pending_bits(true) & crate::trap::Interrupt::SupervisorTimer.mask(),
            0
        );
    }

    #[test]
    fn seed_requires_write_and_gate() {
        let mut hart = hart(true);
        assert!(read(&mut hart, CSR_SEED).is_none(), "seed reads must use a write op");
        let v = swap(&mut hart, CSR_SEED, 0).unwrap();
        assert_eq!(v >> 30, 0b10, "OPST must be ES16");
        hart.prv = Privilege::User;
        assert!(swap(&mut hart, CSR_SEED, 0).is_none());
        hart.prv = Privilege::Machine;
        swap(&mut hart, CSR_MSECCFG, MSECCFG_USEED).unwrap();
        hart.prv = Privilege::User;
        assert!(swap(&mut hart, CSR_SEED, 0).is_some());
        // CSRRW with rd = x0 suppresses the read leg: the access still
        // succeeds but returns nothing and consumes no entropy.
        let mut v = 7;
        assert!(hart.csr_access(CSR_SEED, &mut v, CsrOp::Swap, false));
        assert_eq!(v, 0);
        // The gates are not relaxed by the suppressed read.
        hart.prv = Privilege::Supervisor;
        let mut v = 0;
        assert!(!hart.csr_access(CSR_SEED, &mut v, CsrOp::Swap, false));
    }

    #[test]
    fn rv32_sign_extends_results() {
        let mut hart = hart(false);
        swap(&mut hart, CSR_MSCRATCH, 0x8000_0000).unwrap();
        assert_eq!(read(&mut hart, CSR_MSCRATCH), Some(0xFFFF_FFFF_8000_0000));
        // High-half counter views exist on RV32 only.
        assert!(read(&mut hart, CSR_MCYCLEH).is_some());
        let mut hart64 = self::hart(true);
        assert!(read(&mut hart64, CSR_MCYCLEH).is_none());
    }

    #[test]
    fn misa_mxl_switches_xlen() {
        let mut hart = hart(true);
        let misa = read(&mut hart, CSR_MISA).unwrap();
        assert_eq!(misa >> 62, 2);
        assert_ne!(misa & (1 << 2), 0, "C extension advertised");
        swap(&mut hart, CSR_MISA, (1 << 62) | (misa & 0x3FF_FFFF)).unwrap();
        assert!(!hart.rv64());
        // Back to RV64: the MXL field now sits at bit 30.
        let misa32 = read(&mut hart, CSR_MISA).unwrap() as u32 as u64;
        assert_eq!(misa32 >> 30, 1);
        swap(&mut hart, CSR_MISA, 2 << 30).unwrap();
        assert!(hart.rv64());
    }

    #[test]
    fn mip_software_bits() {
        let mut hart = hart(true);
        swap(&mut hart, CSR_MIP, 1 << 1).unwrap();
        assert_ne!(hart.shared.ip_raw() & (1 << 1), 0);
        swap(&mut hart, CSR_MIP, 0).unwrap();
        assert_eq!(hart.shared.ip_raw() & (1 << 1), 0);
        // MSIP is not software-writable through mip.
        swap(&mut hart, CSR_MIP, 1 << 3).unwrap();
        assert_eq!(hart.shared.ip_raw() & (1 << 3), 0);
    }
}
