// SPDX-License-Identifier: Apache-2.0

//! Hart state and the per-hart run loop.
//!
//! A hart is owned by exactly one thread at a time: the machine while
//! paused, its dispatch thread while running. Everything other threads may
//! touch lives in [`HartShared`] behind an `Arc`: pending interrupt bits,
//! the event mask, the wait-event word, the WFI condvar and the timer.
//!
//! The dispatch loop is the only place traps are materialized: instruction
//! handlers return `Err(Trap)` and the loop performs trap entry, so an
//! instruction that faults has made no architectural progress beyond the
//! trap CSRs themselves.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use crate::clock::{Timecmp, Timer, TIMER_FREQ};
use crate::csr::{self, CsrFile};
use crate::decode::Decoder;
use crate::mem::{read_le, write_le, AddressSpace};
use crate::mmu::{self, Access, MmuMode};
use crate::sync::WaitCell;
use crate::tlb::Tlb;
use crate::trap::{Exception, Interrupt, Privilege, Trap};
use crate::{PAGE_MASK, PAGE_SIZE};

/// Event-mask bits.
pub const EV_PAUSE: u32 = 1 << 0;
pub const EV_TIMER: u32 = 1 << 1;

/// How many instructions the fast path may retire between forced event
/// polls. Bounds interrupt latency when nobody kicks the wait-event word.
const EVENT_POLL_INTERVAL: u32 = 256;

/// Upper bound for a single WFI park, so a hart never oversleeps a timer
/// that gets rearmed without a kick.
const WFI_MAX_PARK_NS: u64 = 10_000_000;

/// Cross-thread face of a hart.
pub struct HartShared {
    hartid: u64,
    /// Pending interrupt bits asserted from outside the hart (MSIP, MEIP,
    /// SEIP, SSIP). Timer bits are derived from the comparators instead of
    /// being stored, so a comparator moved into the future retracts its
    /// interrupt without extra bookkeeping.
    ip: AtomicU64,
    /// PAUSE/TIMER request bits, consumed by the dispatch loop.
    ev: AtomicU32,
    /// Non-zero tells the fast path to bail out and look at everything
    /// else. Stored with release by producers, read with acquire.
    wait_event: AtomicU32,
    wait: WaitCell,
    timer: Timer,
    mtimecmp: Timecmp,
    stimecmp: Timecmp,
}

impl HartShared {
    pub fn new(hartid: u64) -> HartShared {
        HartShared {
            hartid,
            ip: AtomicU64::new(0),
            ev: AtomicU32::new(0),
            wait_event: AtomicU32::new(0),
            wait: WaitCell::new(),
            timer: Timer::new(TIMER_FREQ),
            mtimecmp: Timecmp::new(),
            stimecmp: Timecmp::new(),
        }
    }

    pub fn hartid(&self) -> u64 { self.hartid }

    pub fn timer(&self) -> &Timer { &self.timer }

    pub fn mtimecmp(&self) -> &Timecmp { &self.mtimecmp }

    pub fn stimecmp(&self) -> &Timecmp { &self.stimecmp }

    /// Force the hart off its fast path and out of WFI.
    pub fn kick(&self) {
        self.wait_event.store(1, Ordering::Release);
        self.wait.wake();
    }

    /// Assert a pending interrupt bit (`mip` bit position).
    pub fn interrupt(&self, bit: u32) {
        self.ip.fetch_or(1 << bit, Ordering::Release);
        self.kick();
    }

    /// Retract a pending interrupt bit.
    pub fn interrupt_clear(&self, bit: u32) {
        self.ip.fetch_and(!(1u64 << bit), Ordering::Release);
        self.kick();
    }

    pub fn request_event(&self, ev: u32) {
        self.ev.fetch_or(ev, Ordering::Release);
        self.kick();
    }

    /// The externally-asserted bits, without timer derivation.
    pub fn ip_raw(&self) -> u64 {
        self.ip.load(Ordering::Acquire)
    }

    pub(crate) fn ip_set(&self, bits: u64) {
        self.ip.fetch_or(bits, Ordering::Release);
    }

    pub(crate) fn ip_clear(&self, bits: u64) {
        self.ip.fetch_and(!bits, Ordering::Release);
    }

    /// Full pending picture: asserted bits plus comparator-derived timer
    /// bits. `stce` gates the Sstc supervisor comparator.
    pub fn pending_bits(&self, stce: bool) -> u64 {
        let mut bits = self.ip.load(Ordering::Acquire);
        if self.mtimecmp.pending(&self.timer) {
            bits |= Interrupt::MachineTimer.mask();
        }
        if stce && self.stimecmp.pending(&self.timer) {
            bits |= Interrupt::SupervisorTimer.mask();
        }
        bits
    }

    /// Nanoseconds until the nearest armed comparator, for WFI parking.
    fn next_timer_ns(&self, stce: bool) -> u64 {
        let mut ns = WFI_MAX_PARK_NS;
        if let Some(t) = self.mtimecmp.ns_until(&self.timer) {
            ns = ns.min(t);
        }
        if stce {
            if let Some(t) = self.stimecmp.ns_until(&self.timer) {
                ns = ns.min(t);
            }
        }
        ns
    }
}

/// LR/SC reservation: physical address plus the value observed by LR. Any
/// trap, xRET or WFI clears it; the SC itself is a compare-and-swap so a
/// clobbering store from another hart fails the pair even if the
/// reservation survives.
#[derive(Clone, Copy)]
pub(crate) struct Reservation {
    pub paddr: u64,
    pub value: u64,
    pub wide: bool,
}

/// Where a translated access landed.
pub(crate) enum PhysTarget {
    Ram(*mut u8),
    Mmio(u64),
}

pub struct Hart {
    pub regs: [u64; 32],
    pub fregs: [u64; 32],
    pub pc: u64,
    pub csr: CsrFile,
    pub(crate) decoder: Box<Decoder>,
    pub(crate) tlb: Tlb,
    pub(crate) prv: Privilege,
    pub(crate) rv64: bool,
    /// Widest XLEN this hart supports (the build/default ISA).
    pub(crate) rv64_machine: bool,
    pub(crate) mmu_mode: MmuMode,
    pub(crate) root_pt: u64,
    pub(crate) reservation: Option<Reservation>,
    pub shared: Arc<HartShared>,
    pub(crate) mem: Arc<AddressSpace>,
    poll_countdown: u32,
}

// The TLB holds raw pointers into the machine's RAM buffer, which outlives
// every hart and never moves. A hart is only ever driven from one thread at
// a time, so handing it to that thread is sound.
unsafe impl Send for Hart {}

impl Hart {
    pub fn new(mem: Arc<AddressSpace>, shared: Arc<HartShared>, rv64: bool) -> Hart {
        let hartid = shared.hartid();
        let mut hart = Hart {
            regs: [0; 32],
            fregs: [0; 32],
            pc: mem.ram_base(),
            csr: CsrFile::new(rv64, hartid),
            decoder: Box::new(Decoder::build(rv64, true)),
            tlb: Tlb::new(),
            prv: Privilege::Machine,
            rv64,
            rv64_machine: rv64,
            mmu_mode: MmuMode::Bare,
            root_pt: 0,
            reservation: None,
            shared,
            mem,
            poll_countdown: EVENT_POLL_INTERVAL,
        };
        hart.rebuild_decoder();
        hart
    }

    /// Back to the reset vector with M-mode power-on state.
    pub fn reset(&mut self) {
        self.regs = [0; 32];
        self.fregs = [0; 32];
        self.pc = self.mem.ram_base();
        self.prv = Privilege::Machine;
        self.rv64 = self.rv64_machine;
        self.csr = CsrFile::new(self.rv64_machine, self.shared.hartid());
        self.mmu_mode = MmuMode::Bare;
        self.root_pt = 0;
        self.reservation = None;
        self.tlb.flush();
        self.rebuild_decoder();
    }

    #[inline]
    pub fn x(&self, r: usize) -> u64 {
        self.regs[r]
    }

    #[inline]
    pub fn set_x(&mut self, r: usize, v: u64) {
        if r != 0 {
            self.regs[r] = v;
        }
    }

    pub fn privilege(&self) -> Privilege { self.prv }

    /// Drop the hart into another privilege mode (embedder setup while the
    /// machine is paused, e.g. booting a payload in S-mode).
    pub fn set_privilege(&mut self, prv: Privilege) {
        self.prv = prv;
        self.update_xlen();
        self.tlb.flush();
    }

    pub fn rv64(&self) -> bool { self.rv64 }

    /// Truncate an address to the current XLEN.
    #[inline]
    pub(crate) fn vaddr(&self, v: u64) -> u64 {
        if self.rv64 { v } else { v as u32 as u64 }
    }

    /// Set the program counter to a jump target.
    #[inline]
    pub(crate) fn set_pc(&mut self, target: u64) {
        self.pc = self.vaddr(target);
    }

    #[inline]
    pub(crate) fn advance(&mut self, len: u64) {
        self.pc = self.vaddr(self.pc.wrapping_add(len));
    }

    pub(crate) fn rebuild_decoder(&mut self) {
        *self.decoder = Decoder::build(self.rv64, self.csr.fpu_enabled());
    }

    /// Effective privilege of a data access: M-mode with MPRV=1 uses MPP.
    fn effective_prv(&self, access: Access) -> Privilege {
        if access != Access::Exec
            && self.prv == Privilege::Machine
            && self.csr.status & csr::STATUS_MPRV != 0
        {
            Privilege::from_bits((self.csr.status >> 11) & 3)
        } else {
            self.prv
        }
    }

    /// Resolve one page-local access to a host pointer or an MMIO physical
    /// address, filling the TLB on the way.
    pub(crate) fn translate(&mut self, vaddr: u64, access: Access) -> Result<PhysTarget, Trap> {
        let prv = self.effective_prv(access);
        if let Some(ptr) = self.tlb.lookup(access, vaddr, prv) {
            return Ok(PhysTarget::Ram(ptr));
        }
        let mode = if prv == Privilege::Machine { MmuMode::Bare } else { self.mmu_mode };
        let status = self.csr.status;
        let paddr = mmu::walk(
            &self.mem,
            mode,
            self.root_pt,
            vaddr,
            access,
            prv,
            status & csr::STATUS_SUM != 0,
            status & csr::STATUS_MXR != 0,
        )?;
        match self.mem.host_page(paddr & !PAGE_MASK) {
            Some(page) => {
                self.tlb.insert(access, vaddr, prv, page);
                Ok(PhysTarget::Ram(unsafe { page.add((vaddr & PAGE_MASK) as usize) }))
            }
            None => Ok(PhysTarget::Mmio(paddr)),
        }
    }

    /// Translate to a physical address without caching (AMO slow path).
    pub(crate) fn translate_phys(&mut self, vaddr: u64, access: Access) -> Result<u64, Trap> {
        let prv = self.effective_prv(access);
        let mode = if prv == Privilege::Machine { MmuMode::Bare } else { self.mmu_mode };
        let status = self.csr.status;
        mmu::walk(
            &self.mem,
            mode,
            self.root_pt,
            vaddr,
            access,
            prv,
            status & csr::STATUS_SUM != 0,
            status & csr::STATUS_MXR != 0,
        )
    }

    /// Page-local virtual read. `buf` must not cross a page boundary.
    fn mem_read_page(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<(), Trap> {
        debug_assert!((vaddr & PAGE_MASK) + buf.len() as u64 <= PAGE_SIZE);
        match self.translate(vaddr, Access::Read)? {
            PhysTarget::Ram(ptr) => {
                unsafe { core::ptr::copy_nonoverlapping(ptr, buf.as_mut_ptr(), buf.len()) };
                Ok(())
            }
            PhysTarget::Mmio(paddr) => {
                if self.mem.read_phys(paddr, buf) {
                    Ok(())
                } else {
                    Err(Trap::new(Exception::LoadAccessFault, vaddr))
                }
            }
        }
    }

    fn mem_write_page(&mut self, vaddr: u64, buf: &[u8]) -> Result<(), Trap> {
        debug_assert!((vaddr & PAGE_MASK) + buf.len() as u64 <= PAGE_SIZE);
        match self.translate(vaddr, Access::Write)? {
            PhysTarget::Ram(ptr) => {
                unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), ptr, buf.len()) };
                Ok(())
            }
            PhysTarget::Mmio(paddr) => {
                if self.mem.write_phys(paddr, buf) {
                    Ok(())
                } else {
                    Err(Trap::new(Exception::StoreAccessFault, vaddr))
                }
            }
        }
    }

    /// Virtual read of up to 8 bytes; misaligned accesses that cross a page
    /// are split at the boundary.
    pub(crate) fn mem_read(&mut self, vaddr: u64, buf: &mut [u8]) -> Result<(), Trap> {
        let in_page = (PAGE_SIZE - (vaddr & PAGE_MASK)) as usize;
        if buf.len() <= in_page {
            self.mem_read_page(vaddr, buf)
        } else {
            let (lo, hi) = buf.split_at_mut(in_page);
            self.mem_read_page(vaddr, lo)?;
            self.mem_read_page(self.vaddr(vaddr.wrapping_add(in_page as u64)), hi)
        }
    }

    pub(crate) fn mem_write(&mut self, vaddr: u64, buf: &[u8]) -> Result<(), Trap> {
        let in_page = (PAGE_SIZE - (vaddr & PAGE_MASK)) as usize;
        if buf.len() <= in_page {
            self.mem_write_page(vaddr, buf)
        } else {
            let (lo, hi) = buf.split_at(in_page);
            self.mem_write_page(vaddr, lo)?;
            self.mem_write_page(self.vaddr(vaddr.wrapping_add(in_page as u64)), hi)
        }
    }

    pub(crate) fn load_u8(&mut self, va: u64) -> Result<u8, Trap> {
        let mut b = [0u8; 1];
        self.mem_read(va, &mut b)?;
        Ok(b[0])
    }

    pub(crate) fn load_u16(&mut self, va: u64) -> Result<u16, Trap> {
        let mut b = [0u8; 2];
        self.mem_read(va, &mut b)?;
        Ok(read_le(&b) as u16)
    }

    pub(crate) fn load_u32(&mut self, va: u64) -> Result<u32, Trap> {
        let mut b = [0u8; 4];
        self.mem_read(va, &mut b)?;
        Ok(read_le(&b) as u32)
    }

    pub(crate) fn load_u64(&mut self, va: u64) -> Result<u64, Trap> {
        let mut b = [0u8; 8];
        self.mem_read(va, &mut b)?;
        Ok(read_le(&b))
    }

    pub(crate) fn store_u8(&mut self, va: u64, v: u8) -> Result<(), Trap> {
        self.mem_write(va, &[v])
    }

    pub(crate) fn store_u16(&mut self, va: u64, v: u16) -> Result<(), Trap> {
        let mut b = [0u8; 2];
        write_le(&mut b, v as u64);
        self.mem_write(va, &b)
    }

    pub(crate) fn store_u32(&mut self, va: u64, v: u32) -> Result<(), Trap> {
        let mut b = [0u8; 4];
        write_le(&mut b, v as u64);
        self.mem_write(va, &b)
    }

    pub(crate) fn store_u64(&mut self, va: u64, v: u64) -> Result<(), Trap> {
        let mut b = [0u8; 8];
        write_le(&mut b, v);
        self.mem_write(va, &b)
    }

    /// Fetch 16 bits of instruction stream through the execute TLB.
    fn fetch_u16(&mut self, va: u64) -> Result<u16, Trap> {
        match self.translate(va, Access::Exec)? {
            PhysTarget::Ram(ptr) => Ok(u16::from_le(unsafe { (ptr as *const u16).read_unaligned() })),
            PhysTarget::Mmio(paddr) => {
                let mut b = [0u8; 2];
                if self.mem.read_phys(paddr, &mut b) {
                    Ok(read_le(&b) as u16)
                } else {
                    Err(Trap::new(Exception::InstructionAccessFault, va))
                }
            }
        }
    }

    fn dispatch(&mut self) -> Result<(), Trap> {
        let pc = self.pc;
        let lo = self.fetch_u16(pc)? as u32;
        if lo & 3 == 3 {
            let hi = self.fetch_u16(self.vaddr(pc.wrapping_add(2)))? as u32;
            let insn = lo | (hi << 16);
            let handler = self.decoder.base[crate::decode::base_key(insn)];
            handler(self, insn)
        } else {
            let handler = self.decoder.compressed[crate::decode::c_key(lo)];
            handler(self, lo)
        }
    }

    /// Execute one instruction, performing trap entry if it faults.
    pub fn step(&mut self) {
        match self.dispatch() {
            Ok(()) => {
                self.csr.minstret = self.csr.minstret.wrapping_add(1);
            }
            Err(trap) => self.trap_enter(trap),
        }
        self.csr.mcycle = self.csr.mcycle.wrapping_add(1);
    }

    /// Synchronous trap entry. `self.pc` still points at the faulting
    /// instruction, which is exactly what belongs in `xepc`.
    pub fn trap_enter(&mut self, trap: Trap) {
        self.enter(trap.cause.code(), false, trap.tval);
    }

    fn enter(&mut self, code: u64, irq: bool, tval: u64) {
        let deleg = if irq { self.csr.ideleg } else { self.csr.edeleg };
        let to_s = self.prv <= Privilege::Supervisor && (deleg >> code) & 1 == 1;
        let status = self.csr.status;
        if to_s {
            self.csr.sepc = self.pc;
            self.csr.stval = tval;
            // SPIE <- SIE, SIE <- 0, SPP <- previous mode.
            let sie = (status >> 1) & 1;
            let mut s = status & !(csr::STATUS_SPIE | csr::STATUS_SIE | csr::STATUS_SPP);
            s |= sie << 5;
            if self.prv == Privilege::Supervisor {
                s |= csr::STATUS_SPP;
            }
            self.csr.set_status_raw(s);
            self.prv = Privilege::Supervisor;
            self.update_xlen();
            self.csr.scause = code | if irq { 1 << (self.xlen() - 1) } else { 0 };
            self.pc = vector(self.csr.stvec, code, irq);
        } else {
            self.csr.mepc = self.pc;
            self.csr.mtval = tval;
            let mie = (status >> 3) & 1;
            let mut s = status & !(csr::STATUS_MPIE | csr::STATUS_MIE | csr::STATUS_MPP);
            s |= mie << 7;
            s |= (self.prv as u64) << 11;
            self.csr.set_status_raw(s);
            self.prv = Privilege::Machine;
            self.update_xlen();
            self.csr.mcause = code | if irq { 1 << (self.xlen() - 1) } else { 0 };
            self.pc = vector(self.csr.mtvec, code, irq);
        }
        self.reservation = None;
    }

    fn xlen(&self) -> u32 {
        if self.rv64 { 64 } else { 32 }
    }

    /// Recompute the effective XLEN for the current privilege. Rebuilds the
    /// decoder and flushes the TLB when it changes. Must run after `status`
    /// commits (trap entry, xRET, status/misa writes).
    pub(crate) fn update_xlen(&mut self) {
        let new = if !self.rv64_machine {
            false
        } else {
            match self.prv {
                Privilege::Machine => self.csr.isa_rv64(),
                Privilege::Supervisor => (self.csr.status >> 34) & 3 != 1,
                Privilege::User => (self.csr.status >> 32) & 3 != 1,
            }
        };
        if new != self.rv64 {
            self.rv64 = new;
            self.tlb.flush();
            self.rebuild_decoder();
        }
    }

    pub(crate) fn do_mret(&mut self) {
        let status = self.csr.status;
        let mpp = Privilege::from_bits((status >> 11) & 3);
        let mpie = (status >> 7) & 1;
        let mut s = status & !(csr::STATUS_MIE | csr::STATUS_MPIE | csr::STATUS_MPP);
        s |= mpie << 3;
        s |= csr::STATUS_MPIE;
        if mpp != Privilege::Machine {
            s &= !csr::STATUS_MPRV;
        }
        self.csr.set_status_raw(s);
        self.prv = mpp;
        self.update_xlen();
        self.tlb.flush();
        self.set_pc(self.csr.mepc & !1);
        self.reservation = None;
    }

    pub(crate) fn do_sret(&mut self) {
        let status = self.csr.status;
        let spp =
            if status & csr::STATUS_SPP != 0 { Privilege::Supervisor } else { Privilege::User };
        let spie = (status >> 5) & 1;
        let mut s = status & !(csr::STATUS_SIE | csr::STATUS_SPIE | csr::STATUS_SPP);
        s |= spie << 1;
        s |= csr::STATUS_SPIE;
        if spp != Privilege::Machine {
            s &= !csr::STATUS_MPRV;
        }
        self.csr.set_status_raw(s);
        self.prv = spp;
        self.update_xlen();
        self.tlb.flush();
        self.set_pc(self.csr.sepc & !1);
        self.reservation = None;
    }

    /// Pick the highest-priority deliverable interrupt and enter its trap.
    /// Returns true if one was taken.
    pub(crate) fn check_interrupts(&mut self) -> bool {
        let pending = self.shared.pending_bits(self.csr.stce()) & self.csr.ie;
        if pending == 0 {
            return false;
        }
        let status = self.csr.status;
        for irq in Interrupt::PRIORITY {
            if pending & irq.mask() == 0 {
                continue;
            }
            let delegated = (self.csr.ideleg >> irq.code()) & 1 == 1;
            let take = if !delegated {
                self.prv < Privilege::Machine
                    || (self.prv == Privilege::Machine && status & csr::STATUS_MIE != 0)
            } else {
                self.prv < Privilege::Supervisor
                    || (self.prv == Privilege::Supervisor && status & csr::STATUS_SIE != 0)
            };
            if take {
                self.enter(irq.code(), true, 0);
                return true;
            }
        }
        false
    }

    /// Park until an interrupt could be deliverable. WFI completes when
    /// `(mip & mie) != 0` regardless of global enables, or when a pause or
    /// timer edge arrives.
    pub(crate) fn do_wfi(&mut self) {
        self.reservation = None;
        loop {
            if self.shared.ev.load(Ordering::Acquire) & EV_PAUSE != 0 {
                return;
            }
            let stce = self.csr.stce();
            if self.shared.pending_bits(stce) & self.csr.ie != 0 {
                return;
            }
            self.shared.wait.wait_ns(self.shared.next_timer_ns(stce));
        }
    }

    /// Drain the event words. Returns true when the hart must stop.
    pub fn handle_events(&mut self) -> bool {
        self.shared.wait_event.store(0, Ordering::Release);
        let ev = self.shared.ev.swap(0, Ordering::AcqRel);
        if ev & EV_PAUSE != 0 {
            return true;
        }
        self.check_interrupts();
        false
    }

    /// Run until paused. This is the hart thread's whole life.
    pub fn run(&mut self) {
        log::debug!("hart {}: running at pc {:#x}", self.shared.hartid(), self.pc);
        self.poll_countdown = EVENT_POLL_INTERVAL;
        loop {
            if self.shared.wait_event.load(Ordering::Acquire) != 0 || self.poll_countdown == 0 {
                if self.handle_events() {
                    break;
                }
                self.poll_countdown = EVENT_POLL_INTERVAL;
            }
            self.poll_countdown -= 1;
            self.step();
        }
        log::debug!("hart {}: paused at pc {:#x}", self.shared.hartid(), self.pc);
    }
}

/// Resolve the trap vector: MODE bit 0 selects vectored delivery, which
/// only applies to interrupts.
fn vector(tvec: u64, code: u64, irq: bool) -> u64 {
    let base = tvec & !3;
    if irq && tvec & 3 == 1 {
        base + 4 * code
    } else {
        base
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hart() -> Hart {
        let mem = Arc::new(AddressSpace::new(crate::RAM_BASE, 0x10000).unwrap());
        Hart::new(mem, Arc::new(HartShared::new(0)), true)
    }

    #[test]
    fn x0_is_wired_to_zero() {
        let mut hart = hart();
        hart.set_x(0, 0xdead);
        assert_eq!(hart.x(0), 0);
        hart.set_x(1, 0xdead);
        assert_eq!(hart.x(1), 0xdead);
    }

    #[test]
    fn trap_and_mret_round_trip() {
        let mut hart = hart();
        hart.csr.mtvec = crate::RAM_BASE + 0x1000;
        hart.csr.status |= csr::STATUS_MIE;
        hart.pc = crate::RAM_BASE + 4;
        let old_status_mie = hart.csr.status & csr::STATUS_MIE;
        hart.trap_enter(Trap::new(Exception::EcallFromMmode, 0));
        assert_eq!(hart.pc, crate::RAM_BASE + 0x1000);
        assert_eq!(hart.csr.mcause, 11);
        assert_eq!(hart.csr.mepc, crate::RAM_BASE + 4);
        assert_eq!(hart.csr.status & csr::STATUS_MIE, 0);
        assert_ne!(hart.csr.status & csr::STATUS_MPIE, 0);
        assert_eq!((hart.csr.status >> 11) & 3, 3);
        hart.do_mret();
        assert_eq!(hart.pc, crate::RAM_BASE + 4);
        assert_eq!(hart.privilege(), Privilege::Machine);
        assert_eq!(hart.csr.status & csr::STATUS_MIE, old_status_mie);
    }

    #[test]
    fn delegated_trap_goes_to_s() {
        let mut hart = hart();
        hart.csr.edeleg = 1 << Exception::EcallFromUmode.code();
        hart.csr.stvec = crate::RAM_BASE + 0x2000;
        hart.prv = Privilege::User;
        hart.pc = crate::RAM_BASE;
        hart.trap_enter(Trap::new(Exception::EcallFromUmode, 0));
        assert_eq!(hart.privilege(), Privilege::Supervisor);
        assert_eq!(hart.csr.scause, 8);
        assert_eq!(hart.pc, crate::RAM_BASE + 0x2000);
        // SPP captured U.
        assert_eq!(hart.csr.status & csr::STATUS_SPP, 0);
        hart.do_sret();
        assert_eq!(hart.privilege(), Privilege::User);
        assert_eq!(hart.pc, crate::RAM_BASE);
    }

    #[test]
    fn m_mode_exception_never_delegates() {
        let mut hart = hart();
        hart.csr.edeleg = u64::MAX;
        hart.csr.mtvec = crate::RAM_BASE + 0x100;
        hart.csr.stvec = crate::RAM_BASE + 0x200;
        hart.trap_enter(Trap::illegal(0));
        assert_eq!(hart.privilege(), Privilege::Machine);
        assert_eq!(hart.pc, crate::RAM_BASE + 0x100);
    }

    #[test]
    fn vectored_interrupt_offsets_pc() {
        let mut hart = hart();
        hart.csr.mtvec = (crate::RAM_BASE + 0x1000) | 1;
        hart.csr.status |= csr::STATUS_MIE;
        hart.csr.ie = Interrupt::MachineTimer.mask();
        hart.shared.mtimecmp().set(0);
        assert!(hart.check_interrupts());
        assert_eq!(hart.pc, crate::RAM_BASE + 0x1000 + 4 * 7);
        assert_eq!(hart.csr.mcause, (1 << 63) | 7);
    }

    #[test]
    fn interrupts_gated_by_mie_in_m_mode() {
        let mut hart = hart();
        hart.csr.ie = Interrupt::MachineSoftware.mask();
        hart.shared.interrupt(Interrupt::MachineSoftware.code() as u32);
        // MIE clear in M-mode: not deliverable.
        assert!(!hart.check_interrupts());
        hart.csr.status |= csr::STATUS_MIE;
        assert!(hart.check_interrupts());
    }
}
