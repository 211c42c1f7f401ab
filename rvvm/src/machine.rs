// SPDX-License-Identifier: Apache-2.0

//! Machine lifecycle: hart threads, the event loop, and the embedding API.
//!
//! The machine owns everything (RAM, the region map, the harts) and
//! tear-down always flows from here. Harts move into their threads on
//! `start` and come back on `pause`, so while the machine is paused the
//! embedder gets direct `&mut` access to architectural state and the
//! region map may change.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};

use crate::hart::{Hart, HartShared, EV_PAUSE};
use crate::mem::{AddressSpace, MmioDevice};
use crate::sync::POOL;
use crate::RAM_BASE;

/// Embedding-boundary failures. Guest-visible problems are traps, never
/// `Error`s.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Error {
    BadRamGeometry,
    BadRegion,
    RegionOverlap,
    NoSuchRegion,
    OutOfRange,
    NotPaused,
    NotRunning,
    NoSuchHart,
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        let msg = match self {
            Error::BadRamGeometry => "RAM size/base must be page-aligned and non-empty",
            Error::BadRegion => "bad MMIO region geometry",
            Error::RegionOverlap => "region overlaps an existing mapping",
            Error::NoSuchRegion => "no region at that address",
            Error::OutOfRange => "address range outside RAM",
            Error::NotPaused => "operation requires a paused machine",
            Error::NotRunning => "machine is not running",
            Error::NoSuchHart => "hart index out of range",
        };
        write!(f, "{}", msg)
    }
}

/// How often the event loop scans timers.
const EVENT_TICK: Duration = Duration::from_millis(1);
/// Device `update` cadence, in event-loop ticks.
const DEVICE_UPDATE_TICKS: u32 = 10;
/// Single-thread mode: instructions between housekeeping passes.
const SINGLETHREAD_UPDATE_INTERVAL: u64 = 4096;

pub struct Machine {
    mem: Arc<AddressSpace>,
    shared: Vec<Arc<HartShared>>,
    slots: Vec<Option<Box<Hart>>>,
    threads: Vec<JoinHandle<Box<Hart>>>,
    eventloop: Option<(Sender<()>, JoinHandle<()>)>,
    running: Arc<AtomicBool>,
    rv64: bool,
}

impl Machine {
    /// Build a paused machine: RAM at [`RAM_BASE`], one hart per index,
    /// all parked at the reset vector.
    pub fn new(mem_size: usize, hart_count: usize, rv64: bool) -> Result<Machine, Error> {
        if hart_count == 0 {
            return Err(Error::NoSuchHart);
        }
        let mem = Arc::new(AddressSpace::new(RAM_BASE, mem_size)?);
        let mut shared = Vec::with_capacity(hart_count);
        let mut slots = Vec::with_capacity(hart_count);
        for hartid in 0..hart_count {
            let hs = Arc::new(HartShared::new(hartid as u64));
            slots.push(Some(Box::new(Hart::new(mem.clone(), hs.clone(), rv64))));
            shared.push(hs);
        }
        log::info!(
            "machine: {} MiB RAM @ {:#x}, {} hart(s), rv{}",
            mem_size / (1024 * 1024),
            RAM_BASE,
            hart_count,
            if rv64 { 64 } else { 32 }
        );
        Ok(Machine {
            mem,
            shared,
            slots,
            threads: Vec::new(),
            eventloop: None,
            running: Arc::new(AtomicBool::new(false)),
            rv64,
        })
    }

    pub fn rv64(&self) -> bool { self.rv64 }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub fn hart_count(&self) -> usize {
        self.shared.len()
    }

    pub fn mem(&self) -> &AddressSpace {
        &self.mem
    }

    /// Cross-thread handle for devices that raise interrupts or drive the
    /// hart timer (CLINT and friends).
    pub fn hart_shared(&self, idx: usize) -> Option<Arc<HartShared>> {
        self.shared.get(idx).cloned()
    }

    /// Direct hart access; only available while paused.
    pub fn hart_mut(&mut self, idx: usize) -> Option<&mut Hart> {
        self.slots.get_mut(idx)?.as_deref_mut()
    }

    pub fn hart(&self, idx: usize) -> Option<&Hart> {
        self.slots.get(idx)?.as_deref()
    }

    pub fn write_ram(&self, dest_paddr: u64, src: &[u8]) -> Result<(), Error> {
        self.mem.write_ram(dest_paddr, src)
    }

    pub fn read_ram(&self, dst: &mut [u8], src_paddr: u64) -> Result<(), Error> {
        self.mem.read_ram(dst, src_paddr)
    }

    pub fn attach_mmio(
        &self,
        begin: u64,
        size: u64,
        min_op: usize,
        max_op: usize,
        dev: Box<dyn MmioDevice>,
    ) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::NotPaused);
        }
        self.mem.attach_mmio(begin, size, min_op, max_op, dev)
    }

    pub fn detach_mmio(&self, addr: u64) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::NotPaused);
        }
        self.mem.detach_mmio(addr)
    }

    /// Assert an interrupt bit on a hart (external device API).
    pub fn interrupt(&self, hart: usize, bit: u32) -> Result<(), Error> {
        self.shared.get(hart).ok_or(Error::NoSuchHart)?.interrupt(bit);
        Ok(())
    }

    pub fn interrupt_clear(&self, hart: usize, bit: u32) -> Result<(), Error> {
        self.shared.get(hart).ok_or(Error::NoSuchHart)?.interrupt_clear(bit);
        Ok(())
    }

    /// Spawn one thread per hart plus the event loop.
    pub fn start(&mut self) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::NotPaused);
        }
        self.running.store(true, Ordering::Release);
        for (idx, slot) in self.slots.iter_mut().enumerate() {
            let mut hart = slot.take().ok_or(Error::NoSuchHart)?;
            let handle = std::thread::Builder::new()
                .name(format!("rvvm hart {}", idx))
                .spawn(move || {
                    hart.run();
                    hart
                })
                .expect("couldn't spawn hart thread");
            self.threads.push(handle);
        }
        let (stop_tx, stop_rx) = bounded(1);
        let mem = self.mem.clone();
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("rvvm eventloop".to_owned())
            .spawn(move || event_loop(mem, shared, stop_rx))
            .expect("couldn't spawn eventloop thread");
        self.eventloop = Some((stop_tx, handle));
        log::info!("machine: started {} hart(s)", self.shared.len());
        Ok(())
    }

    /// Stop every hart between two instructions and take their state back.
    pub fn pause(&mut self) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        self.running.store(false, Ordering::Release);
        for hs in &self.shared {
            hs.request_event(EV_PAUSE);
        }
        for (slot, handle) in self.slots.iter_mut().zip(self.threads.drain(..)) {
            let hart = handle.join().expect("hart thread panicked");
            *slot = Some(hart);
        }
        if let Some((stop, handle)) = self.eventloop.take() {
            let _unused = stop.send(());
            handle.join().expect("eventloop thread panicked");
        }
        log::info!("machine: paused");
        Ok(())
    }

    /// Reset harts and devices to power-on state. Paused only.
    pub fn reset(&mut self) -> Result<(), Error> {
        if self.is_running() {
            log::error!("reset refused: machine is running");
            return Err(Error::NotPaused);
        }
        for slot in self.slots.iter_mut() {
            if let Some(hart) = slot.as_deref_mut() {
                hart.reset();
            }
        }
        self.mem.reset_devices();
        Ok(())
    }

    /// Run hart 0 on the calling thread, polling events and timers every
    /// instruction. Returns after `max_steps` or on a pause request.
    pub fn run_singlethread(&mut self, max_steps: Option<u64>) -> Result<u64, Error> {
        if self.is_running() {
            return Err(Error::NotPaused);
        }
        let mut hart = self.slots[0].take().ok_or(Error::NoSuchHart)?;
        let mut steps = 0u64;
        loop {
            if let Some(limit) = max_steps {
                if steps >= limit {
                    break;
                }
            }
            if hart.handle_events() {
                break;
            }
            hart.step();
            steps += 1;
            if steps % SINGLETHREAD_UPDATE_INTERVAL == 0 {
                self.mem.update_devices();
            }
        }
        self.slots[0] = Some(hart);
        Ok(steps)
    }

    /// Run the event loop body on the calling thread until the machine is
    /// paused. Useful for embedders that own the main thread anyway.
    pub fn run_eventloop(&self) -> Result<(), Error> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        let mut ticks = 0u32;
        while self.is_running() {
            std::thread::sleep(EVENT_TICK);
            tick(&self.mem, &self.shared, &mut ticks);
        }
        Ok(())
    }
}

impl Drop for Machine {
    fn drop(&mut self) {
        if self.is_running() {
            self.pause().ok();
        }
        // Region destructors (device `Drop`) run when the last AddressSpace
        // reference goes away, which is after the harts in `slots` drop.
    }
}

fn event_loop(mem: Arc<AddressSpace>, shared: Vec<Arc<HartShared>>, stop: Receiver<()>) {
    let mut ticks = 0u32;
    loop {
        match stop.recv_timeout(EVENT_TICK) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
            Err(RecvTimeoutError::Timeout) => {}
        }
        tick(&mem, &shared, &mut ticks);
    }
}

/// One event-loop tick: nudge harts whose comparators have swept past, and
/// periodically offload device housekeeping to the worker pool.
fn tick(mem: &Arc<AddressSpace>, shared: &[Arc<HartShared>], ticks: &mut u32) {
    for hs in shared {
        if hs.mtimecmp().pending(hs.timer()) || hs.stimecmp().pending(hs.timer()) {
            hs.kick();
        }
    }
    *ticks += 1;
    if *ticks % DEVICE_UPDATE_TICKS == 0 {
        let mem = mem.clone();
        POOL.spawn(move || mem.update_devices());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ram_round_trip() {
        let machine = Machine::new(0x10000, 1, true).unwrap();
        machine.write_ram(RAM_BASE + 0x100, &[1, 2, 3]).unwrap();
        let mut buf = [0u8; 3];
        machine.read_ram(&mut buf, RAM_BASE + 0x100).unwrap();
        assert_eq!(buf, [1, 2, 3]);
        assert!(machine.write_ram(RAM_BASE + 0x10000, &[0]).is_err());
    }

    #[test]
    fn start_pause_cycle() {
        let mut machine = Machine::new(0x10000, 2, true).unwrap();
        // Park both harts in a tight loop: jal x0, 0 spins in place.
        machine.write_ram(RAM_BASE, &0x0000_006Fu32.to_le_bytes()).unwrap();
        machine.start().unwrap();
        assert!(machine.is_running());
        assert!(machine.start().is_err());
        std::thread::sleep(Duration::from_millis(20));
        machine.pause().unwrap();
        assert!(!machine.is_running());
        // Both harts are still spinning on the same instruction.
        for idx in 0..2 {
            assert_eq!(machine.hart(idx).unwrap().pc, RAM_BASE);
        }
        // A second round works too.
        machine.start().unwrap();
        machine.pause().unwrap();
    }

    #[test]
    fn attach_requires_pause() {
        struct Nop;
        impl crate::mem::MmioDevice for Nop {
            fn read(&self, _b: &mut [u8], _o: u64) -> bool { true }
            fn write(&self, _b: &[u8], _o: u64) -> bool { true }
        }
        let mut machine = Machine::new(0x10000, 1, true).unwrap();
        machine.write_ram(RAM_BASE, &0x0000_006Fu32.to_le_bytes()).unwrap();
        machine.start().unwrap();
        assert_eq!(
            machine.attach_mmio(0x1000_0000, 0x1000, 4, 4, Box::new(Nop)),
            Err(Error::NotPaused)
        );
        machine.pause().unwrap();
        machine.attach_mmio(0x1000_0000, 0x1000, 4, 4, Box::new(Nop)).unwrap();
    }

    #[test]
    fn singlethread_counts_steps() {
        let mut machine = Machine::new(0x10000, 1, true).unwrap();
        // addi x1, x1, 1; jal x0, -4
        machine.write_ram(RAM_BASE, &0x0010_8093u32.to_le_bytes()).unwrap();
        machine.write_ram(RAM_BASE + 4, &0xFFDF_F06Fu32.to_le_bytes()).unwrap();
        let steps = machine.run_singlethread(Some(100)).unwrap();
        assert_eq!(steps, 100);
        assert_eq!(machine.hart(0).unwrap().x(1), 50);
    }
}
