//! End-to-end machine scenarios: guest programs written straight into RAM
//! and executed through the public embedding API.

use rvvm::csr;
use rvvm::devices::clint::{Clint, CLINT_DEFAULT_BASE};
use rvvm::trap::{Interrupt, Privilege};
use rvvm::{Machine, RAM_BASE};

// Instruction encoders, enough for the programs below.

fn r_type(op: u32, rd: u32, f3: u32, rs1: u32, rs2: u32, f7: u32) -> u32 {
    op | (rd << 7) | (f3 << 12) | (rs1 << 15) | (rs2 << 20) | (f7 << 25)
}

fn i_type(op: u32, rd: u32, f3: u32, rs1: u32, imm: i32) -> u32 {
    op | (rd << 7) | (f3 << 12) | (rs1 << 15) | ((imm as u32 & 0xFFF) << 20)
}

fn s_type(op: u32, f3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    op | ((imm & 0x1F) << 7) | (f3 << 12) | (rs1 << 15) | (rs2 << 20) | ((imm >> 5) << 25)
}

fn b_type(f3: u32, rs1: u32, rs2: u32, imm: i32) -> u32 {
    let imm = imm as u32;
    0x63 | (((imm >> 11) & 1) << 7)
        | (((imm >> 1) & 0xF) << 8)
        | (f3 << 12)
        | (rs1 << 15)
        | (rs2 << 20)
        | (((imm >> 5) & 0x3F) << 25)
        | (((imm >> 12) & 1) << 31)
}

fn addi(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x13, rd, 0, rs1, imm)
}

fn lui(rd: u32, imm20: u32) -> u32 {
    0x37 | (rd << 7) | (imm20 << 12)
}

fn lw(rd: u32, rs1: u32, imm: i32) -> u32 {
    i_type(0x03, rd, 2, rs1, imm)
}

fn sw(rs1: u32, rs2: u32, imm: i32) -> u32 {
    s_type(0x23, 2, rs1, rs2, imm)
}

fn bne(rs1: u32, rs2: u32, imm: i32) -> u32 {
    b_type(1, rs1, rs2, imm)
}

fn blt(rs1: u32, rs2: u32, imm: i32) -> u32 {
    b_type(4, rs1, rs2, imm)
}

fn csrrw(rd: u32, csr: u32, rs1: u32) -> u32 {
    i_type(0x73, rd, 1, rs1, csr as i32)
}

fn csrrs(rd: u32, csr: u32, rs1: u32) -> u32 {
    i_type(0x73, rd, 2, rs1, csr as i32)
}

fn lr_w(rd: u32, rs1: u32) -> u32 {
    r_type(0x2F, rd, 2, rs1, 0, 0x02 << 2)
}

fn sc_w(rd: u32, rs1: u32, rs2: u32) -> u32 {
    r_type(0x2F, rd, 2, rs1, rs2, 0x03 << 2)
}

const ECALL: u32 = 0x0000_0073;
const SFENCE_VMA: u32 = 0x1200_0073;
const WFI: u32 = 0x1050_0073;
const SPIN: u32 = 0x0000_006F; // jal x0, 0

fn load_program(machine: &Machine, base: u64, program: &[u32]) {
    for (idx, insn) in program.iter().enumerate() {
        machine.write_ram(base + idx as u64 * 4, &insn.to_le_bytes()).unwrap();
    }
}

/// Scenario 1: `addi x1, x0, 42; ecall` in M-mode with a direct mtvec.
#[test]
fn ecall_traps_to_mtvec() {
    let mut machine = Machine::new(0x10000, 1, true).unwrap();
    load_program(&machine, RAM_BASE, &[addi(1, 0, 42), ECALL]);
    {
        let hart = machine.hart_mut(0).unwrap();
        hart.csr.mtvec = 0x8000_1000;
        hart.csr.status |= csr::STATUS_MIE;
    }
    machine.run_singlethread(Some(2)).unwrap();
    let hart = machine.hart(0).unwrap();
    assert_eq!(hart.x(1), 42);
    assert_eq!(hart.pc, 0x8000_1000);
    assert_eq!(hart.csr.mcause, 11);
    assert_eq!(hart.csr.mepc, 0x8000_0004);
    assert_eq!((hart.csr.status >> 11) & 3, 3, "MPP captured M");
    assert_ne!(hart.csr.status & csr::STATUS_MPIE, 0, "MPIE took the old MIE");
    assert_eq!(hart.csr.status & csr::STATUS_MIE, 0, "MIE cleared on entry");
}

/// Scenario 2: load from unmapped physical memory in U-mode, delegated to S.
#[test]
fn unmapped_load_faults_to_smode() {
    let mut machine = Machine::new(0x10000, 1, true).unwrap();
    // x1 = 0xFEEDFACE via lui/addi (lui imm has bit 11 set, so compensate).
    let program = [
        lui(1, 0xFEEE0),
        addi(1, 1, -0x532), // 0xFEEE0000 - 0x532 = 0xFEEDFACE
        lw(2, 1, 0),
    ];
    load_program(&machine, RAM_BASE, &program);
    {
        let hart = machine.hart_mut(0).unwrap();
        hart.csr.edeleg = 1 << 5; // load access fault
        hart.csr.stvec = 0x8000_2000;
    }
    machine.run_singlethread(Some(2)).unwrap();
    {
        let hart = machine.hart_mut(0).unwrap();
        assert_eq!(hart.x(1) as u32, 0xFEED_FACE);
        hart.set_privilege(Privilege::User);
    }
    machine.run_singlethread(Some(1)).unwrap();
    let hart = machine.hart(0).unwrap();
    assert_eq!(hart.privilege(), Privilege::Supervisor);
    assert_eq!(hart.csr.scause, 5, "load access fault");
    assert_eq!(hart.csr.stval as u32, 0xFEED_FACE);
    assert_eq!(hart.csr.sepc, 0x8000_0008, "sepc is the faulting load");
    assert_eq!(hart.pc, 0x8000_2000);
}

/// Scenario 3: CLINT timer edge delivers a machine timer interrupt.
#[test]
fn clint_timer_interrupt_fires() {
    let _ = env_logger::builder().is_test(true).try_init();
    let mut machine = Machine::new(0x10000, 1, true).unwrap();
    Clint::attach_all(&machine, CLINT_DEFAULT_BASE).unwrap();
    load_program(&machine, RAM_BASE, &[SPIN]);
    // Park the trap handler too, so mcause survives the check below.
    load_program(&machine, 0x8000_3000, &[SPIN]);
    {
        let hart = machine.hart_mut(0).unwrap();
        hart.csr.mtvec = 0x8000_3000;
        hart.csr.status |= csr::STATUS_MIE;
        hart.csr.ie = Interrupt::MachineTimer.mask();
        // mtime = 500, mtimecmp = 1000: the edge is ~50us out at 10 MHz.
        hart.shared.timer().rebase(500);
        hart.shared.mtimecmp().set(1000);
    }
    let mut trapped = false;
    for _ in 0..200 {
        machine.run_singlethread(Some(10_000)).unwrap();
        let hart = machine.hart(0).unwrap();
        if hart.csr.mcause == (1 << 63) | Interrupt::MachineTimer.code() {
            assert_eq!(hart.pc, 0x8000_3000);
            assert!(hart.shared.timer().now() >= 1000, "trap not before the edge");
            trapped = true;
            break;
        }
    }
    assert!(trapped, "timer interrupt never delivered");
}

/// Scenario 4: SFENCE.VMA makes a PTE edit visible past the TLB.
#[test]
fn sfence_vma_flushes_stale_mapping() {
    let mut machine = Machine::new(0x40000, 1, true).unwrap();
    let root = RAM_BASE + 0x1000;
    let l1 = RAM_BASE + 0x2000;
    let l0 = RAM_BASE + 0x3000;
    let code_pa = RAM_BASE + 0x8000;
    let data_a = RAM_BASE + 0x9000;
    let data_b = RAM_BASE + 0xA000;
    let code_va = 0x4000_0000u64;
    let data_va = 0x4000_1000u64;

    fn pte(pa: u64, flags: u64) -> u64 {
        ((pa >> 12) << 10) | flags
    }
    fn wr64(machine: &Machine, addr: u64, val: u64) {
        machine.write_ram(addr, &val.to_le_bytes()).unwrap();
    }
    const V: u64 = 1;
    const RWXAD: u64 = 0xCF; // V|R|W|X|A|D (no U: S-mode owns these pages)
    wr64(&machine, root + ((code_va >> 30) & 0x1FF) * 8, pte(l1, V));
    wr64(&machine, l1 + ((code_va >> 21) & 0x1FF) * 8, pte(l0, V));
    wr64(&machine, l0 + ((code_va >> 12) & 0x1FF) * 8, pte(code_pa, RWXAD));
    wr64(&machine, l0 + ((data_va >> 12) & 0x1FF) * 8, pte(data_a, RWXAD));

    machine.write_ram(data_a, &0x1111_1111u32.to_le_bytes()).unwrap();
    machine.write_ram(data_b, &0x2222_2222u32.to_le_bytes()).unwrap();

    // lui x1, 0x40001; lw x2, 0(x1); lw x3, 0(x1); sfence.vma; lw x4, 0(x1)
    let program = [lui(1, 0x40001), lw(2, 1, 0), lw(3, 1, 0), SFENCE_VMA, lw(4, 1, 0), SPIN];
    for (idx, insn) in program.iter().enumerate() {
        machine.write_ram(code_pa + idx as u64 * 4, &insn.to_le_bytes()).unwrap();
    }

    {
        let hart = machine.hart_mut(0).unwrap();
        hart.set_privilege(Privilege::Supervisor);
        let mut satp = (8u64 << 60) | (root >> 12);
        assert!(hart.csr_op(0x180, &mut satp, csr::CsrOp::Swap));
        hart.pc = code_va;
    }
    // lui + first lw: caches the data translation.
    machine.run_singlethread(Some(2)).unwrap();
    assert_eq!(machine.hart(0).unwrap().x(2) as u32, 0x1111_1111);

    // Swap the PTE to point at the other page. The next load still sees
    // the stale TLB entry; after SFENCE.VMA it observes the new mapping.
    wr64(&machine, l0 + ((data_va >> 12) & 0x1FF) * 8, pte(data_b, RWXAD));
    machine.run_singlethread(Some(3)).unwrap();
    let hart = machine.hart(0).unwrap();
    assert_eq!(hart.x(3) as u32, 0x1111_1111, "pre-fence load uses the cached mapping");
    assert_eq!(hart.x(4) as u32, 0x2222_2222, "post-fence load sees the new PTE");
}

/// Scenario 5: cross-hart LR/SC increments are linearizable.
#[test]
fn lr_sc_cross_hart_counter() {
    const ITERS: i32 = 50_000;
    let mut machine = Machine::new(0x10000, 2, true).unwrap();
    let counter = RAM_BASE + 0x8000;
    // x1 = counter, x5 = iteration target.
    // loop: lr.w x2,(x1); addi x2,x2,1; sc.w x3,(x1),x2; bnez x3, loop
    //       addi x4,x4,1; blt x4,x5, loop; spin
    let program = [
        lr_w(2, 1),
        addi(2, 2, 1),
        sc_w(3, 1, 2),
        bne(3, 0, -12),
        addi(4, 4, 1),
        blt(4, 5, -20),
        SPIN,
    ];
    load_program(&machine, RAM_BASE, &program);
    for idx in 0..2 {
        let hart = machine.hart_mut(idx).unwrap();
        hart.set_x(1, counter);
        hart.set_x(5, ITERS as u64);
    }
    machine.start().unwrap();
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(60);
    loop {
        std::thread::sleep(std::time::Duration::from_millis(50));
        machine.pause().unwrap();
        let done = (0..2).all(|i| machine.hart(i).unwrap().x(4) == ITERS as u64);
        if done {
            break;
        }
        assert!(std::time::Instant::now() < deadline, "harts did not finish");
        machine.start().unwrap();
    }
    let mut buf = [0u8; 4];
    machine.read_ram(&mut buf, counter).unwrap();
    assert_eq!(u32::from_le_bytes(buf), (ITERS * 2) as u32);
}

/// Scenario 6: mstatus SD is derived, WARL masks apply, old value returned.
#[test]
fn csrrw_mstatus_warl() {
    let mut machine = Machine::new(0x10000, 1, true).unwrap();
    load_program(&machine, RAM_BASE, &[csrrw(2, 0x300, 1)]);
    let before = {
        let hart = machine.hart_mut(0).unwrap();
        hart.set_x(1, 1u64 << 63);
        hart.csr.read_status(true)
    };
    machine.run_singlethread(Some(1)).unwrap();
    let hart = machine.hart(0).unwrap();
    assert_eq!(hart.x(2), before, "csrrw returns the prior mstatus");
    let after = hart.csr.read_status(true);
    assert_eq!(after & (1 << 63), 0, "SD is recomputed, not written");
    assert_eq!(after & csr::STATUS_FS, 0, "FS cleared by the write, so SD stays 0");
}

/// WFI parks until an interrupt becomes pending, even with MIE off.
#[test]
fn wfi_wakes_on_pending_interrupt() {
    let mut machine = Machine::new(0x10000, 1, true).unwrap();
    // x1 = MSIE; csrrw x0, mie, x1; wfi; addi x2, x0, 1; spin
    let program = [addi(1, 0, 8), csrrw(0, 0x304, 1), WFI, addi(2, 0, 1), SPIN];
    load_program(&machine, RAM_BASE, &program);
    machine.start().unwrap();
    std::thread::sleep(std::time::Duration::from_millis(20));
    machine.interrupt(0, Interrupt::MachineSoftware.code() as u32).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(50));
    machine.pause().unwrap();
    let hart = machine.hart(0).unwrap();
    // status.MIE is clear, so no trap was taken; execution just continued.
    assert_eq!(hart.x(2), 1, "wfi completed after the interrupt was posted");
    assert_eq!(hart.csr.mcause, 0);
}

/// Trap entry followed by xRET restores privilege, IE, PIE and pc.
#[test]
fn trap_mret_round_trip_through_guest_code() {
    let mut machine = Machine::new(0x10000, 1, true).unwrap();
    const MRET: u32 = 0x3020_0073;
    // Main: addi x1,x0,5; ecall; addi x3,x0,7; spin. Handler: mret.
    load_program(&machine, RAM_BASE, &[addi(1, 0, 5), ECALL, addi(3, 0, 7), SPIN]);
    load_program(&machine, RAM_BASE + 0x1000, &[csrrs(2, 0x341, 0), MRET]);
    {
        let hart = machine.hart_mut(0).unwrap();
        hart.csr.mtvec = RAM_BASE + 0x1000;
        hart.csr.status |= csr::STATUS_MIE;
    }
    // addi, ecall(trap), csrrs-read-mepc, mret, addi, spin...
    machine.run_singlethread(Some(6)).unwrap();
    let hart = machine.hart(0).unwrap();
    assert_eq!(hart.x(2), RAM_BASE + 4, "handler read mepc");
    assert_eq!(hart.x(3), 0, "mret returned to the ecall, not past it");
    // mepc still points at the ecall: the guest handler didn't bump it, so
    // the ecall re-traps. Privilege and MIE were restored in between.
    assert_eq!(hart.csr.status & csr::STATUS_MIE, 0, "re-entered the trap");
    assert_eq!(hart.privilege(), Privilege::Machine);
}

/// A faulting instruction leaves architectural state untouched apart from
/// the trap CSRs.
#[test]
fn faulting_store_has_no_side_effects() {
    let mut machine = Machine::new(0x10000, 1, true).unwrap();
    // x1 = unmapped address; sw x2, 0(x1)
    let program = [lui(1, 0x10000), addi(2, 0, 99), sw(1, 2, 0)];
    load_program(&machine, RAM_BASE, &program);
    machine.hart_mut(0).unwrap().csr.mtvec = RAM_BASE + 0x100;
    machine.run_singlethread(Some(3)).unwrap();
    let hart = machine.hart(0).unwrap();
    assert_eq!(hart.csr.mcause, 7, "store access fault");
    assert_eq!(hart.csr.mepc, RAM_BASE + 8);
    assert_eq!(hart.x(2), 99, "registers untouched by the faulting store");
    assert_eq!(hart.pc, RAM_BASE + 0x100);
}
