//! Minimal machine runner: load a flat guest image into RAM and execute it.
//!
//! ```text
//! rvvm-cli --mem 64 --harts 1 firmware.bin
//! ```

use std::io::Read;

use clap::{App, Arg};
use rvvm::devices::clint::{Clint, CLINT_DEFAULT_BASE};
use rvvm::{Machine, RAM_BASE};

fn main() {
    env_logger::init();
    let matches = App::new("rvvm-cli")
        .about("Runs a flat RISC-V image in an rvvm machine")
        .arg(
            Arg::with_name("image")
                .help("Flat binary loaded at the RAM base")
                .required(true),
        )
        .arg(
            Arg::with_name("mem")
                .long("mem")
                .takes_value(true)
                .default_value("64")
                .help("RAM size in MiB"),
        )
        .arg(
            Arg::with_name("harts")
                .long("harts")
                .takes_value(true)
                .default_value("1")
                .help("Number of harts"),
        )
        .arg(Arg::with_name("rv32").long("rv32").help("RV32 machine instead of RV64"))
        .arg(
            Arg::with_name("steps")
                .long("steps")
                .takes_value(true)
                .help("Run hart 0 single-threaded for N instructions, then dump state"),
        )
        .get_matches();

    let mem_mib: usize = matches
        .value_of("mem")
        .unwrap()
        .parse()
        .unwrap_or_else(|_| fatal("--mem expects a size in MiB"));
    let harts: usize = matches
        .value_of("harts")
        .unwrap()
        .parse()
        .unwrap_or_else(|_| fatal("--harts expects a count"));
    let rv64 = !matches.is_present("rv32");

    let image_path = matches.value_of("image").unwrap();
    let mut image = Vec::new();
    std::fs::File::open(image_path)
        .and_then(|mut f| f.read_to_end(&mut image))
        .unwrap_or_else(|e| fatal(&format!("can't read {}: {}", image_path, e)));

    let mut machine = Machine::new(mem_mib * 1024 * 1024, harts, rv64)
        .unwrap_or_else(|e| fatal(&format!("machine setup failed: {}", e)));
    machine
        .write_ram(RAM_BASE, &image)
        .unwrap_or_else(|e| fatal(&format!("image doesn't fit in RAM: {}", e)));
    Clint::attach_all(&machine, CLINT_DEFAULT_BASE)
        .unwrap_or_else(|e| fatal(&format!("CLINT attach failed: {}", e)));

    log::info!("loaded {} ({} bytes) at {:#x}", image_path, image.len(), RAM_BASE);

    if let Some(steps) = matches.value_of("steps") {
        let steps: u64 = steps.parse().unwrap_or_else(|_| fatal("--steps expects a count"));
        let executed = machine.run_singlethread(Some(steps)).expect("single-thread run failed");
        let hart = machine.hart(0).expect("hart 0 is present");
        println!("executed {} instruction(s), pc = {:#x}", executed, hart.pc);
        for (idx, chunk) in hart.regs.chunks(4).enumerate() {
            let line: Vec<String> =
                chunk.iter().enumerate().map(|(j, v)| format!("x{:<2} {:016x}", idx * 4 + j, v)).collect();
            println!("  {}", line.join("  "));
        }
        return;
    }

    machine.start().expect("start failed");
    // The machine runs until the process is killed; the event loop keeps
    // this thread busy with timer and device housekeeping.
    machine.run_eventloop().expect("event loop failed");
}

fn fatal(msg: &str) -> ! {
    eprintln!("rvvm-cli: {}", msg);
    std::process::exit(1);
}
