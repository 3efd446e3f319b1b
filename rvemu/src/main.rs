//! The emulator entry point: build the memory map, load the BIOS image,
//! bring up the harts and drive guest time until the machine winds down.

mod args;
mod logging;

use std::fs;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use vm::mem::{MachineTimer, Memory, Region};
use vm::system::{System, SystemConfig};

use args::MachineArgs;

const BIOS_RAM_ADDRESS: u32 = 0x1000;
const BIOS_RAM_SIZE: u32 = 16 * 1024 * 1024;
const FRAMEBUFFER_ADDRESS: u32 = 0xffe0_0000;
const MAPPED_CSR_ADDRESS: u32 = 0xf00;

fn main() {
    std::process::exit(run());
}

fn run() -> i32 {
    let parsed = MachineArgs::from_args(std::env::args().skip(1));

    if let Err(err) = logging::install(parsed.log_level) {
        eprintln!("could not install logger: {err}");
    }

    let Some(bios_path) = parsed.bios_file.clone() else {
        eprintln!("--bios_file is required");
        return -1;
    };

    let timer = Arc::new(MachineTimer::new());
    let mut memory = Memory::new();
    memory.add_region(Region::ram(BIOS_RAM_ADDRESS, BIOS_RAM_SIZE));
    memory.add_region(Region::framebuffer(
        FRAMEBUFFER_ADDRESS,
        parsed.screen_width,
        parsed.screen_height,
    ));
    memory.add_region(Region::mapped_csr(MAPPED_CSR_ADDRESS, timer.clone()));
    let memory = Arc::new(memory);

    match memory.read_file_into(&bios_path, BIOS_RAM_ADDRESS) {
        Ok(bytes) => log::info!("loaded {bytes} bytes of {bios_path}"),
        Err(err) => {
            eprintln!("could not load bios image: {err}");
            return -1;
        }
    }

    let system = System::new(
        memory,
        timer,
        SystemConfig {
            cores: parsed.cores,
            starting_pc: BIOS_RAM_ADDRESS as u64,
            pause_on_break: parsed.pause_on_break,
            pause_on_restart: parsed.pause_on_restart,
            screen_address: FRAMEBUFFER_ADDRESS,
            screen_width: parsed.screen_width,
            screen_height: parsed.screen_height,
        },
    );

    // secondary harts wait paused until the guest starts them
    for hart in system.harts() {
        hart.pause();
        hart.start();
    }
    if !parsed.start_paused {
        if let Some(hart0) = system.hart(0) {
            hart0.unpause();
        }
    }

    let workers = system.spawn_workers();

    // the main thread is the clock: guest time advances with host time
    // until every worker has wound down
    let mut last = Instant::now();
    while !workers.iter().all(|worker| worker.is_finished()) {
        thread::sleep(Duration::from_millis(1));
        let now = Instant::now();
        system.update_time(now.duration_since(last).as_secs_f64());
        last = now;
    }

    let mut exit_code = 0;
    for worker in workers {
        match worker.join() {
            Ok(Ok(())) => {}
            Ok(Err(exception)) => {
                log::error!("{exception}");
                match fs::write(&parsed.dump_path, exception.dump()) {
                    Ok(()) => eprintln!("fault dump written to {}", parsed.dump_path),
                    Err(err) => eprintln!("cannot write {}: {err}", parsed.dump_path),
                }
                exit_code = 1;
            }
            Err(_) => {
                eprintln!("hart worker panicked outside the interpreter");
                exit_code = 1;
            }
        }
    }

    exit_code
}
