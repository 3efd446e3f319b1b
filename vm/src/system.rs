//! The machine as a whole
//!
//! A [`System`] wires the shared pieces together: physical memory, the
//! monotonic timer, the ecall registry and one [`HartHandle`] per core.
//! Hart state sits behind a mutex inside its handle; the worker thread runs
//! bounded slices between lock acquisitions so debugger and GUI calls get a
//! consistent view at slice boundaries.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::Duration;

use riscv::trap::Interrupt;

use crate::dump::VmException;
use crate::ecall::{
    self, EcallTable, ECALL_GET_CPUS, ECALL_GET_MEMORY_SIZE, ECALL_GET_SCREEN_ADDRESS,
    ECALL_GET_SCREEN_SIZE, ECALL_START_CPU,
};
use crate::hart::{Hart, HartSignals, SliceOutcome, Snapshot};
use crate::mem::{MachineTimer, Memory, TICKS_PER_SECOND};

use riscv::instr::reg;

/// Instructions per lock acquisition of the worker loop.
const RUN_SLICE_BUDGET: u64 = 4096;

/// Samples kept for the instructions-per-second estimate.
const MAX_PERF_HISTORY: usize = 15;

#[derive(Debug, Copy, Clone)]
pub struct SystemConfig {
    pub cores: u32,
    pub starting_pc: u64,
    pub pause_on_break: bool,
    pub pause_on_restart: bool,
    pub screen_address: u32,
    pub screen_width: u32,
    pub screen_height: u32,
}

impl Default for SystemConfig {
    fn default() -> Self {
        SystemConfig {
            cores: 1,
            starting_pc: 0x1000,
            pause_on_break: false,
            pause_on_restart: false,
            screen_address: 0xffe0_0000,
            screen_width: 800,
            screen_height: 600,
        }
    }
}

#[derive(Debug, Default)]
struct PerfWindow {
    samples: VecDeque<(f64, u64)>,
    last_ticks: u64,
}

/// The shared handle of one hart: control signals, the state mutex and the
/// performance window.
pub struct HartHandle {
    id: u32,
    signals: Arc<HartSignals>,
    state: Mutex<Hart>,
    perf: Mutex<PerfWindow>,
}

impl HartHandle {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn start(&self) {
        self.signals.start();
    }

    pub fn stop(&self) {
        self.signals.stop();
    }

    pub fn is_running(&self) -> bool {
        self.signals.is_running()
    }

    pub fn pause(&self) {
        self.signals.pause();
    }

    pub fn unpause(&self) {
        self.signals.unpause();
    }

    pub fn is_paused(&self) -> bool {
        self.signals.is_paused()
    }

    /// Reset the hart to `pc`. Takes effect at the next step boundary (or
    /// mid-instruction when a hart restarts itself through an ecall).
    pub fn restart(&self, pc: u64, source_hart: u32) {
        self.signals.request_restart(pc, source_hart);
    }

    pub fn raise_interrupt(&self, interrupt: Interrupt) {
        self.signals.raise_interrupt(interrupt);
    }

    /// Run a closure against the locked hart state.
    pub fn with_state<R>(&self, f: impl FnOnce(&mut Hart) -> R) -> R {
        f(&mut self.lock_state())
    }

    fn lock_state(&self) -> MutexGuard<'_, Hart> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Debugger stepping: at most `steps` instructions, returns how many ran.
    pub fn step(&self, steps: u64) -> u64 {
        self.with_state(|hart| hart.step(steps))
    }

    pub fn snapshot(&self) -> Snapshot {
        self.with_state(|hart| hart.snapshot())
    }

    pub fn csr_snapshot(&self) -> std::collections::BTreeMap<u16, u64> {
        self.with_state(|hart| hart.csr_snapshot())
    }

    pub fn set_breakpoint(&self, address: u64) {
        self.with_state(|hart| hart.set_breakpoint(address));
    }

    pub fn clear_breakpoint(&self, address: u64) {
        self.with_state(|hart| hart.clear_breakpoint(address));
    }

    fn record_perf(&self, delta: f64) {
        let mut perf = self.perf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let ticks = self.signals.ticks();
        let executed = ticks.saturating_sub(perf.last_ticks);
        perf.last_ticks = ticks;

        perf.samples.push_back((delta, executed));
        while perf.samples.len() > MAX_PERF_HISTORY {
            perf.samples.pop_front();
        }
    }

    /// Rolling estimate over the last few host frames.
    pub fn instructions_per_second(&self) -> f64 {
        let perf = self.perf.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        let (time, executed) = perf
            .samples
            .iter()
            .fold((0.0, 0u64), |(t, n), (dt, dn)| (t + dt, n + dn));
        if time > 0.0 {
            executed as f64 / time
        } else {
            0.0
        }
    }

    /// The worker loop body; returns when the hart is stopped or the
    /// interpreter hits a host-side failure.
    pub fn run(&self) -> Result<(), VmException> {
        loop {
            if !self.signals.is_running() {
                return Ok(());
            }
            // a queued restart must be serviced even while paused: it is
            // what wakes the secondary harts out of their boot pause
            if self.signals.is_paused() && !self.signals.has_restart() {
                self.signals.wait_for_wake(Duration::from_millis(10));
                continue;
            }

            let outcome = {
                let mut hart = self.lock_state();
                match catch_unwind(AssertUnwindSafe(|| hart.run_slice(RUN_SLICE_BUDGET))) {
                    Ok(outcome) => outcome,
                    Err(payload) => {
                        return Err(hart.capture_exception(panic_message(payload.as_ref())));
                    }
                }
            };

            if outcome == SliceOutcome::Waiting {
                // parked in WFI; sleep until an interrupt or control pokes us
                self.signals.wait_for_wake(Duration::from_millis(1));
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "interpreter invariant violation".to_string()
    }
}

pub struct System {
    memory: Arc<Memory>,
    timer: Arc<MachineTimer>,
    ecalls: Arc<EcallTable>,
    harts: Vec<Arc<HartHandle>>,
    config: SystemConfig,
    /// Sub-tick remainder of the time accumulator, in host seconds.
    tick_remainder: Mutex<f64>,
    /// Ticks already compared against `time_cmp`, to edge-trigger the timer.
    last_timer_fire: AtomicU64,
}

impl System {
    /// Assemble a machine: `cores` harts over the given memory, all starting
    /// paused at `starting_pc` with the builtin and machine ecalls in place.
    pub fn new(memory: Arc<Memory>, timer: Arc<MachineTimer>, config: SystemConfig) -> Arc<System> {
        let ecalls = Arc::new(EcallTable::new());
        ecall::register_builtin_ecalls(&ecalls);

        let cores = config.cores.max(1);
        let mut harts = Vec::with_capacity(cores as usize);
        for id in 0..cores {
            let signals = Arc::new(HartSignals::new());
            let mut hart = Hart::new(
                memory.clone(),
                ecalls.clone(),
                timer.clone(),
                signals.clone(),
                id,
                config.starting_pc,
            );
            hart.set_pause_on_break(config.pause_on_break);
            hart.set_pause_on_restart(config.pause_on_restart);

            harts.push(Arc::new(HartHandle {
                id,
                signals,
                state: Mutex::new(hart),
                perf: Mutex::new(PerfWindow::default()),
            }));
        }

        let system = Arc::new(System {
            memory,
            timer,
            ecalls,
            harts,
            config,
            tick_remainder: Mutex::new(0.0),
            last_timer_fire: AtomicU64::new(0),
        });
        system.register_machine_ecalls();
        system
    }

    pub fn memory(&self) -> &Arc<Memory> {
        &self.memory
    }

    pub fn timer(&self) -> &Arc<MachineTimer> {
        &self.timer
    }

    pub fn ecalls(&self) -> &Arc<EcallTable> {
        &self.ecalls
    }

    pub fn harts(&self) -> &[Arc<HartHandle>] {
        &self.harts
    }

    pub fn hart(&self, id: u32) -> Option<&Arc<HartHandle>> {
        self.harts.get(id as usize)
    }

    /// The machine service calls close over the hart handles and the screen
    /// geometry, so they live here rather than next to the console builtins.
    fn register_machine_ecalls(&self) {
        let handles = self.harts.clone();
        self.ecalls.register(ECALL_START_CPU, move |ctx| {
            let target = ctx.regs[reg::A1];
            let entry = ctx.regs[reg::A2];
            match handles.get(target as usize) {
                Some(handle) => handle.restart(entry, ctx.hart_id),
                None => {
                    log::error!("ecall start_cpu names unknown hart {target}");
                    std::process::exit(1);
                }
            }
        });

        let count = self.harts.len() as u64;
        self.ecalls.register(ECALL_GET_CPUS, move |ctx| {
            let buffer = ctx.regs[reg::A1] as u32;
            if buffer != 0 {
                for id in 0..count {
                    if let Err(err) = ctx.memory.write_word(buffer + (id as u32) * 4, id as u32) {
                        log::warn!("ecall get_cpus buffer fault: {err}");
                        break;
                    }
                }
            }
            ctx.regs[reg::A0] = count;
        });

        let screen_address = self.config.screen_address;
        self.ecalls.register(ECALL_GET_SCREEN_ADDRESS, move |ctx| {
            ctx.regs[reg::A0] = screen_address as u64;
        });

        let (width, height) = (self.config.screen_width, self.config.screen_height);
        self.ecalls.register(ECALL_GET_SCREEN_SIZE, move |ctx| {
            let _ = ctx.memory.write_word(ctx.regs[reg::A1] as u32, width);
            let _ = ctx.memory.write_word(ctx.regs[reg::A2] as u32, height);
        });

        self.ecalls.register(ECALL_GET_MEMORY_SIZE, move |ctx| {
            ctx.regs[reg::A0] = ctx.memory.total_memory() as u64;
        });
    }

    pub fn start_all(&self) {
        for hart in &self.harts {
            hart.start();
        }
    }

    pub fn stop_all(&self) {
        for hart in &self.harts {
            hart.stop();
        }
    }

    pub fn pause_all(&self) {
        for hart in &self.harts {
            hart.pause();
        }
    }

    /// Advance guest time by `delta` host seconds. Fires the machine timer
    /// interrupt on every hart when `time` passes `time_cmp`, and feeds the
    /// per-hart performance windows.
    pub fn update_time(&self, delta: f64) {
        let ticks = {
            let mut remainder = self
                .tick_remainder
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let total = *remainder + delta * TICKS_PER_SECOND as f64;
            let ticks = total.floor();
            *remainder = total - ticks;
            ticks as u64
        };

        if ticks > 0 {
            let now = self.timer.advance(ticks);
            let cmp = self.timer.time_cmp();
            if now >= cmp && self.last_timer_fire.swap(cmp, Ordering::AcqRel) != cmp {
                for hart in &self.harts {
                    hart.raise_interrupt(Interrupt::MachineTimer);
                }
            }
        }

        for hart in &self.harts {
            hart.record_perf(delta);
        }
    }

    /// One OS thread per hart, each running the interpreter loop until the
    /// hart stops or fails.
    pub fn spawn_workers(&self) -> Vec<thread::JoinHandle<Result<(), VmException>>> {
        self.harts
            .iter()
            .map(|handle| {
                let handle = handle.clone();
                thread::Builder::new()
                    .name(format!("hart-{}", handle.id()))
                    .spawn(move || handle.run())
                    .expect("could not spawn hart worker")
            })
            .collect()
    }
}

impl std::fmt::Debug for System {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("System")
            .field("harts", &self.harts.len())
            .field("memory", &self.memory.total_memory())
            .finish()
    }
}
