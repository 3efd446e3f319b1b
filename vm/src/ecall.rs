//! Environment call dispatch
//!
//! ECALL traps carry a call number in `a0`. Before the architectural trap
//! fires, the interpreter consults this registry; a registered handler runs
//! on the calling hart's thread and the instruction simply retires.
//! Unregistered numbers fall through to the normal
//! environment-call-from-&lt;mode&gt; exception so a guest kernel can still
//! implement its own syscall layer.
//!
//! Call numbers follow the machine-call ABI of the stock BIOS: small
//! positive numbers for console I/O, small negative numbers (sign extended
//! through `a0`) for machine services.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::sync::RwLock;

use riscv::instr::reg;

use crate::fpu::FpRegisters;
use crate::mem::Memory;

pub const ECALL_COUT: u64 = 0;
pub const ECALL_CIN: u64 = 1;
pub const ECALL_START_CPU: u64 = -6i64 as u64;
pub const ECALL_GET_CPUS: u64 = -5i64 as u64;
pub const ECALL_GET_SCREEN_ADDRESS: u64 = -4i64 as u64;
pub const ECALL_GET_SCREEN_SIZE: u64 = -3i64 as u64;
pub const ECALL_GET_MEMORY_SIZE: u64 = -2i64 as u64;
pub const ECALL_EXIT: u64 = -1i64 as u64;

/// What a handler gets to see of the calling hart.
pub struct EcallContext<'a> {
    pub hart_id: u32,
    pub memory: &'a Memory,
    pub regs: &'a mut [u64; 32],
    pub fregs: &'a mut FpRegisters,
}

pub type EcallHandler = Box<dyn Fn(EcallContext<'_>) + Send + Sync>;

/// The process wide call-number to handler mapping. Handlers are registered
/// during startup and only read afterwards.
#[derive(Default)]
pub struct EcallTable {
    handlers: RwLock<HashMap<u64, EcallHandler>>,
}

impl EcallTable {
    pub fn new() -> Self {
        EcallTable::default()
    }

    pub fn register(&self, number: u64, handler: impl Fn(EcallContext<'_>) + Send + Sync + 'static) {
        self.handlers
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(number, Box::new(handler));
    }

    /// Run the handler for `number`, if one exists.
    pub fn dispatch(&self, number: u64, ctx: EcallContext<'_>) -> bool {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        match handlers.get(&number) {
            Some(handler) => {
                log::trace!(
                    "hart {} ecall {number:#x} (a1 {:#x}, a2 {:#x})",
                    ctx.hart_id,
                    ctx.regs[reg::A1],
                    ctx.regs[reg::A2]
                );
                handler(ctx);
                true
            }
            None => false,
        }
    }
}

impl std::fmt::Debug for EcallTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self
            .handlers
            .read()
            .map(|h| h.len())
            .unwrap_or(0);
        f.debug_struct("EcallTable").field("handlers", &count).finish()
    }
}

/// Write `a2` bytes starting at guest address `a1` to standard output.
fn ecall_cout(ctx: EcallContext<'_>) {
    let mut bytes = Vec::with_capacity(ctx.regs[reg::A2] as usize);
    let base = ctx.regs[reg::A1] as u32;
    for i in 0..ctx.regs[reg::A2] as u32 {
        match ctx.memory.read_byte(base.wrapping_add(i)) {
            Ok(byte) => bytes.push(byte),
            Err(err) => {
                log::warn!("console write touched bad memory: {err}");
                break;
            }
        }
    }

    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let _ = out.write_all(&bytes);
    let _ = out.flush();
}

/// Read one line from standard input into the buffer at `a1` (capacity
/// `a2`); the stored length comes back in `a0`.
fn ecall_cin(ctx: EcallContext<'_>) {
    let mut line = String::new();
    let stdin = std::io::stdin();
    if stdin.lock().read_line(&mut line).is_err() {
        ctx.regs[reg::A0] = 0;
        return;
    }
    let line = line.trim_end_matches('\n');

    let base = ctx.regs[reg::A1] as u32;
    let mut stored = 0u64;
    for (i, byte) in line.bytes().enumerate() {
        if stored >= ctx.regs[reg::A2] {
            break;
        }
        if ctx.memory.write_byte(base.wrapping_add(i as u32), byte).is_err() {
            break;
        }
        stored += 1;
    }

    ctx.regs[reg::A0] = stored;
}

/// Terminate the whole machine with the status the guest passed in `a1`.
fn ecall_exit(ctx: EcallContext<'_>) {
    let status = ctx.regs[reg::A1] as u32 as i32;
    log::info!("guest requested exit with status {status}");
    std::process::exit(status);
}

/// Install the handlers that need nothing beyond the calling hart itself.
/// The machine-level calls (hart startup, screen queries) are registered by
/// the owning [`System`](crate::system::System).
pub fn register_builtin_ecalls(table: &EcallTable) {
    table.register(ECALL_COUT, ecall_cout);
    table.register(ECALL_CIN, ecall_cin);
    table.register(ECALL_EXIT, ecall_exit);
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::mem::Region;

    #[test]
    fn test_dispatch_unknown_number() {
        let table = EcallTable::new();
        let memory = Memory::new();
        let mut regs = [0u64; 32];
        let mut fregs = FpRegisters::new();

        let handled = table.dispatch(
            42,
            EcallContext {
                hart_id: 0,
                memory: &memory,
                regs: &mut regs,
                fregs: &mut fregs,
            },
        );
        assert!(!handled);
    }

    #[test]
    fn test_handler_sees_registers_and_memory() {
        let table = EcallTable::new();
        let mut memory = Memory::new();
        memory.add_region(Region::ram(0x1000, 0x1000));

        table.register(7, |ctx: EcallContext<'_>| {
            let address = ctx.regs[reg::A1] as u32;
            let value = ctx.memory.read_word(address).unwrap();
            ctx.regs[reg::A0] = value as u64 + 1;
        });

        memory.write_word(0x1000, 41).unwrap();
        let mut regs = [0u64; 32];
        regs[reg::A1] = 0x1000;
        let mut fregs = FpRegisters::new();

        assert!(table.dispatch(
            7,
            EcallContext {
                hart_id: 0,
                memory: &memory,
                regs: &mut regs,
                fregs: &mut fregs,
            },
        ));
        assert_eq!(regs[reg::A0], 42);
    }

    #[test]
    fn test_call_numbers_sign_extend() {
        // the guest ABI passes small negative service numbers through a0
        assert_eq!(ECALL_EXIT, 0xffff_ffff_ffff_ffff);
        assert_eq!(ECALL_START_CPU, 0xffff_ffff_ffff_fffa);
    }
}
