//! Trap cause numbering
//!
//! Cause values follow Table 3.6 of the Privileged Specification. On this
//! RV64 machine the interrupt marker in `mcause`/`scause` is bit 63.

/// Set in `xcause` when the trap was asynchronous.
pub const INTERRUPT_BIT: u64 = 1 << 63;

/// An indication of the event that caused a trap to trigger.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum TrapEvent {
    Interrupt(Interrupt),
    Exception(Exception),
}

impl TrapEvent {
    /// The raw value written to `mcause`/`scause` for this event.
    pub fn cause(self) -> u64 {
        match self {
            TrapEvent::Interrupt(i) => i.code() | INTERRUPT_BIT,
            TrapEvent::Exception(e) => e.code(),
        }
    }

    pub fn is_interrupt(self) -> bool {
        matches!(self, TrapEvent::Interrupt(_))
    }

    /// The cause number without the interrupt marker.
    pub fn code(self) -> u64 {
        match self {
            TrapEvent::Interrupt(i) => i.code(),
            TrapEvent::Exception(e) => e.code(),
        }
    }
}

impl From<u64> for TrapEvent {
    fn from(value: u64) -> Self {
        if value & INTERRUPT_BIT != 0 {
            TrapEvent::Interrupt(Interrupt::from(value & !INTERRUPT_BIT))
        } else {
            TrapEvent::Exception(Exception::from(value))
        }
    }
}

/// An interrupt code indicating the cause of an asynchronous trap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Interrupt {
    SupervisorSoftware,
    MachineSoftware,
    SupervisorTimer,
    MachineTimer,
    SupervisorExternal,
    MachineExternal,
    Unknown(u64),
}

impl Interrupt {
    pub fn code(self) -> u64 {
        match self {
            Interrupt::SupervisorSoftware => 1,
            Interrupt::MachineSoftware => 3,
            Interrupt::SupervisorTimer => 5,
            Interrupt::MachineTimer => 7,
            Interrupt::SupervisorExternal => 9,
            Interrupt::MachineExternal => 11,
            Interrupt::Unknown(other) => other,
        }
    }

    /// Whether this interrupt is a supervisor-level source, i.e. visible
    /// through `sip`/`sie`.
    pub fn is_supervisor_level(self) -> bool {
        matches!(
            self,
            Interrupt::SupervisorSoftware | Interrupt::SupervisorTimer | Interrupt::SupervisorExternal
        )
    }
}

impl From<u64> for Interrupt {
    fn from(value: u64) -> Self {
        match value {
            1 => Interrupt::SupervisorSoftware,
            3 => Interrupt::MachineSoftware,
            5 => Interrupt::SupervisorTimer,
            7 => Interrupt::MachineTimer,
            9 => Interrupt::SupervisorExternal,
            11 => Interrupt::MachineExternal,
            other => Interrupt::Unknown(other),
        }
    }
}

/// An exception code indicating the cause of a synchronous trap.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Exception {
    InstructionAddressMisaligned,
    InstructionAccessFault,
    IllegalInstruction,
    Breakpoint,
    LoadAddressMisaligned,
    LoadAccessFault,
    StoreAddressMisaligned,
    StoreAccessFault,
    EnvCallFromUMode,
    EnvCallFromSMode,
    EnvCallFromMMode,
    InstructionPageFault,
    LoadPageFault,
    StorePageFault,
    Unknown(u64),
}

impl Exception {
    pub fn code(self) -> u64 {
        match self {
            Exception::InstructionAddressMisaligned => 0,
            Exception::InstructionAccessFault => 1,
            Exception::IllegalInstruction => 2,
            Exception::Breakpoint => 3,
            Exception::LoadAddressMisaligned => 4,
            Exception::LoadAccessFault => 5,
            Exception::StoreAddressMisaligned => 6,
            Exception::StoreAccessFault => 7,
            Exception::EnvCallFromUMode => 8,
            Exception::EnvCallFromSMode => 9,
            Exception::EnvCallFromMMode => 11,
            Exception::InstructionPageFault => 12,
            Exception::LoadPageFault => 13,
            Exception::StorePageFault => 15,
            Exception::Unknown(other) => other,
        }
    }
}

impl From<u64> for Exception {
    fn from(value: u64) -> Self {
        match value {
            0 => Exception::InstructionAddressMisaligned,
            1 => Exception::InstructionAccessFault,
            2 => Exception::IllegalInstruction,
            3 => Exception::Breakpoint,
            4 => Exception::LoadAddressMisaligned,
            5 => Exception::LoadAccessFault,
            6 => Exception::StoreAddressMisaligned,
            7 => Exception::StoreAccessFault,
            8 => Exception::EnvCallFromUMode,
            9 => Exception::EnvCallFromSMode,
            11 => Exception::EnvCallFromMMode,
            12 => Exception::InstructionPageFault,
            13 => Exception::LoadPageFault,
            15 => Exception::StorePageFault,
            other => Exception::Unknown(other),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_cause_roundtrip() {
        for code in [0u64, 1, 2, 3, 4, 5, 6, 7, 8, 9, 11, 12, 13, 15] {
            assert_eq!(Exception::from(code).code(), code);
        }
        for code in [1u64, 3, 5, 7, 9, 11] {
            assert_eq!(Interrupt::from(code).code(), code);
        }
    }

    #[test]
    fn test_interrupt_marker() {
        let ev = TrapEvent::from(INTERRUPT_BIT | 7);
        assert_eq!(ev, TrapEvent::Interrupt(Interrupt::MachineTimer));
        assert_eq!(ev.cause(), INTERRUPT_BIT | 7);

        let ev = TrapEvent::from(12);
        assert_eq!(ev, TrapEvent::Exception(Exception::InstructionPageFault));
        assert!(!ev.is_interrupt());
    }
}
