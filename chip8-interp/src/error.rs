//! Result and errors.
use std::fmt::{self, Display, Formatter};

use crate::constants::{Address, MAX_PROGRAM_SIZE};

pub type Chip8Result<T> = std::result::Result<T, Chip8Error>;

#[derive(Debug)]
pub enum Chip8Error {
    /// VM fault during interpreter loop. The machine is stopped.
    Runtime(Fault),
    /// Attempt to load a bytecode program that can't fit in memory.
    LargeProgram(usize),
    Io(std::io::Error),
    Fmt(fmt::Error),
}

impl Display for Chip8Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::Runtime(fault) => write!(f, "runtime error: {fault}"),
            Self::LargeProgram(len) => write!(
                f,
                "program too large for VM memory: {len} bytes, limit is {MAX_PROGRAM_SIZE}"
            ),
            Self::Io(err) => write!(f, "{err}"),
            Self::Fmt(err) => write!(f, "{err}"),
        }
    }
}

impl std::error::Error for Chip8Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            Self::Fmt(err) => Some(err),
            _ => None,
        }
    }
}

impl From<fmt::Error> for Chip8Error {
    fn from(err: fmt::Error) -> Self {
        Chip8Error::Fmt(err)
    }
}

impl From<std::io::Error> for Chip8Error {
    fn from(err: std::io::Error) -> Self {
        Chip8Error::Io(err)
    }
}

impl From<Fault> for Chip8Error {
    fn from(fault: Fault) -> Self {
        Chip8Error::Runtime(fault)
    }
}

/// Fatal condition raised while executing an instruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fault {
    /// Address of the faulting instruction.
    pub address: Address,
    /// Raw instruction word, zero when the fetch itself failed.
    pub instr: u16,
    pub kind: FaultKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    /// Subroutine call with the call stack at capacity.
    StackOverflow,
    /// Return with an empty call stack.
    StackUnderflow,
    UnknownOpcode,
    /// Access to a memory address outside of RAM.
    MemoryOutOfBounds { address: usize },
}

impl Display for Fault {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} at 0x{:03X} (instruction 0x{:04X})",
            self.kind, self.address, self.instr
        )
    }
}

impl Display for FaultKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::StackOverflow => write!(f, "call stack overflow"),
            Self::StackUnderflow => write!(f, "call stack underflow"),
            Self::UnknownOpcode => write!(f, "unsupported opcode"),
            Self::MemoryOutOfBounds { address } => {
                write!(f, "memory access out of bounds: 0x{address:X}")
            }
        }
    }
}
