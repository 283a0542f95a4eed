//! Trap identifiers.
//!
//! A trap id classifies why a process left its entry routine. The executor
//! reports one on every exit; the server maps it to an instance status.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Closed enumeration of process exit classifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trap {
    Exit,
    NoFunction,
    Suspended,
    Unreachable,
    CallStackExhausted,
    MemoryAccessOutOfBounds,
    IndirectCallIndexOutOfBounds,
    IndirectCallSignatureMismatch,
    IntegerDivideByZero,
    IntegerOverflow,
    Breakpoint,
    AbiDeficiency,
    AbiViolation,
    InternalError,
    Killed,
}

impl Trap {
    pub fn as_str(self) -> &'static str {
        match self {
            Trap::Exit => "exit",
            Trap::NoFunction => "no function",
            Trap::Suspended => "suspended",
            Trap::Unreachable => "unreachable",
            Trap::CallStackExhausted => "call stack exhausted",
            Trap::MemoryAccessOutOfBounds => "memory access out of bounds",
            Trap::IndirectCallIndexOutOfBounds => "indirect call index out of bounds",
            Trap::IndirectCallSignatureMismatch => "indirect call signature mismatch",
            Trap::IntegerDivideByZero => "integer divide by zero",
            Trap::IntegerOverflow => "integer overflow",
            Trap::Breakpoint => "breakpoint",
            Trap::AbiDeficiency => "ABI deficiency",
            Trap::AbiViolation => "ABI violation",
            Trap::InternalError => "internal error",
            Trap::Killed => "killed",
        }
    }
}

impl fmt::Display for Trap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Default for Trap {
    fn default() -> Self {
        Trap::Exit
    }
}
