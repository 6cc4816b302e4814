//! VM layer for tick-driven logic programs.
//!
//! Programs are flat instruction lists executed once per simulation tick by a
//! `Processor`, one per owning controller. This module provides the value
//! union, the instruction wire format, the tick driver, and the nested-call
//! machinery that drives a second compiled program as a bounded
//! sub-interpreter.

/// Nested-call site cache and depth guard.
pub mod call;
/// Per-instance processor and tick driver.
pub mod exec;
/// Tokenizer for the one-line instruction wire format.
pub mod parser;
/// Instruction set, compilation, and serialization.
pub mod program;
/// Tagged runtime value and literal coercion.
pub mod value;

pub use exec::Processor;
pub use parser::{quote_token, tokenize};
pub use program::{BinaryOp, Instr, JumpCond, Program};
pub use value::{LValue, ObjRef};

use thiserror::Error;

/// Convenience result alias for compilation.
pub type Result<T> = std::result::Result<T, CompileError>;

/// Errors surfaced while compiling program source.
#[derive(Debug, Error)]
pub enum CompileError {
    /// A line failed to tokenize (unterminated quote, bad escape).
    #[error("invalid instruction syntax: {0}")]
    Syntax(String),

    /// An instruction had a malformed or missing parameter.
    #[error("invalid instruction parameters: {0}")]
    Parameters(String),

    /// The opcode token is not part of the instruction set.
    #[error("unknown instruction: {0}")]
    UnknownInstruction(String),
}
