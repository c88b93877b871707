//! Turbine - an experimental toy programming language
//!
//! This library provides the turbine front-end (lexer and bytecode-emitting
//! Pratt parser), the reference bytecode interpreter, and an x86-64 JIT
//! that decompiles a function's bytecode back into an expression tree and
//! emits native code for it.

pub mod compiler;
pub mod config;
#[cfg(feature = "jit")]
pub mod jit;
pub mod vm;

// Re-export commonly used types
pub use config::{JitMode, RuntimeConfig};
pub use vm::{Function, FunctionKind, OpCode, Program, Vm};
