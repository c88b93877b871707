//! JIT compilation for turbine functions.
//!
//! The pipeline back half: a bytecode decompiler that recovers an AST
//! forest by symbolic stack execution, and an x86-64 code generator that
//! turns the forest into a directly callable native routine.

pub mod ast;
mod codebuf;
pub mod compiler_x86_64;
pub mod decompiler;
mod memory;
pub mod x86_64;

pub use codebuf::CodeBuffer;
pub use compiler_x86_64::{JitCompiler, JitEntryFn, JitError, JitFunction, JitOptions};
pub use decompiler::{decompile, DecompileError, DecompiledFunction};
pub use memory::{ExecutableMemory, MemoryError};

use crate::vm::Function;

/// Error type covering the whole bytecode-to-native pipeline.
#[derive(Debug, Clone, PartialEq)]
pub enum CompileError {
    Decompile(DecompileError),
    Codegen(JitError),
}

impl std::fmt::Display for CompileError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CompileError::Decompile(e) => write!(f, "decompile: {}", e),
            CompileError::Codegen(e) => write!(f, "codegen: {}", e),
        }
    }
}

impl std::error::Error for CompileError {}

impl From<DecompileError> for CompileError {
    fn from(e: DecompileError) -> Self {
        CompileError::Decompile(e)
    }
}

impl From<JitError> for CompileError {
    fn from(e: JitError) -> Self {
        CompileError::Codegen(e)
    }
}

/// Compile one bytecode function to native code: decompile, then generate.
pub fn compile(function: &Function, options: JitOptions) -> Result<JitFunction, CompileError> {
    let decompiled = decompile(function)?;
    let compiled = JitCompiler::new(&decompiled.arena, options).compile(&decompiled.roots)?;
    Ok(compiled)
}
