//! Runtime configuration types.

/// JIT compilation mode
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum JitMode {
    /// JIT disabled, interpreter only
    Off,
    /// JIT required; compilation failure is an error
    On,
    /// JIT if supported on this platform, interpreter otherwise
    #[default]
    Auto,
}

/// Runtime configuration for the driver
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub jit_mode: JitMode,
    /// Identifier aliasing and constant-operand folding in the JIT
    pub use_optimizations: bool,
    pub trace_jit: bool,
    /// Print the bytecode listing before running
    pub disassemble: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            jit_mode: JitMode::Auto,
            use_optimizations: true,
            trace_jit: false,
            disassemble: false,
        }
    }
}
