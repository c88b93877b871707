pub mod lexer;
mod parser;

pub use lexer::Lexer;
pub use parser::Parser;

use crate::config::{JitMode, RuntimeConfig};
use crate::vm::{disasm, Program, Vm};

/// Compile turbine source text into a bytecode program.
pub fn compile(filename: &str, source: &str) -> Result<Program, String> {
    // Lexing
    let mut lexer = Lexer::new(filename, source);
    let tokens = lexer.scan_tokens()?;

    // Parsing + bytecode emission
    let parser = Parser::new(filename, tokens);
    parser.parse()
}

/// Compile and run source text, returning Main's value.
///
/// With JIT enabled and supported, Main is decompiled and compiled to
/// native code; in `Auto` mode any JIT failure (for example a `call` in
/// Main) falls back to the interpreter.
pub fn run_source(filename: &str, source: &str, config: &RuntimeConfig) -> Result<f64, String> {
    let program = compile(filename, source)?;

    if config.disassemble {
        match disasm::disassemble(&program) {
            Some(listing) => print!("{}", listing),
            None => eprintln!("disassembler: invalid bytecode"),
        }
    }

    if let Some(value) = try_jit(&program, config)? {
        return Ok(value);
    }

    let mut vm = Vm::new();
    vm.run(&program).map_err(|e| format!("error: {}", e))
}

#[cfg(all(target_arch = "x86_64", feature = "jit"))]
fn try_jit(program: &Program, config: &RuntimeConfig) -> Result<Option<f64>, String> {
    use crate::jit::{self, JitOptions};

    if config.jit_mode == JitMode::Off {
        return Ok(None);
    }

    let main = &program.functions[program.main];
    let options = JitOptions {
        use_optimizations: config.use_optimizations,
    };

    match jit::compile(main, options) {
        Ok(function) => {
            if config.trace_jit {
                eprintln!(
                    "[JIT] compiled {}: {} bytes, {} constants",
                    main.name,
                    function.code_len(),
                    function.constants().len()
                );
            }
            Ok(Some(function.call()))
        }
        Err(e) if config.jit_mode == JitMode::On => Err(format!("error: jit: {}", e)),
        Err(e) => {
            if config.trace_jit {
                eprintln!("[JIT] falling back to interpreter: {}", e);
            }
            Ok(None)
        }
    }
}

#[cfg(not(all(target_arch = "x86_64", feature = "jit")))]
fn try_jit(_program: &Program, config: &RuntimeConfig) -> Result<Option<f64>, String> {
    if config.jit_mode == JitMode::On {
        return Err("error: JIT is not supported on this platform".to_string());
    }
    Ok(None)
}
