use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;

use turbine::{compiler, JitMode, RuntimeConfig};

#[derive(Parser)]
#[command(name = "turbine")]
#[command(about = "An experimental toy language with a bytecode VM and an x86-64 JIT", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a turbine source file
    Run {
        /// The source file to run
        file: PathBuf,

        /// Interpret only, never JIT
        #[arg(long)]
        no_jit: bool,

        /// Disable JIT optimizations (aliasing, constant folding)
        #[arg(long)]
        no_opt: bool,

        /// Print the bytecode listing before running
        #[arg(long)]
        disasm: bool,

        /// Trace JIT compilation events
        #[arg(long)]
        trace_jit: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            no_jit,
            no_opt,
            disasm,
            trace_jit,
        } => {
            let config = RuntimeConfig {
                jit_mode: if no_jit { JitMode::Off } else { JitMode::Auto },
                use_optimizations: !no_opt,
                trace_jit,
                disassemble: disasm,
            };

            if let Err(e) = run_file(&file, &config) {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

fn run_file(path: &PathBuf, config: &RuntimeConfig) -> Result<(), String> {
    let source = std::fs::read_to_string(path)
        .map_err(|e| format!("error: could not read file '{}': {}", path.display(), e))?;

    let filename = path.to_string_lossy();
    let value = compiler::run_source(&filename, &source, config)?;
    println!("Return: {}", value);
    Ok(())
}
