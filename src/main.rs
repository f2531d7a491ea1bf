// File: src/main.rs
//
// CLI entry point for the Coyote language toolchain: parses command-line
// arguments and dispatches to either one-shot file execution, bytecode
// disassembly, or the interactive REPL. Everything here is the "CLI
// collaborator" the specification treats as external to the compiler/VM
// core (spec.md §1, §6) — it only wires the core's public API together.

mod repl;

use clap::{Parser as ClapParser, Subcommand};
use coyote::{compiler::Compiler, natives_builtin, vm::Vm};
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(ClapParser)]
#[command(
    name = "coyote",
    about = "Coyote: a small statically-typed scripting language",
    version = env!("CARGO_PKG_VERSION"),
    long_about = None
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a Coyote script file
    Run {
        /// Path to the source file
        file: PathBuf,

        /// Print the compiled instruction listing before executing
        #[arg(long = "debug")]
        debug: bool,
    },

    /// Compile a script and print its disassembled bytecode without running it
    Disasm {
        /// Path to the source file
        file: PathBuf,
    },

    /// Launch the interactive REPL
    Repl,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Run { file, debug }) => run_file(&file, debug),
        Some(Commands::Disasm { file }) => disasm_file(&file),
        Some(Commands::Repl) | None => run_repl(),
    }
}

fn run_file(path: &PathBuf, debug: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: could not read {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };

    let natives = natives_builtin::registry();
    let chunk = match Compiler::compile(&source, &natives) {
        Ok(chunk) => chunk,
        Err(errors) => {
            for err in &errors {
                eprintln!("{err}");
            }
            return ExitCode::FAILURE;
        }
    };

    if debug {
        eprintln!("{}", chunk.disassemble(&path.to_string_lossy()));
    }

    let mut vm = Vm::new(natives);
    match vm.interpret(chunk) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn disasm_file(path: &PathBuf) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(s) => s,
        Err(e) => {
            eprintln!("error: could not read {}: {e}", path.display());
            return ExitCode::FAILURE;
        }
    };

    let natives = natives_builtin::registry();
    match Compiler::compile(&source, &natives) {
        Ok(chunk) => {
            println!("{}", chunk.disassemble(&path.to_string_lossy()));
            ExitCode::SUCCESS
        }
        Err(errors) => {
            for err in &errors {
                eprintln!("{err}");
            }
            ExitCode::FAILURE
        }
    }
}

fn run_repl() -> ExitCode {
    match repl::Repl::new() {
        Ok(mut repl) => match repl.run() {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                eprintln!("REPL error: {e}");
                ExitCode::FAILURE
            }
        },
        Err(e) => {
            eprintln!("failed to start REPL: {e}");
            ExitCode::FAILURE
        }
    }
}
