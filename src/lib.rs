// File: src/lib.rs
//
// Library interface for the Coyote language toolchain: lexer, Pratt
// compiler, bytecode chunk format, and the stack-based virtual machine.
// Native-function and database collaborators are exposed as traits/types
// for the CLI binary (or any other embedder) to wire up.

pub mod bytecode;
pub mod compiler;
pub mod dataframe;
pub mod errors;
pub mod lexer;
pub mod native;
pub mod natives_builtin;
pub mod rules;
pub mod value;
pub mod vm;

pub use bytecode::{Chunk, OpCode};
pub use compiler::Compiler;
pub use errors::{CompileError, RuntimeError};
pub use value::Value;
pub use vm::Vm;

/// Compiles `source` and runs it to completion on a fresh [`Vm`].
///
/// Convenience wrapper used by the CLI and by integration tests: compiles,
/// and if compilation produced a chunk (no `HadError`), hands it to a new
/// VM. Returns the compile errors instead if compilation failed.
pub fn run(source: &str) -> Result<(), RunError> {
    let registry = natives_builtin::registry();
    let chunk = compiler::Compiler::compile(source, &registry).map_err(RunError::Compile)?;
    let mut vm = vm::Vm::new(registry);
    vm.interpret(chunk).map_err(RunError::Runtime)
}

#[derive(Debug)]
pub enum RunError {
    Compile(Vec<CompileError>),
    Runtime(RuntimeError),
}

impl std::fmt::Display for RunError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RunError::Compile(errs) => {
                for e in errs {
                    writeln!(f, "{e}")?;
                }
                Ok(())
            }
            RunError::Runtime(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for RunError {}
