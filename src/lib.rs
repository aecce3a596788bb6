pub mod chunk;
pub mod compiler;
pub mod loader;
pub mod natives;
pub mod reporter;
pub mod scanner;
pub mod token;
pub mod value;
pub mod vm;

use compiler::Compiler;
use loader::ModuleLoader;
use reporter::Reporter;
use vm::Vm;

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum InterpretError {
    Compile,
    Runtime,
}

/// Compiles `source` into the top-level script function and runs it on
/// `vm`. Compile diagnostics go to the reporter; a runtime error is
/// printed with its backtrace before the status comes back.
pub fn interpret(
    source: &str,
    vm: &mut Vm,
    loader: &dyn ModuleLoader,
    reporter: &mut dyn Reporter,
) -> Result<(), InterpretError> {
    let function = match Compiler::new(source, loader).compile() {
        Ok(function) => function,
        Err(reports) => {
            for report in reports {
                reporter.error(report);
            }
            return Err(InterpretError::Compile);
        }
    };

    #[cfg(feature = "debug-bytecode")]
    eprint!("{:?}", function.chunk);

    vm.interpret(function).map_err(|err| {
        eprintln!("{err}");
        InterpretError::Runtime
    })
}
