mod args;

use args::{get_action, Action, EvalMode};
use embr::loader::FileLoader;
use embr::reporter::CliReporter;
use embr::vm::Vm;
use embr::{interpret, InterpretError};
use rustyline::Editor;
use std::{fs, path::PathBuf, process::exit};

const HELP_MSG: &str = "Usage:
  embr [settings] [file]

Runs the file, or starts the interactive prompt when no file is given.

Settings:
  --version
    Print the interpreter version (the file is ignored).
  --help
    Print this message (the file is ignored).
";

fn main() {
    match get_action() {
        Ok(action) => match action {
            Action::Eval(EvalMode::File(path)) => run_file(path),
            Action::Eval(EvalMode::Repl) => run_repl(),
            Action::Version => println!("{}", env!("CARGO_PKG_VERSION")),
            Action::Help => {
                println!(
                    "{} {}\n\n{HELP_MSG}",
                    env!("CARGO_PKG_NAME"),
                    env!("CARGO_PKG_VERSION")
                );
            }
        },
        Err(err) => {
            eprintln!("{err}");
            eprintln!("Use '--help' to see how the interpreter is invoked.");
            exit(exitcode::USAGE);
        }
    }
}

fn run_file(path: PathBuf) {
    let source = fs::read_to_string(&path).unwrap_or_else(|err| {
        eprintln!("Cannot read {}: {err}", path.display());
        exit(exitcode::NOINPUT);
    });
    let loader = FileLoader::new(Some(&path));
    let mut vm = Vm::new();
    let mut reporter = CliReporter::new();
    match interpret(&source, &mut vm, &loader, &mut reporter) {
        Ok(()) => {}
        Err(InterpretError::Compile) => exit(exitcode::DATAERR),
        Err(InterpretError::Runtime) => exit(exitcode::SOFTWARE),
    }
}

/// The prompt keeps one VM alive, so globals survive across lines.
fn run_repl() {
    let mut rl = Editor::<()>::new();
    let loader = FileLoader::new(None);
    let mut vm = Vm::new();
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(&line);
                let mut reporter = CliReporter::new();
                let _ = interpret(&line, &mut vm, &loader, &mut reporter);
            }
            Err(_) => break,
        }
    }
}
