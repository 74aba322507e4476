mod args;

use args::Action;
use rustyline::error::ReadlineError;
use rustyline::Editor;
use std::path::PathBuf;
use std::rc::Rc;
use std::{fs, process::exit};
use vm::Vm;

const HELP_MSG: &str = "\
usage: luminous [flags] [path]

With no path, starts an interactive REPL. With a path, compiles and runs
that file. Flags beginning with '-' are otherwise ignored.

flags:
  --version   print the interpreter version and exit
  --help      print this message and exit
";

fn main() {
    let action = match args::parse(std::env::args()) {
        Ok(action) => action,
        Err(err) => {
            eprintln!("{err}");
            eprintln!("see 'luminous --help' for usage");
            exit(exitcode::USAGE);
        }
    };

    match action {
        Action::Version => println!("luminous {}", env!("CARGO_PKG_VERSION")),
        Action::Help => print!("{HELP_MSG}"),
        Action::Repl => run_repl(),
        Action::File(path) => run_file(path),
    }
}

/// The banner text shown above the REPL prompt. A `VERSION` file in the
/// working directory overrides the built-in crate version.
fn repl_banner() -> String {
    match fs::read_to_string("VERSION") {
        Ok(contents) => contents.trim().to_owned(),
        Err(_) => format!("luminous {}", env!("CARGO_PKG_VERSION")),
    }
}

fn run_repl() {
    println!("{}", repl_banner());
    let mut vm = Vm::new();
    let mut rl = Editor::<()>::new().expect("failed to initialize line editor");
    loop {
        match rl.readline("> ") {
            Ok(line) => {
                rl.add_history_entry(line.as_str());
                run_source(&mut vm, &line, Rc::from("<repl>"));
            }
            Err(ReadlineError::Interrupted) | Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{err}");
                break;
            }
        }
    }
}

fn run_file(path: PathBuf) {
    let source = match fs::read_to_string(&path) {
        Ok(s) => s,
        Err(err) => {
            eprintln!("Can't open file '{}': {}", path.display(), err);
            exit(exitcode::NOINPUT);
        }
    };
    let file: Rc<str> = Rc::from(path.to_string_lossy().into_owned());
    let mut vm = Vm::new();
    if !run_source(&mut vm, &source, file) {
        exit(exitcode::DATAERR);
    }
}

/// Compiles and runs one unit of source against `vm`. Returns whether it
/// succeeded; errors are reported to stderr in both the REPL and file
/// driver (a fresh `Vm` is not needed after failure: `Vm::interpret`
/// resets its own stacks on error and globals survive).
fn run_source(vm: &mut Vm, source: &str, file: Rc<str>) -> bool {
    match compiler::compile(source, file) {
        Ok(function) => match vm.interpret(function) {
            Ok(()) => true,
            Err(err) => {
                eprintln!("{err}");
                false
            }
        },
        Err(errors) => {
            for err in errors {
                eprintln!("{err}");
            }
            false
        }
    }
}
