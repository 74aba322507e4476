use std::fmt;
use std::path::PathBuf;

/// What the driver should do once argv has been read. Any argument
/// beginning with `-` is a flag the core driver ignores; the only thing
/// that changes behavior is whether a bare path was given.
#[derive(Debug, Clone)]
pub enum Action {
    Repl,
    File(PathBuf),
    Version,
    Help,
}

#[derive(Debug, Clone)]
pub struct ArgsError(String);

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::error::Error for ArgsError {}

/// Parses `argv` (including the program name at index 0, which is skipped).
/// `--version`/`--help` are recognized as a convenience; every other flag is
/// ignored rather than rejected. A second positional argument is CLI misuse.
pub fn parse<I: Iterator<Item = String>>(mut argv: I) -> Result<Action, ArgsError> {
    argv.next(); // program name

    let mut path: Option<PathBuf> = None;
    for arg in argv {
        match arg.as_str() {
            "--version" => return Ok(Action::Version),
            "--help" => return Ok(Action::Help),
            flag if flag.starts_with('-') => continue,
            positional => {
                if path.is_some() {
                    return Err(ArgsError(format!(
                        "unexpected extra argument '{}': luminous takes at most one file path",
                        positional
                    )));
                }
                path = Some(PathBuf::from(positional));
            }
        }
    }

    Ok(match path {
        Some(p) => Action::File(p),
        None => Action::Repl,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn no_args_means_repl() {
        assert!(matches!(
            parse(args(&["luminous"]).into_iter()).unwrap(),
            Action::Repl
        ));
    }

    #[test]
    fn one_path_means_file() {
        match parse(args(&["luminous", "main.lum"]).into_iter()).unwrap() {
            Action::File(p) => assert_eq!(p, PathBuf::from("main.lum")),
            other => panic!("expected File, got {:?}", other),
        }
    }

    #[test]
    fn unknown_flags_are_ignored() {
        match parse(args(&["luminous", "--trace", "main.lum"]).into_iter()).unwrap() {
            Action::File(p) => assert_eq!(p, PathBuf::from("main.lum")),
            other => panic!("expected File, got {:?}", other),
        }
    }

    #[test]
    fn two_paths_is_misuse() {
        assert!(parse(args(&["luminous", "a.lum", "b.lum"]).into_iter()).is_err());
    }
}
