use std::fmt;
use std::rc::Rc;

/// One entry of a runtime backtrace: the function active at that call depth
/// and where execution had gotten to when the error passed through it.
/// Innermost frame first.
#[derive(Debug, Clone)]
pub struct BacktraceFrame {
    pub name: Option<Rc<str>>,
    pub line: u32,
    pub file: Rc<str>,
}

/// A type, access, arity, or control-flow failure raised by the dispatch
/// loop. Carries the full call-frame stack at the moment of failure so the
/// driver can print a trace without the VM having unwound anything yet.
#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub message: String,
    pub line: u32,
    pub file: Rc<str>,
    pub backtrace: Vec<BacktraceFrame>,
}

impl RuntimeError {
    pub fn new(
        message: impl Into<String>,
        line: u32,
        file: Rc<str>,
        backtrace: Vec<BacktraceFrame>,
    ) -> Self {
        Self {
            message: message.into(),
            line,
            file,
            backtrace,
        }
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (line {} in file '{}')", self.message, self.line, self.file)?;
        writeln!(f, "(Runtime Error)")?;
        for (i, frame) in self.backtrace.iter().enumerate() {
            let name = frame.name.as_deref().unwrap_or("script");
            if i + 1 == self.backtrace.len() {
                write!(f, "[line {} in file {}] in {}", frame.line, frame.file, name)?;
            } else {
                writeln!(f, "[line {} in file {}] in {}", frame.line, frame.file, name)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for RuntimeError {}
