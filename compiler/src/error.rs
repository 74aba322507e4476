use lexer::{ScanError, Token};
use std::fmt;
use std::rc::Rc;

/// A single compile-time diagnostic: lexical, parse, or semantic.
#[derive(Debug, Clone)]
pub struct CompileError {
    pub message: String,
    pub line: u32,
    pub file: Rc<str>,
}

impl CompileError {
    pub fn new(message: impl Into<String>, token: &Token) -> Self {
        Self {
            message: message.into(),
            line: token.line,
            file: token.file.clone(),
        }
    }

    pub fn at(message: impl Into<String>, line: u32, file: Rc<str>) -> Self {
        Self {
            message: message.into(),
            line,
            file,
        }
    }
}

impl From<ScanError> for CompileError {
    fn from(e: ScanError) -> Self {
        CompileError::at(e.message, e.line, e.file)
    }
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} (line {} in file '{}')", self.message, self.line, self.file)?;
        write!(f, "(Compile Error)")
    }
}

impl std::error::Error for CompileError {}
