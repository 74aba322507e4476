use crate::token::{Token, TokenKind};
use path_absolutize::Absolutize;
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::rc::Rc;

/// A lexical or import-resolution failure. `compiler::CompileError` wraps
/// this the same way it wraps its own parse errors, so the two render
/// through one `Display` path.
#[derive(Debug, Clone)]
pub struct ScanError {
    pub message: String,
    pub line: u32,
    pub file: Rc<str>,
}

impl ScanError {
    fn new(message: impl Into<String>, line: u32, file: Rc<str>) -> Self {
        Self {
            message: message.into(),
            line,
            file,
        }
    }
}

fn stdlib_path(name: &str) -> Option<&'static str> {
    Some(match name {
        "Queue" => "lib/src/queue.lum",
        "Stack" => "lib/src/stack.lum",
        "Math" => "lib/src/math.lum",
        "Random" => "lib/src/random.lum",
        "Heap" => "lib/src/heap.lum",
        "HashMap" => "lib/src/hash_map.lum",
        _ => return None,
    })
}

fn keyword(word: &str) -> Option<TokenKind> {
    use TokenKind::*;
    Some(match word {
        "equals" => Equals,
        "and" => And,
        "or" => Or,
        "not" => Not,
        "if" => If,
        "else" => Else,
        "while" => While,
        "for" => For,
        "from" => From,
        "to" => To,
        "by" => By,
        "return" => Return,
        "print" => Print,
        "true" => True,
        "false" => False,
        "null" => Null,
        "function" => Function,
        "this" => This,
        "class" => Class,
        "inherits" => Inherits,
        "super" => Super,
        "private" => Private,
        "protected" => Protected,
        "public" => Public,
        "break" => Break,
        "continue" => Continue,
        "import" => Import,
        _ => return None,
    })
}

/// Tracks every absolute path that has already been inlined, shared by
/// reference across the root scan and every nested import scan so an
/// import cycle or a diamond import only ever splices its target once.
#[derive(Default)]
pub struct ImportGraph {
    seen: HashSet<PathBuf>,
}

impl ImportGraph {
    pub fn new() -> Self {
        Self::default()
    }

    fn mark(&mut self, path: &Path) -> bool {
        self.seen.insert(path.to_path_buf())
    }
}

pub struct Scanner<'a> {
    chars: Vec<char>,
    start: usize,
    current: usize,
    line: u32,
    file: Rc<str>,
    dir: PathBuf,
    imports: &'a mut ImportGraph,
}

impl<'a> Scanner<'a> {
    pub fn new(source: &str, file: Rc<str>, imports: &'a mut ImportGraph) -> Self {
        let dir = Path::new(file.as_ref())
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));
        Self {
            chars: source.chars().collect(),
            start: 0,
            current: 0,
            line: 1,
            file,
            dir,
            imports,
        }
    }

    /// Scans the whole source into a flat token vector with imports already
    /// spliced in, terminated by exactly one `Eof`.
    pub fn scan_all(mut self) -> Result<Vec<Token>, ScanError> {
        let mut out = Vec::new();
        loop {
            let token = self.scan_token()?;
            if token.kind == TokenKind::Import {
                self.splice_import(&mut out)?;
                continue;
            }
            let done = token.kind == TokenKind::Eof;
            out.push(token);
            if done {
                break;
            }
        }
        Ok(out)
    }

    fn splice_import(&mut self, out: &mut Vec<Token>) -> Result<(), ScanError> {
        self.skip_whitespace_and_comments();
        let target_start = self.current;
        while !self.at_end() && !self.peek().is_whitespace() {
            self.advance();
        }
        let target: String = self.chars[target_start..self.current].iter().collect();
        if target.is_empty() {
            return Err(self.error("Expected a module name or path after 'import'"));
        }

        let resolved = if let Some(std_path) = stdlib_path(&target) {
            PathBuf::from(std_path)
        } else {
            let candidate = PathBuf::from(&target);
            if candidate.is_relative() {
                self.dir.join(candidate)
            } else {
                candidate
            }
        };
        let absolute = resolved
            .absolutize()
            .map_err(|e| self.error(format!("Can't resolve import '{}': {}", target, e)))?
            .to_path_buf();

        if !self.imports.mark(&absolute) {
            // Already inlined elsewhere in this compilation; a no-op import.
            return Ok(());
        }

        let source = fs::read_to_string(&absolute)
            .map_err(|e| self.error(format!("Can't open imported file '{}': {}", target, e)))?;
        let file: Rc<str> = Rc::from(absolute.to_string_lossy().into_owned());
        let nested = Scanner::new(&source, file, self.imports);
        let mut tokens = nested.scan_all().map_err(|mut e| {
            e.message = format!("in imported file: {}", e.message);
            e
        })?;
        tokens.pop(); // drop the nested Eof; the outer scan supplies its own
        out.extend(tokens);
        Ok(())
    }

    fn error(&self, message: impl Into<String>) -> ScanError {
        ScanError::new(message, self.line, self.file.clone())
    }

    fn at_end(&self) -> bool {
        self.current >= self.chars.len()
    }

    fn peek(&self) -> char {
        self.chars.get(self.current).copied().unwrap_or('\0')
    }

    fn peek_next(&self) -> char {
        self.chars.get(self.current + 1).copied().unwrap_or('\0')
    }

    fn advance(&mut self) -> char {
        let c = self.chars[self.current];
        self.current += 1;
        if c == '\n' {
            self.line += 1;
        }
        c
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.at_end() || self.peek() != expected {
            return false;
        }
        self.advance();
        true
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.peek() {
                ' ' | '\r' | '\t' | '\n' => {
                    self.advance();
                }
                '/' if self.peek_next() == '/' => {
                    while !self.at_end() && self.peek() != '\n' {
                        self.advance();
                    }
                }
                '/' if self.peek_next() == '*' => {
                    self.advance();
                    self.advance();
                    while !self.at_end() && !(self.peek() == '*' && self.peek_next() == '/') {
                        self.advance();
                    }
                    if self.at_end() {
                        return; // unterminated block comment surfaces as Eof/Error below
                    }
                    self.advance();
                    self.advance();
                }
                _ => return,
            }
        }
    }

    fn make(&self, kind: TokenKind) -> Token {
        let lexeme: String = self.chars[self.start..self.current].iter().collect();
        Token::new(kind, lexeme, self.line, self.file.clone())
    }

    fn string(&mut self) -> Result<Token, ScanError> {
        while !self.at_end() && self.peek() != '"' {
            self.advance(); // newlines inside strings are permitted; advance() bumps line
        }
        if self.at_end() {
            return Err(self.error("Unterminated string"));
        }
        self.advance(); // closing quote
        let lexeme: String = self.chars[self.start + 1..self.current - 1]
            .iter()
            .collect();
        Ok(Token::new(TokenKind::String, lexeme, self.line, self.file.clone()))
    }

    fn number(&mut self) -> Result<Token, ScanError> {
        while self.peek().is_ascii_digit() {
            self.advance();
        }
        if self.peek() == '.' && self.peek_next().is_ascii_digit() {
            self.advance();
            while self.peek().is_ascii_digit() {
                self.advance();
            }
        }
        if self.peek().is_alphabetic() || self.peek() == '_' {
            return Err(self.error("Invalid number literal"));
        }
        Ok(self.make(TokenKind::Number))
    }

    fn identifier(&mut self) -> Token {
        while self.peek().is_alphanumeric() || self.peek() == '_' {
            self.advance();
        }
        let text: String = self.chars[self.start..self.current].iter().collect();
        match keyword(&text) {
            Some(kind) => self.make(kind),
            None => self.make(TokenKind::Identifier),
        }
    }

    fn scan_token(&mut self) -> Result<Token, ScanError> {
        self.skip_whitespace_and_comments();
        self.start = self.current;
        if self.at_end() {
            return Ok(self.make(TokenKind::Eof));
        }

        let c = self.advance();
        if c.is_ascii_digit() {
            return self.number();
        }
        if c.is_alphabetic() || c == '_' {
            return Ok(self.identifier());
        }

        use TokenKind::*;
        let kind = match c {
            '(' => OParen,
            ')' => CParen,
            '{' => OBrace,
            '}' => CBrace,
            '[' => OBracket,
            ']' => CBracket,
            ',' => Comma,
            '.' => Dot,
            ';' => Semicolon,
            '+' => {
                if self.matches('=') {
                    PlusEqual
                } else {
                    Plus
                }
            }
            '-' => {
                if self.matches('=') {
                    MinusEqual
                } else {
                    Minus
                }
            }
            '*' => {
                if self.matches('=') {
                    StarEqual
                } else {
                    Star
                }
            }
            '/' => {
                if self.matches('=') {
                    SlashEqual
                } else {
                    Slash
                }
            }
            '%' => Percent,
            '=' => Equal,
            '>' => {
                if self.matches('=') {
                    GreaterEqual
                } else {
                    Greater
                }
            }
            '<' => {
                if self.matches('=') {
                    LessEqual
                } else {
                    Less
                }
            }
            '"' => return self.string(),
            other => return Err(self.error(format!("Unexpected character '{}'", other))),
        };
        Ok(self.make(kind))
    }
}
