use crate::chunk::{Chunk, OpCode};
use crate::error::CompileError;
use crate::value::{Access, FunctionKind, FunctionObj, Object, Value};
use lexer::{ImportGraph, Scanner, Token, TokenKind};
use std::rc::Rc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call => Primary,
            Primary => Primary,
        }
    }
}

struct LocalVar {
    name: Rc<str>,
    depth: u32,
    is_captured: bool,
}

struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

struct FuncState {
    enclosing: Option<Box<FuncState>>,
    name: Option<Rc<str>>,
    kind: FunctionKind,
    chunk: Chunk,
    arity: u8,
    locals: Vec<LocalVar>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: u32,
}

impl FuncState {
    fn new(name: Option<Rc<str>>, kind: FunctionKind) -> Self {
        let slot0_name: Rc<str> = match kind {
            FunctionKind::Method | FunctionKind::Constructor => Rc::from("this"),
            _ => Rc::from(""),
        };
        Self {
            enclosing: None,
            name,
            kind,
            chunk: Chunk::new(),
            arity: 0,
            locals: vec![LocalVar {
                name: slot0_name,
                depth: 0,
                is_captured: false,
            }],
            upvalues: Vec::new(),
            scope_depth: 0,
        }
    }

    fn resolve_local(&self, name: &str) -> Option<u8> {
        self.locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name.as_ref() == name)
            .map(|(i, _)| i as u8)
    }

    fn add_upvalue(&mut self, index: u8, is_local: bool) -> Result<u8, ()> {
        for (i, uv) in self.upvalues.iter().enumerate() {
            if uv.index == index && uv.is_local == is_local {
                return Ok(i as u8);
            }
        }
        if self.upvalues.len() >= 256 {
            return Err(());
        }
        self.upvalues.push(UpvalueDesc { index, is_local });
        Ok((self.upvalues.len() - 1) as u8)
    }

    fn resolve_upvalue(&mut self, name: &str) -> Result<Option<u8>, ()> {
        let enclosing = match self.enclosing.as_mut() {
            Some(e) => e,
            None => return Ok(None),
        };
        if let Some(slot) = enclosing.resolve_local(name) {
            enclosing.locals[slot as usize].is_captured = true;
            return self.add_upvalue(slot, true).map(Some);
        }
        if let Some(idx) = enclosing.resolve_upvalue(name)? {
            return self.add_upvalue(idx, false).map(Some);
        }
        Ok(None)
    }
}

struct ClassState {
    name: Rc<str>,
    has_superclass: bool,
}

struct LoopState {
    is_for: bool,
    loop_start: usize,
    break_jumps: Vec<usize>,
    continue_jumps: Vec<usize>,
}

enum VarLoc {
    Local(u8),
    Upvalue(u8),
}

fn compound_op_code(kind: TokenKind) -> Option<OpCode> {
    match kind {
        TokenKind::PlusEqual => Some(OpCode::Add),
        TokenKind::MinusEqual => Some(OpCode::Subtract),
        TokenKind::StarEqual => Some(OpCode::Multiply),
        TokenKind::SlashEqual => Some(OpCode::Divide),
        _ => None,
    }
}

/// Single-pass Pratt compiler: consumes a flat token stream (imports
/// already spliced in by the scanner) and emits bytecode directly, with no
/// intermediate AST. One `Compiler` compiles one whole program; nested
/// function bodies are compiled by pushing a new `FuncState` onto `func`
/// and popping it back off when the body closes.
pub struct Compiler {
    tokens: Vec<Rc<Token>>,
    pos: usize,
    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,
    func: Box<FuncState>,
    classes: Vec<ClassState>,
    loops: Vec<LoopState>,
    declared_new_local: bool,
}

impl Compiler {
    fn new(tokens: Vec<Rc<Token>>) -> Self {
        Self {
            tokens,
            pos: 0,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            func: Box::new(FuncState::new(None, FunctionKind::Script)),
            classes: Vec::new(),
            loops: Vec::new(),
            declared_new_local: false,
        }
    }

    // --- token cursor -----------------------------------------------

    fn advance(&mut self) -> Rc<Token> {
        let t = self.tokens[self.pos].clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        t
    }

    fn previous(&self) -> Rc<Token> {
        self.tokens[self.pos.saturating_sub(1)].clone()
    }

    fn peek(&self) -> Rc<Token> {
        self.tokens[self.pos].clone()
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.peek().kind == kind
    }

    fn matches(&mut self, kind: TokenKind) -> bool {
        if self.check(kind) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn consume(&mut self, kind: TokenKind, msg: &str) -> Result<Rc<Token>, ()> {
        if self.check(kind) {
            Ok(self.advance())
        } else {
            let tok = self.peek();
            self.error_at(&tok, msg);
            Err(())
        }
    }

    fn error_at(&mut self, token: &Token, msg: impl Into<String>) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.had_error = true;
        self.errors.push(CompileError::new(msg, token));
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous().kind == TokenKind::Semicolon {
                return;
            }
            use TokenKind::*;
            match self.peek().kind {
                Class | Function | If | While | For | Return | Print | Break | Continue
                | OBrace => return,
                _ => {
                    self.advance();
                }
            }
        }
    }

    fn chunk_mut(&mut self) -> &mut Chunk {
        &mut self.func.chunk
    }

    fn identifier_constant(&mut self, name: &str) -> Result<u8, ()> {
        match self.chunk_mut().add_constant(Value::string(name)) {
            Ok(idx) => Ok(idx),
            Err(()) => {
                let tok = self.previous();
                self.error_at(&tok, "Too many constants in one chunk.");
                Err(())
            }
        }
    }

    fn current_class_name_const(&mut self) -> Result<u8, ()> {
        let name = self
            .classes
            .last()
            .map(|c| c.name.clone())
            .unwrap_or_else(|| Rc::from(""));
        self.identifier_constant(&name)
    }

    // --- scope / locals -----------------------------------------------

    fn begin_scope(&mut self) {
        self.func.scope_depth += 1;
    }

    fn end_scope(&mut self) {
        self.func.scope_depth -= 1;
        while let Some(local) = self.func.locals.last() {
            if local.depth <= self.func.scope_depth {
                break;
            }
            let local = self.func.locals.pop().unwrap();
            if local.is_captured {
                self.chunk_mut().emit_op(OpCode::CloseUpvalue, None);
            } else {
                self.chunk_mut().emit_op(OpCode::Pop, None);
            }
        }
    }

    fn declare_local(&mut self, name: Rc<str>) -> Result<u8, ()> {
        if self.func.locals.len() >= 256 {
            let tok = self.previous();
            self.error_at(&tok, "Too many local variables in one function.");
            return Err(());
        }
        self.func.locals.push(LocalVar {
            name,
            depth: self.func.scope_depth,
            is_captured: false,
        });
        Ok((self.func.locals.len() - 1) as u8)
    }

    fn resolve_existing(&mut self, name: &str) -> Result<Option<VarLoc>, ()> {
        if let Some(slot) = self.func.resolve_local(name) {
            return Ok(Some(VarLoc::Local(slot)));
        }
        if let Some(idx) = self.func.resolve_upvalue(name)? {
            return Ok(Some(VarLoc::Upvalue(idx)));
        }
        Ok(None)
    }

    fn emit_get(&mut self, name: &str, token: Rc<Token>) -> Result<(), ()> {
        match self.resolve_existing(name)? {
            Some(VarLoc::Local(slot)) => {
                self.chunk_mut().emit_op(OpCode::GetLocal, Some(token));
                self.chunk_mut().emit_byte(slot);
            }
            Some(VarLoc::Upvalue(idx)) => {
                self.chunk_mut().emit_op(OpCode::GetUpvalue, Some(token));
                self.chunk_mut().emit_byte(idx);
            }
            None => {
                let idx = self.identifier_constant(name)?;
                self.chunk_mut().emit_op(OpCode::GetGlobal, Some(token));
                self.chunk_mut().emit_byte(idx);
            }
        }
        Ok(())
    }

    fn emit_set_existing(&mut self, name: &str, token: Rc<Token>) -> Result<(), ()> {
        match self.resolve_existing(name)? {
            Some(VarLoc::Local(slot)) => {
                self.chunk_mut().emit_op(OpCode::SetLocal, Some(token));
                self.chunk_mut().emit_byte(slot);
            }
            Some(VarLoc::Upvalue(idx)) => {
                self.chunk_mut().emit_op(OpCode::SetUpvalue, Some(token));
                self.chunk_mut().emit_byte(idx);
            }
            None => {
                let idx = self.identifier_constant(name)?;
                self.chunk_mut().emit_op(OpCode::SetGlobal, Some(token));
                self.chunk_mut().emit_byte(idx);
            }
        }
        Ok(())
    }

    // --- expressions -----------------------------------------------

    fn expression(&mut self) -> Result<(), ()> {
        self.parse_precedence(Precedence::Assignment)
    }

    fn infix_precedence(kind: TokenKind) -> Precedence {
        use TokenKind::*;
        match kind {
            Plus | Minus => Precedence::Term,
            Star | Slash | Percent => Precedence::Factor,
            Equals => Precedence::Equality,
            Greater | GreaterEqual | Less | LessEqual => Precedence::Comparison,
            And => Precedence::And,
            Or => Precedence::Or,
            OParen | Dot | OBracket => Precedence::Call,
            _ => Precedence::None,
        }
    }

    fn parse_precedence(&mut self, prec: Precedence) -> Result<(), ()> {
        self.advance();
        let prev_kind = self.previous().kind;
        let can_assign = prec <= Precedence::Assignment;
        self.run_prefix(prev_kind, can_assign)?;

        while prec <= Self::infix_precedence(self.peek().kind) {
            self.advance();
            let infix_kind = self.previous().kind;
            self.run_infix(infix_kind, can_assign)?;
        }

        if can_assign && self.check(TokenKind::Equal) {
            let tok = self.peek();
            self.error_at(&tok, "Invalid assignment target.");
            self.advance();
            return Err(());
        }
        Ok(())
    }

    fn run_prefix(&mut self, kind: TokenKind, can_assign: bool) -> Result<(), ()> {
        use TokenKind::*;
        match kind {
            Number => self.number(),
            String => self.string_lit(),
            True | False | Null => self.literal(),
            Identifier => self.variable(can_assign),
            This => self.this_(),
            Super => self.super_(),
            OParen => self.grouping(),
            Minus | Not => self.unary(),
            OBracket => self.list_literal(),
            _ => {
                let tok = self.previous();
                self.error_at(&tok, "Expect expression.");
                Err(())
            }
        }
    }

    fn run_infix(&mut self, kind: TokenKind, can_assign: bool) -> Result<(), ()> {
        use TokenKind::*;
        match kind {
            Plus | Minus | Star | Slash | Percent | Equals | Greater | GreaterEqual | Less
            | LessEqual => self.binary(),
            And => self.and_(),
            Or => self.or_(),
            OParen => self.call(),
            Dot => self.dot(can_assign),
            OBracket => self.index_(can_assign),
            _ => unreachable!("infix_precedence admitted a kind with no infix rule"),
        }
    }

    fn number(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        let n: f64 = match tok.lexeme.parse() {
            Ok(n) => n,
            Err(_) => {
                self.error_at(&tok, "Invalid number literal.");
                return Err(());
            }
        };
        if self
            .chunk_mut()
            .emit_constant(Value::Number(n), Some(tok.clone()))
            .is_err()
        {
            self.error_at(&tok, "Too many constants in one chunk.");
            return Err(());
        }
        Ok(())
    }

    fn string_lit(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        let value = Value::string(tok.lexeme.clone());
        if self.chunk_mut().emit_constant(value, Some(tok.clone())).is_err() {
            self.error_at(&tok, "Too many constants in one chunk.");
            return Err(());
        }
        Ok(())
    }

    fn literal(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        match tok.kind {
            TokenKind::True => {
                self.chunk_mut().emit_op(OpCode::True, Some(tok));
            }
            TokenKind::False => {
                self.chunk_mut().emit_op(OpCode::False, Some(tok));
            }
            TokenKind::Null => {
                self.chunk_mut().emit_op(OpCode::Null, Some(tok));
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn grouping(&mut self) -> Result<(), ()> {
        self.expression()?;
        self.consume(TokenKind::CParen, "Expect ')' after expression.")?;
        Ok(())
    }

    fn unary(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        self.parse_precedence(Precedence::Unary)?;
        match tok.kind {
            TokenKind::Minus => {
                self.chunk_mut().emit_op(OpCode::Negate, Some(tok));
            }
            TokenKind::Not => {
                self.chunk_mut().emit_op(OpCode::Not, Some(tok));
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn binary(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        let prec = Self::infix_precedence(tok.kind);
        self.parse_precedence(prec.next())?;
        use TokenKind::*;
        match tok.kind {
            Plus => {
                self.chunk_mut().emit_op(OpCode::Add, Some(tok));
            }
            Minus => {
                self.chunk_mut().emit_op(OpCode::Subtract, Some(tok));
            }
            Star => {
                self.chunk_mut().emit_op(OpCode::Multiply, Some(tok));
            }
            Slash => {
                self.chunk_mut().emit_op(OpCode::Divide, Some(tok));
            }
            Percent => {
                self.chunk_mut().emit_op(OpCode::Modulo, Some(tok));
            }
            Equals => {
                self.chunk_mut().emit_op(OpCode::Equal, Some(tok));
            }
            Greater => {
                self.chunk_mut().emit_op(OpCode::Greater, Some(tok));
            }
            Less => {
                self.chunk_mut().emit_op(OpCode::Less, Some(tok));
            }
            GreaterEqual => {
                self.chunk_mut().emit_op(OpCode::Less, Some(tok.clone()));
                self.chunk_mut().emit_op(OpCode::Not, Some(tok));
            }
            LessEqual => {
                self.chunk_mut().emit_op(OpCode::Greater, Some(tok.clone()));
                self.chunk_mut().emit_op(OpCode::Not, Some(tok));
            }
            _ => unreachable!(),
        }
        Ok(())
    }

    fn and_(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        let end_jump = self.chunk_mut().emit_jump(OpCode::JumpIfFalse, Some(tok.clone()));
        self.chunk_mut().emit_op(OpCode::Pop, Some(tok.clone()));
        self.parse_precedence(Precedence::And)?;
        if self.chunk_mut().patch_jump(end_jump).is_err() {
            self.error_at(&tok, "Jump distance too large.");
            return Err(());
        }
        Ok(())
    }

    fn or_(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        let else_jump = self.chunk_mut().emit_jump(OpCode::JumpIfFalse, Some(tok.clone()));
        let end_jump = self.chunk_mut().emit_jump(OpCode::Jump, Some(tok.clone()));
        if self.chunk_mut().patch_jump(else_jump).is_err() {
            self.error_at(&tok, "Jump distance too large.");
            return Err(());
        }
        self.chunk_mut().emit_op(OpCode::Pop, Some(tok.clone()));
        self.parse_precedence(Precedence::Or)?;
        if self.chunk_mut().patch_jump(end_jump).is_err() {
            self.error_at(&tok, "Jump distance too large.");
            return Err(());
        }
        Ok(())
    }

    fn argument_list(&mut self) -> Result<u8, ()> {
        let mut argc: u16 = 0;
        if !self.check(TokenKind::CParen) {
            loop {
                self.expression()?;
                argc += 1;
                if argc > 255 {
                    let tok = self.previous();
                    self.error_at(&tok, "Can't have more than 255 arguments.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::CParen, "Expect ')' after arguments.")?;
        Ok(argc as u8)
    }

    fn call(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        let argc = self.argument_list()?;
        self.chunk_mut().emit_op(OpCode::Call, Some(tok));
        self.chunk_mut().emit_byte(argc);
        Ok(())
    }

    fn dot(&mut self, can_assign: bool) -> Result<(), ()> {
        let name_tok = self.consume(TokenKind::Identifier, "Expect property name after '.'.")?;
        let name_const = self.identifier_constant(&name_tok.lexeme)?;

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression()?;
            let accessor = self.current_class_name_const()?;
            self.chunk_mut().emit_op(OpCode::SetProperty, Some(name_tok));
            self.chunk_mut().emit_byte(name_const);
            self.chunk_mut().emit_byte(accessor);
        } else if can_assign && compound_op_code(self.peek().kind).is_some() {
            let op = compound_op_code(self.peek().kind).unwrap();
            self.advance();
            let accessor = self.current_class_name_const()?;
            self.chunk_mut().emit_op(OpCode::Duplicate, Some(name_tok.clone()));
            self.chunk_mut().emit_byte(1);
            self.chunk_mut().emit_op(OpCode::GetProperty, Some(name_tok.clone()));
            self.chunk_mut().emit_byte(name_const);
            self.chunk_mut().emit_byte(accessor);
            self.expression()?;
            self.chunk_mut().emit_op(op, Some(name_tok.clone()));
            self.chunk_mut().emit_op(OpCode::SetProperty, Some(name_tok));
            self.chunk_mut().emit_byte(name_const);
            self.chunk_mut().emit_byte(accessor);
        } else if self.matches(TokenKind::OParen) {
            let argc = self.argument_list()?;
            let accessor = self.current_class_name_const()?;
            self.chunk_mut().emit_op(OpCode::Invoke, Some(name_tok));
            self.chunk_mut().emit_byte(name_const);
            self.chunk_mut().emit_byte(argc);
            self.chunk_mut().emit_byte(accessor);
        } else {
            let accessor = self.current_class_name_const()?;
            self.chunk_mut().emit_op(OpCode::GetProperty, Some(name_tok));
            self.chunk_mut().emit_byte(name_const);
            self.chunk_mut().emit_byte(accessor);
        }
        Ok(())
    }

    fn index_(&mut self, can_assign: bool) -> Result<(), ()> {
        let tok = self.previous();
        self.expression()?;
        self.consume(TokenKind::CBracket, "Expect ']' after index.")?;

        if can_assign && self.matches(TokenKind::Equal) {
            self.expression()?;
            self.chunk_mut().emit_op(OpCode::ArraySet, Some(tok));
        } else if can_assign && compound_op_code(self.peek().kind).is_some() {
            let op = compound_op_code(self.peek().kind).unwrap();
            self.advance();
            self.chunk_mut().emit_op(OpCode::Duplicate, Some(tok.clone()));
            self.chunk_mut().emit_byte(2);
            self.chunk_mut().emit_op(OpCode::ArrayGet, Some(tok.clone()));
            self.expression()?;
            self.chunk_mut().emit_op(op, Some(tok.clone()));
            self.chunk_mut().emit_op(OpCode::ArraySet, Some(tok));
        } else {
            self.chunk_mut().emit_op(OpCode::ArrayGet, Some(tok));
        }
        Ok(())
    }

    fn list_literal(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        let mut count: u16 = 0;
        if !self.check(TokenKind::CBracket) {
            loop {
                self.expression()?;
                count += 1;
                if count > 255 {
                    self.error_at(&tok, "Too many elements in list literal.");
                }
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::CBracket, "Expect ']' after list elements.")?;
        self.chunk_mut().emit_op(OpCode::Array, Some(tok));
        self.chunk_mut().emit_byte(count as u8);
        Ok(())
    }

    fn variable(&mut self, can_assign: bool) -> Result<(), ()> {
        let name_tok = self.previous();
        let name: Rc<str> = name_tok.lexeme.clone();

        if can_assign && self.check(TokenKind::Equal) {
            self.advance();
            match self.resolve_existing(&name)? {
                Some(VarLoc::Local(slot)) => {
                    self.expression()?;
                    self.chunk_mut().emit_op(OpCode::SetLocal, Some(name_tok));
                    self.chunk_mut().emit_byte(slot);
                }
                Some(VarLoc::Upvalue(idx)) => {
                    self.expression()?;
                    self.chunk_mut().emit_op(OpCode::SetUpvalue, Some(name_tok));
                    self.chunk_mut().emit_byte(idx);
                }
                None => {
                    if self.func.scope_depth > 0 {
                        self.expression()?;
                        self.declare_local(name)?;
                        self.declared_new_local = true;
                    } else {
                        self.expression()?;
                        let idx = self.identifier_constant(&name)?;
                        self.chunk_mut().emit_op(OpCode::SetGlobal, Some(name_tok));
                        self.chunk_mut().emit_byte(idx);
                    }
                }
            }
        } else if can_assign && compound_op_code(self.peek().kind).is_some() {
            let op = compound_op_code(self.peek().kind).unwrap();
            self.advance();
            self.emit_get(&name, name_tok.clone())?;
            self.expression()?;
            self.chunk_mut().emit_op(op, Some(name_tok.clone()));
            self.emit_set_existing(&name, name_tok)?;
        } else {
            self.emit_get(&name, name_tok)?;
        }
        Ok(())
    }

    fn this_(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        if self.classes.is_empty() {
            self.error_at(&tok, "Can't use 'this' outside of a class.");
        }
        self.emit_get("this", tok)
    }

    fn super_(&mut self) -> Result<(), ()> {
        let super_tok = self.previous();
        if self.classes.is_empty() {
            self.error_at(&super_tok, "Can't use 'super' outside of a class.");
        } else if !self.classes.last().unwrap().has_superclass {
            self.error_at(&super_tok, "Can't use 'super' in a class with no superclass.");
        }
        self.consume(TokenKind::Dot, "Expect '.' after 'super'.")?;
        let name_tok = self.consume(TokenKind::Identifier, "Expect superclass method name.")?;
        let name_const = self.identifier_constant(&name_tok.lexeme)?;

        self.emit_get("this", super_tok.clone())?;
        if self.matches(TokenKind::OParen) {
            let argc = self.argument_list()?;
            let accessor = self.current_class_name_const()?;
            self.emit_get("super", super_tok)?;
            self.chunk_mut().emit_op(OpCode::SuperInvoke, Some(name_tok));
            self.chunk_mut().emit_byte(name_const);
            self.chunk_mut().emit_byte(argc);
            self.chunk_mut().emit_byte(accessor);
        } else {
            self.emit_get("super", super_tok)?;
            self.chunk_mut().emit_op(OpCode::GetSuper, Some(name_tok));
            self.chunk_mut().emit_byte(name_const);
        }
        Ok(())
    }

    // --- statements -----------------------------------------------

    fn declaration(&mut self) {
        let result = if self.matches(TokenKind::Class) {
            self.class_declaration()
        } else if self.matches(TokenKind::Function) {
            self.function_declaration()
        } else {
            self.statement()
        };
        if result.is_err() {
            self.synchronize();
        }
    }

    fn block(&mut self) -> Result<(), ()> {
        while !self.check(TokenKind::CBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.consume(TokenKind::CBrace, "Expect '}' after block.")?;
        Ok(())
    }

    fn statement(&mut self) -> Result<(), ()> {
        if self.matches(TokenKind::Print) {
            self.print_statement()
        } else if self.matches(TokenKind::If) {
            self.if_statement()
        } else if self.matches(TokenKind::While) {
            self.while_statement()
        } else if self.matches(TokenKind::For) {
            self.for_statement()
        } else if self.matches(TokenKind::Return) {
            self.return_statement()
        } else if self.matches(TokenKind::Break) {
            self.break_statement()
        } else if self.matches(TokenKind::Continue) {
            self.continue_statement()
        } else if self.matches(TokenKind::OBrace) {
            self.begin_scope();
            let r = self.block();
            self.end_scope();
            r
        } else {
            self.expression_statement()
        }
    }

    fn print_statement(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        self.consume(TokenKind::OParen, "Expect '(' after 'print'.")?;
        self.expression()?;
        self.consume(TokenKind::CParen, "Expect ')' after value.")?;
        self.consume(TokenKind::Semicolon, "Expect ';' after value.")?;
        self.chunk_mut().emit_op(OpCode::Print, Some(tok));
        Ok(())
    }

    fn expression_statement(&mut self) -> Result<(), ()> {
        self.declared_new_local = false;
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after expression.")?;
        if self.func.scope_depth == 0 || !self.declared_new_local {
            self.chunk_mut().emit_op(OpCode::Pop, None);
        }
        Ok(())
    }

    fn if_statement(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        self.consume(TokenKind::OParen, "Expect '(' after 'if'.")?;
        self.expression()?;
        self.consume(TokenKind::CParen, "Expect ')' after condition.")?;

        let then_jump = self.chunk_mut().emit_jump(OpCode::JumpIfFalse, Some(tok.clone()));
        self.chunk_mut().emit_op(OpCode::Pop, Some(tok.clone()));
        self.statement()?;

        let else_jump = self.chunk_mut().emit_jump(OpCode::Jump, Some(tok.clone()));
        if self.chunk_mut().patch_jump(then_jump).is_err() {
            self.error_at(&tok, "Jump distance too large.");
            return Err(());
        }
        self.chunk_mut().emit_op(OpCode::Pop, Some(tok.clone()));

        if self.matches(TokenKind::Else) {
            self.statement()?;
        }
        if self.chunk_mut().patch_jump(else_jump).is_err() {
            self.error_at(&tok, "Jump distance too large.");
            return Err(());
        }
        Ok(())
    }

    fn while_statement(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        let loop_start = self.chunk_mut().len();
        self.consume(TokenKind::OParen, "Expect '(' after 'while'.")?;
        self.expression()?;
        self.consume(TokenKind::CParen, "Expect ')' after condition.")?;

        let exit_jump = self.chunk_mut().emit_jump(OpCode::JumpIfFalse, Some(tok.clone()));
        self.chunk_mut().emit_op(OpCode::Pop, Some(tok.clone()));

        self.loops.push(LoopState {
            is_for: false,
            loop_start,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        self.statement()?;
        if self.chunk_mut().emit_loop(loop_start, Some(tok.clone())).is_err() {
            self.error_at(&tok, "Loop body too large.");
            return Err(());
        }

        if self.chunk_mut().patch_jump(exit_jump).is_err() {
            self.error_at(&tok, "Jump distance too large.");
            return Err(());
        }
        self.chunk_mut().emit_op(OpCode::Pop, Some(tok));
        let loop_state = self.loops.pop().unwrap();
        for j in loop_state.break_jumps {
            let _ = self.chunk_mut().patch_jump(j);
        }
        Ok(())
    }

    /// `for (id from expr to expr by [-]num) stmt`. `id` reuses an existing
    /// local of the same name if one is already in scope rather than always
    /// declaring a fresh one, which is intentional.
    fn for_statement(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        self.consume(TokenKind::OParen, "Expect '(' after 'for'.")?;
        let id_tok = self.consume(TokenKind::Identifier, "Expect loop variable name.")?;
        let name: Rc<str> = id_tok.lexeme.clone();
        self.consume(TokenKind::From, "Expect 'from' after loop variable.")?;
        self.expression()?; // initial value

        let reused = self.resolve_existing(&name)?;
        match reused {
            Some(VarLoc::Local(slot)) => {
                self.chunk_mut().emit_op(OpCode::SetLocal, Some(id_tok.clone()));
                self.chunk_mut().emit_byte(slot);
                self.chunk_mut().emit_op(OpCode::Pop, None);
            }
            _ if self.func.scope_depth == 0 => {
                let idx = self.identifier_constant(&name)?;
                self.chunk_mut().emit_op(OpCode::SetGlobal, Some(id_tok.clone()));
                self.chunk_mut().emit_byte(idx);
                self.chunk_mut().emit_op(OpCode::Pop, None);
            }
            _ => {
                // Upvalue hits or a brand-new name both shadow with a fresh
                // local of this function rather than touching an enclosing
                // function's variable.
                self.declare_local(name.clone())?;
            }
        }

        self.consume(TokenKind::To, "Expect 'to' after initial value.")?;
        let loop_start = self.chunk_mut().len();
        // Loop head: re-pushes loopvar and recompiles the bound expression
        // every iteration, since this bytecode sits at the LOOP target.
        self.emit_get(&name, id_tok.clone())?;
        self.expression()?; // bound
        self.consume(TokenKind::By, "Expect 'by' after loop bound.")?;
        let by_negative = self.matches(TokenKind::Minus);
        let by_tok = self.consume(TokenKind::Number, "Expect a numeric step after 'by'.")?;
        let mut step: f64 = match by_tok.lexeme.parse() {
            Ok(n) => n,
            Err(_) => {
                self.error_at(&by_tok, "Invalid number literal.");
                return Err(());
            }
        };
        if by_negative {
            step = -step;
        }
        self.consume(TokenKind::CParen, "Expect ')' after for clause.")?;

        let cmp = if step < 0.0 { OpCode::Greater } else { OpCode::Less };
        self.chunk_mut().emit_op(cmp, Some(tok.clone()));
        let exit_jump = self.chunk_mut().emit_jump(OpCode::JumpIfFalse, Some(tok.clone()));
        self.chunk_mut().emit_op(OpCode::Pop, Some(tok.clone()));

        self.loops.push(LoopState {
            is_for: true,
            loop_start,
            break_jumps: Vec::new(),
            continue_jumps: Vec::new(),
        });
        self.statement()?;

        let continue_target = self.chunk_mut().len();
        self.emit_get(&name, id_tok.clone())?;
        if self
            .chunk_mut()
            .emit_constant(Value::Number(step), Some(id_tok.clone()))
            .is_err()
        {
            self.error_at(&tok, "Too many constants in one chunk.");
            return Err(());
        }
        self.chunk_mut().emit_op(OpCode::Add, Some(id_tok.clone()));
        self.emit_set_existing(&name, id_tok.clone())?;
        self.chunk_mut().emit_op(OpCode::Pop, None);
        if self.chunk_mut().emit_loop(loop_start, Some(tok.clone())).is_err() {
            self.error_at(&tok, "Loop body too large.");
            return Err(());
        }

        let loop_state = self.loops.pop().unwrap();
        for j in loop_state.continue_jumps {
            let _ = self.chunk_mut().patch_jump_to(j, continue_target);
        }

        if self.chunk_mut().patch_jump(exit_jump).is_err() {
            self.error_at(&tok, "Jump distance too large.");
            return Err(());
        }
        self.chunk_mut().emit_op(OpCode::Pop, Some(tok));
        for j in loop_state.break_jumps {
            let _ = self.chunk_mut().patch_jump(j);
        }
        Ok(())
    }

    fn return_statement(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        if self.func.kind == FunctionKind::Script {
            self.error_at(&tok, "Can't return from top-level code.");
        }
        if self.matches(TokenKind::Semicolon) {
            if self.func.kind == FunctionKind::Constructor {
                self.chunk_mut().emit_op(OpCode::GetLocal, Some(tok.clone()));
                self.chunk_mut().emit_byte(0);
            } else {
                self.chunk_mut().emit_op(OpCode::Null, Some(tok.clone()));
            }
            self.chunk_mut().emit_op(OpCode::Return, Some(tok));
            return Ok(());
        }
        if self.func.kind == FunctionKind::Constructor {
            self.error_at(&tok, "Can't return a value from a constructor.");
        }
        self.expression()?;
        self.consume(TokenKind::Semicolon, "Expect ';' after return value.")?;
        self.chunk_mut().emit_op(OpCode::Return, Some(tok));
        Ok(())
    }

    fn break_statement(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        self.consume(TokenKind::Semicolon, "Expect ';' after 'break'.")?;
        if self.loops.is_empty() {
            self.error_at(&tok, "Can't use 'break' outside of a loop.");
            return Err(());
        }
        let j = self.chunk_mut().emit_jump(OpCode::Jump, Some(tok));
        self.loops.last_mut().unwrap().break_jumps.push(j);
        Ok(())
    }

    fn continue_statement(&mut self) -> Result<(), ()> {
        let tok = self.previous();
        self.consume(TokenKind::Semicolon, "Expect ';' after 'continue'.")?;
        if self.loops.is_empty() {
            self.error_at(&tok, "Can't use 'continue' outside of a loop.");
            return Err(());
        }
        let is_for = self.loops.last().unwrap().is_for;
        if is_for {
            let j = self.chunk_mut().emit_jump(OpCode::Jump, Some(tok));
            self.loops.last_mut().unwrap().continue_jumps.push(j);
        } else {
            let start = self.loops.last().unwrap().loop_start;
            if self.chunk_mut().emit_loop(start, Some(tok.clone())).is_err() {
                self.error_at(&tok, "Loop body too large.");
                return Err(());
            }
        }
        Ok(())
    }

    // --- functions / classes -----------------------------------------------

    fn function(&mut self, kind: FunctionKind, name: Rc<str>, tok: Rc<Token>) -> Result<(), ()> {
        let enclosing = std::mem::replace(&mut self.func, Box::new(FuncState::new(Some(name), kind)));
        self.func.enclosing = Some(enclosing);
        self.begin_scope();

        self.consume(TokenKind::OParen, "Expect '(' after function name.")?;
        if !self.check(TokenKind::CParen) {
            loop {
                if self.func.arity == 255 {
                    self.error_at(&tok, "Can't have more than 255 parameters.");
                }
                self.func.arity += 1;
                let param = self.consume(TokenKind::Identifier, "Expect parameter name.")?;
                self.declare_local(param.lexeme.clone())?;
                if !self.matches(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::CParen, "Expect ')' after parameters.")?;
        self.consume(TokenKind::OBrace, "Expect '{' before function body.")?;
        self.block()?;

        if kind == FunctionKind::Constructor {
            self.chunk_mut().emit_op(OpCode::GetLocal, Some(tok.clone()));
            self.chunk_mut().emit_byte(0);
        } else {
            self.chunk_mut().emit_op(OpCode::Null, Some(tok.clone()));
        }
        self.chunk_mut().emit_op(OpCode::Return, Some(tok.clone()));

        let enclosing = self.func.enclosing.take().unwrap();
        let finished = std::mem::replace(&mut self.func, enclosing);

        let upvalue_count = finished.upvalues.len() as u8;
        let function_obj = Rc::new(FunctionObj {
            name: finished.name,
            arity: finished.arity,
            upvalue_count,
            kind,
            chunk: finished.chunk,
        });
        let const_idx = match self
            .chunk_mut()
            .add_constant(Value::Object(Rc::new(Object::Function(function_obj))))
        {
            Ok(idx) => idx,
            Err(()) => {
                self.error_at(&tok, "Too many constants in one chunk.");
                return Err(());
            }
        };
        self.chunk_mut().emit_op(OpCode::Closure, Some(tok));
        self.chunk_mut().emit_byte(const_idx);
        self.chunk_mut().emit_byte(upvalue_count);
        for uv in &finished.upvalues {
            self.chunk_mut().emit_byte(if uv.is_local { 1 } else { 0 });
            self.chunk_mut().emit_byte(uv.index);
        }
        Ok(())
    }

    fn function_declaration(&mut self) -> Result<(), ()> {
        let name_tok = self.consume(TokenKind::Identifier, "Expect function name.")?;
        let name: Rc<str> = name_tok.lexeme.clone();
        let at_top_level = self.func.scope_depth == 0;
        if !at_top_level {
            self.declare_local(name.clone())?;
        }
        self.function(FunctionKind::Function, name.clone(), name_tok.clone())?;
        if at_top_level {
            let idx = self.identifier_constant(&name)?;
            self.chunk_mut().emit_op(OpCode::SetGlobal, Some(name_tok));
            self.chunk_mut().emit_byte(idx);
            self.chunk_mut().emit_op(OpCode::Pop, None);
        }
        Ok(())
    }

    fn class_member(&mut self) -> Result<(), ()> {
        let access = if self.matches(TokenKind::Private) {
            Access::Private
        } else if self.matches(TokenKind::Protected) {
            Access::Protected
        } else {
            self.matches(TokenKind::Public);
            Access::Public
        };
        let name_tok = self.consume(TokenKind::Identifier, "Expect method or field name.")?;
        let name: Rc<str> = name_tok.lexeme.clone();

        if self.check(TokenKind::OParen) {
            let kind = if name.as_ref() == "constructor" {
                FunctionKind::Constructor
            } else {
                FunctionKind::Method
            };
            self.function(kind, name.clone(), name_tok.clone())?;
            let name_const = self.identifier_constant(&name)?;
            self.chunk_mut().emit_op(OpCode::Method, Some(name_tok));
            self.chunk_mut().emit_byte(name_const);
        } else {
            self.consume(TokenKind::Semicolon, "Expect ';' after field declaration.")?;
            let name_const = self.identifier_constant(&name)?;
            self.chunk_mut().emit_op(OpCode::Field, Some(name_tok));
            self.chunk_mut().emit_byte(name_const);
            self.chunk_mut().emit_byte(access.to_byte());
        }
        Ok(())
    }

    fn class_declaration(&mut self) -> Result<(), ()> {
        let name_tok = self.consume(TokenKind::Identifier, "Expect class name.")?;
        let name: Rc<str> = name_tok.lexeme.clone();
        let at_top_level = self.func.scope_depth == 0;
        if !at_top_level {
            self.declare_local(name.clone())?;
        }
        let name_const = self.identifier_constant(&name)?;
        self.chunk_mut().emit_op(OpCode::Class, Some(name_tok.clone()));
        self.chunk_mut().emit_byte(name_const);

        // Define the name right away (mirrors how a global variable is
        // defined immediately after its initializer) so that `inherits` and
        // the class body can both load it back by name before the
        // declaration statement as a whole has finished compiling.
        if at_top_level {
            self.chunk_mut().emit_op(OpCode::SetGlobal, Some(name_tok.clone()));
            self.chunk_mut().emit_byte(name_const);
            self.chunk_mut().emit_op(OpCode::Pop, None);
        }

        self.classes.push(ClassState {
            name: name.clone(),
            has_superclass: false,
        });

        if self.matches(TokenKind::Inherits) {
            let parent_tok = self.consume(TokenKind::Identifier, "Expect superclass name.")?;
            if parent_tok.lexeme.as_ref() == name.as_ref() {
                self.error_at(&parent_tok, "A class cannot inherit from itself.");
            }
            self.emit_get(&parent_tok.lexeme.clone(), parent_tok.clone())?;
            self.begin_scope();
            self.declare_local(Rc::from("super"))?;
            self.emit_get(&name, name_tok.clone())?;
            self.chunk_mut().emit_op(OpCode::Inherit, Some(parent_tok));
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.consume(TokenKind::OBrace, "Expect '{' before class body.")?;
        self.emit_get(&name, name_tok.clone())?;
        while !self.check(TokenKind::CBrace) && !self.check(TokenKind::Eof) {
            self.class_member()?;
        }
        self.consume(TokenKind::CBrace, "Expect '}' after class body.")?;
        self.chunk_mut().emit_op(OpCode::Pop, None);

        let has_superclass = self.classes.last().unwrap().has_superclass;
        if has_superclass {
            self.end_scope();
        }
        self.classes.pop();
        Ok(())
    }

    fn run(mut self) -> Result<Rc<FunctionObj>, Vec<CompileError>> {
        while !self.check(TokenKind::Eof) {
            self.declaration();
        }
        self.chunk_mut().emit_op(OpCode::Null, None);
        self.chunk_mut().emit_op(OpCode::Return, None);

        if self.had_error {
            Err(self.errors)
        } else {
            let upvalue_count = self.func.upvalues.len() as u8;
            Ok(Rc::new(FunctionObj {
                name: None,
                arity: 0,
                upvalue_count,
                kind: FunctionKind::Script,
                chunk: self.func.chunk,
            }))
        }
    }
}

/// Scans `source` (splicing imports) then compiles it to a root `Function`.
pub fn compile(source: &str, file: Rc<str>) -> Result<Rc<FunctionObj>, Vec<CompileError>> {
    let mut imports = ImportGraph::new();
    let tokens = Scanner::new(source, file, &mut imports)
        .scan_all()
        .map_err(|e| vec![CompileError::from(e)])?;
    let tokens: Vec<Rc<Token>> = tokens.into_iter().map(Rc::new).collect();
    Compiler::new(tokens).run()
}
