use crate::value::Value;
use lexer::Token;
use std::convert::TryFrom;
use std::rc::Rc;

use std::fmt;

/// One bytecode operation. Discriminants are assigned explicitly (rather
/// than derived) so the on-disk/in-memory encoding in `Chunk::bytes` is
/// stable even if variants are reordered here later.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum OpCode {
    Constant,
    Null,
    True,
    False,
    Pop,
    GetLocal,
    SetLocal,
    GetGlobal,
    SetGlobal,
    GetUpvalue,
    SetUpvalue,
    GetProperty,
    SetProperty,
    GetSuper,
    Equal,
    Greater,
    Less,
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,
    Not,
    Negate,
    Print,
    Jump,
    JumpIfFalse,
    Loop,
    Call,
    Invoke,
    SuperInvoke,
    Closure,
    CloseUpvalue,
    Return,
    Class,
    Inherit,
    Method,
    Field,
    Array,
    ArrayGet,
    ArraySet,
    Duplicate,
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> u8 {
        op as u8
    }
}

impl TryFrom<u8> for OpCode {
    type Error = ();

    fn try_from(byte: u8) -> Result<Self, ()> {
        use OpCode::*;
        const TABLE: &[OpCode] = &[
            Constant, Null, True, False, Pop, GetLocal, SetLocal, GetGlobal, SetGlobal,
            GetUpvalue, SetUpvalue, GetProperty, SetProperty, GetSuper, Equal, Greater, Less,
            Add, Subtract, Multiply, Divide, Modulo, Not, Negate, Print, Jump, JumpIfFalse, Loop,
            Call, Invoke, SuperInvoke, Closure, CloseUpvalue, Return, Class, Inherit, Method,
            Field, Array, ArrayGet, ArraySet, Duplicate,
        ];
        TABLE.get(byte as usize).copied().ok_or(())
    }
}

/// Packed bytecode for one function body: the instruction stream, its
/// constant pool, and a per-opcode-byte debug token used to render
/// `(line, file)` into compile/runtime diagnostics.
#[derive(Clone, Default)]
pub struct Chunk {
    bytes: Vec<u8>,
    constants: Vec<Value>,
    tokens: Vec<Option<Rc<Token>>>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn read_u8(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    pub fn read_u16(&self, offset: usize) -> u16 {
        (self.bytes[offset] as u16) << 8 | self.bytes[offset + 1] as u16
    }

    pub fn constant(&self, index: u8) -> &Value {
        &self.constants[index as usize]
    }

    pub fn token_at(&self, offset: usize) -> Option<&Rc<Token>> {
        self.tokens.get(offset).and_then(|t| t.as_ref())
    }

    pub fn emit_op(&mut self, op: OpCode, token: Option<Rc<Token>>) -> usize {
        let offset = self.bytes.len();
        self.bytes.push(op.into());
        self.tokens.push(token);
        offset
    }

    pub fn emit_byte(&mut self, byte: u8) {
        self.bytes.push(byte);
        self.tokens.push(None);
    }

    pub fn emit_u16(&mut self, value: u16) {
        self.emit_byte((value >> 8) as u8);
        self.emit_byte(value as u8);
    }

    /// Adds a constant, returning its pool index. Fails when the pool would
    /// exceed the single-byte index space.
    pub fn add_constant(&mut self, value: Value) -> Result<u8, ()> {
        if let Value::Object(obj) = &value {
            if let crate::value::Object::String(s) = obj.as_ref() {
                for (i, existing) in self.constants.iter().enumerate() {
                    if let Value::Object(o) = existing {
                        if let crate::value::Object::String(existing_s) = o.as_ref() {
                            if existing_s.as_ref() == s.as_ref() {
                                return u8::try_from(i).map_err(|_| ());
                            }
                        }
                    }
                }
            }
        }
        let index = self.constants.len();
        u8::try_from(index).map_err(|_| ())?;
        self.constants.push(value);
        Ok(index as u8)
    }

    pub fn emit_constant(&mut self, value: Value, token: Option<Rc<Token>>) -> Result<u8, ()> {
        let index = self.add_constant(value)?;
        self.emit_op(OpCode::Constant, token);
        self.emit_byte(index);
        Ok(index)
    }

    /// Emits a jump with a placeholder 16-bit operand and returns the
    /// offset of the first operand byte, to be passed to `patch_jump`.
    pub fn emit_jump(&mut self, op: OpCode, token: Option<Rc<Token>>) -> usize {
        self.emit_op(op, token);
        let at = self.bytes.len();
        self.emit_u16(0xFFFF);
        at
    }

    /// Back-patches the jump at `operand_offset` to land at the current
    /// end of the chunk.
    pub fn patch_jump(&mut self, operand_offset: usize) -> Result<(), ()> {
        let distance = self.bytes.len() - (operand_offset + 2);
        let distance = u16::try_from(distance).map_err(|_| ())?;
        self.bytes[operand_offset] = (distance >> 8) as u8;
        self.bytes[operand_offset + 1] = distance as u8;
        Ok(())
    }

    /// Like `patch_jump`, but targets an arbitrary earlier-or-later offset
    /// instead of the current end of the chunk (used by `for`'s `continue`,
    /// which must land on the increment rather than fall through to it).
    pub fn patch_jump_to(&mut self, operand_offset: usize, target: usize) -> Result<(), ()> {
        let distance = target - (operand_offset + 2);
        let distance = u16::try_from(distance).map_err(|_| ())?;
        self.bytes[operand_offset] = (distance >> 8) as u8;
        self.bytes[operand_offset + 1] = distance as u8;
        Ok(())
    }

    pub fn emit_loop(&mut self, loop_start: usize, token: Option<Rc<Token>>) -> Result<(), ()> {
        self.emit_op(OpCode::Loop, token);
        let distance = self.bytes.len() - loop_start + 2;
        let distance = u16::try_from(distance).map_err(|_| ())?;
        self.emit_u16(distance);
        Ok(())
    }

    #[cfg(feature = "debug-bytecode")]
    pub fn disassemble(&self, name: &str) -> String {
        let mut buffer = format!("== {} ==\n", name);
        let mut offset = 0;
        while offset < self.len() {
            offset = self.disassemble_at(&mut buffer, offset);
        }
        buffer
    }

    #[cfg(feature = "debug-bytecode")]
    fn disassemble_at(&self, buffer: &mut String, offset: usize) -> usize {
        use std::fmt::Write;
        let op = OpCode::try_from(self.bytes[offset]).expect("valid opcode");
        write!(buffer, "{:04} {:?}", offset, op).ok();
        match op {
            OpCode::Constant | OpCode::GetGlobal | OpCode::SetGlobal | OpCode::Class => {
                let idx = self.bytes[offset + 1];
                writeln!(buffer, " {} ({:?})", idx, self.constant(idx)).ok();
                offset + 2
            }
            OpCode::GetProperty | OpCode::SetProperty => {
                let idx = self.bytes[offset + 1];
                let accessor = self.bytes[offset + 2];
                writeln!(buffer, " {} {} ({:?})", idx, accessor, self.constant(idx)).ok();
                offset + 3
            }
            OpCode::GetLocal
            | OpCode::SetLocal
            | OpCode::GetUpvalue
            | OpCode::SetUpvalue
            | OpCode::Call
            | OpCode::Array
            | OpCode::Duplicate
            | OpCode::Method
            | OpCode::GetSuper => {
                writeln!(buffer, " {}", self.bytes[offset + 1]).ok();
                offset + 2
            }
            OpCode::Field => {
                writeln!(buffer, " {} {}", self.bytes[offset + 1], self.bytes[offset + 2]).ok();
                offset + 3
            }
            OpCode::Invoke | OpCode::SuperInvoke => {
                writeln!(
                    buffer,
                    " {} {} {}",
                    self.bytes[offset + 1],
                    self.bytes[offset + 2],
                    self.bytes[offset + 3]
                )
                .ok();
                offset + 4
            }
            OpCode::Jump | OpCode::JumpIfFalse | OpCode::Loop => {
                writeln!(buffer, " -> {}", self.read_u16(offset + 1)).ok();
                offset + 3
            }
            OpCode::Closure => {
                let const_idx = self.bytes[offset + 1];
                let upvalue_count = self.bytes[offset + 2];
                writeln!(buffer, " {} ({:?})", const_idx, self.constant(const_idx)).ok();
                let mut o = offset + 3;
                for _ in 0..upvalue_count {
                    let is_local = self.bytes[o] != 0;
                    let idx = self.bytes[o + 1];
                    writeln!(buffer, "      | {} {}", is_local, idx).ok();
                    o += 2;
                }
                o
            }
            _ => {
                writeln!(buffer).ok();
                offset + 1
            }
        }
    }
}

#[cfg(feature = "debug-bytecode")]
impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.disassemble("chunk"))
    }
}

#[cfg(not(feature = "debug-bytecode"))]
impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "<chunk: {} bytes>", self.bytes.len())
    }
}
