pub mod error;
mod natives;

pub use error::{BacktraceFrame, RuntimeError};

use compiler::{
    format_number, Access, BoundMethodObj, ClassObj, ClosureObj, FunctionObj, InstanceObj,
    NativeObj, Object, OpCode, UpvalueObj, Value,
};
use std::cell::RefCell;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::rc::Rc;

const FRAMES_MAX: usize = 256;

struct CallFrame {
    closure: Rc<ClosureObj>,
    ip: usize,
    base: usize,
    line: u32,
    file: Rc<str>,
}

/// The stack machine that executes a compiled `FunctionObj`. Frames are
/// tracked explicitly in `frames` rather than through native Rust call
/// recursion, so `FRAMES_MAX` is the only call-depth limit that exists.
pub struct Vm {
    frames: Vec<CallFrame>,
    stack: Vec<Value>,
    globals: HashMap<Rc<str>, Value>,
    open_upvalues: Vec<Rc<RefCell<UpvalueObj>>>,
    output: Option<Rc<RefCell<String>>>,
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    pub fn new() -> Self {
        let mut globals = HashMap::new();
        for native in natives::registry() {
            globals.insert(native.name.clone(), Value::Object(Rc::new(Object::Native(native))));
        }
        Self {
            frames: Vec::new(),
            stack: Vec::new(),
            globals,
            open_upvalues: Vec::new(),
            output: None,
        }
    }

    /// Like `new`, but `print` appends to `buffer` instead of going to
    /// stdout. Used by tests that need to assert on produced output.
    #[cfg(test)]
    fn with_capture(buffer: Rc<RefCell<String>>) -> Self {
        let mut vm = Self::new();
        vm.output = Some(buffer);
        vm
    }

    /// Runs one compiled unit to completion. On error the value stack, frame
    /// stack, and open-upvalue list are reset so the `Vm` is safe to reuse
    /// for the next REPL line; globals survive across calls.
    pub fn interpret(&mut self, function: Rc<FunctionObj>) -> Result<(), RuntimeError> {
        let closure = Rc::new(ClosureObj {
            function,
            upvalues: Vec::new(),
        });
        self.stack.push(Value::Object(Rc::new(Object::Closure(closure.clone()))));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: 0,
            line: 0,
            file: Rc::from(""),
        });
        let result = self.run();
        if result.is_err() {
            self.stack.clear();
            self.frames.clear();
            self.open_upvalues.clear();
        }
        result
    }

    // --- instruction stream -----------------------------------------------

    fn byte(&mut self) -> u8 {
        let fi = self.frames.len() - 1;
        let ip = self.frames[fi].ip;
        let b = self.frames[fi].closure.function.chunk.read_u8(ip);
        self.frames[fi].ip += 1;
        b
    }

    fn u16(&mut self) -> u16 {
        let fi = self.frames.len() - 1;
        let ip = self.frames[fi].ip;
        let v = self.frames[fi].closure.function.chunk.read_u16(ip);
        self.frames[fi].ip += 2;
        v
    }

    fn constant(&self, idx: u8) -> Value {
        self.frames.last().unwrap().closure.function.chunk.constant(idx).clone()
    }

    fn constant_str(&self, idx: u8) -> Rc<str> {
        match self.constant(idx) {
            Value::Object(o) => match o.as_ref() {
                Object::String(s) => s.clone(),
                _ => unreachable!("name constants are always strings"),
            },
            _ => unreachable!("name constants are always strings"),
        }
    }

    // --- errors -----------------------------------------------

    fn runtime_error(&self, message: impl Into<String>) -> RuntimeError {
        let message = message.into();
        let (line, file) = self
            .frames
            .last()
            .map(|f| (f.line, f.file.clone()))
            .unwrap_or((0, Rc::from("")));
        let backtrace = self
            .frames
            .iter()
            .rev()
            .map(|f| BacktraceFrame {
                name: f.closure.function.name.clone(),
                line: f.line,
                file: f.file.clone(),
            })
            .collect();
        RuntimeError::new(message, line, file, backtrace)
    }

    fn expect_instance(&self, v: &Value) -> Result<Rc<RefCell<InstanceObj>>, RuntimeError> {
        if let Value::Object(o) = v {
            if let Object::Instance(i) = o.as_ref() {
                return Ok(i.clone());
            }
        }
        Err(self.runtime_error(format!("Only instances have properties, got {}.", v.type_name())))
    }

    fn expect_class(&self, v: &Value) -> Result<Rc<RefCell<ClassObj>>, RuntimeError> {
        if let Value::Object(o) = v {
            if let Object::Class(c) = o.as_ref() {
                return Ok(c.clone());
            }
        }
        Err(self.runtime_error(format!("Expected a class, got {}.", v.type_name())))
    }

    fn expect_closure(&self, v: &Value) -> Result<Rc<ClosureObj>, RuntimeError> {
        if let Value::Object(o) = v {
            if let Object::Closure(c) = o.as_ref() {
                return Ok(c.clone());
            }
        }
        Err(self.runtime_error(format!("Expected a function, got {}.", v.type_name())))
    }

    fn expect_list(&self, v: &Value) -> Result<Rc<RefCell<Vec<Value>>>, RuntimeError> {
        v.as_list()
            .cloned()
            .ok_or_else(|| self.runtime_error(format!("Expected a list, got {}.", v.type_name())))
    }

    fn expect_index(&self, v: &Value, len: usize) -> Result<usize, RuntimeError> {
        let n = v
            .as_number()
            .filter(|n| n.fract() == 0.0 && *n >= 0.0)
            .ok_or_else(|| self.runtime_error("List index must be a non-negative integer."))?;
        let idx = n as usize;
        if idx >= len {
            return Err(self.runtime_error("List index out of bounds."));
        }
        Ok(idx)
    }

    /// `PRIVATE` requires the accessing class to be the declaring class
    /// exactly; `PROTECTED` additionally allows any class reachable by
    /// walking the declaring class's own ancestor chain, which covers both
    /// "a subclass accessing its own inherited field" and "a base-class
    /// method accessing the field on a subclass instance".
    fn check_access(&self, class: &Rc<RefCell<ClassObj>>, access: Access, accessor: &str) -> bool {
        match access {
            Access::Public => true,
            Access::Private => class.borrow().name.as_ref() == accessor,
            Access::Protected => {
                let mut current = Some(class.clone());
                while let Some(c) = current {
                    let (is_match, parent) = {
                        let b = c.borrow();
                        (b.name.as_ref() == accessor, b.superclass.clone())
                    };
                    if is_match {
                        return true;
                    }
                    current = parent;
                }
                false
            }
        }
    }

    // --- upvalues -----------------------------------------------

    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<UpvalueObj>> {
        for uv in &self.open_upvalues {
            if let UpvalueObj::Open(s) = &*uv.borrow() {
                if *s == slot {
                    return uv.clone();
                }
            }
        }
        let uv = Rc::new(RefCell::new(UpvalueObj::Open(slot)));
        let pos = self
            .open_upvalues
            .iter()
            .position(|existing| match &*existing.borrow() {
                UpvalueObj::Open(s) => *s < slot,
                UpvalueObj::Closed(_) => false,
            })
            .unwrap_or(self.open_upvalues.len());
        self.open_upvalues.insert(pos, uv.clone());
        uv
    }

    fn close_upvalues(&mut self, from: usize) {
        let mut i = 0;
        while i < self.open_upvalues.len() {
            let slot = match &*self.open_upvalues[i].borrow() {
                UpvalueObj::Open(s) => Some(*s),
                UpvalueObj::Closed(_) => None,
            };
            match slot {
                Some(s) if s >= from => {
                    let value = self.stack[s].clone();
                    *self.open_upvalues[i].borrow_mut() = UpvalueObj::Closed(value);
                    self.open_upvalues.remove(i);
                }
                _ => i += 1,
            }
        }
    }

    // --- calls -----------------------------------------------

    fn call_value(&mut self, base: usize, argc: u8) -> Result<(), RuntimeError> {
        let callee = self.stack[base].clone();
        match &callee {
            Value::Object(o) => match o.as_ref() {
                Object::Closure(c) => self.call_closure(c.clone(), base, argc),
                Object::Class(c) => self.call_class(c.clone(), base, argc),
                Object::BoundMethod(bm) => {
                    let receiver = bm.receiver.upgrade().ok_or_else(|| {
                        self.runtime_error("Bound method's receiver no longer exists.")
                    })?;
                    self.stack[base] = Value::Object(Rc::new(Object::Instance(receiver)));
                    self.call_closure(bm.method.clone(), base, argc)
                }
                Object::Native(n) => self.call_native(n.clone(), base, argc),
                _ => Err(self.runtime_error(format!(
                    "Can only call functions and classes, got {}.",
                    callee.type_name()
                ))),
            },
            _ => Err(self.runtime_error(format!(
                "Can only call functions and classes, got {}.",
                callee.type_name()
            ))),
        }
    }

    fn call_closure(&mut self, closure: Rc<ClosureObj>, base: usize, argc: u8) -> Result<(), RuntimeError> {
        if closure.function.arity != argc {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                closure.function.arity, argc
            )));
        }
        if self.frames.len() >= FRAMES_MAX {
            return Err(self.runtime_error("Stack overflow."));
        }
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
            line: 0,
            file: Rc::from(""),
        });
        Ok(())
    }

    fn call_class(&mut self, class: Rc<RefCell<ClassObj>>, base: usize, argc: u8) -> Result<(), RuntimeError> {
        let fields = class
            .borrow()
            .fields
            .keys()
            .map(|k| (k.clone(), Value::Null))
            .collect();
        let instance = Rc::new(RefCell::new(InstanceObj {
            class: class.clone(),
            fields,
        }));
        self.stack[base] = Value::Object(Rc::new(Object::Instance(instance)));
        let ctor = class.borrow().find_method("constructor");
        match ctor {
            Some(ctor) => self.call_closure(ctor, base, argc),
            None => {
                if argc != 0 {
                    return Err(self.runtime_error(format!("Expected 0 arguments but got {}.", argc)));
                }
                Ok(())
            }
        }
    }

    fn call_native(&mut self, native: Rc<NativeObj>, base: usize, argc: u8) -> Result<(), RuntimeError> {
        if native.arity != argc {
            return Err(self.runtime_error(format!(
                "Expected {} arguments but got {}.",
                native.arity, argc
            )));
        }
        let args: Vec<Value> = self.stack[base + 1..].to_vec();
        let result = (native.function)(&args).map_err(|e| self.runtime_error(e))?;
        self.stack.truncate(base);
        self.stack.push(result);
        Ok(())
    }

    fn invoke(&mut self, name: &str, accessor: &str, base: usize, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.stack[base].clone();
        let instance_rc = self.expect_instance(&receiver)?;
        let class_rc = instance_rc.borrow().class.clone();

        let field_value = instance_rc.borrow().fields.get(name).cloned();
        if let Some(value) = field_value {
            let access = class_rc.borrow().fields.get(name).copied().unwrap_or(Access::Public);
            if !self.check_access(&class_rc, access, accessor) {
                return Err(self.runtime_error(format!(
                    "Can't access private field '{}' from outside its class.",
                    name
                )));
            }
            self.stack[base] = value;
            return self.call_value(base, argc);
        }

        let method = class_rc.borrow().find_method(name);
        match method {
            Some(closure) => self.call_closure(closure, base, argc),
            None => Err(self.runtime_error(format!("Undefined property '{}'.", name))),
        }
    }

    // --- main loop -----------------------------------------------

    fn run(&mut self) -> Result<(), RuntimeError> {
        loop {
            let fi = self.frames.len() - 1;
            let op_offset = self.frames[fi].ip;
            let op_byte = self.byte();
            if let Some(tok) = self.frames[fi].closure.function.chunk.token_at(op_offset) {
                self.frames[fi].line = tok.line;
                self.frames[fi].file = tok.file.clone();
            }
            let op = OpCode::try_from(op_byte)
                .map_err(|_| self.runtime_error("Corrupt bytecode: unknown opcode."))?;

            #[cfg(feature = "debug-execution")]
            self.trace(op);

            match op {
                OpCode::Constant => {
                    let idx = self.byte();
                    let v = self.constant(idx);
                    self.stack.push(v);
                }
                OpCode::Null => self.stack.push(Value::Null),
                OpCode::True => self.stack.push(Value::Bool(true)),
                OpCode::False => self.stack.push(Value::Bool(false)),
                OpCode::Pop => {
                    self.stack.pop();
                }
                OpCode::GetLocal => {
                    let slot = self.byte();
                    let base = self.frames.last().unwrap().base;
                    let value = self.stack[base + slot as usize].clone();
                    self.stack.push(value);
                }
                OpCode::SetLocal => {
                    let slot = self.byte();
                    let base = self.frames.last().unwrap().base;
                    let value = self.stack.last().unwrap().clone();
                    self.stack[base + slot as usize] = value;
                }
                OpCode::GetGlobal => {
                    let idx = self.byte();
                    let name = self.constant_str(idx);
                    match self.globals.get(&name) {
                        Some(v) => {
                            let v = v.clone();
                            self.stack.push(v);
                        }
                        None => return Err(self.runtime_error(format!("Undefined variable '{}'.", name))),
                    }
                }
                OpCode::SetGlobal => {
                    let idx = self.byte();
                    let name = self.constant_str(idx);
                    let value = self.stack.last().unwrap().clone();
                    self.globals.insert(name, value);
                }
                OpCode::GetUpvalue => {
                    let idx = self.byte();
                    let uv = self.frames.last().unwrap().closure.upvalues[idx as usize].clone();
                    let value = match &*uv.borrow() {
                        UpvalueObj::Open(slot) => self.stack[*slot].clone(),
                        UpvalueObj::Closed(v) => v.clone(),
                    };
                    self.stack.push(value);
                }
                OpCode::SetUpvalue => {
                    let idx = self.byte();
                    let uv = self.frames.last().unwrap().closure.upvalues[idx as usize].clone();
                    let value = self.stack.last().unwrap().clone();
                    let open_slot = match &*uv.borrow() {
                        UpvalueObj::Open(slot) => Some(*slot),
                        UpvalueObj::Closed(_) => None,
                    };
                    match open_slot {
                        Some(slot) => self.stack[slot] = value,
                        None => *uv.borrow_mut() = UpvalueObj::Closed(value),
                    }
                }
                OpCode::GetProperty => {
                    let name_idx = self.byte();
                    let accessor_idx = self.byte();
                    let name = self.constant_str(name_idx);
                    let accessor = self.constant_str(accessor_idx);
                    let receiver = self.stack.pop().unwrap();
                    let instance_rc = self.expect_instance(&receiver)?;
                    let class_rc = instance_rc.borrow().class.clone();
                    let field_value = instance_rc.borrow().fields.get(name.as_ref()).cloned();
                    if let Some(value) = field_value {
                        let access = class_rc
                            .borrow()
                            .fields
                            .get(name.as_ref())
                            .copied()
                            .unwrap_or(Access::Public);
                        if !self.check_access(&class_rc, access, &accessor) {
                            return Err(self.runtime_error(format!(
                                "Can't access private field '{}' from outside its class.",
                                name
                            )));
                        }
                        self.stack.push(value);
                    } else if let Some(method) = class_rc.borrow().find_method(&name) {
                        let bound = BoundMethodObj {
                            receiver: Rc::downgrade(&instance_rc),
                            method,
                        };
                        self.stack.push(Value::Object(Rc::new(Object::BoundMethod(Rc::new(bound)))));
                    } else {
                        return Err(self.runtime_error(format!("Undefined property '{}'.", name)));
                    }
                }
                OpCode::SetProperty => {
                    let name_idx = self.byte();
                    let accessor_idx = self.byte();
                    let name = self.constant_str(name_idx);
                    let accessor = self.constant_str(accessor_idx);
                    let value = self.stack.pop().unwrap();
                    let receiver = self.stack.pop().unwrap();
                    let instance_rc = self.expect_instance(&receiver)?;
                    let class_rc = instance_rc.borrow().class.clone();
                    let access = class_rc
                        .borrow()
                        .fields
                        .get(name.as_ref())
                        .copied()
                        .unwrap_or(Access::Public);
                    if !self.check_access(&class_rc, access, &accessor) {
                        return Err(self.runtime_error(format!(
                            "Can't access private field '{}' from outside its class.",
                            name
                        )));
                    }
                    instance_rc.borrow_mut().fields.insert(name, value.clone());
                    self.stack.push(value);
                }
                OpCode::GetSuper => {
                    let name_idx = self.byte();
                    let name = self.constant_str(name_idx);
                    let superclass_value = self.stack.pop().unwrap();
                    let receiver = self.stack.pop().unwrap();
                    let superclass_rc = self.expect_class(&superclass_value)?;
                    let instance_rc = self.expect_instance(&receiver)?;
                    let method = superclass_rc
                        .borrow()
                        .find_method(&name)
                        .ok_or_else(|| self.runtime_error(format!("Undefined property '{}'.", name)))?;
                    let bound = BoundMethodObj {
                        receiver: Rc::downgrade(&instance_rc),
                        method,
                    };
                    self.stack.push(Value::Object(Rc::new(Object::BoundMethod(Rc::new(bound)))));
                }
                OpCode::Equal => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    self.stack.push(Value::Bool(a == b));
                }
                OpCode::Greater => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    let r = value_gt(&a, &b).map_err(|e| self.runtime_error(e))?;
                    self.stack.push(Value::Bool(r));
                }
                OpCode::Less => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    let r = value_lt(&a, &b).map_err(|e| self.runtime_error(e))?;
                    self.stack.push(Value::Bool(r));
                }
                OpCode::Add => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    let r = value_add(a, b).map_err(|e| self.runtime_error(e))?;
                    self.stack.push(r);
                }
                OpCode::Subtract => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    let r = value_sub(a, b).map_err(|e| self.runtime_error(e))?;
                    self.stack.push(r);
                }
                OpCode::Multiply => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    let r = value_mul(a, b).map_err(|e| self.runtime_error(e))?;
                    self.stack.push(r);
                }
                OpCode::Divide => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    let r = value_div(a, b).map_err(|e| self.runtime_error(e))?;
                    self.stack.push(r);
                }
                OpCode::Modulo => {
                    let b = self.stack.pop().unwrap();
                    let a = self.stack.pop().unwrap();
                    let r = value_mod(a, b).map_err(|e| self.runtime_error(e))?;
                    self.stack.push(r);
                }
                OpCode::Not => {
                    let a = self.stack.pop().unwrap();
                    self.stack.push(Value::Bool(!a.truthy()));
                }
                OpCode::Negate => {
                    let a = self.stack.pop().unwrap();
                    match a {
                        Value::Number(n) => self.stack.push(Value::Number(-n)),
                        _ => {
                            return Err(self
                                .runtime_error(format!("Operand must be a number, got {}.", a.type_name())))
                        }
                    }
                }
                OpCode::Print => {
                    let value = self.stack.pop().unwrap();
                    match &self.output {
                        Some(buf) => buf.borrow_mut().push_str(&format!("{}\n", value)),
                        None => println!("{}", value),
                    }
                }
                OpCode::Jump => {
                    let offset = self.u16();
                    let fi = self.frames.len() - 1;
                    self.frames[fi].ip += offset as usize;
                }
                OpCode::JumpIfFalse => {
                    let offset = self.u16();
                    let falsy = !self.stack.last().unwrap().truthy();
                    if falsy {
                        let fi = self.frames.len() - 1;
                        self.frames[fi].ip += offset as usize;
                    }
                }
                OpCode::Loop => {
                    let offset = self.u16();
                    let fi = self.frames.len() - 1;
                    self.frames[fi].ip -= offset as usize;
                }
                OpCode::Call => {
                    let argc = self.byte();
                    let base = self.stack.len() - argc as usize - 1;
                    self.call_value(base, argc)?;
                }
                OpCode::Invoke => {
                    let name_idx = self.byte();
                    let argc = self.byte();
                    let accessor_idx = self.byte();
                    let name = self.constant_str(name_idx);
                    let accessor = self.constant_str(accessor_idx);
                    let base = self.stack.len() - argc as usize - 1;
                    self.invoke(&name, &accessor, base, argc)?;
                }
                OpCode::SuperInvoke => {
                    let name_idx = self.byte();
                    let argc = self.byte();
                    let _accessor_idx = self.byte(); // methods carry no access modifier; kept for layout symmetry with INVOKE
                    let name = self.constant_str(name_idx);
                    let superclass_value = self.stack.pop().unwrap();
                    let superclass_rc = self.expect_class(&superclass_value)?;
                    let base = self.stack.len() - argc as usize - 1;
                    let method = superclass_rc
                        .borrow()
                        .find_method(&name)
                        .ok_or_else(|| self.runtime_error(format!("Undefined property '{}'.", name)))?;
                    self.call_closure(method, base, argc)?;
                }
                OpCode::Closure => {
                    let const_idx = self.byte();
                    let function = match self.constant(const_idx) {
                        Value::Object(o) => match o.as_ref() {
                            Object::Function(f) => f.clone(),
                            _ => unreachable!("CLOSURE constant is always a Function"),
                        },
                        _ => unreachable!("CLOSURE constant is always a Function"),
                    };
                    let upvalue_count = self.byte();
                    let base = self.frames.last().unwrap().base;
                    let mut upvalues = Vec::with_capacity(upvalue_count as usize);
                    for _ in 0..upvalue_count {
                        let is_local = self.byte() != 0;
                        let idx = self.byte();
                        if is_local {
                            upvalues.push(self.capture_upvalue(base + idx as usize));
                        } else {
                            let uv = self.frames.last().unwrap().closure.upvalues[idx as usize].clone();
                            upvalues.push(uv);
                        }
                    }
                    self.stack
                        .push(Value::Object(Rc::new(Object::Closure(Rc::new(ClosureObj {
                            function,
                            upvalues,
                        })))));
                }
                OpCode::CloseUpvalue => {
                    let slot = self.stack.len() - 1;
                    self.close_upvalues(slot);
                    self.stack.pop();
                }
                OpCode::Return => {
                    let value = self.stack.pop().unwrap();
                    let base = self.frames.last().unwrap().base;
                    self.close_upvalues(base);
                    self.stack.truncate(base);
                    self.frames.pop();
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.stack.push(value);
                }
                OpCode::Class => {
                    let idx = self.byte();
                    let name = self.constant_str(idx);
                    self.stack
                        .push(Value::Object(Rc::new(Object::Class(Rc::new(RefCell::new(
                            ClassObj::new(name),
                        ))))));
                }
                OpCode::Inherit => {
                    let child_value = self.stack.pop().unwrap();
                    let child_rc = self.expect_class(&child_value)?;
                    let parent_value = self.stack.last().unwrap().clone();
                    let parent_rc = match self.expect_class(&parent_value) {
                        Ok(rc) => rc,
                        Err(_) => return Err(self.runtime_error("Superclass must be a class.")),
                    };
                    let (methods, fields) = {
                        let parent = parent_rc.borrow();
                        (parent.methods.clone(), parent.fields.clone())
                    };
                    {
                        let mut child = child_rc.borrow_mut();
                        for (name, closure) in methods {
                            child.methods.insert(name, closure);
                        }
                        for (name, access) in fields {
                            if access != Access::Private {
                                child.fields.insert(name, access);
                            }
                        }
                        child.superclass = Some(parent_rc.clone());
                    }
                }
                OpCode::Method => {
                    let idx = self.byte();
                    let name = self.constant_str(idx);
                    let closure_value = self.stack.pop().unwrap();
                    let closure_rc = self.expect_closure(&closure_value)?;
                    let class_value = self.stack.last().unwrap().clone();
                    let class_rc = self.expect_class(&class_value)?;
                    class_rc.borrow_mut().methods.insert(name, closure_rc);
                }
                OpCode::Field => {
                    let idx = self.byte();
                    let access_byte = self.byte();
                    let name = self.constant_str(idx);
                    let class_value = self.stack.last().unwrap().clone();
                    let class_rc = self.expect_class(&class_value)?;
                    class_rc
                        .borrow_mut()
                        .fields
                        .insert(name, Access::from_byte(access_byte));
                }
                OpCode::Array => {
                    let n = self.byte() as usize;
                    let len = self.stack.len();
                    let items = self.stack.split_off(len - n);
                    self.stack
                        .push(Value::Object(Rc::new(Object::List(Rc::new(RefCell::new(items))))));
                }
                OpCode::ArrayGet => {
                    let index_value = self.stack.pop().unwrap();
                    let list_value = self.stack.pop().unwrap();
                    let list_rc = self.expect_list(&list_value)?;
                    let idx = self.expect_index(&index_value, list_rc.borrow().len())?;
                    let value = list_rc.borrow()[idx].clone();
                    self.stack.push(value);
                }
                OpCode::ArraySet => {
                    let value = self.stack.pop().unwrap();
                    let index_value = self.stack.pop().unwrap();
                    let list_value = self.stack.pop().unwrap();
                    let list_rc = self.expect_list(&list_value)?;
                    let len = list_rc.borrow().len();
                    let idx = self.expect_index(&index_value, len)?;
                    list_rc.borrow_mut()[idx] = value.clone();
                    self.stack.push(value);
                }
                OpCode::Duplicate => {
                    let n = self.byte() as usize;
                    let len = self.stack.len();
                    for i in 0..n {
                        let v = self.stack[len - n + i].clone();
                        self.stack.push(v);
                    }
                }
            }
        }
    }

    #[cfg(feature = "debug-execution")]
    fn trace(&self, op: OpCode) {
        eprint!("          ");
        for v in &self.stack {
            eprint!("[ {} ]", v);
        }
        eprintln!();
        eprintln!("{:?}", op);
    }
}

fn value_add(a: Value, b: Value) -> Result<Value, String> {
    if let (Value::Number(x), Value::Number(y)) = (&a, &b) {
        return Ok(Value::Number(x + y));
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Ok(Value::string(format!("{}{}", x, y)));
    }
    if let (Some(x), Some(n)) = (a.as_str(), b.as_number()) {
        return Ok(Value::string(format!("{}{}", x, format_number(n))));
    }
    if let Some(list) = a.as_list() {
        let mut items = list.borrow().clone();
        items.push(b);
        return Ok(Value::Object(Rc::new(Object::List(Rc::new(RefCell::new(items))))));
    }
    Err(format!("Can't add {} and {}.", a.type_name(), b.type_name()))
}

fn value_sub(a: Value, b: Value) -> Result<Value, String> {
    if let (Value::Number(x), Value::Number(y)) = (&a, &b) {
        return Ok(Value::Number(x - y));
    }
    if let Some(list) = a.as_list() {
        let idx = b
            .as_number()
            .filter(|n| n.fract() == 0.0 && *n >= 0.0)
            .ok_or_else(|| "List index must be a non-negative integer.".to_string())?;
        let idx = idx as usize;
        let mut items = list.borrow().clone();
        if idx >= items.len() {
            return Err("List index out of bounds.".to_string());
        }
        items.remove(idx);
        return Ok(Value::Object(Rc::new(Object::List(Rc::new(RefCell::new(items))))));
    }
    Err(format!("Can't subtract {} from {}.", b.type_name(), a.type_name()))
}

fn value_mul(a: Value, b: Value) -> Result<Value, String> {
    if let (Value::Number(x), Value::Number(y)) = (&a, &b) {
        return Ok(Value::Number(x * y));
    }
    if let Some(list) = a.as_list() {
        let n = b
            .as_number()
            .filter(|n| n.fract() == 0.0 && *n >= 0.0)
            .ok_or_else(|| "List repeat count must be a non-negative integer.".to_string())?;
        let n = n as usize;
        let base = list.borrow().clone();
        let mut out = Vec::with_capacity(base.len() * n);
        for _ in 0..n {
            out.extend(base.iter().cloned());
        }
        return Ok(Value::Object(Rc::new(Object::List(Rc::new(RefCell::new(out))))));
    }
    Err(format!("Can't multiply {} and {}.", a.type_name(), b.type_name()))
}

fn value_div(a: Value, b: Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x / y)),
        (a, b) => Err(format!("Can't divide {} by {}.", a.type_name(), b.type_name())),
    }
}

fn value_mod(a: Value, b: Value) -> Result<Value, String> {
    match (a, b) {
        (Value::Number(x), Value::Number(y)) => Ok(Value::Number(x % y)),
        (a, b) => Err(format!("Can't take the modulo of {} and {}.", a.type_name(), b.type_name())),
    }
}

fn value_gt(a: &Value, b: &Value) -> Result<bool, String> {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return Ok(x > y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Ok(x > y);
    }
    Err(format!("Can't compare {} and {}.", a.type_name(), b.type_name()))
}

fn value_lt(a: &Value, b: &Value) -> Result<bool, String> {
    if let (Value::Number(x), Value::Number(y)) = (a, b) {
        return Ok(x < y);
    }
    if let (Some(x), Some(y)) = (a.as_str(), b.as_str()) {
        return Ok(x < y);
    }
    Err(format!("Can't compare {} and {}.", a.type_name(), b.type_name()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use compiler::compile;

    fn run_source(src: &str) -> Result<(), RuntimeError> {
        let function = compile(src, Rc::from("<test>")).expect("compiles");
        Vm::new().interpret(function)
    }

    /// Runs `src` with `print` captured instead of going to stdout, returning
    /// the captured lines alongside the interpret result.
    fn run_source_capturing(src: &str) -> (Result<(), RuntimeError>, String) {
        let function = compile(src, Rc::from("<test>")).expect("compiles");
        let buffer = Rc::new(RefCell::new(String::new()));
        let result = Vm::with_capture(buffer.clone()).interpret(function);
        let output = buffer.borrow().clone();
        (result, output)
    }

    #[test]
    fn arithmetic_and_globals() {
        let (result, output) = run_source_capturing("x = 1 + 2 * 3; print(x);");
        assert!(result.is_ok());
        assert_eq!(output, "7\n");
    }

    #[test]
    fn undefined_global_read_is_runtime_error() {
        let err = run_source("print(undefinedThing);").unwrap_err();
        assert!(err.message.contains("Undefined variable"));
    }

    #[test]
    fn closures_capture_outer_locals() {
        let src = r#"
            function makeCounter() {
                count = 0;
                function increment() {
                    count += 1;
                    return count;
                }
                return increment;
            }
            counter = makeCounter();
            print(counter());
            print(counter());
        "#;
        let (result, output) = run_source_capturing(src);
        assert!(result.is_ok());
        assert_eq!(output, "1\n2\n");
    }

    #[test]
    fn private_field_is_inaccessible_outside_class() {
        let src = r#"
            class Box {
                private value;
                constructor() { this.value = 1; }
            }
            box = Box();
            print(box.value);
        "#;
        let err = run_source(src).unwrap_err();
        assert!(err.message.contains("private"));
    }

    #[test]
    fn list_add_and_index() {
        let (result, output) = run_source_capturing("xs = [1, 2, 3]; xs = xs + 4; print(xs[3]);");
        assert!(result.is_ok());
        assert_eq!(output, "4\n");
    }

    #[test]
    fn calling_with_wrong_arity_is_runtime_error() {
        let src = r#"
            function add(a, b) { return a + b; }
            add(1);
        "#;
        let err = run_source(src).unwrap_err();
        assert!(err.message.contains("Expected 2 arguments"));
    }
}
