use super::chunk::Instruction;
use super::natives::NATIVES;
use super::value::{
    BoundMethod, Class, Closure, Function, Instance, Interner, Native, Object, ReturnKind,
    UpValue, Value,
};
use colored::Colorize;
use std::{
    cell::RefCell,
    collections::HashMap,
    fmt,
    io::{self, Write},
    rc::Rc,
    time::Instant,
};

/// The per-invocation record: which closure runs, where in its chunk, and
/// where its slots start on the value stack. Slot `base` is the callee
/// (`this` for methods) and is not user-visible.
struct CallFrame {
    closure: Rc<Closure>,
    ip: usize,
    base: usize,
}

#[derive(Debug)]
pub struct RuntimeError {
    msg: String,
    trace: Vec<(Option<Rc<str>>, u32)>,
}

impl RuntimeError {
    pub fn message(&self) -> &str {
        &self.msg
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}{}", "runtime error: ".bright_red(), self.msg)?;
        for (name, line) in &self.trace {
            match name {
                Some(name) => write!(f, "\n[line {line}] in {name}()")?,
                None => write!(f, "\n[line {line}] in script")?,
            }
        }
        Ok(())
    }
}

pub struct Vm {
    stack: Vec<Value>,
    frames: Vec<CallFrame>,
    globals: HashMap<Rc<str>, Value>,
    /// Open upvalues ordered by descending stack slot; at most one per slot.
    open_upvalues: Vec<Rc<RefCell<UpValue>>>,
    strings: Interner,
    started_at: Instant,
    out: Box<dyn Write>,
}

impl Vm {
    pub fn new() -> Self {
        Self::with_output(Box::new(io::stdout()))
    }

    pub fn with_output(out: Box<dyn Write>) -> Self {
        let mut vm = Self {
            stack: vec![],
            frames: vec![],
            globals: HashMap::new(),
            open_upvalues: vec![],
            strings: Interner::new(),
            started_at: Instant::now(),
            out,
        };
        for (name, function) in NATIVES {
            let name_rc = vm.strings.intern(name);
            vm.globals
                .insert(name_rc, Value::Object(Object::Native(Rc::new(Native { name, function }))));
        }
        vm
    }

    /// Seconds since the VM was created; the `clock` native reads this.
    pub fn uptime(&self) -> f64 {
        self.started_at.elapsed().as_secs_f64()
    }

    pub fn intern(&mut self, s: &str) -> Rc<str> {
        self.strings.intern(s)
    }

    pub fn intern_owned(&mut self, s: String) -> Rc<str> {
        self.strings.intern_owned(s)
    }

    /// Wraps the compiled script in a closure, pushes it into slot 0, and
    /// runs it to completion. Both stacks are emptied on a runtime error.
    pub fn interpret(&mut self, function: Function) -> Result<(), RuntimeError> {
        let closure = Rc::new(Closure::new(Rc::new(function), vec![]));
        self.stack
            .push(Value::Object(Object::Closure(Rc::clone(&closure))));
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base: 0,
        });
        match self.run() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.stack.clear();
                self.frames.clear();
                self.open_upvalues.clear();
                Err(err)
            }
        }
    }

    //>> Frame and stack plumbing

    fn frame(&self) -> &CallFrame {
        self.frames.last().unwrap()
    }

    fn read_byte(&mut self) -> u8 {
        let frame = self.frames.last_mut().unwrap();
        let byte = frame.closure.function.chunk.byte(frame.ip);
        frame.ip += 1;
        byte
    }

    fn read_u16(&mut self) -> u16 {
        let frame = self.frames.last_mut().unwrap();
        let two_bytes = frame.closure.function.chunk.two_bytes(frame.ip);
        frame.ip += 2;
        two_bytes
    }

    fn read_constant(&mut self, long: bool) -> Value {
        let idx = if long {
            self.read_u16() as usize
        } else {
            self.read_byte() as usize
        };
        let frame = self.frame();
        frame.closure.function.chunk.constant(idx).clone()
    }

    fn read_string(&mut self) -> Rc<str> {
        match self.read_constant(false) {
            Value::Object(Object::String(s)) => s,
            _ => unreachable!(),
        }
    }

    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Value {
        self.stack.pop().unwrap()
    }

    fn peek(&self, distance: usize) -> &Value {
        &self.stack[self.stack.len() - 1 - distance]
    }

    fn error(&self, msg: String) -> RuntimeError {
        let trace = self
            .frames
            .iter()
            .rev()
            .map(|frame| {
                let function = &frame.closure.function;
                let line = function.chunk.line(frame.ip.saturating_sub(1));
                (function.name.clone(), line)
            })
            .collect();
        RuntimeError { msg, trace }
    }

    //<<

    //>> Upvalues

    /// Reuses the open upvalue for `slot` if one exists, otherwise inserts
    /// a fresh one keeping the list sorted by descending slot.
    fn capture_upvalue(&mut self, slot: usize) -> Rc<RefCell<UpValue>> {
        let mut insert_at = self.open_upvalues.len();
        for (idx, upvalue) in self.open_upvalues.iter().enumerate() {
            let existing = upvalue.borrow().slot();
            if existing == slot {
                return Rc::clone(upvalue);
            }
            if existing < slot {
                insert_at = idx;
                break;
            }
        }
        let upvalue = Rc::new(RefCell::new(UpValue::Open(slot)));
        self.open_upvalues.insert(insert_at, Rc::clone(&upvalue));
        upvalue
    }

    /// Closes every open upvalue at or above `from`: the prefix of the
    /// descending list. Each captured value moves into its upvalue.
    fn close_upvalues(&mut self, from: usize) {
        while let Some(first) = self.open_upvalues.first() {
            let slot = first.borrow().slot();
            if slot < from {
                break;
            }
            let upvalue = self.open_upvalues.remove(0);
            let value = self.stack[slot].clone();
            upvalue.borrow_mut().close(value);
        }
    }

    //<<

    //>> Calls

    fn call_closure(&mut self, closure: Rc<Closure>, argc: u8) -> Result<(), RuntimeError> {
        let arity = closure.function.arity;
        if argc != arity {
            return Err(self.error(format!("Expected {arity} arguments but got {argc}.")));
        }
        let base = self.stack.len() - argc as usize - 1;
        self.frames.push(CallFrame {
            closure,
            ip: 0,
            base,
        });
        Ok(())
    }

    fn call_value(&mut self, callee: Value, argc: u8) -> Result<(), RuntimeError> {
        match callee {
            Value::Object(Object::Closure(closure)) => self.call_closure(closure, argc),
            Value::Object(Object::Class(class)) => {
                let slot = self.stack.len() - argc as usize - 1;
                let instance = Rc::new(Instance::new(Rc::clone(&class)));
                self.stack[slot] = Value::Object(Object::Instance(instance));
                if let Some(init) = class.method("init") {
                    self.call_closure(init, argc)
                } else if argc != 0 {
                    Err(self.error(format!("Expected 0 arguments but got {argc}.")))
                } else {
                    Ok(())
                }
            }
            Value::Object(Object::BoundMethod(bound)) => {
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = bound.receiver.clone();
                self.call_closure(Rc::clone(&bound.method), argc)
            }
            Value::Object(Object::Native(native)) => {
                let base = self.stack.len() - argc as usize;
                let args: Vec<Value> = self.stack[base..].to_vec();
                let result =
                    (native.function)(self, &args).map_err(|msg| self.error(msg))?;
                self.stack.truncate(base - 1);
                self.push(result);
                Ok(())
            }
            _ => Err(self.error("Can only call functions and classes.".to_string())),
        }
    }

    fn invoke_from_class(
        &mut self,
        class: &Rc<Class>,
        name: &Rc<str>,
        argc: u8,
    ) -> Result<(), RuntimeError> {
        match class.method(name) {
            Some(method) => self.call_closure(method, argc),
            None => Err(self.error(format!("Undefined property '{name}'."))),
        }
    }

    /// Fused property read + call. A field shadows a method and replaces
    /// the receiver before dispatch, so a stored function is called without
    /// an implicit `this`.
    fn invoke(&mut self, name: &Rc<str>, argc: u8) -> Result<(), RuntimeError> {
        let receiver = self.peek(argc as usize).clone();
        match receiver {
            Value::Object(Object::Instance(instance)) => {
                let field = instance.fields.borrow().get(name.as_ref()).cloned();
                if let Some(field) = field {
                    let slot = self.stack.len() - argc as usize - 1;
                    self.stack[slot] = field.clone();
                    self.call_value(field, argc)
                } else {
                    self.invoke_from_class(&instance.class, name, argc)
                }
            }
            Value::Object(Object::Dict(entries)) => {
                let value = entries
                    .borrow()
                    .get(name.as_ref())
                    .cloned()
                    .unwrap_or(Value::Nil);
                let slot = self.stack.len() - argc as usize - 1;
                self.stack[slot] = value.clone();
                self.call_value(value, argc)
            }
            _ => Err(self.error("Only instances and dicts have properties.".to_string())),
        }
    }

    //<<

    fn return_kind_error(&self, kind: ReturnKind, name: &Option<Rc<str>>) -> RuntimeError {
        let what = match kind {
            ReturnKind::Int => "return an integer",
            ReturnKind::Float => "return a number",
            ReturnKind::Str => "return a string",
            ReturnKind::Bool => "return a boolean",
            ReturnKind::Void => "not return a value",
            ReturnKind::None => unreachable!(),
        };
        match name {
            Some(name) => self.error(format!("Function '{name}' must {what}.")),
            None => self.error(format!("Function must {what}.")),
        }
    }

    fn run(&mut self) -> Result<(), RuntimeError> {
        macro_rules! binary_numbers {
            ($op:tt) => {{
                let b = self.pop();
                let a = self.pop();
                match (&a, &b) {
                    (Value::Number(a), Value::Number(b)) => self.push(Value::Number(a $op b)),
                    _ => return Err(self.error("Operands must be numbers.".to_string())),
                }
            }};
        }
        macro_rules! compare_numbers {
            ($op:tt) => {{
                let b = self.pop();
                let a = self.pop();
                match (&a, &b) {
                    (Value::Number(a), Value::Number(b)) => self.push(Value::Bool(a $op b)),
                    _ => return Err(self.error("Operands must be numbers.".to_string())),
                }
            }};
        }
        // operands truncate to 32-bit signed integers
        macro_rules! binary_bits {
            ($method:ident) => {{
                let b = self.pop();
                let a = self.pop();
                match (&a, &b) {
                    (Value::Number(a), Value::Number(b)) => {
                        let a = *a as i64 as i32;
                        let b = *b as i64 as i32;
                        self.push(Value::Number(a.$method(b as u32) as f64))
                    }
                    _ => return Err(self.error("Operands must be numbers.".to_string())),
                }
            }};
        }

        loop {
            if cfg!(feature = "debug-execution") {
                eprintln!("{:?} => {:?}", self.frame().ip, self.stack);
            }
            let instr = Instruction::from(self.read_byte());
            match instr {
                Instruction::CONSTANT => {
                    let value = self.read_constant(false);
                    self.push(value);
                }
                Instruction::CONSTANT_LONG => {
                    let value = self.read_constant(true);
                    self.push(value);
                }
                Instruction::NIL => self.push(Value::Nil),
                Instruction::TRUE => self.push(Value::Bool(true)),
                Instruction::FALSE => self.push(Value::Bool(false)),
                Instruction::POP => {
                    self.pop();
                }
                Instruction::GET_LOCAL => {
                    let slot = self.frame().base + self.read_byte() as usize;
                    self.push(self.stack[slot].clone());
                }
                Instruction::SET_LOCAL => {
                    let slot = self.frame().base + self.read_byte() as usize;
                    self.stack[slot] = self.peek(0).clone();
                }
                Instruction::GET_UPVALUE => {
                    let idx = self.read_byte() as usize;
                    let upvalue = self.frame().closure.upvalue(idx);
                    let value = match &*upvalue.borrow() {
                        UpValue::Open(slot) => self.stack[*slot].clone(),
                        UpValue::Closed(value) => value.clone(),
                    };
                    self.push(value);
                }
                Instruction::SET_UPVALUE => {
                    let idx = self.read_byte() as usize;
                    let upvalue = self.frame().closure.upvalue(idx);
                    let value = self.peek(0).clone();
                    let open_slot = match &*upvalue.borrow() {
                        UpValue::Open(slot) => Some(*slot),
                        UpValue::Closed(_) => None,
                    };
                    match open_slot {
                        Some(slot) => self.stack[slot] = value,
                        None => *upvalue.borrow_mut() = UpValue::Closed(value),
                    }
                }
                Instruction::DEFINE_GLOBAL => {
                    let name = self.read_string();
                    let value = self.pop();
                    self.globals.insert(name, value);
                }
                Instruction::GET_GLOBAL => {
                    let name = self.read_string();
                    match self.globals.get(name.as_ref()) {
                        Some(value) => {
                            let value = value.clone();
                            self.push(value);
                        }
                        None => {
                            return Err(self.error(format!("Undefined variable '{name}'.")));
                        }
                    }
                }
                Instruction::SET_GLOBAL => {
                    let name = self.read_string();
                    let value = self.peek(0).clone();
                    match self.globals.get_mut(name.as_ref()) {
                        Some(slot) => *slot = value,
                        None => {
                            return Err(self.error(format!("Undefined variable '{name}'.")));
                        }
                    }
                }
                Instruction::GET_PROPERTY => {
                    let name = self.read_string();
                    match self.peek(0).clone() {
                        Value::Object(Object::Instance(instance)) => {
                            let field = instance.fields.borrow().get(name.as_ref()).cloned();
                            if let Some(field) = field {
                                self.pop();
                                self.push(field);
                            } else if let Some(method) = instance.class.method(&name) {
                                let receiver = self.pop();
                                self.push(Value::Object(Object::BoundMethod(Rc::new(
                                    BoundMethod { receiver, method },
                                ))));
                            } else {
                                return Err(
                                    self.error(format!("Undefined property '{name}'."))
                                );
                            }
                        }
                        Value::Object(Object::Dict(entries)) => {
                            let value = entries
                                .borrow()
                                .get(name.as_ref())
                                .cloned()
                                .unwrap_or(Value::Nil);
                            self.pop();
                            self.push(value);
                        }
                        _ => {
                            return Err(self
                                .error("Only instances and dicts have properties.".to_string()));
                        }
                    }
                }
                Instruction::SET_PROPERTY => {
                    let name = self.read_string();
                    let value = self.pop();
                    let receiver = self.pop();
                    match receiver {
                        Value::Object(Object::Instance(instance)) => {
                            instance.fields.borrow_mut().insert(name, value.clone());
                        }
                        Value::Object(Object::Dict(entries)) => {
                            entries.borrow_mut().insert(name, value.clone());
                        }
                        _ => {
                            return Err(self
                                .error("Only instances and dicts have properties.".to_string()));
                        }
                    }
                    // the assignment is an expression; its value stays
                    self.push(value);
                }
                Instruction::GET_SUPER => {
                    let name = self.read_string();
                    let superclass = match self.pop() {
                        Value::Object(Object::Class(class)) => class,
                        _ => unreachable!(),
                    };
                    match superclass.method(&name) {
                        Some(method) => {
                            let receiver = self.pop();
                            self.push(Value::Object(Object::BoundMethod(Rc::new(BoundMethod {
                                receiver,
                                method,
                            }))));
                        }
                        None => {
                            return Err(self.error(format!("Undefined property '{name}'.")));
                        }
                    }
                }
                Instruction::EQUAL => {
                    let b = self.pop();
                    let a = self.pop();
                    self.push(Value::Bool(a == b));
                }
                Instruction::GREATER => compare_numbers!(>),
                Instruction::LESS => compare_numbers!(<),
                Instruction::ADD => {
                    let b = self.pop();
                    let a = self.pop();
                    match (&a, &b) {
                        (Value::Number(a), Value::Number(b)) => self.push(Value::Number(a + b)),
                        (
                            Value::Object(Object::String(a)),
                            Value::Object(Object::String(b)),
                        ) => {
                            let joined = self.intern_owned(format!("{a}{b}"));
                            self.push(Value::from(joined));
                        }
                        _ => {
                            return Err(self.error(
                                "Operands must be two numbers or two strings.".to_string(),
                            ));
                        }
                    }
                }
                Instruction::SUBTRACT => binary_numbers!(-),
                Instruction::MULTIPLY => binary_numbers!(*),
                Instruction::DIVIDE => binary_numbers!(/),
                Instruction::MODULO => {
                    let b = self.pop();
                    let a = self.pop();
                    match (&a, &b) {
                        (Value::Number(_), Value::Number(b)) if *b == 0.0 => {
                            return Err(self.error("Modulo by zero.".to_string()));
                        }
                        (Value::Number(a), Value::Number(b)) => self.push(Value::Number(a % b)),
                        _ => return Err(self.error("Operands must be numbers.".to_string())),
                    }
                }
                Instruction::BIT_AND => {
                    let b = self.pop();
                    let a = self.pop();
                    match (&a, &b) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.push(Value::Number(((*a as i64 as i32) & (*b as i64 as i32)) as f64))
                        }
                        _ => return Err(self.error("Operands must be numbers.".to_string())),
                    }
                }
                Instruction::BIT_OR => {
                    let b = self.pop();
                    let a = self.pop();
                    match (&a, &b) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.push(Value::Number(((*a as i64 as i32) | (*b as i64 as i32)) as f64))
                        }
                        _ => return Err(self.error("Operands must be numbers.".to_string())),
                    }
                }
                Instruction::BIT_XOR => {
                    let b = self.pop();
                    let a = self.pop();
                    match (&a, &b) {
                        (Value::Number(a), Value::Number(b)) => {
                            self.push(Value::Number(((*a as i64 as i32) ^ (*b as i64 as i32)) as f64))
                        }
                        _ => return Err(self.error("Operands must be numbers.".to_string())),
                    }
                }
                Instruction::BIT_LS => binary_bits!(wrapping_shl),
                Instruction::BIT_RS => binary_bits!(wrapping_shr),
                Instruction::BIT_NOT => {
                    let a = self.pop();
                    match &a {
                        Value::Number(a) => self.push(Value::Number(!(*a as i64 as i32) as f64)),
                        _ => return Err(self.error("Operand must be a number.".to_string())),
                    }
                }
                Instruction::NOT => {
                    let value = self.pop();
                    self.push(!value);
                }
                Instruction::NEGATE => {
                    let value = self.pop();
                    match &value {
                        Value::Number(_) => self.push(-value),
                        _ => return Err(self.error("Operand must be a number.".to_string())),
                    }
                }
                Instruction::OUT => {
                    let value = self.pop();
                    let _ = writeln!(self.out, "{value}");
                    let _ = self.out.flush();
                }
                Instruction::JUMP => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip += offset;
                }
                Instruction::JUMP_IF_FALSE => {
                    let offset = self.read_u16() as usize;
                    if !self.peek(0).is_truthy() {
                        self.frames.last_mut().unwrap().ip += offset;
                    }
                }
                Instruction::LOOP => {
                    let offset = self.read_u16() as usize;
                    self.frames.last_mut().unwrap().ip -= offset;
                }
                Instruction::CALL => {
                    let argc = self.read_byte();
                    let callee = self.peek(argc as usize).clone();
                    self.call_value(callee, argc)?;
                }
                Instruction::INVOKE => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    self.invoke(&name, argc)?;
                }
                Instruction::SUPER_INVOKE => {
                    let name = self.read_string();
                    let argc = self.read_byte();
                    let superclass = match self.pop() {
                        Value::Object(Object::Class(class)) => class,
                        _ => unreachable!(),
                    };
                    self.invoke_from_class(&superclass, &name, argc)?;
                }
                Instruction::CLOSURE => {
                    let function = match self.read_constant(false) {
                        Value::Object(Object::Function(function)) => function,
                        _ => unreachable!(),
                    };
                    let mut upvalues = Vec::with_capacity(function.upvalue_count as usize);
                    for _ in 0..function.upvalue_count {
                        let is_local = self.read_byte() != 0;
                        let index = self.read_byte() as usize;
                        if is_local {
                            let slot = self.frame().base + index;
                            upvalues.push(self.capture_upvalue(slot));
                        } else {
                            upvalues.push(self.frame().closure.upvalue(index));
                        }
                    }
                    self.push(Value::from(Closure::new(function, upvalues)));
                }
                Instruction::CLOSE_UPVALUE => {
                    self.close_upvalues(self.stack.len() - 1);
                    self.pop();
                }
                Instruction::RETURN => {
                    let result = self.pop();
                    let frame = self.frames.pop().unwrap();
                    self.close_upvalues(frame.base);
                    let kind = frame.closure.function.return_kind;
                    if !kind.accepts(&result) {
                        return Err(
                            self.return_kind_error(kind, &frame.closure.function.name)
                        );
                    }
                    self.stack.truncate(frame.base);
                    if self.frames.is_empty() {
                        return Ok(());
                    }
                    self.push(result);
                }
                Instruction::CLASS => {
                    let name = self.read_string();
                    self.push(Value::Object(Object::Class(Rc::new(Class::new(name)))));
                }
                Instruction::INHERIT => {
                    let subclass = match self.pop() {
                        Value::Object(Object::Class(class)) => class,
                        _ => unreachable!(),
                    };
                    match self.peek(0) {
                        Value::Object(Object::Class(superclass)) => {
                            let methods = superclass.methods.borrow();
                            subclass.methods.borrow_mut().extend(
                                methods.iter().map(|(k, v)| (Rc::clone(k), Rc::clone(v))),
                            );
                        }
                        _ => {
                            return Err(self.error("Superclass must be a class.".to_string()));
                        }
                    }
                }
                Instruction::METHOD => {
                    let name = self.read_string();
                    let method = match self.pop() {
                        Value::Object(Object::Closure(closure)) => closure,
                        _ => unreachable!(),
                    };
                    match self.peek(0) {
                        Value::Object(Object::Class(class)) => {
                            class.methods.borrow_mut().insert(name, method);
                        }
                        _ => unreachable!(),
                    }
                }
                Instruction::ARRAY => {
                    let count = self.read_byte() as usize;
                    let items = self.stack.split_off(self.stack.len() - count);
                    self.push(Value::array(items));
                }
                Instruction::DICT => {
                    let count = self.read_byte() as usize;
                    let mut entries = HashMap::with_capacity(count);
                    for _ in 0..count {
                        let value = self.pop();
                        let key = match self.pop() {
                            Value::Object(Object::String(key)) => key,
                            other => {
                                return Err(self.error(format!(
                                    "Dict key must be a string, not {}.",
                                    other.type_name()
                                )));
                            }
                        };
                        entries.insert(key, value);
                    }
                    self.push(Value::dict(entries));
                }
                Instruction::OBJECT_GET => {
                    let key = self.pop();
                    let receiver = self.pop();
                    match (&receiver, &key) {
                        (Value::Object(Object::Array(items)), Value::Number(n)) => {
                            if n.fract() != 0.0 || *n < 0.0 {
                                return Err(self.error(
                                    "Array index must be a non-negative integer.".to_string(),
                                ));
                            }
                            match items.borrow().get(*n as usize) {
                                Some(item) => {
                                    let item = item.clone();
                                    self.push(item);
                                }
                                None => {
                                    return Err(self.error(format!(
                                        "Index {} out of range for array of length {}.",
                                        n,
                                        items.borrow().len()
                                    )));
                                }
                            }
                        }
                        (Value::Object(Object::Dict(entries)), Value::Object(Object::String(key))) => {
                            let value = entries
                                .borrow()
                                .get(key.as_ref())
                                .cloned()
                                .unwrap_or(Value::Nil);
                            self.push(value);
                        }
                        (Value::Object(Object::Array(_)), _) => {
                            return Err(self
                                .error("Array index must be a non-negative integer.".to_string()));
                        }
                        (Value::Object(Object::Dict(_)), _) => {
                            return Err(self.error(format!(
                                "Dict key must be a string, not {}.",
                                key.type_name()
                            )));
                        }
                        _ => {
                            return Err(self.error("Can only index arrays and dicts.".to_string()));
                        }
                    }
                }
                Instruction::OBJECT_SET => {
                    let value = self.pop();
                    let key = self.pop();
                    let receiver = self.pop();
                    match (&receiver, &key) {
                        (Value::Object(Object::Array(items)), Value::Number(n)) => {
                            if n.fract() != 0.0 || *n < 0.0 {
                                return Err(self.error(
                                    "Array index must be a non-negative integer.".to_string(),
                                ));
                            }
                            let mut items = items.borrow_mut();
                            let len = items.len();
                            match items.get_mut(*n as usize) {
                                Some(slot) => *slot = value,
                                None => {
                                    return Err(self.error(format!(
                                        "Index {} out of range for array of length {}.",
                                        n, len
                                    )));
                                }
                            }
                        }
                        (Value::Object(Object::Dict(entries)), Value::Object(Object::String(key))) => {
                            entries.borrow_mut().insert(Rc::clone(key), value);
                        }
                        (Value::Object(Object::Array(_)), _) => {
                            return Err(self
                                .error("Array index must be a non-negative integer.".to_string()));
                        }
                        (Value::Object(Object::Dict(_)), _) => {
                            return Err(self.error(format!(
                                "Dict key must be a string, not {}.",
                                key.type_name()
                            )));
                        }
                        _ => {
                            return Err(self.error("Can only index arrays and dicts.".to_string()));
                        }
                    }
                    self.push(Value::Nil);
                }
                Instruction::UNKNOWN => unreachable!(),
            }
        }
    }
}

impl Default for Vm {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::Compiler;
    use crate::loader::{ModuleLoader, NoModules};

    /// An output sink the test keeps a handle on after the VM takes it.
    #[derive(Clone, Default)]
    struct SharedOut(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedOut {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn run_with(source: &str, loader: &dyn ModuleLoader) -> (String, Result<(), RuntimeError>) {
        let out = SharedOut::default();
        let mut vm = Vm::with_output(Box::new(out.clone()));
        let function = Compiler::new(source, loader).compile().expect("compiles");
        let result = vm.interpret(function);
        let printed = String::from_utf8(out.0.borrow().clone()).unwrap();
        (printed, result)
    }

    fn run(source: &str) -> String {
        let (printed, result) = run_with(source, &NoModules);
        result.expect("runs");
        printed
    }

    fn run_err(source: &str) -> String {
        let (_, result) = run_with(source, &NoModules);
        result.expect_err("fails at runtime").msg
    }

    #[test]
    fn arithmetic() {
        assert_eq!(run("out 1 + 2 * 3;"), "7\n");
        assert_eq!(run("out 7 % 3;"), "1\n");
        assert_eq!(run("out 10 - 2 / 4;"), "9.5\n");
        // division by zero is IEEE infinity, not an error
        assert_eq!(run("out 1 / 0;"), "inf\n");
    }

    #[test]
    fn bitwise_operators_truncate_to_i32() {
        assert_eq!(run("out 6 & 3;"), "2\n");
        assert_eq!(run("out 6 | 3;"), "7\n");
        assert_eq!(run("out 6 ^ 3;"), "5\n");
        assert_eq!(run("out 1 << 4;"), "16\n");
        assert_eq!(run("out 16 >> 2;"), "4\n");
        assert_eq!(run("out ~0;"), "-1\n");
        assert_eq!(run("out 3.7 & 3;"), "3\n");
    }

    #[test]
    fn zero_and_empty_string_are_truthy() {
        assert_eq!(run("if (0) out 1; else out 2;"), "1\n");
        assert_eq!(run("if (\"\") out 1; else out 2;"), "1\n");
        assert_eq!(run("if (nil) out 1; else out 2;"), "2\n");
        assert_eq!(run("out !false;"), "true\n");
    }

    #[test]
    fn strings_concatenate_and_compare_by_content() {
        assert_eq!(run("out \"foo\" + \"bar\";"), "foobar\n");
        assert_eq!(run("out \"a\" + \"b\" == \"ab\";"), "true\n");
        assert_eq!(run_err("out \"a\" + 1;"), "Operands must be two numbers or two strings.");
    }

    #[test]
    fn loops() {
        assert_eq!(run("var i = 0; while (i < 3) { out i; i = i + 1; }"), "0\n1\n2\n");
        assert_eq!(run("var i = 0; until (i == 2) { out i; i = i + 1; }"), "0\n1\n");
        assert_eq!(run("for (var i = 0; i < 3; i = i + 1) out i;"), "0\n1\n2\n");
    }

    #[test]
    fn closures_count_independently_of_the_stack() {
        let source = "\
            fn make(){ var x=0; fn inc(){ x=x+1; return x; } return inc; }\n\
            var f=make(); out f(); out f(); out f();";
        assert_eq!(run(source), "1\n2\n3\n");
    }

    #[test]
    fn two_closures_share_one_upvalue() {
        let source = "\
            var setter; var getter;\n\
            fn make() { var x = 1; fn s(v) { x = v; } fn g() { return x; } setter = s; getter = g; }\n\
            make(); setter(5); out getter();";
        assert_eq!(run(source), "5\n");
    }

    #[test]
    fn inheritance_copies_methods_and_super_dispatches_upward() {
        let source = "\
            class A{ greet(){ out \"A\"; } }\n\
            class B < A { greet(){ super.greet(); out \"B\"; } }\n\
            B().greet();";
        assert_eq!(run(source), "A\nB\n");

        // a method the subclass does not override is inherited by the copy
        let source = "\
            class A{ hello(){ out \"hi\"; } }\n\
            class B < A {}\n\
            B().hello();";
        assert_eq!(run(source), "hi\n");
    }

    #[test]
    fn initializers_return_the_instance_and_set_fields() {
        let source = "\
            class Point { init(x, y) { this.x = x; this.y = y; } sum() { return this.x + this.y; } }\n\
            var p = Point(3, 4);\n\
            out p.sum(); out p.x;";
        assert_eq!(run(source), "7\n3\n");
    }

    #[test]
    fn property_reads_bind_methods() {
        let source = "\
            class A { init() { this.v = 7; } get() { return this.v; } }\n\
            var m = A().get;\n\
            out m();";
        assert_eq!(run(source), "7\n");
    }

    #[test]
    fn a_callable_field_replaces_the_receiver_on_invoke() {
        let source = "\
            fn free() { return 9; }\n\
            class A { f() { return 1; } }\n\
            var a = A(); a.f = free;\n\
            out a.f();";
        assert_eq!(run(source), "9\n");
    }

    #[test]
    fn dict_scenario() {
        let source = "var d = {\"a\": 1, \"b\": 2}; remove(d,\"a\"); out length(d); out d.b;";
        assert_eq!(run(source), "1\n2\n");
    }

    #[test]
    fn dict_property_and_index_agree() {
        assert_eq!(run("var d = {}; d.k = 5; out d.k; out d[\"k\"];"), "5\n5\n");
        // a missing key reads as nil
        assert_eq!(run("var d = {}; out d.missing;"), "nil\n");
    }

    #[test]
    fn array_scenario() {
        let source = "var a=[10,20,30]; out head(a); out tail(a); out length(a); out a[0];";
        assert_eq!(run(source), "10\n30\n1\n20\n");
    }

    #[test]
    fn array_natives() {
        assert_eq!(
            run("var a=[2]; append(a, 3); prepend(a, 1); out a; out length(a);"),
            "[1, 2, 3]\n3\n"
        );
        assert_eq!(run("var a=[1,2,3]; out rest(a); out a;"), "[2, 3]\n[1, 2, 3]\n");
        assert_eq!(run_err("head([]);"), "Cannot take the head of an empty array.");
    }

    #[test]
    fn assignment_is_an_expression() {
        assert_eq!(run("var x; out x = 2;"), "2\n");
        assert_eq!(run("class A{} var a = A(); out a.x = 3;"), "3\n");
    }

    #[test]
    fn array_writes_in_place() {
        assert_eq!(run("var a = [1, 2]; a[1] = 9; out a;"), "[1, 9]\n");
    }

    #[test]
    fn runtime_error_taxonomy() {
        assert_eq!(run_err("out missing;"), "Undefined variable 'missing'.");
        assert_eq!(run_err("missing = 1;"), "Undefined variable 'missing'.");
        assert_eq!(run_err("out 1 < \"x\";"), "Operands must be numbers.");
        assert_eq!(run_err("out -\"x\";"), "Operand must be a number.");
        assert_eq!(run_err("out 1 % 0;"), "Modulo by zero.");
        assert_eq!(run_err("var x = 1; x();"), "Can only call functions and classes.");
        assert_eq!(run_err("fn f(a) {} f();"), "Expected 1 arguments but got 0.");
        assert_eq!(
            run_err("class A{} A(1);"),
            "Expected 0 arguments but got 1."
        );
        assert_eq!(
            run_err("var a = [1]; out a[2];"),
            "Index 2 out of range for array of length 1."
        );
        assert_eq!(
            run_err("class A{} var a = A(); out a.nope;"),
            "Undefined property 'nope'."
        );
    }

    #[test]
    fn return_kind_is_rechecked_at_runtime() {
        assert_eq!(
            run_err("fn f(x) @int { return x; } f(\"s\");"),
            "Function 'f' must return an integer."
        );
        assert_eq!(run("fn f(x) @int { return x; } out f(3);"), "3\n");
        assert_eq!(
            run_err("fn f(x) @bool { return x; } f(1);"),
            "Function 'f' must return a boolean."
        );
    }

    #[test]
    fn runtime_errors_carry_a_backtrace() {
        let (_, result) = run_with("fn inner() { out missing; }\nfn outer() { inner(); }\nouter();", &NoModules);
        let err = result.unwrap_err();
        let rendered = format!("{err}");
        assert!(rendered.contains("Undefined variable 'missing'."));
        assert!(rendered.contains("in inner()"));
        assert!(rendered.contains("in outer()"));
        assert!(rendered.contains("in script"));
    }

    #[test]
    fn imports_run_their_module_in_place() {
        struct MapLoader;

        impl ModuleLoader for MapLoader {
            fn load(&self, name: &str) -> Result<String, String> {
                match name {
                    "config" => Ok("var answer = 42; out \"loaded\";".to_string()),
                    _ => Err(format!("No module named '{name}'.")),
                }
            }
        }

        let (printed, result) = run_with("import config; out answer;", &MapLoader);
        result.expect("runs");
        assert_eq!(printed, "loaded\n42\n");
    }
}
