use super::value::{Object, Value};

use std::fmt;

fn combine(hi: u8, lo: u8) -> u16 {
    (hi as u16) << 8 | lo as u16
}

fn split(two_bytes: u16) -> (u8, u8) {
    ((two_bytes >> 8) as u8, two_bytes as u8)
}

macro_rules! byte_enum {
    ($(#[$meta:meta])* $vis:vis enum $name:ident {
        $($(#[$vmeta:meta])* $vname:ident $(= $val:expr)?,)*
    }) => {
        $(#[$meta])*
        $vis enum $name {
            $($(#[$vmeta])* $vname $(= $val)?,)*
        }

        impl std::convert::From<u8> for $name {
            fn from(v: u8) -> Self {
                match v {
                    $(x if x == $name::$vname as u8 => $name::$vname,)*
                    _ => $name::UNKNOWN,
                }
            }
        }
    }
}

byte_enum! {
    #[allow(non_camel_case_types)]
    #[derive(Debug, Clone, Copy, PartialEq)]
    pub enum Instruction {
        /// `CONSTANT <idx: u8>`
        ///
        /// Pushes `constants[idx]`.
        CONSTANT,
        /// `CONSTANT_LONG <idx: u16>`
        ///
        /// Pushes `constants[idx]`.
        CONSTANT_LONG,
        NIL,
        TRUE,
        FALSE,
        POP,
        /// `GET_LOCAL <slot: u8>`
        ///
        /// Pushes the frame slot.
        GET_LOCAL,
        /// `SET_LOCAL <slot: u8>`
        ///
        /// Writes TOS into the frame slot, TOS stays.
        SET_LOCAL,
        GET_UPVALUE,
        SET_UPVALUE,
        /// `DEFINE_GLOBAL <name: u8>`
        ///
        /// Installs TOS under the name constant, TOS is popped.
        DEFINE_GLOBAL,
        GET_GLOBAL,
        /// Errors when the name has not been defined yet.
        SET_GLOBAL,
        /// `GET_PROPERTY <name: u8>`
        ///
        /// Instance field, bound method, or dict entry.
        GET_PROPERTY,
        SET_PROPERTY,
        /// `GET_SUPER <name: u8>`
        ///
        /// Pops the superclass, binds its method to the receiver below it.
        GET_SUPER,
        EQUAL,
        GREATER,
        LESS,
        /// Numeric addition or string concatenation.
        ADD,
        SUBTRACT,
        MULTIPLY,
        DIVIDE,
        /// `fmod`; a zero divisor is a runtime error.
        MODULO,
        BIT_AND,
        BIT_OR,
        BIT_XOR,
        BIT_LS,
        BIT_RS,
        BIT_NOT,
        NOT,
        NEGATE,
        /// Prints the popped value followed by a newline.
        OUT,
        /// `JUMP <offset: u16>`
        ///
        /// Adds `offset` to the ip.
        JUMP,
        /// `JUMP_IF_FALSE <offset: u16>`
        ///
        /// Jumps when TOS is falsey. Does not pop; each arm pops explicitly.
        JUMP_IF_FALSE,
        /// `LOOP <offset: u16>`
        ///
        /// Subtracts `offset` from the ip.
        LOOP,
        /// `CALL <argc: u8>`
        CALL,
        /// `INVOKE <name: u8> <argc: u8>`
        ///
        /// Fused property read + call on the receiver below the arguments.
        INVOKE,
        /// `SUPER_INVOKE <name: u8> <argc: u8>`
        ///
        /// Pops the superclass and dispatches from its method table.
        SUPER_INVOKE,
        /// `CLOSURE <fn: u8> (<local: u8> <idx: u8>)*`
        ///
        /// The pair count is the function's upvalue count.
        CLOSURE,
        /// Closes the topmost stack slot and pops it.
        CLOSE_UPVALUE,
        RETURN,
        /// `CLASS <name: u8>`
        ///
        /// Pushes a new class with an empty method table.
        CLASS,
        /// Copies the superclass method table into the subclass, pops the subclass.
        INHERIT,
        /// `METHOD <name: u8>`
        ///
        /// Attaches TOS as a method on the class below it, pops the method.
        METHOD,
        /// `ARRAY <count: u8>`
        ARRAY,
        OBJECT_GET,
        OBJECT_SET,
        /// `DICT <pairs: u8>`
        ///
        /// Pops key/value pairs; every key must be a string.
        DICT,
        UNKNOWN,
    }
}

/// A bytecode buffer with its constant pool and a run-length encoded line
/// table. Owned by a `Function`.
#[derive(Clone, Default)]
pub struct Chunk {
    bytes: Vec<u8>,
    constants: Vec<Value>,
    lines: Vec<(u32, u32)>,
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

    pub fn code(&self) -> &[u8] {
        &self.bytes
    }

    pub fn byte(&self, offset: usize) -> u8 {
        self.bytes[offset]
    }

    pub fn two_bytes(&self, offset: usize) -> u16 {
        combine(self.bytes[offset], self.bytes[offset + 1])
    }

    pub fn constant(&self, idx: usize) -> &Value {
        &self.constants[idx]
    }

    pub fn constant_count(&self) -> usize {
        self.constants.len()
    }

    /// The source line an instruction at `offset` came from.
    pub fn line(&self, offset: usize) -> u32 {
        let mut run_end = 0;
        for (line, run) in &self.lines {
            run_end += *run as usize;
            if offset < run_end {
                return *line;
            }
        }
        self.lines.last().map(|(line, _)| *line).unwrap_or(0)
    }

    fn push_byte(&mut self, byte: u8, line: u32) {
        self.bytes.push(byte);
        match self.lines.last_mut() {
            Some((last, run)) if *last == line => *run += 1,
            _ => self.lines.push((line, 1)),
        }
    }

    pub fn write(&mut self, instr: Instruction, line: u32) {
        self.push_byte(instr as u8, line);
    }

    pub fn write_byte(&mut self, byte: u8, line: u32) {
        self.push_byte(byte, line);
    }

    fn write_two_bytes(&mut self, two_bytes: u16, line: u32) {
        let (hi, lo) = split(two_bytes);
        self.push_byte(hi, line);
        self.push_byte(lo, line);
    }

    /// Appends to the constant pool. Equal string constants share a slot so
    /// that re-occurring literals load the same interned value; nothing else
    /// is deduplicated.
    pub fn add_constant(&mut self, value: Value) -> usize {
        if let Value::Object(Object::String(s)) = &value {
            for (idx, constant) in self.constants.iter().enumerate() {
                if let Value::Object(Object::String(other)) = constant {
                    if other == s {
                        return idx;
                    }
                }
            }
        }
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Emits `CONSTANT <idx>` or `CONSTANT_LONG <idx>`; fails once the pool
    /// outgrows a 16-bit index.
    pub fn write_constant(&mut self, value: Value, line: u32) -> Result<usize, ()> {
        let idx = self.add_constant(value);
        if idx <= u8::MAX as usize {
            self.write(Instruction::CONSTANT, line);
            self.write_byte(idx as u8, line);
        } else if idx <= u16::MAX as usize {
            self.write(Instruction::CONSTANT_LONG, line);
            self.write_two_bytes(idx as u16, line);
        } else {
            return Err(());
        }
        Ok(idx)
    }

    /// Writes a forward jump with a placeholder offset and returns the index
    /// of the jump instruction for `patch_jump`.
    pub fn emit_jump(&mut self, instr: Instruction, line: u32) -> usize {
        let idx = self.len();
        self.write(instr, line);
        self.write_two_bytes(0, line);
        idx
    }

    /// Points the jump at `idx` to the current end of the chunk.
    pub fn patch_jump(&mut self, idx: usize) -> Result<(), ()> {
        // the ip sits just past the operand when the offset is applied
        let offset = self.len() - idx - 3;
        if offset > u16::MAX as usize {
            return Err(());
        }
        let (hi, lo) = split(offset as u16);
        self.bytes[idx + 1] = hi;
        self.bytes[idx + 2] = lo;
        Ok(())
    }

    /// Writes a backward jump to `start`.
    pub fn emit_loop(&mut self, start: usize, line: u32) -> Result<(), ()> {
        self.write(Instruction::LOOP, line);
        let offset = self.len() + 2 - start;
        if offset > u16::MAX as usize {
            return Err(());
        }
        self.write_two_bytes(offset as u16, line);
        Ok(())
    }
}

#[cfg(not(feature = "debug-bytecode"))]
impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Chunk {{ .. }}")
    }
}

#[cfg(feature = "debug-bytecode")]
impl fmt::Debug for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Instruction::*;
        let mut ip = 0;
        let mut cur_line = 0;
        while ip < self.len() {
            let instr = Instruction::from(self.bytes[ip]);
            let line = self.line(ip);
            if line != cur_line {
                write!(f, "{line:>4} | ")?;
                cur_line = line;
            } else {
                write!(f, "     | ")?;
            }
            write!(f, "{ip:<05} {:16}", format!("{instr:?}"))?;
            match instr {
                NIL | TRUE | FALSE | POP | EQUAL | GREATER | LESS | ADD | SUBTRACT | MULTIPLY
                | DIVIDE | MODULO | BIT_AND | BIT_OR | BIT_XOR | BIT_LS | BIT_RS | BIT_NOT
                | NOT | NEGATE | OUT | CLOSE_UPVALUE | RETURN | INHERIT | OBJECT_GET
                | OBJECT_SET => {
                    writeln!(f)?;
                    ip += 1;
                }
                GET_LOCAL | SET_LOCAL | GET_UPVALUE | SET_UPVALUE | CALL | ARRAY | DICT => {
                    writeln!(f, " {}", self.bytes[ip + 1])?;
                    ip += 2;
                }
                CONSTANT | DEFINE_GLOBAL | GET_GLOBAL | SET_GLOBAL | GET_PROPERTY
                | SET_PROPERTY | GET_SUPER | CLASS | METHOD => {
                    let idx = self.bytes[ip + 1] as usize;
                    writeln!(f, " {idx} ({})", self.constant(idx))?;
                    ip += 2;
                }
                CONSTANT_LONG => {
                    let idx = self.two_bytes(ip + 1) as usize;
                    writeln!(f, " {idx} ({})", self.constant(idx))?;
                    ip += 3;
                }
                JUMP | JUMP_IF_FALSE => {
                    let offset = self.two_bytes(ip + 1) as usize;
                    writeln!(f, " {offset} (to {})", ip + 3 + offset)?;
                    ip += 3;
                }
                LOOP => {
                    let offset = self.two_bytes(ip + 1) as usize;
                    writeln!(f, " {offset} (to {})", ip + 3 - offset)?;
                    ip += 3;
                }
                INVOKE | SUPER_INVOKE => {
                    let idx = self.bytes[ip + 1] as usize;
                    let argc = self.bytes[ip + 2];
                    writeln!(f, " {idx} ({}) argc {argc}", self.constant(idx))?;
                    ip += 3;
                }
                CLOSURE => {
                    let idx = self.bytes[ip + 1] as usize;
                    writeln!(f, " {idx} ({})", self.constant(idx))?;
                    let upvaluec = match self.constant(idx) {
                        Value::Object(Object::Function(function)) => function.upvalue_count as usize,
                        _ => 0,
                    };
                    for pair in 0..upvaluec {
                        let local = self.bytes[ip + 2 + pair * 2] != 0;
                        let slot = self.bytes[ip + 3 + pair * 2];
                        writeln!(f, "     |       {pair}: local {local}, idx {slot}")?;
                    }
                    ip += 2 + upvaluec * 2;
                }
                UNKNOWN => unreachable!(),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn line_table_is_run_length_encoded() {
        let mut chunk = Chunk::new();
        chunk.write(Instruction::NIL, 1);
        chunk.write(Instruction::NIL, 1);
        chunk.write(Instruction::POP, 2);
        chunk.write(Instruction::POP, 2);
        chunk.write(Instruction::RETURN, 2);
        assert_eq!(chunk.lines, vec![(1, 2), (2, 3)]);
        assert_eq!(chunk.line(0), 1);
        assert_eq!(chunk.line(1), 1);
        assert_eq!(chunk.line(2), 2);
        assert_eq!(chunk.line(4), 2);
    }

    #[test]
    fn long_constants_use_a_two_byte_index() {
        let mut chunk = Chunk::new();
        for n in 0..=256 {
            chunk.write_constant(Value::Number(n as f64), 1).unwrap();
        }
        // the first 256 constants fit the short form
        assert_eq!(chunk.byte(0), Instruction::CONSTANT as u8);
        let tail = chunk.len() - 3;
        assert_eq!(chunk.byte(tail), Instruction::CONSTANT_LONG as u8);
        assert_eq!(chunk.two_bytes(tail + 1), 256);
    }

    #[test]
    fn equal_string_constants_share_a_pool_slot() {
        let mut chunk = Chunk::new();
        let a = chunk.add_constant(Value::string("greeting"));
        let b = chunk.add_constant(Value::string("greeting"));
        let c = chunk.add_constant(Value::string("other"));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn jumps_patch_to_the_current_end() {
        let mut chunk = Chunk::new();
        let jump = chunk.emit_jump(Instruction::JUMP_IF_FALSE, 1);
        chunk.write(Instruction::POP, 1);
        chunk.write(Instruction::NIL, 1);
        chunk.patch_jump(jump).unwrap();
        // the operand counts bytes between the end of the operand and the target
        assert_eq!(chunk.two_bytes(jump + 1), 2);
    }

    #[test]
    fn loops_jump_backward() {
        let mut chunk = Chunk::new();
        chunk.write(Instruction::NIL, 1);
        let start = chunk.len();
        chunk.write(Instruction::POP, 1);
        chunk.emit_loop(start, 1).unwrap();
        // ip after the LOOP operand minus the offset lands on `start`
        let after_operand = chunk.len();
        let offset = chunk.two_bytes(after_operand - 2) as usize;
        assert_eq!(after_operand - offset, start);
    }
}
