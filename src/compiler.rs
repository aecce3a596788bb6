use super::chunk::{Chunk, Instruction};
use super::loader::ModuleLoader;
use super::reporter::{Phase, Report};
use super::scanner::Scanner;
use super::token::{Token, TokenType, BOUNDARIES};
use super::value::{Function, Object, ReturnKind, Value};
use std::rc::Rc;

/// The precedence ladder, low to high. `parse_precedence` keeps consuming
/// infix operators while the next token's rule sits at or above the
/// requested level.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd)]
enum Precedence {
    None,
    Assignment,
    Or,
    And,
    Equality,
    Comparison,
    Term,
    Factor,
    Bitwise,
    Unary,
    Call,
    Primary,
}

impl Precedence {
    fn next(self) -> Self {
        match self {
            Self::None => Self::Assignment,
            Self::Assignment => Self::Or,
            Self::Or => Self::And,
            Self::And => Self::Equality,
            Self::Equality => Self::Comparison,
            Self::Comparison => Self::Term,
            Self::Term => Self::Factor,
            Self::Factor => Self::Bitwise,
            Self::Bitwise => Self::Unary,
            Self::Unary => Self::Call,
            Self::Call => Self::Primary,
            Self::Primary => unreachable!(),
        }
    }
}

type ParseFn = fn(&mut Compiler, bool);

#[derive(Clone, Copy)]
struct ParseRule {
    prefix: Option<ParseFn>,
    infix: Option<ParseFn>,
    precedence: Precedence,
}

macro_rules! rule {
    ($prefix:expr, $infix:expr, $precedence:expr) => {
        ParseRule {
            prefix: $prefix,
            infix: $infix,
            precedence: $precedence,
        }
    };
}

#[rustfmt::skip]
fn rule(typ: TokenType) -> ParseRule {
    use TokenType::*;
    match typ {
        OParen       => rule!(Some(grouping), Some(call),   Precedence::Call),
        OBracket     => rule!(Some(array),    Some(index),  Precedence::Call),
        OBrace       => rule!(Some(dict),     None,         Precedence::None),
        Period       => rule!(None,           Some(dot),    Precedence::Call),
        Minus        => rule!(Some(unary),    Some(binary), Precedence::Term),
        Plus         => rule!(None,           Some(binary), Precedence::Term),
        Percent      => rule!(None,           Some(binary), Precedence::Term),
        Slash        => rule!(None,           Some(binary), Precedence::Factor),
        Star         => rule!(None,           Some(binary), Precedence::Factor),
        Amp          => rule!(None,           Some(binary), Precedence::Bitwise),
        Pipe         => rule!(None,           Some(binary), Precedence::Bitwise),
        Caret        => rule!(None,           Some(binary), Precedence::Bitwise),
        Shl          => rule!(None,           Some(binary), Precedence::Bitwise),
        Shr          => rule!(None,           Some(binary), Precedence::Bitwise),
        Bang         => rule!(Some(unary),    None,         Precedence::None),
        Tilde        => rule!(Some(unary),    None,         Precedence::None),
        BangEqual    => rule!(None,           Some(binary), Precedence::Equality),
        DEqual       => rule!(None,           Some(binary), Precedence::Equality),
        Greater      => rule!(None,           Some(binary), Precedence::Comparison),
        GreaterEqual => rule!(None,           Some(binary), Precedence::Comparison),
        Less         => rule!(None,           Some(binary), Precedence::Comparison),
        LessEqual    => rule!(None,           Some(binary), Precedence::Comparison),
        Identifier   => rule!(Some(variable), None,         Precedence::None),
        String       => rule!(Some(string),   None,         Precedence::None),
        Number       => rule!(Some(number),   None,         Precedence::None),
        And          => rule!(None,           Some(and_),   Precedence::And),
        Or           => rule!(None,           Some(or_),    Precedence::Or),
        True         => rule!(Some(literal),  None,         Precedence::None),
        False        => rule!(Some(literal),  None,         Precedence::None),
        Nil          => rule!(Some(literal),  None,         Precedence::None),
        This         => rule!(Some(this_),    None,         Precedence::None),
        Super        => rule!(Some(super_),   None,         Precedence::None),
        _            => rule!(None,           None,         Precedence::None),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum FunctionKind {
    Script,
    Module,
    Function,
    Method,
    Initializer,
}

struct Local<'a> {
    name: &'a str,
    /// `-1` marks "declared but not yet initialized"; reading such a local
    /// is the self-reference-in-initializer error.
    depth: i32,
    captured: bool,
}

#[derive(Clone, Copy, PartialEq)]
struct CapturedUpvalue {
    is_local: bool,
    index: u8,
}

/// One function compilation frame. The compiler keeps a stack of these,
/// innermost last; `resolve_upvalue` walks outward through it.
struct FuncState<'a> {
    kind: FunctionKind,
    name: Option<Rc<str>>,
    arity: u8,
    return_kind: ReturnKind,
    chunk: Chunk,
    locals: Vec<Local<'a>>,
    upvalues: Vec<CapturedUpvalue>,
    scope_depth: u32,
    last_instr: Option<Instruction>,
}

impl<'a> FuncState<'a> {
    fn new(kind: FunctionKind, name: Option<Rc<str>>) -> Self {
        // slot 0 belongs to the callee: `this` inside methods, unnameable
        // otherwise
        let reserved = match kind {
            FunctionKind::Method | FunctionKind::Initializer => "this",
            _ => "",
        };
        Self {
            kind,
            name,
            arity: 0,
            return_kind: ReturnKind::None,
            chunk: Chunk::new(),
            locals: vec![Local {
                name: reserved,
                depth: 0,
                captured: false,
            }],
            upvalues: vec![],
            scope_depth: 0,
            last_instr: None,
        }
    }
}

struct ClassState {
    has_superclass: bool,
}

/// What the most recently emitted opcode pins the value on top of the
/// stack to, for the shallow return-kind check.
enum Probe {
    Nil,
    Bool,
    Number(Option<f64>),
    Str,
    Callable,
    Unknown,
}

pub struct Compiler<'a> {
    scanner: Scanner<'a>,
    current: Token<'a>,
    previous: Token<'a>,
    had_error: bool,
    panic_mode: bool,
    reports: Vec<Report>,
    states: Vec<FuncState<'a>>,
    classes: Vec<ClassState>,
    loader: &'a dyn ModuleLoader,
}

impl<'a> Compiler<'a> {
    pub fn new(source: &'a str, loader: &'a dyn ModuleLoader) -> Self {
        Self {
            scanner: Scanner::new(source),
            current: Token::empty(),
            previous: Token::empty(),
            had_error: false,
            panic_mode: false,
            reports: vec![],
            states: vec![],
            classes: vec![],
            loader,
        }
    }

    /// Compiles a whole source text into the top-level script function.
    pub fn compile(self) -> Result<Function, Vec<Report>> {
        self.compile_as(FunctionKind::Script, None)
    }

    /// Compiles an imported module; it differs from a script only in name.
    pub fn compile_module(self, name: &str) -> Result<Function, Vec<Report>> {
        self.compile_as(FunctionKind::Module, Some(Rc::from(name)))
    }

    fn compile_as(
        mut self,
        kind: FunctionKind,
        name: Option<Rc<str>>,
    ) -> Result<Function, Vec<Report>> {
        self.states.push(FuncState::new(kind, name));
        self.advance();
        while !self.match_token(TokenType::Eof) {
            self.declaration();
        }
        self.emit_return();
        let state = self.states.pop().unwrap();
        if self.had_error {
            Err(self.reports)
        } else {
            Ok(Function {
                name: state.name,
                arity: 0,
                upvalue_count: 0,
                return_kind: ReturnKind::None,
                chunk: state.chunk,
            })
        }
    }

    //>> Token plumbing

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.scan_token();
            if self.current.typ != TokenType::Error {
                break;
            }
            let msg = self.current.lexeme.to_string();
            let line = self.current.line;
            self.report(Report::new(Phase::Scanning, msg, line, None));
        }
    }

    fn consume(&mut self, typ: TokenType, msg: &str) {
        if self.current.typ == typ {
            self.advance();
        } else {
            self.error_at_current(msg);
        }
    }

    fn check(&self, typ: TokenType) -> bool {
        self.current.typ == typ
    }

    fn match_token(&mut self, typ: TokenType) -> bool {
        if self.check(typ) {
            self.advance();
            true
        } else {
            false
        }
    }

    fn error(&mut self, msg: &str) {
        self.error_at(self.previous, msg);
    }

    fn error_at_current(&mut self, msg: &str) {
        self.error_at(self.current, msg);
    }

    fn error_at(&mut self, token: Token, msg: &str) {
        let lexeme = if token.typ == TokenType::Eof {
            String::new()
        } else {
            token.lexeme.to_string()
        };
        self.report(Report::new(
            Phase::Compiling,
            msg.to_string(),
            token.line,
            Some(lexeme),
        ));
    }

    /// The first error is kept; panic mode swallows the cascade until
    /// `synchronize` finds a statement boundary.
    fn report(&mut self, report: Report) {
        self.had_error = true;
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.reports.push(report);
    }

    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.typ != TokenType::Eof {
            if self.previous.typ == TokenType::Semicolon {
                return;
            }
            if BOUNDARIES.contains(&self.current.typ) {
                return;
            }
            self.advance();
        }
    }

    //<<

    //>> Emission

    fn state(&self) -> &FuncState<'a> {
        self.states.last().unwrap()
    }

    fn state_mut(&mut self) -> &mut FuncState<'a> {
        self.states.last_mut().unwrap()
    }

    fn emit(&mut self, instr: Instruction) {
        let line = self.previous.line;
        let state = self.state_mut();
        state.chunk.write(instr, line);
        state.last_instr = Some(instr);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.state_mut().chunk.write_byte(byte, line);
    }

    fn emit_pair(&mut self, instr: Instruction, byte: u8) {
        self.emit(instr);
        self.emit_byte(byte);
    }

    fn emit_constant(&mut self, value: Value) {
        let line = self.previous.line;
        match self.state_mut().chunk.write_constant(value, line) {
            Ok(idx) => {
                self.state_mut().last_instr = Some(if idx <= u8::MAX as usize {
                    Instruction::CONSTANT
                } else {
                    Instruction::CONSTANT_LONG
                });
            }
            Err(()) => self.error("Too many constants in one chunk."),
        }
    }

    /// A constant whose index rides in a single operand byte (names,
    /// functions, classes).
    fn make_constant(&mut self, value: Value) -> u8 {
        let idx = self.state_mut().chunk.add_constant(value);
        if idx > u8::MAX as usize {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        idx as u8
    }

    fn identifier_constant(&mut self, token: Token) -> u8 {
        self.make_constant(Value::string(token.lexeme))
    }

    fn emit_jump(&mut self, instr: Instruction) -> usize {
        let line = self.previous.line;
        let state = self.state_mut();
        state.last_instr = Some(instr);
        state.chunk.emit_jump(instr, line)
    }

    fn patch_jump(&mut self, idx: usize) {
        if self.state_mut().chunk.patch_jump(idx).is_err() {
            self.error("Too much code to jump over.");
        }
    }

    fn emit_loop(&mut self, start: usize) {
        let line = self.previous.line;
        let state = self.state_mut();
        state.last_instr = Some(Instruction::LOOP);
        if state.chunk.emit_loop(start, line).is_err() {
            self.error("Loop body too large.");
        }
    }

    /// The implicit return: an initializer hands back its instance, every
    /// other function hands back nil.
    fn emit_return(&mut self) {
        if self.state().kind == FunctionKind::Initializer {
            self.emit_pair(Instruction::GET_LOCAL, 0);
        } else {
            self.emit(Instruction::NIL);
        }
        self.emit(Instruction::RETURN);
    }

    //<<

    //>> Variable resolution

    fn begin_scope(&mut self) {
        self.state_mut().scope_depth += 1;
    }

    /// Discards the scope's locals, closing over the captured ones.
    fn end_scope(&mut self) {
        self.state_mut().scope_depth -= 1;
        loop {
            let state = self.state();
            match state.locals.last() {
                Some(local) if local.depth > state.scope_depth as i32 => {
                    let captured = local.captured;
                    self.state_mut().locals.pop();
                    if captured {
                        self.emit(Instruction::CLOSE_UPVALUE);
                    } else {
                        self.emit(Instruction::POP);
                    }
                }
                _ => break,
            }
        }
    }

    fn add_local(&mut self, name: &'a str) {
        if self.state().locals.len() > u8::MAX as usize {
            self.error("Too many local variables in function.");
            return;
        }
        self.state_mut().locals.push(Local {
            name,
            depth: -1,
            captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.state().scope_depth == 0 {
            return;
        }
        let name = self.previous.lexeme;
        let state = self.state();
        let mut duplicate = false;
        for local in state.locals.iter().rev() {
            if local.depth != -1 && local.depth < state.scope_depth as i32 {
                break;
            }
            if local.name == name {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, msg: &str) -> u8 {
        self.consume(TokenType::Identifier, msg);
        self.declare_variable();
        if self.state().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous)
    }

    fn mark_initialized(&mut self) {
        let state = self.state_mut();
        if state.scope_depth == 0 {
            return;
        }
        let depth = state.scope_depth as i32;
        state.locals.last_mut().unwrap().depth = depth;
    }

    fn define_variable(&mut self, global: u8) {
        if self.state().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_pair(Instruction::DEFINE_GLOBAL, global);
    }

    fn resolve_local(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        let mut uninitialized = false;
        let mut found = None;
        for (idx, local) in self.states[state_idx].locals.iter().enumerate().rev() {
            if local.name == name {
                uninitialized = local.depth == -1;
                found = Some(idx as u8);
                break;
            }
        }
        if uninitialized {
            self.error("Cannot read local variable in its own initializer.");
        }
        found
    }

    /// Walks outward through the enclosing function frames; a hit in the
    /// immediate parent captures that local, anything further chains
    /// through the parent's own upvalues.
    fn resolve_upvalue(&mut self, state_idx: usize, name: &str) -> Option<u8> {
        if state_idx == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local(state_idx - 1, name) {
            self.states[state_idx - 1].locals[local as usize].captured = true;
            return Some(self.add_upvalue(state_idx, true, local));
        }
        if let Some(upvalue) = self.resolve_upvalue(state_idx - 1, name) {
            return Some(self.add_upvalue(state_idx, false, upvalue));
        }
        None
    }

    fn add_upvalue(&mut self, state_idx: usize, is_local: bool, index: u8) -> u8 {
        let captured = CapturedUpvalue { is_local, index };
        let upvalues = &mut self.states[state_idx].upvalues;
        if let Some(existing) = upvalues.iter().position(|up| *up == captured) {
            return existing as u8;
        }
        if upvalues.len() > u8::MAX as usize {
            self.error("Too many closure variables in function.");
            return 0;
        }
        upvalues.push(captured);
        (upvalues.len() - 1) as u8
    }

    fn named_variable(&mut self, token: Token<'a>, can_assign: bool) {
        let top = self.states.len() - 1;
        let (get_op, set_op, arg) = if let Some(slot) = self.resolve_local(top, token.lexeme) {
            (Instruction::GET_LOCAL, Instruction::SET_LOCAL, slot)
        } else if let Some(slot) = self.resolve_upvalue(top, token.lexeme) {
            (Instruction::GET_UPVALUE, Instruction::SET_UPVALUE, slot)
        } else {
            let idx = self.identifier_constant(token);
            (Instruction::GET_GLOBAL, Instruction::SET_GLOBAL, idx)
        };
        if can_assign && self.match_token(TokenType::Equal) {
            self.expression();
            self.emit_pair(set_op, arg);
        } else {
            self.emit_pair(get_op, arg);
        }
    }

    //<<

    //>> Expressions

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix = match rule(self.previous.typ).prefix {
            Some(prefix) => prefix,
            None => {
                self.error("Expect expression.");
                return;
            }
        };
        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= rule(self.current.typ).precedence {
            self.advance();
            let infix = rule(self.previous.typ)
                .infix
                .expect("token with a precedence has an infix rule");
            infix(self, can_assign);
        }

        if can_assign && self.match_token(TokenType::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn argument_list(&mut self) -> u8 {
        let mut argc: u32 = 0;
        if !self.check(TokenType::CParen) {
            loop {
                self.expression();
                if argc == 255 {
                    self.error("Cannot have more than 255 arguments.");
                }
                argc += 1;
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::CParen, "Expect ')' after arguments.");
        argc.min(255) as u8
    }

    //<<

    //>> Declarations and statements

    fn declaration(&mut self) {
        if self.match_token(TokenType::Class) {
            self.class_declaration();
        } else if self.match_token(TokenType::Fn) {
            self.fn_declaration();
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else if self.match_token(TokenType::Import) {
            self.import_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement(&mut self) {
        if self.match_token(TokenType::Out) {
            self.out_statement();
        } else if self.match_token(TokenType::If) {
            self.if_statement();
        } else if self.match_token(TokenType::While) {
            self.while_statement(false);
        } else if self.match_token(TokenType::Until) {
            self.while_statement(true);
        } else if self.match_token(TokenType::For) {
            self.for_statement();
        } else if self.match_token(TokenType::Return) {
            self.return_statement();
        } else if self.match_token(TokenType::OBrace) {
            self.begin_scope();
            self.block();
            self.end_scope();
        } else {
            self.expression_statement();
        }
    }

    fn block(&mut self) {
        while !self.check(TokenType::CBrace) && !self.check(TokenType::Eof) {
            self.declaration();
        }
        self.consume(TokenType::CBrace, "Expect '}' after block.");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after expression.");
        self.emit(Instruction::POP);
    }

    fn out_statement(&mut self) {
        self.expression();
        self.consume(TokenType::Semicolon, "Expect ';' after value.");
        self.emit(Instruction::OUT);
    }

    fn if_statement(&mut self) {
        self.consume(TokenType::OParen, "Expect '(' after 'if'.");
        self.expression();
        self.consume(TokenType::CParen, "Expect ')' after condition.");

        let then_jump = self.emit_jump(Instruction::JUMP_IF_FALSE);
        self.emit(Instruction::POP);
        self.statement();
        let else_jump = self.emit_jump(Instruction::JUMP);
        self.patch_jump(then_jump);
        self.emit(Instruction::POP);
        if self.match_token(TokenType::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    /// `while` and `until` differ by one `NOT` after the condition.
    fn while_statement(&mut self, negated: bool) {
        let loop_start = self.state().chunk.len();
        self.consume(TokenType::OParen, "Expect '(' after loop keyword.");
        self.expression();
        self.consume(TokenType::CParen, "Expect ')' after condition.");
        if negated {
            self.emit(Instruction::NOT);
        }

        let exit_jump = self.emit_jump(Instruction::JUMP_IF_FALSE);
        self.emit(Instruction::POP);
        self.statement();
        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);
        self.emit(Instruction::POP);
    }

    fn for_statement(&mut self) {
        self.begin_scope();
        self.consume(TokenType::OParen, "Expect '(' after 'for'.");
        if self.match_token(TokenType::Semicolon) {
            // no initializer
        } else if self.match_token(TokenType::Var) {
            self.var_declaration();
        } else {
            self.expression_statement();
        }

        let mut loop_start = self.state().chunk.len();
        let mut exit_jump = None;
        if !self.match_token(TokenType::Semicolon) {
            self.expression();
            self.consume(TokenType::Semicolon, "Expect ';' after loop condition.");
            exit_jump = Some(self.emit_jump(Instruction::JUMP_IF_FALSE));
            self.emit(Instruction::POP);
        }

        if !self.match_token(TokenType::CParen) {
            // the body runs before the increment: jump over it, loop back to
            // it, and let the increment loop back to the condition
            let body_jump = self.emit_jump(Instruction::JUMP);
            let increment_start = self.state().chunk.len();
            self.expression();
            self.emit(Instruction::POP);
            self.consume(TokenType::CParen, "Expect ')' after for clauses.");
            self.emit_loop(loop_start);
            loop_start = increment_start;
            self.patch_jump(body_jump);
        }

        self.statement();
        self.emit_loop(loop_start);
        if let Some(exit_jump) = exit_jump {
            self.patch_jump(exit_jump);
            self.emit(Instruction::POP);
        }
        self.end_scope();
    }

    fn return_statement(&mut self) {
        match self.state().kind {
            FunctionKind::Script | FunctionKind::Module => {
                self.error("Cannot return from top-level code.");
            }
            _ => {}
        }
        if self.match_token(TokenType::Semicolon) {
            match self.state().return_kind {
                ReturnKind::None | ReturnKind::Void => self.emit_return(),
                _ => self.error("Function must return a value."),
            }
        } else {
            if self.state().kind == FunctionKind::Initializer {
                self.error("Cannot return a value from an initializer.");
            }
            self.expression();
            self.check_return_kind();
            self.consume(TokenType::Semicolon, "Expect ';' after return value.");
            self.emit(Instruction::RETURN);
        }
    }

    fn var_declaration(&mut self) {
        let global = self.parse_variable("Expect variable name.");
        if self.match_token(TokenType::Equal) {
            self.expression();
        } else {
            self.emit(Instruction::NIL);
        }
        self.consume(TokenType::Semicolon, "Expect ';' after variable declaration.");
        self.define_variable(global);
    }

    fn fn_declaration(&mut self) {
        let global = self.parse_variable("Expect function name.");
        self.mark_initialized();
        let name = self.previous.lexeme;
        self.function(FunctionKind::Function, name);
        self.define_variable(global);
    }

    fn function(&mut self, kind: FunctionKind, name: &str) {
        self.states.push(FuncState::new(kind, Some(Rc::from(name))));
        self.begin_scope();

        self.consume(TokenType::OParen, "Expect '(' after function name.");
        if !self.check(TokenType::CParen) {
            loop {
                if self.state().arity == 255 {
                    self.error_at_current("Cannot have more than 255 parameters.");
                } else {
                    self.state_mut().arity += 1;
                }
                let param = self.parse_variable("Expect parameter name.");
                self.define_variable(param);
                if !self.match_token(TokenType::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenType::CParen, "Expect ')' after parameters.");

        if kind == FunctionKind::Function && self.match_token(TokenType::At) {
            self.consume(TokenType::Identifier, "Expect return kind after '@'.");
            match ReturnKind::from_annotation(self.previous.lexeme) {
                Some(return_kind) => self.state_mut().return_kind = return_kind,
                None => self.error("Return kind must be void, int, float, str, or bool."),
            }
        }

        self.consume(TokenType::OBrace, "Expect '{' before function body.");
        self.block();

        // untyped and void functions fall off the end into nil; a declared
        // kind demands an explicit terminal return
        match self.state().return_kind {
            ReturnKind::None | ReturnKind::Void => self.emit_return(),
            _ => {
                if self.state().last_instr != Some(Instruction::RETURN) {
                    self.error("Function must end with a return statement.");
                }
            }
        }

        let state = self.states.pop().unwrap();
        let function = Function {
            name: state.name,
            arity: state.arity,
            upvalue_count: state.upvalues.len() as u8,
            return_kind: state.return_kind,
            chunk: state.chunk,
        };
        let idx = self.make_constant(Value::from(function));
        self.emit_pair(Instruction::CLOSURE, idx);
        for captured in state.upvalues {
            self.emit_byte(captured.is_local as u8);
            self.emit_byte(captured.index);
        }
    }

    fn class_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_const = self.identifier_constant(class_name);
        self.declare_variable();
        self.emit_pair(Instruction::CLASS, name_const);
        self.define_variable(name_const);

        self.classes.push(ClassState {
            has_superclass: false,
        });

        if self.match_token(TokenType::Less) {
            self.consume(TokenType::Identifier, "Expect superclass name.");
            if self.previous.lexeme == class_name.lexeme {
                self.error("A class cannot inherit from itself.");
            }
            self.named_variable(self.previous, false);

            // the superclass value lives in a hidden scope as the local
            // `super`, so methods can close over it
            self.begin_scope();
            self.add_local("super");
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit(Instruction::INHERIT);
            self.classes.last_mut().unwrap().has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenType::OBrace, "Expect '{' before class body.");
        while !self.check(TokenType::CBrace) && !self.check(TokenType::Eof) {
            self.method();
        }
        self.consume(TokenType::CBrace, "Expect '}' after class body.");
        self.emit(Instruction::POP);

        if self.classes.last().unwrap().has_superclass {
            self.end_scope();
        }
        self.classes.pop();
    }

    fn method(&mut self) {
        self.consume(TokenType::Identifier, "Expect method name.");
        let name_const = self.identifier_constant(self.previous);
        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        let name = self.previous.lexeme;
        self.function(kind, name);
        self.emit_pair(Instruction::METHOD, name_const);
    }

    /// `import name;` hands the name to the host loader, compiles the text
    /// it returns in a fresh frame, and emits a zero-arity call so the
    /// module body runs right here. Every import site re-runs its module;
    /// cycles are not detected.
    fn import_declaration(&mut self) {
        self.consume(TokenType::Identifier, "Expect module name after 'import'.");
        let name_token = self.previous;
        self.consume(TokenType::Semicolon, "Expect ';' after module name.");

        let top_level = matches!(
            self.state().kind,
            FunctionKind::Script | FunctionKind::Module
        ) && self.state().scope_depth == 0;
        if !top_level {
            self.error_at(name_token, "Can only import at top level.");
            return;
        }

        let source = match self.loader.load(name_token.lexeme) {
            Ok(source) => source,
            Err(msg) => {
                self.error_at(name_token, &msg);
                return;
            }
        };

        let module = Compiler::new(&source, self.loader).compile_module(name_token.lexeme);
        match module {
            Ok(function) => {
                let idx = self.make_constant(Value::from(function));
                self.emit_pair(Instruction::CLOSURE, idx);
                self.emit_pair(Instruction::CALL, 0);
                self.emit(Instruction::POP);
            }
            Err(reports) => {
                self.had_error = true;
                self.reports.extend(reports);
            }
        }
    }

    //<<

    //>> Return-kind checking

    fn probe_last_value(&self) -> Probe {
        use Instruction::*;
        let state = self.state();
        let chunk = &state.chunk;
        match state.last_instr {
            Some(CONSTANT) => Self::probe_constant(chunk.constant(chunk.byte(chunk.len() - 1) as usize)),
            Some(CONSTANT_LONG) => {
                Self::probe_constant(chunk.constant(chunk.two_bytes(chunk.len() - 2) as usize))
            }
            Some(NIL) => Probe::Nil,
            Some(TRUE) | Some(FALSE) | Some(NOT) | Some(EQUAL) | Some(GREATER) | Some(LESS) => {
                Probe::Bool
            }
            Some(SUBTRACT) | Some(MULTIPLY) | Some(DIVIDE) | Some(MODULO) | Some(NEGATE)
            | Some(BIT_AND) | Some(BIT_OR) | Some(BIT_XOR) | Some(BIT_LS) | Some(BIT_RS)
            | Some(BIT_NOT) => Probe::Number(None),
            Some(CLOSURE) => Probe::Callable,
            _ => Probe::Unknown,
        }
    }

    fn probe_constant(value: &Value) -> Probe {
        match value {
            Value::Nil => Probe::Nil,
            Value::Bool(_) => Probe::Bool,
            Value::Number(n) => Probe::Number(Some(*n)),
            Value::Object(Object::String(_)) => Probe::Str,
            Value::Object(Object::Function(_)) => Probe::Callable,
            _ => Probe::Unknown,
        }
    }

    /// The shallow compile-time half of return typing: reject a `return`
    /// whose last emitted opcode pins the value to a provably wrong kind.
    /// Anything unprovable passes and the VM re-checks at frame return.
    fn check_return_kind(&mut self) {
        let kind = self.state().return_kind;
        if kind == ReturnKind::None {
            return;
        }
        let probe = self.probe_last_value();
        let msg = match (kind, &probe) {
            (_, Probe::Unknown) => return,
            (ReturnKind::Void, Probe::Nil) => return,
            (ReturnKind::Void, _) => "Function must not return a value.",
            (ReturnKind::Int, Probe::Number(n)) => {
                if n.map_or(true, |n| n.fract() == 0.0) {
                    return;
                }
                "Function must return an integer."
            }
            (ReturnKind::Int, _) => "Function must return a number.",
            (ReturnKind::Float, Probe::Number(_)) => return,
            (ReturnKind::Float, _) => "Function must return a number.",
            (ReturnKind::Str, Probe::Str) => return,
            (ReturnKind::Str, _) => "Function must return a string.",
            (ReturnKind::Bool, Probe::Bool) => return,
            (ReturnKind::Bool, _) => "Function must return a boolean.",
            (ReturnKind::None, _) => unreachable!(),
        };
        self.error(msg);
    }

    //<<
}

//>> Prefix and infix parse functions

fn grouping(compiler: &mut Compiler, _can_assign: bool) {
    compiler.expression();
    compiler.consume(TokenType::CParen, "Expect ')' after expression.");
}

fn number(compiler: &mut Compiler, _can_assign: bool) {
    let value: f64 = compiler.previous.lexeme.parse().unwrap();
    compiler.emit_constant(Value::Number(value));
}

fn string(compiler: &mut Compiler, _can_assign: bool) {
    let lexeme = compiler.previous.lexeme;
    let content = &lexeme[1..lexeme.len() - 1];
    compiler.emit_constant(Value::string(content));
}

fn literal(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.previous.typ {
        TokenType::True => compiler.emit(Instruction::TRUE),
        TokenType::False => compiler.emit(Instruction::FALSE),
        TokenType::Nil => compiler.emit(Instruction::NIL),
        _ => unreachable!(),
    }
}

fn variable(compiler: &mut Compiler, can_assign: bool) {
    compiler.named_variable(compiler.previous, can_assign);
}

fn unary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous.typ;
    compiler.parse_precedence(Precedence::Unary);
    match operator {
        TokenType::Minus => compiler.emit(Instruction::NEGATE),
        TokenType::Bang => compiler.emit(Instruction::NOT),
        TokenType::Tilde => compiler.emit(Instruction::BIT_NOT),
        _ => unreachable!(),
    }
}

fn binary(compiler: &mut Compiler, _can_assign: bool) {
    let operator = compiler.previous.typ;
    compiler.parse_precedence(rule(operator).precedence.next());
    match operator {
        TokenType::Plus => compiler.emit(Instruction::ADD),
        TokenType::Minus => compiler.emit(Instruction::SUBTRACT),
        TokenType::Star => compiler.emit(Instruction::MULTIPLY),
        TokenType::Slash => compiler.emit(Instruction::DIVIDE),
        TokenType::Percent => compiler.emit(Instruction::MODULO),
        TokenType::Amp => compiler.emit(Instruction::BIT_AND),
        TokenType::Pipe => compiler.emit(Instruction::BIT_OR),
        TokenType::Caret => compiler.emit(Instruction::BIT_XOR),
        TokenType::Shl => compiler.emit(Instruction::BIT_LS),
        TokenType::Shr => compiler.emit(Instruction::BIT_RS),
        TokenType::DEqual => compiler.emit(Instruction::EQUAL),
        TokenType::BangEqual => {
            compiler.emit(Instruction::EQUAL);
            compiler.emit(Instruction::NOT);
        }
        TokenType::Greater => compiler.emit(Instruction::GREATER),
        TokenType::GreaterEqual => {
            compiler.emit(Instruction::LESS);
            compiler.emit(Instruction::NOT);
        }
        TokenType::Less => compiler.emit(Instruction::LESS),
        TokenType::LessEqual => {
            compiler.emit(Instruction::GREATER);
            compiler.emit(Instruction::NOT);
        }
        _ => unreachable!(),
    }
}

fn and_(compiler: &mut Compiler, _can_assign: bool) {
    let end_jump = compiler.emit_jump(Instruction::JUMP_IF_FALSE);
    compiler.emit(Instruction::POP);
    compiler.parse_precedence(Precedence::And);
    compiler.patch_jump(end_jump);
}

fn or_(compiler: &mut Compiler, _can_assign: bool) {
    let else_jump = compiler.emit_jump(Instruction::JUMP_IF_FALSE);
    let end_jump = compiler.emit_jump(Instruction::JUMP);
    compiler.patch_jump(else_jump);
    compiler.emit(Instruction::POP);
    compiler.parse_precedence(Precedence::Or);
    compiler.patch_jump(end_jump);
}

fn call(compiler: &mut Compiler, _can_assign: bool) {
    let argc = compiler.argument_list();
    compiler.emit_pair(Instruction::CALL, argc);
}

fn dot(compiler: &mut Compiler, can_assign: bool) {
    compiler.consume(TokenType::Identifier, "Expect property name after '.'.");
    let name = compiler.identifier_constant(compiler.previous);
    if can_assign && compiler.match_token(TokenType::Equal) {
        compiler.expression();
        compiler.emit_pair(Instruction::SET_PROPERTY, name);
    } else if compiler.match_token(TokenType::OParen) {
        let argc = compiler.argument_list();
        compiler.emit_pair(Instruction::INVOKE, name);
        compiler.emit_byte(argc);
    } else {
        compiler.emit_pair(Instruction::GET_PROPERTY, name);
    }
}

fn index(compiler: &mut Compiler, can_assign: bool) {
    compiler.expression();
    compiler.consume(TokenType::CBracket, "Expect ']' after index.");
    if can_assign && compiler.match_token(TokenType::Equal) {
        compiler.expression();
        compiler.emit(Instruction::OBJECT_SET);
    } else {
        compiler.emit(Instruction::OBJECT_GET);
    }
}

fn array(compiler: &mut Compiler, _can_assign: bool) {
    let mut count: u32 = 0;
    if !compiler.check(TokenType::CBracket) {
        loop {
            compiler.expression();
            if count == 255 {
                compiler.error("Cannot have more than 255 elements in an array literal.");
            }
            count += 1;
            if !compiler.match_token(TokenType::Comma) {
                break;
            }
        }
    }
    compiler.consume(TokenType::CBracket, "Expect ']' after array elements.");
    compiler.emit_pair(Instruction::ARRAY, count.min(255) as u8);
}

fn dict(compiler: &mut Compiler, _can_assign: bool) {
    let mut count: u32 = 0;
    if !compiler.check(TokenType::CBrace) {
        loop {
            compiler.expression();
            compiler.consume(TokenType::Colon, "Expect ':' after dict key.");
            compiler.expression();
            if count == 255 {
                compiler.error("Cannot have more than 255 entries in a dict literal.");
            }
            count += 1;
            if !compiler.match_token(TokenType::Comma) {
                break;
            }
        }
    }
    compiler.consume(TokenType::CBrace, "Expect '}' after dict entries.");
    compiler.emit_pair(Instruction::DICT, count.min(255) as u8);
}

fn this_(compiler: &mut Compiler, _can_assign: bool) {
    if compiler.classes.is_empty() {
        compiler.error("Cannot use 'this' outside of a class.");
        return;
    }
    compiler.named_variable(compiler.previous, false);
}

fn super_(compiler: &mut Compiler, _can_assign: bool) {
    match compiler.classes.last() {
        None => {
            compiler.error("Cannot use 'super' outside of a class.");
        }
        Some(class) if !class.has_superclass => {
            compiler.error("Cannot use 'super' in a class with no superclass.");
        }
        _ => {}
    }
    compiler.consume(TokenType::Period, "Expect '.' after 'super'.");
    compiler.consume(TokenType::Identifier, "Expect superclass method name.");
    let name = compiler.identifier_constant(compiler.previous);

    let this_token = Token::new(TokenType::This, "this", compiler.previous.line);
    let super_token = Token::new(TokenType::Super, "super", compiler.previous.line);
    compiler.named_variable(this_token, false);
    if compiler.match_token(TokenType::OParen) {
        let argc = compiler.argument_list();
        compiler.named_variable(super_token, false);
        compiler.emit_pair(Instruction::SUPER_INVOKE, name);
        compiler.emit_byte(argc);
    } else {
        compiler.named_variable(super_token, false);
        compiler.emit_pair(Instruction::GET_SUPER, name);
    }
}

//<<

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loader::NoModules;

    fn compile(source: &str) -> Result<Function, Vec<Report>> {
        Compiler::new(source, &NoModules).compile()
    }

    fn code(source: &str) -> Vec<u8> {
        compile(source).expect("compiles").chunk.code().to_vec()
    }

    fn first_error(source: &str) -> String {
        compile(source).expect_err("fails")[0].msg.clone()
    }

    #[test]
    fn arithmetic_respects_precedence() {
        use Instruction::*;
        assert_eq!(
            code("out 1 + 2 * 3;"),
            vec![
                CONSTANT as u8, 0,
                CONSTANT as u8, 1,
                CONSTANT as u8, 2,
                MULTIPLY as u8,
                ADD as u8,
                OUT as u8,
                NIL as u8,
                RETURN as u8,
            ]
        );
    }

    #[test]
    fn bitwise_binds_tighter_than_factor() {
        use Instruction::*;
        // 2 * 3 << 1 parses as 2 * (3 << 1)
        assert_eq!(
            code("out 2 * 3 << 1;"),
            vec![
                CONSTANT as u8, 0,
                CONSTANT as u8, 1,
                CONSTANT as u8, 2,
                BIT_LS as u8,
                MULTIPLY as u8,
                OUT as u8,
                NIL as u8,
                RETURN as u8,
            ]
        );
    }

    #[test]
    fn derived_comparisons_negate_their_duals() {
        use Instruction::*;
        assert_eq!(
            code("out 1 <= 2;"),
            vec![
                CONSTANT as u8, 0,
                CONSTANT as u8, 1,
                GREATER as u8,
                NOT as u8,
                OUT as u8,
                NIL as u8,
                RETURN as u8,
            ]
        );
    }

    #[test]
    fn locals_resolve_to_frame_slots() {
        use Instruction::*;
        // slot 0 is reserved; `x` lands in slot 1
        assert_eq!(
            code("{ var x = 1; out x; }"),
            vec![
                CONSTANT as u8, 0,
                GET_LOCAL as u8, 1,
                OUT as u8,
                POP as u8,
                NIL as u8,
                RETURN as u8,
            ]
        );
    }

    #[test]
    fn globals_are_late_bound_names() {
        use Instruction::*;
        assert_eq!(
            code("var x = 1; x = 2;"),
            vec![
                CONSTANT as u8, 1,
                DEFINE_GLOBAL as u8, 0,
                CONSTANT as u8, 2,
                SET_GLOBAL as u8, 0,
                POP as u8,
                NIL as u8,
                RETURN as u8,
            ]
        );
    }

    #[test]
    fn and_short_circuits_over_the_right_operand() {
        use Instruction::*;
        assert_eq!(
            code("out true and false;"),
            vec![
                TRUE as u8,
                JUMP_IF_FALSE as u8, 0, 2,
                POP as u8,
                FALSE as u8,
                OUT as u8,
                NIL as u8,
                RETURN as u8,
            ]
        );
    }

    #[test]
    fn closures_record_their_upvalues() {
        let function = compile(
            "fn make() { var x = 0; fn inc() { x = x + 1; return x; } return inc; }",
        )
        .unwrap();
        let make = (0..function.chunk.constant_count())
            .find_map(|idx| match function.chunk.constant(idx) {
                Value::Object(Object::Function(f)) => Some(Rc::clone(f)),
                _ => None,
            })
            .expect("make is a constant");
        let inc = (0..make.chunk.constant_count())
            .find_map(|idx| match make.chunk.constant(idx) {
                Value::Object(Object::Function(f)) => Some(Rc::clone(f)),
                _ => None,
            })
            .expect("inc is a constant");
        assert_eq!(inc.upvalue_count, 1);

        // the CLOSURE for inc is followed by one (is_local, slot) pair
        // capturing x in make's slot 1
        let bytes = make.chunk.code();
        let closure_at = (0..bytes.len())
            .find(|&idx| bytes[idx] == Instruction::CLOSURE as u8)
            .unwrap();
        assert_eq!(&bytes[closure_at + 2..closure_at + 4], &[1, 1]);
    }

    #[test]
    fn uninitialized_local_cannot_appear_in_its_own_initializer() {
        assert_eq!(
            first_error("{ var a = 1; { var a = a; } }"),
            "Cannot read local variable in its own initializer."
        );
    }

    #[test]
    fn duplicate_locals_in_one_scope_are_rejected() {
        assert_eq!(
            first_error("{ var a = 1; var a = 2; }"),
            "Already a variable with this name in this scope."
        );
    }

    #[test]
    fn stray_assignment_is_an_invalid_target() {
        assert_eq!(first_error("1 + 2 = 3;"), "Invalid assignment target.");
    }

    #[test]
    fn this_and_super_need_a_class() {
        assert_eq!(
            first_error("out this;"),
            "Cannot use 'this' outside of a class."
        );
        assert_eq!(
            first_error("class A { m() { out super.m(); } }"),
            "Cannot use 'super' in a class with no superclass."
        );
    }

    #[test]
    fn top_level_return_is_rejected() {
        assert_eq!(first_error("return 1;"), "Cannot return from top-level code.");
    }

    #[test]
    fn initializer_cannot_return_a_value() {
        assert_eq!(
            first_error("class A { init() { return 1; } }"),
            "Cannot return a value from an initializer."
        );
    }

    #[test]
    fn self_inheritance_is_rejected() {
        assert_eq!(
            first_error("class A < A {}"),
            "A class cannot inherit from itself."
        );
    }

    #[test]
    fn declared_return_kind_rejects_wrong_constants() {
        assert_eq!(
            first_error("fn bad() @int { return \"x\"; }"),
            "Function must return a number."
        );
        assert_eq!(
            first_error("fn bad() @int { return 1.5; }"),
            "Function must return an integer."
        );
        assert_eq!(
            first_error("fn bad() @str { return 3; }"),
            "Function must return a string."
        );
        assert_eq!(
            first_error("fn bad() @bool { return 1 * 2; }"),
            "Function must return a boolean."
        );
        // `+` may produce a number or a string, so it proves nothing
        assert!(compile("fn ok(a, b) @bool { return a + b; }").is_ok());
        // a variable load proves nothing at compile time
        assert!(compile("fn ok(x) @int { return x; }").is_ok());
    }

    #[test]
    fn typed_function_must_end_with_a_return() {
        assert_eq!(
            first_error("fn bad() @int { out 1; }"),
            "Function must end with a return statement."
        );
        assert_eq!(
            first_error("fn bad() @str { return; }"),
            "Function must return a value."
        );
        assert!(compile("fn ok() @void { out 1; }").is_ok());
        assert!(compile("fn ok() @void { return; }").is_ok());
    }

    #[test]
    fn panic_mode_reports_once_and_resynchronizes() {
        let reports = compile("var 1 = 2; out 3;").unwrap_err();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].msg, "Expect variable name.");
    }

    #[test]
    fn imports_are_top_level_only() {
        assert_eq!(
            first_error("fn f() { import m; }"),
            "Can only import at top level."
        );
    }
}
