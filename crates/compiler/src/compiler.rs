//! Single-pass Pratt compiler
//!
//! Consumes tokens straight from the scanner and emits bytecode into the
//! chunk of the function currently being compiled; no AST is built. The
//! whole compilation state is an explicit [`Compiler`] value (parser state,
//! a stack of function compilers, a stack of class compilers), so nested
//! compilations such as `import` can run without clobbering anything.
//!
//! The language is expression-oriented: every statement compiles to code
//! that leaves exactly one value, and the statement dispatcher pops it.
//! Blocks, `if`, `while`, `for`, declarations and `print` all follow that
//! protocol, which keeps the stack depth at statement boundaries invariant
//! and lets any statement appear in expression position.

use craven_core::chunk::OpCode;
use craven_core::heap::Heap;
use craven_core::object::{ObjFunction, ObjKind, ObjRef};
use craven_core::value::Value;

use crate::scanner::{Scanner, Token, TokenKind};
use crate::CompileError;

const MAX_LOCALS: usize = 256;
const MAX_UPVALUES: usize = 256;
const MAX_CONSTANTS: usize = 256;

/// Expression precedence, lowest to highest. Binary operators recurse one
/// level higher than their own, giving left associativity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    None,
    Assignment, // =
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // not -
    Call,       // . () []
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

type ParseFn<'src, 'h> = fn(&mut Compiler<'src, 'h>, bool);

struct ParseRule<'src, 'h> {
    prefix: Option<ParseFn<'src, 'h>>,
    infix: Option<ParseFn<'src, 'h>>,
    precedence: Precedence,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FunctionKind {
    Function,
    Initializer,
    Method,
    Script,
}

struct Local<'src> {
    name: &'src str,
    /// `-1` from declaration until the initializer completes.
    depth: i32,
    is_captured: bool,
}

#[derive(Clone, Copy, PartialEq, Eq)]
struct UpvalueDesc {
    index: u8,
    is_local: bool,
}

/// Per-function compilation state. These stack up as function declarations
/// nest; the innermost one owns the chunk being emitted into.
struct FnCompiler<'src> {
    function: ObjFunction,
    kind: FunctionKind,
    locals: Vec<Local<'src>>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
}

/// Per-class compilation state, for `this`/`super` validation.
struct ClassCompiler {
    has_superclass: bool,
}

pub struct Compiler<'src, 'h> {
    scanner: Scanner<'src>,
    heap: &'h mut Heap,
    previous: Token<'src>,
    current: Token<'src>,
    had_error: bool,
    panic_mode: bool,
    diagnostics: Vec<String>,
    fns: Vec<FnCompiler<'src>>,
    classes: Vec<ClassCompiler>,
}

/// Compile a source string into a top-level script function, allocated on
/// the given heap. All diagnostics are collected; the first error per
/// panic region wins, and `synchronize` resumes at statement boundaries.
pub fn compile(heap: &mut Heap, source: &str) -> Result<ObjRef, CompileError> {
    let mut compiler = Compiler::new(heap, source);
    compiler.begin_compiler(FunctionKind::Script);

    compiler.advance();
    while !compiler.match_token(TokenKind::Eof) {
        compiler.statement();
    }

    let (function, _) = compiler.end_compiler();
    if compiler.had_error {
        Err(CompileError {
            diagnostics: compiler.diagnostics,
        })
    } else {
        Ok(function)
    }
}

impl<'src, 'h> Compiler<'src, 'h> {
    fn new(heap: &'h mut Heap, source: &'src str) -> Compiler<'src, 'h> {
        Compiler {
            scanner: Scanner::new(source),
            heap,
            previous: Token::empty(),
            current: Token::empty(),
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
            fns: Vec::new(),
            classes: Vec::new(),
        }
    }

    // =========================================================================
    // Parser plumbing
    // =========================================================================

    fn advance(&mut self) {
        self.previous = self.current;
        loop {
            self.current = self.scanner.next_token();
            match self.current.kind {
                TokenKind::Error(message) => self.error_at_current(message),
                _ => break,
            }
        }
    }

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    fn match_token(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        let place = match token.kind {
            TokenKind::Eof => " at end".to_string(),
            TokenKind::Error(_) => String::new(),
            _ => format!(" at '{}'", token.lexeme),
        };
        self.diagnostics
            .push(format!("[line {}] Error{}: {}", token.line, place, message));
        self.had_error = true;
    }

    /// Clear panic mode and skip to the next statement boundary.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while self.current.kind != TokenKind::Eof {
            if self.previous.kind == TokenKind::Semicolon {
                return;
            }
            match self.current.kind {
                TokenKind::Class
                | TokenKind::Func
                | TokenKind::Var
                | TokenKind::For
                | TokenKind::If
                | TokenKind::While
                | TokenKind::Print
                | TokenKind::Return => return,
                _ => self.advance(),
            }
        }
    }

    // =========================================================================
    // Function compiler stack
    // =========================================================================

    fn begin_compiler(&mut self, kind: FunctionKind) {
        let mut function = ObjFunction::new();
        if kind != FunctionKind::Script {
            let name = if self.previous.kind == TokenKind::Func {
                self.heap.intern("anonymous")
            } else {
                self.heap.intern(self.previous.lexeme)
            };
            function.name = Some(name);
        }

        // Slot zero belongs to the receiver: `this` inside methods, the
        // callee itself for plain functions.
        let slot_zero = Local {
            name: if kind == FunctionKind::Function { "" } else { "this" },
            depth: 0,
            is_captured: false,
        };

        self.fns.push(FnCompiler {
            function,
            kind,
            locals: vec![slot_zero],
            upvalues: Vec::new(),
            scope_depth: 0,
        });
    }

    /// Finish the innermost function: emit its implicit return, move it to
    /// the heap, and hand back its upvalue descriptors for the `CLOSURE`
    /// operand stream.
    fn end_compiler(&mut self) -> (ObjRef, Vec<UpvalueDesc>) {
        self.emit_return();
        let done = match self.fns.pop() {
            Some(done) => done,
            None => unreachable!("function compiler stack underflow"),
        };
        let function = self.heap.alloc(ObjKind::Function(done.function));
        (function, done.upvalues)
    }

    fn cur(&mut self) -> &mut FnCompiler<'src> {
        let last = self.fns.len() - 1;
        &mut self.fns[last]
    }

    fn cur_kind(&self) -> FunctionKind {
        self.fns[self.fns.len() - 1].kind
    }

    fn begin_scope(&mut self) {
        self.cur().scope_depth += 1;
    }

    /// Pop the scope's locals, hoisting captured ones into the heap.
    fn end_scope(&mut self) {
        self.cur().scope_depth -= 1;
        loop {
            let fnc = self.cur();
            let Some(local) = fnc.locals.last() else { break };
            if local.depth <= fnc.scope_depth {
                break;
            }
            let captured = local.is_captured;
            fnc.locals.pop();
            if captured {
                self.emit(OpCode::CloseUpvalue);
            } else {
                self.emit(OpCode::Pop);
            }
        }
    }

    // =========================================================================
    // Emission helpers
    // =========================================================================

    fn emit_byte(&mut self, byte: u8) {
        let line = self.previous.line;
        self.cur().function.chunk.write(byte, line);
    }

    fn emit(&mut self, op: OpCode) {
        self.emit_byte(op as u8);
    }

    fn emit_pair(&mut self, op: OpCode, operand: u8) {
        self.emit(op);
        self.emit_byte(operand);
    }

    fn current_offset(&mut self) -> usize {
        self.cur().function.chunk.code.len()
    }

    /// Emit a jump with a placeholder offset; returns the offset slot for
    /// `patch_jump`.
    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op);
        self.emit_byte(0xff);
        self.emit_byte(0xff);
        self.current_offset() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        // -2 adjusts for the offset bytes themselves.
        let jump = self.current_offset() - offset - 2;
        if jump > u16::MAX as usize {
            self.error("Too much code to jump over.");
        }
        let code = &mut self.cur().function.chunk.code;
        code[offset] = ((jump >> 8) & 0xff) as u8;
        code[offset + 1] = (jump & 0xff) as u8;
    }

    fn emit_loop(&mut self, loop_start: usize) {
        self.emit(OpCode::Loop);
        let offset = self.current_offset() - loop_start + 2;
        if offset > u16::MAX as usize {
            self.error("Loop body too large.");
        }
        self.emit_byte(((offset >> 8) & 0xff) as u8);
        self.emit_byte((offset & 0xff) as u8);
    }

    fn emit_return(&mut self) {
        if self.cur_kind() == FunctionKind::Initializer {
            self.emit_pair(OpCode::GetLocal, 0);
        }
        self.emit(OpCode::Return);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        let index = self.cur().function.chunk.add_constant(value);
        if index >= MAX_CONSTANTS {
            self.error("Too many constants in one chunk.");
            return 0;
        }
        index as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let constant = self.make_constant(value);
        self.emit_pair(OpCode::Constant, constant);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let string = self.heap.intern(name);
        self.make_constant(Value::object(string))
    }

    // =========================================================================
    // Variables
    // =========================================================================

    fn add_local(&mut self, name: Token<'src>) {
        if self.cur().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        self.cur().locals.push(Local {
            name: name.lexeme,
            depth: -1,
            is_captured: false,
        });
    }

    fn declare_variable(&mut self) {
        if self.cur().scope_depth == 0 {
            return;
        }
        let name = self.previous;
        let fnc = &self.fns[self.fns.len() - 1];
        let mut duplicate = false;
        for local in fnc.locals.iter().rev() {
            if local.depth != -1 && local.depth < fnc.scope_depth {
                break;
            }
            if local.name == name.lexeme {
                duplicate = true;
                break;
            }
        }
        if duplicate {
            self.error("Already a variable with this name in this scope.");
        }
        self.add_local(name);
    }

    fn parse_variable(&mut self, message: &str) -> u8 {
        self.consume(TokenKind::Identifier, message);
        self.declare_variable();
        if self.cur().scope_depth > 0 {
            return 0;
        }
        self.identifier_constant(self.previous.lexeme)
    }

    fn mark_initialized(&mut self) {
        let fnc = self.cur();
        if fnc.scope_depth == 0 {
            return;
        }
        let depth = fnc.scope_depth;
        if let Some(local) = fnc.locals.last_mut() {
            local.depth = depth;
        }
    }

    fn define_variable(&mut self, global: u8) {
        if self.cur().scope_depth > 0 {
            self.mark_initialized();
            return;
        }
        self.emit_pair(OpCode::DefineGlobal, global);
    }

    /// Search one function's locals, newest first.
    fn resolve_local_at(&mut self, fn_index: usize, name: &str) -> Option<usize> {
        let mut uninitialized = false;
        let mut found = None;
        for (i, local) in self.fns[fn_index].locals.iter().enumerate().rev() {
            if local.name == name {
                uninitialized = local.depth == -1;
                found = Some(i);
                break;
            }
        }
        if uninitialized {
            self.error("Can't read local variable in its own initializer.");
        }
        found
    }

    /// Record (or reuse) an upvalue descriptor on function `fn_index`.
    fn add_upvalue(&mut self, fn_index: usize, index: u8, is_local: bool) -> usize {
        let desc = UpvalueDesc { index, is_local };
        if let Some(existing) = self.fns[fn_index].upvalues.iter().position(|u| *u == desc) {
            return existing;
        }
        if self.fns[fn_index].upvalues.len() == MAX_UPVALUES {
            self.error("Too many closure variables in function.");
            return 0;
        }
        self.fns[fn_index].upvalues.push(desc);
        self.fns[fn_index].function.upvalue_count += 1;
        self.fns[fn_index].upvalues.len() - 1
    }

    /// Resolve a name against enclosing functions, creating upvalues on the
    /// way back down and flagging the captured local.
    fn resolve_upvalue_at(&mut self, fn_index: usize, name: &str) -> Option<usize> {
        if fn_index == 0 {
            return None;
        }
        if let Some(local) = self.resolve_local_at(fn_index - 1, name) {
            self.fns[fn_index - 1].locals[local].is_captured = true;
            return Some(self.add_upvalue(fn_index, local as u8, true));
        }
        if let Some(upvalue) = self.resolve_upvalue_at(fn_index - 1, name) {
            return Some(self.add_upvalue(fn_index, upvalue as u8, false));
        }
        None
    }

    fn named_variable(&mut self, name: Token<'src>, can_assign: bool) {
        let fn_index = self.fns.len() - 1;
        let (get_op, set_op, arg) =
            if let Some(local) = self.resolve_local_at(fn_index, name.lexeme) {
                (OpCode::GetLocal, OpCode::SetLocal, local as u8)
            } else if let Some(upvalue) = self.resolve_upvalue_at(fn_index, name.lexeme) {
                (OpCode::GetUpvalue, OpCode::SetUpvalue, upvalue as u8)
            } else {
                let constant = self.identifier_constant(name.lexeme);
                (OpCode::GetGlobal, OpCode::SetGlobal, constant)
            };

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_pair(set_op, arg);
        } else {
            self.emit_pair(get_op, arg);
        }
    }

    // =========================================================================
    // Expressions
    // =========================================================================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let Some(prefix) = Self::rule(self.previous.kind).prefix else {
            self.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        prefix(self, can_assign);

        while precedence <= Self::rule(self.current.kind).precedence {
            self.advance();
            if let Some(infix) = Self::rule(self.previous.kind).infix {
                infix(self, can_assign);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("Invalid assignment target.");
        }
    }

    fn rule(kind: TokenKind) -> ParseRule<'src, 'h> {
        use Precedence as P;
        use TokenKind as T;
        let (prefix, infix, precedence): (
            Option<ParseFn<'src, 'h>>,
            Option<ParseFn<'src, 'h>>,
            Precedence,
        ) = match kind {
            T::LeftParen => (Some(Self::grouping), Some(Self::call), P::Call),
            T::LeftBrace => (Some(Self::block_expression), None, P::None),
            T::LeftSquare => (Some(Self::list), Some(Self::index), P::Call),
            T::Dot => (None, Some(Self::dot), P::Call),
            T::Minus => (Some(Self::unary), Some(Self::binary), P::Term),
            T::Plus => (None, Some(Self::binary), P::Term),
            T::Slash | T::Star => (None, Some(Self::binary), P::Factor),
            T::Not => (Some(Self::unary), None, P::None),
            T::BangEqual | T::EqualEqual => (None, Some(Self::binary), P::Equality),
            T::Greater | T::GreaterEqual | T::Less | T::LessEqual => {
                (None, Some(Self::binary), P::Comparison)
            }
            T::Identifier => (Some(Self::variable), None, P::None),
            T::String => (Some(Self::string), None, P::None),
            T::Number => (Some(Self::number), None, P::None),
            T::And => (None, Some(Self::and), P::And),
            T::Or => (None, Some(Self::or), P::Or),
            T::False | T::True | T::None => (Some(Self::literal), None, P::None),
            T::Some => (Some(Self::some_expression), None, P::None),
            T::Super => (Some(Self::super_), None, P::None),
            T::This => (Some(Self::this), None, P::None),
            // Statements are expressions too; their value protocol makes
            // this composable.
            T::Class => (Some(Self::class_declaration), None, P::None),
            T::For => (Some(Self::for_statement), None, P::None),
            T::Func => (Some(Self::func_declaration), None, P::None),
            T::If => (Some(Self::if_statement), None, P::None),
            T::Print => (Some(Self::print_statement), None, P::None),
            T::Return => (Some(Self::return_statement), None, P::None),
            T::Var => (Some(Self::var_declaration), None, P::None),
            T::While => (Some(Self::while_statement), None, P::None),
            _ => (None, None, P::None),
        };
        ParseRule {
            prefix,
            infix,
            precedence,
        }
    }

    fn grouping(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn call(&mut self, _can_assign: bool) {
        let arg_count = self.argument_list();
        self.emit_pair(OpCode::Call, arg_count);
    }

    fn argument_list(&mut self) -> u8 {
        let mut arg_count: usize = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                if arg_count == 255 {
                    self.error("Can't have more than 255 arguments.");
                }
                arg_count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after arguments.");
        arg_count as u8
    }

    fn dot(&mut self, can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect property name after '.'.");
        let name = self.identifier_constant(self.previous.lexeme);
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit_pair(OpCode::SetProperty, name);
        } else if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.emit_pair(OpCode::Invoke, name);
            self.emit_byte(arg_count);
        } else {
            self.emit_pair(OpCode::GetProperty, name);
        }
    }

    fn index(&mut self, can_assign: bool) {
        self.expression();
        self.consume(TokenKind::RightSquare, "Expect ']' after index.");
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            self.emit(OpCode::SetIndex);
        } else {
            self.emit(OpCode::GetIndex);
        }
    }

    fn list(&mut self, _can_assign: bool) {
        let mut elem_count: usize = 0;
        if !self.check(TokenKind::RightSquare) {
            loop {
                self.expression();
                if elem_count == 255 {
                    self.error("Can't have more than 255 elements.");
                }
                elem_count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightSquare, "Expect ']' after list elements.");
        self.emit_pair(OpCode::List, elem_count as u8);
    }

    /// `dict { key => value, ... }`, entered from `variable` when the soft
    /// keyword is followed by a brace.
    fn dict(&mut self) {
        let mut entry_count: usize = 0;
        self.consume(TokenKind::LeftBrace, "Expect '{' after 'dict'.");
        if !self.check(TokenKind::RightBrace) {
            loop {
                if entry_count == 255 {
                    self.error("Can't have more than 255 elements.");
                }
                entry_count += 1;
                self.expression();
                self.consume(TokenKind::FatArrow, "Expect '=>' after dict key.");
                self.expression();
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after dict elements.");
        self.emit_pair(OpCode::Dict, entry_count as u8);
    }

    fn literal(&mut self, _can_assign: bool) {
        match self.previous.kind {
            TokenKind::False => self.emit(OpCode::False),
            TokenKind::True => self.emit(OpCode::True),
            // `nil`/`none` in source is the none option, so member lookups
            // like `none.unwrap()` resolve; the raw nil value stays internal.
            TokenKind::None => self.emit(OpCode::None),
            _ => {}
        }
    }

    fn some_expression(&mut self, _can_assign: bool) {
        self.consume(TokenKind::LeftParen, "Expect '(' after 'some'.");
        self.expression();
        self.consume(TokenKind::RightParen, "Expect ')' after option value.");
        self.emit(OpCode::Some);
    }

    fn number(&mut self, _can_assign: bool) {
        let value: f64 = match self.previous.lexeme.parse() {
            Ok(value) => value,
            Err(_) => {
                self.error("Invalid number literal.");
                0.0
            }
        };
        self.emit_constant(Value::number(value));
    }

    fn string(&mut self, _can_assign: bool) {
        // Trim the surrounding quotes; no escape sequences.
        let lexeme = self.previous.lexeme;
        let chars = &lexeme[1..lexeme.len() - 1];
        let string = self.heap.intern(chars);
        self.emit_constant(Value::object(string));
    }

    fn variable(&mut self, can_assign: bool) {
        // Soft keyword: the whole lexeme must be `dict` and a brace must
        // follow, otherwise it is an ordinary identifier.
        if self.previous.lexeme == "dict" && self.check(TokenKind::LeftBrace) {
            self.dict();
        } else {
            self.named_variable(self.previous, can_assign);
        }
    }

    fn and(&mut self, _can_assign: bool) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self, _can_assign: bool) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    fn unary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        self.parse_precedence(Precedence::Unary);
        match operator {
            TokenKind::Not => self.emit(OpCode::Not),
            TokenKind::Minus => self.emit(OpCode::Negate),
            _ => {}
        }
    }

    fn binary(&mut self, _can_assign: bool) {
        let operator = self.previous.kind;
        // One level higher gives left associativity.
        self.parse_precedence(Self::rule(operator).precedence.next());
        match operator {
            TokenKind::BangEqual => {
                self.emit(OpCode::Equal);
                self.emit(OpCode::Not);
            }
            TokenKind::EqualEqual => self.emit(OpCode::Equal),
            TokenKind::Greater => self.emit(OpCode::Greater),
            TokenKind::GreaterEqual => {
                self.emit(OpCode::Less);
                self.emit(OpCode::Not);
            }
            TokenKind::Less => self.emit(OpCode::Less),
            TokenKind::LessEqual => {
                self.emit(OpCode::Greater);
                self.emit(OpCode::Not);
            }
            TokenKind::Plus => self.emit(OpCode::Add),
            TokenKind::Minus => self.emit(OpCode::Subtract),
            TokenKind::Star => self.emit(OpCode::Multiply),
            TokenKind::Slash => self.emit(OpCode::Divide),
            _ => {}
        }
    }

    fn super_(&mut self, _can_assign: bool) {
        match self.classes.last() {
            Option::None => self.error("Can't use 'super' outside of a class."),
            Option::Some(class) if !class.has_superclass => {
                self.error("Can't use 'super' in a class with no superclass.");
            }
            _ => {}
        }

        self.consume(TokenKind::Dot, "Expect '.' after 'super'.");
        self.consume(TokenKind::Identifier, "Expect superclass method name.");
        let name = self.identifier_constant(self.previous.lexeme);

        self.named_variable(Token::synthetic("this"), false);
        if self.match_token(TokenKind::LeftParen) {
            let arg_count = self.argument_list();
            self.named_variable(Token::synthetic("super"), false);
            self.emit_pair(OpCode::SuperInvoke, name);
            self.emit_byte(arg_count);
        } else {
            self.named_variable(Token::synthetic("super"), false);
            self.emit_pair(OpCode::GetSuper, name);
        }
    }

    fn this(&mut self, _can_assign: bool) {
        if self.classes.is_empty() {
            self.error("Can't use 'this' outside of a class.");
            return;
        }
        self.variable(false);
    }

    // =========================================================================
    // Statements
    // =========================================================================

    /// One top-level statement: its value is produced and popped, and panic
    /// mode resolves at the boundary.
    fn statement(&mut self) {
        self.statement_body();
        self.emit(OpCode::Pop);
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn statement_body(&mut self) {
        if self.match_token(TokenKind::Class) {
            self.class_declaration(false);
        } else if self.match_token(TokenKind::For) {
            self.for_statement(false);
        } else if self.match_token(TokenKind::Func) {
            self.func_declaration(false);
        } else if self.match_token(TokenKind::If) {
            self.if_statement(false);
        } else if self.match_token(TokenKind::Print) {
            self.print_statement(false);
        } else if self.match_token(TokenKind::Return) {
            self.return_statement(false);
        } else if self.match_token(TokenKind::Var) {
            self.var_declaration(false);
        } else if self.match_token(TokenKind::While) {
            self.while_statement(false);
        } else if self.match_token(TokenKind::LeftBrace) {
            self.block_expression(false);
        } else {
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after expression.");
        }
    }

    /// Raw block body: statements with all but the last value popped; an
    /// empty block yields nil. Used directly by function bodies, where
    /// `RETURN` does the scope cleanup wholesale.
    fn block(&mut self) {
        if self.check(TokenKind::RightBrace) {
            self.emit(OpCode::Nil);
        }
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            if self.match_token(TokenKind::Class) {
                self.class_declaration(false);
            } else if self.match_token(TokenKind::For) {
                self.for_statement(false);
            } else if self.match_token(TokenKind::Func) {
                self.func_declaration(false);
            } else if self.match_token(TokenKind::If) {
                self.if_statement(false);
            } else if self.match_token(TokenKind::Print) {
                self.print_statement(false);
            } else if self.match_token(TokenKind::Return) {
                self.return_statement(false);
            } else if self.match_token(TokenKind::Var) {
                self.var_declaration(false);
            } else if self.match_token(TokenKind::While) {
                self.while_statement(false);
            } else if self.match_token(TokenKind::LeftBrace) {
                self.block_expression(false);
            } else {
                self.expression();
                if !self.match_token(TokenKind::Semicolon) && !self.check(TokenKind::RightBrace)
                {
                    self.error_at_current("Expect ';' or '}' at end of expression.");
                }
            }
            if !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
                self.emit(OpCode::Pop);
            }
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after block.");
    }

    /// A braced block as a value: the scope's locals end up below the
    /// block's result, so they are removed from underneath it, closing the
    /// captured ones. Relative addressing keeps this correct at any stack
    /// depth.
    fn block_expression(&mut self, _can_assign: bool) {
        self.begin_scope();
        self.block();
        self.end_scope_preserving_top();
    }

    /// Like `end_scope`, but with the block's value on top of the scope's
    /// locals: each local is removed from under it.
    fn end_scope_preserving_top(&mut self) {
        self.cur().scope_depth -= 1;
        loop {
            let fnc = self.cur();
            let Some(local) = fnc.locals.last() else { break };
            if local.depth <= fnc.scope_depth {
                break;
            }
            let captured = local.is_captured;
            fnc.locals.pop();
            if captured {
                self.emit(OpCode::CloseUnder);
            } else {
                self.emit(OpCode::PopUnder);
            }
        }
    }

    /// Reserve an unnameable, already-initialized slot at the current
    /// depth, keeping the compiler's local indexes aligned with runtime
    /// stack positions for values that live through a scope (the for
    /// loop's iterable and index).
    fn add_synthetic_local(&mut self) {
        if self.cur().locals.len() == MAX_LOCALS {
            self.error("Too many local variables in function.");
            return;
        }
        let depth = self.cur().scope_depth;
        self.cur().locals.push(Local {
            name: "",
            depth,
            is_captured: false,
        });
    }

    fn if_statement(&mut self, _can_assign: bool) {
        self.expression();

        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.consume(TokenKind::LeftBrace, "Expected '{' for 'if' body");
        self.block_expression(false);
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit(OpCode::Pop);

        if self.match_token(TokenKind::Else) {
            self.consume(TokenKind::LeftBrace, "Expected '{' for 'else' body");
            self.block_expression(false);
        } else {
            // Both arms must leave one value.
            self.emit(OpCode::Nil);
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self, _can_assign: bool) {
        // Seed value in case the body never runs; each iteration replaces it.
        self.emit(OpCode::Nil);

        let loop_start = self.current_offset();
        self.expression();

        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.emit(OpCode::Pop);
        self.consume(TokenKind::LeftBrace, "Expected '{' for 'while' body");
        self.block_expression(false);
        self.emit_loop(loop_start);

        self.patch_jump(exit_jump);
        self.emit(OpCode::Pop);
    }

    fn for_statement(&mut self, _can_assign: bool) {
        self.begin_scope();
        let global = self.parse_variable("Expect variable name after 'for'.");
        let var_name = self.previous;
        self.emit(OpCode::Nil);
        self.define_variable(global);
        self.consume(TokenKind::In, "Expect 'in' after variable name.");

        self.expression();
        self.emit_pair(OpCode::Int, 0);
        // The iterable and the running index occupy two anonymous scoped
        // slots; body locals index past them.
        self.add_synthetic_local();
        self.add_synthetic_local();

        let loop_start = self.current_offset();
        let exit_jump = self.emit_jump(OpCode::NextJump);

        let fn_index = self.fns.len() - 1;
        let (set_op, arg) = if let Some(local) = self.resolve_local_at(fn_index, var_name.lexeme)
        {
            (OpCode::SetLocal, local as u8)
        } else if let Some(upvalue) = self.resolve_upvalue_at(fn_index, var_name.lexeme) {
            (OpCode::SetUpvalue, upvalue as u8)
        } else {
            let constant = self.identifier_constant(var_name.lexeme);
            (OpCode::SetGlobal, constant)
        };
        self.emit_pair(set_op, arg);
        self.emit(OpCode::Pop);

        self.consume(TokenKind::LeftBrace, "Expected '{' for 'for' body");
        self.block_expression(false);
        self.emit(OpCode::Pop);

        self.emit_loop(loop_start);
        self.patch_jump(exit_jump);

        // Exit leaves the iterable and the stepped index as the scope's
        // anonymous slots; end_scope pops them and closes the (possibly
        // captured) loop variable. The statement's value is nil.
        self.end_scope();
        self.emit(OpCode::Nil);
    }

    fn print_statement(&mut self, _can_assign: bool) {
        self.expression();
        self.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(OpCode::Print);
    }

    fn return_statement(&mut self, _can_assign: bool) {
        if self.cur_kind() == FunctionKind::Script {
            self.error("Can't return from top-level code.");
        }

        if self.match_token(TokenKind::Semicolon) {
            self.emit_return();
        } else {
            if self.cur_kind() == FunctionKind::Initializer {
                self.error("Can't return a value from an initializer.");
            }
            self.expression();
            self.consume(TokenKind::Semicolon, "Expect ';' after return value.");
            self.emit(OpCode::Return);
        }
    }

    fn var_declaration(&mut self, _can_assign: bool) {
        let global = self.parse_variable("Expect variable name.");
        let var_name = self.previous;
        if self.match_token(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(OpCode::Nil);
        }
        self.consume(
            TokenKind::Semicolon,
            "Expect ';' after variable declaration.",
        );
        self.define_variable(global);
        // The declaration's value is the variable itself.
        self.named_variable(var_name, false);
    }

    fn func_declaration(&mut self, _can_assign: bool) {
        if self.check(TokenKind::Identifier) {
            let global = self.parse_variable("Expect function name.");
            let func_name = self.previous;
            // Initialized before the body compiles, so it can recurse.
            self.mark_initialized();
            self.function(FunctionKind::Function);
            self.define_variable(global);
            self.named_variable(func_name, false);
        } else {
            // Anonymous function.
            self.function(FunctionKind::Function);
        }
    }

    fn function(&mut self, kind: FunctionKind) {
        self.begin_compiler(kind);
        self.begin_scope();

        self.consume(TokenKind::LeftParen, "Expect '(' after function name.");
        if !self.check(TokenKind::RightParen) {
            loop {
                self.cur().function.arity += 1;
                if self.cur().function.arity > 255 {
                    self.error_at_current("Can't have more than 255 parameters.");
                }
                let constant = self.parse_variable("Expect parameter name.");
                self.define_variable(constant);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "Expect ')' after parameters.");
        self.consume(TokenKind::LeftBrace, "Expect '{' before function body.");
        self.block();

        let (function, upvalues) = self.end_compiler();
        let constant = self.make_constant(Value::object(function));
        self.emit_pair(OpCode::Closure, constant);

        for upvalue in upvalues {
            self.emit_byte(if upvalue.is_local { 1 } else { 0 });
            self.emit_byte(upvalue.index);
        }
    }

    fn method(&mut self) {
        self.consume(TokenKind::Identifier, "Expect method name.");
        let constant = self.identifier_constant(self.previous.lexeme);

        let kind = if self.previous.lexeme == "init" {
            FunctionKind::Initializer
        } else {
            FunctionKind::Method
        };
        self.function(kind);
        self.emit_pair(OpCode::Method, constant);
    }

    fn class_declaration(&mut self, _can_assign: bool) {
        self.consume(TokenKind::Identifier, "Expect class name.");
        let class_name = self.previous;
        let name_constant = self.identifier_constant(class_name.lexeme);
        self.declare_variable();

        self.emit_pair(OpCode::Class, name_constant);
        self.define_variable(name_constant);

        self.classes.push(ClassCompiler {
            has_superclass: false,
        });

        if self.match_token(TokenKind::Less) {
            self.consume(TokenKind::Identifier, "Expect superclass name.");
            self.variable(false);

            if class_name.lexeme == self.previous.lexeme {
                self.error("A class can't inherit from itself.");
            }

            // The superclass value becomes a scoped local named `super`,
            // which methods capture as an upvalue.
            self.begin_scope();
            self.add_local(Token::synthetic("super"));
            self.define_variable(0);

            self.named_variable(class_name, false);
            self.emit(OpCode::Inherit);
            let last = self.classes.len() - 1;
            self.classes[last].has_superclass = true;
        }

        self.named_variable(class_name, false);
        self.consume(TokenKind::LeftBrace, "Expect '{' before class body.");
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.method();
        }
        self.consume(TokenKind::RightBrace, "Expect '}' after class body.");

        let has_superclass = self.classes[self.classes.len() - 1].has_superclass;
        if has_superclass {
            // Pop the class so `super` is on top when its scope closes,
            // then re-read the binding as the statement's value.
            self.emit(OpCode::Pop);
            self.end_scope();
            self.named_variable(class_name, false);
        }

        self.classes.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use craven_core::heap::Heap;
    use craven_core::object::ObjKind;

    fn compile_ok(source: &str) -> (Heap, ObjRef) {
        let mut heap = Heap::new();
        let function = match compile(&mut heap, source) {
            Ok(function) => function,
            Err(e) => panic!("expected clean compile, got:\n{e}"),
        };
        (heap, function)
    }

    fn compile_err(source: &str) -> CompileError {
        let mut heap = Heap::new();
        match compile(&mut heap, source) {
            Ok(_) => panic!("expected a compile error for: {source}"),
            Err(e) => e,
        }
    }

    fn script_ops(heap: &Heap, function: ObjRef) -> Vec<OpCode> {
        let chunk = match &heap.get(function).kind {
            ObjKind::Function(f) => &f.chunk,
            _ => panic!("not a function"),
        };
        // Decode opcodes only, skipping operands; enough for shape checks.
        let mut ops = Vec::new();
        let mut offset = 0;
        while offset < chunk.code.len() {
            let op = OpCode::try_from(chunk.code[offset]).expect("valid opcode");
            ops.push(op);
            offset += 1
                + match op {
                    OpCode::Constant
                    | OpCode::Int
                    | OpCode::List
                    | OpCode::Dict
                    | OpCode::GetLocal
                    | OpCode::SetLocal
                    | OpCode::GetGlobal
                    | OpCode::DefineGlobal
                    | OpCode::SetGlobal
                    | OpCode::GetUpvalue
                    | OpCode::SetUpvalue
                    | OpCode::GetProperty
                    | OpCode::SetProperty
                    | OpCode::GetSuper
                    | OpCode::Call
                    | OpCode::Class
                    | OpCode::Method => 1,
                    OpCode::Jump
                    | OpCode::JumpIfFalse
                    | OpCode::NextJump
                    | OpCode::Loop
                    | OpCode::Invoke
                    | OpCode::SuperInvoke => 2,
                    OpCode::Closure => {
                        // Constant byte plus one (is_local, index) pair per
                        // upvalue of the wrapped function.
                        let constant = chunk.constants[chunk.code[offset + 1] as usize];
                        let upvalues = match &heap.get(constant.as_obj()).kind {
                            ObjKind::Function(f) => f.upvalue_count,
                            _ => 0,
                        };
                        1 + 2 * upvalues
                    }
                    _ => 0,
                };
        }
        ops
    }

    #[test]
    fn test_print_statement_shape() {
        let (heap, function) = compile_ok("print 1;");
        assert_eq!(
            script_ops(&heap, function),
            vec![OpCode::Constant, OpCode::Print, OpCode::Pop, OpCode::Return]
        );
    }

    #[test]
    fn test_statements_net_to_zero() {
        // Each statement contributes exactly one Pop at top level.
        let (heap, function) = compile_ok("1; 2; 3;");
        let ops = script_ops(&heap, function);
        assert_eq!(ops.iter().filter(|op| **op == OpCode::Pop).count(), 3);
    }

    #[test]
    fn test_if_without_else_pushes_nil() {
        let (heap, function) = compile_ok("if true { 1 }");
        let ops = script_ops(&heap, function);
        // The implicit else arm materializes a nil so both paths have the
        // same stack effect.
        assert!(ops.contains(&OpCode::Nil));
        assert!(ops.contains(&OpCode::JumpIfFalse));
        assert!(ops.contains(&OpCode::Jump));
    }

    #[test]
    fn test_block_locals_end_under_the_value() {
        let (heap, function) = compile_ok("var x = { var y = 1; y };");
        let ops = script_ops(&heap, function);
        assert!(ops.contains(&OpCode::PopUnder));
        // A captured block local is closed instead.
        let (heap2, function2) =
            compile_ok("var f = { var c = 1; func g() { return c; } g };");
        let ops2 = script_ops(&heap2, function2);
        assert!(ops2.contains(&OpCode::CloseUnder));
        assert!(ops2.contains(&OpCode::PopUnder));
    }

    #[test]
    fn test_global_var_roundtrip() {
        let (heap, function) = compile_ok("var a = 1;");
        let ops = script_ops(&heap, function);
        assert_eq!(
            ops,
            vec![
                OpCode::Constant,
                OpCode::DefineGlobal,
                OpCode::GetGlobal,
                OpCode::Pop,
                OpCode::Return
            ]
        );
    }

    #[test]
    fn test_closure_upvalue_capture() {
        let (heap, function) = compile_ok(
            "func make() { var i = 0; func inc() { i = i + 1; return i; } return inc; }",
        );
        let ops = script_ops(&heap, function);
        assert!(ops.contains(&OpCode::Closure));
        // The inner function's chunk carries Get/SetUpvalue.
        let chunk = match &heap.get(function).kind {
            ObjKind::Function(f) => &f.chunk,
            _ => unreachable!(),
        };
        let make = chunk
            .constants
            .iter()
            .find_map(|c| {
                if !c.is_obj() {
                    return Option::None;
                }
                match &heap.get(c.as_obj()).kind {
                    ObjKind::Function(f) => Option::Some(f),
                    _ => Option::None,
                }
            })
            .expect("make function constant");
        let inner = make
            .chunk
            .constants
            .iter()
            .find_map(|c| {
                if !c.is_obj() {
                    return Option::None;
                }
                match &heap.get(c.as_obj()).kind {
                    ObjKind::Function(f) if f.upvalue_count == 1 => Option::Some(f),
                    _ => Option::None,
                }
            })
            .expect("inner closure with one upvalue");
        assert!(inner.chunk.code.contains(&(OpCode::GetUpvalue as u8)));
        assert!(inner.chunk.code.contains(&(OpCode::SetUpvalue as u8)));
    }

    #[test]
    fn test_for_in_lowering() {
        let (heap, function) = compile_ok("for x in [1, 2] { x; }");
        let ops = script_ops(&heap, function);
        assert!(ops.contains(&OpCode::Int));
        assert!(ops.contains(&OpCode::NextJump));
        assert!(ops.contains(&OpCode::Loop));
    }

    #[test]
    fn test_soft_keyword_dict() {
        let (heap, function) = compile_ok("var d = dict { \"a\" => 1 };");
        assert!(script_ops(&heap, function).contains(&OpCode::Dict));
        // Not followed by a brace: plain identifier.
        let (heap2, function2) = compile_ok("var dict = 1; dict;");
        assert!(script_ops(&heap2, function2).contains(&OpCode::GetGlobal));
    }

    #[test]
    fn test_invalid_assignment_target() {
        let err = compile_err("1 = 2;");
        assert!(err.to_string().contains("Invalid assignment target."));
    }

    #[test]
    fn test_return_at_top_level() {
        let err = compile_err("return 1;");
        assert!(err.to_string().contains("Can't return from top-level code."));
    }

    #[test]
    fn test_duplicate_local() {
        let err = compile_err("{ var a = 1; var a = 2; }");
        assert!(err
            .to_string()
            .contains("Already a variable with this name in this scope."));
    }

    #[test]
    fn test_use_before_init() {
        let err = compile_err("{ var a = a; }");
        assert!(err
            .to_string()
            .contains("Can't read local variable in its own initializer."));
    }

    #[test]
    fn test_self_inheritance() {
        let err = compile_err("class A < A {}");
        assert!(err.to_string().contains("A class can't inherit from itself."));
    }

    #[test]
    fn test_this_and_super_outside_class() {
        assert!(compile_err("this;")
            .to_string()
            .contains("Can't use 'this' outside of a class."));
        assert!(compile_err("super.x;")
            .to_string()
            .contains("Can't use 'super' outside of a class."));
        assert!(compile_err("class A { m() { return super.m(); } }")
            .to_string()
            .contains("Can't use 'super' in a class with no superclass."));
    }

    #[test]
    fn test_initializer_cannot_return_value() {
        let err = compile_err("class A { init() { return 1; } }");
        assert!(err
            .to_string()
            .contains("Can't return a value from an initializer."));
    }

    #[test]
    fn test_diagnostic_format() {
        let err = compile_err("var = 1;");
        let text = err.to_string();
        assert!(text.starts_with("[line 1] Error at '='"), "got: {text}");
    }

    #[test]
    fn test_error_recovery_collects_multiple() {
        let err = compile_err("var = 1;\nvar = 2;");
        assert_eq!(err.diagnostics.len(), 2);
        assert!(err.diagnostics[1].starts_with("[line 2]"));
    }

    #[test]
    fn test_option_literals() {
        let (heap, function) = compile_ok("some(1); none;");
        let ops = script_ops(&heap, function);
        assert!(ops.contains(&OpCode::Some));
        assert!(ops.contains(&OpCode::None));
    }
}
