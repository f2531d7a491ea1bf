// File: src/compiler.rs
//
// Single-pass Pratt compiler: lexer -> tokens -> statement/expression loop
// -> bytecode, with back-patched jumps and an expression-value stack that
// tracks static types alongside emission. Never materializes an AST —
// every statement and expression is compiled directly to bytecode as it is
// parsed.

use std::collections::HashMap;

use crate::bytecode::{Chunk, OpCode};
use crate::errors::{find_closest_match, CompileError};
use crate::lexer::{Lexer, Token, TokenKind};
use crate::native::{NativeEntry, NativeRegistry};
use crate::rules::{rule_for, Precedence};
use crate::value::{FunctionProto, Value, ValueKind};

const MAX_LOCALS: usize = 16000;
const MAX_UPVALUES: usize = 16000;
const MAX_GLOBALS: usize = 65000;
const MAX_PARAMETERS: usize = 1024;
const MAX_ARGUMENTS: usize = 255;
const MAX_REGISTERS: usize = 256;

/// The static "shape" of an expression's result, tracked alongside
/// `ExpressionData::kind` on the compile-time expression-value stack.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectShape {
    Scalar,
    Array,
    List,
    Function,
    Class(String),
    Enum(String),
    Object(String),
    Unknown,
}

/// A type descriptor pushed onto the expression-value stack for every
/// emitted expression and popped by whatever consumes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExpressionData {
    pub kind: ValueKind,
    pub shape: ObjectShape,
    pub dims: usize,
}

impl ExpressionData {
    fn scalar(kind: ValueKind) -> Self {
        Self { kind, shape: ObjectShape::Scalar, dims: 0 }
    }

    fn unknown() -> Self {
        Self { kind: ValueKind::Nil, shape: ObjectShape::Unknown, dims: 0 }
    }

    fn nil() -> Self {
        Self { kind: ValueKind::Nil, shape: ObjectShape::Scalar, dims: 0 }
    }

    fn is_numeric(&self) -> bool {
        matches!(self.kind, ValueKind::Integer | ValueKind::Float)
    }
}

struct GlobalVar {
    name: String,
    type_desc: ExpressionData,
    is_initialized: bool,
}

struct Local {
    name: String,
    depth: i32,
    is_captured: bool,
    type_desc: ExpressionData,
}

#[derive(Clone)]
struct UpvalueDesc {
    index: u16,
    is_local: bool,
}

/// Per-loop back-patch bookkeeping. `while` patches its own break queue and
/// caches its loop start for `continue`; `for`/`scan` bodies instead rely on
/// the single-byte `OP_BREAK`/`OP_CONTINUE` sentinels their loop executors
/// recognize directly, so they carry no extra state here beyond marking
/// "we're inside one of those".
enum LoopCtx {
    While { loop_start: usize, break_jumps: Vec<usize> },
    ForOrScan,
}

/// One function's compile-time bookkeeping: its own chunk, locals, upvalues,
/// scope depth, and expression-value stack. Functions nest by pushing a new
/// `FunctionState` — the Rust analogue of "chain enclosing := current".
struct FunctionState {
    chunk: Chunk,
    locals: Vec<Local>,
    upvalues: Vec<UpvalueDesc>,
    scope_depth: i32,
    expr_stack: Vec<ExpressionData>,
    loops: Vec<LoopCtx>,
    arity: u8,
    /// `Some(class_name)` while compiling a method body: slot 0 is bound to
    /// `this` with this class's static type instead of being anonymous.
    class_name: Option<String>,
}

impl FunctionState {
    fn new() -> Self {
        Self {
            chunk: Chunk::new(),
            locals: Vec::new(),
            upvalues: Vec::new(),
            scope_depth: 0,
            expr_stack: Vec::new(),
            loops: Vec::new(),
            arity: 0,
            class_name: None,
        }
    }
}

#[derive(Default)]
struct ClassInfo {
    fields: std::collections::HashSet<String>,
    methods: std::collections::HashSet<String>,
}

/// Tracks the most recently compiled bare-variable reference so a trailing
/// postfix `++`/`--` knows which slot to mutate in place — the Pratt
/// postfix hook only sees tokens, not the lvalue the preceding prefix
/// parselet resolved.
#[derive(Clone, Copy)]
enum LValue {
    Local(u16),
    Other,
}

pub struct Compiler<'a> {
    lexer: Lexer<'a>,
    current: Token,
    previous: Token,

    had_error: bool,
    panic_mode: bool,
    errors: Vec<CompileError>,

    globals: Vec<GlobalVar>,
    global_index: HashMap<String, usize>,

    functions: Vec<FunctionState>,

    classes: HashMap<String, ClassInfo>,
    enums: HashMap<String, Vec<String>>,

    named_registers: HashMap<String, u8>,
    register_free: [bool; MAX_REGISTERS],

    last_lvalue: LValue,

    natives: &'a NativeRegistry,
}

impl<'a> Compiler<'a> {
    /// Compiles `source` to a top-level `Chunk` ("the script"), or returns
    /// every collected compile error if `had_error` was ever set.
    pub fn compile(source: &'a str, natives: &'a NativeRegistry) -> Result<Chunk, Vec<CompileError>> {
        let eof = Token { kind: TokenKind::Eof, lexeme: String::new(), line: 0 };
        let mut compiler = Compiler {
            lexer: Lexer::new(source),
            current: eof.clone(),
            previous: eof,
            had_error: false,
            panic_mode: false,
            errors: Vec::new(),
            globals: Vec::new(),
            global_index: HashMap::new(),
            functions: vec![FunctionState::new()],
            classes: HashMap::new(),
            enums: HashMap::new(),
            named_registers: HashMap::new(),
            register_free: [true; MAX_REGISTERS],
            last_lvalue: LValue::Other,
            natives,
        };

        compiler.advance();
        compiler.skip_crs();
        while !compiler.check(TokenKind::Eof) {
            compiler.declaration();
            compiler.skip_crs();
        }

        if compiler.had_error {
            return Err(compiler.errors);
        }

        // Implicit top-level return: the VM treats the script the same way
        // it treats any other closure's frame.
        let line = compiler.previous.line;
        compiler.emit_op(OpCode::Nil, line);
        compiler.emit_op(OpCode::Return, line);

        Ok(compiler.functions.pop().unwrap().chunk)
    }

    // ---------------------------------------------------------------
    // Parser driver
    // ---------------------------------------------------------------

    fn advance(&mut self) {
        self.previous = self.current.clone();
        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }
            let message = self.current.lexeme.clone();
            let line = self.current.line;
            self.push_error(CompileError::lexical(message, line));
        }
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

    fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
            return;
        }
        self.error_at_current(message);
    }

    /// Statements may be separated by one or more `Cr` tokens; callers that
    /// just finished a statement call this to swallow them all.
    fn skip_crs(&mut self) {
        while self.match_token(TokenKind::Cr) {}
    }

    fn push_error(&mut self, err: CompileError) {
        self.had_error = true;
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;
        self.errors.push(err);
    }

    fn error_at_current(&mut self, message: &str) {
        let line = self.current.line;
        self.push_error(CompileError::syntactic(message.to_string(), line));
    }

    fn error(&mut self, message: &str) {
        let line = self.previous.line;
        self.push_error(CompileError::syntactic(message.to_string(), line));
    }

    fn semantic_error(&mut self, message: impl Into<String>) {
        let line = self.previous.line;
        self.push_error(CompileError::semantic(message.into(), line));
    }

    /// Resynchronizes after a panic-mode error at the next block boundary
    /// or statement-terminating `Cr`.
    fn synchronize(&mut self) {
        self.panic_mode = false;
        while !self.check(TokenKind::Eof) {
            if self.previous.kind == TokenKind::Cr || self.previous.kind == TokenKind::RightBrace {
                return;
            }
            match self.current.kind {
                TokenKind::Var
                | TokenKind::If
                | TokenKind::While
                | TokenKind::For
                | TokenKind::Scan
                | TokenKind::Return
                | TokenKind::Class
                | TokenKind::Enum => return,
                _ => self.advance(),
            }
        }
    }

    // ---------------------------------------------------------------
    // Function/scope bookkeeping
    // ---------------------------------------------------------------

    fn current_fn(&mut self) -> &mut FunctionState {
        self.functions.last_mut().expect("function stack never empty")
    }

    fn emit_op(&mut self, op: OpCode, line: u32) {
        self.current_fn().chunk.emit_op(op, line);
    }

    fn emit_u8(&mut self, value: u8) {
        let line = self.previous.line;
        self.current_fn().chunk.emit_u8(value, line);
    }

    fn emit_u16(&mut self, value: u16) {
        let line = self.previous.line;
        self.current_fn().chunk.emit_u16(value, line);
    }

    fn emit_i16(&mut self, value: i16) {
        let line = self.previous.line;
        self.current_fn().chunk.emit_i16(value, line);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        let line = self.previous.line;
        self.current_fn().chunk.emit_jump(op, line)
    }

    fn patch_jump(&mut self, pos: usize) {
        self.current_fn().chunk.patch_jump(pos);
    }

    fn add_constant(&mut self, value: Value) -> u16 {
        match self.current_fn().chunk.add_constant(value) {
            Ok(idx) => idx,
            Err(message) => {
                self.error(&message);
                0
            }
        }
    }

    fn push_expr(&mut self, data: ExpressionData) {
        self.current_fn().expr_stack.push(data);
    }

    fn pop_expr(&mut self) -> ExpressionData {
        self.current_fn().expr_stack.pop().unwrap_or_else(ExpressionData::unknown)
    }

    fn begin_scope(&mut self) {
        self.current_fn().scope_depth += 1;
    }

    /// Ends a scope: releases every local declared at the scope depth that
    /// is ending, emitting `OP_CLOSE_UPVALUE` for captured locals and
    /// `OP_POP` otherwise.
    fn end_scope(&mut self) {
        let line = self.previous.line;
        let depth = self.current_fn().scope_depth;
        while let Some(local) = self.current_fn().locals.last() {
            if local.depth < depth {
                break;
            }
            let captured = local.is_captured;
            let slot = (self.current_fn().locals.len() - 1) as u16;
            self.current_fn().locals.pop();
            if captured {
                self.emit_op(OpCode::CloseUpvalue, line);
                self.emit_u16(slot);
            } else {
                self.emit_op(OpCode::Pop, line);
            }
        }
        self.current_fn().scope_depth -= 1;
    }

    // ---------------------------------------------------------------
    // Declarations
    // ---------------------------------------------------------------

    fn declaration(&mut self) {
        if self.match_token(TokenKind::Var) {
            self.var_declaration();
        } else if self.match_token(TokenKind::Class) {
            self.class_declaration();
        } else if self.match_token(TokenKind::Enum) {
            self.enum_declaration();
        } else {
            self.statement();
        }
        if self.panic_mode {
            self.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expect variable name");
        let name = self.previous.lexeme.clone();

        let declared_type = if self.match_token(TokenKind::Colon) {
            Some(self.parse_type_annotation())
        } else {
            None
        };

        let has_init = self.match_token(TokenKind::Equal);
        let init_type = if has_init {
            self.expression();
            Some(self.pop_expr())
        } else {
            None
        };

        let type_desc = init_type.or(declared_type).unwrap_or_else(ExpressionData::nil);
        if !has_init {
            let line = self.previous.line;
            self.emit_op(OpCode::Nil, line);
        }

        self.declare_and_define(name, type_desc);
        self.end_statement();
    }

    /// Declares `name` with type `type_desc`, assuming its initial value is
    /// already sitting on top of the operand stack: a global at depth 0
    /// (`OP_DEFINE_GLOBAL` for a fresh name, `OP_SET_GLOBAL` for a
    /// redeclaration reusing its slot), otherwise a new local slot.
    fn declare_and_define(&mut self, name: String, type_desc: ExpressionData) {
        if self.current_fn().scope_depth == 0 {
            if self.natives.contains(&name) {
                self.semantic_error(format!("'{name}' collides with a registered native function"));
                return;
            }
            let line = self.previous.line;
            if let Some(&idx) = self.global_index.get(&name) {
                self.globals[idx].type_desc = type_desc;
                self.globals[idx].is_initialized = true;
                self.emit_op(OpCode::SetGlobal, line);
                self.emit_u16(idx as u16);
                // Unlike `OP_DEFINE_GLOBAL`, `OP_SET_GLOBAL` leaves its value
                // on the stack (assignment is an expression elsewhere); this
                // declaration isn't wrapped in an expression statement's
                // trailing `OP_POP`, so emit one here to keep it balanced.
                self.emit_op(OpCode::Pop, line);
                return;
            }
            if self.globals.len() >= MAX_GLOBALS {
                self.semantic_error("too many global variables");
                return;
            }
            let idx = self.globals.len();
            self.global_index.insert(name.clone(), idx);
            self.globals.push(GlobalVar { name, type_desc, is_initialized: true });
            self.emit_op(OpCode::DefineGlobal, line);
            self.emit_u16(idx as u16);
        } else {
            self.add_local(name, type_desc);
            // The initializer value is already on the stack at exactly the
            // new local's slot; nothing further needs emitting.
        }
    }

    fn add_local(&mut self, name: String, type_desc: ExpressionData) {
        let depth = self.current_fn().scope_depth;
        if self
            .current_fn()
            .locals
            .iter()
            .rev()
            .take_while(|l| l.depth == depth)
            .any(|l| l.name == name)
        {
            self.semantic_error(format!("'{name}' is already declared in this scope"));
            return;
        }
        if self.current_fn().locals.len() >= MAX_LOCALS {
            self.semantic_error("too many local variables in one function");
            return;
        }
        self.current_fn().locals.push(Local { name, depth, is_captured: false, type_desc });
    }

    /// Parses `int | float | string | bool | byte | list | array | func |
    /// class | enum | <EnumOrClassName>`, optionally followed by one or
    /// more `[,..]` dimension markers for an array type.
    fn parse_type_annotation(&mut self) -> ExpressionData {
        let kind_token = self.current.kind;
        let name = self.current.lexeme.clone();
        self.advance();
        let mut data = match kind_token {
            TokenKind::Identifier if name == "int" => ExpressionData::scalar(ValueKind::Integer),
            TokenKind::Identifier if name == "float" => ExpressionData::scalar(ValueKind::Float),
            TokenKind::Identifier if name == "string" => ExpressionData::scalar(ValueKind::String),
            TokenKind::Identifier if name == "bool" => ExpressionData::scalar(ValueKind::Bool),
            TokenKind::Identifier if name == "byte" => ExpressionData::scalar(ValueKind::Byte),
            TokenKind::Func => ExpressionData { kind: ValueKind::Closure, shape: ObjectShape::Function, dims: 0 },
            TokenKind::List => ExpressionData { kind: ValueKind::List, shape: ObjectShape::List, dims: 0 },
            TokenKind::Array => ExpressionData { kind: ValueKind::Array, shape: ObjectShape::Array, dims: 1 },
            TokenKind::Class => ExpressionData { kind: ValueKind::Class, shape: ObjectShape::Unknown, dims: 0 },
            TokenKind::Enum => ExpressionData { kind: ValueKind::Enum, shape: ObjectShape::Unknown, dims: 0 },
            TokenKind::Identifier if self.classes.contains_key(&name) => {
                ExpressionData { kind: ValueKind::Instance, shape: ObjectShape::Object(name), dims: 0 }
            }
            TokenKind::Identifier if self.enums.contains_key(&name) => {
                ExpressionData { kind: ValueKind::Enum, shape: ObjectShape::Enum(name), dims: 0 }
            }
            _ => {
                self.error("expected a type name");
                ExpressionData::unknown()
            }
        };
        let mut dims = if matches!(data.shape, ObjectShape::Array) && data.dims > 0 { 1 } else { 0 };
        while self.check(TokenKind::LeftBracket) {
            self.advance();
            dims += 1;
            while self.match_token(TokenKind::Comma) {
                dims += 1;
            }
            self.consume(TokenKind::RightBracket, "expect ']' after array dimensions");
            data.shape = ObjectShape::Array;
            data.kind = ValueKind::Array;
        }
        data.dims = dims;
        data
    }

    // ---------------------------------------------------------------
    // Classes
    // ---------------------------------------------------------------

    fn class_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expect class name");
        let class_name = self.previous.lexeme.clone();
        self.classes.insert(class_name.clone(), ClassInfo::default());

        let line = self.previous.line;
        self.emit_op(OpCode::Class, line);

        self.consume(TokenKind::LeftBrace, "expect '{' before class body");
        self.skip_crs();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.class_member(&class_name);
            self.skip_crs();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after class body");

        self.declare_and_define(
            class_name.clone(),
            ExpressionData { kind: ValueKind::Class, shape: ObjectShape::Class(class_name), dims: 0 },
        );
        self.end_statement();
    }

    fn class_member(&mut self, class_name: &str) {
        // Optional visibility modifier; the core doesn't enforce access
        // control, only records member existence for `new`/`.`/method calls.
        if matches!(self.current.kind, TokenKind::Public | TokenKind::Private | TokenKind::Protected) {
            self.advance();
        }

        if !self.check(TokenKind::Identifier) {
            self.error_at_current("expect a field or method name in class body");
            self.advance();
            return;
        }
        self.advance();
        let member_name = self.previous.lexeme.clone();

        if self.check(TokenKind::LeftParen) {
            // Method: `name(params) [retType] { body }`.
            let (proto, upvalues) = self.compile_function(member_name.clone(), Some(class_name.to_string()));
            let line = self.previous.line;
            self.emit_closure(proto, upvalues, line);
            let name_idx = self.add_constant(Value::string(member_name.clone()));
            self.emit_op(OpCode::BindProperty, line);
            self.emit_u16(name_idx);
            if let Some(info) = self.classes.get_mut(class_name) {
                info.methods.insert(member_name);
            }
        } else {
            // Field: `name : type [= expr]`.
            self.consume(TokenKind::Colon, "expect ':' before field type");
            self.parse_type_annotation();
            if self.match_token(TokenKind::Equal) {
                self.expression();
                self.pop_expr();
            } else {
                let line = self.previous.line;
                self.emit_op(OpCode::Nil, line);
            }
            let name_idx = self.add_constant(Value::string(member_name.clone()));
            let line = self.previous.line;
            self.emit_op(OpCode::BindProperty, line);
            self.emit_u16(name_idx);
            if let Some(info) = self.classes.get_mut(class_name) {
                info.fields.insert(member_name);
            }
        }
    }

    // ---------------------------------------------------------------
    // Enums
    // ---------------------------------------------------------------

    fn enum_declaration(&mut self) {
        self.consume(TokenKind::Identifier, "expect enum name");
        let name = self.previous.lexeme.clone();
        self.consume(TokenKind::LeftBrace, "expect '{' before enum body");
        self.skip_crs();
        let mut variants = Vec::new();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.consume(TokenKind::Identifier, "expect enum variant name");
            variants.push(self.previous.lexeme.clone());
            self.skip_crs();
            self.match_token(TokenKind::Comma);
            self.skip_crs();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after enum body");
        if variants.len() > 255 {
            self.semantic_error("enum has more than 255 variants");
        }
        self.enums.insert(name, variants);
        self.end_statement();
    }

    // ---------------------------------------------------------------
    // Statements
    // ---------------------------------------------------------------

    fn end_statement(&mut self) {
        if !self.check(TokenKind::Eof) && !self.check(TokenKind::RightBrace) {
            self.match_token(TokenKind::Cr);
        }
    }

    fn statement(&mut self) {
        match self.current.kind {
            TokenKind::If => {
                self.advance();
                self.if_statement();
            }
            TokenKind::While => {
                self.advance();
                self.while_statement();
            }
            TokenKind::For => {
                self.advance();
                self.for_statement();
            }
            TokenKind::Scan => {
                self.advance();
                self.scan_statement();
            }
            TokenKind::Switch => {
                self.advance();
                self.switch_statement();
            }
            TokenKind::Case => {
                self.advance();
                self.case_statement();
            }
            TokenKind::Break => {
                self.advance();
                self.break_statement();
            }
            TokenKind::Continue => {
                self.advance();
                self.continue_statement();
            }
            TokenKind::Return => {
                self.advance();
                self.return_statement();
            }
            TokenKind::Print => {
                self.advance();
                self.print_statement();
            }
            TokenKind::LeftBrace => {
                self.advance();
                self.begin_scope();
                self.block();
                self.end_scope();
            }
            TokenKind::Create => {
                self.advance();
                self.create_table_statement();
            }
            TokenKind::Insert => {
                self.advance();
                self.insert_statement();
            }
            TokenKind::Cr => self.advance(),
            _ => self.expression_statement(),
        }
    }

    fn block(&mut self) {
        self.skip_crs();
        while !self.check(TokenKind::RightBrace) && !self.check(TokenKind::Eof) {
            self.declaration();
            self.skip_crs();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after block");
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.pop_expr();
        let line = self.previous.line;
        self.emit_op(OpCode::Pop, line);
        self.end_statement();
    }

    fn print_statement(&mut self) {
        self.expression();
        self.pop_expr();
        let line = self.previous.line;
        self.emit_op(OpCode::Print, line);
        self.end_statement();
    }

    fn if_statement(&mut self) {
        self.expression();
        self.pop_expr();
        let line = self.previous.line;
        let then_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop, line);
        self.statement();
        let else_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(then_jump);
        self.emit_op(OpCode::Pop, line);
        self.skip_crs();
        if self.match_token(TokenKind::Else) {
            self.statement();
        }
        self.patch_jump(else_jump);
    }

    fn while_statement(&mut self) {
        let loop_start = self.current_fn().chunk.byte_len();
        self.current_fn().loops.push(LoopCtx::While { loop_start, break_jumps: Vec::new() });

        self.expression();
        self.pop_expr();
        let line = self.previous.line;
        let exit_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop, line);
        self.statement();
        let line = self.previous.line;
        self.current_fn().chunk.emit_loop(loop_start, line);

        self.patch_jump(exit_jump);
        self.emit_op(OpCode::Pop, line);

        if let Some(LoopCtx::While { break_jumps, .. }) = self.current_fn().loops.pop() {
            for jump in break_jumps {
                self.patch_jump(jump);
            }
        }
    }

    /// `for i = a to b [step s] { body }`. Register-allocates an integer
    /// slot for `i` and emits `OP_FOR_LOOP` with a body-byte-count operand
    /// back-patched once the body has been compiled.
    fn for_statement(&mut self) {
        self.consume(TokenKind::Identifier, "expect loop variable name");
        let var_name = self.previous.lexeme.clone();
        self.consume(TokenKind::Equal, "expect '=' after for-loop variable");

        self.expression();
        self.pop_expr();
        self.consume(TokenKind::To, "expect 'to' in for-loop range");
        self.expression();
        self.pop_expr();
        if self.match_token(TokenKind::Step) {
            self.expression();
            self.pop_expr();
        } else {
            let line = self.previous.line;
            self.emit_integer_literal(1, line);
            self.pop_expr();
        }

        let register = self.alloc_register(var_name.clone()).unwrap_or_else(|| {
            self.semantic_error("no free integer registers for 'for' loop");
            0
        });

        let line = self.previous.line;
        self.emit_op(OpCode::ForLoop, line);
        self.emit_u8(register);
        let body_len_pos = self.current_fn().chunk.byte_len();
        self.emit_u16(9999);

        self.current_fn().loops.push(LoopCtx::ForOrScan);
        self.statement();
        self.current_fn().loops.pop();

        let body_len = self.current_fn().chunk.byte_len() - (body_len_pos + 2);
        self.current_fn().chunk.code[body_len_pos..body_len_pos + 2]
            .copy_from_slice(&(body_len as u16).to_be_bytes());

        self.free_register(&var_name);
    }

    /// `scan arr to v { body }`: iterates `arr`'s elements, writing each
    /// into local `v`. A counter register tracks the iteration index.
    fn scan_statement(&mut self) {
        self.expression();
        self.pop_expr();
        self.consume(TokenKind::To, "expect 'to' in scan statement");
        self.consume(TokenKind::Identifier, "expect scan target name");
        let target_name = self.previous.lexeme.clone();

        self.begin_scope();
        let line = self.previous.line;
        self.emit_op(OpCode::Nil, line);
        self.add_local(target_name, ExpressionData::unknown());
        let target_slot = (self.current_fn().locals.len() - 1) as u16;

        let counter_name = format!("__scan_{target_slot}");
        let counter_register = self.alloc_register(counter_name.clone()).unwrap_or_else(|| {
            self.semantic_error("no free integer registers for 'scan' loop");
            0
        });

        self.emit_op(OpCode::Scan, line);
        self.emit_u16(target_slot);
        self.emit_u8(counter_register);
        let body_len_pos = self.current_fn().chunk.byte_len();
        self.emit_u16(9999);

        self.current_fn().loops.push(LoopCtx::ForOrScan);
        self.statement();
        self.current_fn().loops.pop();

        let body_len = self.current_fn().chunk.byte_len() - (body_len_pos + 2);
        self.current_fn().chunk.code[body_len_pos..body_len_pos + 2]
            .copy_from_slice(&(body_len as u16).to_be_bytes());

        self.free_register(&counter_name);
        self.end_scope();
    }

    fn break_statement(&mut self) {
        let line = self.previous.line;
        match self.current_fn().loops.last() {
            Some(LoopCtx::While { .. }) => {
                let jump = self.emit_jump(OpCode::Jump);
                if let Some(LoopCtx::While { break_jumps, .. }) = self.current_fn().loops.last_mut() {
                    break_jumps.push(jump);
                }
            }
            Some(LoopCtx::ForOrScan) => {
                self.emit_op(OpCode::Break, line);
            }
            None => self.semantic_error("'break' outside of a loop"),
        }
        self.end_statement();
    }

    fn continue_statement(&mut self) {
        let line = self.previous.line;
        match self.current_fn().loops.last() {
            Some(LoopCtx::While { loop_start, .. }) => {
                let loop_start = *loop_start;
                self.current_fn().chunk.emit_loop(loop_start, line);
            }
            Some(LoopCtx::ForOrScan) => {
                self.emit_op(OpCode::Continue, line);
            }
            None => self.semantic_error("'continue' outside of a loop"),
        }
        self.end_statement();
    }

    fn return_statement(&mut self) {
        let line = self.previous.line;
        if self.check(TokenKind::Cr) || self.check(TokenKind::RightBrace) || self.check(TokenKind::Eof) {
            self.emit_op(OpCode::Nil, line);
        } else {
            self.expression();
            self.pop_expr();
        }
        self.emit_op(OpCode::Return, line);
        self.end_statement();
    }

    /// `switch <expr> { when <expr> { stmts } ... [default { stmts }] }`.
    /// The subject is snapshotted into a reserved local so every `when` arm
    /// can re-read it without re-evaluating a possibly side-effectful
    /// expression.
    fn switch_statement(&mut self) {
        self.expression();
        self.pop_expr();
        self.begin_scope();
        self.add_local("$switch".to_string(), ExpressionData::unknown());
        let subject_slot = (self.current_fn().locals.len() - 1) as u16;

        self.skip_crs();
        self.consume(TokenKind::LeftBrace, "expect '{' after switch subject");
        self.skip_crs();

        let mut end_jumps = Vec::new();
        while self.match_token(TokenKind::When) {
            let line = self.previous.line;
            self.emit_get_local(subject_slot, line);
            self.expression();
            self.pop_expr();
            self.emit_op(OpCode::Equal, line);
            let skip_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop, line);
            self.skip_crs();
            self.consume(TokenKind::LeftBrace, "expect '{' after 'when' condition");
            self.begin_scope();
            self.block();
            self.end_scope();
            let end_jump = self.emit_jump(OpCode::Jump);
            end_jumps.push(end_jump);
            self.patch_jump(skip_jump);
            self.emit_op(OpCode::Pop, line);
            self.skip_crs();
        }
        if self.match_token(TokenKind::Default) {
            self.skip_crs();
            self.consume(TokenKind::LeftBrace, "expect '{' after default");
            self.begin_scope();
            self.block();
            self.end_scope();
            self.skip_crs();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after switch body");
        for jump in end_jumps {
            self.patch_jump(jump);
        }
        self.end_scope(); // pops the subject local
    }

    /// `case { when <expr> { stmts } ... [default { stmts }] }`: like
    /// `switch` but each `when` tests the boolean result of its own
    /// expression directly, with no subject value at all.
    fn case_statement(&mut self) {
        self.skip_crs();
        self.consume(TokenKind::LeftBrace, "expect '{' after 'case'");
        self.skip_crs();
        let mut end_jumps = Vec::new();
        while self.match_token(TokenKind::When) {
            self.expression();
            self.pop_expr();
            let line = self.previous.line;
            let skip_jump = self.emit_jump(OpCode::JumpIfFalse);
            self.emit_op(OpCode::Pop, line);
            self.skip_crs();
            self.consume(TokenKind::LeftBrace, "expect '{' after 'when' condition");
            self.begin_scope();
            self.block();
            self.end_scope();
            let end_jump = self.emit_jump(OpCode::Jump);
            end_jumps.push(end_jump);
            self.patch_jump(skip_jump);
            self.emit_op(OpCode::Pop, line);
            self.skip_crs();
        }
        if self.match_token(TokenKind::Default) {
            self.skip_crs();
            self.consume(TokenKind::LeftBrace, "expect '{' after default");
            self.begin_scope();
            self.block();
            self.end_scope();
            self.skip_crs();
        }
        self.consume(TokenKind::RightBrace, "expect '}' after case body");
        for jump in end_jumps {
            self.patch_jump(jump);
        }
    }

    // ---------------------------------------------------------------
    // SQL statements
    // ---------------------------------------------------------------

    fn create_table_statement(&mut self) {
        self.consume(TokenKind::Table, "expect 'table' after 'create'");
        self.consume(TokenKind::Identifier, "expect table name");
        let table_name = self.previous.lexeme.clone();
        self.consume(TokenKind::LeftParen, "expect '(' after table name");
        let mut columns = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                self.consume(TokenKind::Identifier, "expect column name");
                let col_name = self.previous.lexeme.clone();
                let col_type = self.parse_sql_type();
                columns.push(format!("{col_name} {col_type}"));
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after column list");
        let sql = format!("CREATE TABLE {table_name} ({})", columns.join(", "));
        let idx = self.add_constant(Value::string(sql));
        let line = self.previous.line;
        self.emit_op(OpCode::CreateTable, line);
        self.emit_u16(idx);
        self.end_statement();
    }

    fn parse_sql_type(&mut self) -> &'static str {
        if !self.check(TokenKind::Identifier) {
            self.error_at_current("expect a column type");
            return "TEXT";
        }
        let name = self.current.lexeme.clone();
        self.advance();
        match name.as_str() {
            "int" => "INTEGER",
            "float" => "REAL",
            "string" => "TEXT",
            "bool" => "INTEGER",
            _ => "TEXT",
        }
    }

    fn insert_statement(&mut self) {
        self.consume(TokenKind::Into, "expect 'into' after 'insert'");
        self.consume(TokenKind::Identifier, "expect table name");
        let table_name = self.previous.lexeme.clone();

        let mut columns = Vec::new();
        if self.match_token(TokenKind::LeftParen) {
            if !self.check(TokenKind::RightParen) {
                loop {
                    self.consume(TokenKind::Identifier, "expect column name");
                    columns.push(self.previous.lexeme.clone());
                    if !self.match_token(TokenKind::Comma) {
                        break;
                    }
                }
            }
            self.consume(TokenKind::RightParen, "expect ')' after column list");
        }

        self.consume(TokenKind::Values, "expect 'values' in insert statement");
        self.consume(TokenKind::LeftParen, "expect '(' before value list");
        let mut literals = Vec::new();
        if !self.check(TokenKind::RightParen) {
            loop {
                literals.push(self.parse_sql_literal());
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after value list");

        let column_clause =
            if columns.is_empty() { String::new() } else { format!(" ({})", columns.join(", ")) };
        let sql = format!("INSERT INTO {table_name}{column_clause} VALUES ({})", literals.join(", "));
        let idx = self.add_constant(Value::string(sql));
        let line = self.previous.line;
        self.emit_op(OpCode::Insert, line);
        self.emit_u16(idx);
        self.end_statement();
    }

    /// Parses one literal in an `INSERT ... VALUES (...)` list and renders
    /// it straight into the SQL text constant — the grammar only allows
    /// literal values here, so interpolation happens at compile time.
    fn parse_sql_literal(&mut self) -> String {
        match self.current.kind {
            TokenKind::Integer | TokenKind::Float => {
                let text = self.current.lexeme.clone();
                self.advance();
                text
            }
            TokenKind::Str => {
                let text = self.current.lexeme.clone();
                self.advance();
                format!("'{}'", text.replace('\'', "''"))
            }
            TokenKind::True => {
                self.advance();
                "1".to_string()
            }
            TokenKind::False => {
                self.advance();
                "0".to_string()
            }
            _ => {
                self.error_at_current("expect a literal value in 'insert'");
                self.advance();
                "NULL".to_string()
            }
        }
    }

    /// `select cols from T`, usable as both a statement and an expression
    /// (reached through `Select`'s prefix parselet); the statement form
    /// simply discards the result via the surrounding expression statement.
    fn select_expr(&mut self) -> ExpressionData {
        let mut columns = Vec::new();
        if self.match_token(TokenKind::Star) {
            columns.push("*".to_string());
        } else {
            loop {
                self.consume(TokenKind::Identifier, "expect column name");
                columns.push(self.previous.lexeme.clone());
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::From, "expect 'from' in select statement");
        self.consume(TokenKind::Identifier, "expect table name");
        let table_name = self.previous.lexeme.clone();
        let sql = format!("SELECT {} FROM {table_name}", columns.join(", "));
        let idx = self.add_constant(Value::string(sql));
        let line = self.previous.line;
        self.emit_op(OpCode::SqlSelect, line);
        self.emit_u16(idx);
        ExpressionData { kind: ValueKind::DataFrame, shape: ObjectShape::Unknown, dims: 0 }
    }

    // ---------------------------------------------------------------
    // Expressions: Pratt driver
    // ---------------------------------------------------------------

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        self.advance();
        let prefix_tok = self.previous.kind;
        if !rule_for(prefix_tok).prefix {
            self.error("expect expression");
            self.push_expr(ExpressionData::unknown());
            return;
        }
        let can_assign = precedence <= Precedence::Assignment;
        self.prefix(prefix_tok, can_assign);

        loop {
            let cur_rule = rule_for(self.current.kind);
            if precedence > cur_rule.precedence {
                break;
            }
            self.advance();
            let tok = self.previous.kind;
            let rule = rule_for(tok);
            if rule.infix {
                self.infix(tok, can_assign);
            }
            if rule.postfix {
                self.postfix(tok);
            }
        }

        if can_assign && self.match_token(TokenKind::Equal) {
            self.error("invalid assignment target");
        }
    }

    fn prefix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Integer => self.number_literal(),
            TokenKind::Float => self.float_literal(),
            TokenKind::Str => self.string_literal(),
            TokenKind::True => self.bool_literal(true),
            TokenKind::False => self.bool_literal(false),
            TokenKind::Nil => self.nil_literal(),
            TokenKind::LeftParen => self.grouping(),
            TokenKind::Minus | TokenKind::Bang | TokenKind::Not => self.unary(kind),
            TokenKind::Identifier => self.identifier_expr(can_assign),
            TokenKind::This => self.this_expr(),
            TokenKind::New => self.new_expr(),
            TokenKind::Func => self.func_expr(),
            TokenKind::AtBracket => self.array_literal(),
            TokenKind::AtBrace => self.list_literal(),
            TokenKind::Select => {
                let data = self.select_expr();
                self.push_expr(data);
            }
            TokenKind::Dollar => {
                self.error("'$key' without a preceding receiver is not supported; use 'receiver$key'");
                self.push_expr(ExpressionData::unknown());
            }
            _ => {
                self.error("expect expression");
                self.push_expr(ExpressionData::unknown());
            }
        }
    }

    fn infix(&mut self, kind: TokenKind, can_assign: bool) {
        match kind {
            TokenKind::Plus
            | TokenKind::Minus
            | TokenKind::Star
            | TokenKind::Slash
            | TokenKind::Percent => self.binary(kind),
            TokenKind::BangEqual
            | TokenKind::EqualEqual
            | TokenKind::Greater
            | TokenKind::GreaterEqual
            | TokenKind::Less
            | TokenKind::LessEqual => self.comparison(kind),
            TokenKind::And => self.and_expr(),
            TokenKind::Or => self.or_expr(),
            TokenKind::LeftParen => self.call_expr(),
            TokenKind::LeftBracket => self.index_expr(can_assign),
            TokenKind::Dot => self.dot_expr(can_assign),
            TokenKind::Dollar => self.dollar_expr(can_assign),
            TokenKind::DoubleColon => self.double_colon_expr(),
            _ => self.error("unexpected infix operator"),
        }
    }

    fn postfix(&mut self, kind: TokenKind) {
        let line = self.previous.line;
        let data = self.pop_expr();
        if data.kind != ValueKind::Integer {
            self.semantic_error("'++'/'--' only apply to integer variables");
            self.push_expr(data);
            return;
        }
        match self.last_lvalue {
            LValue::Local(slot) => {
                let op = if kind == TokenKind::PlusPlus { OpCode::Increment } else { OpCode::Decrement };
                self.emit_op(op, line);
                self.emit_u16(slot);
            }
            LValue::Other => {
                self.semantic_error("'++'/'--' require a local variable operand");
            }
        }
        self.push_expr(data);
    }

    // ---------------------------------------------------------------
    // Literal / primary expressions
    // ---------------------------------------------------------------

    fn number_literal(&mut self) {
        let text = self.previous.lexeme.clone();
        let line = self.previous.line;
        let value: i64 = text.parse().unwrap_or(0);
        self.emit_integer_literal(value, line);
    }

    fn emit_integer_literal(&mut self, value: i64, line: u32) {
        match value {
            0 => self.emit_op(OpCode::Push0, line),
            1 => self.emit_op(OpCode::Push1, line),
            2 => self.emit_op(OpCode::Push2, line),
            3 => self.emit_op(OpCode::Push3, line),
            4 => self.emit_op(OpCode::Push4, line),
            5 => self.emit_op(OpCode::Push5, line),
            _ => {
                let idx = self.add_constant(Value::Integer(value));
                self.emit_op(OpCode::Constant, line);
                self.emit_u16(idx);
            }
        }
        self.push_expr(ExpressionData::scalar(ValueKind::Integer));
        self.last_lvalue = LValue::Other;
    }

    fn float_literal(&mut self) {
        let text = self.previous.lexeme.clone();
        let line = self.previous.line;
        let value: f64 = text.parse().unwrap_or(0.0);
        let idx = self.add_constant(Value::Float(value));
        self.emit_op(OpCode::Constant, line);
        self.emit_u16(idx);
        self.push_expr(ExpressionData::scalar(ValueKind::Float));
        self.last_lvalue = LValue::Other;
    }

    fn string_literal(&mut self) {
        let text = self.previous.lexeme.clone();
        let line = self.previous.line;
        let idx = self.add_constant(Value::string(text));
        self.emit_op(OpCode::Constant, line);
        self.emit_u16(idx);
        self.push_expr(ExpressionData::scalar(ValueKind::String));
        self.last_lvalue = LValue::Other;
    }

    fn bool_literal(&mut self, value: bool) {
        let line = self.previous.line;
        self.emit_op(if value { OpCode::True } else { OpCode::False }, line);
        self.push_expr(ExpressionData::scalar(ValueKind::Bool));
        self.last_lvalue = LValue::Other;
    }

    fn nil_literal(&mut self) {
        let line = self.previous.line;
        self.emit_op(OpCode::Nil, line);
        self.push_expr(ExpressionData::nil());
        self.last_lvalue = LValue::Other;
    }

    fn grouping(&mut self) {
        self.expression();
        self.consume(TokenKind::RightParen, "expect ')' after expression");
    }

    fn unary(&mut self, op: TokenKind) {
        let line = self.previous.line;
        self.parse_precedence(Precedence::Unary);
        let operand = self.pop_expr();
        match op {
            TokenKind::Minus => {
                let emitted = match operand.kind {
                    ValueKind::Integer => OpCode::INegate,
                    ValueKind::Float => OpCode::FNegate,
                    _ => OpCode::Negate,
                };
                self.emit_op(emitted, line);
                self.push_expr(operand);
            }
            TokenKind::Bang | TokenKind::Not => {
                self.emit_op(OpCode::Not, line);
                self.push_expr(ExpressionData::scalar(ValueKind::Bool));
            }
            _ => unreachable!("unary dispatch only ever sees Minus/Bang/Not"),
        }
        self.last_lvalue = LValue::Other;
    }

    fn binary(&mut self, op: TokenKind) {
        let line = self.previous.line;
        let rule = rule_for(op);
        self.parse_precedence(rule.precedence.next());
        let rhs = self.pop_expr();
        let lhs = self.pop_expr();

        let both_int = lhs.kind == ValueKind::Integer && rhs.kind == ValueKind::Integer;
        let both_float = lhs.kind == ValueKind::Float && rhs.kind == ValueKind::Float;
        let either_string = lhs.kind == ValueKind::String || rhs.kind == ValueKind::String;

        if op == TokenKind::Plus && either_string {
            self.emit_op(OpCode::SAdd, line);
            self.push_expr(ExpressionData::scalar(ValueKind::String));
            self.last_lvalue = LValue::Other;
            return;
        }

        let opcode = match (op, both_int, both_float) {
            (TokenKind::Plus, true, _) => OpCode::IAdd,
            (TokenKind::Plus, _, true) => OpCode::FAdd,
            (TokenKind::Plus, false, false) => OpCode::Add,
            (TokenKind::Minus, true, _) => OpCode::ISub,
            (TokenKind::Minus, _, true) => OpCode::FSub,
            (TokenKind::Minus, false, false) => OpCode::Sub,
            (TokenKind::Star, true, _) => OpCode::IMul,
            (TokenKind::Star, _, true) => OpCode::FMul,
            (TokenKind::Star, false, false) => OpCode::Mul,
            (TokenKind::Slash, true, _) => OpCode::IDiv,
            (TokenKind::Slash, _, true) => OpCode::FDiv,
            (TokenKind::Slash, false, false) => OpCode::Div,
            (TokenKind::Percent, true, _) => OpCode::IMod,
            (TokenKind::Percent, _, _) => {
                if lhs.is_numeric() && rhs.is_numeric() {
                    self.semantic_error("'%' requires integer operands");
                }
                OpCode::IMod
            }
            _ => unreachable!("binary dispatch only ever sees arithmetic tokens"),
        };
        self.emit_op(opcode, line);

        let result_kind = if both_int {
            ValueKind::Integer
        } else if both_float {
            ValueKind::Float
        } else {
            ValueKind::Nil
        };
        self.push_expr(ExpressionData::scalar(result_kind));
        self.last_lvalue = LValue::Other;
    }

    fn comparison(&mut self, op: TokenKind) {
        let line = self.previous.line;
        let rule = rule_for(op);
        self.parse_precedence(rule.precedence.next());
        let rhs = self.pop_expr();
        let lhs = self.pop_expr();

        if matches!(op, TokenKind::Greater | TokenKind::GreaterEqual | TokenKind::Less | TokenKind::LessEqual) {
            let orderable = |d: &ExpressionData| {
                matches!(
                    d.kind,
                    ValueKind::Integer | ValueKind::Float | ValueKind::String | ValueKind::Bool | ValueKind::Byte
                )
            };
            if !orderable(&lhs) || !orderable(&rhs) {
                self.semantic_error(format!("cannot order values of kind {} and {}", lhs.kind, rhs.kind));
            }
        }

        let opcode = match op {
            TokenKind::BangEqual => OpCode::NotEqual,
            TokenKind::EqualEqual => OpCode::Equal,
            TokenKind::Greater => OpCode::Greater,
            TokenKind::GreaterEqual => OpCode::GreaterEqual,
            TokenKind::Less => OpCode::Less,
            TokenKind::LessEqual => OpCode::LessEqual,
            _ => unreachable!(),
        };
        self.emit_op(opcode, line);
        self.push_expr(ExpressionData::scalar(ValueKind::Bool));
        self.last_lvalue = LValue::Other;
    }

    fn and_expr(&mut self) {
        let line = self.previous.line;
        self.pop_expr();
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit_op(OpCode::Pop, line);
        self.parse_precedence(Precedence::And);
        self.pop_expr();
        self.patch_jump(end_jump);
        self.push_expr(ExpressionData::scalar(ValueKind::Bool));
        self.last_lvalue = LValue::Other;
    }

    fn or_expr(&mut self) {
        let line = self.previous.line;
        self.pop_expr();
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit_op(OpCode::Pop, line);
        self.parse_precedence(Precedence::Or);
        self.pop_expr();
        self.patch_jump(end_jump);
        self.push_expr(ExpressionData::scalar(ValueKind::Bool));
        self.last_lvalue = LValue::Other;
    }

    // ---------------------------------------------------------------
    // Calls, indexing, properties, enums, lists, arrays
    // ---------------------------------------------------------------

    fn argument_list(&mut self) -> usize {
        let mut argc = 0usize;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.expression();
                self.pop_expr();
                argc += 1;
                if argc > MAX_ARGUMENTS {
                    self.semantic_error("cannot have more than 255 arguments");
                }
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after arguments");
        argc
    }

    fn call_expr(&mut self) {
        let line = self.previous.line;
        self.pop_expr(); // callee
        let argc = self.argument_list();
        match argc {
            0 => self.emit_op(OpCode::Call0, line),
            1 => self.emit_op(OpCode::Call1, line),
            2 => self.emit_op(OpCode::Call2, line),
            3 => self.emit_op(OpCode::Call3, line),
            n => {
                self.emit_op(OpCode::Call, line);
                self.emit_u8(n as u8);
            }
        }
        self.push_expr(ExpressionData::unknown());
        self.last_lvalue = LValue::Other;
    }

    fn index_expr(&mut self, can_assign: bool) {
        let line = self.previous.line;
        let mut dims: u8 = 0;
        loop {
            self.expression();
            self.pop_expr();
            dims += 1;
            if !self.match_token(TokenKind::Comma) {
                break;
            }
        }
        self.consume(TokenKind::RightBracket, "expect ']' after index");

        self.pop_expr(); // array
        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            let value = self.pop_expr();
            self.emit_op(OpCode::SetAIndex, line);
            self.emit_u8(dims);
            self.push_expr(value);
        } else {
            self.emit_op(OpCode::AIndex, line);
            self.emit_u8(dims);
            self.push_expr(ExpressionData::unknown());
        }
        self.last_lvalue = LValue::Other;
    }

    fn dot_expr(&mut self, can_assign: bool) {
        let line = self.previous.line;
        let receiver = self.pop_expr();
        self.consume(TokenKind::Identifier, "expect property name after '.'");
        let name = self.previous.lexeme.clone();
        if let ObjectShape::Object(class_name) = &receiver.shape {
            if let Some(info) = self.classes.get(class_name) {
                if !info.fields.contains(&name) && !info.methods.contains(&name) {
                    let mut candidates: Vec<String> = info.fields.iter().cloned().collect();
                    candidates.extend(info.methods.iter().cloned());
                    let hint = find_closest_match(&name, &candidates)
                        .map(|s| format!(" (did you mean '{s}'?)"))
                        .unwrap_or_default();
                    self.semantic_error(format!("'{class_name}' has no member '{name}'{hint}"));
                }
            }
        }
        let name_idx = self.add_constant(Value::string(name));

        if self.check(TokenKind::LeftParen) {
            self.advance();
            let argc = self.argument_list();
            self.emit_op(OpCode::CallMethod, line);
            self.emit_u16(name_idx);
            self.emit_u16(argc as u16);
            self.push_expr(ExpressionData::unknown());
        } else if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            let value = self.pop_expr();
            self.emit_op(OpCode::SetProperty, line);
            self.emit_u16(name_idx);
            self.push_expr(value);
        } else {
            self.emit_op(OpCode::GetProperty, line);
            self.emit_u16(name_idx);
            self.push_expr(ExpressionData::unknown());
        }
        self.last_lvalue = LValue::Other;
    }

    fn dollar_expr(&mut self, can_assign: bool) {
        let line = self.previous.line;
        self.pop_expr(); // receiver list
        self.consume(TokenKind::Identifier, "expect key name after '$'");
        let key_name = self.previous.lexeme.clone();
        let key_idx = self.add_constant(Value::string(key_name));
        self.emit_op(OpCode::Constant, line);
        self.emit_u16(key_idx);

        if can_assign && self.match_token(TokenKind::Equal) {
            self.expression();
            let value = self.pop_expr();
            self.emit_op(OpCode::SetKey, line);
            self.push_expr(value);
        } else {
            self.emit_op(OpCode::GetKey, line);
            self.push_expr(ExpressionData::unknown());
        }
        self.last_lvalue = LValue::Other;
    }

    fn double_colon_expr(&mut self) {
        let line = self.previous.line;
        let receiver = self.pop_expr();
        let enum_name = match &receiver.shape {
            ObjectShape::Enum(name) => name.clone(),
            _ => {
                self.semantic_error("'::' requires an enum name on its left");
                String::new()
            }
        };
        self.consume(TokenKind::Identifier, "expect variant name after '::'");
        let variant = self.previous.lexeme.clone();
        let known = self.enums.get(&enum_name).cloned().unwrap_or_default();
        if !enum_name.is_empty() && !known.contains(&variant) {
            let hint = find_closest_match(&variant, &known)
                .map(|s| format!(" (did you mean '{s}'?)"))
                .unwrap_or_default();
            self.semantic_error(format!("unknown variant '{variant}' on enum '{enum_name}'{hint}"));
        }
        let name_idx = self.add_constant(Value::string(variant));
        self.emit_op(OpCode::EnumTag, line);
        self.emit_u16(name_idx);
        self.push_expr(ExpressionData { kind: ValueKind::Enum, shape: ObjectShape::Enum(enum_name), dims: 0 });
        self.last_lvalue = LValue::Other;
    }

    fn array_literal(&mut self) {
        let line = self.previous.line;
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBracket) {
            loop {
                self.expression();
                self.pop_expr();
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBracket, "expect ']' after array literal");
        if count > 255 {
            self.semantic_error("array literal has more than 255 elements");
        }
        self.emit_op(OpCode::MakeArray, line);
        self.emit_u8(count as u8);
        self.push_expr(ExpressionData { kind: ValueKind::Array, shape: ObjectShape::Array, dims: 1 });
        self.last_lvalue = LValue::Other;
    }

    fn list_literal(&mut self) {
        let line = self.previous.line;
        let mut count: u16 = 0;
        if !self.check(TokenKind::RightBrace) {
            loop {
                self.expression();
                self.pop_expr();
                self.consume(TokenKind::Colon, "expect ':' after list key");
                self.expression();
                self.pop_expr();
                count += 1;
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightBrace, "expect '}' after list literal");
        self.emit_op(OpCode::MakeList, line);
        self.emit_u16(count);
        self.emit_u8(ValueKind::String as u8);
        self.push_expr(ExpressionData { kind: ValueKind::List, shape: ObjectShape::List, dims: 0 });
        self.last_lvalue = LValue::Other;
    }

    fn new_expr(&mut self) {
        let line = self.previous.line;
        self.consume(TokenKind::Identifier, "expect class name after 'new'");
        let class_name = self.previous.lexeme.clone();
        if !self.classes.contains_key(&class_name) {
            self.semantic_error(format!("unknown class '{class_name}'"));
        }
        self.named_variable(&class_name, false);
        self.pop_expr();
        if self.match_token(TokenKind::LeftParen) {
            self.consume(TokenKind::RightParen, "'new' does not take constructor arguments");
        }
        self.emit_op(OpCode::ObjInstance, line);
        self.push_expr(ExpressionData {
            kind: ValueKind::Instance,
            shape: ObjectShape::Object(class_name),
            dims: 0,
        });
        self.last_lvalue = LValue::Other;
    }

    fn this_expr(&mut self) {
        let class_name = self.current_fn().class_name.clone();
        let line = self.previous.line;
        match class_name {
            Some(name) => {
                self.emit_get_local(0, line);
                self.push_expr(ExpressionData { kind: ValueKind::Instance, shape: ObjectShape::Object(name), dims: 0 });
            }
            None => {
                self.semantic_error("'this' is only valid inside a method");
                self.push_expr(ExpressionData::unknown());
            }
        }
        self.last_lvalue = LValue::Other;
    }

    // ---------------------------------------------------------------
    // Closures and named functions
    // ---------------------------------------------------------------

    fn func_expr(&mut self) {
        let line = self.previous.line;
        let (proto, upvalues) = self.compile_function("<anonymous>".to_string(), None);
        self.emit_closure(proto, upvalues, line);
        self.last_lvalue = LValue::Other;
    }

    /// Compiles a function/method body: pushes a fresh `FunctionState`,
    /// reserves slot 0 (bound to `this` for methods), parses the parameter
    /// list and optional return type, compiles the block, and emits an
    /// implicit `nil` return if the body didn't already end in one. Returns
    /// the finished prototype plus the upvalue-capture list the *enclosing*
    /// function must emit alongside `OP_CLOSURE`.
    fn compile_function(&mut self, name: String, class_name: Option<String>) -> (FunctionProto, Vec<UpvalueDesc>) {
        let mut state = FunctionState::new();
        state.class_name = class_name.clone();
        self.functions.push(state);

        let this_type = match &class_name {
            Some(c) => ExpressionData { kind: ValueKind::Instance, shape: ObjectShape::Object(c.clone()), dims: 0 },
            None => ExpressionData::unknown(),
        };
        self.current_fn().locals.push(Local {
            name: "this".to_string(),
            depth: 0,
            is_captured: false,
            type_desc: this_type,
        });

        self.consume(TokenKind::LeftParen, "expect '(' after function name");
        let mut arity: u8 = 0;
        if !self.check(TokenKind::RightParen) {
            loop {
                self.consume(TokenKind::Identifier, "expect parameter name");
                let pname = self.previous.lexeme.clone();
                self.consume(TokenKind::Colon, "expect ':' after parameter name");
                let ptype = self.parse_type_annotation();
                if self.current_fn().locals.len() >= MAX_PARAMETERS + 1 {
                    self.semantic_error("too many parameters");
                } else {
                    self.add_local(pname, ptype);
                }
                arity = arity.saturating_add(1);
                if !self.match_token(TokenKind::Comma) {
                    break;
                }
            }
        }
        self.consume(TokenKind::RightParen, "expect ')' after parameters");
        self.current_fn().arity = arity;

        if !self.check(TokenKind::LeftBrace) {
            self.parse_type_annotation();
        }

        self.consume(TokenKind::LeftBrace, "expect '{' before function body");
        self.begin_scope();
        self.block();
        self.end_scope();

        let line = self.previous.line;
        self.emit_op(OpCode::Nil, line);
        self.emit_op(OpCode::Return, line);

        let finished = self.functions.pop().expect("pushed above");
        let proto = FunctionProto {
            name,
            arity: finished.arity,
            chunk: finished.chunk,
            upvalue_count: finished.upvalues.len() as u16,
        };
        (proto, finished.upvalues)
    }

    fn emit_closure(&mut self, proto: FunctionProto, upvalues: Vec<UpvalueDesc>, line: u32) {
        let idx = self.add_constant(Value::Function(std::rc::Rc::new(proto)));
        self.emit_op(OpCode::Closure, line);
        self.emit_u16(idx);
        for uv in &upvalues {
            self.emit_u8(uv.is_local as u8);
            self.emit_i16(uv.index as i16);
        }
        self.push_expr(ExpressionData { kind: ValueKind::Closure, shape: ObjectShape::Function, dims: 0 });
    }

    // ---------------------------------------------------------------
    // Variable resolution
    // ---------------------------------------------------------------

    fn identifier_expr(&mut self, can_assign: bool) {
        let name = self.previous.lexeme.clone();

        if let Some(entry) = self.natives.get(&name).cloned() {
            self.native_call(&name, entry);
            return;
        }

        if self.enums.contains_key(&name) && !self.local_or_global_shadows(&name) {
            self.push_expr(ExpressionData { kind: ValueKind::Enum, shape: ObjectShape::Enum(name), dims: 0 });
            self.last_lvalue = LValue::Other;
            return;
        }

        self.named_variable(&name, can_assign);
    }

    /// An enum name is only treated as a bare enum reference (for `::`) when
    /// no local or global of the same name shadows it.
    fn local_or_global_shadows(&self, name: &str) -> bool {
        let fn_index = self.functions.len() - 1;
        self.resolve_local(fn_index, name).is_some() || self.global_index.contains_key(name)
    }

    fn native_call(&mut self, name: &str, entry: NativeEntry) {
        let line = self.previous.line;
        self.consume(TokenKind::LeftParen, "expect '(' after native function name");
        let argc = self.argument_list();
        if let Some(expected) = entry.arity {
            if expected as usize != argc {
                self.semantic_error(format!("'{name}' expects {expected} argument(s), got {argc}"));
            }
        }
        let native_value = NativeRegistry::as_value(&entry);
        let idx = self.add_constant(native_value);
        self.emit_op(OpCode::CallNative, line);
        self.emit_u16(idx);
        self.emit_u16(argc as u16);
        let result = if entry.has_return { ExpressionData::unknown() } else { ExpressionData::nil() };
        self.push_expr(result);
        self.last_lvalue = LValue::Other;
    }

    fn named_variable(&mut self, name: &str, can_assign: bool) {
        let line = self.previous.line;
        let is_assignment = can_assign && self.check(TokenKind::Equal);
        let fn_index = self.functions.len() - 1;

        if let Some(slot) = self.resolve_local(fn_index, name) {
            let local_type = self.functions[fn_index].locals[slot as usize].type_desc.clone();
            if is_assignment {
                self.advance();
                self.expression();
                let value = self.pop_expr();
                self.check_assignment_type(name, &local_type, &value);
                self.emit_set_local(slot, line);
                self.push_expr(value);
            } else {
                self.emit_get_local(slot, line);
                self.push_expr(local_type);
            }
            self.last_lvalue = LValue::Local(slot);
            return;
        }

        if let Some(idx) = self.resolve_upvalue(fn_index, name) {
            if is_assignment {
                self.advance();
                self.expression();
                let value = self.pop_expr();
                self.emit_op(OpCode::SetUpvalue, line);
                self.emit_u16(idx);
                self.push_expr(value);
            } else {
                self.emit_op(OpCode::GetUpvalue, line);
                self.emit_u16(idx);
                self.push_expr(ExpressionData::unknown());
            }
            self.last_lvalue = LValue::Other;
            return;
        }

        if let Some(&register) = self.named_registers.get(name) {
            if is_assignment {
                self.advance();
                self.expression();
                let value = self.pop_expr();
                self.emit_op(OpCode::SetRegister, line);
                self.emit_u8(register);
                self.push_expr(value);
            } else {
                self.emit_op(OpCode::GetRegister, line);
                self.emit_u8(register);
                self.push_expr(ExpressionData::scalar(ValueKind::Integer));
            }
            self.last_lvalue = LValue::Other;
            return;
        }

        if let Some(&idx) = self.global_index.get(name) {
            let global_type = self.globals[idx].type_desc.clone();
            if is_assignment {
                self.advance();
                self.expression();
                let value = self.pop_expr();
                if self.globals[idx].is_initialized {
                    self.check_assignment_type(name, &global_type, &value);
                }
                self.emit_op(OpCode::SetGlobal, line);
                self.emit_u16(idx as u16);
                self.push_expr(value);
            } else {
                self.emit_get_global(idx as u16, line);
                self.push_expr(global_type);
            }
            self.last_lvalue = LValue::Other;
            return;
        }

        let mut candidates: Vec<String> = self.globals.iter().map(|g| g.name.clone()).collect();
        candidates.extend(self.functions[fn_index].locals.iter().map(|l| l.name.clone()));
        let hint = find_closest_match(name, &candidates)
            .map(|s| format!(" (did you mean '{s}'?)"))
            .unwrap_or_default();
        self.semantic_error(format!("undeclared variable '{name}'{hint}"));
        self.push_expr(ExpressionData::unknown());
        self.last_lvalue = LValue::Other;
        // Consume a stray `= expr` so parsing doesn't cascade further errors.
        if is_assignment {
            self.advance();
            self.expression();
            self.pop_expr();
        }
    }

    fn check_assignment_type(&mut self, name: &str, declared: &ExpressionData, value: &ExpressionData) {
        if declared.kind != ValueKind::Nil && value.kind != ValueKind::Nil && value.kind != declared.kind {
            self.semantic_error(format!(
                "cannot assign {} to '{name}' of type {}",
                value.kind, declared.kind
            ));
        }
    }

    fn emit_get_local(&mut self, slot: u16, line: u32) {
        match slot {
            0 => self.emit_op(OpCode::GetLocal0, line),
            1 => self.emit_op(OpCode::GetLocal1, line),
            2 => self.emit_op(OpCode::GetLocal2, line),
            3 => self.emit_op(OpCode::GetLocal3, line),
            4 => self.emit_op(OpCode::GetLocal4, line),
            5 => self.emit_op(OpCode::GetLocal5, line),
            _ => {
                self.emit_op(OpCode::GetLocal, line);
                self.emit_u16(slot);
            }
        }
    }

    fn emit_set_local(&mut self, slot: u16, line: u32) {
        self.emit_op(OpCode::SetLocal, line);
        self.emit_u16(slot);
    }

    fn emit_get_global(&mut self, idx: u16, line: u32) {
        match idx {
            0 => self.emit_op(OpCode::GetGlobal0, line),
            1 => self.emit_op(OpCode::GetGlobal1, line),
            2 => self.emit_op(OpCode::GetGlobal2, line),
            3 => self.emit_op(OpCode::GetGlobal3, line),
            4 => self.emit_op(OpCode::GetGlobal4, line),
            5 => self.emit_op(OpCode::GetGlobal5, line),
            _ => {
                self.emit_op(OpCode::GetGlobal, line);
                self.emit_u16(idx);
            }
        }
    }

    /// Local resolution within function `fn_index`, newest-shadowing-first.
    fn resolve_local(&self, fn_index: usize, name: &str) -> Option<u16> {
        self.functions[fn_index]
            .locals
            .iter()
            .enumerate()
            .rev()
            .find(|(_, l)| l.name == name)
            .map(|(i, _)| i as u16)
    }

    /// Climbs the enclosing-function chain, marking captured locals and
    /// deduplicating `(index, is_local)` pairs.
    fn resolve_upvalue(&mut self, fn_index: usize, name: &str) -> Option<u16> {
        if fn_index == 0 {
            return None;
        }
        let enclosing = fn_index - 1;
        if let Some(local_slot) = self.resolve_local(enclosing, name) {
            self.functions[enclosing].locals[local_slot as usize].is_captured = true;
            return Some(self.add_upvalue(fn_index, local_slot, true));
        }
        if let Some(outer_idx) = self.resolve_upvalue(enclosing, name) {
            return Some(self.add_upvalue(fn_index, outer_idx, false));
        }
        None
    }

    fn add_upvalue(&mut self, fn_index: usize, index: u16, is_local: bool) -> u16 {
        let existing = self.functions[fn_index]
            .upvalues
            .iter()
            .position(|u| u.index == index && u.is_local == is_local);
        if let Some(pos) = existing {
            return pos as u16;
        }
        if self.functions[fn_index].upvalues.len() >= MAX_UPVALUES {
            self.semantic_error("too many closure variables captured in one function");
        }
        self.functions[fn_index].upvalues.push(UpvalueDesc { index, is_local });
        (self.functions[fn_index].upvalues.len() - 1) as u16
    }

    fn alloc_register(&mut self, name: String) -> Option<u8> {
        for (i, free) in self.register_free.iter_mut().enumerate() {
            if *free {
                *free = false;
                self.named_registers.insert(name, i as u8);
                return Some(i as u8);
            }
        }
        None
    }

    fn free_register(&mut self, name: &str) {
        if let Some(reg) = self.named_registers.remove(name) {
            self.register_free[reg as usize] = true;
        }
    }
}
