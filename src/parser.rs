//! Single-pass parsing and code generation.
//!
//! There is no syntax tree: every grammar rule emits its assembly as it is
//! recognised, keeping the virtual stack depth in lock step with the values
//! the emitted code leaves on the machine stack. All state lives in one
//! `Compiler` context threaded through the parse functions, so the pass is
//! re-entrant and testable with in-memory buffers.
//!
//! - Expressions are parsed with binding powers; each completed expression
//!   leaves exactly one value on the stack.
//! - Statements dispatch on the leading token of a line and leave the depth
//!   unchanged unless they are bare expressions.
//! - A function body swaps in a fresh scope and depth and restores the
//!   outer pair at `ENDFN`.

use std::collections::{HashMap, HashSet};

use tracing::{debug, trace};

use crate::codegen::Emitter;
use crate::error::{
  BadCallSyntaxSnafu, BadFnSyntaxSnafu, CompileResult, EmptyConditionSnafu,
  MissingBlockTerminatorSnafu, UnbalancedParenSnafu, UndefinedNameSnafu, UnexpectedTokenSnafu,
  UnknownOperatorSnafu,
};
use crate::tokenizer::{Keyword, Lexer, Token};

/// Binding power handed to `parse_expr` when no operator constrains the
/// parse from the outside.
const LOWEST_POWER: i32 = -1;

/// Name-to-slot mapping for the scope currently being compiled. Slot `n`
/// addresses `-8n(%rbp)`; parameters use negative slots so the same formula
/// lands above the saved frame pointer.
struct Scope {
  slots: HashMap<String, i64>,
}

impl Scope {
  fn new() -> Self {
    Self {
      slots: HashMap::new(),
    }
  }

  fn bind(&mut self, name: &str, slot: i64) {
    self.slots.insert(name.to_string(), slot);
  }

  fn lookup(&self, name: &str) -> Option<i64> {
    self.slots.get(name).copied()
  }
}

/// All compilation state, threaded explicitly through the parse functions.
struct Compiler<'a> {
  lexer: Lexer<'a>,
  emitter: Emitter,
  scope: Scope,
  functions: HashSet<String>,
  in_function: bool,
}

/// How a block ended: the input ran out, or a terminator keyword turned up.
enum BlockEnd {
  Eof,
  Terminator(Keyword),
}

/// Compile a whole program into assembly text.
pub fn compile(source: &str) -> CompileResult<String> {
  let mut c = Compiler {
    lexer: Lexer::new(source),
    emitter: Emitter::new(),
    scope: Scope::new(),
    functions: HashSet::new(),
    in_function: false,
  };

  match parse_block(&mut c)? {
    BlockEnd::Eof => {}
    BlockEnd::Terminator(keyword) => {
      return UnexpectedTokenSnafu {
        found: Token::Keyword(keyword).describe(),
        line: c.lexer.line(),
      }
      .fail();
    }
  }

  // The running last value becomes the return value of `eval`.
  c.emitter.pop("%rax");
  c.emitter.emit_op("movq", &["%rbp", "%rsp"]);
  c.emitter.emit_op("popq", &["%rbp"]);

  let asm = c.emitter.into_assembly();
  debug!(bytes = asm.len(), "assembly rendered");
  Ok(asm)
}

// ----- Statement parsing -----

/// Run statements until a terminator keyword or end of input. The
/// terminator is consumed here and returned for the caller to validate.
fn parse_block(c: &mut Compiler) -> CompileResult<BlockEnd> {
  loop {
    match c.lexer.peek() {
      Token::End => return Ok(BlockEnd::Eof),
      Token::Newline => {
        c.lexer.pop();
      }
      Token::Keyword(keyword) if keyword.is_terminator() => {
        let keyword = *keyword;
        c.lexer.pop();
        return Ok(BlockEnd::Terminator(keyword));
      }
      _ => {
        parse_stmt(c)?;
        if matches!(c.lexer.peek(), Token::Newline) {
          c.lexer.pop();
        }
      }
    }
  }
}

fn parse_stmt(c: &mut Compiler) -> CompileResult<()> {
  match c.lexer.peek() {
    Token::Keyword(Keyword::If) => parse_if(c),
    Token::Keyword(Keyword::While) => parse_while(c),
    Token::Keyword(Keyword::Fn) => parse_fn(c),
    Token::Keyword(Keyword::Call) => parse_call(c),
    Token::Identifier(_) => parse_assign_or_expr(c),
    _ => parse_expr(c, LOWEST_POWER),
  }
}

/// A line starting with an identifier is an assignment when the next token
/// is `=`; otherwise the identifier goes back and the line is a bare
/// expression.
fn parse_assign_or_expr(c: &mut Compiler) -> CompileResult<()> {
  let token = c.lexer.pop();
  let name = match &token {
    Token::Identifier(name) => name.clone(),
    _ => unreachable!("caller checked for an identifier"),
  };

  if !matches!(c.lexer.peek(), Token::Operator(op) if op == "=") {
    c.lexer.push(token);
    return parse_expr(c, LOWEST_POWER);
  }
  c.lexer.pop();

  if matches!(c.lexer.peek(), Token::Keyword(Keyword::Call)) {
    parse_call(c)?;
  } else {
    parse_expr(c, LOWEST_POWER)?;
  }

  match c.scope.lookup(&name) {
    Some(slot) => {
      // Move the fresh value into the existing storage.
      c.emitter.pop("%rax");
      c.emitter.emit_op("movq", &["%rax", &slot_operand(slot)]);
    }
    None => {
      // First assignment: the value just pushed is the storage.
      c.scope.bind(&name, c.emitter.sp());
    }
  }
  Ok(())
}

fn parse_if(c: &mut Compiler) -> CompileResult<()> {
  c.lexer.pop();
  ensure_condition(c, "IF")?;
  parse_expr(c, LOWEST_POWER)?;
  c.emitter.pop("%rax");
  c.emitter.emit_op("cmpq", &["$0", "%rax"]);
  let else_label = c.emitter.new_label();
  c.emitter.emit_op("je", &[&else_label]);

  match parse_block(c)? {
    BlockEnd::Terminator(Keyword::Else) => {
      let end_label = c.emitter.new_label();
      c.emitter.emit_op("jmp", &[&end_label]);
      c.emitter.emit_label(&else_label);
      let end = parse_block(c)?;
      expect_terminator(c, end, Keyword::EndIf, "ENDIF")?;
      c.emitter.emit_label(&end_label);
      Ok(())
    }
    BlockEnd::Terminator(Keyword::EndIf) => {
      c.emitter.emit_label(&else_label);
      Ok(())
    }
    other => terminator_mismatch(c, other, "ENDIF or ELSE"),
  }
}

fn parse_while(c: &mut Compiler) -> CompileResult<()> {
  c.lexer.pop();
  ensure_condition(c, "WHILE")?;
  let start_label = c.emitter.new_label();
  c.emitter.emit_label(&start_label);
  parse_expr(c, LOWEST_POWER)?;
  c.emitter.pop("%rax");
  c.emitter.emit_op("cmpq", &["$0", "%rax"]);
  let end_label = c.emitter.new_label();
  c.emitter.emit_op("je", &[&end_label]);

  let end = parse_block(c)?;
  expect_terminator(c, end, Keyword::EndWhile, "ENDWHILE")?;
  c.emitter.emit_op("jmp", &[&start_label]);
  c.emitter.emit_label(&end_label);
  Ok(())
}

/// `FN name(param ...)` up to `ENDFN`. The body runs on its own frame: the
/// outer scope and depth are snapshotted, the body sees only its parameters
/// and locals, and the final expression becomes the return value.
fn parse_fn(c: &mut Compiler) -> CompileResult<()> {
  c.lexer.pop();
  if c.in_function {
    return BadFnSyntaxSnafu {
      message: "function definitions cannot nest",
      line: c.lexer.line(),
    }
    .fail();
  }
  let name = match c.lexer.pop() {
    Token::Identifier(name) => name,
    other => {
      let found = other.describe();
      return BadFnSyntaxSnafu {
        message: format!("expected a function name, got {found}"),
        line: c.lexer.line(),
      }
      .fail();
    }
  };
  if !c.functions.insert(name.clone()) {
    return BadFnSyntaxSnafu {
      message: format!("function '{name}' is already defined"),
      line: c.lexer.line(),
    }
    .fail();
  }
  if !matches!(c.lexer.pop(), Token::OpenParen) {
    return BadFnSyntaxSnafu {
      message: format!("expected '(' after '{name}'"),
      line: c.lexer.line(),
    }
    .fail();
  }
  let mut params = Vec::new();
  loop {
    match c.lexer.pop() {
      Token::Identifier(param) => params.push(param),
      Token::CloseParen => break,
      other => {
        let found = other.describe();
        return BadFnSyntaxSnafu {
          message: format!("expected a parameter name or ')', got {found}"),
          line: c.lexer.line(),
        }
        .fail();
      }
    }
  }
  debug!(name = %name, arity = params.len(), "compiling function");

  let end_label = format!("end{name}");
  c.emitter.emit_op("jmp", &[&end_label]);
  c.emitter.emit_label(&name);

  // The caller pushes arguments left to right, so parameter i (zero-based)
  // of n sits 8*(n-i+1) bytes above the saved frame pointer; a negative
  // slot makes the shared displacement formula land there.
  let mut scope = Scope::new();
  let arity = params.len() as i64;
  for (i, param) in params.iter().enumerate() {
    scope.bind(param, -(arity - i as i64 + 1));
  }
  let outer_scope = std::mem::replace(&mut c.scope, scope);
  let outer_sp = c.emitter.sp();
  c.emitter.set_sp(0);
  c.in_function = true;

  c.emitter.emit_op("pushq", &["%rbp"]);
  c.emitter.emit_op("movq", &["%rsp", "%rbp"]);

  let end = parse_block(c)?;
  expect_terminator(c, end, Keyword::EndFn, "ENDFN")?;

  c.emitter.pop("%rax");
  c.emitter.emit_op("movq", &["%rbp", "%rsp"]);
  c.emitter.emit_op("popq", &["%rbp"]);
  c.emitter.emit_op("retq", &[]);

  c.scope = outer_scope;
  c.emitter.set_sp(outer_sp);
  c.in_function = false;
  c.emitter.emit_label(&end_label);
  Ok(())
}

/// `CALL name(arg ...)`: arguments are pushed left to right; after `callq`
/// the caller discards them and leaves the returned `%rax` on the stack.
fn parse_call(c: &mut Compiler) -> CompileResult<()> {
  c.lexer.pop();
  let name = match c.lexer.pop() {
    Token::Identifier(name) => name,
    other => {
      let found = other.describe();
      return BadCallSyntaxSnafu {
        message: format!("expected a function name, got {found}"),
        line: c.lexer.line(),
      }
      .fail();
    }
  };
  if !c.functions.contains(&name) {
    return UndefinedNameSnafu {
      name,
      line: c.lexer.line(),
    }
    .fail();
  }
  if !matches!(c.lexer.pop(), Token::OpenParen) {
    return BadCallSyntaxSnafu {
      message: format!("expected '(' after '{name}'"),
      line: c.lexer.line(),
    }
    .fail();
  }
  let mut argc = 0usize;
  loop {
    match c.lexer.pop() {
      Token::CloseParen => break,
      Token::Number(text) => {
        c.emitter.push(&format!("${}", number_value(&text)));
        argc += 1;
      }
      Token::Identifier(arg) => {
        let Some(slot) = c.scope.lookup(&arg) else {
          return UndefinedNameSnafu {
            name: arg,
            line: c.lexer.line(),
          }
          .fail();
        };
        c.emitter.push(&slot_operand(slot));
        argc += 1;
      }
      other => {
        let found = other.describe();
        return BadCallSyntaxSnafu {
          message: format!("expected an argument or ')', got {found}"),
          line: c.lexer.line(),
        }
        .fail();
      }
    }
  }
  trace!(callee = %name, argc, "emitting call");

  c.emitter.emit_op("callq", &[&name]);
  for _ in 0..argc {
    c.emitter.pop("%rdx");
  }
  c.emitter.push("%rax");
  Ok(())
}

fn ensure_condition(c: &mut Compiler, construct: &'static str) -> CompileResult<()> {
  if matches!(c.lexer.peek(), Token::Newline | Token::End) {
    return EmptyConditionSnafu {
      construct,
      line: c.lexer.line(),
    }
    .fail();
  }
  Ok(())
}

fn expect_terminator(
  c: &Compiler,
  end: BlockEnd,
  want: Keyword,
  expected: &'static str,
) -> CompileResult<()> {
  match end {
    BlockEnd::Terminator(keyword) if keyword == want => Ok(()),
    other => terminator_mismatch(c, other, expected),
  }
}

fn terminator_mismatch<T>(
  c: &Compiler,
  end: BlockEnd,
  expected: &'static str,
) -> CompileResult<T> {
  let found = match end {
    BlockEnd::Eof => "end of input".to_string(),
    BlockEnd::Terminator(keyword) => Token::Keyword(keyword).describe(),
  };
  MissingBlockTerminatorSnafu {
    expected,
    found,
    line: c.lexer.line(),
  }
  .fail()
}

// ----- Expression parsing -----

/// Binding power of an infix operator, or `None` when the payload has no
/// infix meaning (`=`, `!`).
fn binding_power(op: &str) -> Option<i32> {
  match op {
    "<" | "<=" | ">" | ">=" | "==" | "!=" => Some(10),
    "+" | "-" => Some(20),
    "*" | "/" => Some(30),
    "^" => Some(40),
    _ => None,
  }
}

/// Parse one expression whose surroundings bind with `power`, leaving its
/// value on the stack. The loop extends the expression only while the next
/// operator binds strictly tighter, which makes every operator
/// left-associative, `^` included.
fn parse_expr(c: &mut Compiler, power: i32) -> CompileResult<()> {
  parse_prefix(c, power)?;
  loop {
    let op = match c.lexer.peek() {
      Token::End | Token::Newline | Token::CloseParen => break,
      Token::Operator(op) => op.clone(),
      other => {
        let found = other.describe();
        return UnexpectedTokenSnafu {
          found,
          line: c.lexer.line(),
        }
        .fail();
      }
    };
    let Some(op_power) = binding_power(&op) else {
      return UnknownOperatorSnafu {
        op,
        line: c.lexer.line(),
      }
      .fail();
    };
    if op_power <= power {
      break;
    }
    c.lexer.pop();
    parse_expr(c, op_power)?;
    emit_binary(c, &op);
  }
  Ok(())
}

fn parse_prefix(c: &mut Compiler, power: i32) -> CompileResult<()> {
  match c.lexer.pop() {
    Token::OpenParen => {
      parse_expr(c, LOWEST_POWER)?;
      match c.lexer.pop() {
        Token::CloseParen => Ok(()),
        _ => UnbalancedParenSnafu {
          line: c.lexer.line(),
        }
        .fail(),
      }
    }
    Token::Operator(op) if op == "+" => parse_expr(c, power),
    Token::Operator(op) if op == "-" => {
      parse_expr(c, power)?;
      c.emitter.pop("%rdi");
      c.emitter.emit_op("movq", &["$-1", "%rax"]);
      c.emitter.emit_op("imulq", &["%rax", "%rdi"]);
      c.emitter.push("%rdi");
      Ok(())
    }
    Token::Number(text) => {
      c.emitter.push(&format!("${}", number_value(&text)));
      Ok(())
    }
    Token::Identifier(name) => match c.scope.lookup(&name) {
      Some(slot) => {
        c.emitter.push(&slot_operand(slot));
        Ok(())
      }
      None => UndefinedNameSnafu {
        name,
        line: c.lexer.line(),
      }
      .fail(),
    },
    Token::CloseParen => UnbalancedParenSnafu {
      line: c.lexer.line(),
    }
    .fail(),
    other => {
      let found = other.describe();
      UnexpectedTokenSnafu {
        found,
        line: c.lexer.line(),
      }
      .fail()
    }
  }
}

/// Emit the code for one infix operator: consume the two top stack entries,
/// push one result.
fn emit_binary(c: &mut Compiler, op: &str) {
  match op {
    "+" => emit_arith(c, "addq"),
    "-" => emit_arith(c, "subq"),
    "*" => emit_arith(c, "imulq"),
    "/" => {
      c.emitter.pop("%rdi");
      c.emitter.pop("%rax");
      c.emitter.emit_op("cqto", &[]);
      c.emitter.emit_op("idivq", &["%rdi"]);
      c.emitter.push("%rax");
    }
    "^" => emit_exponent(c),
    "<" => emit_relational(c, "jge"),
    "<=" => emit_relational(c, "jg"),
    ">" => emit_relational(c, "jle"),
    ">=" => emit_relational(c, "jl"),
    "==" => emit_relational(c, "jne"),
    "!=" => emit_relational(c, "je"),
    _ => unreachable!("operator validated against the power table"),
  }
}

fn emit_arith(c: &mut Compiler, mnemonic: &str) {
  c.emitter.pop("%rdi");
  c.emitter.pop("%rax");
  c.emitter.emit_op(mnemonic, &["%rdi", "%rax"]);
  c.emitter.push("%rax");
}

/// Integer exponentiation with a non-negative exponent: repeated
/// multiplication. Scratch registers only; `eval` must leave callee-saved
/// state intact.
fn emit_exponent(c: &mut Compiler) {
  let start_label = c.emitter.new_label();
  let end_label = c.emitter.new_label();
  c.emitter.pop("%rdi");
  c.emitter.pop("%rdx");
  c.emitter.emit_op("movq", &["$1", "%rax"]);
  c.emitter.emit_label(&start_label);
  c.emitter.emit_op("cmpq", &["$0", "%rdi"]);
  c.emitter.emit_op("je", &[&end_label]);
  c.emitter.emit_op("imulq", &["%rdx", "%rax"]);
  c.emitter.emit_op("subq", &["$1", "%rdi"]);
  c.emitter.emit_op("jmp", &[&start_label]);
  c.emitter.emit_label(&end_label);
  c.emitter.push("%rax");
}

/// Relational operators produce exactly 0 or 1, so they compose with `IF`
/// and `WHILE`, whose conditions test non-zero. A 0 is pushed first and
/// swapped for a 1 unless the inverse branch skips past.
fn emit_relational(c: &mut Compiler, inverse_jump: &str) {
  let skip_label = c.emitter.new_label();
  c.emitter.pop("%rdi");
  c.emitter.pop("%rax");
  c.emitter.push("$0");
  c.emitter.emit_op("cmpq", &["%rdi", "%rax"]);
  c.emitter.emit_op(inverse_jump, &[&skip_label]);
  c.emitter.pop("%rdx");
  c.emitter.push("$1");
  c.emitter.emit_label(&skip_label);
}

fn slot_operand(slot: i64) -> String {
  format!("{}(%rbp)", -8 * slot)
}

/// Fold decimal text into a 64-bit value with wraparound, so oversized
/// literals behave like the arithmetic they feed and leading zeros never
/// reach the assembler looking like octal.
fn number_value(text: &str) -> i64 {
  text.bytes().fold(0i64, |acc, digit| {
    acc.wrapping_mul(10).wrapping_add(i64::from(digit - b'0'))
  })
}
