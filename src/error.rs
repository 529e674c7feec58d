//! Shared error utilities used across the compilation pipeline.
//!
//! Diagnostics are kept lightweight on purpose – every failure carries the
//! 1-based source line the lexer had reached plus just enough context to
//! render a one-line message. All errors are fatal: the parse unwinds and
//! compilation stops without emitting anything.

use snafu::Snafu;

pub type CompileResult<T> = Result<T, CompileError>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum CompileError {
  #[snafu(display("line {line}: unexpected {found}"))]
  UnexpectedToken { found: String, line: u32 },

  #[snafu(display("line {line}: undefined name '{name}'"))]
  UndefinedName { name: String, line: u32 },

  #[snafu(display("line {line}: unbalanced parenthesis"))]
  UnbalancedParen { line: u32 },

  #[snafu(display("line {line}: empty condition in {construct}"))]
  EmptyCondition {
    construct: &'static str,
    line: u32,
  },

  #[snafu(display("line {line}: expected {expected}, got {found}"))]
  MissingBlockTerminator {
    expected: &'static str,
    found: String,
    line: u32,
  },

  #[snafu(display("line {line}: malformed CALL: {message}"))]
  BadCallSyntax { message: String, line: u32 },

  #[snafu(display("line {line}: malformed FN declaration: {message}"))]
  BadFnSyntax { message: String, line: u32 },

  #[snafu(display("line {line}: unknown operator '{op}'"))]
  UnknownOperator { op: String, line: u32 },
}
