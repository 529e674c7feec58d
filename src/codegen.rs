//! Assembly emission: an append-only line buffer plus the bookkeeping the
//! parser leans on, the virtual operand-stack depth and the label counter.
//!
//! Every value a finished expression produces lives on the machine stack,
//! so `push`/`pop` here mirror `pushq`/`popq` one for one. The depth
//! counter doubles as the slot allocator: a name first assigned while the
//! depth is `n` is stored at `-8n(%rbp)` from then on.

/// Fixed prologue establishing the exported `eval` symbol and its frame.
const PROLOGUE: &str = "\t.text
\t.file\t\"sm.c\"
\t.globl\teval                            # -- Begin function eval
\t.p2align\t4, 0x90
\t.type\teval,@function
eval:
\tpushq\t%rbp
\tmovq\t%rsp, %rbp
";

/// Fixed epilogue: return, size bookkeeping, toolchain identity and the
/// non-executable-stack note.
const EPILOGUE: &str = "\tretq
.Lfunc_end0:
\t.size\teval, .Lfunc_end0-eval
\t\t\t\t\t# -- End function
\t.ident\t\"clang version 16.0.6\"
\t.section\t\".note.GNU-stack\",\"\",@progbits
\t.addrsig
";

/// Line-oriented assembly writer.
pub struct Emitter {
  lines: Vec<String>,
  sp: i64,
  label_count: u32,
}

impl Emitter {
  pub fn new() -> Self {
    Self {
      lines: Vec::new(),
      sp: 0,
      label_count: 0,
    }
  }

  /// Current virtual operand-stack depth.
  pub fn sp(&self) -> i64 {
    self.sp
  }

  /// Overwrite the depth. Used when entering and leaving a function body,
  /// which runs on a fresh frame.
  pub fn set_sp(&mut self, sp: i64) {
    self.sp = sp;
  }

  /// A fresh branch target, unique within one compilation.
  pub fn new_label(&mut self) -> String {
    let label = format!("JL{}", self.label_count);
    self.label_count += 1;
    label
  }

  /// Append one line. A mnemonic ending in `:` is a label and goes
  /// flush-left.
  pub fn emit_op(&mut self, op: &str, operands: &[&str]) {
    let mut line = String::new();
    if op.ends_with(':') {
      line.push_str(op);
    } else {
      line.push('\t');
      line.push_str(op);
    }
    for (i, operand) in operands.iter().enumerate() {
      if i == 0 {
        line.push('\t');
      } else {
        line.push_str(", ");
      }
      line.push_str(operand);
    }
    self.lines.push(line);
  }

  pub fn emit_label(&mut self, label: &str) {
    self.emit_op(&format!("{label}:"), &[]);
  }

  /// `pushq` the operand and grow the virtual stack.
  pub fn push(&mut self, operand: &str) {
    self.sp += 1;
    self.emit_op("pushq", &[operand]);
  }

  /// `popq` into the operand and shrink the virtual stack.
  pub fn pop(&mut self, operand: &str) {
    self.sp -= 1;
    self.emit_op("popq", &[operand]);
  }

  /// Render the final assembly: prologue, buffered body, epilogue.
  pub fn into_assembly(self) -> String {
    let mut asm = String::from(PROLOGUE);
    for line in &self.lines {
      asm.push_str(line);
      asm.push('\n');
    }
    asm.push_str(EPILOGUE);
    asm
  }
}
