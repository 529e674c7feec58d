//! End-to-end checks: compile source programs and execute the emitted
//! assembly on a small interpreter for the AT&T subset the compiler
//! produces. This keeps the behavioural suite hermetic (no assembler or
//! linker involved) while still exercising the real calling convention,
//! frame layout and branch structure of the output.

use std::collections::HashMap;

use smcc::generate_assembly;

#[derive(Debug, Clone, PartialEq)]
enum Operand {
  Imm(i64),
  Reg(String),
  Frame(i64),
  Target(String),
}

struct Program {
  instrs: Vec<(String, Vec<Operand>)>,
  labels: HashMap<String, usize>,
}

fn parse_operand(text: &str) -> Operand {
  if let Some(imm) = text.strip_prefix('$') {
    return Operand::Imm(imm.parse().expect("immediate operand"));
  }
  if let Some(reg) = text.strip_prefix('%') {
    return Operand::Reg(reg.to_string());
  }
  if let Some((disp, rest)) = text.split_once('(') {
    assert_eq!(rest, "%rbp)", "unexpected memory operand '{text}'");
    return Operand::Frame(disp.parse().expect("frame displacement"));
  }
  Operand::Target(text.to_string())
}

fn parse_asm(asm: &str) -> Program {
  let mut instrs = Vec::new();
  let mut labels = HashMap::new();
  for raw in asm.lines() {
    let line = raw.split('#').next().unwrap_or("").trim();
    if line.is_empty() {
      continue;
    }
    if let Some(label) = line.strip_suffix(':') {
      labels.insert(label.to_string(), instrs.len());
      continue;
    }
    if line.starts_with('.') {
      continue;
    }
    let (mnemonic, rest) = match line.split_once(char::is_whitespace) {
      Some((mnemonic, rest)) => (mnemonic, rest.trim()),
      None => (line, ""),
    };
    let operands: Vec<Operand> = if rest.is_empty() {
      Vec::new()
    } else {
      rest
        .split(',')
        .map(|operand| parse_operand(operand.trim()))
        .collect()
    };
    instrs.push((mnemonic.to_string(), operands));
  }
  Program { instrs, labels }
}

const HALT: i64 = -1;
const STACK_TOP: i64 = 1 << 20;

struct Machine {
  regs: HashMap<String, i64>,
  mem: HashMap<i64, i64>,
  cmp: (i64, i64),
}

impl Machine {
  fn new() -> Self {
    let mut regs = HashMap::new();
    regs.insert("rsp".to_string(), STACK_TOP);
    Self {
      regs,
      mem: HashMap::new(),
      cmp: (0, 0),
    }
  }

  fn reg(&self, name: &str) -> i64 {
    self.regs.get(name).copied().unwrap_or(0)
  }

  fn get(&self, operand: &Operand) -> i64 {
    match operand {
      Operand::Imm(value) => *value,
      Operand::Reg(name) => self.reg(name),
      Operand::Frame(disp) => self
        .mem
        .get(&(self.reg("rbp") + disp))
        .copied()
        .unwrap_or(0),
      Operand::Target(name) => panic!("jump target '{name}' used as a value"),
    }
  }

  fn set(&mut self, operand: &Operand, value: i64) {
    match operand {
      Operand::Reg(name) => {
        self.regs.insert(name.clone(), value);
      }
      Operand::Frame(disp) => {
        let address = self.reg("rbp") + disp;
        self.mem.insert(address, value);
      }
      other => panic!("cannot write to {other:?}"),
    }
  }

  fn push(&mut self, value: i64) {
    let rsp = self.reg("rsp") - 8;
    self.regs.insert("rsp".to_string(), rsp);
    self.mem.insert(rsp, value);
  }

  fn pop(&mut self) -> i64 {
    let rsp = self.reg("rsp");
    let value = self.mem.get(&rsp).copied().unwrap_or(0);
    self.regs.insert("rsp".to_string(), rsp + 8);
    value
  }
}

fn jump_target(program: &Program, operand: &Operand) -> usize {
  match operand {
    Operand::Target(name) => *program
      .labels
      .get(name)
      .unwrap_or_else(|| panic!("unknown label '{name}'")),
    other => panic!("bad jump operand {other:?}"),
  }
}

/// Call `eval` the way the C driver would and return its `%rax`.
fn run_eval(asm: &str) -> i64 {
  let program = parse_asm(asm);
  let mut machine = Machine::new();
  machine.push(HALT);
  let mut ip = *program.labels.get("eval").expect("eval entry point");
  let mut steps = 0u64;
  loop {
    steps += 1;
    assert!(
      steps < 50_000_000,
      "step limit exceeded, emitted code must terminate"
    );
    let (mnemonic, operands) = &program.instrs[ip];
    ip += 1;
    match mnemonic.as_str() {
      "pushq" => {
        let value = machine.get(&operands[0]);
        machine.push(value);
      }
      "popq" => {
        let value = machine.pop();
        machine.set(&operands[0], value);
      }
      "movq" => {
        let value = machine.get(&operands[0]);
        machine.set(&operands[1], value);
      }
      "addq" => {
        let value = machine
          .get(&operands[1])
          .wrapping_add(machine.get(&operands[0]));
        machine.set(&operands[1], value);
      }
      "subq" => {
        let value = machine
          .get(&operands[1])
          .wrapping_sub(machine.get(&operands[0]));
        machine.set(&operands[1], value);
      }
      "imulq" => {
        let value = machine
          .get(&operands[1])
          .wrapping_mul(machine.get(&operands[0]));
        machine.set(&operands[1], value);
      }
      "cqto" => {
        let fill = if machine.reg("rax") < 0 { -1 } else { 0 };
        machine.regs.insert("rdx".to_string(), fill);
      }
      "idivq" => {
        let divisor = machine.get(&operands[0]);
        let dividend = machine.reg("rax");
        assert_ne!(divisor, 0, "division by zero in emitted code");
        machine
          .regs
          .insert("rax".to_string(), dividend.wrapping_div(divisor));
        machine
          .regs
          .insert("rdx".to_string(), dividend.wrapping_rem(divisor));
      }
      "cmpq" => {
        machine.cmp = (machine.get(&operands[1]), machine.get(&operands[0]));
      }
      "jmp" => {
        ip = jump_target(&program, &operands[0]);
      }
      "je" | "jne" | "jl" | "jle" | "jg" | "jge" => {
        let (dst, src) = machine.cmp;
        let taken = match mnemonic.as_str() {
          "je" => dst == src,
          "jne" => dst != src,
          "jl" => dst < src,
          "jle" => dst <= src,
          "jg" => dst > src,
          "jge" => dst >= src,
          _ => unreachable!(),
        };
        if taken {
          ip = jump_target(&program, &operands[0]);
        }
      }
      "callq" => {
        machine.push(ip as i64);
        ip = jump_target(&program, &operands[0]);
      }
      "retq" => {
        let ret = machine.pop();
        if ret == HALT {
          return machine.reg("rax");
        }
        ip = ret as usize;
      }
      other => panic!("unsupported mnemonic '{other}'"),
    }
  }
}

fn eval_program(source: &str) -> i64 {
  let asm = generate_assembly(source).expect("program must compile");
  run_eval(&asm)
}

#[test]
fn single_number() {
  assert_eq!(eval_program("2"), 2);
}

#[test]
fn addition() {
  assert_eq!(eval_program("1+1"), 2);
}

#[test]
fn parenthesised_products() {
  assert_eq!(eval_program("(1+1)*(1*10)"), 20);
}

#[test]
fn division_by_a_negative_group() {
  assert_eq!(eval_program("(1+0+1)/(-2)"), -1);
}

#[test]
fn last_expression_wins() {
  assert_eq!(eval_program("1\n   1   \n(2+3)"), 5);
}

#[test]
fn trailing_newline_is_harmless() {
  assert_eq!(eval_program("7\n"), 7);
}

#[test]
fn variables_feed_later_expressions() {
  let source = "
x=5
y=15
z=2
(x+y-10)/z + 1
";
  assert_eq!(eval_program(source), 6);
}

#[test]
fn reassignment_updates_the_slot() {
  let source = "
x=5
y=15
z=2
x=15
(x+y-10)/z + 1
";
  assert_eq!(eval_program(source), 11);
}

#[test]
fn if_takes_the_then_branch_on_nonzero() {
  let source = "
x=5
y=15
IF x-y
\ty=2+2
ELSE
\ty=2+3
ENDIF
y
";
  assert_eq!(eval_program(source), 4);
}

#[test]
fn if_takes_the_else_branch_on_zero() {
  let source = "
x=5
y=5
IF x-y
\ty=2+2
ELSE
\ty=2+3
ENDIF
y
";
  assert_eq!(eval_program(source), 5);
}

#[test]
fn while_loops_until_the_difference_vanishes() {
  let source = "
x=100
y=5
WHILE x-y
\tx = x-1
ENDWHILE
x
";
  assert_eq!(eval_program(source), 5);
}

#[test]
fn while_loops_on_a_relational_condition() {
  let source = "
x=100
y=5
WHILE x > y
\tx = x-1
ENDWHILE
x
";
  assert_eq!(eval_program(source), 5);
}

#[test]
fn while_doubles_past_the_bound() {
  let source = "
x=1024
y=2
WHILE x > y
\ty = y * 2
ENDWHILE
y
";
  assert_eq!(eval_program(source), 1024);
}

#[test]
fn function_arguments_arrive_in_order() {
  let source = "
x=100
y=1
z=10
FN hello(x y z)
\tx+y+z
ENDFN
CALL hello(x y z)
";
  assert_eq!(eval_program(source), 111);
}

#[test]
fn function_with_locals_and_a_loop() {
  let source = "
x=10
y=1
FN sum(st end)
\tz = 0
\tWHILE st < end
\t\tz = z + st
\t\tst = st + 1
\tENDWHILE
\tz
ENDFN
CALL sum(y x)
";
  assert_eq!(eval_program(source), 45);
}

#[test]
fn recursive_fibonacci() {
  let source = "
FN fib(i)
\tf = 0
\tIF i < 2
\t\tf=i
\tELSE
\t\tx = i-1
\t\ty = i-2
\t\ta = CALL fib(x)
\t\tb = CALL fib(y)
\t\tf = a+b
\tENDIF
\tf
ENDFN
z = CALL fib(6)
z
";
  assert_eq!(eval_program(source), 8);
}

#[test]
fn zero_argument_call() {
  let source = "
FN five()
\t5
ENDFN
z = CALL five()
z
";
  assert_eq!(eval_program(source), 5);
}

#[test]
fn call_arguments_may_be_literals() {
  let source = "
FN sub(a b)
\ta - b
ENDFN
CALL sub(9 3)
";
  assert_eq!(eval_program(source), 6);
}

#[test]
fn double_negation_cancels() {
  assert_eq!(eval_program("--5"), 5);
}

#[test]
fn exponentiation_is_left_associative() {
  assert_eq!(eval_program("2^3^2"), 64);
}

#[test]
fn exponentiation_by_zero_yields_one() {
  assert_eq!(eval_program("2^0"), 1);
  assert_eq!(eval_program("0^0"), 1);
}

#[test]
fn exponentiation_handles_larger_powers() {
  assert_eq!(eval_program("2^10"), 1024);
}

#[test]
fn relational_results_are_zero_or_one() {
  assert_eq!(eval_program("1 < 2"), 1);
  assert_eq!(eval_program("1 > 2"), 0);
  assert_eq!(eval_program("2 <= 2"), 1);
  assert_eq!(eval_program("2 >= 3"), 0);
  assert_eq!(eval_program("3 == 3"), 1);
  assert_eq!(eval_program("3 != 3"), 0);
}

#[test]
fn division_truncates_toward_zero() {
  assert_eq!(eval_program("(0-7)/2"), -3);
  assert_eq!(eval_program("7/(0-2)"), -3);
}

#[test]
fn addition_wraps_at_the_64_bit_boundary() {
  assert_eq!(
    eval_program("9223372036854775807 + 1"),
    i64::MIN
  );
}
