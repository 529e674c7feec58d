use std::env;
use std::fs;
use std::io;
use std::process;

const USAGE: &str = "usage: smcc [-o <output>] [<input>]

Compiles a program read from <input> (or standard input) and writes
x86-64 AT&T assembly to <output> (or standard output).";

fn main() {
  smcc::logging::init();

  match run(env::args().skip(1).collect()) {
    Ok(()) => {}
    Err(err) => {
      eprintln!("{err}");
      process::exit(1);
    }
  }
}

fn run(args: Vec<String>) -> Result<(), String> {
  let mut input: Option<String> = None;
  let mut output: Option<String> = None;

  let mut i = 0;
  while i < args.len() {
    match args[i].as_str() {
      "-h" | "--help" => {
        println!("{USAGE}");
        return Ok(());
      }
      "-o" => {
        i += 1;
        match args.get(i) {
          Some(path) => output = Some(path.clone()),
          None => return Err(format!("-o requires an argument\n\n{USAGE}")),
        }
      }
      flag if flag.starts_with('-') => {
        return Err(format!("unknown flag '{flag}'\n\n{USAGE}"));
      }
      path => {
        if input.is_some() {
          return Err(format!("more than one input file\n\n{USAGE}"));
        }
        input = Some(path.to_string());
      }
    }
    i += 1;
  }

  let source = match &input {
    Some(path) => {
      fs::read_to_string(path).map_err(|err| format!("failed to read '{path}': {err}"))?
    }
    None => io::read_to_string(io::stdin())
      .map_err(|err| format!("failed to read standard input: {err}"))?,
  };

  let asm = smcc::generate_assembly(&source).map_err(|err| err.to_string())?;

  match &output {
    Some(path) => {
      fs::write(path, &asm).map_err(|err| format!("failed to write '{path}': {err}"))?
    }
    None => print!("{asm}"),
  }
  Ok(())
}
