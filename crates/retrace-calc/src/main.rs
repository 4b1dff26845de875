#![forbid(unsafe_code)]

//! Interactive REPL for the undoable calculator.
//!
//! ```text
//! > +5
//! = 5
//! > *3
//! = 15
//! > undo
//! = 5
//! ```

use std::io::{self, BufRead, BufReader, BufWriter, Write};

use tracing_subscriber::EnvFilter;

use retrace_calc::{ArithKind, Calculator};

const HISTORY_FILE: &str = "calc-history.jsonl";

fn print_help() {
    println!("commands:");
    println!("  +N -N *N /N   apply an arithmetic step");
    println!("  undo [N]      undo the last N steps (default 1)");
    println!("  redo [N]      redo the last N steps (default 1)");
    println!("  history       show undo/redo depths and labels");
    println!("  save          write history to {HISTORY_FILE}");
    println!("  load          read history from {HISTORY_FILE}");
    println!("  quit          exit");
}

fn parse_count(arg: Option<&str>) -> usize {
    arg.and_then(|s| s.parse().ok()).unwrap_or(1)
}

fn handle_line(calc: &mut Calculator, line: &str) -> bool {
    let line = line.trim();
    if line.is_empty() {
        return true;
    }

    let mut parts = line.split_whitespace();
    let command = match parts.next() {
        Some(c) => c,
        None => return true,
    };

    match command {
        "quit" | "exit" => return false,
        "help" => print_help(),
        "undo" => match calc.undo(parse_count(parts.next())) {
            Ok(n) => println!("undid {n} step(s), = {}", calc.value()),
            Err(e) => eprintln!("error: {e}"),
        },
        "redo" => match calc.redo(parse_count(parts.next())) {
            Ok(n) => println!("redid {n} step(s), = {}", calc.value()),
            Err(e) => eprintln!("error: {e}"),
        },
        "history" => {
            let history = calc.history();
            println!(
                "undo: {} (next: {:?}), redo: {} (next: {:?})",
                history.count_undo(),
                history.undo_label(),
                history.count_redo(),
                history.redo_label(),
            );
        }
        "save" => {
            let result = std::fs::File::create(HISTORY_FILE)
                .map_err(retrace::CodecError::from)
                .and_then(|file| calc.save(BufWriter::new(file)));
            match result {
                Ok(()) => println!("saved to {HISTORY_FILE}"),
                Err(e) => eprintln!("error: {e}"),
            }
        }
        "load" => {
            let result = std::fs::File::open(HISTORY_FILE)
                .map_err(retrace::CodecError::from)
                .and_then(|file| calc.load(BufReader::new(file)));
            match result {
                Ok(()) => println!(
                    "loaded {} undo / {} redo entries",
                    calc.history().count_undo(),
                    calc.history().count_redo()
                ),
                Err(e) => eprintln!("error: {e}"),
            }
        }
        step => {
            let mut chars = step.chars();
            let kind = chars.next().and_then(ArithKind::from_symbol);
            let operand: Option<i64> = chars.as_str().parse().ok();
            match (kind, operand) {
                (Some(kind), Some(operand)) => match calc.apply(kind, operand) {
                    Ok(()) => println!("= {}", calc.value()),
                    Err(e) => eprintln!("error: {e}"),
                },
                _ => {
                    eprintln!("unrecognized input {step:?}; try 'help'");
                }
            }
        }
    }
    true
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let mut calc = Calculator::new();
    calc.bus()
        .subscribe(|value| tracing::debug!(value, "value posted"));
    println!("undoable calculator; 'help' for commands");

    let stdin = io::stdin();
    let mut stdout = io::stdout();
    loop {
        print!("> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        if !handle_line(&mut calc, &line) {
            break;
        }
    }
    Ok(())
}
