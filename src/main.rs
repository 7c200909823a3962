//! Robot assembly runner.
//!
//! Assembles a source file (or loads an assembled image), runs it on the
//! emulator worker and prints the movement commands the program issued.
//!
//! # Usage
//! ```text
//! asmbot <program> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `program`: Assembly source, or a `.bin` image produced by `assembler`
//!
//! # Options
//! - `--max-steps <n>`: Step budget (defaults to `ASMBOT_MAX_STEPS` or 100000)
//! - `--trace`: Step one instruction at a time, printing each
//! - `--back <n>`: Step back `n` instructions after the run
//!
//! Ctrl+C stops the run at the next step boundary.

use asmbot::machine::assembler::render_diagnostic;
use asmbot::machine::isa::Instruction;
use asmbot::machine::program::Program;
use asmbot::machine::state::{EngineState, RunSummary, StepReport};
use asmbot::machine::worker::{EmulatorHandle, WorkerError};
use asmbot::utils::log::{Level, set_min_level};
use asmbot::{error, info, warn};
use std::env;
use std::fs;
use std::path::Path;
use std::process;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const DEFAULT_MAX_STEPS: u64 = 100_000;

#[tokio::main]
async fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    if let Ok(level) = env::var("ASMBOT_LOG") {
        match level.parse::<Level>() {
            Ok(level) => set_min_level(level),
            Err(e) => warn!("ASMBOT_LOG: {e}"),
        }
    }

    let input_path = &args[1];
    let mut max_steps: Option<u64> = None;
    let mut trace = false;
    let mut back = 0usize;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            "--max-steps" => {
                i += 1;
                max_steps = Some(parse_arg("--max-steps", args.get(i)));
                i += 1;
            }
            "--back" => {
                i += 1;
                back = parse_arg("--back", args.get(i));
                i += 1;
            }
            "--trace" => {
                trace = true;
                i += 1;
            }
            other => {
                eprintln!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let max_steps = max_steps.unwrap_or_else(|| match env::var("ASMBOT_MAX_STEPS") {
        Ok(value) => value.parse().unwrap_or_else(|_| {
            error!("ASMBOT_MAX_STEPS is not a number: {value}");
            process::exit(1);
        }),
        Err(_) => DEFAULT_MAX_STEPS,
    });

    let handle = EmulatorHandle::spawn();
    load(&handle, input_path).await;

    let interrupted = Arc::new(AtomicBool::new(false));
    {
        let handle = handle.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Ctrl+C received, stopping at the next step boundary");
                interrupted.store(true, Ordering::Release);
                handle.cancel();
            }
        });
    }

    let outcome = if trace {
        trace_run(&handle, max_steps, &interrupted).await
    } else {
        handle.run(max_steps).await
    };

    let mut failed = false;
    match outcome {
        Ok(summary) => report_run(&summary, max_steps),
        Err(WorkerError::Cancelled) => warn!("Run cancelled"),
        Err(e) => {
            error!("{e}");
            failed = true;
        }
    }

    for n in 1..=back {
        match handle.step_back().await {
            Ok(report) => println!("back {n:>3}: {}", describe(&report)),
            Err(e) => {
                warn!("Cannot step back: {e}");
                break;
            }
        }
    }

    match handle.registers().await {
        Ok(registers) => println!("{registers}"),
        Err(e) => error!("{e}"),
    }

    if failed {
        process::exit(1);
    }
}

/// Loads `path` into the worker: an image when it has the `.bin` extension,
/// assembly source otherwise. Exits on failure.
async fn load(handle: &EmulatorHandle, path: &str) {
    let is_image = Path::new(path).extension().is_some_and(|ext| ext == "bin");

    let loaded = if is_image {
        let bytes = fs::read(path).unwrap_or_else(|e| {
            error!("Failed to read {}: {}", path, e);
            process::exit(1);
        });
        let program = Program::from_bytes(&bytes).unwrap_or_else(|e| {
            error!("{}: {}", path, e);
            process::exit(1);
        });
        handle.load_program(program).await
    } else {
        let source = fs::read_to_string(path).unwrap_or_else(|e| {
            error!("Failed to read {}: {}", path, e);
            process::exit(1);
        });
        match handle.load_source(source.as_str()).await {
            Err(WorkerError::Assembly(e)) => {
                eprintln!("{}", render_diagnostic(path, &source, &e));
                error!("Assembly failed");
                process::exit(1);
            }
            other => other,
        }
    };

    if let Err(e) = loaded {
        error!("Failed to load {}: {}", path, e);
        process::exit(1);
    }
    info!("Loaded {}", path);
}

/// Steps one instruction at a time, printing each before it executes.
async fn trace_run(
    handle: &EmulatorHandle,
    max_steps: u64,
    interrupted: &AtomicBool,
) -> Result<RunSummary, WorkerError> {
    let mut summary = RunSummary {
        steps: 0,
        halted: false,
        stores: Vec::new(),
    };
    while summary.steps < max_steps {
        if interrupted.load(Ordering::Acquire) {
            return Err(WorkerError::Cancelled);
        }
        let pc = handle.registers().await?.pc;
        let text = match handle.read_memory(pc, 4).await {
            Ok(bytes) => {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(&bytes);
                match Instruction::decode(u32::from_le_bytes(raw)) {
                    Ok(instr) => instr.to_string(),
                    Err(reason) => format!("?? ({reason})"),
                }
            }
            Err(_) => "??".to_string(),
        };
        println!("{pc:#010x}  {text}");

        let report = handle.step().await?;
        for store in &report.stores {
            if let Some(command) = store.mailbox_command() {
                println!("            -> {command}");
            }
        }
        summary.steps += 1;
        summary.stores.extend(report.stores);
        if report.snapshot.state == EngineState::Halted {
            summary.halted = true;
            break;
        }
    }
    Ok(summary)
}

fn report_run(summary: &RunSummary, max_steps: u64) {
    let commands: Vec<String> = summary.commands().map(|c| c.to_string()).collect();
    if commands.is_empty() {
        println!("commands: (none)");
    } else {
        println!("commands: {}", commands.join(" "));
    }
    if summary.halted {
        info!("Halted after {} steps", summary.steps);
    } else {
        warn!("Step budget of {} exhausted without halting", max_steps);
    }
}

fn describe(report: &StepReport) -> String {
    match report.line {
        Some(line) => format!("pc={:#010x} line {}", report.pc, line),
        None => format!("pc={:#010x}", report.pc),
    }
}

fn parse_arg<T: std::str::FromStr>(flag: &str, value: Option<&String>) -> T {
    let Some(value) = value else {
        eprintln!("{flag} requires an argument");
        process::exit(1);
    };
    value.parse().unwrap_or_else(|_| {
        eprintln!("{flag}: invalid number '{value}'");
        process::exit(1);
    })
}

const USAGE: &str = "\
Robot Assembly Runner

USAGE:
    {program} <program> [OPTIONS]

ARGS:
    <program>    Assembly source, or a .bin image built by `assembler`

OPTIONS:
    --max-steps <n>    Step budget (defaults to 100000)
    --trace            Print each instruction as it executes
    --back <n>         Step back n instructions after the run
    -h, --help         Print this help message

ENVIRONMENT:
    ASMBOT_MAX_STEPS    Step budget when --max-steps is not given
    ASMBOT_LOG          Minimum log level (debug, info, warn, error)

EXAMPLES:
    # Run a program until it halts
    {program} square.asm

    # Watch every step, then rewind the last three
    {program} square.asm --trace --back 3

    # Run an assembled image with a small budget
    {program} square.bin --max-steps 500
";

/// Prints usage information to stderr.
fn print_usage(program: &str) {
    eprintln!("{}", USAGE.replace("{program}", program));
}
