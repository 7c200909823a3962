//! Assembly to program image compiler CLI.
//!
//! Reads a robot assembly source file and writes the assembled program image.
//!
//! # Usage
//! ```text
//! assembler <input.asm> [OPTIONS]
//! ```
//!
//! # Arguments
//! - `input.asm`: Assembly source file to compile
//!
//! # Options
//! - `-o, --output <file>`: Output file path (defaults to `<input>.bin`)
//! - `-l, --listing`: Print the disassembly listing to stdout
//!
//! # Examples
//! ```text
//! assembler square.asm
//! assembler square.asm -o square.bin
//! assembler square.asm --listing
//! ```

use asmbot::machine::assembler::{assemble, render_diagnostic};
use asmbot::{error, info};
use std::env;
use std::fs;
use std::path::Path;
use std::process;

fn main() {
    let args: Vec<String> = env::args().collect();

    if args.len() < 2 || args[1] == "--help" || args[1] == "-h" {
        print_usage(&args[0]);
        process::exit(if args.len() < 2 { 1 } else { 0 });
    }

    let input_path = &args[1];
    let mut output_path: Option<String> = None;
    let mut listing = false;

    let mut i = 2;
    while i < args.len() {
        match args[i].as_str() {
            k @ ("--output" | "-o") => {
                i += 1;
                if i >= args.len() {
                    error!("{k} requires an argument");
                    process::exit(1);
                }
                output_path = Some(args[i].clone());
                i += 1;
            }
            "--listing" | "-l" => {
                listing = true;
                i += 1;
            }
            other => {
                error!("Unexpected argument: {}\n", other);
                print_usage(&args[0]);
                process::exit(1);
            }
        }
    }

    let source = match fs::read_to_string(input_path) {
        Ok(source) => source,
        Err(e) => {
            error!("Failed to read {}: {}", input_path, e);
            process::exit(1);
        }
    };

    let output_path = output_path.unwrap_or_else(|| {
        let p = Path::new(input_path);
        let stem = p.file_stem().unwrap_or_default().to_string_lossy();
        let parent = p.parent().unwrap_or(Path::new("."));
        parent
            .join(format!("{}.bin", stem))
            .to_string_lossy()
            .into_owned()
    });

    if let Some(parent) = Path::new(&output_path).parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        error!("Output directory does not exist: {}", parent.display());
        process::exit(1);
    }

    let program = match assemble(&source) {
        Ok(p) => p,
        Err(e) => {
            eprintln!("{}", render_diagnostic(input_path, &source, &e));
            error!("Assembly failed");
            process::exit(1);
        }
    };

    if listing {
        print!("{}", program.listing(Some(&source)));
    }

    let image = program.to_bytes();

    if let Err(e) = fs::write(&output_path, &image) {
        error!("Failed to write output file: {}", e);
        process::exit(1);
    }

    info!(
        "Compiled {} -> {} ({} instructions, {} data bytes, {} bytes)",
        input_path,
        output_path,
        program.len(),
        program.data.len(),
        image.len()
    );
}

const USAGE: &str = "\
Robot Assembly Compiler

USAGE:
    {program} <input.asm> [OPTIONS]

ARGS:
    <input.asm>    Assembly source file to compile

OPTIONS:
    -o, --output <file>    Output file path (defaults to <input>.bin)
    -l, --listing          Print the disassembly listing
    -h, --help             Print this help message

EXAMPLES:
    # Compile to default output name
    {program} square.asm

    # Compile with explicit output
    {program} square.asm -o square.bin

    # Compile and show what each line became
    {program} square.asm --listing
";

fn print_usage(program: &str) {
    info!("{}", USAGE.replace("{program}", program));
}
