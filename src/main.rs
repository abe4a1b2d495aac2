//! bfc Compiler CLI
//!
//! Compiles a Brainfuck source file into a standalone Linux x86-64
//! executable.

use clap::Parser;
use colored::Colorize;
use std::ffi::OsStr;
use std::fs;
use std::path::PathBuf;
use std::process::ExitCode;

use bfc::{compile, x64::elf};

#[derive(Parser)]
#[command(name = "bfc")]
#[command(version)]
#[command(about = "Brainfuck compiler - emits standalone Linux x86-64 executables", long_about = None)]
struct Cli {
    /// Input Brainfuck source file
    #[arg(
        value_name = "FILE",
        required_unless_present = "file",
        conflicts_with = "file"
    )]
    input: Option<PathBuf>,

    /// Input Brainfuck source file (flag form)
    #[arg(short = 'f', long = "file", value_name = "FILE")]
    file: Option<PathBuf>,

    /// Output binary path; defaults to the input basename without extension
    #[arg(short, long, value_name = "PATH")]
    output: Option<PathBuf>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    // clap guarantees one of the two: `input` is required unless `file`
    // is present, and the two conflict.
    let input = cli.input.or(cli.file).expect("input path enforced by clap");

    let output = cli.output.unwrap_or_else(|| {
        let stem = input.file_stem().unwrap_or_else(|| OsStr::new("a.out"));
        PathBuf::from(stem)
    });

    let source = match fs::read(&input) {
        Ok(bytes) => bytes,
        Err(e) => {
            eprintln!(
                "{}: could not read '{}': {}",
                "error".red().bold(),
                input.display(),
                e
            );
            return ExitCode::FAILURE;
        }
    };

    let image = match compile(&source) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("{}: {}", "error".red().bold(), e);
            return ExitCode::FAILURE;
        }
    };

    if let Err(e) = elf::write_executable(&output, &image) {
        eprintln!(
            "{}: could not write '{}': {}",
            "error".red().bold(),
            output.display(),
            e
        );
        return ExitCode::FAILURE;
    }

    println!(
        "{} {} -> {}",
        "Compiled".green().bold(),
        input.display(),
        output.display()
    );
    ExitCode::SUCCESS
}
