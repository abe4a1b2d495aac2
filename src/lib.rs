//! # bfc - Brainfuck Compiler
//!
//! An ahead-of-time compiler turning Brainfuck programs into standalone,
//! statically linked Linux x86-64 executables. No interpreter, no runtime
//! library, no external assembler or linker: the crate encodes the machine
//! code itself and wraps it in a minimal ELF64 image.
//!
//! ## Pipeline
//!
//! ```text
//! source bytes → X64Codegen → machine code + BSS size → Elf64Builder → ELF image
//! ```
//!
//! ## Example
//!
//! ```
//! let image = bfc::compile(b"+++.").expect("compilation failed");
//! assert_eq!(&image[0..4], &[0x7F, b'E', b'L', b'F']);
//! ```
//!
//! The six supported operators are `+ - > < . [ ]`; every other byte is a
//! comment. Input (`,`) is not supported.

pub mod x64;

use thiserror::Error;

pub use x64::{CodeBuffer, Elf64Builder, Reg64, X64Codegen};

/// Compilation error types
#[derive(Error, Debug)]
pub enum BfcError {
    #[error("unbalanced brackets: {opened} '[' opened, {closed} ']' closed")]
    UnbalancedBrackets { opened: usize, closed: usize },

    #[error("jump displacement {distance} does not fit in 32 bits")]
    JumpOutOfRange { distance: i64 },

    #[error("forward branch {id} was never reserved or is already patched")]
    UnknownBranch { id: usize },
}

/// Result type for compiler operations
pub type Result<T> = std::result::Result<T, BfcError>;

/// Compile Brainfuck source to a Linux x86-64 ELF executable image.
///
/// The returned bytes are a complete binary: write them to a file, set the
/// executable bit, and run. The generated program writes to stdout through
/// legacy `int 0x80` system calls and exits with status 0.
pub fn compile(source: &[u8]) -> Result<Vec<u8>> {
    let mut codegen = X64Codegen::new();
    codegen.compile_executable(source)
}
