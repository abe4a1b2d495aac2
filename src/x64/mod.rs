//! x64 Native Code Generation Backend
//!
//! Direct x64 machine code generation without runtime dependencies.
//!
//! ## Architecture
//!
//! ```text
//! Brainfuck source → X64Codegen → CodeBuffer → Elf64Builder → Native Executable
//! ```
//!
//! ## Modules
//!
//! - `registers`: x64 register definitions and encoding
//! - `encoding`: x64 instruction encoding (REX, ModR/M, displacements)
//! - `elf`: ELF64 executable generation (Linux)
//! - `codegen`: Brainfuck to x64 translation

pub mod codegen;
pub mod elf;
pub mod encoding;
pub mod registers;

pub use codegen::X64Codegen;
pub use elf::Elf64Builder;
pub use encoding::CodeBuffer;
pub use registers::Reg64;
