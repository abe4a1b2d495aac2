//! x64 Register Definitions
//!
//! All 16 general-purpose 64-bit registers with encoding values.

use std::fmt;

/// x64 64-bit general purpose register
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Reg64 {
    RAX = 0,
    RCX = 1,
    RDX = 2,
    RBX = 3,
    RSP = 4,
    RBP = 5,
    RSI = 6,
    RDI = 7,
    R8 = 8,
    R9 = 9,
    R10 = 10,
    R11 = 11,
    R12 = 12,
    R13 = 13,
    R14 = 14,
    R15 = 15,
}

impl Reg64 {
    /// Get the 3-bit encoding for ModR/M bytes
    #[inline]
    pub fn encoding(self) -> u8 {
        (self as u8) & 0x07
    }

    /// Check if this register requires a REX.B or REX.R bit (r8-r15)
    #[inline]
    pub fn needs_rex_ext(self) -> bool {
        (self as u8) >= 8
    }
}

impl fmt::Display for Reg64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Reg64::RAX => "rax",
            Reg64::RCX => "rcx",
            Reg64::RDX => "rdx",
            Reg64::RBX => "rbx",
            Reg64::RSP => "rsp",
            Reg64::RBP => "rbp",
            Reg64::RSI => "rsi",
            Reg64::RDI => "rdi",
            Reg64::R8 => "r8",
            Reg64::R9 => "r9",
            Reg64::R10 => "r10",
            Reg64::R11 => "r11",
            Reg64::R12 => "r12",
            Reg64::R13 => "r13",
            Reg64::R14 => "r14",
            Reg64::R15 => "r15",
        };
        write!(f, "{}", name)
    }
}
