//! Brainfuck to x64 Code Generation
//!
//! Translates Brainfuck source directly to native x64 machine code, one
//! fixed template per operator. The data pointer lives in `rax` for the
//! whole program; loops compare the current cell against zero at both
//! ends, with the forward branch of `[` patched when the matching `]`
//! arrives.

use super::encoding::CodeBuffer;
use super::registers::Reg64;
use crate::{BfcError, Result};

/// Legacy (`int 0x80`) Linux syscall numbers used by the generated code
pub mod syscall {
    pub const SYS_EXIT: u32 = 1;
    pub const SYS_WRITE: u32 = 4;

    // File descriptors
    pub const STDOUT: u32 = 1;
}

/// Bytes reserved in BSS for the cell region
const CELL_REGION_SIZE: u32 = 1024 * 64;

/// Distance the data pointer moves per `>`/`<`. Cells are accessed as
/// 8-byte quantities but the stride is 64; the region above holds 1024
/// positions at that stride.
const CELL_STRIDE: u32 = 64;

/// One open loop: where its comparison starts and which reserved forward
/// branch skips the body. `resolved` flips when a `]` claims the entry.
#[derive(Debug)]
struct LoopEntry {
    entry_offset: usize,
    branch_id: usize,
    resolved: bool,
}

/// x64 code generator for Brainfuck programs
pub struct X64Codegen {
    code: CodeBuffer,
    loops: Vec<LoopEntry>,
    /// Code offset of the write-one-byte subroutine
    output_routine: usize,
}

impl X64Codegen {
    pub fn new() -> Self {
        Self {
            code: CodeBuffer::with_capacity(4096),
            loops: Vec::new(),
            output_routine: 0,
        }
    }

    /// Compile a Brainfuck program into a complete ELF64 executable image.
    ///
    /// Bytes outside `+-><.[]` are comments. Bracket balance is checked
    /// after the walk; an unbalanced program yields an error and no image.
    pub fn compile_executable(&mut self, source: &[u8]) -> Result<Vec<u8>> {
        self.emit_prologue();

        let mut opened: usize = 0;
        let mut closed: usize = 0;
        let mut stray_close = false;
        for &byte in source {
            match byte {
                b'+' => self.code.inc_m64(Reg64::RAX, 0),
                b'-' => self.code.dec_m64(Reg64::RAX, 0),
                b'>' => self.code.add_r64_imm32(Reg64::RAX, CELL_STRIDE),
                b'<' => self.code.sub_r64_imm32(Reg64::RAX, CELL_STRIDE),
                b'.' => self.emit_output()?,
                b'[' => {
                    opened += 1;
                    self.emit_loop_open();
                }
                b']' => {
                    closed += 1;
                    if !self.emit_loop_close()? {
                        stray_close = true;
                    }
                }
                _ => {} // comment
            }
        }

        if opened != closed || stray_close {
            return Err(BfcError::UnbalancedBrackets { opened, closed });
        }

        self.emit_epilogue();
        Ok(self.code.build())
    }

    /// The emitted machine code so far
    pub fn code(&self) -> &[u8] {
        self.code.code()
    }

    /// Total BSS reservation
    pub fn bss_size(&self) -> u32 {
        self.code.bss_size()
    }

    /// Cell region, output subroutine (skipped over by the entry jump),
    /// and register initialization.
    fn emit_prologue(&mut self) {
        use super::registers::Reg64::*;

        let cells_addr = self.code.bss_add(CELL_REGION_SIZE);

        // Entry point: hop over the output subroutine.
        let skip = self.code.jmp_rel8();
        self.output_routine = self.code.offset();

        // write(stdout, cell, 1); the caller leaves the cell address in rax.
        self.code.mov_r64_r64(RCX, RAX);
        self.code.mov_r64_imm32(RAX, syscall::SYS_WRITE);
        self.code.mov_r64_imm32(RBX, syscall::STDOUT);
        self.code.mov_r64_imm32(RDX, 1); // one byte per call
        self.code.interrupt(0x80);
        self.code.ret();

        // Skip distance comes from what was actually emitted.
        self.code
            .patch_u8(skip, (self.code.offset() - self.output_routine) as u8);

        self.code.mov_r64_imm32(RAX, cells_addr); // data pointer
        self.code.mov_r64_imm32(R15, 0); // output scratch
    }

    /// `.`: the syscall convention clobbers rax, so the data pointer
    /// rides in r14 across the call.
    fn emit_output(&mut self) -> Result<()> {
        self.code.mov_r64_r64(Reg64::R14, Reg64::RAX);
        self.code.call(self.output_routine)?;
        self.code.mov_r64_r64(Reg64::RAX, Reg64::R14);
        Ok(())
    }

    /// `[`: compare the cell, reserve the forward branch past the body.
    fn emit_loop_open(&mut self) {
        let entry_offset = self.code.offset();
        self.code.cmp_m64_imm32(Reg64::RAX, 0);
        let branch_id = self.code.reserve_forward_je();
        self.loops.push(LoopEntry {
            entry_offset,
            branch_id,
            resolved: false,
        });
    }

    /// `]`: close the innermost unresolved loop. Compare the cell, jump
    /// back to the loop head when nonzero, and point the reserved forward
    /// branch just past the back-jump. Returns false for a stray `]` with
    /// no loop left to close (nothing is emitted for it).
    fn emit_loop_close(&mut self) -> Result<bool> {
        let (entry_offset, branch_id) =
            match self.loops.iter_mut().rev().find(|entry| !entry.resolved) {
                Some(entry) => {
                    entry.resolved = true;
                    (entry.entry_offset, entry.branch_id)
                }
                None => return Ok(false),
            };

        self.code.cmp_m64_imm32(Reg64::RAX, 0);
        let back_len = self.code.jne_back(entry_offset)?;
        self.code
            .patch_forward_je(branch_id, self.code.offset(), back_len)?;
        Ok(true)
    }

    /// exit(0)
    fn emit_epilogue(&mut self) {
        use super::registers::Reg64::*;

        self.code.mov_r64_imm32(RAX, syscall::SYS_EXIT);
        self.code.mov_r64_imm32(RBX, 0); // exit status
        self.code.interrupt(0x80);
    }
}

impl Default for X64Codegen {
    fn default() -> Self {
        Self::new()
    }
}
