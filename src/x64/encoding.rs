//! x64 Instruction Encoding
//!
//! Direct machine code generation for x64 instructions.
//! No external assembler dependency.
//!
//! ## Instruction Format
//!
//! ```text
//! [REX] [Opcode] [ModR/M] [Disp] [Imm]
//! ```
//!
//! Every instruction emitted here operates on 64-bit quantities, so the
//! REX.W bit is always set. Memory operands are `[base + disp]` with an
//! unsigned 32-bit displacement; the single-byte displacement form is
//! selected when the value is below 128. SIB addressing is not used.

use std::collections::HashMap;

use super::elf::{consts, Elf64Builder};
use super::registers::Reg64;
use crate::{BfcError, Result};

/// Placeholder bytes reserved for a forward conditional jump. The long
/// `0F 84 cd` form needs six; the remainder stays NOP if the patched
/// form is shorter.
const FORWARD_JE_RESERVED: usize = 8;

/// Machine code buffer for emitting instructions.
///
/// Also owns the BSS allocation cursor and the bookkeeping for forward
/// jumps whose displacement is patched in after the target is known.
#[derive(Debug, Default)]
pub struct CodeBuffer {
    code: Vec<u8>,
    bss_cursor: u32,
    next_branch_id: usize,
    /// Branch id -> buffer index of the reserved placeholder
    reserved_branches: HashMap<usize, usize>,
}

impl CodeBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            code: Vec::with_capacity(capacity),
            ..Self::default()
        }
    }

    /// Get current code offset
    #[inline]
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    /// Emit a single byte
    #[inline]
    pub fn emit(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit multiple bytes
    #[inline]
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Emit a 32-bit little-endian value
    #[inline]
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit a signed 32-bit little-endian value
    #[inline]
    pub fn emit_i32(&mut self, value: i32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Patch a single byte at the given offset
    pub fn patch_u8(&mut self, offset: usize, value: u8) {
        self.code[offset] = value;
    }

    /// Get the generated code
    pub fn code(&self) -> &[u8] {
        &self.code
    }
}

/// REX prefix builder
#[derive(Debug, Clone, Copy, Default)]
pub struct Rex {
    w: bool, // 64-bit operand size
    r: bool, // ModR/M reg extension
    x: bool, // SIB index extension
    b: bool, // ModR/M r/m or base extension
}

impl Rex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set W bit (64-bit operand size)
    pub fn w(mut self) -> Self {
        self.w = true;
        self
    }

    /// Set R bit (reg field extension for r8-r15)
    pub fn r(mut self) -> Self {
        self.r = true;
        self
    }

    /// Set B bit (r/m or base field extension for r8-r15)
    pub fn b(mut self) -> Self {
        self.b = true;
        self
    }

    /// Encode to byte (0x40-0x4F)
    pub fn encode(&self) -> u8 {
        0x40 | ((self.w as u8) << 3)
            | ((self.r as u8) << 2)
            | ((self.x as u8) << 1)
            | (self.b as u8)
    }
}

/// ModR/M byte builder
#[derive(Debug, Clone, Copy)]
pub struct ModRM {
    mod_: u8, // 2 bits: addressing mode
    reg: u8,  // 3 bits: register or opcode extension
    rm: u8,   // 3 bits: register or memory operand
}

impl ModRM {
    /// Create ModR/M for register-to-register (mod=11)
    pub fn reg_reg(reg: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for register with opcode extension (mod=11)
    pub fn reg_opext(opext: u8, rm: u8) -> Self {
        Self {
            mod_: 0b11,
            reg: opext & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for register-indirect memory, no displacement (mod=00)
    pub fn indirect(reg: u8, rm: u8) -> Self {
        Self {
            mod_: 0b00,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for memory with an 8-bit displacement (mod=01)
    pub fn indirect_disp8(reg: u8, rm: u8) -> Self {
        Self {
            mod_: 0b01,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Create ModR/M for memory with a 32-bit displacement (mod=10)
    pub fn indirect_disp32(reg: u8, rm: u8) -> Self {
        Self {
            mod_: 0b10,
            reg: reg & 0x07,
            rm: rm & 0x07,
        }
    }

    /// Encode to byte
    pub fn encode(&self) -> u8 {
        (self.mod_ << 6) | (self.reg << 3) | self.rm
    }
}

/// x64 instruction emitter
impl CodeBuffer {
    /// Emit a ModR/M memory operand, selecting the displacement width by
    /// magnitude: one byte below 128, four bytes otherwise. The comparison
    /// is unsigned; negative displacements are not representable.
    fn emit_modrm_disp(&mut self, reg_field: u8, base: u8, disp: u32) {
        if disp < 128 {
            self.emit(ModRM::indirect_disp8(reg_field, base).encode());
            self.emit(disp as u8);
        } else {
            self.emit(ModRM::indirect_disp32(reg_field, base).encode());
            self.emit_u32(disp);
        }
    }

    // ==================== Data Movement ====================

    /// MOV r64, imm32 (zero-padded 32-bit immediate)
    pub fn mov_r64_imm32(&mut self, dst: Reg64, imm: u32) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xC7); // C7 /0
        self.emit(ModRM::reg_opext(0, dst.encoding()).encode());
        self.emit_u32(imm);
    }

    /// MOV r64, r64
    pub fn mov_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x89); // 89 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }

    /// MOV [base + disp], r64
    pub fn mov_m64_r64(&mut self, base: Reg64, disp: u32, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if base.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x89); // 89 /r
        self.emit_modrm_disp(src.encoding(), base.encoding(), disp);
    }

    /// MOV r64, [base + disp]
    pub fn mov_r64_m64(&mut self, dst: Reg64, base: Reg64, disp: u32) {
        self.load_op_r64_m64(0x8B, dst, base, disp); // 8B /r
    }

    // ==================== Arithmetic & Comparison ====================

    /// Common body of the "op r64, imm" family (`83 /n ib` / `81 /n id`).
    /// ADD, SUB and CMP against RAX with a 32-bit immediate have a shorter
    /// one-opcode form with no ModR/M byte; it applies only when the
    /// immediate is too large for the sign-extended-byte encoding.
    fn arith_r64_imm32(&mut self, dst: Reg64, imm: u32, opext: u8, rax_opcode: u8) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        if dst == Reg64::RAX && imm >= 128 {
            self.emit(rax_opcode);
        } else {
            if imm < 128 {
                self.emit(0x83); // 83 /n ib
            } else {
                self.emit(0x81); // 81 /n id
            }
            self.emit(ModRM::reg_opext(opext, dst.encoding()).encode());
        }
        if imm < 128 {
            self.emit(imm as u8);
        } else {
            self.emit_u32(imm);
        }
    }

    /// Common body of the "op [base + disp], r64" family. A zero
    /// displacement collapses to the bare register-indirect form.
    fn store_op_m64_r64(&mut self, opcode: u8, base: Reg64, disp: u32, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if base.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(opcode);
        if disp == 0 {
            self.emit(ModRM::indirect(src.encoding(), base.encoding()).encode());
        } else {
            self.emit_modrm_disp(src.encoding(), base.encoding(), disp);
        }
    }

    /// Common body of the "op r64, [base + disp]" family. The destination
    /// register occupies the ModR/M `reg` slot and drives REX.R; the base
    /// occupies `r/m` and drives REX.B, the mirror image of the
    /// store-direction family.
    fn load_op_r64_m64(&mut self, opcode: u8, dst: Reg64, base: Reg64, disp: u32) {
        let mut rex = Rex::new().w();
        if dst.needs_rex_ext() {
            rex = rex.r();
        }
        if base.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(opcode);
        if disp == 0 {
            self.emit(ModRM::indirect(dst.encoding(), base.encoding()).encode());
        } else {
            self.emit_modrm_disp(dst.encoding(), base.encoding(), disp);
        }
    }

    /// ADD r64, imm32 (`83 /0 ib`, `81 /0 id`, or `05 id` for RAX)
    pub fn add_r64_imm32(&mut self, dst: Reg64, imm: u32) {
        self.arith_r64_imm32(dst, imm, 0, 0x05);
    }

    /// ADD r64, r64
    pub fn add_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x01); // 01 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }

    /// ADD [base + disp], r64
    pub fn add_m64_r64(&mut self, base: Reg64, disp: u32, src: Reg64) {
        self.store_op_m64_r64(0x01, base, disp, src); // 01 /r
    }

    /// ADD r64, [base + disp]
    pub fn add_r64_m64(&mut self, dst: Reg64, base: Reg64, disp: u32) {
        self.load_op_r64_m64(0x03, dst, base, disp); // 03 /r
    }

    /// SUB r64, imm32 (`83 /5 ib`, `81 /5 id`, or `2D id` for RAX)
    pub fn sub_r64_imm32(&mut self, dst: Reg64, imm: u32) {
        self.arith_r64_imm32(dst, imm, 5, 0x2D);
    }

    /// SUB r64, r64
    pub fn sub_r64_r64(&mut self, dst: Reg64, src: Reg64) {
        let mut rex = Rex::new().w();
        if src.needs_rex_ext() {
            rex = rex.r();
        }
        if dst.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x29); // 29 /r
        self.emit(ModRM::reg_reg(src.encoding(), dst.encoding()).encode());
    }

    /// SUB [base + disp], r64
    pub fn sub_m64_r64(&mut self, base: Reg64, disp: u32, src: Reg64) {
        self.store_op_m64_r64(0x29, base, disp, src); // 29 /r
    }

    /// SUB r64, [base + disp]
    pub fn sub_r64_m64(&mut self, dst: Reg64, base: Reg64, disp: u32) {
        self.load_op_r64_m64(0x2B, dst, base, disp); // 2B /r
    }

    /// CMP r64, imm32 (`83 /7 ib`, `81 /7 id`, or `3D id` for RAX)
    pub fn cmp_r64_imm32(&mut self, left: Reg64, imm: u32) {
        self.arith_r64_imm32(left, imm, 7, 0x3D);
    }

    /// CMP r64, r64
    pub fn cmp_r64_r64(&mut self, left: Reg64, right: Reg64) {
        let mut rex = Rex::new().w();
        if right.needs_rex_ext() {
            rex = rex.r();
        }
        if left.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0x39); // 39 /r
        self.emit(ModRM::reg_reg(right.encoding(), left.encoding()).encode());
    }

    /// CMP [base + disp], r64
    pub fn cmp_m64_r64(&mut self, base: Reg64, disp: u32, src: Reg64) {
        self.store_op_m64_r64(0x39, base, disp, src); // 39 /r
    }

    /// CMP r64, [base + disp]
    pub fn cmp_r64_m64(&mut self, left: Reg64, base: Reg64, disp: u32) {
        self.load_op_r64_m64(0x3B, left, base, disp); // 3B /r
    }

    /// CMP qword [base], imm32 (`83 /7 ib` / `81 /7 id`, register-indirect)
    pub fn cmp_m64_imm32(&mut self, base: Reg64, imm: u32) {
        let mut rex = Rex::new().w();
        if base.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        if imm < 128 {
            self.emit(0x83); // 83 /7 ib
            self.emit(ModRM::indirect(7, base.encoding()).encode());
            self.emit(imm as u8);
        } else {
            self.emit(0x81); // 81 /7 id
            self.emit(ModRM::indirect(7, base.encoding()).encode());
            self.emit_u32(imm);
        }
    }

    /// INC r64
    pub fn inc_r64(&mut self, reg: Reg64) {
        let mut rex = Rex::new().w();
        if reg.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xFF); // FF /0
        self.emit(ModRM::reg_opext(0, reg.encoding()).encode());
    }

    /// INC qword [base + disp]
    pub fn inc_m64(&mut self, base: Reg64, disp: u32) {
        let mut rex = Rex::new().w();
        if base.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xFF); // FF /0
        self.emit_modrm_disp(0, base.encoding(), disp);
    }

    /// DEC r64
    pub fn dec_r64(&mut self, reg: Reg64) {
        let mut rex = Rex::new().w();
        if reg.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xFF); // FF /1
        self.emit(ModRM::reg_opext(1, reg.encoding()).encode());
    }

    /// DEC qword [base + disp]
    pub fn dec_m64(&mut self, base: Reg64, disp: u32) {
        let mut rex = Rex::new().w();
        if base.needs_rex_ext() {
            rex = rex.b();
        }
        self.emit(rex.encode());
        self.emit(0xFF); // FF /1
        self.emit_modrm_disp(1, base.encoding(), disp);
    }

    // ==================== Control Flow ====================

    /// RET
    pub fn ret(&mut self) {
        self.emit(0xC3);
    }

    /// INT imm8 (software interrupt; 0x80 is the legacy Linux syscall gate)
    pub fn interrupt(&mut self, imm: u8) {
        self.emit(0xCD); // CD ib
        self.emit(imm);
    }

    /// CALL rel32 to an absolute offset within this buffer
    pub fn call(&mut self, target: usize) -> Result<()> {
        let rel = target as i64 - (self.offset() as i64 + 5);
        let rel = i32::try_from(rel).map_err(|_| BfcError::JumpOutOfRange { distance: rel })?;
        self.emit(0xE8); // E8 cd
        self.emit_i32(rel);
        Ok(())
    }

    /// JMP rel8 with a zero displacement; returns the offset of the
    /// displacement byte so the caller can patch it once the jump target
    /// is known.
    pub fn jmp_rel8(&mut self) -> usize {
        self.emit(0xEB); // EB cb
        let at = self.offset();
        self.emit(0x00);
        at
    }

    /// JNE to an earlier offset in this buffer. Uses the 2-byte `75 cb`
    /// form when the displacement fits in a signed byte and the 6-byte
    /// `0F 85 cd` form otherwise. Returns the encoded length, which the
    /// matching forward-branch patch needs as its reference point.
    pub fn jne_back(&mut self, target: usize) -> Result<usize> {
        let dist = self.offset() as i64 - target as i64;
        if let Ok(d8) = i8::try_from(-(dist + 2)) {
            self.emit(0x75); // 75 cb
            self.emit(d8 as u8);
            return Ok(2);
        }
        let d32 = i32::try_from(-(dist + 6))
            .map_err(|_| BfcError::JumpOutOfRange { distance: -(dist + 6) })?;
        self.emit(0x0F); // 0F 85 cd
        self.emit(0x85);
        self.emit_i32(d32);
        Ok(6)
    }

    /// Reserve a forward JE whose target is not yet known. Appends NOP
    /// placeholder bytes and returns a branch id for the later patch.
    pub fn reserve_forward_je(&mut self) -> usize {
        let id = self.next_branch_id;
        self.next_branch_id += 1;
        self.reserved_branches.insert(id, self.offset());
        self.emit_bytes(&[0x90; FORWARD_JE_RESERVED]);
        id
    }

    /// Resolve a reserved forward JE so it targets `target`. The
    /// displacement is measured from the end of the back-jump that was
    /// emitted just before `target`, so its encoded length must be passed
    /// in. Overwrites `74 cb` or `0F 84 cd` over the placeholder; bytes
    /// beyond the chosen form stay NOP.
    pub fn patch_forward_je(&mut self, id: usize, target: usize, back_jump_len: usize) -> Result<()> {
        let at = self
            .reserved_branches
            .remove(&id)
            .ok_or(BfcError::UnknownBranch { id })?;
        let d = target as i64 - (at + back_jump_len) as i64;
        if let Ok(d8) = i8::try_from(d) {
            self.code[at] = 0x74; // 74 cb
            self.code[at + 1] = d8 as u8;
            return Ok(());
        }
        let d32 = i32::try_from(d).map_err(|_| BfcError::JumpOutOfRange { distance: d })?;
        self.code[at] = 0x0F; // 0F 84 cd
        self.code[at + 1] = 0x84;
        self.code[at + 2..at + 6].copy_from_slice(&d32.to_le_bytes());
        Ok(())
    }

    // ==================== BSS & Build ====================

    /// Reserve `size` bytes in the uninitialized data segment and return
    /// the virtual address of the reservation.
    pub fn bss_add(&mut self, size: u32) -> u32 {
        let addr = consts::BSS_VADDR as u32 + self.bss_cursor;
        self.bss_cursor += size;
        addr
    }

    /// Total bytes reserved in the BSS segment so far
    pub fn bss_size(&self) -> u32 {
        self.bss_cursor
    }

    /// Wrap the accumulated code and BSS reservation into an ELF64
    /// executable image.
    pub fn build(&self) -> Vec<u8> {
        Elf64Builder::new()
            .text(self.code.clone())
            .bss_size(self.bss_cursor)
            .build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::x64::registers::Reg64::*;

    fn emitted(f: impl FnOnce(&mut CodeBuffer)) -> Vec<u8> {
        let mut buf = CodeBuffer::new();
        f(&mut buf);
        buf.code().to_vec()
    }

    #[test]
    fn test_interrupt() {
        assert_eq!(emitted(|b| b.interrupt(0x80)), [0xCD, 0x80]);
    }

    #[test]
    fn test_ret() {
        assert_eq!(emitted(|b| b.ret()), [0xC3]);
    }

    #[test]
    fn test_mov_r64_imm32() {
        assert_eq!(
            emitted(|b| b.mov_r64_imm32(RAX, 0x01)),
            [0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00]
        );
        assert_eq!(
            emitted(|b| b.mov_r64_imm32(R15, 0x15)),
            [0x49, 0xC7, 0xC7, 0x15, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_r64_r64() {
        assert_eq!(emitted(|b| b.mov_r64_r64(RAX, RBX)), [0x48, 0x89, 0xD8]);
        assert_eq!(emitted(|b| b.mov_r64_r64(RAX, R13)), [0x4C, 0x89, 0xE8]);
        assert_eq!(emitted(|b| b.mov_r64_r64(R13, RBX)), [0x49, 0x89, 0xDD]);
        assert_eq!(emitted(|b| b.mov_r64_r64(R13, R14)), [0x4D, 0x89, 0xF5]);
    }

    #[test]
    fn test_mov_m64_r64() {
        // Stores keep the explicit displacement byte even at zero.
        assert_eq!(
            emitted(|b| b.mov_m64_r64(R13, 0, R14)),
            [0x4D, 0x89, 0x75, 0x00]
        );
        assert_eq!(
            emitted(|b| b.mov_m64_r64(R13, 0x04, R14)),
            [0x4D, 0x89, 0x75, 0x04]
        );
        assert_eq!(
            emitted(|b| b.mov_m64_r64(R13, 0x80, R14)),
            [0x4D, 0x89, 0xB5, 0x80, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_mov_r64_m64() {
        assert_eq!(emitted(|b| b.mov_r64_m64(R13, R14, 0)), [0x4D, 0x8B, 0x2E]);
        assert_eq!(
            emitted(|b| b.mov_r64_m64(R13, R14, 0x05)),
            [0x4D, 0x8B, 0x6E, 0x05]
        );
        assert_eq!(
            emitted(|b| b.mov_r64_m64(R13, R14, 0x81)),
            [0x4D, 0x8B, 0xAE, 0x81, 0x00, 0x00, 0x00]
        );
        // REX.R comes from the destination, REX.B from the base.
        assert_eq!(emitted(|b| b.mov_r64_m64(R13, RAX, 0)), [0x4C, 0x8B, 0x28]);
        assert_eq!(emitted(|b| b.mov_r64_m64(R13, RBX, 0)), [0x4C, 0x8B, 0x2B]);
        assert_eq!(
            emitted(|b| b.mov_r64_m64(R13, RBX, 0x81)),
            [0x4C, 0x8B, 0xAB, 0x81, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_inc() {
        assert_eq!(emitted(|b| b.inc_r64(RAX)), [0x48, 0xFF, 0xC0]);
        assert_eq!(emitted(|b| b.inc_r64(R14)), [0x49, 0xFF, 0xC6]);
        assert_eq!(emitted(|b| b.inc_m64(R13, 0)), [0x49, 0xFF, 0x45, 0x00]);
        assert_eq!(emitted(|b| b.inc_m64(R13, 4)), [0x49, 0xFF, 0x45, 0x04]);
        assert_eq!(
            emitted(|b| b.inc_m64(R13, 0x81)),
            [0x49, 0xFF, 0x85, 0x81, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_dec() {
        assert_eq!(emitted(|b| b.dec_r64(RAX)), [0x48, 0xFF, 0xC8]);
        assert_eq!(emitted(|b| b.dec_r64(R14)), [0x49, 0xFF, 0xCE]);
        assert_eq!(emitted(|b| b.dec_m64(R13, 0)), [0x49, 0xFF, 0x4D, 0x00]);
        assert_eq!(
            emitted(|b| b.dec_m64(R13, 0x81)),
            [0x49, 0xFF, 0x8D, 0x81, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_add_r64_imm32() {
        assert_eq!(emitted(|b| b.add_r64_imm32(RAX, 0x01)), [0x48, 0x83, 0xC0, 0x01]);
        // RAX with a full-width immediate takes the one-opcode form.
        assert_eq!(
            emitted(|b| b.add_r64_imm32(RAX, 0x81)),
            [0x48, 0x05, 0x81, 0x00, 0x00, 0x00]
        );
        assert_eq!(emitted(|b| b.add_r64_imm32(R11, 0x01)), [0x49, 0x83, 0xC3, 0x01]);
        assert_eq!(
            emitted(|b| b.add_r64_imm32(R11, 0x81)),
            [0x49, 0x81, 0xC3, 0x81, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_add_r64_r64() {
        assert_eq!(emitted(|b| b.add_r64_r64(RBX, RAX)), [0x48, 0x01, 0xC3]);
        assert_eq!(emitted(|b| b.add_r64_r64(RBX, R11)), [0x4C, 0x01, 0xDB]);
        assert_eq!(emitted(|b| b.add_r64_r64(R11, RAX)), [0x49, 0x01, 0xC3]);
        assert_eq!(emitted(|b| b.add_r64_r64(R11, R12)), [0x4D, 0x01, 0xE3]);
    }

    #[test]
    fn test_add_mem_forms() {
        assert_eq!(emitted(|b| b.add_r64_m64(RBX, R11, 0)), [0x49, 0x03, 0x1B]);
        assert_eq!(emitted(|b| b.add_r64_m64(R11, RBX, 0)), [0x4C, 0x03, 0x1B]);
        assert_eq!(
            emitted(|b| b.add_r64_m64(R11, RBX, 4)),
            [0x4C, 0x03, 0x5B, 0x04]
        );
        assert_eq!(
            emitted(|b| b.add_r64_m64(R11, RBX, 0x81)),
            [0x4C, 0x03, 0x9B, 0x81, 0x00, 0x00, 0x00]
        );
        assert_eq!(emitted(|b| b.add_m64_r64(R8, 0, RAX)), [0x49, 0x01, 0x00]);
        assert_eq!(
            emitted(|b| b.add_m64_r64(R8, 0x04, RAX)),
            [0x49, 0x01, 0x40, 0x04]
        );
        assert_eq!(
            emitted(|b| b.add_m64_r64(R8, 0x81, RBX)),
            [0x49, 0x01, 0x98, 0x81, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_sub_r64_imm32() {
        assert_eq!(emitted(|b| b.sub_r64_imm32(RAX, 0x01)), [0x48, 0x83, 0xE8, 0x01]);
        assert_eq!(
            emitted(|b| b.sub_r64_imm32(RAX, 0x81)),
            [0x48, 0x2D, 0x81, 0x00, 0x00, 0x00]
        );
        assert_eq!(emitted(|b| b.sub_r64_imm32(RBX, 0x01)), [0x48, 0x83, 0xEB, 0x01]);
        assert_eq!(
            emitted(|b| b.sub_r64_imm32(R11, 0x81)),
            [0x49, 0x81, 0xEB, 0x81, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_sub_reg_and_mem_forms() {
        assert_eq!(emitted(|b| b.sub_r64_r64(RBX, R11)), [0x4C, 0x29, 0xDB]);
        assert_eq!(emitted(|b| b.sub_r64_r64(R11, R12)), [0x4D, 0x29, 0xE3]);
        assert_eq!(emitted(|b| b.sub_r64_m64(RBX, R11, 0)), [0x49, 0x2B, 0x1B]);
        assert_eq!(
            emitted(|b| b.sub_r64_m64(R11, RBX, 0x81)),
            [0x4C, 0x2B, 0x9B, 0x81, 0x00, 0x00, 0x00]
        );
        assert_eq!(emitted(|b| b.sub_m64_r64(R8, 0, RAX)), [0x49, 0x29, 0x00]);
        assert_eq!(
            emitted(|b| b.sub_m64_r64(R8, 0x81, RBX)),
            [0x49, 0x29, 0x98, 0x81, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_cmp_forms() {
        assert_eq!(emitted(|b| b.cmp_r64_imm32(RAX, 0x01)), [0x48, 0x83, 0xF8, 0x01]);
        assert_eq!(
            emitted(|b| b.cmp_r64_imm32(RAX, 0x81)),
            [0x48, 0x3D, 0x81, 0x00, 0x00, 0x00]
        );
        assert_eq!(emitted(|b| b.cmp_r64_imm32(R11, 0x01)), [0x49, 0x83, 0xFB, 0x01]);
        assert_eq!(emitted(|b| b.cmp_r64_r64(RBX, R11)), [0x4C, 0x39, 0xDB]);
        assert_eq!(emitted(|b| b.cmp_r64_m64(RBX, R11, 0)), [0x49, 0x3B, 0x1B]);
        assert_eq!(
            emitted(|b| b.cmp_r64_m64(R11, RBX, 0x81)),
            [0x4C, 0x3B, 0x9B, 0x81, 0x00, 0x00, 0x00]
        );
        assert_eq!(emitted(|b| b.cmp_m64_r64(R8, 0, RAX)), [0x49, 0x39, 0x00]);
        assert_eq!(
            emitted(|b| b.cmp_m64_r64(R8, 0x81, RBX)),
            [0x49, 0x39, 0x98, 0x81, 0x00, 0x00, 0x00]
        );
        assert_eq!(emitted(|b| b.cmp_m64_imm32(RAX, 0)), [0x48, 0x83, 0x38, 0x00]);
    }

    #[test]
    fn test_jne_back_short_loop() {
        // mov rax, 1; loop: add rax, 2; cmp rax, 10; jne loop
        let mut buf = CodeBuffer::new();
        buf.mov_r64_imm32(RAX, 0x01);
        let target = buf.offset();
        buf.add_r64_imm32(RAX, 0x02);
        buf.cmp_r64_imm32(RAX, 10);
        let len = buf.jne_back(target).unwrap();
        assert_eq!(len, 2);
        assert_eq!(
            buf.code(),
            [
                0x48, 0xC7, 0xC0, 0x01, 0x00, 0x00, 0x00, // mov rax, 1
                0x48, 0x83, 0xC0, 0x02, // add rax, 2
                0x48, 0x83, 0xF8, 0x0A, // cmp rax, 10
                0x75, 0xF6, // jne loop
            ]
        );
    }

    #[test]
    fn test_jne_back_long_loop() {
        let mut buf = CodeBuffer::new();
        buf.mov_r64_imm32(RAX, 0x01);
        buf.mov_r64_imm32(RBX, 0x02);
        let target = buf.offset();
        for _ in 0..34 {
            buf.mov_r64_imm32(RAX, 0x81);
        }
        let len = buf.jne_back(target).unwrap();
        assert_eq!(len, 6);
        assert_eq!(&buf.code()[buf.offset() - 6..], [0x0F, 0x85, 0x0C, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_call_backward() {
        let mut buf = CodeBuffer::new();
        buf.ret();
        let at = buf.offset();
        buf.call(0).unwrap();
        // rel32 = 0 - (1 + 5) = -6
        assert_eq!(&buf.code()[at..], [0xE8, 0xFA, 0xFF, 0xFF, 0xFF]);
    }

    #[test]
    fn test_jmp_rel8_patch() {
        let mut buf = CodeBuffer::new();
        let at = buf.jmp_rel8();
        let start = buf.offset();
        buf.ret();
        buf.ret();
        buf.patch_u8(at, (buf.offset() - start) as u8);
        assert_eq!(buf.code(), [0xEB, 0x02, 0xC3, 0xC3]);
    }

    #[test]
    fn test_forward_je_short_patch() {
        let mut buf = CodeBuffer::new();
        let id = buf.reserve_forward_je();
        assert_eq!(buf.offset(), 8);
        buf.inc_m64(RAX, 0); // 4-byte loop body stand-in
        let back_len = buf.jne_back(0).unwrap();
        buf.patch_forward_je(id, buf.offset(), back_len).unwrap();
        // d = 14 - (0 + 2) = 12
        assert_eq!(&buf.code()[..2], [0x74, 0x0C]);
        // placeholder tail stays NOP
        assert_eq!(&buf.code()[2..8], [0x90; 6]);
    }

    #[test]
    fn test_forward_je_long_patch() {
        let mut buf = CodeBuffer::new();
        let id = buf.reserve_forward_je();
        for _ in 0..34 {
            buf.mov_r64_imm32(RAX, 0x81);
        }
        let back_len = buf.jne_back(0).unwrap();
        assert_eq!(back_len, 6);
        let target = buf.offset();
        buf.patch_forward_je(id, target, back_len).unwrap();
        let d = (target - 6) as i32;
        let mut expected = vec![0x0F, 0x84];
        expected.extend_from_slice(&d.to_le_bytes());
        assert_eq!(&buf.code()[..6], &expected[..]);
        assert_eq!(&buf.code()[6..8], [0x90, 0x90]);
    }

    #[test]
    fn test_forward_je_patch_is_single_use() {
        let mut buf = CodeBuffer::new();
        let id = buf.reserve_forward_je();
        buf.patch_forward_je(id, 8, 2).unwrap();
        assert!(matches!(
            buf.patch_forward_je(id, 8, 2),
            Err(BfcError::UnknownBranch { .. })
        ));
        assert!(matches!(
            buf.patch_forward_je(99, 8, 2),
            Err(BfcError::UnknownBranch { id: 99 })
        ));
    }

    #[test]
    fn test_bss_add() {
        let mut buf = CodeBuffer::new();
        assert_eq!(buf.bss_add(0x10000), 0x600000);
        assert_eq!(buf.bss_add(8), 0x610000);
        assert_eq!(buf.bss_size(), 0x10008);
    }

    #[test]
    fn test_build_wraps_elf() {
        let mut buf = CodeBuffer::new();
        buf.ret();
        buf.bss_add(64);
        let elf = buf.build();
        assert_eq!(&elf[0..4], &[0x7F, b'E', b'L', b'F']);
        // text payload lands right after the headers
        assert_eq!(elf[0xB0], 0xC3);
    }
}
