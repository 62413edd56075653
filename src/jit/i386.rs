//! i386 instruction encoding for compiled methods.
//!
//! 32-bit protected-mode encodings only: integer moves and ALU ops, the
//! frame instructions, label-relative control flow and the x87 subset the
//! FPU register map needs.
//!
//! Frame convention: EBP is the frame pointer, EBX holds the VM global
//! pointer (execution sensors and runtime entry points are addressed from
//! it), and results come back in EAX, EDX:EAX or ST(0).

use super::codebuf::{CodeBuffer, PatchKind};
use super::label::BinaryLabel;
use std::fmt;

/// i386 general-purpose registers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Register {
    Eax = 0,
    Ecx = 1,
    Edx = 2,
    Ebx = 3,
    Esp = 4,
    Ebp = 5,
    Esi = 6,
    Edi = 7,
}

impl Register {
    pub const ALL: [Register; 8] = [
        Register::Eax,
        Register::Ecx,
        Register::Edx,
        Register::Ebx,
        Register::Esp,
        Register::Ebp,
        Register::Esi,
        Register::Edi,
    ];

    /// Get the register code.
    pub fn code(self) -> u8 {
        self as u8
    }

    pub fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for Register {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Register::Eax => "eax",
            Register::Ecx => "ecx",
            Register::Edx => "edx",
            Register::Ebx => "ebx",
            Register::Esp => "esp",
            Register::Ebp => "ebp",
            Register::Esi => "esi",
            Register::Edi => "edi",
        };
        f.write_str(name)
    }
}

/// Condition codes (for Jcc).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Cond {
    E = 0x4,  // Equal
    Ne = 0x5, // Not equal
    L = 0xC,  // Less (signed <)
    Ge = 0xD, // Greater or equal (signed >=)
    Le = 0xE, // Less or equal (signed <=)
    G = 0xF,  // Greater (signed >)
}

impl Cond {
    /// Invert the condition.
    pub fn invert(self) -> Self {
        match self {
            Cond::E => Cond::Ne,
            Cond::Ne => Cond::E,
            Cond::L => Cond::Ge,
            Cond::Ge => Cond::L,
            Cond::Le => Cond::G,
            Cond::G => Cond::Le,
        }
    }
}

/// Group-1 ALU operations; the value is the /digit of the immediate form.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AluOp {
    Add = 0,
    Or = 1,
    Adc = 2,
    Sbb = 3,
    And = 4,
    Sub = 5,
    Xor = 6,
    Cmp = 7,
}

/// i386 assembler.
pub struct I386Assembler<'a> {
    buf: &'a mut CodeBuffer,
}

impl<'a> I386Assembler<'a> {
    pub fn new(buf: &'a mut CodeBuffer) -> Self {
        Self { buf }
    }

    pub fn buf(&mut self) -> &mut CodeBuffer {
        &mut *self.buf
    }

    pub fn offset(&self) -> usize {
        self.buf.offset()
    }

    // ==================== ModR/M helpers ====================

    /// Encode ModR/M byte.
    fn modrm(mode: u8, reg: u8, rm: u8) -> u8 {
        ((mode & 0x3) << 6) | ((reg & 0x7) << 3) | (rm & 0x7)
    }

    /// Memory operand `[base + disp]` with `reg` in the ModR/M reg field.
    fn emit_mem(&mut self, reg: u8, base: Register, disp: i32) {
        let sib = base == Register::Esp;
        let rm = base.code();
        if disp == 0 && base != Register::Ebp {
            self.buf.emit_u8(Self::modrm(0b00, reg, rm));
            if sib {
                self.buf.emit_u8(0x24);
            }
        } else if (-128..=127).contains(&disp) {
            self.buf.emit_u8(Self::modrm(0b01, reg, rm));
            if sib {
                self.buf.emit_u8(0x24);
            }
            self.buf.emit_u8(disp as u8);
        } else {
            self.emit_mem_disp32(reg, base, disp);
        }
    }

    /// Memory operand that always uses a 32-bit displacement.
    fn emit_mem_disp32(&mut self, reg: u8, base: Register, disp: i32) {
        self.buf.emit_u8(Self::modrm(0b10, reg, base.code()));
        if base == Register::Esp {
            self.buf.emit_u8(0x24);
        }
        self.buf.emit_u32(disp as u32);
    }

    /// Absolute memory operand; `address` emits the 32-bit address.
    fn emit_abs(&mut self, reg: u8, address: impl FnOnce(&mut CodeBuffer)) {
        self.buf.emit_u8(Self::modrm(0b00, reg, 0b101));
        address(&mut *self.buf);
    }

    // ==================== Data Movement ====================

    /// MOV r32, r32
    pub fn mov_rr(&mut self, dst: Register, src: Register) {
        self.buf.emit_u8(0x89);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// MOV r32, imm32
    pub fn mov_ri(&mut self, dst: Register, imm: i32) {
        self.buf.emit_u8(0xB8 + dst.code());
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r32, [base + disp]
    pub fn mov_rm(&mut self, dst: Register, base: Register, disp: i32) {
        self.buf.emit_u8(0x8B);
        self.emit_mem(dst.code(), base, disp);
    }

    /// MOV [base + disp], r32
    pub fn mov_mr(&mut self, base: Register, disp: i32, src: Register) {
        self.buf.emit_u8(0x89);
        self.emit_mem(src.code(), base, disp);
    }

    /// MOV dword [base + disp], imm32
    pub fn mov_mi(&mut self, base: Register, disp: i32, imm: i32) {
        self.buf.emit_u8(0xC7);
        self.emit_mem(0, base, disp);
        self.buf.emit_u32(imm as u32);
    }

    /// MOV r32, [abs32]
    pub fn mov_r_abs(&mut self, dst: Register, address: impl FnOnce(&mut CodeBuffer)) {
        self.buf.emit_u8(0x8B);
        self.emit_abs(dst.code(), address);
    }

    /// MOV byte [base + disp32], imm8. Returns the offset of the displacement.
    pub fn mov_m8i_disp32(&mut self, base: Register, disp: i32, imm: u8) -> usize {
        self.buf.emit_u8(0xC6);
        let at = self.buf.offset() + 1;
        self.emit_mem_disp32(0, base, disp);
        self.buf.emit_u8(imm);
        at
    }

    /// PUSH dword [base + disp]
    pub fn push_m(&mut self, base: Register, disp: i32) {
        self.buf.emit_u8(0xFF);
        self.emit_mem(6, base, disp);
    }

    /// PUSH dword [abs32]
    pub fn push_abs(&mut self, address: impl FnOnce(&mut CodeBuffer)) {
        self.buf.emit_u8(0xFF);
        self.emit_abs(6, address);
    }

    /// POP dword [base + disp]
    pub fn pop_m(&mut self, base: Register, disp: i32) {
        self.buf.emit_u8(0x8F);
        self.emit_mem(0, base, disp);
    }

    // ==================== Arithmetic Operations ====================

    /// `op dst, src`
    pub fn alu_rr(&mut self, op: AluOp, dst: Register, src: Register) {
        self.buf.emit_u8(((op as u8) << 3) | 0x01);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    /// `op dst, imm32` (imm8 form when it fits)
    pub fn alu_ri(&mut self, op: AluOp, dst: Register, imm: i32) {
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.buf.emit_u8(Self::modrm(0b11, op as u8, dst.code()));
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.buf.emit_u8(Self::modrm(0b11, op as u8, dst.code()));
            self.buf.emit_u32(imm as u32);
        }
    }

    /// `op dst, [base + disp]`
    pub fn alu_rm(&mut self, op: AluOp, dst: Register, base: Register, disp: i32) {
        self.buf.emit_u8(((op as u8) << 3) | 0x03);
        self.emit_mem(dst.code(), base, disp);
    }

    /// `op dword [base + disp], imm32`
    pub fn alu_mi(&mut self, op: AluOp, base: Register, disp: i32, imm: i32) {
        if (-128..=127).contains(&imm) {
            self.buf.emit_u8(0x83);
            self.emit_mem(op as u8, base, disp);
            self.buf.emit_u8(imm as u8);
        } else {
            self.buf.emit_u8(0x81);
            self.emit_mem(op as u8, base, disp);
            self.buf.emit_u32(imm as u32);
        }
    }

    /// IMUL r32, r32
    pub fn imul_rr(&mut self, dst: Register, src: Register) {
        self.buf.emit_bytes(&[0x0F, 0xAF]);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
    }

    /// IMUL r32, [base + disp]
    pub fn imul_rm(&mut self, dst: Register, base: Register, disp: i32) {
        self.buf.emit_bytes(&[0x0F, 0xAF]);
        self.emit_mem(dst.code(), base, disp);
    }

    /// IMUL r32, r32, imm32
    pub fn imul_rri(&mut self, dst: Register, src: Register, imm: i32) {
        self.buf.emit_u8(0x69);
        self.buf.emit_u8(Self::modrm(0b11, dst.code(), src.code()));
        self.buf.emit_u32(imm as u32);
    }

    /// NEG r32
    pub fn neg(&mut self, dst: Register) {
        self.buf.emit_u8(0xF7);
        self.buf.emit_u8(Self::modrm(0b11, 3, dst.code()));
    }

    /// TEST r32, r32
    pub fn test_rr(&mut self, dst: Register, src: Register) {
        self.buf.emit_u8(0x85);
        self.buf.emit_u8(Self::modrm(0b11, src.code(), dst.code()));
    }

    // ==================== Stack Operations ====================

    /// PUSH r32
    pub fn push(&mut self, reg: Register) {
        self.buf.emit_u8(0x50 + reg.code());
    }

    /// POP r32
    pub fn pop(&mut self, reg: Register) {
        self.buf.emit_u8(0x58 + reg.code());
    }

    /// SUB ESP, imm32 (always the 32-bit form so frame sizes patch uniformly)
    pub fn sub_esp(&mut self, bytes: i32) {
        self.buf.emit_u8(0x81);
        self.buf.emit_u8(Self::modrm(0b11, AluOp::Sub as u8, Register::Esp.code()));
        self.buf.emit_u32(bytes as u32);
    }

    // ==================== Control Flow ====================

    /// JMP rel32 to a label
    pub fn jmp(&mut self, label: &mut BinaryLabel) {
        self.buf.emit_u8(0xE9);
        self.buf.emit_label_ref(label, PatchKind::Rel32);
    }

    /// Jcc rel32 to a label
    pub fn jcc(&mut self, cond: Cond, label: &mut BinaryLabel) {
        self.buf.emit_u8(0x0F);
        self.buf.emit_u8(0x80 + cond as u8);
        self.buf.emit_label_ref(label, PatchKind::Rel32);
    }

    /// CALL rel32 to a label
    pub fn call(&mut self, label: &mut BinaryLabel) {
        self.buf.emit_u8(0xE8);
        self.buf.emit_label_ref(label, PatchKind::Rel32);
    }

    /// JMP dword [base + disp32]
    pub fn jmp_m(&mut self, base: Register, disp: i32) {
        self.buf.emit_u8(0xFF);
        self.emit_mem_disp32(4, base, disp);
    }

    /// RET
    pub fn ret(&mut self) {
        self.buf.emit_u8(0xC3);
    }

    // ==================== x87 ====================

    /// FLD dword/qword [base + disp]
    pub fn fld_m(&mut self, double: bool, base: Register, disp: i32) {
        self.buf.emit_u8(if double { 0xDD } else { 0xD9 });
        self.emit_mem(0, base, disp);
    }

    /// FLD dword [abs32]
    pub fn fld_abs32(&mut self, address: impl FnOnce(&mut CodeBuffer)) {
        self.buf.emit_u8(0xD9);
        self.emit_abs(0, address);
    }

    /// FST dword/qword [base + disp]
    pub fn fst_m(&mut self, double: bool, base: Register, disp: i32) {
        self.buf.emit_u8(if double { 0xDD } else { 0xD9 });
        self.emit_mem(2, base, disp);
    }

    /// FSTP dword/qword [base + disp]
    pub fn fstp_m(&mut self, double: bool, base: Register, disp: i32) {
        self.buf.emit_u8(if double { 0xDD } else { 0xD9 });
        self.emit_mem(3, base, disp);
    }

    /// FLD ST(i)
    pub fn fld_st(&mut self, i: usize) {
        self.buf.emit_bytes(&[0xD9, 0xC0 + i as u8]);
    }

    /// FXCH ST(i)
    pub fn fxch(&mut self, i: usize) {
        self.buf.emit_bytes(&[0xD9, 0xC8 + i as u8]);
    }

    /// FFREE ST(i)
    pub fn ffree(&mut self, i: usize) {
        self.buf.emit_bytes(&[0xDD, 0xC0 + i as u8]);
    }

    /// FINCSTP
    pub fn fincstp(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xF7]);
    }

    /// FLDZ
    pub fn fldz(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xEE]);
    }

    /// FLD1
    pub fn fld1(&mut self) {
        self.buf.emit_bytes(&[0xD9, 0xE8]);
    }

    /// FADDP ST(1), ST(0)
    pub fn faddp(&mut self) {
        self.buf.emit_bytes(&[0xDE, 0xC1]);
    }

    /// FSUBP ST(1), ST(0): ST(1) = ST(1) - ST(0), pop
    pub fn fsubp(&mut self) {
        self.buf.emit_bytes(&[0xDE, 0xE9]);
    }

    /// FMULP ST(1), ST(0)
    pub fn fmulp(&mut self) {
        self.buf.emit_bytes(&[0xDE, 0xC9]);
    }

    /// FDIVP ST(1), ST(0): ST(1) = ST(1) / ST(0), pop
    pub fn fdivp(&mut self) {
        self.buf.emit_bytes(&[0xDE, 0xF9]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assemble(f: impl FnOnce(&mut I386Assembler<'_>)) -> Vec<u8> {
        let mut buf = CodeBuffer::with_limit(256);
        let mut asm = I386Assembler::new(&mut buf);
        f(&mut asm);
        buf.code().to_vec()
    }

    #[test]
    fn test_mov_rr() {
        // MOV EAX, EBX = 89 D8
        assert_eq!(assemble(|a| a.mov_rr(Register::Eax, Register::Ebx)), [0x89, 0xD8]);
    }

    #[test]
    fn test_mov_ri() {
        assert_eq!(
            assemble(|a| a.mov_ri(Register::Ecx, 0x12345678)),
            [0xB9, 0x78, 0x56, 0x34, 0x12]
        );
    }

    #[test]
    fn test_mov_rm_ebp() {
        // MOV EAX, [EBP-4] = 8B 45 FC
        assert_eq!(assemble(|a| a.mov_rm(Register::Eax, Register::Ebp, -4)), [0x8B, 0x45, 0xFC]);
        // MOV [EBP+8], EDX = 89 55 08
        assert_eq!(assemble(|a| a.mov_mr(Register::Ebp, 8, Register::Edx)), [0x89, 0x55, 0x08]);
        // EBP with zero displacement still needs a disp8
        assert_eq!(assemble(|a| a.mov_rm(Register::Eax, Register::Ebp, 0)), [0x8B, 0x45, 0x00]);
    }

    #[test]
    fn test_mov_rm_esp_needs_sib() {
        assert_eq!(assemble(|a| a.mov_rm(Register::Eax, Register::Esp, 4)), [0x8B, 0x44, 0x24, 0x04]);
    }

    #[test]
    fn test_alu() {
        // ADD EAX, ECX = 01 C8
        assert_eq!(assemble(|a| a.alu_rr(AluOp::Add, Register::Eax, Register::Ecx)), [0x01, 0xC8]);
        // SUB EDX, 1 = 83 EA 01
        assert_eq!(assemble(|a| a.alu_ri(AluOp::Sub, Register::Edx, 1)), [0x83, 0xEA, 0x01]);
        // ADC EDX, [EBP-8] = 13 55 F8
        assert_eq!(
            assemble(|a| a.alu_rm(AluOp::Adc, Register::Edx, Register::Ebp, -8)),
            [0x13, 0x55, 0xF8]
        );
        // CMP EAX, 1000 = 81 F8 E8 03 00 00
        assert_eq!(
            assemble(|a| a.alu_ri(AluOp::Cmp, Register::Eax, 1000)),
            [0x81, 0xF8, 0xE8, 0x03, 0x00, 0x00]
        );
    }

    #[test]
    fn test_sensor_store() {
        let mut buf = CodeBuffer::with_limit(64);
        let mut asm = I386Assembler::new(&mut buf);
        let at = asm.mov_m8i_disp32(Register::Ebx, 0x1005, 0);
        assert_eq!(at, 2);
        assert_eq!(buf.code(), &[0xC6, 0x83, 0x05, 0x10, 0x00, 0x00, 0x00]);
    }

    #[test]
    fn test_push_pop_memory() {
        assert_eq!(assemble(|a| a.push_m(Register::Ebp, 8)), [0xFF, 0x75, 0x08]);
        assert_eq!(assemble(|a| a.pop_m(Register::Ebp, -4)), [0x8F, 0x45, 0xFC]);
        assert_eq!(
            assemble(|a| a.push_abs(|buf| buf.emit_u32(0x40))),
            [0xFF, 0x35, 0x40, 0x00, 0x00, 0x00]
        );
    }

    #[test]
    fn test_x87() {
        assert_eq!(assemble(|a| a.ffree(2)), [0xDD, 0xC2]);
        assert_eq!(assemble(|a| a.fincstp()), [0xD9, 0xF7]);
        assert_eq!(assemble(|a| a.fld_st(1)), [0xD9, 0xC1]);
        // FLD qword [EBP-16] = DD 45 F0
        assert_eq!(assemble(|a| a.fld_m(true, Register::Ebp, -16)), [0xDD, 0x45, 0xF0]);
        // FSTP dword [EBP-4] = D9 5D FC
        assert_eq!(assemble(|a| a.fstp_m(false, Register::Ebp, -4)), [0xD9, 0x5D, 0xFC]);
    }

    #[test]
    fn test_jcc_to_label() {
        let mut buf = CodeBuffer::with_limit(64);
        let mut label = BinaryLabel::new();
        {
            let mut asm = I386Assembler::new(&mut buf);
            asm.jcc(Cond::E, &mut label);
            asm.ret();
        }
        buf.bind(&mut label, PatchKind::Rel32);
        // JE +1 over the RET
        assert_eq!(buf.code(), &[0x0F, 0x84, 0x01, 0x00, 0x00, 0x00, 0xC3]);
    }

    #[test]
    fn test_cond_invert() {
        assert_eq!(Cond::L.invert(), Cond::Ge);
        assert_eq!(Cond::E.invert().invert(), Cond::E);
    }
}
