//! Register allocation for the template compiler.
//!
//! A register is free when the code generator holds no reference to it and
//! no frame location lives in it. When nothing is free the allocator spills
//! a register the code generator is not holding, round-robin.

use super::error::CompileError;
use super::fpu::{FpuReg, FPU_STACK_DEPTH};
use super::frame::VirtualStackFrame;
use super::i386::{I386Assembler, Register};
use tracing::trace;

/// General-purpose registers handed out to values. EBX holds the VM
/// globals pointer, EBP the frame pointer.
pub const ALLOCATABLE: [Register; 5] = [
    Register::Eax,
    Register::Ecx,
    Register::Edx,
    Register::Esi,
    Register::Edi,
];

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegisterAllocator {
    refcounts: [u32; 8],
    next: usize,
    fpu_refcounts: [u32; 8],
}

impl RegisterAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn refcount(&self, reg: Register) -> u32 {
        self.refcounts[reg.index()]
    }

    pub fn is_referenced(&self, reg: Register) -> bool {
        self.refcount(reg) > 0
    }

    /// Hold `reg` for the instruction being generated.
    pub fn reference(&mut self, reg: Register) {
        self.refcounts[reg.index()] += 1;
    }

    pub fn release(&mut self, reg: Register) {
        let count = &mut self.refcounts[reg.index()];
        assert!(*count > 0, "release of unreferenced {}", reg);
        *count -= 1;
    }

    /// Drop every reference; used between instructions.
    pub fn release_all(&mut self) {
        self.refcounts = [0; 8];
        self.fpu_refcounts = [0; 8];
    }

    pub fn is_free(&self, reg: Register, frame: &VirtualStackFrame) -> bool {
        !self.is_referenced(reg) && !frame.is_mapping_something(reg)
    }

    /// A register holding nothing, spilling one if needed. The result is referenced.
    pub fn allocate(
        &mut self,
        frame: &mut VirtualStackFrame,
        asm: &mut I386Assembler<'_>,
    ) -> Result<Register, CompileError> {
        let n = ALLOCATABLE.len();
        let order = (0..n).map(|i| ALLOCATABLE[(self.next + i) % n]);

        let reg = match order.clone().find(|&r| self.is_free(r, frame)) {
            Some(reg) => reg,
            None => {
                let victim = order
                    .clone()
                    .find(|&r| !self.is_referenced(r))
                    .ok_or(CompileError::RegistersExhausted)?;
                frame.spill_register(victim, asm);
                trace!(target: "jcore::jit", register = %victim, "spilled");
                victim
            }
        };
        self.next = (ALLOCATABLE.iter().position(|&r| r == reg).unwrap_or(0) + 1) % n;
        self.reference(reg);
        Ok(reg)
    }

    /// Claim a specific register, spilling whatever the frame keeps in it.
    pub fn allocate_fixed(
        &mut self,
        reg: Register,
        frame: &mut VirtualStackFrame,
        asm: &mut I386Assembler<'_>,
    ) -> Result<Register, CompileError> {
        if self.is_referenced(reg) {
            return Err(CompileError::RegistersExhausted);
        }
        if frame.spill_register(reg, asm) {
            trace!(target: "jcore::jit", register = %reg, "spilled for fixed use");
        }
        self.reference(reg);
        Ok(reg)
    }

    // ==================== FPU ====================

    pub fn reference_fpu(&mut self, reg: FpuReg) {
        self.fpu_refcounts[reg.index()] += 1;
    }

    pub fn release_fpu(&mut self, reg: FpuReg) {
        let count = &mut self.fpu_refcounts[reg.index()];
        assert!(*count > 0, "release of unreferenced {}", reg);
        *count -= 1;
    }

    pub fn is_fpu_referenced(&self, reg: FpuReg) -> bool {
        self.fpu_refcounts[reg.index()] > 0
    }

    /// Make room for `slots` more FPU pushes.
    ///
    /// Entries on top of the stack that nothing references are popped first;
    /// if there is still not enough room every FPU value goes to memory.
    pub fn ensure_fpu_room(
        &mut self,
        slots: usize,
        frame: &mut VirtualStackFrame,
        asm: &mut I386Assembler<'_>,
    ) -> Result<(), CompileError> {
        loop {
            let Some(map) = frame.fpu_map() else {
                return Ok(());
            };
            if map.depth() + slots <= FPU_STACK_DEPTH {
                return Ok(());
            }
            let Some(top) = map.top() else {
                return Err(CompileError::FpuStackExhausted);
            };
            if frame.is_mapping_fpu(top) || self.is_fpu_referenced(top) {
                break;
            }
            if let Some(map) = frame.fpu_map_mut() {
                map.pop_and_free(asm);
            }
        }
        if let Some(map) = frame.fpu_map()
            && !map.is_clearable(|r| self.is_fpu_referenced(r))
        {
            return Err(CompileError::FpuStackExhausted);
        }
        trace!(target: "jcore::jit", slots, "fpu stack full, flushing to memory");
        frame.flush_fpu(asm);
        if slots > FPU_STACK_DEPTH {
            return Err(CompileError::FpuStackExhausted);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::codebuf::CodeBuffer;
    use crate::jit::frame::Location;
    use crate::vm::bytecode::{BasicType, Method};

    fn frame(max_locals: u16, max_stack: u16) -> VirtualStackFrame {
        VirtualStackFrame::new(&Method::new("t", max_locals, max_stack, &[]), true, 64).unwrap()
    }

    #[test]
    fn test_round_robin() {
        let mut f = frame(0, 4);
        let mut buf = CodeBuffer::with_limit(64);
        let mut asm = I386Assembler::new(&mut buf);
        let mut regs = RegisterAllocator::new();
        let a = regs.allocate(&mut f, &mut asm).unwrap();
        let b = regs.allocate(&mut f, &mut asm).unwrap();
        assert_eq!(a, Register::Eax);
        assert_eq!(b, Register::Ecx);
        regs.release(a);
        regs.release(b);
        assert_eq!(regs.allocate(&mut f, &mut asm).unwrap(), Register::Edx);
    }

    #[test]
    fn test_skips_mapped_registers() {
        let mut f = frame(1, 2);
        f.set_local(0, Location::register(BasicType::Int, Register::Eax));
        let mut buf = CodeBuffer::with_limit(64);
        let mut regs = RegisterAllocator::new();
        let r = regs.allocate(&mut f, &mut I386Assembler::new(&mut buf)).unwrap();
        assert_eq!(r, Register::Ecx);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_spills_when_all_mapped() {
        let mut f = frame(5, 1);
        for (n, reg) in ALLOCATABLE.iter().enumerate() {
            f.set_local(n, Location::register(BasicType::Int, *reg));
        }
        let mut buf = CodeBuffer::with_limit(64);
        let mut regs = RegisterAllocator::new();
        let r = regs.allocate(&mut f, &mut I386Assembler::new(&mut buf)).unwrap();
        assert_eq!(r, Register::Eax);
        assert!(f.local(0).is_memory());
        // mov [ebp-4], eax
        assert_eq!(buf.code(), &[0x89, 0x45, 0xFC]);
    }

    #[test]
    fn test_exhausted_when_all_referenced() {
        let mut f = frame(0, 1);
        let mut buf = CodeBuffer::with_limit(64);
        let mut asm = I386Assembler::new(&mut buf);
        let mut regs = RegisterAllocator::new();
        for _ in 0..ALLOCATABLE.len() {
            regs.allocate(&mut f, &mut asm).unwrap();
        }
        assert_eq!(
            regs.allocate(&mut f, &mut asm),
            Err(CompileError::RegistersExhausted)
        );
        regs.release_all();
        assert!(regs.allocate(&mut f, &mut asm).is_ok());
    }

    #[test]
    fn test_allocate_fixed_spills() {
        let mut f = frame(1, 1);
        f.set_local(0, Location::register(BasicType::Int, Register::Edx));
        let mut buf = CodeBuffer::with_limit(64);
        let mut regs = RegisterAllocator::new();
        let r = regs
            .allocate_fixed(Register::Edx, &mut f, &mut I386Assembler::new(&mut buf))
            .unwrap();
        assert_eq!(r, Register::Edx);
        assert!(!f.is_mapping_something(Register::Edx));
        assert!(regs.is_referenced(Register::Edx));
    }

    #[test]
    fn test_ensure_fpu_room_flushes_full_stack() {
        let mut f = frame(8, 0);
        for i in 0..8u8 {
            f.push_fpu(FpuReg(i));
            f.set_local(i as usize, Location::fpu(BasicType::Float, FpuReg(i)));
        }
        let mut buf = CodeBuffer::with_limit(256);
        let mut regs = RegisterAllocator::new();
        regs.ensure_fpu_room(1, &mut f, &mut I386Assembler::new(&mut buf)).unwrap();
        assert!(f.fpu_map().unwrap().is_empty());
        assert!(f.live_locations().iter().all(|l| l.is_memory()));
    }

    #[test]
    fn test_ensure_fpu_room_pops_dead_top() {
        let mut f = frame(0, 0);
        for i in 0..8u8 {
            f.push_fpu(FpuReg(i));
        }
        let mut buf = CodeBuffer::with_limit(64);
        let mut regs = RegisterAllocator::new();
        regs.ensure_fpu_room(1, &mut f, &mut I386Assembler::new(&mut buf)).unwrap();
        assert_eq!(f.fpu_map().unwrap().depth(), 7);
        assert_eq!(buf.code(), &[0xDD, 0xC0, 0xD9, 0xF7]);
    }

    #[test]
    fn test_ensure_fpu_room_keeps_held_operand() {
        let mut f = frame(0, 0);
        for i in 0..8u8 {
            f.push_fpu(FpuReg(i));
        }
        let mut buf = CodeBuffer::with_limit(64);
        let mut regs = RegisterAllocator::new();
        regs.reference_fpu(FpuReg(7));
        assert_eq!(
            regs.ensure_fpu_room(1, &mut f, &mut I386Assembler::new(&mut buf)),
            Err(CompileError::FpuStackExhausted)
        );
        assert_eq!(f.fpu_map().unwrap().depth(), 8);
        assert!(buf.is_empty());

        regs.release_fpu(FpuReg(7));
        regs.ensure_fpu_room(1, &mut f, &mut I386Assembler::new(&mut buf)).unwrap();
        assert_eq!(f.fpu_map().unwrap().depth(), 7);
    }

    #[test]
    fn test_ensure_fpu_room_rejects_impossible_request() {
        let mut f = frame(0, 0);
        let mut buf = CodeBuffer::with_limit(64);
        let mut regs = RegisterAllocator::new();
        assert_eq!(
            regs.ensure_fpu_room(9, &mut f, &mut I386Assembler::new(&mut buf)),
            Err(CompileError::FpuStackExhausted)
        );
    }
}
