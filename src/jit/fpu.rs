//! Model of the x87 register stack.
//!
//! Values living on the FPU are named by logical registers. The map records
//! which logical register occupies each physical depth, top of stack first
//! when scanned. Whenever an entry leaves the map, the matching `ffree` must
//! be emitted, so removal goes through [`FpuRegisterMap::pop_and_free`] and
//! [`FpuRegisterMap::clear_and_free`]. The only exception is an arithmetic
//! instruction that pops the hardware stack itself, which uses
//! [`FpuRegisterMap::consume_top`].

use super::i386::I386Assembler;
use serde::Serialize;
use std::fmt;

/// Depth of the hardware register stack.
pub const FPU_STACK_DEPTH: usize = 8;

/// A logical floating-point register.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FpuReg(pub u8);

impl FpuReg {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for FpuReg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Counters over the lifetime of one map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FpuStats {
    pub pushes: u32,
    pub ffrees: u32,
    pub max_depth: u32,
}

/// The x87 stack as an 8-deep LIFO of logical registers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FpuRegisterMap {
    /// `stack[0]` is the bottom; `stack[depth - 1]` is ST(0).
    stack: [FpuReg; FPU_STACK_DEPTH],
    depth: usize,
    stats: FpuStats,
}

impl Default for FpuRegisterMap {
    fn default() -> Self {
        Self::new()
    }
}

impl FpuRegisterMap {
    pub fn new() -> Self {
        Self {
            stack: [FpuReg(0); FPU_STACK_DEPTH],
            depth: 0,
            stats: FpuStats::default(),
        }
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn is_empty(&self) -> bool {
        self.depth == 0
    }

    pub fn is_full(&self) -> bool {
        self.depth == FPU_STACK_DEPTH
    }

    pub fn stats(&self) -> FpuStats {
        self.stats
    }

    /// ST(0), if any.
    pub fn top(&self) -> Option<FpuReg> {
        self.depth.checked_sub(1).map(|i| self.stack[i])
    }

    /// Entries from ST(0) downwards.
    pub fn entries(&self) -> impl Iterator<Item = FpuReg> + '_ {
        self.stack[..self.depth].iter().rev().copied()
    }

    /// Record that the hardware pushed `reg`.
    ///
    /// Panics if the stack is full or `reg` is already on it.
    pub fn push(&mut self, reg: FpuReg) {
        assert!(
            self.depth < FPU_STACK_DEPTH,
            "fpu stack overflow pushing {} onto {}",
            reg,
            self.dump()
        );
        assert!(
            self.is_on_stack(reg).is_empty(),
            "{} pushed twice onto {}",
            reg,
            self.dump()
        );
        self.stack[self.depth] = reg;
        self.depth += 1;
        self.stats.pushes += 1;
        self.stats.max_depth = self.stats.max_depth.max(self.depth as u32);
    }

    /// Entries from `reg` down to the bottom, or the empty slice if absent.
    pub fn is_on_stack(&self, reg: FpuReg) -> &[FpuReg] {
        match self.stack[..self.depth].iter().rposition(|&r| r == reg) {
            Some(pos) => &self.stack[..=pos],
            None => &[],
        }
    }

    /// Depth of `reg` below the top (0 = ST(0)).
    ///
    /// Panics if `reg` is not on the stack.
    pub fn index_for(&self, reg: FpuReg) -> usize {
        self.entries()
            .position(|r| r == reg)
            .unwrap_or_else(|| panic!("{} not on fpu stack {}", reg, self.dump()))
    }

    /// Swap ST(0) with ST(i), emitting `fxch`.
    pub fn exchange(&mut self, i: usize, asm: &mut I386Assembler<'_>) {
        assert!(i < self.depth, "fxch st({}) on {}", i, self.dump());
        if i == 0 {
            return;
        }
        let top = self.depth - 1;
        self.stack.swap(top, top - i);
        asm.fxch(i);
    }

    /// Forget ST(0) after an instruction that popped it in hardware.
    pub fn consume_top(&mut self) -> FpuReg {
        assert!(self.depth > 0, "pop of empty fpu stack");
        self.depth -= 1;
        self.stack[self.depth]
    }

    /// Pop ST(0), emitting `ffree st(0); fincstp`.
    pub fn pop_and_free(&mut self, asm: &mut I386Assembler<'_>) -> FpuReg {
        assert!(self.depth > 0, "pop of empty fpu stack");
        asm.ffree(0);
        asm.fincstp();
        self.stats.ffrees += 1;
        self.consume_top()
    }

    /// Free every entry, emitting one `ffree` per entry from the top down.
    pub fn clear_and_free(&mut self, asm: &mut I386Assembler<'_>) {
        for i in 0..self.depth {
            asm.ffree(i);
        }
        self.stats.ffrees += self.depth as u32;
        self.depth = 0;
    }

    /// True iff no entry is still referenced.
    pub fn is_clearable(&self, referenced: impl Fn(FpuReg) -> bool) -> bool {
        self.entries().all(|r| !referenced(r))
    }

    /// Render the stack top first, e.g. `[f2 f0]`.
    pub fn dump(&self) -> String {
        let entries: Vec<String> = self.entries().map(|r| r.to_string()).collect();
        format!("[{}]", entries.join(" "))
    }
}
