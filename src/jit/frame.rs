//! Virtual stack frame: where every local and operand-stack value lives.
//!
//! Locals and the operand stack share one array of locations. Index `i`
//! is local `i` for `i < max_locals`; the operand stack grows upwards from
//! `max_locals`. `virtual_stack_pointer` is the index of the top of stack
//! as the bytecode sees it. `real_stack_pointer` is the highest stack index
//! known to be materialized in memory; everything above it may still live
//! in a register, on the FPU stack or only as a compile-time literal.
//!
//! Every location has a home slot in the machine frame:
//!
//! ```text
//!   [ebp + 8 ...]   parameters (pushed by the caller, first parameter highest)
//!   [ebp + 4]       return address
//!   [ebp]           saved ebp
//!   [ebp - 4 ...]   remaining locals, then the operand stack
//! ```
//!
//! A two-word value at index `i` occupies `i` and `i + 1`: the low word
//! lives at the home of `i + 1` and the high word at the home of `i`. The
//! two homes are adjacent except for a local pair that straddles the last
//! parameter, so integer code addresses each word on its own and only
//! x87 loads and stores need the whole 8-byte image.

use super::error::CompileError;
use super::fpu::{FpuReg, FpuRegisterMap, FPU_STACK_DEPTH};
use super::i386::{I386Assembler, Register};
use super::literal::LiteralPool;
use crate::vm::bytecode::{BasicType, Method};
use crate::vm::heap::{ObjectRef, RootVisitor};
use crate::vm::verifier::FrameShape;
use std::fmt::Write as _;
use tracing::trace;

/// Frames are limited by the width of the literals mask.
pub const MAX_LOCATIONS: usize = 64;

/// A compile-time constant held by a location.
#[derive(Debug, Clone, Copy)]
pub enum LiteralValue {
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    Object(ObjectRef),
}

impl LiteralValue {
    pub fn kind(&self) -> BasicType {
        match self {
            LiteralValue::Int(_) => BasicType::Int,
            LiteralValue::Long(_) => BasicType::Long,
            LiteralValue::Float(_) => BasicType::Float,
            LiteralValue::Double(_) => BasicType::Double,
            LiteralValue::Object(_) => BasicType::Object,
        }
    }

    /// Low and high 32-bit words of the value's memory image.
    pub fn words(&self) -> (u32, u32) {
        match *self {
            LiteralValue::Int(v) => (v as u32, 0),
            LiteralValue::Float(v) => (v.to_bits(), 0),
            LiteralValue::Object(r) => (r.raw(), 0),
            LiteralValue::Long(v) => (v as u32, (v >> 32) as u32),
            LiteralValue::Double(v) => {
                let bits = v.to_bits();
                (bits as u32, (bits >> 32) as u32)
            }
        }
    }
}

// Bitwise identity, so that snapshots compare exactly.
impl PartialEq for LiteralValue {
    fn eq(&self, other: &Self) -> bool {
        self.kind() == other.kind() && self.words() == other.words()
    }
}

/// Where a value currently lives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Residence {
    /// In its home slot.
    Memory,
    Register(Register),
    RegisterPair { lo: Register, hi: Register },
    Fpu(FpuReg),
    /// Known at compile time; not materialized anywhere.
    Literal(LiteralValue),
    /// Second slot of the two-word value one index below.
    UpperHalf,
}

/// One local or operand-stack slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Location {
    pub kind: BasicType,
    pub residence: Residence,
    /// The home slot is stale.
    pub dirty: bool,
}

impl Location {
    pub fn memory(kind: BasicType) -> Self {
        Self {
            kind,
            residence: Residence::Memory,
            dirty: false,
        }
    }

    pub fn empty() -> Self {
        Self::memory(BasicType::Void)
    }

    pub fn register(kind: BasicType, reg: Register) -> Self {
        Self {
            kind,
            residence: Residence::Register(reg),
            dirty: true,
        }
    }

    pub fn pair(kind: BasicType, lo: Register, hi: Register) -> Self {
        Self {
            kind,
            residence: Residence::RegisterPair { lo, hi },
            dirty: true,
        }
    }

    pub fn fpu(kind: BasicType, reg: FpuReg) -> Self {
        Self {
            kind,
            residence: Residence::Fpu(reg),
            dirty: true,
        }
    }

    pub fn literal(value: LiteralValue) -> Self {
        Self {
            kind: value.kind(),
            residence: Residence::Literal(value),
            dirty: true,
        }
    }

    fn upper_half(kind: BasicType) -> Self {
        Self {
            kind,
            residence: Residence::UpperHalf,
            dirty: false,
        }
    }

    pub fn clean(mut self) -> Self {
        self.dirty = false;
        self
    }

    pub fn is_memory(&self) -> bool {
        self.residence == Residence::Memory
    }

    pub fn is_upper_half(&self) -> bool {
        self.residence == Residence::UpperHalf
    }

    pub fn maps_register(&self, reg: Register) -> bool {
        match self.residence {
            Residence::Register(r) => r == reg,
            Residence::RegisterPair { lo, hi } => lo == reg || hi == reg,
            _ => false,
        }
    }

    pub fn maps_fpu(&self, reg: FpuReg) -> bool {
        self.residence == Residence::Fpu(reg)
    }

    fn describe(&self) -> String {
        let place = match self.residence {
            Residence::Memory if self.kind == BasicType::Void => return "-".to_string(),
            Residence::Memory => "mem".to_string(),
            Residence::Register(r) => r.to_string(),
            Residence::RegisterPair { lo, hi } => format!("{}:{}", hi, lo),
            Residence::Fpu(f) => f.to_string(),
            Residence::Literal(v) => format!("#{:?}", v),
            Residence::UpperHalf => "(upper)".to_string(),
        };
        format!("{} {}{}", self.kind, place, if self.dirty { " dirty" } else { "" })
    }
}

// ============================================================================
// Array bound-check cache
// ============================================================================

/// Packed record of the last proven array bound check.
///
/// Layout: bits 0-2 array register, bit 3 valid, bits 4-6 length register,
/// bits 8-15 index local, bits 16-23 number of accesses proven by it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BoundMask(u32);

impl BoundMask {
    pub const EMPTY: BoundMask = BoundMask(0);

    const VALID: u32 = 1 << 3;

    pub fn new(array: Register, length: Register, index_local: u8) -> Self {
        BoundMask(
            array.code() as u32
                | Self::VALID
                | (length.code() as u32) << 4
                | (index_local as u32) << 8
                | 1 << 16,
        )
    }

    pub fn is_empty(&self) -> bool {
        self.0 & Self::VALID == 0
    }

    fn register(code: u32) -> Register {
        Register::ALL[(code & 0x7) as usize]
    }

    pub fn array(&self) -> Option<Register> {
        (!self.is_empty()).then(|| Self::register(self.0))
    }

    pub fn length(&self) -> Option<Register> {
        (!self.is_empty()).then(|| Self::register(self.0 >> 4))
    }

    pub fn index_local(&self) -> Option<u8> {
        (!self.is_empty()).then_some((self.0 >> 8) as u8)
    }

    pub fn count(&self) -> u32 {
        (self.0 >> 16) & 0xFF
    }

    fn bump(&mut self) {
        if self.count() < 0xFF {
            self.0 += 1 << 16;
        }
    }

    pub fn mentions(&self, reg: Register) -> bool {
        self.array() == Some(reg) || self.length() == Some(reg)
    }
}

// ============================================================================
// Frame
// ============================================================================

/// Frame shape saved by [`VirtualStackFrame::checkpoint`].
#[derive(Debug, Clone, PartialEq)]
pub struct FrameSnapshot {
    locations: Vec<Location>,
    virtual_stack_pointer: i32,
    real_stack_pointer: i32,
    literals_mask: u64,
    fpu_map: Option<FpuRegisterMap>,
    bound_mask: BoundMask,
}

impl FrameSnapshot {
    pub fn location_count(&self) -> usize {
        self.locations.len()
    }
}

/// The compiler's model of the frame of the method being compiled.
#[derive(Debug, Clone)]
pub struct VirtualStackFrame {
    locations: Vec<Location>,
    max_locals: usize,
    param_slots: usize,
    virtual_stack_pointer: i32,
    real_stack_pointer: i32,
    saved_stack_pointer: i32,
    literals_mask: u64,
    flush_count: u32,
    fpu_map: Option<FpuRegisterMap>,
    bound_mask: BoundMask,
}

impl VirtualStackFrame {
    /// Frame on method entry: parameters in their caller-pushed slots.
    pub fn new(method: &Method, fpu_stack: bool, max_locations: usize) -> Result<Self, CompileError> {
        let count = method.location_count();
        let limit = max_locations.min(MAX_LOCATIONS);
        if count > limit {
            return Err(CompileError::FrameTooLarge {
                locations: count,
                limit,
            });
        }
        let max_locals = method.max_locals as usize;
        let mut frame = Self {
            locations: vec![Location::empty(); count],
            max_locals,
            param_slots: method.parameter_slots(),
            virtual_stack_pointer: max_locals as i32 - 1,
            real_stack_pointer: max_locals as i32 - 1,
            saved_stack_pointer: max_locals as i32 - 1,
            literals_mask: 0,
            flush_count: 0,
            fpu_map: fpu_stack.then(FpuRegisterMap::new),
            bound_mask: BoundMask::EMPTY,
        };
        let mut slot = 0;
        for &param in &method.params {
            frame.locations[slot] = Location::memory(param);
            if param.is_two_word() {
                frame.locations[slot + 1] = Location::upper_half(param);
            }
            slot += param.word_size();
        }
        Ok(frame)
    }

    // ==================== Accessors ====================

    pub fn virtual_stack_pointer(&self) -> i32 {
        self.virtual_stack_pointer
    }

    pub fn real_stack_pointer(&self) -> i32 {
        self.real_stack_pointer
    }

    pub fn saved_stack_pointer(&self) -> i32 {
        self.saved_stack_pointer
    }

    pub fn literals_mask(&self) -> u64 {
        self.literals_mask
    }

    pub fn flush_count(&self) -> u32 {
        self.flush_count
    }

    pub fn fpu_map(&self) -> Option<&FpuRegisterMap> {
        self.fpu_map.as_ref()
    }

    pub fn bound_mask(&self) -> BoundMask {
        self.bound_mask
    }

    pub fn max_locals(&self) -> usize {
        self.max_locals
    }

    pub fn location_count(&self) -> usize {
        self.locations.len()
    }

    /// Operand stack depth in slots.
    pub fn stack_depth(&self) -> usize {
        (self.virtual_stack_pointer + 1) as usize - self.max_locals
    }

    pub fn location(&self, index: usize) -> &Location {
        &self.locations[index]
    }

    /// Locations `0..=virtual_stack_pointer`.
    pub fn live_locations(&self) -> &[Location] {
        &self.locations[..(self.virtual_stack_pointer + 1) as usize]
    }

    /// Top of stack value and its index.
    pub fn top(&self) -> (usize, Location) {
        assert!(self.stack_depth() > 0, "operand stack underflow");
        let mut index = self.virtual_stack_pointer as usize;
        if self.locations[index].is_upper_half() {
            index -= 1;
        }
        (index, self.locations[index])
    }

    // ==================== Frame layout ====================

    /// EBP-relative offset of the home slot of location `index`.
    pub fn home_offset(&self, index: usize) -> i32 {
        if index < self.param_slots {
            8 + 4 * (self.param_slots - 1 - index) as i32
        } else {
            -4 * (index - self.param_slots + 1) as i32
        }
    }

    /// Offset of the memory image of a `kind` value stored at `index`.
    /// Two-word images must not be split.
    pub fn value_offset(&self, index: usize, kind: BasicType) -> i32 {
        if kind.is_two_word() {
            assert!(!self.is_split(index), "8-byte image of location {} is split", index);
            self.home_offset(index + 1)
        } else {
            self.home_offset(index)
        }
    }

    /// Offset of word `word` (0 is the low word) of a `kind` value at `index`.
    pub fn word_offset(&self, index: usize, kind: BasicType, word: usize) -> i32 {
        if kind.is_two_word() {
            self.home_offset(index + 1 - word)
        } else {
            self.home_offset(index)
        }
    }

    /// True when the two homes of a pair starting at `index` are not
    /// adjacent: the last parameter and the first non-parameter local.
    pub fn is_split(&self, index: usize) -> bool {
        index + 1 == self.param_slots && self.param_slots < self.max_locals
    }

    /// Bytes the prologue reserves below EBP.
    pub fn frame_size(&self) -> i32 {
        4 * (self.locations.len() - self.param_slots) as i32
    }

    // ==================== Location updates ====================

    fn set_location(&mut self, index: usize, location: Location) {
        let bit = 1u64 << index;
        if matches!(location.residence, Residence::Literal(_)) {
            self.literals_mask |= bit;
        } else {
            self.literals_mask &= !bit;
        }
        self.locations[index] = location;
    }

    /// Replace the value at `index` (a live stack slot or local).
    pub fn replace(&mut self, index: usize, location: Location) {
        assert!(
            index as i32 <= self.virtual_stack_pointer,
            "replace above stack top ({} > {})",
            index,
            self.virtual_stack_pointer
        );
        self.set_location(index, location);
        if location.kind.is_two_word() {
            self.set_location(index + 1, Location::upper_half(location.kind));
        }
    }

    pub fn local(&self, n: usize) -> Location {
        assert!(n < self.max_locals, "local {} out of range", n);
        self.locations[n]
    }

    /// Store a value into local `n`, breaking any two-word value it overlaps.
    pub fn set_local(&mut self, n: usize, location: Location) {
        assert!(
            n + location.kind.word_size() <= self.max_locals,
            "local {} out of range",
            n
        );
        if n > 0 && self.locations[n - 1].kind.is_two_word() && !self.locations[n - 1].is_upper_half() {
            self.set_location(n - 1, Location::empty());
        }
        if self.locations[n].kind.is_two_word() && !self.locations[n].is_upper_half() {
            self.set_location(n + 1, Location::empty());
        }
        self.set_location(n, location);
        if location.kind.is_two_word() {
            self.set_location(n + 1, Location::upper_half(location.kind));
        }
        if self.bound_mask.index_local() == Some(n as u8) {
            self.bound_mask = BoundMask::EMPTY;
        }
    }

    // ==================== Operand stack ====================

    /// Push a value. Anything not in memory is dirty on the stack.
    pub fn push(&mut self, mut location: Location) {
        let size = location.kind.word_size().max(1);
        let top = self.virtual_stack_pointer + size as i32;
        assert!(
            (top as usize) < self.locations.len(),
            "operand stack overflow pushing {}",
            location.describe()
        );
        location.dirty = !location.is_memory();
        let index = (self.virtual_stack_pointer + 1) as usize;
        self.set_location(index, location);
        if location.kind.is_two_word() {
            self.set_location(index + 1, Location::upper_half(location.kind));
        }
        self.virtual_stack_pointer = top;
    }

    /// Pop the top value, returning it with the index it occupied.
    pub fn pop(&mut self) -> (usize, Location) {
        let (index, location) = self.top();
        for i in index..=self.virtual_stack_pointer as usize {
            self.set_location(i, Location::empty());
        }
        self.virtual_stack_pointer = index as i32 - 1;
        self.real_stack_pointer = self.real_stack_pointer.min(self.virtual_stack_pointer);
        (index, location)
    }

    fn pop_single(&mut self, what: &str) -> Location {
        let (_, location) = self.pop();
        assert!(!location.kind.is_two_word(), "{} splits a two-word value", what);
        location
    }

    fn assert_movable(location: &Location, what: &str) {
        assert!(
            !location.is_memory(),
            "{} of a value still in its home slot",
            what
        );
    }

    pub fn dup(&mut self) {
        let (_, top) = self.top();
        assert!(!top.kind.is_two_word(), "dup splits a two-word value");
        Self::assert_movable(&top, "dup");
        self.push(top);
    }

    /// `..., b, a` to `..., a, b, a`
    pub fn dup_x1(&mut self) {
        let a = self.pop_single("dup_x1");
        let b = self.pop_single("dup_x1");
        Self::assert_movable(&a, "dup_x1");
        Self::assert_movable(&b, "dup_x1");
        self.push(a);
        self.push(b);
        self.push(a);
    }

    /// Duplicate one two-word value or two one-word values.
    pub fn dup2(&mut self) {
        let (_, top) = self.top();
        Self::assert_movable(&top, "dup2");
        if top.kind.is_two_word() {
            self.push(top);
            return;
        }
        let a = self.pop_single("dup2");
        let (_, b) = self.top();
        assert!(!b.kind.is_two_word(), "dup2 splits a two-word value");
        Self::assert_movable(&b, "dup2");
        self.push(a);
        self.push(b);
        self.push(a);
    }

    pub fn swap(&mut self) {
        let a = self.pop_single("swap");
        let b = self.pop_single("swap");
        Self::assert_movable(&a, "swap");
        Self::assert_movable(&b, "swap");
        self.push(a);
        self.push(b);
    }

    /// Pop one two-word value or two one-word values.
    pub fn pop2(&mut self) {
        let (_, top) = self.pop();
        if !top.kind.is_two_word() {
            self.pop_single("pop2");
        }
    }

    /// Drop the arguments of a call and push its result.
    ///
    /// The frame must have been flushed before the call.
    pub fn adjust_for_invoke(&mut self, parameter_slots: usize, returns: BasicType) {
        assert_eq!(
            self.real_stack_pointer, self.virtual_stack_pointer,
            "invoke on an unflushed frame"
        );
        assert!(
            self.stack_depth() >= parameter_slots,
            "invoke pops {} slots from a stack of {}",
            parameter_slots,
            self.stack_depth()
        );
        let top = self.virtual_stack_pointer as usize;
        for i in top + 1 - parameter_slots..=top {
            self.set_location(i, Location::empty());
        }
        self.virtual_stack_pointer -= parameter_slots as i32;
        self.real_stack_pointer = self.virtual_stack_pointer;

        match returns {
            BasicType::Void => {}
            BasicType::Int | BasicType::Object => self.push(Location::register(returns, Register::Eax)),
            BasicType::Long => self.push(Location::pair(returns, Register::Eax, Register::Edx)),
            BasicType::Float | BasicType::Double => {
                let reg = self.free_fpu_reg();
                let Some(map) = self.fpu_map.as_mut() else {
                    panic!("floating point result without an fpu map");
                };
                // The callee left the result in ST(0).
                map.push(reg);
                self.push(Location::fpu(returns, reg));
            }
        }
    }

    /// Reset to the shape recorded for a block entered only by branches.
    pub fn reset_to_shape(&mut self, shape: &FrameShape) {
        if let Some(map) = &self.fpu_map {
            assert!(map.is_empty(), "block entry with live fpu stack {}", map.dump());
        }
        for location in self.locations.iter_mut() {
            *location = Location::empty();
        }
        for (n, &kind) in shape.locals.iter().enumerate() {
            if kind != BasicType::Void {
                self.locations[n] = Location::memory(kind);
                if kind.is_two_word() {
                    self.locations[n + 1] = Location::upper_half(kind);
                }
            }
        }
        let mut index = self.max_locals;
        for &kind in &shape.stack {
            self.locations[index] = Location::memory(kind);
            if kind.is_two_word() {
                self.locations[index + 1] = Location::upper_half(kind);
            }
            index += kind.word_size();
        }
        self.virtual_stack_pointer = index as i32 - 1;
        self.real_stack_pointer = self.virtual_stack_pointer;
        self.literals_mask = 0;
        self.bound_mask = BoundMask::EMPTY;
    }

    // ==================== Register queries ====================

    pub fn is_mapping_something(&self, reg: Register) -> bool {
        self.live_locations().iter().any(|l| l.maps_register(reg))
    }

    pub fn is_mapping_fpu(&self, reg: FpuReg) -> bool {
        self.live_locations().iter().any(|l| l.maps_fpu(reg))
    }

    /// A logical FPU register that is neither on the stack nor mapped.
    pub fn free_fpu_reg(&self) -> FpuReg {
        (0..FPU_STACK_DEPTH as u8)
            .map(FpuReg)
            .find(|&r| {
                !self.is_mapping_fpu(r)
                    && self.fpu_map.as_ref().is_none_or(|m| m.is_on_stack(r).is_empty())
            })
            .unwrap_or_else(|| panic!("no free logical fpu register"))
    }

    pub fn push_fpu(&mut self, reg: FpuReg) {
        let Some(map) = self.fpu_map.as_mut() else {
            panic!("fpu push without an fpu map");
        };
        map.push(reg);
    }

    pub fn fpu_map_mut(&mut self) -> Option<&mut FpuRegisterMap> {
        self.fpu_map.as_mut()
    }

    // ==================== Materialization ====================

    fn store_fpu(&mut self, reg: FpuReg, double: bool, offset: i32, asm: &mut I386Assembler<'_>) {
        let Some(map) = self.fpu_map.as_mut() else {
            panic!("fpu value without an fpu map");
        };
        let i = map.index_for(reg);
        if i == 0 {
            asm.fst_m(double, Register::Ebp, offset);
        } else if !map.is_full() {
            asm.fld_st(i);
            asm.fstp_m(double, Register::Ebp, offset);
        } else {
            map.exchange(i, asm);
            asm.fst_m(double, Register::Ebp, offset);
        }
    }

    fn store_literal(
        &self,
        value: LiteralValue,
        index: usize,
        asm: &mut I386Assembler<'_>,
        literals: &mut LiteralPool,
        bci: usize,
    ) -> Result<(), CompileError> {
        let kind = value.kind();
        match value {
            LiteralValue::Object(r) if !r.is_null() => {
                let id = literals.find_or_create(Some(r), 0)?;
                asm.push_abs(|buf| literals.emit_reference(id, buf, bci));
                asm.pop_m(Register::Ebp, self.home_offset(index));
            }
            _ => {
                let (lo, hi) = value.words();
                asm.mov_mi(Register::Ebp, self.word_offset(index, kind, 0), lo as i32);
                if kind.is_two_word() {
                    asm.mov_mi(Register::Ebp, self.word_offset(index, kind, 1), hi as i32);
                }
            }
        }
        Ok(())
    }

    fn store_pair(
        &self,
        index: usize,
        kind: BasicType,
        lo: Register,
        hi: Register,
        asm: &mut I386Assembler<'_>,
    ) {
        asm.mov_mr(Register::Ebp, self.word_offset(index, kind, 0), lo);
        asm.mov_mr(Register::Ebp, self.word_offset(index, kind, 1), hi);
    }

    /// Write location `index` to its home slot and mark it memory-resident.
    fn store_location(
        &mut self,
        index: usize,
        asm: &mut I386Assembler<'_>,
        literals: &mut LiteralPool,
        bci: usize,
    ) -> Result<(), CompileError> {
        let location = self.locations[index];
        match location.residence {
            Residence::Memory | Residence::UpperHalf => return Ok(()),
            Residence::Register(r) => {
                if location.dirty {
                    asm.mov_mr(Register::Ebp, self.home_offset(index), r);
                }
            }
            Residence::RegisterPair { lo, hi } => {
                if location.dirty {
                    self.store_pair(index, location.kind, lo, hi, asm);
                }
            }
            Residence::Fpu(reg) => {
                if location.dirty {
                    let offset = self.value_offset(index, location.kind);
                    self.store_fpu(reg, location.kind == BasicType::Double, offset, asm);
                }
            }
            Residence::Literal(value) => self.store_literal(value, index, asm, literals, bci)?,
        }
        self.set_location(index, Location::memory(location.kind));
        Ok(())
    }

    /// Materialize every live location into its home slot.
    pub fn flush(
        &mut self,
        asm: &mut I386Assembler<'_>,
        literals: &mut LiteralPool,
        bci: usize,
    ) -> Result<(), CompileError> {
        for index in 0..(self.virtual_stack_pointer + 1) as usize {
            self.store_location(index, asm, literals, bci)?;
        }
        if let Some(map) = self.fpu_map.as_mut() {
            debug_assert!(map.is_clearable(|r| self.locations.iter().any(|l| l.maps_fpu(r))));
            map.clear_and_free(asm);
        }
        self.literals_mask = 0;
        self.bound_mask = BoundMask::EMPTY;
        self.real_stack_pointer = self.virtual_stack_pointer;
        self.flush_count += 1;
        trace!(target: "jcore::jit", bci, flush_count = self.flush_count, "frame flushed");
        Ok(())
    }

    /// Move every FPU-resident value to memory and empty the FPU stack.
    pub fn flush_fpu(&mut self, asm: &mut I386Assembler<'_>) {
        if self.fpu_map.is_none() {
            return;
        }
        for index in 0..(self.virtual_stack_pointer + 1) as usize {
            let location = self.locations[index];
            if let Residence::Fpu(reg) = location.residence {
                if location.dirty {
                    let offset = self.value_offset(index, location.kind);
                    self.store_fpu(reg, location.kind == BasicType::Double, offset, asm);
                }
                self.set_location(index, Location::memory(location.kind));
            }
        }
        if let Some(map) = self.fpu_map.as_mut() {
            map.clear_and_free(asm);
        }
    }

    /// Store every value held in `reg` to memory. Returns false if `reg`
    /// mapped nothing.
    pub fn spill_register(&mut self, reg: Register, asm: &mut I386Assembler<'_>) -> bool {
        let mut spilled = false;
        for index in 0..(self.virtual_stack_pointer + 1) as usize {
            let location = self.locations[index];
            if !location.maps_register(reg) {
                continue;
            }
            if location.dirty {
                match location.residence {
                    Residence::Register(r) => {
                        asm.mov_mr(Register::Ebp, self.home_offset(index), r)
                    }
                    Residence::RegisterPair { lo, hi } => {
                        self.store_pair(index, location.kind, lo, hi, asm)
                    }
                    _ => unreachable!(),
                }
            }
            self.set_location(index, Location::memory(location.kind));
            spilled = true;
        }
        if self.bound_mask.mentions(reg) {
            self.bound_mask = BoundMask::EMPTY;
        }
        spilled
    }

    // ==================== Bound-check cache ====================

    /// Record a bounds check of `array[local]`. Returns true when an
    /// identical check is already proven and can be skipped.
    pub fn note_bound_check(&mut self, array: Register, length: Register, index_local: u8) -> bool {
        if self.bound_mask.array() == Some(array)
            && self.bound_mask.length() == Some(length)
            && self.bound_mask.index_local() == Some(index_local)
        {
            self.bound_mask.bump();
            return true;
        }
        self.bound_mask = BoundMask::new(array, length, index_local);
        false
    }

    // ==================== Checkpoint / restore ====================

    pub fn checkpoint(&mut self) -> FrameSnapshot {
        self.saved_stack_pointer = self.virtual_stack_pointer;
        FrameSnapshot {
            locations: self.locations.clone(),
            virtual_stack_pointer: self.virtual_stack_pointer,
            real_stack_pointer: self.real_stack_pointer,
            literals_mask: self.literals_mask,
            fpu_map: self.fpu_map.clone(),
            bound_mask: self.bound_mask,
        }
    }

    /// Restore the shape saved by `checkpoint`. The flush count keeps counting.
    pub fn restore(&mut self, snapshot: &FrameSnapshot) {
        self.locations.clone_from(&snapshot.locations);
        self.virtual_stack_pointer = snapshot.virtual_stack_pointer;
        self.real_stack_pointer = snapshot.real_stack_pointer;
        self.saved_stack_pointer = snapshot.virtual_stack_pointer;
        self.literals_mask = snapshot.literals_mask;
        self.fpu_map.clone_from(&snapshot.fpu_map);
        self.bound_mask = snapshot.bound_mask;
    }

    /// Whether the current shape equals `snapshot`.
    pub fn matches(&self, snapshot: &FrameSnapshot) -> bool {
        self.locations == snapshot.locations
            && self.virtual_stack_pointer == snapshot.virtual_stack_pointer
            && self.real_stack_pointer == snapshot.real_stack_pointer
            && self.literals_mask == snapshot.literals_mask
            && self.fpu_map == snapshot.fpu_map
            && self.bound_mask == snapshot.bound_mask
    }

    // ==================== GC / diagnostics ====================

    /// Report object literals cached in the frame.
    pub fn oops_do(&mut self, visitor: &mut RootVisitor<'_>) {
        for location in self.locations.iter_mut() {
            if let Residence::Literal(LiteralValue::Object(object)) = &mut location.residence
                && !object.is_null()
            {
                visitor(object);
            }
        }
    }

    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(
            out,
            "vsp={} rsp={} flushes={} literals={:#x}",
            self.virtual_stack_pointer, self.real_stack_pointer, self.flush_count, self.literals_mask
        );
        for (i, location) in self.live_locations().iter().enumerate() {
            let name = if i < self.max_locals {
                format!("L{}", i)
            } else {
                format!("S{}", i - self.max_locals)
            };
            let _ = writeln!(out, "  {:<4} [ebp{:+}] {}", name, self.home_offset(i), location.describe());
        }
        if let Some(map) = &self.fpu_map {
            let _ = writeln!(out, "  fpu {}", map.dump());
        }
        out
    }
}
