//! Template compiler for one method.
//!
//! A [`CompilationSession`] walks the bytecode once, in order. Each
//! instruction asks the [`VirtualStackFrame`] where its operands live, emits
//! a template over those locations and records where the result lives.
//! Values stay in registers, on the FPU stack or as compile-time literals
//! for as long as possible. The frame is flushed to memory at branches,
//! calls and block entries, so every block starts from the memory shape the
//! verifier computed for it.
//!
//! Frame layout on entry (see [`super::frame`]):
//!
//! ```text
//!   push ebp
//!   mov  ebp, esp
//!   sub  esp, frame_size
//!   mov  byte [ebx + SENSOR_ANCHOR + cache_index], 0
//! ```
//!
//! Calls go through one stub at the end of the method that jumps through
//! the VM's invoke entry `[ebx + INVOKE_ENTRY_OFFSET]`, with the callee id
//! in EAX and the arguments on the machine stack.

use super::arena::{new_arena, CompilerObjectTag, ObjectArena};
use super::codebuf::{CodeBuffer, CodeMark, PatchKind};
use super::compiled_method::{CompileStats, CompiledMethod, SENSOR_ANCHOR};
use super::error::CompileError;
use super::fpu::FpuReg;
use super::frame::{FrameSnapshot, LiteralValue, Location, Residence, VirtualStackFrame};
use super::i386::Register::{Eax, Ebp, Ebx, Edx, Esp};
use super::i386::{AluOp, Cond, I386Assembler, Register};
use super::label::BinaryLabel;
use super::literal::{LiteralMark, LiteralPool, LiteralPoolElement};
use super::regalloc::RegisterAllocator;
use super::relocation::{RelocationKind, ABSOLUTE};
use super::stackmap::{StackMapEntry, StackMapTable};
use crate::config::{CacheIndexPolicy, CompilerConfig};
use crate::vm::bytecode::{
    ArithOp, BasicType, BranchCond, Bytecode, Constant, Method, MethodParseError,
};
use crate::vm::heap::{ObjectRef, RootVisitor};
use crate::vm::verifier::{FrameShape, Verifier};
use std::mem::size_of;
use tracing::{debug, trace};

/// Offset of the invoke entry point in the VM globals block.
pub const INVOKE_ENTRY_OFFSET: i32 = 0x40;

fn condition(cond: BranchCond) -> Cond {
    match cond {
        BranchCond::Eq => Cond::E,
        BranchCond::Ne => Cond::Ne,
        BranchCond::Lt => Cond::L,
        BranchCond::Ge => Cond::Ge,
        BranchCond::Gt => Cond::G,
        BranchCond::Le => Cond::Le,
    }
}

fn holds(cond: BranchCond, a: i32, b: i32) -> bool {
    match cond {
        BranchCond::Eq => a == b,
        BranchCond::Ne => a != b,
        BranchCond::Lt => a < b,
        BranchCond::Ge => a >= b,
        BranchCond::Gt => a > b,
        BranchCond::Le => a <= b,
    }
}

fn fold_int(op: ArithOp, a: i32, b: i32) -> Option<i32> {
    match op {
        ArithOp::Add => Some(a.wrapping_add(b)),
        ArithOp::Sub => Some(a.wrapping_sub(b)),
        ArithOp::Mul => Some(a.wrapping_mul(b)),
        ArithOp::And => Some(a & b),
        ArithOp::Or => Some(a | b),
        ArithOp::Xor => Some(a ^ b),
        ArithOp::Div => None,
    }
}

fn fold_long(op: ArithOp, a: i64, b: i64) -> Option<i64> {
    match op {
        ArithOp::Add => Some(a.wrapping_add(b)),
        ArithOp::Sub => Some(a.wrapping_sub(b)),
        ArithOp::And => Some(a & b),
        ArithOp::Or => Some(a | b),
        ArithOp::Xor => Some(a ^ b),
        ArithOp::Mul | ArithOp::Div => None,
    }
}

fn fold_fp(op: ArithOp, a: LiteralValue, b: LiteralValue) -> Option<LiteralValue> {
    match (a, b) {
        (LiteralValue::Float(x), LiteralValue::Float(y)) => Some(LiteralValue::Float(match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
            _ => return None,
        })),
        (LiteralValue::Double(x), LiteralValue::Double(y)) => Some(LiteralValue::Double(match op {
            ArithOp::Add => x + y,
            ArithOp::Sub => x - y,
            ArithOp::Mul => x * y,
            ArithOp::Div => x / y,
            _ => return None,
        })),
        _ => None,
    }
}

/// Everything [`CompilationSession::rollback`] needs to undo later work.
#[derive(Debug, Clone)]
pub struct SessionCheckpoint {
    frame: FrameSnapshot,
    code: CodeMark,
    code_offset: usize,
    literals: LiteralMark,
    label_undo: usize,
    invoke_stub: BinaryLabel,
    regs: RegisterAllocator,
    arena_top: usize,
    arena_mark: usize,
    bci: usize,
    reachable: bool,
    entered: Option<usize>,
    charged_literals: usize,
    charged_stack_maps: usize,
}

/// State of one method compilation.
pub struct CompilationSession<'m> {
    method: &'m Method,
    cache_index: CacheIndexPolicy,
    buf: CodeBuffer,
    frame: VirtualStackFrame,
    regs: RegisterAllocator,
    literals: LiteralPool,
    /// One label per bci; only branch targets are ever bound.
    labels: Vec<BinaryLabel>,
    /// Label states overwritten while a checkpoint is open.
    label_undo: Vec<(usize, BinaryLabel)>,
    open_checkpoints: usize,
    shapes: Vec<Option<FrameShape>>,
    is_target: Vec<bool>,
    invoke_stub: BinaryLabel,
    arena: Box<dyn ObjectArena>,
    stack_maps: StackMapTable,
    sensor_offset: usize,
    bci: usize,
    reachable: bool,
    /// Block entered last, so that a block is entered once.
    entered: Option<usize>,
    charged_literals: usize,
    charged_stack_maps: usize,
}

impl<'m> CompilationSession<'m> {
    /// Verify `method`, lay out its frame and emit the prologue.
    pub fn new(method: &'m Method, config: &CompilerConfig) -> Result<Self, CompileError> {
        method.validate().map_err(|e| {
            let bci = match &e {
                MethodParseError::Invalid { bci, .. } => *bci,
                _ => 0,
            };
            CompileError::unsupported(bci, e.to_string())
        })?;
        let frame = VirtualStackFrame::new(method, config.fpu_stack, config.max_locations)?;
        let shapes = Verifier::new(method)
            .frame_shapes()
            .map_err(|e| CompileError::unsupported(e.bci().unwrap_or(0), e.to_string()))?;

        let mut arena = new_arena(config.arena_size, config.track_compiler_objects);
        let mut is_target = vec![false; method.code.len()];
        for target in method.branch_targets() {
            arena.allocate(CompilerObjectTag::BinaryLabel, size_of::<BinaryLabel>())?;
            is_target[target] = true;
        }

        let mut session = Self {
            method,
            cache_index: config.cache_index,
            buf: CodeBuffer::with_limit(config.code_buffer_size),
            frame,
            regs: RegisterAllocator::new(),
            literals: LiteralPool::new(config.max_literals),
            labels: vec![BinaryLabel::new(); method.code.len()],
            label_undo: Vec::new(),
            open_checkpoints: 0,
            shapes,
            is_target,
            invoke_stub: BinaryLabel::new(),
            arena,
            stack_maps: StackMapTable::new(),
            sensor_offset: 0,
            bci: 0,
            reachable: true,
            entered: None,
            charged_literals: 0,
            charged_stack_maps: 0,
        };
        session.emit_prologue();
        Ok(session)
    }

    fn emit_prologue(&mut self) {
        let frame_size = self.frame.frame_size();
        let mut asm = I386Assembler::new(&mut self.buf);
        asm.push(Ebp);
        asm.mov_rr(Ebp, Esp);
        if frame_size > 0 {
            asm.sub_esp(frame_size);
        }
        // Cleared on every entry; the collector reads it to find live methods.
        let at = asm.mov_m8i_disp32(Ebx, SENSOR_ANCHOR, 0);
        self.buf.relocate_at(at, RelocationKind::ExecutionSensor);
        self.sensor_offset = at;
    }

    fn emit_epilogue(&mut self) {
        let mut asm = I386Assembler::new(&mut self.buf);
        asm.mov_rr(Esp, Ebp);
        asm.pop(Ebp);
        asm.ret();
        self.reachable = false;
    }

    // ==================== Accessors ====================

    pub fn method(&self) -> &Method {
        self.method
    }

    pub fn frame(&self) -> &VirtualStackFrame {
        &self.frame
    }

    pub fn literals(&self) -> &LiteralPool {
        &self.literals
    }

    pub fn code(&self) -> &[u8] {
        self.buf.code()
    }

    pub fn label(&self, bci: usize) -> &BinaryLabel {
        &self.labels[bci]
    }

    pub fn arena(&self) -> &dyn ObjectArena {
        self.arena.as_ref()
    }

    pub fn stack_maps(&self) -> &StackMapTable {
        &self.stack_maps
    }

    /// Next instruction to compile.
    pub fn bci(&self) -> usize {
        self.bci
    }

    pub fn is_reachable(&self) -> bool {
        self.reachable
    }

    pub fn stats(&self) -> CompileStats {
        let fpu = self.frame.fpu_map().map(|m| m.stats()).unwrap_or_default();
        CompileStats {
            code_size: self.buf.len(),
            literal_count: self.literals.len(),
            label_count: self.labels.iter().filter(|l| l.is_bound()).count(),
            flush_count: self.frame.flush_count(),
            fpu_pushes: fpu.pushes,
            fpu_ffrees: fpu.ffrees,
            fpu_max_depth: fpu.max_depth,
            relocation_count: self.buf.relocations().len(),
            stack_map_count: self.stack_maps.len(),
            arena_bytes: self.arena.used(),
        }
    }

    /// Report every object handle the compilation currently holds.
    pub fn oops_do(&mut self, visitor: &mut RootVisitor<'_>) {
        self.literals.oops_do(visitor);
        self.frame.oops_do(visitor);
    }

    // ==================== Driver ====================

    /// Compile the whole method and package the result.
    pub fn compile(mut self) -> Result<CompiledMethod, CompileError> {
        self.run_until(self.method.code.len())?;

        if self.invoke_stub.is_linked() {
            self.buf.bind(&mut self.invoke_stub, PatchKind::Rel32);
            I386Assembler::new(&mut self.buf).jmp_m(Ebx, INVOKE_ENTRY_OFFSET);
        }
        self.literals.layout(&mut self.buf);
        self.charge_new_objects()?;
        self.buf.check_capacity()?;
        debug_assert!(
            self.labels.iter().all(|l| !l.is_linked()),
            "branch to a label that was never bound"
        );

        let stats = self.stats();
        let (code, relocations) = self.buf.into_parts();
        Ok(CompiledMethod::from_parts(
            &self.method.name,
            code,
            relocations,
            self.sensor_offset,
            self.stack_maps,
            stats,
            self.cache_index,
            &ABSOLUTE,
        ))
    }

    /// Compile every instruction before `end`, then enter the block at `end`.
    pub fn run_until(&mut self, end: usize) -> Result<(), CompileError> {
        let end = end.min(self.method.code.len());
        while self.bci < end {
            self.step()?;
        }
        self.enter_block(end)
    }

    /// Compile one instruction.
    ///
    /// An instruction that runs out of registers is retried once from a
    /// fully flushed frame.
    pub fn step(&mut self) -> Result<(), CompileError> {
        let bci = self.bci;
        if bci >= self.method.code.len() {
            return Ok(());
        }
        self.enter_block(bci)?;
        if self.reachable {
            let op = self.method.code[bci];
            trace!(target: "jcore::jit", bci, op = %op, "compiling");
            let checkpoint = self.checkpoint()?;
            match self.compile_op(op) {
                Ok(()) => self.commit(checkpoint),
                Err(CompileError::RegistersExhausted) => {
                    self.rollback(checkpoint);
                    debug!(target: "jcore::jit", bci, "registers exhausted, retrying from memory");
                    self.flush()?;
                    self.compile_op(op)?;
                }
                Err(e) => return Err(e),
            }
            self.regs.release_all();
            self.charge_new_objects()?;
            self.buf.check_capacity()?;
        }
        self.bci += 1;
        Ok(())
    }

    /// Bind the label of a branch target and reset the frame to its shape.
    fn enter_block(&mut self, bci: usize) -> Result<(), CompileError> {
        if bci >= self.method.code.len() || !self.is_target[bci] || self.entered == Some(bci) {
            return Ok(());
        }
        self.entered = Some(bci);
        if self.reachable {
            self.flush()?;
        }
        match &self.shapes[bci] {
            Some(shape) => {
                self.frame.reset_to_shape(shape);
                self.save_label(bci);
                self.buf.bind(&mut self.labels[bci], PatchKind::Rel32);
                self.reachable = true;
                trace!(target: "jcore::jit", bci, offset = self.buf.offset(), "block entered");
            }
            // Only dead code branches here.
            None => self.reachable = false,
        }
        Ok(())
    }

    /// Write every live value to its home slot.
    pub fn flush(&mut self) -> Result<(), CompileError> {
        if let Some(map) = self.frame.fpu_map() {
            assert!(
                map.is_clearable(|r| self.regs.is_fpu_referenced(r)),
                "flush at bci {} would free an fpu register in use",
                self.bci
            );
        }
        let mut asm = I386Assembler::new(&mut self.buf);
        self.frame.flush(&mut asm, &mut self.literals, self.bci)
    }

    fn charge_new_objects(&mut self) -> Result<(), CompileError> {
        while self.charged_literals < self.literals.len() {
            self.arena.allocate(
                CompilerObjectTag::LiteralPoolElement,
                size_of::<LiteralPoolElement>(),
            )?;
            self.charged_literals += 1;
        }
        while self.charged_stack_maps < self.stack_maps.len() {
            let entry = &self.stack_maps.entries()[self.charged_stack_maps];
            self.arena.allocate(
                CompilerObjectTag::StackMap,
                size_of::<StackMapEntry>() + entry.oop_offsets.len() * size_of::<i32>(),
            )?;
            self.charged_stack_maps += 1;
        }
        Ok(())
    }

    // ==================== Checkpoint / rollback ====================

    /// Save the session so that later work can be undone.
    pub fn checkpoint(&mut self) -> Result<SessionCheckpoint, CompileError> {
        let arena_top = self.arena.used();
        self.arena.allocate(
            CompilerObjectTag::FrameSnapshot,
            self.frame.location_count() * size_of::<Location>(),
        )?;
        self.arena
            .allocate(CompilerObjectTag::Checkpoint, size_of::<SessionCheckpoint>())?;
        self.open_checkpoints += 1;
        Ok(SessionCheckpoint {
            frame: self.frame.checkpoint(),
            code: self.buf.mark(),
            code_offset: self.buf.offset(),
            literals: self.literals.mark(),
            label_undo: self.label_undo.len(),
            invoke_stub: self.invoke_stub,
            regs: self.regs.clone(),
            arena_top,
            arena_mark: self.arena.used(),
            bci: self.bci,
            reachable: self.reachable,
            entered: self.entered,
            charged_literals: self.charged_literals,
            charged_stack_maps: self.charged_stack_maps,
        })
    }

    /// Undo everything since `checkpoint`.
    ///
    /// Labels bound since the checkpoint must not have been referenced
    /// before it; their patched operands cannot be recovered.
    pub fn rollback(&mut self, checkpoint: SessionCheckpoint) {
        let saved = self.label_undo.split_off(checkpoint.label_undo.min(self.label_undo.len()));
        for &(bci, before) in &saved {
            assert!(
                !(before.is_linked() && self.labels[bci].is_bound()),
                "rollback across the binding of label {}",
                bci
            );
        }
        for &(bci, before) in saved.iter().rev() {
            self.labels[bci] = before;
        }
        self.frame.restore(&checkpoint.frame);
        self.buf.reset(checkpoint.code);
        self.literals.reset(checkpoint.literals);
        self.invoke_stub = checkpoint.invoke_stub;
        self.regs = checkpoint.regs;
        self.stack_maps.truncate_after(checkpoint.code_offset as u32);
        self.arena.reset(checkpoint.arena_top);
        self.bci = checkpoint.bci;
        self.reachable = checkpoint.reachable;
        self.entered = checkpoint.entered;
        self.charged_literals = checkpoint.charged_literals;
        self.charged_stack_maps = checkpoint.charged_stack_maps;
        self.close_checkpoint();
    }

    /// Keep the work done since `checkpoint` and release its storage.
    pub fn commit(&mut self, checkpoint: SessionCheckpoint) {
        if self.arena.used() == checkpoint.arena_mark {
            self.arena.reset(checkpoint.arena_top);
        }
        self.close_checkpoint();
    }

    fn close_checkpoint(&mut self) {
        self.open_checkpoints = self.open_checkpoints.saturating_sub(1);
        if self.open_checkpoints == 0 {
            self.label_undo.clear();
            self.literals.forget_undo();
        }
    }

    /// Record the state of the label at `bci` before it changes.
    fn save_label(&mut self, bci: usize) {
        if self.open_checkpoints > 0 {
            self.label_undo.push((bci, self.labels[bci]));
        }
    }

    // ==================== Operand access ====================

    fn allocate(&mut self) -> Result<Register, CompileError> {
        let mut asm = I386Assembler::new(&mut self.buf);
        self.regs.allocate(&mut self.frame, &mut asm)
    }

    fn ensure_fpu_room(&mut self, slots: usize) -> Result<(), CompileError> {
        let mut asm = I386Assembler::new(&mut self.buf);
        self.regs.ensure_fpu_room(slots, &mut self.frame, &mut asm)
    }

    /// Whether values of `kind` live on the FPU stack.
    fn uses_fpu(&self, kind: BasicType) -> bool {
        kind.is_float() && self.frame.fpu_map().is_some()
    }

    /// Keep the registers of a popped operand from being handed out.
    fn hold(&mut self, location: &Location) {
        match location.residence {
            Residence::Register(r) => self.regs.reference(r),
            Residence::RegisterPair { lo, hi } => {
                self.regs.reference(lo);
                self.regs.reference(hi);
            }
            _ => {}
        }
    }

    fn mapping_count(&self, reg: Register) -> usize {
        self.frame
            .live_locations()
            .iter()
            .filter(|l| l.maps_register(reg))
            .count()
    }

    /// Move the low word of a literal into `dst`.
    fn emit_literal(&mut self, dst: Register, value: LiteralValue) -> Result<(), CompileError> {
        let bci = self.bci;
        match value {
            LiteralValue::Object(object) if !object.is_null() => {
                let id = self.literals.find_or_create(Some(object), 0)?;
                let literals = &mut self.literals;
                I386Assembler::new(&mut self.buf)
                    .mov_r_abs(dst, |buf| literals.emit_reference(id, buf, bci));
            }
            _ => {
                let (lo, _) = value.words();
                I386Assembler::new(&mut self.buf).mov_ri(dst, lo as i32);
            }
        }
        Ok(())
    }

    /// Load the memory image of a `kind` value at `index` into fresh storage.
    fn load_fresh(&mut self, index: usize, kind: BasicType) -> Result<Location, CompileError> {
        if self.uses_fpu(kind) {
            self.ensure_fpu_room(1)?;
            let reg = self.frame.free_fpu_reg();
            let offset = self.frame.value_offset(index, kind);
            I386Assembler::new(&mut self.buf).fld_m(kind == BasicType::Double, Ebp, offset);
            self.frame.push_fpu(reg);
            Ok(Location::fpu(kind, reg))
        } else if kind.is_two_word() {
            let lo = self.allocate()?;
            let hi = self.allocate()?;
            let mut asm = I386Assembler::new(&mut self.buf);
            asm.mov_rm(lo, Ebp, self.frame.word_offset(index, kind, 0));
            asm.mov_rm(hi, Ebp, self.frame.word_offset(index, kind, 1));
            Ok(Location::pair(kind, lo, hi))
        } else {
            let reg = self.allocate()?;
            let offset = self.frame.home_offset(index);
            I386Assembler::new(&mut self.buf).mov_rm(reg, Ebp, offset);
            Ok(Location::register(kind, reg))
        }
    }

    /// A register holding a popped one-word value. The register is referenced.
    fn load_register(&mut self, index: usize, location: Location) -> Result<Register, CompileError> {
        match location.residence {
            Residence::Register(r) => {
                self.regs.reference(r);
                Ok(r)
            }
            Residence::Literal(value) => {
                let reg = self.allocate()?;
                self.emit_literal(reg, value)?;
                Ok(reg)
            }
            Residence::Memory => {
                let reg = self.allocate()?;
                let offset = self.frame.home_offset(index);
                I386Assembler::new(&mut self.buf).mov_rm(reg, Ebp, offset);
                Ok(reg)
            }
            _ => panic!("{:?} is not a one-word register value", location),
        }
    }

    /// Like [`Self::load_register`], but the result may be overwritten.
    fn load_exclusive(&mut self, index: usize, location: Location) -> Result<Register, CompileError> {
        if let Residence::Register(r) = location.residence {
            if !self.frame.is_mapping_something(r) && !self.regs.is_referenced(r) {
                self.regs.reference(r);
                return Ok(r);
            }
            self.regs.reference(r);
            let dst = self.allocate()?;
            I386Assembler::new(&mut self.buf).mov_rr(dst, r);
            return Ok(dst);
        }
        self.load_register(index, location)
    }

    fn load_pair(
        &mut self,
        index: usize,
        location: Location,
    ) -> Result<(Register, Register), CompileError> {
        match location.residence {
            Residence::RegisterPair { lo, hi } => {
                self.regs.reference(lo);
                self.regs.reference(hi);
                Ok((lo, hi))
            }
            Residence::Literal(value) => {
                let (lo_word, hi_word) = value.words();
                let lo = self.allocate()?;
                let hi = self.allocate()?;
                let mut asm = I386Assembler::new(&mut self.buf);
                asm.mov_ri(lo, lo_word as i32);
                asm.mov_ri(hi, hi_word as i32);
                Ok((lo, hi))
            }
            Residence::Memory => match self.load_fresh(index, location.kind)?.residence {
                Residence::RegisterPair { lo, hi } => Ok((lo, hi)),
                other => panic!("two-word load produced {:?}", other),
            },
            _ => panic!("{:?} is not a register pair value", location),
        }
    }

    fn load_pair_exclusive(
        &mut self,
        index: usize,
        location: Location,
    ) -> Result<(Register, Register), CompileError> {
        if let Residence::RegisterPair { lo, hi } = location.residence {
            let shared = [lo, hi]
                .iter()
                .any(|&r| self.frame.is_mapping_something(r) || self.regs.is_referenced(r));
            self.regs.reference(lo);
            self.regs.reference(hi);
            if !shared {
                return Ok((lo, hi));
            }
            let new_lo = self.allocate()?;
            let new_hi = self.allocate()?;
            let mut asm = I386Assembler::new(&mut self.buf);
            asm.mov_rr(new_lo, lo);
            asm.mov_rr(new_hi, hi);
            return Ok((new_lo, new_hi));
        }
        self.load_pair(index, location)
    }

    /// Make the values covering the top `slots` stack slots movable.
    fn materialize_top(&mut self, slots: usize) -> Result<(), CompileError> {
        let end = (self.frame.virtual_stack_pointer() + 1) as usize;
        let start = end - slots;
        let fpu_loads = (start..end)
            .filter(|&i| {
                let location = self.frame.location(i);
                location.is_memory() && self.uses_fpu(location.kind)
            })
            .count();
        if fpu_loads > 0 {
            self.ensure_fpu_room(fpu_loads)?;
        }
        for index in start..end {
            let location = *self.frame.location(index);
            if location.is_memory() {
                let loaded = self.load_fresh(index, location.kind)?;
                self.frame.replace(index, loaded.clean());
            }
        }
        Ok(())
    }

    // ==================== Templates ====================

    fn compile_op(&mut self, op: Bytecode) -> Result<(), CompileError> {
        match op {
            Bytecode::IConst(v) => self.frame.push(Location::literal(LiteralValue::Int(v))),
            Bytecode::LConst(v) => self.frame.push(Location::literal(LiteralValue::Long(v))),
            Bytecode::FConst(v) => self.frame.push(Location::literal(LiteralValue::Float(v))),
            Bytecode::DConst(v) => self.frame.push(Location::literal(LiteralValue::Double(v))),
            Bytecode::AConstNull => {
                self.frame
                    .push(Location::literal(LiteralValue::Object(ObjectRef::NULL)))
            }
            Bytecode::Ldc(n) => self.emit_ldc(n as usize),
            Bytecode::Load(kind, n) => self.emit_load(kind, n as usize)?,
            Bytecode::Store(kind, n) => self.emit_store(kind, n as usize)?,
            Bytecode::IInc(n, delta) => self.emit_iinc(n as usize, delta)?,
            Bytecode::Arith(kind, op) => self.emit_arith(kind, op)?,
            Bytecode::INeg => self.emit_ineg()?,
            Bytecode::Pop => {
                self.frame.pop();
            }
            Bytecode::Pop2 => self.frame.pop2(),
            Bytecode::Dup => {
                self.materialize_top(1)?;
                self.frame.dup();
            }
            Bytecode::DupX1 => {
                self.materialize_top(2)?;
                self.frame.dup_x1();
            }
            Bytecode::Dup2 => {
                self.materialize_top(2)?;
                self.frame.dup2();
            }
            Bytecode::Swap => {
                self.materialize_top(2)?;
                self.frame.swap();
            }
            Bytecode::If(cond, target) => self.emit_if(cond, target)?,
            Bytecode::IfICmp(cond, target) => self.emit_if_icmp(cond, target)?,
            Bytecode::Goto(target) => self.emit_goto(target)?,
            Bytecode::InvokeStatic {
                method,
                parameter_slots,
                returns,
            } => self.emit_invoke(method, parameter_slots as usize, returns)?,
            Bytecode::Return(kind) => self.emit_return(kind)?,
            Bytecode::Other(_) => {
                return Err(CompileError::unsupported(
                    self.bci,
                    format!("no template for {}", op),
                ));
            }
        }
        Ok(())
    }

    fn emit_ldc(&mut self, n: usize) {
        let value = match self.method.constants[n] {
            Constant::Int(v) => LiteralValue::Int(v),
            Constant::Float(v) => LiteralValue::Float(v),
            Constant::Object(r) => LiteralValue::Object(r),
        };
        self.frame.push(Location::literal(value));
    }

    fn emit_load(&mut self, kind: BasicType, n: usize) -> Result<(), CompileError> {
        self.check_fpu_image(kind, n)?;
        let local = self.frame.local(n);
        let value = if local.is_memory() {
            let loaded = self.load_fresh(n, kind)?;
            self.frame.set_local(n, loaded.clean());
            loaded
        } else {
            local
        };
        self.frame.push(value);
        Ok(())
    }

    fn emit_store(&mut self, kind: BasicType, n: usize) -> Result<(), CompileError> {
        self.check_fpu_image(kind, n)?;
        let (index, value) = self.frame.pop();
        if value.is_memory() {
            let mut asm = I386Assembler::new(&mut self.buf);
            for word in 0..kind.word_size() {
                asm.push_m(Ebp, self.frame.word_offset(index, kind, word));
                asm.pop_m(Ebp, self.frame.word_offset(n, kind, word));
            }
            self.frame.set_local(n, Location::memory(kind));
        } else {
            self.frame.set_local(n, Location { dirty: true, ..value });
        }
        Ok(())
    }

    /// x87 moves a double as one 8-byte image, which a local pair split
    /// around the saved EBP cannot provide.
    fn check_fpu_image(&self, kind: BasicType, n: usize) -> Result<(), CompileError> {
        if kind.is_two_word() && self.uses_fpu(kind) && self.frame.is_split(n) {
            return Err(CompileError::unsupported(
                self.bci,
                format!("double local {} straddles the parameter area", n),
            ));
        }
        Ok(())
    }

    fn emit_iinc(&mut self, n: usize, delta: i32) -> Result<(), CompileError> {
        let local = self.frame.local(n);
        match local.residence {
            Residence::Literal(LiteralValue::Int(v)) => {
                self.frame
                    .set_local(n, Location::literal(LiteralValue::Int(v.wrapping_add(delta))));
            }
            Residence::Register(r) if self.mapping_count(r) == 1 && !self.regs.is_referenced(r) => {
                I386Assembler::new(&mut self.buf).alu_ri(AluOp::Add, r, delta);
                self.frame.set_local(n, Location::register(BasicType::Int, r));
            }
            _ => {
                self.hold(&local);
                let dst = self.allocate()?;
                let offset = self.frame.home_offset(n);
                let mut asm = I386Assembler::new(&mut self.buf);
                match local.residence {
                    Residence::Register(r) => asm.mov_rr(dst, r),
                    Residence::Memory => asm.mov_rm(dst, Ebp, offset),
                    other => panic!("iinc of local {} held as {:?}", n, other),
                }
                asm.alu_ri(AluOp::Add, dst, delta);
                self.frame.set_local(n, Location::register(BasicType::Int, dst));
            }
        }
        Ok(())
    }

    fn emit_arith(&mut self, kind: BasicType, op: ArithOp) -> Result<(), CompileError> {
        match kind {
            BasicType::Int => self.emit_int_arith(op),
            BasicType::Long => self.emit_long_arith(op),
            BasicType::Float | BasicType::Double => self.emit_fpu_arith(kind, op),
            _ => Err(CompileError::unsupported(
                self.bci,
                format!("{} arithmetic", kind),
            )),
        }
    }

    fn emit_int_arith(&mut self, op: ArithOp) -> Result<(), CompileError> {
        let alu = match op {
            ArithOp::Add => Some(AluOp::Add),
            ArithOp::Sub => Some(AluOp::Sub),
            ArithOp::And => Some(AluOp::And),
            ArithOp::Or => Some(AluOp::Or),
            ArithOp::Xor => Some(AluOp::Xor),
            ArithOp::Mul => None,
            ArithOp::Div => {
                return Err(CompileError::unsupported(
                    self.bci,
                    "int division needs a zero check",
                ));
            }
        };
        let (b_index, b) = self.frame.pop();
        let (a_index, a) = self.frame.pop();

        if let (
            Residence::Literal(LiteralValue::Int(x)),
            Residence::Literal(LiteralValue::Int(y)),
        ) = (a.residence, b.residence)
            && let Some(folded) = fold_int(op, x, y)
        {
            self.frame.push(Location::literal(LiteralValue::Int(folded)));
            return Ok(());
        }

        self.hold(&b);
        let ra = self.load_exclusive(a_index, a)?;
        let b_offset = self.frame.home_offset(b_index);
        let mut asm = I386Assembler::new(&mut self.buf);
        match (b.residence, alu) {
            (Residence::Literal(LiteralValue::Int(y)), Some(alu)) => asm.alu_ri(alu, ra, y),
            (Residence::Literal(LiteralValue::Int(y)), None) => asm.imul_rri(ra, ra, y),
            (Residence::Memory, Some(alu)) => asm.alu_rm(alu, ra, Ebp, b_offset),
            (Residence::Memory, None) => asm.imul_rm(ra, Ebp, b_offset),
            (Residence::Register(rb), Some(alu)) => asm.alu_rr(alu, ra, rb),
            (Residence::Register(rb), None) => asm.imul_rr(ra, rb),
            (other, _) => panic!("int operand held as {:?}", other),
        }
        self.frame.push(Location::register(BasicType::Int, ra));
        Ok(())
    }

    fn emit_long_arith(&mut self, op: ArithOp) -> Result<(), CompileError> {
        let (lo_op, hi_op) = match op {
            ArithOp::Add => (AluOp::Add, AluOp::Adc),
            ArithOp::Sub => (AluOp::Sub, AluOp::Sbb),
            ArithOp::And => (AluOp::And, AluOp::And),
            ArithOp::Or => (AluOp::Or, AluOp::Or),
            ArithOp::Xor => (AluOp::Xor, AluOp::Xor),
            ArithOp::Mul | ArithOp::Div => {
                return Err(CompileError::unsupported(
                    self.bci,
                    "long multiply and divide go through the runtime",
                ));
            }
        };
        let (b_index, b) = self.frame.pop();
        let (a_index, a) = self.frame.pop();

        if let (
            Residence::Literal(LiteralValue::Long(x)),
            Residence::Literal(LiteralValue::Long(y)),
        ) = (a.residence, b.residence)
            && let Some(folded) = fold_long(op, x, y)
        {
            self.frame.push(Location::literal(LiteralValue::Long(folded)));
            return Ok(());
        }

        self.hold(&b);
        let (lo, hi) = self.load_pair_exclusive(a_index, a)?;
        let b_lo_offset = self.frame.word_offset(b_index, BasicType::Long, 0);
        let b_hi_offset = self.frame.word_offset(b_index, BasicType::Long, 1);
        let mut asm = I386Assembler::new(&mut self.buf);
        match b.residence {
            Residence::Literal(value) => {
                let (b_lo, b_hi) = value.words();
                asm.alu_ri(lo_op, lo, b_lo as i32);
                asm.alu_ri(hi_op, hi, b_hi as i32);
            }
            Residence::Memory => {
                asm.alu_rm(lo_op, lo, Ebp, b_lo_offset);
                asm.alu_rm(hi_op, hi, Ebp, b_hi_offset);
            }
            Residence::RegisterPair { lo: b_lo, hi: b_hi } => {
                asm.alu_rr(lo_op, lo, b_lo);
                asm.alu_rr(hi_op, hi, b_hi);
            }
            other => panic!("long operand held as {:?}", other),
        }
        self.frame.push(Location::pair(BasicType::Long, lo, hi));
        Ok(())
    }

    fn emit_ineg(&mut self) -> Result<(), CompileError> {
        let (index, value) = self.frame.pop();
        if let Residence::Literal(LiteralValue::Int(v)) = value.residence {
            self.frame
                .push(Location::literal(LiteralValue::Int(v.wrapping_neg())));
            return Ok(());
        }
        let reg = self.load_exclusive(index, value)?;
        I386Assembler::new(&mut self.buf).neg(reg);
        self.frame.push(Location::register(BasicType::Int, reg));
        Ok(())
    }

    // ==================== Floating point ====================

    fn emit_fpu_arith(&mut self, kind: BasicType, op: ArithOp) -> Result<(), CompileError> {
        if self.frame.fpu_map().is_none() {
            return Err(CompileError::unsupported(
                self.bci,
                "floating point arithmetic without the fpu stack",
            ));
        }
        if matches!(op, ArithOp::And | ArithOp::Or | ArithOp::Xor) {
            return Err(CompileError::unsupported(
                self.bci,
                format!("bitwise {} arithmetic", kind),
            ));
        }
        self.ensure_fpu_room(2)?;
        let (b_index, b) = self.frame.pop();
        let (a_index, a) = self.frame.pop();

        if let (Residence::Literal(x), Residence::Literal(y)) = (a.residence, b.residence)
            && let Some(folded) = fold_fp(op, x, y)
        {
            self.frame.push(Location::literal(folded));
            return Ok(());
        }

        // Popped operands are no longer mapped; hold them until consumed.
        let held: [Option<FpuReg>; 2] = [a, b].map(|l| match l.residence {
            Residence::Fpu(reg) => Some(reg),
            _ => None,
        });
        for reg in held.into_iter().flatten() {
            self.regs.reference_fpu(reg);
        }

        let exclusive_at = |frame: &VirtualStackFrame, location: &Location, depth: usize| {
            let Residence::Fpu(reg) = location.residence else {
                return false;
            };
            !frame.is_mapping_fpu(reg)
                && frame.fpu_map().is_some_and(|m| m.index_for(reg) == depth)
        };

        if exclusive_at(&self.frame, &b, 0) && exclusive_at(&self.frame, &a, 1) {
            // Operands already in place.
        } else if exclusive_at(&self.frame, &a, 0) {
            self.push_fpu_copy(b_index, b)?;
        } else {
            self.push_fpu_copy(a_index, a)?;
            self.push_fpu_copy(b_index, b)?;
        }

        let mut asm = I386Assembler::new(&mut self.buf);
        match op {
            ArithOp::Add => asm.faddp(),
            ArithOp::Sub => asm.fsubp(),
            ArithOp::Mul => asm.fmulp(),
            ArithOp::Div => asm.fdivp(),
            _ => unreachable!(),
        }
        let Some(map) = self.frame.fpu_map_mut() else {
            unreachable!();
        };
        map.consume_top();
        let Some(result) = map.top() else {
            panic!("fpu arithmetic left an empty stack");
        };
        for reg in held.into_iter().flatten() {
            self.regs.release_fpu(reg);
        }
        self.frame.push(Location::fpu(kind, result));
        Ok(())
    }

    /// Push a copy of a popped floating point value onto the FPU stack.
    fn push_fpu_copy(&mut self, index: usize, location: Location) -> Result<(), CompileError> {
        let kind = location.kind;
        let double = kind == BasicType::Double;
        let reg = self.frame.free_fpu_reg();
        match location.residence {
            Residence::Fpu(source) => {
                debug_assert!(self.regs.is_fpu_referenced(source));
                let Some(map) = self.frame.fpu_map() else {
                    unreachable!();
                };
                let depth = map.index_for(source);
                I386Assembler::new(&mut self.buf).fld_st(depth);
            }
            Residence::Memory => {
                let offset = self.frame.value_offset(index, kind);
                I386Assembler::new(&mut self.buf).fld_m(double, Ebp, offset);
            }
            Residence::Literal(value) => self.load_fpu_literal(index, value)?,
            other => panic!("floating point operand held as {:?}", other),
        }
        self.frame.push_fpu(reg);
        Ok(())
    }

    fn load_fpu_literal(&mut self, index: usize, value: LiteralValue) -> Result<(), CompileError> {
        let bci = self.bci;
        let (lo, hi) = value.words();
        let one = matches!(value, LiteralValue::Float(v) if v == 1.0)
            || matches!(value, LiteralValue::Double(v) if v == 1.0);
        if (lo, hi) == (0, 0) {
            I386Assembler::new(&mut self.buf).fldz();
        } else if one {
            I386Assembler::new(&mut self.buf).fld1();
        } else if let LiteralValue::Float(_) = value {
            let id = self.literals.find_or_create(None, lo as i32)?;
            let literals = &mut self.literals;
            I386Assembler::new(&mut self.buf).fld_abs32(|buf| literals.emit_reference(id, buf, bci));
        } else {
            // The popped slot's home is free scratch space.
            let offset = self.frame.value_offset(index, BasicType::Double);
            let mut asm = I386Assembler::new(&mut self.buf);
            asm.mov_mi(Ebp, self.frame.word_offset(index, BasicType::Double, 0), lo as i32);
            asm.mov_mi(Ebp, self.frame.word_offset(index, BasicType::Double, 1), hi as i32);
            asm.fld_m(true, Ebp, offset);
        }
        Ok(())
    }

    // ==================== Control flow ====================

    fn emit_if(&mut self, cond: BranchCond, target: usize) -> Result<(), CompileError> {
        let (index, value) = self.frame.pop();
        if let Residence::Literal(LiteralValue::Int(v)) = value.residence {
            return self.emit_folded_branch(holds(cond, v, 0), target);
        }
        let reg = self.load_register(index, value)?;
        self.flush()?;
        self.save_label(target);
        let mut asm = I386Assembler::new(&mut self.buf);
        asm.test_rr(reg, reg);
        asm.jcc(condition(cond), &mut self.labels[target]);
        Ok(())
    }

    fn emit_if_icmp(&mut self, cond: BranchCond, target: usize) -> Result<(), CompileError> {
        let (b_index, b) = self.frame.pop();
        let (a_index, a) = self.frame.pop();
        if let (
            Residence::Literal(LiteralValue::Int(x)),
            Residence::Literal(LiteralValue::Int(y)),
        ) = (a.residence, b.residence)
        {
            return self.emit_folded_branch(holds(cond, x, y), target);
        }

        self.hold(&b);
        let ra = self.load_register(a_index, a)?;
        // The flush stores live values only; popped operands stay put.
        self.flush()?;
        self.save_label(target);
        let b_offset = self.frame.home_offset(b_index);
        let mut asm = I386Assembler::new(&mut self.buf);
        match b.residence {
            Residence::Literal(LiteralValue::Int(y)) => asm.alu_ri(AluOp::Cmp, ra, y),
            Residence::Memory => asm.alu_rm(AluOp::Cmp, ra, Ebp, b_offset),
            Residence::Register(rb) => asm.alu_rr(AluOp::Cmp, ra, rb),
            other => panic!("int operand held as {:?}", other),
        }
        asm.jcc(condition(cond), &mut self.labels[target]);
        Ok(())
    }

    fn emit_folded_branch(&mut self, taken: bool, target: usize) -> Result<(), CompileError> {
        trace!(target: "jcore::jit", bci = self.bci, taken, "branch folded");
        if taken {
            self.emit_goto(target)?;
        }
        Ok(())
    }

    fn emit_goto(&mut self, target: usize) -> Result<(), CompileError> {
        self.flush()?;
        self.save_label(target);
        I386Assembler::new(&mut self.buf).jmp(&mut self.labels[target]);
        self.reachable = false;
        Ok(())
    }

    fn emit_invoke(
        &mut self,
        method: u16,
        parameter_slots: usize,
        returns: BasicType,
    ) -> Result<(), CompileError> {
        if returns.is_float() && self.frame.fpu_map().is_none() {
            return Err(CompileError::unsupported(
                self.bci,
                "floating point result without the fpu stack",
            ));
        }
        self.flush()?;

        let end = (self.frame.virtual_stack_pointer() + 1) as usize;
        let mut asm = I386Assembler::new(&mut self.buf);
        for index in end - parameter_slots..end {
            asm.push_m(Ebp, self.frame.home_offset(index));
        }
        // The callee id travels in EAX.
        self.regs.allocate_fixed(Eax, &mut self.frame, &mut asm)?;
        asm.mov_ri(Eax, method as i32);
        asm.call(&mut self.invoke_stub);
        let return_pc = asm.offset();
        if parameter_slots > 0 {
            asm.alu_ri(AluOp::Add, Esp, 4 * parameter_slots as i32);
        }
        self.regs.release(Eax);

        self.stack_maps.add_entry(StackMapEntry::record(
            return_pc as u32,
            self.bci as u32,
            &self.frame,
            parameter_slots,
        ));
        self.frame.adjust_for_invoke(parameter_slots, returns);
        trace!(target: "jcore::jit", bci = self.bci, callee = method, return_pc, "call site");
        Ok(())
    }

    fn emit_return(&mut self, kind: BasicType) -> Result<(), CompileError> {
        match kind {
            BasicType::Void => {}
            BasicType::Int | BasicType::Object => {
                let (index, value) = self.frame.pop();
                let offset = self.frame.home_offset(index);
                match value.residence {
                    Residence::Register(Eax) => {}
                    Residence::Register(r) => I386Assembler::new(&mut self.buf).mov_rr(Eax, r),
                    Residence::Literal(v) => self.emit_literal(Eax, v)?,
                    Residence::Memory => I386Assembler::new(&mut self.buf).mov_rm(Eax, Ebp, offset),
                    other => panic!("{} result held as {:?}", kind, other),
                }
            }
            BasicType::Long => {
                let (index, value) = self.frame.pop();
                let lo_offset = self.frame.word_offset(index, kind, 0);
                let hi_offset = self.frame.word_offset(index, kind, 1);
                let mut asm = I386Assembler::new(&mut self.buf);
                match value.residence {
                    Residence::RegisterPair { lo, hi } => {
                        // Any permutation of the pair lands in EDX:EAX.
                        asm.push(hi);
                        asm.push(lo);
                        asm.pop(Eax);
                        asm.pop(Edx);
                    }
                    Residence::Literal(v) => {
                        let (lo, hi) = v.words();
                        asm.mov_ri(Eax, lo as i32);
                        asm.mov_ri(Edx, hi as i32);
                    }
                    Residence::Memory => {
                        asm.mov_rm(Eax, Ebp, lo_offset);
                        asm.mov_rm(Edx, Ebp, hi_offset);
                    }
                    other => panic!("long result held as {:?}", other),
                }
            }
            BasicType::Float | BasicType::Double => {
                if self.frame.fpu_map().is_none() {
                    return Err(CompileError::unsupported(
                        self.bci,
                        "floating point result without the fpu stack",
                    ));
                }
                self.flush()?;
                let (index, _) = self.frame.pop();
                let offset = self.frame.value_offset(index, kind);
                I386Assembler::new(&mut self.buf).fld_m(kind == BasicType::Double, Ebp, offset);
            }
        }
        // Only a floating point result may stay on the x87 stack.
        if !kind.is_float() {
            let mut asm = I386Assembler::new(&mut self.buf);
            if let Some(map) = self.frame.fpu_map_mut() {
                map.clear_and_free(&mut asm);
            }
        }
        self.emit_epilogue();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::error::BailoutKind;
    use crate::jit::relocation::read_u32;
    use crate::vm::heap::collect_roots;

    fn method(
        name: &str,
        max_locals: u16,
        max_stack: u16,
        params: &[BasicType],
        code: &[&str],
    ) -> Method {
        Method::new(name, max_locals, max_stack, params)
            .with_code(code)
            .unwrap()
    }

    fn add_method() -> Method {
        method(
            "add",
            2,
            2,
            &[BasicType::Int, BasicType::Int],
            &["iload 0", "iload 1", "iadd", "ireturn"],
        )
    }

    fn compile(m: &Method) -> Result<CompiledMethod, CompileError> {
        CompilationSession::new(m, &CompilerConfig::default())?.compile()
    }

    const EPILOGUE: [u8; 4] = [0x89, 0xEC, 0x5D, 0xC3];

    #[test]
    fn test_prologue_and_epilogue() {
        let compiled = compile(&add_method()).unwrap();
        let code = compiled.code();
        assert_eq!(
            &code[..16],
            &[
                0x55, 0x89, 0xE5, // push ebp; mov ebp, esp
                0x81, 0xEC, 0x08, 0x00, 0x00, 0x00, // sub esp, 8
                0xC6, 0x83, 0x00, 0x10, 0x00, 0x00, 0x00, // mov byte [ebx+0x1000], 0
            ]
        );
        assert_eq!(compiled.sensor_offset(), 11);
        // mov eax, edx; epilogue
        assert!(code.ends_with(&[0x89, 0xD0, 0x89, 0xEC, 0x5D, 0xC3]));
    }

    #[test]
    fn test_add_uses_no_literals_or_fpu() {
        let compiled = compile(&add_method()).unwrap();
        let stats = compiled.stats();
        assert_eq!(stats.literal_count, 0);
        assert_eq!(stats.fpu_pushes, 0);
        assert_eq!(stats.fpu_ffrees, 0);
        assert!(stats.flush_count <= 1);
        assert_eq!(stats.relocation_count, 1);
    }

    #[test]
    fn test_constant_folding() {
        let m = method(
            "five",
            0,
            2,
            &[],
            &["iconst 2", "iconst 3", "iadd", "ireturn"],
        );
        let compiled = compile(&m).unwrap();
        let mut expected = vec![0xB8, 0x05, 0x00, 0x00, 0x00];
        expected.extend_from_slice(&EPILOGUE);
        assert_eq!(&compiled.code()[16..], &expected[..]);
    }

    #[test]
    fn test_object_literal_goes_through_pool() {
        let m = Method::new("obj", 0, 1, &[])
            .with_code(&["ldc 0", "areturn"])
            .unwrap()
            .with_constants(&[Constant::Object(ObjectRef(0x1234))]);
        let mut session = CompilationSession::new(&m, &CompilerConfig::default()).unwrap();
        session.run_until(2).unwrap();
        assert_eq!(collect_roots(|v| session.oops_do(v)), vec![ObjectRef(0x1234)]);

        let compiled = session.compile().unwrap();
        assert_eq!(compiled.stats().literal_count, 1);
        let oop = compiled
            .relocations()
            .iter()
            .find(|r| r.kind == RelocationKind::Oop)
            .unwrap();
        assert_eq!(read_u32(compiled.code(), oop.offset), 0x1234);
        // mov eax, [pool slot]
        let absolute = compiled
            .relocations()
            .iter()
            .find(|r| r.kind == RelocationKind::Absolute)
            .unwrap();
        assert_eq!(read_u32(compiled.code(), absolute.offset), oop.offset as u32);
    }

    #[test]
    fn test_forward_branch_binds_label() {
        let m = method(
            "sign",
            1,
            1,
            &[BasicType::Int],
            &["iload 0", "ifeq 4", "iconst 1", "ireturn", "iconst 0", "ireturn"],
        );
        let mut session = CompilationSession::new(&m, &CompilerConfig::default()).unwrap();
        session.run_until(2).unwrap();
        assert!(session.label(4).is_linked());
        session.run_until(4).unwrap();
        assert!(session.label(4).is_bound());

        let compiled = session.compile().unwrap();
        assert_eq!(compiled.stats().label_count, 1);
        assert_eq!(compiled.stats().flush_count, 1);
    }

    #[test]
    fn test_folded_branch_skips_dead_arm() {
        let m = method(
            "folded",
            0,
            1,
            &[],
            &["iconst 0", "ifeq 4", "iconst 1", "ireturn", "iconst 2", "ireturn"],
        );
        let compiled = compile(&m).unwrap();
        let mut expected = vec![0xE9, 0, 0, 0, 0, 0xB8, 0x02, 0, 0, 0];
        expected.extend_from_slice(&EPILOGUE);
        assert_eq!(&compiled.code()[16..], &expected[..]);
    }

    #[test]
    fn test_invoke_records_stack_map() {
        let m = method(
            "caller",
            1,
            2,
            &[BasicType::Object],
            &["aload 0", "iconst 7", "invokestatic 3 2 int", "ireturn"],
        );
        let compiled = compile(&m).unwrap();
        let code = compiled.code();

        assert_eq!(compiled.stack_maps().len(), 1);
        let entry = &compiled.stack_maps().entries()[0];
        assert_eq!(entry.bci, 2);
        assert_eq!(entry.local_ref_slots(), vec![0]);
        assert_eq!(entry.stack_depth, 0);
        assert_eq!(entry.oop_offsets, vec![8]);

        // The stub jumps through the VM's invoke entry.
        assert!(code.ends_with(&[0xFF, 0xA3, 0x40, 0x00, 0x00, 0x00]));
        let pc = entry.native_pc as usize;
        let rel = read_u32(code, pc - 4) as i32;
        assert_eq!(pc as i64 + rel as i64, (code.len() - 6) as i64);
    }

    #[test]
    fn test_float_arithmetic_on_fpu() {
        let m = method(
            "fsum",
            2,
            2,
            &[BasicType::Float, BasicType::Float],
            &["fload 0", "fload 1", "fadd", "freturn"],
        );
        let compiled = compile(&m).unwrap();
        let stats = compiled.stats();
        assert_eq!(stats.fpu_pushes, 4);
        assert_eq!(stats.fpu_ffrees, 3);
        // fld dword [ebp-4]; epilogue
        assert!(compiled.code().ends_with(&[0xD9, 0x45, 0xFC, 0x89, 0xEC, 0x5D, 0xC3]));
    }

    #[test]
    #[should_panic(expected = "fpu register in use")]
    fn test_flush_refuses_held_fpu_operand() {
        let m = method(
            "fsum",
            2,
            2,
            &[BasicType::Float, BasicType::Float],
            &["fload 0", "fload 1", "fadd", "freturn"],
        );
        let mut session = CompilationSession::new(&m, &CompilerConfig::default()).unwrap();
        session.run_until(2).unwrap();
        let top = session.frame().fpu_map().unwrap().top().unwrap();
        session.regs.reference_fpu(top);
        session.flush().unwrap();
    }

    #[test]
    fn test_float_arithmetic_without_fpu_bails_out() {
        let m = method(
            "fsum",
            2,
            2,
            &[BasicType::Float, BasicType::Float],
            &["fload 0", "fload 1", "fadd", "freturn"],
        );
        let config = CompilerConfig {
            fpu_stack: false,
            ..CompilerConfig::default()
        };
        let err = CompilationSession::new(&m, &config)
            .unwrap()
            .compile()
            .unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { bci: 2, .. }));
    }

    #[test]
    fn test_unsupported_opcode() {
        let m = method(
            "rem",
            2,
            2,
            &[BasicType::Int, BasicType::Int],
            &["iload 0", "iload 1", "irem", "ireturn"],
        );
        let err = compile(&m).unwrap_err();
        assert_eq!(err.kind(), BailoutKind::Unsupported);
        assert!(matches!(err, CompileError::Unsupported { bci: 2, .. }));
    }

    #[test]
    fn test_register_pressure_retries_from_memory() {
        let m = method(
            "lsum",
            4,
            4,
            &[BasicType::Long, BasicType::Long],
            &["lload 0", "lload 2", "ladd", "lreturn"],
        );
        let compiled = compile(&m).unwrap();
        assert_eq!(compiled.stats().flush_count, 1);
        assert!(compiled.code().ends_with(&EPILOGUE));
    }

    #[test]
    fn test_checkpoint_rollback() {
        let m = add_method();
        let mut session = CompilationSession::new(&m, &CompilerConfig::default()).unwrap();
        session.step().unwrap();
        session.step().unwrap();

        let code_len = session.code().len();
        let dump = session.frame().dump();
        let arena = session.arena().used();
        let checkpoint = session.checkpoint().unwrap();
        session.step().unwrap();
        assert_ne!(session.code().len(), code_len);

        session.rollback(checkpoint);
        assert_eq!(session.code().len(), code_len);
        assert_eq!(session.frame().dump(), dump);
        assert_eq!(session.arena().used(), arena);
        assert_eq!(session.bci(), 2);

        let resumed = session.compile().unwrap();
        let fresh = compile(&m).unwrap();
        assert_eq!(resumed.code(), fresh.code());
    }

    #[test]
    fn test_code_buffer_limit() {
        let config = CompilerConfig {
            code_buffer_size: 8,
            ..CompilerConfig::default()
        };
        let err = CompilationSession::new(&add_method(), &config)
            .unwrap()
            .compile()
            .unwrap_err();
        assert_eq!(err, CompileError::CodeBufferFull { limit: 8 });
        assert_eq!(err.kind(), BailoutKind::ResourceExhausted);
    }

    #[test]
    fn test_arena_limit() {
        let m = method(
            "sign",
            1,
            1,
            &[BasicType::Int],
            &["iload 0", "ifeq 4", "iconst 1", "ireturn", "iconst 0", "ireturn"],
        );
        let config = CompilerConfig {
            arena_size: 8,
            ..CompilerConfig::default()
        };
        let err = CompilationSession::new(&m, &config).err().unwrap();
        assert!(matches!(err, CompileError::ArenaExhausted { .. }));
    }

    #[test]
    fn test_long_local_over_last_parameter() {
        // lstore 0 spans the int parameter and the first frame local.
        let m = method(
            "widen",
            2,
            2,
            &[BasicType::Int],
            &["lconst 5", "lstore 0", "invokestatic 1 0 void", "lload 0", "lreturn"],
        );
        let compiled = compile(&m).unwrap();
        let code = compiled.code();
        let contains = |bytes: &[u8]| code.windows(bytes.len()).any(|w| w == bytes);
        // mov dword [ebp-4], 5; mov dword [ebp+8], 0
        assert!(contains(&[0xC7, 0x45, 0xFC, 0x05, 0x00, 0x00, 0x00]));
        assert!(contains(&[0xC7, 0x45, 0x08, 0x00, 0x00, 0x00, 0x00]));
        // Nothing is written to the saved EBP.
        assert!(!contains(&[0xC7, 0x45, 0x00]));
        assert!(code.ends_with(&EPILOGUE));
    }

    #[test]
    fn test_double_local_over_last_parameter_bails_out() {
        let m = method(
            "split",
            3,
            2,
            &[BasicType::Int],
            &["dconst 2.5", "dstore 0", "return"],
        );
        let err = compile(&m).unwrap_err();
        assert!(matches!(err, CompileError::Unsupported { bci: 1, .. }));

        let config = CompilerConfig {
            fpu_stack: false,
            ..CompilerConfig::default()
        };
        assert!(CompilationSession::new(&m, &config).unwrap().compile().is_ok());
    }

    #[test]
    fn test_rollback_unlinks_branch() {
        let m = method(
            "skip",
            1,
            1,
            &[BasicType::Int],
            &["iload 0", "goto 3", "iconst 1", "ireturn"],
        );
        let mut session = CompilationSession::new(&m, &CompilerConfig::default()).unwrap();
        session.step().unwrap();
        let checkpoint = session.checkpoint().unwrap();
        session.step().unwrap();
        assert!(session.label(3).is_linked());

        session.rollback(checkpoint);
        assert!(session.label(3).is_unused());
        let resumed = session.compile().unwrap();
        assert_eq!(resumed.code(), compile(&m).unwrap().code());
    }

    #[test]
    fn test_too_many_parameters_is_unsupported() {
        let m = Method::new("wide", 1, 1, &[BasicType::Long])
            .with_code(&["return"])
            .unwrap();
        let err = CompilationSession::new(&m, &CompilerConfig::default()).err().unwrap();
        assert!(matches!(err, CompileError::Unsupported { bci: 0, .. }));
    }

    #[test]
    fn test_verify_error_is_unsupported() {
        let m = method("bad", 0, 1, &[], &["iadd", "ireturn"]);
        let err = CompilationSession::new(&m, &CompilerConfig::default()).err().unwrap();
        assert!(matches!(err, CompileError::Unsupported { bci: 0, .. }));
    }
}
