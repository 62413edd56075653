//! Frame-shape verifier for decoded methods.
//!
//! Computes, by abstract interpretation, the kind of every local and
//! operand-stack value on entry to each instruction:
//! - Control flow: branch targets must be instruction boundaries
//! - Stack consistency: every path into a bci agrees on the stack kinds
//! - Stack effects: no underflow, no overflow of `max_stack`, no split of
//!   a two-word value
//!
//! Locals that disagree across incoming paths merge to `Void` (unusable).
//! Opcodes without a modelled stack effect end the path that reaches them.

use std::collections::VecDeque;

use super::bytecode::{BasicType, Bytecode, Method};

/// Verification error types
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum VerifyError {
    #[error("invalid branch target at bci={bci}: target={target} is out of bounds")]
    InvalidBranchTarget { bci: usize, target: usize },
    #[error("stack mismatch at bci={bci}: incoming paths disagree")]
    StackMismatch { bci: usize },
    #[error("stack underflow at bci={bci}")]
    StackUnderflow { bci: usize },
    #[error("stack overflow at bci={bci}: {slots} slots exceeds max_stack {max}")]
    StackOverflow { bci: usize, slots: usize, max: usize },
    #[error("type mismatch at bci={bci}: expected {expected}, found {found}")]
    TypeMismatch {
        bci: usize,
        expected: BasicType,
        found: BasicType,
    },
    #[error("two-word value split at bci={bci}")]
    SplitTwoWord { bci: usize },
    #[error("bad local access at bci={bci}: local {local}")]
    BadLocal { bci: usize, local: usize },
    #[error("constant {index} out of range at bci={bci}")]
    BadConstant { bci: usize, index: usize },
    #[error("control falls off the end of the method")]
    FallsOffEnd,
}

impl VerifyError {
    /// Instruction the error was found at, if it belongs to one.
    pub fn bci(&self) -> Option<usize> {
        match *self {
            VerifyError::InvalidBranchTarget { bci, .. }
            | VerifyError::StackMismatch { bci }
            | VerifyError::StackUnderflow { bci }
            | VerifyError::StackOverflow { bci, .. }
            | VerifyError::TypeMismatch { bci, .. }
            | VerifyError::SplitTwoWord { bci }
            | VerifyError::BadLocal { bci, .. }
            | VerifyError::BadConstant { bci, .. } => Some(bci),
            VerifyError::FallsOffEnd => None,
        }
    }
}

/// Kinds of every local slot and stack value at one program point.
///
/// `stack` holds one entry per value, so a `long` is a single entry that
/// occupies two slots. In `locals` the upper half of a two-word local is
/// recorded as `Void`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameShape {
    pub locals: Vec<BasicType>,
    pub stack: Vec<BasicType>,
}

impl FrameShape {
    /// Shape on method entry: parameters in their slots, everything else unknown.
    pub fn entry(method: &Method) -> Self {
        let mut locals = vec![BasicType::Void; method.max_locals as usize];
        let mut slot = 0;
        for &param in &method.params {
            locals[slot] = param;
            slot += param.word_size();
        }
        Self {
            locals,
            stack: Vec::new(),
        }
    }

    /// Number of stack slots in use.
    pub fn stack_slots(&self) -> usize {
        self.stack.iter().map(|t| t.word_size()).sum()
    }

    fn pop(&mut self, bci: usize) -> Result<BasicType, VerifyError> {
        self.stack.pop().ok_or(VerifyError::StackUnderflow { bci })
    }

    fn pop_kind(&mut self, bci: usize, expected: BasicType) -> Result<(), VerifyError> {
        let found = self.pop(bci)?;
        if found != expected {
            return Err(VerifyError::TypeMismatch {
                bci,
                expected,
                found,
            });
        }
        Ok(())
    }

    fn pop_single(&mut self, bci: usize) -> Result<BasicType, VerifyError> {
        let found = self.pop(bci)?;
        if found.is_two_word() {
            return Err(VerifyError::SplitTwoWord { bci });
        }
        Ok(found)
    }

    fn store_local(&mut self, bci: usize, kind: BasicType, n: usize) -> Result<(), VerifyError> {
        if n + kind.word_size() > self.locals.len() {
            return Err(VerifyError::BadLocal { bci, local: n });
        }
        if n > 0 && self.locals[n - 1].is_two_word() {
            self.locals[n - 1] = BasicType::Void;
        }
        if self.locals[n].is_two_word() && n + 1 < self.locals.len() {
            self.locals[n + 1] = BasicType::Void;
        }
        self.locals[n] = kind;
        if kind.is_two_word() {
            self.locals[n + 1] = BasicType::Void;
        }
        Ok(())
    }

    fn merge(&mut self, other: &FrameShape, bci: usize) -> Result<bool, VerifyError> {
        if self.stack != other.stack {
            return Err(VerifyError::StackMismatch { bci });
        }
        let mut changed = false;
        for (mine, theirs) in self.locals.iter_mut().zip(&other.locals) {
            if *mine != *theirs && *mine != BasicType::Void {
                *mine = BasicType::Void;
                changed = true;
            }
        }
        Ok(changed)
    }
}

/// Frame-shape verifier.
pub struct Verifier<'m> {
    method: &'m Method,
}

impl<'m> Verifier<'m> {
    pub fn new(method: &'m Method) -> Self {
        Self { method }
    }

    /// Entry shape of every bci, `None` for instructions no path reaches.
    pub fn frame_shapes(&self) -> Result<Vec<Option<FrameShape>>, VerifyError> {
        let code = &self.method.code;
        let mut shapes: Vec<Option<FrameShape>> = vec![None; code.len()];
        if code.is_empty() {
            return Ok(shapes);
        }

        let mut worklist: VecDeque<usize> = VecDeque::new();
        shapes[0] = Some(FrameShape::entry(self.method));
        worklist.push_back(0);

        while let Some(bci) = worklist.pop_front() {
            let Some(mut shape) = shapes[bci].clone() else {
                continue;
            };
            let op = code[bci];
            if !self.apply(&mut shape, bci, &op)? {
                continue;
            }

            let mut successors = Vec::with_capacity(2);
            if let Some(target) = op.branch_target() {
                if target >= code.len() {
                    return Err(VerifyError::InvalidBranchTarget { bci, target });
                }
                successors.push(target);
            }
            if !op.ends_block() {
                if bci + 1 >= code.len() {
                    return Err(VerifyError::FallsOffEnd);
                }
                successors.push(bci + 1);
            }

            for succ in successors {
                match &mut shapes[succ] {
                    None => {
                        shapes[succ] = Some(shape.clone());
                        worklist.push_back(succ);
                    }
                    Some(existing) => {
                        if existing.merge(&shape, succ)? {
                            worklist.push_back(succ);
                        }
                    }
                }
            }
        }

        Ok(shapes)
    }

    /// Apply the stack effect of `op`. Returns false when the path ends here.
    fn apply(&self, shape: &mut FrameShape, bci: usize, op: &Bytecode) -> Result<bool, VerifyError> {
        use BasicType::*;

        match *op {
            Bytecode::IConst(_) => shape.stack.push(Int),
            Bytecode::LConst(_) => shape.stack.push(Long),
            Bytecode::FConst(_) => shape.stack.push(Float),
            Bytecode::DConst(_) => shape.stack.push(Double),
            Bytecode::AConstNull => shape.stack.push(Object),
            Bytecode::Ldc(n) => {
                let constant = self
                    .method
                    .constants
                    .get(n as usize)
                    .ok_or(VerifyError::BadConstant {
                        bci,
                        index: n as usize,
                    })?;
                shape.stack.push(constant.basic_type());
            }
            Bytecode::Load(kind, n) => {
                let n = n as usize;
                match shape.locals.get(n) {
                    Some(&found) if found == kind => shape.stack.push(kind),
                    Some(&found) => {
                        return Err(VerifyError::TypeMismatch {
                            bci,
                            expected: kind,
                            found,
                        });
                    }
                    None => return Err(VerifyError::BadLocal { bci, local: n }),
                }
            }
            Bytecode::Store(kind, n) => {
                shape.pop_kind(bci, kind)?;
                shape.store_local(bci, kind, n as usize)?;
            }
            Bytecode::IInc(n, _) => {
                let n = n as usize;
                match shape.locals.get(n) {
                    Some(Int) => {}
                    Some(&found) => {
                        return Err(VerifyError::TypeMismatch {
                            bci,
                            expected: Int,
                            found,
                        });
                    }
                    None => return Err(VerifyError::BadLocal { bci, local: n }),
                }
            }
            Bytecode::Arith(kind, _) => {
                shape.pop_kind(bci, kind)?;
                shape.pop_kind(bci, kind)?;
                shape.stack.push(kind);
            }
            Bytecode::INeg => {
                shape.pop_kind(bci, Int)?;
                shape.stack.push(Int);
            }
            Bytecode::Pop => {
                shape.pop_single(bci)?;
            }
            Bytecode::Pop2 => {
                let top = shape.pop(bci)?;
                if !top.is_two_word() {
                    shape.pop_single(bci)?;
                }
            }
            Bytecode::Dup => {
                let top = shape.pop_single(bci)?;
                shape.stack.extend([top, top]);
            }
            Bytecode::DupX1 => {
                let a = shape.pop_single(bci)?;
                let b = shape.pop_single(bci)?;
                shape.stack.extend([a, b, a]);
            }
            Bytecode::Dup2 => {
                let top = shape.pop(bci)?;
                if top.is_two_word() {
                    shape.stack.extend([top, top]);
                } else {
                    let below = shape.pop_single(bci)?;
                    shape.stack.extend([below, top, below, top]);
                }
            }
            Bytecode::Swap => {
                let a = shape.pop_single(bci)?;
                let b = shape.pop_single(bci)?;
                shape.stack.extend([a, b]);
            }
            Bytecode::If(..) => shape.pop_kind(bci, Int)?,
            Bytecode::IfICmp(..) => {
                shape.pop_kind(bci, Int)?;
                shape.pop_kind(bci, Int)?;
            }
            Bytecode::Goto(_) => {}
            Bytecode::InvokeStatic {
                parameter_slots,
                returns,
                ..
            } => {
                let mut remaining = parameter_slots as usize;
                while remaining > 0 {
                    let arg = shape.pop(bci)?;
                    if arg.word_size() > remaining {
                        return Err(VerifyError::SplitTwoWord { bci });
                    }
                    remaining -= arg.word_size();
                }
                if returns != Void {
                    shape.stack.push(returns);
                }
            }
            Bytecode::Return(kind) => {
                if kind != Void {
                    shape.pop_kind(bci, kind)?;
                }
            }
            Bytecode::Other(_) => return Ok(false),
        }

        let slots = shape.stack_slots();
        if slots > self.method.max_stack as usize {
            return Err(VerifyError::StackOverflow {
                bci,
                slots,
                max: self.method.max_stack as usize,
            });
        }
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn method(max_locals: u16, max_stack: u16, params: &[BasicType], code: &[&str]) -> Method {
        Method::new("test", max_locals, max_stack, params)
            .with_code(code)
            .unwrap()
    }

    #[test]
    fn test_straight_line() {
        let m = method(2, 2, &[BasicType::Int, BasicType::Int], &["iload 0", "iload 1", "iadd", "ireturn"]);
        let shapes = Verifier::new(&m).frame_shapes().unwrap();
        assert_eq!(shapes[2].as_ref().unwrap().stack, vec![BasicType::Int, BasicType::Int]);
        assert_eq!(shapes[3].as_ref().unwrap().stack, vec![BasicType::Int]);
    }

    #[test]
    fn test_merge_kills_disagreeing_local() {
        let m = method(
            2,
            1,
            &[BasicType::Int],
            &["iload 0", "ifeq 5", "iconst 1", "istore 1", "goto 7", "fconst 1.0", "fstore 1", "return"],
        );
        let shapes = Verifier::new(&m).frame_shapes().unwrap();
        let join = shapes[7].as_ref().unwrap();
        assert_eq!(join.locals, vec![BasicType::Int, BasicType::Void]);
    }

    #[test]
    fn test_stack_mismatch() {
        let m = method(1, 2, &[BasicType::Int], &["iload 0", "iload 0", "ifeq 3", "ireturn"]);
        // Both paths reach bci 3 with one int; this is fine.
        assert!(Verifier::new(&m).frame_shapes().is_ok());

        let bad = method(1, 2, &[BasicType::Int], &["iconst 0", "iload 0", "ifeq 4", "iconst 1", "ireturn"]);
        assert!(matches!(
            Verifier::new(&bad).frame_shapes(),
            Err(VerifyError::StackMismatch { bci: 4 })
        ));
    }

    #[test]
    fn test_split_two_word() {
        let m = method(2, 2, &[BasicType::Long], &["lload 0", "pop", "return"]);
        assert!(matches!(
            Verifier::new(&m).frame_shapes(),
            Err(VerifyError::SplitTwoWord { bci: 1 })
        ));
    }

    #[test]
    fn test_overflow() {
        let m = method(0, 1, &[], &["iconst 1", "iconst 2", "iadd", "ireturn"]);
        assert!(matches!(
            Verifier::new(&m).frame_shapes(),
            Err(VerifyError::StackOverflow { bci: 1, .. })
        ));
    }

    #[test]
    fn test_unreachable_after_other() {
        let m = method(0, 1, &[], &["athrow", "return"]);
        let shapes = Verifier::new(&m).frame_shapes().unwrap();
        assert!(shapes[0].is_some());
        assert!(shapes[1].is_none());
    }

    #[test]
    fn test_backward_branch_loop() {
        let m = method(
            1,
            1,
            &[BasicType::Int],
            &["goto 2", "iinc 0 -1", "iload 0", "ifgt 1", "return"],
        );
        let shapes = Verifier::new(&m).frame_shapes().unwrap();
        assert!(shapes.iter().all(|s| s.is_some()));
    }
}
