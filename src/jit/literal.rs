//! Per-method literal pool.
//!
//! Constants that cannot be encoded as immediates (object handles, most
//! float bit patterns) are referenced through a pool laid out after the
//! method body. Each element owns the label its references link to; the
//! label is bound when the pool is laid out.

use super::codebuf::{CodeBuffer, PatchKind};
use super::error::CompileError;
use super::label::BinaryLabel;
use super::relocation::RelocationKind;
use crate::vm::heap::{ObjectRef, RootVisitor};
use tracing::debug;

/// First-use marker for an element that has not been laid out.
pub const NOT_YET_DEFINED: i32 = -1;

/// Handle to an element of a [`LiteralPool`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LiteralId(usize);

impl LiteralId {
    pub fn index(self) -> usize {
        self.0
    }
}

/// A pooled constant.
#[derive(Debug, Clone, PartialEq)]
pub struct LiteralPoolElement {
    literal_object: Option<ObjectRef>,
    literal_immediate: i32,
    label: BinaryLabel,
    first_use_bci: i32,
    first_reference: Option<usize>,
}

impl LiteralPoolElement {
    fn new(literal_object: Option<ObjectRef>, literal_immediate: i32) -> Self {
        Self {
            literal_object,
            literal_immediate,
            label: BinaryLabel::new(),
            first_use_bci: NOT_YET_DEFINED,
            first_reference: None,
        }
    }

    /// Exact identity match on both fields.
    pub fn matches(&self, object: Option<ObjectRef>, immediate: i32) -> bool {
        self.literal_object == object && self.literal_immediate == immediate
    }

    pub fn literal_object(&self) -> Option<ObjectRef> {
        self.literal_object
    }

    pub fn literal_immediate(&self) -> i32 {
        self.literal_immediate
    }

    pub fn label(&self) -> &BinaryLabel {
        &self.label
    }

    pub fn is_bound(&self) -> bool {
        self.label.is_bound()
    }

    /// Bytecode index of the first use, or [`NOT_YET_DEFINED`].
    pub fn bci(&self) -> i32 {
        self.first_use_bci
    }

    /// The word stored in the pool slot.
    fn word(&self) -> u32 {
        match self.literal_object {
            Some(object) => object.raw(),
            None => self.literal_immediate as u32,
        }
    }

    /// Emit this element's pool slot at the current offset unless already there.
    pub fn bind_if_unbound(&mut self, buf: &mut CodeBuffer, bci: i32) {
        if self.label.is_bound() {
            return;
        }
        buf.bind(&mut self.label, PatchKind::Abs32);
        if self.literal_object.is_some() {
            buf.relocate(RelocationKind::Oop);
        }
        buf.emit_u32(self.word());
        self.first_use_bci = bci;
    }
}

/// Where [`LiteralPool::reset`] rolls the pool back to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LiteralMark {
    len: usize,
    undo: usize,
}

/// Element state overwritten by a reference: index, label, first reference.
type Undo = (usize, BinaryLabel, Option<usize>);

/// The literal pool of one compilation.
#[derive(Debug, Clone)]
pub struct LiteralPool {
    elements: Vec<LiteralPoolElement>,
    max_literals: usize,
    undo: Vec<Undo>,
}

impl LiteralPool {
    pub fn new(max_literals: usize) -> Self {
        Self {
            elements: Vec::new(),
            max_literals,
            undo: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.elements.is_empty()
    }

    pub fn get(&self, id: LiteralId) -> &LiteralPoolElement {
        &self.elements[id.0]
    }

    pub fn elements(&self) -> &[LiteralPoolElement] {
        &self.elements
    }

    /// Find the element for `(object, immediate)`, creating it if absent.
    pub fn find_or_create(
        &mut self,
        object: Option<ObjectRef>,
        immediate: i32,
    ) -> Result<LiteralId, CompileError> {
        if let Some(index) = self.elements.iter().position(|e| e.matches(object, immediate)) {
            return Ok(LiteralId(index));
        }
        if self.elements.len() >= self.max_literals {
            return Err(CompileError::LiteralPoolFull {
                limit: self.max_literals,
            });
        }
        self.elements.push(LiteralPoolElement::new(object, immediate));
        Ok(LiteralId(self.elements.len() - 1))
    }

    /// Emit the 32-bit address operand of an instruction reading `id`.
    pub fn emit_reference(&mut self, id: LiteralId, buf: &mut CodeBuffer, bci: usize) {
        let element = &mut self.elements[id.0];
        self.undo.push((id.0, element.label, element.first_reference));
        element.first_reference.get_or_insert(bci);
        buf.relocate(RelocationKind::Absolute);
        buf.emit_label_ref(&mut element.label, PatchKind::Abs32);
    }

    pub fn mark(&self) -> LiteralMark {
        LiteralMark {
            len: self.elements.len(),
            undo: self.undo.len(),
        }
    }

    /// Drop elements created since `mark` and unlink references made since.
    pub fn reset(&mut self, mark: LiteralMark) {
        while self.undo.len() > mark.undo {
            let Some((index, label, first_reference)) = self.undo.pop() else {
                break;
            };
            if let Some(element) = self.elements.get_mut(index) {
                element.label = label;
                element.first_reference = first_reference;
            }
        }
        self.elements.truncate(mark.len);
    }

    /// Discard undo records; no outstanding mark may be reset afterwards.
    pub fn forget_undo(&mut self) {
        self.undo.clear();
    }

    /// Lay out every referenced element at the end of the code.
    pub fn layout(&mut self, buf: &mut CodeBuffer) {
        if self.elements.is_empty() {
            return;
        }
        buf.align(4, 0xCC);
        let start = buf.offset();
        for element in &mut self.elements {
            let bci = element.first_reference.map_or(NOT_YET_DEFINED, |b| b as i32);
            element.bind_if_unbound(buf, bci);
        }
        debug!(
            target: "jcore::jit",
            start,
            literals = self.elements.len(),
            "literal pool laid out"
        );
    }

    /// Report every pooled object handle as a root.
    pub fn oops_do(&mut self, visitor: &mut RootVisitor<'_>) {
        for element in &mut self.elements {
            if let Some(object) = element.literal_object.as_mut() {
                visitor(object);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::heap::collect_roots;

    #[test]
    fn test_dedupe() {
        let mut pool = LiteralPool::new(8);
        let a = pool.find_or_create(Some(ObjectRef(64)), 0).unwrap();
        let b = pool.find_or_create(Some(ObjectRef(64)), 0).unwrap();
        let c = pool.find_or_create(None, 64).unwrap();
        let d = pool.find_or_create(Some(ObjectRef(64)), 1).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_ne!(a, d);
        assert_eq!(pool.len(), 3);
    }

    #[test]
    fn test_new_element_unbound() {
        let mut pool = LiteralPool::new(8);
        let id = pool.find_or_create(None, 0x4020_0000).unwrap();
        assert!(!pool.get(id).is_bound());
        assert_eq!(pool.get(id).bci(), NOT_YET_DEFINED);
    }

    #[test]
    fn test_pool_full() {
        let mut pool = LiteralPool::new(1);
        pool.find_or_create(None, 1).unwrap();
        assert!(pool.find_or_create(None, 1).is_ok());
        assert_eq!(
            pool.find_or_create(None, 2),
            Err(CompileError::LiteralPoolFull { limit: 1 })
        );
    }

    #[test]
    fn test_layout_binds_and_patches() {
        let mut buf = CodeBuffer::with_limit(64);
        let mut pool = LiteralPool::new(8);
        let obj = pool.find_or_create(Some(ObjectRef(0x80)), 0).unwrap();
        let imm = pool.find_or_create(None, 7).unwrap();

        buf.emit_bytes(&[0x8B, 0x05]);
        pool.emit_reference(obj, &mut buf, 2);
        buf.emit_bytes(&[0xD9, 0x05]);
        pool.emit_reference(imm, &mut buf, 5);
        buf.emit_bytes(&[0x8B, 0x0D]);
        pool.emit_reference(obj, &mut buf, 9);
        pool.layout(&mut buf);

        // 18 bytes of code, pool starts aligned at 20.
        assert_eq!(buf.read_u32(2), 20);
        assert_eq!(buf.read_u32(14), 20);
        assert_eq!(buf.read_u32(8), 24);
        assert_eq!(buf.read_u32(20), 0x80);
        assert_eq!(buf.read_u32(24), 7);
        assert!(pool.get(obj).is_bound());
        assert_eq!(pool.get(obj).bci(), 2);
        assert_eq!(pool.get(imm).bci(), 5);

        let kinds: Vec<_> = buf.relocations().iter().map(|r| (r.offset, r.kind)).collect();
        assert!(kinds.contains(&(20, RelocationKind::Oop)));
        assert!(!kinds.contains(&(24, RelocationKind::Oop)));
        assert!(kinds.contains(&(2, RelocationKind::Absolute)));
    }

    #[test]
    fn test_reset_unlinks_later_references() {
        let mut buf = CodeBuffer::with_limit(64);
        let mut pool = LiteralPool::new(8);
        let kept = pool.find_or_create(None, 7).unwrap();
        buf.emit_bytes(&[0xD9, 0x05]);
        pool.emit_reference(kept, &mut buf, 0);
        let before = *pool.get(kept).label();

        let mark = pool.mark();
        let code = buf.mark();
        buf.emit_bytes(&[0xD9, 0x05]);
        pool.emit_reference(kept, &mut buf, 3);
        let dropped = pool.find_or_create(Some(ObjectRef(0x40)), 0).unwrap();
        pool.emit_reference(dropped, &mut buf, 3);

        pool.reset(mark);
        buf.reset(code);
        assert_eq!(pool.len(), 1);
        assert_eq!(*pool.get(kept).label(), before);

        pool.layout(&mut buf);
        assert_eq!(buf.read_u32(2), 8);
        assert_eq!(buf.read_u32(8), 7);
    }

    #[test]
    fn test_oops_do() {
        let mut pool = LiteralPool::new(8);
        pool.find_or_create(Some(ObjectRef(16)), 0).unwrap();
        pool.find_or_create(None, 3).unwrap();
        pool.find_or_create(Some(ObjectRef(32)), 0).unwrap();
        let roots = collect_roots(|v| pool.oops_do(v));
        assert_eq!(roots, vec![ObjectRef(16), ObjectRef(32)]);

        pool.oops_do(&mut |r: &mut ObjectRef| r.0 += 1);
        assert_eq!(pool.elements()[0].literal_object(), Some(ObjectRef(17)));
    }
}
