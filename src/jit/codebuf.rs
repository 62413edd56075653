//! Code buffer for building compiled methods.
//!
//! Bytes are emitted in order; labels are patched in place when they are
//! bound. The buffer has a size limit: emission past the limit still
//! succeeds so that instruction encoders stay infallible, but
//! [`CodeBuffer::check_capacity`] reports it so the compilation can bail out.

use super::error::CompileError;
use super::label::{BinaryLabel, CHAIN_END};
use super::relocation::{read_u32, write_u32, Relocation, RelocationKind};

/// How a label reference is encoded in its 32-bit operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchKind {
    /// Displacement from the end of the operand (branches, calls).
    Rel32,
    /// Code-relative address of the target (literal pool references).
    Abs32,
}

/// Restore point for [`CodeBuffer::reset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeMark {
    len: usize,
    relocations: usize,
}

/// A buffer for building machine code.
pub struct CodeBuffer {
    code: Vec<u8>,
    limit: usize,
    relocations: Vec<Relocation>,
}

impl CodeBuffer {
    /// Create a buffer that refuses to grow past `limit` bytes.
    pub fn with_limit(limit: usize) -> Self {
        Self {
            code: Vec::with_capacity(limit.min(4096)),
            limit,
            relocations: Vec::new(),
        }
    }

    /// Get the current size of the code.
    pub fn len(&self) -> usize {
        self.code.len()
    }

    /// Check if the buffer is empty.
    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Get the current offset (for labels).
    pub fn offset(&self) -> usize {
        self.code.len()
    }

    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Fail once the emitted code no longer fits.
    pub fn check_capacity(&self) -> Result<(), CompileError> {
        if self.code.len() > self.limit {
            return Err(CompileError::CodeBufferFull { limit: self.limit });
        }
        Ok(())
    }

    /// Emit a single byte.
    pub fn emit_u8(&mut self, byte: u8) {
        self.code.push(byte);
    }

    /// Emit a 32-bit value (little-endian).
    pub fn emit_u32(&mut self, value: u32) {
        self.code.extend_from_slice(&value.to_le_bytes());
    }

    /// Emit multiple bytes.
    pub fn emit_bytes(&mut self, bytes: &[u8]) {
        self.code.extend_from_slice(bytes);
    }

    /// Record that the next 32-bit operand needs relocation.
    pub fn relocate(&mut self, kind: RelocationKind) {
        self.relocations.push(Relocation {
            offset: self.code.len(),
            kind,
        });
    }

    /// Record a relocation for an operand emitted earlier.
    pub fn relocate_at(&mut self, offset: usize, kind: RelocationKind) {
        debug_assert!(offset + 4 <= self.code.len(), "relocation past end of code");
        self.relocations.push(Relocation { offset, kind });
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    /// Emit a 32-bit operand referring to `label`.
    ///
    /// A bound label is encoded directly. Otherwise the operand joins the
    /// label's forward-reference chain and is patched by [`Self::bind`].
    pub fn emit_label_ref(&mut self, label: &mut BinaryLabel, kind: PatchKind) {
        let at = self.code.len();
        match label.position() {
            Some(target) => {
                self.emit_u32(0);
                self.patch(at, target, kind);
            }
            None => {
                let previous = label.link(at);
                let placeholder = previous.map_or(CHAIN_END, |p| p as i32);
                self.emit_u32(placeholder as u32);
            }
        }
    }

    /// Bind `label` to the current offset.
    pub fn bind(&mut self, label: &mut BinaryLabel, kind: PatchKind) {
        let position = self.code.len();
        self.bind_at(label, position, kind);
    }

    /// Bind `label` to `position` and patch every waiting reference.
    pub fn bind_at(&mut self, label: &mut BinaryLabel, position: usize, kind: PatchKind) {
        let mut cursor = label.bind(position);
        while let Some(at) = cursor {
            let next = read_u32(&self.code, at) as i32;
            self.patch(at, position, kind);
            cursor = if next == CHAIN_END {
                None
            } else {
                Some(next as usize)
            };
        }
    }

    fn patch(&mut self, at: usize, target: usize, kind: PatchKind) {
        let value = match kind {
            PatchKind::Rel32 => (target as i64 - (at as i64 + 4)) as i32 as u32,
            PatchKind::Abs32 => target as u32,
        };
        write_u32(&mut self.code, at, value);
    }

    /// Overwrite a previously emitted 32-bit value.
    pub fn patch_u32(&mut self, at: usize, value: u32) {
        write_u32(&mut self.code, at, value);
    }

    pub fn read_u32(&self, at: usize) -> u32 {
        read_u32(&self.code, at)
    }

    /// Align the code to the given boundary.
    pub fn align(&mut self, alignment: usize, fill: u8) {
        while self.code.len() % alignment != 0 {
            self.emit_u8(fill);
        }
    }

    pub fn mark(&self) -> CodeMark {
        CodeMark {
            len: self.code.len(),
            relocations: self.relocations.len(),
        }
    }

    /// Drop everything emitted since `mark`.
    pub fn reset(&mut self, mark: CodeMark) {
        self.code.truncate(mark.len);
        self.relocations.truncate(mark.relocations);
    }

    /// Get the code bytes (for inspection).
    pub fn code(&self) -> &[u8] {
        &self.code
    }

    /// Consume the buffer and return the code and its relocations.
    pub fn into_parts(self) -> (Vec<u8>, Vec<Relocation>) {
        (self.code, self.relocations)
    }
}
