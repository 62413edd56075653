//! Relocation entries and the strategies that apply them.
//!
//! Compiled code is emitted as if placed at address 0. Every operand whose
//! value depends on where the code lives, or that embeds a heap handle, is
//! recorded so that it can be fixed up after the code moves.

use serde::Serialize;
use std::fmt;

/// What the 32-bit word at a relocation offset holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RelocationKind {
    /// A heap object handle; rewritten by the collector, never by moves.
    Oop,
    /// An absolute address inside the method's own code.
    Absolute,
    /// The displacement of the prologue's execution-sensor store.
    ExecutionSensor,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Relocation {
    /// Byte offset of the 32-bit operand within the method's code.
    pub offset: usize,
    pub kind: RelocationKind,
}

pub(crate) fn read_u32(code: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&code[offset..offset + 4]);
    u32::from_le_bytes(word)
}

pub(crate) fn write_u32(code: &mut [u8], offset: usize, value: u32) {
    code[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

/// How an architecture fixes up code that moved by `delta` bytes.
pub trait Relocator: Sync {
    fn name(&self) -> &'static str;

    fn update_relative_offsets(&self, code: &mut [u8], relocations: &[Relocation], delta: isize);
}

impl fmt::Debug for dyn Relocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// i386: literal references are absolute 32-bit addresses.
pub struct AbsoluteRelocator;

impl Relocator for AbsoluteRelocator {
    fn name(&self) -> &'static str {
        "absolute"
    }

    fn update_relative_offsets(&self, code: &mut [u8], relocations: &[Relocation], delta: isize) {
        for reloc in relocations.iter().filter(|r| r.kind == RelocationKind::Absolute) {
            let old = read_u32(code, reloc.offset);
            write_u32(code, reloc.offset, old.wrapping_add(delta as u32));
        }
    }
}

/// Thumb2-style targets: every internal reference is PC-relative already.
pub struct PcRelativeRelocator;

impl Relocator for PcRelativeRelocator {
    fn name(&self) -> &'static str {
        "pc-relative"
    }

    fn update_relative_offsets(&self, _code: &mut [u8], _relocations: &[Relocation], _delta: isize) {}
}

pub static ABSOLUTE: AbsoluteRelocator = AbsoluteRelocator;
pub static PC_RELATIVE: PcRelativeRelocator = PcRelativeRelocator;
