//! Stack maps for compiled frames.
//!
//! At every call site the frame is fully flushed, so each live value sits in
//! its home slot. The entry recorded for the call's return address lists
//! the locals and stack slots holding object references, and the EBP-relative
//! offsets the collector has to visit while the callee runs.

use super::frame::{Residence, VirtualStackFrame};
use crate::vm::bytecode::BasicType;
use serde::Serialize;

/// One safepoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StackMapEntry {
    /// Code offset of the return address of the call.
    pub native_pc: u32,
    pub bci: u32,
    /// Bit N set: local N holds a reference.
    pub locals_refs: u64,
    /// Bit N set: stack slot N holds a reference.
    pub stack_refs: u64,
    pub stack_depth: u16,
    pub locals_count: u16,
    /// EBP-relative home slots of every reference.
    pub oop_offsets: Vec<i32>,
}

impl StackMapEntry {
    /// Snapshot the references of a flushed frame. The top `arguments`
    /// slots belong to the callee and are left out.
    pub fn record(native_pc: u32, bci: u32, frame: &VirtualStackFrame, arguments: usize) -> Self {
        let live = frame.live_locations();
        let live = &live[..live.len() - arguments];
        let mut entry = Self {
            native_pc,
            bci,
            locals_refs: 0,
            stack_refs: 0,
            stack_depth: (frame.stack_depth() - arguments) as u16,
            locals_count: frame.max_locals() as u16,
            oop_offsets: Vec::new(),
        };
        for (i, location) in live.iter().enumerate() {
            if location.kind != BasicType::Object {
                continue;
            }
            debug_assert_eq!(
                location.residence,
                Residence::Memory,
                "stack map over an unflushed frame"
            );
            if i < frame.max_locals() {
                entry.locals_refs |= 1 << i;
            } else {
                entry.stack_refs |= 1 << (i - frame.max_locals());
            }
            entry.oop_offsets.push(frame.home_offset(i));
        }
        entry
    }

    pub fn is_stack_ref(&self, slot: usize) -> bool {
        slot < 64 && (self.stack_refs & (1 << slot)) != 0
    }

    pub fn is_local_ref(&self, slot: usize) -> bool {
        slot < 64 && (self.locals_refs & (1 << slot)) != 0
    }

    pub fn stack_ref_slots(&self) -> Vec<usize> {
        (0..self.stack_depth as usize)
            .filter(|&i| self.is_stack_ref(i))
            .collect()
    }

    pub fn local_ref_slots(&self) -> Vec<usize> {
        (0..self.locals_count as usize)
            .filter(|&i| self.is_local_ref(i))
            .collect()
    }
}

/// Stack maps of one method, ordered by code offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StackMapTable {
    entries: Vec<StackMapEntry>,
}

impl StackMapTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Entries arrive in code order.
    pub fn add_entry(&mut self, entry: StackMapEntry) {
        debug_assert!(
            self.entries.last().is_none_or(|e| e.native_pc < entry.native_pc),
            "stack map entries out of order"
        );
        self.entries.push(entry);
    }

    /// Entry at `native_pc` or the closest one before it.
    pub fn lookup(&self, native_pc: u32) -> Option<&StackMapEntry> {
        let after = self.entries.partition_point(|e| e.native_pc <= native_pc);
        self.entries.get(after.checked_sub(1)?)
    }

    /// Forget entries past `native_pc`, after a rollback.
    pub fn truncate_after(&mut self, native_pc: u32) {
        let keep = self.entries.partition_point(|e| e.native_pc <= native_pc);
        self.entries.truncate(keep);
    }

    pub fn entries(&self) -> &[StackMapEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jit::frame::Location;
    use crate::vm::bytecode::Method;

    fn entry(native_pc: u32) -> StackMapEntry {
        StackMapEntry {
            native_pc,
            bci: 0,
            locals_refs: 0,
            stack_refs: 0,
            stack_depth: 0,
            locals_count: 0,
            oop_offsets: Vec::new(),
        }
    }

    #[test]
    fn test_record_from_frame() {
        let method = Method::new("m", 3, 2, &[BasicType::Object, BasicType::Int]);
        let mut frame = VirtualStackFrame::new(&method, true, 64).unwrap();
        frame.push(Location::memory(BasicType::Int));
        frame.push(Location::memory(BasicType::Object));

        let e = StackMapEntry::record(40, 7, &frame, 0);
        assert_eq!(e.local_ref_slots(), vec![0]);
        assert_eq!(e.stack_ref_slots(), vec![1]);
        assert_eq!(e.stack_depth, 2);
        // Parameter 0 sits above parameter 1; stack slot 1 is location 4.
        assert_eq!(e.oop_offsets, vec![12, -12]);

        let call = StackMapEntry::record(40, 7, &frame, 1);
        assert_eq!(call.stack_depth, 1);
        assert!(call.stack_ref_slots().is_empty());
        assert_eq!(call.oop_offsets, vec![12]);
    }

    #[test]
    fn test_table_lookup() {
        let mut table = StackMapTable::new();
        table.add_entry(entry(0));
        table.add_entry(entry(20));
        table.add_entry(entry(50));

        assert_eq!(table.lookup(20).unwrap().native_pc, 20);
        assert_eq!(table.lookup(25).unwrap().native_pc, 20);
        assert_eq!(table.lookup(49).unwrap().native_pc, 20);
        assert_eq!(table.lookup(100).unwrap().native_pc, 50);

        let mut later = StackMapTable::new();
        later.add_entry(entry(8));
        assert!(later.lookup(4).is_none());
    }

    #[test]
    fn test_truncate() {
        let mut table = StackMapTable::new();
        table.add_entry(entry(10));
        table.add_entry(entry(30));
        table.truncate_after(29);
        assert_eq!(table.len(), 1);
        table.truncate_after(10);
        assert_eq!(table.len(), 1);
        table.truncate_after(0);
        assert!(table.is_empty());
    }
}
