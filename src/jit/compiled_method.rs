//! The finished artifact of a compilation.
//!
//! A compiled method owns its code bytes and the metadata the rest of the
//! VM needs without knowing anything about register allocation: the packed
//! size header, the relocation table, the stack maps, and the execution
//! sensor the prologue clears on every invocation.
//!
//! The prologue contains `mov byte [ebx + disp32], 0`. EBX points at the VM
//! globals block, whose sensor array starts at [`SENSOR_ANCHOR`]; the
//! displacement is `SENSOR_ANCHOR + cache_index`, so the method's cache
//! index can always be recovered from its own instruction stream.

use super::relocation::{read_u32, write_u32, Relocation, RelocationKind, Relocator};
use super::stackmap::StackMapTable;
use crate::config::CacheIndexPolicy;
use crate::vm::heap::{ObjectRef, RootVisitor};
use serde::Serialize;
use tracing::debug;

/// Offset of the execution sensor array in the VM globals block.
pub const SENSOR_ANCHOR: i32 = 0x1000;

/// Cache indices are 12 bits wide.
pub const CACHE_INDEX_LIMIT: u16 = 1 << 12;

const SIZE_BITS: u32 = 20;
const SIZE_MASK: u32 = (1 << SIZE_BITS) - 1;

/// Counters gathered while compiling one method.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CompileStats {
    pub code_size: usize,
    pub literal_count: usize,
    pub label_count: usize,
    pub flush_count: u32,
    pub fpu_pushes: u32,
    pub fpu_ffrees: u32,
    pub fpu_max_depth: u32,
    pub relocation_count: usize,
    pub stack_map_count: usize,
    pub arena_bytes: usize,
}

/// A method body ready to be installed.
#[derive(Debug, Clone)]
pub struct CompiledMethod {
    name: String,
    flags_and_size: u32,
    code: Vec<u8>,
    relocations: Vec<Relocation>,
    /// Offset of the sensor displacement in `code`.
    sensor_offset: usize,
    stack_maps: StackMapTable,
    stats: CompileStats,
    cache_index_policy: CacheIndexPolicy,
    relocator: &'static dyn Relocator,
    /// Address the absolute operands currently assume.
    base: usize,
}

impl CompiledMethod {
    /// Package finished code. The code is laid out for address 0 and
    /// starts with cache index 0.
    #[allow(clippy::too_many_arguments)]
    pub fn from_parts(
        name: &str,
        code: Vec<u8>,
        relocations: Vec<Relocation>,
        sensor_offset: usize,
        stack_maps: StackMapTable,
        stats: CompileStats,
        cache_index_policy: CacheIndexPolicy,
        relocator: &'static dyn Relocator,
    ) -> Self {
        assert!(
            code.len() as u32 <= SIZE_MASK,
            "method of {} bytes does not fit the size header",
            code.len()
        );
        debug_assert!(
            relocations
                .iter()
                .any(|r| r.kind == RelocationKind::ExecutionSensor && r.offset == sensor_offset),
            "sensor displacement has no relocation entry"
        );
        let mut method = Self {
            name: name.to_string(),
            flags_and_size: code.len() as u32,
            code,
            relocations,
            sensor_offset,
            stack_maps,
            stats,
            cache_index_policy,
            relocator,
            base: 0,
        };
        method.set_cache_index(0);
        method
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn code(&self) -> &[u8] {
        &self.code
    }

    pub fn code_size(&self) -> usize {
        (self.flags_and_size & SIZE_MASK) as usize
    }

    pub fn flags_and_size(&self) -> u32 {
        self.flags_and_size
    }

    pub fn relocations(&self) -> &[Relocation] {
        &self.relocations
    }

    pub fn sensor_offset(&self) -> usize {
        self.sensor_offset
    }

    pub fn stack_maps(&self) -> &StackMapTable {
        &self.stack_maps
    }

    pub fn stats(&self) -> &CompileStats {
        &self.stats
    }

    pub fn cache_index_policy(&self) -> CacheIndexPolicy {
        self.cache_index_policy
    }

    pub fn relocator(&self) -> &'static dyn Relocator {
        self.relocator
    }

    pub fn base(&self) -> usize {
        self.base
    }

    // ==================== Cache index ====================

    fn sensor_displacement(&self) -> i32 {
        read_u32(&self.code, self.sensor_offset) as i32
    }

    pub fn cache_index(&self) -> u16 {
        match self.cache_index_policy {
            CacheIndexPolicy::HeaderBits => (self.flags_and_size >> SIZE_BITS) as u16,
            CacheIndexPolicy::Prologue => {
                let index = self.sensor_displacement() - SENSOR_ANCHOR;
                assert!(
                    (0..CACHE_INDEX_LIMIT as i32).contains(&index),
                    "sensor displacement {:#x} outside the sensor array",
                    self.sensor_displacement()
                );
                index as u16
            }
        }
    }

    /// Assign the method's slot in the code cache.
    ///
    /// The sensor displacement is rewritten under both policies so that the
    /// prologue always clears the sensor belonging to this index.
    pub fn set_cache_index(&mut self, index: u16) {
        assert!(
            index < CACHE_INDEX_LIMIT,
            "cache index {} does not fit in 12 bits",
            index
        );
        write_u32(
            &mut self.code,
            self.sensor_offset,
            (SENSOR_ANCHOR + index as i32) as u32,
        );
        if self.cache_index_policy == CacheIndexPolicy::HeaderBits {
            self.flags_and_size = (self.flags_and_size & SIZE_MASK) | (index as u32) << SIZE_BITS;
        }
        debug_assert_eq!(self.cache_index(), index);
    }

    // ==================== Relocation ====================

    /// Fix up position-dependent operands after the code moved by `delta`.
    pub fn update_relative_offsets(&mut self, delta: isize) {
        if delta == 0 {
            return;
        }
        self.relocator
            .update_relative_offsets(&mut self.code, &self.relocations, delta);
        self.base = self.base.wrapping_add_signed(delta);
        debug!(
            target: "jcore::jit",
            method = %self.name,
            delta,
            relocator = self.relocator.name(),
            "relocated"
        );
    }

    /// Report every object handle embedded in the code; the visitor may
    /// rewrite them.
    pub fn oops_do(&mut self, visitor: &mut RootVisitor<'_>) {
        for reloc in self.relocations.iter().filter(|r| r.kind == RelocationKind::Oop) {
            let mut object = ObjectRef(read_u32(&self.code, reloc.offset));
            visitor(&mut object);
            write_u32(&mut self.code, reloc.offset, object.raw());
        }
    }

    /// Serializable view for tooling.
    pub fn summary(&self) -> MethodSummary<'_> {
        MethodSummary {
            name: &self.name,
            code_size: self.code_size(),
            cache_index: self.cache_index(),
            cache_index_policy: self.cache_index_policy,
            relocator: self.relocator.name(),
            sensor_offset: self.sensor_offset,
            relocations: &self.relocations,
            stack_maps: &self.stack_maps,
            stats: self.stats,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MethodSummary<'a> {
    pub name: &'a str,
    pub code_size: usize,
    pub cache_index: u16,
    pub cache_index_policy: CacheIndexPolicy,
    pub relocator: &'static str,
    pub sensor_offset: usize,
    pub relocations: &'a [Relocation],
    pub stack_maps: &'a StackMapTable,
    pub stats: CompileStats,
}
