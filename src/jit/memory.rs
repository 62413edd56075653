//! Code cache backed by mmap.
//!
//! The cache owns one fixed, non-moving mapping. Methods are installed by
//! bump allocation; each one is relocated to its final address before the
//! bytes are copied in, and the instruction cache is flushed over the range
//! through the [`Platform`] hook. Evicted methods leave holes until
//! [`CodeCache::compact`] slides the survivors down and relocates them again.

use super::compiled_method::{CompiledMethod, CACHE_INDEX_LIMIT};
use crate::vm::heap::RootVisitor;
use std::ptr::NonNull;
use tracing::{debug, info, trace};

/// Error type for code cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MemoryError {
    #[error("memory mapping failed")]
    AllocationFailed,
    #[error("invalid region size {0}")]
    InvalidSize(usize),
    #[error("code cache full: {requested} bytes requested, {available} available")]
    CacheFull { requested: usize, available: usize },
    #[error("all {0} cache indices in use")]
    IndicesExhausted(u16),
}

/// Host services the cache needs after writing code.
pub trait Platform {
    /// Make `len` bytes of freshly written code at `start` visible to
    /// instruction fetch.
    fn flush_icache(&self, start: usize, len: usize);
}

/// x86 keeps instruction and data caches coherent.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlatform;

impl Platform for HostPlatform {
    fn flush_icache(&self, start: usize, len: usize) {
        trace!(target: "jcore::jit", start, len, "icache flush");
    }
}

const METHOD_ALIGNMENT: usize = 16;

// ============================================================================
// Mapped region
// ============================================================================

/// A page-aligned block of memory obtained from mmap.
pub struct CodeRegion {
    ptr: NonNull<u8>,
    size: usize,
}

impl CodeRegion {
    /// Map at least `size` bytes, rounded up to whole pages.
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        if size == 0 {
            return Err(MemoryError::InvalidSize(size));
        }
        let page_size = Self::page_size();
        let aligned_size = size.next_multiple_of(page_size);
        let ptr = Self::mmap_alloc(aligned_size)?;
        Ok(Self {
            ptr,
            size: aligned_size,
        })
    }

    fn page_size() -> usize {
        #[cfg(unix)]
        {
            match unsafe { libc::sysconf(libc::_SC_PAGESIZE) } {
                n if n > 0 => n as usize,
                _ => 4096,
            }
        }
        #[cfg(not(unix))]
        {
            4096
        }
    }

    #[cfg(unix)]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::AllocationFailed);
        }
        NonNull::new(ptr as *mut u8).ok_or(MemoryError::AllocationFailed)
    }

    #[cfg(not(unix))]
    fn mmap_alloc(size: usize) -> Result<NonNull<u8>, MemoryError> {
        let layout = std::alloc::Layout::from_size_align(size, Self::page_size())
            .map_err(|_| MemoryError::InvalidSize(size))?;
        let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
        NonNull::new(ptr).ok_or(MemoryError::AllocationFailed)
    }

    /// Address of the first byte.
    pub fn base(&self) -> usize {
        self.ptr.as_ptr() as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bytes(&self) -> &[u8] {
        // SAFETY: the mapping is `size` bytes long and lives as long as `self`.
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.size) }
    }

    /// Copy `data` to `offset`.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<(), MemoryError> {
        if offset + data.len() > self.size {
            return Err(MemoryError::CacheFull {
                requested: data.len(),
                available: self.size.saturating_sub(offset),
            });
        }
        // SAFETY: bounds checked above.
        unsafe {
            std::ptr::copy(data.as_ptr(), self.ptr.as_ptr().add(offset), data.len());
        }
        Ok(())
    }
}

impl Drop for CodeRegion {
    fn drop(&mut self) {
        #[cfg(unix)]
        {
            unsafe {
                libc::munmap(self.ptr.as_ptr() as *mut libc::c_void, self.size);
            }
        }
        #[cfg(not(unix))]
        {
            if let Ok(layout) = std::alloc::Layout::from_size_align(self.size, Self::page_size()) {
                unsafe { std::alloc::dealloc(self.ptr.as_ptr(), layout) };
            }
        }
    }
}

// The region is plain memory owned by this value.
unsafe impl Send for CodeRegion {}

// ============================================================================
// Code cache
// ============================================================================

#[derive(Debug)]
struct Slot {
    offset: usize,
    method: CompiledMethod,
}

/// Installed compiled methods, addressed by cache index.
pub struct CodeCache<P: Platform = HostPlatform> {
    region: CodeRegion,
    top: usize,
    slots: Vec<Option<Slot>>,
    platform: P,
}

impl CodeCache<HostPlatform> {
    pub fn new(size: usize) -> Result<Self, MemoryError> {
        Self::with_platform(size, HostPlatform)
    }
}

impl<P: Platform> CodeCache<P> {
    pub fn with_platform(size: usize, platform: P) -> Result<Self, MemoryError> {
        Ok(Self {
            region: CodeRegion::new(size)?,
            top: 0,
            slots: Vec::new(),
            platform,
        })
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    pub fn capacity(&self) -> usize {
        self.region.size()
    }

    /// Bytes below the allocation top, holes included.
    pub fn used(&self) -> usize {
        self.top
    }

    pub fn len(&self) -> usize {
        self.slots.iter().flatten().count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn free_index(&self) -> Result<u16, MemoryError> {
        if let Some(i) = self.slots.iter().position(Option::is_none) {
            return Ok(i as u16);
        }
        if self.slots.len() < CACHE_INDEX_LIMIT as usize {
            return Ok(self.slots.len() as u16);
        }
        Err(MemoryError::IndicesExhausted(CACHE_INDEX_LIMIT))
    }

    /// Relocate `method` to the region and copy it in. Returns its cache index.
    pub fn install(&mut self, mut method: CompiledMethod) -> Result<u16, MemoryError> {
        let offset = self.top.next_multiple_of(METHOD_ALIGNMENT);
        let size = method.code_size();
        let available = self.region.size().saturating_sub(offset);
        if size > available {
            return Err(MemoryError::CacheFull {
                requested: size,
                available,
            });
        }
        let index = self.free_index()?;
        method.set_cache_index(index);

        let address = self.region.base() + offset;
        method.update_relative_offsets(address.wrapping_sub(method.base()) as isize);
        self.region.write(offset, method.code())?;
        self.platform.flush_icache(address, size);
        self.top = offset + size;

        info!(
            target: "jcore::jit",
            method = method.name(),
            cache_index = index,
            address = format_args!("{:#x}", address),
            code_size = size,
            "method installed"
        );
        let slot = Some(Slot { offset, method });
        match self.slots.get_mut(index as usize) {
            Some(entry) => *entry = slot,
            None => self.slots.push(slot),
        }
        Ok(index)
    }

    pub fn get(&self, index: u16) -> Option<&CompiledMethod> {
        self.slots.get(index as usize)?.as_ref().map(|s| &s.method)
    }

    /// Address of the first instruction of an installed method.
    pub fn entry_address(&self, index: u16) -> Option<usize> {
        let slot = self.slots.get(index as usize)?.as_ref()?;
        Some(self.region.base() + slot.offset)
    }

    /// Installed bytes of a method, as the processor would fetch them.
    pub fn installed_code(&self, index: u16) -> Option<&[u8]> {
        let slot = self.slots.get(index as usize)?.as_ref()?;
        Some(&self.region.bytes()[slot.offset..slot.offset + slot.method.code_size()])
    }

    /// Remove a method. Its bytes stay until the next compaction.
    pub fn evict(&mut self, index: u16) -> Option<CompiledMethod> {
        let slot = self.slots.get_mut(index as usize)?.take()?;
        debug!(target: "jcore::jit", method = slot.method.name(), cache_index = index, "evicted");
        Some(slot.method)
    }

    /// Slide every installed method down over the holes left by evictions.
    ///
    /// Returns the number of bytes reclaimed.
    pub fn compact(&mut self) -> Result<usize, MemoryError> {
        let mut order: Vec<usize> = (0..self.slots.len()).filter(|&i| self.slots[i].is_some()).collect();
        order.sort_by_key(|&i| self.slots[i].as_ref().map_or(0, |s| s.offset));

        let base = self.region.base();
        let mut cursor: usize = 0;
        for i in order {
            let Some(slot) = self.slots[i].as_mut() else { continue };
            let target = cursor.next_multiple_of(METHOD_ALIGNMENT);
            let size = slot.method.code_size();
            if target != slot.offset {
                let delta = target as isize - slot.offset as isize;
                slot.method.update_relative_offsets(delta);
                self.region.write(target, slot.method.code())?;
                self.platform.flush_icache(base + target, size);
                slot.offset = target;
            }
            cursor = target + size;
        }
        let reclaimed = self.top - cursor;
        self.top = cursor;
        debug!(target: "jcore::jit", reclaimed, used = self.top, "code cache compacted");
        Ok(reclaimed)
    }

    /// Visit object handles embedded in installed code, and copy any
    /// rewritten handles back into the region.
    pub fn oops_do(&mut self, visitor: &mut RootVisitor<'_>) -> Result<(), MemoryError> {
        for slot in self.slots.iter_mut().flatten() {
            slot.method.oops_do(visitor);
            self.region.write(slot.offset, slot.method.code())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheIndexPolicy;
    use crate::jit::compiled_method::CompileStats;
    use crate::jit::relocation::{read_u32, write_u32, Relocation, RelocationKind, ABSOLUTE};
    use crate::jit::stackmap::StackMapTable;
    use crate::vm::heap::ObjectRef;
    use std::cell::RefCell;

    #[derive(Default)]
    struct RecordingPlatform {
        flushes: RefCell<Vec<(usize, usize)>>,
    }

    impl Platform for RecordingPlatform {
        fn flush_icache(&self, start: usize, len: usize) {
            self.flushes.borrow_mut().push((start, len));
        }
    }

    // Sensor store, then `mov eax, [pool]` with the pool word at offset 16.
    fn method(name: &str, pad: usize) -> CompiledMethod {
        let mut code = vec![0xC6, 0x83, 0, 0, 0, 0, 0x00, 0xA1, 0, 0, 0, 0];
        code.resize(16, 0x90);
        code.extend_from_slice(&[7, 0, 0, 0]);
        code.resize(20 + pad, 0xCC);
        write_u32(&mut code, 8, 16);
        CompiledMethod::from_parts(
            name,
            code,
            vec![
                Relocation { offset: 2, kind: RelocationKind::ExecutionSensor },
                Relocation { offset: 8, kind: RelocationKind::Absolute },
            ],
            2,
            StackMapTable::new(),
            CompileStats::default(),
            CacheIndexPolicy::HeaderBits,
            &ABSOLUTE,
        )
    }

    #[test]
    fn test_region_rounds_to_pages() {
        let region = CodeRegion::new(100).unwrap();
        assert!(region.size() >= 100);
        assert_eq!(region.size() % 4096, 0);
        assert_eq!(CodeRegion::new(0).err(), Some(MemoryError::InvalidSize(0)));
    }

    #[test]
    fn test_install_relocates_and_flushes() {
        let mut cache = CodeCache::with_platform(4096, RecordingPlatform::default()).unwrap();
        let index = cache.install(method("a", 0)).unwrap();
        assert_eq!(index, 0);
        let address = cache.entry_address(index).unwrap();
        let code = cache.installed_code(index).unwrap();
        assert_eq!(read_u32(code, 8) as usize, (address + 16) & 0xFFFF_FFFF);
        assert_eq!(cache.platform().flushes.borrow().as_slice(), &[(address, 20)]);
        assert_eq!(cache.get(index).unwrap().base(), address);
    }

    #[test]
    fn test_cache_full() {
        let mut cache = CodeCache::new(4096).unwrap();
        let capacity = cache.capacity();
        assert!(matches!(
            cache.install(method("big", capacity)),
            Err(MemoryError::CacheFull { .. })
        ));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_oops_do_writes_moved_handles_back() {
        let mut cache = CodeCache::with_platform(4096, RecordingPlatform::default()).unwrap();
        let mut m = method("obj", 0);
        let mut code = m.code().to_vec();
        write_u32(&mut code, 16, 0x500);
        m = CompiledMethod::from_parts(
            "obj",
            code,
            vec![Relocation { offset: 16, kind: RelocationKind::Oop }],
            2,
            StackMapTable::new(),
            CompileStats::default(),
            CacheIndexPolicy::HeaderBits,
            &ABSOLUTE,
        );
        let index = cache.install(m).unwrap();

        cache.oops_do(&mut |r: &mut ObjectRef| *r = ObjectRef(0x900)).unwrap();
        assert_eq!(read_u32(cache.installed_code(index).unwrap(), 16), 0x900);
    }

    #[test]
    fn test_evict_reuses_index_and_compact_relocates() {
        let mut cache = CodeCache::with_platform(4096, RecordingPlatform::default()).unwrap();
        let a = cache.install(method("a", 12)).unwrap();
        let b = cache.install(method("b", 0)).unwrap();
        assert_eq!((a, b), (0, 1));
        let before = cache.entry_address(b).unwrap();

        assert!(cache.evict(a).is_some());
        assert!(cache.get(a).is_none());
        assert_eq!(cache.len(), 1);

        let reclaimed = cache.compact().unwrap();
        assert_eq!(reclaimed, 32);
        let after = cache.entry_address(b).unwrap();
        assert_eq!(before - after, 32);
        let code = cache.installed_code(b).unwrap();
        assert_eq!(read_u32(code, 8) as usize, (after + 16) & 0xFFFF_FFFF);
        assert_eq!(cache.get(b).unwrap().cache_index(), 1);

        assert_eq!(cache.install(method("c", 0)).unwrap(), 0);
    }
}
