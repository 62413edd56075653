//! Compiler-object arena.
//!
//! Every compiler-internal object of a compilation (labels, literal
//! elements, frame checkpoints, stack maps) is charged against a fixed-size
//! arena. With header tracking enabled each allocation also records a
//! `(tag, start, size)` entry, which allows mapping any arena offset back
//! to the object that owns it. Without tracking, allocation is a bare bump
//! of the top pointer and no reverse lookup is available.
//!
//! The arena is discarded in bulk at the end of the compilation, whether it
//! succeeded or not.

use super::error::CompileError;
use std::fmt;

/// Runtime type tag of a compiler object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompilerObjectTag {
    BinaryLabel,
    LiteralPoolElement,
    FrameSnapshot,
    StackMap,
    Checkpoint,
}

impl fmt::Display for CompilerObjectTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            CompilerObjectTag::BinaryLabel => "BinaryLabel",
            CompilerObjectTag::LiteralPoolElement => "LiteralPoolElement",
            CompilerObjectTag::FrameSnapshot => "FrameSnapshot",
            CompilerObjectTag::StackMap => "StackMap",
            CompilerObjectTag::Checkpoint => "Checkpoint",
        };
        f.write_str(name)
    }
}

/// Header of one allocated object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CompilerObject {
    pub tag: CompilerObjectTag,
    pub start: usize,
    pub size: usize,
}

impl CompilerObject {
    pub fn end(&self) -> usize {
        self.start + self.size
    }
}

/// Header-tracking strategy.
pub trait ObjectTracking: Default {
    const TRACKED: bool;

    fn record(&mut self, object: CompilerObject);

    /// The object containing `offset`.
    fn find(&self, offset: usize) -> Option<CompilerObject>;

    /// Forget objects starting at or after `top`.
    fn truncate(&mut self, top: usize);

    fn objects(&self) -> &[CompilerObject];
}

/// Keeps a header per allocation.
#[derive(Debug, Default)]
pub struct Tracked {
    headers: Vec<CompilerObject>,
}

impl ObjectTracking for Tracked {
    const TRACKED: bool = true;

    fn record(&mut self, object: CompilerObject) {
        self.headers.push(object);
    }

    fn find(&self, offset: usize) -> Option<CompilerObject> {
        // Headers are sorted by start; take the last one starting at or before `offset`.
        let next = self.headers.partition_point(|h| h.start <= offset);
        let candidate = self.headers.get(next.checked_sub(1)?)?;
        (offset < candidate.end()).then_some(*candidate)
    }

    fn truncate(&mut self, top: usize) {
        let keep = self.headers.partition_point(|h| h.start < top);
        self.headers.truncate(keep);
    }

    fn objects(&self) -> &[CompilerObject] {
        &self.headers
    }
}

/// Plain bump allocation.
#[derive(Debug, Default)]
pub struct Untracked;

impl ObjectTracking for Untracked {
    const TRACKED: bool = false;

    fn record(&mut self, _object: CompilerObject) {}

    fn find(&self, _offset: usize) -> Option<CompilerObject> {
        None
    }

    fn truncate(&mut self, _top: usize) {}

    fn objects(&self) -> &[CompilerObject] {
        &[]
    }
}

/// Object-safe view of an arena, whichever tracking it uses.
pub trait ObjectArena {
    fn allocate(&mut self, tag: CompilerObjectTag, size: usize) -> Result<usize, CompileError>;
    fn find(&self, offset: usize) -> Option<CompilerObject>;
    fn objects(&self) -> &[CompilerObject];
    fn used(&self) -> usize;
    fn capacity(&self) -> usize;
    fn is_tracked(&self) -> bool;
    /// Release everything allocated after the arena was `top` bytes full.
    fn reset(&mut self, top: usize);
}

const ALIGNMENT: usize = 8;

/// A bump arena with pluggable header tracking.
#[derive(Debug)]
pub struct CompilerArena<T: ObjectTracking = Untracked> {
    capacity: usize,
    top: usize,
    tracking: T,
}

impl<T: ObjectTracking> CompilerArena<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            top: 0,
            tracking: T::default(),
        }
    }
}

impl<T: ObjectTracking> ObjectArena for CompilerArena<T> {
    fn allocate(&mut self, tag: CompilerObjectTag, size: usize) -> Result<usize, CompileError> {
        let size = size.max(1).next_multiple_of(ALIGNMENT);
        let available = self.capacity - self.top;
        if size > available {
            return Err(CompileError::ArenaExhausted {
                requested: size,
                available,
            });
        }
        let start = self.top;
        self.top += size;
        self.tracking.record(CompilerObject { tag, start, size });
        Ok(start)
    }

    fn find(&self, offset: usize) -> Option<CompilerObject> {
        self.tracking.find(offset)
    }

    fn objects(&self) -> &[CompilerObject] {
        self.tracking.objects()
    }

    fn used(&self) -> usize {
        self.top
    }

    fn capacity(&self) -> usize {
        self.capacity
    }

    fn is_tracked(&self) -> bool {
        T::TRACKED
    }

    fn reset(&mut self, top: usize) {
        assert!(top <= self.top, "arena reset forward ({} > {})", top, self.top);
        self.top = top;
        self.tracking.truncate(top);
    }
}

/// Arena for one compilation.
pub fn new_arena(capacity: usize, tracked: bool) -> Box<dyn ObjectArena> {
    if tracked {
        Box::new(CompilerArena::<Tracked>::new(capacity))
    } else {
        Box::new(CompilerArena::<Untracked>::new(capacity))
    }
}
