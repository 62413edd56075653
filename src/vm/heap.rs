//! Heap-facing types consumed by the compiler.
//!
//! The compiler never allocates heap objects. It only holds handles to objects
//! that the collector owns (constant-pool objects pulled into the literal pool)
//! and must report them as roots while a compilation is in flight.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A handle to a heap object.
///
/// The handle is the 32-bit value that compiled code embeds for the object.
/// Handle 0 is the null reference. A moving collector may rewrite handles
/// through a [`RootVisitor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectRef(pub u32);

impl ObjectRef {
    pub const NULL: ObjectRef = ObjectRef(0);

    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_null() {
            write!(f, "null")
        } else {
            write!(f, "obj@{:#x}", self.0)
        }
    }
}

/// Callback the collector passes to every holder of object handles.
///
/// The visitor may overwrite the handle when the object moved.
pub type RootVisitor<'a> = dyn FnMut(&mut ObjectRef) + 'a;

/// Collect every handle a root holder reports, without modifying them.
pub fn collect_roots(mut visit: impl FnMut(&mut RootVisitor<'_>)) -> Vec<ObjectRef> {
    let mut roots = Vec::new();
    visit(&mut |r: &mut ObjectRef| roots.push(*r));
    roots
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_ref() {
        assert!(ObjectRef::NULL.is_null());
        assert!(!ObjectRef(8).is_null());
        assert_eq!(ObjectRef::default(), ObjectRef::NULL);
    }

    #[test]
    fn test_display() {
        assert_eq!(ObjectRef::NULL.to_string(), "null");
        assert_eq!(ObjectRef(0x40).to_string(), "obj@0x40");
    }

    #[test]
    fn test_collect_roots() {
        let held = [ObjectRef(8), ObjectRef(16)];
        let roots = collect_roots(|visitor| {
            let mut copy = held;
            for r in copy.iter_mut() {
                visitor(r);
            }
        });
        assert_eq!(roots, held.to_vec());
    }
}
