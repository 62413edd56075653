//! Binary labels: code addresses that may not be known yet.
//!
//! An unbound label that has been referenced keeps the code offset of its
//! most recent reference. Each reference's placeholder operand stores the
//! offset of the reference before it (`-1` ends the chain), so binding
//! walks the chain and patches every waiter. See [`CodeBuffer::bind`].
//!
//! [`CodeBuffer::bind`]: super::codebuf::CodeBuffer::bind

use std::fmt;

/// Placeholder value terminating a forward-reference chain.
pub const CHAIN_END: i32 = -1;

/// State of a label.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LabelState {
    /// No target and no waiters.
    #[default]
    Unused,
    /// Unbound with waiters; holds the code offset of the newest reference.
    Linked(usize),
    /// Bound to a code offset.
    Bound(usize),
}

/// A relocatable reference to a code address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BinaryLabel {
    state: LabelState,
}

impl BinaryLabel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LabelState {
        self.state
    }

    pub fn is_unused(&self) -> bool {
        self.state == LabelState::Unused
    }

    pub fn is_linked(&self) -> bool {
        matches!(self.state, LabelState::Linked(_))
    }

    pub fn is_bound(&self) -> bool {
        matches!(self.state, LabelState::Bound(_))
    }

    /// Bound position, if any.
    pub fn position(&self) -> Option<usize> {
        match self.state {
            LabelState::Bound(pos) => Some(pos),
            _ => None,
        }
    }

    /// Record a new reference at `at` and return the previous chain head.
    ///
    /// Panics if the label is already bound; bound labels are referenced
    /// directly.
    pub fn link(&mut self, at: usize) -> Option<usize> {
        let previous = match self.state {
            LabelState::Unused => None,
            LabelState::Linked(head) => Some(head),
            LabelState::Bound(pos) => panic!("link at {} of label already bound to {}", at, pos),
        };
        self.state = LabelState::Linked(at);
        previous
    }

    /// Bind to `position`, returning the head of the chain still to patch.
    ///
    /// Panics on a second bind.
    pub fn bind(&mut self, position: usize) -> Option<usize> {
        let head = match self.state {
            LabelState::Unused => None,
            LabelState::Linked(head) => Some(head),
            LabelState::Bound(pos) => {
                panic!("label bound twice (at {}, then at {})", pos, position)
            }
        };
        self.state = LabelState::Bound(position);
        head
    }

    /// Diagnostic rendering; `base` is the address the code would be placed at.
    pub fn dump(&self, base: usize) -> String {
        match self.state {
            LabelState::Unused => "unused".to_string(),
            LabelState::Linked(pos) => format!("linked, pos={}", pos),
            LabelState::Bound(pos) => format!("bound, pos={}, addr={:#06x}", pos, base + pos),
        }
    }
}

impl fmt::Display for BinaryLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.dump(0))
    }
}
