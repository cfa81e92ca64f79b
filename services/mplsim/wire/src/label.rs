//! MPLS label stack.

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::header::ExpBits;
use crate::WireError;

/// MPLS label value (20 bits)
pub type Label = u32;

/// Largest label value representable in 20 bits
pub const MAX_LABEL: Label = (1 << 20) - 1;

/// Labels 0..=15 are reserved; dynamic allocation starts here
pub const FIRST_UNRESERVED_LABEL: Label = 16;

/// Reserved label marking a frame that carries a GoS request
pub const GOS_MARKER_LABEL: Label = 1;

/// Size of one label stack entry in octets
pub const LABEL_ENTRY_SIZE: u32 = 4;

/// One entry of an MPLS label stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelStackEntry {
    /// Label value
    pub label: Label,
    /// EXP bits
    pub exp: ExpBits,
    /// Bottom-of-stack flag
    pub bottom_of_stack: bool,
    /// Time to live
    pub ttl: u8,
}

impl LabelStackEntry {
    /// Create an entry; bottom-of-stack is fixed when pushed
    pub fn new(label: Label, exp: ExpBits, ttl: u8) -> Result<Self, WireError> {
        if label > MAX_LABEL {
            return Err(WireError::LabelRange(label));
        }
        Ok(Self {
            label,
            exp,
            bottom_of_stack: false,
            ttl,
        })
    }

    /// Whether this is the GoS marker label
    pub fn is_gos_marker(&self) -> bool {
        self.label == GOS_MARKER_LABEL
    }
}

/// Label stack, top of stack last
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LabelStack {
    entries: SmallVec<[LabelStackEntry; 4]>,
}

impl LabelStack {
    /// Create an empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a label; the first label pushed is the bottom of the stack
    pub fn push(&mut self, mut entry: LabelStackEntry) {
        entry.bottom_of_stack = self.entries.is_empty();
        self.entries.push(entry);
    }

    /// Pop the top label
    pub fn pop(&mut self) -> Result<LabelStackEntry, WireError> {
        self.entries.pop().ok_or(WireError::EmptyLabelStack)
    }

    /// Top label
    pub fn top(&self) -> Option<&LabelStackEntry> {
        self.entries.last()
    }

    /// Mutable top label
    pub fn top_mut(&mut self) -> Option<&mut LabelStackEntry> {
        self.entries.last_mut()
    }

    /// Replace the value of the top label, keeping EXP and setting TTL
    pub fn swap_top(&mut self, label: Label, ttl: u8) -> Result<(), WireError> {
        if label > MAX_LABEL {
            return Err(WireError::LabelRange(label));
        }
        let top = self.entries.last_mut().ok_or(WireError::EmptyLabelStack)?;
        top.label = label;
        top.ttl = ttl;
        Ok(())
    }

    /// Number of labels
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stack is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterate from bottom to top
    pub fn iter(&self) -> impl Iterator<Item = &LabelStackEntry> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(label: Label) -> LabelStackEntry {
        LabelStackEntry::new(label, ExpBits::empty(), 64).unwrap()
    }

    #[test]
    fn test_push_pop_bottom_of_stack() {
        let mut stack = LabelStack::new();
        stack.push(entry(100));
        stack.push(entry(200));

        assert_eq!(stack.len(), 2);
        assert_eq!(stack.top().map(|e| e.label), Some(200));
        assert!(!stack.top().unwrap().bottom_of_stack);

        let top = stack.pop().unwrap();
        assert_eq!(top.label, 200);
        assert!(stack.top().unwrap().bottom_of_stack);

        stack.pop().unwrap();
        assert!(stack.is_empty());
        assert_eq!(stack.pop(), Err(WireError::EmptyLabelStack));
    }

    #[test]
    fn test_swap_top() {
        let mut stack = LabelStack::new();
        assert_eq!(stack.swap_top(20, 10), Err(WireError::EmptyLabelStack));

        stack.push(entry(17));
        stack.swap_top(42, 9).unwrap();
        let top = stack.top().unwrap();
        assert_eq!(top.label, 42);
        assert_eq!(top.ttl, 9);
        assert!(top.bottom_of_stack);

        assert_eq!(stack.swap_top(MAX_LABEL + 1, 9), Err(WireError::LabelRange(MAX_LABEL + 1)));
    }

    #[test]
    fn test_gos_marker() {
        assert!(entry(GOS_MARKER_LABEL).is_gos_marker());
        assert!(!entry(FIRST_UNRESERVED_LABEL).is_gos_marker());
        assert!(LabelStackEntry::new(MAX_LABEL + 1, ExpBits::empty(), 1).is_err());
    }
}
