//! Frame interning.
//!
//! Every distinct (function, file, line) triple gets exactly one
//! [`FrameId`]. Handles are dense indices, issued in first-seen order,
//! and never recycled.

use super::schema::Frame;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

/// Handle to an interned [`Frame`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FrameId(u32);

impl FrameId {
    /// Position of the frame in the table (0-based)
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Interning table mapping frames to stable handles
#[derive(Debug, Clone, Default)]
pub struct FrameTable {
    frames: Vec<Frame>,
    index: HashMap<Frame, FrameId>,
}

impl FrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the handle for `frame`, creating it on first sight
    pub fn intern(&mut self, frame: &Frame) -> FrameId {
        if let Some(id) = self.index.get(frame) {
            return *id;
        }

        let id = FrameId(self.frames.len() as u32);
        self.frames.push(frame.clone());
        self.index.insert(frame.clone(), id);
        id
    }

    /// Look up a frame without interning it
    pub fn get(&self, frame: &Frame) -> Option<FrameId> {
        self.index.get(frame).copied()
    }

    pub fn resolve(&self, id: FrameId) -> Option<&Frame> {
        self.frames.get(id.index())
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// All frames in handle order
    pub fn iter(&self) -> impl Iterator<Item = (FrameId, &Frame)> {
        self.frames
            .iter()
            .enumerate()
            .map(|(i, f)| (FrameId(i as u32), f))
    }
}

/// Frame table shared between producer threads.
///
/// `intern` is an atomic lookup-or-insert: two threads interning the same
/// frame concurrently always get the same handle.
#[derive(Debug, Clone, Default)]
pub struct SharedFrameTable {
    inner: Arc<RwLock<FrameTable>>,
}

impl SharedFrameTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn intern(&self, frame: &Frame) -> FrameId {
        // Fast path: most frames repeat
        let existing = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(frame);
        if let Some(id) = existing {
            return id;
        }

        // Re-check under the write lock, another producer may have won
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .intern(frame)
    }

    pub fn resolve(&self, id: FrameId) -> Option<Frame> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .resolve(id)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copy of the table as it is now
    pub fn snapshot(&self) -> FrameTable {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_intern_is_idempotent() {
        let mut table = FrameTable::new();
        let a = table.intern(&Frame::new("foo", "foo.py", 1));
        let b = table.intern(&Frame::new("bar", "foo.py", 1));
        let c = table.intern(&Frame::new("foo", "foo.py", 1));

        assert_eq!(a, c);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.resolve(b).unwrap().function, "bar");
    }

    #[test]
    fn test_line_is_part_of_identity() {
        let mut table = FrameTable::new();
        let a = table.intern(&Frame::new("foo", "foo.py", 1));
        let b = table.intern(&Frame::new("foo", "foo.py", 2));
        assert_ne!(a, b);
    }

    #[test]
    fn test_shared_table_concurrent_interning() {
        let table = SharedFrameTable::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|i| table.intern(&Frame::new(format!("f{}", i), "x.py", i)))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let results: Vec<Vec<FrameId>> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(table.len(), 100);
        for ids in &results[1..] {
            assert_eq!(ids, &results[0]);
        }
        assert_eq!(table.resolve(results[0][7]).unwrap().function, "f7");
    }
}
