use std::cell::Cell;

use thiserror::Error;
use tracing::{trace, warn};

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum MemoryError {
    #[error("not enough memory (requested {requested} bytes, {available} available)")]
    OutOfMemory { requested: usize, available: usize },
}

/// Byte budget shared by every memory-bearing resource on a computer.
///
/// Lives on the simulation thread only, so plain `Cell`s are enough.
#[derive(Debug)]
pub struct MemoryTracker {
    budget: usize,
    used: Cell<usize>,
}

impl MemoryTracker {
    pub fn new(budget: usize) -> Self {
        Self {
            budget,
            used: Cell::new(0),
        }
    }

    pub fn budget(&self) -> usize {
        self.budget
    }

    pub fn used(&self) -> usize {
        self.used.get()
    }

    pub fn available(&self) -> usize {
        self.budget - self.used.get()
    }

    /// Reserves `size` bytes. Leaves the tracker untouched and returns false
    /// when the budget would be exceeded.
    pub fn alloc(&self, size: usize) -> bool {
        let used = self.used.get();
        match used.checked_add(size) {
            Some(total) if total <= self.budget => {
                self.used.set(total);
                trace!("[MEM] alloc {} -> {}/{}", size, total, self.budget);
                true
            }
            _ => {
                trace!(
                    "[MEM] alloc {} refused ({}/{} in use)",
                    size,
                    used,
                    self.budget
                );
                false
            }
        }
    }

    pub fn try_alloc(&self, size: usize) -> Result<(), MemoryError> {
        if self.alloc(size) {
            Ok(())
        } else {
            Err(MemoryError::OutOfMemory {
                requested: size,
                available: self.available(),
            })
        }
    }

    pub fn free(&self, size: usize) {
        let used = self.used.get();
        if size > used {
            // Unbalanced free; clamp rather than wrap.
            warn!("[MEM] free of {} bytes with only {} in use", size, used);
            self.used.set(0);
        } else {
            self.used.set(used - size);
        }
        trace!("[MEM] free {} -> {}/{}", size, self.used.get(), self.budget);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_scenario() {
        let memory = MemoryTracker::new(1024);

        assert!(memory.alloc(512));
        assert!(!memory.alloc(600));
        assert_eq!(memory.used(), 512);

        memory.free(512);
        assert_eq!(memory.used(), 0);
        assert!(memory.alloc(600));
        assert_eq!(memory.used(), 600);
    }

    #[test]
    fn test_exact_fit() {
        let memory = MemoryTracker::new(100);
        assert!(memory.alloc(100));
        assert!(!memory.alloc(1));
        assert_eq!(memory.available(), 0);
    }

    #[test]
    fn test_free_clamps_at_zero() {
        let memory = MemoryTracker::new(64);
        assert!(memory.alloc(10));
        memory.free(20);
        assert_eq!(memory.used(), 0);
    }

    #[test]
    fn test_overflowing_request_is_refused() {
        let memory = MemoryTracker::new(64);
        assert!(memory.alloc(1));
        assert!(!memory.alloc(usize::MAX));
        assert_eq!(memory.used(), 1);
    }

    #[test]
    fn test_try_alloc_reports_available() {
        let memory = MemoryTracker::new(10);
        assert!(memory.alloc(4));
        assert_eq!(
            memory.try_alloc(7),
            Err(MemoryError::OutOfMemory {
                requested: 7,
                available: 6
            })
        );
    }

    #[test]
    fn test_used_never_exceeds_budget() {
        let memory = MemoryTracker::new(1000);
        let mut live = Vec::new();
        for i in 0..200usize {
            let size = (i * 37) % 173;
            if memory.alloc(size) {
                live.push(size);
            }
            if i % 3 == 0 {
                if let Some(size) = live.pop() {
                    memory.free(size);
                }
            }
            assert!(memory.used() <= memory.budget());
        }
        for size in live.drain(..) {
            memory.free(size);
        }
        assert_eq!(memory.used(), 0);
    }
}
