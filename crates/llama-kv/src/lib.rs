//! # llama-kv
//!
//! KV cache cell bookkeeping for llama-serve contexts.
//!
//! A context's KV cache holds one cell per `(sequence, position)` that has
//! been decoded. Processors only ever reason about cells: how many are used,
//! which positions a sequence occupies, and which ranges to drop when a turn
//! ends or a cached prefix is reused.
//!
//! Supports:
//! - **Insert**: one cell per decoded batch entry, bounded by the context capacity
//! - **Range removal**: drop a sequence's cells in `[from, to)`, used to keep a pinned prefix
//! - **Clear**: drop everything
//! - **Read-back**: tokens of a sequence in position order

use std::collections::BTreeMap;
use std::fmt;

/// Error type for KV cache operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KvError {
    #[error("KV cache capacity exceeded: {used} + {requested} > {capacity}")]
    CapacityExceeded {
        used: usize,
        requested: usize,
        capacity: usize,
    },

    #[error("Position {pos} of sequence {seq_id} is already occupied")]
    PositionOccupied { seq_id: i32, pos: u32 },
}

pub type KvResult<T> = Result<T, KvError>;

/// Cell key: sequence first so a sequence's cells are contiguous and position ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CellKey {
    pub seq_id: i32,
    pub pos: u32,
}

impl fmt::Display for CellKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[seq:{}, pos:{}]", self.seq_id, self.pos)
    }
}

/// Occupied cells of one context.
///
/// # Invariants
/// - `used() <= capacity()`
/// - At most one cell per `(seq_id, pos)`
#[derive(Debug, Clone)]
pub struct KvCells {
    capacity: usize,
    cells: BTreeMap<CellKey, i32>,
}

impl KvCells {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            cells: BTreeMap::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.cells.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cells.is_empty()
    }

    /// Check that `entries` more cells fit without inserting anything.
    pub fn reserve(&self, entries: usize) -> KvResult<()> {
        if self.used() + entries > self.capacity {
            return Err(KvError::CapacityExceeded {
                used: self.used(),
                requested: entries,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Occupy one cell.
    pub fn insert(&mut self, seq_id: i32, pos: u32, token: i32) -> KvResult<()> {
        let key = CellKey { seq_id, pos };
        if self.cells.contains_key(&key) {
            return Err(KvError::PositionOccupied { seq_id, pos });
        }
        self.reserve(1)?;
        self.cells.insert(key, token);
        Ok(())
    }

    /// Drop cells of `seq_id` with `from <= pos < to` (`to = None` means to the end).
    /// Returns how many cells were dropped.
    pub fn remove(&mut self, seq_id: i32, from: u32, to: Option<u32>) -> usize {
        let to = to.unwrap_or(u32::MAX);
        if from >= to {
            return 0;
        }
        let doomed: Vec<CellKey> = self
            .cells
            .range(CellKey { seq_id, pos: from }..CellKey { seq_id, pos: to })
            .map(|(k, _)| *k)
            .collect();
        for key in &doomed {
            self.cells.remove(key);
        }
        doomed.len()
    }

    pub fn clear(&mut self) {
        self.cells.clear();
    }

    /// One past the highest occupied position of `seq_id`, or 0.
    pub fn seq_len(&self, seq_id: i32) -> u32 {
        self.cells
            .range(CellKey { seq_id, pos: 0 }..=CellKey { seq_id, pos: u32::MAX })
            .next_back()
            .map(|(k, _)| k.pos + 1)
            .unwrap_or(0)
    }

    /// Tokens of `seq_id` in position order.
    pub fn seq_tokens(&self, seq_id: i32) -> Vec<i32> {
        self.cells
            .range(CellKey { seq_id, pos: 0 }..=CellKey { seq_id, pos: u32::MAX })
            .map(|(_, t)| *t)
            .collect()
    }

    /// Tokens of `seq_id` with positions below `end`, in position order.
    pub fn seq_tokens_before(&self, seq_id: i32, end: u32) -> Vec<i32> {
        self.cells
            .range(CellKey { seq_id, pos: 0 }..CellKey { seq_id, pos: end })
            .map(|(_, t)| *t)
            .collect()
    }

    /// Distinct sequences with at least one cell.
    pub fn sequences(&self) -> Vec<i32> {
        let mut out: Vec<i32> = self.cells.keys().map(|k| k.seq_id).collect();
        out.dedup();
        out
    }
}
