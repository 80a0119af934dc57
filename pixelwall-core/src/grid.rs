//! Grid Store: current color and last-write time of every cell.
//!
//! Layout:
//! ```text
//! rows[0]    ── RwLock ── [slot 0 | slot 1 | … | slot 1023]   (allocated on first write)
//! rows[1]    ── RwLock ── []                                  (untouched row)
//! …
//! rows[1023] ── RwLock ── [slot 0 | … ]
//! ```
//!
//! Each slot holds `(color, placed_at)` as a single `Copy` value, replaced
//! whole under the row's write lock. Readers take the row's read lock, so
//! they see a slot either before or after a write, never half of one.
//! Only the engine's commit path can write.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{PoisonError, RwLock};

use crate::types::{Cell, Color, Position, Timestamp, GRID_HEIGHT, GRID_WIDTH};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Stamp {
    color: Color,
    placed_at: Timestamp,
}

pub struct GridStore {
    rows: Vec<RwLock<Vec<Option<Stamp>>>>,
    occupied: AtomicUsize,
}

impl Default for GridStore {
    fn default() -> Self {
        Self::new()
    }
}

impl GridStore {
    pub fn new() -> Self {
        Self {
            rows: (0..GRID_HEIGHT).map(|_| RwLock::new(Vec::new())).collect(),
            occupied: AtomicUsize::new(0),
        }
    }

    /// Current cell at `position`, if anything was ever placed there.
    pub fn get(&self, position: Position) -> Option<Cell> {
        let row = self.rows[position.y() as usize]
            .read()
            .unwrap_or_else(PoisonError::into_inner);
        row.get(position.x() as usize)
            .copied()
            .flatten()
            .map(|stamp| Cell {
                position,
                color: stamp.color,
                placed_at: stamp.placed_at,
            })
    }

    /// Every placed cell, in row-major order.
    pub fn snapshot(&self) -> Vec<Cell> {
        self.collect(|_| true)
    }

    /// Cells whose `placed_at ≥ since`, in row-major order.
    pub fn cells_since(&self, since: Timestamp) -> Vec<Cell> {
        self.collect(|stamp| stamp.placed_at >= since)
    }

    /// Number of positions that hold a cell.
    pub fn len(&self) -> usize {
        self.occupied.load(Ordering::Relaxed)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Upsert a cell, returning the value it replaced.
    pub(crate) fn commit(&self, cell: Cell) -> Option<Cell> {
        let mut row = self.rows[cell.position.y() as usize]
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if row.is_empty() {
            row.resize(GRID_WIDTH as usize, None);
        }
        let stamp = Stamp {
            color: cell.color,
            placed_at: cell.placed_at,
        };
        let previous = row[cell.position.x() as usize].replace(stamp);
        if previous.is_none() {
            self.occupied.fetch_add(1, Ordering::Relaxed);
        }
        previous.map(|old| Cell {
            position: cell.position,
            color: old.color,
            placed_at: old.placed_at,
        })
    }

    fn collect(&self, keep: impl Fn(&Stamp) -> bool) -> Vec<Cell> {
        let mut cells = Vec::new();
        for (y, row) in self.rows.iter().enumerate() {
            let row = row.read().unwrap_or_else(PoisonError::into_inner);
            for (x, slot) in row.iter().enumerate() {
                let Some(stamp) = slot else { continue };
                if !keep(stamp) {
                    continue;
                }
                if let Some(position) = Position::new(x as i64, y as i64) {
                    cells.push(Cell {
                        position,
                        color: stamp.color,
                        placed_at: stamp.placed_at,
                    });
                }
            }
        }
        cells
    }
}
