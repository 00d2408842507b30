// Read-borrow tracking, §3 "Read borrow".
//
// The C ancestor tracked borrows in a two-dimensional table: fixed-width
// rows, grown on demand up to a hard cap, so a borrow handle is stable
// while the table can still grow without relocating existing entries. We
// keep that shape (`Vec<Row>` rather than one flat resizable `Vec`) so the
// "grown on demand up to a hard cap" behavior — and its `NoFreeBuffers`
// failure mode — stays visible instead of being hidden behind `Vec::push`.

use crate::error::{PipeError, PipeResult};

const ROW_WIDTH: usize = 32;
const MAX_ROWS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BorrowBase {
    Pool(usize),
    Spare,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    inuse: bool,
    base: BorrowBase,
    len: usize,
    /// Half-open chunk index range `[start, end)` this borrow overlaps,
    /// used to decide which pending-invalidate chunks a release unblocks.
    chunk_range: (usize, usize),
}

impl Slot {
    fn empty() -> Self {
        Self {
            inuse: false,
            base: BorrowBase::Pool(0),
            len: 0,
            chunk_range: (0, 0),
        }
    }
}

/// Opaque handle returned by `BorrowTable::alloc`; stable across table
/// growth.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BorrowId(usize);

pub struct BorrowTable {
    rows: Vec<[Slot; ROW_WIDTH]>,
    active_count: usize,
}

impl BorrowTable {
    pub fn new() -> Self {
        Self {
            rows: vec![[Slot::empty(); ROW_WIDTH]],
            active_count: 0,
        }
    }

    pub fn active_count(&self) -> usize {
        self.active_count
    }

    pub fn alloc(&mut self, base: BorrowBase, len: usize, chunk_range: (usize, usize)) -> PipeResult<BorrowId> {
        // First pass: reuse a free slot in an existing row.
        for (row_idx, row) in self.rows.iter_mut().enumerate() {
            for (col_idx, slot) in row.iter_mut().enumerate() {
                if !slot.inuse {
                    *slot = Slot {
                        inuse: true,
                        base,
                        len,
                        chunk_range,
                    };
                    self.active_count += 1;
                    return Ok(BorrowId(row_idx * ROW_WIDTH + col_idx));
                }
            }
        }
        // No free slot: grow by one row if under the hard cap.
        if self.rows.len() >= MAX_ROWS {
            return Err(PipeError::NoFreeBuffers);
        }
        self.rows.push([Slot::empty(); ROW_WIDTH]);
        let row_idx = self.rows.len() - 1;
        self.rows[row_idx][0] = Slot {
            inuse: true,
            base,
            len,
            chunk_range,
        };
        self.active_count += 1;
        Ok(BorrowId(row_idx * ROW_WIDTH))
    }

    pub fn get(&self, id: BorrowId) -> Option<(BorrowBase, usize)> {
        let row = id.0 / ROW_WIDTH;
        let col = id.0 % ROW_WIDTH;
        self.rows.get(row).and_then(|r| {
            let slot = r[col];
            slot.inuse.then_some((slot.base, slot.len))
        })
    }

    /// Releases the borrow, returning the chunk range it overlapped so the
    /// caller can re-evaluate pending-invalidate chunks in that range.
    pub fn release(&mut self, id: BorrowId) -> PipeResult<(usize, usize)> {
        let row = id.0 / ROW_WIDTH;
        let col = id.0 % ROW_WIDTH;
        let slot = self
            .rows
            .get_mut(row)
            .map(|r| &mut r[col])
            .filter(|s| s.inuse)
            .ok_or_else(|| PipeError::BadParameter("release of unknown or already-released borrow".into()))?;
        let range = slot.chunk_range;
        *slot = Slot::empty();
        self.active_count -= 1;
        Ok(range)
    }

    /// True if any active borrow's chunk range intersects `chunk_idx`.
    pub fn chunk_is_borrowed(&self, chunk_idx: usize) -> bool {
        self.rows.iter().flatten().any(|slot| {
            slot.inuse && slot.chunk_range.0 <= chunk_idx && chunk_idx < slot.chunk_range.1
        })
    }

    /// True if a straddling borrow currently occupies the spare area.
    pub fn spare_in_use(&self) -> bool {
        self.rows
            .iter()
            .flatten()
            .any(|slot| slot.inuse && slot.base == BorrowBase::Spare)
    }
}

impl Default for BorrowTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alloc_and_release_roundtrip() {
        let mut t = BorrowTable::new();
        let id = t.alloc(BorrowBase::Pool(10), 20, (0, 1)).unwrap();
        assert_eq!(t.active_count(), 1);
        assert!(t.chunk_is_borrowed(0));
        assert!(!t.chunk_is_borrowed(1));
        let range = t.release(id).unwrap();
        assert_eq!(range, (0, 1));
        assert_eq!(t.active_count(), 0);
        assert!(!t.chunk_is_borrowed(0));
    }

    #[test]
    fn grows_rows_up_to_cap() {
        let mut t = BorrowTable::new();
        let mut ids = Vec::new();
        for i in 0..(ROW_WIDTH * MAX_ROWS) {
            ids.push(t.alloc(BorrowBase::Pool(i), 1, (i, i + 1)).unwrap());
        }
        assert!(t.alloc(BorrowBase::Pool(0), 1, (0, 1)).is_err());
    }
}
