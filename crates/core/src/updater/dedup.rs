//! # Batch Deduplication
//!
//! Collapses repeated keys in parallel column vectors before a bulk write.
//! Removal swaps the last row into the hole, so row order is not preserved.

use std::collections::HashSet;
use std::hash::Hash;

/// Parallel columns that can drop a row by index.
pub trait Columns {
    fn rows(&self) -> usize;
    fn swap_remove_row(&mut self, row: usize);
}

impl<A> Columns for Vec<A> {
    fn rows(&self) -> usize {
        self.len()
    }

    fn swap_remove_row(&mut self, row: usize) {
        self.swap_remove(row);
    }
}

macro_rules! impl_columns_for_tuple {
    ($($col:ident : $idx:tt),+) => {
        impl<$($col),+> Columns for ($(Vec<$col>,)+) {
            fn rows(&self) -> usize {
                self.0.len()
            }

            fn swap_remove_row(&mut self, row: usize) {
                $( self.$idx.swap_remove(row); )+
            }
        }
    };
}

impl_columns_for_tuple!(A: 0, B: 1);
impl_columns_for_tuple!(A: 0, B: 1, C: 2);
impl_columns_for_tuple!(A: 0, B: 1, C: 2, D: 3);

/// Keep one row per distinct `key`. `seen` is cleared first and left holding the
/// surviving keys, so callers can reuse its allocation across batches.
pub fn dedup_columns<C, K, F>(columns: &mut C, seen: &mut HashSet<K>, key: F)
where
    C: Columns,
    K: Eq + Hash,
    F: Fn(&C, usize) -> K,
{
    seen.clear();
    let mut row = 0;
    while row < columns.rows() {
        if seen.insert(key(columns, row)) {
            row += 1;
        } else {
            columns.swap_remove_row(row);
        }
    }
}
