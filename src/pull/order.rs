//! Cross-tablet ordering of pulled rows

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;

use crate::storage::ReplicationRow;

fn order_key(row: &ReplicationRow) -> (u64, u32, u64) {
    (row.timestamp.value(), row.tablet_index, row.row_index)
}

struct HeapItem {
    row: ReplicationRow,
    source: usize,
}

impl PartialEq for HeapItem {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapItem {}

impl PartialOrd for HeapItem {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapItem {
    fn cmp(&self, other: &Self) -> Ordering {
        order_key(&self.row).cmp(&order_key(&other.row))
    }
}

/// Merge per-tablet rows into one sequence ordered by timestamp
///
/// Ties are broken by tablet index, then row index.
pub fn order_by_timestamp(tablets: Vec<Vec<ReplicationRow>>) -> Vec<ReplicationRow> {
    let total = tablets.iter().map(Vec::len).sum();
    let mut sources: Vec<std::vec::IntoIter<ReplicationRow>> = tablets
        .into_iter()
        .map(|mut rows| {
            rows.sort_by_key(order_key);
            rows.into_iter()
        })
        .collect();

    let mut heap = BinaryHeap::with_capacity(sources.len());
    for (source, rows) in sources.iter_mut().enumerate() {
        if let Some(row) = rows.next() {
            heap.push(Reverse(HeapItem { row, source }));
        }
    }

    let mut merged = Vec::with_capacity(total);
    while let Some(Reverse(HeapItem { row, source })) = heap.pop() {
        merged.push(row);
        if let Some(next) = sources[source].next() {
            heap.push(Reverse(HeapItem { row: next, source }));
        }
    }
    merged
}

/// Whether every adjacent pair is in strictly increasing merge order
pub fn is_ordered_by_timestamp(rows: &[ReplicationRow]) -> bool {
    rows.windows(2)
        .all(|pair| order_key(&pair[0]) < order_key(&pair[1]))
}
