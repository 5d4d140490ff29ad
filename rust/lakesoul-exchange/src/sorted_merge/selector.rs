// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

use std::cmp::{Ordering, Reverse};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow::row::Rows;
use dary_heap::QuaternaryHeap;

use super::source::{CursorState, PageId, PageWithPosition, SourceCursor};
use super::sources::SourceSet;
use crate::config::MergeStrategy;
use crate::{MergeError, Result};

/// The row chosen as the next output row.
#[derive(Debug, Clone)]
pub struct SelectedRow {
    pub page_id: PageId,
    pub batch: RecordBatch,
    pub position: usize,
    pub source: usize,
}

impl SelectedRow {
    fn from_head(head: &PageWithPosition) -> Self {
        Self {
            page_id: head.id(),
            batch: head.batch().clone(),
            position: head.position(),
            source: head.id().source,
        }
    }
}

#[derive(Debug)]
pub enum Selection {
    Row(SelectedRow),
    /// Some source has no row buffered and is still waiting on the transport.
    NotReady,
    /// Every source is drained.
    Exhausted,
}

/// Picks the minimal row among the source heads.
///
/// Among equal rows the source registered first wins.
#[derive(Debug)]
pub enum RowSelector {
    LinearScan(LinearScanSelector),
    Heap(HeapSelector),
}

impl RowSelector {
    pub fn new(strategy: MergeStrategy, fan_in: usize) -> Self {
        match strategy {
            MergeStrategy::Heap => RowSelector::Heap(HeapSelector::new(fan_in)),
            MergeStrategy::LinearScan | MergeStrategy::Auto => RowSelector::LinearScan(LinearScanSelector),
        }
    }

    /// Selects and consumes the next row. Nothing is consumed unless a row
    /// is returned.
    pub fn next_row(&mut self, sources: &mut SourceSet) -> Result<Selection> {
        match self {
            RowSelector::LinearScan(selector) => selector.next_row(sources.cursors_mut()),
            RowSelector::Heap(selector) => selector.next_row(sources.cursors_mut()),
        }
    }
}

/// Compares the head of every source on each call.
#[derive(Debug, Default)]
pub struct LinearScanSelector;

impl LinearScanSelector {
    fn next_row(&mut self, cursors: &mut [SourceCursor]) -> Result<Selection> {
        for cursor in cursors.iter_mut() {
            if cursor.load()? == CursorState::Awaiting {
                return Ok(Selection::NotReady);
            }
        }

        let mut winner: Option<(usize, &PageWithPosition)> = None;
        for (i, cursor) in cursors.iter().enumerate() {
            let Some(head) = cursor.peek() else { continue };
            match winner {
                // strict comparison keeps the earliest source on ties
                Some((_, best)) if head.current_row() >= best.current_row() => {}
                _ => winner = Some((i, head)),
            }
        }
        let Some((i, head)) = winner else {
            return Ok(Selection::Exhausted);
        };
        let selected = SelectedRow::from_head(head);
        cursors[i].advance()?;
        Ok(Selection::Row(selected))
    }
}

#[derive(Debug)]
struct HeapEntry {
    rows: Arc<Rows>,
    position: usize,
    source: usize,
}

impl HeapEntry {
    fn new(head: &PageWithPosition) -> Self {
        Self {
            rows: head.rows().clone(),
            position: head.position(),
            source: head.id().source,
        }
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.rows
            .row(self.position)
            .cmp(&other.rows.row(other.position))
            .then_with(|| self.source.cmp(&other.source))
    }
}

/// Keeps source heads in a quaternary min-heap.
///
/// A source sits either in the heap with its current row or in `pending`
/// until its next page arrives.
#[derive(Debug)]
pub struct HeapSelector {
    heap: QuaternaryHeap<Reverse<HeapEntry>>,
    pending: Vec<usize>,
}

impl HeapSelector {
    pub fn new(fan_in: usize) -> Self {
        Self {
            heap: QuaternaryHeap::with_capacity(fan_in),
            pending: (0..fan_in).rev().collect(),
        }
    }

    fn next_row(&mut self, cursors: &mut [SourceCursor]) -> Result<Selection> {
        while let Some(&source) = self.pending.last() {
            let cursor = cursors
                .get_mut(source)
                .ok_or_else(|| MergeError::Internal(format!("no source with index {source}")))?;
            match cursor.load()? {
                CursorState::Awaiting => return Ok(Selection::NotReady),
                CursorState::Ready => {
                    if let Some(head) = cursor.peek() {
                        self.heap.push(Reverse(HeapEntry::new(head)));
                    }
                }
                CursorState::Exhausted => {}
            }
            self.pending.pop();
        }

        let Some(Reverse(entry)) = self.heap.pop() else {
            return Ok(Selection::Exhausted);
        };
        let cursor = &mut cursors[entry.source];
        let selected = cursor
            .peek()
            .map(SelectedRow::from_head)
            .ok_or_else(|| MergeError::Internal(format!("source[{}] lost its head row", entry.source)))?;
        cursor.advance()?;
        match cursor.peek() {
            Some(head) => self.heap.push(Reverse(HeapEntry::new(head))),
            None => self.pending.push(entry.source),
        }
        Ok(Selection::Row(selected))
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::Int64Array;

    use super::*;
    use crate::exchange::{ArrowIpcSerde, LocalExchange, PageProducer};
    use crate::sorted_merge::source::tests::{cursor, page};

    fn sources(exchange: &LocalExchange, n: usize) -> (SourceSet, Vec<PageProducer>) {
        let (cursors, producers) = (0..n).map(|i| cursor(exchange, i, &format!("s{i}"))).unzip();
        (SourceSet::new(cursors), producers)
    }

    fn value(row: &SelectedRow) -> i64 {
        row.batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .value(row.position)
    }

    fn drain(selector: &mut RowSelector, set: &mut SourceSet) -> Vec<(i64, usize)> {
        let mut out = vec![];
        loop {
            match selector.next_row(set).unwrap() {
                Selection::Row(row) => out.push((value(&row), row.source)),
                Selection::Exhausted => return out,
                Selection::NotReady => panic!("unexpected NotReady"),
            }
        }
    }

    fn check_strategy(strategy: MergeStrategy) {
        let exchange = LocalExchange::new();
        let (mut set, producers) = sources(&exchange, 3);
        let mut selector = RowSelector::new(strategy, set.len());

        producers[0].push_batch(&page(&[1, 4]), &ArrowIpcSerde).unwrap();
        producers[0].push_batch(&page(&[4, 9]), &ArrowIpcSerde).unwrap();
        producers[1].push_batch(&page(&[2, 4, 7]), &ArrowIpcSerde).unwrap();
        assert!(matches!(selector.next_row(&mut set).unwrap(), Selection::NotReady));

        producers[2].push_batch(&page(&[0]), &ArrowIpcSerde).unwrap();
        for p in &producers {
            p.finish();
        }
        let merged = drain(&mut selector, &mut set);
        assert_eq!(
            merged,
            vec![(0, 2), (1, 0), (2, 1), (4, 0), (4, 0), (4, 1), (7, 1), (9, 0)]
        );
        assert!(set.all_exhausted());
    }

    #[test]
    fn linear_scan_merges_with_stable_ties() {
        check_strategy(MergeStrategy::LinearScan);
    }

    #[test]
    fn heap_merges_with_stable_ties() {
        check_strategy(MergeStrategy::Heap);
    }

    #[test]
    fn pauses_mid_merge_without_consuming() {
        for strategy in [MergeStrategy::LinearScan, MergeStrategy::Heap] {
            let exchange = LocalExchange::new();
            let (mut set, producers) = sources(&exchange, 2);
            let mut selector = RowSelector::new(strategy, set.len());
            producers[0].push_batch(&page(&[1]), &ArrowIpcSerde).unwrap();
            producers[1].push_batch(&page(&[5]), &ArrowIpcSerde).unwrap();

            let Selection::Row(row) = selector.next_row(&mut set).unwrap() else {
                panic!("expected a row")
            };
            assert_eq!(value(&row), 1);
            // source 0 must deliver again before 5 can be emitted
            assert!(matches!(selector.next_row(&mut set).unwrap(), Selection::NotReady));
            assert!(matches!(selector.next_row(&mut set).unwrap(), Selection::NotReady));

            producers[0].push_batch(&page(&[3]), &ArrowIpcSerde).unwrap();
            producers[0].finish();
            producers[1].finish();
            assert_eq!(drain(&mut selector, &mut set), vec![(3, 0), (5, 1)]);
        }
    }

    #[test]
    fn no_sources_is_exhausted() {
        let mut set = SourceSet::default();
        let mut selector = RowSelector::new(MergeStrategy::Heap, 0);
        assert!(matches!(selector.next_row(&mut set).unwrap(), Selection::Exhausted));
    }
}
