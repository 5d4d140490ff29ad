// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;
use std::sync::Arc;

use arrow::array::{Array, ArrayRef};
use arrow::compute::interleave;
use arrow::record_batch::{RecordBatch, RecordBatchOptions};
use arrow_schema::SchemaRef;

use super::selector::SelectedRow;
use super::source::PageId;
use crate::Result;

/// Accumulates selected rows and materializes them as one output page.
///
/// Rows are recorded as `(page slot, row)` pairs; input pages stay shared
/// until [`PageBuilder::build`] interleaves the output columns in one pass.
#[derive(Debug)]
pub struct PageBuilder {
    schema: SchemaRef,
    output_channels: Arc<[usize]>,
    max_rows: usize,
    max_bytes: usize,
    pages: Vec<RecordBatch>,
    /// Estimated output bytes per row, parallel to `pages`
    row_bytes: Vec<usize>,
    slots: HashMap<PageId, usize>,
    indices: Vec<(usize, usize)>,
    estimated_bytes: usize,
}

impl PageBuilder {
    /// `schema` is the output schema, i.e. the source schema projected to
    /// `output_channels`.
    pub fn new(schema: SchemaRef, output_channels: Arc<[usize]>, max_rows: usize, max_bytes: usize) -> Self {
        Self {
            schema,
            output_channels,
            max_rows,
            max_bytes,
            pages: Vec::new(),
            row_bytes: Vec::new(),
            slots: HashMap::with_capacity(16),
            indices: Vec::with_capacity(max_rows.min(8192)),
            estimated_bytes: 0,
        }
    }

    pub fn schema(&self) -> &SchemaRef {
        &self.schema
    }

    pub fn is_empty(&self) -> bool {
        self.indices.is_empty()
    }

    pub fn row_count(&self) -> usize {
        self.indices.len()
    }

    pub fn estimated_bytes(&self) -> usize {
        self.estimated_bytes
    }

    /// Whether either the row or the byte limit is reached.
    pub fn is_full(&self) -> bool {
        self.indices.len() >= self.max_rows || self.estimated_bytes >= self.max_bytes
    }

    /// Average bytes a row of `page` contributes to the output channels.
    ///
    /// Counts only the bytes each column's slice references. Columns decoded
    /// from one IPC message share a single allocation, so the capacity
    /// reported by `get_array_memory_size` would count it once per column.
    fn estimate_row_bytes(&self, page: &RecordBatch) -> usize {
        let rows = page.num_rows().max(1);
        self.output_channels
            .iter()
            .map(|&c| {
                let column = page.column(c);
                column
                    .to_data()
                    .get_slice_memory_size()
                    .unwrap_or_else(|_| column.get_array_memory_size())
            })
            .sum::<usize>()
            .div_ceil(rows)
    }

    /// Copies the output channels of `row` into the page under construction.
    pub fn append(&mut self, row: &SelectedRow) {
        let slot = match self.slots.get(&row.page_id) {
            Some(&slot) => slot,
            None => {
                let slot = self.pages.len();
                self.row_bytes.push(self.estimate_row_bytes(&row.batch));
                self.pages.push(row.batch.clone());
                self.slots.insert(row.page_id, slot);
                slot
            }
        };
        self.indices.push((slot, row.position));
        self.estimated_bytes += self.row_bytes[slot];
    }

    /// Emits the accumulated rows and resets the builder. `None` when empty.
    pub fn build(&mut self) -> Result<Option<RecordBatch>> {
        if self.is_empty() {
            return Ok(None);
        }
        let columns = self
            .output_channels
            .iter()
            .map(|&channel| {
                let arrays = self
                    .pages
                    .iter()
                    .map(|page| page.column(channel).as_ref())
                    .collect::<Vec<&dyn Array>>();
                interleave(&arrays, &self.indices)
            })
            .collect::<Result<Vec<ArrayRef>, _>>();
        let row_count = self.indices.len();
        self.reset();

        let options = RecordBatchOptions::new().with_row_count(Some(row_count));
        let batch = RecordBatch::try_new_with_options(self.schema.clone(), columns?, &options)?;
        Ok(Some(batch))
    }

    /// Drops accumulated rows and releases retained pages.
    pub fn reset(&mut self) {
        self.pages.clear();
        self.row_bytes.clear();
        self.slots.clear();
        self.indices.clear();
        self.estimated_bytes = 0;
    }
}
