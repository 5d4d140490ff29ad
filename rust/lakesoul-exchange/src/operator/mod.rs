// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

//! The contract between a cooperative scheduler and source operators.

use arrow::record_batch::RecordBatch;
use url::Url;

use crate::exchange::Readiness;
use crate::{MergeError, Result};

/// Connector id carried by splits that point at a remote exchange location.
pub const REMOTE_CONNECTOR_ID: &str = "$remote";

/// A unit of input assigned to a source operator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub connector_id: String,
    pub location: Url,
}

impl Split {
    pub fn new(connector_id: impl Into<String>, location: Url) -> Self {
        Self {
            connector_id: connector_id.into(),
            location,
        }
    }

    /// A split reading the remote exchange at `location`.
    pub fn remote(location: Url) -> Self {
        Self::new(REMOTE_CONNECTOR_ID, location)
    }

    pub fn is_remote(&self) -> bool {
        self.connector_id == REMOTE_CONNECTOR_ID
    }
}

/// Counters of one operator instance.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperatorStats {
    pub input_pages: u64,
    pub input_rows: u64,
    pub output_pages: u64,
    pub output_rows: u64,
    pub output_bytes: u64,
    /// Fetched pages not yet taken by the operator, as of the last pull
    pub buffered_bytes: u64,
    pub peak_buffered_bytes: u64,
}

impl OperatorStats {
    pub(crate) fn record_buffered(&mut self, bytes: usize) {
        self.buffered_bytes = bytes as u64;
        self.peak_buffered_bytes = self.peak_buffered_bytes.max(self.buffered_bytes);
    }

    pub(crate) fn record_output(&mut self, batch: &RecordBatch) {
        self.output_pages += 1;
        self.output_rows += batch.num_rows() as u64;
        self.output_bytes += batch.get_array_memory_size() as u64;
    }
}

/// Identity and accounting of one operator instance within a pipeline.
#[derive(Debug, Clone)]
pub struct OperatorContext {
    operator_id: usize,
    source_id: String,
    stats: OperatorStats,
}

impl OperatorContext {
    pub fn new(operator_id: usize, source_id: impl Into<String>) -> Self {
        Self {
            operator_id,
            source_id: source_id.into(),
            stats: OperatorStats::default(),
        }
    }

    pub fn operator_id(&self) -> usize {
        self.operator_id
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn stats(&self) -> OperatorStats {
        self.stats
    }

    pub(crate) fn stats_mut(&mut self) -> &mut OperatorStats {
        &mut self.stats
    }
}

/// An operator fed by splits rather than by upstream pages.
///
/// Every method is non-blocking. The scheduler awaits [`SourceOperator::readiness`]
/// before calling [`SourceOperator::pull`].
pub trait SourceOperator: Send {
    /// Identifier matched against the source of incoming splits.
    fn source_id(&self) -> &str;

    fn register_split(&mut self, split: Split) -> Result<()>;

    /// Declares that no further splits will be registered.
    fn no_more_splits(&mut self) -> Result<()>;

    /// Resolves when `pull` can make progress.
    fn readiness(&mut self) -> Readiness;

    /// Source operators never take upstream input.
    fn needs_more_input(&self) -> bool {
        false
    }

    fn accept_input(&mut self, _page: RecordBatch) -> Result<()> {
        Err(MergeError::UnsupportedOperation(format!(
            "{} does not accept input pages",
            self.source_id()
        )))
    }

    /// Produces the next output page, `Ok(None)` when none is due yet.
    fn pull(&mut self) -> Result<Option<RecordBatch>>;

    /// Upstream signal that no more input will arrive. No-op for sources.
    fn finish(&mut self) {}

    fn is_finished(&self) -> bool;

    /// Releases every held resource. Safe to call repeatedly.
    fn close(&mut self) -> Result<()>;
}

/// Drives `operator` to completion and collects every output page.
pub async fn drain<O: SourceOperator + ?Sized>(operator: &mut O) -> Result<Vec<RecordBatch>> {
    let mut pages = vec![];
    while !operator.is_finished() {
        operator.readiness().await;
        if let Some(page) = operator.pull()? {
            pages.push(page);
        }
    }
    Ok(pages)
}
