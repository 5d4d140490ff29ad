// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Per-location cursor of the merge.

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow::row::{Row, Rows};
use arrow_schema::{ArrowError, SchemaRef};
use url::Url;

use super::comparator::RowComparator;
use crate::exchange::{ExchangeClient, PagesSerde, Readiness};
use crate::{MergeError, Result};

/// Identifies a page by its source and arrival order within that source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PageId {
    pub source: usize,
    pub sequence: u64,
}

/// A page together with the position of the next row to merge.
pub struct PageWithPosition {
    id: PageId,
    batch: RecordBatch,
    /// Encoded sort key of every row in `batch`
    rows: Arc<Rows>,
    position: usize,
}

impl PageWithPosition {
    pub(crate) fn new(id: PageId, batch: RecordBatch, rows: Rows) -> Self {
        Self {
            id,
            batch,
            rows: Arc::new(rows),
            position: 0,
        }
    }

    pub fn id(&self) -> PageId {
        self.id
    }

    pub fn batch(&self) -> &RecordBatch {
        &self.batch
    }

    pub(crate) fn rows(&self) -> &Arc<Rows> {
        &self.rows
    }

    pub fn position(&self) -> usize {
        self.position
    }

    #[inline(always)]
    pub fn is_finished(&self) -> bool {
        self.position >= self.batch.num_rows()
    }

    #[inline(always)]
    pub(crate) fn current_row(&self) -> Row<'_> {
        self.rows.row(self.position)
    }

    fn advance(&mut self) {
        self.position += 1;
    }
}

impl Debug for PageWithPosition {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageWithPosition")
            .field("id", &self.id)
            .field("position", &self.position)
            .field("num_rows", &self.batch.num_rows())
            .finish()
    }
}

/// Where a cursor stands with respect to its next row.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CursorState {
    /// Waiting on the transport for the next page.
    Awaiting,
    /// A row is buffered, or a fetch result is ready to be taken.
    Ready,
    /// The location is drained and no buffered row remains.
    Exhausted,
}

/// Adapts one remote location into a pull-based row source.
///
/// Holds at most one page. Once every row of it has been merged the page is
/// released and the next one is requested from the transport.
pub struct SourceCursor {
    index: usize,
    location: Url,
    client: Box<dyn ExchangeClient>,
    serde: Arc<dyn PagesSerde>,
    comparator: Arc<RowComparator>,
    schema: SchemaRef,
    current: Option<PageWithPosition>,
    blocked: Option<Readiness>,
    pages_received: u64,
    rows_received: u64,
    closed: bool,
}

impl Debug for SourceCursor {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceCursor")
            .field("index", &self.index)
            .field("location", &self.location.as_str())
            .field("current", &self.current)
            .field("pages_received", &self.pages_received)
            .field("closed", &self.closed)
            .finish()
    }
}

impl SourceCursor {
    /// Binds `client` to `location`. The client is closed if binding fails.
    pub fn try_new(
        index: usize,
        location: Url,
        mut client: Box<dyn ExchangeClient>,
        serde: Arc<dyn PagesSerde>,
        comparator: Arc<RowComparator>,
        schema: SchemaRef,
    ) -> Result<Self> {
        if let Err(e) = client.add_location(&location) {
            if let Err(close_err) = client.close() {
                warn!("failed to close exchange client for {location}: {close_err}");
            }
            return Err(e);
        }
        client.no_more_locations();
        Ok(Self {
            index,
            location,
            client,
            serde,
            comparator,
            schema,
            current: None,
            blocked: None,
            pages_received: 0,
            rows_received: 0,
            closed: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn pages_received(&self) -> u64 {
        self.pages_received
    }

    pub fn rows_received(&self) -> u64 {
        self.rows_received
    }

    pub fn buffered_bytes(&self) -> usize {
        if self.closed { 0 } else { self.client.buffered_bytes() }
    }

    #[inline]
    fn has_row(&self) -> bool {
        self.current.as_ref().is_some_and(|page| !page.is_finished())
    }

    /// Resolved while a row is buffered. Otherwise the transport's handle,
    /// reused until it resolves so that only one wait is outstanding.
    pub fn readiness(&mut self) -> Readiness {
        if self.has_row() || self.closed {
            return Readiness::ready();
        }
        if let Some(blocked) = &self.blocked {
            if !blocked.is_ready() {
                return blocked.clone();
            }
        }
        let blocked = self.client.is_blocked();
        self.blocked = Some(blocked.clone());
        blocked
    }

    /// True if a row is available or the source is exhausted.
    pub fn is_ready(&mut self) -> bool {
        self.readiness().is_ready()
    }

    pub fn is_exhausted(&self) -> bool {
        self.closed || (!self.has_row() && self.client.is_finished())
    }

    pub fn state(&mut self) -> CursorState {
        if self.has_row() {
            CursorState::Ready
        } else if self.is_exhausted() {
            CursorState::Exhausted
        } else if self.is_ready() {
            CursorState::Ready
        } else {
            CursorState::Awaiting
        }
    }

    /// Makes the next row visible through [`SourceCursor::peek`], taking a
    /// page from the transport when the current one is used up. Never waits.
    pub fn load(&mut self) -> Result<CursorState> {
        loop {
            if self.has_row() {
                return Ok(CursorState::Ready);
            }
            self.current = None;
            if self.closed {
                return Ok(CursorState::Exhausted);
            }
            if !self.is_ready() {
                return Ok(CursorState::Awaiting);
            }
            if self.client.is_finished() {
                debug!(
                    "source[{}] {} exhausted after {} pages, {} rows",
                    self.index, self.location, self.pages_received, self.rows_received
                );
                return Ok(CursorState::Exhausted);
            }

            let Some(serialized) = self.client.poll_page()? else {
                return Err(MergeError::ContractViolation(format!(
                    "exchange client for {} returned no page while not finished",
                    self.location
                )));
            };
            let batch = self
                .serde
                .deserialize(&serialized)
                .and_then(|batch| self.check_schema(batch))
                .map_err(|e| MergeError::deserialization(&self.location, e))?;

            self.pages_received += 1;
            self.rows_received += batch.num_rows() as u64;
            if batch.num_rows() == 0 {
                debug!("source[{}] skipping empty page", self.index);
                continue;
            }

            let rows = self.comparator.convert(&batch)?;
            let id = PageId {
                source: self.index,
                sequence: self.pages_received,
            };
            debug!("source[{}] loaded page {} with {} rows", self.index, id.sequence, batch.num_rows());
            self.current = Some(PageWithPosition::new(id, batch, rows));
        }
    }

    fn check_schema(&self, batch: RecordBatch) -> Result<RecordBatch, ArrowError> {
        let expected = self.schema.fields();
        let actual = batch.schema_ref().fields();
        let matches = expected.len() == actual.len()
            && expected
                .iter()
                .zip(actual.iter())
                .all(|(e, a)| e.data_type() == a.data_type());
        if matches {
            Ok(batch)
        } else {
            Err(ArrowError::SchemaError(format!(
                "page schema {} does not match source schema {}",
                batch.schema_ref(),
                self.schema
            )))
        }
    }

    /// The buffered page with the current row, if any. Call
    /// [`SourceCursor::load`] first.
    pub fn peek(&self) -> Option<&PageWithPosition> {
        self.current.as_ref().filter(|page| !page.is_finished())
    }

    /// Moves past the current row. A used up page is released and the
    /// cursor waits for the transport again.
    pub fn advance(&mut self) -> Result<()> {
        let Some(page) = self.current.as_mut().filter(|page| !page.is_finished()) else {
            return Err(MergeError::ContractViolation(format!(
                "advance called on source[{}] without a current row",
                self.index
            )));
        };
        page.advance();
        if page.is_finished() {
            self.current = None;
            self.blocked = None;
        }
        Ok(())
    }

    /// Releases the page and the transport handle. Safe to call repeatedly.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.current = None;
        self.blocked = None;
        self.client.close()
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}
