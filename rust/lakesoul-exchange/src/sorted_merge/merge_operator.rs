// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;
use indexmap::IndexSet;
use tracing::instrument;
use url::Url;

use super::comparator::{RowComparator, SortKey};
use super::page_builder::PageBuilder;
use super::selector::{RowSelector, Selection};
use super::source::SourceCursor;
use super::sources::SourceSet;
use crate::config::MergeConfig;
use crate::exchange::{ExchangeClientSupplier, PagesSerde, Readiness, ReadinessSetter};
use crate::operator::{OperatorContext, SourceOperator, Split};
use crate::{MergeError, Result};

/// Lifecycle of a [`MergeOperator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperatorState {
    /// Accepting splits; no source has been contacted yet.
    CollectingSplits,
    /// Sources are open and rows are being merged.
    Merging,
    /// Closed, failed, or every source drained and flushed.
    Finished,
}

/// Builds [`MergeOperator`]s sharing one source definition.
pub struct MergeOperatorFactory {
    source_id: String,
    client_supplier: ExchangeClientSupplier,
    serde: Arc<dyn PagesSerde>,
    source_schema: SchemaRef,
    output_schema: SchemaRef,
    output_channels: Arc<[usize]>,
    sort_key: SortKey,
    config: MergeConfig,
    closed: bool,
}

impl Debug for MergeOperatorFactory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeOperatorFactory")
            .field("source_id", &self.source_id)
            .field("output_channels", &self.output_channels)
            .field("sort_key", &self.sort_key)
            .field("config", &self.config)
            .field("closed", &self.closed)
            .finish()
    }
}

impl MergeOperatorFactory {
    /// Validates the output channels and the sort key against `source_schema`.
    pub fn try_new(
        source_id: impl Into<String>,
        client_supplier: ExchangeClientSupplier,
        serde: Arc<dyn PagesSerde>,
        source_schema: SchemaRef,
        output_channels: Vec<usize>,
        sort_key: SortKey,
        config: MergeConfig,
    ) -> Result<Self> {
        let num_fields = source_schema.fields().len();
        if let Some(channel) = output_channels.iter().find(|&&c| c >= num_fields) {
            return Err(MergeError::Config(format!(
                "output channel {channel} out of range for schema with {num_fields} fields"
            )));
        }
        RowComparator::try_new(&source_schema, sort_key.clone())?;
        let output_schema = Arc::new(source_schema.project(&output_channels)?);
        Ok(Self {
            source_id: source_id.into(),
            client_supplier,
            serde,
            source_schema,
            output_schema,
            output_channels: Arc::from(output_channels),
            sort_key,
            config,
            closed: false,
        })
    }

    pub fn source_id(&self) -> &str {
        &self.source_id
    }

    pub fn output_schema(&self) -> SchemaRef {
        self.output_schema.clone()
    }

    pub fn create_operator(&self, operator_id: usize) -> Result<MergeOperator> {
        if self.closed {
            return Err(MergeError::ContractViolation(format!(
                "factory for {} is already closed",
                self.source_id
            )));
        }
        let comparator = Arc::new(RowComparator::try_new(&self.source_schema, self.sort_key.clone())?);
        let builder = PageBuilder::new(
            self.output_schema.clone(),
            self.output_channels.clone(),
            self.config.batch_size(),
            self.config.max_page_bytes(),
        );
        let (splits_setter, splits_ready) = Readiness::settable();
        Ok(MergeOperator {
            context: OperatorContext::new(operator_id, self.source_id.clone()),
            state: OperatorState::CollectingSplits,
            closed: false,
            client_supplier: self.client_supplier.clone(),
            serde: self.serde.clone(),
            source_schema: self.source_schema.clone(),
            comparator,
            config: self.config.clone(),
            locations: IndexSet::new(),
            splits_setter,
            splits_ready,
            sources: SourceSet::default(),
            selector: None,
            builder,
        })
    }

    /// No operator can be created afterwards. Operators already created are
    /// unaffected.
    pub fn close(&mut self) {
        self.closed = true;
    }
}

/// Merges pre-sorted pages from every registered remote location into one
/// sorted stream of pages.
///
/// Rows are compared only once every source has its current row visible, so
/// [`SourceOperator::pull`] must only be called after
/// [`SourceOperator::readiness`] resolved.
pub struct MergeOperator {
    context: OperatorContext,
    state: OperatorState,
    /// Set once sources have been released
    closed: bool,
    client_supplier: ExchangeClientSupplier,
    serde: Arc<dyn PagesSerde>,
    source_schema: SchemaRef,
    comparator: Arc<RowComparator>,
    config: MergeConfig,
    /// Distinct locations in registration order, which is also scan order
    locations: IndexSet<Url>,
    splits_setter: ReadinessSetter,
    splits_ready: Readiness,
    sources: SourceSet,
    selector: Option<RowSelector>,
    builder: PageBuilder,
}

impl Debug for MergeOperator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MergeOperator")
            .field("context", &self.context)
            .field("state", &self.state)
            .field("locations", &self.locations.len())
            .field("buffered_rows", &self.builder.row_count())
            .finish()
    }
}

impl MergeOperator {
    pub fn state(&self) -> OperatorState {
        self.state
    }

    pub fn context(&self) -> &OperatorContext {
        &self.context
    }

    pub fn output_schema(&self) -> SchemaRef {
        self.builder.schema().clone()
    }

    pub fn locations(&self) -> impl Iterator<Item = &Url> {
        self.locations.iter()
    }

    fn open_sources(&mut self) -> Result<()> {
        let mut cursors = Vec::with_capacity(self.locations.len());
        for (index, location) in self.locations.iter().enumerate() {
            let cursor = SourceCursor::try_new(
                index,
                location.clone(),
                (self.client_supplier)(),
                self.serde.clone(),
                self.comparator.clone(),
                self.source_schema.clone(),
            );
            match cursor {
                Ok(cursor) => cursors.push(cursor),
                Err(e) => {
                    // cursors opened so far are closed with the set
                    self.sources = SourceSet::new(cursors);
                    return Err(e);
                }
            }
        }
        self.sources = SourceSet::new(cursors);
        Ok(())
    }

    /// Runs the merge loop until the output page is full or no source can
    /// make progress.
    fn merge(&mut self) -> Result<Option<RecordBatch>> {
        let selector = self
            .selector
            .as_mut()
            .ok_or_else(|| MergeError::Internal("merging without a row selector".into()))?;
        self.context.stats_mut().record_buffered(self.sources.buffered_bytes());
        while !self.builder.is_full() {
            match selector.next_row(&mut self.sources)? {
                Selection::Row(row) => self.builder.append(&row),
                Selection::NotReady | Selection::Exhausted => break,
            }
        }
        self.context.stats_mut().record_buffered(self.sources.buffered_bytes());

        let exhausted = self.sources.all_exhausted();
        let page = if self.builder.is_full() || exhausted {
            self.builder.build()?
        } else {
            None
        };
        if let Some(page) = &page {
            self.context.stats_mut().record_output(page);
            debug!(
                "{}[{}] flushed page with {} rows",
                self.context.source_id(),
                self.context.operator_id(),
                page.num_rows()
            );
        }
        if exhausted && self.builder.is_empty() {
            debug!(
                "{}[{}] all {} sources exhausted",
                self.context.source_id(),
                self.context.operator_id(),
                self.sources.len()
            );
            self.state = OperatorState::Finished;
        }
        Ok(page)
    }

    /// Tears down after a fatal error and hands the error back.
    fn abort(&mut self, error: MergeError) -> MergeError {
        error!(
            "{}[{}] merge failed: {error}",
            self.context.source_id(),
            self.context.operator_id()
        );
        if let Err(suppressed) = self.release() {
            warn!("suppressed while aborting merge: {suppressed}");
        }
        error
    }

    fn release(&mut self) -> Result<()> {
        self.closed = true;
        self.state = OperatorState::Finished;
        self.splits_setter.set();
        self.builder.reset();
        self.selector = None;
        let stats = self.context.stats_mut();
        stats.input_pages = self.sources.pages_received();
        stats.input_rows = self.sources.rows_received();
        stats.buffered_bytes = 0;
        self.sources.close()
    }
}

impl SourceOperator for MergeOperator {
    fn source_id(&self) -> &str {
        self.context.source_id()
    }

    fn register_split(&mut self, split: Split) -> Result<()> {
        if self.closed {
            debug!("ignoring split {} for closed operator", split.location);
            return Ok(());
        }
        if !split.is_remote() {
            return Err(MergeError::InvalidSplit(format!(
                "split for {} comes from connector `{}`, expected a remote split",
                split.location, split.connector_id
            )));
        }
        if self.state != OperatorState::CollectingSplits {
            return Err(MergeError::ContractViolation(format!(
                "split {} registered after no_more_splits",
                split.location
            )));
        }
        if !self.locations.insert(split.location) {
            debug!("duplicate location ignored");
        }
        Ok(())
    }

    #[instrument(level = "debug", skip(self), fields(source_id = %self.context.source_id(), operator_id = self.context.operator_id()))]
    fn no_more_splits(&mut self) -> Result<()> {
        if self.state != OperatorState::CollectingSplits {
            return Ok(());
        }
        if let Err(e) = self.open_sources() {
            return Err(self.abort(e));
        }
        let fan_in = self.sources.len();
        let strategy = self.config.effective_strategy(fan_in);
        self.selector = Some(RowSelector::new(strategy, fan_in));
        self.state = OperatorState::Merging;
        self.splits_setter.set();
        debug!("merging {fan_in} sources with {strategy} selection");
        Ok(())
    }

    fn readiness(&mut self) -> Readiness {
        match self.state {
            OperatorState::CollectingSplits => self.splits_ready.clone(),
            OperatorState::Merging => self.sources.readiness(),
            OperatorState::Finished => Readiness::ready(),
        }
    }

    fn pull(&mut self) -> Result<Option<RecordBatch>> {
        match self.state {
            OperatorState::CollectingSplits => Err(MergeError::ContractViolation(
                "pull called before no_more_splits".into(),
            )),
            OperatorState::Finished => Ok(None),
            OperatorState::Merging => {
                if !self.sources.all_ready() {
                    let e = MergeError::ContractViolation("pull called while sources are not ready".into());
                    return Err(self.abort(e));
                }
                self.merge().map_err(|e| self.abort(e))
            }
        }
    }

    fn finish(&mut self) {
        if let Err(e) = self.close() {
            warn!("{}[{}] finish: {e}", self.context.source_id(), self.context.operator_id());
        }
    }

    fn is_finished(&self) -> bool {
        match self.state {
            OperatorState::Finished => true,
            OperatorState::Merging => self.sources.all_exhausted() && self.builder.is_empty(),
            OperatorState::CollectingSplits => false,
        }
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        let result = self.release();
        let stats = self.context.stats();
        info!(
            "{}[{}] closed: {} sources, {} input pages, {} input rows, {} output pages, {} output rows, {} output bytes, {} peak buffered bytes",
            self.context.source_id(),
            self.context.operator_id(),
            self.sources.len(),
            stats.input_pages,
            stats.input_rows,
            stats.output_pages,
            stats.output_rows,
            stats.output_bytes,
            stats.peak_buffered_bytes
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use arrow::array::{ArrayRef, Int64Array};
    use arrow_schema::{DataType, Field, Schema};

    use super::*;
    use crate::config::MergeStrategy;
    use crate::exchange::{ArrowIpcSerde, LocalExchange, PageProducer};
    use crate::sorted_merge::comparator::SortColumn;

    fn schema() -> SchemaRef {
        Arc::new(Schema::new(vec![
            Field::new("k", DataType::Int64, true),
            Field::new("v", DataType::Int64, true),
        ]))
    }

    fn page(keys: &[i64]) -> RecordBatch {
        let k: ArrayRef = Arc::new(Int64Array::from(keys.to_vec()));
        let v: ArrayRef = Arc::new(Int64Array::from(keys.iter().map(|k| k * 10).collect::<Vec<_>>()));
        RecordBatch::try_new(schema(), vec![k, v]).unwrap()
    }

    fn factory(exchange: &LocalExchange, batch_size: usize) -> MergeOperatorFactory {
        let config = MergeConfig::builder()
            .with_batch_size(batch_size)
            .with_merge_strategy(MergeStrategy::LinearScan)
            .build()
            .unwrap();
        MergeOperatorFactory::try_new(
            "merge",
            exchange.client_supplier(),
            Arc::new(ArrowIpcSerde),
            schema(),
            vec![0],
            SortKey::new(vec![SortColumn::asc(0)]),
            config,
        )
        .unwrap()
    }

    fn location(name: &str) -> Url {
        Url::parse(&format!("http://{name}/v1/task/0/results")).unwrap()
    }

    fn keys(batch: &RecordBatch) -> Vec<i64> {
        batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap()
            .values()
            .to_vec()
    }

    fn send(producer: &PageProducer, keys: &[i64]) {
        producer.push_batch(&page(keys), &ArrowIpcSerde).unwrap();
    }

    #[test_log::test]
    fn state_transitions() {
        let exchange = LocalExchange::new();
        let mut op = factory(&exchange, 2).create_operator(0).unwrap();
        assert_eq!(op.state(), OperatorState::CollectingSplits);
        assert!(!op.is_finished());
        let waiting = op.readiness();
        assert!(!waiting.is_ready());
        assert!(op.pull().unwrap_err().is_contract_violation());

        op.register_split(Split::remote(location("a"))).unwrap();
        op.no_more_splits().unwrap();
        assert!(waiting.is_ready());
        assert_eq!(op.state(), OperatorState::Merging);
        // repeated call is a no-op
        op.no_more_splits().unwrap();
        assert!(op.register_split(Split::remote(location("b"))).unwrap_err().is_contract_violation());

        let producer = exchange.producer(&location("a"));
        send(&producer, &[1, 2]);
        producer.finish();
        assert!(op.readiness().is_ready());
        assert_eq!(keys(&op.pull().unwrap().unwrap()), vec![1, 2]);
        assert!(op.is_finished());
        assert_eq!(op.state(), OperatorState::Finished);
        assert_eq!(op.pull().unwrap(), None);
        op.close().unwrap();
        assert_eq!(op.context().stats().input_pages, 1);
        assert_eq!(op.context().stats().output_rows, 2);
    }

    #[test_log::test]
    fn buffered_bytes_are_tracked_per_pull() {
        let exchange = LocalExchange::new();
        let mut op = factory(&exchange, 2).create_operator(0).unwrap();
        op.register_split(Split::remote(location("a"))).unwrap();
        op.no_more_splits().unwrap();

        let producer = exchange.producer(&location("a"));
        send(&producer, &[1, 2]);
        send(&producer, &[3, 4]);
        let queued = exchange.buffered_bytes(&location("a")) as u64;
        assert!(queued > 0);

        assert_eq!(keys(&op.pull().unwrap().unwrap()), vec![1, 2]);
        let stats = op.context().stats();
        assert_eq!(stats.peak_buffered_bytes, queued);
        // the second page is still queued
        assert!(stats.buffered_bytes > 0 && stats.buffered_bytes < queued);

        producer.finish();
        assert_eq!(keys(&op.pull().unwrap().unwrap()), vec![3, 4]);
        assert_eq!(op.context().stats().buffered_bytes, 0);
        op.close().unwrap();
        assert_eq!(op.context().stats().peak_buffered_bytes, queued);
    }

    #[test_log::test]
    fn readiness_rearms_after_a_source_runs_dry() {
        let exchange = LocalExchange::new();
        let mut op = factory(&exchange, 4).create_operator(0).unwrap();
        op.register_split(Split::remote(location("a"))).unwrap();
        op.register_split(Split::remote(location("b"))).unwrap();
        op.no_more_splits().unwrap();
        let a = exchange.producer(&location("a"));
        let b = exchange.producer(&location("b"));
        send(&b, &[10, 20]);

        let blocked = op.readiness();
        assert!(!blocked.is_ready());
        send(&a, &[1]);
        assert!(blocked.is_ready());
        // a's only row goes into the partial page, a is pending again
        assert_eq!(op.pull().unwrap(), None);

        let blocked = op.readiness();
        assert!(!blocked.is_ready());
        assert!(op.pull().unwrap_err().is_contract_violation());
    }

    #[test_log::test]
    fn readiness_then_pull_without_repolling() {
        let exchange = LocalExchange::new();
        let mut op = factory(&exchange, 4).create_operator(0).unwrap();
        op.register_split(Split::remote(location("a"))).unwrap();
        op.register_split(Split::remote(location("b"))).unwrap();
        op.no_more_splits().unwrap();
        let a = exchange.producer(&location("a"));
        let b = exchange.producer(&location("b"));
        send(&b, &[10, 20]);

        let mut out = Vec::new();
        for key in 1..=3 {
            let blocked = op.readiness();
            assert!(!blocked.is_ready());
            send(&a, &[key]);
            assert!(blocked.is_ready());
            out.extend(op.pull().unwrap().map(|page| keys(&page)));
        }
        a.finish();
        b.finish();
        while !op.is_finished() {
            assert!(op.readiness().is_ready());
            out.extend(op.pull().unwrap().map(|page| keys(&page)));
        }
        assert_eq!(out.concat(), vec![1, 2, 3, 10, 20]);
    }

    #[test_log::test]
    fn partial_pages_are_held_back() {
        let exchange = LocalExchange::new();
        let mut op = factory(&exchange, 4).create_operator(0).unwrap();
        op.register_split(Split::remote(location("a"))).unwrap();
        op.register_split(Split::remote(location("b"))).unwrap();
        op.no_more_splits().unwrap();
        let a = exchange.producer(&location("a"));
        let b = exchange.producer(&location("b"));

        send(&a, &[1]);
        send(&b, &[2]);
        assert!(op.readiness().is_ready());
        // 1 is emitted into the buffer, then a has to fetch again
        assert_eq!(op.pull().unwrap(), None);
        assert!(!op.readiness().is_ready());
        assert!(op.pull().unwrap_err().is_contract_violation());
        assert!(op.is_finished());
    }

    #[test_log::test]
    fn duplicates_and_foreign_splits() {
        let exchange = LocalExchange::new();
        let mut op = factory(&exchange, 10).create_operator(0).unwrap();
        op.register_split(Split::remote(location("a"))).unwrap();
        op.register_split(Split::remote(location("a"))).unwrap();
        let err = op.register_split(Split::new("hive", location("c"))).unwrap_err();
        assert!(matches!(err, MergeError::InvalidSplit(_)));
        assert_eq!(op.locations().count(), 1);
    }

    #[test_log::test]
    fn no_splits_finishes_immediately() {
        let exchange = LocalExchange::new();
        let mut op = factory(&exchange, 10).create_operator(0).unwrap();
        op.no_more_splits().unwrap();
        assert!(op.is_finished());
        assert!(op.readiness().is_ready());
        assert_eq!(op.pull().unwrap(), None);
        assert_eq!(op.state(), OperatorState::Finished);
    }

    #[test_log::test]
    fn factory_validates_and_closes() {
        let exchange = LocalExchange::new();
        let err = MergeOperatorFactory::try_new(
            "merge",
            exchange.client_supplier(),
            Arc::new(ArrowIpcSerde),
            schema(),
            vec![0, 5],
            SortKey::new(vec![SortColumn::asc(0)]),
            MergeConfig::default(),
        )
        .unwrap_err();
        assert!(matches!(err, MergeError::Config(_)));

        let mut factory = factory(&exchange, 10);
        assert_eq!(factory.output_schema().fields().len(), 1);
        let op = factory.create_operator(7).unwrap();
        assert_eq!(op.context().operator_id(), 7);
        assert_eq!(op.output_schema().field(0).name(), "k");
        factory.close();
        assert!(factory.create_operator(8).unwrap_err().is_contract_violation());
    }

    #[test_log::test]
    fn transport_failure_closes_every_source() {
        let exchange = LocalExchange::new();
        let mut op = factory(&exchange, 10).create_operator(0).unwrap();
        op.register_split(Split::remote(location("a"))).unwrap();
        op.register_split(Split::remote(location("b"))).unwrap();
        op.no_more_splits().unwrap();
        let a = exchange.producer(&location("a"));
        let b = exchange.producer(&location("b"));
        send(&a, &[1]);
        b.fail("peer went away");

        assert!(op.readiness().is_ready());
        let err = op.pull().unwrap_err();
        assert!(matches!(err, MergeError::Transport { .. }));
        assert!(op.is_finished());
        // a's consumer is gone
        send(&a, &[2]);
        assert_eq!(exchange.buffered_bytes(&location("a")), 0);
        op.close().unwrap();
    }
}
