// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

//! This module provides the sorted merge over remote exchange sources.
//!
//! It includes the following submodules:
//!
//! - `comparator`: Provides the merge key and row ordering.
//! - `source`: Provides the per-location cursor buffering one page at a time.
//! - `sources`: Provides readiness and exhaustion across all cursors.
//! - `selector`: Provides the linear scan and heap minimum selection.
//! - `page_builder`: Provides the output page accumulator.
//! - `merge_operator`: Provides the merge operator and its factory.
//! - `stream`: Provides a `Stream` adapter driving a source operator.

pub mod comparator;
pub mod merge_operator;
pub mod page_builder;
pub mod selector;
pub mod source;
pub mod sources;
pub mod stream;

pub use comparator::{RowComparator, SortColumn, SortKey};
pub use merge_operator::{MergeOperator, MergeOperatorFactory, OperatorState};
pub use stream::MergeStream;
