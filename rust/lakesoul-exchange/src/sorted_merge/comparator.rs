// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Row ordering over the merge key.

use std::cmp::Ordering;
use std::fmt::{Debug, Formatter};
use std::sync::Arc;

use arrow::array::ArrayRef;
use arrow::record_batch::RecordBatch;
use arrow::row::{RowConverter, Rows, SortField};
use arrow_ord::ord::make_comparator;
use arrow_schema::{Schema, SortOptions};

use crate::{MergeError, Result};

/// One column of the merge key.
///
/// Null placement follows `options.nulls_first` regardless of
/// `options.descending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SortColumn {
    pub column: usize,
    pub options: SortOptions,
}

impl SortColumn {
    pub fn new(column: usize, options: SortOptions) -> Self {
        Self { column, options }
    }

    /// Ascending, nulls last.
    pub fn asc(column: usize) -> Self {
        Self::new(
            column,
            SortOptions {
                descending: false,
                nulls_first: false,
            },
        )
    }

    /// Descending, nulls last.
    pub fn desc(column: usize) -> Self {
        Self::new(
            column,
            SortOptions {
                descending: true,
                nulls_first: false,
            },
        )
    }

    pub fn nulls_first(mut self, nulls_first: bool) -> Self {
        self.options.nulls_first = nulls_first;
        self
    }
}

/// The ordered list of key columns shared by every source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SortKey(Arc<[SortColumn]>);

impl SortKey {
    pub fn new(columns: impl Into<Vec<SortColumn>>) -> Self {
        Self(Arc::from(columns.into()))
    }

    pub fn columns(&self) -> &[SortColumn] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Compares rows of arbitrary pages by the merge key.
///
/// [`RowComparator::compare`] works directly on record batches. The merge
/// itself encodes each page once with [`RowComparator::convert`]; the
/// resulting rows compare bytewise in exactly the same order.
pub struct RowComparator {
    sort_key: SortKey,
    converter: RowConverter,
}

impl Debug for RowComparator {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RowComparator")
            .field("sort_key", &self.sort_key)
            .finish()
    }
}

impl RowComparator {
    pub fn try_new(schema: &Schema, sort_key: SortKey) -> Result<Self> {
        if sort_key.is_empty() {
            return Err(MergeError::Config("merge requires at least one sort column".into()));
        }
        let sort_fields = sort_key
            .columns()
            .iter()
            .map(|key| {
                let field = schema.fields().get(key.column).ok_or_else(|| {
                    MergeError::Config(format!(
                        "sort column {} out of range for schema with {} fields",
                        key.column,
                        schema.fields().len()
                    ))
                })?;
                Ok(SortField::new_with_options(field.data_type().clone(), key.options))
            })
            .collect::<Result<Vec<_>>>()?;

        if !RowConverter::supports_fields(&sort_fields) {
            let types = sort_key
                .columns()
                .iter()
                .map(|key| schema.field(key.column).data_type().to_string())
                .collect::<Vec<_>>();
            return Err(MergeError::Config(format!(
                "unsupported sort column type in [{}]",
                types.join(", ")
            )));
        }

        let converter = RowConverter::new(sort_fields)?;
        Ok(Self { sort_key, converter })
    }

    pub fn sort_key(&self) -> &SortKey {
        &self.sort_key
    }

    /// Orders `left[left_row]` against `right[right_row]`.
    ///
    /// Key columns are compared in order and the first non-equal one
    /// decides.
    pub fn compare(
        &self,
        left: &RecordBatch,
        left_row: usize,
        right: &RecordBatch,
        right_row: usize,
    ) -> Result<Ordering> {
        for key in self.sort_key.columns() {
            let cmp = make_comparator(
                left.column(key.column).as_ref(),
                right.column(key.column).as_ref(),
                key.options,
            )?;
            match cmp(left_row, right_row) {
                Ordering::Equal => continue,
                ordering => return Ok(ordering),
            }
        }
        Ok(Ordering::Equal)
    }

    /// Encodes the key columns of `page` into comparable rows.
    pub fn convert(&self, page: &RecordBatch) -> Result<Rows> {
        let columns = self
            .sort_key
            .columns()
            .iter()
            .map(|key| page.column(key.column).clone())
            .collect::<Vec<ArrayRef>>();
        Ok(self.converter.convert_columns(&columns)?)
    }
}
