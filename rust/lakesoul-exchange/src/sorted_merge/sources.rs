// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

use smallvec::SmallVec;

use super::source::SourceCursor;
use crate::exchange::Readiness;
use crate::{MergeError, Result};

type PendingSet = SmallVec<[usize; 8]>;

/// All cursors of one merge, in registration order.
///
/// The position of a cursor in the set is its source index and breaks ties
/// between equal rows.
#[derive(Debug, Default)]
pub struct SourceSet {
    cursors: Vec<SourceCursor>,
    /// Combined handle for the cursors that were pending when it was built
    blocked: Option<(PendingSet, Readiness)>,
}

impl SourceSet {
    pub fn new(cursors: Vec<SourceCursor>) -> Self {
        Self {
            cursors,
            blocked: None,
        }
    }

    pub fn len(&self) -> usize {
        self.cursors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cursors.is_empty()
    }

    pub fn cursors(&self) -> &[SourceCursor] {
        &self.cursors
    }

    pub fn cursors_mut(&mut self) -> &mut [SourceCursor] {
        &mut self.cursors
    }

    fn pending(&mut self) -> PendingSet {
        self.cursors
            .iter_mut()
            .enumerate()
            .filter_map(|(i, cursor)| (!cursor.is_ready()).then_some(i))
            .collect()
    }

    /// True once every cursor has a row buffered or is exhausted.
    pub fn all_ready(&mut self) -> bool {
        self.cursors.iter_mut().all(SourceCursor::is_ready)
    }

    /// Resolves once every cursor that is currently pending becomes ready.
    ///
    /// Repeated calls return the same handle while the pending set is
    /// unchanged and the handle has not resolved yet.
    pub fn readiness(&mut self) -> Readiness {
        let pending = self.pending();
        if pending.is_empty() {
            self.blocked = None;
            return Readiness::ready();
        }
        if let Some((cached, handle)) = &self.blocked {
            if *cached == pending && !handle.is_ready() {
                return handle.clone();
            }
        }
        let handle = Readiness::all(pending.iter().map(|&i| self.cursors[i].readiness()));
        self.blocked = Some((pending, handle.clone()));
        handle
    }

    pub fn all_exhausted(&self) -> bool {
        self.cursors.iter().all(SourceCursor::is_exhausted)
    }

    pub fn pages_received(&self) -> u64 {
        self.cursors.iter().map(SourceCursor::pages_received).sum()
    }

    pub fn rows_received(&self) -> u64 {
        self.cursors.iter().map(SourceCursor::rows_received).sum()
    }

    /// Bytes fetched by the transports and not yet handed to the cursors.
    pub fn buffered_bytes(&self) -> usize {
        self.cursors.iter().map(SourceCursor::buffered_bytes).sum()
    }

    /// Closes every cursor even if some fail, then reports all failures.
    pub fn close(&mut self) -> Result<()> {
        self.blocked = None;
        let errors = self
            .cursors
            .iter_mut()
            .filter_map(|cursor| {
                cursor.close().err().inspect(|e| {
                    warn!("failed to close source[{}] {}: {e}", cursor.index(), cursor.location());
                })
            })
            .collect::<Vec<_>>();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(MergeError::Close(errors))
        }
    }
}

impl Drop for SourceSet {
    fn drop(&mut self) {
        for cursor in self.cursors.iter_mut().filter(|cursor| !cursor.is_closed()) {
            if let Err(e) = cursor.close() {
                warn!("failed to close source[{}] {} on drop: {e}", cursor.index(), cursor.location());
            }
        }
    }
}
