// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

use std::pin::Pin;
use std::task::{Context, Poll};

use arrow::record_batch::RecordBatch;
use futures::{FutureExt, Stream};

use crate::Result;
use crate::exchange::Readiness;
use crate::operator::SourceOperator;

/// Drives a [`SourceOperator`] as a stream of output pages.
///
/// Each poll awaits the operator's readiness before pulling, the way a
/// cooperative driver would. The operator is closed once it finishes; a
/// failing close is yielded as the last item.
pub struct MergeStream<O> {
    operator: O,
    blocked: Option<Readiness>,
    aborted: bool,
}

impl<O: SourceOperator + Unpin> MergeStream<O> {
    /// `operator` must already have received `no_more_splits`.
    pub fn new(operator: O) -> Self {
        Self {
            operator,
            blocked: None,
            aborted: false,
        }
    }

    pub fn operator(&self) -> &O {
        &self.operator
    }

    pub fn into_inner(self) -> O {
        self.operator
    }

    fn poll_next_inner(&mut self, cx: &mut Context<'_>) -> Poll<Option<Result<RecordBatch>>> {
        loop {
            if self.aborted {
                debug!("merge stream aborted");
                return Poll::Ready(None);
            }
            if self.operator.is_finished() {
                self.aborted = true;
                return match self.operator.close() {
                    Ok(()) => Poll::Ready(None),
                    Err(e) => Poll::Ready(Some(Err(e))),
                };
            }

            let mut blocked = self.blocked.take().unwrap_or_else(|| self.operator.readiness());
            if blocked.poll_unpin(cx).is_pending() {
                self.blocked = Some(blocked);
                return Poll::Pending;
            }

            match self.operator.pull() {
                Ok(Some(batch)) => return Poll::Ready(Some(Ok(batch))),
                Ok(None) => continue,
                Err(e) => {
                    error!("{e}");
                    self.aborted = true;
                    return Poll::Ready(Some(Err(e)));
                }
            }
        }
    }
}

impl<O: SourceOperator + Unpin> Stream for MergeStream<O> {
    type Item = Result<RecordBatch>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().poll_next_inner(cx)
    }
}
