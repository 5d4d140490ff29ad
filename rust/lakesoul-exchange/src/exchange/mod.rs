// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Collaborators of the merge that live on the transport side.
//!
//! - `codec`: conversion between serialized pages and record batches.
//! - `local`: an in-process exchange buffer, one buffer per location.
//! - `readiness`: awaitable handles signalling that pending work completed.

use std::fmt::Debug;
use std::sync::Arc;

use bytes::Bytes;
use url::Url;

use crate::Result;

pub mod codec;
pub mod local;
pub mod readiness;

pub use codec::{ArrowIpcSerde, PagesSerde};
pub use local::{LocalExchange, LocalExchangeClient, PageProducer};
pub use readiness::{Readiness, ReadinessSetter};

/// An opaque page as fetched from a remote producer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SerializedPage {
    data: Bytes,
    row_count: usize,
}

impl SerializedPage {
    pub fn new(data: impl Into<Bytes>, row_count: usize) -> Self {
        Self {
            data: data.into(),
            row_count,
        }
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    /// Row count declared by the producer.
    pub fn row_count(&self) -> usize {
        self.row_count
    }

    pub fn size_in_bytes(&self) -> usize {
        self.data.len()
    }
}

/// Fetches serialized pages from one remote location.
///
/// All methods are non-blocking. `poll_page` must only be called once the
/// handle returned by `is_blocked` has resolved.
pub trait ExchangeClient: Send + Debug {
    fn add_location(&mut self, location: &Url) -> Result<()>;

    fn no_more_locations(&mut self);

    /// Resolves when a page, the end of the stream, or a failure is available.
    fn is_blocked(&mut self) -> Readiness;

    /// Whether every location is drained.
    fn is_finished(&self) -> bool;

    /// `Ok(None)` with `is_finished()` marks the end of the stream.
    fn poll_page(&mut self) -> Result<Option<SerializedPage>>;

    /// Bytes fetched and waiting to be polled.
    fn buffered_bytes(&self) -> usize {
        0
    }

    fn close(&mut self) -> Result<()>;
}

/// Creates one [`ExchangeClient`] per source location.
pub type ExchangeClientSupplier = Arc<dyn Fn() -> Box<dyn ExchangeClient> + Send + Sync>;
