// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

//! An in-process exchange: producers push serialized pages into a buffer
//! keyed by location, and [`LocalExchangeClient`]s drain them.

use std::collections::{HashMap, VecDeque};
use std::mem;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use url::Url;

use super::{ExchangeClient, ExchangeClientSupplier, PagesSerde, Readiness, ReadinessSetter, SerializedPage};
use crate::{MergeError, Result};

#[derive(Debug, Default)]
struct PageBuffer {
    pages: VecDeque<SerializedPage>,
    buffered_bytes: usize,
    no_more_pages: bool,
    failure: Option<String>,
    consumer_closed: bool,
    waiters: Vec<ReadinessSetter>,
}

impl PageBuffer {
    fn has_result(&self) -> bool {
        !self.pages.is_empty() || self.no_more_pages || self.failure.is_some() || self.consumer_closed
    }

    fn take_waiters(&mut self) -> Vec<ReadinessSetter> {
        mem::take(&mut self.waiters)
    }
}

type SharedBuffer = Arc<Mutex<PageBuffer>>;

fn notify(waiters: Vec<ReadinessSetter>) {
    for mut waiter in waiters {
        waiter.set();
    }
}

/// Registry of page buffers, one per location.
///
/// Buffers are created on first use by either side, so a producer may start
/// before or after the consuming client is bound to its location.
#[derive(Debug, Clone, Default)]
pub struct LocalExchange {
    buffers: Arc<Mutex<HashMap<Url, SharedBuffer>>>,
}

impl LocalExchange {
    pub fn new() -> Self {
        Self::default()
    }

    fn buffer(&self, location: &Url) -> SharedBuffer {
        self.buffers
            .lock()
            .entry(location.clone())
            .or_default()
            .clone()
    }

    /// Returns the producing side of the buffer for `location`.
    pub fn producer(&self, location: &Url) -> PageProducer {
        PageProducer {
            location: location.clone(),
            buffer: self.buffer(location),
        }
    }

    /// Returns a supplier creating clients bound to this exchange.
    pub fn client_supplier(&self) -> ExchangeClientSupplier {
        let exchange = self.clone();
        Arc::new(move || Box::new(LocalExchangeClient::new(exchange.clone())) as Box<dyn ExchangeClient>)
    }

    /// Bytes currently buffered for `location` and not yet polled.
    pub fn buffered_bytes(&self, location: &Url) -> usize {
        self.buffers
            .lock()
            .get(location)
            .map_or(0, |buffer| buffer.lock().buffered_bytes)
    }
}

/// Producing side of one location's buffer.
#[derive(Debug, Clone)]
pub struct PageProducer {
    location: Url,
    buffer: SharedBuffer,
}

impl PageProducer {
    pub fn location(&self) -> &Url {
        &self.location
    }

    pub fn push(&self, page: SerializedPage) -> Result<()> {
        let waiters = {
            let mut buffer = self.buffer.lock();
            if buffer.no_more_pages {
                return Err(MergeError::ContractViolation(format!(
                    "page pushed to {} after finish",
                    self.location
                )));
            }
            if buffer.consumer_closed {
                debug!("dropping page for closed consumer of {}", self.location);
                return Ok(());
            }
            buffer.buffered_bytes += page.size_in_bytes();
            buffer.pages.push_back(page);
            buffer.take_waiters()
        };
        notify(waiters);
        Ok(())
    }

    pub fn push_batch(&self, batch: &RecordBatch, serde: &dyn PagesSerde) -> Result<()> {
        self.push(serde.serialize(batch)?)
    }

    /// Marks the end of the stream.
    pub fn finish(&self) {
        let waiters = {
            let mut buffer = self.buffer.lock();
            buffer.no_more_pages = true;
            buffer.take_waiters()
        };
        notify(waiters);
    }

    /// Fails the stream; the consumer sees the failure on its next poll.
    pub fn fail(&self, message: impl Into<String>) {
        let waiters = {
            let mut buffer = self.buffer.lock();
            buffer.failure = Some(message.into());
            buffer.take_waiters()
        };
        notify(waiters);
    }
}

/// Client reading a single location from a [`LocalExchange`].
#[derive(Debug)]
pub struct LocalExchangeClient {
    exchange: LocalExchange,
    location: Option<Url>,
    buffer: Option<SharedBuffer>,
    no_more_locations: bool,
    closed: bool,
}

impl LocalExchangeClient {
    pub fn new(exchange: LocalExchange) -> Self {
        Self {
            exchange,
            location: None,
            buffer: None,
            no_more_locations: false,
            closed: false,
        }
    }
}

impl ExchangeClient for LocalExchangeClient {
    fn add_location(&mut self, location: &Url) -> Result<()> {
        if self.no_more_locations {
            return Err(MergeError::ContractViolation(format!(
                "location {location} added after no_more_locations"
            )));
        }
        if let Some(bound) = &self.location {
            return Err(MergeError::ContractViolation(format!(
                "local exchange client already bound to {bound}, cannot add {location}"
            )));
        }
        self.buffer = Some(self.exchange.buffer(location));
        self.location = Some(location.clone());
        Ok(())
    }

    fn no_more_locations(&mut self) {
        self.no_more_locations = true;
    }

    fn is_blocked(&mut self) -> Readiness {
        let Some(buffer) = &self.buffer else {
            return Readiness::ready();
        };
        if self.closed {
            return Readiness::ready();
        }
        let mut buffer = buffer.lock();
        if buffer.has_result() {
            return Readiness::ready();
        }
        let (setter, handle) = Readiness::settable();
        buffer.waiters.push(setter);
        handle
    }

    fn is_finished(&self) -> bool {
        if self.closed {
            return true;
        }
        match &self.buffer {
            Some(buffer) => {
                let buffer = buffer.lock();
                buffer.no_more_pages && buffer.pages.is_empty() && buffer.failure.is_none()
            }
            None => self.no_more_locations,
        }
    }

    fn poll_page(&mut self) -> Result<Option<SerializedPage>> {
        if self.closed {
            return Ok(None);
        }
        let (Some(buffer), Some(location)) = (&self.buffer, &self.location) else {
            return Err(MergeError::ContractViolation(
                "poll_page called before a location was added".into(),
            ));
        };
        let mut buffer = buffer.lock();
        if let Some(message) = &buffer.failure {
            return Err(MergeError::transport(location, message.clone()));
        }
        let page = buffer.pages.pop_front();
        if let Some(page) = &page {
            buffer.buffered_bytes -= page.size_in_bytes();
        }
        Ok(page)
    }

    fn buffered_bytes(&self) -> usize {
        self.buffer.as_ref().map_or(0, |buffer| buffer.lock().buffered_bytes)
    }

    fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(buffer) = self.buffer.take() {
            let waiters = {
                let mut buffer = buffer.lock();
                buffer.consumer_closed = true;
                buffer.pages.clear();
                buffer.buffered_bytes = 0;
                buffer.take_waiters()
            };
            notify(waiters);
        }
        Ok(())
    }
}
