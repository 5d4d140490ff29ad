// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Readiness handles for cooperative scheduling.

use std::fmt::{Debug, Formatter};
use std::future::Future;
use std::pin::Pin;
use std::sync::LazyLock;
use std::task::{Context, Poll};

use futures::channel::oneshot;
use futures::future::{BoxFuture, FutureExt, Shared, join_all};

static NOT_BLOCKED: LazyLock<Readiness> =
    LazyLock::new(|| Readiness(futures::future::ready(()).boxed().shared()));

/// A cloneable signal that some pending asynchronous work has completed.
///
/// Awaiting never yields an error: a failed or abandoned producer resolves
/// the handle as well, and the failure is reported by the next poll of the
/// underlying resource. Dropping every clone cancels the wait.
#[derive(Clone)]
pub struct Readiness(Shared<BoxFuture<'static, ()>>);

impl Readiness {
    /// An already resolved handle. Shared, so it never allocates.
    pub fn ready() -> Self {
        NOT_BLOCKED.clone()
    }

    pub fn from_future(future: impl Future<Output = ()> + Send + 'static) -> Self {
        Readiness(future.boxed().shared())
    }

    /// A handle resolved through the returned setter, or when the setter is
    /// dropped.
    pub fn settable() -> (ReadinessSetter, Readiness) {
        let (tx, rx) = oneshot::channel::<()>();
        (ReadinessSetter(Some(tx)), Readiness::from_future(rx.map(|_| ())))
    }

    /// Resolves once every handle has resolved.
    pub fn all(handles: impl IntoIterator<Item = Readiness>) -> Self {
        Readiness::from_future(join_all(handles).map(|_| ()))
    }

    /// Checks completion without blocking.
    pub fn is_ready(&self) -> bool {
        self.0.peek().is_some() || self.0.clone().now_or_never().is_some()
    }
}

impl Future for Readiness {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        self.0.poll_unpin(cx)
    }
}

impl Debug for Readiness {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Readiness")
            .field("ready", &self.is_ready())
            .finish()
    }
}

/// Producer side of [`Readiness::settable`].
#[derive(Debug)]
pub struct ReadinessSetter(Option<oneshot::Sender<()>>);

impl ReadinessSetter {
    /// Resolves the paired handle. Later calls are no-ops.
    pub fn set(&mut self) {
        if let Some(tx) = self.0.take() {
            // the receiver may already be gone, which is fine
            let _ = tx.send(());
        }
    }

    pub fn is_set(&self) -> bool {
        self.0.is_none()
    }
}
