// SPDX-FileCopyrightText: 2023 LakeSoul Contributors
//
// SPDX-License-Identifier: Apache-2.0

//! Sorted merge over remote exchange sources.
//!
//! The [`sorted_merge::MergeOperator`] combines pre-sorted pages arriving
//! asynchronously from several remote producers into one globally sorted
//! stream of pages. It is driven cooperatively: a caller awaits
//! [`operator::SourceOperator::readiness`] and then calls
//! [`operator::SourceOperator::pull`].

#[macro_use]
extern crate tracing;

pub mod config;
pub mod error;
pub mod exchange;
pub mod operator;
pub mod sorted_merge;

pub use error::{MergeError, Result};

pub use arrow;
