// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Errors reported by a pipeline.
//!
//! Failures of individual items inside a [`Transform`](crate::Transform) are
//! never reported here: they are logged and the item is skipped. A
//! [`PipelineError`] always means that the pipeline itself broke, that it was
//! misconfigured, or that the caller violated the iteration contract.

use std::time::Duration;
use thiserror::Error;

/// Result type used throughout this crate.
pub type Result<T, E = PipelineError> = std::result::Result<T, E>;

/// An error that crossed the pipeline boundary.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PipelineError {
    /// The [`PipelineBuilder`](crate::PipelineBuilder) was rejected.
    #[error("invalid pipeline configuration: `{field}` {reason}")]
    InvalidConfig {
        /// Name of the offending builder field.
        field: &'static str,
        /// Human-readable constraint that was violated.
        reason: &'static str,
    },
    /// A pipeline thread could not be spawned.
    #[error("failed to spawn a pipeline thread: {0}")]
    Spawn(String),
    /// Reading the source sequence failed on the producer thread.
    #[error("the source sequence failed: {0}")]
    Source(String),
    /// A worker thread failed outside of item transforms.
    #[error("worker thread #{id} failed: {reason}")]
    Worker {
        /// Index of the worker thread.
        id: usize,
        /// Description of the failure.
        reason: String,
    },
    /// A channel between two stages was disconnected.
    #[error("the {0} channel was disconnected")]
    ChannelClosed(&'static str),
    /// Background threads didn't terminate within the grace period when the
    /// pipeline was released. These threads are leaked.
    #[error("{remaining} pipeline thread(s) did not terminate within {grace:?}")]
    ShutdownTimeout {
        /// Number of threads still running.
        remaining: usize,
        /// Grace period that elapsed.
        grace: Duration,
    },
    /// [`next_item()`](crate::ResultStream::next_item) was called while no
    /// item was available.
    #[error("no further item is available in this result stream")]
    NoSuchElement,
}

impl PipelineError {
    /// Returns true if this error means that a stage of the pipeline broke
    /// while running (as opposed to a configuration or usage error).
    pub fn is_stage_failure(&self) -> bool {
        matches!(
            self,
            PipelineError::Source(_) | PipelineError::Worker { .. } | PipelineError::ChannelClosed(_)
        )
    }
}
