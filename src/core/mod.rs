// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Core engine: producer, workers, result cursor and the synchronization
//! primitives shared between them.

mod channel;
mod cursor;
mod lifecycle;
mod producer;
mod sync;
mod util;
mod worker;

pub use channel::{Block, BoundedChannel};
pub use cursor::ResultCursor;
pub use lifecycle::Lifecycle;
pub use producer::Producer;
pub use sync::{CountDown, Flag};
pub use worker::Worker;

use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::macros::log_debug;
use std::sync::{Arc, OnceLock};

/// Source sequence as consumed by the producer thread. An `Err` item is a
/// failure to read the source.
pub type BoxedSource<Input> = Box<dyn Iterator<Item = Result<Input, String>> + Send>;

/// State shared between the producer, the workers and the result cursor.
///
/// Each field is written by exactly one role: the producer writes blocks to
/// `work` and sets `done_producing`, the workers read `work`, write to
/// `results` and count down `active_workers`, and the cursor reads `results`.
/// The abort flag and the failure slot can be written by anyone, but only
/// ever transition once.
pub struct Shared<Input, Output> {
    /// Blocks of inputs waiting for a worker.
    pub work: BoundedChannel<Block<Input>>,
    /// Blocks of outputs waiting for the cursor.
    pub results: BoundedChannel<Block<Output>>,
    /// Set once the producer has stopped enqueuing blocks.
    pub done_producing: Flag,
    /// Set when the pipeline must stop as soon as possible.
    pub aborted: Arc<Flag>,
    /// Number of workers that haven't exited yet.
    pub active_workers: CountDown,
    /// First stage failure, if any.
    failure: OnceLock<PipelineError>,
}

impl<Input, Output> Shared<Input, Output> {
    /// Creates the channels and flags of a pipeline that isn't running yet.
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            work: BoundedChannel::new("work", config.queue_capacity, config.worker_poll_interval),
            results: BoundedChannel::new(
                "result",
                config.queue_capacity,
                config.worker_poll_interval,
            ),
            done_producing: Flag::new(),
            aborted: Arc::new(Flag::new()),
            active_workers: CountDown::new(config.num_workers),
            failure: OnceLock::new(),
        }
    }

    /// Records a stage failure and aborts the pipeline. Only the first failure
    /// is kept.
    pub fn fail(&self, error: PipelineError) {
        log_debug!("Pipeline stage failed: {error}");
        if let Err(_dropped) = self.failure.set(error) {
            log_debug!("A failure was already recorded, ignoring: {_dropped}");
        }
        self.aborted.set();
    }

    /// Returns the first recorded stage failure.
    pub fn failure(&self) -> Option<&PipelineError> {
        self.failure.get()
    }

    /// Returns true once every produced block has been transformed and
    /// handed to the cursor.
    ///
    /// The order of the checks matters: a worker only exits after it saw the
    /// producer done *before* finding the work channel empty, and its last
    /// result block is pushed before it counts down. So once no worker is
    /// active, both channels can only shrink.
    pub fn is_drained(&self) -> bool {
        self.done_producing.is_set()
            && self.active_workers.count() == 0
            && self.work.is_empty()
            && self.results.is_empty()
    }
}
