// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Entry points to run a pipeline and consume its results.

use crate::config::PipelineConfig;
use crate::core::{BoxedSource, Flag, Lifecycle, Producer, ResultCursor, Shared, Worker};
use crate::error::Result;
use crate::macros::{log_debug, log_error};
use crate::transform::Transform;
use std::marker::PhantomData;
use std::sync::Arc;

/// A pipeline that hasn't started yet, created by
/// [`PipelineBuilder::build()`](crate::PipelineBuilder::build).
///
/// Nothing happens until [`start()`](Self::start) is called, which consumes
/// the pipeline: to run the same processing again, build a new pipeline.
#[must_use = "pipelines are lazy and do nothing unless started"]
pub struct Pipeline<Input, Output, T> {
    config: PipelineConfig,
    source: BoxedSource<Input>,
    transform: T,
    _phantom: PhantomData<fn() -> Output>,
}

impl<Input, Output, T> Pipeline<Input, Output, T>
where
    Input: Send + 'static,
    Output: Send + 'static,
    T: Transform<Input, Output> + Send + 'static,
{
    /// Creates a lazy pipeline.
    pub(crate) fn new(config: PipelineConfig, source: BoxedSource<Input>, transform: T) -> Self {
        Self {
            config,
            source,
            transform,
            _phantom: PhantomData,
        }
    }

    /// Spawns the producer thread and the worker threads, and returns the
    /// stream of their results.
    ///
    /// ```
    /// # use blockpipe::{map, PipelineBuilder, ThreadCount};
    /// let builder = PipelineBuilder {
    ///     thread_count: ThreadCount::try_from(3).unwrap(),
    ///     ..PipelineBuilder::default()
    /// };
    /// let mut results = builder
    ///     .build(0..10_000u64, map(|x: u64| x % 7))
    ///     .unwrap()
    ///     .start()
    ///     .unwrap();
    ///
    /// let mut count = 0;
    /// while results.has_next().unwrap() {
    ///     assert!(results.next_item().unwrap() < 7);
    ///     count += 1;
    /// }
    /// results.release().unwrap();
    /// assert_eq!(count, 10_000);
    /// ```
    pub fn start(self) -> Result<ResultStream<Input, Output>> {
        let config = self.config;
        let shared = Arc::new(Shared::new(&config));
        let mut lifecycle = Lifecycle::new(shared.aborted.clone(), config.shutdown_grace);

        let producer = Producer::new(self.source, config.block_size, shared.clone());
        let transform = Arc::new(self.transform);
        let spawned = lifecycle
            .spawn("blockpipe-producer".into(), move || producer.run())
            .and_then(|()| {
                (0..config.num_workers).try_for_each(|id| {
                    let worker = Worker::new(id, transform.clone(), shared.clone(), &config);
                    lifecycle.spawn(format!("blockpipe-worker-{id}"), move || worker.run())
                })
            });

        if let Err(e) = spawned {
            log_error!("[main thread] Failed to start the pipeline: {e}");
            // The threads spawned so far observe the abort and exit.
            if let Err(_release) = lifecycle.release() {
                log_error!("[main thread] Failed to release a partial pipeline: {_release}");
            }
            return Err(e);
        }
        log_debug!(
            "[main thread] Started a pipeline with {} worker(s).",
            config.num_workers
        );

        Ok(ResultStream {
            cursor: ResultCursor::new(shared),
            lifecycle,
        })
    }
}

/// Handle to abort a running pipeline from any thread.
#[derive(Clone)]
pub struct AbortHandle {
    aborted: Arc<Flag>,
}

impl AbortHandle {
    /// Requests the pipeline to stop. The result stream reports exhaustion
    /// from its next call on. Calling this several times has no further
    /// effect.
    pub fn abort(&self) {
        self.aborted.set();
    }

    /// Returns true if the pipeline was aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_set()
    }
}

/// Results of a running pipeline.
///
/// This is an [`Iterator`] over the successfully transformed items, in no
/// particular order across blocks. If a stage of the pipeline breaks, the
/// iterator yields the error once and then ends.
///
/// The pipeline threads are stopped by [`release()`](Self::release), which
/// should be called once the caller is done with the results, whether they
/// were fully consumed or abandoned. Dropping the stream releases it too, but
/// then a shutdown failure can only be logged.
#[must_use = "result streams must be iterated and released"]
pub struct ResultStream<Input, Output> {
    cursor: ResultCursor<Input, Output>,
    lifecycle: Lifecycle,
}

impl<Input, Output> ResultStream<Input, Output> {
    /// Returns whether another item is available, waiting for the pipeline if
    /// needed.
    pub fn has_next(&mut self) -> Result<bool> {
        self.cursor.has_next()
    }

    /// Returns the next item, waiting for the pipeline if needed.
    ///
    /// Fails with [`PipelineError::NoSuchElement`](crate::PipelineError::NoSuchElement)
    /// if no item is available, which should have been checked with
    /// [`has_next()`](Self::has_next).
    pub fn next_item(&mut self) -> Result<Output> {
        self.cursor.next_item()
    }

    /// Requests the pipeline to stop early. Pending results are discarded.
    pub fn abort(&self) {
        self.lifecycle.abort();
    }

    /// Returns true if the pipeline was aborted, explicitly or after a stage
    /// failure.
    pub fn is_aborted(&self) -> bool {
        self.lifecycle.is_aborted()
    }

    /// Returns a handle to abort the pipeline from another thread.
    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle {
            aborted: self.lifecycle.abort_flag(),
        }
    }

    /// Number of pipeline threads still running. Threads that a timed-out
    /// [`release()`](Self::release) had to leave behind are counted until they
    /// finish.
    pub fn active_tasks(&self) -> usize {
        self.lifecycle.active_tasks()
    }

    /// Stops the pipeline threads and waits for them to terminate, up to the
    /// configured grace period.
    ///
    /// Fails with [`PipelineError::ShutdownTimeout`](crate::PipelineError::ShutdownTimeout)
    /// if some threads are still running after that, typically because a
    /// transform doesn't return. Once released, the stream is exhausted, and
    /// releasing it again does nothing.
    pub fn release(&mut self) -> Result<()> {
        self.lifecycle.release()
    }
}

impl<Input, Output> Iterator for ResultStream<Input, Output> {
    type Item = Result<Output>;

    fn next(&mut self) -> Option<Self::Item> {
        self.cursor.next()
    }
}
