// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Configuration of a pipeline.

use crate::core::BoxedSource;
use crate::error::{PipelineError, Result};
use crate::pipeline::Pipeline;
use crate::transform::Transform;
use std::convert::{Infallible, TryFrom};
use std::fmt::Display;
use std::num::NonZeroUsize;
use std::time::Duration;

/// Number of threads to spawn for a pipeline, including the producer thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadCount {
    /// Spawn one worker thread per CPU returned by
    /// [`std::thread::available_parallelism()`], plus the producer thread.
    AvailableParallelism,
    /// Spawn the given number of threads. One of them is the producer, so this
    /// must be at least 2.
    Count(NonZeroUsize),
}

impl ThreadCount {
    /// Resolves the total number of threads to spawn.
    pub fn count(self) -> usize {
        match self {
            ThreadCount::AvailableParallelism => {
                std::thread::available_parallelism().map_or(1, NonZeroUsize::get) + 1
            }
            ThreadCount::Count(count) => count.get(),
        }
    }
}

impl TryFrom<usize> for ThreadCount {
    type Error = <NonZeroUsize as TryFrom<usize>>::Error;

    fn try_from(thread_count: usize) -> Result<Self, Self::Error> {
        let count = NonZeroUsize::try_from(thread_count)?;
        Ok(ThreadCount::Count(count))
    }
}

/// What happens to blocks that workers are holding when the pipeline is
/// aborted or released.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ShutdownPolicy {
    /// Workers finish transforming the block they hold before observing the
    /// abort.
    #[default]
    Drain,
    /// Workers check for an abort between items and drop the rest of their
    /// block.
    Cancel,
}

/// Policy to pin worker threads to CPUs.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CpuPinningPolicy {
    /// Don't pin worker threads to CPUs.
    #[default]
    No,
    /// Pin each worker thread to a CPU, if CPU pinning is supported and
    /// implemented on this platform.
    IfSupported,
    /// Pin each worker thread to a CPU. If CPU pinning isn't supported on this
    /// platform (or not implemented), building a pipeline fails.
    Always,
}

/// A builder for [`Pipeline`].
///
/// ```
/// # use blockpipe::{PipelineBuilder, ThreadCount};
/// let builder = PipelineBuilder {
///     block_size: 100,
///     thread_count: ThreadCount::try_from(4).unwrap(),
///     queue_capacity: 8,
///     ..PipelineBuilder::default()
/// };
///
/// let pipeline = builder
///     .build(0..1_000u64, |x: u64| Ok::<_, String>(Some(x * 2)))
///     .unwrap();
/// let mut results = pipeline.start().unwrap();
/// let sum: u64 = results.by_ref().map(|x| x.unwrap()).sum();
/// results.release().unwrap();
/// assert_eq!(sum, 999 * 1_000);
/// ```
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineBuilder {
    /// Number of items grouped into one block. Larger blocks mean less
    /// contention on the channels.
    pub block_size: usize,
    /// Number of threads, including the producer thread.
    pub thread_count: ThreadCount,
    /// Number of blocks that each of the work and result channels can hold.
    pub queue_capacity: usize,
    /// Handling of in-flight blocks on abort.
    pub shutdown: ShutdownPolicy,
    /// How long [`release()`](crate::ResultStream::release) waits for the
    /// pipeline threads to terminate.
    pub shutdown_grace: Duration,
    /// How long an idle worker waits for a block before re-checking whether
    /// the pipeline is finished.
    pub worker_poll_interval: Duration,
    /// Policy to pin worker threads to CPUs.
    pub cpu_pinning: CpuPinningPolicy,
}

impl Default for PipelineBuilder {
    fn default() -> Self {
        Self {
            block_size: 1000,
            thread_count: ThreadCount::AvailableParallelism,
            queue_capacity: 100,
            shutdown: ShutdownPolicy::Drain,
            shutdown_grace: Duration::from_secs(1),
            worker_poll_interval: Duration::from_millis(20),
            cpu_pinning: CpuPinningPolicy::No,
        }
    }
}

impl PipelineBuilder {
    /// Creates a lazy pipeline that transforms every item of the `source`
    /// with the `transform`. No thread is spawned until
    /// [`Pipeline::start()`] is called.
    pub fn build<Source, Input, Output, T>(
        &self,
        source: Source,
        transform: T,
    ) -> Result<Pipeline<Input, Output, T>>
    where
        Source: IntoIterator<Item = Input>,
        Source::IntoIter: Send + 'static,
        Input: Send + 'static,
        Output: Send + 'static,
        T: Transform<Input, Output> + Send + 'static,
    {
        self.build_fallible(source.into_iter().map(Ok::<Input, Infallible>), transform)
    }

    /// Same as [`build()`](Self::build), for a source whose items may fail.
    /// The first `Err` item stops the producer and is reported as
    /// [`PipelineError::Source`] by the result stream.
    pub fn build_fallible<Source, Input, Output, E, T>(
        &self,
        source: Source,
        transform: T,
    ) -> Result<Pipeline<Input, Output, T>>
    where
        Source: IntoIterator<Item = std::result::Result<Input, E>>,
        Source::IntoIter: Send + 'static,
        E: Display + 'static,
        Input: Send + 'static,
        Output: Send + 'static,
        T: Transform<Input, Output> + Send + 'static,
    {
        let config = self.validate()?;
        let source: BoxedSource<Input> =
            Box::new(source.into_iter().map(describe_error::<Input, E>));
        Ok(Pipeline::new(config, source, transform))
    }

    /// Checks the constraints of each field and resolves the thread count.
    pub(crate) fn validate(&self) -> Result<PipelineConfig> {
        if self.block_size == 0 {
            return Err(PipelineError::InvalidConfig {
                field: "block_size",
                reason: "must be positive",
            });
        }
        if self.queue_capacity == 0 {
            return Err(PipelineError::InvalidConfig {
                field: "queue_capacity",
                reason: "must be positive",
            });
        }
        if self.worker_poll_interval.is_zero() {
            return Err(PipelineError::InvalidConfig {
                field: "worker_poll_interval",
                reason: "must be positive",
            });
        }
        let thread_count = self.thread_count.count();
        if thread_count < 2 {
            return Err(PipelineError::InvalidConfig {
                field: "thread_count",
                reason: "must be at least 2, as one thread is the producer",
            });
        }
        #[cfg(any(
            miri,
            not(any(
                target_os = "android",
                target_os = "dragonfly",
                target_os = "freebsd",
                target_os = "linux"
            ))
        ))]
        if self.cpu_pinning == CpuPinningPolicy::Always {
            return Err(PipelineError::InvalidConfig {
                field: "cpu_pinning",
                reason: "cannot pin threads to CPUs on this platform",
            });
        }

        Ok(PipelineConfig {
            block_size: self.block_size,
            num_workers: thread_count - 1,
            queue_capacity: self.queue_capacity,
            shutdown: self.shutdown,
            shutdown_grace: self.shutdown_grace,
            worker_poll_interval: self.worker_poll_interval,
            cpu_pinning: self.cpu_pinning,
        })
    }
}

/// Converts the error of a source item into its description.
fn describe_error<Input, E: Display>(item: std::result::Result<Input, E>) -> Result<Input, String> {
    item.map_err(|e| e.to_string())
}

/// Validated configuration, as consumed by the pipeline stages.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PipelineConfig {
    pub block_size: usize,
    pub num_workers: usize,
    pub queue_capacity: usize,
    pub shutdown: ShutdownPolicy,
    pub shutdown_grace: Duration,
    pub worker_poll_interval: Duration,
    pub cpu_pinning: CpuPinningPolicy,
}
