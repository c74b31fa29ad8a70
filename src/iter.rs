// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Iterator adaptors to start pipelines more conveniently.

use crate::config::PipelineBuilder;
use crate::error::Result;
use crate::pipeline::ResultStream;
use crate::transform::Transform;

/// Builds and starts a pipeline in one call.
///
/// ```
/// # use blockpipe::{process_concurrently, PipelineBuilder};
/// let lines = vec!["1", "2", "x", "", "5"];
/// let mut results = process_concurrently(
///     lines,
///     |line: &str| {
///         if line.is_empty() {
///             Ok(None)
///         } else {
///             line.parse::<u32>().map(Some)
///         }
///     },
///     &PipelineBuilder::default(),
/// )
/// .unwrap();
///
/// // The line "x" fails to parse and is skipped, the empty line is dropped.
/// let sum: u32 = results.by_ref().map(|x| x.unwrap()).sum();
/// results.release().unwrap();
/// assert_eq!(sum, 8);
/// ```
pub fn process_concurrently<Source, Output, T>(
    source: Source,
    transform: T,
    builder: &PipelineBuilder,
) -> Result<ResultStream<Source::Item, Output>>
where
    Source: IntoIterator,
    Source::IntoIter: Send + 'static,
    Source::Item: Send + 'static,
    Output: Send + 'static,
    T: Transform<Source::Item, Output> + Send + 'static,
{
    builder.build(source, transform)?.start()
}

/// Extension trait to process any iterator concurrently.
///
/// ```
/// # use blockpipe::{map, PipelineBuilder, ProcessConcurrently};
/// let mut squares = (0..1_000u64)
///     .process_concurrently(&PipelineBuilder::default(), map(|x: u64| x * x))
///     .unwrap();
///
/// let mut output = squares.by_ref().collect::<Result<Vec<_>, _>>().unwrap();
/// squares.release().unwrap();
///
/// output.sort_unstable();
/// assert_eq!(output, (0..1_000u64).map(|x| x * x).collect::<Vec<_>>());
/// ```
pub trait ProcessConcurrently: IntoIterator + Sized {
    /// Starts a pipeline that transforms the items of this iterator on the
    /// threads described by the `builder`.
    fn process_concurrently<Output, T>(
        self,
        builder: &PipelineBuilder,
        transform: T,
    ) -> Result<ResultStream<Self::Item, Output>>
    where
        Self::IntoIter: Send + 'static,
        Self::Item: Send + 'static,
        Output: Send + 'static,
        T: Transform<Self::Item, Output> + Send + 'static;
}

impl<Source: IntoIterator> ProcessConcurrently for Source {
    fn process_concurrently<Output, T>(
        self,
        builder: &PipelineBuilder,
        transform: T,
    ) -> Result<ResultStream<Self::Item, Output>>
    where
        Self::IntoIter: Send + 'static,
        Self::Item: Send + 'static,
        Output: Send + 'static,
        T: Transform<Self::Item, Output> + Send + 'static,
    {
        process_concurrently(self, transform, builder)
    }
}
