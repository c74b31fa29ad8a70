// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The producer stage, grouping the source sequence into blocks of work.

use super::channel::{Block, PutError};
use super::sync::CompletionGuard;
use super::util::panic_message;
use super::{BoxedSource, Shared};
use crate::error::PipelineError;
use crate::macros::{log_debug, log_trace};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

/// Single task draining the source sequence into the work channel.
pub struct Producer<Input, Output> {
    /// Source sequence, traversed exactly once.
    source: BoxedSource<Input>,
    /// Number of items per block.
    block_size: usize,
    /// State shared with the other stages.
    shared: Arc<Shared<Input, Output>>,
}

/// Whether the producer went through the whole source.
#[derive(Debug)]
enum Drained {
    /// The source is exhausted.
    Exhausted,
    /// The pipeline was aborted first.
    Aborted,
}

impl<Input, Output> Producer<Input, Output> {
    /// Creates a producer for the given source.
    pub fn new(
        source: BoxedSource<Input>,
        block_size: usize,
        shared: Arc<Shared<Input, Output>>,
    ) -> Self {
        Self {
            source,
            block_size,
            shared,
        }
    }

    /// Main function run by the producer thread.
    pub fn run(mut self) {
        let shared = Arc::clone(&self.shared);
        // Dropped last, after any failure has been recorded, so that the other
        // stages never observe completion without the failure.
        let _completion = CompletionGuard::new(&shared.done_producing);

        match catch_unwind(AssertUnwindSafe(|| self.drain())) {
            Ok(Ok((_drained, _blocks))) => {
                log_debug!("[producer] Stopped after {_blocks} block(s): {_drained:?}.")
            }
            Ok(Err(e)) => shared.fail(e),
            Err(payload) => shared.fail(PipelineError::Source(format!(
                "panicked while reading the source: {}",
                panic_message(payload.as_ref())
            ))),
        }
    }

    /// Pushes the source into the work channel, one block at a time. Returns
    /// how it stopped and the number of blocks pushed.
    fn drain(&mut self) -> Result<(Drained, usize), PipelineError> {
        let mut blocks = 0;
        let mut block = Block::with_capacity(self.block_size);
        while let Some(item) = self.source.next() {
            if self.shared.aborted.is_set() {
                return Ok((Drained::Aborted, blocks));
            }
            block.push(item.map_err(PipelineError::Source)?);
            if block.is_full() {
                let full = std::mem::replace(&mut block, Block::with_capacity(self.block_size));
                if !self.push(full)? {
                    return Ok((Drained::Aborted, blocks));
                }
                blocks += 1;
            }
        }

        if !block.is_empty() {
            if !self.push(block)? {
                return Ok((Drained::Aborted, blocks));
            }
            blocks += 1;
        }
        Ok((Drained::Exhausted, blocks))
    }

    /// Puts a block on the work channel, waiting for capacity. Returns false
    /// if the pipeline was aborted in the meantime.
    fn push(&self, block: Block<Input>) -> Result<bool, PipelineError> {
        let _len = block.len();
        match self.shared.work.put(block, &self.shared.aborted) {
            Ok(()) => {
                log_trace!("[producer] Enqueued a block of {_len} item(s).");
                Ok(true)
            }
            Err(PutError::Aborted(_)) => Ok(false),
            Err(PutError::Disconnected(_)) => Err(self.shared.work.closed()),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::test_util::config;
    use std::time::Duration;

    fn source<I>(items: I) -> BoxedSource<I::Item>
    where
        I: IntoIterator,
        I::IntoIter: Send + 'static,
        I::Item: 'static,
    {
        Box::new(items.into_iter().map(Ok::<I::Item, String>))
    }

    fn collect_blocks(shared: &Shared<u32, u32>) -> Vec<Vec<u32>> {
        let mut blocks = Vec::new();
        while let Some(block) = shared.work.poll(Duration::ZERO).unwrap() {
            blocks.push(block.into_iter().collect());
        }
        blocks
    }

    #[test]
    fn test_groups_items_into_blocks() {
        let shared = Arc::new(Shared::new(&config(4, 1, 16)));
        Producer::new(source(0..10), 4, shared.clone()).run();

        assert!(shared.done_producing.is_set());
        assert!(shared.failure().is_none());
        assert_eq!(
            collect_blocks(&shared),
            vec![vec![0, 1, 2, 3], vec![4, 5, 6, 7], vec![8, 9]]
        );
    }

    #[test]
    fn test_exact_multiple_has_no_trailing_block() {
        let shared = Arc::new(Shared::new(&config(5, 1, 16)));
        Producer::new(source(0..10), 5, shared.clone()).run();
        assert_eq!(
            collect_blocks(&shared),
            vec![vec![0, 1, 2, 3, 4], vec![5, 6, 7, 8, 9]]
        );
    }

    #[test]
    fn test_empty_source() {
        let shared = Arc::new(Shared::<u32, u32>::new(&config(5, 1, 16)));
        Producer::new(source(0..0), 5, shared.clone()).run();
        assert!(shared.done_producing.is_set());
        assert!(shared.work.is_empty());
    }

    #[test]
    fn test_stops_when_aborted() {
        let shared = Arc::new(Shared::<u32, u32>::new(&config(5, 1, 16)));
        shared.aborted.set();
        Producer::new(source(0..1_000_000), 5, shared.clone()).run();
        assert!(shared.done_producing.is_set());
        assert!(shared.work.is_empty());
        assert!(shared.failure().is_none());
    }

    #[test]
    fn test_source_error_is_recorded() {
        let shared = Arc::new(Shared::new(&config(2, 1, 16)));
        let items: Vec<Result<u32, String>> =
            vec![Ok(1), Ok(2), Ok(3), Err("disk on fire".into()), Ok(5)];
        Producer::new(Box::new(items.into_iter()), 2, shared.clone()).run();

        assert!(shared.done_producing.is_set());
        assert!(shared.aborted.is_set());
        assert_eq!(
            shared.failure(),
            Some(&PipelineError::Source("disk on fire".into()))
        );
        assert_eq!(collect_blocks(&shared), vec![vec![1, 2]]);
    }

    #[test]
    fn test_source_panic_is_recorded() {
        let shared = Arc::new(Shared::<u32, u32>::new(&config(2, 1, 16)));
        let items = (0..10u32).map(|i| {
            if i == 5 {
                panic!("bad row {i}");
            }
            Ok::<u32, String>(i)
        });
        Producer::new(Box::new(items), 2, shared.clone()).run();

        assert!(shared.done_producing.is_set());
        assert_eq!(
            shared.failure(),
            Some(&PipelineError::Source(
                "panicked while reading the source: bad row 5".into()
            ))
        );
    }
}
