// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The consumer side of the pipeline, flattening result blocks back into
//! items.

use super::Shared;
use crate::error::{PipelineError, Result};
use crate::macros::{log_debug, log_trace};
use std::sync::Arc;
use std::time::Duration;

/// Minimum time to wait for a result block.
const BACKOFF_FLOOR: Duration = Duration::from_millis(1);
/// Additional wait per consecutive empty poll.
const BACKOFF_STEP: Duration = Duration::from_millis(10);
/// Maximum additional wait, on top of the floor.
const BACKOFF_CAP: Duration = Duration::from_millis(50);

/// State of the cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CursorState {
    /// More items may come.
    Running,
    /// No item will ever come again.
    Exhausted,
}

/// Drains the result channel on the consuming thread.
pub struct ResultCursor<Input, Output> {
    /// State shared with the other stages.
    shared: Arc<Shared<Input, Output>>,
    /// Unread items of the last received block.
    current_block: std::vec::IntoIter<Output>,
    /// Item whose availability has been confirmed but not yet returned.
    next: Option<Output>,
    /// Number of consecutive polls that found no block.
    empty_polls: u32,
    state: CursorState,
}

impl<Input, Output> ResultCursor<Input, Output> {
    /// Creates a cursor over the result channel of the given pipeline.
    pub fn new(shared: Arc<Shared<Input, Output>>) -> Self {
        Self {
            shared,
            current_block: Vec::new().into_iter(),
            next: None,
            empty_polls: 0,
            state: CursorState::Running,
        }
    }

    /// Returns whether another item is available, waiting for one if needed.
    ///
    /// A stage failure is returned once, after which the cursor is exhausted.
    pub fn has_next(&mut self) -> Result<bool> {
        loop {
            if self.next.is_some() {
                return Ok(true);
            }
            if self.state == CursorState::Exhausted {
                return Ok(false);
            }
            if let Some(error) = self.shared.failure().cloned() {
                log_debug!("[cursor] Reporting stage failure: {error}");
                self.exhaust();
                return Err(error);
            }
            if self.shared.aborted.is_set() {
                log_debug!("[cursor] Pipeline aborted, discarding pending results.");
                self.exhaust();
                return Ok(false);
            }
            if let Some(item) = self.current_block.next() {
                self.next = Some(item);
                return Ok(true);
            }

            match self.shared.results.poll(self.backoff()) {
                Ok(Some(block)) => {
                    log_trace!(
                        "[cursor] Received a block of {} item(s) after {} empty poll(s).",
                        block.len(),
                        self.empty_polls
                    );
                    self.empty_polls = 0;
                    self.current_block = block.into_iter();
                }
                Ok(None) => {
                    if self.shared.is_drained() {
                        log_debug!("[cursor] All blocks have been drained.");
                        self.exhaust();
                        return Ok(false);
                    }
                    self.empty_polls = self.empty_polls.saturating_add(1);
                }
                Err(e) => self.shared.fail(e),
            }
        }
    }

    /// Returns the next item, waiting for one if needed.
    ///
    /// Fails with [`PipelineError::NoSuchElement`] if the pipeline is
    /// exhausted.
    pub fn next_item(&mut self) -> Result<Output> {
        if self.has_next()? {
            self.next.take().ok_or(PipelineError::NoSuchElement)
        } else {
            Err(PipelineError::NoSuchElement)
        }
    }

    /// Timeout of the next poll, growing with the number of consecutive empty
    /// polls: the first block of a worker tends to take longer than the
    /// following ones.
    fn backoff(&self) -> Duration {
        BACKOFF_FLOOR + (BACKOFF_STEP * self.empty_polls).min(BACKOFF_CAP)
    }

    /// Marks the cursor as exhausted and drops any pending item.
    fn exhaust(&mut self) {
        self.state = CursorState::Exhausted;
        self.current_block = Vec::new().into_iter();
    }
}

impl<Input, Output> Iterator for ResultCursor<Input, Output> {
    type Item = Result<Output>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.has_next() {
            Ok(true) => self.next.take().map(Ok),
            Ok(false) => None,
            Err(e) => Some(Err(e)),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::test_util::config;
    use crate::core::{Block, Flag};
    use std::time::Instant;

    fn shared() -> Arc<Shared<u32, u32>> {
        Arc::new(Shared::new(&config(4, 1, 8)))
    }

    fn push_result(shared: &Shared<u32, u32>, items: Vec<u32>) {
        shared
            .results
            .put(Block::from(items), &Flag::new())
            .unwrap();
    }

    /// Marks the producer and the only worker as finished.
    fn finish(shared: &Shared<u32, u32>) {
        shared.done_producing.set();
        shared.active_workers.count_down();
    }

    #[test]
    fn test_flattens_blocks() {
        let shared = shared();
        push_result(&shared, vec![1, 2, 3]);
        push_result(&shared, vec![4]);
        finish(&shared);

        let cursor = ResultCursor::new(shared);
        let items = cursor.collect::<Result<Vec<_>>>().unwrap();
        assert_eq!(items, vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_has_next_is_idempotent() {
        let shared = shared();
        push_result(&shared, vec![7]);
        finish(&shared);

        let mut cursor = ResultCursor::new(shared);
        assert_eq!(cursor.has_next(), Ok(true));
        assert_eq!(cursor.has_next(), Ok(true));
        assert_eq!(cursor.next_item(), Ok(7));
        assert_eq!(cursor.has_next(), Ok(false));
        assert_eq!(cursor.has_next(), Ok(false));
    }

    #[test]
    fn test_next_item_when_exhausted() {
        let shared = shared();
        finish(&shared);

        let mut cursor = ResultCursor::new(shared);
        assert_eq!(cursor.next_item(), Err(PipelineError::NoSuchElement));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_waits_for_active_worker() {
        let shared = shared();
        shared.done_producing.set();

        let late_worker = {
            let shared = shared.clone();
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(50));
                push_result(&shared, vec![9]);
                shared.active_workers.count_down();
            })
        };

        // The producer is done and both channels are empty, but a worker is
        // still running.
        let mut cursor = ResultCursor::new(shared);
        assert_eq!(cursor.next_item(), Ok(9));
        assert_eq!(cursor.has_next(), Ok(false));
        late_worker.join().unwrap();
    }

    #[test]
    fn test_abort_discards_pending_blocks() {
        let shared = shared();
        push_result(&shared, vec![1, 2, 3]);
        push_result(&shared, vec![4, 5, 6]);

        let mut cursor = ResultCursor::new(shared.clone());
        assert_eq!(cursor.next_item(), Ok(1));
        shared.aborted.set();
        assert_eq!(cursor.has_next(), Ok(false));
        assert!(cursor.next().is_none());
    }

    #[test]
    fn test_reports_failure_once() {
        let shared = shared();
        push_result(&shared, vec![1, 2]);

        let mut cursor = ResultCursor::new(shared.clone());
        assert_eq!(cursor.next_item(), Ok(1));
        shared.fail(PipelineError::Source("truncated input".into()));

        assert_eq!(
            cursor.next(),
            Some(Err(PipelineError::Source("truncated input".into())))
        );
        assert!(cursor.next().is_none());
        assert_eq!(cursor.has_next(), Ok(false));
    }

    #[test]
    fn test_backoff_is_capped() {
        let mut cursor = ResultCursor::new(shared());
        assert_eq!(cursor.backoff(), Duration::from_millis(1));
        cursor.empty_polls = 2;
        assert_eq!(cursor.backoff(), Duration::from_millis(21));
        cursor.empty_polls = 1_000;
        assert_eq!(cursor.backoff(), Duration::from_millis(51));
    }

    #[test]
    fn test_empty_pipeline_terminates_quickly() {
        let shared = shared();
        finish(&shared);

        let start = Instant::now();
        let mut cursor = ResultCursor::new(shared);
        assert_eq!(cursor.has_next(), Ok(false));
        assert!(start.elapsed() < Duration::from_millis(500));
    }
}
