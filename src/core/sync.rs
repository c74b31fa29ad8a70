// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Synchronization primitives

use super::Shared;
use crate::error::PipelineError;
use crate::macros::{log_debug, log_error};
use crossbeam_utils::CachePadded;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// A boolean that transitions once from false to true, and never back.
pub struct Flag {
    value: CachePadded<AtomicBool>,
}

impl Flag {
    /// Creates an unset flag.
    pub fn new() -> Self {
        Self {
            value: CachePadded::new(AtomicBool::new(false)),
        }
    }

    /// Sets the flag. Returns true if this call is the one that set it.
    pub fn set(&self) -> bool {
        !self.value.swap(true, Ordering::SeqCst)
    }

    /// Returns true if the flag has been set.
    pub fn is_set(&self) -> bool {
        self.value.load(Ordering::SeqCst)
    }
}

impl Default for Flag {
    fn default() -> Self {
        Self::new()
    }
}

/// A counter that starts at some value and only ever decreases, down to zero.
pub struct CountDown {
    count: CachePadded<AtomicUsize>,
}

impl CountDown {
    /// Creates a counter starting at `count`.
    pub fn new(count: usize) -> Self {
        Self {
            count: CachePadded::new(AtomicUsize::new(count)),
        }
    }

    /// Decrements the counter and returns the remaining count.
    pub fn count_down(&self) -> usize {
        let count = self.count.fetch_sub(1, Ordering::SeqCst);
        assert!(count > 0, "counted down below zero");
        count - 1
    }

    /// Current value of the counter.
    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

/// Object whose destructor sets the completion flag of the producer, whether
/// the source was exhausted, the pipeline was aborted or reading the source
/// panicked.
pub struct CompletionGuard<'a> {
    flag: &'a Flag,
}

impl<'a> CompletionGuard<'a> {
    /// Creates a guard that sets `flag` when dropped.
    pub fn new(flag: &'a Flag) -> Self {
        Self { flag }
    }
}

impl Drop for CompletionGuard<'_> {
    fn drop(&mut self) {
        if self.flag.set() {
            log_debug!("[producer] Done producing.");
        }
    }
}

/// Object whose destructor notifies the other stages that a worker thread has
/// exited (or has panicked).
pub struct WorkerExitGuard<'a, Input, Output> {
    /// Worker index.
    id: usize,
    /// State shared with the other stages.
    shared: &'a Shared<Input, Output>,
}

impl<'a, Input, Output> WorkerExitGuard<'a, Input, Output> {
    /// Creates a guard for the worker of the given index.
    pub fn new(id: usize, shared: &'a Shared<Input, Output>) -> Self {
        Self { id, shared }
    }
}

impl<Input, Output> Drop for WorkerExitGuard<'_, Input, Output> {
    fn drop(&mut self) {
        // Item-level panics are caught by the worker, so a panic here means
        // that the worker loop itself broke.
        if std::thread::panicking() {
            log_error!(
                "[worker {}] Detected panic in this thread, failing the pipeline",
                self.id
            );
            self.shared.fail(PipelineError::Worker {
                id: self.id,
                reason: "the worker thread panicked".into(),
            });
        }

        let _remaining = self.shared.active_workers.count_down();
        log_debug!(
            "[worker {}] Exiting. Number of active workers: {_remaining}.",
            self.id
        );
    }
}
