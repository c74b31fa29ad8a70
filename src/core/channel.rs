// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Blocks of items and the bounded channels that move them between stages.

use super::sync::Flag;
use crate::error::PipelineError;
use crossbeam_channel::{Receiver, RecvTimeoutError, SendTimeoutError, Sender};
use std::time::Duration;

/// An ordered group of items, moved as one unit between pipeline stages.
///
/// Blocks are passed by value through the channels, so a stage never sees a
/// block that another stage may still modify.
#[derive(Debug, PartialEq, Eq)]
pub struct Block<T> {
    items: Vec<T>,
    capacity: usize,
}

impl<T> Block<T> {
    /// Creates an empty block that is full once it holds `capacity` items.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends an item at the end of this block.
    pub fn push(&mut self, item: T) {
        self.items.push(item);
    }

    /// Number of items in this block.
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Returns true if this block holds no item.
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Returns true if this block reached its capacity.
    pub fn is_full(&self) -> bool {
        self.items.len() >= self.capacity
    }
}

impl<T> From<Vec<T>> for Block<T> {
    fn from(items: Vec<T>) -> Self {
        let capacity = items.len();
        Self { items, capacity }
    }
}

impl<T> IntoIterator for Block<T> {
    type Item = T;
    type IntoIter = std::vec::IntoIter<T>;

    fn into_iter(self) -> Self::IntoIter {
        self.items.into_iter()
    }
}

/// Reason why [`BoundedChannel::put()`] gave up, handing the item back.
#[derive(Debug, PartialEq, Eq)]
pub enum PutError<T> {
    /// The abort flag was set while waiting for capacity.
    Aborted(T),
    /// The receiving end is gone.
    Disconnected(T),
}

/// A fixed-capacity FIFO shared by the stages of a pipeline.
///
/// The channel keeps both of its endpoints, so it stays connected for as long
/// as any stage holds it.
pub struct BoundedChannel<T> {
    /// Name of the channel, for error reporting.
    name: &'static str,
    /// How long a blocked [`put()`](Self::put) waits before re-checking the
    /// abort flag.
    retry_interval: Duration,
    sender: Sender<T>,
    receiver: Receiver<T>,
}

impl<T> BoundedChannel<T> {
    /// Creates a channel that holds at most `capacity` items.
    pub fn new(name: &'static str, capacity: usize, retry_interval: Duration) -> Self {
        let (sender, receiver) = crossbeam_channel::bounded(capacity);
        Self {
            name,
            retry_interval,
            sender,
            receiver,
        }
    }

    /// Enqueues the given item, blocking while the channel is full.
    ///
    /// Gives the item back if the `abort` flag is set before capacity becomes
    /// available.
    pub fn put(&self, item: T, abort: &Flag) -> Result<(), PutError<T>> {
        let mut item = item;
        loop {
            if abort.is_set() {
                return Err(PutError::Aborted(item));
            }
            match self.sender.send_timeout(item, self.retry_interval) {
                Ok(()) => return Ok(()),
                Err(SendTimeoutError::Timeout(back)) => item = back,
                Err(SendTimeoutError::Disconnected(back)) => {
                    return Err(PutError::Disconnected(back))
                }
            }
        }
    }

    /// Dequeues an item, waiting up to `timeout` for one to be available.
    pub fn poll(&self, timeout: Duration) -> Result<Option<T>, PipelineError> {
        match self.receiver.recv_timeout(timeout) {
            Ok(item) => Ok(Some(item)),
            Err(RecvTimeoutError::Timeout) => Ok(None),
            Err(RecvTimeoutError::Disconnected) => Err(self.closed()),
        }
    }

    /// Returns true if the channel holds no item at this instant.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Error to report when this channel is disconnected.
    pub fn closed(&self) -> PipelineError {
        PipelineError::ChannelClosed(self.name)
    }
}
