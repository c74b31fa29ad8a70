// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The worker stage, transforming blocks of inputs into blocks of outputs.

use super::channel::{Block, PutError};
use super::sync::WorkerExitGuard;
#[cfg(feature = "log")]
use super::util::panic_message;
use super::util::pin_current_thread;
use super::Shared;
use crate::config::{CpuPinningPolicy, PipelineConfig, ShutdownPolicy};
use crate::error::PipelineError;
use crate::macros::{log_debug, log_trace, log_warn};
use crate::transform::Transform;
use std::marker::PhantomData;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

/// One of the tasks draining the work channel.
pub struct Worker<Input, Output, T> {
    /// Worker index.
    id: usize,
    /// Transform to apply on each item.
    transform: Arc<T>,
    /// State shared with the other stages.
    shared: Arc<Shared<Input, Output>>,
    /// How long to wait for a block before re-checking the completion flag.
    poll_interval: Duration,
    /// Whether to check for an abort between the items of a block.
    shutdown: ShutdownPolicy,
    /// Policy to pin this worker to a CPU.
    cpu_pinning: CpuPinningPolicy,
    _phantom: PhantomData<fn(Input) -> Output>,
}

impl<Input, Output, T> Worker<Input, Output, T>
where
    T: Transform<Input, Output>,
{
    /// Creates the worker of the given index.
    pub fn new(
        id: usize,
        transform: Arc<T>,
        shared: Arc<Shared<Input, Output>>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            id,
            transform,
            shared,
            poll_interval: config.worker_poll_interval,
            shutdown: config.shutdown,
            cpu_pinning: config.cpu_pinning,
            _phantom: PhantomData,
        }
    }

    /// Main function run by this worker thread.
    pub fn run(self) {
        // Regardless of how the loop exits (normally, aborted or with a panic),
        // the other stages must learn that this worker is gone.
        let _exit = WorkerExitGuard::new(self.id, &self.shared);
        pin_current_thread(self.id, self.cpu_pinning);

        if let Err(e) = self.process_blocks() {
            log_debug!("[worker {}] Channel failure: {e}", self.id);
            self.shared.fail(e);
        }
    }

    /// Processes blocks until the producer is done and the work channel is
    /// empty, or until the pipeline is aborted.
    fn process_blocks(&self) -> Result<(), PipelineError> {
        let shared = &*self.shared;
        while !shared.aborted.is_set() {
            // The completion flag must be read before polling: the producer
            // sets it after its last put, so an empty poll that follows it
            // proves that no block will ever arrive.
            let done_producing = shared.done_producing.is_set();
            match shared.work.poll(self.poll_interval)? {
                Some(block) => {
                    let output = self.transform_block(block);
                    if output.is_empty() {
                        continue;
                    }
                    let _len = output.len();
                    match shared.results.put(output, &shared.aborted) {
                        Ok(()) => {
                            log_trace!("[worker {}] Pushed a block of {_len} output(s).", self.id)
                        }
                        Err(PutError::Aborted(_)) => break,
                        Err(PutError::Disconnected(_)) => return Err(shared.results.closed()),
                    }
                }
                None if done_producing => break,
                None => continue,
            }
        }
        Ok(())
    }

    /// Transforms each item of the block, keeping the successful outputs in
    /// order. Failing items are logged and skipped.
    fn transform_block(&self, block: Block<Input>) -> Block<Output> {
        let mut output = Block::with_capacity(block.len());
        for (_index, item) in block.into_iter().enumerate() {
            if self.shutdown == ShutdownPolicy::Cancel && self.shared.aborted.is_set() {
                log_debug!("[worker {}] Aborted in the middle of a block.", self.id);
                break;
            }
            match catch_unwind(AssertUnwindSafe(|| self.transform.transform(item))) {
                Ok(Ok(Some(out))) => output.push(out),
                Ok(Ok(None)) => (),
                Ok(Err(_e)) => {
                    log_warn!(
                        "[worker {}] Skipping item #{_index} of the block: {_e}",
                        self.id
                    )
                }
                Err(_payload) => {
                    log_warn!(
                        "[worker {}] Skipping item #{_index} of the block, the transform panicked: {}",
                        self.id,
                        panic_message(_payload.as_ref())
                    )
                }
            }
        }
        output
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::core::test_util::config;
    use crate::core::Flag;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn fill_work(shared: &Shared<u32, u32>, blocks: Vec<Vec<u32>>) {
        let abort = Flag::new();
        for block in blocks {
            shared.work.put(Block::from(block), &abort).unwrap();
        }
    }

    fn collect_results(shared: &Shared<u32, u32>) -> Vec<Vec<u32>> {
        let mut blocks = Vec::new();
        while let Some(block) = shared.results.poll(Duration::ZERO).unwrap() {
            blocks.push(block.into_iter().collect());
        }
        blocks
    }

    /// Number of blocks left in the work channel.
    fn pending_work(shared: &Shared<u32, u32>) -> usize {
        std::iter::from_fn(|| shared.work.poll(Duration::ZERO).unwrap()).count()
    }

    #[test]
    fn test_transforms_blocks_in_order() {
        let config = config(3, 1, 8);
        let shared = Arc::new(Shared::new(&config));
        fill_work(&shared, vec![vec![1, 2, 3], vec![4, 5]]);
        shared.done_producing.set();

        let transform = Arc::new(|x: u32| Ok::<_, String>(Some(x * 10)));
        Worker::new(0, transform, shared.clone(), &config).run();

        assert_eq!(shared.active_workers.count(), 0);
        assert!(shared.failure().is_none());
        assert_eq!(
            collect_results(&shared),
            vec![vec![10, 20, 30], vec![40, 50]]
        );
    }

    #[test]
    fn test_isolates_item_failures() {
        let config = config(6, 1, 8);
        let shared = Arc::new(Shared::new(&config));
        fill_work(&shared, vec![vec![0, 1, 2, 3, 4, 5], vec![6, 7, 8]]);
        shared.done_producing.set();

        let transform = Arc::new(|x: u32| match x % 3 {
            0 => Err(format!("{x} is a multiple of 3")),
            1 => Ok(Some(x)),
            _ => panic!("cannot handle {x}"),
        });
        Worker::new(0, transform, shared.clone(), &config).run();

        assert!(shared.failure().is_none());
        assert_eq!(collect_results(&shared), vec![vec![1, 4], vec![7]]);
    }

    #[test]
    fn test_skips_empty_output_blocks() {
        let config = config(2, 1, 8);
        let shared = Arc::new(Shared::new(&config));
        fill_work(&shared, vec![vec![1, 3], vec![2, 4], vec![5, 6]]);
        shared.done_producing.set();

        let transform = Arc::new(|x: u32| Ok::<_, String>((x % 2 == 0).then_some(x)));
        Worker::new(0, transform, shared.clone(), &config).run();

        assert_eq!(collect_results(&shared), vec![vec![2, 4], vec![6]]);
    }

    #[test]
    fn test_waits_for_producer() {
        let config = config(2, 1, 8);
        let shared = Arc::new(Shared::new(&config));

        let worker = {
            let shared = shared.clone();
            let transform = Arc::new(|x: u32| Ok::<_, String>(Some(x)));
            std::thread::spawn(move || Worker::new(0, transform, shared, &config).run())
        };

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(shared.active_workers.count(), 1);
        fill_work(&shared, vec![vec![1, 2]]);
        shared.done_producing.set();

        worker.join().unwrap();
        assert_eq!(shared.active_workers.count(), 0);
        assert_eq!(collect_results(&shared), vec![vec![1, 2]]);
    }

    #[test]
    fn test_stops_when_aborted() {
        let config = config(2, 1, 8);
        let shared = Arc::new(Shared::new(&config));
        fill_work(&shared, vec![vec![1, 2], vec![3, 4]]);
        shared.aborted.set();

        let transform = Arc::new(|x: u32| Ok::<_, String>(Some(x)));
        Worker::new(0, transform, shared.clone(), &config).run();

        assert_eq!(shared.active_workers.count(), 0);
        assert!(collect_results(&shared).is_empty());
        assert_eq!(pending_work(&shared), 2);
    }

    #[test]
    fn test_cancel_policy_stops_mid_block() {
        let mut config = config(100, 1, 8);
        config.shutdown = ShutdownPolicy::Cancel;
        let shared = Arc::new(Shared::new(&config));
        fill_work(&shared, vec![(0..100).collect()]);
        shared.done_producing.set();

        let processed = Arc::new(AtomicUsize::new(0));
        let transform = {
            let processed = processed.clone();
            let shared = shared.clone();
            Arc::new(move |x: u32| {
                if processed.fetch_add(1, Ordering::SeqCst) == 9 {
                    shared.aborted.set();
                }
                Ok::<_, String>(Some(x))
            })
        };
        Worker::new(0, transform, shared.clone(), &config).run();

        assert_eq!(processed.load(Ordering::SeqCst), 10);
        assert!(collect_results(&shared).is_empty());
    }

    #[test]
    fn test_drain_policy_finishes_block() {
        let config = config(100, 1, 8);
        let shared = Arc::new(Shared::new(&config));
        fill_work(&shared, vec![(0..100).collect(), (100..200).collect()]);
        shared.done_producing.set();

        let processed = Arc::new(AtomicUsize::new(0));
        let transform = {
            let processed = processed.clone();
            let shared = shared.clone();
            Arc::new(move |x: u32| {
                if processed.fetch_add(1, Ordering::SeqCst) == 9 {
                    shared.aborted.set();
                }
                Ok::<_, String>(Some(x))
            })
        };
        Worker::new(0, transform, shared.clone(), &config).run();

        // The whole first block was transformed, but not pushed nor followed by
        // the second block.
        assert_eq!(processed.load(Ordering::SeqCst), 100);
        assert!(collect_results(&shared).is_empty());
        assert_eq!(pending_work(&shared), 1);
    }
}
