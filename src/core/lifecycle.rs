// Copyright 2024-2025 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! Ownership of the pipeline threads, and their orderly shutdown.

use super::sync::Flag;
use crate::error::{PipelineError, Result};
use crate::macros::{log_debug, log_error};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Upper bound on the sleep between two checks of the threads' status while
/// shutting down.
const SHUTDOWN_CHECK_INTERVAL: Duration = Duration::from_millis(5);

/// Handle to a thread of the pipeline.
struct TaskHandle {
    /// Thread name, for logging.
    #[cfg(feature = "log")]
    name: String,
    /// Thread handle object.
    handle: JoinHandle<()>,
}

/// Owner of the producer and worker threads.
pub struct Lifecycle {
    /// Handles to the threads that haven't been joined yet.
    tasks: Vec<TaskHandle>,
    /// Threads that outlived the grace period of a release. They are never
    /// joined, but still count as active until they finish.
    leaked: Vec<TaskHandle>,
    /// Abort flag shared with all the stages.
    aborted: Arc<Flag>,
    /// How long [`release()`](Self::release) waits for the threads.
    grace: Duration,
}

impl Lifecycle {
    /// Creates a controller without any thread.
    pub fn new(aborted: Arc<Flag>, grace: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            leaked: Vec::new(),
            aborted,
            grace,
        }
    }

    /// Spawns a named thread owned by this controller.
    pub fn spawn(&mut self, name: String, f: impl FnOnce() + Send + 'static) -> Result<()> {
        let handle = std::thread::Builder::new()
            .name(name.clone())
            .spawn(f)
            .map_err(|e| PipelineError::Spawn(format!("{name}: {e}")))?;
        log_debug!("[main thread] Spawned thread {name}");
        self.tasks.push(TaskHandle {
            #[cfg(feature = "log")]
            name,
            handle,
        });
        Ok(())
    }

    /// Requests all stages to stop. Doesn't wait for them.
    pub fn abort(&self) {
        if self.aborted.set() {
            log_debug!("[main thread] Aborting the pipeline.");
        }
    }

    /// Returns the abort flag shared with all the stages.
    pub fn abort_flag(&self) -> Arc<Flag> {
        Arc::clone(&self.aborted)
    }

    /// Returns true if the pipeline was aborted.
    pub fn is_aborted(&self) -> bool {
        self.aborted.is_set()
    }

    /// Number of threads that are still running, including the ones leaked
    /// by a release that timed out.
    pub fn active_tasks(&self) -> usize {
        self.tasks
            .iter()
            .chain(&self.leaked)
            .filter(|task| !task.handle.is_finished())
            .count()
    }

    /// Stops all the threads, waiting up to the grace period for them to
    /// finish. Threads that are still running afterwards are detached and
    /// reported as a [`PipelineError::ShutdownTimeout`]. They keep counting in
    /// [`active_tasks()`](Self::active_tasks) until they finish.
    ///
    /// Calling this again after it returned is a no-op.
    pub fn release(&mut self) -> Result<()> {
        if self.tasks.is_empty() {
            return Ok(());
        }

        // Stops a producer or workers that the caller abandoned before the
        // results were fully consumed.
        self.aborted.set();

        let deadline = Instant::now() + self.grace;
        while self.tasks.iter().any(|task| !task.handle.is_finished()) {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            std::thread::sleep((deadline - now).min(SHUTDOWN_CHECK_INTERVAL));
        }

        let (finished, running): (Vec<_>, Vec<_>) = self
            .tasks
            .drain(..)
            .partition(|task| task.handle.is_finished());

        log_debug!("[main thread] Joining {} thread(s)...", finished.len());
        for task in finished {
            let _result = task.handle.join();
            #[cfg(feature = "log")]
            match _result {
                Ok(()) => log_debug!("[main thread] Thread {} joined.", task.name),
                Err(_) => log_error!("[main thread] Thread {} panicked.", task.name),
            }
        }

        if running.is_empty() {
            log_debug!("[main thread] Joined all threads.");
            Ok(())
        } else {
            log_error!(
                "[main thread] {} thread(s) did not terminate within {:?} and are leaked: {:?}",
                running.len(),
                self.grace,
                running.iter().map(|task| &task.name).collect::<Vec<_>>()
            );
            let remaining = running.len();
            self.leaked.extend(running);
            Err(PipelineError::ShutdownTimeout {
                remaining,
                grace: self.grace,
            })
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        if let Err(_e) = self.release() {
            log_error!("[main thread] Failed to release the pipeline: {_e}");
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn test_release_joins_threads() {
        let aborted = Arc::new(Flag::new());
        let mut lifecycle = Lifecycle::new(aborted.clone(), Duration::from_secs(1));
        for i in 0..3 {
            let aborted = aborted.clone();
            lifecycle
                .spawn(format!("test-{i}"), move || {
                    while !aborted.is_set() {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                })
                .unwrap();
        }
        assert_eq!(lifecycle.active_tasks(), 3);
        assert!(!lifecycle.is_aborted());

        assert_eq!(lifecycle.release(), Ok(()));
        assert!(lifecycle.is_aborted());
        assert_eq!(lifecycle.active_tasks(), 0);
        // Releasing twice is a no-op.
        assert_eq!(lifecycle.release(), Ok(()));
    }

    #[test]
    fn test_abort_does_not_join() {
        let aborted = Arc::new(Flag::new());
        let mut lifecycle = Lifecycle::new(aborted.clone(), Duration::from_secs(1));
        let release = Arc::new(AtomicBool::new(false));
        {
            let release = release.clone();
            lifecycle
                .spawn("test-blocked".into(), move || {
                    while !release.load(Ordering::SeqCst) {
                        std::thread::sleep(Duration::from_millis(1));
                    }
                })
                .unwrap();
        }

        lifecycle.abort();
        lifecycle.abort();
        assert!(aborted.is_set());
        assert_eq!(lifecycle.active_tasks(), 1);

        release.store(true, Ordering::SeqCst);
        assert_eq!(lifecycle.release(), Ok(()));
    }

    #[test]
    fn test_release_times_out() {
        let aborted = Arc::new(Flag::new());
        let mut lifecycle = Lifecycle::new(aborted, Duration::from_millis(50));
        lifecycle
            .spawn("test-stuck".into(), || {
                std::thread::sleep(Duration::from_millis(500))
            })
            .unwrap();
        lifecycle
            .spawn("test-quick".into(), || ())
            .unwrap();

        let start = Instant::now();
        assert_eq!(
            lifecycle.release(),
            Err(PipelineError::ShutdownTimeout {
                remaining: 1,
                grace: Duration::from_millis(50),
            })
        );
        assert!(start.elapsed() < Duration::from_millis(400));
        // The stuck thread is detached but still running.
        assert_eq!(lifecycle.active_tasks(), 1);
        assert_eq!(lifecycle.release(), Ok(()));
        assert_eq!(lifecycle.active_tasks(), 1);

        let deadline = Instant::now() + Duration::from_secs(5);
        while lifecycle.active_tasks() != 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(lifecycle.active_tasks(), 0);
    }

    #[test]
    fn test_release_survives_panicking_thread() {
        let aborted = Arc::new(Flag::new());
        let mut lifecycle = Lifecycle::new(aborted, Duration::from_secs(1));
        lifecycle
            .spawn("test-panic".into(), || panic!("thread exploded"))
            .unwrap();
        assert_eq!(lifecycle.release(), Ok(()));
    }
}
