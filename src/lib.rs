// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

#![doc = include_str!("../README.md")]
#![forbid(missing_docs, unsafe_code)]

mod config;
mod core;
mod error;
mod iter;
mod macros;
mod pipeline;
mod transform;

pub use config::{CpuPinningPolicy, PipelineBuilder, ShutdownPolicy, ThreadCount};
pub use error::{PipelineError, Result};
pub use iter::{process_concurrently, ProcessConcurrently};
pub use pipeline::{AbortHandle, Pipeline, ResultStream};
pub use transform::{filter_map, map, FilterMap, Map, Transform};
