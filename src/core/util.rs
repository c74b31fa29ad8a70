// Copyright 2024 Google LLC
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// https://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or https://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

use crate::config::CpuPinningPolicy;
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use crate::macros::log_debug;
use crate::macros::log_warn;
// Platforms that support `libc::sched_setaffinity()`.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
use nix::{
    sched::{sched_setaffinity, CpuSet},
    unistd::Pid,
};
use std::any::Any;

/// Extracts a readable message from the payload of a caught panic.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}

/// Pins the current thread to the CPU of the given index, according to the
/// given policy.
///
/// With [`CpuPinningPolicy::Always`], a failure to pin panics.
#[cfg(all(
    not(miri),
    any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    )
))]
pub fn pin_current_thread(id: usize, cpu_pinning: CpuPinningPolicy) {
    let pin = || -> nix::Result<()> {
        let mut cpu_set = CpuSet::new();
        cpu_set.set(id)?;
        sched_setaffinity(Pid::from_raw(0), &cpu_set)
    };
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported => match pin() {
            Ok(()) => log_debug!("Pinned worker #{id} to CPU #{id}"),
            Err(_e) => log_warn!("Failed to set CPU affinity for worker #{id}: {_e}"),
        },
        CpuPinningPolicy::Always => match pin() {
            Ok(()) => log_debug!("Pinned worker #{id} to CPU #{id}"),
            Err(e) => panic!("Failed to set CPU affinity for worker #{id}: {e}"),
        },
    }
}

/// Pins the current thread to the CPU of the given index, according to the
/// given policy.
///
/// Pinning isn't implemented on this platform, and
/// [`CpuPinningPolicy::Always`] is rejected when building the pipeline.
#[cfg(any(
    miri,
    not(any(
        target_os = "android",
        target_os = "dragonfly",
        target_os = "freebsd",
        target_os = "linux"
    ))
))]
pub fn pin_current_thread(_id: usize, cpu_pinning: CpuPinningPolicy) {
    match cpu_pinning {
        CpuPinningPolicy::No => (),
        CpuPinningPolicy::IfSupported | CpuPinningPolicy::Always => {
            log_warn!("Pinning threads to CPUs is not implemented on this platform.")
        }
    }
}
