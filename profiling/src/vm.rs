// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The seam between the profiling core and the embedding VM. The host wires
//! the VM's sampling profilers and clocks in through these traits; the core
//! never talks to the VM directly.

use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// Monotonic and wall clocks, as the embedding provides them.
pub trait Clock {
    /// Monotonic nanoseconds from an arbitrary origin. Must use the same
    /// timebase as the sample timestamps reported by [`CpuSampler`].
    fn monotonic_nanos(&self) -> i64;

    /// Wall-clock nanoseconds since the Unix epoch. Carries microsecond
    /// precision; the low three digits are zero.
    fn epoch_nanos(&self) -> i64;

    /// Wall-clock milliseconds since the Unix epoch.
    fn epoch_millis(&self) -> i64 {
        self.epoch_nanos() / 1_000_000
    }
}

/// Production [`Clock`] over [`Instant`] and [`SystemTime`].
#[derive(Debug)]
pub struct SystemClock {
    origin: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn monotonic_nanos(&self) -> i64 {
        self.origin.elapsed().as_nanos() as i64
    }

    fn epoch_nanos(&self) -> i64 {
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_micros() as i64)
            .unwrap_or(0);
        micros * 1000
    }
}

/// A node of a sampled call tree. `parent` points toward the profile's
/// synthetic root; the root itself has no parent.
#[derive(Clone, Debug)]
pub struct CpuProfileNode {
    pub function_name: String,
    pub script_name: String,
    pub line_number: i64,
    pub column_number: i64,
    pub node_id: u32,
    /// Index of the parent node in [`CpuProfile::nodes`].
    pub parent: Option<usize>,
}

/// One stack sample: the leaf node it hit and when.
#[derive(Clone, Copy, Debug)]
pub struct CpuProfileSample {
    /// Index of the leaf node in [`CpuProfile::nodes`].
    pub node: usize,
    /// Monotonic microseconds, same timebase as [`Clock::monotonic_nanos`].
    pub timestamp_micros: i64,
}

/// Owned snapshot of one VM CPU profiling session.
#[derive(Clone, Debug, Default)]
pub struct CpuProfile {
    /// Monotonic microseconds at which the session started recording.
    pub start_time_micros: i64,
    pub nodes: Vec<CpuProfileNode>,
    pub samples: Vec<CpuProfileSample>,
}

/// The VM's sampling CPU profiler. Sessions are addressed by title so that
/// a new session can start before the previous one stops, keeping sampling
/// uninterrupted across a rotation.
pub trait CpuSampler {
    /// Forwarded to the VM once, before the first session starts.
    fn set_sampling_interval(&mut self, interval_micros: i32);

    /// Starts a session under `title`, recording individual samples with
    /// leaf line numbers and no sample limit.
    fn start(&mut self, title: &str);

    /// Stops the session named `title` and returns its profile. `None` when
    /// no session with that title is live (e.g. it was already stopped).
    fn stop(&mut self, title: &str) -> Option<CpuProfile>;
}

/// A node of the VM's allocation profile tree.
#[derive(Clone, Debug)]
pub struct AllocationNode {
    /// The VM's stable node id, used to key the flattened tree.
    pub node_id: u32,
    pub name: String,
    pub script_name: String,
    pub line_number: i64,
    /// Indices of child nodes in [`AllocationProfile::nodes`].
    pub children: Vec<usize>,
}

/// One sampled allocation the VM still holds.
#[derive(Clone, Copy, Debug)]
pub struct AllocationSample {
    /// Identity of the sample; stable for as long as the VM retains it.
    pub sample_id: u64,
    pub node_id: u32,
    /// Sampled allocation size in bytes.
    pub size: u64,
    /// How many allocations this sample stands for.
    pub count: u64,
}

/// Owned snapshot of the VM's sampling heap profile. `nodes[0]` is the
/// synthetic root.
#[derive(Clone, Debug, Default)]
pub struct AllocationProfile {
    pub nodes: Vec<AllocationNode>,
    pub samples: Vec<AllocationSample>,
}

/// The VM's sampling heap profiler.
pub trait HeapSampler {
    /// Starts sampling; returns whether the VM accepted.
    fn start_sampling(&mut self, sample_interval_bytes: u64, max_stack_depth: u32) -> bool;

    fn stop_sampling(&mut self);

    /// Snapshot of the current allocation profile, or `None` when the VM
    /// cannot produce one.
    fn allocation_profile(&mut self) -> Option<AllocationProfile>;
}
