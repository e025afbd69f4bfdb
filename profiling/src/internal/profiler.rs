// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The per-instance CPU profiling state machine: drives the VM sampler
//! through start/rotate/stop, filters and de-biases the samples it returns,
//! and joins each kept sample against the activation that enclosed it.

use log::debug;
use rustc_hash::{FxHashSet, FxHasher};
use spanprof_alloc::PagedArena;
use std::hash::Hasher;

use crate::api::{
    ActivationDebugInfo, CpuProfileData, CpuProfilerOptions, StackFrame, StackTrace,
};
use crate::error::ProfilingError;
use crate::hex;
use crate::internal::activation::SpanActivation;
use crate::internal::index::ActivationIndex;
use crate::internal::stack_table::ActivationStackTable;
use crate::vm::{Clock, CpuProfile, CpuProfileNode, CpuSampler};

/// Page size of a profiling instance's arena. Pages are committed lazily by
/// the OS, so an idle profiler does not pay for this up front.
const ARENA_PAGE_SIZE: usize = 64 * 1024 * 1024;

/// The trace-id filter stores 64-bit hashes of the UTF-8 id, not the id.
fn trace_id_hash(trace_id: &str) -> u64 {
    let mut hasher = FxHasher::default();
    hasher.write(trace_id.as_bytes());
    hasher.finish()
}

/// One CPU profiling instance: a VM sampler plus the activation bookkeeping
/// captured during its sessions.
pub struct CpuProfiler {
    arena: PagedArena,
    index: ActivationIndex,
    sampler: Box<dyn CpuSampler>,
    stack_table: ActivationStackTable,
    trace_id_filter: FxHashSet<u64>,
    name: String,
    handle: i32,
    /// Monotonic ns at which the current session started.
    start_time: i64,
    /// Wall ns matching `start_time`.
    wall_start_time: i64,
    sampling_interval_nanos: i64,
    max_sample_cutoff_delay_nanos: i64,
    /// Monotonic ns at which profiler control last returned; earlier
    /// samples inside the grace window land in the control code itself.
    sample_cutoff_point: i64,
    activation_depth: i32,
    profiler_seq: u32,
    running: bool,
    record_debug_info: bool,
    only_filtered_stacktraces: bool,
}

impl CpuProfiler {
    /// Builds an idle instance. Option validation that needs the registry
    /// (name uniqueness) happens there; everything per-instance happens
    /// here.
    pub(crate) fn new(
        options: &CpuProfilerOptions,
        mut sampler: Box<dyn CpuSampler>,
        handle: i32,
    ) -> Result<Self, ProfilingError> {
        let mut arena = PagedArena::new(ARENA_PAGE_SIZE)?;
        let index = ActivationIndex::new(&mut arena, 0);
        if !index.is_backed() {
            return Err(ProfilingError::OutOfMemory);
        }

        sampler.set_sampling_interval(options.sampling_interval_microseconds);

        Ok(Self {
            arena,
            index,
            sampler,
            stack_table: ActivationStackTable::new(),
            trace_id_filter: FxHashSet::default(),
            name: options.name.clone(),
            handle,
            start_time: 0,
            wall_start_time: 0,
            sampling_interval_nanos: i64::from(options.sampling_interval_microseconds) * 1000,
            max_sample_cutoff_delay_nanos: options.max_sample_cutoff_delay_microseconds * 1000,
            sample_cutoff_point: 0,
            activation_depth: 0,
            profiler_seq: 0,
            running: false,
            record_debug_info: options.record_debug_info,
            only_filtered_stacktraces: options.only_filtered_stacktraces,
        })
    }

    pub fn handle(&self) -> i32 {
        self.handle
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    fn session_title(&self) -> String {
        format!("{}-{}", self.name, self.profiler_seq)
    }

    /// Starts a VM session. Returns false without touching anything when
    /// already running.
    pub fn start(&mut self, clock: &dyn Clock) -> bool {
        if self.running {
            return false;
        }

        let title = self.session_title();
        self.activation_depth = 0;
        self.start_time = clock.monotonic_nanos();
        self.wall_start_time = clock.epoch_nanos();
        // The index is empty between cycles; only its epoch moves.
        self.index.set_start_time(self.start_time);
        self.sampler.start(&title);
        self.sample_cutoff_point = clock.monotonic_nanos();
        self.running = true;

        debug!("started cpu profiler {} as session {title}", self.name);
        true
    }

    /// Rotates the VM session and processes the finished one. Returns
    /// `None` when not running, or when the VM had no profile for the
    /// session (in which case start times still advance).
    pub fn collect(&mut self, clock: &dyn Clock) -> Option<CpuProfileData> {
        if !self.running {
            return None;
        }

        let prev_title = self.session_title();
        self.profiler_seq = (self.profiler_seq + 1) % 2;
        let next_title = self.session_title();

        self.activation_depth = 0;
        let new_start_time = clock.monotonic_nanos();
        let new_wall_start = clock.epoch_nanos();

        self.sampler.start(&next_title);
        let stop_begin = clock.monotonic_nanos();
        let start_duration = stop_begin - new_start_time;

        let profile = self.sampler.stop(&prev_title);
        let stop_end = clock.monotonic_nanos();
        let stop_duration = stop_end - stop_begin;

        let Some(profile) = profile else {
            // The session may already have been ended by an earlier stop
            // call; keep sampling under the new title.
            self.start_time = new_start_time;
            self.wall_start_time = new_wall_start;
            return None;
        };

        let mut data = self.build_stacktraces(&profile);
        data.profiler_start_duration = start_duration;
        data.profiler_stop_duration = stop_duration;
        data.profiler_processing_step_duration = clock.monotonic_nanos() - stop_end;

        self.attach_debug_info(&mut data);

        self.start_time = new_start_time;
        self.wall_start_time = new_wall_start;
        self.reset();
        self.sample_cutoff_point = clock.monotonic_nanos();

        debug!(
            "collected {} stacktraces from cpu profiler {}",
            data.stacktraces.len(),
            self.name
        );
        Some(data)
    }

    /// Stops the VM session and processes it. Returns `None` when not
    /// running or when the VM had no profile.
    pub fn stop(&mut self, clock: &dyn Clock) -> Option<CpuProfileData> {
        if !self.running {
            return None;
        }
        self.running = false;

        let title = self.session_title();
        let stop_begin = clock.monotonic_nanos();
        let profile = self.sampler.stop(&title);
        let stop_end = clock.monotonic_nanos();

        let Some(profile) = profile else {
            self.reset();
            return None;
        };

        let mut data = self.build_stacktraces(&profile);
        data.profiler_stop_duration = stop_end - stop_begin;
        data.profiler_processing_step_duration = clock.monotonic_nanos() - stop_end;

        self.attach_debug_info(&mut data);
        self.reset();

        debug!("stopped cpu profiler {}", self.name);
        Some(data)
    }

    pub fn add_trace_id_filter(&mut self, trace_id: &str) {
        self.trace_id_filter.insert(trace_id_hash(trace_id));
    }

    pub fn remove_trace_id_filter(&mut self, trace_id: &str) {
        self.trace_id_filter.remove(&trace_id_hash(trace_id));
    }

    /// Opens an activation for `context_key`. Ids arrive validated; the
    /// shared `timestamp` comes from the registry so every profiler sees
    /// identical activation boundaries.
    pub fn enter_context(&mut self, context_key: u32, timestamp: i64, trace_id: &str, span_id: &str) {
        if !self.running {
            return;
        }

        if self.only_filtered_stacktraces
            && !self.trace_id_filter.contains(&trace_id_hash(trace_id))
        {
            return;
        }

        let (Ok(trace_id), Ok(span_id)) = (
            <[u8; 32]>::try_from(trace_id.as_bytes()),
            <[u8; 16]>::try_from(span_id.as_bytes()),
        ) else {
            return;
        };

        let activation = SpanActivation::new(trace_id, span_id, timestamp);
        if self.stack_table.push(&mut self.arena, context_key, activation) {
            self.activation_depth += 1;
        }
    }

    /// Closes the innermost activation for `context_key` and files it into
    /// the index. Unknown contexts are a no-op.
    pub fn exit_context(&mut self, context_key: u32, timestamp: i64) {
        if !self.running {
            return;
        }

        let Some(mut activation) = self.stack_table.pop(context_key) else {
            return;
        };
        activation.end_time = timestamp;
        self.index.insert(&mut self.arena, &activation);
        self.activation_depth -= 1;
    }

    fn should_include_sample(&self, timestamp: i64) -> bool {
        // Past the grace window every sample counts, even when the collect
        // step itself ran long.
        if timestamp >= self.start_time + self.max_sample_cutoff_delay_nanos {
            return true;
        }
        // Inside the window, keep only samples taken after profiler control
        // returned; the rest would land in the toggle code itself.
        timestamp >= self.sample_cutoff_point
    }

    /// The joiner: pairs each kept sample with the closest enclosing
    /// activation and shapes the exporter record.
    fn build_stacktraces(&mut self, profile: &CpuProfile) -> CpuProfileData {
        let mut data = CpuProfileData {
            start_time_nanos: self.wall_start_time.to_string(),
            stacktraces: Vec::new(),
            profiler_start_duration: 0,
            profiler_stop_duration: 0,
            profiler_processing_step_duration: 0,
            start_timepoint: None,
            activations: None,
        };

        // Producers can deliver denser samples than requested; enforce the
        // configured inter-sample spacing.
        let mut next_sample_ts = profile.start_time_micros * 1000;

        for sample in &profile.samples {
            let monotonic_ts = sample.timestamp_micros * 1000;

            if !self.should_include_sample(monotonic_ts) || monotonic_ts < next_sample_ts {
                continue;
            }

            let matched = self.index.find_closest(&mut self.arena, monotonic_ts);
            if self.only_filtered_stacktraces && matched.is_none() {
                continue;
            }

            next_sample_ts += self.sampling_interval_nanos;

            let wall_timestamp = self.wall_start_time + (monotonic_ts - self.start_time);

            let (trace_id, span_id) = match &matched {
                Some(activation) => (
                    Some(hex::decode_hex::<16>(&activation.trace_id)),
                    Some(hex::decode_hex::<8>(&activation.span_id)),
                ),
                None => (None, None),
            };

            data.stacktraces.push(StackTrace {
                timestamp: wall_timestamp.to_string(),
                frames: build_frames(profile, sample.node),
                span_id,
                trace_id,
            });
        }

        data
    }

    fn attach_debug_info(&mut self, data: &mut CpuProfileData) {
        if !self.record_debug_info {
            return;
        }

        data.start_timepoint = Some(self.start_time.to_string());

        let mut activations = Vec::new();
        self.index.for_each(|activation| {
            activations.push(ActivationDebugInfo {
                start: activation.start_time.to_string(),
                end: activation.end_time.to_string(),
                trace_id: String::from_utf8_lossy(&activation.trace_id).into_owned(),
                span_id: String::from_utf8_lossy(&activation.span_id).into_owned(),
            });
        });
        data.activations = Some(activations);
    }

    /// Per-cycle reset: drop all in-progress stacks, reclaim the arena, and
    /// rebuild the index over the fresh arena with the current epoch.
    fn reset(&mut self) {
        self.stack_table.clear();
        self.arena.reset();
        self.index = ActivationIndex::new(&mut self.arena, self.start_time);
    }
}

/// Builds the frame list leaf-first from the sample's parent chain. The
/// profile's synthetic root carries no frame and is skipped.
fn build_frames(profile: &CpuProfile, leaf: usize) -> Vec<StackFrame> {
    let mut frames = Vec::new();
    let Some(node) = profile.nodes.get(leaf) else {
        return frames;
    };
    frames.push(make_frame(node));

    let mut parent = node.parent;
    while let Some(index) = parent {
        let Some(node) = profile.nodes.get(index) else {
            break;
        };
        if node.parent.is_some() {
            frames.push(make_frame(node));
        }
        parent = node.parent;
    }
    frames
}

fn make_frame(node: &CpuProfileNode) -> StackFrame {
    let function = if node.function_name.is_empty() {
        "anonymous"
    } else {
        &node.function_name
    };
    let file = if node.script_name.is_empty() {
        "unknown"
    } else {
        &node.script_name
    };
    StackFrame {
        file: file.to_owned(),
        function: function.to_owned(),
        line: node.line_number,
        column: node.column_number,
    }
}
