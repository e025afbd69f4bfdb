// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use log::debug;

use crate::api::{CpuProfileData, CpuProfilerOptions, MAX_PROFILER_NAME_LEN};
use crate::error::ProfilingError;
use crate::hex;
use crate::internal::CpuProfiler;
use crate::vm::{Clock, CpuSampler};

/// Named, handle-addressed profiler instances. Several independent cycles
/// can run concurrently (say, one unfiltered and one restricted to a
/// trace-id set); activation enter/exit broadcast to every instance with a
/// single shared timestamp so all of them agree on activation boundaries.
///
/// There is one VM, so the host typically embeds exactly one registry.
pub struct ProfilerRegistry {
    profilers: Vec<CpuProfiler>,
    next_handle: i32,
    clock: Box<dyn Clock>,
}

impl ProfilerRegistry {
    pub fn new(clock: Box<dyn Clock>) -> Self {
        Self {
            profilers: Vec::new(),
            next_handle: 0,
            clock,
        }
    }

    /// Creates an idle profiler and returns its handle. Fails on an empty,
    /// overlong, or duplicate name, or a non-positive sampling interval.
    pub fn create_cpu_profiler(
        &mut self,
        options: &CpuProfilerOptions,
        sampler: Box<dyn CpuSampler>,
    ) -> Result<i32, ProfilingError> {
        if options.name.is_empty() {
            return Err(ProfilingError::EmptyName);
        }
        if options.name.len() > MAX_PROFILER_NAME_LEN {
            return Err(ProfilingError::NameTooLong);
        }
        if self.find_by_name(&options.name).is_some() {
            return Err(ProfilingError::DuplicateName);
        }
        if options.sampling_interval_microseconds <= 0 {
            return Err(ProfilingError::InvalidSamplingInterval);
        }

        let handle = self.next_handle;
        let profiler = CpuProfiler::new(options, sampler, handle)?;
        self.next_handle += 1;
        self.profilers.push(profiler);

        debug!("created cpu profiler {:?} with handle {handle}", options.name);
        Ok(handle)
    }

    /// Starts the profiler's first VM session. Returns false for unknown
    /// handles and for profilers that are already running.
    pub fn start_cpu_profiler(&mut self, handle: i32) -> bool {
        let Self {
            profilers, clock, ..
        } = self;
        match profilers.iter_mut().find(|p| p.handle() == handle) {
            Some(profiler) => profiler.start(clock.as_ref()),
            None => false,
        }
    }

    /// Convenience: create and immediately start.
    pub fn start(
        &mut self,
        options: &CpuProfilerOptions,
        sampler: Box<dyn CpuSampler>,
    ) -> Result<i32, ProfilingError> {
        let handle = self.create_cpu_profiler(options, sampler)?;
        self.start_cpu_profiler(handle);
        Ok(handle)
    }

    /// Rotates and processes one cycle. `None` for unknown handles, idle
    /// profilers, and sessions the VM had no profile for.
    pub fn collect(&mut self, handle: i32) -> Option<CpuProfileData> {
        let Self {
            profilers, clock, ..
        } = self;
        let profiler = profilers.iter_mut().find(|p| p.handle() == handle)?;
        profiler.collect(clock.as_ref())
    }

    /// Stops and processes the final cycle. `None` for unknown handles and
    /// idle profilers.
    pub fn stop(&mut self, handle: i32) -> Option<CpuProfileData> {
        let Self {
            profilers, clock, ..
        } = self;
        let profiler = profilers.iter_mut().find(|p| p.handle() == handle)?;
        profiler.stop(clock.as_ref())
    }

    pub fn add_trace_id_filter(&mut self, handle: i32, trace_id: &str) {
        if let Some(profiler) = self.profilers.iter_mut().find(|p| p.handle() == handle) {
            profiler.add_trace_id_filter(trace_id);
        }
    }

    pub fn remove_trace_id_filter(&mut self, handle: i32, trace_id: &str) {
        if let Some(profiler) = self.profilers.iter_mut().find(|p| p.handle() == handle) {
            profiler.remove_trace_id_filter(trace_id);
        }
    }

    /// Records a span becoming current on `context_key`. Malformed ids are
    /// dropped here, at ingest, so the rest of the core can assume
    /// well-formed hex. One timestamp is captured for the whole broadcast.
    pub fn enter_context(&mut self, context_key: u32, trace_id: &str, span_id: &str) {
        if self.profilers.is_empty() {
            return;
        }
        if !hex::is_valid_trace_id(trace_id) || !hex::is_valid_span_id(span_id) {
            return;
        }

        let timestamp = self.clock.monotonic_nanos();
        for profiler in &mut self.profilers {
            profiler.enter_context(context_key, timestamp, trace_id, span_id);
        }
    }

    /// Records the current span of `context_key` ending.
    pub fn exit_context(&mut self, context_key: u32) {
        if self.profilers.is_empty() {
            return;
        }

        let timestamp = self.clock.monotonic_nanos();
        for profiler in &mut self.profilers {
            profiler.exit_context(context_key, timestamp);
        }
    }

    pub fn profiler_count(&self) -> usize {
        self.profilers.len()
    }

    fn find_by_name(&self, name: &str) -> Option<&CpuProfiler> {
        self.profilers.iter().find(|p| p.name() == name)
    }
}
