// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Heap-allocation sampling collector. Each collect snapshots the VM's
//! allocation profile and emits only the samples that appeared since the
//! previous cycle, together with a flattened copy of the allocation node
//! tree keyed by VM node id.

use log::debug;
use rustc_hash::FxHashMap;

use crate::api::{HeapNode, HeapProfileData, HeapProfilerOptions, HeapSample};
use crate::vm::{Clock, HeapSampler};

/// Collector around the VM's sampling heap profiler. One VM, one collector;
/// the host embeds a single instance next to its registry.
pub struct HeapProfiler {
    sampler: Box<dyn HeapSampler>,
    clock: Box<dyn Clock>,
    /// Bumped per collect. A tracking entry stamped with an older value
    /// belongs to a sample the VM has since dropped.
    generation: u64,
    /// VM sample id to the generation it was last observed in.
    tracking: FxHashMap<u64, u64>,
    /// Reused across collects to walk the node tree without churn.
    work_stack: Vec<(usize, u32)>,
    running: bool,
}

impl HeapProfiler {
    pub fn new(sampler: Box<dyn HeapSampler>, clock: Box<dyn Clock>) -> Self {
        Self {
            sampler,
            clock,
            generation: 0,
            tracking: FxHashMap::default(),
            work_stack: Vec::with_capacity(128),
            running: false,
        }
    }

    /// Starts VM heap sampling. Idempotent while running.
    pub fn start(&mut self, options: &HeapProfilerOptions) -> bool {
        if self.running {
            return true;
        }

        self.running = self
            .sampler
            .start_sampling(options.sample_interval_bytes, options.max_stack_depth);
        if self.running {
            debug!(
                "started heap profiling: {} byte interval, depth {}",
                options.sample_interval_bytes, options.max_stack_depth
            );
        }
        self.running
    }

    /// Snapshots the allocation profile and emits the delta since the last
    /// collect. `None` when not running or the VM had no profile.
    pub fn collect(&mut self) -> Option<HeapProfileData> {
        if !self.running {
            return None;
        }

        let collect_begin = self.clock.monotonic_nanos();
        let profile = self.sampler.allocation_profile()?;
        let processing_begin = self.clock.monotonic_nanos();

        self.generation += 1;
        let generation = self.generation;

        let mut samples = Vec::new();
        for sample in &profile.samples {
            if !self.tracking.contains_key(&sample.sample_id) {
                samples.push(HeapSample {
                    node_id: sample.node_id,
                    size: sample.size * sample.count,
                });
            }
            self.tracking.insert(sample.sample_id, generation);
        }
        // Anything the VM did not report this cycle is gone on its side too.
        self.tracking.retain(|_, stamp| *stamp == generation);

        let mut tree_map = FxHashMap::default();
        self.work_stack.clear();
        if let Some(root) = profile.nodes.first() {
            // The root node carries no allocation site; start from its
            // children.
            for &child in &root.children {
                self.work_stack.push((child, root.node_id));
            }
        }
        while let Some((index, parent_id)) = self.work_stack.pop() {
            let Some(node) = profile.nodes.get(index) else {
                continue;
            };
            tree_map.insert(
                node.node_id,
                HeapNode {
                    name: node.name.clone(),
                    script_name: node.script_name.clone(),
                    line_number: node.line_number,
                    parent_id,
                },
            );
            for &child in &node.children {
                self.work_stack.push((child, node.node_id));
            }
        }

        let processing_end = self.clock.monotonic_nanos();

        Some(HeapProfileData {
            tree_map,
            samples,
            timestamp: self.clock.epoch_millis(),
            profiler_collect_duration: processing_begin - collect_begin,
            profiler_processing_step_duration: processing_end - processing_begin,
        })
    }

    /// Stops VM heap sampling and tears down the delta-tracking state.
    pub fn stop(&mut self) {
        if self.running {
            self.sampler.stop_sampling();
            debug!("stopped heap profiling");
        }
        self.running = false;
        self.generation = 0;
        self.tracking = FxHashMap::default();
        self.work_stack.clear();
    }

    pub fn is_running(&self) -> bool {
        self.running
    }
}
