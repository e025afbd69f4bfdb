// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Scripted stand-ins for the VM side of the profiling seam.

#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use spanprof_profiling::vm::{
    AllocationNode, AllocationProfile, AllocationSample, Clock, CpuProfile, CpuProfileNode,
    CpuProfileSample, CpuSampler, HeapSampler,
};

pub const MS: i64 = 1_000_000;

/// Wall-clock offset of the test clock's monotonic origin.
pub const WALL_EPOCH_NANOS: i64 = 1_700_000_000_000_000_000;

/// A manually stepped clock. Wall time tracks monotonic time from a fixed
/// epoch so conversions stay easy to assert against.
#[derive(Clone)]
pub struct TestClock {
    now: Rc<Cell<i64>>,
}

impl TestClock {
    pub fn new() -> Self {
        Self {
            now: Rc::new(Cell::new(0)),
        }
    }

    pub fn set_ms(&self, ms: i64) {
        self.now.set(ms * MS);
    }

    pub fn advance(&self, nanos: i64) {
        self.now.set(self.now.get() + nanos);
    }
}

impl Clock for TestClock {
    fn monotonic_nanos(&self) -> i64 {
        self.now.get()
    }

    fn epoch_nanos(&self) -> i64 {
        WALL_EPOCH_NANOS + self.now.get()
    }
}

#[derive(Default)]
struct ScriptedCpuState {
    sampling_interval_micros: i32,
    started: Vec<String>,
    stopped: Vec<String>,
    next_profile: Option<CpuProfile>,
}

/// CPU sampler whose sessions return whatever profile the test queued.
/// Optionally advances the shared clock inside `start` to model a slow VM
/// start (which is what gives the sample cutoff point its bite).
#[derive(Clone)]
pub struct ScriptedCpuSampler {
    state: Rc<RefCell<ScriptedCpuState>>,
    clock: TestClock,
    start_delay_nanos: i64,
}

impl ScriptedCpuSampler {
    pub fn new(clock: &TestClock) -> Self {
        Self {
            state: Rc::new(RefCell::new(ScriptedCpuState::default())),
            clock: clock.clone(),
            start_delay_nanos: 0,
        }
    }

    pub fn with_start_delay(clock: &TestClock, start_delay_nanos: i64) -> Self {
        Self {
            start_delay_nanos,
            ..Self::new(clock)
        }
    }

    pub fn queue_profile(&self, profile: CpuProfile) {
        self.state.borrow_mut().next_profile = Some(profile);
    }

    pub fn sampling_interval_micros(&self) -> i32 {
        self.state.borrow().sampling_interval_micros
    }

    pub fn started_titles(&self) -> Vec<String> {
        self.state.borrow().started.clone()
    }

    pub fn stopped_titles(&self) -> Vec<String> {
        self.state.borrow().stopped.clone()
    }
}

impl CpuSampler for ScriptedCpuSampler {
    fn set_sampling_interval(&mut self, interval_micros: i32) {
        self.state.borrow_mut().sampling_interval_micros = interval_micros;
    }

    fn start(&mut self, title: &str) {
        self.state.borrow_mut().started.push(title.to_owned());
        self.clock.advance(self.start_delay_nanos);
    }

    fn stop(&mut self, title: &str) -> Option<CpuProfile> {
        let mut state = self.state.borrow_mut();
        state.stopped.push(title.to_owned());
        state.next_profile.take()
    }
}

/// Builds a profile whose samples all hit the same `outer -> inner` stack.
pub fn single_stack_profile(start_ms: i64, sample_ms: &[i64]) -> CpuProfile {
    let nodes = vec![
        CpuProfileNode {
            function_name: "(root)".into(),
            script_name: String::new(),
            line_number: 0,
            column_number: 0,
            node_id: 1,
            parent: None,
        },
        CpuProfileNode {
            function_name: "outer".into(),
            script_name: "index.js".into(),
            line_number: 12,
            column_number: 1,
            node_id: 2,
            parent: Some(0),
        },
        CpuProfileNode {
            function_name: "inner".into(),
            script_name: "worker.js".into(),
            line_number: 48,
            column_number: 17,
            node_id: 3,
            parent: Some(1),
        },
    ];
    CpuProfile {
        start_time_micros: start_ms * 1000,
        nodes,
        samples: sample_ms
            .iter()
            .map(|ms| CpuProfileSample {
                node: 2,
                timestamp_micros: ms * 1000,
            })
            .collect(),
    }
}

#[derive(Default)]
struct ScriptedHeapState {
    sample_interval_bytes: u64,
    max_stack_depth: u32,
    sampling: bool,
    next_profile: Option<AllocationProfile>,
}

/// Heap sampler returning queued allocation profiles. Advances the shared
/// clock inside `allocation_profile` so the collect duration is assertable.
#[derive(Clone)]
pub struct ScriptedHeapSampler {
    state: Rc<RefCell<ScriptedHeapState>>,
    clock: TestClock,
    snapshot_delay_nanos: i64,
}

impl ScriptedHeapSampler {
    pub fn new(clock: &TestClock) -> Self {
        Self {
            state: Rc::new(RefCell::new(ScriptedHeapState::default())),
            clock: clock.clone(),
            snapshot_delay_nanos: 0,
        }
    }

    pub fn with_snapshot_delay(clock: &TestClock, snapshot_delay_nanos: i64) -> Self {
        Self {
            snapshot_delay_nanos,
            ..Self::new(clock)
        }
    }

    pub fn queue_profile(&self, profile: AllocationProfile) {
        self.state.borrow_mut().next_profile = Some(profile);
    }

    pub fn is_sampling(&self) -> bool {
        self.state.borrow().sampling
    }

    pub fn configured(&self) -> (u64, u32) {
        let state = self.state.borrow();
        (state.sample_interval_bytes, state.max_stack_depth)
    }
}

impl HeapSampler for ScriptedHeapSampler {
    fn start_sampling(&mut self, sample_interval_bytes: u64, max_stack_depth: u32) -> bool {
        let mut state = self.state.borrow_mut();
        state.sample_interval_bytes = sample_interval_bytes;
        state.max_stack_depth = max_stack_depth;
        state.sampling = true;
        true
    }

    fn stop_sampling(&mut self) {
        self.state.borrow_mut().sampling = false;
    }

    fn allocation_profile(&mut self) -> Option<AllocationProfile> {
        self.clock.advance(self.snapshot_delay_nanos);
        self.state.borrow_mut().next_profile.take()
    }
}

/// Allocation tree: root -> (alloc_a -> alloc_c, alloc_b), with one sample
/// per given (sample_id, node_id, size) triple.
pub fn allocation_profile(samples: &[(u64, u32, u64)]) -> AllocationProfile {
    let nodes = vec![
        AllocationNode {
            node_id: 1,
            name: "(root)".into(),
            script_name: String::new(),
            line_number: 0,
            children: vec![1, 2],
        },
        AllocationNode {
            node_id: 2,
            name: "alloc_a".into(),
            script_name: "a.js".into(),
            line_number: 7,
            children: vec![3],
        },
        AllocationNode {
            node_id: 3,
            name: "alloc_b".into(),
            script_name: "b.js".into(),
            line_number: 19,
            children: Vec::new(),
        },
        AllocationNode {
            node_id: 4,
            name: "alloc_c".into(),
            script_name: "c.js".into(),
            line_number: 31,
            children: Vec::new(),
        },
    ];
    AllocationProfile {
        nodes,
        samples: samples
            .iter()
            .map(|(sample_id, node_id, size)| AllocationSample {
                sample_id: *sample_id,
                node_id: *node_id,
                size: *size,
                count: 1,
            })
            .collect(),
    }
}

/// Repeats a two-character hex pattern, e.g. `hex_id("0a", 16)` for a trace
/// id of sixteen `0x0a` bytes.
pub fn hex_id(pattern: &str, bytes: usize) -> String {
    pattern.repeat(bytes)
}
