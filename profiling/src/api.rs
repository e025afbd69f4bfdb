// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-facing option structs and the result objects handed to the external
//! exporter. Field spellings on the wire follow the exporter's schema; the
//! host layer owns transport, not shape.

use rustc_hash::FxHashMap;
use serde::ser::SerializeTuple;
use serde::{Deserialize, Serialize, Serializer};

/// Maximum length of a profiler name in bytes.
pub const MAX_PROFILER_NAME_LEN: usize = 64;

/// Grace window after profiling start during which early, biased samples
/// may be suppressed.
pub const DEFAULT_MAX_SAMPLE_CUTOFF_DELAY_MICROS: i64 = 500_000;

pub const DEFAULT_HEAP_SAMPLE_INTERVAL_BYTES: u64 = 128 * 1024;
pub const DEFAULT_HEAP_MAX_STACK_DEPTH: u32 = 256;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CpuProfilerOptions {
    /// Unique name of the profiler; doubles as the session title prefix.
    pub name: String,
    /// Requested sampling interval. Required and positive.
    pub sampling_interval_microseconds: i32,
    /// Attach the activation dump and start timepoint to each result.
    pub record_debug_info: bool,
    /// Drop samples that match no activation.
    pub only_filtered_stacktraces: bool,
    pub max_sample_cutoff_delay_microseconds: i64,
}

impl Default for CpuProfilerOptions {
    fn default() -> Self {
        Self {
            name: String::new(),
            sampling_interval_microseconds: 0,
            record_debug_info: false,
            only_filtered_stacktraces: false,
            max_sample_cutoff_delay_microseconds: DEFAULT_MAX_SAMPLE_CUTOFF_DELAY_MICROS,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeapProfilerOptions {
    /// Forwarded to the VM's sampling heap profiler.
    pub sample_interval_bytes: u64,
    pub max_stack_depth: u32,
}

impl Default for HeapProfilerOptions {
    fn default() -> Self {
        Self {
            sample_interval_bytes: DEFAULT_HEAP_SAMPLE_INTERVAL_BYTES,
            max_stack_depth: DEFAULT_HEAP_MAX_STACK_DEPTH,
        }
    }
}

/// One line of a stack trace. Serializes as the exporter's
/// `[file, function, line, column]` tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StackFrame {
    pub file: String,
    pub function: String,
    pub line: i64,
    pub column: i64,
}

impl Serialize for StackFrame {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut tuple = serializer.serialize_tuple(4)?;
        tuple.serialize_element(&self.file)?;
        tuple.serialize_element(&self.function)?;
        tuple.serialize_element(&self.line)?;
        tuple.serialize_element(&self.column)?;
        tuple.end()
    }
}

/// One kept sample joined against the activation that enclosed it, if any.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackTrace {
    /// Wall-clock nanoseconds as a decimal string. The value needs all 64
    /// bits; the host layer must not round-trip it through a double.
    pub timestamp: String,
    #[serde(rename = "stacktrace")]
    pub frames: Vec<StackFrame>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<[u8; 8]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<[u8; 16]>,
}

/// Activation dump attached to results when `recordDebugInfo` is set.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationDebugInfo {
    pub start: String,
    pub end: String,
    pub trace_id: String,
    pub span_id: String,
}

/// Result of one CPU collect/stop cycle.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CpuProfileData {
    /// Wall-clock start of the processed session, decimal nanoseconds.
    pub start_time_nanos: String,
    pub stacktraces: Vec<StackTrace>,
    /// Nanoseconds spent starting the next VM session.
    pub profiler_start_duration: i64,
    /// Nanoseconds spent stopping the previous VM session.
    pub profiler_stop_duration: i64,
    /// Nanoseconds spent joining samples against activations.
    pub profiler_processing_step_duration: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_timepoint: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub activations: Option<Vec<ActivationDebugInfo>>,
}

/// A node of the flattened allocation tree, keyed by the VM node id it was
/// emitted under.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapNode {
    pub name: String,
    pub script_name: String,
    pub line_number: i64,
    /// VM node id of the parent, linking the flat map back into a tree.
    pub parent_id: u32,
}

/// An allocation sample not reported in any earlier collect cycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapSample {
    pub node_id: u32,
    /// Sampled bytes: size times count.
    pub size: u64,
}

/// Result of one heap collect cycle.
#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HeapProfileData {
    pub tree_map: FxHashMap<u32, HeapNode>,
    pub samples: Vec<HeapSample>,
    /// Wall-clock milliseconds at collect time.
    pub timestamp: i64,
    /// Nanoseconds the VM spent producing the allocation profile.
    pub profiler_collect_duration: i64,
    /// Nanoseconds spent flattening and diffing the profile.
    pub profiler_processing_step_duration: i64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stack_frame_serializes_as_tuple() {
        let frame = StackFrame {
            file: "app.js".into(),
            function: "handler".into(),
            line: 10,
            column: 4,
        };
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(serde_json::json!(["app.js", "handler", 10, 4]), value);
    }

    #[test]
    fn test_options_deserialize_with_defaults() {
        let options: CpuProfilerOptions = serde_json::from_str(
            r#"{"name":"main","samplingIntervalMicroseconds":10000}"#,
        )
        .unwrap();
        assert_eq!("main", options.name);
        assert_eq!(10_000, options.sampling_interval_microseconds);
        assert!(!options.record_debug_info);
        assert!(!options.only_filtered_stacktraces);
        assert_eq!(
            DEFAULT_MAX_SAMPLE_CUTOFF_DELAY_MICROS,
            options.max_sample_cutoff_delay_microseconds
        );

        let heap: HeapProfilerOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(DEFAULT_HEAP_SAMPLE_INTERVAL_BYTES, heap.sample_interval_bytes);
        assert_eq!(DEFAULT_HEAP_MAX_STACK_DEPTH, heap.max_stack_depth);
    }
}
