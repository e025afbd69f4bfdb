// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

pub mod api;
pub mod error;
pub mod heap;
pub mod hex;
pub mod internal;
pub mod registry;
pub mod vm;

pub use error::ProfilingError;
pub use heap::HeapProfiler;
pub use registry::ProfilerRegistry;
