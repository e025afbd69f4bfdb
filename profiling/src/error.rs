// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use spanprof_alloc::AllocError;

/// Configuration errors surfaced synchronously to the host. Everything else
/// in the core degrades silently: observability must not crash the host.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
#[non_exhaustive]
pub enum ProfilingError {
    #[error("profiler name can't be empty")]
    EmptyName,
    #[error("profiler name does not fit 64 bytes")]
    NameTooLong,
    #[error("a profiler with this name already exists")]
    DuplicateName,
    #[error("sampling interval must be a positive number of microseconds")]
    InvalidSamplingInterval,
    /// Failed to allocate the memory a profiler instance needs up front.
    #[error("out of memory")]
    OutOfMemory,
}

impl From<AllocError> for ProfilingError {
    #[cold]
    fn from(_: AllocError) -> Self {
        Self::OutOfMemory
    }
}
