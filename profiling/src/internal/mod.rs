// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod activation;
mod index;
mod profiler;
mod stack_table;

pub use activation::*;
pub use index::*;
pub use profiler::*;
pub use stack_table::*;
