// Copyright 2025-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use rustc_hash::FxHashMap;
use spanprof_alloc::PagedArena;

use super::activation::{ActivationStack, SpanActivation};

/// In-progress activations keyed by the host's 32-bit context identity.
/// Distinct contexts hashing to the same key mis-attribute samples between
/// each other; the host keeps the keys well distributed.
#[derive(Default)]
pub struct ActivationStackTable {
    stacks: FxHashMap<u32, ActivationStack>,
}

impl ActivationStackTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pushes a fresh activation for `context_key`. Returns false when the
    /// arena could not back the stack and the activation was dropped.
    pub fn push(
        &mut self,
        arena: &mut PagedArena,
        context_key: u32,
        activation: SpanActivation,
    ) -> bool {
        let stack = self.stacks.entry(context_key).or_default();
        let pushed = stack.push(arena, activation);
        if !pushed && stack.is_empty() {
            self.stacks.remove(&context_key);
        }
        pushed
    }

    /// Pops the innermost in-progress activation for `context_key`, removing
    /// the entry once the context has no open activations. Unknown contexts
    /// are a no-op.
    pub fn pop(&mut self, context_key: u32) -> Option<SpanActivation> {
        let stack = self.stacks.get_mut(&context_key)?;
        let activation = stack.pop();
        if stack.is_empty() {
            self.stacks.remove(&context_key);
        }
        activation
    }

    /// Drops every tracked stack. Must run before the arena backing the
    /// overflow buffers resets.
    pub fn clear(&mut self) {
        self.stacks.clear();
    }

    pub fn len(&self) -> usize {
        self.stacks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stacks.is_empty()
    }
}
