//! Token usage accounting.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::ops::{Add, AddAssign};

/// Token usage statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    /// Tokens sent to the model.
    pub prompt_tokens: u64,
    /// Tokens generated by the model.
    pub completion_tokens: u64,
    /// Sum of prompt and completion tokens.
    pub total_tokens: u64,
}

impl TokenUsage {
    /// Creates usage from prompt and completion counts.
    #[must_use]
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }

    /// Returns true if nothing has been counted.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0 && self.prompt_tokens == 0 && self.completion_tokens == 0
    }
}

impl Add for TokenUsage {
    type Output = Self;

    fn add(self, rhs: Self) -> Self {
        Self {
            prompt_tokens: self.prompt_tokens + rhs.prompt_tokens,
            completion_tokens: self.completion_tokens + rhs.completion_tokens,
            total_tokens: self.total_tokens + rhs.total_tokens,
        }
    }
}

impl AddAssign for TokenUsage {
    fn add_assign(&mut self, rhs: Self) {
        *self = *self + rhs;
    }
}

impl std::iter::Sum for TokenUsage {
    fn sum<I: Iterator<Item = Self>>(iter: I) -> Self {
        iter.fold(Self::default(), Add::add)
    }
}

/// Cumulative usage owned by a provider instance.
///
/// The counter is shared between the provider and the conversation driving
/// it, so all methods take `&self`. Besides the running totals it tracks the
/// prompt size of the latest request, which is what the context window holds.
#[derive(Debug, Default)]
pub struct UsageCounter {
    inner: Mutex<CounterState>,
}

#[derive(Debug, Clone, Copy, Default)]
struct CounterState {
    totals: TokenUsage,
    context_tokens: u64,
}

impl UsageCounter {
    /// Creates an empty counter.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds the usage of one request.
    ///
    /// The request's prompt tokens become the current context size.
    pub fn record(&self, usage: TokenUsage) {
        let mut state = self.inner.lock();
        state.totals += usage;
        state.context_tokens = usage.prompt_tokens;
    }

    /// Returns the current totals.
    #[must_use]
    pub fn snapshot(&self) -> TokenUsage {
        self.inner.lock().totals
    }

    /// Returns the prompt size of the latest request.
    #[must_use]
    pub fn context_tokens(&self) -> u64 {
        self.inner.lock().context_tokens
    }

    /// Zeroes every field.
    pub fn reset(&self) {
        *self.inner.lock() = CounterState::default();
    }

    /// Sets the tracked context size after a summarization.
    ///
    /// The summary becomes the whole prompt, so prompt and total tokens both
    /// take the new value and completion tokens restart from zero.
    pub fn set_total_tokens(&self, tokens: u64) {
        *self.inner.lock() = CounterState {
            totals: TokenUsage {
                prompt_tokens: tokens,
                completion_tokens: 0,
                total_tokens: tokens,
            },
            context_tokens: tokens,
        };
    }

    /// Copies totals and context size from another counter, used when usage
    /// moves to a new provider.
    pub fn restore_from(&self, other: &UsageCounter) {
        let state = *other.inner.lock();
        *self.inner.lock() = state;
    }
}
