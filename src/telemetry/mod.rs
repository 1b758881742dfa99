//! Telemetry and usage tracking
//!
//! Tracks token usage reported by model backends, per model and in total.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Token counts for a single request/operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenCounts {
    /// Number of tokens in the input/prompt
    pub input: u64,
    /// Number of tokens in the output/completion
    pub output: u64,
}

impl TokenCounts {
    pub fn new(input: u64, output: u64) -> Self {
        Self { input, output }
    }

    /// Total tokens (input + output)
    pub fn total(&self) -> u64 {
        self.input.saturating_add(self.output)
    }
}

impl From<&crate::provider::Usage> for TokenCounts {
    fn from(usage: &crate::provider::Usage) -> Self {
        Self::new(usage.prompt_tokens as u64, usage.completion_tokens as u64)
    }
}

/// Thread-safe token usage tracker for a single model
#[derive(Debug)]
pub struct TokenUsageTracker {
    total_input: AtomicU64,
    total_output: AtomicU64,
    request_count: AtomicU64,
    max_total: AtomicU64,
    name: String,
}

impl TokenUsageTracker {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            total_input: AtomicU64::new(0),
            total_output: AtomicU64::new(0),
            request_count: AtomicU64::new(0),
            max_total: AtomicU64::new(0),
            name: name.into(),
        }
    }

    /// Record token usage for a single request
    pub fn record(&self, counts: TokenCounts) {
        self.total_input.fetch_add(counts.input, Ordering::Relaxed);
        self.total_output.fetch_add(counts.output, Ordering::Relaxed);
        self.request_count.fetch_add(1, Ordering::Relaxed);
        self.max_total.fetch_max(counts.total(), Ordering::Relaxed);
    }

    pub fn totals(&self) -> TokenCounts {
        TokenCounts {
            input: self.total_input.load(Ordering::Relaxed),
            output: self.total_output.load(Ordering::Relaxed),
        }
    }

    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> TokenUsageSnapshot {
        TokenUsageSnapshot {
            name: self.name.clone(),
            totals: self.totals(),
            request_count: self.request_count(),
            max_total: self.max_total.load(Ordering::Relaxed),
        }
    }
}

/// Immutable snapshot of token usage state
#[derive(Debug, Clone, Serialize)]
pub struct TokenUsageSnapshot {
    pub name: String,
    pub totals: TokenCounts,
    pub request_count: u64,
    pub max_total: u64,
}

/// Everything the registry knows, as served on `/api/usage`.
#[derive(Debug, Clone, Serialize)]
pub struct TokenUsageReport {
    pub global: TokenUsageSnapshot,
    pub models: Vec<TokenUsageSnapshot>,
}

/// Tracks usage by model plus a global total
#[derive(Debug)]
pub struct TokenUsageRegistry {
    by_model: RwLock<HashMap<String, Arc<TokenUsageTracker>>>,
    global: Arc<TokenUsageTracker>,
}

impl TokenUsageRegistry {
    pub fn new() -> Self {
        Self {
            by_model: RwLock::new(HashMap::new()),
            global: Arc::new(TokenUsageTracker::new("global")),
        }
    }

    /// Record usage for a specific model
    pub fn record_model_usage(&self, model: &str, counts: TokenCounts) {
        let tracker = {
            let mut models = self.by_model.write();
            models
                .entry(model.to_string())
                .or_insert_with(|| Arc::new(TokenUsageTracker::new(model)))
                .clone()
        };

        tracker.record(counts);
        self.global.record(counts);
    }

    pub fn global_snapshot(&self) -> TokenUsageSnapshot {
        self.global.snapshot()
    }

    /// Snapshots for every model seen so far, sorted by name
    pub fn model_snapshots(&self) -> Vec<TokenUsageSnapshot> {
        let mut snapshots: Vec<_> = self
            .by_model
            .read()
            .values()
            .map(|t| t.snapshot())
            .collect();
        snapshots.sort_by(|a, b| a.name.cmp(&b.name));
        snapshots
    }

    pub fn report(&self) -> TokenUsageReport {
        TokenUsageReport {
            global: self.global_snapshot(),
            models: self.model_snapshots(),
        }
    }
}

impl Default for TokenUsageRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global token usage registry
pub static TOKEN_USAGE: once_cell::sync::Lazy<TokenUsageRegistry> =
    once_cell::sync::Lazy::new(TokenUsageRegistry::new);
