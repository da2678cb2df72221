use std::collections::HashMap;
use std::sync::Mutex;

use tracing::warn;

/// Thread-safe warn-once facility.
///
/// Parallel signal workers produce the same warning for the same
/// (strategy, signal, contract) key many times; this keeps the log bounded.
/// The emission happens while the lock is held so interleaved messages from
/// concurrent workers cannot merge.
#[derive(Debug, Default)]
pub struct WarnDedup {
    counts: Mutex<HashMap<String, u64>>,
}

impl WarnDedup {
    pub fn new() -> Self {
        Self::default()
    }

    /// Emits `msg` only on the first observation of `key`.
    /// Returns true when the message was actually emitted.
    pub fn warn_once(&self, key: &str, msg: &str) -> bool {
        let mut counts = self.counts.lock().expect("warn dedup lock poisoned");
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        if *count == 1 {
            warn!("{}", msg);
            true
        } else {
            false
        }
    }

    /// Number of times `key` was observed so far.
    pub fn count(&self, key: &str) -> u64 {
        let counts = self.counts.lock().expect("warn dedup lock poisoned");
        counts.get(key).copied().unwrap_or(0)
    }

    /// One-line digest: unique keys, total observations, top offenders.
    pub fn summary(&self, top_n: usize) -> String {
        let counts = self.counts.lock().expect("warn dedup lock poisoned");
        if counts.is_empty() {
            return "dedup warnings: none".to_string();
        }
        let unique = counts.len();
        let total: u64 = counts.values().sum();
        let mut items: Vec<(&String, &u64)> = counts.iter().collect();
        items.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        let top: Vec<String> = items
            .iter()
            .take(top_n)
            .map(|(k, v)| format!("{}:{}", k, v))
            .collect();
        format!(
            "dedup warnings: unique={}, total={}. Top: {}",
            unique,
            total,
            top.join(", ")
        )
    }
}
