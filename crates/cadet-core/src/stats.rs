//! Named statistics counters

use std::collections::BTreeMap;

/// Counter table keyed by a human readable name such as `"# wrong HMAC"`
#[derive(Debug, Clone, Default)]
pub struct Statistics {
    values: BTreeMap<&'static str, i64>,
}

impl Statistics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `delta` to a counter
    pub fn update(&mut self, name: &'static str, delta: i64) {
        *self.values.entry(name).or_insert(0) += delta;
    }

    /// Increment a counter by one
    pub fn bump(&mut self, name: &'static str) {
        self.update(name, 1);
    }

    /// Overwrite a gauge
    pub fn set(&mut self, name: &'static str, value: i64) {
        self.values.insert(name, value);
    }

    /// Current value (0 when never touched)
    pub fn get(&self, name: &str) -> i64 {
        self.values.get(name).copied().unwrap_or(0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&'static str, i64)> + '_ {
        self.values.iter().map(|(k, v)| (*k, *v))
    }
}
