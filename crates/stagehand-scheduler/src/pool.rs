//! Pool capacity configuration.

use serde::{Deserialize, Serialize};
use stagehand_core::command::THREADS;
use std::collections::BTreeMap;

/// Total amount of each resource category that may be granted at once.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourcePool {
    capacity: BTreeMap<String, u32>,
}

impl ResourcePool {
    pub fn empty() -> Self {
        Self {
            capacity: BTreeMap::new(),
        }
    }

    /// A pool with only the `threads` category.
    pub fn threads(amount: u32) -> Self {
        Self::empty().with_capacity(THREADS, amount)
    }

    pub fn with_capacity(mut self, category: impl Into<String>, amount: u32) -> Self {
        self.capacity.insert(category.into(), amount);
        self
    }

    pub fn capacity(&self, category: &str) -> Option<u32> {
        self.capacity.get(category).copied()
    }

    pub fn categories(&self) -> impl Iterator<Item = (&str, u32)> {
        self.capacity.iter().map(|(k, v)| (k.as_str(), *v))
    }
}

impl Default for ResourcePool {
    /// One thread per available CPU.
    fn default() -> Self {
        let cpus = std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1);
        Self::threads(cpus)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_pool_has_threads() {
        assert!(ResourcePool::default().capacity(THREADS).unwrap() >= 1);
    }

    #[test]
    fn test_unknown_category() {
        assert_eq!(ResourcePool::threads(2).capacity("gpu"), None);
    }
}
