use crate::error::StoreError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Per-topology tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologyConfig {
    /// Share of a task's declared parallelization given to the heavy stage
    /// by the throttling evaluator; the light stage receives the remainder.
    pub heavy_stage_fraction: f64,
    /// Capacity of the feeder's bounded record queue.
    pub queue_capacity: usize,
}

impl Default for TopologyConfig {
    fn default() -> Self {
        Self {
            heavy_stage_fraction: 0.4,
            queue_capacity: 100,
        }
    }
}

/// The set of topologies this deployment recognizes.
///
/// Built once at process start and passed by reference to whatever needs to
/// validate a topology name; there is no process-wide mutable list.
#[derive(Debug, Clone, Default)]
pub struct TopologyRegistry {
    topologies: BTreeMap<String, TopologyConfig>,
}

impl TopologyRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_topology(mut self, name: impl Into<String>, config: TopologyConfig) -> Self {
        self.topologies.insert(name.into(), config);
        self
    }

    pub fn contains(&self, name: &str) -> bool {
        self.topologies.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&TopologyConfig> {
        self.topologies.get(name)
    }

    /// Resolves a topology or fails with the error task registration uses.
    pub fn resolve(&self, name: &str) -> Result<&TopologyConfig, StoreError> {
        self.topologies
            .get(name)
            .ok_or_else(|| StoreError::UnknownTopology(name.to_string()))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.topologies.keys().map(String::as_str)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_known_topologies_only() {
        let registry = TopologyRegistry::new()
            .with_topology("oai_harvest", TopologyConfig::default())
            .with_topology("media_process", TopologyConfig::default());

        assert!(registry.contains("oai_harvest"));
        assert!(registry.resolve("media_process").is_ok());
        assert!(matches!(
            registry.resolve("unknown"),
            Err(StoreError::UnknownTopology(_))
        ));
    }
}
