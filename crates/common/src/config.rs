use std::env;

use serde::{Deserialize, Serialize};

use crate::error::{QuarryError, Result};

/// Engine-wide execution settings shared by planner, executor and workers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Target rows per batch produced by scans and builders.
    pub batch_size_rows: usize,
    /// Lower bound for batch size under memory pressure.
    pub min_batch_size_rows: usize,
    /// Ceiling for the whole buffer pool of one engine/worker.
    pub mem_budget_bytes: usize,
    /// Default per-query limit drawn from the pool.
    pub query_mem_limit_bytes: usize,
    /// Hash partitions used for repartitioning exchanges.
    pub shuffle_partitions: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            batch_size_rows: 8192,
            min_batch_size_rows: 1024,
            mem_budget_bytes: 512 * 1024 * 1024,
            query_mem_limit_bytes: 256 * 1024 * 1024,
            shuffle_partitions: 8,
        }
    }
}

impl EngineConfig {
    /// Apply `QUARRY_*` environment overrides on top of `self`.
    ///
    /// Recognized keys: `QUARRY_BATCH_SIZE_ROWS`, `QUARRY_MIN_BATCH_SIZE_ROWS`,
    /// `QUARRY_MEM_BUDGET_BYTES`, `QUARRY_QUERY_MEM_LIMIT_BYTES`,
    /// `QUARRY_SHUFFLE_PARTITIONS`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides(|key| env::var(key).ok())
    }

    /// Apply overrides looked up by `QUARRY_*` key, then validate.
    pub fn with_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str, default: usize| -> Result<usize> {
            match lookup(key) {
                Some(v) => v
                    .trim()
                    .parse::<usize>()
                    .map_err(|e| QuarryError::InvalidConfig(format!("{key}={v:?}: {e}"))),
                None => Ok(default),
            }
        };
        self.batch_size_rows = read("QUARRY_BATCH_SIZE_ROWS", self.batch_size_rows)?;
        self.min_batch_size_rows = read("QUARRY_MIN_BATCH_SIZE_ROWS", self.min_batch_size_rows)?;
        self.mem_budget_bytes = read("QUARRY_MEM_BUDGET_BYTES", self.mem_budget_bytes)?;
        self.query_mem_limit_bytes =
            read("QUARRY_QUERY_MEM_LIMIT_BYTES", self.query_mem_limit_bytes)?;
        self.shuffle_partitions = read("QUARRY_SHUFFLE_PARTITIONS", self.shuffle_partitions)?;
        self.validate()?;
        Ok(self)
    }

    /// Reject settings no executor can run with.
    pub fn validate(&self) -> Result<()> {
        if self.batch_size_rows == 0 {
            return Err(QuarryError::InvalidConfig(
                "batch_size_rows must be > 0".to_string(),
            ));
        }
        if self.shuffle_partitions == 0 {
            return Err(QuarryError::InvalidConfig(
                "shuffle_partitions must be > 0".to_string(),
            ));
        }
        if self.query_mem_limit_bytes > self.mem_budget_bytes {
            return Err(QuarryError::InvalidConfig(format!(
                "query_mem_limit_bytes ({}) exceeds mem_budget_bytes ({})",
                self.query_mem_limit_bytes, self.mem_budget_bytes
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn default_config_is_valid() {
        EngineConfig::default().validate().expect("valid defaults");
    }

    #[test]
    fn rejects_query_limit_above_pool() {
        let cfg = EngineConfig {
            mem_budget_bytes: 10,
            query_mem_limit_bytes: 20,
            ..EngineConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(QuarryError::InvalidConfig(_))));
    }

    #[test]
    fn overrides_replace_only_the_keys_present() {
        let vars: HashMap<&str, &str> = [
            ("QUARRY_BATCH_SIZE_ROWS", " 512 "),
            ("QUARRY_SHUFFLE_PARTITIONS", "3"),
        ]
        .into_iter()
        .collect();
        let cfg = EngineConfig::default()
            .with_overrides(|k| vars.get(k).map(|v| v.to_string()))
            .unwrap();
        assert_eq!(cfg.batch_size_rows, 512);
        assert_eq!(cfg.shuffle_partitions, 3);
        assert_eq!(cfg.mem_budget_bytes, EngineConfig::default().mem_budget_bytes);
    }

    #[test]
    fn malformed_or_invalid_overrides_are_rejected() {
        let err = EngineConfig::default()
            .with_overrides(|k| (k == "QUARRY_MEM_BUDGET_BYTES").then(|| "lots".to_string()))
            .unwrap_err();
        assert!(matches!(err, QuarryError::InvalidConfig(msg) if msg.contains("QUARRY_MEM_BUDGET_BYTES")));

        let err = EngineConfig::default()
            .with_overrides(|k| (k == "QUARRY_SHUFFLE_PARTITIONS").then(|| "0".to_string()))
            .unwrap_err();
        assert!(matches!(err, QuarryError::InvalidConfig(_)));
    }

    #[test]
    fn rejects_zero_partitions() {
        let cfg = EngineConfig {
            shuffle_partitions: 0,
            ..EngineConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
