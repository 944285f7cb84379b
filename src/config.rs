use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};

fn default_num_streams() -> usize {
    4
}

fn default_fusion_threshold_mb() -> usize {
    16
}

fn default_fusion_max_ops() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Identity of the machine this process runs on; selects which subsequence
    /// of each device set is locally owned.
    #[serde(default)]
    pub machine_id: u32,
    /// Number of execution streams in the round-robin pool.
    #[serde(default = "default_num_streams")]
    pub num_streams: usize,
    /// Upper bound on the total payload of one fused group, in MB.
    #[serde(default = "default_fusion_threshold_mb")]
    pub fusion_threshold_mb: usize,
    /// Upper bound on the number of requests fused into one group.
    #[serde(default = "default_fusion_max_ops")]
    pub fusion_max_ops: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            machine_id: 0,
            num_streams: default_num_streams(),
            fusion_threshold_mb: default_fusion_threshold_mb(),
            fusion_max_ops: default_fusion_max_ops(),
        }
    }
}

impl SchedulerConfig {
    pub fn from_path<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn fusion_threshold_bytes(&self) -> usize {
        self.fusion_threshold_mb << 20
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SchedulerConfig::default();
        assert_eq!(config.machine_id, 0);
        assert_eq!(config.num_streams, 4);
        assert_eq!(config.fusion_threshold_bytes(), 16 << 20);
        assert_eq!(config.fusion_max_ops, 64);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: SchedulerConfig = toml::from_str("machine_id = 3").unwrap();
        assert_eq!(config.machine_id, 3);
        assert_eq!(config.num_streams, 4);
    }

    #[test]
    fn unknown_field_rejected() {
        let res: Result<SchedulerConfig, _> = toml::from_str("machin_id = 3");
        assert!(res.is_err());
    }
}
