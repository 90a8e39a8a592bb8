//! Engine configuration.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Maps a logical volume to a physical drive and partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMapping {
    pub drive: u8,
    /// 0 = auto detect, 1..=4 = forced MBR slot (or GPT entry index)
    pub partition: u8,
}

/// A packed FAT timestamp used when the real-time clock is disabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FixedTimestamp {
    pub year: u16,
    pub month: u8,
    pub day: u8,
}

impl Default for FixedTimestamp {
    fn default() -> Self {
        Self {
            year: 2024,
            month: 1,
            day: 1,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FsConfig {
    /// Number of logical volume slots.
    pub volumes: usize,
    /// Optional explicit volume to partition mapping, indexed by volume.
    /// When empty, volume N maps to drive N with partition auto detection.
    pub partition_map: Vec<PartitionMapping>,
    /// Optional string volume identifiers (`"sd:"` style), indexed by volume.
    pub volume_strings: Vec<String>,
    pub long_names: bool,
    /// Recognise exFAT volumes. Only honoured together with `long_names`.
    pub exfat: bool,
    pub read_only: bool,
    /// Capacity of the open-object lock table. 0 disables sharing control.
    pub max_open_objects: usize,
    pub lock_timeout_ms: u64,
    pub min_sector_size: u32,
    pub max_sector_size: u32,
    /// Pass freed cluster runs to the device as trim hints.
    pub trim: bool,
    /// Trust the FAT32 FSInfo free count and next-free hint on mount.
    pub fsinfo_trust: bool,
    /// Use the local clock for timestamps instead of `fixed_timestamp`.
    pub rtc: bool,
    pub fixed_timestamp: FixedTimestamp,
}

impl Default for FsConfig {
    fn default() -> Self {
        Self {
            volumes: 4,
            partition_map: Vec::new(),
            volume_strings: Vec::new(),
            long_names: true,
            exfat: true,
            read_only: false,
            max_open_objects: 16,
            lock_timeout_ms: 1000,
            min_sector_size: 512,
            max_sector_size: 4096,
            trim: false,
            fsinfo_trust: true,
            rtc: true,
            fixed_timestamp: FixedTimestamp::default(),
        }
    }
}

impl FsConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        let config: FsConfig =
            serde_json::from_str(json).context("failed to parse filesystem config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        Self::from_json(&content)
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialize filesystem config")
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let valid_ss = |s: u32| s.is_power_of_two() && (512..=4096).contains(&s);
        if !valid_ss(self.min_sector_size)
            || !valid_ss(self.max_sector_size)
            || self.min_sector_size > self.max_sector_size
        {
            anyhow::bail!(
                "invalid sector size range {}..={}",
                self.min_sector_size,
                self.max_sector_size
            );
        }
        if self.volumes == 0 || self.volumes > 10 {
            anyhow::bail!("volume count must be 1..=10, got {}", self.volumes);
        }
        Ok(())
    }

    /// Physical drive and partition hosting logical volume `vol`.
    pub fn mapping(&self, vol: usize) -> PartitionMapping {
        self.partition_map
            .get(vol)
            .copied()
            .unwrap_or(PartitionMapping {
                drive: vol as u8,
                partition: 0,
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_roundtrip() {
        let cfg = FsConfig::default();
        let json = cfg.to_json().unwrap();
        let back = FsConfig::from_json(&json).unwrap();
        assert_eq!(back.volumes, 4);
        assert!(back.long_names);
        assert_eq!(back.max_sector_size, 4096);
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let cfg = FsConfig::from_json(r#"{ "exfat": false, "max_open_objects": 2 }"#).unwrap();
        assert!(!cfg.exfat);
        assert_eq!(cfg.max_open_objects, 2);
        assert_eq!(cfg.lock_timeout_ms, 1000);
    }

    #[test]
    fn test_invalid_sector_range() {
        assert!(FsConfig::from_json(r#"{ "min_sector_size": 1000 }"#).is_err());
        assert!(
            FsConfig::from_json(r#"{ "min_sector_size": 4096, "max_sector_size": 512 }"#).is_err()
        );
    }

    #[test]
    fn test_mapping() {
        let cfg = FsConfig::from_json(
            r#"{ "partition_map": [ { "drive": 0, "partition": 1 }, { "drive": 0, "partition": 2 } ] }"#,
        )
        .unwrap();
        assert_eq!(cfg.mapping(1), PartitionMapping { drive: 0, partition: 2 });
        assert_eq!(cfg.mapping(3), PartitionMapping { drive: 3, partition: 0 });
    }

    #[test]
    fn test_load_from_path() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("fatvol.json");
        fs::write(&path, r#"{ "read_only": true }"#).unwrap();
        let cfg = FsConfig::load_from_path(&path).unwrap();
        assert!(cfg.read_only);
    }
}
