//! Mapper configuration loaded from JSON.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MemError, Result};

pub const CONFIG_SCHEMA_VERSION: u32 = 1;

/// When a system-memory mapper reuses its staging surface.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StagingPolicy {
    /// Reuse while the staging is at least as large as the image; reallocate
    /// only when it must grow.
    #[default]
    GrowOnly,
    /// Reallocate on any dimension change.
    ExactMatch,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MapperConfig {
    pub schema_version: u32,
    #[serde(default)]
    pub staging_policy: StagingPolicy,
    #[serde(default = "default_pitch_alignment")]
    pub pitch_alignment: usize,
}

fn default_pitch_alignment() -> usize {
    64
}

impl Default for MapperConfig {
    fn default() -> Self {
        Self {
            schema_version: CONFIG_SCHEMA_VERSION,
            staging_policy: StagingPolicy::default(),
            pitch_alignment: default_pitch_alignment(),
        }
    }
}

impl MapperConfig {
    pub fn from_json_str(data: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(data)
            .map_err(|err| MemError::Config(format!("Invalid mapper config JSON: {err}")))?;

        let Some(version_value) = value.get("schema_version") else {
            return Err(MemError::Config(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got missing"
            )));
        };
        let Some(version) = version_value.as_u64() else {
            return Err(MemError::Config(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got non-integer"
            )));
        };
        if version != CONFIG_SCHEMA_VERSION as u64 {
            return Err(MemError::Config(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got {version}"
            )));
        }

        let config: Self = serde_json::from_value(value)
            .map_err(|err| MemError::Config(format!("Invalid mapper config JSON: {err}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|err| {
            MemError::Config(format!(
                "Failed to read mapper config from {}: {err}",
                path.display()
            ))
        })?;
        Self::from_json_str(&data)
    }

    pub fn validate(&self) -> Result<()> {
        if self.schema_version != CONFIG_SCHEMA_VERSION {
            return Err(MemError::Config(format!(
                "Config schema mismatch: expected {CONFIG_SCHEMA_VERSION}, got {}",
                self.schema_version
            )));
        }
        if !self.pitch_alignment.is_power_of_two() {
            return Err(MemError::Config(format!(
                "pitch_alignment {} must be a power of two",
                self.pitch_alignment
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_uses_defaults() {
        let cfg = MapperConfig::from_json_str(r#"{"schema_version": 1}"#).unwrap();
        assert_eq!(cfg, MapperConfig::default());
    }

    #[test]
    fn full_config_parses() {
        let cfg = MapperConfig::from_json_str(
            r#"{
                "schema_version": 1,
                "staging_policy": "exact_match",
                "pitch_alignment": 256
            }"#,
        )
        .unwrap();
        assert_eq!(cfg.staging_policy, StagingPolicy::ExactMatch);
        assert_eq!(cfg.pitch_alignment, 256);
    }

    #[test]
    fn schema_version_is_checked_first() {
        let err = MapperConfig::from_json_str(r#"{"staging_policy": "bogus"}"#).unwrap_err();
        assert!(err.to_string().contains("got missing"));
        let err = MapperConfig::from_json_str(r#"{"schema_version": "1"}"#).unwrap_err();
        assert!(err.to_string().contains("non-integer"));
        let err = MapperConfig::from_json_str(r#"{"schema_version": 2}"#).unwrap_err();
        assert!(err.to_string().contains("expected 1, got 2"));
        assert_eq!(err.error_code(), 400);
    }

    #[test]
    fn bad_alignment_and_unknown_fields_are_rejected() {
        let err =
            MapperConfig::from_json_str(r#"{"schema_version": 1, "pitch_alignment": 48}"#)
                .unwrap_err();
        assert!(err.to_string().contains("power of two"));
        assert!(MapperConfig::from_json_str(r#"{"schema_version": 1, "pool": 3}"#).is_err());
    }
}
