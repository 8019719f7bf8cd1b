//! Configuration options shared by every call routed through an engine.
//!
//! The [`EngineConfig`] struct captures run-time knobs such as tile sizes and
//! output precision that callers can tune without rebuilding the engine's
//! callers. Values can be loaded from JSON and layered with `FLASH_ATTN_*`
//! environment overrides before validation.

use std::env;

use serde::{Deserialize, Serialize};

use super::errors::{AttentionError, Result};

/// Largest head dimension the tiled kernels accept.
pub const MAX_HEAD_DIM: usize = 256;

/// Upper bound on the number of key splits used by the decode path.
pub const MAX_SPLITS: usize = 128;

/// Output dtype policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrecisionPolicy {
    /// Outputs and gradients mirror the query dtype.
    #[default]
    Inherit,
    /// Outputs and gradients are always produced in `f32`.
    ForceF32,
}

/// Configuration driving engine behaviour.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Query rows per work unit.
    pub tile_q: usize,
    /// Keys per online-softmax step.
    pub tile_k: usize,
    /// Head dimensions are zero-padded up to a multiple of this value.
    pub head_dim_alignment: usize,
    /// Worker threads; `None` probes the host.
    pub num_threads: Option<usize>,
    /// Output dtype policy.
    pub precision: PrecisionPolicy,
    /// Cap for the automatic split-count heuristic.
    pub max_splits: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tile_q: 64,
            tile_k: 64,
            head_dim_alignment: 8,
            num_threads: None,
            precision: PrecisionPolicy::Inherit,
            max_splits: MAX_SPLITS,
        }
    }
}

impl EngineConfig {
    /// Parse a configuration from a JSON document, then validate it.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: EngineConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Layer `FLASH_ATTN_*` environment variables over the current values.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = read_env_usize("FLASH_ATTN_TILE_Q") {
            self.tile_q = value;
        }
        if let Some(value) = read_env_usize("FLASH_ATTN_TILE_K") {
            self.tile_k = value;
        }
        if let Some(value) = read_env_usize("FLASH_ATTN_THREADS") {
            self.num_threads = Some(value);
        }
        if let Some(value) = read_env_usize("FLASH_ATTN_MAX_SPLITS") {
            self.max_splits = value;
        }
        if let Ok(value) = env::var("FLASH_ATTN_PRECISION") {
            match value.to_ascii_lowercase().as_str() {
                "inherit" => self.precision = PrecisionPolicy::Inherit,
                "f32" | "force_f32" => self.precision = PrecisionPolicy::ForceF32,
                other => log::warn!("ignoring FLASH_ATTN_PRECISION={other}"),
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();

        if self.tile_q == 0 {
            errors.push("tile_q must be greater than 0".to_string());
        }
        if self.tile_k == 0 {
            errors.push("tile_k must be greater than 0".to_string());
        }
        if !self.head_dim_alignment.is_power_of_two() || self.head_dim_alignment > MAX_HEAD_DIM {
            errors.push(format!(
                "head_dim_alignment must be a power of two <= {MAX_HEAD_DIM}, got {}",
                self.head_dim_alignment
            ));
        }
        if self.num_threads == Some(0) {
            errors.push("num_threads must be greater than 0 when set".to_string());
        }
        if self.max_splits == 0 || self.max_splits > MAX_SPLITS {
            errors.push(format!(
                "max_splits must be in 1..={MAX_SPLITS}, got {}",
                self.max_splits
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(AttentionError::Config {
                context: errors.join("; "),
            })
        }
    }

    /// Head dimension after padding to the alignment boundary.
    pub fn padded_head_dim(&self, head_dim: usize) -> usize {
        head_dim.div_ceil(self.head_dim_alignment) * self.head_dim_alignment
    }
}

fn read_env_usize(key: &str) -> Option<usize> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse::<usize>() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {key}={raw}: expected an unsigned integer");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn validation_collects_every_problem() {
        let config = EngineConfig {
            tile_q: 0,
            tile_k: 0,
            head_dim_alignment: 6,
            num_threads: Some(0),
            max_splits: 0,
            ..EngineConfig::default()
        };
        let err = config.validate().unwrap_err();
        let AttentionError::Config { context } = err else {
            panic!("expected a config error");
        };
        assert_eq!(context.matches(';').count(), 4, "{context}");
    }

    #[test]
    fn json_fills_missing_fields_with_defaults() {
        let config = EngineConfig::from_json_str(r#"{"tile_q": 16, "precision": "force_f32"}"#)
            .expect("valid json");
        assert_eq!(config.tile_q, 16);
        assert_eq!(config.tile_k, 64);
        assert_eq!(config.precision, PrecisionPolicy::ForceF32);

        assert!(matches!(
            EngineConfig::from_json_str(r#"{"tile_k": 0}"#),
            Err(AttentionError::Config { .. })
        ));
        assert!(matches!(
            EngineConfig::from_json_str("{"),
            Err(AttentionError::Json(_))
        ));
    }

    #[test]
    fn padding_rounds_up_to_alignment() {
        let config = EngineConfig::default();
        assert_eq!(config.padded_head_dim(5), 8);
        assert_eq!(config.padded_head_dim(64), 64);
        assert_eq!(config.padded_head_dim(65), 72);
    }
}
