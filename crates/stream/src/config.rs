use std::path::Path;

use glam::DVec3;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Shape of the divisible grid.
///
/// The root is an axis-aligned cube `center ± half_extent`. Every level splits
/// each axis into `arity` parts, `depth` times, so leaf cells have a half-extent
/// of `half_extent / arity^depth`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GridConfig {
    pub center: DVec3,
    pub half_extent: f64,
    pub arity: u32,
    pub depth: u32,
}

impl Default for GridConfig {
    fn default() -> Self {
        // 1_638_400 / 4^7 = 100, i.e. 200-unit leaf cells.
        Self {
            center: DVec3::ZERO,
            half_extent: 1_638_400.0,
            arity: 4,
            depth: 7,
        }
    }
}

impl GridConfig {
    /// Number of leaf cells along one axis (`arity^depth`).
    pub fn cells_per_axis(&self) -> u32 {
        self.arity.pow(self.depth)
    }

    pub fn leaf_half_extent(&self) -> f64 {
        self.half_extent / f64::from(self.cells_per_axis())
    }

    pub fn leaf_size(&self) -> f64 {
        self.leaf_half_extent() * 2.0
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.center.is_finite() {
            return Err(ConfigError::Invalid("grid center must be finite".into()));
        }
        if !(self.half_extent.is_finite() && self.half_extent > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "grid half_extent must be positive, got {}",
                self.half_extent
            )));
        }
        if self.arity < 2 {
            return Err(ConfigError::Invalid(format!(
                "grid arity must be at least 2, got {}",
                self.arity
            )));
        }
        if self.depth == 0 {
            return Err(ConfigError::Invalid("grid depth must be at least 1".into()));
        }
        if self.arity.checked_pow(3).is_none() {
            return Err(ConfigError::Invalid(format!(
                "grid arity {} has too many children per node",
                self.arity
            )));
        }
        if self.arity.checked_pow(self.depth).is_none() {
            return Err(ConfigError::Invalid(format!(
                "grid arity {} with depth {} overflows the leaf address space",
                self.arity, self.depth
            )));
        }
        Ok(())
    }
}

/// Streamer configuration: grid shape plus streaming distances.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamerConfig {
    pub grid: GridConfig,
    /// Maximum distance at which a player sees a streamed actor.
    pub visibility_distance: f64,
    /// Minimum movement before a placement change is forwarded to the streamer.
    pub significant_distance: f64,
}

impl Default for StreamerConfig {
    fn default() -> Self {
        Self {
            grid: GridConfig::default(),
            visibility_distance: 300.0,
            significant_distance: 10.0,
        }
    }
}

impl StreamerConfig {
    /// Parse a JSON configuration. Missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.grid.validate()?;
        if !(self.visibility_distance.is_finite() && self.visibility_distance > 0.0) {
            return Err(ConfigError::Invalid(format!(
                "visibility_distance must be positive, got {}",
                self.visibility_distance
            )));
        }
        if !(self.significant_distance.is_finite() && self.significant_distance >= 0.0) {
            return Err(ConfigError::Invalid(format!(
                "significant_distance must be non-negative, got {}",
                self.significant_distance
            )));
        }
        if self.visibility_distance > self.grid.leaf_size() {
            tracing::warn!(
                visibility_distance = self.visibility_distance,
                leaf_size = self.grid.leaf_size(),
                "visibility distance exceeds leaf size; radius queries will touch many cells"
            );
        }
        Ok(())
    }
}
