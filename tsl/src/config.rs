//! Shading system configuration.
//!
//! ```toml
//! allow_optimization = true
//! allow_verification = true
//! max_call_depth = 128
//! dump_ir = false
//! ```

use crate::{
  engine::{DEFAULT_MAX_CALL_DEPTH, MAX_CALL_DEPTH_LIMIT},
  error::{Result, TslError},
};
use serde::Deserialize;
use std::{fs, path::Path};

/// Settings shared by every template and instance of a [`ShadingSystem`](crate::ShadingSystem).
///
/// Missing keys take their default value.
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default, deny_unknown_fields)]
pub struct ShadingSystemConfig {
  /// Default for templates: optimize instances when they are resolved.
  pub allow_optimization: bool,
  /// Default for templates: verify instances when they are resolved.
  pub allow_verification: bool,
  /// Nesting of calls allowed to a running shader, from 1 to [`MAX_CALL_DEPTH_LIMIT`].
  pub max_call_depth: usize,
  /// Log the IR of every compiled template and resolved instance at debug level.
  pub dump_ir: bool,
}

impl Default for ShadingSystemConfig {
  fn default() -> Self {
    Self {
      allow_optimization: true,
      allow_verification: true,
      max_call_depth: DEFAULT_MAX_CALL_DEPTH,
      dump_ir: false,
    }
  }
}

impl ShadingSystemConfig {
  /// Parse a configuration from TOML text.
  pub fn from_toml_str(s: &str) -> Result<Self> {
    let config: Self = toml::from_str(s).map_err(|e| TslError::Config(e.to_string()))?;

    if !(1..=MAX_CALL_DEPTH_LIMIT).contains(&config.max_call_depth) {
      return Err(TslError::Config(format!(
        "max_call_depth must be between 1 and {}, got {}",
        MAX_CALL_DEPTH_LIMIT, config.max_call_depth
      )));
    }

    Ok(config)
  }

  /// Read and parse a TOML configuration file.
  pub fn from_toml_file(path: impl AsRef<Path>) -> Result<Self> {
    let path = path.as_ref();
    let s = fs::read_to_string(path)
      .map_err(|e| TslError::Config(format!("cannot read {}: {}", path.display(), e)))?;

    Self::from_toml_str(&s)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn missing_keys_use_defaults() {
    let config = ShadingSystemConfig::from_toml_str("allow_optimization = false").unwrap();

    assert_eq!(
      config,
      ShadingSystemConfig {
        allow_optimization: false,
        ..ShadingSystemConfig::default()
      }
    );
    assert_eq!(
      ShadingSystemConfig::from_toml_str("").unwrap(),
      ShadingSystemConfig::default()
    );
  }

  #[test]
  fn call_depth_bounds() {
    let deepest = format!("max_call_depth = {}", MAX_CALL_DEPTH_LIMIT);
    assert_eq!(
      ShadingSystemConfig::from_toml_str(&deepest).unwrap().max_call_depth,
      MAX_CALL_DEPTH_LIMIT
    );
    assert!(matches!(
      ShadingSystemConfig::from_toml_str(&format!("max_call_depth = {}", MAX_CALL_DEPTH_LIMIT + 1)),
      Err(TslError::Config(_))
    ));
  }

  #[test]
  fn invalid_configs() {
    assert!(matches!(
      ShadingSystemConfig::from_toml_str("max_call_depth = 0"),
      Err(TslError::Config(_))
    ));
    assert!(matches!(
      ShadingSystemConfig::from_toml_str("max_call_depth = 100000"),
      Err(TslError::Config(_))
    ));
    assert!(matches!(
      ShadingSystemConfig::from_toml_str("optimise = true"),
      Err(TslError::Config(_))
    ));
    assert!(matches!(
      ShadingSystemConfig::from_toml_str("dump_ir = 1"),
      Err(TslError::Config(_))
    ));
    assert!(matches!(
      ShadingSystemConfig::from_toml_file("/nonexistent/tsl.toml"),
      Err(TslError::Config(_))
    ));
  }
}
