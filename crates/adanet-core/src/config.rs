use crate::error::{IterationError, IterationResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Settings shared by every iteration an `IterationBuilder` constructs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IterationConfig {
    /// Build rebuilt ensembles in training mode when training.
    pub replicate_ensemble_in_training: bool,
    /// Steps each candidate trains for; `None` trains until stopped externally.
    pub max_iteration_steps: Option<u64>,
    /// Batch size used to tile the best candidate index for eval metrics
    /// when the model params carry none.
    pub batch_size: usize,
}

impl Default for IterationConfig {
    fn default() -> Self {
        Self { replicate_ensemble_in_training: false, max_iteration_steps: None, batch_size: 1 }
    }
}

impl IterationConfig {
    pub fn from_toml_str(contents: &str) -> IterationResult<Self> {
        let config: Self = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads a TOML file whose top-level keys are `IterationConfig` fields.
    pub fn load(path: &Path) -> IterationResult<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> IterationResult<()> {
        if self.batch_size == 0 {
            return Err(IterationError::InvalidConfig("batch_size must be >= 1".to_string()));
        }
        if self.max_iteration_steps == Some(0) {
            return Err(IterationError::InvalidConfig("max_iteration_steps must be >= 1".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_toml() {
        let config = IterationConfig::from_toml_str("").unwrap();
        assert_eq!(config, IterationConfig::default());
    }

    #[test]
    fn test_parse_all_fields() {
        let config = IterationConfig::from_toml_str(
            "replicate_ensemble_in_training = true\nmax_iteration_steps = 100\nbatch_size = 32\n",
        )
        .unwrap();
        assert!(config.replicate_ensemble_in_training);
        assert_eq!(config.max_iteration_steps, Some(100));
        assert_eq!(config.batch_size, 32);
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        assert!(IterationConfig::from_toml_str("batch_size = 0").is_err());
        assert!(IterationConfig::from_toml_str("max_iteration_steps = 0").is_err());
    }

    #[test]
    fn test_load_from_file() {
        let temp = tempfile::TempDir::new().unwrap();
        let path = temp.path().join("iteration.toml");
        std::fs::write(&path, "max_iteration_steps = 7\n").unwrap();
        assert_eq!(IterationConfig::load(&path).unwrap().max_iteration_steps, Some(7));
    }
}
