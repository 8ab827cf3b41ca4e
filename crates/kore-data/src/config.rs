//! Loader settings, loadable from JSON.

use serde::{Deserialize, Serialize};

use crate::error::{DataError, Result};

/// How a [`DataLoader`](crate::DataLoader) walks its dataset.
///
/// Missing fields take their [`Default`] values, so `{"batch_size": 8}` is a
/// complete configuration. Samples are always collated along dimension 0.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    pub batch_size: usize,
    /// Reshuffle the sample order at the start of every epoch.
    pub shuffle: bool,
    /// Skip the trailing batch when it holds fewer than `batch_size` samples.
    pub drop_last: bool,
    /// Seed for reproducible shuffling; each epoch uses `seed + epoch`.
    pub seed: Option<u64>,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            shuffle: false,
            drop_last: false,
            seed: None,
        }
    }
}

impl LoaderConfig {
    pub fn new(batch_size: usize) -> Self {
        Self {
            batch_size,
            ..Self::default()
        }
    }

    pub fn with_shuffle(mut self, seed: Option<u64>) -> Self {
        self.shuffle = true;
        self.seed = seed;
        self
    }

    pub fn with_drop_last(mut self, drop_last: bool) -> Self {
        self.drop_last = drop_last;
        self
    }

    /// Parse and validate a JSON configuration.
    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DataError::InvalidConfig("batch_size must be > 0".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = LoaderConfig::from_json(r#"{"batch_size": 8, "shuffle": true}"#).unwrap();
        assert_eq!(config.batch_size, 8);
        assert!(config.shuffle);
        assert!(!config.drop_last);
        assert_eq!(config.seed, None);
    }

    #[test]
    fn test_json_round_trip() {
        let config = LoaderConfig::new(4).with_shuffle(Some(7)).with_drop_last(true);
        let back = LoaderConfig::from_json(&config.to_json().unwrap()).unwrap();
        assert_eq!(back, config);
    }

    #[test]
    fn test_rejects_zero_batch() {
        let err = LoaderConfig::from_json(r#"{"batch_size": 0}"#).unwrap_err();
        assert!(matches!(err, DataError::InvalidConfig(_)));
    }

    #[test]
    fn test_rejects_malformed_json() {
        let err = LoaderConfig::from_json(r#"{"batch_size": "eight"}"#).unwrap_err();
        assert!(matches!(err, DataError::Parse(_)));
    }
}
