//! Driver configuration.
//!
//! Configuration is read from environment variables:
//!
//! - `RILL_LOG`: tracing filter directives (default: `info`)
//! - `RILL_MAX_CHANGES_PER_ADVANCE`: diffs with more change-log entries than
//!   this are not pushed; the driver rebuilds its sources and re-hydrates
//!   every query instead (default: unset, always push)

use thiserror::Error;

/// Error returned when loading configuration fails.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid value for {name}: {message}")]
    InvalidValue { name: String, message: String },
}

impl From<ConfigError> for rill_core::Error {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::InvalidValue { name, message } => rill_core::Error::config(name, message),
        }
    }
}

/// Configuration of a [`PipelineDriver`](crate::PipelineDriver).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PipelineConfig {
    /// Filter directives for `init_tracing`.
    pub log_filter: String,
    /// Reset threshold, in change-log entries per advance.
    pub max_changes_per_advance: Option<usize>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            log_filter: Self::DEFAULT_LOG_FILTER.to_string(),
            max_changes_per_advance: None,
        }
    }
}

impl PipelineConfig {
    pub const LOG_ENV: &'static str = "RILL_LOG";
    pub const MAX_CHANGES_ENV: &'static str = "RILL_MAX_CHANGES_PER_ADVANCE";
    pub const DEFAULT_LOG_FILTER: &'static str = "info";

    /// Loads configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Loads configuration through `lookup`, which returns the value of a
    /// variable if it is set.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let log_filter = match lookup(Self::LOG_ENV) {
            Some(filter) if !filter.trim().is_empty() => filter,
            _ => Self::DEFAULT_LOG_FILTER.to_string(),
        };
        let max_changes_per_advance = match lookup(Self::MAX_CHANGES_ENV) {
            None => None,
            Some(raw) => Some(parse_threshold(&raw)?),
        };
        Ok(Self {
            log_filter,
            max_changes_per_advance,
        })
    }

    /// Builder-style setter for the reset threshold.
    pub fn with_max_changes_per_advance(mut self, max: usize) -> Self {
        self.max_changes_per_advance = Some(max);
        self
    }
}

fn parse_threshold(raw: &str) -> Result<usize, ConfigError> {
    raw.trim()
        .parse::<usize>()
        .map_err(|e| ConfigError::InvalidValue {
            name: PipelineConfig::MAX_CHANGES_ENV.to_string(),
            message: format!("{raw:?} is not a non-negative integer ({e})"),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use hashbrown::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = PipelineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, PipelineConfig::default());
        assert_eq!(config.log_filter, "info");
        assert_eq!(config.max_changes_per_advance, None);
    }

    #[test]
    fn test_values() {
        let config = PipelineConfig::from_lookup(lookup(&[
            ("RILL_LOG", "rill_storage=debug,info"),
            ("RILL_MAX_CHANGES_PER_ADVANCE", " 500 "),
        ]))
        .unwrap();
        assert_eq!(config.log_filter, "rill_storage=debug,info");
        assert_eq!(config.max_changes_per_advance, Some(500));

        let config = PipelineConfig::from_lookup(lookup(&[("RILL_LOG", "  ")])).unwrap();
        assert_eq!(config.log_filter, "info");
    }

    #[test]
    fn test_invalid_threshold() {
        let err = PipelineConfig::from_lookup(lookup(&[("RILL_MAX_CHANGES_PER_ADVANCE", "-1")])).unwrap_err();
        assert!(matches!(&err, ConfigError::InvalidValue { name, .. } if name == "RILL_MAX_CHANGES_PER_ADVANCE"));
        let err: rill_core::Error = err.into();
        assert!(matches!(err, rill_core::Error::Config { .. }));
    }
}
