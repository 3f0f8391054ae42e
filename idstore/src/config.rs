//! Environment-driven configuration helpers.

use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// A configuration value could not be used.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// The environment variable is set but does not parse.
    #[error("invalid value '{value}' for {key}")]
    Invalid {
        /// Environment variable name.
        key: String,
        /// Offending value.
        value: String,
    },
    /// A required environment variable is missing.
    #[error("missing required environment variable {key}")]
    Missing {
        /// Environment variable name.
        key: String,
    },
}

/// Reads and parses `key`, returning `None` when it is unset.
pub fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

/// Reads and parses `key`, then runs it through `validate`.
///
/// Values the validator rejects are reported as [`ConfigError::Invalid`].
pub fn env_validated<T, V, E>(
    key: &str,
    validate: impl FnOnce(T) -> Result<V, E>,
) -> Result<Option<V>, ConfigError>
where
    T: FromStr + ToString,
{
    env_parse::<T>(key)?
        .map(|raw| {
            let value = raw.to_string();
            validate(raw).map_err(|_| ConfigError::Invalid {
                key: key.to_string(),
                value,
            })
        })
        .transpose()
}

/// Reads a duration given in milliseconds, returning `None` when unset.
pub fn env_millis(key: &str) -> Result<Option<Duration>, ConfigError> {
    Ok(env_parse::<u64>(key)?.map(Duration::from_millis))
}

/// Reads a required string.
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    std::env::var(key).map_err(|_| ConfigError::Missing {
        key: key.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unset_variables_are_none() {
        let value: Option<u32> = env_parse("IDSTORE_TEST_SURELY_UNSET_VARIABLE").unwrap();
        assert_eq!(value, None);
        assert!(env_required("IDSTORE_TEST_SURELY_UNSET_VARIABLE").is_err());
    }
}
