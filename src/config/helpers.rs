//! Small env-var resolution helpers shared by the config sections.

use std::str::FromStr;

use crate::error::ConfigError;

/// Read a required env var, trimming whitespace.
pub(crate) fn required_env(var: &str) -> Result<String, ConfigError> {
    match std::env::var(var) {
        Ok(val) if !val.trim().is_empty() => Ok(val.trim().to_string()),
        _ => Err(ConfigError::MissingVar(var.to_string())),
    }
}

/// Read an optional env var; empty values count as unset.
pub(crate) fn optional_env(var: &str) -> Option<String> {
    match std::env::var(var) {
        Ok(val) if !val.trim().is_empty() => Some(val.trim().to_string()),
        _ => None,
    }
}

/// Parse an optional env var into `T`, falling back to `default`.
pub(crate) fn parse_env_or<T: FromStr>(var: &str, default: T) -> Result<T, ConfigError> {
    match optional_env(var) {
        Some(raw) => raw.parse().map_err(|_| ConfigError::InvalidVar {
            var: var.to_string(),
            reason: format!("could not parse '{}'", raw),
        }),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_optional_env_treats_empty_as_unset() {
        std::env::set_var("DECKHAND_TEST_EMPTY", "  ");
        assert_eq!(optional_env("DECKHAND_TEST_EMPTY"), None);
        std::env::remove_var("DECKHAND_TEST_EMPTY");
    }

    #[test]
    fn test_parse_env_or_default() {
        assert_eq!(parse_env_or("DECKHAND_TEST_UNSET_U64", 42u64).unwrap(), 42);
    }
}
