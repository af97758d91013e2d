// ABOUTME: Environment variable parsing utilities
// ABOUTME: Typed, strict helpers that report unset or malformed variables instead of guessing

use std::fmt::Display;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, PartialEq)]
pub enum EnvError {
    #[error("Required environment variable {0} is not set")]
    Missing(String),
    #[error("Environment variable {var} has invalid value '{value}': {reason}")]
    Invalid {
        var: String,
        value: String,
        reason: String,
    },
}

fn read_var(var_name: &str) -> Option<String> {
    std::env::var(var_name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn parse_value<T>(var_name: &str, raw: String) -> Result<T, EnvError>
where
    T: FromStr,
    T::Err: Display,
{
    raw.parse::<T>().map_err(|e| EnvError::Invalid {
        var: var_name.to_string(),
        value: raw.clone(),
        reason: e.to_string(),
    })
}

/// Parse a variable that must be present
pub fn required_env<T>(var_name: &str) -> Result<T, EnvError>
where
    T: FromStr,
    T::Err: Display,
{
    let raw = read_var(var_name).ok_or_else(|| EnvError::Missing(var_name.to_string()))?;
    parse_value(var_name, raw)
}

/// Parse a variable that may be absent
///
/// Blank values count as absent. A value that is set but does not parse is an
/// error rather than a silent fallback.
pub fn optional_env<T>(var_name: &str) -> Result<Option<T>, EnvError>
where
    T: FromStr,
    T::Err: Display,
{
    read_var(var_name)
        .map(|raw| parse_value(var_name, raw))
        .transpose()
}

/// Parse a variable, using `default` when it is absent
pub fn env_or<T>(var_name: &str, default: T) -> Result<T, EnvError>
where
    T: FromStr,
    T::Err: Display,
{
    match optional_env(var_name)? {
        Some(value) => Ok(value),
        None => {
            tracing::debug!("{} not set, using default", var_name);
            Ok(default)
        }
    }
}

/// Split a variable into whitespace-separated words (e.g. an interpreter command line)
pub fn parse_words(var_name: &str) -> Option<Vec<String>> {
    read_var(var_name).map(|raw| raw.split_whitespace().map(str::to_string).collect())
}
