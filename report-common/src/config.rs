//! Value types for environment configuration. Each parses from the raw variable with `FromStr`.
use std::str::FromStr;
use std::time;

/// A duration given in milliseconds.
#[derive(Debug, Clone, Copy)]
pub struct EnvMsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvMsDurationError;

impl FromStr for EnvMsDuration {
    type Err = ParseEnvMsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let ms = s.parse::<u64>().map_err(|_| ParseEnvMsDurationError)?;

        Ok(EnvMsDuration(time::Duration::from_millis(ms)))
    }
}

/// A duration given in whole seconds, for the sweeper's coarse windows.
#[derive(Debug, Clone, Copy)]
pub struct EnvSecsDuration(pub time::Duration);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseEnvSecsDurationError;

impl FromStr for EnvSecsDuration {
    type Err = ParseEnvSecsDurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let secs = s.parse::<u64>().map_err(|_| ParseEnvSecsDurationError)?;

        Ok(EnvSecsDuration(time::Duration::from_secs(secs)))
    }
}

#[derive(Debug, Clone)]
pub struct NonEmptyString(pub String);

impl NonEmptyString {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

#[derive(Debug, PartialEq, Eq)]
pub struct StringIsEmptyError;

impl FromStr for NonEmptyString {
    type Err = StringIsEmptyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            Err(StringIsEmptyError)
        } else {
            Ok(NonEmptyString(trimmed.to_owned()))
        }
    }
}
