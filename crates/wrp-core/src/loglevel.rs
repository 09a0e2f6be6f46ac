//! Log-level vocabulary shared between `wrp-otel` (which can actually
//! change the installed filter) and `wrp-router`'s `self/loglevel` CRUD
//! handler, kept here so neither depends on the other.

use std::str::FromStr;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, thiserror::Error, Eq, PartialEq)]
#[error("{0:?} is not one of debug/info/warn/error")]
pub struct UnknownLogLevel(String);

impl FromStr for LogLevel {
    type Err = UnknownLogLevel;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(UnknownLogLevel(other.to_string())),
        }
    }
}

/// Something that can read and change the process's active log level (spec
/// §4.K: the `self/loglevel` CRUD handler "is applied for `duration` then
/// reverts to the original level").
pub trait LogLevelController: Send + Sync {
    fn set_level(&self, level: LogLevel) -> Result<(), String>;
    fn current_level(&self) -> LogLevel;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_four_permitted_levels() {
        assert_eq!("debug".parse::<LogLevel>().unwrap(), LogLevel::Debug);
        assert_eq!("info".parse::<LogLevel>().unwrap(), LogLevel::Info);
        assert_eq!("warn".parse::<LogLevel>().unwrap(), LogLevel::Warn);
        assert_eq!("error".parse::<LogLevel>().unwrap(), LogLevel::Error);
    }

    #[test]
    fn rejects_anything_else() {
        assert!("trace".parse::<LogLevel>().is_err());
    }
}
