// tracing-subscriber setup: an EnvFilter plus either human-readable or JSON
// lines on stdout.

use std::fmt;
use std::str::FromStr;

use tracing_subscriber::{
    fmt as subscriber_fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::config::DEFAULT_LOG_FILTER;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl FromStr for LogFormat {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" | "text" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(Error::config(format!("unknown log format '{other}'"))),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pretty => "pretty",
            Self::Json => "json",
        })
    }
}

// Falls back to the crate default when the directive does not parse.
pub fn filter(directive: &str) -> EnvFilter {
    EnvFilter::try_new(directive).unwrap_or_else(|e| {
        eprintln!("Invalid log filter '{directive}' ({e}), using '{DEFAULT_LOG_FILTER}'");
        EnvFilter::new(DEFAULT_LOG_FILTER)
    })
}

/// Installs the global subscriber. `false` if one was already set.
pub fn init(directive: &str, format: LogFormat) -> bool {
    let registry = tracing_subscriber::registry().with(filter(directive));

    let installed = match format {
        LogFormat::Pretty => registry
            .with(subscriber_fmt::layer().with_target(true))
            .try_init(),
        LogFormat::Json => registry
            .with(subscriber_fmt::layer().json().with_current_span(true))
            .try_init(),
    };
    installed.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_parsing() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert_eq!("pretty".parse::<LogFormat>().unwrap(), LogFormat::Pretty);
        assert!("yaml".parse::<LogFormat>().is_err());
        assert_eq!(LogFormat::Json.to_string(), "json");
    }

    #[test]
    fn test_bad_directive_falls_back() {
        assert_eq!(
            filter("crate=notalevel").to_string(),
            EnvFilter::new(DEFAULT_LOG_FILTER).to_string()
        );
    }

    #[test]
    fn test_second_init_is_refused() {
        init("warn", LogFormat::Pretty);
        assert!(!init("warn", LogFormat::Json));
    }
}
