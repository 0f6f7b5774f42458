use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{Error, Result};

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    /// Human-readable text format (default).
    #[default]
    Text,
    /// Structured JSON format.
    Json,
}

/// Common logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log output format: "text" or "json".
    #[serde(default)]
    pub format: LogFormat,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

impl LoggingConfig {
    /// Return a copy with the level replaced when an override is given.
    pub fn with_level_override(&self, level: Option<&str>) -> Self {
        match level {
            Some(level) => Self {
                level: level.to_string(),
                format: self.format,
            },
            None => self.clone(),
        }
    }
}

/// Load a configuration file in JSON5 format.
pub fn load_config<T: for<'de> Deserialize<'de>>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!(
            "Failed to read config file '{}': {}",
            path.display(),
            e
        ))
    })?;

    json5::from_str(&content).map_err(|e| {
        Error::Config(format!(
            "Failed to parse config file '{}': {}",
            path.display(),
            e
        ))
    })
}

/// Load a configuration from a JSON5 string.
pub fn parse_config<T: for<'de> Deserialize<'de>>(content: &str) -> Result<T> {
    json5::from_str(content).map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Debug, Deserialize)]
    struct Sample {
        #[serde(default)]
        logging: LoggingConfig,
    }

    #[test]
    fn test_parse_logging_config() {
        let json5 = r#"
        {
            logging: {
                level: "debug",
                format: "json",
            },
        }
        "#;

        let config: Sample = parse_config(json5).unwrap();

        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.logging.format, LogFormat::Json);
    }

    #[test]
    fn test_default_config() {
        let config: Sample = parse_config("{}").unwrap();

        assert_eq!(config.logging.level, "info");
        assert_eq!(config.logging.format, LogFormat::Text);
    }

    #[test]
    fn test_level_override() {
        let config = LoggingConfig::default();
        assert_eq!(config.with_level_override(Some("trace")).level, "trace");
        assert_eq!(config.with_level_override(None).level, "info");
    }

    #[test]
    fn test_load_config_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{{ logging: {{ level: 'warn' }} }}").unwrap();

        let config: Sample = load_config(file.path()).unwrap();
        assert_eq!(config.logging.level, "warn");
    }

    #[test]
    fn test_load_missing_file() {
        let result: Result<Sample> = load_config("/nonexistent/fieldgate.json5");
        assert!(matches!(result, Err(Error::Config(_))));
    }
}
