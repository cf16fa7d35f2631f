//! Configuration loading for the Neuron CLI
//!
//! A TOML file may set any subset of [`NeuronConfig`]; missing keys keep
//! their defaults. Command line flags are applied on top by the commands.

use std::path::Path;

use anyhow::Context;
use neuron_core::NeuronConfig;
use url::Url;

use crate::error::{CliError, Result};

/// Read, parse and validate a TOML configuration file
pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<NeuronConfig> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    parse(&text)
}

/// Parse and validate TOML configuration text
pub fn parse(text: &str) -> Result<NeuronConfig> {
    let config: NeuronConfig = toml::from_str(text)?;
    config.validate()?;
    Ok(config)
}

/// HTTP URL of the commander's message endpoint, derived from its channel URL
pub fn message_endpoint(config: &NeuronConfig) -> Result<String> {
    let commander_url = &config.commander_url;
    let mut url = Url::parse(commander_url)
        .map_err(|e| CliError::Config(format!("Invalid commander URL {commander_url}: {e}")))?;
    let scheme = match url.scheme() {
        "wss" | "https" => "https",
        _ => "http",
    };
    url.set_scheme(scheme).map_err(|_| {
        CliError::Config(format!("Cannot derive an HTTP URL from {commander_url}"))
    })?;
    url.set_path(&config.message_path());
    url.set_query(None);
    Ok(url.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = parse(
            r#"
node_id = "Worker-7"

[intervals]
heartbeat = 5000
"#,
        )
        .unwrap();
        assert_eq!(config.node_id, "Worker-7");
        assert_eq!(config.intervals.heartbeat, 5000);
        assert_eq!(config.intervals.commander, 100);
        assert_eq!(config.version, "1.4.7");
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        assert!(matches!(parse("node_id = \"\""), Err(CliError::Neuron(_))));
        assert!(matches!(parse("node_id = 3"), Err(CliError::TomlParsing(_))));
    }

    #[test]
    fn test_message_endpoint() {
        let config = NeuronConfig::default();
        assert_eq!(
            message_endpoint(&config).unwrap(),
            "http://127.0.0.1:8800/Commander/Message"
        );

        let secure = NeuronConfig {
            commander_url: "wss://bus.example.org/Commander/Channel".to_string(),
            ..NeuronConfig::default()
        };
        assert_eq!(
            message_endpoint(&secure).unwrap(),
            "https://bus.example.org/Commander/Message"
        );
    }

    #[test]
    fn test_missing_file() {
        let err = load_from_file("/nonexistent/neuron.toml").unwrap_err();
        assert!(err.to_string().contains("/nonexistent/neuron.toml"));
    }
}
