//! TOML configuration with environment overrides.
//!
//! Vendor credentials never live in the file; they are read from the
//! environment when an adapter is built (see [`crate::vendor`]).
//!
//! ```toml
//! [db]
//! path = "./data/cparse.sqlite"
//! busy_timeout_secs = 10
//!
//! [server]
//! bind = "127.0.0.1:7340"
//!
//! [parser]
//! provider = "reducto"
//! poll_interval_secs = 5
//!
//! [parser.reducto]
//! table_output_format = "markdown"
//! enhance_text = false
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Environment variable holding the Reducto API key.
pub const REDUCTO_API_KEY_ENV: &str = "REDUCTO_API_KEY";
/// Environment variables holding the PDF Services service-principal credentials.
pub const ADOBE_CLIENT_ID_ENV: &str = "PDF_SERVICES_CLIENT_ID";
pub const ADOBE_CLIENT_SECRET_ENV: &str = "PDF_SERVICES_CLIENT_SECRET";

/// `tracing` filter used when `RUST_LOG` is unset.
pub fn default_log_filter() -> &'static str {
    "clinical_parse=info,cparse=info"
}

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub parser: ParserConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
    /// How long a connection waits on a locked database before failing.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct ParserConfig {
    /// `reducto` (async polling) or `adobe` (single-shot extract).
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    /// Upper bound on status queries per job; `0` polls until the vendor terminates.
    #[serde(default = "default_max_poll_attempts")]
    pub max_poll_attempts: u32,
    #[serde(default)]
    pub reducto: ReductoConfig,
    #[serde(default)]
    pub adobe: AdobeConfig,
}

impl Default for ParserConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            poll_interval_secs: default_poll_interval(),
            max_poll_attempts: default_max_poll_attempts(),
            reducto: ReductoConfig::default(),
            adobe: AdobeConfig::default(),
        }
    }
}

fn default_provider() -> String {
    "reducto".to_string()
}
fn default_poll_interval() -> u64 {
    5
}
fn default_max_poll_attempts() -> u32 {
    720
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReductoConfig {
    #[serde(default = "default_reducto_url")]
    pub base_url: String,
    #[serde(default = "default_table_format")]
    pub table_output_format: String,
    #[serde(default)]
    pub enhance_text: bool,
    #[serde(default)]
    pub enhance_table: bool,
    /// Accepted for compatibility; the parse API has no matching parameter.
    #[serde(default)]
    pub force_url_result: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for ReductoConfig {
    fn default() -> Self {
        Self {
            base_url: default_reducto_url(),
            table_output_format: default_table_format(),
            enhance_text: false,
            enhance_table: false,
            force_url_result: false,
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_reducto_url() -> String {
    "https://platform.reducto.ai".to_string()
}
fn default_table_format() -> String {
    "markdown".to_string()
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct AdobeConfig {
    #[serde(default = "default_adobe_url")]
    pub base_url: String,
    #[serde(default = "default_adobe_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_adobe_max_polls")]
    pub max_poll_attempts: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for AdobeConfig {
    fn default() -> Self {
        Self {
            base_url: default_adobe_url(),
            poll_interval_secs: default_adobe_poll_interval(),
            max_poll_attempts: default_adobe_max_polls(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_adobe_url() -> String {
    "https://pdf-services.adobe.io".to_string()
}
fn default_adobe_poll_interval() -> u64 {
    2
}
fn default_busy_timeout_secs() -> u64 {
    10
}
fn default_adobe_max_polls() -> u32 {
    150
}

impl Config {
    /// Configuration with defaults and the given database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: path.into(),
                busy_timeout_secs: default_busy_timeout_secs(),
            },
            server: ServerConfig::default(),
            parser: ParserConfig::default(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let mut config: Config =
        toml::from_str(&content).with_context(|| "Failed to parse config file")?;

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());
    validate(&config)?;

    Ok(config)
}

/// Overlay deployment-style environment variables onto the file config.
///
/// `lookup` is injected so tests do not have to mutate the process environment.
pub fn apply_env_overrides<F>(config: &mut Config, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(provider) = lookup("PARSER_PROVIDER") {
        config.parser.provider = provider.to_lowercase();
    }
    if let Some(url) = lookup("REDUCTO_API_BASE_URL") {
        config.parser.reducto.base_url = url;
    }
    if let Some(format) = lookup("REDUCTO_TABLE_OUTPUT_FORMAT") {
        config.parser.reducto.table_output_format = format;
    }
    if let Some(v) = lookup("REDUCTO_ENHANCE_TEXT") {
        config.parser.reducto.enhance_text = v == "true";
    }
    if let Some(v) = lookup("REDUCTO_ENHANCE_TABLE") {
        config.parser.reducto.enhance_table = v == "true";
    }
    if let Some(v) = lookup("REDUCTO_FORCE_URL_RESULT") {
        config.parser.reducto.force_url_result = v == "true";
    }
}

pub fn validate(config: &Config) -> Result<()> {
    match config.parser.provider.as_str() {
        "reducto" | "adobe" => {}
        other => anyhow::bail!(
            "Unknown parser provider: '{}'. Must be reducto or adobe.",
            other
        ),
    }

    if config.parser.poll_interval_secs == 0 {
        anyhow::bail!("parser.poll_interval_secs must be > 0");
    }

    match config.parser.reducto.table_output_format.as_str() {
        "markdown" | "json" | "html" => {}
        other => anyhow::bail!(
            "parser.reducto.table_output_format must be markdown, json, or html (got '{}')",
            other
        ),
    }

    if config.parser.adobe.poll_interval_secs == 0 {
        anyhow::bail!("parser.adobe.poll_interval_secs must be > 0");
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn parse(toml_src: &str) -> Config {
        toml::from_str(toml_src).unwrap()
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"/tmp/x.sqlite\"\n");
        assert_eq!(config.parser.provider, "reducto");
        assert_eq!(config.parser.poll_interval_secs, 5);
        assert_eq!(config.parser.reducto.table_output_format, "markdown");
        assert!(!config.parser.reducto.enhance_text);
        assert_eq!(config.server.bind, "127.0.0.1:7340");
        assert_eq!(config.db.busy_timeout_secs, 10);
        assert!(validate(&config).is_ok());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = parse("[db]\npath = \"/tmp/x.sqlite\"\n");
        let env: HashMap<&str, &str> = [
            ("PARSER_PROVIDER", "Adobe"),
            ("REDUCTO_TABLE_OUTPUT_FORMAT", "html"),
            ("REDUCTO_ENHANCE_TABLE", "true"),
            ("REDUCTO_ENHANCE_TEXT", "yes"),
        ]
        .into_iter()
        .collect();
        apply_env_overrides(&mut config, |k| env.get(k).map(|v| v.to_string()));

        assert_eq!(config.parser.provider, "adobe");
        assert_eq!(config.parser.reducto.table_output_format, "html");
        assert!(config.parser.reducto.enhance_table);
        // only the literal "true" enables a flag
        assert!(!config.parser.reducto.enhance_text);
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let config = parse("[db]\npath = \"/tmp/x.sqlite\"\n[parser]\nprovider = \"mock\"\n");
        let err = validate(&config).unwrap_err();
        assert!(err.to_string().contains("Unknown parser provider"));
    }

    #[test]
    fn test_rejects_bad_table_format() {
        let config = parse(
            "[db]\npath = \"/tmp/x.sqlite\"\n[parser.reducto]\ntable_output_format = \"csv\"\n",
        );
        assert!(validate(&config).is_err());
    }
}
