//! Configuration loading
//!
//! Loads orchestrator configuration from YAML, TOML or JSON, picking the
//! format from the file extension. `${VAR}` and `$VAR` references are
//! replaced with environment values before parsing; unknown variables are
//! left untouched. Sources can be layered, later ones overriding earlier.

use config::{Config as Cfg, Environment, File, FileFormat};
use regex::Regex;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::LazyLock;

pub use config::FileFormat as Format;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Deserialization error: {0}")]
    Deserialize(String),

    #[error("Invalid value for {field}: {reason}")]
    Invalid { field: String, reason: String },
}

pub type ConfigResult<T> = Result<T, ConfigError>;

impl From<ConfigError> for crate::agent::AgentError {
    fn from(err: ConfigError) -> Self {
        crate::agent::AgentError::Config(err.to_string())
    }
}

static BRACED_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("braced env pattern is valid")
});

static BARE_VAR: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$([A-Za-z_][A-Za-z0-9_]*)\b").expect("bare env pattern is valid")
});

/// Detect configuration format from file extension
///
/// `.yaml`/`.yml`, `.toml` and `.json` are recognised.
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

/// Substitute environment variables in a string
pub fn substitute_env_vars(content: &str) -> String {
    let lookup = |caps: &regex::Captures| {
        std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
    };
    let braced = BRACED_VAR.replace_all(content, lookup);
    BARE_VAR.replace_all(&braced, lookup).into_owned()
}

fn build<T>(builder: config::ConfigBuilder<config::builder::DefaultState>) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    builder
        .build()
        .map_err(|e| ConfigError::Parse(e.to_string()))?
        .try_deserialize()
        .map_err(|e| ConfigError::Deserialize(e.to_string()))
}

/// Load configuration from a file
pub fn load_config<T>(path: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    from_str(&content, format)
}

/// Load configuration from a string with explicit format
pub fn from_str<T>(content: &str, format: FileFormat) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let substituted = substitute_env_vars(content);
    build(Cfg::builder().add_source(File::from_str(&substituted, format)))
}

/// Merge multiple configuration sources, later sources overriding earlier ones
pub fn merge_configs<T>(sources: &[(&str, FileFormat)]) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let mut builder = Cfg::builder();
    for (content, format) in sources {
        let substituted = substitute_env_vars(content);
        builder = builder.add_source(File::from_str(&substituted, *format));
    }
    build(builder)
}

/// Load configuration with environment variable overrides
///
/// Variables use the given prefix and `__` for nesting, so
/// `SQUADRON_HEALTH__TIMEOUT_MS` overrides `health.timeout_ms`.
pub fn load_with_env<T>(path: &str, env_prefix: &str) -> ConfigResult<T>
where
    T: DeserializeOwned,
{
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&content);

    build(
        Cfg::builder()
            .add_source(File::from_str(&substituted, format))
            .add_source(
                Environment::with_prefix(env_prefix)
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            ),
    )
}
