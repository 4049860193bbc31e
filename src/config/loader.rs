//! Configuration Loader
//!
//! Finds `paging-config.yaml`, overlays the section named after the running
//! environment onto the base document, applies `DATABASE_URL`, and validates
//! the result.

use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use serde_yaml::Value as YamlValue;
use tracing::{debug, info};

use super::error::{ConfigResult, ConfigurationError};
use super::PagingConfig;

const FILE_NAMES: [&str; 2] = ["paging-config.yaml", "paging-config.yml"];
/// Top-level keys holding per-environment overrides.
const ENVIRONMENT_SECTIONS: [&str; 3] = ["development", "test", "production"];
const MAX_FILE_BYTES: u64 = 1024 * 1024;
const SECRET_KEYS: [&str; 6] = ["password", "secret", "key", "token", "credential", "url"];

/// Validated configuration for one environment.
#[derive(Debug)]
pub struct ConfigManager {
    config: PagingConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load from the default directory for the detected environment.
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = crate::logging::get_environment().to_lowercase();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load for an explicit environment, leaving process variables other
    /// than `DATABASE_URL` out of it.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let config_directory = config_dir.unwrap_or_else(default_directory);
        let source = ConfigSource::locate(&config_directory)?;
        debug!(
            environment = %environment,
            file = %source.path.display(),
            "reading configuration"
        );

        let mut config = source.parse_for(environment)?;
        if let Some(url) = env::var("DATABASE_URL").ok().filter(|url| !url.is_empty()) {
            config.database.url = Some(url);
        }
        config.validate()?;

        debug!(config = %masked(&config), "effective configuration");
        info!(
            environment = %environment,
            database_host = %config.database.host,
            pool_size = config.database.pool,
            cycle_time_ms = config.engine.cycle_time_ms,
            "⚙️ CONFIG: loaded"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    pub fn config(&self) -> &PagingConfig {
        &self.config
    }

    /// The loaded configuration with credentials masked.
    pub fn debug_config(&self) -> JsonValue {
        masked(&self.config)
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }
}

/// The configuration file picked out of a directory.
#[derive(Debug)]
struct ConfigSource {
    path: PathBuf,
}

impl ConfigSource {
    fn locate(dir: &Path) -> ConfigResult<Self> {
        let candidates: Vec<PathBuf> = FILE_NAMES.iter().map(|name| dir.join(name)).collect();
        match candidates.iter().find(|path| path.is_file()) {
            Some(path) => Ok(Self { path: path.clone() }),
            None => Err(ConfigurationError::config_file_not_found(candidates)),
        }
    }

    fn read(&self) -> ConfigResult<String> {
        let display = || self.path.display().to_string();
        let size = std::fs::metadata(&self.path)
            .map_err(|e| ConfigurationError::file_read_error(display(), e))?
            .len();
        if size > MAX_FILE_BYTES {
            return Err(ConfigurationError::invalid_value(
                "file_size",
                size.to_string(),
                format!("configuration files are limited to {MAX_FILE_BYTES} bytes"),
            ));
        }

        std::fs::read_to_string(&self.path).map_err(|e| ConfigurationError::file_read_error(display(), e))
    }

    /// Base document with the `environment` section overlaid.
    fn parse_for(&self, environment: &str) -> ConfigResult<PagingConfig> {
        let file = self.path.display().to_string();
        let doc: YamlValue = serde_yaml::from_str(&self.read()?)
            .map_err(|e| ConfigurationError::invalid_yaml(file.clone(), e))?;

        let mut config: PagingConfig = serde_yaml::from_value(for_environment(doc, environment))
            .map_err(|e| ConfigurationError::invalid_yaml(file, format!("decode configuration: {e}")))?;
        config.environment = environment.to_string();
        Ok(config)
    }
}

/// Overlay the `environment` section onto the base and drop every
/// environment section from the result.
fn for_environment(doc: YamlValue, environment: &str) -> YamlValue {
    let YamlValue::Mapping(mut base) = doc else {
        return doc;
    };

    let mut sections: Vec<(String, YamlValue)> = Vec::new();
    for name in ENVIRONMENT_SECTIONS {
        if let Some(section) = base.remove(name) {
            sections.push((name.to_string(), section));
        }
    }

    let mut merged = YamlValue::Mapping(base);
    if let Some((_, section)) = sections.into_iter().find(|(name, _)| name == environment) {
        debug!(environment = %environment, "applying environment overrides");
        overlay(&mut merged, section);
    }
    merged
}

/// Recursively merge `top` into `base`: mappings merge key by key, anything
/// else is replaced.
fn overlay(base: &mut YamlValue, top: YamlValue) {
    match (base, top) {
        (YamlValue::Mapping(base), YamlValue::Mapping(top)) => {
            for (key, value) in top {
                match base.get_mut(&key) {
                    Some(existing) => overlay(existing, value),
                    None => {
                        base.insert(key, value);
                    }
                }
            }
        }
        (base, top) => *base = top,
    }
}

fn masked(config: &PagingConfig) -> JsonValue {
    let mut value = serde_json::to_value(config).unwrap_or(JsonValue::Null);
    mask_secrets(&mut value);
    value
}

/// Replace every string under a credential-looking key with a hint that
/// keeps only its first and last two characters.
fn mask_secrets(value: &mut JsonValue) {
    match value {
        JsonValue::Object(map) => {
            for (key, field) in map.iter_mut() {
                let key = key.to_lowercase();
                if SECRET_KEYS.iter().any(|secret| key.contains(secret)) {
                    *field = mask_one(field);
                } else {
                    mask_secrets(field);
                }
            }
        }
        JsonValue::Array(items) => items.iter_mut().for_each(mask_secrets),
        _ => {}
    }
}

fn mask_one(field: &JsonValue) -> JsonValue {
    match field {
        JsonValue::Null => JsonValue::Null,
        JsonValue::String(s) if s.is_empty() => JsonValue::String("[EMPTY]".into()),
        JsonValue::String(s) => {
            let chars: Vec<char> = s.chars().collect();
            let hint = if chars.len() > 4 {
                let head: String = chars[..2].iter().collect();
                let tail: String = chars[chars.len() - 2..].iter().collect();
                format!("{head}***{tail}")
            } else {
                "***".to_string()
            };
            JsonValue::String(format!("[MASKED: {hint}]"))
        }
        _ => JsonValue::String("[MASKED]".into()),
    }
}

fn default_directory() -> PathBuf {
    env::var("CARGO_MANIFEST_DIR")
        .map(|dir| PathBuf::from(dir).join("config"))
        .ok()
        .filter(|dir| dir.exists())
        .unwrap_or_else(|| PathBuf::from("config"))
}
