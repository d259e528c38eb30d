use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error type for settings operations
#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlParse(String),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(String),

    #[error("Unknown file format: {0}")]
    UnknownFormat(String),

    #[error("Setting not found: {0}")]
    SettingNotFound(String),

    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Result type for settings operations
pub type Result<T> = std::result::Result<T, SettingsError>;

/// Settings format
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SettingsFormat {
    Toml,
    Json,
    Yaml,
}

impl SettingsFormat {
    /// Detect the format from a file path
    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension().and_then(|ext| {
            let ext = ext.to_string_lossy().to_lowercase();
            match ext.as_str() {
                "toml" => Some(Self::Toml),
                "json" => Some(Self::Json),
                "yaml" | "yml" => Some(Self::Yaml),
                _ => None,
            }
        })
    }
}

/// Upper-case keyed crawler settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Raw settings as key-value pairs, sorted by key
    #[serde(flatten)]
    pub raw: BTreeMap<String, serde_json::Value>,

    /// Path to the settings file, if loaded from a file
    #[serde(skip)]
    pub file_path: Option<PathBuf>,
}

impl Settings {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load settings from a file, picking the format from its extension
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let format = SettingsFormat::from_path(path)
            .ok_or_else(|| SettingsError::UnknownFormat(path.to_string_lossy().to_string()))?;

        let contents = fs::read_to_string(path)?;
        let mut settings = match format {
            SettingsFormat::Toml => Self::from_toml(&contents)?,
            SettingsFormat::Json => Self::from_json(&contents)?,
            SettingsFormat::Yaml => Self::from_yaml(&contents)?,
        };

        settings.file_path = Some(path.to_path_buf());
        Ok(settings)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        let raw = toml::from_str(contents).map_err(|e| SettingsError::TomlParse(e.to_string()))?;
        Ok(Self {
            raw,
            file_path: None,
        })
    }

    pub fn from_json(contents: &str) -> Result<Self> {
        let raw = serde_json::from_str(contents)?;
        Ok(Self {
            raw,
            file_path: None,
        })
    }

    pub fn from_yaml(_contents: &str) -> Result<Self> {
        #[cfg(feature = "yaml")]
        {
            let raw = serde_yaml::from_str(_contents)
                .map_err(|e| SettingsError::YamlParse(e.to_string()))?;
            Ok(Self {
                raw,
                file_path: None,
            })
        }

        #[cfg(not(feature = "yaml"))]
        {
            Err(SettingsError::YamlParse(
                "YAML support not enabled".to_string(),
            ))
        }
    }

    /// Get a setting as a specific type
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<T> {
        self.raw
            .get(key)
            .ok_or_else(|| SettingsError::SettingNotFound(key.to_string()))
            .and_then(|value| {
                serde_json::from_value(value.clone()).map_err(|e| SettingsError::InvalidValue {
                    key: key.to_string(),
                    message: e.to_string(),
                })
            })
    }

    /// Get a setting if present. A present value of the wrong type is an error.
    pub fn get_opt<T: for<'de> Deserialize<'de>>(&self, key: &str) -> Result<Option<T>> {
        if self.raw.contains_key(key) {
            self.get(key).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Get a setting with a default value
    pub fn get_or<T: for<'de> Deserialize<'de>>(&self, key: &str, default: T) -> T {
        self.get(key).unwrap_or(default)
    }

    pub fn set<T: Serialize>(&mut self, key: &str, value: T) -> Result<()> {
        let value = serde_json::to_value(value)?;
        self.raw.insert(key.to_string(), value);
        Ok(())
    }

    pub fn contains(&self, key: &str) -> bool {
        self.raw.contains_key(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<serde_json::Value> {
        self.raw.remove(key)
    }

    pub fn all(&self) -> &BTreeMap<String, serde_json::Value> {
        &self.raw
    }

    /// Save settings to a file, picking the format from its extension
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        let format = SettingsFormat::from_path(path)
            .ok_or_else(|| SettingsError::UnknownFormat(path.to_string_lossy().to_string()))?;

        let contents = match format {
            SettingsFormat::Toml => {
                toml::to_string(&self.raw).map_err(|e| SettingsError::TomlParse(e.to_string()))?
            }
            SettingsFormat::Json => serde_json::to_string_pretty(&self.raw)?,
            SettingsFormat::Yaml => {
                #[cfg(feature = "yaml")]
                {
                    serde_yaml::to_string(&self.raw)
                        .map_err(|e| SettingsError::YamlParse(e.to_string()))?
                }

                #[cfg(not(feature = "yaml"))]
                {
                    return Err(SettingsError::YamlParse(
                        "YAML support not enabled".to_string(),
                    ));
                }
            }
        };

        fs::write(path, contents)?;
        Ok(())
    }
}
