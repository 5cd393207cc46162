use super::Config;
use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "portlease.yaml";
const ALT_CONFIG_FILE_NAME: &str = "portlease.yml";

pub struct Parser;

impl Parser {
    pub fn new() -> Self {
        Self
    }

    /// Find config file starting from current directory, then the user's
    /// config directory.
    pub fn find_config_file(&self) -> Result<PathBuf> {
        let current_dir = std::env::current_dir()?;
        if let Ok(path) = Self::find_config_in_dir(&current_dir) {
            return Ok(path);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let user_path = config_dir.join("portlease").join(CONFIG_FILE_NAME);
            if user_path.exists() {
                return Ok(user_path);
            }
        }

        Err(Error::Config(format!(
            "Could not find {} in current directory, any parent, or the user config directory",
            CONFIG_FILE_NAME
        )))
    }

    pub fn find_config_in_dir(dir: &Path) -> Result<PathBuf> {
        let config_path = dir.join(CONFIG_FILE_NAME);
        if config_path.exists() {
            return Ok(config_path);
        }

        let alt_path = dir.join(ALT_CONFIG_FILE_NAME);
        if alt_path.exists() {
            return Ok(alt_path);
        }

        if let Some(parent) = dir.parent() {
            return Self::find_config_in_dir(parent);
        }

        Err(Error::Config(format!(
            "Could not find {} in '{}' or any parent",
            CONFIG_FILE_NAME,
            dir.display()
        )))
    }

    /// Load config from file path
    pub fn load_config<P: AsRef<Path>>(&self, path: P) -> Result<Config> {
        let content = fs::read_to_string(path.as_ref()).map_err(|e| {
            Error::Config(format!(
                "Failed to read config file '{}': {}",
                path.as_ref().display(),
                e
            ))
        })?;

        self.parse_config(&content)
    }

    /// Load the explicit path if given, otherwise the discovered file, otherwise
    /// the built-in defaults. The result is validated.
    pub fn load_or_default(&self, explicit: Option<&Path>) -> Result<Config> {
        let config = match explicit {
            Some(path) => self.load_config(path)?,
            None => match self.find_config_file() {
                Ok(path) => {
                    tracing::debug!("Using config file {:?}", path);
                    self.load_config(&path)?
                }
                Err(_) => Config::default(),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse config from YAML string
    pub fn parse_config(&self, content: &str) -> Result<Config> {
        if content.trim().is_empty() {
            return Ok(Config::default());
        }
        let config: Config = serde_yaml::from_str(content)?;

        Ok(config)
    }
}

impl Default for Parser {
    fn default() -> Self {
        Self::new()
    }
}
