//! Configuration.
//!
//! Loaded from a TOML file named [`CONFIG_FILE_NAME`]:
//!
//! ```toml
//! [pkcs11]
//! path = "/usr/lib/softhsm/libsofthsm2.so"
//! token_label = "manetu"
//! pin = "1234"
//!
//! [backend]
//! token_url = "https://portal.manetu.io/oauth/token"
//! ```

use std::fmt;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

/// File name looked up in each search directory.
pub const CONFIG_FILE_NAME: &str = "security-tokens.toml";

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no {CONFIG_FILE_NAME} found in {}", format_paths(.0))]
    NotFound(Vec<PathBuf>),

    #[error("failed to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration value for '{field}': {reason}")]
    Invalid { field: &'static str, reason: String },
}

fn format_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| p.display().to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Process configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Hardware keystore module.
    pub pkcs11: Pkcs11Config,

    /// Backend token endpoint.
    pub backend: BackendConfig,
}

/// PKCS#11 module settings.
#[derive(Clone, Deserialize)]
pub struct Pkcs11Config {
    /// Path to the PKCS#11 shared library.
    pub path: PathBuf,

    /// Label of the token to use.
    #[serde(alias = "tokenlabel")]
    pub token_label: String,

    /// User PIN.
    pub pin: String,
}

impl fmt::Debug for Pkcs11Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pkcs11Config")
            .field("path", &self.path)
            .field("token_label", &self.token_label)
            .field("pin", &"<redacted>")
            .finish()
    }
}

/// Backend endpoint settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BackendConfig {
    /// Token endpoint used for both legs of the login exchange.
    #[serde(alias = "tokenurl")]
    pub token_url: String,
}

impl Config {
    /// Parse and validate configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate configuration from a file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Load from `explicit` if given, otherwise from the first existing file
    /// in [`Config::search_paths`]. Returns the configuration and its path.
    pub fn discover(explicit: Option<&Path>) -> Result<(Self, PathBuf), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::from_file(path)?, path.to_path_buf()));
        }

        let candidates = Self::search_paths();
        match candidates.iter().find(|p| p.is_file()) {
            Some(path) => Ok((Self::from_file(path)?, path.clone())),
            None => Err(ConfigError::NotFound(candidates)),
        }
    }

    /// Candidate locations, in lookup order: the working directory,
    /// `$HOME/.manetu`, then `/etc/manetu`.
    pub fn search_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from(".").join(CONFIG_FILE_NAME)];
        if let Some(home) = dirs::home_dir() {
            paths.push(home.join(".manetu").join(CONFIG_FILE_NAME));
        }
        paths.push(PathBuf::from("/etc/manetu").join(CONFIG_FILE_NAME));
        paths
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pkcs11.path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                field: "pkcs11.path",
                reason: "must not be empty".to_string(),
            });
        }
        if self.pkcs11.token_label.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "pkcs11.token_label",
                reason: "must not be empty".to_string(),
            });
        }
        if self.backend.token_url.trim().is_empty() {
            return Err(ConfigError::Invalid {
                field: "backend.token_url",
                reason: "must not be empty".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        [pkcs11]
        path = "/usr/lib/softhsm/libsofthsm2.so"
        token_label = "manetu"
        pin = "1234"

        [backend]
        token_url = "https://backend.example/oauth/token"
    "#;

    #[test]
    fn test_parse_config() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        assert_eq!(
            config.pkcs11.path,
            PathBuf::from("/usr/lib/softhsm/libsofthsm2.so")
        );
        assert_eq!(config.pkcs11.token_label, "manetu");
        assert_eq!(config.backend.token_url, "https://backend.example/oauth/token");
    }

    #[test]
    fn test_parse_flat_key_aliases() {
        let content = r#"
            [pkcs11]
            path = "/lib/p11.so"
            tokenlabel = "manetu"
            pin = "1234"

            [backend]
            tokenurl = "https://backend.example/oauth/token"
        "#;
        let config = Config::from_toml_str(content).unwrap();
        assert_eq!(config.pkcs11.token_label, "manetu");
        assert_eq!(config.backend.token_url, "https://backend.example/oauth/token");
    }

    #[test]
    fn test_empty_token_url_rejected() {
        let content = SAMPLE.replace("https://backend.example/oauth/token", "");
        let result = Config::from_toml_str(&content);
        assert!(matches!(
            result,
            Err(ConfigError::Invalid {
                field: "backend.token_url",
                ..
            })
        ));
    }

    #[test]
    fn test_missing_section_is_parse_error() {
        let result = Config::from_toml_str("[backend]\ntoken_url = \"x\"\n");
        assert!(matches!(result, Err(ConfigError::Parse(_))));
    }

    #[test]
    fn test_pin_is_redacted() {
        let config = Config::from_toml_str(SAMPLE).unwrap();
        let debug = format!("{:?}", config);
        assert!(!debug.contains("1234"));
    }

    #[test]
    fn test_discover_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE_NAME);
        std::fs::write(&path, SAMPLE).unwrap();

        let (config, used) = Config::discover(Some(&path)).unwrap();
        assert_eq!(used, path);
        assert_eq!(config.pkcs11.token_label, "manetu");
    }

    #[test]
    fn test_discover_missing_explicit_path() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::discover(Some(&dir.path().join("absent.toml")));
        assert!(matches!(result, Err(ConfigError::Read { .. })));
    }

    #[test]
    fn test_search_paths_order() {
        let paths = Config::search_paths();
        assert_eq!(paths.first().unwrap(), &PathBuf::from(".").join(CONFIG_FILE_NAME));
        assert_eq!(
            paths.last().unwrap(),
            &PathBuf::from("/etc/manetu").join(CONFIG_FILE_NAME)
        );
    }
}
