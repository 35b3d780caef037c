//! Configuration loading and defaults for idle-portald.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Main configuration for idle-portald.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Well-known bus name of the backend idle-monitor implementation.
    pub backend_name: String,

    /// Well-known bus name this daemon claims on the session bus.
    pub bus_name: String,

    /// Replace an existing owner of `bus_name` instead of failing.
    pub replace_existing: bool,

    /// Compatibility mode: drop denied requests without any response,
    /// leaving the caller waiting, as the pre-redesign protocol did.
    /// When false (default), denial is answered with the generic failure
    /// response code.
    pub silent_denial: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            backend_name: "org.freedesktop.impl.portal.desktop.gnome".to_string(),
            bus_name: "org.freedesktop.portal.Desktop".to_string(),
            replace_existing: false,
            silent_denial: false,
        }
    }
}

impl Config {
    /// Load configuration from a file path.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;
        Ok(config)
    }

    /// Load configuration from the default path, or return defaults if not found.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(p) = path {
            return Self::load(p);
        }

        if let Some(config_dir) = dirs::config_dir() {
            let default_path = config_dir.join("idle-portald").join("config.toml");
            if default_path.exists() {
                return Self::load(&default_path);
            }
        }

        Ok(Self::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.bus_name, "org.freedesktop.portal.Desktop");
        assert!(!config.replace_existing);
        assert!(!config.silent_denial);
    }

    #[test]
    fn test_parse_toml() {
        let toml_str = r#"
            backend_name = "org.freedesktop.impl.portal.desktop.kde"
            replace_existing = true
            silent_denial = true
        "#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(
            config.backend_name,
            "org.freedesktop.impl.portal.desktop.kde"
        );
        assert!(config.replace_existing);
        assert!(config.silent_denial);
        // Unspecified fields keep their defaults.
        assert_eq!(config.bus_name, "org.freedesktop.portal.Desktop");
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "backend_name = \"org.example.Backend\"").unwrap();

        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.backend_name, "org.example.Backend");
    }

    #[test]
    fn test_load_missing_file_fails() {
        assert!(Config::load(Path::new("/nonexistent/idle-portald.toml")).is_err());
    }
}
