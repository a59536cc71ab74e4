use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::peer::{check_coordinates, Fix};
use crate::state::FALLBACK_LOCATION;
use crate::store::Backend;
use crate::traits::Accuracy;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub interval_secs: u64,
    pub fix_timeout_secs: u64,
    /// Age after which a known peer is dropped when fetches come back empty. 0 keeps peers.
    pub peer_expiry_secs: u64,
    pub fallback_location: Fix,
    pub accuracy: Accuracy,
    pub prefs_path: PathBuf,
    pub backend: Backend,
    pub document: DocumentConfig,
    pub gist: GistConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DocumentConfig {
    pub api_key: String,
    pub project_id: String,
    pub auth_url: String,
    pub token_url: String,
    pub firestore_url: String,
    pub collection: String,
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GistConfig {
    pub api_url: String,
    pub gist_id: String,
    pub token: String,
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            interval_secs: 15,
            fix_timeout_secs: 10,
            peer_expiry_secs: 3600,
            fallback_location: FALLBACK_LOCATION,
            accuracy: Accuracy::Balanced,
            prefs_path: PathBuf::from("tryst-prefs.json"),
            backend: Backend::Document,
            document: DocumentConfig::default(),
            gist: GistConfig::default(),
        }
    }
}

impl Default for DocumentConfig {
    fn default() -> Self {
        DocumentConfig {
            api_key: String::new(),
            project_id: String::new(),
            auth_url: "https://identitytoolkit.googleapis.com/v1".to_string(),
            token_url: "https://securetoken.googleapis.com/v1".to_string(),
            firestore_url: "https://firestore.googleapis.com/v1".to_string(),
            collection: "location".to_string(),
            timeout_secs: 30,
        }
    }
}

impl Default for GistConfig {
    fn default() -> Self {
        GistConfig {
            api_url: "https://api.github.com/gists/".to_string(),
            gist_id: String::new(),
            token: String::new(),
            timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        let config: Config = serde_json::from_str(&raw)
            .with_context(|| format!("Failed to parse config {}", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.interval_secs == 0 {
            return Err(anyhow!("interval_secs must be greater than zero"));
        }
        if self.fix_timeout_secs == 0 {
            return Err(anyhow!("fix_timeout_secs must be greater than zero"));
        }
        check_coordinates(
            self.fallback_location.latitude,
            self.fallback_location.longitude,
        )
        .context("Invalid fallback_location")?;
        match self.backend {
            Backend::Document => {
                if self.document.project_id.is_empty() || self.document.api_key.is_empty() {
                    return Err(anyhow!("document backend needs project_id and api_key"));
                }
            }
            Backend::Gist => {
                if self.gist.gist_id.is_empty() {
                    return Err(anyhow!("gist backend needs gist_id"));
                }
            }
        }
        Ok(())
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn fix_timeout(&self) -> Duration {
        Duration::from_secs(self.fix_timeout_secs)
    }

    pub fn peer_expiry(&self) -> Option<Duration> {
        (self.peer_expiry_secs > 0).then(|| Duration::from_secs(self.peer_expiry_secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.interval(), Duration::from_secs(15));
        assert_eq!(config.fallback_location, FALLBACK_LOCATION);
        assert_eq!(config.backend, Backend::Document);
        assert_eq!(config.document.collection, "location");
        assert_eq!(config.gist.api_url, "https://api.github.com/gists/");
        assert_eq!(config.peer_expiry(), Some(Duration::from_secs(3600)));
    }

    #[test]
    fn test_zero_expiry_keeps_peers() {
        let config = Config {
            peer_expiry_secs: 0,
            ..Config::default()
        };
        assert_eq!(config.peer_expiry(), None);
        assert_eq!(crate::controller::LoopSettings::from(&config).peer_expiry, None);
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("tryst.json");
        fs::write(
            &path,
            r#"{ "backend": "gist", "gist": { "gist_id": "321" }, "accuracy": "high" }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.backend, Backend::Gist);
        assert_eq!(config.gist.gist_id, "321");
        assert_eq!(config.accuracy, Accuracy::High);
        assert_eq!(config.interval_secs, 15);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validation() {
        let mut config = Config::default();
        assert!(config.validate().is_err());

        config.document.project_id = "tryst".to_string();
        config.document.api_key = "key".to_string();
        assert!(config.validate().is_ok());

        config.interval_secs = 0;
        assert!(config.validate().is_err());

        config.interval_secs = 15;
        config.fix_timeout_secs = 0;
        assert!(config.validate().is_err());

        config.fix_timeout_secs = 10;
        config.fallback_location.latitude = 100.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_errors() {
        let dir = tempdir().unwrap();
        assert!(Config::load(dir.path().join("missing.json")).is_err());

        let path = dir.path().join("bad.json");
        fs::write(&path, "{").unwrap();
        assert!(Config::load(&path).is_err());
    }
}
