//! Gist-backed store: one JSON file per installation inside a shared gist.
//!
//! The whole gist is read on every fetch and filtered client-side. Entries
//! carry no group label, so this backend cannot partition peers by group and
//! only suits single-group deployments.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, error, warn};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION};
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use crate::config::GistConfig;
use crate::peer::{now_millis, PeerRecord, PeerSet};
use crate::prefs::Preferences;
use crate::store::mapper;
use crate::store::PeerLocationStore;

const API_VERSION: &str = "2022-11-28";

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait GistApi: Send + Sync {
    /// Map of file name to file content.
    async fn files(&self, gist_id: &str) -> Result<HashMap<String, String>>;

    /// Create or replace a single file of the gist.
    async fn update_file(&self, gist_id: &str, filename: &str, content: &str) -> Result<()>;
}

#[derive(Debug, Deserialize)]
struct GistResponse {
    #[serde(default)]
    files: HashMap<String, GistFile>,
}

#[derive(Debug, Deserialize)]
struct GistFile {
    #[serde(default)]
    content: Option<String>,
}

pub struct GistHttpClient {
    client: reqwest::Client,
    api_url: String,
}

impl GistHttpClient {
    pub fn new(config: &GistConfig) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        headers.insert("x-github-api-version", HeaderValue::from_static(API_VERSION));
        if !config.token.is_empty() {
            let mut auth = HeaderValue::from_str(&format!("Bearer {}", config.token))
                .context("Invalid gist token")?;
            auth.set_sensitive(true);
            headers.insert(AUTHORIZATION, auth);
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent(concat!("tryst-sync/", env!("CARGO_PKG_VERSION")))
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        let mut api_url = config.api_url.clone();
        if !api_url.ends_with('/') {
            api_url.push('/');
        }
        Ok(GistHttpClient { client, api_url })
    }
}

#[async_trait]
impl GistApi for GistHttpClient {
    async fn files(&self, gist_id: &str) -> Result<HashMap<String, String>> {
        let url = format!("{}{}", self.api_url, gist_id);
        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("GET {} returned {}", url, status));
        }
        let body: GistResponse = response
            .json()
            .await
            .context("Unexpected gist response body")?;

        Ok(body
            .files
            .into_iter()
            .filter_map(|(name, file)| file.content.map(|content| (name, content)))
            .collect())
    }

    async fn update_file(&self, gist_id: &str, filename: &str, content: &str) -> Result<()> {
        let url = format!("{}{}", self.api_url, gist_id);
        let payload = json!({ "files": { filename: { "content": content } } });
        let response = self.client.patch(&url).json(&payload).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("PATCH {} returned {}", url, status));
        }
        Ok(())
    }
}

pub struct GistStore<A: GistApi> {
    api: A,
    prefs: Arc<Preferences>,
    gist_id: String,
}

impl<A: GistApi> GistStore<A> {
    pub fn new(api: A, prefs: Arc<Preferences>, gist_id: &str) -> Self {
        GistStore {
            api,
            prefs,
            gist_id: gist_id.to_string(),
        }
    }

    async fn try_fetch(&self) -> Result<PeerSet> {
        let own_id = self.prefs.uid()?;
        let files = self.api.files(&self.gist_id).await?;

        let mut peers = PeerSet::new();
        for (id, content) in files {
            if id == own_id {
                continue;
            }
            match mapper::record_from_gist(&id, &content) {
                Ok(record) => {
                    peers.insert(id, record);
                }
                Err(e) => warn!("[GistStore] Skipping unreadable entry: {:#}", e),
            }
        }
        Ok(peers)
    }

    async fn try_save(&self, latitude: f64, longitude: f64) -> Result<()> {
        let record = PeerRecord {
            id: self.prefs.uid()?,
            name: self.prefs.name(),
            latitude,
            longitude,
            timestamp: now_millis(),
            group: self.prefs.group(),
        };
        let content = mapper::gist_content(&record)?;
        self.api
            .update_file(&self.gist_id, &record.id, &content)
            .await
    }
}

#[async_trait]
impl<A: GistApi> PeerLocationStore for GistStore<A> {
    async fn fetch_peers(&self, group: &str) -> PeerSet {
        debug!("[GistStore] Fetching peers (group '{}' not applied)", group);
        match self.try_fetch().await {
            Ok(peers) => peers,
            Err(e) => {
                error!("[GistStore] Failed to read peer locations: {:#}", e);
                PeerSet::new()
            }
        }
    }

    async fn save_location(&self, latitude: f64, longitude: f64) {
        match self.try_save(latitude, longitude).await {
            Ok(()) => debug!("[GistStore] Location saved to the gist"),
            Err(e) => error!("[GistStore] Failed to save location: {:#}", e),
        }
    }

    fn filters_by_group(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use std::sync::Mutex;
    use tempfile::{tempdir, TempDir};

    fn prefs() -> (TempDir, Arc<Preferences>) {
        let dir = tempdir().unwrap();
        let prefs = Arc::new(Preferences::open(dir.path().join("prefs.json")));
        (dir, prefs)
    }

    fn entry(name: &str, lat: f64, lon: f64) -> String {
        format!(
            r#"{{"name":"{}","latitude":{},"longitude":{},"timestamp":{}}}"#,
            name,
            lat,
            lon,
            now_millis()
        )
    }

    #[tokio::test]
    async fn test_fetch_maps_entries_and_skips_own() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_dir, prefs) = prefs();
        let own = prefs.uid().unwrap();

        let mut files = HashMap::new();
        files.insert("123".to_string(), entry("First", 50.1, 40.2));
        files.insert("234".to_string(), entry("Second", 51.1, 41.2));
        files.insert(own.clone(), entry("Me", 1.0, 2.0));
        files.insert("broken".to_string(), "Something".to_string());

        let mut api = MockGistApi::new();
        api.expect_files()
            .times(1)
            .returning(move |_| Ok(files.clone()));

        let store = GistStore::new(api, prefs, "321");
        let peers = store.fetch_peers("Guest").await;

        assert_eq!(peers.len(), 2);
        assert!(!peers.contains_key(&own));
        assert_eq!(peers["123"].name, "First");
        assert_eq!(peers["123"].latitude, 50.1);
        assert_eq!(peers["123"].longitude, 40.2);
        assert_eq!(peers["234"].name, "Second");
        assert_eq!(peers["234"].latitude, 51.1);
        assert_eq!(peers["234"].longitude, 41.2);
    }

    #[tokio::test]
    async fn test_fetch_is_empty_on_failure() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_dir, prefs) = prefs();

        let mut api = MockGistApi::new();
        api.expect_files()
            .times(1)
            .returning(|_| Err(anyhow!("GET returned 403 Forbidden")));

        let store = GistStore::new(api, prefs, "321");
        assert!(store.fetch_peers("Guest").await.is_empty());
    }

    #[tokio::test]
    async fn test_group_is_not_filtered() {
        let (_dir, prefs) = prefs();
        let mut files = HashMap::new();
        files.insert("123".to_string(), entry("First", 50.1, 40.2));

        let mut api = MockGistApi::new();
        api.expect_files()
            .times(2)
            .returning(move |_| Ok(files.clone()));

        let store = GistStore::new(api, prefs, "321");
        assert!(!store.filters_by_group());
        let in_guest = store.fetch_peers("Guest").await;
        let in_other = store.fetch_peers("some-other-group").await;
        assert_eq!(in_guest, in_other);
        assert_eq!(in_other.len(), 1);
    }

    #[tokio::test]
    async fn test_save_writes_own_file() {
        let (_dir, prefs) = prefs();
        prefs.set_name("Testing Test").unwrap();
        let own = prefs.uid().unwrap();

        let calls: Arc<Mutex<Vec<(String, String, String)>>> = Arc::new(Mutex::new(Vec::new()));
        let sink = calls.clone();
        let mut api = MockGistApi::new();
        api.expect_update_file()
            .times(1)
            .returning(move |gist_id, filename, content| {
                sink.lock()
                    .unwrap()
                    .push((gist_id.to_string(), filename.to_string(), content.to_string()));
                Ok(())
            });

        let before = now_millis();
        let store = GistStore::new(api, prefs, "321");
        store.save_location(50.1, 40.2).await;

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        let (gist_id, filename, content) = &calls[0];
        assert_eq!(gist_id, "321");
        assert_eq!(filename, &own);

        let payload: Value = serde_json::from_str(content).unwrap();
        assert_eq!(payload["latitude"], 50.1);
        assert_eq!(payload["longitude"], 40.2);
        assert_eq!(payload["name"], "Testing Test");
        let ts = payload["timestamp"].as_i64().unwrap();
        assert!(ts >= before && ts <= now_millis());
    }

    #[tokio::test]
    async fn test_save_swallows_errors() {
        let _ = env_logger::builder().is_test(true).try_init();
        let (_dir, prefs) = prefs();

        let mut api = MockGistApi::new();
        api.expect_update_file()
            .times(1)
            .returning(|_, _, _| Err(anyhow!("PATCH returned 403 Forbidden")));

        let store = GistStore::new(api, prefs, "321");
        store.save_location(51.1, 42.2).await;
    }

    #[test]
    fn test_client_normalizes_api_url() {
        let config = GistConfig {
            api_url: "https://example.invalid/gists".to_string(),
            ..GistConfig::default()
        };
        let client = GistHttpClient::new(&config).unwrap();
        assert_eq!(client.api_url, "https://example.invalid/gists/");
    }
}
