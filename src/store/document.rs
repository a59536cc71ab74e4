//! Document-database store.
//!
//! Each installation owns one document in the locations collection, keyed by
//! the uid of an anonymous auth session. Fetches ask the server for documents
//! of the caller's group only.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::config::DocumentConfig;
use crate::peer::{now_millis, PeerRecord, PeerSet};
use crate::prefs::{Preferences, StoredSession};
use crate::store::mapper;
use crate::store::PeerLocationStore;

/// Authenticated anonymous session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub uid: String,
    pub id_token: String,
    pub refresh_token: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub fields: Value,
}

/// The backend refused the session's credentials.
#[derive(Debug)]
pub struct Unauthorized(pub String);

impl fmt::Display for Unauthorized {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unauthorized: {}", self.0)
    }
}

impl std::error::Error for Unauthorized {}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DocumentApi: Send + Sync {
    async fn sign_up_anonymously(&self) -> Result<Session>;

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session>;

    async fn query_group(&self, session: &Session, group: &str) -> Result<Vec<RawDocument>>;

    async fn set_document(&self, session: &Session, id: &str, fields: &Value) -> Result<()>;
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignUpResponse {
    id_token: String,
    local_id: String,
    refresh_token: String,
}

#[derive(Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    user_id: String,
}

#[derive(Deserialize)]
struct QueryItem {
    #[serde(default)]
    document: Option<DocumentBody>,
}

#[derive(Deserialize)]
struct DocumentBody {
    name: String,
    #[serde(default)]
    fields: Value,
}

pub struct FirestoreClient {
    client: reqwest::Client,
    config: DocumentConfig,
}

impl FirestoreClient {
    pub fn new(config: &DocumentConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(FirestoreClient {
            client,
            config: config.clone(),
        })
    }

    fn documents_url(&self) -> String {
        format!(
            "{}/projects/{}/databases/(default)/documents",
            self.config.firestore_url.trim_end_matches('/'),
            self.config.project_id
        )
    }
}

fn check_status(status: StatusCode, what: &str) -> Result<()> {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Unauthorized(format!("{} returned {}", what, status)).into());
    }
    if !status.is_success() {
        return Err(anyhow!("{} returned {}", what, status));
    }
    Ok(())
}

#[async_trait]
impl DocumentApi for FirestoreClient {
    async fn sign_up_anonymously(&self) -> Result<Session> {
        let url = format!(
            "{}/accounts:signUp",
            self.config.auth_url.trim_end_matches('/')
        );
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .json(&json!({ "returnSecureToken": true }))
            .send()
            .await?;
        check_status(response.status(), "signUp")?;
        let body: SignUpResponse = response.json().await.context("Unexpected signUp body")?;
        Ok(Session {
            uid: body.local_id,
            id_token: body.id_token,
            refresh_token: body.refresh_token,
        })
    }

    async fn refresh_session(&self, refresh_token: &str) -> Result<Session> {
        let url = format!("{}/token", self.config.token_url.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .query(&[("key", self.config.api_key.as_str())])
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
            ])
            .send()
            .await?;
        check_status(response.status(), "token refresh")?;
        let body: RefreshResponse = response.json().await.context("Unexpected token body")?;
        Ok(Session {
            uid: body.user_id,
            id_token: body.id_token,
            refresh_token: body.refresh_token,
        })
    }

    async fn query_group(&self, session: &Session, group: &str) -> Result<Vec<RawDocument>> {
        let url = format!("{}:runQuery", self.documents_url());
        let query = json!({
            "structuredQuery": {
                "from": [{ "collectionId": self.config.collection }],
                "where": {
                    "fieldFilter": {
                        "field": { "fieldPath": "group" },
                        "op": "EQUAL",
                        "value": { "stringValue": group },
                    }
                }
            }
        });
        let response = self
            .client
            .post(&url)
            .bearer_auth(&session.id_token)
            .json(&query)
            .send()
            .await?;
        check_status(response.status(), "runQuery")?;
        let items: Vec<QueryItem> = response.json().await.context("Unexpected runQuery body")?;

        Ok(items
            .into_iter()
            .filter_map(|item| item.document)
            .filter_map(|doc| {
                let id = mapper::document_id(&doc.name)?.to_string();
                Some(RawDocument {
                    id,
                    fields: doc.fields,
                })
            })
            .collect())
    }

    async fn set_document(&self, session: &Session, id: &str, fields: &Value) -> Result<()> {
        let url = format!("{}/{}/{}", self.documents_url(), self.config.collection, id);
        let response = self
            .client
            .patch(&url)
            .bearer_auth(&session.id_token)
            .json(&json!({ "fields": fields }))
            .send()
            .await?;
        check_status(response.status(), "document write")
    }
}

pub struct DocumentStore<A: DocumentApi> {
    api: A,
    prefs: Arc<Preferences>,
    session: Mutex<Option<Session>>,
}

impl<A: DocumentApi> DocumentStore<A> {
    pub fn new(api: A, prefs: Arc<Preferences>) -> Self {
        DocumentStore {
            api,
            prefs,
            session: Mutex::new(None),
        }
    }

    /// Current session, signing in on first use. A stored refresh token is
    /// tried before creating a brand new anonymous account.
    async fn authenticate(&self) -> Result<Session> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.as_ref() {
            return Ok(session.clone());
        }

        let session = match self.prefs.session() {
            Some(stored) => match self.api.refresh_session(&stored.refresh_token).await {
                Ok(session) => session,
                Err(e) => {
                    warn!("[DocumentStore] Stored session rejected, signing up again: {:#}", e);
                    self.api.sign_up_anonymously().await?
                }
            },
            None => self.api.sign_up_anonymously().await?,
        };
        info!("[DocumentStore] Authenticated as {}", session.uid);

        let stored = StoredSession {
            uid: session.uid.clone(),
            refresh_token: session.refresh_token.clone(),
        };
        if let Err(e) = self.prefs.set_session(Some(stored)) {
            warn!("[DocumentStore] Failed to persist session: {:#}", e);
        }
        *slot = Some(session.clone());
        Ok(session)
    }

    async fn forget_session_if_rejected(&self, err: &anyhow::Error) {
        if err.downcast_ref::<Unauthorized>().is_some() {
            debug!("[DocumentStore] Dropping rejected session");
            *self.session.lock().await = None;
        }
    }

    async fn try_fetch(&self, group: &str) -> Result<PeerSet> {
        let session = self.authenticate().await?;
        let documents = self.api.query_group(&session, group).await?;

        let mut peers = PeerSet::new();
        for doc in documents {
            if doc.id == session.uid {
                continue;
            }
            match mapper::record_from_document(&doc.id, &doc.fields) {
                Ok(record) => {
                    peers.insert(doc.id, record);
                }
                Err(e) => warn!("[DocumentStore] Skipping unreadable document: {:#}", e),
            }
        }
        Ok(peers)
    }

    async fn try_save(&self, latitude: f64, longitude: f64) -> Result<()> {
        let session = self.authenticate().await?;
        let record = PeerRecord {
            id: session.uid.clone(),
            name: self.prefs.name(),
            latitude,
            longitude,
            timestamp: now_millis(),
            group: self.prefs.group(),
        };
        self.api
            .set_document(&session, &record.id, &mapper::document_fields(&record))
            .await
    }
}

#[async_trait]
impl<A: DocumentApi> PeerLocationStore for DocumentStore<A> {
    async fn fetch_peers(&self, group: &str) -> PeerSet {
        match self.try_fetch(group).await {
            Ok(peers) => peers,
            Err(e) => {
                error!("[DocumentStore] Failed to read peer locations: {:#}", e);
                self.forget_session_if_rejected(&e).await;
                PeerSet::new()
            }
        }
    }

    async fn save_location(&self, latitude: f64, longitude: f64) {
        match self.try_save(latitude, longitude).await {
            Ok(()) => debug!("[DocumentStore] Location saved"),
            Err(e) => {
                error!("[DocumentStore] Failed to save location: {:#}", e);
                self.forget_session_if_rejected(&e).await;
            }
        }
    }

    fn filters_by_group(&self) -> bool {
        true
    }
}
