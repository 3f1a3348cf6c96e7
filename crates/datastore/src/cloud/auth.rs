//! Credential resolution and OAuth access tokens for the cloud backend.
//!
//! A store location names where service-account credentials live: a file
//! path, or a `gs://bucket/object` in Cloud Storage. `<PROJECT>_CREDENTIALS`
//! in the environment overrides it. An empty location falls back to
//! `GOOGLE_APPLICATION_CREDENTIALS`, then to the GCE metadata server.

use std::fmt;

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{StoreError, StoreResult};

const SCOPE: &str = "https://www.googleapis.com/auth/cloud-platform";
const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
const METADATA_TOKEN_URL: &str =
    "http://metadata.google.internal/computeMetadata/v1/instance/service-accounts/default/token";
const STORAGE_URL: &str = "https://storage.googleapis.com/storage/v1/b";
/// Tokens are refreshed this long before they expire.
const EXPIRY_MARGIN_SECS: i64 = 60;

/// The fields of a service-account key file that token minting needs.
#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    #[serde(rename = "type")]
    pub kind: String,
    pub client_email: String,
    pub private_key: String,
    #[serde(default)]
    pub private_key_id: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    #[serde(default)]
    pub project_id: Option<String>,
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("project_id", &self.project_id)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub enum Credentials {
    /// No authentication, as the local emulator expects.
    Anonymous,
    ServiceAccount(ServiceAccountKey),
    /// Tokens issued by the GCE metadata server.
    Metadata,
}

impl Credentials {
    /// Parses a service-account key file.
    pub fn from_json(bytes: &[u8]) -> StoreResult<Self> {
        let key: ServiceAccountKey = serde_json::from_slice(bytes)
            .map_err(|e| StoreError::Credentials(format!("malformed credentials: {e}")))?;
        if key.kind != "service_account" {
            let msg = format!("unsupported credentials type: {}", key.kind);
            return Err(StoreError::Credentials(msg));
        }
        Ok(Credentials::ServiceAccount(key))
    }

    /// Resolves the credentials for `project` from `location`.
    pub async fn resolve(
        project: &str,
        location: &str,
        http: &reqwest::Client,
    ) -> StoreResult<Self> {
        let env = format!("{}_CREDENTIALS", project.to_uppercase());
        let location = match std::env::var(&env) {
            Ok(v) if !v.is_empty() => {
                debug!(%env, "credentials location taken from environment");
                v
            }
            _ => location.to_string(),
        };

        if location.is_empty() {
            return Self::default_credentials().await;
        }

        let bytes = match location.strip_prefix("gs://") {
            Some(url) => {
                let (bucket, object) = url.split_once('/').ok_or_else(|| {
                    StoreError::Credentials(format!("invalid gs bucket URL: {location}"))
                })?;
                let source = TokenSource::new(http.clone(), Self::default_credentials().await?);
                fetch_object(http, &source, bucket, object).await?
            }
            None => tokio::fs::read(&location).await.map_err(|e| StoreError::io(&location, e))?,
        };
        Self::from_json(&bytes)
    }

    async fn default_credentials() -> StoreResult<Self> {
        match std::env::var("GOOGLE_APPLICATION_CREDENTIALS") {
            Ok(path) if !path.is_empty() => {
                let bytes = tokio::fs::read(&path).await.map_err(|e| StoreError::io(&path, e))?;
                Self::from_json(&bytes)
            }
            _ => Ok(Credentials::Metadata),
        }
    }
}

/// Downloads a Cloud Storage object.
async fn fetch_object(
    http: &reqwest::Client,
    source: &TokenSource,
    bucket: &str,
    object: &str,
) -> StoreResult<Vec<u8>> {
    let mut url = reqwest::Url::parse(STORAGE_URL).map_err(StoreError::transport)?;
    url.path_segments_mut()
        .map_err(|_| StoreError::transport("storage URL cannot be a base"))?
        .push(bucket)
        .push("o")
        .push(object);
    url.query_pairs_mut().append_pair("alt", "media");

    let mut req = http.get(url);
    if let Some(token) = source.token().await? {
        req = req.bearer_auth(token);
    }
    let resp = req.send().await.map_err(StoreError::transport)?;
    if !resp.status().is_success() {
        return Err(StoreError::Credentials(format!(
            "cannot read gs://{bucket}/{object}: {}",
            resp.status()
        )));
    }
    let bytes = resp.bytes().await.map_err(StoreError::transport)?;
    Ok(bytes.to_vec())
}

#[derive(Serialize)]
struct Claims<'a> {
    iss: &'a str,
    scope: &'a str,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[derive(Clone)]
struct AccessToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl AccessToken {
    fn is_fresh(&self) -> bool {
        self.expires_at - Duration::seconds(EXPIRY_MARGIN_SECS) > Utc::now()
    }
}

/// Hands out bearer tokens, minting a new one when the cached token is
/// close to expiry.
pub struct TokenSource {
    http: reqwest::Client,
    credentials: Credentials,
    cached: RwLock<Option<AccessToken>>,
}

impl TokenSource {
    pub fn new(http: reqwest::Client, credentials: Credentials) -> Self {
        Self {
            http,
            credentials,
            cached: RwLock::new(None),
        }
    }

    /// A bearer token, or `None` for anonymous access.
    pub async fn token(&self) -> StoreResult<Option<String>> {
        if matches!(self.credentials, Credentials::Anonymous) {
            return Ok(None);
        }
        if let Some(token) = self.cached.read().await.as_ref().filter(|t| t.is_fresh()) {
            return Ok(Some(token.value.clone()));
        }

        let fresh = match &self.credentials {
            Credentials::ServiceAccount(key) => self.exchange(key).await?,
            Credentials::Metadata => self.metadata_token().await?,
            Credentials::Anonymous => return Ok(None),
        };
        let value = fresh.value.clone();
        *self.cached.write().await = Some(fresh);
        Ok(Some(value))
    }

    /// Trades a signed JWT assertion for an access token.
    async fn exchange(&self, key: &ServiceAccountKey) -> StoreResult<AccessToken> {
        let token_uri = key.token_uri.as_deref().unwrap_or(DEFAULT_TOKEN_URI);
        let now = Utc::now().timestamp();
        let claims = Claims {
            iss: &key.client_email,
            scope: SCOPE,
            aud: token_uri,
            iat: now,
            exp: now + 3600,
        };

        let mut header = Header::new(Algorithm::RS256);
        header.kid = key.private_key_id.clone();
        let signing_key = EncodingKey::from_rsa_pem(key.private_key.as_bytes())
            .map_err(|e| StoreError::Credentials(e.to_string()))?;
        let assertion = encode(&header, &claims, &signing_key)
            .map_err(|e| StoreError::Credentials(e.to_string()))?;

        let resp = self
            .http
            .post(token_uri)
            .form(&[
                ("grant_type", "urn:ietf:params:oauth:grant-type:jwt-bearer"),
                ("assertion", assertion.as_str()),
            ])
            .send()
            .await
            .map_err(StoreError::transport)?;
        read_token(resp).await
    }

    async fn metadata_token(&self) -> StoreResult<AccessToken> {
        let resp = self
            .http
            .get(METADATA_TOKEN_URL)
            .header("Metadata-Flavor", "Google")
            .send()
            .await
            .map_err(|e| StoreError::Credentials(format!("metadata server unavailable: {e}")))?;
        read_token(resp).await
    }
}

async fn read_token(resp: reqwest::Response) -> StoreResult<AccessToken> {
    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(StoreError::Credentials(format!("token request failed ({status}): {body}")));
    }
    let token: TokenResponse = resp.json().await.map_err(StoreError::decoding)?;
    debug!(expires_in = token.expires_in, "access token issued");
    Ok(AccessToken {
        value: token.access_token,
        expires_at: Utc::now() + Duration::seconds(token.expires_in),
    })
}
