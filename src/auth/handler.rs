//! Serialized access to a namespace's tokens, with refresh
//!
//! Every public operation that touches the store goes through the handler's
//! [`ActionQueue`], so two overlapping `get_token()` calls can never both
//! decide to refresh: the second one starts after the first has stored the
//! new access token and simply reads it.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderValue, ACCEPT};
use reqwest::{Method, StatusCode};
use serde::{Deserialize, Serialize};

use super::queue::ActionQueue;
use super::tokens::TokenStore;
use crate::api::transport::{HttpExecutor, HttpRequest, RequestBody};
use crate::error::{AuthError, Result, StorageError};
use crate::storage::KeyValueBackend;

/// Body encoding for the refresh call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefreshEncoding {
    /// `{"refreshToken": "..."}`
    #[default]
    Json,
    /// OAuth2 style `grant_type=refresh_token&refresh_token=...`
    Form,
}

#[derive(Debug, Clone)]
pub struct HandlerConfig {
    /// Namespace for the token store.
    pub service_name: String,
    pub refresh_url: String,
    /// Default access token TTL. `None` leaves the store's default untouched.
    pub access_token_ttl: Option<Duration>,
    /// Derive TTL from each access token's `exp` claim when present.
    pub per_token_ttl: bool,
    /// The refresh credential travels with the transport (e.g. a cookie)
    /// instead of being stored and sent by the client.
    pub credentials: bool,
    /// Merged into every refresh request body.
    pub extra_params: BTreeMap<String, String>,
    pub encoding: RefreshEncoding,
}

impl HandlerConfig {
    pub fn new(service_name: impl Into<String>, refresh_url: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            refresh_url: refresh_url.into(),
            access_token_ttl: None,
            per_token_ttl: false,
            credentials: false,
            extra_params: BTreeMap::new(),
            encoding: RefreshEncoding::Json,
        }
    }
}

/// What the refresh request authenticates with.
enum RefreshCredential {
    Token(String),
    Ambient,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken", alias = "access_token")]
    access_token: String,
    #[serde(default, rename = "refreshToken", alias = "refresh_token")]
    refresh_token: Option<String>,
    /// Seconds.
    #[serde(default, rename = "expiresIn", alias = "expires_in")]
    expires_in: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessState {
    /// `expires_at` is wall-clock ms, `None` for non-expiring tokens.
    Valid { expires_at: Option<u64> },
    Expired { expired_at: u64 },
    Missing,
}

/// Snapshot of a handler's token state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenStatus {
    pub service_name: String,
    pub access: AccessState,
    pub refresh_token: bool,
    pub credentials: bool,
}

pub struct TokenHandler {
    config: HandlerConfig,
    store: Arc<TokenStore>,
    queue: ActionQueue,
    http: Arc<dyn HttpExecutor>,
}

impl TokenHandler {
    /// Build a handler over an existing store. TTL settings from `config`
    /// are applied to the store.
    pub fn new(config: HandlerConfig, store: TokenStore, http: Arc<dyn HttpExecutor>) -> Self {
        let store = store.with_per_token_ttl(config.per_token_ttl);
        if let Some(ttl) = config.access_token_ttl {
            store.set_access_token_ttl(ttl);
        }

        Self {
            config,
            store: Arc::new(store),
            queue: ActionQueue::new(),
            http,
        }
    }

    /// Build a handler and its store from a volatile backend (access token)
    /// and a session-scoped backend (refresh token).
    pub fn with_backends(
        config: HandlerConfig,
        access: Arc<dyn KeyValueBackend>,
        refresh: Arc<dyn KeyValueBackend>,
        http: Arc<dyn HttpExecutor>,
    ) -> Self {
        let store = TokenStore::new(config.service_name.clone(), access, refresh);
        Self::new(config, store, http)
    }

    pub fn service_name(&self) -> &str {
        &self.config.service_name
    }

    pub fn config(&self) -> &HandlerConfig {
        &self.config
    }

    /// Direct, unserialized access to the underlying store.
    pub fn store(&self) -> &TokenStore {
        &self.store
    }

    /// A valid access token, refreshing first if needed.
    ///
    /// Fails with [`AuthError::TokenUnavailable`] when there is neither an
    /// access token nor anything to refresh from.
    pub fn get_token(&self) -> impl Future<Output = Result<String>> + Send + '_ {
        self.queue.serialize(move || self.current_or_refresh())
    }

    /// Unconditionally mint a new access token.
    ///
    /// Fails with [`AuthError::RefreshUnavailable`] when there is nothing to
    /// refresh from.
    pub fn refresh_token(&self) -> impl Future<Output = Result<String>> + Send + '_ {
        self.queue.serialize(move || async move {
            match self.resolve_credential().await? {
                Some(credential) => self.refresh_with(credential).await,
                None => Err(AuthError::RefreshUnavailable),
            }
        })
    }

    pub fn store_access_token<'a>(
        &'a self,
        token: &'a str,
    ) -> impl Future<Output = Result<bool>> + Send + 'a {
        self.queue.serialize(move || async move {
            Ok::<_, AuthError>(self.store.set_access_token(token).await?)
        })
    }

    /// Store a refresh token. A no-op returning `false` in credentials mode,
    /// where the server owns the refresh credential.
    pub fn store_refresh_token<'a>(
        &'a self,
        token: &'a str,
    ) -> impl Future<Output = Result<bool>> + Send + 'a {
        self.queue.serialize(move || async move {
            if self.config.credentials {
                return Ok(false);
            }
            Ok::<_, AuthError>(self.store.set_refresh_token(token).await?)
        })
    }

    pub fn clear_store(&self) -> impl Future<Output = Result<bool>> + Send + '_ {
        self.queue.serialize(move || async move {
            Ok::<_, AuthError>(self.store.clear().await?)
        })
    }

    /// Change the default access token TTL. Applied immediately, not queued.
    pub fn set_access_token_ttl(&self, ttl: Duration) {
        self.store.set_access_token_ttl(ttl);
    }

    pub fn status(&self) -> impl Future<Output = Result<TokenStatus>> + Send + '_ {
        self.queue.serialize(move || async move {
            let access = match self.store.get_access_token().await? {
                Some(_) => AccessState::Valid {
                    expires_at: self.store.access_token_expires_at().await?,
                },
                None => match self.store.access_token_expires_at().await? {
                    Some(expired_at) => AccessState::Expired { expired_at },
                    None => AccessState::Missing,
                },
            };

            Ok::<_, AuthError>(TokenStatus {
                service_name: self.config.service_name.clone(),
                access,
                refresh_token: self.store.get_refresh_token().await?.is_some(),
                credentials: self.config.credentials,
            })
        })
    }

    // -- Internals: only ever called from inside the queue --

    async fn current_or_refresh(&self) -> Result<String> {
        if let Some(token) = self.store.get_access_token().await? {
            return Ok(token);
        }

        match self.resolve_credential().await? {
            Some(credential) => {
                tracing::debug!(
                    "[{}] access token missing or expired, refreshing",
                    self.config.service_name
                );
                self.refresh_with(credential).await
            }
            None => Err(AuthError::TokenUnavailable),
        }
    }

    async fn resolve_credential(&self) -> Result<Option<RefreshCredential>> {
        if self.config.credentials {
            return Ok(Some(RefreshCredential::Ambient));
        }
        Ok(self
            .store
            .get_refresh_token()
            .await?
            .map(RefreshCredential::Token))
    }

    fn build_refresh_request(&self, credential: &RefreshCredential) -> HttpRequest {
        let mut request = HttpRequest::new(Method::POST, &self.config.refresh_url);
        request
            .headers
            .insert(ACCEPT, HeaderValue::from_static("application/json"));

        let token = match credential {
            RefreshCredential::Token(token) => Some(token.as_str()),
            RefreshCredential::Ambient => {
                request.with_credentials = true;
                None
            }
        };

        let extra = &self.config.extra_params;
        request.body = Some(match self.config.encoding {
            RefreshEncoding::Json => {
                let mut body: serde_json::Map<String, serde_json::Value> = extra
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                    .collect();
                if let Some(token) = token {
                    body.insert("refreshToken".to_string(), token.into());
                }
                RequestBody::Json(serde_json::Value::Object(body))
            }
            RefreshEncoding::Form => {
                let mut form = url::form_urlencoded::Serializer::new(String::new());
                if !extra.contains_key("grant_type") {
                    form.append_pair("grant_type", "refresh_token");
                }
                if let Some(token) = token {
                    form.append_pair("refresh_token", token);
                }
                for (k, v) in extra {
                    form.append_pair(k, v);
                }
                RequestBody::Form(form.finish())
            }
        });

        request
    }

    /// The refresh call itself. Must run inside the queue.
    async fn refresh_with(&self, credential: RefreshCredential) -> Result<String> {
        let service = &self.config.service_name;
        tracing::info!("[{}] Refreshing access token...", service);

        let request = self.build_refresh_request(&credential);
        let response = self
            .http
            .execute(request)
            .await
            .map_err(AuthError::from_transport)?;

        if response.status == StatusCode::UNAUTHORIZED {
            tracing::info!("[{}] refresh token rejected (401)", service);
            return Err(AuthError::TokenExpired { response });
        }
        if !response.status.is_success() {
            tracing::info!(
                "[{}] refresh failed (HTTP {})",
                service,
                response.status.as_u16()
            );
            return Err(AuthError::RefreshFailed { response });
        }

        let body: RefreshResponse = match response.json() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("[{}] unusable refresh response: {:#}", service, e);
                return Err(AuthError::RefreshFailed { response });
            }
        };

        let rotated = body.refresh_token.filter(|_| !self.config.credentials);
        match rotated {
            Some(refresh) => {
                let stored = match self.store.set_tokens(&body.access_token, &refresh).await {
                    Ok(true) => Ok(()),
                    Ok(false) => Err(StorageError::Rejected(format!("{} tokens", service))),
                    Err(e) => Err(e),
                };
                if let Err(e) = stored {
                    // No access token may outlive a failed rotation
                    if let Err(clear_err) = self.store.clear_access_token().await {
                        tracing::warn!(
                            "[{}] could not clear access token after failed rotation: {}",
                            service,
                            clear_err
                        );
                    }
                    return Err(e.into());
                }
                tracing::debug!("[{}] refresh token rotated", service);
            }
            // Best effort: the caller gets the token even if it could not be kept.
            None => match self.store.set_access_token(&body.access_token).await {
                Ok(true) => {}
                Ok(false) => {
                    tracing::warn!("[{}] access token not persisted after refresh", service)
                }
                Err(e) => tracing::warn!(
                    "[{}] access token not persisted after refresh: {}",
                    service,
                    e
                ),
            },
        }

        // expires_in of 0 carries no lifetime; keep the configured TTL
        if let Some(secs) = body.expires_in.filter(|secs| *secs > 0) {
            self.store.set_access_token_ttl(Duration::from_secs(secs));
        }

        tracing::info!("[{}] Token refresh complete", service);
        Ok(body.access_token)
    }
}
