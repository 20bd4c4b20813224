//! Authenticated request pipeline
//!
//! Attaches the current access token, races each attempt against a timeout
//! and, on a 401, forces one refresh and retries exactly once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::transport::{HttpExecutor, HttpRequest, HttpResponse, RequestBody};
use crate::auth::TokenHandler;
use crate::error::{AuthError, Result};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Per-request options.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    pub method: Method,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    /// Overrides the flow's default timeout.
    pub timeout: Option<Duration>,
    pub with_credentials: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            method: Method::GET,
            headers: HeaderMap::new(),
            body: None,
            timeout: None,
            with_credentials: false,
        }
    }
}

impl RequestOptions {
    pub fn new(method: Method) -> Self {
        Self {
            method,
            ..Self::default()
        }
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = Some(RequestBody::Json(body));
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

pub struct RequestFlow {
    http: Arc<dyn HttpExecutor>,
    tokens: Option<Arc<TokenHandler>>,
    timeout: Duration,
}

impl RequestFlow {
    /// Unauthenticated flow. Add a token handler with [`RequestFlow::with_tokens`].
    pub fn new(http: Arc<dyn HttpExecutor>) -> Self {
        Self {
            http,
            tokens: None,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_tokens(mut self, tokens: Arc<TokenHandler>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn tokens(&self) -> Option<&Arc<TokenHandler>> {
        self.tokens.as_ref()
    }

    /// Execute one call. `Ok(None)` for 204 or an empty body.
    pub async fn execute(&self, url: &str, options: RequestOptions) -> Result<Option<Value>> {
        let timeout = options.timeout.unwrap_or(self.timeout);
        let mut request = HttpRequest {
            method: options.method,
            url: url.to_string(),
            headers: options.headers,
            body: options.body,
            with_credentials: options.with_credentials,
        };

        let Some(tokens) = &self.tokens else {
            let response = self.attempt(request, timeout).await?;
            return classify(response);
        };

        let token = tokens.get_token().await?;
        request
            .set_bearer(&token)
            .map_err(|_| AuthError::InvalidToken)?;

        let response = self.attempt(request.clone(), timeout).await?;
        if response.status != StatusCode::UNAUTHORIZED {
            return classify(response);
        }

        tracing::info!(
            "401 from {} {}, refreshing token and retrying once",
            request.method,
            url
        );
        let token = tokens.refresh_token().await?;
        request
            .set_bearer(&token)
            .map_err(|_| AuthError::InvalidToken)?;

        let retried = self.attempt(request, timeout).await?;
        if retried.status == StatusCode::UNAUTHORIZED {
            // Report the server's first answer, not the repeat
            return classify(response);
        }
        classify(retried)
    }

    /// Execute and deserialize the body. A missing body deserializes from `null`.
    pub async fn execute_json<T: DeserializeOwned>(
        &self,
        url: &str,
        options: RequestOptions,
    ) -> Result<T> {
        let body = self.execute(url, options).await?.unwrap_or(Value::Null);
        serde_json::from_value(body)
            .map_err(|e| AuthError::network(0, format!("Failed to parse response from {}: {}", url, e)))
    }

    pub async fn get(&self, url: &str) -> Result<Option<Value>> {
        self.execute(url, RequestOptions::new(Method::GET)).await
    }

    pub async fn post(&self, url: &str, body: &Value) -> Result<Option<Value>> {
        self.execute(url, RequestOptions::new(Method::POST).json(body.clone()))
            .await
    }

    pub async fn put(&self, url: &str, body: &Value) -> Result<Option<Value>> {
        self.execute(url, RequestOptions::new(Method::PUT).json(body.clone()))
            .await
    }

    pub async fn delete(&self, url: &str) -> Result<Option<Value>> {
        self.execute(url, RequestOptions::new(Method::DELETE)).await
    }

    /// One transport call raced against `timeout`. On timeout the call is
    /// abandoned, not cancelled upstream.
    async fn attempt(&self, request: HttpRequest, timeout: Duration) -> Result<HttpResponse> {
        tracing::debug!("{} {}", request.method, request.url);
        match tokio::time::timeout(timeout, self.http.execute(request)).await {
            Ok(result) => result.map_err(AuthError::from_transport),
            Err(_) => Err(AuthError::Timeout(timeout)),
        }
    }
}

/// Map a response to success or the matching error.
fn classify(response: HttpResponse) -> Result<Option<Value>> {
    let status = response.status;
    if status == StatusCode::NO_CONTENT {
        return Ok(None);
    }

    let body = parse_body(&response.body);
    let flagged_success = body
        .as_ref()
        .and_then(|b| b.get("success"))
        .and_then(Value::as_bool)
        == Some(true);

    if status.is_success() || flagged_success {
        return Ok(body);
    }

    let message = body
        .as_ref()
        .and_then(error_message)
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());

    match body.as_ref().and_then(error_code) {
        Some(code) => Err(AuthError::Api {
            code,
            message,
            status: status.as_u16(),
        }),
        None => Err(AuthError::network(status.as_u16(), message)),
    }
}

/// JSON body, the raw text for non-JSON bodies, `None` when empty.
fn parse_body(raw: &str) -> Option<Value> {
    if raw.trim().is_empty() {
        return None;
    }
    Some(serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string())))
}

fn scalar_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Application error code from `error.code`, `code` or `errorCode`.
fn error_code(body: &Value) -> Option<String> {
    body.get("error")
        .and_then(|e| e.get("code"))
        .or_else(|| body.get("code"))
        .or_else(|| body.get("errorCode"))
        .and_then(scalar_string)
}

fn error_message(body: &Value) -> Option<String> {
    let error = body.get("error");
    error
        .and_then(|e| e.get("message"))
        .or_else(|| body.get("message"))
        .or(error.filter(|e| e.is_string()))
        .and_then(scalar_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::transport::testing::MockExecutor;
    use crate::auth::HandlerConfig;
    use crate::storage::MemoryBackend;
    use serde::Deserialize;
    use serde_json::json;

    const API: &str = "https://api.example.com/v1/items";

    /// Flow whose API calls and refresh calls go to separate mocks.
    async fn authed_flow(
        api: &Arc<MockExecutor>,
        auth: &Arc<MockExecutor>,
        access: Option<&str>,
    ) -> RequestFlow {
        let handler = TokenHandler::with_backends(
            HandlerConfig::new("api", "https://auth.example.com/refresh"),
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::new()),
            auth.clone(),
        );
        handler.store_refresh_token("rt1").await.unwrap();
        if let Some(token) = access {
            handler.store_access_token(token).await.unwrap();
        }
        RequestFlow::new(api.clone()).with_tokens(Arc::new(handler))
    }

    #[tokio::test]
    async fn test_attaches_bearer_token() {
        let api = MockExecutor::new();
        let auth = MockExecutor::new();
        api.respond_json(200, json!({"items": [1, 2]}));
        let flow = authed_flow(&api, &auth, Some("at1")).await;

        let body = flow.get(API).await.unwrap().unwrap();
        assert_eq!(body["items"], json!([1, 2]));
        assert_eq!(api.requests()[0].bearer(), Some("at1"));
        assert_eq!(auth.calls(), 0);
    }

    #[tokio::test]
    async fn test_without_handler_sends_no_auth() {
        let api = MockExecutor::new();
        api.respond(204, "");
        let flow = RequestFlow::new(api.clone());

        assert_eq!(flow.delete(API).await.unwrap(), None);
        assert_eq!(api.requests()[0].bearer(), None);
        assert_eq!(api.requests()[0].method, Method::DELETE);
    }

    #[tokio::test]
    async fn test_401_refreshes_and_retries_once() {
        let api = MockExecutor::new();
        let auth = MockExecutor::new();
        api.respond(401, "");
        api.respond_json(200, json!({"ok": true}));
        auth.respond_json(200, json!({"accessToken": "at2"}));
        let flow = authed_flow(&api, &auth, Some("at1")).await;

        let body = flow.post(API, &json!({"name": "x"})).await.unwrap();
        assert_eq!(body, Some(json!({"ok": true})));

        let requests = api.requests();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[0].bearer(), Some("at1"));
        assert_eq!(requests[1].bearer(), Some("at2"));
        assert_eq!(requests[1].body, Some(RequestBody::Json(json!({"name": "x"}))));
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn test_repeated_401_reports_original_response() {
        let api = MockExecutor::new();
        let auth = MockExecutor::new();
        api.respond_json(
            401,
            json!({"error": {"code": "SESSION_REVOKED", "message": "session revoked"}}),
        );
        api.respond_json(401, json!({"error": {"code": "OTHER", "message": "retry"}}));
        auth.respond_json(200, json!({"accessToken": "at2"}));
        let flow = authed_flow(&api, &auth, Some("at1")).await;

        match flow.get(API).await.unwrap_err() {
            AuthError::Api {
                code,
                message,
                status,
            } => {
                assert_eq!(code, "SESSION_REVOKED");
                assert_eq!(message, "session revoked");
                assert_eq!(status, 401);
            }
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(api.calls(), 2);
        assert_eq!(auth.calls(), 1);
    }

    #[tokio::test]
    async fn test_refresh_failure_during_retry_propagates() {
        let api = MockExecutor::new();
        let auth = MockExecutor::new();
        api.respond(401, "");
        auth.respond(401, "");
        let flow = authed_flow(&api, &auth, Some("at1")).await;

        assert!(matches!(
            flow.get(API).await,
            Err(AuthError::TokenExpired { .. })
        ));
        assert_eq!(api.calls(), 1);
    }

    #[tokio::test]
    async fn test_missing_token_skips_transport() {
        let api = MockExecutor::new();
        let handler = TokenHandler::with_backends(
            HandlerConfig::new("api", "https://auth.example.com/refresh"),
            Arc::new(MemoryBackend::new()),
            Arc::new(MemoryBackend::new()),
            MockExecutor::new(),
        );
        let flow = RequestFlow::new(api.clone()).with_tokens(Arc::new(handler));

        assert!(matches!(
            flow.get(API).await,
            Err(AuthError::TokenUnavailable)
        ));
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test]
    async fn test_malformed_stored_token_is_not_a_network_error() {
        let api = MockExecutor::new();
        let auth = MockExecutor::new();
        let flow = authed_flow(&api, &auth, Some("at1\nInjected: header")).await;

        let err = flow.get(API).await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken));
        assert_eq!(err.status(), None);
        assert_eq!(api.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout() {
        let api = MockExecutor::new();
        api.set_delay(Duration::from_secs(60));
        api.respond_json(200, json!({}));
        let flow = RequestFlow::new(api.clone()).with_timeout(Duration::from_secs(5));

        match flow.get(API).await {
            Err(AuthError::Timeout(after)) => assert_eq!(after, Duration::from_secs(5)),
            other => panic!("unexpected result: {other:?}"),
        }

        let per_request = RequestOptions::new(Method::GET).timeout(Duration::from_millis(10));
        api.respond_json(200, json!({}));
        assert!(matches!(
            flow.execute(API, per_request).await,
            Err(AuthError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_transport_failure_is_status_zero() {
        let api = MockExecutor::new();
        api.fail("dns lookup failed");
        let flow = RequestFlow::new(api.clone());

        match flow.get(API).await.unwrap_err() {
            AuthError::Network { status, message } => {
                assert_eq!(status, 0);
                assert!(message.contains("dns lookup failed"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_transport_auth_error_passes_through() {
        let api = MockExecutor::new();
        api.fail_with(AuthError::Timeout(Duration::from_secs(1)).into());
        let flow = RequestFlow::new(api.clone());

        assert!(matches!(flow.get(API).await, Err(AuthError::Timeout(_))));
    }

    #[test]
    fn test_classify() {
        let resp = |status: u16, body: &str| {
            HttpResponse::new(StatusCode::from_u16(status).unwrap(), body)
        };

        assert_eq!(classify(resp(204, "ignored")).unwrap(), None);
        assert_eq!(classify(resp(200, "")).unwrap(), None);
        assert_eq!(
            classify(resp(200, "plain")).unwrap(),
            Some(Value::String("plain".into()))
        );
        // Body flag wins over status
        assert_eq!(
            classify(resp(400, r#"{"success":true,"data":1}"#)).unwrap(),
            Some(json!({"success": true, "data": 1}))
        );

        match classify(resp(422, r#"{"code":1001,"message":"bad input"}"#)).unwrap_err() {
            AuthError::Api { code, message, .. } => {
                assert_eq!(code, "1001");
                assert_eq!(message, "bad input");
            }
            other => panic!("unexpected error: {other:?}"),
        }

        match classify(resp(502, "<html>bad gateway</html>")).unwrap_err() {
            AuthError::Network { status, .. } => assert_eq!(status, 502),
            other => panic!("unexpected error: {other:?}"),
        }

        match classify(resp(500, r#"{"success":false,"error":"boom"}"#)).unwrap_err() {
            AuthError::Network { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "boom");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_execute_json() {
        #[derive(Debug, Deserialize)]
        struct Item {
            id: u32,
        }

        let api = MockExecutor::new();
        api.respond_json(200, json!({"id": 7}));
        api.respond_json(200, json!({"unexpected": true}));
        let flow = RequestFlow::new(api.clone());

        let item: Item = flow.execute_json(API, RequestOptions::default()).await.unwrap();
        assert_eq!(item.id, 7);
        assert!(flow
            .execute_json::<Item>(API, RequestOptions::default())
            .await
            .is_err());
    }
}
