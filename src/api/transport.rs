//! Raw HTTP execution
//!
//! [`HttpExecutor`] is the seam between token handling and the network. The
//! production implementation wraps reqwest; tests inject a scripted executor.

use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::cookie::CookieStore;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use url::Url;

/// Request body, already encoded.
#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(serde_json::Value),
    Form(String),
}

#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Option<RequestBody>,
    /// Send ambient credentials (cookies) held by the transport.
    pub with_credentials: bool,
}

impl HttpRequest {
    pub fn new(method: Method, url: impl Into<String>) -> Self {
        Self {
            method,
            url: url.into(),
            headers: HeaderMap::new(),
            body: None,
            with_credentials: false,
        }
    }

    /// Replace the Authorization header with a bearer token.
    pub fn set_bearer(&mut self, token: &str) -> Result<()> {
        let value = HeaderValue::from_str(&format!("Bearer {}", token))
            .context("Access token is not a valid header value")?;
        self.headers.insert(AUTHORIZATION, value);
        Ok(())
    }

    pub fn bearer(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
    }
}

/// Fully buffered HTTP response.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub body: String,
}

impl HttpResponse {
    pub fn new(status: StatusCode, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_str(&self.body)
            .with_context(|| format!("Failed to parse HTTP {} response body", self.status))
    }

    pub fn text(&self) -> &str {
        &self.body
    }
}

#[async_trait]
pub trait HttpExecutor: Send + Sync {
    /// Execute one request. `Err` means no HTTP response was obtained.
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// reqwest-backed executor.
///
/// Keeps a second client wired to a cookie jar for requests that ask for
/// ambient credentials; the plain client never sends cookies.
#[derive(Clone)]
pub struct ReqwestExecutor {
    http: reqwest::Client,
    with_cookies: reqwest::Client,
    jar: Arc<reqwest::cookie::Jar>,
}

impl ReqwestExecutor {
    pub fn new() -> Result<Self> {
        let jar = Arc::new(reqwest::cookie::Jar::default());
        let with_cookies = reqwest::Client::builder()
            .cookie_provider(jar.clone())
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            http: reqwest::Client::new(),
            with_cookies,
            jar,
        })
    }

    /// Seed the jar used for credentialed requests from a `Cookie` header
    /// value (`a=1; b=2`), scoped to `url`.
    pub fn add_cookies(&self, cookies: &str, url: &str) -> Result<()> {
        let url = Url::parse(url).with_context(|| format!("Invalid cookie URL: {}", url))?;
        for cookie in cookies.split(';').map(str::trim).filter(|c| c.contains('=')) {
            self.jar.add_cookie_str(cookie, &url);
        }
        Ok(())
    }

    /// Cookies the jar would send to `url`, as a `Cookie` header value.
    pub fn cookies(&self, url: &str) -> Result<Option<String>> {
        let url = Url::parse(url).with_context(|| format!("Invalid cookie URL: {}", url))?;
        Ok(self
            .jar
            .cookies(&url)
            .and_then(|value| value.to_str().ok().map(str::to_string)))
    }
}

#[async_trait]
impl HttpExecutor for ReqwestExecutor {
    async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
        let client = if request.with_credentials {
            &self.with_cookies
        } else {
            &self.http
        };

        tracing::debug!("{} {}", request.method, request.url);

        let mut builder = client
            .request(request.method.clone(), &request.url)
            .headers(request.headers);
        builder = match request.body {
            Some(RequestBody::Json(value)) => builder.json(&value),
            Some(RequestBody::Form(encoded)) => builder
                .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
                .body(encoded),
            None => builder,
        };

        let resp = builder
            .send()
            .await
            .with_context(|| format!("{} {} failed", request.method, request.url))?;

        let status = resp.status();
        let body = resp
            .text()
            .await
            .with_context(|| format!("Failed to read response body from {}", request.url))?;

        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! Scripted executor for tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;

    pub(crate) enum Reply {
        Respond(HttpResponse),
        Fail(anyhow::Error),
    }

    /// Replays queued replies in order and records every request.
    #[derive(Default)]
    pub(crate) struct MockExecutor {
        replies: Mutex<VecDeque<Reply>>,
        requests: Mutex<Vec<HttpRequest>>,
        delay: Mutex<Option<Duration>>,
    }

    impl MockExecutor {
        pub(crate) fn new() -> Arc<Self> {
            Arc::new(Self::default())
        }

        pub(crate) fn respond(&self, status: u16, body: &str) -> &Self {
            let status = StatusCode::from_u16(status).unwrap();
            self.replies
                .lock()
                .unwrap()
                .push_back(Reply::Respond(HttpResponse::new(status, body)));
            self
        }

        pub(crate) fn respond_json(&self, status: u16, body: serde_json::Value) -> &Self {
            self.respond(status, &body.to_string())
        }

        pub(crate) fn fail(&self, message: &str) -> &Self {
            self.replies
                .lock()
                .unwrap()
                .push_back(Reply::Fail(anyhow::anyhow!(message.to_string())));
            self
        }

        pub(crate) fn fail_with(&self, err: anyhow::Error) -> &Self {
            self.replies.lock().unwrap().push_back(Reply::Fail(err));
            self
        }

        /// Every call sleeps this long before answering.
        pub(crate) fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub(crate) fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        pub(crate) fn requests(&self) -> Vec<HttpRequest> {
            self.requests.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl HttpExecutor for MockExecutor {
        async fn execute(&self, request: HttpRequest) -> Result<HttpResponse> {
            self.requests.lock().unwrap().push(request);
            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            let reply = self.replies.lock().unwrap().pop_front();
            match reply {
                Some(Reply::Respond(resp)) => Ok(resp),
                Some(Reply::Fail(err)) => Err(err),
                None => anyhow::bail!("no scripted reply left"),
            }
        }
    }
}
