//! tokenward - client-side access/refresh token custody
//!
//! Holds short-lived access tokens and longer-lived refresh tokens per
//! service, serializes every mutation so overlapping callers never trigger
//! duplicate refreshes, and wraps outbound HTTP calls with a single
//! refresh-and-retry on 401.

pub mod api;
pub mod auth;
pub mod config;
pub mod error;
pub mod storage;

pub use api::{RequestFlow, RequestOptions};
pub use auth::{HandlerConfig, TokenHandler, TokenStore};
pub use error::{AuthError, StorageError};
