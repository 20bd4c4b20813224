//! Token custody and refresh
//!
//! [`TokenStore`] keeps one access token and one refresh token per namespace,
//! [`ActionQueue`] runs async actions strictly one at a time, and
//! [`TokenHandler`] combines the two with the refresh call.

pub mod handler;
pub mod jwt;
pub mod queue;
pub mod tokens;

pub use handler::{AccessState, HandlerConfig, RefreshEncoding, TokenHandler, TokenStatus};
pub use queue::ActionQueue;
pub use tokens::{Clock, ManualClock, StoredToken, SystemClock, TokenStore};
