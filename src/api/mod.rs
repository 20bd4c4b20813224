//! HTTP side: raw execution and the authenticated request flow

pub mod flow;
pub mod transport;

pub use flow::{RequestFlow, RequestOptions};
pub use transport::{HttpExecutor, HttpRequest, HttpResponse, ReqwestExecutor, RequestBody};
