//! HTTP surface: rate limiting middleware and the service router.

mod middleware;
mod server;

pub use middleware::{
    by_client_ip, by_header, by_header_or_client_ip, IdentifierFn, RateLimitLayer,
    RateLimitService,
};
pub use server::{HttpServer, API_KEY_HEADER};
