// Middleware module - request authorization and CORS

pub mod auth;
pub mod cors;

pub use auth::{Authorizer, Decision, DenyReason};
pub use cors::{apply_cors_headers, preflight_response};
