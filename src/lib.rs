//! Authenticating reverse proxy.
//!
//! Each configured proxy listens on its own port, checks bearer tokens
//! against per-route claim policies and forwards allowed requests to a
//! single upstream with the verified claims attached as headers.

pub mod modules;
pub mod proxy;
