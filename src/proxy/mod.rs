// proxy module - authenticating reverse proxy

pub mod config;
pub mod middleware;
pub mod router;
pub mod security;
pub mod server;
pub mod upstream;

pub use config::{AccessDefinition, Claim, Connect, ProxyConfig, Route};
pub use router::DispatchTable;
pub use security::{SecretSource, TokenVerifier};
pub use server::{run, ProxyServer};
