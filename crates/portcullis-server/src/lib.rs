//! Portcullis: a multi-tenant OAuth2/OpenID Connect identity provider.
//!
//! The crate is organised leaves first:
//! - `model` and `store`: tenant-scoped records and the storage traits
//! - `db`: libsql implementation of the storage traits
//! - `auth`: the authentication core (credentials, tickets, identity
//!   resolution, tokens, sessions, social login, the authorize state machine)
//! - `server`: axum routers exposing the core over HTTP

pub mod auth;
pub mod bootstrap;
pub mod config;
pub mod db;
pub mod model;
pub mod server;
pub mod store;
pub mod telemetry;

pub use config::{LogFormat, ServerConfig};
pub use server::AuthState;
