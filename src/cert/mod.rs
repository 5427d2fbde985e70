//! # Certificate Config
//!
//! - [`config`]: the desired-state document and its domain matching rules
//! - [`config_mgr`]: loading, persisting and publishing that document

pub mod config;
pub mod config_mgr;

pub use config::{parse_tls_secret, Config, ConfigError, CredentialEntry};
pub use config_mgr::ConfigMgr;
