//! # Configuration
//!
//! Process-level configuration. The desired-state certificate document lives in
//! [`crate::cert::config`]; this module only covers how the process itself runs.

pub mod controller;

pub use controller::ControllerConfig;
