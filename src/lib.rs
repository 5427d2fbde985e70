//! Auto HTTPS Controller Library
//!
//! Certificate automation for a Kubernetes gateway: desired state in a
//! ConfigMap, an ACME engine persisting into sharded ConfigMaps, HTTP-01
//! through solver Ingresses, and TLS Secrets as output.
//! Tests are included in the module files.

pub mod acme;
pub mod cert;
pub mod certmgr;
pub mod config;
pub mod constants;
pub mod controller;
pub mod k8s;
pub mod observability;
pub mod secret;
pub mod server;
pub mod solver;
pub mod storage;
