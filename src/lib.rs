//! Stratus - control-plane provisioning and teardown orchestrator
//!
//! Stratus provisions a distributed control plane (API server, controllers,
//! in-cluster agent) onto a Kubernetes runtime that it may itself create on
//! one of several infrastructure substrates, and tears the whole thing down
//! again without leaving orphaned cloud resources behind.
//!
//! # Architecture
//!
//! - The [`install`] orchestrator drives a strictly ordered workflow:
//!   identity/credential provisioning, infrastructure creation, secret
//!   generation, component installation, API readiness, self-registration.
//! - Every created resource is recorded in a [`uninstall::CompensationContext`]
//!   the moment it exists; any failure (or operator interrupt) routes through
//!   the same best-effort reverse-order compensation path.
//! - The [`config`] registry is the only state shared across process
//!   invocations; it is rewritten atomically on every mutation.
//!
//! # Modules
//!
//! - [`provider`] - Infrastructure provider abstractions (local kind, EKS, AKS)
//! - [`identity`] - Cloud role/policy/access-key lifecycle
//! - [`pki`] - CA, client certificates, encryption keys, database credentials
//! - [`inventory`] - Durable record of created cloud resources
//! - [`config`] - Local instance registry (persisted multi-instance config)
//! - [`install`] - Provisioning orchestrator
//! - [`uninstall`] - Compensator and deletion workflow
//! - [`registration`] - Self-registration client for the control plane API
//! - [`retry`] - Retry utilities for transient failures
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod error;
pub mod identity;
pub mod install;
pub mod inventory;
pub mod pki;
pub mod provider;
pub mod registration;
pub mod retry;
pub mod uninstall;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Configuration Constants
// =============================================================================

/// Namespace the control-plane components are installed into by default
pub const DEFAULT_NAMESPACE: &str = "stratus-system";

/// Default port the control-plane API server listens on
pub const DEFAULT_API_PORT: u16 = 1323;

/// Node port the API service is pinned to on local runtimes, where kind maps
/// it back to [`DEFAULT_API_PORT`] on the host
pub const LOCAL_API_NODE_PORT: u16 = 31323;

/// Maximum length of an instance name
///
/// Names flow into cloud resource names and Kubernetes labels, both of which
/// have tight length limits once prefixes are added.
pub const MAX_INSTANCE_NAME_LEN: usize = 30;

/// Number of attempts when waiting for the control-plane API to come up
pub const API_READY_ATTEMPTS: u32 = 30;

/// Delay between API readiness probes
pub const API_READY_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Number of attempts when waiting for cloud role propagation
pub const ROLE_PROPAGATION_ATTEMPTS: u32 = 12;

/// Delay between role propagation checks
pub const ROLE_PROPAGATION_DELAY: std::time::Duration = std::time::Duration::from_secs(5);

/// Grace period allowed for in-flight inventory writes before compensation
/// reads the inventory file back
pub const INVENTORY_FLUSH_GRACE: std::time::Duration = std::time::Duration::from_secs(2);

/// Field manager used for all server-side apply patches
pub const FIELD_MANAGER: &str = "stratus";
