//! Zato quickstart - bootstraps a complete cluster into an empty directory
//!
//! A quickstart run provisions every component a minimal cluster needs and
//! registers the result in the operational database (ODB):
//!
//! - a certificate authority that signs one identity per component
//! - a load-balancer agent, a server, the ZatoAdmin web console and a security
//!   server, each with its directories, identity files and configuration
//! - a cluster row named `ZatoQuickstartCluster-#<n>` and its first server row
//!
//! Steps form an explicit dependency graph executed in topological order; the
//! first failure stops the run and reports exactly what was left on disk.
//!
//! # Modules
//!
//! - [`config`] - Run settings, ODB and broker parameters
//! - [`topology`] - Component roles and their on-disk layout
//! - [`odb`] - Operational database gateway (sqlx and in-memory backends)
//! - [`pki`] - Certificate authority and component identities
//! - [`materialize`] - Role directories and configuration files
//! - [`distribute`] - Copying identity files into role directories
//! - [`registrar`] - Cluster and server registration
//! - [`plan`] - Bootstrap steps and their ordering
//! - [`quickstart`] - The orchestrator tying it all together
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod config;
pub mod distribute;
pub mod error;
pub mod materialize;
pub mod odb;
pub mod pki;
pub mod plan;
pub mod quickstart;
pub mod registrar;
pub mod topology;

pub use error::Error;
pub use quickstart::{Quickstart, QuickstartFailure, QuickstartReport};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;
