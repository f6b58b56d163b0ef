//! service-core: shared infrastructure for the auth workspace.
pub mod config;
pub mod error;
pub mod observability;
pub mod retry;

pub use tracing;
