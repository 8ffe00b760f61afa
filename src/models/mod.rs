//! # Data Models
//!
//! This module contains all the data models used throughout the gitmirror
//! service.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

pub mod repository;
pub mod sync_job;

pub use repository::Entity as Repository;
pub use sync_job::Entity as SyncJob;

/// Basic service information response
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ServiceInfo {
    /// The name of the service
    pub service: String,
    /// The version of the service
    pub version: String,
}

impl Default for ServiceInfo {
    fn default() -> Self {
        Self {
            service: "gitmirror".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}
