//! Integration repository trait definition.
//!
//! The engine only reads integrations; their lifecycle (CRUD, OAuth,
//! health checks) belongs to an external collaborator.

use weft_types::error::RepositoryError;
use weft_types::execution::Integration;

/// Read-only repository trait for integration configurations.
pub trait IntegrationRepository: Send + Sync {
    /// Get an integration by its unique type tag.
    fn get_integration(
        &self,
        integration_type: &str,
    ) -> impl std::future::Future<Output = Result<Option<Integration>, RepositoryError>> + Send;

    /// List all enabled integrations.
    fn list_enabled(
        &self,
    ) -> impl std::future::Future<Output = Result<Vec<Integration>, RepositoryError>> + Send;
}
