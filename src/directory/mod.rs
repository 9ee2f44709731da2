//! Booking directory: the data-access boundary the wizard talks to.
//!
//! Two backends:
//! - **REST**: a hosted database-as-a-service exposing PostgREST-style
//!   table and RPC endpoints.
//! - **libSQL**: a local database that owns its own schema (development and
//!   tests).

pub mod libsql_backend;
pub mod migrations;
pub mod rest;

pub use libsql_backend::LibSqlDirectory;
pub use rest::{RestDirectory, RestDirectoryConfig};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::booking::model::{BookingId, BookingRequest, Payer, Provider, ProviderFilter, Slot};
use crate::error::DirectoryError;

/// Backend-agnostic access to payers, bookable providers, open slots and
/// booking creation.
#[async_trait]
pub trait BookingDirectory: Send + Sync {
    /// Short backend name for logs and error messages.
    fn name(&self) -> &str;

    /// Active payers available for selection.
    async fn list_payers(&self) -> Result<Vec<Payer>, DirectoryError>;

    /// Providers bookable under the filter's payer.
    async fn list_providers(&self, filter: &ProviderFilter)
    -> Result<Vec<Provider>, DirectoryError>;

    /// Open slots for a provider starting after `from`, earliest first.
    async fn list_slots(
        &self,
        provider_id: &str,
        from: DateTime<Utc>,
    ) -> Result<Vec<Slot>, DirectoryError>;

    /// Create the appointment for a finalized draft.
    async fn create_booking(&self, request: &BookingRequest) -> Result<BookingId, DirectoryError>;
}
