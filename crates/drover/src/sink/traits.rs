//! The table store boundary.

use arrow::datatypes::SchemaRef;
use async_trait::async_trait;
use std::sync::Arc;

use crate::error::SinkError;

/// A reference-counted table store shared by every feed in the process.
pub type TableStoreRef = Arc<dyn TableStore>;

/// An analytical store holding named tables with a schema.
///
/// Implementations may be eventually consistent: a table created by
/// `create_table` is allowed to report `TableNotFound` from `append` for a
/// while afterwards.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Current schema of `table`, or `None` if it does not exist.
    async fn table_schema(&self, table: &str) -> Result<Option<SchemaRef>, SinkError>;

    /// Create `table`. Fails with `TableExists` if another writer got there first.
    async fn create_table(&self, table: &str, schema: SchemaRef) -> Result<(), SinkError>;

    /// Replace the schema of an existing table.
    async fn update_schema(&self, table: &str, schema: SchemaRef) -> Result<(), SinkError>;

    /// Append JSON rows, returning how many were written.
    ///
    /// Fails with `TableNotFound` while the table is missing or not yet visible.
    async fn append(&self, table: &str, rows: &[serde_json::Value]) -> Result<usize, SinkError>;
}
