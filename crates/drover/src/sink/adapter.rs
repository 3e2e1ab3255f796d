//! The sink adapter used by the ingestion orchestrator.

use arrow::datatypes::SchemaRef;
use snafu::prelude::*;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{RetryPolicy, TableStore};
use crate::error::{EvolutionSnafu, SinkError};
use crate::schema::{EvolutionAction, SchemaEvolutionMode, plan_evolution};

/// Owns table lifecycle and bulk insertion for every feed.
///
/// Performs no filtering or deduplication; rows are written as given.
#[derive(Clone)]
pub struct TableSink {
    store: Arc<dyn TableStore>,
    retry: RetryPolicy,
    evolution: SchemaEvolutionMode,
}

impl TableSink {
    pub fn new(store: Arc<dyn TableStore>, retry: RetryPolicy, evolution: SchemaEvolutionMode) -> Self {
        Self {
            store,
            retry,
            evolution,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// Make sure `table` exists and can hold rows shaped like `shape`.
    ///
    /// Creates the table when absent. Losing a creation race to another
    /// writer is fine; the winner's schema is then evolved like any other.
    pub async fn migrate_schema(&self, table: &str, shape: &SchemaRef) -> Result<(), SinkError> {
        let existing = match self.store.table_schema(table).await? {
            Some(schema) => schema,
            None => match self.store.create_table(table, Arc::clone(shape)).await {
                Ok(()) => {
                    info!(table, fields = shape.fields().len(), "Created table");
                    return Ok(());
                }
                Err(SinkError::TableExists { .. }) => {
                    debug!(table, "Table created concurrently");
                    match self.store.table_schema(table).await? {
                        Some(schema) => schema,
                        None => return Ok(()),
                    }
                }
                Err(e) => return Err(e),
            },
        };

        let action =
            plan_evolution(&existing, shape, self.evolution).context(EvolutionSnafu { table })?;

        match action {
            EvolutionAction::None => {
                debug!(table, "Table schema up to date");
                Ok(())
            }
            EvolutionAction::Merge { new_schema } | EvolutionAction::Overwrite { new_schema } => {
                info!(
                    table,
                    from_fields = existing.fields().len(),
                    to_fields = new_schema.fields().len(),
                    "Evolving table schema"
                );
                self.store.update_schema(table, new_schema).await
            }
        }
    }

    /// Append `rows` to `table`, retrying while the table is not yet visible.
    pub async fn insert(
        &self,
        table: &str,
        rows: &[serde_json::Value],
        shutdown: &CancellationToken,
    ) -> Result<usize, SinkError> {
        if rows.is_empty() {
            return Ok(0);
        }

        let store = &self.store;
        self.retry
            .run(table, shutdown, move || store.append(table, rows))
            .await
    }
}
