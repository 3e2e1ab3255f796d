//! Tables kept as Parquet files on object storage.
//!
//! Layout under the configured prefix:
//!
//! ```text
//! <table>/_schema.json                            Arrow schema (JSON)
//! <table>/data/part-<millis>-<uuid>.parquet       one file per append
//! ```
//!
//! The schema manifest is created with `PutMode::Create` so concurrent
//! creators see `TableExists`, and replaced with `PutMode::Update` against the
//! version it was read at.

use arrow::datatypes::{Schema, SchemaRef};
use arrow::json::ReaderBuilder;
use async_trait::async_trait;
use chrono::Utc;
use object_store::path::Path;
use object_store::{PutMode, PutOptions, PutPayload, UpdateVersion};
use parquet::arrow::ArrowWriter;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use snafu::prelude::*;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use drover_core::StorageProvider;

use super::TableStore;
use crate::error::{
    EncodeSnafu, ManifestSnafu, ParquetSnafu, SchemaConflictSnafu, SinkError, TableExistsSnafu,
    TableNotFoundSnafu, TableStorageSnafu,
};

const SCHEMA_FILE: &str = "_schema.json";
const DATA_DIR: &str = "data";
const BATCH_SIZE: usize = 1024;

/// Table store on any `object_store` backend.
#[derive(Debug, Clone)]
pub struct ObjectTableStore {
    storage: StorageProvider,
}

impl ObjectTableStore {
    pub fn new(storage: StorageProvider) -> Self {
        Self { storage }
    }

    fn schema_location(&self, table: &str) -> Path {
        self.storage.path(&format!("{table}/{SCHEMA_FILE}"))
    }

    fn data_location(&self, table: &str) -> Path {
        let name = format!(
            "part-{}-{}.parquet",
            Utc::now().timestamp_millis(),
            Uuid::new_v4()
        );
        self.storage.path(&format!("{table}/{DATA_DIR}/{name}"))
    }

    async fn read_schema(
        &self,
        table: &str,
    ) -> Result<Option<(SchemaRef, UpdateVersion)>, SinkError> {
        let result = match self.storage.store().get(&self.schema_location(table)).await {
            Ok(result) => result,
            Err(object_store::Error::NotFound { .. }) => return Ok(None),
            Err(source) => return Err(source).context(TableStorageSnafu { table }),
        };

        let version = UpdateVersion {
            e_tag: result.meta.e_tag.clone(),
            version: result.meta.version.clone(),
        };
        let bytes = result.bytes().await.context(TableStorageSnafu { table })?;
        let schema: Schema = serde_json::from_slice(&bytes).context(ManifestSnafu { table })?;

        Ok(Some((Arc::new(schema), version)))
    }

    fn encode_schema(table: &str, schema: &Schema) -> Result<PutPayload, SinkError> {
        let bytes = serde_json::to_vec_pretty(schema).context(ManifestSnafu { table })?;
        Ok(PutPayload::from(bytes))
    }

    /// Decode JSON rows against `schema` and serialize them as one Parquet file.
    fn encode_rows(
        table: &str,
        schema: &SchemaRef,
        rows: &[serde_json::Value],
    ) -> Result<Vec<u8>, SinkError> {
        let properties = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();
        let mut buffer = Vec::new();
        let mut writer = ArrowWriter::try_new(&mut buffer, Arc::clone(schema), Some(properties))
            .context(ParquetSnafu { table })?;

        for chunk in rows.chunks(BATCH_SIZE) {
            let mut decoder = ReaderBuilder::new(Arc::clone(schema))
                .with_batch_size(BATCH_SIZE)
                .with_strict_mode(false)
                .build_decoder()
                .context(EncodeSnafu { table })?;
            decoder.serialize(chunk).context(EncodeSnafu { table })?;
            if let Some(batch) = decoder.flush().context(EncodeSnafu { table })? {
                writer.write(&batch).context(ParquetSnafu { table })?;
            }
        }

        writer.close().context(ParquetSnafu { table })?;
        Ok(buffer)
    }
}

#[async_trait]
impl TableStore for ObjectTableStore {
    async fn table_schema(&self, table: &str) -> Result<Option<SchemaRef>, SinkError> {
        Ok(self.read_schema(table).await?.map(|(schema, _)| schema))
    }

    async fn create_table(&self, table: &str, schema: SchemaRef) -> Result<(), SinkError> {
        let payload = Self::encode_schema(table, &schema)?;
        match self
            .storage
            .store()
            .put_opts(
                &self.schema_location(table),
                payload,
                PutOptions::from(PutMode::Create),
            )
            .await
        {
            Ok(_) => Ok(()),
            Err(object_store::Error::AlreadyExists { .. }) => TableExistsSnafu { table }.fail(),
            Err(source) => Err(source).context(TableStorageSnafu { table }),
        }
    }

    async fn update_schema(&self, table: &str, schema: SchemaRef) -> Result<(), SinkError> {
        let Some((_, version)) = self.read_schema(table).await? else {
            return TableNotFoundSnafu { table }.fail();
        };
        let location = self.schema_location(table);
        let payload = Self::encode_schema(table, &schema)?;

        let result = self
            .storage
            .store()
            .put_opts(
                &location,
                payload.clone(),
                PutOptions::from(PutMode::Update(version)),
            )
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(object_store::Error::Precondition { .. }) => SchemaConflictSnafu { table }.fail(),
            Err(object_store::Error::NotImplemented) => {
                debug!(table, "Backend lacks conditional updates, overwriting schema");
                self.storage
                    .store()
                    .put(&location, payload)
                    .await
                    .context(TableStorageSnafu { table })?;
                Ok(())
            }
            Err(source) => Err(source).context(TableStorageSnafu { table }),
        }
    }

    async fn append(&self, table: &str, rows: &[serde_json::Value]) -> Result<usize, SinkError> {
        let Some((schema, _)) = self.read_schema(table).await? else {
            return TableNotFoundSnafu { table }.fail();
        };

        let bytes = Self::encode_rows(table, &schema, rows)?;
        let location = self.data_location(table);
        let size = bytes.len();

        self.storage
            .store()
            .put(&location, PutPayload::from(bytes))
            .await
            .context(TableStorageSnafu { table })?;

        debug!(table, rows = rows.len(), bytes = size, file = %location, "Appended rows");
        Ok(rows.len())
    }
}
