//! Sink adapter: table lifecycle and bulk inserts.
//!
//! - `traits`: the `TableStore` boundary every backing store implements
//! - `adapter`: `TableSink`, schema migration and retried inserts
//! - `retry`: backoff policy for tables that are not yet visible
//! - `object`: tables kept as Parquet files on object storage

mod adapter;
mod object;
mod retry;
mod traits;

pub use adapter::TableSink;
pub use object::ObjectTableStore;
pub use retry::RetryPolicy;
pub use traits::{TableStore, TableStoreRef};
