//! Metrics for drover feed ingestion.
//!
//! Events implement `drover_core`'s `InternalEvent` and are recorded with
//! `drover_core::emit!`.

pub mod events;

pub use events::*;
