//! Table schema handling.

pub mod evolution;

pub use evolution::{
    EvolutionAction, SchemaComparison, SchemaEvolutionMode, compare_schemas, merge_schemas,
    plan_evolution,
};
