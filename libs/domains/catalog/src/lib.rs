//! Read-only model catalog.
//!
//! The orchestrator consumes model specs (input schemas, output media kind,
//! provider-facing ids, SKU pricing rows) as a lookup table. Nothing here is
//! mutated at runtime.

mod aliases;
mod media;
mod registry;
mod spec;

pub use aliases::{canonicalize_kie_model, canonicalize_model_id};
pub use media::MediaKind;
pub use registry::{CatalogError, ModelCatalog};
pub use spec::{FieldSpec, FieldType, ModelSpec, SkuMode};
