//! Generation job lifecycle: submit, poll, resolve.
//!
//! The job engine drives one provider task from creation to a typed
//! [`JobResult`]; the coordinator collapses duplicate submissions through
//! the request tracker, the dedupe store, and a per-key lock; the orphan
//! reconciler recovers dedupe entries that lost their task id.

mod coordinator;
mod dedupe;
mod engine;
mod error;
mod fingerprint;
mod payload;
mod reconciler;
mod result;
mod tracker;
mod urls;
mod validate;

pub use coordinator::{GenerationCoordinator, SubmitOutcome, SubmitRequest};
pub use dedupe::{
    DedupeEntry, DedupeError, DedupeKey, DedupeStatus, DedupeStore, EntryMutator,
    MemoryDedupeStore, RedisDedupeStore,
};
pub use engine::{
    EngineConfig, GenerationRequest, JobEngine, ProgressSink, ProgressUpdate,
    WaitingTimeoutHandler,
};
pub use error::{GenerationError, GenerationResult};
pub use fingerprint::prompt_fingerprint;
pub use payload::build_provider_payload;
pub use reconciler::{OrphanNotifier, OrphanReconciler};
pub use result::{parse_record_info, JobResult};
pub use tracker::{RequestTracker, TrackedRequest};
pub use urls::{is_valid_result_url, normalize_result_url, normalize_result_urls, UrlContext};
pub use validate::{validate_result_urls, HttpResultValidator, ResultValidator};
