//! Artifact delivery: download, sniff, classify, ship via the chat
//! transport, record the outcome, and trigger post-delivery billing.

mod error;
mod fetch;
mod pipeline;
mod reconciler;
mod records;
mod service;
mod sniff;
mod transport;

pub use error::{DeliveryError, DeliveryResult};
pub use fetch::{download_with_retries, DownloadTarget};
pub use pipeline::DeliveryPipeline;
pub use reconciler::PendingReconciler;
pub use records::{finalize_delivery, reserve_delivery, DELIVERY_RECORDS_FILE};
pub use service::{ChargeCommitter, DeliveryService};
pub use sniff::{
    derive_filename, detect_magic_type, extension_for_type, looks_like_html, method_for_type,
    resolve_real_mime, TransportMethod,
};
pub use transport::{ChatTransport, MediaGroupItem, MediaKindTag, MediaUpload};
