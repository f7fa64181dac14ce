//! Core domain types shared across the engine, store, and API.
//!
//! Everything here is plain serializable data. Runtime-only state that a
//! job accumulates while it runs (cancellation tokens, the completed-URL
//! set, the in-flight download counter) lives in [`crate::store::JobEntry`]
//! so that a job round-trips through the store unchanged.

mod asset;
mod job;
mod settings;
mod template;

pub use asset::{Asset, AssetKind};
pub use job::{Job, JobStatus, Rules, Selector, SelectorPurpose, with_page_param};
pub use settings::Settings;
pub use template::Template;

/// Opaque job identifier (UUIDv7, time-sortable).
pub type JobId = String;
