//! fabric-overrides — the override merger.
//!
//! A background task that ingests fault and perturbation events and applies
//! them to the [`FabricStore`](fabric_state::FabricStore). Events arrive from
//! an append-only JSON-lines override log, from a pushed-event channel, or
//! both. File I/O happens outside the store lock; only the apply is atomic.
//!
//! # Components
//!
//! - **`log`** — incremental override-log reader (partial lines, truncation)
//! - **`merger`** — the select loop, stop handle, and TTL sweeping

pub mod error;
pub mod log;
pub mod merger;

pub use error::{MergerError, MergerResult};
pub use log::{LogBatch, OverrideLog};
pub use merger::{MergerHandle, MergerStats, OverrideMerger};
