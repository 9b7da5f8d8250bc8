//! fabric-engine — the entry point for planning against the fabric twin.
//!
//! The [`Engine`] ties the pieces together: it takes a snapshot from the
//! [`FabricStore`](fabric_state::FabricStore), runs the requested placement
//! strategy against it, and hands the chosen plan to the
//! [`ReservationEngine`], which commits it all-or-nothing against the live
//! store.
//!
//! # Components
//!
//! - **`engine`** — `Engine` facade, plan-request phases, retries, batches
//! - **`reservation`** — shared validation, commit, rollback, cancellation

pub mod engine;
pub mod error;
pub mod reservation;

pub use engine::{Engine, PlanOutcome, PlanPhase};
pub use error::{EngineError, EngineResult};
pub use reservation::{CancelToken, ReservationEngine};
