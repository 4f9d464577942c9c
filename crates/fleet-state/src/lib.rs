//! fleet-state — embedded state store for the fleet orchestrator.
//!
//! Backed by [redb](https://docs.rs/redb), this crate is the single source of
//! truth for requests, deploys, the pending queue, active tasks and task
//! history. Every in-memory structure elsewhere in the orchestrator is a
//! cache that can be rebuilt from it.
//!
//! # Architecture
//!
//! All domain types are JSON-serialized into redb's `&[u8]` value columns.
//! Composite keys (`{request_id}:{deploy_id}`, `{request_id}:{deploy_id}:{instance}`)
//! enable prefix scans for everything derived from one request.
//!
//! State transitions that other components race on (pending-queue inserts,
//! launches, task completion, request deletion) are single write
//! transactions that check-and-write, so concurrent offer callbacks and
//! reconciliation passes never double-launch a task.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks.

pub mod error;
pub mod request;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use request::*;
pub use store::{DeployActivation, PendingInsert, RequestDeletion, RequestSave, StateStore};
pub use types::*;
