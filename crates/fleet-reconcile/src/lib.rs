//! fleet-reconcile — keeps actual state consistent with desired state.
//!
//! The `Reconciler` audits the state store at startup and on an interval:
//!
//! - Removes pending work whose request or deploy no longer applies
//! - Moves tasks the execution layer no longer knows about to history as LOST
//! - Queues STARTUP work for requests that should be running but have nothing
//!   active or pending
//! - Kills tasks of superseded deploys that outlived their grace period
//! - Reports scheduled tasks running past their expected runtime
//!
//! A pass over a consistent store changes nothing.

pub mod error;
pub mod observer;
pub mod reconciler;

pub use error::{ReconcileError, ReconcileResult};
pub use observer::{AssumeAlive, TaskLiveness, TaskObserver};
pub use reconciler::{ReconcileReport, Reconciler};
