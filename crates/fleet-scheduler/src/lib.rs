//! fleet-scheduler — pending queue, offer matching and request lifecycle.
//!
//! Turns desired state in `fleet-state` into launch decisions:
//!
//! - Validates requests and their schedules before they are stored
//! - Queues work when deploys activate, tasks finish or operators trigger runs
//! - Drains pending requests into pending tasks, one per missing instance
//! - Matches due pending tasks against resource offers
//! - Applies task status updates and regenerates work
//!
//! # Architecture
//!
//! ```text
//! RequestManager ──┐
//! DeployTracker ───┼──► StateStore (pending requests)
//! Scheduler::status_update ┘
//!                         │ drain_pending_queue
//!                         ▼
//!                  StateStore (pending tasks)
//!                         │ resource_offers
//!                         ▼
//!                  SchedulerDriver::launch_task
//! ```

pub mod deploys;
pub mod driver;
pub mod error;
pub mod offers;
pub mod requests;
pub mod schedule;
pub mod scheduler;

pub use deploys::DeployTracker;
pub use driver::{DriverCommand, NullDriver, RecordingDriver, SchedulerDriver};
pub use error::{SchedulerError, SchedulerResult};
pub use offers::Offer;
pub use requests::{RequestManager, SaveOutcome};
pub use scheduler::{OfferResult, Scheduler, SchedulerConfig, StatusOutcome, TaskStatusUpdate};
