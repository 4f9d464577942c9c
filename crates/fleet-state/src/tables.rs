//! redb table definitions for the fleet state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys are `:`-joined and always start with the request id, so a
//! `{request_id}:` prefix scan finds every record derived from one request.

use redb::TableDefinition;

/// Requests keyed by `{request_id}`.
pub const REQUESTS: TableDefinition<&str, &[u8]> = TableDefinition::new("requests");

/// Deploys keyed by `{request_id}:{deploy_id}`.
pub const DEPLOYS: TableDefinition<&str, &[u8]> = TableDefinition::new("deploys");

/// Active/pending deploy markers keyed by `{request_id}`.
pub const DEPLOY_STATES: TableDefinition<&str, &[u8]> = TableDefinition::new("deploy_states");

/// Pending requests keyed by `{request_id}:{deploy_id}`.
pub const PENDING_REQUESTS: TableDefinition<&str, &[u8]> =
    TableDefinition::new("pending_requests");

/// Pending tasks keyed by `{request_id}:{deploy_id}:{instance_no}`.
pub const PENDING_TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("pending_tasks");

/// Active tasks keyed by task id (`{request_id}:{deploy_id}:{instance_no}:{launched_at}`).
pub const ACTIVE_TASKS: TableDefinition<&str, &[u8]> = TableDefinition::new("active_tasks");

/// Finished tasks keyed by `{request_id}:{finished_at:020}:{task_id}`.
pub const TASK_HISTORY: TableDefinition<&str, &[u8]> = TableDefinition::new("task_history");

/// Decommissioned hosts keyed by `{host}`.
pub const DECOMMISSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("decommissions");
