//! StateStore — redb-backed state persistence for the fleet orchestrator.
//!
//! Provides typed operations over requests, deploys, the pending queue,
//! active tasks, task history and decommissioned hosts. All values are
//! JSON-serialized into redb's `&[u8]` value columns. The store supports
//! both on-disk and in-memory backends (the latter for testing).

use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable, Table, TableDefinition, WriteTransaction};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::request::Request;
use crate::tables::*;
use crate::types::*;

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StateError::$variant(e.to_string())
    };
}

type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Outcome of inserting into the pending queue.
///
/// A row already present for the same key is only replaced by an intent of
/// strictly higher [`PendingType::precedence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PendingInsert<T> {
    /// No row existed; the new one was written.
    Created,
    /// The new row replaced a lower-precedence one.
    Superseded { previous: T },
    /// The existing row won and was left untouched.
    Kept { existing: T },
}

impl<T> PendingInsert<T> {
    /// Whether the caller's row is now the stored one.
    pub fn was_written(&self) -> bool {
        !matches!(self, PendingInsert::Kept { .. })
    }
}

/// Everything removed by [`StateStore::delete_request`].
#[derive(Debug, Clone, PartialEq)]
pub struct RequestDeletion {
    pub request: Request,
    /// Tasks that were running and must now be killed.
    pub active_tasks: Vec<ActiveTask>,
    pub pending_requests_removed: usize,
    pub pending_tasks_removed: usize,
    pub deploys_removed: usize,
}

/// Outcome of [`StateStore::save_request`].
#[derive(Debug, Clone, PartialEq)]
pub enum RequestSave {
    Created,
    /// Equal to the stored request; nothing was written.
    Unchanged,
    Replaced { previous: Request },
    /// The stored request has another type; nothing was written.
    TypeMismatch { existing: Request },
}

/// What [`StateStore::activate_deploy`] changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeployActivation {
    /// The deploy that was active before.
    pub previous: Option<DeployId>,
    pub pending_requests_removed: usize,
    pub pending_tasks_removed: usize,
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StateResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StateResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        for def in [
            REQUESTS,
            DEPLOYS,
            DEPLOY_STATES,
            PENDING_REQUESTS,
            PENDING_TASKS,
            ACTIVE_TASKS,
            TASK_HISTORY,
            DECOMMISSIONS,
        ] {
            txn.open_table(def).map_err(map_err!(Table))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── Generic helpers ────────────────────────────────────────────

    fn put<T: Serialize>(&self, def: JsonTable, key: &str, value: &T) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            write_json(&mut table, key, value)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    fn get<T: DeserializeOwned>(&self, def: JsonTable, key: &str) -> StateResult<Option<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        read_json(&table, key)
    }

    /// List every value whose key starts with `prefix` (all values for `""`).
    fn scan<T: DeserializeOwned>(&self, def: JsonTable, prefix: &str) -> StateResult<Vec<T>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(def).map_err(map_err!(Table))?;
        scan_json(&table, prefix)
    }

    fn remove(&self, def: JsonTable, key: &str) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let existed;
        {
            let mut table = txn.open_table(def).map_err(map_err!(Table))?;
            existed = table.remove(key).map_err(map_err!(Write))?.is_some();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(existed)
    }

    // ── Requests ───────────────────────────────────────────────────

    /// Insert or update a request.
    pub fn put_request(&self, request: &Request) -> StateResult<()> {
        self.put(REQUESTS, request.id(), request)?;
        debug!(request_id = %request.id(), "request stored");
        Ok(())
    }

    /// Create or replace a request in one transaction.
    ///
    /// An equal request, or one whose type differs from the stored one, is
    /// not written.
    pub fn save_request(&self, request: &Request) -> StateResult<RequestSave> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            let existing: Option<Request> = read_json(&table, request.id())?;
            outcome = match existing {
                None => {
                    write_json(&mut table, request.id(), request)?;
                    RequestSave::Created
                }
                Some(existing) if existing == *request => RequestSave::Unchanged,
                Some(existing) if existing.request_type() != request.request_type() => {
                    RequestSave::TypeMismatch { existing }
                }
                Some(previous) => {
                    write_json(&mut table, request.id(), request)?;
                    RequestSave::Replaced { previous }
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(request_id = %request.id(), ?outcome, "request save");
        Ok(outcome)
    }

    pub fn get_request(&self, request_id: &str) -> StateResult<Option<Request>> {
        self.get(REQUESTS, request_id)
    }

    pub fn list_requests(&self) -> StateResult<Vec<Request>> {
        self.scan(REQUESTS, "")
    }

    /// Delete a request and everything derived from it, in one transaction.
    ///
    /// Task history is kept. Returns `None` if the request did not exist.
    pub fn delete_request(&self, request_id: &str) -> StateResult<Option<RequestDeletion>> {
        let prefix = request_prefix(request_id);
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let deletion;
        {
            let mut requests = txn.open_table(REQUESTS).map_err(map_err!(Table))?;
            let request: Request = match requests.remove(request_id).map_err(map_err!(Write))? {
                Some(guard) => decode(guard.value())?,
                None => return Ok(None),
            };

            let mut states = txn.open_table(DEPLOY_STATES).map_err(map_err!(Table))?;
            states.remove(request_id).map_err(map_err!(Write))?;

            let mut deploys = txn.open_table(DEPLOYS).map_err(map_err!(Table))?;
            let deploys_removed = remove_prefix(&mut deploys, &prefix)?;

            let mut pending_requests =
                txn.open_table(PENDING_REQUESTS).map_err(map_err!(Table))?;
            let pending_requests_removed = remove_prefix(&mut pending_requests, &prefix)?;

            let mut pending_tasks = txn.open_table(PENDING_TASKS).map_err(map_err!(Table))?;
            let pending_tasks_removed = remove_prefix(&mut pending_tasks, &prefix)?;

            let mut active = txn.open_table(ACTIVE_TASKS).map_err(map_err!(Table))?;
            let active_tasks: Vec<ActiveTask> = scan_json(&active, &prefix)?;
            for task in &active_tasks {
                active
                    .remove(task.task_id.as_str())
                    .map_err(map_err!(Write))?;
            }

            deletion = RequestDeletion {
                request,
                active_tasks,
                pending_requests_removed,
                pending_tasks_removed,
                deploys_removed,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(
            %request_id,
            active = deletion.active_tasks.len(),
            pending_tasks = deletion.pending_tasks_removed,
            "request deleted"
        );
        Ok(Some(deletion))
    }

    // ── Deploys ────────────────────────────────────────────────────

    pub fn put_deploy(&self, deploy: &Deploy) -> StateResult<()> {
        let key = deploy.table_key();
        self.put(DEPLOYS, &key, deploy)?;
        debug!(%key, "deploy stored");
        Ok(())
    }

    pub fn get_deploy(&self, request_id: &str, deploy_id: &str) -> StateResult<Option<Deploy>> {
        self.get(DEPLOYS, &deploy_key(request_id, deploy_id))
    }

    pub fn list_deploys_for_request(&self, request_id: &str) -> StateResult<Vec<Deploy>> {
        self.scan(DEPLOYS, &request_prefix(request_id))
    }

    pub fn put_deploy_state(&self, state: &RequestDeployState) -> StateResult<()> {
        self.put(DEPLOY_STATES, &state.request_id, state)
    }

    pub fn get_deploy_state(&self, request_id: &str) -> StateResult<Option<RequestDeployState>> {
        self.get(DEPLOY_STATES, request_id)
    }

    /// Store a deploy and mark it in progress, in one transaction.
    pub fn start_deploy(&self, deploy: &Deploy) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut deploys = txn.open_table(DEPLOYS).map_err(map_err!(Table))?;
            write_json(&mut deploys, &deploy.table_key(), deploy)?;

            let mut states = txn.open_table(DEPLOY_STATES).map_err(map_err!(Table))?;
            let current: Option<RequestDeployState> = read_json(&states, &deploy.request_id)?;
            let mut state = current.unwrap_or_else(|| RequestDeployState::new(&deploy.request_id));
            state.pending_deploy_id = Some(deploy.id.clone());
            write_json(&mut states, &deploy.request_id, &state)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(request_id = %deploy.request_id, deploy_id = %deploy.id, "deploy started");
        Ok(())
    }

    /// Make a stored deploy the active one and drop pending work queued for
    /// any other deploy, in one transaction.
    ///
    /// Returns `None` if the deploy does not exist.
    pub fn activate_deploy(
        &self,
        request_id: &str,
        deploy_id: &str,
        now: u64,
    ) -> StateResult<Option<DeployActivation>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let activation;
        {
            let deploys = txn.open_table(DEPLOYS).map_err(map_err!(Table))?;
            let deploy: Option<Deploy> = read_json(&deploys, &deploy_key(request_id, deploy_id))?;
            if deploy.is_none() {
                return Ok(None);
            }

            let mut states = txn.open_table(DEPLOY_STATES).map_err(map_err!(Table))?;
            let current: Option<RequestDeployState> = read_json(&states, request_id)?;
            let mut state = current.unwrap_or_else(|| RequestDeployState::new(request_id));
            let previous = state.active_deploy_id.replace(deploy_id.to_string());
            if state.pending_deploy_id.as_deref() == Some(deploy_id) {
                state.pending_deploy_id = None;
            }
            state.activated_at = Some(now);
            write_json(&mut states, request_id, &state)?;

            let (pending_requests_removed, pending_tasks_removed) =
                remove_pending_work(&txn, request_id, |d| d != deploy_id)?;
            activation = DeployActivation {
                previous,
                pending_requests_removed,
                pending_tasks_removed,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%request_id, %deploy_id, ?activation, "deploy activated");
        Ok(Some(activation))
    }

    /// Clear a deploy from the request's markers and drop its pending work,
    /// in one transaction.
    pub fn terminate_deploy(&self, request_id: &str, deploy_id: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut states = txn.open_table(DEPLOY_STATES).map_err(map_err!(Table))?;
            let current: Option<RequestDeployState> = read_json(&states, request_id)?;
            if let Some(mut state) = current {
                if state.pending_deploy_id.as_deref() == Some(deploy_id) {
                    state.pending_deploy_id = None;
                }
                if state.is_active(deploy_id) {
                    state.active_deploy_id = None;
                    state.activated_at = None;
                }
                write_json(&mut states, request_id, &state)?;
            }
            remove_pending_work(&txn, request_id, |d| d == deploy_id)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%request_id, %deploy_id, "deploy terminated");
        Ok(())
    }

    /// The active deploy id of a request, if any.
    pub fn active_deploy_id(&self, request_id: &str) -> StateResult<Option<DeployId>> {
        Ok(self
            .get_deploy_state(request_id)?
            .and_then(|s| s.active_deploy_id))
    }

    // ── Pending requests ───────────────────────────────────────────

    /// Insert a pending request, applying type precedence on collision.
    pub fn insert_pending_request(
        &self,
        pending: &PendingRequest,
    ) -> StateResult<PendingInsert<PendingRequest>> {
        let key = pending.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(PENDING_REQUESTS).map_err(map_err!(Table))?;
            let existing: Option<PendingRequest> = read_json(&table, &key)?;
            outcome = match existing {
                Some(existing) if !pending.pending_type.supersedes(existing.pending_type) => {
                    PendingInsert::Kept { existing }
                }
                Some(previous) => {
                    write_json(&mut table, &key, pending)?;
                    PendingInsert::Superseded { previous }
                }
                None => {
                    write_json(&mut table, &key, pending)?;
                    PendingInsert::Created
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, pending_type = %pending.pending_type, written = outcome.was_written(), "pending request insert");
        Ok(outcome)
    }

    pub fn get_pending_request(
        &self,
        request_id: &str,
        deploy_id: &str,
    ) -> StateResult<Option<PendingRequest>> {
        self.get(PENDING_REQUESTS, &deploy_key(request_id, deploy_id))
    }

    pub fn list_pending_requests(&self) -> StateResult<Vec<PendingRequest>> {
        self.scan(PENDING_REQUESTS, "")
    }

    pub fn list_pending_requests_for_request(
        &self,
        request_id: &str,
    ) -> StateResult<Vec<PendingRequest>> {
        self.scan(PENDING_REQUESTS, &request_prefix(request_id))
    }

    /// Delete the pending request only if the stored row still equals `pending`.
    ///
    /// A row replaced by a higher-precedence intent after it was read is
    /// left in place. Returns true if the row was deleted.
    pub fn delete_pending_request_if(&self, pending: &PendingRequest) -> StateResult<bool> {
        let key = pending.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let deleted;
        {
            let mut table = txn.open_table(PENDING_REQUESTS).map_err(map_err!(Table))?;
            let current: Option<PendingRequest> = read_json(&table, &key)?;
            deleted = current.as_ref() == Some(pending);
            if deleted {
                table.remove(key.as_str()).map_err(map_err!(Write))?;
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(deleted)
    }

    pub fn delete_pending_request(&self, request_id: &str, deploy_id: &str) -> StateResult<bool> {
        self.remove(PENDING_REQUESTS, &deploy_key(request_id, deploy_id))
    }

    // ── Pending tasks ──────────────────────────────────────────────

    /// Create a pending task, applying type precedence on collision.
    pub fn create_pending_task(
        &self,
        task: &PendingTask,
    ) -> StateResult<PendingInsert<PendingTask>> {
        let key = task.id.table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let outcome;
        {
            let mut table = txn.open_table(PENDING_TASKS).map_err(map_err!(Table))?;
            let existing: Option<PendingTask> = read_json(&table, &key)?;
            outcome = match existing {
                Some(existing) if !task.pending_type.supersedes(existing.pending_type) => {
                    PendingInsert::Kept { existing }
                }
                Some(previous) => {
                    write_json(&mut table, &key, task)?;
                    PendingInsert::Superseded { previous }
                }
                None => {
                    write_json(&mut table, &key, task)?;
                    PendingInsert::Created
                }
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(outcome)
    }

    pub fn get_pending_task(&self, id: &PendingTaskId) -> StateResult<Option<PendingTask>> {
        self.get(PENDING_TASKS, &id.table_key())
    }

    pub fn list_pending_tasks(&self) -> StateResult<Vec<PendingTask>> {
        self.scan(PENDING_TASKS, "")
    }

    pub fn list_pending_tasks_for_request(&self, request_id: &str) -> StateResult<Vec<PendingTask>> {
        self.scan(PENDING_TASKS, &request_prefix(request_id))
    }

    pub fn delete_pending_task(&self, id: &PendingTaskId) -> StateResult<bool> {
        self.remove(PENDING_TASKS, &id.table_key())
    }

    /// Delete the pending tasks of a request that match, in one transaction.
    /// Returns how many were deleted.
    pub fn remove_pending_tasks(
        &self,
        request_id: &str,
        matches: impl Fn(&PendingTask) -> bool,
    ) -> StateResult<usize> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let removed;
        {
            let mut table = txn.open_table(PENDING_TASKS).map_err(map_err!(Table))?;
            let tasks: Vec<PendingTask> = scan_json(&table, &request_prefix(request_id))?;
            let doomed: Vec<&PendingTask> = tasks.iter().filter(|t| matches(t)).collect();
            for task in &doomed {
                table
                    .remove(task.id.table_key().as_str())
                    .map_err(map_err!(Write))?;
            }
            removed = doomed.len();
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(removed)
    }

    // ── Active tasks ───────────────────────────────────────────────

    /// Atomically consume the pending task behind `task` and record it active.
    ///
    /// Returns the consumed pending task, or `None` if another caller already
    /// launched (or deleted) it, in which case nothing is written.
    pub fn launch_task(&self, task: &ActiveTask) -> StateResult<Option<PendingTask>> {
        let pending_key = task.pending_task_id().table_key();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let consumed: Option<PendingTask>;
        {
            let mut pending = txn.open_table(PENDING_TASKS).map_err(map_err!(Table))?;
            consumed = match pending.remove(pending_key.as_str()).map_err(map_err!(Write))? {
                Some(guard) => Some(decode(guard.value())?),
                None => None,
            };
            if consumed.is_some() {
                let mut active = txn.open_table(ACTIVE_TASKS).map_err(map_err!(Table))?;
                write_json(&mut active, &task.task_id, task)?;
            }
        }
        if consumed.is_none() {
            txn.abort().map_err(map_err!(Transaction))?;
            return Ok(None);
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(task_id = %task.task_id, host = %task.host, "task launched");
        Ok(consumed)
    }

    /// Undo a launch whose hand-off to the execution layer failed.
    pub fn revert_launch(&self, task_id: &str, pending: &PendingTask) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut active = txn.open_table(ACTIVE_TASKS).map_err(map_err!(Table))?;
            active.remove(task_id).map_err(map_err!(Write))?;
            let mut table = txn.open_table(PENDING_TASKS).map_err(map_err!(Table))?;
            write_json(&mut table, &pending.id.table_key(), pending)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%task_id, "launch reverted");
        Ok(())
    }

    pub fn get_active_task(&self, task_id: &str) -> StateResult<Option<ActiveTask>> {
        self.get(ACTIVE_TASKS, task_id)
    }

    pub fn list_active_tasks(&self) -> StateResult<Vec<ActiveTask>> {
        self.scan(ACTIVE_TASKS, "")
    }

    pub fn list_active_tasks_for_request(&self, request_id: &str) -> StateResult<Vec<ActiveTask>> {
        self.scan(ACTIVE_TASKS, &request_prefix(request_id))
    }

    /// Record a non-terminal state change. Returns the updated task, or
    /// `None` if it is no longer active.
    pub fn update_active_task_state(
        &self,
        task_id: &str,
        state: TaskState,
        now: u64,
    ) -> StateResult<Option<ActiveTask>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut table = txn.open_table(ACTIVE_TASKS).map_err(map_err!(Table))?;
            let current: Option<ActiveTask> = read_json(&table, task_id)?;
            updated = match current {
                Some(mut task) => {
                    task.state = state;
                    task.updated_at = now;
                    write_json(&mut table, task_id, &task)?;
                    Some(task)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    /// Mark an active task as sent a kill. Returns `false` if the task is
    /// gone or was already marked, so the caller sends at most one kill.
    pub fn request_kill(&self, task_id: &str, now: u64) -> StateResult<bool> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let marked;
        {
            let mut table = txn.open_table(ACTIVE_TASKS).map_err(map_err!(Table))?;
            let current: Option<ActiveTask> = read_json(&table, task_id)?;
            marked = match current {
                Some(mut task) if task.kill_requested_at.is_none() => {
                    task.kill_requested_at = Some(now);
                    write_json(&mut table, task_id, &task)?;
                    true
                }
                _ => false,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(marked)
    }

    /// Clear the kill marker after a kill could not be delivered.
    pub fn cancel_kill_request(&self, task_id: &str) -> StateResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ACTIVE_TASKS).map_err(map_err!(Table))?;
            let current: Option<ActiveTask> = read_json(&table, task_id)?;
            if let Some(mut task) = current {
                if task.kill_requested_at.take().is_some() {
                    write_json(&mut table, task_id, &task)?;
                }
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Atomically move an active task into history.
    ///
    /// Returns `None` if the task is not active (already finished, or never
    /// launched), which makes duplicate terminal updates harmless.
    pub fn finish_task(
        &self,
        task_id: &str,
        final_state: TaskState,
        exit_code: Option<i32>,
        now: u64,
    ) -> StateResult<Option<TaskHistory>> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let history;
        {
            let mut active = txn.open_table(ACTIVE_TASKS).map_err(map_err!(Table))?;
            let removed: Option<ActiveTask> =
                match active.remove(task_id).map_err(map_err!(Write))? {
                    Some(guard) => Some(decode(guard.value())?),
                    None => None,
                };
            history = match removed {
                Some(mut task) => {
                    task.state = final_state;
                    task.updated_at = now;
                    let entry = TaskHistory {
                        task,
                        final_state,
                        exit_code,
                        finished_at: now,
                    };
                    let mut table = txn.open_table(TASK_HISTORY).map_err(map_err!(Table))?;
                    write_json(&mut table, &entry.table_key(), &entry)?;
                    Some(entry)
                }
                None => None,
            };
        }
        txn.commit().map_err(map_err!(Transaction))?;
        if history.is_some() {
            debug!(%task_id, state = %final_state, ?exit_code, "task finished");
        }
        Ok(history)
    }

    /// Drop an active task without recording history.
    pub fn delete_active_task(&self, task_id: &str) -> StateResult<bool> {
        self.remove(ACTIVE_TASKS, task_id)
    }

    // ── Task history ───────────────────────────────────────────────

    /// History for one request, oldest first.
    pub fn list_task_history(&self, request_id: &str) -> StateResult<Vec<TaskHistory>> {
        self.scan(TASK_HISTORY, &request_prefix(request_id))
    }

    /// The most recently finished task of a request.
    pub fn last_task_history(&self, request_id: &str) -> StateResult<Option<TaskHistory>> {
        Ok(self.list_task_history(request_id)?.pop())
    }

    // ── Decommissions ──────────────────────────────────────────────

    pub fn put_decommission(&self, decommission: &Decommission) -> StateResult<()> {
        self.put(DECOMMISSIONS, &decommission.host, decommission)?;
        debug!(host = %decommission.host, "host decommissioned");
        Ok(())
    }

    pub fn list_decommissions(&self) -> StateResult<Vec<Decommission>> {
        self.scan(DECOMMISSIONS, "")
    }

    pub fn is_decommissioned(&self, host: &str) -> StateResult<bool> {
        Ok(self.get::<Decommission>(DECOMMISSIONS, host)?.is_some())
    }

    pub fn delete_decommission(&self, host: &str) -> StateResult<bool> {
        self.remove(DECOMMISSIONS, host)
    }
}

// ── Table-level helpers ────────────────────────────────────────────

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(map_err!(Deserialize))
}

fn read_json<T, R>(table: &R, key: &str) -> StateResult<Option<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(key).map_err(map_err!(Read))? {
        Some(guard) => Ok(Some(decode(guard.value())?)),
        None => Ok(None),
    }
}

fn scan_json<T, R>(table: &R, prefix: &str) -> StateResult<Vec<T>>
where
    T: DeserializeOwned,
    R: ReadableTable<&'static str, &'static [u8]>,
{
    let mut results = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, value) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            results.push(decode(value.value())?);
        }
    }
    Ok(results)
}

fn write_json<T: Serialize>(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    key: &str,
    value: &T,
) -> StateResult<()> {
    let bytes = serde_json::to_vec(value).map_err(map_err!(Serialize))?;
    table
        .insert(key, bytes.as_slice())
        .map_err(map_err!(Write))?;
    Ok(())
}

fn remove_prefix(
    table: &mut Table<'_, &'static str, &'static [u8]>,
    prefix: &str,
) -> StateResult<usize> {
    let mut keys = Vec::new();
    for entry in table.iter().map_err(map_err!(Read))? {
        let (key, _) = entry.map_err(map_err!(Read))?;
        if key.value().starts_with(prefix) {
            keys.push(key.value().to_string());
        }
    }
    for key in &keys {
        table.remove(key.as_str()).map_err(map_err!(Write))?;
    }
    Ok(keys.len())
}

/// Delete a request's pending requests and pending tasks whose deploy
/// matches. Returns how many of each were deleted.
fn remove_pending_work(
    txn: &WriteTransaction,
    request_id: &str,
    matches: impl Fn(&str) -> bool,
) -> StateResult<(usize, usize)> {
    let prefix = request_prefix(request_id);

    let mut requests = txn.open_table(PENDING_REQUESTS).map_err(map_err!(Table))?;
    let queued: Vec<PendingRequest> = scan_json(&requests, &prefix)?;
    let mut requests_removed = 0;
    for pending in queued.iter().filter(|p| matches(&p.deploy_id)) {
        requests
            .remove(pending.table_key().as_str())
            .map_err(map_err!(Write))?;
        requests_removed += 1;
    }

    let mut tasks = txn.open_table(PENDING_TASKS).map_err(map_err!(Table))?;
    let queued: Vec<PendingTask> = scan_json(&tasks, &prefix)?;
    let mut tasks_removed = 0;
    for task in queued.iter().filter(|t| matches(&t.id.deploy_id)) {
        tasks
            .remove(task.id.table_key().as_str())
            .map_err(map_err!(Write))?;
        tasks_removed += 1;
    }
    Ok((requests_removed, tasks_removed))
}
