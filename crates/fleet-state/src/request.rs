//! Requests — the declarative description of a workload.
//!
//! A `Request` is immutable. Its `RequestType` is resolved exactly once, when
//! the value is built (or deserialized), either from the explicit type or
//! from the legacy `schedule` / `daemon` / `load_balanced` flags. Edits go
//! through [`Request::to_builder`] and produce a new value, so a reader never
//! observes a half-updated request.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Unique identifier for a request.
pub type RequestId = String;

/// Classification of a request, governing scheduling and deploy behavior.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RequestType {
    Service,
    Worker,
    Scheduled,
    OnDemand,
    RunOnce,
}

impl RequestType {
    /// Derive a type from the legacy flag triad.
    ///
    /// Order matters: a non-empty schedule wins, then an explicit
    /// `daemon = false`; everything else (load balanced or not) is a service.
    pub fn from_legacy_flags(
        schedule: Option<&str>,
        daemon: Option<bool>,
        _load_balanced: Option<bool>,
    ) -> Self {
        if schedule.is_some_and(|s| !s.trim().is_empty()) {
            return RequestType::Scheduled;
        }
        if daemon == Some(false) {
            return RequestType::OnDemand;
        }
        RequestType::Service
    }

    /// Tasks are expected to run until killed.
    pub fn is_long_running(self) -> bool {
        matches!(self, RequestType::Service | RequestType::Worker)
    }

    /// The request should at all times have active or pending work.
    pub fn is_always_running(self) -> bool {
        matches!(
            self,
            RequestType::Service | RequestType::Worker | RequestType::Scheduled
        )
    }

    /// A new deploy launches tasks of its own to be verified.
    pub fn is_deployable(self) -> bool {
        matches!(
            self,
            RequestType::Service | RequestType::Worker | RequestType::RunOnce
        )
    }

    pub fn is_scheduled(self) -> bool {
        self == RequestType::Scheduled
    }
}

impl std::fmt::Display for RequestType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            RequestType::Service => "SERVICE",
            RequestType::Worker => "WORKER",
            RequestType::Scheduled => "SCHEDULED",
            RequestType::OnDemand => "ON_DEMAND",
            RequestType::RunOnce => "RUN_ONCE",
        };
        f.write_str(s)
    }
}

/// Syntax of the plain `schedule` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ScheduleType {
    /// Five-field unix cron.
    #[default]
    Cron,
    /// Quartz-compatible expression with a seconds field.
    Quartz,
}

/// How instances of one request may share a host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodePlacement {
    /// At most one instance per host.
    Separate,
    /// Spread instances evenly over the hosts seen in an offer round.
    Optimistic,
    /// Any host with room.
    #[default]
    Greedy,
}

/// Reasons a request is rejected before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("invalid id {0:?}: only [A-Za-z0-9_.-] are allowed")]
    InvalidId(String),

    #[error("request {0} must ask for at least one instance")]
    ZeroInstances(String),

    #[error("scheduled request {0} has no schedule")]
    MissingSchedule(String),

    #[error("request {id} has an invalid schedule {schedule:?}: {reason}")]
    InvalidSchedule {
        id: String,
        schedule: String,
        reason: String,
    },

    #[error("request {0} has a schedule but is not of type SCHEDULED")]
    UnexpectedSchedule(String),
}

/// Whether `id` can be used as a request or deploy id.
pub fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

/// Declarative desired workload.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "RequestBuilder")]
pub struct Request {
    id: RequestId,
    request_type: RequestType,
    #[serde(skip_serializing_if = "Option::is_none")]
    owners: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    num_retries_on_failure: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    quartz_schedule: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    schedule_type: Option<ScheduleType>,
    #[serde(skip_serializing_if = "Option::is_none")]
    kill_old_non_long_running_tasks_after_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scheduled_expected_runtime_millis: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    wait_at_least_millis_after_task_finishes_for_reschedule: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    daemon: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    instances: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rack_sensitive: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rack_affinity: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_placement: Option<NodePlacement>,
    #[serde(skip_serializing_if = "Option::is_none")]
    load_balanced: Option<bool>,
}

impl Request {
    /// Start building a request with the given id.
    pub fn builder(id: impl Into<String>) -> RequestBuilder {
        RequestBuilder::new(id)
    }

    /// Copy every field into a builder for a derived value.
    pub fn to_builder(&self) -> RequestBuilder {
        RequestBuilder {
            id: self.id.clone(),
            request_type: Some(self.request_type),
            owners: self.owners.clone(),
            num_retries_on_failure: self.num_retries_on_failure,
            schedule: self.schedule.clone(),
            quartz_schedule: self.quartz_schedule.clone(),
            schedule_type: self.schedule_type,
            kill_old_non_long_running_tasks_after_millis: self
                .kill_old_non_long_running_tasks_after_millis,
            scheduled_expected_runtime_millis: self.scheduled_expected_runtime_millis,
            wait_at_least_millis_after_task_finishes_for_reschedule: self
                .wait_at_least_millis_after_task_finishes_for_reschedule,
            daemon: self.daemon,
            instances: self.instances,
            rack_sensitive: self.rack_sensitive,
            rack_affinity: self.rack_affinity.clone(),
            node_placement: self.node_placement,
            load_balanced: self.load_balanced,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn request_type(&self) -> RequestType {
        self.request_type
    }

    pub fn owners(&self) -> Option<&[String]> {
        self.owners.as_deref()
    }

    pub fn num_retries_on_failure(&self) -> u32 {
        self.num_retries_on_failure.unwrap_or(0)
    }

    pub fn schedule(&self) -> Option<&str> {
        self.schedule.as_deref()
    }

    pub fn quartz_schedule(&self) -> Option<&str> {
        self.quartz_schedule.as_deref()
    }

    pub fn schedule_type(&self) -> ScheduleType {
        self.schedule_type.unwrap_or_default()
    }

    /// The expression to evaluate and its syntax.
    ///
    /// The quartz override is preferred over the plain schedule. Empty
    /// strings count as absent.
    pub fn effective_schedule(&self) -> Option<(&str, ScheduleType)> {
        if let Some(quartz) = non_empty(self.quartz_schedule.as_deref()) {
            return Some((quartz, ScheduleType::Quartz));
        }
        non_empty(self.schedule.as_deref()).map(|s| (s, self.schedule_type()))
    }

    pub fn kill_old_non_long_running_tasks_after_millis(&self) -> Option<u64> {
        self.kill_old_non_long_running_tasks_after_millis
    }

    pub fn scheduled_expected_runtime_millis(&self) -> Option<u64> {
        self.scheduled_expected_runtime_millis
    }

    pub fn wait_at_least_millis_after_task_finishes_for_reschedule(&self) -> Option<u64> {
        self.wait_at_least_millis_after_task_finishes_for_reschedule
    }

    pub fn daemon(&self) -> Option<bool> {
        self.daemon
    }

    /// Desired instance count (1 when absent).
    pub fn instances(&self) -> u32 {
        self.instances.unwrap_or(1)
    }

    pub fn is_rack_sensitive(&self) -> bool {
        self.rack_sensitive.unwrap_or(false)
    }

    pub fn rack_affinity(&self) -> &[String] {
        self.rack_affinity.as_deref().unwrap_or_default()
    }

    pub fn node_placement(&self) -> NodePlacement {
        self.node_placement.unwrap_or_default()
    }

    pub fn is_load_balanced(&self) -> bool {
        self.load_balanced.unwrap_or(false)
    }

    pub fn is_long_running(&self) -> bool {
        self.request_type.is_long_running()
    }

    pub fn is_always_running(&self) -> bool {
        self.request_type.is_always_running()
    }

    pub fn is_deployable(&self) -> bool {
        self.request_type.is_deployable()
    }

    pub fn is_scheduled(&self) -> bool {
        self.request_type.is_scheduled()
    }

    pub fn is_one_off(&self) -> bool {
        self.request_type == RequestType::OnDemand
    }

    /// Structural checks that need no schedule parser.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if !is_valid_id(&self.id) {
            return Err(ValidationError::InvalidId(self.id.clone()));
        }
        if self.instances == Some(0) {
            return Err(ValidationError::ZeroInstances(self.id.clone()));
        }
        match (self.is_scheduled(), self.effective_schedule()) {
            (true, None) => Err(ValidationError::MissingSchedule(self.id.clone())),
            (false, Some(_)) => Err(ValidationError::UnexpectedSchedule(self.id.clone())),
            _ => Ok(()),
        }
    }
}

fn non_empty(s: Option<&str>) -> Option<&str> {
    s.filter(|s| !s.trim().is_empty())
}

/// Builder capturing every optional field of a [`Request`].
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RequestBuilder {
    id: RequestId,
    request_type: Option<RequestType>,
    owners: Option<Vec<String>>,
    num_retries_on_failure: Option<u32>,
    schedule: Option<String>,
    quartz_schedule: Option<String>,
    schedule_type: Option<ScheduleType>,
    kill_old_non_long_running_tasks_after_millis: Option<u64>,
    scheduled_expected_runtime_millis: Option<u64>,
    wait_at_least_millis_after_task_finishes_for_reschedule: Option<u64>,
    daemon: Option<bool>,
    instances: Option<u32>,
    rack_sensitive: Option<bool>,
    rack_affinity: Option<Vec<String>>,
    node_placement: Option<NodePlacement>,
    load_balanced: Option<bool>,
}

impl RequestBuilder {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            ..Self::default()
        }
    }

    pub fn request_type(mut self, request_type: RequestType) -> Self {
        self.request_type = Some(request_type);
        self
    }

    /// Clear the explicit type so `build` derives it from the legacy flags.
    pub fn derive_request_type(mut self) -> Self {
        self.request_type = None;
        self
    }

    pub fn owners(mut self, owners: Vec<String>) -> Self {
        self.owners = Some(owners);
        self
    }

    pub fn num_retries_on_failure(mut self, retries: u32) -> Self {
        self.num_retries_on_failure = Some(retries);
        self
    }

    pub fn schedule(mut self, schedule: impl Into<String>) -> Self {
        self.schedule = Some(schedule.into());
        self
    }

    pub fn quartz_schedule(mut self, schedule: impl Into<String>) -> Self {
        self.quartz_schedule = Some(schedule.into());
        self
    }

    pub fn schedule_type(mut self, schedule_type: ScheduleType) -> Self {
        self.schedule_type = Some(schedule_type);
        self
    }

    pub fn kill_old_non_long_running_tasks_after_millis(mut self, millis: u64) -> Self {
        self.kill_old_non_long_running_tasks_after_millis = Some(millis);
        self
    }

    pub fn scheduled_expected_runtime_millis(mut self, millis: u64) -> Self {
        self.scheduled_expected_runtime_millis = Some(millis);
        self
    }

    pub fn wait_at_least_millis_after_task_finishes_for_reschedule(mut self, millis: u64) -> Self {
        self.wait_at_least_millis_after_task_finishes_for_reschedule = Some(millis);
        self
    }

    pub fn daemon(mut self, daemon: bool) -> Self {
        self.daemon = Some(daemon);
        self
    }

    pub fn instances(mut self, instances: u32) -> Self {
        self.instances = Some(instances);
        self
    }

    pub fn rack_sensitive(mut self, rack_sensitive: bool) -> Self {
        self.rack_sensitive = Some(rack_sensitive);
        self
    }

    pub fn rack_affinity(mut self, racks: Vec<String>) -> Self {
        self.rack_affinity = Some(racks);
        self
    }

    pub fn node_placement(mut self, placement: NodePlacement) -> Self {
        self.node_placement = Some(placement);
        self
    }

    pub fn load_balanced(mut self, load_balanced: bool) -> Self {
        self.load_balanced = Some(load_balanced);
        self
    }

    /// Freeze the builder, resolving the request type once.
    pub fn build(self) -> Request {
        let request_type = self.request_type.unwrap_or_else(|| {
            RequestType::from_legacy_flags(
                self.schedule.as_deref(),
                self.daemon,
                self.load_balanced,
            )
        });
        Request {
            id: self.id,
            request_type,
            owners: self.owners,
            num_retries_on_failure: self.num_retries_on_failure,
            schedule: self.schedule,
            quartz_schedule: self.quartz_schedule,
            schedule_type: self.schedule_type,
            kill_old_non_long_running_tasks_after_millis: self
                .kill_old_non_long_running_tasks_after_millis,
            scheduled_expected_runtime_millis: self.scheduled_expected_runtime_millis,
            wait_at_least_millis_after_task_finishes_for_reschedule: self
                .wait_at_least_millis_after_task_finishes_for_reschedule,
            daemon: self.daemon,
            instances: self.instances,
            rack_sensitive: self.rack_sensitive,
            rack_affinity: self.rack_affinity,
            node_placement: self.node_placement,
            load_balanced: self.load_balanced,
        }
    }
}

impl From<RequestBuilder> for Request {
    fn from(builder: RequestBuilder) -> Self {
        builder.build()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_wins_over_daemon_flag() {
        let request = Request::builder("job")
            .schedule("*/5 * * * *")
            .daemon(false)
            .build();
        assert_eq!(request.request_type(), RequestType::Scheduled);
    }

    #[test]
    fn daemon_false_is_on_demand() {
        let request = Request::builder("adhoc").daemon(false).build();
        assert_eq!(request.request_type(), RequestType::OnDemand);
        assert!(request.is_one_off());
    }

    #[test]
    fn default_and_load_balanced_are_services() {
        assert_eq!(
            Request::builder("web").build().request_type(),
            RequestType::Service
        );
        assert_eq!(
            Request::builder("web").load_balanced(true).daemon(true).build().request_type(),
            RequestType::Service
        );
    }

    #[test]
    fn blank_schedule_does_not_make_a_scheduled_request() {
        let request = Request::builder("web").schedule("  ").build();
        assert_eq!(request.request_type(), RequestType::Service);
    }

    #[test]
    fn explicit_type_overrides_legacy_flags() {
        let request = Request::builder("w")
            .daemon(false)
            .request_type(RequestType::Worker)
            .build();
        assert_eq!(request.request_type(), RequestType::Worker);
    }

    #[test]
    fn capability_flags() {
        use RequestType::*;
        assert!(Service.is_long_running() && Service.is_always_running() && Service.is_deployable());
        assert!(Worker.is_long_running() && Worker.is_always_running());
        assert!(!Scheduled.is_long_running() && Scheduled.is_always_running());
        assert!(Scheduled.is_scheduled() && !Scheduled.is_deployable());
        assert!(!OnDemand.is_long_running() && !OnDemand.is_always_running());
        assert!(RunOnce.is_deployable() && !RunOnce.is_always_running());
    }

    #[test]
    fn defaults() {
        let request = Request::builder("web").build();
        assert_eq!(request.instances(), 1);
        assert_eq!(request.num_retries_on_failure(), 0);
        assert_eq!(request.node_placement(), NodePlacement::Greedy);
        assert_eq!(request.schedule_type(), ScheduleType::Cron);
        assert!(request.rack_affinity().is_empty());
    }

    #[test]
    fn quartz_override_is_preferred() {
        let request = Request::builder("job")
            .schedule("0 * * * *")
            .quartz_schedule("0 30 * * * ?")
            .build();
        assert_eq!(
            request.effective_schedule(),
            Some(("0 30 * * * ?", ScheduleType::Quartz))
        );
    }

    #[test]
    fn scheduled_without_schedule_is_invalid() {
        let request = Request::builder("job")
            .request_type(RequestType::Scheduled)
            .build();
        assert_eq!(
            request.validate(),
            Err(ValidationError::MissingSchedule("job".to_string()))
        );
    }

    #[test]
    fn validation_rejects_bad_ids_and_zero_instances() {
        assert!(matches!(
            Request::builder("a:b").build().validate(),
            Err(ValidationError::InvalidId(_))
        ));
        assert!(matches!(
            Request::builder("web").instances(0).build().validate(),
            Err(ValidationError::ZeroInstances(_))
        ));
        assert!(Request::builder("web-1.prod_x").build().validate().is_ok());
    }

    #[test]
    fn builder_copy_is_structurally_equal() {
        let request = Request::builder("web")
            .instances(3)
            .rack_affinity(vec!["r1".to_string()])
            .owners(vec!["ops@example.com".to_string()])
            .build();
        let copy = request.to_builder().build();
        assert_eq!(request, copy);

        let scaled = request.to_builder().instances(4).build();
        assert_ne!(request, scaled);
        assert_eq!(request.instances(), 3);
    }

    #[test]
    fn deserializing_without_type_derives_it() {
        let request: Request =
            serde_json::from_str(r#"{"id":"nightly","schedule":"0 3 * * *"}"#).unwrap();
        assert_eq!(request.request_type(), RequestType::Scheduled);

        let json = serde_json::to_string(&request).unwrap();
        assert!(json.contains(r#""request_type":"SCHEDULED""#));
    }
}
