//! In-memory doubles shared by the core test modules.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use sagaflow_types::definition::{StepDefinition, WorkflowDefinition};
use sagaflow_types::error::{QueueError, RepositoryError};
use sagaflow_types::job::{InsertOpts, JobId, JobRecord, JobState, StepJob};
use sagaflow_types::step::{StepError, StepErrorKind, StepInput, StepResult};
use sagaflow_types::workflow::{
    AdvanceState, ExecutionFilter, InsertOutcome, NewExecution, StepStatus, WorkflowExecution,
    WorkflowStatus, WorkflowStep, merge_context,
};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::dedup::ContentHasher;
use crate::queue::{JobError, JobQueue, JobWorker};
use crate::repository::workflow::WorkflowRepository;
use crate::signup::{NewUser, SignupBackend};
use crate::workflow::handler::StepHandler;
use crate::workflow::orchestrator::{Orchestrator, OrchestratorSettings};
use crate::workflow::registry::Registry;
use crate::workflow::runner::StepRunner;

// ---------------------------------------------------------------------------
// Hashing
// ---------------------------------------------------------------------------

/// Uses the canonical content itself as the "hash".
pub struct EchoHasher;

impl ContentHasher for EchoHasher {
    fn compute_hash(&self, content: &str) -> String {
        content.to_string()
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

pub fn sample_execution(context: Value) -> WorkflowExecution {
    let now = Utc::now();
    WorkflowExecution {
        workflow_id: Uuid::now_v7(),
        workflow_type: "wf".to_string(),
        org_id: Some("org_1".to_string()),
        user_id: None,
        status: WorkflowStatus::Running,
        current_step: None,
        context,
        args_hash: "hash".to_string(),
        pending_branches: 1,
        started_at: now,
        completed_at: None,
        error_message: None,
        retry_count: 0,
        created_at: now,
        updated_at: now,
    }
}

pub fn sample_step(execution: &WorkflowExecution, name: &str, order: u32, status: StepStatus) -> WorkflowStep {
    let now = Utc::now();
    WorkflowStep {
        step_id: Uuid::now_v7(),
        workflow_id: execution.workflow_id,
        step_name: name.to_string(),
        step_order: order,
        job_id: None,
        queue_name: Some("default".to_string()),
        status,
        input_data: None,
        output_data: None,
        started_at: Some(now),
        completed_at: None,
        error_message: None,
        retry_count: 0,
        max_retries: 3,
        created_at: now,
        updated_at: now,
    }
}

pub fn step_input(step_name: &str, context: Value) -> StepInput {
    StepInput {
        workflow_id: Uuid::now_v7(),
        workflow_type: crate::signup::WORKFLOW_TYPE.to_string(),
        step_name: step_name.to_string(),
        org_id: None,
        user_id: None,
        workflow_input: context.as_object().cloned().unwrap_or_default(),
        step_input: Value::Null,
    }
}

pub fn job_record(id: JobId, job: &StepJob, opts: &InsertOpts, attempt: u32) -> JobRecord {
    let now = Utc::now();
    JobRecord {
        id,
        kind: StepJob::KIND.to_string(),
        queue: opts.queue.clone(),
        priority: opts.priority,
        payload: serde_json::to_value(job).unwrap(),
        state: JobState::Running,
        attempt,
        max_attempts: opts.max_attempts,
        scheduled_at: now,
        attempted_at: Some(now),
        finalized_at: None,
        last_error: None,
        created_at: now,
    }
}

/// A linear workflow "wf" over `names`, each step backed by an empty handler.
pub fn linear_registry(names: &[&str]) -> Registry {
    let steps = names
        .iter()
        .enumerate()
        .map(|(i, name)| match names.get(i + 1) {
            Some(next) => StepDefinition::new(*name).then(*next),
            None => StepDefinition::new(*name),
        })
        .collect();
    let mut registry = Registry::new();
    registry.register(WorkflowDefinition::new("wf", steps)).unwrap();
    for name in names {
        registry.register_handler("wf", name, StaticStep::empty()).unwrap();
    }
    registry
}

// ---------------------------------------------------------------------------
// StaticStep
// ---------------------------------------------------------------------------

type ScriptedError = (StepErrorKind, String, bool);

fn script(err: &StepError) -> ScriptedError {
    (err.kind, err.message.clone(), err.retryable)
}

fn replay((kind, message, retryable): &ScriptedError) -> StepError {
    StepError::new(*kind, message.clone()).with_retryable(*retryable)
}

/// Handler returning a fixed result after failing with any queued errors.
///
/// Clones share counters, so a test can keep one clone after registering
/// the other.
#[derive(Clone)]
pub struct StaticStep {
    result: StepResult,
    failures: Arc<Mutex<VecDeque<ScriptedError>>>,
    compensate_error: Option<ScriptedError>,
    delay: Option<Duration>,
    calls: Arc<AtomicU32>,
    compensations: Arc<AtomicU32>,
    last_compensation: Arc<Mutex<Option<StepInput>>>,
}

impl StaticStep {
    pub fn new(output: Value) -> Self {
        Self::returning(StepResult::from_value(output))
    }

    pub fn empty() -> Self {
        Self::new(Value::Object(Map::new()))
    }

    pub fn returning(result: StepResult) -> Self {
        Self {
            result,
            failures: Arc::default(),
            compensate_error: None,
            delay: None,
            calls: Arc::default(),
            compensations: Arc::default(),
            last_compensation: Arc::default(),
        }
    }

    /// Queue one failing attempt ahead of the successful result.
    pub fn fail_with(self, err: StepError) -> Self {
        self.failures.lock().unwrap().push_back(script(&err));
        self
    }

    pub fn compensate_error(mut self, err: StepError) -> Self {
        self.compensate_error = Some(script(&err));
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn compensations(&self) -> u32 {
        self.compensations.load(Ordering::SeqCst)
    }

    pub fn last_compensation_input(&self) -> Option<StepInput> {
        self.last_compensation.lock().unwrap().clone()
    }
}

impl StepHandler for StaticStep {
    async fn execute(&self, _input: &StepInput) -> Result<StepResult, StepError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let failure = self.failures.lock().unwrap().pop_front();
        match failure {
            Some(err) => Err(replay(&err)),
            None => Ok(self.result.clone()),
        }
    }

    async fn compensate(&self, input: &StepInput) -> Result<(), StepError> {
        self.compensations.fetch_add(1, Ordering::SeqCst);
        *self.last_compensation.lock().unwrap() = Some(input.clone());
        match &self.compensate_error {
            Some(err) => Err(replay(err)),
            None => Ok(()),
        }
    }
}

// ---------------------------------------------------------------------------
// InMemoryRepository
// ---------------------------------------------------------------------------

#[derive(Default)]
struct RepoState {
    executions: HashMap<Uuid, WorkflowExecution>,
    steps: Vec<WorkflowStep>,
}

/// `WorkflowRepository` over a mutex-guarded map, same semantics as SQLite.
#[derive(Default)]
pub struct InMemoryRepository {
    state: Mutex<RepoState>,
}

impl InMemoryRepository {
    pub fn put_execution(&self, execution: WorkflowExecution) {
        self.state
            .lock()
            .unwrap()
            .executions
            .insert(execution.workflow_id, execution);
    }

    pub fn put_step(&self, step: WorkflowStep) {
        self.state.lock().unwrap().steps.push(step);
    }

    pub fn execution_count(&self) -> usize {
        self.state.lock().unwrap().executions.len()
    }

    fn active_match(
        state: &RepoState,
        workflow_type: &str,
        org_id: Option<&str>,
        user_id: Option<&str>,
        args_hash: &str,
    ) -> Option<Uuid> {
        state
            .executions
            .values()
            .filter(|e| {
                e.workflow_type == workflow_type
                    && e.org_id.as_deref() == org_id
                    && e.user_id.as_deref() == user_id
                    && e.args_hash == args_hash
                    && e.status.is_active()
            })
            .max_by_key(|e| e.created_at)
            .map(|e| e.workflow_id)
    }
}

impl WorkflowRepository for InMemoryRepository {
    async fn find_active(
        &self,
        workflow_type: &str,
        org_id: Option<&str>,
        user_id: Option<&str>,
        args_hash: &str,
    ) -> Result<Option<Uuid>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(Self::active_match(&state, workflow_type, org_id, user_id, args_hash))
    }

    async fn insert_execution(&self, execution: &NewExecution) -> Result<InsertOutcome, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        if let Some(existing) = Self::active_match(
            &state,
            &execution.workflow_type,
            execution.org_id.as_deref(),
            execution.user_id.as_deref(),
            &execution.args_hash,
        ) {
            return Ok(InsertOutcome::Existing(existing));
        }
        let now = Utc::now();
        state.executions.insert(
            execution.workflow_id,
            WorkflowExecution {
                workflow_id: execution.workflow_id,
                workflow_type: execution.workflow_type.clone(),
                org_id: execution.org_id.clone(),
                user_id: execution.user_id.clone(),
                status: execution.status,
                current_step: execution.current_step.clone(),
                context: execution.context.clone(),
                args_hash: execution.args_hash.clone(),
                pending_branches: execution.pending_branches,
                started_at: now,
                completed_at: None,
                error_message: None,
                retry_count: 0,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(InsertOutcome::Created(execution.workflow_id))
    }

    async fn get_execution(&self, workflow_id: &Uuid) -> Result<Option<WorkflowExecution>, RepositoryError> {
        Ok(self.state.lock().unwrap().executions.get(workflow_id).cloned())
    }

    async fn list_executions(&self, filter: &ExecutionFilter) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut rows: Vec<WorkflowExecution> = state
            .executions
            .values()
            .filter(|e| filter.status.is_none_or(|s| e.status == s))
            .filter(|e| {
                filter
                    .workflow_type
                    .as_deref()
                    .is_none_or(|t| e.workflow_type == t)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.workflow_id.cmp(&a.workflow_id));
        if filter.limit > 0 {
            rows.truncate(filter.limit as usize);
        }
        Ok(rows)
    }

    async fn record_step_success(
        &self,
        workflow_id: &Uuid,
        current_step: &str,
        output: &Map<String, Value>,
        successors: u32,
    ) -> Result<Option<AdvanceState>, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let Some(execution) = state.executions.get_mut(workflow_id) else {
            return Ok(None);
        };
        if execution.status != WorkflowStatus::Running {
            return Ok(None);
        }
        merge_context(&mut execution.context, output);
        execution.current_step = Some(current_step.to_string());
        execution.pending_branches = (execution.pending_branches + successors).saturating_sub(1);
        execution.updated_at = Utc::now();
        Ok(Some(AdvanceState {
            context: execution.context.clone(),
            pending_branches: execution.pending_branches,
        }))
    }

    async fn transition_status(
        &self,
        workflow_id: &Uuid,
        from: &[WorkflowStatus],
        to: WorkflowStatus,
        error: Option<&str>,
    ) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let Some(execution) = state.executions.get_mut(workflow_id) else {
            return Ok(false);
        };
        if !from.contains(&execution.status) {
            return Ok(false);
        }
        let now = Utc::now();
        execution.status = to;
        if to.is_terminal() {
            execution.completed_at = Some(now);
        }
        if let Some(error) = error {
            execution.error_message = Some(error.to_string());
        }
        execution.updated_at = now;
        Ok(true)
    }

    async fn reset_for_restart(&self, workflow_id: &Uuid, from_step: &str) -> Result<bool, RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let Some(execution) = state.executions.get_mut(workflow_id) else {
            return Ok(false);
        };
        if !matches!(execution.status, WorkflowStatus::Failed | WorkflowStatus::Cancelled) {
            return Ok(false);
        }
        execution.status = WorkflowStatus::Pending;
        execution.completed_at = None;
        execution.error_message = None;
        execution.retry_count += 1;
        execution.current_step = Some(from_step.to_string());
        execution.pending_branches = 1;
        execution.updated_at = Utc::now();
        Ok(true)
    }

    async fn list_stale_active(&self, older_than: DateTime<Utc>) -> Result<Vec<WorkflowExecution>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .executions
            .values()
            .filter(|e| e.status.is_active() && e.updated_at < older_than)
            .cloned()
            .collect())
    }

    async fn upsert_step(&self, step: &WorkflowStep) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        match state
            .steps
            .iter_mut()
            .find(|s| s.workflow_id == step.workflow_id && s.step_name == step.step_name)
        {
            Some(existing) => {
                let (step_id, created_at) = (existing.step_id, existing.created_at);
                *existing = step.clone();
                existing.step_id = step_id;
                existing.created_at = created_at;
            }
            None => state.steps.push(step.clone()),
        }
        Ok(())
    }

    async fn update_step_status(
        &self,
        workflow_id: &Uuid,
        step_name: &str,
        status: StepStatus,
        output: Option<&Value>,
        error: Option<&str>,
    ) -> Result<(), RepositoryError> {
        let mut state = self.state.lock().unwrap();
        let step = state
            .steps
            .iter_mut()
            .find(|s| &s.workflow_id == workflow_id && s.step_name == step_name)
            .ok_or(RepositoryError::NotFound)?;
        let now = Utc::now();
        step.status = status;
        if let Some(output) = output {
            step.output_data = Some(output.clone());
        }
        if let Some(error) = error {
            step.error_message = Some(error.to_string());
        }
        if status.is_terminal() {
            step.completed_at = Some(now);
        }
        step.updated_at = now;
        Ok(())
    }

    async fn get_step(&self, workflow_id: &Uuid, step_name: &str) -> Result<Option<WorkflowStep>, RepositoryError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .steps
            .iter()
            .find(|s| &s.workflow_id == workflow_id && s.step_name == step_name)
            .cloned())
    }

    async fn list_steps(&self, workflow_id: &Uuid) -> Result<Vec<WorkflowStep>, RepositoryError> {
        let state = self.state.lock().unwrap();
        let mut steps: Vec<WorkflowStep> = state
            .steps
            .iter()
            .filter(|s| &s.workflow_id == workflow_id)
            .cloned()
            .collect();
        steps.sort_by_key(|s| s.step_order);
        Ok(steps)
    }
}

// ---------------------------------------------------------------------------
// RecordingQueue
// ---------------------------------------------------------------------------

/// `JobQueue` that records inserts instead of persisting them.
#[derive(Default)]
pub struct RecordingQueue {
    jobs: Mutex<Vec<(StepJob, InsertOpts)>>,
    failing: AtomicBool,
    next_id: AtomicI64,
}

impl RecordingQueue {
    pub fn jobs(&self) -> Vec<(StepJob, InsertOpts)> {
        self.jobs.lock().unwrap().clone()
    }

    pub fn take(&self) -> Vec<(StepJob, InsertOpts)> {
        std::mem::take(&mut *self.jobs.lock().unwrap())
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }
}

impl JobQueue for RecordingQueue {
    async fn insert(&self, job: &StepJob, opts: &InsertOpts) -> Result<JobId, QueueError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(QueueError::Storage("queue unavailable".to_string()));
        }
        self.jobs.lock().unwrap().push((job.clone(), opts.clone()));
        Ok(self.next_id.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

pub type TestOrchestrator = Orchestrator<InMemoryRepository, RecordingQueue, EchoHasher>;

/// Orchestrator and runner wired to the in-memory doubles.
pub struct Harness {
    pub orchestrator: Arc<TestOrchestrator>,
    pub runner: StepRunner<InMemoryRepository, RecordingQueue, EchoHasher>,
    pub repo: Arc<InMemoryRepository>,
    pub queue: Arc<RecordingQueue>,
}

impl Harness {
    pub fn new(registry: Registry, settings: OrchestratorSettings) -> Self {
        let repo = Arc::new(InMemoryRepository::default());
        let queue = Arc::new(RecordingQueue::default());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&repo),
            Arc::clone(&queue),
            Arc::new(registry),
            Arc::new(EchoHasher),
            settings,
        ));
        let runner = StepRunner::new(Arc::clone(&orchestrator));
        Self {
            orchestrator,
            runner,
            repo,
            queue,
        }
    }

    /// Run every recorded job to completion, re-running `Retry` results
    /// immediately while attempts remain. Returns one outcome per attempt.
    pub async fn drain(&self) -> Vec<Result<(), String>> {
        let mut pending: VecDeque<(StepJob, InsertOpts, u32)> = VecDeque::new();
        let mut outcomes = Vec::new();
        let mut next_id: JobId = 1;
        loop {
            pending.extend(self.queue.take().into_iter().map(|(job, opts)| (job, opts, 1)));
            let Some((job, opts, attempt)) = pending.pop_front() else {
                break;
            };
            let record = job_record(next_id, &job, &opts, attempt);
            next_id += 1;
            match self.runner.work(&record).await {
                Ok(()) => outcomes.push(Ok(())),
                Err(JobError::Retry(e)) if attempt < opts.max_attempts => {
                    pending.push_back((job, opts, attempt + 1));
                    outcomes.push(Err(e));
                }
                Err(JobError::Retry(e)) | Err(JobError::Discard(e)) => {
                    self.runner.on_discard(&record, &e).await;
                    outcomes.push(Err(e));
                }
            }
            assert!(outcomes.len() < 1000, "runaway job loop");
        }
        outcomes
    }
}

// ---------------------------------------------------------------------------
// MockSignupBackend
// ---------------------------------------------------------------------------

#[derive(Default)]
struct BackendState {
    users: HashMap<String, NewUser>,
    orgs: HashSet<String>,
    customers: HashSet<String>,
    existing_emails: HashSet<String>,
    failures: HashMap<String, VecDeque<ScriptedError>>,
    emails_sent: u32,
}

/// Signup backend with per-operation failure injection.
#[derive(Default)]
pub struct MockSignupBackend {
    state: Mutex<BackendState>,
    ids: AtomicU64,
}

impl MockSignupBackend {
    pub fn add_existing_email(&self, email: &str) {
        self.state.lock().unwrap().existing_emails.insert(email.to_string());
    }

    pub fn fail_next(&self, op: &str, err: StepError) {
        self.state
            .lock()
            .unwrap()
            .failures
            .entry(op.to_string())
            .or_default()
            .push_back(script(&err));
    }

    pub fn user_count(&self) -> usize {
        self.state.lock().unwrap().users.len()
    }

    pub fn customer_count(&self) -> usize {
        self.state.lock().unwrap().customers.len()
    }

    pub fn emails_sent(&self) -> u32 {
        self.state.lock().unwrap().emails_sent
    }

    fn check(&self, op: &str) -> Result<(), StepError> {
        let mut state = self.state.lock().unwrap();
        match state.failures.get_mut(op).and_then(VecDeque::pop_front) {
            Some(err) => Err(replay(&err)),
            None => Ok(()),
        }
    }

    fn next_id(&self, prefix: &str) -> String {
        format!("{prefix}_{}", self.ids.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

impl SignupBackend for MockSignupBackend {
    async fn email_exists(&self, email: &str) -> Result<bool, StepError> {
        self.check("email_exists")?;
        Ok(self.state.lock().unwrap().existing_emails.contains(email))
    }

    async fn user_exists(&self, user_id: &str) -> Result<bool, StepError> {
        self.check("user_exists")?;
        Ok(self.state.lock().unwrap().users.contains_key(user_id))
    }

    async fn create_user(&self, user: &NewUser) -> Result<String, StepError> {
        self.check("create_user")?;
        let id = self.next_id("user");
        self.state.lock().unwrap().users.insert(id.clone(), user.clone());
        Ok(id)
    }

    async fn delete_user(&self, user_id: &str) -> Result<(), StepError> {
        self.check("delete_user")?;
        self.state.lock().unwrap().users.remove(user_id);
        Ok(())
    }

    async fn create_organization(&self, _name: &str, _owner_user_id: &str) -> Result<String, StepError> {
        self.check("create_organization")?;
        let id = self.next_id("org");
        self.state.lock().unwrap().orgs.insert(id.clone());
        Ok(id)
    }

    async fn delete_organization(&self, org_id: &str) -> Result<(), StepError> {
        self.check("delete_organization")?;
        self.state.lock().unwrap().orgs.remove(org_id);
        Ok(())
    }

    async fn create_billing_customer(&self, _org_id: &str, _email: &str) -> Result<String, StepError> {
        self.check("create_billing_customer")?;
        let id = self.next_id("cus");
        self.state.lock().unwrap().customers.insert(id.clone());
        Ok(id)
    }

    async fn create_subscription(&self, customer_id: &str) -> Result<String, StepError> {
        self.check("create_subscription")?;
        Ok(format!("sub_{customer_id}"))
    }

    async fn delete_billing_customer(&self, customer_id: &str) -> Result<(), StepError> {
        self.check("delete_billing_customer")?;
        self.state.lock().unwrap().customers.remove(customer_id);
        Ok(())
    }

    async fn send_verification_email(
        &self,
        _user_id: &str,
        _email: &str,
        _first_name: Option<&str>,
    ) -> Result<(), StepError> {
        self.check("send_verification_email")?;
        self.state.lock().unwrap().emails_sent += 1;
        Ok(())
    }
}
