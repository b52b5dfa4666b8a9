//! Lifecycle Service (component C6, spec.md §4.2).
//!
//! The single orchestration entry point: admission, the status DFA,
//! approval mediation, cancellation, retry policy, start timeout, and
//! graceful shutdown with crash-recovery scanning.

use std::collections::HashMap;
use std::sync::Arc;

use amelia_contracts::{
    event::EventType,
    workflow::{Workflow, WorkflowStatus},
    OrchestratorError,
};
use amelia_storage::Store;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

use crate::collaborators::{Driver, Tracker};
use crate::config::Config;
use crate::event_bus::EventBus;
use crate::node::{NodeContext, NodeId, TerminalOutcome};
use crate::runtime::{StateMachineRuntime, StepOutcome};
use crate::snapshot::{ApprovalDecision, StateSnapshot};

/// Payload delivered to a suspended runner when an approval decision
/// arrives. Delivered exactly once: the oneshot sender is consumed by
/// the first `approve`/`reject` call and any later call sees no pending
/// approval and fails with `InvalidState`.
struct PendingApproval {
    correlation_id: Uuid,
    resume_tx: oneshot::Sender<(ApprovalDecision, Option<String>)>,
}

struct RunnerHandle {
    cancellation: CancellationToken,
    pending_approval: Mutex<Option<PendingApproval>>,
}

/// Accepts workflow requests, drives each one's background runner task,
/// and is the only component permitted to call `Store::update_status`.
pub struct LifecycleService {
    store: Arc<dyn Store>,
    runtime: Arc<StateMachineRuntime>,
    event_bus: EventBus,
    config: Config,
    driver: Arc<dyn Driver>,
    tracker: Arc<dyn Tracker>,
    admission: Arc<tokio::sync::Semaphore>,
    runners: Mutex<HashMap<Uuid, Arc<RunnerHandle>>>,
    shutting_down: std::sync::atomic::AtomicBool,
}

impl LifecycleService {
    pub fn new(
        store: Arc<dyn Store>,
        event_bus: EventBus,
        config: Config,
        driver: Arc<dyn Driver>,
        tracker: Arc<dyn Tracker>,
    ) -> Arc<Self> {
        let admission = Arc::new(tokio::sync::Semaphore::new(config.max_concurrent));
        let runtime = Arc::new(StateMachineRuntime::new(store.clone(), event_bus.clone()));
        Arc::new(Self {
            store,
            runtime,
            event_bus,
            config,
            driver,
            tracker,
            admission,
            runners: Mutex::new(HashMap::new()),
            shutting_down: std::sync::atomic::AtomicBool::new(false),
        })
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// `POST /workflows` (spec.md §6.1, §4.2 admission).
    #[instrument(skip(self))]
    pub async fn start(
        self: &Arc<Self>,
        issue_id: String,
        worktree_path: String,
        profile_id: String,
    ) -> Result<Workflow, OrchestratorError> {
        if self.shutting_down.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(OrchestratorError::Validation(
                "service is shutting down; not admitting new workflows".into(),
            ));
        }
        validate_worktree(&worktree_path)?;

        let workflow = self
            .store
            .create_workflow(issue_id, worktree_path, profile_id, self.config.max_concurrent)
            .await?;

        self.spawn_runner(workflow.id, StateSnapshot::new(workflow.issue_id.clone(), workflow.profile_id.clone()), NodeId::Plan);
        Ok(workflow)
    }

    fn spawn_runner(self: &Arc<Self>, workflow_id: Uuid, snapshot: StateSnapshot, start_node: NodeId) {
        let service = Arc::clone(self);
        let cancellation = CancellationToken::new();
        let handle = Arc::new(RunnerHandle {
            cancellation: cancellation.clone(),
            pending_approval: Mutex::new(None),
        });
        self.runners.lock().insert(workflow_id, handle);

        tokio::spawn(async move {
            service
                .run_to_completion(workflow_id, snapshot, start_node, WorkflowStatus::Pending, cancellation)
                .await;
        });
    }

    /// Drives a workflow's node graph until it suspends, terminates, or is
    /// cancelled. `start_status` is the row's status *before* this call —
    /// `Pending` for a brand-new admission (this function performs the
    /// `pending -> running` transition itself) or `Running` for a resume
    /// from `blocked` (the caller already performed `blocked -> running`,
    /// so re-applying `pending -> running` here would fail the optimistic
    /// guard and strand the workflow).
    #[instrument(skip(self, snapshot, cancellation))]
    async fn run_to_completion(
        self: Arc<Self>,
        workflow_id: Uuid,
        mut snapshot: StateSnapshot,
        mut current: NodeId,
        start_status: WorkflowStatus,
        cancellation: CancellationToken,
    ) {
        let _permit = match self.admission.clone().try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                let _ = self
                    .store
                    .finalize(workflow_id, WorkflowStatus::Failed, Some("capacity".into()))
                    .await;
                return;
            }
        };

        if start_status == WorkflowStatus::Pending {
            let start_timeout = std::time::Duration::from_secs(self.config.workflow_start_timeout_seconds);
            let started = tokio::time::timeout(start_timeout, async {
                self.store
                    .update_status(workflow_id, WorkflowStatus::Pending, WorkflowStatus::Running)
                    .await?;
                let _ = self.store.mark_started(workflow_id).await;
                self.runtime
                    .emit(workflow_id, EventType::WorkflowStarted, "workflow started")
                    .await
            })
            .await;

            match started {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(%workflow_id, error = %e, "failed to transition pending -> running");
                    return;
                }
                Err(_) => {
                    warn!(%workflow_id, timeout_secs = self.config.workflow_start_timeout_seconds, "workflow start timed out");
                    let _ = self
                        .store
                        .finalize(workflow_id, WorkflowStatus::Failed, Some("start-timeout".into()))
                        .await;
                    self.runners.lock().remove(&workflow_id);
                    return;
                }
            }
        }

        let ctx = NodeContext {
            workflow_id,
            driver: self.driver.clone(),
            tracker: self.tracker.clone(),
            max_review_iterations: self.config.max_review_iterations,
            max_task_review_iterations: self.config.max_task_review_iterations,
        };

        loop {
            let step = self
                .run_node_with_retry(workflow_id, &ctx, snapshot.clone(), current, &cancellation)
                .await;

            let step = match step {
                Ok(step) => step,
                Err(e) => {
                    self.fail_workflow(workflow_id, e.to_string()).await;
                    self.runners.lock().remove(&workflow_id);
                    return;
                }
            };

            match step {
                StepOutcome::Advanced { snapshot: next, next: node } => {
                    snapshot = next;
                    current = node;
                    continue;
                }
                StepOutcome::Suspended { snapshot: suspended } => {
                    if let Err(e) = self
                        .store
                        .update_status(workflow_id, WorkflowStatus::Running, WorkflowStatus::Blocked)
                        .await
                    {
                        error!(%workflow_id, error = %e, "failed to transition running -> blocked");
                        self.runners.lock().remove(&workflow_id);
                        return;
                    }

                    let correlation_id = match suspended.pending_approval_correlation_id {
                        Some(id) => id,
                        None => {
                            self.fail_workflow(workflow_id, "suspended without a correlation id".into()).await;
                            self.runners.lock().remove(&workflow_id);
                            return;
                        }
                    };

                    let (resume_tx, resume_rx) = oneshot::channel();
                    {
                        let runners = self.runners.lock();
                        if let Some(handle) = runners.get(&workflow_id) {
                            *handle.pending_approval.lock() = Some(PendingApproval {
                                correlation_id,
                                resume_tx,
                            });
                        }
                    }

                    tokio::select! {
                        _ = cancellation.cancelled() => {
                            let _ = self.store.finalize(workflow_id, WorkflowStatus::Cancelled, None).await;
                            let _ = self.runtime.emit(workflow_id, EventType::WorkflowCancelled, "workflow cancelled while blocked").await;
                            self.runners.lock().remove(&workflow_id);
                            return;
                        }
                        decision = resume_rx => {
                            let mut resumed = suspended;
                            match decision {
                                Ok((decision, feedback)) => {
                                    resumed.approval_decision = Some(decision);
                                    resumed.approval_feedback = feedback;
                                }
                                Err(_) => {
                                    self.fail_workflow(workflow_id, "approval channel dropped".into()).await;
                                    self.runners.lock().remove(&workflow_id);
                                    return;
                                }
                            }
                            if let Err(e) = self
                                .store
                                .update_status(workflow_id, WorkflowStatus::Blocked, WorkflowStatus::Running)
                                .await
                            {
                                error!(%workflow_id, error = %e, "failed to transition blocked -> running");
                                self.runners.lock().remove(&workflow_id);
                                return;
                            }
                            snapshot = resumed;
                            current = NodeId::ResumeApproval;
                            continue;
                        }
                    }
                }
                StepOutcome::Terminated { outcome, .. } => {
                    self.finalize_terminal(workflow_id, outcome).await;
                    self.runners.lock().remove(&workflow_id);
                    return;
                }
                StepOutcome::Cancelled { .. } => {
                    let _ = self.store.finalize(workflow_id, WorkflowStatus::Cancelled, None).await;
                    let _ = self.runtime.emit(workflow_id, EventType::WorkflowCancelled, "workflow cancelled").await;
                    self.runners.lock().remove(&workflow_id);
                    return;
                }
            }
        }
    }

    /// Runs one node, retrying transient failures with exponential
    /// backoff per spec.md §4.2. Non-transient errors fail fast.
    async fn run_node_with_retry(
        &self,
        workflow_id: Uuid,
        ctx: &NodeContext,
        snapshot: StateSnapshot,
        node: NodeId,
        cancellation: &CancellationToken,
    ) -> Result<StepOutcome, OrchestratorError> {
        let mut attempt = 0u32;
        loop {
            match self
                .runtime
                .step_once(workflow_id, ctx, snapshot.clone(), node, cancellation)
                .await
            {
                Ok(step) => return Ok(step),
                Err(e) if e.is_retryable() && self.config.retry.has_attempts_remaining(attempt + 1) => {
                    attempt += 1;
                    let delay = self.config.retry.delay_for(attempt);
                    warn!(%workflow_id, attempt, ?delay, error = %e, "retrying transient node failure");
                    tokio::time::sleep(delay).await;
                    continue;
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn finalize_terminal(&self, workflow_id: Uuid, outcome: TerminalOutcome) {
        match outcome {
            TerminalOutcome::Completed | TerminalOutcome::Rejected => {
                let data = if outcome == TerminalOutcome::Rejected {
                    Some(serde_json::json!({"outcome": "rejected"}))
                } else {
                    Some(serde_json::json!({"outcome": "completed"}))
                };
                let _ = self.store.finalize(workflow_id, WorkflowStatus::Completed, None).await;
                let event = amelia_contracts::event::NewEvent::new(
                    workflow_id,
                    amelia_contracts::event::Agent::System,
                    EventType::WorkflowCompleted,
                    "workflow completed",
                );
                let event = if let Some(data) = data { event.with_data(data) } else { event };
                if let Ok(persisted) = self.store.append_event(event).await {
                    self.event_bus.publish(persisted);
                }
            }
            TerminalOutcome::MaxIterations => {
                self.fail_workflow(workflow_id, "max-iterations".into()).await;
            }
        }
    }

    async fn fail_workflow(&self, workflow_id: Uuid, reason: String) {
        error!(%workflow_id, reason = %reason, "workflow failed");
        let _ = self
            .store
            .finalize(workflow_id, WorkflowStatus::Failed, Some(reason.clone()))
            .await;
        let event = amelia_contracts::event::NewEvent::new(
            workflow_id,
            amelia_contracts::event::Agent::System,
            EventType::WorkflowFailed,
            reason,
        );
        if let Ok(persisted) = self.store.append_event(event).await {
            self.event_bus.publish(persisted);
        }
    }

    /// `POST /workflows/{id}/approve` and `/reject` (spec.md §4.2).
    #[instrument(skip(self, feedback))]
    pub async fn decide(
        &self,
        workflow_id: Uuid,
        decision: ApprovalDecision,
        feedback: Option<String>,
    ) -> Result<(), OrchestratorError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(OrchestratorError::NotFound(workflow_id))?;
        if workflow.status != WorkflowStatus::Blocked {
            return Err(OrchestratorError::InvalidState(format!(
                "workflow {workflow_id} is {} , not blocked",
                workflow.status
            )));
        }

        let runners = self.runners.lock();
        let handle = runners
            .get(&workflow_id)
            .ok_or(OrchestratorError::NotFound(workflow_id))?
            .clone();
        drop(runners);

        let pending = handle
            .pending_approval
            .lock()
            .take()
            .ok_or_else(|| OrchestratorError::InvalidState("no pending approval".into()))?;

        let event_type = match decision {
            ApprovalDecision::Approved => EventType::ApprovalGranted,
            ApprovalDecision::Rejected => EventType::ApprovalRejected,
        };
        let event = amelia_contracts::event::NewEvent::new(
            workflow_id,
            amelia_contracts::event::Agent::System,
            event_type,
            "approval decision recorded",
        )
        .with_correlation(pending.correlation_id);
        let event = if let Some(ref reason) = feedback {
            event.with_data(serde_json::json!({"reason": reason}))
        } else {
            event
        };
        if let Ok(persisted) = self.store.append_event(event).await {
            self.event_bus.publish(persisted);
        }

        pending
            .resume_tx
            .send((decision, feedback))
            .map_err(|_| OrchestratorError::Internal("runner no longer listening".into()))
    }

    /// `POST /workflows/{id}/cancel` (spec.md §4.2).
    #[instrument(skip(self))]
    pub async fn cancel(&self, workflow_id: Uuid) -> Result<(), OrchestratorError> {
        let workflow = self
            .store
            .get_workflow(workflow_id)
            .await?
            .ok_or(OrchestratorError::NotFound(workflow_id))?;

        if workflow.status == WorkflowStatus::Pending {
            self.store
                .update_status(workflow_id, WorkflowStatus::Pending, WorkflowStatus::Cancelled)
                .await?;
            return Ok(());
        }
        if !workflow.status.is_active() {
            return Err(OrchestratorError::InvalidState(format!(
                "workflow {workflow_id} is already terminal"
            )));
        }

        let runners = self.runners.lock();
        let handle = runners.get(&workflow_id).cloned();
        drop(runners);
        if let Some(handle) = handle {
            handle.cancellation.cancel();
        } else {
            // No live runner (e.g. after a restart before resume); finalize directly.
            self.store
                .finalize(workflow_id, WorkflowStatus::Cancelled, None)
                .await?;
        }
        Ok(())
    }

    /// Crash-recovery scan (spec.md §4.2): resumes `blocked` workflows
    /// from their last checkpoint and fails mid-node `running` ones,
    /// since a `running` row with no live runner means the process died
    /// between node boundaries without reaching a commit.
    #[instrument(skip(self))]
    pub async fn recover_on_startup(self: &Arc<Self>) -> Result<(), OrchestratorError> {
        for workflow in self.store.list_resumable().await? {
            match workflow.status {
                WorkflowStatus::Blocked => {
                    info!(workflow_id = %workflow.id, "resuming blocked workflow from checkpoint");
                    let mut snapshot = match workflow.state_snapshot.clone() {
                        Some(raw) => match crate::checkpoint::Checkpointer::restore(raw) {
                            Ok(s) => s,
                            Err(_) => {
                                self.fail_workflow(workflow.id, "checkpoint-corrupt".into()).await;
                                continue;
                            }
                        },
                        None => {
                            self.fail_workflow(workflow.id, "crash-recovery".into()).await;
                            continue;
                        }
                    };
                    // Determinism on resume (spec.md §4.3): the profile is
                    // never replayed from the checkpoint, only the rest of
                    // the snapshot is.
                    snapshot.rebind_profile(workflow.profile_id.clone());
                    self.spawn_blocked_runner(workflow.id, snapshot);
                }
                WorkflowStatus::Running => {
                    warn!(workflow_id = %workflow.id, "marking mid-node workflow failed after crash");
                    self.fail_workflow(workflow.id, "crash-recovery".into()).await;
                }
                _ => {}
            }
        }
        Ok(())
    }

    fn spawn_blocked_runner(self: &Arc<Self>, workflow_id: Uuid, snapshot: StateSnapshot) {
        let cancellation = CancellationToken::new();
        let (resume_tx, resume_rx) = oneshot::channel();
        let handle = Arc::new(RunnerHandle {
            cancellation: cancellation.clone(),
            pending_approval: Mutex::new(Some(PendingApproval {
                correlation_id: snapshot.pending_approval_correlation_id.unwrap_or_else(Uuid::nil),
                resume_tx,
            })),
        });
        self.runners.lock().insert(workflow_id, handle.clone());

        let service = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = handle.cancellation.cancelled() => {
                    let _ = service.store.finalize(workflow_id, WorkflowStatus::Cancelled, None).await;
                }
                decision = resume_rx => {
                    let mut resumed = snapshot;
                    if let Ok((decision, feedback)) = decision {
                        resumed.approval_decision = Some(decision);
                        resumed.approval_feedback = feedback;
                        if service
                            .store
                            .update_status(workflow_id, WorkflowStatus::Blocked, WorkflowStatus::Running)
                            .await
                            .is_ok()
                        {
                            service
                                .run_to_completion(
                                    workflow_id,
                                    resumed,
                                    NodeId::ResumeApproval,
                                    WorkflowStatus::Running,
                                    handle.cancellation.clone(),
                                )
                                .await;
                            return;
                        }
                    }
                    service.runners.lock().remove(&workflow_id);
                }
            }
        });
    }

    /// Signals every live runner to stop at the next node boundary and
    /// stops admitting new workflows (spec.md §4.2 graceful shutdown).
    pub async fn shutdown(&self) {
        self.shutting_down.store(true, std::sync::atomic::Ordering::SeqCst);
        let handles: Vec<_> = self.runners.lock().values().cloned().collect();
        for handle in handles {
            handle.cancellation.cancel();
        }
    }
}

fn validate_worktree(worktree_path: &str) -> Result<(), OrchestratorError> {
    let path = std::path::Path::new(worktree_path);
    if !path.is_absolute() {
        return Err(OrchestratorError::Validation(format!(
            "worktree_path must be absolute: {worktree_path}"
        )));
    }
    if !path.is_dir() {
        return Err(OrchestratorError::Validation(format!(
            "worktree_path is not a directory: {worktree_path}"
        )));
    }
    if !path.join(".git").exists() {
        return Err(OrchestratorError::Validation(format!(
            "worktree_path has no .git marker: {worktree_path}"
        )));
    }
    Ok(())
}
