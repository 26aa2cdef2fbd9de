//! Workflow runner: drives one story through the gate schedule.
//!
//! The runner wires the subsystems together per story: constitutional
//! safety up front, budget tracking per gate, emergency stop observed
//! between gates, signal publication, the retry loop on QA failure,
//! and human escalation when retries run dry. Gate work itself is
//! pluggable through a [`GateExecutor`]; the default simulation
//! executor passes every gate, which is what tests and dry runs use.
//!
//! Configuration is a closed set of named options, not a free-form
//! map; unknown knobs do not exist.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::Result;
use serde::Serialize;
use uuid::Uuid;

use wave_bus::publisher::Publisher;
use wave_bus::types::EventType;

use crate::budget::{AlertLevel, BudgetState, BudgetTracker, estimate_tokens};
use crate::gate::{Gate, GateSchedule};
use crate::human_loop::{
    EscalationContext, EscalationInputs, build_escalation_context,
};
use crate::retry::{QaRouteState, RetryRoute, RetryState, calculate_backoff, qa_retry_router};
use crate::safety::{SAFETY_ESCALATION_THRESHOLD, SafetyChecker};

/// Emergency stop flag shared across all workers.
///
/// When raised, every loop exits at its next gate boundary or timeout,
/// persists final state, and stops dispatching new work.
#[derive(Debug, Clone, Default)]
pub struct EStop(Arc<AtomicBool>);

impl EStop {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        tracing::error!("emergency stop triggered");
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn reset(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Workflow lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerStatus {
    Idle,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

/// Per-workflow state snapshot, queryable over the HTTP API.
#[derive(Debug, Clone, Serialize)]
pub struct WorkflowState {
    pub thread_id: String,
    pub story_id: String,
    pub requirements: String,
    pub status: RunnerStatus,
    pub current_gate: usize,
    pub gates_passed: usize,
    pub retry: RetryState,
    pub budget: BudgetState,
    pub constitutional_score: f64,
    pub needs_human: bool,
    pub escalation: Option<EscalationContext>,
    pub error: Option<String>,
}

/// Result of one gate execution attempt.
#[derive(Debug, Clone)]
pub struct GateExecution {
    pub passed: bool,
    pub tokens_used: i64,
    pub error: Option<String>,
}

/// Pluggable gate work. Receives the gate index, the gate itself, and
/// the current state; returns what happened.
pub type GateExecutor =
    Arc<dyn Fn(usize, Gate, &WorkflowState) -> Result<GateExecution> + Send + Sync>;

/// Callback fired when a gate is entered or completed.
pub type GateCallback = Arc<dyn Fn(usize, &WorkflowState) + Send + Sync>;
/// Callback fired when the workflow errors.
pub type ErrorCallback = Arc<dyn Fn(&str, &WorkflowState) + Send + Sync>;

/// Runner configuration. These are exactly the recognized options.
#[derive(Clone, Default)]
pub struct RunnerConfig {
    pub use_memory_checkpointer: bool,
    pub postgres_url: Option<String>,
    pub enable_constitutional: bool,
    pub enable_budget_tracking: bool,
    pub enable_estop: bool,
    pub enable_slack: bool,
    pub enable_pubsub: bool,
    pub max_retries: i32,
    pub simulate_llm: bool,
    pub on_gate_enter: Option<GateCallback>,
    pub on_gate_complete: Option<GateCallback>,
    pub on_error: Option<ErrorCallback>,
}

impl RunnerConfig {
    /// Defaults: memory checkpointer, constitutional + budget + estop
    /// on, pubsub on, slack off, three retries, simulated LLM.
    pub fn defaults() -> Self {
        Self {
            use_memory_checkpointer: true,
            postgres_url: None,
            enable_constitutional: true,
            enable_budget_tracking: true,
            enable_estop: true,
            enable_slack: false,
            enable_pubsub: true,
            max_retries: 3,
            simulate_llm: true,
            on_gate_enter: None,
            on_gate_complete: None,
            on_error: None,
        }
    }
}

/// Outcome of running a workflow.
#[derive(Debug, Clone, Serialize)]
pub struct RunnerOutcome {
    pub thread_id: String,
    pub status: RunnerStatus,
    pub gates_passed: usize,
    pub duration_seconds: f64,
    pub error: Option<String>,
}

/// Parameters for starting a workflow.
#[derive(Debug, Clone)]
pub struct StartRequest {
    pub story_id: String,
    pub requirements: String,
    pub token_limit: i64,
    pub cost_limit_usd: f64,
}

/// The workflow runner.
pub struct WorkflowRunner {
    config: RunnerConfig,
    schedule: GateSchedule,
    estop: EStop,
    publisher: Option<Publisher>,
    gate_executor: GateExecutor,
    states: Mutex<HashMap<String, WorkflowState>>,
    /// Per-thread stop requests (graceful, unlike the global estop).
    stop_requests: Mutex<HashMap<String, Arc<AtomicBool>>>,
}

/// The simulation gate executor: passes every gate, charging a small
/// token cost derived from the requirements.
fn simulation_executor() -> GateExecutor {
    Arc::new(|_, _, state| {
        Ok(GateExecution {
            passed: true,
            tokens_used: 200 + estimate_tokens(&state.requirements) / 10,
            error: None,
        })
    })
}

impl WorkflowRunner {
    pub fn new(config: RunnerConfig, schedule: GateSchedule) -> Self {
        Self {
            gate_executor: simulation_executor(),
            config,
            schedule,
            estop: EStop::new(),
            publisher: None,
            states: Mutex::new(HashMap::new()),
            stop_requests: Mutex::new(HashMap::new()),
        }
    }

    /// Attach a signal publisher (used when pubsub is enabled).
    pub fn with_publisher(mut self, publisher: Publisher) -> Self {
        self.publisher = Some(publisher);
        self
    }

    /// Replace the gate executor (production wiring dispatches to the
    /// supervisor here; tests inject fixtures).
    pub fn with_gate_executor(mut self, executor: GateExecutor) -> Self {
        self.gate_executor = executor;
        self
    }

    pub fn estop(&self) -> &EStop {
        &self.estop
    }

    /// Snapshot a workflow's state.
    pub fn state(&self, thread_id: &str) -> Option<WorkflowState> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.get(thread_id).cloned()
    }

    /// Thread ids of all known workflows.
    pub fn active_threads(&self) -> Vec<String> {
        let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.keys().cloned().collect()
    }

    /// Request a graceful stop of one workflow.
    pub fn request_stop(&self, thread_id: &str) -> bool {
        let stops = self.stop_requests.lock().unwrap_or_else(|e| e.into_inner());
        match stops.get(thread_id) {
            Some(flag) => {
                flag.store(true, Ordering::SeqCst);
                true
            }
            None => false,
        }
    }

    /// Drop a workflow's in-memory state. Returns false for unknown
    /// threads.
    pub fn reset(&self, thread_id: &str) -> bool {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        let mut stops = self.stop_requests.lock().unwrap_or_else(|e| e.into_inner());
        stops.remove(thread_id);
        states.remove(thread_id).is_some()
    }

    fn store_state(&self, state: &WorkflowState) {
        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        states.insert(state.thread_id.clone(), state.clone());
    }

    async fn publish(&self, event_type: EventType, state: &WorkflowState) {
        if !self.config.enable_pubsub {
            return;
        }
        if let Some(ref publisher) = self.publisher {
            let payload = serde_json::json!({
                "thread_id": state.thread_id,
                "story_id": state.story_id,
                "current_gate": state.current_gate,
            });
            if let Err(e) = publisher
                .publish(
                    event_type,
                    payload,
                    None,
                    Some(state.story_id.clone()),
                    None,
                    Some(state.thread_id.clone()),
                )
                .await
            {
                tracing::warn!(error = %e, "failed to publish workflow event");
            }
        }
    }

    /// Run one story through the gate schedule with a fresh thread id.
    pub async fn run(&self, request: StartRequest) -> RunnerOutcome {
        self.run_with_thread(Uuid::new_v4().to_string(), request).await
    }

    /// Run with a caller-supplied thread id (the HTTP API hands the id
    /// back to the client before the workflow finishes).
    pub async fn run_with_thread(&self, thread_id: String, request: StartRequest) -> RunnerOutcome {
        let started = Instant::now();

        let stop_flag = Arc::new(AtomicBool::new(false));
        {
            let mut stops = self.stop_requests.lock().unwrap_or_else(|e| e.into_inner());
            stops.insert(thread_id.clone(), Arc::clone(&stop_flag));
        }

        let mut state = WorkflowState {
            thread_id: thread_id.clone(),
            story_id: request.story_id.clone(),
            requirements: request.requirements.clone(),
            status: RunnerStatus::Running,
            current_gate: 0,
            gates_passed: 0,
            retry: RetryState::new(self.config.max_retries),
            budget: BudgetState {
                token_limit: request.token_limit,
                cost_limit_usd: request.cost_limit_usd,
                ..Default::default()
            },
            constitutional_score: 1.0,
            needs_human: false,
            escalation: None,
            error: None,
        };
        self.store_state(&state);
        self.publish(EventType::WorkflowStarted, &state).await;

        // Constitutional gate on the inputs: a severe violation never
        // starts executing gates.
        if self.config.enable_constitutional {
            let checker = SafetyChecker::default();
            let result = checker.check(&request.requirements, None);
            state.constitutional_score = result.score;
            if result.score < SAFETY_ESCALATION_THRESHOLD {
                if self.config.enable_estop {
                    self.estop.trigger();
                }
                return self
                    .finish(
                        state,
                        RunnerStatus::Failed,
                        Some(format!(
                            "constitutional check failed: {}",
                            result.violations.join("; ")
                        )),
                        started,
                    )
                    .await;
            }
        }

        let mut budget_tracker = BudgetTracker::new(state.budget.clone(), true);
        let qa_index = self.schedule.index_of(Gate::QaPassed);
        let terminal = self.schedule.terminal_index();

        let mut gate_index = 0;
        while gate_index <= terminal {
            // Cancellation points: global estop and per-thread stop.
            if self.config.enable_estop && self.estop.is_triggered() {
                return self
                    .finish(state, RunnerStatus::Cancelled, Some("emergency stop".into()), started)
                    .await;
            }
            if stop_flag.load(Ordering::SeqCst) {
                return self
                    .finish(state, RunnerStatus::Cancelled, Some("stop requested".into()), started)
                    .await;
            }

            let Some(gate) = self.schedule.at(gate_index) else {
                break;
            };

            state.current_gate = gate_index;
            self.store_state(&state);
            if let Some(ref callback) = self.config.on_gate_enter {
                callback(gate_index, &state);
            }
            self.publish(EventType::GateEntered, &state).await;

            let execution = match (self.gate_executor)(gate_index, gate, &state) {
                Ok(execution) => execution,
                Err(e) => GateExecution {
                    passed: false,
                    tokens_used: 0,
                    error: Some(e.to_string()),
                },
            };

            if self.config.enable_budget_tracking {
                let check = budget_tracker.record(execution.tokens_used, 0.0);
                state.budget = budget_tracker.state().clone();
                if check.level == AlertLevel::Exceeded && !check.allowed {
                    if self.config.enable_estop {
                        self.estop.trigger();
                    }
                    return self
                        .finish(
                            state,
                            RunnerStatus::Failed,
                            Some(format!(
                                "budget exceeded: {:.0}% of {} tokens",
                                check.percent_used, request.token_limit
                            )),
                            started,
                        )
                        .await;
                }
            }

            if execution.passed {
                state.gates_passed += 1;
                state.current_gate = gate_index + 1;
                self.store_state(&state);
                if let Some(ref callback) = self.config.on_gate_complete {
                    callback(gate_index, &state);
                }
                self.publish(EventType::GatePassed, &state).await;
                gate_index += 1;
                continue;
            }

            // Gate failed: QA failures go through the retry router, any
            // other gate retries on the same budget without the router.
            let error = execution.error.unwrap_or_else(|| "gate failed".to_owned());
            state.retry.record_failure(error.clone());
            self.publish(EventType::GateFailed, &state).await;

            let is_qa = Some(gate_index) == qa_index;
            let route = if is_qa {
                qa_retry_router(&QaRouteState {
                    qa_passed: false,
                    retry: state.retry.clone(),
                    constitutional_score: state.constitutional_score,
                    unrecoverable: false,
                })
            } else if state.retry.count >= state.retry.max_retries {
                RetryRoute::EscalateHuman
            } else {
                RetryRoute::DevFix
            };

            match route {
                RetryRoute::DevFix => {
                    let backoff = calculate_backoff(state.retry.count, false);
                    tracing::warn!(
                        thread_id = %state.thread_id,
                        gate = %gate,
                        retry = state.retry.count,
                        backoff_seconds = backoff,
                        "gate failed, retrying after backoff"
                    );
                    if !self.config.simulate_llm {
                        tokio::time::sleep(std::time::Duration::from_secs_f64(backoff)).await;
                    }
                    // Loop without advancing: the same gate runs again.
                }
                RetryRoute::EscalateHuman => {
                    let reason = crate::retry::escalation_reason(&QaRouteState {
                        qa_passed: false,
                        retry: state.retry.clone(),
                        constitutional_score: state.constitutional_score,
                        unrecoverable: false,
                    });
                    let context = build_escalation_context(
                        &state.thread_id,
                        &reason,
                        &EscalationInputs {
                            qa_feedback: Some(error),
                            retry: Some(state.retry.clone()),
                            constitutional_score: Some(state.constitutional_score),
                            safety_violations: Vec::new(),
                            task: state.requirements.clone(),
                            current_agent: state.story_id.clone(),
                        },
                    );
                    state.needs_human = true;
                    state.escalation = Some(context);
                    return self.finish(state, RunnerStatus::Paused, None, started).await;
                }
                RetryRoute::Failed | RetryRoute::CtoApproval => {
                    return self
                        .finish(state, RunnerStatus::Failed, Some(error), started)
                        .await;
                }
            }
        }

        state.current_gate = terminal + 1;
        self.finish(state, RunnerStatus::Completed, None, started).await
    }

    async fn finish(
        &self,
        mut state: WorkflowState,
        status: RunnerStatus,
        error: Option<String>,
        started: Instant,
    ) -> RunnerOutcome {
        state.status = status;
        state.error = error.clone();
        self.store_state(&state);

        let event = match status {
            RunnerStatus::Completed => EventType::WorkflowComplete,
            // A pause is a handoff to a human, not a failure.
            RunnerStatus::Paused => EventType::AgentHandoff,
            _ => EventType::WorkflowFailed,
        };
        self.publish(event, &state).await;

        if let (Some(callback), Some(message)) = (&self.config.on_error, &error) {
            callback(message, &state);
        }

        RunnerOutcome {
            thread_id: state.thread_id.clone(),
            status,
            gates_passed: state.gates_passed,
            duration_seconds: started.elapsed().as_secs_f64(),
            error,
        }
    }
}
