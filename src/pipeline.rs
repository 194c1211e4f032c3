use crate::agent::{Activation, AgentDescriptor, AgentName, Slot, StageStatus};
use crate::backend::{AgentBackend, BackendSource, FetchGoldSqlRequest};
use crate::compare::{ComparisonResult, ResultComparator, SqlSource};
use crate::config::PipelineConfig;
use crate::db::SqliteSource;
use crate::error::{Error, ErrorReport, QuerySide};
use crate::executor::StageExecutor;
use crate::plan::PipelinePlan;
use crate::stage::SlotMap;
use crate::state::{QueryResult, RunState, RunStatus, SharedRunState};
use crate::Result;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// What a caller asks one run to do.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub question: String,
    /// Ignored when routing is active; the routed id wins.
    pub database_id: Option<String>,
    pub activation: Activation,
}

impl RunRequest {
    pub fn new(question: impl Into<String>, activation: Activation) -> Self {
        Self {
            question: question.into(),
            database_id: None,
            activation,
        }
    }

    pub fn with_database(mut self, database_id: impl Into<String>) -> Self {
        self.database_id = Some(database_id.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub error: Option<ErrorReport>,
    pub state: RunState,
}

impl RunOutcome {
    pub fn is_completed(&self) -> bool {
        self.status == RunStatus::Completed
    }
}

struct RunGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

/// Sequential orchestrator over the six agents.
///
/// Owns the shared [`RunState`]. Runs are exclusive; standalone actions may
/// overlap a run but never the same agent, which the executor enforces.
pub struct Pipeline {
    executor: StageExecutor,
    comparator: ResultComparator,
    backend: Arc<dyn AgentBackend>,
    state: SharedRunState,
    config: PipelineConfig,
    running: AtomicBool,
}

impl Pipeline {
    /// Comparisons go to the SQLite files under `database_root` when one is
    /// configured, otherwise through the backend's statement execution.
    pub fn new(backend: Arc<dyn AgentBackend>, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        let source: Arc<dyn SqlSource> = match &config.database_root {
            Some(root) => Arc::new(SqliteSource::new(root.clone())),
            None => Arc::new(BackendSource::new(backend.clone())),
        };
        info!(
            "Pipeline created, stage timeout={:?}, database root={:?}",
            config.stage_timeout(),
            config.database_root
        );
        Ok(Self {
            executor: StageExecutor::from_backend(backend.clone(), config.stage_timeout()),
            comparator: ResultComparator::new(source),
            backend,
            state: RunState::new_shared(),
            config,
            running: AtomicBool::new(false),
        })
    }

    pub fn with_source(mut self, source: Arc<dyn SqlSource>) -> Self {
        self.comparator = ResultComparator::new(source);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Handle for passive observers.
    pub fn state(&self) -> SharedRunState {
        self.state.clone()
    }

    pub async fn snapshot(&self) -> RunState {
        self.state.read().await.clone()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Refused while a run or any standalone agent call is in flight.
    pub async fn reset(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::AlreadyRunning("pipeline".to_string()));
        }
        if let Some(agent) = self.executor.in_flight_agent() {
            return Err(Error::AlreadyRunning(agent.to_string()));
        }
        self.state.write().await.reset();
        debug!("Run state reset");
        Ok(())
    }

    fn claim_run(&self) -> Result<RunGuard<'_>> {
        self.running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| Error::AlreadyRunning("pipeline".to_string()))?;
        Ok(RunGuard {
            flag: &self.running,
        })
    }

    pub async fn run(&self, request: RunRequest) -> RunOutcome {
        let _guard = match self.claim_run() {
            Ok(guard) => guard,
            Err(e) => {
                warn!("Rejected run request: {}", e);
                let state = self.snapshot().await;
                return RunOutcome {
                    status: state.status,
                    error: Some(ErrorReport::from(e)),
                    state,
                };
            }
        };

        let run_id = Uuid::new_v4();
        let span = tracing::info_span!("run", run_id = %run_id);
        self.run_claimed(run_id, request).instrument(span).await
    }

    async fn run_claimed(&self, run_id: Uuid, request: RunRequest) -> RunOutcome {
        let plan = PipelinePlan::build(&request.activation);
        {
            let mut state = self.state.write().await;
            state.reset();
            state.run_id = Some(run_id);
            if let Err(e) = state.transition(RunStatus::Running) {
                error!("Cannot start run: {}", e);
            }
        }
        info!("Run started with plan {:?}", plan.names());

        let result = match Self::validate(&request, &plan) {
            Ok(database_id) => {
                {
                    let mut state = self.state.write().await;
                    state.question = request.question.clone();
                    state.database_id = database_id;
                    state.plan = plan.names();
                }
                self.execute_plan(&plan).await
            }
            Err(e) => Err((None, e)),
        };

        let mut state = self.state.write().await;
        let outcome = match result {
            Ok(()) => state.transition(RunStatus::Completed).map(|_| None),
            Err((stage, e)) => {
                let mut report = ErrorReport::from(&e);
                if let Some(stage) = stage {
                    report = report.with_stage(stage);
                }
                error!("Run failed: {}", report.message);
                state.fail(report.clone()).map(|_| Some(report))
            }
        };
        let error = outcome.unwrap_or_else(|e| Some(ErrorReport::from(e)));
        info!("Run finished with status {}", state.status);
        RunOutcome {
            status: state.status,
            error,
            state: state.clone(),
        }
    }

    /// Returns the database id the run starts with.
    fn validate(request: &RunRequest, plan: &PipelinePlan) -> Result<String> {
        if request.question.trim().is_empty() {
            return Err(Error::Configuration(
                "question must not be empty".to_string(),
            ));
        }
        if plan.contains(AgentName::DatabaseRouting) {
            if request.database_id.is_some() {
                debug!("Database routing is active, ignoring the supplied database id");
            }
            return Ok(String::new());
        }
        match request.database_id.as_deref().map(str::trim) {
            Some(id) if !id.is_empty() => Ok(id.to_string()),
            _ => Err(Error::Configuration(
                "a database id is required when database routing is inactive".to_string(),
            )),
        }
    }

    async fn execute_plan(
        &self,
        plan: &PipelinePlan,
    ) -> std::result::Result<(), (Option<AgentName>, Error)> {
        for descriptor in plan.stages() {
            let agent = descriptor.name;
            self.execute_stage(descriptor)
                .await
                .map_err(|e| (Some(agent), e))?;
        }
        Ok(())
    }

    async fn execute_stage(&self, descriptor: &AgentDescriptor) -> Result<()> {
        let agent = descriptor.name;
        let inputs = {
            let mut state = self.state.write().await;
            state.set_stage_status(agent, StageStatus::Running);
            self.gather_inputs(descriptor, &state)
        };

        let applied = match self.executor.invoke(descriptor, inputs).await {
            Ok(outputs) => {
                let mut state = self.state.write().await;
                state.apply_outputs(agent, &outputs).and_then(|_| {
                    match state.execution_rows.as_ref().and_then(QueryResult::error_message) {
                        Some(message) if agent == AgentName::SqlExecution => {
                            Err(Error::Execution {
                                which: QuerySide::Generated,
                                message: message.to_string(),
                            })
                        }
                        _ => Ok(()),
                    }
                })
            }
            Err(e) => Err(e),
        };

        let status = if applied.is_ok() {
            StageStatus::Completed
        } else {
            StageStatus::Failed
        };
        self.state.write().await.set_stage_status(agent, status);
        applied
    }

    fn model_for(&self, agent: AgentName) -> &str {
        match agent {
            AgentName::ErrorCorrection => &self.config.correction_model,
            _ => &self.config.model,
        }
    }

    /// Inputs come from RunState, except the ones that are settings.
    fn gather_inputs(&self, descriptor: &AgentDescriptor, state: &RunState) -> SlotMap {
        descriptor
            .inputs
            .iter()
            .filter_map(|input| {
                let value = match input.slot {
                    Slot::NumDemonstrations => Some(json!(self.config.num_demonstrations)),
                    Slot::PromptTemplate => Some(json!(self.config.prompt_template)),
                    Slot::Model => Some(json!(self.model_for(descriptor.name))),
                    Slot::RuleGroups => Some(json!(self.config.rule_groups)),
                    slot => state.slot_value(slot),
                }?;
                Some((input.slot, value))
            })
            .collect()
    }

    /// Invokes one agent outside a run with inputs taken from the current
    /// state and writes its outputs back. Run status is left alone.
    ///
    /// This may overlap a run. Each agent writes only its own output slots
    /// plus the derived `sql_for_execution`, and the executor never lets the
    /// same agent run twice at once, so a slot has one writer at a time.
    pub async fn execute_agent(&self, agent: AgentName) -> Result<SlotMap> {
        let descriptor = agent.descriptor();
        let inputs = {
            let state = self.state.read().await;
            self.gather_inputs(descriptor, &state)
        };
        if descriptor.consumes(Slot::DatabaseId) && !inputs.has_value(Slot::DatabaseId) {
            return Err(Error::Configuration(format!(
                "{} needs a database id",
                agent
            )));
        }
        let outputs = self.executor.invoke(descriptor, inputs).await?;
        self.state.write().await.apply_outputs(agent, &outputs)?;
        debug!("Standalone {} finished", agent);
        Ok(outputs)
    }

    /// Runs `sql_for_execution`. An engine error is kept as the payload in
    /// `execution_rows`, not returned as a failure.
    pub async fn execute_final_sql(&self) -> Result<QueryResult> {
        self.execute_agent(AgentName::SqlExecution).await?;
        self.state
            .read()
            .await
            .execution_rows
            .clone()
            .ok_or_else(|| Error::Other(anyhow::anyhow!("execution produced no result")))
    }

    pub async fn retrieve_gold_sql(&self, question: &str) -> Result<String> {
        if question.trim().is_empty() {
            return Err(Error::Configuration(
                "question must not be empty".to_string(),
            ));
        }
        let response = self
            .backend
            .fetch_gold_sql(FetchGoldSqlRequest {
                question: question.to_string(),
            })
            .await
            .map_err(|e| Error::Other(e.context("fetching gold SQL")))?;
        self.state.write().await.gold_sql = response.sql.clone();
        Ok(response.sql)
    }

    /// Runs `gold_sql` through the execution agent and keeps the outcome in
    /// `gold_execution_rows`.
    pub async fn execute_gold_sql(&self) -> Result<QueryResult> {
        let (gold_sql, database_id) = {
            let state = self.state.read().await;
            (state.gold_sql.clone(), state.database_id.clone())
        };
        if database_id.is_empty() {
            return Err(Error::Configuration(
                "cannot execute gold SQL without a database id".to_string(),
            ));
        }
        let descriptor = AgentName::SqlExecution.descriptor();
        let inputs = SlotMap::new()
            .with(Slot::SqlForExecution, Value::String(gold_sql))
            .with(Slot::DatabaseId, Value::String(database_id));
        let outputs = self.executor.invoke(descriptor, inputs).await?;
        let result = QueryResult::from_slots(
            outputs.get(Slot::ExecutionFlag).unwrap_or(&Value::Null),
            outputs.get(Slot::ExecutionRows).unwrap_or(&Value::Null),
        )
        .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
        self.state.write().await.gold_execution_rows = Some(result.clone());
        Ok(result)
    }

    /// Executes gold first. A gold failure is recorded in
    /// `gold_execution_rows` and leaves the generated side untouched. The
    /// previous comparison is dropped before anything runs.
    pub async fn compare_results(
        &self,
        generated_sql: &str,
        gold_sql: &str,
        database_id: &str,
    ) -> std::result::Result<ComparisonResult, ErrorReport> {
        let cached = {
            let mut state = self.state.write().await;
            state.comparison = None;
            state.gold_execution_rows = None;
            state.gold_sql = gold_sql.to_string();
            match &state.execution_rows {
                Some(QueryResult::Result { rows })
                    if state.sql_for_execution == generated_sql
                        && state.database_id == database_id =>
                {
                    Some(rows.clone())
                }
                _ => None,
            }
        };
        if let Some(rows) = &cached {
            debug!("Reusing {} generated rows from the last execution", rows.len());
        }

        let compared = self
            .comparator
            .compare_with(generated_sql, cached, gold_sql, database_id)
            .await;
        let mut state = self.state.write().await;
        match compared {
            Ok(comparison) => {
                info!(
                    "Compared {} generated rows with {} gold rows: {}",
                    comparison.generated.len(),
                    comparison.gold.len(),
                    comparison.result.summary()
                );
                state.gold_execution_rows = Some(QueryResult::rows(comparison.gold));
                state.comparison = Some(comparison.result.clone());
                Ok(comparison.result)
            }
            Err(e) => {
                if let Error::Execution {
                    which: QuerySide::Gold,
                    message,
                } = &e
                {
                    state.gold_execution_rows = Some(QueryResult::error(message.clone()));
                }
                warn!("Comparison aborted: {}", e);
                Err(ErrorReport::from(e))
            }
        }
    }
}
