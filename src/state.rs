//! The single record of the current pipeline run.
//!
//! Only the orchestrator writes to [`RunState`]; everybody else reads
//! snapshots and must tolerate a `running` status with fields still being
//! filled in.

use crate::agent::{AgentName, Slot, StageStatus};
use crate::compare::ComparisonResult;
use crate::error::{Error, ErrorReport};
use crate::row::Row;
use crate::stage::SlotMap;
use crate::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

pub type SharedRunState = Arc<RwLock<RunState>>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Idle,
    Running,
    Completed,
    Failed,
}

impl RunStatus {
    /// `reset` (back to idle) is allowed from anywhere and is not a
    /// transition in this sense.
    pub fn can_transition_to(self, next: RunStatus) -> bool {
        matches!(
            (self, next),
            (RunStatus::Idle, RunStatus::Running)
                | (RunStatus::Running, RunStatus::Completed)
                | (RunStatus::Running, RunStatus::Failed)
        )
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RunStatus::Idle => "idle",
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Outcome of executing one statement: rows, or the engine's error text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "execution_flag", rename_all = "snake_case")]
pub enum QueryResult {
    Result { rows: Vec<Row> },
    Error { error_message: String },
}

impl QueryResult {
    pub fn rows(rows: Vec<Row>) -> Self {
        QueryResult::Result { rows }
    }

    pub fn error(message: impl Into<String>) -> Self {
        QueryResult::Error {
            error_message: message.into(),
        }
    }

    pub fn as_rows(&self) -> Option<&[Row]> {
        match self {
            QueryResult::Result { rows } => Some(rows),
            QueryResult::Error { .. } => None,
        }
    }

    pub fn error_message(&self) -> Option<&str> {
        match self {
            QueryResult::Result { .. } => None,
            QueryResult::Error { error_message } => Some(error_message),
        }
    }

    pub fn flag(&self) -> &'static str {
        match self {
            QueryResult::Result { .. } => "result",
            QueryResult::Error { .. } => "error",
        }
    }

    /// Splits into the two slot values an execution stage reports.
    pub fn to_slots(&self) -> (Value, Value) {
        let payload = match self {
            QueryResult::Result { rows } => serde_json::to_value(rows).unwrap_or(Value::Null),
            QueryResult::Error { error_message } => Value::String(error_message.clone()),
        };
        (Value::String(self.flag().to_string()), payload)
    }

    pub fn from_slots(flag: &Value, payload: &Value) -> std::result::Result<Self, String> {
        match flag.as_str() {
            Some("result") => serde_json::from_value::<Vec<Row>>(payload.clone())
                .map(QueryResult::rows)
                .map_err(|e| format!("execution rows are not a list of rows: {}", e)),
            Some("error") => Ok(QueryResult::error(
                payload
                    .as_str()
                    .map(str::to_string)
                    .unwrap_or_else(|| payload.to_string()),
            )),
            _ => Err(format!("unknown execution flag {}", flag)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Option<Uuid>,
    pub status: RunStatus,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub plan: Vec<AgentName>,
    pub stage_status: BTreeMap<AgentName, StageStatus>,
    pub question: String,
    pub database_id: String,
    pub schema_text: String,
    pub demonstration_text: String,
    pub generated_prompt: String,
    pub generated_sql: String,
    pub correction_prompt: String,
    pub corrected_sql: String,
    pub sql_for_execution: String,
    pub execution_rows: Option<QueryResult>,
    pub gold_sql: String,
    pub gold_execution_rows: Option<QueryResult>,
    pub comparison: Option<ComparisonResult>,
    pub failure: Option<ErrorReport>,
}

impl RunState {
    pub fn new_shared() -> SharedRunState {
        Arc::new(RwLock::new(RunState::default()))
    }

    /// Replaces every field with its default in one assignment.
    pub fn reset(&mut self) {
        *self = RunState::default();
    }

    pub fn transition(&mut self, next: RunStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::Other(anyhow::anyhow!(
                "invalid run transition {} -> {}",
                self.status,
                next
            )));
        }
        match next {
            RunStatus::Running => self.started_at = Some(Utc::now()),
            RunStatus::Completed | RunStatus::Failed => self.finished_at = Some(Utc::now()),
            RunStatus::Idle => {}
        }
        self.status = next;
        Ok(())
    }

    pub fn fail(&mut self, report: ErrorReport) -> Result<()> {
        self.transition(RunStatus::Failed)?;
        self.failure = Some(report);
        Ok(())
    }

    /// Current value of a RunState-backed slot, `None` for slots that come
    /// from configuration instead.
    pub fn slot_value(&self, slot: Slot) -> Option<Value> {
        let text = |s: &str| Some(Value::String(s.to_string()));
        match slot {
            Slot::Question => text(&self.question),
            Slot::DatabaseId => text(&self.database_id),
            Slot::SchemaText => text(&self.schema_text),
            Slot::DemonstrationText => text(&self.demonstration_text),
            Slot::GeneratedPrompt => text(&self.generated_prompt),
            Slot::GeneratedSql => text(&self.generated_sql),
            Slot::CorrectionPrompt => text(&self.correction_prompt),
            Slot::CorrectedSql => text(&self.corrected_sql),
            Slot::SqlForExecution => text(&self.sql_for_execution),
            Slot::ExecutionFlag => self.execution_rows.as_ref().map(|r| r.to_slots().0),
            Slot::ExecutionRows => self.execution_rows.as_ref().map(|r| r.to_slots().1),
            Slot::NumDemonstrations | Slot::PromptTemplate | Slot::Model | Slot::RuleGroups => {
                None
            }
        }
    }

    /// Writes every output slot `agent` declares, then re-derives
    /// `sql_for_execution`.
    pub fn apply_outputs(&mut self, agent: AgentName, outputs: &SlotMap) -> Result<()> {
        let descriptor = agent.descriptor();
        for slot in descriptor.outputs {
            match slot {
                Slot::ExecutionFlag => {}
                Slot::ExecutionRows => {
                    let flag = outputs.get(Slot::ExecutionFlag).unwrap_or(&Value::Null);
                    let payload = outputs.get(Slot::ExecutionRows).unwrap_or(&Value::Null);
                    let result = QueryResult::from_slots(flag, payload)
                        .map_err(|e| Error::Other(anyhow::anyhow!(e)))?;
                    self.execution_rows = Some(result);
                }
                text_slot => {
                    let value = outputs.text(*text_slot).unwrap_or_default().to_string();
                    match text_slot {
                        Slot::DatabaseId => self.database_id = value,
                        Slot::SchemaText => self.schema_text = value,
                        Slot::DemonstrationText => self.demonstration_text = value,
                        Slot::GeneratedPrompt => self.generated_prompt = value,
                        Slot::GeneratedSql => self.generated_sql = value,
                        Slot::CorrectionPrompt => self.correction_prompt = value,
                        Slot::CorrectedSql => self.corrected_sql = value,
                        other => {
                            return Err(Error::Other(anyhow::anyhow!(
                                "{} is not a writable output slot",
                                other
                            )))
                        }
                    }
                }
            }
        }
        self.refresh_sql_for_execution();
        Ok(())
    }

    pub fn error_correction_active(&self) -> bool {
        self.plan.contains(&AgentName::ErrorCorrection)
    }

    fn refresh_sql_for_execution(&mut self) {
        self.sql_for_execution = if self.error_correction_active() && !self.corrected_sql.is_empty()
        {
            self.corrected_sql.clone()
        } else {
            self.generated_sql.clone()
        };
    }

    pub fn set_stage_status(&mut self, agent: AgentName, status: StageStatus) {
        self.stage_status.insert(agent, status);
    }
}
