//! Test doubles for the agent backend and SQL sources.

use crate::agent::AgentName;
use crate::backend::{
    AgentBackend, ConstructPromptRequest, ConstructPromptResponse, CorrectErrorsRequest,
    CorrectErrorsResponse, ExecuteStatementRequest, FetchGoldSqlRequest, FetchGoldSqlResponse,
    FetchSchemaRequest, FetchSchemaResponse, RouteDatabaseRequest, RouteDatabaseResponse,
    SelectDemonstrationsRequest, SelectDemonstrationsResponse,
};
use crate::compare::SqlSource;
use crate::row::Row;
use crate::state::QueryResult;
use anyhow::anyhow;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::Notify;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Holds a gated agent's call open: the backend signals `entered` and then
/// waits for `release`.
#[derive(Debug, Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Scriptable [`AgentBackend`] that records every call.
#[derive(Debug)]
pub struct MockBackend {
    routed_database: String,
    schema_text: String,
    demonstration_text: String,
    prompt_text: String,
    generated_sql: String,
    correction_prompt: String,
    corrected_sql: String,
    gold_sql: String,
    statements: HashMap<String, QueryResult>,
    default_statement: QueryResult,
    failures: HashMap<AgentName, String>,
    gate: Option<(AgentName, Arc<Gate>)>,
    calls: Mutex<Vec<AgentName>>,
    prompt_requests: Mutex<Vec<ConstructPromptRequest>>,
    correction_requests: Mutex<Vec<CorrectErrorsRequest>>,
    statement_requests: Mutex<Vec<ExecuteStatementRequest>>,
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            routed_database: "routed_db".to_string(),
            schema_text: "CREATE TABLE singer (id INTEGER, name TEXT)".to_string(),
            demonstration_text: "Q: how many? A: SELECT count(*) FROM singer".to_string(),
            prompt_text: "prompt".to_string(),
            generated_sql: "SELECT 1".to_string(),
            correction_prompt: "correction prompt".to_string(),
            corrected_sql: "SELECT 1".to_string(),
            gold_sql: "SELECT 1".to_string(),
            statements: HashMap::new(),
            default_statement: QueryResult::rows(Vec::new()),
            failures: HashMap::new(),
            gate: None,
            calls: Mutex::new(Vec::new()),
            prompt_requests: Mutex::new(Vec::new()),
            correction_requests: Mutex::new(Vec::new()),
            statement_requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_routed_database(mut self, database_id: &str) -> Self {
        self.routed_database = database_id.to_string();
        self
    }

    pub fn with_schema(mut self, schema_text: &str) -> Self {
        self.schema_text = schema_text.to_string();
        self
    }

    pub fn with_demonstrations(mut self, text: &str) -> Self {
        self.demonstration_text = text.to_string();
        self
    }

    pub fn with_generated_sql(mut self, sql: &str) -> Self {
        self.generated_sql = sql.to_string();
        self
    }

    pub fn with_corrected_sql(mut self, sql: &str) -> Self {
        self.corrected_sql = sql.to_string();
        self
    }

    pub fn with_gold_sql(mut self, sql: &str) -> Self {
        self.gold_sql = sql.to_string();
        self
    }

    pub fn with_statement(mut self, sql: &str, result: QueryResult) -> Self {
        self.statements.insert(sql.to_string(), result);
        self
    }

    /// Result for any statement without a scripted one.
    pub fn with_default_statement(mut self, result: QueryResult) -> Self {
        self.default_statement = result;
        self
    }

    /// Makes every call to `agent` fail with `message`.
    pub fn failing(mut self, agent: AgentName, message: &str) -> Self {
        self.failures.insert(agent, message.to_string());
        self
    }

    pub fn gated(mut self, agent: AgentName) -> (Self, Arc<Gate>) {
        let gate = Arc::new(Gate::default());
        self.gate = Some((agent, gate.clone()));
        (self, gate)
    }

    pub fn calls(&self) -> Vec<AgentName> {
        lock(&self.calls).clone()
    }

    pub fn call_count(&self, agent: AgentName) -> usize {
        lock(&self.calls).iter().filter(|a| **a == agent).count()
    }

    pub fn prompt_requests(&self) -> Vec<ConstructPromptRequest> {
        lock(&self.prompt_requests).clone()
    }

    pub fn correction_requests(&self) -> Vec<CorrectErrorsRequest> {
        lock(&self.correction_requests).clone()
    }

    pub fn statement_requests(&self) -> Vec<ExecuteStatementRequest> {
        lock(&self.statement_requests).clone()
    }

    async fn enter(&self, agent: AgentName) -> anyhow::Result<()> {
        lock(&self.calls).push(agent);
        if let Some((gated, gate)) = &self.gate {
            if *gated == agent {
                gate.entered.notify_one();
                gate.release.notified().await;
            }
        }
        match self.failures.get(&agent) {
            Some(message) => Err(anyhow!("{}", message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl AgentBackend for MockBackend {
    async fn route_database(
        &self,
        _request: RouteDatabaseRequest,
    ) -> anyhow::Result<RouteDatabaseResponse> {
        self.enter(AgentName::DatabaseRouting).await?;
        Ok(RouteDatabaseResponse {
            database_id: self.routed_database.clone(),
        })
    }

    async fn fetch_schema(
        &self,
        _request: FetchSchemaRequest,
    ) -> anyhow::Result<FetchSchemaResponse> {
        self.enter(AgentName::DataLoader).await?;
        Ok(FetchSchemaResponse {
            schema_text: self.schema_text.clone(),
        })
    }

    async fn select_demonstrations(
        &self,
        _request: SelectDemonstrationsRequest,
    ) -> anyhow::Result<SelectDemonstrationsResponse> {
        self.enter(AgentName::DemonstrationSelection).await?;
        Ok(SelectDemonstrationsResponse {
            demonstration_text: self.demonstration_text.clone(),
        })
    }

    async fn construct_prompt(
        &self,
        request: ConstructPromptRequest,
    ) -> anyhow::Result<ConstructPromptResponse> {
        lock(&self.prompt_requests).push(request);
        self.enter(AgentName::PromptConstruction).await?;
        Ok(ConstructPromptResponse {
            prompt_text: self.prompt_text.clone(),
            sql: self.generated_sql.clone(),
        })
    }

    async fn correct_errors(
        &self,
        request: CorrectErrorsRequest,
    ) -> anyhow::Result<CorrectErrorsResponse> {
        lock(&self.correction_requests).push(request);
        self.enter(AgentName::ErrorCorrection).await?;
        Ok(CorrectErrorsResponse {
            correction_prompt_text: self.correction_prompt.clone(),
            corrected_sql: self.corrected_sql.clone(),
        })
    }

    async fn execute_statement(
        &self,
        request: ExecuteStatementRequest,
    ) -> anyhow::Result<QueryResult> {
        let result = self
            .statements
            .get(&request.sql)
            .cloned()
            .unwrap_or_else(|| self.default_statement.clone());
        lock(&self.statement_requests).push(request);
        self.enter(AgentName::SqlExecution).await?;
        Ok(result)
    }

    async fn fetch_gold_sql(
        &self,
        _request: FetchGoldSqlRequest,
    ) -> anyhow::Result<FetchGoldSqlResponse> {
        Ok(FetchGoldSqlResponse {
            sql: self.gold_sql.clone(),
        })
    }
}

/// [`SqlSource`] answering from a fixed SQL → result table.
#[derive(Debug, Default)]
pub struct MemorySource {
    results: HashMap<String, QueryResult>,
    executed: Mutex<Vec<String>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(mut self, sql: &str, rows: Vec<Row>) -> Self {
        self.results.insert(sql.to_string(), QueryResult::rows(rows));
        self
    }

    pub fn with_error(mut self, sql: &str, message: &str) -> Self {
        self.results
            .insert(sql.to_string(), QueryResult::error(message));
        self
    }

    pub fn executed(&self) -> Vec<String> {
        lock(&self.executed).clone()
    }
}

#[async_trait]
impl SqlSource for MemorySource {
    async fn execute(&self, sql: &str, _database_id: &str) -> anyhow::Result<QueryResult> {
        lock(&self.executed).push(sql.to_string());
        self.results
            .get(sql)
            .cloned()
            .ok_or_else(|| anyhow!("no result scripted for `{}`", sql))
    }
}
