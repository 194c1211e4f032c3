//! Remote capabilities the pipeline calls out to.
//!
//! Each agent is opaque: the pipeline only knows the request and response
//! bodies below. How they travel (HTTP, in-process, ...) is up to the
//! [`AgentBackend`] implementation.

use crate::compare::SqlSource;
use crate::state::QueryResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDatabaseRequest {
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDatabaseResponse {
    pub database_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSchemaRequest {
    pub database_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchSchemaResponse {
    pub schema_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectDemonstrationsRequest {
    pub question: String,
    pub count: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectDemonstrationsResponse {
    pub demonstration_text: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructPromptRequest {
    pub question: String,
    pub schema_text: Option<String>,
    pub demonstration_text: Option<String>,
    pub template: String,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConstructPromptResponse {
    pub prompt_text: String,
    pub sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectErrorsRequest {
    pub question: String,
    pub sql: String,
    pub schema_text: Option<String>,
    pub rule_groups: Vec<u32>,
    pub model: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrectErrorsResponse {
    pub correction_prompt_text: String,
    pub corrected_sql: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecuteStatementRequest {
    pub sql: String,
    pub database_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchGoldSqlRequest {
    pub question: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchGoldSqlResponse {
    pub sql: String,
}

/// An `Err` from any of these methods is a transport or backend failure.
/// A statement that ran and failed is `Ok(QueryResult::Error { .. })`.
#[async_trait]
pub trait AgentBackend: Send + Sync + 'static {
    async fn route_database(
        &self,
        request: RouteDatabaseRequest,
    ) -> anyhow::Result<RouteDatabaseResponse>;

    async fn fetch_schema(&self, request: FetchSchemaRequest)
        -> anyhow::Result<FetchSchemaResponse>;

    async fn select_demonstrations(
        &self,
        request: SelectDemonstrationsRequest,
    ) -> anyhow::Result<SelectDemonstrationsResponse>;

    async fn construct_prompt(
        &self,
        request: ConstructPromptRequest,
    ) -> anyhow::Result<ConstructPromptResponse>;

    async fn correct_errors(
        &self,
        request: CorrectErrorsRequest,
    ) -> anyhow::Result<CorrectErrorsResponse>;

    async fn execute_statement(
        &self,
        request: ExecuteStatementRequest,
    ) -> anyhow::Result<QueryResult>;

    async fn fetch_gold_sql(
        &self,
        request: FetchGoldSqlRequest,
    ) -> anyhow::Result<FetchGoldSqlResponse>;
}

/// Runs comparison statements through the backend's `execute_statement`.
pub struct BackendSource {
    backend: Arc<dyn AgentBackend>,
}

impl BackendSource {
    pub fn new(backend: Arc<dyn AgentBackend>) -> Self {
        Self { backend }
    }
}

#[async_trait]
impl SqlSource for BackendSource {
    async fn execute(&self, sql: &str, database_id: &str) -> anyhow::Result<QueryResult> {
        self.backend
            .execute_statement(ExecuteStatementRequest {
                sql: sql.to_string(),
                database_id: database_id.to_string(),
            })
            .await
    }
}
