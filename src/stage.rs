use crate::agent::{AgentDescriptor, AgentName, Slot};
use crate::backend::{
    AgentBackend, ConstructPromptRequest, CorrectErrorsRequest, ExecuteStatementRequest,
    FetchSchemaRequest, RouteDatabaseRequest, SelectDemonstrationsRequest,
};
use crate::error::{Error, StageCause};
use crate::sql_text::normalize_generated_sql;
use crate::state::QueryResult;
use anyhow::{anyhow, Context};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

/// Named slot values flowing into or out of a stage.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SlotMap(BTreeMap<Slot, Value>);

impl SlotMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, slot: Slot, value: Value) -> Self {
        self.insert(slot, value);
        self
    }

    pub fn insert(&mut self, slot: Slot, value: Value) {
        self.0.insert(slot, value);
    }

    pub fn get(&self, slot: Slot) -> Option<&Value> {
        self.0.get(&slot)
    }

    pub fn text(&self, slot: Slot) -> Option<&str> {
        self.0.get(&slot).and_then(Value::as_str)
    }

    /// Null, empty strings, empty lists and empty objects count as absent.
    pub fn has_value(&self, slot: Slot) -> bool {
        match self.0.get(&slot) {
            None | Some(Value::Null) => false,
            Some(Value::String(s)) => !s.is_empty(),
            Some(Value::Array(a)) => !a.is_empty(),
            Some(Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        }
    }

    pub fn slots(&self) -> impl Iterator<Item = Slot> + '_ {
        self.0.keys().copied()
    }

    fn require_text(&self, slot: Slot) -> anyhow::Result<String> {
        self.text(slot)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("input `{}` is not text", slot))
    }

    fn optional_text(&self, slot: Slot) -> Option<String> {
        self.text(slot)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
    }

    fn require<T: serde::de::DeserializeOwned>(&self, slot: Slot) -> anyhow::Result<T> {
        let value = self
            .get(slot)
            .cloned()
            .ok_or_else(|| anyhow!("input `{}` is absent", slot))?;
        serde_json::from_value(value).with_context(|| format!("input `{}` has the wrong shape", slot))
    }
}

impl FromIterator<(Slot, Value)> for SlotMap {
    fn from_iter<I: IntoIterator<Item = (Slot, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

#[async_trait]
pub trait Stage: Send + Sync + 'static {
    fn agent(&self) -> AgentName;

    /// Deadline for one invocation; `None` waits indefinitely.
    fn timeout(&self) -> Option<Duration>;

    async fn process(&self, inputs: &SlotMap) -> anyhow::Result<SlotMap>;

    fn descriptor(&self) -> &'static AgentDescriptor {
        self.agent().descriptor()
    }

    /// Calls `process` under the stage deadline and checks that every
    /// declared output came back.
    async fn run(&self, inputs: &SlotMap) -> Result<SlotMap, Error> {
        let agent = self.agent();
        let result = match self.timeout() {
            Some(limit) => match timeout(limit, self.process(inputs)).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!("Stage {} timed out after {:?}", agent, limit);
                    return Err(Error::Stage {
                        agent,
                        cause: StageCause::Timeout(limit),
                    });
                }
            },
            None => self.process(inputs).await,
        };

        let outputs = result.map_err(|e| Error::Stage {
            agent,
            cause: StageCause::Backend(format!("{:#}", e)),
        })?;

        if let Some(missing) = self
            .descriptor()
            .outputs
            .iter()
            .find(|slot| outputs.get(**slot).is_none())
        {
            return Err(Error::Stage {
                agent,
                cause: StageCause::MalformedOutput(format!("missing output `{}`", missing)),
            });
        }
        if agent == AgentName::SqlExecution {
            let flag = outputs.get(Slot::ExecutionFlag).unwrap_or(&Value::Null);
            let payload = outputs.get(Slot::ExecutionRows).unwrap_or(&Value::Null);
            QueryResult::from_slots(flag, payload).map_err(|e| Error::Stage {
                agent,
                cause: StageCause::MalformedOutput(e),
            })?;
        }
        Ok(outputs)
    }
}

/// A stage that forwards to the matching [`AgentBackend`] capability.
pub struct BackendStage {
    agent: AgentName,
    backend: Arc<dyn AgentBackend>,
    timeout: Option<Duration>,
}

impl BackendStage {
    pub fn new(agent: AgentName, backend: Arc<dyn AgentBackend>, timeout: Option<Duration>) -> Self {
        Self {
            agent,
            backend,
            timeout,
        }
    }

    /// One stage per agent, all sharing `backend`.
    pub fn all(backend: Arc<dyn AgentBackend>, timeout: Option<Duration>) -> Vec<Arc<dyn Stage>> {
        AgentName::ALL
            .iter()
            .map(|agent| {
                Arc::new(BackendStage::new(*agent, backend.clone(), timeout)) as Arc<dyn Stage>
            })
            .collect()
    }
}

#[async_trait]
impl Stage for BackendStage {
    fn agent(&self) -> AgentName {
        self.agent
    }

    fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    async fn process(&self, inputs: &SlotMap) -> anyhow::Result<SlotMap> {
        let outputs = match self.agent {
            AgentName::DatabaseRouting => {
                let response = self
                    .backend
                    .route_database(RouteDatabaseRequest {
                        question: inputs.require_text(Slot::Question)?,
                    })
                    .await?;
                SlotMap::new().with(Slot::DatabaseId, Value::String(response.database_id))
            }
            AgentName::DataLoader => {
                let response = self
                    .backend
                    .fetch_schema(FetchSchemaRequest {
                        database_id: inputs.require_text(Slot::DatabaseId)?,
                    })
                    .await?;
                SlotMap::new().with(Slot::SchemaText, Value::String(response.schema_text))
            }
            AgentName::DemonstrationSelection => {
                let response = self
                    .backend
                    .select_demonstrations(SelectDemonstrationsRequest {
                        question: inputs.require_text(Slot::Question)?,
                        count: inputs.require(Slot::NumDemonstrations)?,
                    })
                    .await?;
                SlotMap::new().with(
                    Slot::DemonstrationText,
                    Value::String(response.demonstration_text),
                )
            }
            AgentName::PromptConstruction => {
                let response = self
                    .backend
                    .construct_prompt(ConstructPromptRequest {
                        question: inputs.require_text(Slot::Question)?,
                        schema_text: inputs.optional_text(Slot::SchemaText),
                        demonstration_text: inputs.optional_text(Slot::DemonstrationText),
                        template: inputs.require_text(Slot::PromptTemplate)?,
                        model: inputs.require_text(Slot::Model)?,
                    })
                    .await?;
                SlotMap::new()
                    .with(Slot::GeneratedPrompt, Value::String(response.prompt_text))
                    .with(
                        Slot::GeneratedSql,
                        Value::String(normalize_generated_sql(&response.sql)),
                    )
            }
            AgentName::ErrorCorrection => {
                let response = self
                    .backend
                    .correct_errors(CorrectErrorsRequest {
                        question: inputs.require_text(Slot::Question)?,
                        sql: inputs.require_text(Slot::GeneratedSql)?,
                        schema_text: inputs.optional_text(Slot::SchemaText),
                        rule_groups: inputs.require(Slot::RuleGroups)?,
                        model: inputs.require_text(Slot::Model)?,
                    })
                    .await?;
                SlotMap::new()
                    .with(
                        Slot::CorrectionPrompt,
                        Value::String(response.correction_prompt_text),
                    )
                    .with(
                        Slot::CorrectedSql,
                        Value::String(normalize_generated_sql(&response.corrected_sql)),
                    )
            }
            AgentName::SqlExecution => {
                let result = self
                    .backend
                    .execute_statement(ExecuteStatementRequest {
                        sql: inputs.require_text(Slot::SqlForExecution)?,
                        database_id: inputs.require_text(Slot::DatabaseId)?,
                    })
                    .await?;
                let (flag, payload) = result.to_slots();
                SlotMap::new()
                    .with(Slot::ExecutionFlag, flag)
                    .with(Slot::ExecutionRows, payload)
            }
        };
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_values_do_not_count() {
        let map = SlotMap::new()
            .with(Slot::Question, json!(""))
            .with(Slot::RuleGroups, json!([]))
            .with(Slot::SchemaText, Value::Null)
            .with(Slot::NumDemonstrations, json!(0))
            .with(Slot::DatabaseId, json!("db1"));
        assert!(!map.has_value(Slot::Question));
        assert!(!map.has_value(Slot::RuleGroups));
        assert!(!map.has_value(Slot::SchemaText));
        assert!(!map.has_value(Slot::Model));
        assert!(map.has_value(Slot::NumDemonstrations));
        assert!(map.has_value(Slot::DatabaseId));
    }

    #[test]
    fn typed_inputs() {
        let map = SlotMap::new()
            .with(Slot::RuleGroups, json!([1, 3, 4]))
            .with(Slot::NumDemonstrations, json!(5));
        let groups: Vec<u32> = map.require(Slot::RuleGroups).unwrap();
        assert_eq!(groups, vec![1, 3, 4]);
        let count: u32 = map.require(Slot::NumDemonstrations).unwrap();
        assert_eq!(count, 5);
        assert!(map.require::<u32>(Slot::RuleGroups).is_err());
    }

    #[test]
    fn serializes_with_slot_names() {
        let map = SlotMap::new().with(Slot::SqlForExecution, json!("SELECT 1"));
        assert_eq!(
            serde_json::to_value(&map).unwrap(),
            json!({"sql_for_execution": "SELECT 1"})
        );
    }
}
