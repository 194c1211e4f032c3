//! Invokes one stage at a time per agent.
//!
//! Each agent has an in-flight flag. An invocation claims it with a
//! compare-exchange and releases it on drop, so a second request for the same
//! agent is refused instead of queued, including across a pipeline run and a
//! standalone action.

use crate::agent::{AgentDescriptor, AgentName};
use crate::backend::AgentBackend;
use crate::error::Error;
use crate::stage::{BackendStage, SlotMap, Stage};
use crate::Result;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn, Instrument};

struct FlightGuard<'a> {
    flag: &'a AtomicBool,
}

impl Drop for FlightGuard<'_> {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}

pub struct StageExecutor {
    stages: HashMap<AgentName, Arc<dyn Stage>>,
    in_flight: HashMap<AgentName, AtomicBool>,
}

impl Default for StageExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl StageExecutor {
    pub fn new() -> Self {
        Self {
            stages: HashMap::new(),
            in_flight: AgentName::ALL
                .iter()
                .map(|agent| (*agent, AtomicBool::new(false)))
                .collect(),
        }
    }

    /// Executor with one [`BackendStage`] per agent.
    pub fn from_backend(backend: Arc<dyn AgentBackend>, timeout: Option<Duration>) -> Self {
        let mut executor = Self::new();
        for stage in BackendStage::all(backend, timeout) {
            executor.stages.insert(stage.agent(), stage);
        }
        executor
    }

    pub fn register_stages(&mut self, stages: Vec<Arc<dyn Stage>>) -> Result<()> {
        for stage in stages {
            let agent = stage.agent();
            if self.stages.contains_key(&agent) {
                warn!("Attempt to register an existing stage: {}", agent);
                return Err(Error::StageAlreadyRegistered(agent));
            }
            debug!("Register stage {}, timeout={:?}", agent, stage.timeout());
            self.stages.insert(agent, stage);
        }
        Ok(())
    }

    pub fn is_in_flight(&self, agent: AgentName) -> bool {
        self.in_flight
            .get(&agent)
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Some agent with a call outstanding, if any.
    pub fn in_flight_agent(&self) -> Option<AgentName> {
        AgentName::ALL
            .iter()
            .copied()
            .find(|agent| self.is_in_flight(*agent))
    }

    fn claim(&self, agent: AgentName) -> Result<FlightGuard<'_>> {
        let flag = self
            .in_flight
            .get(&agent)
            .ok_or(Error::StageNotFound(agent))?;
        flag.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .map_err(|_| {
                warn!("Rejected second invocation of {} while one is in flight", agent);
                Error::AlreadyRunning(agent.to_string())
            })?;
        Ok(FlightGuard { flag })
    }

    /// Checks the input contract, claims the agent's flight slot and runs
    /// the stage. Nothing is called out to when inputs are missing or the
    /// agent is busy.
    pub async fn invoke(&self, descriptor: &AgentDescriptor, inputs: SlotMap) -> Result<SlotMap> {
        let agent = descriptor.name;
        if let Some(slot) = descriptor
            .required_inputs()
            .find(|slot| !inputs.has_value(*slot))
        {
            error!("{} missing required input {}", agent, slot);
            return Err(Error::MissingInput { agent, slot });
        }

        let stage = self
            .stages
            .get(&agent)
            .cloned()
            .ok_or(Error::StageNotFound(agent))?;
        let _guard = self.claim(agent)?;

        let span = tracing::debug_span!("stage", agent = %agent);
        async move {
            debug!("dispatch with inputs {:?}", inputs.slots().collect::<Vec<_>>());
            let result = stage.run(&inputs).await;
            match &result {
                Ok(_) => debug!("completed"),
                Err(e) => error!("failed: {}", e),
            }
            result
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::Slot;
    use crate::error::StageCause;
    use crate::testing::MockBackend;
    use serde_json::json;

    /// Answers every call with the same outputs.
    struct FixedStage {
        agent: AgentName,
        outputs: SlotMap,
    }

    #[async_trait::async_trait]
    impl Stage for FixedStage {
        fn agent(&self) -> AgentName {
            self.agent
        }

        fn timeout(&self) -> Option<Duration> {
            None
        }

        async fn process(&self, _inputs: &SlotMap) -> anyhow::Result<SlotMap> {
            Ok(self.outputs.clone())
        }
    }

    fn fixed(agent: AgentName, outputs: SlotMap) -> StageExecutor {
        let mut executor = StageExecutor::new();
        executor
            .register_stages(vec![Arc::new(FixedStage { agent, outputs }) as Arc<dyn Stage>])
            .unwrap();
        executor
    }

    fn execution_inputs() -> SlotMap {
        SlotMap::new()
            .with(Slot::SqlForExecution, json!("SELECT 1"))
            .with(Slot::DatabaseId, json!("db1"))
    }

    fn prompt_inputs() -> SlotMap {
        SlotMap::new()
            .with(Slot::Question, json!("how many singers?"))
            .with(Slot::PromptTemplate, json!("option_1"))
            .with(Slot::Model, json!("gpt-4"))
    }

    #[tokio::test]
    async fn missing_input_never_reaches_backend() {
        let backend = Arc::new(MockBackend::new());
        let executor = StageExecutor::from_backend(backend.clone(), None);
        let inputs = SlotMap::new()
            .with(Slot::Question, json!(""))
            .with(Slot::PromptTemplate, json!("option_1"))
            .with(Slot::Model, json!("gpt-4"));

        let err = executor
            .invoke(AgentName::PromptConstruction.descriptor(), inputs)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::MissingInput {
                agent: AgentName::PromptConstruction,
                slot: Slot::Question
            }
        ));
        assert_eq!(backend.call_count(AgentName::PromptConstruction), 0);
    }

    #[tokio::test]
    async fn optional_inputs_may_be_empty() {
        let backend = Arc::new(MockBackend::new().with_generated_sql("SELECT 1"));
        let executor = StageExecutor::from_backend(backend.clone(), None);
        let outputs = executor
            .invoke(
                AgentName::PromptConstruction.descriptor(),
                prompt_inputs().with(Slot::SchemaText, json!("")),
            )
            .await
            .unwrap();
        assert_eq!(outputs.text(Slot::GeneratedSql), Some("SELECT 1"));
        assert_eq!(backend.prompt_requests()[0].schema_text, None);
    }

    #[tokio::test]
    async fn second_invocation_in_flight_is_rejected() {
        let (backend, gate) = MockBackend::new().gated(AgentName::PromptConstruction);
        let backend = Arc::new(backend);
        let executor = Arc::new(StageExecutor::from_backend(backend.clone(), None));

        let first = tokio::spawn({
            let executor = executor.clone();
            async move {
                executor
                    .invoke(AgentName::PromptConstruction.descriptor(), prompt_inputs())
                    .await
            }
        });
        gate.entered.notified().await;
        assert!(executor.is_in_flight(AgentName::PromptConstruction));

        let err = executor
            .invoke(AgentName::PromptConstruction.descriptor(), prompt_inputs())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::AlreadyRunning(_)));
        assert_eq!(backend.call_count(AgentName::PromptConstruction), 1);

        gate.release.notify_one();
        first.await.unwrap().unwrap();
        assert!(!executor.is_in_flight(AgentName::PromptConstruction));

        // the slot is free again once the first call finished
        gate.release.notify_one();
        executor
            .invoke(AgentName::PromptConstruction.descriptor(), prompt_inputs())
            .await
            .unwrap();
        assert_eq!(backend.call_count(AgentName::PromptConstruction), 2);
    }

    #[tokio::test]
    async fn other_agents_are_not_blocked() {
        let (backend, gate) = MockBackend::new().gated(AgentName::PromptConstruction);
        let backend = Arc::new(backend);
        let executor = Arc::new(StageExecutor::from_backend(backend.clone(), None));

        let first = tokio::spawn({
            let executor = executor.clone();
            async move {
                executor
                    .invoke(AgentName::PromptConstruction.descriptor(), prompt_inputs())
                    .await
            }
        });
        gate.entered.notified().await;

        executor
            .invoke(
                AgentName::DatabaseRouting.descriptor(),
                SlotMap::new().with(Slot::Question, json!("q")),
            )
            .await
            .unwrap();

        gate.release.notify_one();
        first.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn backend_failure_becomes_stage_error() {
        let backend = Arc::new(MockBackend::new().failing(AgentName::DataLoader, "connection refused"));
        let executor = StageExecutor::from_backend(backend, None);
        let err = executor
            .invoke(
                AgentName::DataLoader.descriptor(),
                SlotMap::new().with(Slot::DatabaseId, json!("db1")),
            )
            .await
            .unwrap_err();
        match err {
            Error::Stage { agent, cause } => {
                assert_eq!(agent, AgentName::DataLoader);
                assert!(matches!(cause, StageCause::Backend(msg) if msg.contains("connection refused")));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!executor.is_in_flight(AgentName::DataLoader));
    }

    #[tokio::test]
    async fn stuck_call_times_out() {
        let (backend, _gate) = MockBackend::new().gated(AgentName::DataLoader);
        let executor =
            StageExecutor::from_backend(Arc::new(backend), Some(Duration::from_millis(20)));
        let err = executor
            .invoke(
                AgentName::DataLoader.descriptor(),
                SlotMap::new().with(Slot::DatabaseId, json!("db1")),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Stage {
                cause: StageCause::Timeout(_),
                ..
            }
        ));
        assert!(!executor.is_in_flight(AgentName::DataLoader));
    }

    #[test]
    fn duplicate_registration_is_refused() {
        let backend: Arc<dyn AgentBackend> = Arc::new(MockBackend::new());
        let mut executor = StageExecutor::new();
        executor
            .register_stages(vec![Arc::new(BackendStage::new(
                AgentName::DataLoader,
                backend.clone(),
                None,
            )) as Arc<dyn Stage>])
            .unwrap();
        let err = executor
            .register_stages(vec![Arc::new(BackendStage::new(
                AgentName::DataLoader,
                backend,
                None,
            )) as Arc<dyn Stage>])
            .unwrap_err();
        assert!(matches!(err, Error::StageAlreadyRegistered(AgentName::DataLoader)));
    }

    #[tokio::test]
    async fn missing_declared_output_is_malformed() {
        let executor = fixed(AgentName::DataLoader, SlotMap::new());
        let err = executor
            .invoke(
                AgentName::DataLoader.descriptor(),
                SlotMap::new().with(Slot::DatabaseId, json!("db1")),
            )
            .await
            .unwrap_err();
        match err {
            Error::Stage { agent, cause } => {
                assert_eq!(agent, AgentName::DataLoader);
                assert!(matches!(cause, StageCause::MalformedOutput(msg) if msg.contains("schema_text")));
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!executor.is_in_flight(AgentName::DataLoader));
    }

    #[tokio::test]
    async fn unknown_execution_flag_is_malformed() {
        let executor = fixed(
            AgentName::SqlExecution,
            SlotMap::new()
                .with(Slot::ExecutionFlag, json!("maybe"))
                .with(Slot::ExecutionRows, json!([])),
        );
        let err = executor
            .invoke(AgentName::SqlExecution.descriptor(), execution_inputs())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Stage {
                agent: AgentName::SqlExecution,
                cause: StageCause::MalformedOutput(_),
            }
        ));
    }

    #[tokio::test]
    async fn execution_error_payload_is_not_a_stage_failure() {
        let executor = fixed(
            AgentName::SqlExecution,
            SlotMap::new()
                .with(Slot::ExecutionFlag, json!("error"))
                .with(Slot::ExecutionRows, json!("no such table: t")),
        );
        let outputs = executor
            .invoke(AgentName::SqlExecution.descriptor(), execution_inputs())
            .await
            .unwrap();
        assert_eq!(outputs.text(Slot::ExecutionFlag), Some("error"));
    }

    #[tokio::test]
    async fn reports_which_agent_is_in_flight() {
        let (backend, gate) = MockBackend::new().gated(AgentName::DataLoader);
        let executor = Arc::new(StageExecutor::from_backend(Arc::new(backend), None));
        assert_eq!(executor.in_flight_agent(), None);

        let call = tokio::spawn({
            let executor = executor.clone();
            async move {
                executor
                    .invoke(
                        AgentName::DataLoader.descriptor(),
                        SlotMap::new().with(Slot::DatabaseId, json!("db1")),
                    )
                    .await
            }
        });
        gate.entered.notified().await;
        assert_eq!(executor.in_flight_agent(), Some(AgentName::DataLoader));

        gate.release.notify_one();
        call.await.unwrap().unwrap();
        assert_eq!(executor.in_flight_agent(), None);
    }

    #[tokio::test]
    async fn unregistered_stage_is_reported() {
        let executor = StageExecutor::new();
        let err = executor
            .invoke(
                AgentName::DataLoader.descriptor(),
                SlotMap::new().with(Slot::DatabaseId, json!("db1")),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::StageNotFound(AgentName::DataLoader)));
    }
}
