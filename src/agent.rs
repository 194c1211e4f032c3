use crate::error::Error;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The fixed set of agents a pipeline can be assembled from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentName {
    DataLoader,
    DatabaseRouting,
    DemonstrationSelection,
    PromptConstruction,
    ErrorCorrection,
    SqlExecution,
}

impl AgentName {
    pub const ALL: [AgentName; 6] = [
        AgentName::DataLoader,
        AgentName::DatabaseRouting,
        AgentName::DemonstrationSelection,
        AgentName::PromptConstruction,
        AgentName::ErrorCorrection,
        AgentName::SqlExecution,
    ];

    pub fn descriptor(self) -> &'static AgentDescriptor {
        // DESCRIPTORS is indexed in the same order as the enum
        &DESCRIPTORS[self as usize]
    }

    pub fn is_required(self) -> bool {
        self.descriptor().required
    }
}

impl fmt::Display for AgentName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AgentName::DataLoader => "Data Loader Agent",
            AgentName::DatabaseRouting => "Database Routing Agent",
            AgentName::DemonstrationSelection => "Demonstration Selection Agent",
            AgentName::PromptConstruction => "Prompt Construction Agent",
            AgentName::ErrorCorrection => "Error Correction Agent",
            AgentName::SqlExecution => "SQL Execution Agent",
        };
        f.write_str(name)
    }
}

/// Named input/output slots wired between stages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Slot {
    Question,
    DatabaseId,
    SchemaText,
    NumDemonstrations,
    DemonstrationText,
    PromptTemplate,
    Model,
    GeneratedPrompt,
    GeneratedSql,
    RuleGroups,
    CorrectionPrompt,
    CorrectedSql,
    SqlForExecution,
    ExecutionFlag,
    ExecutionRows,
}

impl fmt::Display for Slot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Slot::Question => "question",
            Slot::DatabaseId => "database_id",
            Slot::SchemaText => "schema_text",
            Slot::NumDemonstrations => "num_demonstrations",
            Slot::DemonstrationText => "demonstration_text",
            Slot::PromptTemplate => "prompt_template",
            Slot::Model => "model",
            Slot::GeneratedPrompt => "generated_prompt",
            Slot::GeneratedSql => "generated_sql",
            Slot::RuleGroups => "rule_groups",
            Slot::CorrectionPrompt => "correction_prompt",
            Slot::CorrectedSql => "corrected_sql",
            Slot::SqlForExecution => "sql_for_execution",
            Slot::ExecutionFlag => "execution_flag",
            Slot::ExecutionRows => "execution_rows",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputSlot {
    pub slot: Slot,
    pub required: bool,
}

const fn required(slot: Slot) -> InputSlot {
    InputSlot {
        slot,
        required: true,
    }
}

const fn optional(slot: Slot) -> InputSlot {
    InputSlot {
        slot,
        required: false,
    }
}

/// Static contract of one agent: whether it can be disabled, which slots it
/// reads and which it writes.
#[derive(Debug, PartialEq, Eq)]
pub struct AgentDescriptor {
    pub name: AgentName,
    pub required: bool,
    pub inputs: &'static [InputSlot],
    pub outputs: &'static [Slot],
}

impl AgentDescriptor {
    pub fn required_inputs(&self) -> impl Iterator<Item = Slot> + '_ {
        self.inputs.iter().filter(|i| i.required).map(|i| i.slot)
    }

    pub fn consumes(&self, slot: Slot) -> bool {
        self.inputs.iter().any(|i| i.slot == slot)
    }

    pub fn produces(&self, slot: Slot) -> bool {
        self.outputs.contains(&slot)
    }
}

pub static DESCRIPTORS: [AgentDescriptor; 6] = [
    AgentDescriptor {
        name: AgentName::DataLoader,
        required: true,
        inputs: &[required(Slot::DatabaseId)],
        outputs: &[Slot::SchemaText],
    },
    AgentDescriptor {
        name: AgentName::DatabaseRouting,
        required: false,
        inputs: &[required(Slot::Question)],
        outputs: &[Slot::DatabaseId],
    },
    AgentDescriptor {
        name: AgentName::DemonstrationSelection,
        required: false,
        inputs: &[required(Slot::Question), required(Slot::NumDemonstrations)],
        outputs: &[Slot::DemonstrationText],
    },
    AgentDescriptor {
        name: AgentName::PromptConstruction,
        required: true,
        inputs: &[
            required(Slot::Question),
            optional(Slot::SchemaText),
            optional(Slot::DemonstrationText),
            required(Slot::PromptTemplate),
            required(Slot::Model),
        ],
        outputs: &[Slot::GeneratedPrompt, Slot::GeneratedSql],
    },
    AgentDescriptor {
        name: AgentName::ErrorCorrection,
        required: false,
        inputs: &[
            required(Slot::Question),
            required(Slot::GeneratedSql),
            optional(Slot::SchemaText),
            required(Slot::RuleGroups),
            required(Slot::Model),
        ],
        outputs: &[Slot::CorrectionPrompt, Slot::CorrectedSql],
    },
    AgentDescriptor {
        name: AgentName::SqlExecution,
        required: false,
        inputs: &[required(Slot::SqlForExecution), required(Slot::DatabaseId)],
        outputs: &[Slot::ExecutionFlag, Slot::ExecutionRows],
    },
];

/// Per-run activation flags. Mandatory agents are always active.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Activation {
    flags: BTreeMap<AgentName, bool>,
}

impl Default for Activation {
    fn default() -> Self {
        Self {
            flags: AgentName::ALL
                .iter()
                .map(|agent| (*agent, agent.is_required()))
                .collect(),
        }
    }
}

impl Activation {
    /// Only the mandatory agents.
    pub fn mandatory() -> Self {
        Self::default()
    }

    /// Every agent switched on.
    pub fn all() -> Self {
        Self {
            flags: AgentName::ALL.iter().map(|agent| (*agent, true)).collect(),
        }
    }

    pub fn from_flags<I>(flags: I) -> Result<Self>
    where
        I: IntoIterator<Item = (AgentName, bool)>,
    {
        let mut activation = Self::default();
        for (agent, active) in flags {
            activation.set(agent, active)?;
        }
        Ok(activation)
    }

    pub fn with(mut self, agent: AgentName) -> Self {
        self.flags.insert(agent, true);
        self
    }

    pub fn set(&mut self, agent: AgentName, active: bool) -> Result<()> {
        if !active && agent.is_required() {
            return Err(Error::Configuration(format!(
                "{} is required and cannot be disabled",
                agent
            )));
        }
        self.flags.insert(agent, active);
        Ok(())
    }

    pub fn is_active(&self, agent: AgentName) -> bool {
        agent.is_required() || self.flags.get(&agent).copied().unwrap_or(false)
    }

    pub fn active_agents(&self) -> Vec<AgentName> {
        AgentName::ALL
            .iter()
            .copied()
            .filter(|agent| self.is_active(*agent))
            .collect()
    }
}

/// Execution status of a single stage within the current run.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Running,
    Completed,
    Failed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn descriptors_line_up_with_names() {
        for agent in AgentName::ALL {
            assert_eq!(agent.descriptor().name, agent);
        }
    }

    #[test]
    fn only_loader_and_prompt_construction_are_mandatory() {
        let mandatory: Vec<_> = AgentName::ALL
            .into_iter()
            .filter(|a| a.is_required())
            .collect();
        assert_eq!(
            mandatory,
            vec![AgentName::DataLoader, AgentName::PromptConstruction]
        );
    }

    #[test]
    fn default_activation_enables_mandatory_agents_only() {
        let activation = Activation::default();
        assert_eq!(
            activation.active_agents(),
            vec![AgentName::DataLoader, AgentName::PromptConstruction]
        );
    }

    #[test]
    fn mandatory_agent_cannot_be_disabled() {
        let mut activation = Activation::default();
        let err = activation
            .set(AgentName::PromptConstruction, false)
            .unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
        assert!(activation.is_active(AgentName::PromptConstruction));

        let err = Activation::from_flags([(AgentName::DataLoader, false)]).unwrap_err();
        assert!(matches!(err, Error::Configuration(_)));
    }

    #[test]
    fn optional_agents_toggle() {
        let mut activation = Activation::default();
        activation.set(AgentName::ErrorCorrection, true).unwrap();
        assert!(activation.is_active(AgentName::ErrorCorrection));
        activation.set(AgentName::ErrorCorrection, false).unwrap();
        assert!(!activation.is_active(AgentName::ErrorCorrection));
    }

    #[test]
    fn error_correction_consumes_generated_sql() {
        let desc = AgentName::ErrorCorrection.descriptor();
        assert!(desc.consumes(Slot::GeneratedSql));
        assert!(desc.required_inputs().any(|s| s == Slot::GeneratedSql));
        assert!(!desc.required_inputs().any(|s| s == Slot::SchemaText));
        assert!(desc.produces(Slot::CorrectedSql));
    }

    #[test]
    fn display_uses_human_names() {
        assert_eq!(AgentName::SqlExecution.to_string(), "SQL Execution Agent");
        assert_eq!(Slot::SqlForExecution.to_string(), "sql_for_execution");
    }
}
