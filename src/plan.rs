//! Turns activation flags into the ordered list of stages for one run.

use crate::agent::{Activation, AgentDescriptor, AgentName};

/// Order in which stages run when active. Routing comes first because the
/// loader fetches the schema of whatever database routing picked.
const EXECUTION_ORDER: [AgentName; 6] = [
    AgentName::DatabaseRouting,
    AgentName::DataLoader,
    AgentName::DemonstrationSelection,
    AgentName::PromptConstruction,
    AgentName::ErrorCorrection,
    AgentName::SqlExecution,
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PipelinePlan {
    stages: Vec<&'static AgentDescriptor>,
}

impl PipelinePlan {
    pub fn build(activation: &Activation) -> Self {
        let stages = EXECUTION_ORDER
            .iter()
            .filter(|agent| activation.is_active(**agent))
            .map(|agent| agent.descriptor())
            .collect();
        Self { stages }
    }

    pub fn stages(&self) -> &[&'static AgentDescriptor] {
        &self.stages
    }

    pub fn names(&self) -> Vec<AgentName> {
        self.stages.iter().map(|d| d.name).collect()
    }

    pub fn contains(&self, agent: AgentName) -> bool {
        self.stages.iter().any(|d| d.name == agent)
    }

    pub fn position(&self, agent: AgentName) -> Option<usize> {
        self.stages.iter().position(|d| d.name == agent)
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPTIONAL: [AgentName; 4] = [
        AgentName::DatabaseRouting,
        AgentName::DemonstrationSelection,
        AgentName::ErrorCorrection,
        AgentName::SqlExecution,
    ];

    fn every_activation() -> Vec<Activation> {
        (0u8..16)
            .map(|mask| {
                let flags = OPTIONAL
                    .iter()
                    .enumerate()
                    .map(|(bit, agent)| (*agent, mask & (1 << bit) != 0));
                Activation::from_flags(flags).unwrap()
            })
            .collect()
    }

    #[test]
    fn mandatory_only_plan() {
        let plan = PipelinePlan::build(&Activation::mandatory());
        assert_eq!(
            plan.names(),
            vec![AgentName::DataLoader, AgentName::PromptConstruction]
        );
    }

    #[test]
    fn full_plan_order() {
        let plan = PipelinePlan::build(&Activation::all());
        assert_eq!(plan.names(), EXECUTION_ORDER.to_vec());
    }

    #[test]
    fn mandatory_stages_always_present() {
        for activation in every_activation() {
            let plan = PipelinePlan::build(&activation);
            assert!(plan.contains(AgentName::DataLoader));
            assert!(plan.contains(AgentName::PromptConstruction));
        }
    }

    #[test]
    fn ordering_rules_hold_for_every_activation() {
        for activation in every_activation() {
            let plan = PipelinePlan::build(&activation);
            let prompt = plan.position(AgentName::PromptConstruction).unwrap();

            if let Some(demo) = plan.position(AgentName::DemonstrationSelection) {
                assert!(demo < prompt);
            }
            if let Some(correction) = plan.position(AgentName::ErrorCorrection) {
                assert!(correction > prompt);
            }
            if let Some(exec) = plan.position(AgentName::SqlExecution) {
                assert_eq!(exec, plan.len() - 1);
            }
            if let Some(routing) = plan.position(AgentName::DatabaseRouting) {
                assert!(routing < plan.position(AgentName::DataLoader).unwrap());
            }
        }
    }

    #[test]
    fn inactive_stages_are_left_out() {
        let activation = Activation::mandatory().with(AgentName::SqlExecution);
        let plan = PipelinePlan::build(&activation);
        assert_eq!(plan.len(), 3);
        assert!(!plan.contains(AgentName::ErrorCorrection));
        assert!(!plan.contains(AgentName::DatabaseRouting));
    }
}
