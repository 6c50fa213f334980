use crate::shared::ids::validate_identifier_value;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

pub mod cache;

pub use cache::{CacheStats, SpecCache};

pub const DEFAULT_AGENT_TIMEOUT_SECS: u64 = 3600;
pub const DEFAULT_STEP_MAX_RETRIES: i64 = 2;

#[derive(Debug, thiserror::Error)]
pub enum SpecError {
    #[error("failed to read workflow spec {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse workflow spec {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("workflow spec `{workflow_id}` is invalid: {reason}")]
    Invalid { workflow_id: String, reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepType {
    Single,
    Loop,
}

impl Default for StepType {
    fn default() -> Self {
        Self::Single
    }
}

impl StepType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Single => "single",
            Self::Loop => "loop",
        }
    }

    pub fn parse(raw: &str) -> Result<Self, String> {
        match raw {
            "single" => Ok(Self::Single),
            "loop" => Ok(Self::Loop),
            other => Err(format!("unknown step type `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoopConfig {
    #[serde(default, alias = "verifyEach")]
    pub verify_each: bool,
    #[serde(default, alias = "verifyStep")]
    pub verify_step: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Thinking {
    Off,
    Minimal,
    Low,
    Medium,
    High,
}

impl Thinking {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Minimal => "minimal",
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: String,
    #[serde(default, alias = "timeoutSeconds")]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub thinking: Option<Thinking>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepSpecDef {
    pub id: String,
    pub agent: String,
    pub input: String,
    #[serde(default)]
    pub expects: Option<String>,
    #[serde(default, rename = "type")]
    pub step_type: StepType,
    #[serde(default, alias = "loopConfig")]
    pub loop_config: Option<LoopConfig>,
    #[serde(default)]
    pub max_retries: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub agents: Vec<AgentSpec>,
    pub steps: Vec<StepSpecDef>,
    /// Legacy alias for a workflow-wide worker timeout; consulted only when
    /// an agent omits `timeout_seconds`.
    #[serde(default, alias = "pollingTimeoutSeconds")]
    pub polling_timeout_seconds: Option<u64>,
}

impl WorkflowSpec {
    pub fn from_path(path: &Path) -> Result<Self, SpecError> {
        let raw = fs::read_to_string(path).map_err(|source| SpecError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let spec: WorkflowSpec = serde_yaml::from_str(&raw).map_err(|source| SpecError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        spec.validate()?;
        Ok(spec)
    }

    pub fn validate(&self) -> Result<(), SpecError> {
        let invalid = |reason: String| SpecError::Invalid {
            workflow_id: self.id.clone(),
            reason,
        };

        validate_identifier_value("workflow id", &self.id).map_err(invalid)?;
        if self.agents.is_empty() {
            return Err(invalid("workflow declares no agents".to_string()));
        }
        if self.steps.is_empty() {
            return Err(invalid("workflow declares no steps".to_string()));
        }
        for agent in &self.agents {
            validate_identifier_value("agent id", &agent.id).map_err(invalid)?;
        }
        for step in &self.steps {
            validate_identifier_value("step id", &step.id).map_err(invalid)?;
            if !self.agents.iter().any(|agent| agent.id == step.agent) {
                return Err(invalid(format!(
                    "step `{}` references undeclared agent `{}`",
                    step.id, step.agent
                )));
            }
            if let Some(config) = &step.loop_config {
                if step.step_type != StepType::Loop {
                    return Err(invalid(format!(
                        "step `{}` carries loop_config but is not a loop step",
                        step.id
                    )));
                }
                if let Some(verify_step) = &config.verify_step {
                    if !self.steps.iter().any(|other| &other.id == verify_step) {
                        return Err(invalid(format!(
                            "loop step `{}` names unknown verify step `{verify_step}`",
                            step.id
                        )));
                    }
                }
            }
        }
        let mut seen = std::collections::BTreeSet::new();
        for step in &self.steps {
            if !seen.insert(step.id.as_str()) {
                return Err(invalid(format!("duplicate step id `{}`", step.id)));
            }
        }
        Ok(())
    }

    /// The agent id workers and claims are keyed by: `<workflow>_<agent>`.
    pub fn scoped_agent_id(&self, agent: &str) -> String {
        format!("{}_{agent}", self.id)
    }

    pub fn agent_by_scoped_id(&self, scoped: &str) -> Option<&AgentSpec> {
        self.agents
            .iter()
            .find(|agent| self.scoped_agent_id(&agent.id) == scoped)
    }

    pub fn agent_timeout_secs(&self, agent: &AgentSpec) -> u64 {
        agent
            .timeout_seconds
            .or(self.polling_timeout_seconds)
            .unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS)
    }

    /// Longest declared agent timeout; the sweeper's abandonment horizon.
    pub fn max_agent_timeout_secs(&self) -> u64 {
        self.agents
            .iter()
            .map(|agent| self.agent_timeout_secs(agent))
            .max()
            .unwrap_or(DEFAULT_AGENT_TIMEOUT_SECS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_spec() -> WorkflowSpec {
        serde_yaml::from_str(
            r#"
id: feature
agents:
  - id: planner
  - id: coder
    timeout_seconds: 900
steps:
  - id: plan
    agent: planner
    input: "Plan: {{task}}"
  - id: implement
    agent: coder
    input: "Implement {{current_story}}"
    type: loop
    loop_config:
      verify_each: true
      verify_step: verify
  - id: verify
    agent: planner
    input: "Verify {{current_story_id}}"
"#,
        )
        .expect("spec parses")
    }

    #[test]
    fn sample_spec_validates_and_scopes_agents() {
        let spec = sample_spec();
        spec.validate().expect("valid");
        assert_eq!(spec.scoped_agent_id("coder"), "feature_coder");
        let agent = spec.agent_by_scoped_id("feature_coder").expect("agent");
        assert_eq!(spec.agent_timeout_secs(agent), 900);
        assert_eq!(spec.max_agent_timeout_secs(), 3600);
    }

    #[test]
    fn verify_step_must_exist() {
        let mut spec = sample_spec();
        spec.steps.retain(|step| step.id != "verify");
        let err = spec.validate().expect_err("invalid");
        assert!(err.to_string().contains("unknown verify step"));
    }

    #[test]
    fn workflow_level_timeout_is_a_fallback_only() {
        let mut spec = sample_spec();
        spec.polling_timeout_seconds = Some(120);
        let planner = spec.agents[0].clone();
        let coder = spec.agents[1].clone();
        assert_eq!(spec.agent_timeout_secs(&planner), 120);
        assert_eq!(spec.agent_timeout_secs(&coder), 900);
    }
}
