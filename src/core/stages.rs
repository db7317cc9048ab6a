//! Stage graph definitions and loading.
//!
//! A graph is a fixed partial order of named stages: ordered groups whose
//! members execute concurrently, joined at a barrier before the next group.
//! Graphs are defined in YAML or built in code; the default filing pipeline
//! covers acquisition, parallel analysis/market-data, scoring, and an
//! approval-gated trade stage.

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use super::retry::RetryPolicy;

/// A complete stage graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageGraph {
    /// Graph name (used in CLI output)
    pub name: String,

    /// Human-readable description
    pub description: String,

    /// Ordered groups; members of one group run concurrently
    pub groups: Vec<StageGroup>,
}

/// A group of stages that execute concurrently and join at a barrier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageGroup {
    /// Stages in this group
    pub stages: Vec<StageDef>,

    /// What a member failure does to the run
    #[serde(default)]
    pub on_failure: FailurePolicy,
}

/// Partial-failure policy for a concurrent group
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailurePolicy {
    /// Any member failure fails the whole run (the default: downstream
    /// stages consume every member's result)
    Strict,

    /// Continue with whatever succeeded
    BestEffort,
}

impl Default for FailurePolicy {
    fn default() -> Self {
        Self::Strict
    }
}

/// A single stage definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageDef {
    /// Stage name (unique within the graph)
    pub name: String,

    /// Executor identity that runs this stage
    pub executor: String,

    /// Where the stage's input payload is assembled from
    #[serde(default)]
    pub inputs: Vec<InputSource>,

    /// Override the per-stage timeout (falls back to the configured default)
    pub timeout_seconds: Option<u64>,

    /// Whether this stage needs a human decision before it executes.
    /// A property of the stage definition, not of any stage's output.
    #[serde(default)]
    pub requires_approval: bool,

    /// Gate: only execute when an earlier stage's payload matches
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_if: Option<Condition>,

    /// Per-stage retry override (falls back to the shared policy)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,
}

impl StageDef {
    /// Effective timeout for this stage
    pub fn timeout(&self, default: Duration) -> Duration {
        self.timeout_seconds
            .map(Duration::from_secs)
            .unwrap_or(default)
    }
}

/// Source of a stage's input payload
///
/// Supports two YAML forms:
/// - Simple: `inputs: [work_item]`
/// - Stage reference: `inputs: [{stage: analyze}]`
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InputSource {
    /// The work item's original payload (the string "work_item")
    WorkItem(WorkItemMarker),

    /// Output of an earlier stage
    Stage { stage: String },
}

/// Marker for work_item (deserializes from the string "work_item")
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkItemMarker {
    WorkItem,
}

/// Gate condition on an earlier stage's payload: a top-level string field
/// must equal one of the listed values
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Condition {
    /// Stage whose payload is inspected
    pub stage: String,

    /// Top-level field name in that payload
    pub field: String,

    /// Accepted values
    pub equals_any: Vec<String>,
}

impl Condition {
    /// Evaluate against a stage payload
    pub fn matches(&self, payload: &serde_json::Value) -> bool {
        payload
            .get(&self.field)
            .and_then(|v| v.as_str())
            .map(|v| self.equals_any.iter().any(|a| a == v))
            .unwrap_or(false)
    }
}

impl StageGraph {
    /// Load a graph from a YAML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read stage graph file: {}", path.display()))?;

        Self::from_yaml(&content)
    }

    /// Parse a graph from YAML content
    pub fn from_yaml(content: &str) -> Result<Self> {
        let graph: Self = serde_yaml::from_str(content).context("Failed to parse stage graph YAML")?;
        graph.validate()?;
        Ok(graph)
    }

    /// Validate the graph definition
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            anyhow::bail!("Stage graph name cannot be empty");
        }
        if self.groups.is_empty() {
            anyhow::bail!("Stage graph must have at least one group");
        }

        let mut seen: Vec<&str> = Vec::new();

        for (gi, group) in self.groups.iter().enumerate() {
            if group.stages.is_empty() {
                anyhow::bail!("Group {} has no stages", gi);
            }

            for stage in &group.stages {
                if stage.name.is_empty() {
                    anyhow::bail!("Group {} contains a stage with an empty name", gi);
                }
                if seen.contains(&stage.name.as_str()) {
                    anyhow::bail!("Duplicate stage name '{}'", stage.name);
                }

                if stage.requires_approval && group.stages.len() > 1 {
                    anyhow::bail!(
                        "Approval-gated stage '{}' must be the sole member of its group",
                        stage.name
                    );
                }

                // Input and gate references must point at earlier groups
                for input in &stage.inputs {
                    if let InputSource::Stage { stage: referenced } = input {
                        if !seen.contains(&referenced.as_str()) {
                            anyhow::bail!(
                                "Stage '{}' references '{}' which is not an earlier stage",
                                stage.name,
                                referenced
                            );
                        }
                    }
                }
                if let Some(condition) = &stage.run_if {
                    if !seen.contains(&condition.stage.as_str()) {
                        anyhow::bail!(
                            "Stage '{}' gates on '{}' which is not an earlier stage",
                            stage.name,
                            condition.stage
                        );
                    }
                }
            }

            // Members of one group must not reference one another, so earlier
            // names only become visible once the whole group is walked
            for stage in &group.stages {
                seen.push(stage.name.as_str());
            }
        }

        Ok(())
    }

    /// Get a stage definition by name
    pub fn stage(&self, name: &str) -> Option<&StageDef> {
        self.groups
            .iter()
            .flat_map(|g| g.stages.iter())
            .find(|s| s.name == name)
    }

    /// Index of the group containing a stage
    pub fn group_of(&self, name: &str) -> Option<usize> {
        self.groups
            .iter()
            .position(|g| g.stages.iter().any(|s| s.name == name))
    }

    /// Iterate all stages in declared order
    pub fn iter_stages(&self) -> impl Iterator<Item = &StageDef> {
        self.groups.iter().flat_map(|g| g.stages.iter())
    }
}

/// The default filing pipeline: acquire → [analyze ∥ marketdata] → score →
/// trade (approval-gated, BUY-class recommendations only)
pub fn default_filing_graph() -> StageGraph {
    fn work_item() -> InputSource {
        InputSource::WorkItem(WorkItemMarker::WorkItem)
    }
    fn from_stage(name: &str) -> InputSource {
        InputSource::Stage {
            stage: name.to_string(),
        }
    }

    StageGraph {
        name: "filing".to_string(),
        description: "Regulatory filing to vetted trade action".to_string(),
        groups: vec![
            StageGroup {
                stages: vec![StageDef {
                    name: "acquire".to_string(),
                    executor: "scraper".to_string(),
                    inputs: vec![work_item()],
                    timeout_seconds: None,
                    requires_approval: false,
                    run_if: None,
                    retry: None,
                }],
                on_failure: FailurePolicy::Strict,
            },
            StageGroup {
                stages: vec![
                    StageDef {
                        name: "analyze".to_string(),
                        executor: "analyzer".to_string(),
                        inputs: vec![work_item(), from_stage("acquire")],
                        timeout_seconds: None,
                        requires_approval: false,
                        run_if: None,
                        retry: None,
                    },
                    StageDef {
                        name: "marketdata".to_string(),
                        executor: "marketdata".to_string(),
                        inputs: vec![work_item()],
                        timeout_seconds: None,
                        requires_approval: false,
                        run_if: None,
                        retry: None,
                    },
                ],
                on_failure: FailurePolicy::Strict,
            },
            StageGroup {
                stages: vec![StageDef {
                    name: "score".to_string(),
                    executor: "evaluator".to_string(),
                    inputs: vec![
                        work_item(),
                        from_stage("analyze"),
                        from_stage("marketdata"),
                    ],
                    timeout_seconds: None,
                    requires_approval: false,
                    run_if: None,
                    retry: None,
                }],
                on_failure: FailurePolicy::Strict,
            },
            StageGroup {
                stages: vec![StageDef {
                    name: "trade".to_string(),
                    executor: "trader".to_string(),
                    inputs: vec![
                        work_item(),
                        from_stage("score"),
                        from_stage("marketdata"),
                    ],
                    timeout_seconds: None,
                    requires_approval: true,
                    run_if: Some(Condition {
                        stage: "score".to_string(),
                        field: "recommendation".to_string(),
                        equals_any: vec!["BUY".to_string(), "SPECULATIVE BUY".to_string()],
                    }),
                    retry: None,
                }],
                on_failure: FailurePolicy::Strict,
            },
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_GRAPH_YAML: &str = r#"
name: test
description: Test graph

groups:
  - stages:
      - name: first
        executor: alpha
        inputs: [work_item]

  - on_failure: strict
    stages:
      - name: left
        executor: beta
        inputs: [{stage: first}]
      - name: right
        executor: gamma
        inputs: [work_item]

  - stages:
      - name: last
        executor: delta
        inputs: [{stage: left}, {stage: right}]
        requires_approval: true
"#;

    #[test]
    fn test_graph_parsing() {
        let graph = StageGraph::from_yaml(TEST_GRAPH_YAML).unwrap();

        assert_eq!(graph.name, "test");
        assert_eq!(graph.groups.len(), 3);
        assert_eq!(graph.groups[1].stages.len(), 2);
        assert!(graph.stage("last").unwrap().requires_approval);
        assert_eq!(graph.group_of("right"), Some(1));
    }

    #[test]
    fn test_forward_reference_rejected() {
        let yaml = r#"
name: invalid
description: Forward reference
groups:
  - stages:
      - name: first
        executor: alpha
        inputs: [{stage: later}]
  - stages:
      - name: later
        executor: beta
"#;
        assert!(StageGraph::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_same_group_reference_rejected() {
        let yaml = r#"
name: invalid
description: Sibling reference
groups:
  - stages:
      - name: a
        executor: alpha
      - name: b
        executor: beta
        inputs: [{stage: a}]
"#;
        assert!(StageGraph::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_approval_stage_must_be_alone() {
        let yaml = r#"
name: invalid
description: Gated stage sharing a group
groups:
  - stages:
      - name: a
        executor: alpha
      - name: b
        executor: beta
        requires_approval: true
"#;
        assert!(StageGraph::from_yaml(yaml).is_err());
    }

    #[test]
    fn test_default_filing_graph_is_valid() {
        let graph = default_filing_graph();
        assert!(graph.validate().is_ok());

        // analyze and marketdata share the concurrent group
        assert_eq!(graph.group_of("analyze"), graph.group_of("marketdata"));
        // trade is approval-gated and BUY-gated
        let trade = graph.stage("trade").unwrap();
        assert!(trade.requires_approval);
        assert!(trade.run_if.is_some());
    }

    #[test]
    fn test_condition_matching() {
        let condition = Condition {
            stage: "score".to_string(),
            field: "recommendation".to_string(),
            equals_any: vec!["BUY".to_string(), "SPECULATIVE BUY".to_string()],
        };

        assert!(condition.matches(&serde_json::json!({"recommendation": "BUY"})));
        assert!(condition.matches(&serde_json::json!({"recommendation": "SPECULATIVE BUY"})));
        assert!(!condition.matches(&serde_json::json!({"recommendation": "HOLD"})));
        assert!(!condition.matches(&serde_json::json!({})));
        assert!(!condition.matches(&serde_json::json!({"recommendation": 1})));
    }

    #[test]
    fn test_stage_timeout_fallback() {
        let graph = StageGraph::from_yaml(TEST_GRAPH_YAML).unwrap();
        let default = Duration::from_secs(120);

        assert_eq!(graph.stage("first").unwrap().timeout(default), default);
    }
}
