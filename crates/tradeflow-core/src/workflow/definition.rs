//! Workflow definition files.
//!
//! A definition is a YAML document describing one workflow and its steps.
//! Steps reference each other by *name*; names are resolved to step IDs when
//! the definition is turned into records, and the result is validated with
//! [`validate_steps`] before anything is persisted.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tradeflow_types::workflow::{
    StepCondition, StepConfig, StepKind, Workflow, WorkflowStatus, WorkflowStep,
};
use uuid::Uuid;

use super::dag::validate_steps;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors raised while parsing or validating a workflow definition.
#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("validation error: {0}")]
    Invalid(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("duplicate step name: '{0}'")]
    DuplicateStep(String),

    #[error("step '{step}' depends on unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("dependency cycle detected involving step '{0}'")]
    CycleDetected(String),

    #[error("step '{step}' can never see '{dependency}' complete: {reason}")]
    UnsatisfiableDependency {
        step: String,
        dependency: String,
        reason: String,
    },
}

// ---------------------------------------------------------------------------
// File format
// ---------------------------------------------------------------------------

/// On-disk shape of a workflow definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowFile {
    pub code: String,
    pub name: String,
    #[serde(default)]
    pub workflow_type: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default = "default_status")]
    pub status: WorkflowStatus,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_retry_delay")]
    pub retry_delay_seconds: u64,
    #[serde(default = "default_timeout_minutes")]
    pub timeout_minutes: u32,
    pub steps: Vec<StepFile>,
}

/// On-disk shape of one step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepFile {
    pub name: String,
    #[serde(rename = "type")]
    pub step_type: StepKind,
    /// Defaults to the step's position (1-based) in the file.
    #[serde(default)]
    pub order: Option<i32>,
    #[serde(default)]
    pub config: StepConfig,
    #[serde(default)]
    pub optional: bool,
    #[serde(default = "default_true")]
    pub can_retry: bool,
    #[serde(default)]
    pub max_retries: u32,
    #[serde(default)]
    pub timeout_seconds: Option<u64>,
    #[serde(default)]
    pub condition: Option<StepCondition>,
    /// Setting a group marks the step as parallel-capable.
    #[serde(default)]
    pub parallel_group: Option<String>,
    #[serde(default)]
    pub depends_on: Vec<String>,
}

fn default_version() -> String {
    "1.0".to_string()
}

fn default_status() -> WorkflowStatus {
    WorkflowStatus::Active
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    60
}

fn default_timeout_minutes() -> u32 {
    60
}

fn default_true() -> bool {
    true
}

impl WorkflowFile {
    /// Check field-level rules that do not need step IDs.
    pub fn validate(&self) -> Result<(), DefinitionError> {
        if self.code.is_empty() {
            return Err(DefinitionError::Invalid("workflow code must not be empty".to_string()));
        }
        if !self
            .code
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-')
        {
            return Err(DefinitionError::Invalid(format!(
                "workflow code '{}' contains invalid characters (only a-z, 0-9, '_' and '-' allowed)",
                self.code
            )));
        }
        if self.name.trim().is_empty() {
            return Err(DefinitionError::Invalid("workflow name must not be empty".to_string()));
        }
        if self.steps.is_empty() {
            return Err(DefinitionError::Invalid(
                "workflow must have at least one step".to_string(),
            ));
        }
        for step in &self.steps {
            if step.name.trim().is_empty() {
                return Err(DefinitionError::Invalid("step name must not be empty".to_string()));
            }
            if step.timeout_seconds == Some(0) {
                return Err(DefinitionError::Invalid(format!(
                    "step '{}' timeout must be > 0",
                    step.name
                )));
            }
        }
        Ok(())
    }

    /// Build the workflow and step records described by this file.
    ///
    /// When `existing` is given (re-import of the same code) its ID,
    /// creation time and statistics are kept. Steps always get fresh IDs.
    pub fn into_records(
        self,
        existing: Option<&Workflow>,
        default_step_timeout: u64,
    ) -> Result<(Workflow, Vec<WorkflowStep>), DefinitionError> {
        self.validate()?;

        let mut workflow = match existing {
            Some(current) => current.clone(),
            None => Workflow::new(&self.name, &self.code, ""),
        };
        workflow.name = self.name;
        workflow.code = self.code.clone();
        workflow.workflow_type = self.workflow_type.unwrap_or(self.code);
        workflow.description = self.description;
        workflow.version = self.version;
        workflow.status = self.status;
        workflow.max_retries = self.max_retries;
        workflow.retry_delay_seconds = self.retry_delay_seconds;
        workflow.timeout_minutes = self.timeout_minutes;
        workflow.updated_at = Utc::now();

        let ids: HashMap<String, Uuid> = self
            .steps
            .iter()
            .map(|s| (s.name.clone(), Uuid::now_v7()))
            .collect();

        let mut steps = Vec::with_capacity(self.steps.len());
        for (index, file) in self.steps.into_iter().enumerate() {
            let depends_on = file
                .depends_on
                .iter()
                .map(|dep| {
                    ids.get(dep).copied().ok_or_else(|| DefinitionError::UnknownDependency {
                        step: file.name.clone(),
                        dependency: dep.clone(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;

            let group = file.parallel_group.filter(|g| !g.is_empty());
            steps.push(WorkflowStep {
                id: ids[&file.name],
                workflow_id: workflow.id,
                order: file.order.unwrap_or(index as i32 + 1),
                step_type: file.step_type,
                config: file.config,
                is_optional: file.optional,
                can_retry: file.can_retry,
                max_retries: file.max_retries,
                timeout_seconds: file.timeout_seconds.unwrap_or(default_step_timeout),
                condition: file.condition,
                can_run_parallel: group.is_some(),
                parallel_group: group,
                depends_on,
                name: file.name,
            });
        }

        validate_steps(&steps)?;
        Ok((workflow, steps))
    }
}

// ---------------------------------------------------------------------------
// Parsing and discovery
// ---------------------------------------------------------------------------

/// Parse and field-validate a YAML definition.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowFile, DefinitionError> {
    let file: WorkflowFile =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    file.validate()?;
    Ok(file)
}

/// Load a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowFile, DefinitionError> {
    let content = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&content)
}

/// Discover all workflow YAML files directly under `dir`.
///
/// Files that fail to parse are logged and skipped.
pub fn discover_workflows(dir: &Path) -> Result<Vec<(PathBuf, WorkflowFile)>, DefinitionError> {
    let mut results = Vec::new();
    if !dir.exists() {
        return Ok(results);
    }
    let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| matches!(p.extension().and_then(|e| e.to_str()), Some("yaml" | "yml")))
        .collect();
    paths.sort();

    for path in paths {
        match load_workflow_file(&path) {
            Ok(file) => results.push((path, file)),
            Err(e) => tracing::warn!(?path, error = %e, "skipping unparseable workflow file"),
        }
    }
    Ok(results)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const SUPPLIER_SYNC: &str = r#"
code: supplier_sync
name: Supplier Sync
description: Pull supplier catalogue and push to marketplaces
retry_delay_seconds: 5
steps:
  - name: fetch_products
    type: data_fetch
    max_retries: 2
    config:
      url: "https://supplier.example/api/products?since={{ input_data.since }}"
  - name: validate_products
    type: data_validate
    depends_on: [fetch_products]
    config:
      input_mapping:
        products: steps.fetch_products.body
      required: [products]
  - name: enrich_titles
    type: ai_process
    parallel_group: enrich
    optional: true
  - name: enrich_prices
    type: shopify_pricing
    parallel_group: enrich
    condition:
      type: value_check
      path: input_data.reprice
      operator: equals
      value: true
  - name: notify
    type: notification
    depends_on: [validate_products]
"#;

    #[test]
    fn test_parse_and_build_records() {
        let file = parse_workflow_yaml(SUPPLIER_SYNC).unwrap();
        assert_eq!(file.status, WorkflowStatus::Active);

        let (workflow, steps) = file.into_records(None, 300).unwrap();
        assert_eq!(workflow.code, "supplier_sync");
        assert_eq!(workflow.workflow_type, "supplier_sync");
        assert_eq!(workflow.retry_delay_seconds, 5);
        assert_eq!(steps.len(), 5);

        let by_name: HashMap<&str, &WorkflowStep> =
            steps.iter().map(|s| (s.name.as_str(), s)).collect();
        assert_eq!(by_name["validate_products"].depends_on, vec![by_name["fetch_products"].id]);
        assert_eq!(by_name["fetch_products"].timeout_seconds, 300);
        assert_eq!(by_name["fetch_products"].order, 1);
        assert!(by_name["enrich_titles"].can_run_parallel);
        assert_eq!(
            by_name["enrich_prices"].step_type,
            StepKind::Custom("shopify_pricing".to_string())
        );
        assert!(steps.iter().all(|s| s.workflow_id == workflow.id));
        assert_eq!(
            by_name["validate_products"].config.input_mapping["products"],
            "steps.fetch_products.body"
        );
    }

    #[test]
    fn test_reimport_keeps_identity_and_stats() {
        let (mut first, _) = parse_workflow_yaml(SUPPLIER_SYNC)
            .unwrap()
            .into_records(None, 300)
            .unwrap();
        first.total_executions = 9;

        let (second, steps) = parse_workflow_yaml(SUPPLIER_SYNC)
            .unwrap()
            .into_records(Some(&first), 300)
            .unwrap();
        assert_eq!(second.id, first.id);
        assert_eq!(second.total_executions, 9);
        assert!(steps.iter().all(|s| s.workflow_id == first.id));
    }

    #[test]
    fn test_invalid_code_rejected() {
        let yaml = "code: Supplier Sync\nname: x\nsteps:\n  - name: a\n    type: data_fetch\n";
        let err = parse_workflow_yaml(yaml).unwrap_err();
        assert!(err.to_string().contains("invalid characters"), "got {err}");
    }

    #[test]
    fn test_no_steps_rejected() {
        let yaml = "code: empty\nname: Empty\nsteps: []\n";
        assert!(matches!(
            parse_workflow_yaml(yaml).unwrap_err(),
            DefinitionError::Invalid(_)
        ));
    }

    #[test]
    fn test_zero_timeout_rejected() {
        let yaml = "code: t\nname: T\nsteps:\n  - name: a\n    type: data_fetch\n    timeout_seconds: 0\n";
        assert!(parse_workflow_yaml(yaml).is_err());
    }

    #[test]
    fn test_unknown_dependency_name() {
        let yaml = "code: t\nname: T\nsteps:\n  - name: a\n    type: data_fetch\n    depends_on: [ghost]\n";
        let err = parse_workflow_yaml(yaml)
            .unwrap()
            .into_records(None, 60)
            .unwrap_err();
        assert!(matches!(err, DefinitionError::UnknownDependency { ref dependency, .. } if dependency == "ghost"));
    }

    #[test]
    fn test_forward_dependency_rejected_on_import() {
        let yaml = r#"
code: t
name: T
steps:
  - name: a
    type: data_transform
    depends_on: [b]
  - name: b
    type: data_transform
"#;
        let err = parse_workflow_yaml(yaml)
            .unwrap()
            .into_records(None, 60)
            .unwrap_err();
        assert!(matches!(err, DefinitionError::UnsatisfiableDependency { .. }), "got {err}");
    }

    #[test]
    fn test_discover_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("sync.yaml"), SUPPLIER_SYNC).unwrap();
        std::fs::write(dir.path().join("broken.yml"), "code: [").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignore me").unwrap();

        let found = discover_workflows(dir.path()).unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].1.code, "supplier_sync");
    }
}
