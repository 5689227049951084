//! `meta.toml`: what was run, on what, and what came out.

use crate::aggregate::AggregationStats;
use crate::config::{AggregatorMode, FlowEndpoint, InputKind, LabelPolicy};
use crate::error::Result;
use crate::learn::LearnReport;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Meta {
    pub run_id: Uuid,
    pub created: DateTime<Utc>,
    pub version: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_command: Option<String>,
    /// SHA-256 of the matrix's plain CSV rendering
    pub digest: String,
    /// Saved matrix a learn-only run trained on
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learned_from: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<InputMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregation: Option<AggregationStats>,
    pub matrix: MatrixMeta,
    pub label_distribution: BTreeMap<String, usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub learn: Option<toml::Value>,
    pub timings: Vec<StepTiming>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InputMeta {
    pub kind: InputKind,
    pub captures: usize,
    /// Captures without a label, never fingerprinted
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AggregateMeta {
    pub mode: AggregatorMode,
    pub sample_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flow_endpoint: Option<FlowEndpoint>,
    pub label_policy: LabelPolicy,
    pub unlabeled: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct MatrixMeta {
    pub rows: usize,
    pub column_count: usize,
    /// File under `feature/`, unset when the matrix was not saved
    #[serde(skip_serializing_if = "Option::is_none")]
    pub saved_as: Option<String>,
    pub compressed: bool,
    pub dropped_unlabeled: usize,
    pub kept_unlabeled: usize,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepTiming {
    pub step: String,
    pub seconds: f64,
}

/// Wall-clock time per pipeline step, in execution order.
#[derive(Debug, Default)]
pub struct Timings {
    steps: Vec<StepTiming>,
}

impl Timings {
    pub fn time<T>(&mut self, step: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let out = f();
        self.steps.push(StepTiming {
            step: step.to_string(),
            seconds: start.elapsed().as_secs_f64(),
        });
        out
    }

    pub fn into_steps(self) -> Vec<StepTiming> {
        self.steps
    }
}

/// TOML has no null: null values and members are dropped.
pub fn json_to_toml(value: &serde_json::Value) -> Option<toml::Value> {
    use serde_json::Value as J;
    Some(match value {
        J::Null => return None,
        J::Bool(b) => toml::Value::Boolean(*b),
        J::Number(n) => match n.as_i64() {
            Some(i) => toml::Value::Integer(i),
            None => toml::Value::Float(n.as_f64()?),
        },
        J::String(s) => toml::Value::String(s.clone()),
        J::Array(items) => toml::Value::Array(items.iter().filter_map(json_to_toml).collect()),
        J::Object(map) => toml::Value::Table(
            map.iter()
                .filter_map(|(k, v)| json_to_toml(v).map(|v| (k.clone(), v)))
                .collect(),
        ),
    })
}

/// Learner report as a TOML table.
pub(crate) fn learn_table(report: &LearnReport) -> toml::Value {
    let mut table = toml::map::Map::new();
    table.insert("train_rows".into(), toml::Value::Integer(report.train_rows as i64));
    table.insert("test_rows".into(), toml::Value::Integer(report.test_rows as i64));
    if let Some(output) = json_to_toml(&report.output) {
        table.insert("output".into(), output);
    }
    toml::Value::Table(table)
}

impl Meta {
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        std::fs::write(path, self.to_toml()?)?;
        Ok(())
    }
}
