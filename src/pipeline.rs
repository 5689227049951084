//! One run end to end: labels, fingerprints, aggregation, matrix, learning,
//! artifacts. Labels are loaded and checked before any capture is touched.

use crate::aggregate::{key_space, Aggregator};
use crate::config::{AggregatorMode, InputKind, LabelPolicy, PipelineConfig};
use crate::error::{Error, Result};
use crate::fingerprint::FingerprintSource;
use crate::label::LabelIndex;
use crate::learn::{learner_for, LearnParams};
use crate::matrix::{FeatureMatrix, LabelRule};
use crate::report::{
    default_output_dir, learn_table, AggregateMeta, InputMeta, MatrixMeta, Meta, OutputDir, Timings,
    DEFAULT_BASE,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};
use uuid::Uuid;

/// Outcome of a successful run, printed as the final JSON line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub output_dir: PathBuf,
    /// Unset when learning from a saved matrix
    pub mode: Option<AggregatorMode>,
    pub captures: usize,
    pub skipped_captures: usize,
    pub samples: usize,
    pub rows: usize,
    pub columns: usize,
    pub unresolved: usize,
    pub labels: BTreeMap<String, usize>,
    pub digest: String,
    pub learned: bool,
}

fn destination(config: &PipelineConfig) -> PathBuf {
    match &config.output.dir {
        Some(dir) => dir.clone(),
        None => default_output_dir(Path::new(DEFAULT_BASE)),
    }
}

/// Name of the saved matrix file, if saving is enabled.
fn save_features(
    matrix: &FeatureMatrix,
    config: &PipelineConfig,
    out: &OutputDir,
) -> Result<Option<&'static str>> {
    if !config.matrix.save {
        info!("feature matrix not saved");
        return Ok(None);
    }
    let format = config.matrix.format;
    matrix.save(&out.feature_dir().join(format.file_name()), format)?;
    Ok(Some(format.file_name()))
}

pub fn run(config: &PipelineConfig) -> Result<RunSummary> {
    config.validate()?;
    let run_id = Uuid::new_v4();
    let created = chrono::Utc::now();
    let mut timings = Timings::default();

    let label_path = config
        .label
        .file
        .as_deref()
        .ok_or_else(|| Error::config("a label file is required"))?;
    let labels = timings.time("label", || LabelIndex::build(label_path, key_space(&config.aggregate)))?;
    info!(path = %label_path.display(), keys = labels.len(), classes = labels.labels().len(), "labels loaded");

    let out = OutputDir::create(&destination(config))?;
    info!(run_id = %run_id, dir = %out.destination().display(), "run started");

    let save_dir = (config.fingerprint.save_output && config.input.kind == InputKind::Pcap)
        .then(|| out.nprint_dir());
    let mut source = FingerprintSource::new(config, save_dir)?;
    let skipped = if config.input.kind == InputKind::Pcap
        && config.aggregate.mode == AggregatorMode::Pcap
        && config.label.policy == LabelPolicy::Drop
    {
        source.retain(|input| labels.contains(&input.identity))
    } else {
        Vec::new()
    };
    if !skipped.is_empty() {
        warn!(count = skipped.len(), "skipping captures without a label");
    }

    let aggregation = timings.time("aggregate", || -> Result<_> {
        let mut aggregator = Aggregator::new(&config.aggregate, &labels)?;
        for capture in source.captures() {
            aggregator.push_capture(capture?)?;
        }
        aggregator.finish()
    })?;
    let stats = aggregation.stats.clone();

    let rule = LabelRule {
        policy: config.label.policy,
        unlabeled: config.label.unlabeled.clone(),
    };
    let (matrix, build, saved) = timings.time("matrix", || -> Result<_> {
        let (matrix, build) = FeatureMatrix::from_aggregation(aggregation, &rule, config.aggregate.mode)?;
        let matrix = if config.matrix.compress { matrix.compress() } else { matrix };
        let saved = save_features(&matrix, config, &out)?;
        Ok((matrix, build, saved))
    })?;
    if matrix.row_count() == 0 {
        warn!("feature matrix has no rows");
    }
    let digest = matrix.digest()?;

    let learner = learner_for(&config.learn);
    let report = timings.time("learn", || {
        learner.learn(&matrix, &LearnParams::from(&config.learn), &out.model_dir())
    })?;

    let meta = Meta {
        run_id,
        created,
        version: env!("CARGO_PKG_VERSION").to_string(),
        tool_command: source.command_line(),
        digest: digest.clone(),
        learned_from: None,
        input: Some(InputMeta {
            kind: config.input.kind,
            captures: source.inputs().len(),
            skipped: skipped.clone(),
        }),
        aggregate: Some(AggregateMeta {
            mode: config.aggregate.mode,
            sample_size: config.aggregate.sample_size,
            flow_endpoint: (config.aggregate.mode == AggregatorMode::Flow)
                .then_some(config.aggregate.flow_endpoint),
            label_policy: config.label.policy,
            unlabeled: config.label.unlabeled.clone(),
        }),
        aggregation: Some(stats.clone()),
        matrix: MatrixMeta {
            rows: matrix.row_count(),
            column_count: matrix.column_count(),
            saved_as: saved.map(str::to_string),
            compressed: config.matrix.compress,
            dropped_unlabeled: build.dropped_unlabeled,
            kept_unlabeled: build.kept_unlabeled,
            columns: matrix.columns().iter().map(|c| c.to_string()).collect(),
        },
        label_distribution: matrix.label_distribution(),
        learn: report.as_ref().map(learn_table),
        timings: timings.into_steps(),
    };
    meta.write(&out.meta_path())?;

    let output_dir = out.commit()?;
    Ok(RunSummary {
        run_id,
        output_dir,
        mode: Some(config.aggregate.mode),
        captures: stats.captures,
        skipped_captures: skipped.len(),
        samples: stats.samples,
        rows: matrix.row_count(),
        columns: matrix.column_count(),
        unresolved: stats.unresolved,
        labels: meta.label_distribution,
        digest,
        learned: report.is_some(),
    })
}

/// Train on a matrix saved by an earlier run, skipping fingerprinting and
/// aggregation. The new run directory holds the model and `meta.toml`.
pub fn learn_only(config: &PipelineConfig, features: &Path) -> Result<RunSummary> {
    config.validate_learning()?;
    if !features.is_file() {
        return Err(Error::config(format!("feature matrix not found: {}", features.display())));
    }
    let run_id = Uuid::new_v4();
    let created = chrono::Utc::now();
    let mut timings = Timings::default();

    let matrix = timings.time("load", || FeatureMatrix::load(features))?;
    info!(
        path = %features.display(),
        rows = matrix.row_count(),
        columns = matrix.column_count(),
        "feature matrix loaded"
    );
    let digest = matrix.digest()?;

    let out = OutputDir::create(&destination(config))?;
    info!(run_id = %run_id, dir = %out.destination().display(), "learn-only run started");

    let learner = learner_for(&config.learn);
    let report = timings.time("learn", || {
        learner.learn(&matrix, &LearnParams::from(&config.learn), &out.model_dir())
    })?;

    let meta = Meta {
        run_id,
        created,
        version: env!("CARGO_PKG_VERSION").to_string(),
        tool_command: None,
        digest: digest.clone(),
        learned_from: Some(features.to_path_buf()),
        input: None,
        aggregate: None,
        aggregation: None,
        matrix: MatrixMeta {
            rows: matrix.row_count(),
            column_count: matrix.column_count(),
            saved_as: None,
            compressed: false,
            dropped_unlabeled: 0,
            kept_unlabeled: 0,
            columns: matrix.columns().iter().map(|c| c.to_string()).collect(),
        },
        label_distribution: matrix.label_distribution(),
        learn: report.as_ref().map(learn_table),
        timings: timings.into_steps(),
    };
    meta.write(&out.meta_path())?;

    let output_dir = out.commit()?;
    Ok(RunSummary {
        run_id,
        output_dir,
        mode: None,
        captures: 0,
        skipped_captures: 0,
        samples: matrix.row_count(),
        rows: matrix.row_count(),
        columns: matrix.column_count(),
        unresolved: 0,
        labels: meta.label_distribution,
        digest,
        learned: report.is_some(),
    })
}
