//! AutoML collaborator: hands the finished matrix to an external learner.
//! Without a configured program learning is skipped (no-op mode) and the run
//! still produces its feature matrix and metadata.

use crate::config::LearnConfig;
use crate::error::{Error, Result};
use crate::matrix::{FeatureMatrix, LABEL_COLUMN};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{info, warn};

/// Parameters forwarded to the learner.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnParams {
    pub test_size: f64,
    pub seed: u64,
    pub eval_metric: String,
    pub quality: u8,
    pub time_limit_secs: u64,
}

impl From<&LearnConfig> for LearnParams {
    fn from(config: &LearnConfig) -> Self {
        Self {
            test_size: config.test_size,
            seed: config.seed,
            eval_metric: config.eval_metric.clone(),
            quality: config.quality,
            time_limit_secs: config.time_limit_secs,
        }
    }
}

/// Learner output, carried verbatim into the run metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LearnReport {
    pub train_rows: usize,
    pub test_rows: usize,
    /// Whatever JSON the learner printed (metrics, feature importance, ...)
    pub output: serde_json::Value,
}

pub trait Learner {
    /// Train on `matrix`, writing artifacts under `model_dir`.
    fn learn(
        &self,
        matrix: &FeatureMatrix,
        params: &LearnParams,
        model_dir: &Path,
    ) -> Result<Option<LearnReport>>;
}

/// Runs when no learner is configured.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopLearner;

impl Learner for NoopLearner {
    fn learn(&self, matrix: &FeatureMatrix, _: &LearnParams, _: &Path) -> Result<Option<LearnReport>> {
        warn!(rows = matrix.row_count(), "no learner configured; model training skipped");
        Ok(None)
    }
}

/// External program invoked as
/// `<program> --train <csv> --test <csv> --label label --outdir <dir> --metric <m> --quality <q> --time-limit <s>`.
/// It must print a single JSON document on stdout.
#[derive(Debug, Clone)]
pub struct CommandLearner {
    program: PathBuf,
}

impl CommandLearner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn tool_error(&self, reason: String, diagnostics: String) -> Error {
        Error::ExternalTool {
            tool: self.program.display().to_string(),
            reason,
            diagnostics,
        }
    }

    fn write_rows(matrix: &FeatureMatrix, path: &Path, rows: &[usize]) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        matrix.write_csv(&mut out, Some(rows))?;
        out.flush()?;
        Ok(())
    }
}

impl Learner for CommandLearner {
    fn learn(
        &self,
        matrix: &FeatureMatrix,
        params: &LearnParams,
        model_dir: &Path,
    ) -> Result<Option<LearnReport>> {
        if matrix.row_count() == 0 {
            warn!("feature matrix is empty; model training skipped");
            return Ok(None);
        }
        std::fs::create_dir_all(model_dir)?;
        let split = matrix.split(params.test_size, params.seed);
        let train = model_dir.join("train.csv");
        let test = model_dir.join("test.csv");
        Self::write_rows(matrix, &train, &split.train)?;
        Self::write_rows(matrix, &test, &split.test)?;

        info!(
            program = %self.program.display(),
            train_rows = split.train.len(),
            test_rows = split.test.len(),
            "starting learner"
        );
        let output = Command::new(&self.program)
            .arg("--train")
            .arg(&train)
            .arg("--test")
            .arg(&test)
            .args(["--label", LABEL_COLUMN])
            .arg("--outdir")
            .arg(model_dir)
            .args(["--metric", params.eval_metric.as_str()])
            .arg("--quality")
            .arg(params.quality.to_string())
            .arg("--time-limit")
            .arg(params.time_limit_secs.to_string())
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                let reason = if e.kind() == ErrorKind::NotFound {
                    "command could not be found on PATH".to_string()
                } else {
                    format!("could not start: {}", e)
                };
                self.tool_error(reason, String::new())
            })?;

        if !output.status.success() {
            return Err(self.tool_error(
                output.status.to_string(),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            ));
        }
        let report: serde_json::Value = serde_json::from_slice(&output.stdout).map_err(|e| {
            self.tool_error(
                format!("stdout is not a JSON report: {}", e),
                String::from_utf8_lossy(&output.stderr).into_owned(),
            )
        })?;

        Ok(Some(LearnReport {
            train_rows: split.train.len(),
            test_rows: split.test.len(),
            output: report,
        }))
    }
}

/// Learner for the configuration: the external program when set, else no-op.
pub fn learner_for(config: &LearnConfig) -> Box<dyn Learner> {
    match &config.command {
        Some(program) => Box::new(CommandLearner::new(program.clone())),
        None => Box::new(NoopLearner),
    }
}
