//! Run configuration. Built once per invocation and passed by reference through
//! every stage; nothing in the crate keeps process-wide settings.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Capture or fingerprint inputs
    pub input: InputConfig,
    /// Flags passed to the fingerprinting tool
    pub fingerprint: FingerprintConfig,
    /// Label file and unlabeled-sample policy
    pub label: LabelConfig,
    /// Sample grouping strategy
    pub aggregate: AggregateConfig,
    /// Matrix post-processing
    pub matrix: MatrixConfig,
    /// AutoML collaborator
    pub learn: LearnConfig,
    /// Output directory
    pub output: OutputConfig,
    /// Logging
    pub log: LogConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum InputKind {
    /// Packet captures, fingerprinted by running the external tool
    Pcap,
    /// Fingerprint CSV files already produced by the tool
    Nprint,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InputConfig {
    /// Files and/or directories
    pub paths: Vec<PathBuf>,
    /// Descend into subdirectories of directory inputs
    pub recursive: bool,
    pub kind: InputKind,
}

/// Index column written by the fingerprinting tool (`--write_index`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum WriteIndex {
    SrcIp,
    DstIp,
    SrcPort,
    DstPort,
    Flow,
    WlanTx,
}

impl WriteIndex {
    pub fn code(self) -> u8 {
        match self {
            WriteIndex::SrcIp => 0,
            WriteIndex::DstIp => 1,
            WriteIndex::SrcPort => 2,
            WriteIndex::DstPort => 3,
            WriteIndex::Flow => 4,
            WriteIndex::WlanTx => 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FingerprintConfig {
    /// Tool executable, resolved via PATH when not absolute
    pub program: PathBuf,
    pub ipv4: bool,
    pub ipv6: bool,
    pub tcp: bool,
    pub udp: bool,
    pub icmp: bool,
    pub eth: bool,
    pub radiotap: bool,
    pub wlan: bool,
    /// Tool-side packet filter over fingerprint fields (`--nprint_filter`)
    pub nprint_filter: Option<String>,
    /// libpcap filter expression applied while reading captures
    pub filter: Option<String>,
    /// Payload bytes to include per packet
    pub payload: Option<u32>,
    /// Packets to parse per capture (all when unset)
    pub count: Option<u64>,
    /// Tool default (source IP) when unset; flow mode requires `flow`
    pub write_index: Option<WriteIndex>,
    /// Keep raw tool output under `<out>/nprint/`
    pub save_output: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum LabelPolicy {
    /// Unlabeled samples never reach the matrix
    #[default]
    Drop,
    /// Unlabeled samples are kept under the sentinel label
    Keep,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LabelConfig {
    pub file: Option<PathBuf>,
    pub policy: LabelPolicy,
    /// Label written for unlabeled samples under `Keep`
    pub unlabeled: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum AggregatorMode {
    /// One sample per packet, labeled by the record's index key
    Index,
    /// One sample per capture file, labeled by the file identity
    Pcap,
    /// One sample per bidirectional flow, labeled by a flow endpoint
    Flow,
}

impl AggregatorMode {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregatorMode::Index => "index",
            AggregatorMode::Pcap => "pcap",
            AggregatorMode::Flow => "flow",
        }
    }
}

/// Part of a flow used as its label join key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
#[value(rename_all = "snake_case")]
pub enum FlowEndpoint {
    /// Whole 5-tuple, direction-normalized
    Tuple,
    /// Initiator address
    #[default]
    SrcIp,
    /// Responder address
    DstIp,
    SrcPort,
    DstPort,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregateConfig {
    pub mode: AggregatorMode,
    /// Packets per sample in index mode
    pub sample_size: usize,
    pub flow_endpoint: FlowEndpoint,
}

/// On-disk encoding of the saved feature matrix.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
#[value(rename_all = "kebab-case")]
pub enum FeatureFormat {
    /// Plain CSV
    #[default]
    Csv,
    /// CSV in a zstd frame
    CsvZst,
}

impl FeatureFormat {
    pub fn file_name(self) -> &'static str {
        match self {
            FeatureFormat::Csv => "features.csv",
            FeatureFormat::CsvZst => "features.csv.zst",
        }
    }

    /// Format of an existing matrix file, judged by its extension.
    pub fn of_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("zst") => FeatureFormat::CsvZst,
            _ => FeatureFormat::Csv,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatrixConfig {
    /// Drop columns carrying the same value in every row
    pub compress: bool,
    /// Write the matrix into the run directory
    pub save: bool,
    pub format: FeatureFormat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearnConfig {
    /// AutoML program; learning is skipped when unset
    pub command: Option<PathBuf>,
    /// Share of rows held out for testing, in (0, 1)
    pub test_size: f64,
    /// Seed for the train/test shuffle
    pub seed: u64,
    pub eval_metric: String,
    pub quality: u8,
    pub time_limit_secs: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Generated under `fingerprint-ml/` when unset
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: String,
    pub json: bool,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            paths: Vec::new(),
            recursive: false,
            kind: InputKind::Pcap,
        }
    }
}

impl Default for FingerprintConfig {
    fn default() -> Self {
        Self {
            program: PathBuf::from("nprint"),
            ipv4: false,
            ipv6: false,
            tcp: false,
            udp: false,
            icmp: false,
            eth: false,
            radiotap: false,
            wlan: false,
            nprint_filter: None,
            filter: None,
            payload: None,
            count: None,
            write_index: None,
            save_output: false,
        }
    }
}

impl Default for LabelConfig {
    fn default() -> Self {
        Self {
            file: None,
            policy: LabelPolicy::Drop,
            unlabeled: "unlabeled".to_string(),
        }
    }
}

impl Default for AggregateConfig {
    fn default() -> Self {
        Self {
            mode: AggregatorMode::Index,
            sample_size: 1,
            flow_endpoint: FlowEndpoint::default(),
        }
    }
}

impl Default for MatrixConfig {
    fn default() -> Self {
        Self {
            compress: false,
            save: true,
            format: FeatureFormat::default(),
        }
    }
}

impl Default for LearnConfig {
    fn default() -> Self {
        Self {
            command: None,
            test_size: 0.3,
            seed: 0,
            eval_metric: "accuracy".to_string(),
            quality: 0,
            time_limit_secs: 300,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file if present; otherwise return default.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = std::fs::read_to_string(path)?;
        serde_json::from_str(&data)
            .map_err(|e| Error::config(format!("invalid config file {}: {}", path.display(), e)))
    }

    /// Index column the tool must write for the active mode.
    pub fn effective_write_index(&self) -> Option<WriteIndex> {
        match self.aggregate.mode {
            AggregatorMode::Flow => Some(WriteIndex::Flow),
            _ => self.fingerprint.write_index,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.label.file.is_none() {
            return Err(Error::config("a label file is required"));
        }
        if self.input.paths.is_empty() {
            return Err(Error::config("at least one capture input is required"));
        }
        if let Some(missing) = self.input.paths.iter().find(|p| !p.exists()) {
            return Err(Error::config(format!("input not found: {}", missing.display())));
        }
        if self.aggregate.sample_size == 0 {
            return Err(Error::config("sample size must be at least 1"));
        }
        if self.aggregate.sample_size > 1 && self.aggregate.mode != AggregatorMode::Index {
            return Err(Error::config(format!(
                "sample size applies to the index aggregator only, not {}",
                self.aggregate.mode.as_str()
            )));
        }
        if self.aggregate.mode == AggregatorMode::Flow {
            if let Some(index) = self.fingerprint.write_index {
                if index != WriteIndex::Flow {
                    return Err(Error::config(
                        "the flow aggregator requires the flow write index",
                    ));
                }
            }
        }
        self.validate_learning()?;
        if self.label.policy == LabelPolicy::Keep && self.label.unlabeled.trim().is_empty() {
            return Err(Error::config("the unlabeled sentinel must not be empty"));
        }
        Ok(())
    }

    /// Checks that also apply when learning from a saved matrix.
    pub fn validate_learning(&self) -> Result<()> {
        if !(self.learn.test_size > 0.0 && self.learn.test_size < 1.0) {
            return Err(Error::config(format!(
                "test size must lie in (0, 1), got {}",
                self.learn.test_size
            )));
        }
        Ok(())
    }
}
