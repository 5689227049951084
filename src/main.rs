//! fingerprint-ml entrypoint: fingerprint captures, aggregate them under the
//! supplied labels, build the feature matrix and hand it to the learner.
//! Flags are layered over an optional JSON config file.

use clap::Parser;
use fingerprint_ml::config::{
    AggregatorMode, FeatureFormat, FlowEndpoint, InputKind, LabelPolicy, PipelineConfig, WriteIndex,
};
use fingerprint_ml::logging::{RunEvent, StructuredLogger};
use fingerprint_ml::{pipeline, Error};
use std::path::PathBuf;
use std::process::ExitCode;
use tracing::{error, info};

const CONFIG_ENV: &str = "FPML_CONFIG_PATH";

#[derive(Parser, Debug)]
#[command(name = "fingerprint-ml", version, about = "Train models for network traffic analysis")]
struct Cli {
    /// JSON config file (also read from FPML_CONFIG_PATH)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Capture files or directories
    #[arg(short, long = "input", value_name = "PATH")]
    inputs: Vec<PathBuf>,
    /// Descend into subdirectories of directory inputs
    #[arg(short, long)]
    recursive: bool,
    /// Input kind: packet captures or pre-generated fingerprints
    #[arg(long, value_enum)]
    kind: Option<InputKind>,

    /// Fingerprinting tool executable
    #[arg(long, value_name = "PROGRAM")]
    nprint: Option<PathBuf>,
    #[arg(long)]
    ipv4: bool,
    #[arg(long)]
    ipv6: bool,
    #[arg(long)]
    tcp: bool,
    #[arg(long)]
    udp: bool,
    #[arg(long)]
    icmp: bool,
    #[arg(long)]
    eth: bool,
    #[arg(long)]
    radiotap: bool,
    #[arg(long)]
    wlan: bool,
    /// Fingerprint-field packet filter passed to the tool
    #[arg(short = 'x', long, value_name = "FILTER")]
    nprint_filter: Option<String>,
    /// libpcap filter expression
    #[arg(short, long, value_name = "EXPR")]
    filter: Option<String>,
    /// Payload bytes per packet
    #[arg(long, value_name = "BYTES")]
    payload: Option<u32>,
    /// Packets to parse per capture
    #[arg(long)]
    count: Option<u64>,
    #[arg(long, value_enum)]
    write_index: Option<WriteIndex>,
    /// Keep raw tool output in the run directory
    #[arg(long)]
    save_nprint: bool,

    /// Label CSV (`key,label`)
    #[arg(short = 'L', long, value_name = "FILE")]
    label_file: Option<PathBuf>,
    #[arg(long, value_enum)]
    label_policy: Option<LabelPolicy>,
    /// Label written for unlabeled samples under the keep policy
    #[arg(long)]
    unlabeled: Option<String>,

    #[arg(short, long, value_enum)]
    aggregator: Option<AggregatorMode>,
    /// Packets per sample (index aggregator)
    #[arg(long)]
    sample_size: Option<usize>,
    /// Flow endpoint used as the label key (flow aggregator)
    #[arg(long, value_enum)]
    flow_endpoint: Option<FlowEndpoint>,

    /// Drop columns holding one value in every row
    #[arg(long)]
    compress: bool,
    /// Do not write the feature matrix into the run directory
    #[arg(long)]
    no_save_features: bool,
    #[arg(long, value_enum, value_name = "FORMAT")]
    save_features_format: Option<FeatureFormat>,

    /// Train on a saved feature matrix instead of fingerprinting captures
    #[arg(
        long,
        value_name = "FILE",
        conflicts_with_all = [
            "inputs", "kind", "label_file", "aggregator", "sample_size",
            "flow_endpoint", "compress", "save_nprint", "write_index",
        ]
    )]
    learn_from: Option<PathBuf>,

    /// AutoML program; training is skipped when absent
    #[arg(long, value_name = "PROGRAM")]
    learner: Option<PathBuf>,
    #[arg(long)]
    test_size: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    #[arg(long)]
    eval_metric: Option<String>,
    #[arg(long)]
    quality: Option<u8>,
    /// Learner time limit in seconds
    #[arg(long)]
    time_limit: Option<u64>,

    /// Run directory (missing or empty)
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    #[arg(long)]
    log_level: Option<String>,
    /// Log as JSON lines
    #[arg(long)]
    log_json: bool,
}

impl Cli {
    fn config_path(&self) -> Option<PathBuf> {
        self.config
            .clone()
            .or_else(|| std::env::var_os(CONFIG_ENV).map(PathBuf::from))
    }

    /// Flags given on the command line win over the config file.
    fn apply(self, config: &mut PipelineConfig) {
        if !self.inputs.is_empty() {
            config.input.paths = self.inputs;
        }
        config.input.recursive |= self.recursive;
        if let Some(kind) = self.kind {
            config.input.kind = kind;
        }

        let fp = &mut config.fingerprint;
        if let Some(program) = self.nprint {
            fp.program = program;
        }
        fp.ipv4 |= self.ipv4;
        fp.ipv6 |= self.ipv6;
        fp.tcp |= self.tcp;
        fp.udp |= self.udp;
        fp.icmp |= self.icmp;
        fp.eth |= self.eth;
        fp.radiotap |= self.radiotap;
        fp.wlan |= self.wlan;
        fp.nprint_filter = self.nprint_filter.or(fp.nprint_filter.take());
        fp.filter = self.filter.or(fp.filter.take());
        fp.payload = self.payload.or(fp.payload);
        fp.count = self.count.or(fp.count);
        fp.write_index = self.write_index.or(fp.write_index);
        fp.save_output |= self.save_nprint;

        if let Some(file) = self.label_file {
            config.label.file = Some(file);
        }
        if let Some(policy) = self.label_policy {
            config.label.policy = policy;
        }
        if let Some(unlabeled) = self.unlabeled {
            config.label.unlabeled = unlabeled;
        }

        if let Some(mode) = self.aggregator {
            config.aggregate.mode = mode;
        }
        if let Some(size) = self.sample_size {
            config.aggregate.sample_size = size;
        }
        if let Some(endpoint) = self.flow_endpoint {
            config.aggregate.flow_endpoint = endpoint;
        }
        config.matrix.compress |= self.compress;
        if self.no_save_features {
            config.matrix.save = false;
        }
        if let Some(format) = self.save_features_format {
            config.matrix.format = format;
        }

        let learn = &mut config.learn;
        if let Some(program) = self.learner {
            learn.command = Some(program);
        }
        if let Some(test_size) = self.test_size {
            learn.test_size = test_size;
        }
        if let Some(seed) = self.seed {
            learn.seed = seed;
        }
        if let Some(metric) = self.eval_metric {
            learn.eval_metric = metric;
        }
        if let Some(quality) = self.quality {
            learn.quality = quality;
        }
        if let Some(secs) = self.time_limit {
            learn.time_limit_secs = secs;
        }

        if let Some(dir) = self.output {
            config.output.dir = Some(dir);
        }
        if let Some(level) = self.log_level {
            config.log.level = level;
        }
        config.log.json |= self.log_json;
    }
}

fn exit_code(err: &Error) -> ExitCode {
    if err.is_configuration() {
        ExitCode::from(2)
    } else {
        ExitCode::from(1)
    }
}

fn report<T: serde::Serialize>(event: &RunEvent<'_, T>) {
    if let Err(e) = event.write_to(&mut std::io::stdout().lock()) {
        error!(error = %e, "could not write the run summary");
    }
}

fn fail(err: &Error) -> ExitCode {
    error!(error = %err, "run failed");
    report(&RunEvent::<()>::failed(&err.to_string()));
    exit_code(err)
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let loaded = match cli.config_path() {
        Some(path) => PipelineConfig::load(&path),
        None => Ok(PipelineConfig::default()),
    };
    let mut config = match loaded {
        Ok(config) => config,
        Err(e) => {
            StructuredLogger::init(cli.log_json, cli.log_level.as_deref().unwrap_or("info"));
            return fail(&e);
        }
    };
    let learn_from = cli.learn_from.clone();
    cli.apply(&mut config);

    StructuredLogger::init(config.log.json, &config.log.level);
    let result = match &learn_from {
        Some(features) => {
            info!(version = env!("CARGO_PKG_VERSION"), features = %features.display(), "fingerprint-ml learn-only");
            pipeline::learn_only(&config, features)
        }
        None => {
            info!(version = env!("CARGO_PKG_VERSION"), mode = config.aggregate.mode.as_str(), "fingerprint-ml starting");
            pipeline::run(&config)
        }
    };

    match result {
        Ok(summary) => {
            info!(dir = %summary.output_dir.display(), rows = summary.rows, "run complete");
            report(&RunEvent::ok(&summary));
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}
