//! End-to-end runs over fingerprint fixtures written at test time.

use fingerprint_ml::config::{
    AggregatorMode, FeatureFormat, FlowEndpoint, InputKind, LabelPolicy, PipelineConfig,
};
use fingerprint_ml::FeatureMatrix;
use fingerprint_ml::{pipeline, Error};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

const CAPTURE_A: &str = "src_ip,ipv4_ver_0,ipv4_ver_1\n10.0.0.1,0,1\n10.0.0.3,1,1\n";
const CAPTURE_B: &str = "src_ip,ipv4_ver_0,tcp_sprt_0\n10.0.0.2,1,0\n";

struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("captures")).unwrap();
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn capture(&self, name: &str, content: &str) -> &Self {
        fs::write(self.root().join("captures").join(name), content).unwrap();
        self
    }

    fn labels(&self, content: &str) -> &Self {
        fs::write(self.root().join("labels.csv"), content).unwrap();
        self
    }

    fn out(&self, name: &str) -> PathBuf {
        self.root().join("runs").join(name)
    }

    fn config(&self, mode: AggregatorMode) -> PipelineConfig {
        let mut c = PipelineConfig::default();
        c.input.paths = vec![self.root().join("captures")];
        c.input.kind = InputKind::Nprint;
        c.label.file = Some(self.root().join("labels.csv"));
        c.aggregate.mode = mode;
        c.output.dir = Some(self.out("run"));
        c
    }
}

fn features_file(dir: &Path, format: FeatureFormat) -> PathBuf {
    dir.join("feature").join(format.file_name())
}

fn features(dir: &Path) -> String {
    fs::read_to_string(features_file(dir, FeatureFormat::Csv)).unwrap()
}

fn meta(dir: &Path) -> toml::Value {
    toml::from_str(&fs::read_to_string(dir.join("meta.toml")).unwrap()).unwrap()
}

#[test]
fn index_mode_keeps_labeled_packets_over_the_field_union() {
    let fx = Fixture::new();
    fx.capture("a.npt", CAPTURE_A)
        .capture("b.npt", CAPTURE_B)
        .labels("10.0.0.1,A\n10.0.0.2,B\n");

    let summary = pipeline::run(&fx.config(AggregatorMode::Index)).unwrap();
    assert_eq!(summary.rows, 2);
    assert_eq!(summary.samples, 3);
    assert_eq!(summary.unresolved, 1);
    assert_eq!(
        features(&summary.output_dir),
        "index,ipv4_ver_0,ipv4_ver_1,tcp_sprt_0,label\n\
         10.0.0.1,0,1,-1,A\n\
         10.0.0.2,1,-1,0,B\n"
    );
}

#[test]
fn pcap_mode_reduces_each_file_to_one_row() {
    let fx = Fixture::new();
    fx.capture("a.npt", CAPTURE_A)
        .capture("b.npt", CAPTURE_B)
        .labels("item,label\na.pcap,A\nb,B\n");

    let summary = pipeline::run(&fx.config(AggregatorMode::Pcap)).unwrap();
    assert_eq!(
        features(&summary.output_dir),
        "pcap,ipv4_ver_0,ipv4_ver_1,tcp_sprt_0,packet_count,label\n\
         a,0,1,-1,2,A\n\
         b,1,-1,0,1,B\n"
    );
}

#[test]
fn flow_mode_merges_both_directions() {
    let fx = Fixture::new();
    fx.capture(
        "f.npt",
        "flow,tcp_syn,tcp_ack\n\
         10.0.0.1_10.0.0.2_1234_80_6,1,0\n\
         10.0.0.2_10.0.0.1_80_1234_6,1,1\n\
         10.0.0.1_10.0.0.2_1234_80_6,0,1\n\
         10.0.0.3_10.0.0.2_5555_80_tcp,1,-1\n",
    )
    .labels("10.0.0.1,client\n10.0.0.3,other\n");

    let mut config = fx.config(AggregatorMode::Flow);
    config.aggregate.flow_endpoint = FlowEndpoint::SrcIp;
    let summary = pipeline::run(&config).unwrap();
    assert_eq!(
        features(&summary.output_dir),
        "flow,tcp_syn,tcp_ack,packet_count,label\n\
         10.0.0.1_10.0.0.2_1234_80_6@f,1,0,3,client\n\
         10.0.0.2_10.0.0.3_80_5555_6@f,1,-1,1,other\n"
    );
}

#[test]
fn chunked_index_samples_span_packets() {
    let fx = Fixture::new();
    fx.capture("a.npt", "src_ip,x\n10.0.0.1,1\n10.0.0.2,0\n10.0.0.1,0\n10.0.0.1,1\n")
        .labels("10.0.0.1,A\n10.0.0.2,B\n");

    let mut config = fx.config(AggregatorMode::Index);
    config.aggregate.sample_size = 2;
    let summary = pipeline::run(&config).unwrap();
    assert_eq!(
        features(&summary.output_dir),
        "index,pkt_0_x,pkt_1_x,packet_count,label\n\
         10.0.0.1,1,0,2,A\n\
         10.0.0.1,1,-1,1,A\n\
         10.0.0.2,0,-1,1,B\n"
    );
}

#[test]
fn keep_policy_writes_sentinel_label() {
    let fx = Fixture::new();
    fx.capture("a.npt", CAPTURE_A).labels("10.0.0.1,A\n");

    let mut config = fx.config(AggregatorMode::Index);
    config.label.policy = LabelPolicy::Keep;
    config.label.unlabeled = "unknown".into();
    let summary = pipeline::run(&config).unwrap();
    assert_eq!(summary.rows, 2);
    assert_eq!(summary.labels.get("unknown"), Some(&1));
    assert!(features(&summary.output_dir).ends_with("10.0.0.3,1,1,unknown\n"));
}

#[test]
fn reruns_are_byte_identical() {
    let fx = Fixture::new();
    fx.capture("a.npt", CAPTURE_A)
        .capture("b.npt", CAPTURE_B)
        .labels("10.0.0.1,A\n10.0.0.2,B\n10.0.0.3,A\n");

    let mut config = fx.config(AggregatorMode::Index);
    let first = pipeline::run(&config).unwrap();
    config.output.dir = Some(fx.out("again"));
    let second = pipeline::run(&config).unwrap();

    assert_eq!(first.digest, second.digest);
    assert_ne!(first.run_id, second.run_id);
    assert_eq!(features(&first.output_dir), features(&second.output_dir));
}

#[test]
fn duplicate_label_keys_abort_before_fingerprinting() {
    let fx = Fixture::new();
    fs::write(fx.root().join("captures/a.pcap"), b"not a capture").unwrap();
    fx.labels("a,A\na.pcap,B\n");

    let mut config = fx.config(AggregatorMode::Pcap);
    config.input.kind = InputKind::Pcap;
    config.fingerprint.program = PathBuf::from("definitely-not-a-real-fingerprinter");
    let err = pipeline::run(&config).unwrap_err();

    assert!(matches!(err, Error::Label(_)), "{err}");
    assert!(err.is_configuration());
    assert!(!fx.out("run").exists());
}

#[test]
fn failed_run_leaves_no_output() {
    let fx = Fixture::new();
    fx.capture("a.npt", CAPTURE_A)
        .capture("b.npt", "src_ip,x\n10.0.0.2,7\n")
        .labels("10.0.0.1,A\n10.0.0.2,B\n");

    let err = pipeline::run(&fx.config(AggregatorMode::Index)).unwrap_err();
    assert!(matches!(err, Error::RecordSchema { line: 2, .. }), "{err}");
    assert!(!err.is_configuration());
    let leftovers = fs::read_dir(fx.root().join("runs")).unwrap().count();
    assert_eq!(leftovers, 0);
}

#[test]
fn non_empty_output_dir_is_refused() {
    let fx = Fixture::new();
    fx.capture("a.npt", CAPTURE_A).labels("10.0.0.1,A\n");
    fs::create_dir_all(fx.out("run")).unwrap();
    fs::write(fx.out("run").join("old.csv"), "").unwrap();

    let err = pipeline::run(&fx.config(AggregatorMode::Index)).unwrap_err();
    assert!(err.is_configuration());
    assert!(fx.out("run").join("old.csv").exists());
}

#[test]
fn meta_records_the_run() {
    let fx = Fixture::new();
    fx.capture("a.npt", CAPTURE_A)
        .capture("b.npt", CAPTURE_B)
        .labels("a,A\nb,B\n");

    let summary = pipeline::run(&fx.config(AggregatorMode::Pcap)).unwrap();
    let meta = meta(&summary.output_dir);

    assert_eq!(meta["run_id"].as_str(), Some(summary.run_id.to_string().as_str()));
    assert_eq!(meta["digest"].as_str(), Some(summary.digest.as_str()));
    assert!(meta.get("tool_command").is_none());
    assert_eq!(meta["input"]["kind"].as_str(), Some("nprint"));
    assert_eq!(meta["aggregate"]["mode"].as_str(), Some("pcap"));
    assert_eq!(meta["aggregate"]["label_policy"].as_str(), Some("drop"));
    assert_eq!(meta["matrix"]["rows"].as_integer(), Some(2));
    assert_eq!(meta["matrix"]["column_count"].as_integer(), Some(4));
    assert_eq!(meta["matrix"]["saved_as"].as_str(), Some("features.csv"));
    assert_eq!(meta["label_distribution"]["A"].as_integer(), Some(1));
    assert_eq!(meta["aggregation"]["unresolved"].as_integer(), Some(0));
    assert!(meta.get("learn").is_none());

    let steps: Vec<&str> = meta["timings"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|t| t["step"].as_str())
        .collect();
    assert_eq!(steps, ["label", "aggregate", "matrix", "learn"]);
}

#[test]
fn compress_drops_constant_columns_from_output() {
    let fx = Fixture::new();
    fx.capture("a.npt", "src_ip,same,diff\n10.0.0.1,1,0\n10.0.0.2,1,1\n")
        .labels("10.0.0.1,A\n10.0.0.2,B\n");

    let mut config = fx.config(AggregatorMode::Index);
    config.matrix.compress = true;
    let summary = pipeline::run(&config).unwrap();
    assert_eq!(summary.columns, 1);
    assert_eq!(
        features(&summary.output_dir),
        "index,diff,label\n10.0.0.1,0,A\n10.0.0.2,1,B\n"
    );
}

#[test]
fn no_save_leaves_feature_dir_empty() {
    let fx = Fixture::new();
    fx.capture("a.npt", CAPTURE_A).labels("10.0.0.1,A\n");

    let mut config = fx.config(AggregatorMode::Index);
    config.matrix.save = false;
    let summary = pipeline::run(&config).unwrap();
    assert_eq!(summary.rows, 1);
    assert_eq!(fs::read_dir(summary.output_dir.join("feature")).unwrap().count(), 0);
    assert!(meta(&summary.output_dir)["matrix"].get("saved_as").is_none());
}

#[test]
fn zstd_features_decode_to_the_same_matrix() {
    let fx = Fixture::new();
    fx.capture("a.npt", CAPTURE_A)
        .capture("b.npt", CAPTURE_B)
        .labels("10.0.0.1,A\n10.0.0.2,B\n");

    let mut config = fx.config(AggregatorMode::Index);
    let plain = pipeline::run(&config).unwrap();
    config.matrix.format = FeatureFormat::CsvZst;
    config.output.dir = Some(fx.out("zst"));
    let packed = pipeline::run(&config).unwrap();

    assert_eq!(plain.digest, packed.digest);
    let path = features_file(&packed.output_dir, FeatureFormat::CsvZst);
    let matrix = FeatureMatrix::load(&path).unwrap();
    assert_eq!(matrix.digest().unwrap(), plain.digest);
    assert!(!features_file(&packed.output_dir, FeatureFormat::Csv).exists());
}

#[test]
fn learn_only_reads_a_saved_matrix() {
    let fx = Fixture::new();
    fx.capture("a.npt", CAPTURE_A)
        .capture("b.npt", CAPTURE_B)
        .labels("10.0.0.1,A\n10.0.0.2,B\n");
    let first = pipeline::run(&fx.config(AggregatorMode::Index)).unwrap();

    let mut config = PipelineConfig::default();
    config.output.dir = Some(fx.out("learn"));
    let saved = features_file(&first.output_dir, FeatureFormat::Csv);
    let summary = pipeline::learn_only(&config, &saved).unwrap();

    assert_eq!(summary.mode, None);
    assert_eq!(summary.rows, 2);
    assert_eq!(summary.digest, first.digest);
    assert!(!summary.learned);
    let meta = meta(&summary.output_dir);
    assert_eq!(meta["learned_from"].as_str(), saved.to_str());
    assert!(meta.get("input").is_none());
    assert!(meta.get("aggregate").is_none());
    assert_eq!(meta["label_distribution"]["B"].as_integer(), Some(1));
}

#[test]
fn learn_only_without_a_matrix_is_a_configuration_error() {
    let fx = Fixture::new();
    let mut config = PipelineConfig::default();
    config.output.dir = Some(fx.out("learn"));
    let err = pipeline::learn_only(&config, &fx.root().join("missing.csv")).unwrap_err();
    assert!(err.is_configuration());
    assert!(!fx.out("learn").exists());
}

#[cfg(unix)]
mod external {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    fn script(path: &Path, body: &str) -> PathBuf {
        fs::write(path, format!("#!/bin/sh\n{}\n", body)).unwrap();
        fs::set_permissions(path, fs::Permissions::from_mode(0o755)).unwrap();
        path.to_path_buf()
    }

    /// Stand-in tool printing the `.npt` beside each capture; fails for captures without one.
    fn fake_nprint(fx: &Fixture) -> PathBuf {
        script(&fx.root().join("fake-nprint"), r#"cat "${2%.pcap}.npt""#)
    }

    #[test]
    fn unlabeled_captures_are_skipped_before_the_tool_runs() {
        let fx = Fixture::new();
        fx.capture("a.pcap", "")
            .capture("a.npt", CAPTURE_A)
            .capture("b.pcap", "")
            .labels("a,A\n");

        let mut config = fx.config(AggregatorMode::Pcap);
        config.input.kind = InputKind::Pcap;
        config.fingerprint.program = fake_nprint(&fx);
        config.fingerprint.ipv4 = true;
        config.fingerprint.save_output = true;
        let summary = pipeline::run(&config).unwrap();

        assert_eq!(summary.captures, 1);
        assert_eq!(summary.skipped_captures, 1);
        let saved = fs::read_to_string(summary.output_dir.join("nprint/a.npt")).unwrap();
        assert_eq!(saved, CAPTURE_A);

        let meta = meta(&summary.output_dir);
        let tool = meta["tool_command"].as_str().unwrap();
        assert!(tool.ends_with("--pcap_file [input_pcap] --ipv4"), "{tool}");
        assert_eq!(meta["input"]["skipped"][0].as_str(), Some("b"));
    }

    #[test]
    fn tool_failure_surfaces_stderr() {
        let fx = Fixture::new();
        fx.capture("a.pcap", "").labels("a,A\n");

        let mut config = fx.config(AggregatorMode::Pcap);
        config.input.kind = InputKind::Pcap;
        config.fingerprint.program = script(&fx.root().join("broken"), "echo 'bad capture' >&2\nexit 3");
        let err = pipeline::run(&config).unwrap_err();
        match err {
            Error::ExternalTool { diagnostics, .. } => assert!(diagnostics.contains("bad capture")),
            other => panic!("unexpected {other}"),
        }
        assert!(!fx.out("run").exists());
    }

    #[test]
    fn learner_report_lands_in_meta() {
        let fx = Fixture::new();
        fx.capture("a.npt", CAPTURE_A)
            .capture("b.npt", CAPTURE_B)
            .labels("10.0.0.1,A\n10.0.0.2,B\n10.0.0.3,A\n");

        let mut config = fx.config(AggregatorMode::Index);
        config.learn.command = Some(script(
            &fx.root().join("automl"),
            r#"echo '{"accuracy": 0.75, "leaderboard": [{"model": "tree", "score": null}]}'"#,
        ));
        let summary = pipeline::run(&config).unwrap();
        assert!(summary.learned);

        let model = summary.output_dir.join("model");
        assert!(model.join("train.csv").is_file());
        let test = fs::read_to_string(model.join("test.csv")).unwrap();
        // header plus ceil(3 * 0.3) rows
        assert_eq!(test.lines().count(), 2);

        let meta = meta(&summary.output_dir);
        assert_eq!(meta["learn"]["output"]["accuracy"].as_float(), Some(0.75));
        assert_eq!(meta["learn"]["test_rows"].as_integer(), Some(1));
        assert!(meta["learn"]["output"]["leaderboard"][0].get("score").is_none());
    }

    #[test]
    fn learn_only_trains_on_zstd_features() {
        let fx = Fixture::new();
        fx.capture("a.npt", CAPTURE_A)
            .capture("b.npt", CAPTURE_B)
            .labels("10.0.0.1,A\n10.0.0.2,B\n10.0.0.3,A\n");
        let mut config = fx.config(AggregatorMode::Index);
        config.matrix.format = FeatureFormat::CsvZst;
        let first = pipeline::run(&config).unwrap();

        let mut config = PipelineConfig::default();
        config.output.dir = Some(fx.out("learn"));
        config.learn.command = Some(script(&fx.root().join("automl"), r#"echo '{"accuracy": 1.0}'"#));
        let saved = features_file(&first.output_dir, FeatureFormat::CsvZst);
        let summary = pipeline::learn_only(&config, &saved).unwrap();

        assert!(summary.learned);
        let train = fs::read_to_string(summary.output_dir.join("model/train.csv")).unwrap();
        assert!(train.starts_with("index,ipv4_ver_0,ipv4_ver_1,tcp_sprt_0,label\n"));
        let meta = meta(&summary.output_dir);
        assert_eq!(meta["learn"]["train_rows"].as_integer(), Some(2));
        let steps: Vec<&str> = meta["timings"]
            .as_array()
            .unwrap()
            .iter()
            .filter_map(|t| t["step"].as_str())
            .collect();
        assert_eq!(steps, ["load", "learn"]);
    }
}
