//! Aggregation: fingerprint records → labeled samples under one mode.
//!
//! Captures arrive one source file at a time. Per-file and per-flow groups
//! close at the end of their capture, since flows never span files. The
//! field-name union is scanned as captures pass and frozen by [`Aggregator::finish`];
//! samples stay sparse until the matrix densifies them against that schema.

mod reduce;
mod schema;

pub use reduce::{first_observed, packet_slots, present_fields, SparseFields};
pub use schema::{DerivedColumn, Layout, Schema, SchemaBuilder, SchemaStage, ABSENT};

use crate::config::{AggregateConfig, AggregatorMode, FlowEndpoint};
use crate::error::{Error, Result};
use crate::fingerprint::{Capture, FingerprintRecord, FlowKey, FlowTuple};
use crate::label::{KeySpace, LabelIndex};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info, warn};

const UNRESOLVED_EXAMPLES: usize = 4;

/// Fixed-length dense vector in frozen-schema order
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureVector {
    pub dim: usize,
    pub values: Vec<i32>,
}

/// What one sample is grouped by.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SampleKey {
    Index(String),
    File(Arc<str>),
    Flow { source_file: Arc<str>, flow: FlowKey },
}

impl fmt::Display for SampleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SampleKey::Index(key) => f.write_str(key),
            SampleKey::File(path) => f.write_str(path),
            SampleKey::Flow { source_file, flow } => write!(f, "{}@{}", flow, source_file),
        }
    }
}

/// One training sample: grouped records reduced to sparse fields, plus its label.
#[derive(Debug, Clone)]
pub struct Sample {
    pub key: SampleKey,
    pub label: Option<String>,
    pub packet_count: usize,
    slots: Vec<SparseFields>,
}

impl Sample {
    pub fn new(
        key: SampleKey,
        label: Option<String>,
        packet_count: usize,
        slots: Vec<SparseFields>,
    ) -> Self {
        Self {
            key,
            label,
            packet_count,
            slots,
        }
    }

    /// Observed fields per packet slot (a single slot unless samples span packets).
    pub fn slots(&self) -> &[SparseFields] {
        &self.slots
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AggregationStats {
    pub captures: usize,
    pub empty_captures: usize,
    pub records: usize,
    pub samples: usize,
    pub unresolved: usize,
    /// First few join keys without a label
    pub unresolved_examples: Vec<String>,
}

/// Frozen schema plus samples in emission order.
#[derive(Debug, Clone)]
pub struct Aggregation {
    pub schema: Arc<Schema>,
    pub samples: Vec<Sample>,
    pub stats: AggregationStats,
}

/// Label key space a mode joins against.
pub fn key_space(config: &AggregateConfig) -> KeySpace {
    match config.mode {
        AggregatorMode::Index => KeySpace::Index,
        AggregatorMode::Pcap => KeySpace::SourceFile,
        AggregatorMode::Flow => KeySpace::Flow(config.flow_endpoint),
    }
}

fn flow_join_key(initiator: &FlowTuple, endpoint: FlowEndpoint) -> String {
    match endpoint {
        FlowEndpoint::Tuple => initiator.canonical().to_string(),
        FlowEndpoint::SrcIp => initiator.src_ip.to_string(),
        FlowEndpoint::DstIp => initiator.dst_ip.to_string(),
        FlowEndpoint::SrcPort => initiator.src_port.to_string(),
        FlowEndpoint::DstPort => initiator.dst_port.to_string(),
    }
}

/// Records of one index key awaiting chunking (index mode, sample size > 1).
#[derive(Debug, Default)]
struct IndexGroups {
    order: Vec<(String, Vec<FingerprintRecord>)>,
    position: HashMap<String, usize>,
}

impl IndexGroups {
    fn push(&mut self, record: FingerprintRecord) {
        match self.position.get(&record.index_key) {
            Some(&i) => self.order[i].1.push(record),
            None => {
                self.position.insert(record.index_key.clone(), self.order.len());
                self.order.push((record.index_key.clone(), vec![record]));
            }
        }
    }
}

pub struct Aggregator<'a> {
    config: &'a AggregateConfig,
    labels: &'a LabelIndex,
    stage: SchemaStage,
    samples: Vec<Sample>,
    groups: IndexGroups,
    stats: AggregationStats,
}

impl<'a> Aggregator<'a> {
    /// The label index must have been built in this mode's key space.
    pub fn new(config: &'a AggregateConfig, labels: &'a LabelIndex) -> Result<Self> {
        let expected = key_space(config);
        if labels.space() != expected {
            return Err(Error::config(format!(
                "{} aggregation joins {:?} keys but the label index holds {:?} keys",
                config.mode.as_str(),
                expected,
                labels.space()
            )));
        }
        if config.sample_size > 1 && config.mode != AggregatorMode::Index {
            return Err(Error::config("sample size applies to the index aggregator only"));
        }
        Ok(Self {
            config,
            labels,
            stage: SchemaStage::default(),
            samples: Vec::new(),
            groups: IndexGroups::default(),
            stats: AggregationStats::default(),
        })
    }

    fn chunked(&self) -> bool {
        self.config.mode == AggregatorMode::Index && self.config.sample_size > 1
    }

    fn resolve(&mut self, join_key: &str) -> Option<String> {
        self.resolve_many(join_key, 1)
    }

    /// Label shared by `samples` samples of one join key; a miss counts once per sample.
    fn resolve_many(&mut self, join_key: &str, samples: usize) -> Option<String> {
        match self.labels.lookup(join_key) {
            Some(label) => Some(label.to_string()),
            None => {
                debug!(key = join_key, samples, "no label for sample");
                self.stats.unresolved += samples;
                if self.stats.unresolved_examples.len() < UNRESOLVED_EXAMPLES
                    && !self.stats.unresolved_examples.iter().any(|k| k == join_key)
                {
                    self.stats.unresolved_examples.push(join_key.to_string());
                }
                None
            }
        }
    }

    fn emit(&mut self, sample: Sample) {
        self.samples.push(sample);
    }

    /// Consume one source file's complete record batch.
    pub fn push_capture(&mut self, capture: Capture) -> Result<()> {
        let Capture {
            source_file,
            columns,
            mut records,
        } = capture;

        if let Some(bad) = records
            .iter()
            .find(|r| !Arc::ptr_eq(r.columns(), &columns) && r.columns()[..] != columns[..])
        {
            return Err(Error::RecordSchema {
                source_file: source_file.to_string(),
                line: bad.sequence_no + 1,
                reason: "record field set differs from its capture header".to_string(),
            });
        }

        self.stage.observe(&columns)?;
        self.stats.captures += 1;
        self.stats.records += records.len();

        if records.is_empty() {
            warn!(source_file = %source_file, "capture produced no records");
            self.stats.empty_captures += 1;
            return Ok(());
        }
        records.sort_by_key(|r| r.sequence_no);

        match self.config.mode {
            AggregatorMode::Index if self.chunked() => {
                for record in records {
                    self.groups.push(record);
                }
            }
            AggregatorMode::Index => {
                for record in records {
                    let label = self.resolve(&record.index_key);
                    let slots = vec![present_fields(&record)];
                    self.emit(Sample::new(SampleKey::Index(record.index_key), label, 1, slots));
                }
            }
            AggregatorMode::Pcap => {
                let label = self.resolve(&source_file);
                let slots = vec![first_observed(&records)];
                let count = records.len();
                self.emit(Sample::new(SampleKey::File(source_file), label, count, slots));
            }
            AggregatorMode::Flow => self.push_flows(source_file, records)?,
        }
        Ok(())
    }

    fn push_flows(&mut self, source_file: Arc<str>, records: Vec<FingerprintRecord>) -> Result<()> {
        let mut order: Vec<(FlowKey, FlowTuple, Vec<&FingerprintRecord>)> = Vec::new();
        let mut position: HashMap<FlowKey, usize> = HashMap::new();

        for record in &records {
            let (Some(tuple), Some(key)) = (record.flow, record.flow_key()) else {
                return Err(Error::RecordSchema {
                    source_file: source_file.to_string(),
                    line: record.sequence_no + 1,
                    reason: "flow aggregation needs records indexed by flow".to_string(),
                });
            };
            match position.get(&key) {
                Some(&i) => order[i].2.push(record),
                None => {
                    position.insert(key, order.len());
                    order.push((key, tuple, vec![record]));
                }
            }
        }

        debug!(source_file = %source_file, flows = order.len(), "flows closed");
        for (key, initiator, members) in order {
            let label = self.resolve(&flow_join_key(&initiator, self.config.flow_endpoint));
            let slots = vec![first_observed(members.iter().copied())];
            self.emit(Sample::new(
                SampleKey::Flow {
                    source_file: source_file.clone(),
                    flow: key,
                },
                label,
                members.len(),
                slots,
            ));
        }
        Ok(())
    }

    /// Close open groups and freeze the schema.
    pub fn finish(mut self) -> Result<Aggregation> {
        let size = self.config.sample_size;
        for (index_key, records) in std::mem::take(&mut self.groups.order) {
            let chunks = packet_slots(&records, size);
            let label = self.resolve_many(&index_key, chunks.len());
            for chunk in chunks {
                let count = chunk.len();
                self.emit(Sample::new(
                    SampleKey::Index(index_key.clone()),
                    label.clone(),
                    count,
                    chunk,
                ));
            }
        }

        let layout = match self.config.mode {
            AggregatorMode::Index if !self.chunked() => Layout::default(),
            AggregatorMode::Index => Layout {
                packets_per_sample: size,
                derived: vec![DerivedColumn::PacketCount],
            },
            AggregatorMode::Pcap | AggregatorMode::Flow => Layout {
                packets_per_sample: 1,
                derived: vec![DerivedColumn::PacketCount],
            },
        };
        let schema = self.stage.freeze(&layout);

        self.stats.samples = self.samples.len();
        if self.stats.unresolved > 0 {
            warn!(
                unresolved = self.stats.unresolved,
                examples = ?self.stats.unresolved_examples,
                "samples without a matching label"
            );
        }
        info!(
            mode = self.config.mode.as_str(),
            captures = self.stats.captures,
            records = self.stats.records,
            samples = self.stats.samples,
            columns = schema.len(),
            "aggregation complete"
        );

        Ok(Aggregation {
            schema,
            samples: self.samples,
            stats: self.stats,
        })
    }
}

/// Aggregate an in-memory batch of captures in one call.
pub fn aggregate<I>(config: &AggregateConfig, labels: &LabelIndex, captures: I) -> Result<Aggregation>
where
    I: IntoIterator<Item = Result<Capture>>,
{
    let mut aggregator = Aggregator::new(config, labels)?;
    for capture in captures {
        aggregator.push_capture(capture?)?;
    }
    aggregator.finish()
}
