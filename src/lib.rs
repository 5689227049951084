//! fingerprint-ml: labeled feature matrices from per-packet binary fingerprints.
//!
//! Modular structure:
//! - [`fingerprint`]: Capture discovery, fingerprinting tool, record parsing
//! - [`label`]: Ground-truth label index
//! - [`aggregate`]: Records → samples (per packet, per capture, per flow)
//! - [`matrix`]: Frozen-schema feature matrix
//! - [`learn`]: AutoML collaborator
//! - [`report`]: Atomic run directory and `meta.toml`
//! - [`pipeline`]: One run end to end
//! - [`logging`]: Structured logging

pub mod config;
pub mod error;
pub mod fingerprint;
pub mod label;
pub mod aggregate;
pub mod matrix;
pub mod learn;
pub mod report;
pub mod pipeline;
pub mod logging;

pub use config::PipelineConfig;
pub use error::{Error, Result};
pub use fingerprint::{Capture, FingerprintRecord, FingerprintSource};
pub use label::{KeySpace, LabelIndex};
pub use aggregate::{Aggregation, Aggregator, FeatureVector, Sample, Schema};
pub use matrix::FeatureMatrix;
pub use learn::Learner;
pub use report::OutputDir;
pub use pipeline::{learn_only, run, RunSummary};
pub use logging::StructuredLogger;
