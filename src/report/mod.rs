//! Run artifacts. Everything is staged in a hidden directory beside the
//! destination and moved into place only once the run has succeeded, so a
//! failed run leaves nothing behind.
//!
//! Layout of a committed run:
//! - `feature/features.csv[.zst]` frozen feature matrix (unless saving is off)
//! - `meta.toml` run parameters and results
//! - `model/` learner artifacts
//! - `nprint/` raw tool output (when saved)

mod meta;

pub use meta::{json_to_toml, AggregateMeta, InputMeta, MatrixMeta, Meta, StepTiming, Timings};
pub(crate) use meta::learn_table;

use crate::error::{Error, Result};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;
use tracing::{debug, info};

/// Parent of generated run directories.
pub const DEFAULT_BASE: &str = "fingerprint-ml";

const RUN_WORDS: &[&str] = &[
    "aardvark", "bison", "canary", "dalmation", "emu", "falcon", "gnu", "hamster", "impala",
    "jellyfish", "kiwi", "lemur", "manatee", "nutria", "okapi", "porcupine", "quetzal",
    "roadrunner", "seal", "turtle", "unicorn", "vole", "wombat", "xerus", "yak", "zebra",
];

/// `<base>/run-<word>-<epoch>-<pid>`. The word follows the alphabetically
/// last one already used under `base`, wrapping around after the last.
pub fn default_output_dir(base: &Path) -> PathBuf {
    let last_used = fs::read_dir(base)
        .into_iter()
        .flatten()
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().to_ascii_lowercase();
            let word = name.strip_prefix("run-")?.split('-').next()?.to_string();
            RUN_WORDS.contains(&word.as_str()).then_some(word)
        })
        .max();

    let next = match last_used {
        Some(word) => RUN_WORDS
            .iter()
            .position(|w| *w == word)
            .map(|i| RUN_WORDS[(i + 1) % RUN_WORDS.len()])
            .unwrap_or(RUN_WORDS[0]),
        None => RUN_WORDS[0],
    };
    base.join(format!(
        "run-{}-{}-{}",
        next,
        chrono::Utc::now().timestamp(),
        std::process::id()
    ))
}

/// Staged output directory; dropped without [`OutputDir::commit`] it is removed.
#[derive(Debug)]
pub struct OutputDir {
    dest: PathBuf,
    staging: TempDir,
}

impl OutputDir {
    /// `dest` must be missing or an empty directory.
    pub fn create(dest: &Path) -> Result<Self> {
        if dest.exists() {
            if !dest.is_dir() {
                return Err(Error::config(format!(
                    "output path exists and is not a directory: {}",
                    dest.display()
                )));
            }
            if fs::read_dir(dest)?.next().is_some() {
                return Err(Error::config(format!(
                    "output directory non-empty: {}",
                    dest.display()
                )));
            }
        }
        let name = dest
            .file_name()
            .ok_or_else(|| Error::config(format!("invalid output path: {}", dest.display())))?
            .to_string_lossy()
            .into_owned();
        let parent = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;

        let staging = tempfile::Builder::new()
            .prefix(&format!(".{}.", name))
            .tempdir_in(&parent)?;
        fs::create_dir(staging.path().join("feature"))?;
        fs::create_dir(staging.path().join("model"))?;
        debug!(staging = %staging.path().display(), "output staged");

        Ok(Self {
            dest: dest.to_path_buf(),
            staging,
        })
    }

    /// Where the run will land on commit.
    pub fn destination(&self) -> &Path {
        &self.dest
    }

    /// Staging root; artifacts are written here until commit.
    pub fn path(&self) -> &Path {
        self.staging.path()
    }

    pub fn feature_dir(&self) -> PathBuf {
        self.path().join("feature")
    }

    pub fn model_dir(&self) -> PathBuf {
        self.path().join("model")
    }

    pub fn nprint_dir(&self) -> PathBuf {
        self.path().join("nprint")
    }

    pub fn meta_path(&self) -> PathBuf {
        self.path().join("meta.toml")
    }

    /// Move the staged tree to its destination.
    pub fn commit(self) -> Result<PathBuf> {
        let Self { dest, staging } = self;
        if dest.is_dir() {
            // only ever empty here; fails otherwise
            fs::remove_dir(&dest)?;
        }
        let staged = staging.into_path();
        if let Err(e) = fs::rename(&staged, &dest) {
            let _ = fs::remove_dir_all(&staged);
            return Err(e.into());
        }
        info!(dir = %dest.display(), "run output committed");
        Ok(dest)
    }
}
