//! Ground-truth labels: a two-column `key,label` CSV with an optional
//! `item,label` header, indexed for O(1) lookup in one explicit key space.

use crate::config::FlowEndpoint;
use crate::error::LabelError;
use crate::fingerprint::{strip_capture_suffix, FlowTuple};
use std::collections::{BTreeSet, HashMap};
use std::io::Read;
use std::net::IpAddr;
use std::path::Path;

/// What the join keys of a label file identify. Keys are normalized per space
/// on load, and samples are looked up only within the space of their mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeySpace {
    /// Tool index values (addresses, ports, ...), compared verbatim
    Index,
    /// Capture identities, `.pcap`/`.npt` suffix stripped
    SourceFile,
    /// Flow endpoints in canonical text form; whole tuples are
    /// direction-normalized
    Flow(FlowEndpoint),
}

impl KeySpace {
    fn normalize(self, raw: &str) -> Result<String, String> {
        match self {
            KeySpace::SourceFile => {
                let unified = raw.replace('\\', "/");
                Ok(strip_capture_suffix(&unified).to_string())
            }
            KeySpace::Flow(FlowEndpoint::Tuple) => raw
                .parse::<FlowTuple>()
                .map(|t| t.canonical().to_string())
                .map_err(|e| format!("key {:?} is not a flow tuple: {}", raw, e)),
            KeySpace::Flow(FlowEndpoint::SrcIp | FlowEndpoint::DstIp) => raw
                .parse::<IpAddr>()
                .map(|ip| ip.to_string())
                .map_err(|e| format!("key {:?} is not an IP address: {}", raw, e)),
            KeySpace::Flow(FlowEndpoint::SrcPort | FlowEndpoint::DstPort) => raw
                .parse::<u16>()
                .map(|port| port.to_string())
                .map_err(|e| format!("key {:?} is not a port: {}", raw, e)),
            KeySpace::Index => Ok(raw.to_string()),
        }
    }
}

fn is_header(key: &str, label: &str) -> bool {
    key.eq_ignore_ascii_case("item") && label.eq_ignore_ascii_case("label")
}

/// Read-only mapping from join key to label.
#[derive(Debug, Clone)]
pub struct LabelIndex {
    space: KeySpace,
    entries: HashMap<String, String>,
}

impl LabelIndex {
    pub fn build(path: &Path, space: KeySpace) -> Result<Self, LabelError> {
        let file = std::fs::File::open(path).map_err(|source| LabelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_reader(path, std::io::BufReader::new(file), space)
    }

    /// `origin` names the source in errors.
    pub fn from_reader<R: Read>(
        origin: &Path,
        reader: R,
        space: KeySpace,
    ) -> Result<Self, LabelError> {
        let malformed = |line: u64, reason: String| LabelError::Malformed {
            path: origin.to_path_buf(),
            line,
            reason,
        };

        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(false)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let mut entries = HashMap::new();
        let mut first_seen: HashMap<String, u64> = HashMap::new();
        let mut first_row = true;

        for result in rdr.records() {
            let record = result.map_err(|e| {
                let line = e.position().map(|p| p.line()).unwrap_or(0);
                malformed(line, e.to_string())
            })?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);

            if record.len() != 2 {
                return Err(malformed(
                    line,
                    format!("expected 2 columns (key, label), found {}", record.len()),
                ));
            }
            let (key, label) = (&record[0], &record[1]);

            if std::mem::take(&mut first_row) && is_header(key, label) {
                continue;
            }
            if key.is_empty() {
                return Err(malformed(line, "empty key".to_string()));
            }
            if label.is_empty() {
                return Err(malformed(line, format!("empty label for key {:?}", key)));
            }

            let key = space.normalize(key).map_err(|reason| malformed(line, reason))?;
            if let Some(&first_line) = first_seen.get(&key) {
                return Err(LabelError::DuplicateKey {
                    path: origin.to_path_buf(),
                    key,
                    first_line,
                    line,
                });
            }
            first_seen.insert(key.clone(), line);
            entries.insert(key, label.to_string());
        }

        Ok(Self { space, entries })
    }

    pub fn space(&self) -> KeySpace {
        self.space
    }

    pub fn lookup(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Distinct labels, sorted.
    pub fn labels(&self) -> BTreeSet<&str> {
        self.entries.values().map(String::as_str).collect()
    }
}
