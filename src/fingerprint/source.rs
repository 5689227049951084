//! Capture discovery and the fingerprinting tool boundary. Yields one
//! [`Capture`] per input file, strictly in discovery order.

use super::{read_capture, Capture};
use crate::config::{FingerprintConfig, InputConfig, InputKind, PipelineConfig, WriteIndex};
use crate::error::{Error, Result};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, info};
use walkdir::WalkDir;

const CAPTURE_SUFFIXES: &[&str] = &[".pcapng", ".pcap", ".npt"];

/// One input file and the identity its samples and labels are keyed by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureInput {
    pub path: PathBuf,
    pub identity: String,
}

/// Remove a trailing capture/fingerprint suffix (case-insensitive).
pub fn strip_capture_suffix(name: &str) -> &str {
    let lower = name.to_ascii_lowercase();
    for suffix in CAPTURE_SUFFIXES {
        if lower.ends_with(suffix) && name.len() > suffix.len() {
            return &name[..name.len() - suffix.len()];
        }
    }
    name
}

fn identity_of(relative: &Path) -> String {
    let joined = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/");
    strip_capture_suffix(&joined).to_string()
}

fn wanted(path: &Path, kind: InputKind) -> bool {
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match kind {
        InputKind::Pcap => ext == "pcap" || ext == "pcapng",
        InputKind::Nprint => ext == "npt",
    }
}

/// Expand input files and directories into capture inputs. Directory
/// contents are sorted so repeated runs see the same order.
pub fn discover(input: &InputConfig) -> Result<Vec<CaptureInput>> {
    let mut out = Vec::new();
    for root in &input.paths {
        if root.is_file() {
            let name = root
                .file_name()
                .map(PathBuf::from)
                .unwrap_or_else(|| root.clone());
            out.push(CaptureInput {
                path: root.clone(),
                identity: identity_of(&name),
            });
            continue;
        }
        if !root.is_dir() {
            return Err(Error::config(format!("input not found: {}", root.display())));
        }

        let max_depth = if input.recursive { usize::MAX } else { 1 };
        let mut found = Vec::new();
        for entry in WalkDir::new(root)
            .max_depth(max_depth)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = entry.map_err(|e| Error::config(format!("cannot scan {}: {}", root.display(), e)))?;
            let path = entry.path();
            if !entry.file_type().is_file() || !wanted(path, input.kind) {
                continue;
            }
            let relative = path.strip_prefix(root).unwrap_or(path);
            found.push(CaptureInput {
                path: path.to_path_buf(),
                identity: identity_of(relative),
            });
        }
        if found.is_empty() {
            return Err(Error::config(format!(
                "no capture files found in directory: {}",
                root.display()
            )));
        }
        debug!(dir = %root.display(), count = found.len(), "discovered captures");
        out.extend(found);
    }

    let mut seen = std::collections::HashSet::new();
    for c in &out {
        if !seen.insert(c.identity.as_str()) {
            return Err(Error::config(format!(
                "two inputs share the capture identity {:?}",
                c.identity
            )));
        }
    }
    Ok(out)
}

/// Argument builder and runner for the external fingerprinting tool.
#[derive(Debug, Clone)]
pub struct NprintTool {
    program: PathBuf,
    flags: Vec<String>,
}

impl NprintTool {
    pub fn new(config: &FingerprintConfig, write_index: Option<WriteIndex>) -> Self {
        let mut flags = Vec::new();
        let toggles = [
            (config.ipv4, "--ipv4"),
            (config.ipv6, "--ipv6"),
            (config.tcp, "--tcp"),
            (config.udp, "--udp"),
            (config.icmp, "--icmp"),
            (config.eth, "--eth"),
            (config.radiotap, "--radiotap"),
            (config.wlan, "--wlan"),
        ];
        for (on, flag) in toggles {
            if on {
                flags.push(flag.to_string());
            }
        }
        if let Some(n) = config.payload {
            flags.push("--payload".to_string());
            flags.push(n.to_string());
        }
        if let Some(n) = config.count {
            flags.push("--count".to_string());
            flags.push(n.to_string());
        }
        let filters = [
            ("--nprint_filter", &config.nprint_filter),
            ("--filter", &config.filter),
        ];
        for (flag, value) in filters {
            if let Some(value) = value {
                flags.push(flag.to_string());
                flags.push(value.clone());
            }
        }
        if let Some(index) = write_index {
            flags.push("--write_index".to_string());
            flags.push(index.code().to_string());
        }
        Self {
            program: config.program.clone(),
            flags,
        }
    }

    fn name(&self) -> String {
        self.program.display().to_string()
    }

    pub fn argv(&self, pcap: &Path) -> Vec<OsString> {
        let mut argv: Vec<OsString> = vec!["--pcap_file".into(), pcap.as_os_str().to_owned()];
        argv.extend(self.flags.iter().map(OsString::from));
        argv
    }

    /// Command line with a placeholder input, as recorded in run metadata.
    pub fn command_line(&self) -> String {
        let mut parts = vec![self.name(), "--pcap_file".to_string(), "[input_pcap]".to_string()];
        parts.extend(self.flags.iter().map(|f| {
            if f.contains(char::is_whitespace) {
                format!("{:?}", f)
            } else {
                f.clone()
            }
        }));
        parts.join(" ")
    }

    /// Run the tool over one capture, returning its standard output.
    pub fn run(&self, pcap: &Path) -> Result<Vec<u8>> {
        let output = Command::new(&self.program)
            .args(self.argv(pcap))
            .stdin(Stdio::null())
            .output()
            .map_err(|e| {
                let reason = if e.kind() == ErrorKind::NotFound {
                    "command could not be found on PATH".to_string()
                } else {
                    format!("could not start: {}", e)
                };
                Error::ExternalTool {
                    tool: self.name(),
                    reason,
                    diagnostics: String::new(),
                }
            })?;
        if !output.status.success() {
            return Err(Error::ExternalTool {
                tool: self.name(),
                reason: format!("{} on {}", output.status, pcap.display()),
                diagnostics: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(output.stdout)
    }
}

/// Sequential stream of captures for one run.
pub struct FingerprintSource {
    inputs: Vec<CaptureInput>,
    kind: InputKind,
    flow_index: bool,
    tool: NprintTool,
    save_dir: Option<PathBuf>,
}

impl FingerprintSource {
    /// `save_dir` receives raw tool output when saving is enabled.
    pub fn new(config: &PipelineConfig, save_dir: Option<PathBuf>) -> Result<Self> {
        let inputs = discover(&config.input)?;
        let write_index = config.effective_write_index();
        info!(count = inputs.len(), kind = ?config.input.kind, "capture inputs");
        Ok(Self {
            inputs,
            kind: config.input.kind,
            flow_index: write_index == Some(WriteIndex::Flow),
            tool: NprintTool::new(&config.fingerprint, write_index),
            save_dir,
        })
    }

    pub fn inputs(&self) -> &[CaptureInput] {
        &self.inputs
    }

    /// Drop inputs rejected by `keep`; returns the skipped identities.
    pub fn retain(&mut self, mut keep: impl FnMut(&CaptureInput) -> bool) -> Vec<String> {
        let mut skipped = Vec::new();
        self.inputs.retain(|c| {
            let k = keep(c);
            if !k {
                skipped.push(c.identity.clone());
            }
            k
        });
        skipped
    }

    /// Tool invocation recorded in run metadata; `None` for pre-generated input.
    pub fn command_line(&self) -> Option<String> {
        match self.kind {
            InputKind::Pcap => Some(self.tool.command_line()),
            InputKind::Nprint => None,
        }
    }

    fn load(&self, input: &CaptureInput) -> Result<Capture> {
        match self.kind {
            InputKind::Nprint => {
                let file = std::fs::File::open(&input.path)?;
                read_capture(&input.identity, std::io::BufReader::new(file), self.flow_index)
            }
            InputKind::Pcap => {
                let stdout = self.tool.run(&input.path)?;
                if let Some(dir) = &self.save_dir {
                    let out = dir.join(format!("{}.npt", input.identity));
                    if let Some(parent) = out.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&out, &stdout)?;
                }
                read_capture(&input.identity, stdout.as_slice(), self.flow_index)
            }
        }
    }

    pub fn captures(&self) -> impl Iterator<Item = Result<Capture>> + '_ {
        self.inputs.iter().map(move |input| {
            let capture = self.load(input)?;
            debug!(
                source_file = %input.identity,
                records = capture.records.len(),
                "capture loaded"
            );
            Ok(capture)
        })
    }
}
