//! Fingerprint records as produced by the external fingerprinting tool.
//! One record per packet, grouped into one [`Capture`] per source file.

mod parse;
mod source;

pub use parse::read_capture;
pub use source::{discover, strip_capture_suffix, CaptureInput, FingerprintSource, NprintTool};

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::sync::Arc;

/// Field names of one tool output, shared by every record parsed from it.
pub type Columns = Arc<[Arc<str>]>;

/// A 5-tuple as seen on the wire (initiator first).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FlowTuple {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub protocol: u8,
}

/// Direction-normalized flow identity: a flow and its reverse map to the same key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FlowKey {
    pub ip_a: IpAddr,
    pub ip_b: IpAddr,
    pub port_a: u16,
    pub port_b: u16,
    pub protocol: u8,
}

impl FlowTuple {
    /// Normalized so the smaller (address, port) endpoint is always first
    pub fn canonical(&self) -> FlowKey {
        if (self.src_ip, self.src_port) <= (self.dst_ip, self.dst_port) {
            FlowKey {
                ip_a: self.src_ip,
                ip_b: self.dst_ip,
                port_a: self.src_port,
                port_b: self.dst_port,
                protocol: self.protocol,
            }
        } else {
            FlowKey {
                ip_a: self.dst_ip,
                ip_b: self.src_ip,
                port_a: self.dst_port,
                port_b: self.src_port,
                protocol: self.protocol,
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            src_port: self.dst_port,
            dst_port: self.src_port,
            protocol: self.protocol,
        }
    }
}

fn parse_protocol(s: &str) -> Option<u8> {
    match s.to_ascii_lowercase().as_str() {
        "tcp" => Some(6),
        "udp" => Some(17),
        "icmp" => Some(1),
        "icmpv6" | "icmp6" => Some(58),
        other => other.parse().ok(),
    }
}

impl FromStr for FlowTuple {
    type Err = String;

    /// `src_ip dst_ip src_port dst_port proto`, separated by `_` or whitespace.
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let parts: Vec<&str> = s
            .split(|c: char| c == '_' || c.is_whitespace())
            .filter(|p| !p.is_empty())
            .collect();
        let [src_ip, dst_ip, src_port, dst_port, protocol] = parts[..] else {
            return Err(format!("expected 5 flow tuple fields, got {}", parts.len()));
        };
        let ip = |v: &str| v.parse::<IpAddr>().map_err(|_| format!("invalid address {:?}", v));
        let port = |v: &str| v.parse::<u16>().map_err(|_| format!("invalid port {:?}", v));
        Ok(Self {
            src_ip: ip(src_ip)?,
            dst_ip: ip(dst_ip)?,
            src_port: port(src_port)?,
            dst_port: port(dst_port)?,
            protocol: parse_protocol(protocol)
                .ok_or_else(|| format!("invalid protocol {:?}", protocol))?,
        })
    }
}

impl fmt::Display for FlowTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.src_ip, self.dst_ip, self.src_port, self.dst_port, self.protocol
        )
    }
}

impl fmt::Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}_{}",
            self.ip_a, self.ip_b, self.port_a, self.port_b, self.protocol
        )
    }
}

/// One packet's fingerprint. `None` values mark protocol layers absent from the packet.
#[derive(Debug, Clone)]
pub struct FingerprintRecord {
    pub source_file: Arc<str>,
    pub index_key: String,
    pub flow: Option<FlowTuple>,
    /// 1-based position within its source file
    pub sequence_no: u64,
    columns: Columns,
    values: Vec<Option<bool>>,
}

impl FingerprintRecord {
    pub fn new(
        source_file: Arc<str>,
        index_key: String,
        flow: Option<FlowTuple>,
        sequence_no: u64,
        columns: Columns,
        values: Vec<Option<bool>>,
    ) -> Result<Self> {
        if values.len() != columns.len() {
            return Err(Error::RecordSchema {
                source_file: source_file.to_string(),
                line: sequence_no + 1,
                reason: format!(
                    "record has {} values for {} fields",
                    values.len(),
                    columns.len()
                ),
            });
        }
        Ok(Self {
            source_file,
            index_key,
            flow,
            sequence_no,
            columns,
            values,
        })
    }

    /// Direction-normalized flow, when the record was indexed by flow.
    pub fn flow_key(&self) -> Option<FlowKey> {
        self.flow.as_ref().map(FlowTuple::canonical)
    }

    pub fn columns(&self) -> &Columns {
        &self.columns
    }

    /// Field name and value pairs in tool column order.
    pub fn fields(&self) -> impl Iterator<Item = (&Arc<str>, Option<bool>)> + '_ {
        self.columns.iter().zip(self.values.iter().copied())
    }

    #[cfg(test)]
    pub(crate) fn get(&self, name: &str) -> Option<bool> {
        self.columns
            .iter()
            .position(|n| &**n == name)
            .and_then(|i| self.values[i])
    }
}

/// All records of one source file; its end closes per-file and per-flow groups.
#[derive(Debug, Clone)]
pub struct Capture {
    pub source_file: Arc<str>,
    pub columns: Columns,
    pub records: Vec<FingerprintRecord>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flow_tuple_parses_underscore_and_whitespace() {
        let a: FlowTuple = "10.0.0.1_10.0.0.2_1234_80_6".parse().unwrap();
        let b: FlowTuple = "10.0.0.1 10.0.0.2 1234 80 tcp".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.protocol, 6);
    }

    #[test]
    fn flow_tuple_rejects_short_input() {
        assert!("10.0.0.1_10.0.0.2_1234".parse::<FlowTuple>().is_err());
        assert!("10.0.0.1_nope_1234_80_6".parse::<FlowTuple>().is_err());
    }

    #[test]
    fn reverse_direction_shares_canonical_key() {
        let fwd: FlowTuple = "192.168.1.5_10.0.0.1_51000_443_6".parse().unwrap();
        assert_eq!(fwd.canonical(), fwd.reversed().canonical());
        assert_eq!(fwd.canonical().to_string(), "10.0.0.1_192.168.1.5_443_51000_6");
    }

    #[test]
    fn ipv6_tuple_roundtrips_through_display() {
        let t: FlowTuple = "fe80::1_fe80::2_546_547_17".parse().unwrap();
        assert_eq!(t.to_string().parse::<FlowTuple>().unwrap(), t);
    }

    #[test]
    fn record_width_must_match_columns() {
        let columns: Columns = vec![Arc::from("a"), Arc::from("b")].into();
        let err = FingerprintRecord::new(
            Arc::from("f"),
            "k".into(),
            None,
            1,
            columns,
            vec![Some(true)],
        )
        .unwrap_err();
        assert!(matches!(err, Error::RecordSchema { .. }));
    }
}
