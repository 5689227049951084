//! Fingerprint CSV: one header row (index name, field names), one row per packet.
//! Cells are `1`/`0` bits or `-1` for a field whose layer is absent.

use super::{Capture, Columns, FingerprintRecord, FlowTuple};
use crate::error::{Error, Result};
use std::collections::HashSet;
use std::io::Read;
use std::sync::Arc;

fn schema_error(source_file: &str, line: u64, reason: impl Into<String>) -> Error {
    Error::RecordSchema {
        source_file: source_file.to_string(),
        line,
        reason: reason.into(),
    }
}

fn read_error(source_file: &str, fallback_line: u64, e: csv::Error) -> Error {
    let line = e.position().map(|p| p.line()).unwrap_or(fallback_line);
    schema_error(source_file, line, e.to_string())
}

fn parse_bit(cell: &str) -> Option<Option<bool>> {
    match cell {
        "1" => Some(Some(true)),
        "0" => Some(Some(false)),
        "-1" => Some(None),
        _ => None,
    }
}

/// Parse one source file's tool output. With `flow_index` the index column
/// must hold a 5-tuple, which becomes the record's flow.
pub fn read_capture<R: Read>(source_file: &str, reader: R, flow_index: bool) -> Result<Capture> {
    let source: Arc<str> = Arc::from(source_file);
    let mut rdr = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let header = rdr
        .headers()
        .map_err(|e| read_error(source_file, 1, e))?
        .clone();
    if header.is_empty() {
        // no packets and no header: the tool produced nothing for this file
        return Ok(Capture {
            source_file: source,
            columns: Arc::from(Vec::new()),
            records: Vec::new(),
        });
    }
    if header.len() < 2 {
        return Err(schema_error(source_file, 1, "header names no fingerprint fields"));
    }

    let mut seen = HashSet::new();
    for name in header.iter().skip(1) {
        if name.is_empty() {
            return Err(schema_error(source_file, 1, "empty field name in header"));
        }
        if !seen.insert(name) {
            return Err(schema_error(source_file, 1, format!("duplicate field {:?}", name)));
        }
    }
    let columns: Columns = header.iter().skip(1).map(Arc::<str>::from).collect();

    let mut records = Vec::new();
    for (row, result) in rdr.records().enumerate() {
        let sequence_no = row as u64 + 1;
        let record = result.map_err(|e| read_error(source_file, sequence_no + 1, e))?;
        let line = record.position().map(|p| p.line()).unwrap_or(sequence_no + 1);

        if record.len() != header.len() {
            return Err(schema_error(
                source_file,
                line,
                format!("row has {} cells, header has {}", record.len(), header.len()),
            ));
        }

        let index_key = record.get(0).unwrap_or_default().to_string();
        let flow = if flow_index {
            let tuple = index_key
                .parse::<FlowTuple>()
                .map_err(|e| schema_error(source_file, line, format!("flow index: {}", e)))?;
            Some(tuple)
        } else {
            None
        };

        let mut values = Vec::with_capacity(columns.len());
        for (i, cell) in record.iter().enumerate().skip(1) {
            let value = parse_bit(cell).ok_or_else(|| {
                schema_error(
                    source_file,
                    line,
                    format!("field {:?} holds {:?}, expected 1, 0 or -1", &header[i], cell),
                )
            })?;
            values.push(value);
        }

        records.push(FingerprintRecord::new(
            source.clone(),
            index_key,
            flow,
            sequence_no,
            columns.clone(),
            values,
        )?);
    }

    Ok(Capture {
        source_file: source,
        columns,
        records,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
src_ip,ipv4_ver_0,ipv4_ver_1,tcp_ackf_0
10.0.0.1,0,1,-1
10.0.0.2,1,0,1
";

    #[test]
    fn parses_bits_and_absent_fields() {
        let capture = read_capture("a", SAMPLE.as_bytes(), false).unwrap();
        assert_eq!(capture.columns.len(), 3);
        assert_eq!(capture.records.len(), 2);
        let first = &capture.records[0];
        assert_eq!(first.index_key, "10.0.0.1");
        assert_eq!(first.sequence_no, 1);
        assert_eq!(first.get("ipv4_ver_1"), Some(true));
        assert_eq!(first.get("tcp_ackf_0"), None);
        assert_eq!(capture.records[1].sequence_no, 2);
    }

    #[test]
    fn ragged_row_is_a_record_schema_error() {
        let data = "src_ip,a,b\n10.0.0.1,1\n";
        let err = read_capture("a", data.as_bytes(), false).unwrap_err();
        assert!(matches!(err, Error::RecordSchema { line: 2, .. }), "{err}");
    }

    #[test]
    fn undecodable_row_is_a_record_schema_error() {
        let data: &[u8] = b"src_ip,a\n10.0.0.\xff,1\n";
        let err = read_capture("a", data, false).unwrap_err();
        assert!(matches!(err, Error::RecordSchema { line: 2, .. }), "{err}");

        let header: &[u8] = b"src_ip,\xfe\n10.0.0.1,1\n";
        let err = read_capture("a", header, false).unwrap_err();
        assert!(matches!(err, Error::RecordSchema { line: 1, .. }), "{err}");
    }

    #[test]
    fn non_bit_value_is_rejected() {
        let data = "src_ip,a\n10.0.0.1,7\n";
        assert!(matches!(
            read_capture("a", data.as_bytes(), false),
            Err(Error::RecordSchema { .. })
        ));
    }

    #[test]
    fn flow_index_is_parsed_when_requested() {
        let data = "flow,a\n10.0.0.1_10.0.0.2_1000_80_6,1\n";
        let capture = read_capture("a", data.as_bytes(), true).unwrap();
        let flow = capture.records[0].flow.unwrap();
        assert_eq!(flow.dst_port, 80);

        let bad = "flow,a\n10.0.0.1,1\n";
        assert!(read_capture("a", bad.as_bytes(), true).is_err());
    }

    #[test]
    fn empty_output_yields_empty_capture() {
        let capture = read_capture("a", "".as_bytes(), false).unwrap();
        assert!(capture.records.is_empty());
        assert!(capture.columns.is_empty());
    }
}
