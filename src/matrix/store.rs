//! Saved matrices: the CSV rendering, optionally inside a zstd frame, and
//! the reverse for learning from an earlier run's features.

use super::{FeatureMatrix, Row, LABEL_COLUMN};
use crate::config::FeatureFormat;
use crate::error::{Error, Result};
use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;
use std::sync::Arc;
use tracing::info;

const ZSTD_LEVEL: i32 = 3;

fn malformed(origin: &str, line: u64, reason: impl Into<String>) -> Error {
    Error::RecordSchema {
        source_file: origin.to_string(),
        line,
        reason: reason.into(),
    }
}

impl FeatureMatrix {
    /// Write the full matrix to `path` in `format`.
    pub fn save(&self, path: &Path, format: FeatureFormat) -> Result<()> {
        let mut out = BufWriter::new(File::create(path)?);
        match format {
            FeatureFormat::Csv => self.write_csv(&mut out, None)?,
            FeatureFormat::CsvZst => {
                let mut encoder = zstd::stream::write::Encoder::new(&mut out, ZSTD_LEVEL)?;
                self.write_csv(&mut encoder, None)?;
                encoder.finish()?;
            }
        }
        out.flush()?;
        info!(path = %path.display(), rows = self.row_count(), "feature matrix saved");
        Ok(())
    }

    /// Read a matrix saved by [`FeatureMatrix::save`]; the format follows the extension.
    pub fn load(path: &Path) -> Result<Self> {
        let file = BufReader::new(File::open(path)?);
        let origin = path.display().to_string();
        match FeatureFormat::of_path(path) {
            FeatureFormat::Csv => Self::read_csv(&origin, file),
            FeatureFormat::CsvZst => Self::read_csv(&origin, zstd::stream::read::Decoder::new(file)?),
        }
    }

    /// Parse `<index>,<columns...>,label` CSV. `origin` names the source in errors.
    pub fn read_csv<R: Read>(origin: &str, reader: R) -> Result<Self> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .from_reader(reader);
        let read_error = |e: csv::Error| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            malformed(origin, line, e.to_string())
        };

        let header = rdr.headers().map_err(read_error)?.clone();
        if header.len() < 2 || header.get(header.len() - 1) != Some(LABEL_COLUMN) {
            return Err(malformed(
                origin,
                1,
                format!("header must start with the index and end with {:?}", LABEL_COLUMN),
            ));
        }
        let width = header.len();
        let index_name = header[0].to_string();
        let columns: Vec<Arc<str>> = header
            .iter()
            .skip(1)
            .take(width - 2)
            .map(Arc::<str>::from)
            .collect();

        let mut rows = Vec::new();
        for result in rdr.records() {
            let record = result.map_err(read_error)?;
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            if record.len() != width {
                return Err(malformed(
                    origin,
                    line,
                    format!("row has {} cells, header has {}", record.len(), width),
                ));
            }
            let values = record
                .iter()
                .skip(1)
                .take(width - 2)
                .map(|cell| cell.trim().parse::<i32>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|e| malformed(origin, line, format!("feature cell: {}", e)))?;
            rows.push(Row {
                id: record[0].to_string(),
                values,
                label: record[width - 1].to_string(),
            });
        }

        Ok(Self {
            index_name,
            columns,
            rows,
        })
    }
}
