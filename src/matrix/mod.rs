//! Feature matrix: labeled dense rows over the frozen schema, in aggregation
//! emission order. Never re-sorted, so identical input gives identical output.

mod store;

use crate::aggregate::{Aggregation, Sample, Schema};
use crate::config::{AggregatorMode, LabelPolicy};
use crate::error::{Error, Result};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Write;
use std::sync::Arc;
use tracing::info;

/// Name of the trailing label column.
pub const LABEL_COLUMN: &str = "label";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Row {
    /// Sample key (index value, capture identity, or flow)
    pub id: String,
    pub values: Vec<i32>,
    pub label: String,
}

/// How unlabeled samples are treated, with the sentinel label for `Keep`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelRule {
    pub policy: LabelPolicy,
    pub unlabeled: String,
}

impl Default for LabelRule {
    fn default() -> Self {
        Self {
            policy: LabelPolicy::Drop,
            unlabeled: "unlabeled".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BuildStats {
    pub samples: usize,
    pub rows: usize,
    pub dropped_unlabeled: usize,
    pub kept_unlabeled: usize,
}

/// Train/test row indices.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Split {
    pub train: Vec<usize>,
    pub test: Vec<usize>,
}

#[derive(Debug, Clone)]
pub struct FeatureMatrix {
    index_name: String,
    columns: Vec<Arc<str>>,
    rows: Vec<Row>,
}

impl FeatureMatrix {
    /// Densify `samples` against `schema`, applying the label rule.
    pub fn build(
        schema: &Schema,
        samples: Vec<Sample>,
        rule: &LabelRule,
        index_name: &str,
    ) -> Result<(Self, BuildStats)> {
        let mut stats = BuildStats {
            samples: samples.len(),
            ..Default::default()
        };
        let mut rows = Vec::with_capacity(samples.len());

        for sample in samples {
            let label = match (&sample.label, rule.policy) {
                (Some(label), _) => label.clone(),
                (None, LabelPolicy::Drop) => {
                    stats.dropped_unlabeled += 1;
                    continue;
                }
                (None, LabelPolicy::Keep) => {
                    stats.kept_unlabeled += 1;
                    rule.unlabeled.clone()
                }
            };
            let vector = schema.densify(&sample)?;
            if vector.values.len() != schema.len() {
                return Err(Error::Schema(format!(
                    "row {} has {} values for {} columns",
                    sample.key,
                    vector.values.len(),
                    schema.len()
                )));
            }
            rows.push(Row {
                id: sample.key.to_string(),
                values: vector.values,
                label,
            });
        }

        stats.rows = rows.len();
        info!(
            rows = stats.rows,
            columns = schema.len(),
            dropped_unlabeled = stats.dropped_unlabeled,
            "feature matrix built"
        );
        Ok((
            Self {
                index_name: index_name.to_string(),
                columns: schema.columns().to_vec(),
                rows,
            },
            stats,
        ))
    }

    pub fn from_aggregation(
        aggregation: Aggregation,
        rule: &LabelRule,
        mode: AggregatorMode,
    ) -> Result<(Self, BuildStats)> {
        Self::build(&aggregation.schema, aggregation.samples, rule, mode.as_str())
    }

    pub fn index_name(&self) -> &str {
        &self.index_name
    }

    pub fn columns(&self) -> &[Arc<str>] {
        &self.columns
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn row_count(&self) -> usize {
        self.rows.len()
    }

    pub fn column_count(&self) -> usize {
        self.columns.len()
    }

    /// Drop columns holding one value across every row. Matrices of a
    /// single row are left alone.
    pub fn compress(self) -> Self {
        if self.rows.len() < 2 {
            return self;
        }
        let first = &self.rows[0].values;
        let keep: Vec<usize> = (0..self.columns.len())
            .filter(|&c| self.rows.iter().any(|r| r.values[c] != first[c]))
            .collect();
        if keep.len() == self.columns.len() {
            return self;
        }
        info!(
            before = self.columns.len(),
            after = keep.len(),
            "dropped constant columns"
        );
        let columns = keep.iter().map(|&c| self.columns[c].clone()).collect();
        let rows = self
            .rows
            .into_iter()
            .map(|r| Row {
                values: keep.iter().map(|&c| r.values[c]).collect(),
                id: r.id,
                label: r.label,
            })
            .collect();
        Self {
            index_name: self.index_name,
            columns,
            rows,
        }
    }

    pub fn label_distribution(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for row in &self.rows {
            *out.entry(row.label.clone()).or_insert(0) += 1;
        }
        out
    }

    /// Seeded shuffle into train and test rows; the test share is rounded
    /// up so a non-empty matrix always tests at least one row.
    pub fn split(&self, test_size: f64, seed: u64) -> Split {
        let mut order: Vec<usize> = (0..self.rows.len()).collect();
        let mut rng = StdRng::seed_from_u64(seed);
        order.shuffle(&mut rng);
        let n_test = ((self.rows.len() as f64) * test_size.clamp(0.0, 1.0)).ceil() as usize;
        let train = order.split_off(n_test.min(order.len()));
        Split { train, test: order }
    }

    /// CSV with header `<index>,<columns...>,label`; `only` restricts to given rows.
    pub fn write_csv<W: Write>(&self, writer: W, only: Option<&[usize]>) -> Result<()> {
        let mut wtr = csv::Writer::from_writer(writer);
        let mut header = Vec::with_capacity(self.columns.len() + 2);
        header.push(self.index_name.as_str());
        header.extend(self.columns.iter().map(|c| &**c));
        header.push(LABEL_COLUMN);
        wtr.write_record(&header)?;

        let mut write_row = |row: &Row| -> Result<()> {
            let mut record = Vec::with_capacity(row.values.len() + 2);
            record.push(row.id.clone());
            record.extend(row.values.iter().map(|v| v.to_string()));
            record.push(row.label.clone());
            wtr.write_record(&record)?;
            Ok(())
        };
        match only {
            Some(indices) => {
                for &i in indices {
                    write_row(&self.rows[i])?;
                }
            }
            None => {
                for row in &self.rows {
                    write_row(row)?;
                }
            }
        }
        wtr.flush()?;
        Ok(())
    }

    /// SHA-256 of the CSV rendering, hex encoded.
    pub fn digest(&self) -> Result<String> {
        let mut buf = Vec::new();
        self.write_csv(&mut buf, None)?;
        Ok(format!("{:x}", Sha256::digest(&buf)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aggregate::{Layout, SampleKey, SchemaBuilder};
    use crate::fingerprint::Columns;

    fn schema(names: &[&str]) -> Schema {
        let mut b = SchemaBuilder::default();
        b.observe(&names.iter().map(|n| Arc::<str>::from(*n)).collect::<Columns>());
        b.freeze(&Layout::default())
    }

    fn sample(key: &str, label: Option<&str>, fields: &[(&str, bool)]) -> Sample {
        Sample::new(
            SampleKey::Index(key.to_string()),
            label.map(str::to_string),
            1,
            vec![fields.iter().map(|(n, b)| (Arc::<str>::from(*n), *b)).collect()],
        )
    }

    #[test]
    fn drop_policy_removes_unlabeled_rows() {
        let s = schema(&["a", "b"]);
        let samples = vec![
            sample("x", Some("A"), &[("a", true)]),
            sample("y", None, &[("b", false)]),
        ];
        let (m, stats) = FeatureMatrix::build(&s, samples, &LabelRule::default(), "index").unwrap();
        assert_eq!(m.row_count(), 1);
        assert_eq!(stats.dropped_unlabeled, 1);
        assert_eq!(m.rows()[0].values, [1, -1]);
    }

    #[test]
    fn keep_policy_uses_sentinel() {
        let s = schema(&["a"]);
        let rule = LabelRule {
            policy: LabelPolicy::Keep,
            unlabeled: "?".into(),
        };
        let (m, stats) =
            FeatureMatrix::build(&s, vec![sample("y", None, &[])], &rule, "index").unwrap();
        assert_eq!(m.rows()[0].label, "?");
        assert_eq!(stats.kept_unlabeled, 1);
    }

    #[test]
    fn compress_drops_constant_columns() {
        let s = schema(&["const", "varies"]);
        let samples = vec![
            sample("x", Some("A"), &[("const", true), ("varies", true)]),
            sample("y", Some("B"), &[("const", true), ("varies", false)]),
        ];
        let (m, _) = FeatureMatrix::build(&s, samples, &LabelRule::default(), "index").unwrap();
        let m = m.compress();
        assert_eq!(m.column_count(), 1);
        assert_eq!(&*m.columns()[0], "varies");
        assert_eq!(m.rows()[1].values, [0]);
    }

    #[test]
    fn split_is_deterministic_and_complete() {
        let s = schema(&["a"]);
        let samples = (0..10)
            .map(|i| sample(&i.to_string(), Some("A"), &[]))
            .collect();
        let (m, _) = FeatureMatrix::build(&s, samples, &LabelRule::default(), "index").unwrap();
        let one = m.split(0.3, 7);
        assert_eq!(one, m.split(0.3, 7));
        assert_eq!(one.test.len(), 3);
        let mut all: Vec<usize> = one.train.iter().chain(&one.test).copied().collect();
        all.sort_unstable();
        assert_eq!(all, (0..10).collect::<Vec<_>>());
    }

    #[test]
    fn csv_has_index_columns_and_label() {
        let s = schema(&["a"]);
        let (m, _) = FeatureMatrix::build(
            &s,
            vec![sample("10.0.0.1", Some("A"), &[("a", true)])],
            &LabelRule::default(),
            "index",
        )
        .unwrap();
        let mut out = Vec::new();
        m.write_csv(&mut out, None).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "index,a,label\n10.0.0.1,1,A\n");
        assert_eq!(m.digest().unwrap(), m.digest().unwrap());
    }
}
