//! Column schema: discovered from every capture's field names, then frozen.
//! Once frozen, column names and order never change for the rest of the run.

use super::{FeatureVector, Sample};
use crate::error::{Error, Result};
use crate::fingerprint::Columns;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::trace;

/// Cell value for a field never observed in a sample.
pub const ABSENT: i32 = -1;

/// Aggregator-computed columns appended after the fingerprint fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivedColumn {
    PacketCount,
}

impl DerivedColumn {
    pub fn name(self) -> &'static str {
        match self {
            DerivedColumn::PacketCount => "packet_count",
        }
    }
}

/// Shape of a frozen schema beyond the discovered field names.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    /// Packet slots per sample; above 1 every field repeats as `pkt_<i>_<field>`
    pub packets_per_sample: usize,
    pub derived: Vec<DerivedColumn>,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            packets_per_sample: 1,
            derived: Vec::new(),
        }
    }
}

/// Union of field names in first-seen order.
#[derive(Debug, Default)]
pub struct SchemaBuilder {
    fields: Vec<Arc<str>>,
    known: HashSet<Arc<str>>,
    last: Option<Columns>,
}

impl SchemaBuilder {
    pub fn observe(&mut self, columns: &Columns) {
        // consecutive captures from one tool configuration share a header
        if let Some(last) = &self.last {
            if Arc::ptr_eq(last, columns) || last[..] == columns[..] {
                return;
            }
        }
        for name in columns.iter() {
            if self.known.insert(name.clone()) {
                self.fields.push(name.clone());
            }
        }
        self.last = Some(columns.clone());
    }

    pub fn field_count(&self) -> usize {
        self.fields.len()
    }

    pub fn freeze(self, layout: &Layout) -> Schema {
        let packets = layout.packets_per_sample.max(1);
        let mut columns: Vec<Arc<str>> = Vec::with_capacity(
            self.fields.len() * packets + layout.derived.len(),
        );
        if packets == 1 {
            columns.extend(self.fields.iter().cloned());
        } else {
            for slot in 0..packets {
                for field in &self.fields {
                    columns.push(Arc::from(format!("pkt_{}_{}", slot, field)));
                }
            }
        }
        columns.extend(layout.derived.iter().map(|d| Arc::<str>::from(d.name())));

        let positions = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.clone(), i))
            .collect();

        Schema {
            columns,
            positions,
            field_count: self.fields.len(),
            packets,
            derived: layout.derived.clone(),
        }
    }
}

/// Frozen column schema of the feature matrix.
#[derive(Debug, Clone)]
pub struct Schema {
    columns: Vec<Arc<str>>,
    positions: HashMap<Arc<str>, usize>,
    field_count: usize,
    packets: usize,
    derived: Vec<DerivedColumn>,
}

impl Schema {
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    pub fn columns(&self) -> &[Arc<str>] {
        &self.columns
    }

    pub fn field_count(&self) -> usize {
        self.field_count
    }

    pub fn packets_per_sample(&self) -> usize {
        self.packets
    }

    pub fn derived(&self) -> &[DerivedColumn] {
        &self.derived
    }

    pub fn contains_field(&self, name: &str) -> bool {
        self.positions.contains_key(name)
    }

    /// Dense vector in schema order; unobserved fields become [`ABSENT`].
    pub fn densify(&self, sample: &Sample) -> Result<FeatureVector> {
        let slots = sample.slots();
        if slots.len() > self.packets {
            return Err(Error::Schema(format!(
                "sample {} spans {} packet slots, schema holds {}",
                sample.key,
                slots.len(),
                self.packets
            )));
        }

        let mut values = vec![ABSENT; self.len()];
        for (slot, fields) in slots.iter().enumerate() {
            for (name, bit) in fields {
                let pos = self.positions.get(&**name).ok_or_else(|| {
                    Error::Schema(format!(
                        "field {:?} of sample {} is not in the frozen schema",
                        name, sample.key
                    ))
                })?;
                values[slot * self.field_count + pos] = i32::from(*bit);
            }
        }

        let base = self.field_count * self.packets;
        for (i, derived) in self.derived.iter().enumerate() {
            values[base + i] = match derived {
                DerivedColumn::PacketCount => i32::try_from(sample.packet_count).unwrap_or(i32::MAX),
            };
        }

        Ok(FeatureVector {
            dim: values.len(),
            values,
        })
    }
}

/// Schema discovery followed by the frozen schema. Captures may only be
/// observed while scanning; afterwards unseen fields are rejected.
#[derive(Debug)]
pub enum SchemaStage {
    Scanning(SchemaBuilder),
    Frozen(Arc<Schema>),
}

impl Default for SchemaStage {
    fn default() -> Self {
        SchemaStage::Scanning(SchemaBuilder::default())
    }
}

impl SchemaStage {
    pub fn observe(&mut self, columns: &Columns) -> Result<()> {
        match self {
            SchemaStage::Scanning(builder) => {
                builder.observe(columns);
                trace!(fields = builder.field_count(), "schema scan");
                Ok(())
            }
            SchemaStage::Frozen(schema) => match columns.iter().find(|c| !schema.contains_field(c)) {
                Some(late) => Err(Error::Schema(format!(
                    "field {:?} arrived after the schema was frozen",
                    late
                ))),
                None => Ok(()),
            },
        }
    }

    pub fn freeze(&mut self, layout: &Layout) -> Arc<Schema> {
        let schema = match std::mem::take(self) {
            SchemaStage::Scanning(builder) => Arc::new(builder.freeze(layout)),
            SchemaStage::Frozen(schema) => schema,
        };
        *self = SchemaStage::Frozen(schema.clone());
        schema
    }

    #[cfg(test)]
    pub(crate) fn is_frozen(&self) -> bool {
        matches!(self, SchemaStage::Frozen(_))
    }
}
