//! Reduction of grouped records into sparse per-sample fields.
//! Bits are never summed or averaged: a sample keeps the first value observed.

use crate::fingerprint::FingerprintRecord;
use std::collections::HashSet;
use std::sync::Arc;

/// Fields observed in one packet slot of a sample.
pub type SparseFields = Vec<(Arc<str>, bool)>;

/// Fields present in a single record.
pub fn present_fields(record: &FingerprintRecord) -> SparseFields {
    record
        .fields()
        .filter_map(|(name, value)| value.map(|bit| (name.clone(), bit)))
        .collect()
}

/// Field-wise union over `records` (expected in `sequence_no` order): each
/// field takes its value from the first record in which it is present.
pub fn first_observed<'a, I>(records: I) -> SparseFields
where
    I: IntoIterator<Item = &'a FingerprintRecord>,
{
    let mut seen: HashSet<&'a str> = HashSet::new();
    let mut out = Vec::new();
    for record in records {
        for (name, value) in record.fields() {
            if let Some(bit) = value {
                if seen.insert(&**name) {
                    out.push((name.clone(), bit));
                }
            }
        }
    }
    out
}

/// Consecutive runs of `size` packets, one slot per packet. The final run
/// may be short; its missing slots stay absent.
pub fn packet_slots(records: &[FingerprintRecord], size: usize) -> Vec<Vec<SparseFields>> {
    records
        .chunks(size.max(1))
        .map(|chunk| chunk.iter().map(present_fields).collect())
        .collect()
}
