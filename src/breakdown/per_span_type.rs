// Buckets of one span type, keyed by subtype

use super::LeafData;
use std::collections::BTreeMap;

/// Per-subtype buckets of one span type
///
/// Spans without a subtype go to a dedicated slot that never collides with a
/// named subtype, not even one spelled as an empty string.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerSpanTypeData {
    pub no_subtype_data: Option<LeafData>,
    pub per_subtype_data: BTreeMap<String, LeafData>,
}

impl PerSpanTypeData {
    pub fn add(&mut self, subtype: Option<&str>, self_time_in_microseconds: f64) {
        let leaf = match subtype {
            None => self.no_subtype_data.get_or_insert_with(LeafData::default),
            Some(subtype) => self.per_subtype_data.entry(subtype.to_string()).or_default(),
        };
        leaf.add(self_time_in_microseconds);
    }

    /// No-subtype bucket first (if any), then named subtypes in sorted order
    pub fn buckets(&self) -> impl Iterator<Item = (Option<&str>, &LeafData)> {
        self.no_subtype_data
            .iter()
            .map(|leaf| (None, leaf))
            .chain(
                self.per_subtype_data
                    .iter()
                    .map(|(subtype, leaf)| (Some(subtype.as_str()), leaf)),
            )
    }
}
