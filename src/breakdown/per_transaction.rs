// Breakdown buckets of one transaction and their metric-set rendering

use super::LeafData;
use super::PerSpanTypeData;
use crate::events::TransactionData;
use crate::metric_set::{MetricSet, MetricSetSpan, MetricSetTransaction, SampleValue};
use std::collections::BTreeMap;

pub const TRANSACTION_BREAKDOWN_COUNT_SAMPLE_KEY: &str = "transaction.breakdown.count";
pub const SPAN_SELF_TIME_COUNT_SAMPLE_KEY: &str = "span.self_time.count";
pub const SPAN_SELF_TIME_SUM_US_SAMPLE_KEY: &str = "span.self_time.sum.us";

/// Span type under which a transaction's own self time is recorded
pub const TRANSACTION_SPAN_TYPE: &str = "app";

/// Self-time buckets of one transaction, keyed by span type
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PerTransaction {
    per_span_type_data: BTreeMap<String, PerSpanTypeData>,
}

impl PerTransaction {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one span of `span_type`/`subtype` with the given self time
    pub fn add_span_self_time(
        &mut self,
        span_type: &str,
        subtype: Option<&str>,
        self_time_in_microseconds: f64,
    ) {
        tracing::trace!(
            span_type,
            subtype,
            self_time_in_microseconds,
            "Adding span self time to breakdown"
        );
        self.per_span_type_data
            .entry(span_type.to_string())
            .or_default()
            .add(subtype, self_time_in_microseconds);
    }

    pub fn is_empty(&self) -> bool {
        self.per_span_type_data.is_empty()
    }

    pub fn per_span_type_data(&self, span_type: &str) -> Option<&PerSpanTypeData> {
        self.per_span_type_data.get(span_type)
    }

    /// Lazily render the buckets as metric sets
    ///
    /// Yields one record per bucket (sorted by span type; for each type the
    /// no-subtype bucket comes before the named subtypes), then a final
    /// record carrying only `transaction.breakdown.count = 1`.
    pub fn metric_sets<'a>(
        &'a self,
        transaction: &'a TransactionData,
    ) -> impl Iterator<Item = MetricSet> + 'a {
        self.per_span_type_data
            .iter()
            .flat_map(move |(span_type, per_span_type)| {
                per_span_type.buckets().map(move |(subtype, leaf)| {
                    let mut metric_set = transaction_metric_set(transaction);
                    metric_set.span = MetricSetSpan {
                        span_type: Some(span_type.clone()),
                        subtype: subtype.map(str::to_string),
                    };
                    set_self_time_samples(leaf, &mut metric_set);
                    metric_set
                })
            })
            .chain(std::iter::once_with(move || {
                let mut metric_set = transaction_metric_set(transaction);
                metric_set
                    .set_sample(TRANSACTION_BREAKDOWN_COUNT_SAMPLE_KEY, SampleValue::Count(1));
                metric_set
            }))
    }

    pub fn for_each_metric_set<F>(&self, transaction: &TransactionData, mut consume: F)
    where
        F: FnMut(MetricSet),
    {
        for metric_set in self.metric_sets(transaction) {
            consume(metric_set);
        }
    }
}

fn transaction_metric_set(transaction: &TransactionData) -> MetricSet {
    let mut metric_set = MetricSet::new(transaction.timestamp);
    metric_set.transaction = Some(MetricSetTransaction {
        name: Some(transaction.name.clone()),
        transaction_type: Some(transaction.transaction_type.clone()),
    });
    metric_set
}

fn set_self_time_samples(leaf: &LeafData, metric_set: &mut MetricSet) {
    metric_set.set_sample(SPAN_SELF_TIME_COUNT_SAMPLE_KEY, SampleValue::Count(leaf.count));
    metric_set.set_sample(
        SPAN_SELF_TIME_SUM_US_SAMPLE_KEY,
        SampleValue::Micros(leaf.sum_microseconds),
    );
}
