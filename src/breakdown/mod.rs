// Breakdown metrics: self time aggregated per (span type, subtype)
//
// Every ended span contributes its self time to exactly one bucket of its
// transaction's PerTransaction. The transaction's own self time lands in the
// "app" bucket with no subtype. When the transaction ends, the buckets are
// turned into metric sets followed by a single `transaction.breakdown.count`
// record.

mod leaf_data;
mod per_span_type;
mod per_transaction;

pub use leaf_data::LeafData;
pub use per_span_type::PerSpanTypeData;
pub use per_transaction::{
    PerTransaction, SPAN_SELF_TIME_COUNT_SAMPLE_KEY, SPAN_SELF_TIME_SUM_US_SAMPLE_KEY,
    TRANSACTION_BREAKDOWN_COUNT_SAMPLE_KEY, TRANSACTION_SPAN_TYPE,
};

#[cfg(test)]
mod tests;
