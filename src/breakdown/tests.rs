// Tests for breakdown metrics aggregation

use super::*;
use crate::events::{SpanCount, TransactionData};
use crate::metric_set::SampleValue;

fn transaction() -> TransactionData {
    TransactionData {
        name: "GET /users".to_string(),
        transaction_type: "request".to_string(),
        id: "0123456789abcdef".to_string(),
        trace_id: "0123456789abcdef0123456789abcdef".to_string(),
        parent_id: None,
        timestamp: 1_700_000_000_000_000.0,
        duration: 1.0,
        outcome: None,
        result: None,
        sampled: true,
        span_count: SpanCount::default(),
        context: None,
    }
}

#[test]
fn test_leaf_data_add() {
    let mut leaf = LeafData::default();
    leaf.add(10.0);
    leaf.add(5.5);
    assert_eq!(leaf.count, 2);
    assert_eq!(leaf.sum_microseconds, 15.5);
}

#[test]
fn test_empty_per_transaction_yields_single_breakdown_count() {
    let per_transaction = PerTransaction::new();
    let transaction = transaction();
    let metric_sets: Vec<_> = per_transaction.metric_sets(&transaction).collect();

    assert_eq!(metric_sets.len(), 1);
    let only = &metric_sets[0];
    assert!(only.span.is_empty());
    assert_eq!(only.samples.len(), 1);
    assert_eq!(
        only.get_sample(TRANSACTION_BREAKDOWN_COUNT_SAMPLE_KEY),
        Some(SampleValue::Count(1))
    );
    assert_eq!(only.timestamp, transaction.timestamp);
}

#[test]
fn test_no_subtype_and_subtype_buckets_are_disjoint() {
    let mut per_transaction = PerTransaction::new();
    per_transaction.add_span_self_time("db", None, 7.0);
    per_transaction.add_span_self_time("db", Some("mysql"), 3.0);
    per_transaction.add_span_self_time("db", Some(""), 1.0);

    let data = per_transaction.per_span_type_data("db").unwrap();
    assert_eq!(data.no_subtype_data.unwrap().sum_microseconds, 7.0);
    assert_eq!(data.per_subtype_data["mysql"].count, 1);
    assert_eq!(data.per_subtype_data[""].sum_microseconds, 1.0);

    let transaction = transaction();
    let metric_sets: Vec<_> = per_transaction.metric_sets(&transaction).collect();
    assert_eq!(metric_sets.len(), 4);
    assert_eq!(metric_sets[0].span.subtype, None);
    assert_eq!(
        metric_sets[0].get_sample(SPAN_SELF_TIME_SUM_US_SAMPLE_KEY),
        Some(SampleValue::Micros(7.0))
    );
    assert_eq!(metric_sets[1].span.subtype.as_deref(), Some(""));
    assert_eq!(metric_sets[2].span.subtype.as_deref(), Some("mysql"));
}

#[test]
fn test_metric_sets_order_and_samples() {
    let mut per_transaction = PerTransaction::new();
    per_transaction.add_span_self_time("external", Some("http"), 40.0);
    per_transaction.add_span_self_time(TRANSACTION_SPAN_TYPE, None, 25.0);
    per_transaction.add_span_self_time("external", Some("http"), 60.0);

    let transaction = transaction();
    let metric_sets: Vec<_> = per_transaction.metric_sets(&transaction).collect();
    assert_eq!(metric_sets.len(), 3);

    assert_eq!(metric_sets[0].span.span_type.as_deref(), Some("app"));
    assert_eq!(metric_sets[1].span.span_type.as_deref(), Some("external"));
    assert_eq!(
        metric_sets[1].get_sample(SPAN_SELF_TIME_COUNT_SAMPLE_KEY),
        Some(SampleValue::Count(2))
    );
    assert_eq!(
        metric_sets[1].get_sample(SPAN_SELF_TIME_SUM_US_SAMPLE_KEY),
        Some(SampleValue::Micros(100.0))
    );

    let last = metric_sets.last().unwrap();
    assert!(last.span.is_empty());
    assert_eq!(last.samples.len(), 1);
    let last_transaction = last.transaction.as_ref().unwrap();
    assert_eq!(last_transaction.name.as_deref(), Some("GET /users"));
    assert_eq!(last_transaction.transaction_type.as_deref(), Some("request"));
}

#[test]
fn test_for_each_metric_set_matches_iterator() {
    let mut per_transaction = PerTransaction::new();
    per_transaction.add_span_self_time("db", Some("pgsql"), 1.0);
    let transaction = transaction();

    let mut consumed = Vec::new();
    per_transaction.for_each_metric_set(&transaction, |metric_set| consumed.push(metric_set));
    let collected: Vec<_> = per_transaction.metric_sets(&transaction).collect();
    assert_eq!(consumed, collected);
}
