//! Property-based tests for the NDJSON payload handed to the transport
//!
//! Every line parses on its own, and a transaction with N spans and K errors
//! yields 1 metadata + N span + K error + M metricset + 1 transaction lines,
//! where M is the number of distinct (type, subtype) buckets plus the
//! breakdown-count record.

use calltrack::clock::ManualClock;
use calltrack::config::AgentConfig;
use calltrack::event_sender::{BackendCapability, InMemoryTransport};
use calltrack::intercepted::ThrowableInfo;
use calltrack::tracer::Tracer;
use proptest::prelude::*;
use std::collections::BTreeSet;

const SPAN_TYPES: [&str; 3] = ["db", "external", "cache"];
const SUBTYPES: [Option<&str>; 3] = [None, Some("mysql"), Some("redis")];

#[derive(Debug, Clone)]
struct SpanPlan {
    span_type: usize,
    subtype: usize,
    duration_us: u32,
    throws: bool,
}

fn span_plans() -> impl Strategy<Value = Vec<SpanPlan>> {
    prop::collection::vec(
        (0..SPAN_TYPES.len(), 0..SUBTYPES.len(), 1u32..1_000, any::<bool>()).prop_map(
            |(span_type, subtype, duration_us, throws)| SpanPlan {
                span_type,
                subtype,
                duration_us,
                throws,
            },
        ),
        0..20,
    )
}

fn run(config: AgentConfig, plans: &[SpanPlan]) -> InMemoryTransport {
    let clock = ManualClock::starting_at(1_700_000_000_000_000.0);
    let transport = InMemoryTransport::new();
    let mut tracer = Tracer::with_backend(
        config,
        Box::new(clock.clone()),
        BackendCapability::Loaded(Box::new(transport.clone())),
    );
    tracer.begin_transaction("GET /prop", "request");
    for plan in plans {
        let span = tracer
            .begin_current_span(
                "span",
                SPAN_TYPES[plan.span_type],
                SUBTYPES[plan.subtype],
                None,
            )
            .unwrap();
        clock.advance(f64::from(plan.duration_us));
        if plan.throws {
            tracer.capture_throwable(&ThrowableInfo::new("Exception", "boom"), Some(&span));
        }
        tracer.end_span(span);
        clock.advance(1.0);
    }
    tracer.end_current_transaction();
    transport
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_line_count_matches_events(plans in span_plans()) {
        let transport = run(AgentConfig::default(), &plans);
        let payloads = transport.payloads();
        prop_assert_eq!(payloads.len(), 1);

        let buckets: BTreeSet<(usize, usize)> =
            plans.iter().map(|plan| (plan.span_type, plan.subtype)).collect();
        let errors = plans.iter().filter(|plan| plan.throws).count();
        // + app bucket + breakdown count record
        let metric_sets = buckets.len() + 2;

        let kinds = payloads[0].line_kinds();
        prop_assert_eq!(kinds.len(), payloads[0].lines().count());
        prop_assert_eq!(kinds.len(), 1 + plans.len() + errors + metric_sets + 1);
        prop_assert_eq!(kinds.first().map(String::as_str), Some("metadata"));
        prop_assert_eq!(kinds.last().map(String::as_str), Some("transaction"));
        prop_assert_eq!(kinds.iter().filter(|kind| *kind == "span").count(), plans.len());
        prop_assert_eq!(kinds.iter().filter(|kind| *kind == "metricset").count(), metric_sets);
    }

    #[test]
    fn prop_without_breakdown_only_events_are_sent(plans in span_plans()) {
        let config = AgentConfig {
            breakdown_metrics: false,
            ..AgentConfig::default()
        };
        let transport = run(config, &plans);
        let payloads = transport.payloads();
        let errors = plans.iter().filter(|plan| plan.throws).count();

        prop_assert_eq!(payloads[0].lines().count(), 1 + plans.len() + errors + 1);
        prop_assert!(payloads[0].line_kinds().iter().all(|kind| kind != "metricset"));
        prop_assert_eq!(&payloads[0].serialized_metadata, payloads[0].lines().next().unwrap());
    }
}
