//! calltrack - call tracking core of an APM auto-instrumentation agent
//!
//! This library provides span lifecycle management for intercepted host
//! calls, self-time tracking and breakdown metrics per transaction, and the
//! NDJSON serialization of finished events handed to a transport.

pub mod breakdown;
pub mod cli;
pub mod clock;
pub mod config;
pub mod event_sender;
pub mod events;
pub mod instrumentation;
pub mod intercepted;
pub mod interception;
pub mod metadata;
pub mod metric_set;
pub mod replay;
pub mod self_time;
pub mod serialization;
pub mod tracer;
