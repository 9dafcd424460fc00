//! Incremental collector for database introspection statistics.
//!
//! A [`scheduler::Scheduler`] polls a [`source::StatSource`] for each
//! statistic kind, keeps only intervals newer than the kind's watermark and
//! hands them to a [`sink::Sink`].

pub mod agent;
pub mod config;
pub mod dedup;
pub mod export;
pub mod scheduler;
pub mod sink;
pub mod source;
pub mod stats;
pub mod watermark;
