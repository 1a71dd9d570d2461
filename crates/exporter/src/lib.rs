//! Queued, retrying HTTP exporter for metric batches.
//!
//! A [`pipeline::Pipeline`] accepts [`model::MetricBatch`]es, flattens each
//! one into JSON [`record::Record`]s and POSTs them to a collector through a
//! [`delivery::Deliver`] implementation, retrying transient failures with
//! [`backoff::ExponentialBackoff`].

pub mod backoff;
pub mod config;
pub mod convert;
pub mod delivery;
pub mod ingest;
pub mod model;
pub mod pipeline;
pub mod record;

#[cfg(test)]
mod testing;
