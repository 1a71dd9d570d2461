use thiserror::Error;
use tracing::warn;

use crate::model::{HistogramDataPoint, Labels, Metric, MetricBatch, MetricData, NumberDataPoint};
use crate::record::{Payload, Record, RecordType};

const NANOS_PER_SEC: u64 = 1_000_000_000;

/// Failure to turn converted records into a request body.
#[derive(Debug, Error)]
pub enum ConversionError {
    #[error("failed to marshal payload: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("gzip compression failed: {0}")]
    Compression(std::io::Error),
}

/// Something odd the converter noticed without failing the batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConversionWarning {
    /// Skipped; its type has no record mapping.
    UnsupportedMetric { name: String, kind: String },
    /// Skipped; a record without a name cannot be attributed.
    UnnamedMetric {
        resource: usize,
        scope: usize,
        metric: usize,
    },
    /// Still emitted; the value is written as `null`.
    NonFiniteValue { name: String },
}

pub type ConversionWarnings = Vec<ConversionWarning>;

/// Flatten a batch into wire records.
///
/// Records come out in traversal order: resource group, scope, metric, data
/// point. Resource labels are copied onto every record of their group. A bad
/// metric only costs its own records, never the rest of the batch.
pub fn convert(batch: &MetricBatch) -> (Payload, ConversionWarnings) {
    let mut out = Flattener::default();

    for (r, resource) in batch.resource_groups.iter().enumerate() {
        for (s, scope) in resource.scopes.iter().enumerate() {
            for (m, metric) in scope.metrics.iter().enumerate() {
                if metric.name.is_empty() {
                    warn!(resource = r, scope = s, metric = m, "skipping metric without a name");
                    out.warnings.push(ConversionWarning::UnnamedMetric {
                        resource: r,
                        scope: s,
                        metric: m,
                    });
                    continue;
                }
                out.metric(metric, &resource.labels);
            }
        }
    }

    (Payload { metrics: out.records }, out.warnings)
}

#[derive(Default)]
struct Flattener {
    records: Vec<Record>,
    warnings: ConversionWarnings,
}

impl Flattener {
    fn metric(&mut self, metric: &Metric, resource_labels: &Labels) {
        match &metric.data {
            MetricData::Gauge { data_points } => {
                self.numbers(metric, data_points, RecordType::Gauge, resource_labels)
            }
            MetricData::Counter { data_points } => {
                self.numbers(metric, data_points, RecordType::Counter, resource_labels)
            }
            MetricData::Histogram { data_points } => {
                self.histograms(metric, data_points, resource_labels)
            }
            MetricData::Unsupported { kind } => {
                warn!(metric = %metric.name, kind = %kind, "unsupported metric type");
                self.warnings.push(ConversionWarning::UnsupportedMetric {
                    name: metric.name.clone(),
                    kind: kind.clone(),
                });
            }
        }
    }

    fn numbers(
        &mut self,
        metric: &Metric,
        points: &[NumberDataPoint],
        metric_type: RecordType,
        resource_labels: &Labels,
    ) {
        for dp in points {
            self.check_finite(&metric.name, dp.value);
            self.records.push(Record {
                timestamp: unix_seconds(dp.time_unix_nano),
                metric_name: metric.name.clone(),
                value: dp.value,
                unit: metric.unit.clone(),
                metric_type,
                labels: dp.labels.clone(),
                resource_labels: resource_labels.clone(),
            });
        }
    }

    /// Each point becomes `<name>_count`, plus `<name>_sum` when a sum was recorded.
    fn histograms(
        &mut self,
        metric: &Metric,
        points: &[HistogramDataPoint],
        resource_labels: &Labels,
    ) {
        for dp in points {
            let timestamp = unix_seconds(dp.time_unix_nano);

            self.records.push(Record {
                timestamp,
                metric_name: format!("{}_count", metric.name),
                value: dp.count as f64,
                unit: String::new(),
                metric_type: RecordType::Counter,
                labels: dp.labels.clone(),
                resource_labels: resource_labels.clone(),
            });

            let Some(sum) = dp.sum else { continue };
            self.check_finite(&metric.name, sum);
            self.records.push(Record {
                timestamp,
                metric_name: format!("{}_sum", metric.name),
                value: sum,
                unit: metric.unit.clone(),
                metric_type: RecordType::Counter,
                labels: dp.labels.clone(),
                resource_labels: resource_labels.clone(),
            });
        }
    }

    // JSON has no encoding for NaN or infinity; serde_json writes `null`.
    fn check_finite(&mut self, name: &str, value: f64) {
        if value.is_finite() {
            return;
        }
        warn!(metric = %name, value, "non-finite data point will be sent as null");
        self.warnings.push(ConversionWarning::NonFiniteValue {
            name: name.to_owned(),
        });
    }
}

fn unix_seconds(time_unix_nano: u64) -> i64 {
    (time_unix_nano / NANOS_PER_SEC) as i64
}
