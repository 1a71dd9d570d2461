//! Hierarchical metric batch as handed over by the producer.
//!
//! The shape mirrors an OTLP `ExportMetricsServiceRequest` with attributes
//! already flattened to string labels:
//!
//! ```text
//! MetricBatch
//! └─ ResourceGroup (resource labels)
//!    └─ ScopeGroup
//!       └─ Metric (name, unit, data)
//!          └─ data points
//! ```

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

pub type Labels = HashMap<String, String>;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MetricBatch {
    #[serde(default)]
    pub resource_groups: Vec<ResourceGroup>,
}

impl MetricBatch {
    pub fn new(resource_groups: Vec<ResourceGroup>) -> Self {
        Self { resource_groups }
    }

    /// Total number of data points across all metrics, regardless of type.
    pub fn data_point_count(&self) -> usize {
        self.metrics().map(|m| m.data.len()).sum()
    }

    pub fn metrics(&self) -> impl Iterator<Item = &Metric> {
        self.resource_groups
            .iter()
            .flat_map(|rg| rg.scopes.iter())
            .flat_map(|sg| sg.metrics.iter())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceGroup {
    #[serde(default)]
    pub labels: Labels,
    #[serde(default)]
    pub scopes: Vec<ScopeGroup>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ScopeGroup {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default)]
    pub metrics: Vec<Metric>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub name: String,
    #[serde(default)]
    pub unit: String,
    pub data: MetricData,
}

/// Shape of a metric. `Unsupported` carries the producer's type name so the
/// converter can report what it skipped.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MetricData {
    Gauge { data_points: Vec<NumberDataPoint> },
    Counter { data_points: Vec<NumberDataPoint> },
    Histogram { data_points: Vec<HistogramDataPoint> },
    Unsupported { kind: String },
}

impl MetricData {
    pub fn kind(&self) -> &str {
        match self {
            MetricData::Gauge { .. } => "gauge",
            MetricData::Counter { .. } => "counter",
            MetricData::Histogram { .. } => "histogram",
            MetricData::Unsupported { kind } => kind,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            MetricData::Gauge { data_points } | MetricData::Counter { data_points } => {
                data_points.len()
            }
            MetricData::Histogram { data_points } => data_points.len(),
            MetricData::Unsupported { .. } => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NumberDataPoint {
    pub time_unix_nano: u64,
    #[serde(default)]
    pub labels: Labels,
    pub value: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistogramDataPoint {
    pub time_unix_nano: u64,
    #[serde(default)]
    pub labels: Labels,
    pub count: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sum: Option<f64>,
}

impl Metric {
    pub fn gauge(name: &str, unit: &str, data_points: Vec<NumberDataPoint>) -> Self {
        Self {
            name: name.to_owned(),
            unit: unit.to_owned(),
            data: MetricData::Gauge { data_points },
        }
    }

    pub fn counter(name: &str, unit: &str, data_points: Vec<NumberDataPoint>) -> Self {
        Self {
            name: name.to_owned(),
            unit: unit.to_owned(),
            data: MetricData::Counter { data_points },
        }
    }

    pub fn histogram(name: &str, unit: &str, data_points: Vec<HistogramDataPoint>) -> Self {
        Self {
            name: name.to_owned(),
            unit: unit.to_owned(),
            data: MetricData::Histogram { data_points },
        }
    }

    pub fn unsupported(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_owned(),
            unit: String::new(),
            data: MetricData::Unsupported {
                kind: kind.to_owned(),
            },
        }
    }
}

/// Convert `[(k, v)]` pairs into a label map.
pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_owned(), v.to_owned()))
        .collect()
}
