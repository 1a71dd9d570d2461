use std::io::Write;

use bytes::Bytes;
use flate2::write::GzEncoder;
use serde::Serialize;

use crate::config::Compression;
use crate::convert::ConversionError;
use crate::model::Labels;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordType {
    Gauge,
    Counter,
}

/// One flattened measurement, exactly as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    /// Unix seconds.
    pub timestamp: i64,
    pub metric_name: String,
    pub value: f64,
    pub unit: String,
    pub metric_type: RecordType,
    pub labels: Labels,
    pub resource_labels: Labels,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct Payload {
    pub metrics: Vec<Record>,
}

impl Payload {
    pub fn len(&self) -> usize {
        self.metrics.len()
    }

    pub fn is_empty(&self) -> bool {
        self.metrics.is_empty()
    }

    /// Serialize to the `{"metrics": [...]}` document, compressing if asked.
    pub fn encode(&self, compression: Compression) -> Result<EncodedPayload, ConversionError> {
        let json = serde_json::to_vec(self)?;
        let body = match compression {
            Compression::Gzip => compress_gzip(&json).map_err(ConversionError::Compression)?,
            Compression::None => json,
        };

        Ok(EncodedPayload {
            body: Bytes::from(body),
            record_count: self.len(),
            compression,
        })
    }
}

/// Request body ready to hand to a sender. Cloning only bumps a refcount, so
/// every retry of a batch reuses the same bytes.
#[derive(Debug, Clone)]
pub struct EncodedPayload {
    pub body: Bytes,
    pub record_count: usize,
    pub compression: Compression,
}

fn compress_gzip(data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
    let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::fast());
    encoder.write_all(data)?;
    encoder.finish()
}
