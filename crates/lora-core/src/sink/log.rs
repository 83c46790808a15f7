// # Log Update Sink
//
// UpdateSink that writes every update as one structured `info` record.
// Used by the daemon when no data platform is wired in, and handy for
// watching the decode path end to end.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::Result;
use crate::model::{DecodedAttribute, Device};
use crate::traits::UpdateSink;

/// Update sink backed by the tracing subscriber
#[derive(Debug, Default)]
pub struct LogUpdateSink {
    published: AtomicU64,
}

impl LogUpdateSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of updates published so far
    pub fn published(&self) -> u64 {
        self.published.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl UpdateSink for LogUpdateSink {
    async fn publish_attributes(&self, device: &Device, attributes: &[DecodedAttribute])
    -> Result<()> {
        let values: Map<String, Value> = attributes
            .iter()
            .map(|attr| (attr.name.clone(), attr.value.clone()))
            .collect();
        let attributes = Value::Object(values);

        tracing::info!(
            device_id = %device.id,
            entity_name = %device.name,
            entity_type = %device.entity_type,
            service = %device.service,
            subservice = %device.subservice,
            attributes = %attributes,
            "attribute update"
        );
        self.published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_counts_published_updates() {
        let sink = LogUpdateSink::new();
        let device: Device = serde_json::from_value(json!({"id": "lora_n_003"})).unwrap();
        let attributes = vec![DecodedAttribute {
            name: "temperature_1".into(),
            attr_type: "Number".into(),
            value: json!(27.2),
        }];

        tokio_test::block_on(async {
            tokio_test::assert_ok!(sink.publish_attributes(&device, &attributes).await);
            tokio_test::assert_ok!(sink.publish_attributes(&device, &attributes).await);
        });
        assert_eq!(sink.published(), 2);
    }
}
