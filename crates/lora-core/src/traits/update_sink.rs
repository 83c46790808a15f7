// # Update Sink Trait
//
// Outbound half of the pipeline: decoded attributes for one device are
// handed to the data platform. The pipeline treats the call as
// fire-and-forget; failures are logged by the caller and never retried.

use async_trait::async_trait;

use crate::error::Result;
use crate::model::{DecodedAttribute, Device};

/// Receiver of decoded attribute updates
#[async_trait]
pub trait UpdateSink: Send + Sync {
    /// Publish one update for `device`
    ///
    /// `attributes` is never empty.
    async fn publish_attributes(&self, device: &Device, attributes: &[DecodedAttribute])
    -> Result<()>;
}
