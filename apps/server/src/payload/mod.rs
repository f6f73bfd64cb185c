//! Resource payload codec and blob offload.
//!
//! Every version body is gzip compressed JSON. It is kept inline in the
//! resources table unless an offload backend is configured, in which case
//! the row keeps only the payload key.

mod object_store;

pub use self::object_store::ObjectStorePayloadPersistence;

use crate::config::{OffloadBackend, PayloadConfig};
use crate::error::{Error, Result};
use crate::models::ResourcePayload;
use async_trait::async_trait;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::Value as JsonValue;
use std::io::{Read, Write};
use std::sync::Arc;

/// Blob storage for offloaded payloads.
#[async_trait]
pub trait PayloadPersistence: Send + Sync {
    /// Store one version body and return its key.
    async fn store_payload(
        &self,
        resource_type: &str,
        logical_id: &str,
        version_id: i32,
        data: Vec<u8>,
    ) -> Result<String>;

    async fn read_payload(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Delete the payloads of one version, or of every version when
    /// `version_id` is `None`.
    async fn delete_payload(
        &self,
        resource_type: &str,
        logical_id: &str,
        version_id: Option<i32>,
    ) -> Result<()>;

    async fn delete_key(&self, key: &str) -> Result<()>;
}

/// `resource_type/logical_id/version/payload_id`
pub fn payload_key(resource_type: &str, logical_id: &str, version_id: i32, payload_id: &str) -> String {
    format!("{resource_type}/{logical_id}/{version_id}/{payload_id}")
}

pub fn compress(resource: &JsonValue, level: u32) -> Result<Vec<u8>> {
    let json = serde_json::to_vec(resource)
        .map_err(|e| Error::Payload(format!("Failed to serialize resource: {}", e)))?;
    let mut encoder = GzEncoder::new(Vec::with_capacity(json.len() / 2), Compression::new(level));
    encoder
        .write_all(&json)
        .and_then(|_| encoder.finish())
        .map_err(|e| Error::Payload(format!("Failed to compress payload: {}", e)))
}

pub fn decompress(data: &[u8]) -> Result<JsonValue> {
    let mut json = Vec::new();
    GzDecoder::new(data)
        .read_to_end(&mut json)
        .map_err(|e| Error::Payload(format!("Failed to decompress payload: {}", e)))?;
    serde_json::from_slice(&json).map_err(|e| Error::Payload(format!("Invalid payload JSON: {}", e)))
}

/// Encodes version bodies and moves them to and from the offload backend.
#[derive(Clone)]
pub struct PayloadCodec {
    offload: Option<Arc<dyn PayloadPersistence>>,
    level: u32,
}

impl PayloadCodec {
    pub fn new(offload: Option<Arc<dyn PayloadPersistence>>, level: u32) -> Self {
        Self { offload, level }
    }

    pub fn inline() -> Self {
        Self::new(None, 6)
    }

    pub fn from_config(config: &PayloadConfig) -> Result<Self> {
        let offload: Option<Arc<dyn PayloadPersistence>> = match config.offload {
            OffloadBackend::None => None,
            OffloadBackend::Memory => Some(Arc::new(ObjectStorePayloadPersistence::in_memory())),
            OffloadBackend::Local => Some(Arc::new(ObjectStorePayloadPersistence::local(&config.root)?)),
        };
        Ok(Self::new(offload, config.compression_level))
    }

    pub fn is_offloading(&self) -> bool {
        self.offload.is_some()
    }

    /// Compress `resource` and, when offloading, write it to the backend.
    /// The returned key must be deleted if the surrounding transaction fails.
    pub async fn encode(
        &self,
        resource_type: &str,
        logical_id: &str,
        version_id: i32,
        resource: &JsonValue,
    ) -> Result<ResourcePayload> {
        let data = compress(resource, self.level)?;
        match &self.offload {
            None => Ok(ResourcePayload::Inline(data)),
            Some(backend) => {
                let key = backend
                    .store_payload(resource_type, logical_id, version_id, data)
                    .await?;
                Ok(ResourcePayload::Offloaded { key })
            }
        }
    }

    /// Load the JSON body. Delete markers decode to `Null`.
    pub async fn decode(&self, payload: &ResourcePayload) -> Result<JsonValue> {
        match payload {
            ResourcePayload::Empty => Ok(JsonValue::Null),
            ResourcePayload::Inline(data) => decompress(data),
            ResourcePayload::Offloaded { key } => {
                let backend = self.offload.as_ref().ok_or_else(|| {
                    Error::Payload(format!("Payload '{}' is offloaded but no backend is configured", key))
                })?;
                let data = backend
                    .read_payload(key)
                    .await?
                    .ok_or_else(|| Error::Payload(format!("Payload '{}' is missing", key)))?;
                decompress(&data)
            }
        }
    }

    /// Rollback compensation: remove a payload written by a failed write.
    pub async fn discard(&self, payload: &ResourcePayload) {
        if let (Some(backend), ResourcePayload::Offloaded { key }) = (&self.offload, payload) {
            if let Err(e) = backend.delete_key(key).await {
                tracing::warn!(key = %key, error = %e, "Failed to delete orphaned payload");
            }
        }
    }

    /// Delete offloaded payloads after an erase committed.
    pub async fn erase(&self, resource_type: &str, logical_id: &str, version_id: Option<i32>) -> Result<()> {
        match &self.offload {
            Some(backend) => backend.delete_payload(resource_type, logical_id, version_id).await,
            None => Ok(()),
        }
    }
}
