//! Remote indexing handoff.
//!
//! With remote indexing enabled the request transaction does not write
//! search values. The persistence service submits a [`RemoteIndexMessage`]
//! to the job queue before it commits, and the remote index worker writes
//! the values once the version is visible in the committed store state.

mod handler;
mod readiness;

pub use handler::{MessageOutcome, RemoteIndexHandler};
pub use readiness::{classify, Readiness};

use crate::config::RemoteIndexConfig;
use crate::models::{ExtractedParameterValue, ExtractedValue};
use crate::queue::{JobPriority, JobQueue, RetryPolicy, REMOTE_INDEX_JOB};
use crate::{metrics, Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

/// Version of the message layout. Consumers reject other versions.
pub const MESSAGE_VERSION: i32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteIndexMessage {
    pub message_version: i32,
    pub instance_id: String,
    pub tenant: String,
    pub data: SearchParametersTransport,
}

impl RemoteIndexMessage {
    /// `ResourceType/logicalId`, the partition key of the message.
    pub fn key(&self) -> String {
        format!("{}/{}", self.data.resource_type, self.data.logical_id)
    }
}

/// Search values of one resource version, grouped by value kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchParametersTransport {
    pub resource_type: String,
    pub logical_id: String,
    pub logical_resource_id: i64,
    pub version_id: i32,
    pub last_updated: DateTime<Utc>,
    pub parameter_hash: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub string_values: Vec<ExtractedParameterValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub number_values: Vec<ExtractedParameterValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub date_values: Vec<ExtractedParameterValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub token_values: Vec<ExtractedParameterValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub quantity_values: Vec<ExtractedParameterValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub location_values: Vec<ExtractedParameterValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reference_values: Vec<ExtractedParameterValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub uri_values: Vec<ExtractedParameterValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub composite_values: Vec<ExtractedParameterValue>,
}

/// Identity of the version a transport describes.
#[derive(Debug, Clone)]
pub struct TransportHeader {
    pub resource_type: String,
    pub logical_id: String,
    pub logical_resource_id: i64,
    pub version_id: i32,
    pub last_updated: DateTime<Utc>,
    pub parameter_hash: String,
}

impl SearchParametersTransport {
    pub fn from_values(header: TransportHeader, values: Vec<ExtractedParameterValue>) -> Self {
        let mut transport = Self {
            resource_type: header.resource_type,
            logical_id: header.logical_id,
            logical_resource_id: header.logical_resource_id,
            version_id: header.version_id,
            last_updated: header.last_updated,
            parameter_hash: header.parameter_hash,
            string_values: Vec::new(),
            number_values: Vec::new(),
            date_values: Vec::new(),
            token_values: Vec::new(),
            quantity_values: Vec::new(),
            location_values: Vec::new(),
            reference_values: Vec::new(),
            uri_values: Vec::new(),
            composite_values: Vec::new(),
        };
        for value in values {
            let list = match value.value {
                ExtractedValue::String { .. } => &mut transport.string_values,
                ExtractedValue::Number { .. } => &mut transport.number_values,
                ExtractedValue::Date { .. } => &mut transport.date_values,
                ExtractedValue::Token { .. } => &mut transport.token_values,
                ExtractedValue::Quantity { .. } => &mut transport.quantity_values,
                ExtractedValue::Location { .. } => &mut transport.location_values,
                ExtractedValue::Reference { .. } => &mut transport.reference_values,
                ExtractedValue::Uri { .. } => &mut transport.uri_values,
                ExtractedValue::Composite { .. } => &mut transport.composite_values,
            };
            list.push(value);
        }
        transport
    }

    pub fn value_count(&self) -> usize {
        self.lists().map(Vec::len).sum()
    }

    pub fn into_values(self) -> Vec<ExtractedParameterValue> {
        let mut values = Vec::with_capacity(self.value_count());
        values.extend(self.string_values);
        values.extend(self.number_values);
        values.extend(self.date_values);
        values.extend(self.token_values);
        values.extend(self.quantity_values);
        values.extend(self.location_values);
        values.extend(self.reference_values);
        values.extend(self.uri_values);
        values.extend(self.composite_values);
        values
    }

    fn lists(&self) -> impl Iterator<Item = &Vec<ExtractedParameterValue>> {
        [
            &self.string_values,
            &self.number_values,
            &self.date_values,
            &self.token_values,
            &self.quantity_values,
            &self.location_values,
            &self.reference_values,
            &self.uri_values,
            &self.composite_values,
        ]
        .into_iter()
    }
}

/// Parameters of a [`REMOTE_INDEX_JOB`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteIndexJob {
    pub key: String,
    pub message: RemoteIndexMessage,
}

impl RemoteIndexJob {
    pub fn from_parameters(parameters: &serde_json::Value) -> Result<Self> {
        serde_json::from_value(parameters.clone())
            .map_err(|e| Error::RemoteIndex(format!("Malformed remote index message: {}", e)))
    }
}

/// Producer side of the handoff.
pub struct RemoteIndexSubmitter {
    queue: Arc<dyn JobQueue>,
    instance_id: String,
    tenant: String,
}

impl RemoteIndexSubmitter {
    pub fn new(queue: Arc<dyn JobQueue>, config: &RemoteIndexConfig) -> Self {
        let instance_id = config
            .instance_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            queue,
            instance_id,
            tenant: config.tenant.clone(),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Enqueue the values of one version. The caller commits only after
    /// this returned successfully.
    pub async fn submit(&self, data: SearchParametersTransport) -> Result<Uuid> {
        let message = RemoteIndexMessage {
            message_version: MESSAGE_VERSION,
            instance_id: self.instance_id.clone(),
            tenant: self.tenant.clone(),
            data,
        };
        let key = message.key();
        let version_id = message.data.version_id;
        let parameters = serde_json::to_value(RemoteIndexJob {
            key: key.clone(),
            message,
        })
        .map_err(|e| Error::RemoteIndex(format!("Failed to encode remote index message: {}", e)))?;

        let job_id = self
            .queue
            .enqueue(
                REMOTE_INDEX_JOB.to_string(),
                parameters,
                JobPriority::Normal,
                Some(RetryPolicy {
                    max_retries: 5,
                    initial_delay_seconds: 1,
                    max_delay_seconds: 60,
                    backoff_multiplier: 2.0,
                }),
            )
            .await
            .map_err(|e| Error::RemoteIndex(format!("Failed to submit {}: {}", key, e)))?;

        metrics::REMOTE_INDEX_SUBMITTED_TOTAL.inc();
        tracing::debug!(key = %key, version_id, job_id = %job_id, "Submitted remote index message");
        Ok(job_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::InlineJobQueue;
    use meridian_search::SearchParamType;

    fn header() -> TransportHeader {
        TransportHeader {
            resource_type: "Patient".into(),
            logical_id: "p1".into(),
            logical_resource_id: 7,
            version_id: 2,
            last_updated: Utc::now(),
            parameter_hash: "hash".into(),
        }
    }

    fn values() -> Vec<ExtractedParameterValue> {
        vec![
            ExtractedParameterValue::new(
                "family",
                SearchParamType::String,
                ExtractedValue::String { value: "chalmers".into() },
            ),
            ExtractedParameterValue::new(
                "identifier",
                SearchParamType::Token,
                ExtractedValue::Token {
                    system: Some("urn:mrn".into()),
                    code: "12345".into(),
                },
            ),
            ExtractedParameterValue::new(
                "given",
                SearchParamType::String,
                ExtractedValue::String { value: "peter".into() },
            ),
        ]
    }

    #[test]
    fn transport_groups_values_by_kind() {
        let transport = SearchParametersTransport::from_values(header(), values());
        assert_eq!(transport.string_values.len(), 2);
        assert_eq!(transport.token_values.len(), 1);
        assert_eq!(transport.value_count(), 3);

        let json = serde_json::to_value(&transport).unwrap();
        assert!(json.get("dateValues").is_none());
        assert_eq!(json["logicalResourceId"], 7);

        let mut back = transport.into_values();
        back.sort_by_key(|v| v.canonical_text());
        let mut expected = values();
        expected.sort_by_key(|v| v.canonical_text());
        assert_eq!(back, expected);
    }

    #[tokio::test]
    async fn submit_enqueues_keyed_message() {
        let queue = Arc::new(InlineJobQueue::default());
        let config = RemoteIndexConfig {
            instance_id: Some("node-a".into()),
            ..Default::default()
        };
        let submitter = RemoteIndexSubmitter::new(queue.clone(), &config);
        let job_id = submitter
            .submit(SearchParametersTransport::from_values(header(), values()))
            .await
            .unwrap();

        let job = queue.get_job(job_id).await.unwrap().unwrap();
        assert_eq!(job.job_type, REMOTE_INDEX_JOB);
        let decoded = RemoteIndexJob::from_parameters(&job.parameters).unwrap();
        assert_eq!(decoded.key, "Patient/p1");
        assert_eq!(decoded.message.instance_id, "node-a");
        assert_eq!(decoded.message.message_version, MESSAGE_VERSION);
    }
}
