use super::{classify, Readiness, RemoteIndexMessage, MESSAGE_VERSION};
use crate::config::RemoteIndexConfig;
use crate::db::{rollback, ResourceStore};
use crate::models::IndexedResource;
use crate::Result;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;

/// Result for one message of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MessageOutcome {
    Processed,
    Skipped(String),
    NotReady,
    Expired,
    /// The message can never be processed
    Rejected(String),
}

impl MessageOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            MessageOutcome::Processed => "processed",
            MessageOutcome::Skipped(_) => "skipped",
            MessageOutcome::NotReady => "not_ready",
            MessageOutcome::Expired => "expired",
            MessageOutcome::Rejected(_) => "rejected",
        }
    }
}

/// Writes the search values of a batch of messages in one store
/// transaction.
pub struct RemoteIndexHandler {
    store: Arc<dyn ResourceStore>,
    max_ready_time: chrono::Duration,
    instance_filter: Option<String>,
    tenant: String,
}

impl RemoteIndexHandler {
    pub fn new(store: Arc<dyn ResourceStore>, config: &RemoteIndexConfig) -> Self {
        Self {
            store,
            max_ready_time: chrono::Duration::milliseconds(config.max_ready_time_ms as i64),
            instance_filter: config.instance_id.clone(),
            tenant: config.tenant.clone(),
        }
    }

    /// Classify every message against the locked committed state and write
    /// the values of the ready ones. Outcomes are returned in message order.
    ///
    /// # Errors
    /// Store failures abort the whole batch; nothing was written.
    pub async fn process(&self, messages: &[RemoteIndexMessage]) -> Result<Vec<MessageOutcome>> {
        let now = Utc::now();
        let mut outcomes = vec![MessageOutcome::NotReady; messages.len()];

        // Lock in key order so concurrent consumers cannot deadlock.
        let mut order: Vec<usize> = (0..messages.len()).collect();
        order.sort_by(|&a, &b| {
            let (a, b) = (&messages[a].data, &messages[b].data);
            (&a.resource_type, &a.logical_id).cmp(&(&b.resource_type, &b.logical_id))
        });

        let mut tx = self.store.begin().await?;
        let mut ready = Vec::new();
        let mut seen = HashSet::new();

        for index in order {
            let message = &messages[index];
            let data = &message.data;

            if let Some(reason) = self.reject_reason(message) {
                tracing::warn!(key = %message.key(), reason = %reason, "Rejected remote index message");
                outcomes[index] = MessageOutcome::Rejected(reason);
                continue;
            }
            if let Some(filter) = &self.instance_filter {
                if &message.instance_id != filter {
                    outcomes[index] = MessageOutcome::Skipped(format!(
                        "message from instance '{}'",
                        message.instance_id
                    ));
                    continue;
                }
            }

            let state = match tx
                .lock_logical_resource(&data.resource_type, &data.logical_id)
                .await
            {
                Ok(state) => state,
                Err(e) => {
                    rollback(tx).await;
                    return Err(e);
                }
            };

            outcomes[index] = match classify(data, state.as_ref(), now, self.max_ready_time) {
                Readiness::Process => {
                    if let Some(state) = state {
                        if seen.insert(state.logical_resource_id) {
                            ready.push(IndexedResource {
                                logical_resource_id: state.logical_resource_id,
                                resource_type: data.resource_type.clone(),
                                logical_id: data.logical_id.clone(),
                                values: data.clone().into_values(),
                            });
                        }
                    }
                    MessageOutcome::Processed
                }
                Readiness::SkipMismatch => {
                    tracing::warn!(
                        key = %message.key(),
                        version_id = data.version_id,
                        "Remote index message does not match the committed version"
                    );
                    MessageOutcome::Skipped("version mismatch".to_string())
                }
                Readiness::SkipSuperseded { current_version } => {
                    tracing::debug!(
                        key = %message.key(),
                        version_id = data.version_id,
                        current_version,
                        "Remote index message superseded"
                    );
                    MessageOutcome::Skipped(format!("superseded by version {}", current_version))
                }
                Readiness::NotReady => MessageOutcome::NotReady,
                Readiness::Expired => {
                    tracing::warn!(
                        key = %message.key(),
                        version_id = data.version_id,
                        "Remote index message expired before its version committed"
                    );
                    MessageOutcome::Expired
                }
            };
        }

        if !ready.is_empty() {
            if let Err(e) = tx.replace_search_values(&ready).await {
                rollback(tx).await;
                return Err(e);
            }
        }
        tx.commit().await?;

        tracing::debug!(
            messages = messages.len(),
            written = ready.len(),
            "Processed remote index batch"
        );
        Ok(outcomes)
    }

    fn reject_reason(&self, message: &RemoteIndexMessage) -> Option<String> {
        if message.message_version != MESSAGE_VERSION {
            Some(format!("unsupported message version {}", message.message_version))
        } else if message.tenant != self.tenant {
            Some(format!("message for tenant '{}'", message.tenant))
        } else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{MemoryResourceStore, StoreTransaction};
    use crate::models::{ExtractedParameterValue, ExtractedValue, ResourcePayload, StoreRequest};
    use crate::Error;
    use crate::remote_index::{SearchParametersTransport, TransportHeader};
    use chrono::DateTime;
    use meridian_search::SearchParamType;

    fn family(value: &str) -> Vec<ExtractedParameterValue> {
        vec![ExtractedParameterValue::new(
            "family",
            SearchParamType::String,
            ExtractedValue::String { value: value.into() },
        )]
    }

    async fn store_version(store: &MemoryResourceStore, version_id: i32, hash: &str) -> (i64, DateTime<Utc>) {
        let last_updated = Utc::now();
        let mut tx = store.begin().await.unwrap();
        let outcome = tx
            .store_resource(&StoreRequest {
                resource_type: "Patient".into(),
                logical_id: "p1".into(),
                version_id,
                last_updated,
                deleted: false,
                payload: ResourcePayload::Inline(Vec::new()),
                parameter_hash: Some(hash.into()),
                if_none_match: false,
            })
            .await
            .unwrap();
        tx.commit().await.unwrap();
        (outcome.logical_resource_id, last_updated)
    }

    fn message(version_id: i32, hash: &str, lr_id: i64, last_updated: DateTime<Utc>) -> RemoteIndexMessage {
        RemoteIndexMessage {
            message_version: MESSAGE_VERSION,
            instance_id: "node-a".into(),
            tenant: "default".into(),
            data: SearchParametersTransport::from_values(
                TransportHeader {
                    resource_type: "Patient".into(),
                    logical_id: "p1".into(),
                    logical_resource_id: lr_id,
                    version_id,
                    last_updated,
                    parameter_hash: hash.into(),
                },
                family("chalmers"),
            ),
        }
    }

    /// Transaction whose value writes and rollback both fail.
    struct BrokenWrites(Box<dyn StoreTransaction>);

    #[async_trait::async_trait]
    impl StoreTransaction for BrokenWrites {
        async fn store_resource(&mut self, request: &StoreRequest) -> Result<crate::models::StoreOutcome> {
            self.0.store_resource(request).await
        }

        async fn replace_search_values(&mut self, _: &[IndexedResource]) -> Result<()> {
            Err(Error::Internal("value tables unavailable".into()))
        }

        async fn update_parameter_hash(&mut self, logical_resource_id: i64, parameter_hash: &str) -> Result<()> {
            self.0.update_parameter_hash(logical_resource_id, parameter_hash).await
        }

        async fn lock_logical_resource(
            &mut self,
            resource_type: &str,
            logical_id: &str,
        ) -> Result<Option<crate::models::LogicalResourceState>> {
            self.0.lock_logical_resource(resource_type, logical_id).await
        }

        async fn mark_reindexed(&mut self, logical_resource_id: i64, tstamp: DateTime<Utc>) -> Result<()> {
            self.0.mark_reindexed(logical_resource_id, tstamp).await
        }

        async fn erase(
            &mut self,
            resource_type: &str,
            logical_id: &str,
            version_id: Option<i32>,
        ) -> Result<crate::models::EraseOutcome> {
            self.0.erase(resource_type, logical_id, version_id).await
        }

        async fn commit(self: Box<Self>) -> Result<()> {
            self.0.commit().await
        }

        async fn rollback(self: Box<Self>) -> Result<()> {
            Err(Error::Internal("connection lost".into()))
        }
    }

    struct BrokenStore(Arc<MemoryResourceStore>);

    #[async_trait::async_trait]
    impl ResourceStore for BrokenStore {
        async fn begin(&self) -> Result<Box<dyn StoreTransaction>> {
            Ok(Box::new(BrokenWrites(self.0.begin().await?)))
        }

        async fn read(&self, resource_type: &str, logical_id: &str) -> Result<Option<crate::models::StoredVersion>> {
            self.0.read(resource_type, logical_id).await
        }

        async fn vread(
            &self,
            resource_type: &str,
            logical_id: &str,
            version_id: i32,
        ) -> Result<Option<crate::models::StoredVersion>> {
            self.0.vread(resource_type, logical_id, version_id).await
        }

        async fn history(
            &self,
            resource_type: &str,
            logical_id: &str,
            query: &crate::models::HistoryQuery,
        ) -> Result<(Vec<crate::models::StoredVersion>, i64)> {
            self.0.history(resource_type, logical_id, query).await
        }

        async fn changes(&self, query: &crate::models::ChangesQuery) -> Result<Vec<crate::models::ChangeRecord>> {
            self.0.changes(query).await
        }

        async fn search(
            &self,
            context: &meridian_search::SearchContext,
            max_include_depth: usize,
        ) -> Result<crate::models::SearchPage> {
            self.0.search(context, max_include_depth).await
        }

        async fn retrieve_index(&self, resource_type: &str, logical_id: &str) -> Result<Vec<ExtractedParameterValue>> {
            self.0.retrieve_index(resource_type, logical_id).await
        }

        async fn logical_resource_state(
            &self,
            resource_type: &str,
            logical_id: &str,
        ) -> Result<Option<crate::models::LogicalResourceState>> {
            self.0.logical_resource_state(resource_type, logical_id).await
        }

        async fn reindex_candidates(
            &self,
            before: DateTime<Utc>,
            batch: usize,
            resource_type: Option<&str>,
        ) -> Result<Vec<crate::models::LogicalResourceState>> {
            self.0.reindex_candidates(before, batch, resource_type).await
        }

        async fn health_check(&self) -> Result<()> {
            self.0.health_check().await
        }
    }

    fn handler(store: Arc<MemoryResourceStore>) -> RemoteIndexHandler {
        RemoteIndexHandler::new(store, &RemoteIndexConfig::default())
    }

    #[tokio::test]
    async fn ready_message_writes_values() {
        let store = Arc::new(MemoryResourceStore::new());
        let (lr_id, ts) = store_version(&store, 1, "h1").await;

        let outcomes = handler(store.clone())
            .process(&[message(1, "h1", lr_id, ts)])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![MessageOutcome::Processed]);
        assert_eq!(store.retrieve_index("Patient", "p1").await.unwrap(), family("chalmers"));
    }

    #[tokio::test]
    async fn failed_batch_reports_the_write_error_not_the_rollback() {
        let store = Arc::new(MemoryResourceStore::new());
        let (lr_id, ts) = store_version(&store, 1, "h1").await;
        let broken = RemoteIndexHandler::new(Arc::new(BrokenStore(store.clone())), &RemoteIndexConfig::default());

        let err = broken.process(&[message(1, "h1", lr_id, ts)]).await.unwrap_err();
        assert!(matches!(err, Error::Internal(ref m) if m == "value tables unavailable"));

        // The writer lock was released with the abandoned transaction.
        let outcomes = handler(store.clone())
            .process(&[message(1, "h1", lr_id, ts)])
            .await
            .unwrap();
        assert_eq!(outcomes, vec![MessageOutcome::Processed]);
    }

        #[tokio::test]
    async fn outcomes_follow_message_order() {
        let store = Arc::new(MemoryResourceStore::new());
        let (lr_id, ts) = store_version(&store, 1, "h1").await;
        store_version(&store, 2, "h2").await;

        let mut wrong_version = message(2, "h2", lr_id, ts);
        wrong_version.message_version = 99;
        let outcomes = handler(store.clone())
            .process(&[
                message(1, "h1", lr_id, ts),
                wrong_version,
                message(3, "h3", lr_id, Utc::now()),
            ])
            .await
            .unwrap();

        assert_eq!(outcomes[0], MessageOutcome::Skipped("superseded by version 2".into()));
        assert!(matches!(outcomes[1], MessageOutcome::Rejected(_)));
        assert_eq!(outcomes[2], MessageOutcome::NotReady);
        assert!(store.retrieve_index("Patient", "p1").await.unwrap().is_empty());
    }
}
