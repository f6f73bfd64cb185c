//! Search value extraction and parameter hashing.

mod extract;
mod hash;
pub mod path;

pub use extract::ParameterExtractor;
pub use hash::parameter_hash;

use crate::models::ExtractedParameterValue;
use meridian_search::SearchParameterRegistry;
use serde_json::Value as JsonValue;
use std::sync::Arc;

/// Search values of one resource version plus their hash.
#[derive(Debug, Clone)]
pub struct IndexedValues {
    pub values: Vec<ExtractedParameterValue>,
    pub hash: String,
}

#[derive(Clone)]
pub struct IndexingService {
    extractor: Arc<ParameterExtractor>,
}

impl IndexingService {
    pub fn new(registry: Arc<SearchParameterRegistry>) -> Self {
        Self {
            extractor: Arc::new(ParameterExtractor::new(registry)),
        }
    }

    pub fn registry(&self) -> &Arc<SearchParameterRegistry> {
        self.extractor.registry()
    }

    pub fn index(&self, resource_type: &str, resource: &JsonValue) -> IndexedValues {
        let values = self.extractor.extract(resource_type, resource);
        let hash = parameter_hash(&values);
        tracing::trace!(
            resource_type = %resource_type,
            values = values.len(),
            "Extracted search values"
        );
        IndexedValues { values, hash }
    }
}
