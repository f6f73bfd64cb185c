//! Domain models for the persistence engine

pub mod resource;
pub mod store;
pub mod values;

pub use resource::{
    ChangeRecord, ChangeType, ChangesQuery, EraseOutcome, HistoryEntry, HistoryMethod,
    HistoryQuery, HistoryResult, ReindexOutcome, Resource, ResourceOperation, ResourceResult,
    SearchEntry, SearchEntryMode, SearchResult, UpdateParams,
};
pub use store::{
    IndexedResource, InteractionStatus, LogicalResourceState, ResourcePayload, SearchPage,
    StoreOutcome, StoreRequest, StoredVersion,
};
pub use values::{ExtractedParameterValue, ExtractedValue};
