//! FHIR search support shared by the server and workers.
//!
//! - [`registry`]: search parameter definitions and compartments
//! - [`parse`]: query string to [`SearchContext`]
//! - [`date`], [`reference`], [`normalize`], [`escape`]: value level helpers
//!   used by both query parsing and index extraction

pub mod date;
pub mod error;
pub mod escape;
pub mod normalize;
pub mod parse;
pub mod query;
pub mod reference;
pub mod registry;
pub mod types;

pub use date::{DatePrecision, DateRange};
pub use error::{Result, SearchError};
pub use parse::{parse_compartment_query, parse_number, parse_query};
pub use query::{
    Chain, InclusionParameter, ParseOptions, QueryParameter, QueryParameterValue, QueryValue,
    SearchContext, SortDirection, SortParameter, SummaryMode, TokenSystem, TotalMode,
    DEFAULT_PAGE_SIZE, MAX_OFFSET, MAX_PAGE_SIZE,
};
pub use reference::{parse_reference, ParsedReference};
pub use registry::{ComponentDef, SearchParameterDef, SearchParameterRegistry};
pub use types::{is_valid_logical_id, is_valid_resource_type, Modifier, Prefix, SearchParamType};
