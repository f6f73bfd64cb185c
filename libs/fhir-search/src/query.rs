//! Parsed search request model.

use crate::date::DateRange;
use crate::types::{Modifier, Prefix, SearchParamType};
use rust_decimal::Decimal;

/// Absolute upper bound for `_count`.
pub const MAX_PAGE_SIZE: usize = 1000;
pub const DEFAULT_PAGE_SIZE: usize = 10;
/// Largest row offset a page may start at. Postgres binds it as `bigint`.
pub const MAX_OFFSET: usize = i64::MAX as usize;

/// Token system constraint from `system|code` syntax.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TokenSystem {
    /// `code`: any system.
    Any,
    /// `|code`: the value must have no system.
    NoSystem,
    /// `system|code` or `system|`.
    Is(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum QueryValue {
    String(String),
    Uri(String),
    Number {
        value: Decimal,
        /// Implicit precision range, `[low, high)`.
        low: Decimal,
        high: Decimal,
    },
    Date(DateRange),
    Token {
        system: TokenSystem,
        /// `None` for `system|` (any code in the system).
        code: Option<String>,
        /// `:of-type` identifier type (system, code).
        of_type: Option<(String, String)>,
    },
    Quantity {
        value: Decimal,
        low: Decimal,
        high: Decimal,
        system: Option<String>,
        code: Option<String>,
    },
    Reference {
        resource_type: Option<String>,
        /// Local logical id, if the value identifies one.
        id: Option<String>,
        /// Absolute or canonical url without version.
        url: Option<String>,
        version: Option<String>,
    },
    Near {
        latitude: f64,
        longitude: f64,
        /// Kilometers.
        distance_km: f64,
    },
    Missing(bool),
    Composite(Vec<QueryParameterValue>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameterValue {
    pub prefix: Prefix,
    pub value: QueryValue,
    /// Value as it appeared in the request (for links and diagnostics).
    pub raw: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Chain {
    /// `subject:Patient.name=x`: the reference parameter points at
    /// `target_type` resources matching `next`.
    Forward {
        target_type: String,
        next: Box<QueryParameter>,
    },
    /// `_has:Observation:patient:code=x`: resources referenced by
    /// `source_type` resources (through `reference_code`) matching `next`.
    Reverse {
        source_type: String,
        reference_code: String,
        next: Box<QueryParameter>,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct QueryParameter {
    pub code: String,
    pub param_type: SearchParamType,
    pub modifier: Option<Modifier>,
    /// Resource type carried by the `type` modifier (`subject:Patient`).
    pub modifier_resource_type: Option<String>,
    /// OR-ed values. Empty for chain links.
    pub values: Vec<QueryParameterValue>,
    pub chain: Option<Chain>,
    /// Compartment inclusion criteria: values of several reference
    /// parameters OR-ed together (`codes` lists every parameter).
    pub inclusion_codes: Vec<String>,
}

impl QueryParameter {
    pub fn new(code: impl Into<String>, param_type: SearchParamType) -> Self {
        Self {
            code: code.into(),
            param_type,
            modifier: None,
            modifier_resource_type: None,
            values: Vec::new(),
            chain: None,
            inclusion_codes: Vec::new(),
        }
    }

    pub fn is_chained(&self) -> bool {
        matches!(self.chain, Some(Chain::Forward { .. }))
    }

    pub fn is_reverse_chained(&self) -> bool {
        matches!(self.chain, Some(Chain::Reverse { .. }))
    }

    pub fn is_inclusion_criteria(&self) -> bool {
        !self.inclusion_codes.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SortParameter {
    pub code: String,
    pub param_type: SearchParamType,
    pub direction: SortDirection,
}

/// `_include` / `_revinclude` specification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InclusionParameter {
    /// Resource type holding the reference.
    pub source_type: String,
    /// Reference parameter code.
    pub code: String,
    /// Target type restriction.
    pub target_type: Option<String>,
    pub iterate: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SummaryMode {
    True,
    Text,
    Data,
    Count,
    False,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TotalMode {
    None,
    Estimate,
    #[default]
    Accurate,
}

/// Parsing behavior.
#[derive(Debug, Clone)]
pub struct ParseOptions {
    /// Log and skip invalid parameters instead of failing.
    pub lenient: bool,
    pub default_page_size: usize,
    pub max_page_size: usize,
}

impl Default for ParseOptions {
    fn default() -> Self {
        Self {
            lenient: false,
            default_page_size: DEFAULT_PAGE_SIZE,
            max_page_size: MAX_PAGE_SIZE,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SearchContext {
    /// `None` for whole-system search.
    pub resource_type: Option<String>,
    /// `_type` restriction for system search.
    pub resource_types: Vec<String>,
    /// AND-ed parameters.
    pub parameters: Vec<QueryParameter>,
    pub page_size: usize,
    /// 1-based.
    pub page_number: usize,
    pub sort: Vec<SortParameter>,
    pub includes: Vec<InclusionParameter>,
    pub revincludes: Vec<InclusionParameter>,
    pub elements: Vec<String>,
    pub summary: Option<SummaryMode>,
    pub total: TotalMode,
    /// Problems skipped in lenient mode.
    pub warnings: Vec<String>,
}

impl SearchContext {
    pub fn new(resource_type: Option<String>, page_size: usize) -> Self {
        Self {
            resource_type,
            resource_types: Vec::new(),
            parameters: Vec::new(),
            page_size,
            page_number: 1,
            sort: Vec::new(),
            includes: Vec::new(),
            revincludes: Vec::new(),
            elements: Vec::new(),
            summary: None,
            total: TotalMode::default(),
            warnings: Vec::new(),
        }
    }

    /// Row offset of the requested page, `None` past [`MAX_OFFSET`].
    pub fn checked_offset(&self) -> Option<usize> {
        self.page_size
            .checked_mul(self.page_number.saturating_sub(1))
            .filter(|offset| *offset <= MAX_OFFSET)
    }

    pub fn offset(&self) -> usize {
        self.checked_offset().unwrap_or(MAX_OFFSET)
    }

    pub fn count_only(&self) -> bool {
        matches!(self.summary, Some(SummaryMode::Count))
    }

    /// Resource types the search ranges over.
    pub fn searched_types(&self) -> Vec<String> {
        match &self.resource_type {
            Some(t) => vec![t.clone()],
            None => self.resource_types.clone(),
        }
    }
}
