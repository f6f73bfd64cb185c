//! Search value tables: identity resolution, bulk inserts and reads.
//!
//! Identities are resolved in a fixed order (parameter names, code systems,
//! resource types, common token values, canonical values, logical resource
//! identities). Each step fetches known ids in chunks, inserts the missing
//! keys in sorted order with `ON CONFLICT DO NOTHING`, fetches again and
//! fails if any key is still unresolved. Sorted inserts keep concurrent
//! writers from deadlocking on the unique indexes.

use crate::db::identity_cache::{IdentityCache, LogicalResourceKey, PendingIdentities, TokenValueKey};
use crate::models::{ExtractedParameterValue, ExtractedValue, IndexedResource};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use meridian_search::normalize::normalize_string;
use meridian_search::SearchParamType;
use rust_decimal::Decimal;
use sqlx::{PgConnection, Row};
use std::collections::{BTreeMap, BTreeSet, HashMap};

/// Every table holding search values of a logical resource.
pub(crate) const VALUE_TABLES: [&str; 8] = [
    "str_values",
    "number_values",
    "date_values",
    "resource_token_refs",
    "ref_values",
    "uri_values",
    "quantity_values",
    "latlng_values",
];

/// Code system of token values that have none.
pub(crate) const DEFAULT_TOKEN_SYSTEM: &str = "default-token-system";

const CHUNK_SIZE: usize = 500;

/// A value with its composite placement, flattened for insertion.
struct FlatValue<'a> {
    logical_resource_id: i64,
    code: &'a str,
    value: &'a ExtractedValue,
    /// `(composite_id, component_idx, composite code)`
    composite: Option<(i32, i16, &'a str)>,
}

fn flatten(resources: &[IndexedResource]) -> Vec<FlatValue<'_>> {
    let mut flat = Vec::new();
    for resource in resources {
        let mut next_composite_id = 0;
        for v in &resource.values {
            match &v.value {
                ExtractedValue::Composite { components } => {
                    next_composite_id += 1;
                    for (idx, component) in components.iter().enumerate() {
                        flat.push(FlatValue {
                            logical_resource_id: resource.logical_resource_id,
                            code: &component.code,
                            value: &component.value,
                            composite: Some((next_composite_id, idx as i16, &v.code)),
                        });
                    }
                }
                value => flat.push(FlatValue {
                    logical_resource_id: resource.logical_resource_id,
                    code: &v.code,
                    value,
                    composite: None,
                }),
            }
        }
    }
    flat
}

fn token_system(system: &Option<String>) -> &str {
    system.as_deref().unwrap_or(DEFAULT_TOKEN_SYSTEM)
}

/// Local target of a reference, when it names one.
fn reference_target(value: &ExtractedValue) -> Option<(&str, &str)> {
    match value {
        ExtractedValue::Reference {
            resource_type: Some(t),
            id: Some(id),
            ..
        } => Some((t, id)),
        _ => None,
    }
}

fn reference_url(value: &ExtractedValue) -> Option<&str> {
    match value {
        ExtractedValue::Reference { url: Some(url), .. } => Some(url),
        _ => None,
    }
}

/// Ids needed to write a batch of values.
#[derive(Debug, Default)]
pub(crate) struct ResolvedIds {
    pub parameter_names: HashMap<String, i32>,
    pub code_systems: HashMap<String, i32>,
    pub resource_types: HashMap<String, i32>,
    pub token_values: HashMap<TokenValueKey, i64>,
    pub canonicals: HashMap<String, i64>,
    pub logical_resources: HashMap<LogicalResourceKey, i64>,
}

fn to_i32(label: &str, id: i64) -> Result<i32> {
    i32::try_from(id).map_err(|_| Error::Internal(format!("{label} id {id} out of range")))
}

/// Resolve text keyed identities (`SELECT key, id::bigint ... = ANY($1)`).
async fn resolve_text_ids(
    conn: &mut PgConnection,
    label: &str,
    keys: Vec<String>,
    select_sql: &str,
    insert_sql: &str,
) -> Result<HashMap<String, i64>> {
    let mut resolved = HashMap::with_capacity(keys.len());
    if keys.is_empty() {
        return Ok(resolved);
    }
    for chunk in keys.chunks(CHUNK_SIZE) {
        fetch_text_ids(conn, select_sql, chunk, &mut resolved).await?;
    }

    let mut missing: Vec<String> = keys.into_iter().filter(|k| !resolved.contains_key(k)).collect();
    if missing.is_empty() {
        return Ok(resolved);
    }
    missing.sort();
    tracing::debug!(kind = label, count = missing.len(), "Inserting new identities");
    for chunk in missing.chunks(CHUNK_SIZE) {
        sqlx::query(insert_sql)
            .bind(chunk)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        fetch_text_ids(conn, select_sql, chunk, &mut resolved).await?;
    }

    if let Some(unresolved) = missing.iter().find(|k| !resolved.contains_key(*k)) {
        return Err(Error::Internal(format!("Failed to resolve {label} '{unresolved}'")));
    }
    Ok(resolved)
}

async fn fetch_text_ids(
    conn: &mut PgConnection,
    select_sql: &str,
    keys: &[String],
    resolved: &mut HashMap<String, i64>,
) -> Result<()> {
    let rows: Vec<(String, i64)> = sqlx::query_as(select_sql)
        .bind(keys)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)?;
    resolved.extend(rows);
    Ok(())
}

/// Resolve `(int, text)` keyed identities.
async fn resolve_pair_ids(
    conn: &mut PgConnection,
    label: &str,
    keys: Vec<(i32, String)>,
    select_sql: &str,
    insert_sql: &str,
) -> Result<HashMap<(i32, String), i64>> {
    let mut resolved = HashMap::with_capacity(keys.len());
    if keys.is_empty() {
        return Ok(resolved);
    }
    for chunk in keys.chunks(CHUNK_SIZE) {
        fetch_pair_ids(conn, select_sql, chunk, &mut resolved).await?;
    }

    let mut missing: Vec<(i32, String)> = keys.into_iter().filter(|k| !resolved.contains_key(k)).collect();
    if missing.is_empty() {
        return Ok(resolved);
    }
    missing.sort();
    tracing::debug!(kind = label, count = missing.len(), "Inserting new identities");
    for chunk in missing.chunks(CHUNK_SIZE) {
        let (ids, texts): (Vec<i32>, Vec<String>) = chunk.iter().cloned().unzip();
        sqlx::query(insert_sql)
            .bind(&ids)
            .bind(&texts)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        fetch_pair_ids(conn, select_sql, chunk, &mut resolved).await?;
    }

    if let Some((id, text)) = missing.iter().find(|k| !resolved.contains_key(*k)) {
        return Err(Error::Internal(format!("Failed to resolve {label} ({id}, '{text}')")));
    }
    Ok(resolved)
}

async fn fetch_pair_ids(
    conn: &mut PgConnection,
    select_sql: &str,
    keys: &[(i32, String)],
    resolved: &mut HashMap<(i32, String), i64>,
) -> Result<()> {
    let (ids, texts): (Vec<i32>, Vec<String>) = keys.iter().cloned().unzip();
    let rows: Vec<(i32, String, i64)> = sqlx::query_as(select_sql)
        .bind(&ids)
        .bind(&texts)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)?;
    resolved.extend(rows.into_iter().map(|(id, text, value)| ((id, text), value)));
    Ok(())
}

/// Split `keys` into cached ids and keys still to resolve.
fn partition_cached<K: Clone + Ord, V>(
    keys: BTreeSet<K>,
    lookup: impl Fn(&K) -> Option<V>,
    resolved: &mut HashMap<K, V>,
) -> Vec<K>
where
    K: std::hash::Hash + Eq,
{
    let mut missing = Vec::new();
    for key in keys {
        match lookup(&key) {
            Some(id) => {
                resolved.insert(key, id);
            }
            None => missing.push(key),
        }
    }
    missing
}

pub(crate) async fn resolve_resource_type(
    conn: &mut PgConnection,
    cache: &IdentityCache,
    pending: &mut PendingIdentities,
    resource_type: &str,
) -> Result<i32> {
    if let Some(id) = pending
        .resource_types
        .get(resource_type)
        .copied()
        .or_else(|| cache.resource_type_id(resource_type))
    {
        return Ok(id);
    }
    let ids = resolve_text_ids(
        conn,
        "resource type",
        vec![resource_type.to_string()],
        "SELECT resource_type, resource_type_id::bigint FROM resource_types WHERE resource_type = ANY($1)",
        "INSERT INTO resource_types (resource_type) SELECT v FROM UNNEST($1::text[]) AS t(v) ORDER BY v ON CONFLICT DO NOTHING",
    )
    .await?;
    let id = ids
        .get(resource_type)
        .copied()
        .ok_or_else(|| Error::Internal(format!("Failed to resolve resource type '{resource_type}'")))?;
    let id = to_i32("resource type", id)?;
    pending.resource_types.insert(resource_type.to_string(), id);
    Ok(id)
}

/// Resolve every identity the values of `resources` refer to.
pub(crate) async fn resolve_identities(
    conn: &mut PgConnection,
    cache: &IdentityCache,
    pending: &mut PendingIdentities,
    resources: &[IndexedResource],
) -> Result<ResolvedIds> {
    let flat = flatten(resources);
    let mut ids = ResolvedIds::default();

    // parameter names
    let mut names = BTreeSet::new();
    for v in &flat {
        names.insert(v.code.to_string());
        if let Some((_, _, composite_code)) = v.composite {
            names.insert(composite_code.to_string());
        }
    }
    let missing = partition_cached(names, |k| pending.parameter_name_id(cache, k), &mut ids.parameter_names);
    let fetched = resolve_text_ids(
        conn,
        "parameter name",
        missing,
        "SELECT parameter_name, parameter_name_id::bigint FROM parameter_names WHERE parameter_name = ANY($1)",
        "INSERT INTO parameter_names (parameter_name) SELECT v FROM UNNEST($1::text[]) AS t(v) ORDER BY v ON CONFLICT DO NOTHING",
    )
    .await?;
    for (name, id) in fetched {
        let id = to_i32("parameter name", id)?;
        pending.parameter_names.insert(name.clone(), id);
        ids.parameter_names.insert(name, id);
    }

    // code systems
    let systems: BTreeSet<String> = flat
        .iter()
        .filter_map(|v| match v.value {
            ExtractedValue::Token { system, .. } => Some(token_system(system).to_string()),
            _ => None,
        })
        .collect();
    let missing = partition_cached(systems, |k| pending.code_system_id(cache, k), &mut ids.code_systems);
    let fetched = resolve_text_ids(
        conn,
        "code system",
        missing,
        "SELECT code_system, code_system_id::bigint FROM code_systems WHERE code_system = ANY($1)",
        "INSERT INTO code_systems (code_system) SELECT v FROM UNNEST($1::text[]) AS t(v) ORDER BY v ON CONFLICT DO NOTHING",
    )
    .await?;
    for (system, id) in fetched {
        let id = to_i32("code system", id)?;
        pending.code_systems.insert(system.clone(), id);
        ids.code_systems.insert(system, id);
    }

    // resource types of reference targets
    let target_types: BTreeSet<String> = flat
        .iter()
        .filter_map(|v| reference_target(v.value).map(|(t, _)| t.to_string()))
        .collect();
    for resource_type in target_types {
        let id = resolve_resource_type(conn, cache, pending, &resource_type).await?;
        ids.resource_types.insert(resource_type, id);
    }

    // common token values
    let mut token_keys = BTreeSet::new();
    for v in &flat {
        if let ExtractedValue::Token { system, code } = v.value {
            let system_id = ids
                .code_systems
                .get(token_system(system))
                .copied()
                .ok_or_else(|| Error::Internal(format!("Unresolved code system for token '{code}'")))?;
            token_keys.insert((system_id, code.clone()));
        }
    }
    let missing = partition_cached(token_keys, |k| pending.token_value_id(cache, k), &mut ids.token_values);
    let fetched = resolve_pair_ids(
        conn,
        "token value",
        missing,
        "SELECT t.code_system_id, t.token_value, t.common_token_value_id
         FROM common_token_values t
         JOIN UNNEST($1::int[], $2::text[]) AS k(code_system_id, token_value)
           USING (code_system_id, token_value)",
        "INSERT INTO common_token_values (code_system_id, token_value)
         SELECT * FROM UNNEST($1::int[], $2::text[]) AS k(code_system_id, token_value)
         ORDER BY 1, 2
         ON CONFLICT DO NOTHING",
    )
    .await?;
    pending.token_values.extend(fetched.clone());
    ids.token_values.extend(fetched);

    // canonical values
    let urls: BTreeSet<String> = flat
        .iter()
        .filter_map(|v| reference_url(v.value).map(str::to_string))
        .collect();
    let missing = partition_cached(urls, |k| pending.canonical_id(cache, k), &mut ids.canonicals);
    let fetched = resolve_text_ids(
        conn,
        "canonical value",
        missing,
        "SELECT url, canonical_id FROM common_canonical_values WHERE url = ANY($1)",
        "INSERT INTO common_canonical_values (url) SELECT v FROM UNNEST($1::text[]) AS t(v) ORDER BY v ON CONFLICT DO NOTHING",
    )
    .await?;
    pending.canonicals.extend(fetched.clone());
    ids.canonicals.extend(fetched);

    // logical resource identities of reference targets
    let targets: BTreeSet<LogicalResourceKey> = flat
        .iter()
        .filter_map(|v| reference_target(v.value).map(|(t, id)| (t.to_string(), id.to_string())))
        .collect();
    let missing = partition_cached(targets, |k| pending.logical_resource_id(cache, k), &mut ids.logical_resources);
    let mut keyed = Vec::with_capacity(missing.len());
    for (resource_type, logical_id) in &missing {
        let type_id = ids
            .resource_types
            .get(resource_type)
            .copied()
            .ok_or_else(|| Error::Internal(format!("Unresolved resource type '{resource_type}'")))?;
        keyed.push((type_id, logical_id.clone()));
    }
    let fetched = resolve_pair_ids(
        conn,
        "logical resource",
        keyed,
        "SELECT li.resource_type_id, li.logical_id, li.logical_resource_id
         FROM logical_resource_ident li
         JOIN UNNEST($1::int[], $2::text[]) AS k(resource_type_id, logical_id)
           USING (resource_type_id, logical_id)",
        "INSERT INTO logical_resource_ident (resource_type_id, logical_id)
         SELECT * FROM UNNEST($1::int[], $2::text[]) AS k(resource_type_id, logical_id)
         ORDER BY 1, 2
         ON CONFLICT DO NOTHING",
    )
    .await?;
    let type_names: HashMap<i32, &String> = ids.resource_types.iter().map(|(k, v)| (*v, k)).collect();
    for ((type_id, logical_id), id) in fetched {
        if let Some(resource_type) = type_names.get(&type_id) {
            let key = ((*resource_type).clone(), logical_id);
            pending.logical_resources.insert(key.clone(), id);
            ids.logical_resources.insert(key, id);
        }
    }

    Ok(ids)
}

/// Columns shared by all value tables.
#[derive(Default)]
struct Common {
    logical_resource_ids: Vec<i64>,
    parameter_name_ids: Vec<i32>,
    composite_ids: Vec<Option<i32>>,
    component_idxs: Vec<Option<i16>>,
    composite_parameter_name_ids: Vec<Option<i32>>,
}

impl Common {
    fn push(&mut self, v: &FlatValue<'_>, ids: &ResolvedIds) -> Result<()> {
        let name_id = |code: &str| {
            ids.parameter_names
                .get(code)
                .copied()
                .ok_or_else(|| Error::Internal(format!("Unresolved parameter name '{code}'")))
        };
        self.logical_resource_ids.push(v.logical_resource_id);
        self.parameter_name_ids.push(name_id(v.code)?);
        match v.composite {
            Some((composite_id, idx, composite_code)) => {
                self.composite_ids.push(Some(composite_id));
                self.component_idxs.push(Some(idx));
                self.composite_parameter_name_ids.push(Some(name_id(composite_code)?));
            }
            None => {
                self.composite_ids.push(None);
                self.component_idxs.push(None);
                self.composite_parameter_name_ids.push(None);
            }
        }
        Ok(())
    }

    fn len(&self) -> usize {
        self.logical_resource_ids.len()
    }
}

#[derive(Default)]
struct ValueBatch {
    strings: (Common, Vec<String>, Vec<String>),
    numbers: (Common, Vec<Decimal>, Vec<Decimal>, Vec<Decimal>),
    dates: (Common, Vec<DateTime<Utc>>, Vec<DateTime<Utc>>),
    tokens: (Common, Vec<i64>),
    refs: (Common, Vec<Option<i64>>, Vec<Option<i64>>, Vec<Option<String>>),
    uris: (Common, Vec<String>),
    quantities: (
        Common,
        Vec<Decimal>,
        Vec<Decimal>,
        Vec<Decimal>,
        Vec<Option<String>>,
        Vec<Option<String>>,
        Vec<Option<String>>,
    ),
    locations: (Common, Vec<f64>, Vec<f64>),
}

impl ValueBatch {
    fn build(resources: &[IndexedResource], ids: &ResolvedIds) -> Result<Self> {
        let mut batch = Self::default();
        for v in flatten(resources) {
            match v.value {
                ExtractedValue::String { value } => {
                    batch.strings.0.push(&v, ids)?;
                    batch.strings.1.push(value.clone());
                    batch.strings.2.push(normalize_string(value));
                }
                ExtractedValue::Number { value, low, high } => {
                    batch.numbers.0.push(&v, ids)?;
                    batch.numbers.1.push(*value);
                    batch.numbers.2.push(*low);
                    batch.numbers.3.push(*high);
                }
                ExtractedValue::Date { start, end } => {
                    batch.dates.0.push(&v, ids)?;
                    batch.dates.1.push(*start);
                    batch.dates.2.push(*end);
                }
                ExtractedValue::Token { system, code } => {
                    let system_id = ids.code_systems.get(token_system(system)).copied();
                    let token_id = system_id.and_then(|s| ids.token_values.get(&(s, code.clone())).copied());
                    let token_id =
                        token_id.ok_or_else(|| Error::Internal(format!("Unresolved token value '{code}'")))?;
                    batch.tokens.0.push(&v, ids)?;
                    batch.tokens.1.push(token_id);
                }
                ExtractedValue::Reference { version, .. } => {
                    let target = reference_target(v.value)
                        .and_then(|(t, id)| ids.logical_resources.get(&(t.to_string(), id.to_string())).copied());
                    let canonical = reference_url(v.value).and_then(|url| ids.canonicals.get(url).copied());
                    if target.is_none() && canonical.is_none() {
                        tracing::trace!(code = v.code, "Skipping reference without a resolvable target");
                        continue;
                    }
                    batch.refs.0.push(&v, ids)?;
                    batch.refs.1.push(target);
                    batch.refs.2.push(canonical);
                    batch.refs.3.push(version.clone());
                }
                ExtractedValue::Uri { value } => {
                    batch.uris.0.push(&v, ids)?;
                    batch.uris.1.push(value.clone());
                }
                ExtractedValue::Quantity {
                    value,
                    low,
                    high,
                    system,
                    code,
                    unit,
                } => {
                    let q = &mut batch.quantities;
                    q.0.push(&v, ids)?;
                    q.1.push(*value);
                    q.2.push(*low);
                    q.3.push(*high);
                    q.4.push(system.clone());
                    q.5.push(code.clone());
                    q.6.push(unit.clone());
                }
                ExtractedValue::Location { latitude, longitude } => {
                    batch.locations.0.push(&v, ids)?;
                    batch.locations.1.push(*latitude);
                    batch.locations.2.push(*longitude);
                }
                ExtractedValue::Composite { .. } => {}
            }
        }
        Ok(batch)
    }
}

const COMMON_COLUMNS: &str =
    "logical_resource_id, parameter_name_id, composite_id, component_idx, composite_parameter_name_id";
const COMMON_UNNEST: &str = "$1::bigint[], $2::int[], $3::int[], $4::smallint[], $5::int[]";

macro_rules! bind_common {
    ($query:expr, $common:expr) => {
        $query
            .bind(&$common.logical_resource_ids)
            .bind(&$common.parameter_name_ids)
            .bind(&$common.composite_ids)
            .bind(&$common.component_idxs)
            .bind(&$common.composite_parameter_name_ids)
    };
}

fn insert_sql(table: &str, columns: &str, casts: &str) -> String {
    format!(
        "INSERT INTO {table} ({COMMON_COLUMNS}, {columns}) SELECT * FROM UNNEST({COMMON_UNNEST}, {casts})"
    )
}

/// Insert all values of `resources`. Returns the number of rows written.
pub(crate) async fn insert_values(
    conn: &mut PgConnection,
    resources: &[IndexedResource],
    ids: &ResolvedIds,
) -> Result<usize> {
    let batch = ValueBatch::build(resources, ids)?;
    let mut rows = 0;

    let (c, values, norms) = &batch.strings;
    if c.len() > 0 {
        let sql = insert_sql("str_values", "str_value, str_value_norm", "$6::text[], $7::text[]");
        bind_common!(sqlx::query(&sql), c)
            .bind(values)
            .bind(norms)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        rows += c.len();
    }

    let (c, values, lows, highs) = &batch.numbers;
    if c.len() > 0 {
        let sql = insert_sql(
            "number_values",
            "number_value, number_value_low, number_value_high",
            "$6::numeric[], $7::numeric[], $8::numeric[]",
        );
        bind_common!(sqlx::query(&sql), c)
            .bind(values)
            .bind(lows)
            .bind(highs)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        rows += c.len();
    }

    let (c, starts, ends) = &batch.dates;
    if c.len() > 0 {
        let sql = insert_sql(
            "date_values",
            "date_start, date_end",
            "$6::timestamptz[], $7::timestamptz[]",
        );
        bind_common!(sqlx::query(&sql), c)
            .bind(starts)
            .bind(ends)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        rows += c.len();
    }

    let (c, token_ids) = &batch.tokens;
    if c.len() > 0 {
        let sql = insert_sql("resource_token_refs", "common_token_value_id", "$6::bigint[]");
        bind_common!(sqlx::query(&sql), c)
            .bind(token_ids)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        rows += c.len();
    }

    let (c, targets, canonicals, versions) = &batch.refs;
    if c.len() > 0 {
        let sql = insert_sql(
            "ref_values",
            "ref_logical_resource_id, ref_canonical_id, ref_version",
            "$6::bigint[], $7::bigint[], $8::text[]",
        );
        bind_common!(sqlx::query(&sql), c)
            .bind(targets)
            .bind(canonicals)
            .bind(versions)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        rows += c.len();
    }

    let (c, uris) = &batch.uris;
    if c.len() > 0 {
        let sql = insert_sql("uri_values", "uri_value", "$6::text[]");
        bind_common!(sqlx::query(&sql), c)
            .bind(uris)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        rows += c.len();
    }

    let (c, values, lows, highs, systems, codes, units) = &batch.quantities;
    if c.len() > 0 {
        let sql = insert_sql(
            "quantity_values",
            "quantity_value, quantity_value_low, quantity_value_high, code_system, code, unit",
            "$6::numeric[], $7::numeric[], $8::numeric[], $9::text[], $10::text[], $11::text[]",
        );
        bind_common!(sqlx::query(&sql), c)
            .bind(values)
            .bind(lows)
            .bind(highs)
            .bind(systems)
            .bind(codes)
            .bind(units)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        rows += c.len();
    }

    let (c, lats, lngs) = &batch.locations;
    if c.len() > 0 {
        let sql = insert_sql(
            "latlng_values",
            "latitude, longitude",
            "$6::double precision[], $7::double precision[]",
        );
        bind_common!(sqlx::query(&sql), c)
            .bind(lats)
            .bind(lngs)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
        rows += c.len();
    }

    Ok(rows)
}

/// Delete every stored value of the given logical resources.
pub(crate) async fn delete_values(conn: &mut PgConnection, logical_resource_ids: &[i64]) -> Result<()> {
    if logical_resource_ids.is_empty() {
        return Ok(());
    }
    for table in VALUE_TABLES {
        sqlx::query(&format!("DELETE FROM {table} WHERE logical_resource_id = ANY($1)"))
            .bind(logical_resource_ids)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?;
    }
    Ok(())
}

/// A stored row before composites are reassembled.
struct StoredRow {
    value: ExtractedParameterValue,
    /// `(composite_id, component_idx, composite code)`
    composite: Option<(i32, i16, String)>,
}

fn param_type_of(value: &ExtractedValue) -> SearchParamType {
    match value {
        ExtractedValue::String { .. } => SearchParamType::String,
        ExtractedValue::Number { .. } => SearchParamType::Number,
        ExtractedValue::Date { .. } => SearchParamType::Date,
        ExtractedValue::Token { .. } => SearchParamType::Token,
        ExtractedValue::Quantity { .. } => SearchParamType::Quantity,
        ExtractedValue::Location { .. } => SearchParamType::Special,
        ExtractedValue::Reference { .. } => SearchParamType::Reference,
        ExtractedValue::Uri { .. } => SearchParamType::Uri,
        ExtractedValue::Composite { .. } => SearchParamType::Composite,
    }
}

/// Columns selected by every read query, after the table specific ones.
const READ_COMMON: &str = "pn.parameter_name AS code, sp.composite_id, sp.component_idx, cpn.parameter_name AS composite_code";
const READ_JOINS: &str = "JOIN parameter_names pn ON pn.parameter_name_id = sp.parameter_name_id
     LEFT JOIN parameter_names cpn ON cpn.parameter_name_id = sp.composite_parameter_name_id";

/// Search values currently stored for a logical resource.
pub(crate) async fn read_values(
    conn: &mut PgConnection,
    logical_resource_id: i64,
) -> Result<Vec<ExtractedParameterValue>> {
    let queries: [(&str, &str, &str); 8] = [
        ("str_values", "sp.str_value", ""),
        (
            "number_values",
            "sp.number_value, sp.number_value_low, sp.number_value_high",
            "",
        ),
        ("date_values", "sp.date_start, sp.date_end", ""),
        (
            "resource_token_refs",
            "cs.code_system, tv.token_value",
            "JOIN common_token_values tv ON tv.common_token_value_id = sp.common_token_value_id
             JOIN code_systems cs ON cs.code_system_id = tv.code_system_id",
        ),
        (
            "ref_values",
            "rt.resource_type AS ref_type, li.logical_id AS ref_id, sp.ref_version, ccv.url AS ref_url",
            "LEFT JOIN logical_resource_ident li ON li.logical_resource_id = sp.ref_logical_resource_id
             LEFT JOIN resource_types rt ON rt.resource_type_id = li.resource_type_id
             LEFT JOIN common_canonical_values ccv ON ccv.canonical_id = sp.ref_canonical_id",
        ),
        ("uri_values", "sp.uri_value", ""),
        (
            "quantity_values",
            "sp.quantity_value, sp.quantity_value_low, sp.quantity_value_high, sp.code_system, sp.code, sp.unit",
            "",
        ),
        ("latlng_values", "sp.latitude, sp.longitude", ""),
    ];

    let mut stored = Vec::new();
    for (table, columns, joins) in queries {
        let sql = format!(
            "SELECT {columns}, {READ_COMMON} FROM {table} sp {READ_JOINS} {joins} WHERE sp.logical_resource_id = $1"
        );
        let rows = sqlx::query(&sql)
            .bind(logical_resource_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(Error::Database)?;
        for row in rows {
            let value = match table {
                "str_values" => ExtractedValue::String {
                    value: row.try_get("str_value")?,
                },
                "number_values" => ExtractedValue::Number {
                    value: row.try_get("number_value")?,
                    low: row.try_get("number_value_low")?,
                    high: row.try_get("number_value_high")?,
                },
                "date_values" => ExtractedValue::Date {
                    start: row.try_get("date_start")?,
                    end: row.try_get("date_end")?,
                },
                "resource_token_refs" => {
                    let system: String = row.try_get("code_system")?;
                    ExtractedValue::Token {
                        system: (system != DEFAULT_TOKEN_SYSTEM).then_some(system),
                        code: row.try_get("token_value")?,
                    }
                }
                "ref_values" => ExtractedValue::Reference {
                    resource_type: row.try_get("ref_type")?,
                    id: row.try_get("ref_id")?,
                    version: row.try_get("ref_version")?,
                    url: row.try_get("ref_url")?,
                },
                "uri_values" => ExtractedValue::Uri {
                    value: row.try_get("uri_value")?,
                },
                "quantity_values" => ExtractedValue::Quantity {
                    value: row.try_get("quantity_value")?,
                    low: row.try_get("quantity_value_low")?,
                    high: row.try_get("quantity_value_high")?,
                    system: row.try_get("code_system")?,
                    code: row.try_get("code")?,
                    unit: row.try_get("unit")?,
                },
                _ => ExtractedValue::Location {
                    latitude: row.try_get("latitude")?,
                    longitude: row.try_get("longitude")?,
                },
            };
            let code: String = row.try_get("code")?;
            let composite_id: Option<i32> = row.try_get("composite_id")?;
            let component_idx: Option<i16> = row.try_get("component_idx")?;
            let composite_code: Option<String> = row.try_get("composite_code")?;
            stored.push(StoredRow {
                value: ExtractedParameterValue::new(code, param_type_of(&value), value),
                composite: match (composite_id, component_idx, composite_code) {
                    (Some(id), Some(idx), Some(code)) => Some((id, idx, code)),
                    _ => None,
                },
            });
        }
    }
    Ok(assemble(stored))
}

/// Reassemble composites and order values the way extraction does.
fn assemble(rows: Vec<StoredRow>) -> Vec<ExtractedParameterValue> {
    let mut values = Vec::new();
    let mut composites: BTreeMap<i32, (String, Vec<(i16, ExtractedParameterValue)>)> = BTreeMap::new();
    for row in rows {
        match row.composite {
            None => values.push(row.value),
            Some((id, idx, composite_code)) => {
                composites
                    .entry(id)
                    .or_insert_with(|| (composite_code, Vec::new()))
                    .1
                    .push((idx, row.value));
            }
        }
    }
    for (_, (code, mut components)) in composites {
        components.sort_by_key(|(idx, _)| *idx);
        values.push(ExtractedParameterValue::new(
            code,
            SearchParamType::Composite,
            ExtractedValue::Composite {
                components: components.into_iter().map(|(_, c)| c).collect(),
            },
        ));
    }
    values.sort_by_cached_key(|v| v.canonical_text());
    values
}

#[cfg(test)]
mod tests {
    use super::*;

    fn token(code: &str, value: &str) -> ExtractedParameterValue {
        ExtractedParameterValue::new(
            code,
            SearchParamType::Token,
            ExtractedValue::Token {
                system: None,
                code: value.into(),
            },
        )
    }

    #[test]
    fn flatten_numbers_composites_per_resource() {
        let composite = ExtractedParameterValue::new(
            "code-value-string",
            SearchParamType::Composite,
            ExtractedValue::Composite {
                components: vec![
                    token("code", "a"),
                    ExtractedParameterValue::new(
                        "value-string",
                        SearchParamType::String,
                        ExtractedValue::String { value: "x".into() },
                    ),
                ],
            },
        );
        let resources = vec![IndexedResource {
            logical_resource_id: 7,
            resource_type: "Observation".into(),
            logical_id: "o1".into(),
            values: vec![token("status", "final"), composite.clone(), composite],
        }];
        let flat = flatten(&resources);
        assert_eq!(flat.len(), 5);
        assert!(flat[0].composite.is_none());
        assert_eq!(flat[1].composite, Some((1, 0, "code-value-string")));
        assert_eq!(flat[2].composite, Some((1, 1, "code-value-string")));
        assert_eq!(flat[4].composite, Some((2, 1, "code-value-string")));
    }

    #[test]
    fn assemble_restores_composites_in_component_order() {
        let rows = vec![
            StoredRow {
                value: ExtractedParameterValue::new(
                    "value-string",
                    SearchParamType::String,
                    ExtractedValue::String { value: "x".into() },
                ),
                composite: Some((1, 1, "code-value-string".into())),
            },
            StoredRow {
                value: token("code", "a"),
                composite: Some((1, 0, "code-value-string".into())),
            },
            StoredRow {
                value: token("status", "final"),
                composite: None,
            },
        ];
        let values = assemble(rows);
        assert_eq!(values.len(), 2);
        let composite = values.iter().find(|v| v.code == "code-value-string").unwrap();
        match &composite.value {
            ExtractedValue::Composite { components } => {
                assert_eq!(components[0].code, "code");
                assert_eq!(components[1].code, "value-string");
            }
            other => panic!("unexpected value {other:?}"),
        }
    }

    #[test]
    fn default_token_system_round_trips_as_none() {
        assert_eq!(token_system(&None), DEFAULT_TOKEN_SYSTEM);
        assert_eq!(token_system(&Some("http://loinc.org".into())), "http://loinc.org");
    }
}
