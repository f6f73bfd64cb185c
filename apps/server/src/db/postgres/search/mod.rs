//! Search over the value tables.
//!
//! A search is one id query (`LIMIT page_size + 1` to detect the next page),
//! an optional count query sharing its WHERE clause, and a load of the
//! current versions in id query order. Includes are resolved in rounds of
//! id queries over `ref_values`.

mod bind;
mod clauses;

pub use bind::BindValue;

use super::load_current_versions;
use crate::models::SearchPage;
use crate::{Error, Result};
use clauses::ClauseBuilder;
use meridian_search::{InclusionParameter, SearchContext, TotalMode};
use sqlx::PgConnection;
use std::collections::HashSet;
use std::time::{Duration, Instant};

/// SQL of one search, ready to execute.
#[derive(Debug)]
pub(crate) struct BuiltSearch {
    pub sql: String,
    pub count_sql: String,
    pub bind_params: Vec<BindValue>,
}

pub(crate) fn build_search(context: &SearchContext) -> BuiltSearch {
    let mut builder = ClauseBuilder::default();
    let mut conditions = vec!["NOT lr.is_deleted".to_string()];

    let types = context.searched_types();
    if !types.is_empty() {
        let type_ids = builder.type_ids(types);
        conditions.push(format!("lr.resource_type_id IN {type_ids}"));
    }
    for param in &context.parameters {
        conditions.push(builder.parameter("lr", param));
    }
    let where_clause = conditions.join(" AND ");

    let mut order: Vec<String> = context
        .sort
        .iter()
        .filter_map(|s| builder.sort_expression("lr", s))
        .collect();
    order.push("lr.logical_resource_id".to_string());

    let sql = format!(
        "SELECT lr.logical_resource_id FROM logical_resources lr WHERE {where_clause} ORDER BY {} LIMIT {} OFFSET {}",
        order.join(", "),
        context.page_size + 1,
        context.offset()
    );
    let count_sql = format!("SELECT COUNT(*) FROM logical_resources lr WHERE {where_clause}");

    BuiltSearch {
        sql,
        count_sql,
        bind_params: builder.bind_params,
    }
}

fn log_if_slow(started: Instant, slow: Duration, sql: &str) {
    let elapsed = started.elapsed();
    if elapsed >= slow {
        tracing::warn!(
            elapsed_ms = elapsed.as_millis() as u64,
            sql = %sql,
            "Slow search statement"
        );
    }
}

pub(crate) async fn execute(
    conn: &mut PgConnection,
    context: &SearchContext,
    max_include_depth: usize,
    slow_statement: Duration,
) -> Result<SearchPage> {
    let built = build_search(context);
    tracing::trace!(sql = %built.sql, binds = built.bind_params.len(), "Executing search");

    let total = if context.count_only() || context.total != TotalMode::None {
        let started = Instant::now();
        let mut count_query = sqlx::query_scalar::<_, i64>(&built.count_sql);
        for value in &built.bind_params {
            count_query = match value {
                BindValue::Text(v) => count_query.bind(v),
                BindValue::TextArray(vs) => count_query.bind(vs),
            };
        }
        let total = count_query
            .fetch_one(&mut *conn)
            .await
            .map_err(Error::Database)?;
        log_if_slow(started, slow_statement, &built.count_sql);
        Some(total)
    } else {
        None
    };
    if context.count_only() {
        return Ok(SearchPage {
            total,
            ..Default::default()
        });
    }

    let started = Instant::now();
    let mut id_query = sqlx::query_scalar::<_, i64>(&built.sql);
    for value in &built.bind_params {
        id_query = match value {
            BindValue::Text(v) => id_query.bind(v),
            BindValue::TextArray(vs) => id_query.bind(vs),
        };
    }
    let mut ids = id_query.fetch_all(&mut *conn).await.map_err(Error::Database)?;
    log_if_slow(started, slow_statement, &built.sql);

    let has_next = ids.len() > context.page_size;
    ids.truncate(context.page_size);

    let matches = load_current_versions(conn, &ids).await?;
    let include_ids = resolve_includes(conn, context, &ids, max_include_depth).await?;
    let includes = load_current_versions(conn, &include_ids).await?;

    Ok(SearchPage {
        matches,
        includes,
        total,
        has_next,
    })
}

/// Logical resource ids reached from `matches` through `_include` and
/// `_revinclude`, in discovery order. Rounds after the first only follow
/// `:iterate` parameters.
async fn resolve_includes(
    conn: &mut PgConnection,
    context: &SearchContext,
    matches: &[i64],
    max_depth: usize,
) -> Result<Vec<i64>> {
    if context.includes.is_empty() && context.revincludes.is_empty() {
        return Ok(Vec::new());
    }
    let mut seen: HashSet<i64> = matches.iter().copied().collect();
    let mut frontier: Vec<i64> = matches.to_vec();
    let mut included = Vec::new();

    for depth in 0..max_depth.max(1) {
        if frontier.is_empty() {
            break;
        }
        let mut next = Vec::new();
        for inc in context.includes.iter().filter(|i| depth == 0 || i.iterate) {
            for id in include_targets(conn, inc, &frontier).await? {
                if seen.insert(id) {
                    next.push(id);
                }
            }
        }
        for rev in context.revincludes.iter().filter(|i| depth == 0 || i.iterate) {
            for id in revinclude_sources(conn, rev, &frontier).await? {
                if seen.insert(id) {
                    next.push(id);
                }
            }
        }
        included.extend(next.iter().copied());
        frontier = next;
    }
    Ok(included)
}

const INCLUDE_SQL: &str = "SELECT DISTINCT t.logical_resource_id \
     FROM ref_values sp \
     JOIN logical_resources s ON s.logical_resource_id = sp.logical_resource_id \
     JOIN logical_resources t ON t.logical_resource_id = sp.ref_logical_resource_id \
     JOIN resource_types srt ON srt.resource_type_id = s.resource_type_id \
     JOIN resource_types trt ON trt.resource_type_id = t.resource_type_id \
     WHERE sp.logical_resource_id = ANY($1) \
       AND sp.parameter_name_id = (SELECT parameter_name_id FROM parameter_names WHERE parameter_name = $2) \
       AND sp.composite_id IS NULL \
       AND srt.resource_type = $3 \
       AND ($4::text IS NULL OR trt.resource_type = $4) \
       AND NOT t.is_deleted \
     ORDER BY t.logical_resource_id";

const REVINCLUDE_SQL: &str = "SELECT DISTINCT s.logical_resource_id \
     FROM ref_values sp \
     JOIN logical_resources s ON s.logical_resource_id = sp.logical_resource_id \
     JOIN logical_resources t ON t.logical_resource_id = sp.ref_logical_resource_id \
     JOIN resource_types srt ON srt.resource_type_id = s.resource_type_id \
     JOIN resource_types trt ON trt.resource_type_id = t.resource_type_id \
     WHERE sp.ref_logical_resource_id = ANY($1) \
       AND sp.parameter_name_id = (SELECT parameter_name_id FROM parameter_names WHERE parameter_name = $2) \
       AND sp.composite_id IS NULL \
       AND srt.resource_type = $3 \
       AND ($4::text IS NULL OR trt.resource_type = $4) \
       AND NOT s.is_deleted \
     ORDER BY s.logical_resource_id";

async fn include_targets(conn: &mut PgConnection, inc: &InclusionParameter, frontier: &[i64]) -> Result<Vec<i64>> {
    sqlx::query_scalar::<_, i64>(INCLUDE_SQL)
        .bind(frontier)
        .bind(&inc.code)
        .bind(&inc.source_type)
        .bind(inc.target_type.as_deref())
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)
}

async fn revinclude_sources(conn: &mut PgConnection, rev: &InclusionParameter, frontier: &[i64]) -> Result<Vec<i64>> {
    sqlx::query_scalar::<_, i64>(REVINCLUDE_SQL)
        .bind(frontier)
        .bind(&rev.code)
        .bind(&rev.source_type)
        .bind(rev.target_type.as_deref())
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)
}
