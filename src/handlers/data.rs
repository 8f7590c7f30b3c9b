//! The `/v1/data` endpoint.
//!
//! Orchestrates the request pipeline: parse and validate, plan the SQL,
//! run the count (memoised) and the data or existence statement on one
//! pooled connection, pivot to wide records, and finish the response.
//! Validation failures never reach the database.

use axum::extract::{RawQuery, State};
use axum::http::{Method, StatusCode};
use axum::response::Response;
use sqlx::Arguments;
use sqlx::postgres::PgArguments;

use crate::AppState;
use crate::count_cache;
use crate::errors::ApiError;
use crate::models::record::LongRow;
use crate::models::request::{ResponseFormat, SqlValue};
use crate::query_builder;
use crate::query_parser::{self, ParsedQuery};
use crate::response;
use crate::shaper;

pub async fn query_data(
    State(state): State<AppState>,
    method: Method,
    RawQuery(query): RawQuery,
) -> Response {
    let raw_query = query.unwrap_or_default();

    match run(&state, &method, &raw_query).await {
        Ok(response) => response,
        Err(err) => {
            let format = query_parser::peek_format(&query_parser::decode_query(&raw_query));
            response::error_response(&err, format, &raw_query, None, &method, &state.settings)
        }
    }
}

async fn run(state: &AppState, method: &Method, raw_query: &str) -> Result<Response, ApiError> {
    let env = state.settings.environment;
    let parsed = query_parser::parse(raw_query, env)?;

    let release = state.release.latest(&state.pool).await?;
    let partition = query_builder::partition_id(release, &parsed.area_type);
    let filters = query_builder::released_filters(&parsed.filters_sql, env);

    let db_metrics = parsed.structure.db_metrics();
    let n_metrics = parsed.structure.n_metrics();
    let page = parsed.page.unwrap_or(1);
    let (limit, offset) = query_builder::page_window(n_metrics, page);

    let mut conn = state.pool.acquire().await?;

    if *method == Method::HEAD {
        let sql = query_builder::exists_query(&partition, &filters, offset);
        tracing::debug!(%partition, "exists: {sql}");

        let arguments = build_arguments(&db_metrics, &parsed.arguments)?;
        let found: Option<bool> = sqlx::query_scalar_with(&sql, arguments)
            .fetch_optional(&mut *conn)
            .await?;
        drop(conn);

        tracing::debug!(found = found.unwrap_or(false), "existence probe complete");
        // HEAD success is 204 regardless of the probe's outcome.
        return Ok(finish(state, StatusCode::OK, Vec::new(), &parsed, raw_query, release, method));
    }

    if let Some(latest_by) = parsed.latest_by.clone() {
        let sql = query_builder::latest_query(&partition, &filters, &latest_by);
        tracing::debug!(%partition, "latest: {sql}");

        let arguments = build_arguments(&db_metrics, &parsed.arguments)?;
        let rows: Vec<LongRow> = sqlx::query_as_with(&sql, arguments)
            .fetch_all(&mut *conn)
            .await?;
        drop(conn);

        if rows.is_empty() {
            return Err(ApiError::NoContent);
        }

        tracing::info!(rows = rows.len(), %partition, "latest-by fetch complete");

        let records = shaper::shape(rows, &parsed.structure, env);
        let payload = response::build_json_payload(
            records,
            0,
            page,
            n_metrics,
            &parsed.structure,
            &parsed.raw_filters,
            Some(&latest_by),
            &query_parser::decode_query(raw_query),
        );
        let body = encode_json(&payload)?;
        return Ok(finish(state, StatusCode::OK, body, &parsed, raw_query, release, method));
    }

    let count_sql = query_builder::count_query(&partition, &filters);
    let key = count_cache::cache_key(&count_sql, &partition, &db_metrics, &parsed.raw_filters);

    let count = match state.counts.get(key) {
        Some(count) => count,
        None => {
            tracing::debug!(%partition, "count: {count_sql}");
            let arguments = build_arguments(&db_metrics, &parsed.arguments)?;
            let count: i64 = sqlx::query_scalar_with(&count_sql, arguments)
                .fetch_one(&mut *conn)
                .await?;
            state.counts.put(key, count);
            count
        }
    };

    if count == 0 || page > response::total_pages(count, n_metrics) {
        return Err(ApiError::NoContent);
    }

    let sql = query_builder::data_query(&partition, &filters, limit, offset);
    tracing::debug!(%partition, "data: {sql}");

    let arguments = build_arguments(&db_metrics, &parsed.arguments)?;
    let rows: Vec<LongRow> = sqlx::query_as_with(&sql, arguments)
        .fetch_all(&mut *conn)
        .await?;
    drop(conn);

    if rows.is_empty() {
        return Err(ApiError::NoContent);
    }

    tracing::info!(rows = rows.len(), count, %partition, "data fetch complete");

    let records = shaper::shape(rows, &parsed.structure, env);

    let body = if parsed.format == ResponseFormat::Csv {
        shaper::to_csv(&records, &parsed.structure).into_bytes()
    } else {
        let payload = response::build_json_payload(
            records,
            count,
            page,
            n_metrics,
            &parsed.structure,
            &parsed.raw_filters,
            None,
            &query_parser::decode_query(raw_query),
        );
        encode_json(&payload)?
    };

    Ok(finish(state, StatusCode::OK, body, &parsed, raw_query, release, method))
}

fn finish(
    state: &AppState,
    status: StatusCode,
    body: Vec<u8>,
    parsed: &ParsedQuery,
    raw_query: &str,
    release: chrono::NaiveDateTime,
    method: &Method,
) -> Response {
    response::respond(
        status,
        body,
        parsed.format,
        raw_query,
        Some(release),
        method,
        &state.settings,
    )
}

fn encode_json(payload: &serde_json::Value) -> Result<Vec<u8>, ApiError> {
    serde_json::to_vec(payload).map_err(|err| {
        tracing::error!("payload serialisation failed: {err}");
        ApiError::Internal
    })
}

/// Bind `$1` (the metric-name array) followed by the coerced filter
/// arguments as `$2..$k`.
fn build_arguments(metrics: &[String], values: &[SqlValue]) -> Result<PgArguments, ApiError> {
    let mut arguments = PgArguments::default();
    arguments.add(metrics).map_err(bind_error)?;

    for value in values {
        match value {
            SqlValue::Text(text) => arguments.add(text).map_err(bind_error)?,
            SqlValue::Int(int) => arguments.add(int).map_err(bind_error)?,
            SqlValue::Float(float) => arguments.add(float).map_err(bind_error)?,
            SqlValue::Date(date) => arguments.add(date).map_err(bind_error)?,
        }
    }

    Ok(arguments)
}

fn bind_error(err: sqlx::error::BoxDynError) -> ApiError {
    tracing::error!("argument binding failed: {err}");
    ApiError::Internal
}
