//! Response finishing.
//!
//! Builds the JSON envelope (with pagination links) or the CSV attachment,
//! compresses unconditionally with gzip, and stamps the service's header
//! set. Errors arrive here as well and leave as the standard error envelope
//! with their canonical status.

use std::io::Write;
use std::sync::LazyLock;

use axum::body::Body;
use axum::http::{HeaderValue, Method, StatusCode, header};
use axum::response::Response;
use chrono::NaiveDateTime;
use flate2::Compression;
use flate2::write::GzEncoder;
use regex::Regex;
use serde_json::{Value, json};

use crate::catalog::MAX_ITEMS_PER_RESPONSE;
use crate::config::Settings;
use crate::errors::ApiError;
use crate::models::record::WideRecord;
use crate::models::request::{RawFilter, ResponseFormat};
use crate::structure::Structure;

static PAGE_PARAM_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"&?page=\d+").unwrap());

const SERVER_NAME: &str = "PHE API Service (Unix)";

/// Total pages for a count, given the per-page window.
pub fn total_pages(count: i64, n_metrics: usize) -> u32 {
    let window = (MAX_ITEMS_PER_RESPONSE * n_metrics) as i64;
    let d = count / window;
    let r = count % window;
    let div_ceil = if (r > 0 && window > 0) || (r < 0 && window < 0) {
        d + 1
    } else {
        d
    };
    div_ceil.max(0) as u32
}

/// Self-reference for pagination links: the incoming query with any `page`
/// parameter stripped, re-rooted at the data endpoint.
pub fn pagination_url(decoded_query: &str) -> String {
    let stripped = PAGE_PARAM_RE.replace_all(decoded_query, "");
    let trimmed = stripped.trim_matches('&');
    format!("/v1/data?{trimmed}")
}

/// Assemble the JSON envelope.
///
/// In latest-by mode the pagination block is omitted, `totalRecords` is the
/// number of returned records, and `requestPayload` echoes `latestBy`
/// instead of `page`.
#[allow(clippy::too_many_arguments)]
pub fn build_json_payload(
    records: Vec<WideRecord>,
    count: i64,
    page: u32,
    n_metrics: usize,
    structure: &Structure,
    raw_filters: &[RawFilter],
    latest_by: Option<&str>,
    decoded_query: &str,
) -> Value {
    let length = records.len();
    let data: Vec<Value> = records.into_iter().map(Value::Object).collect();

    let mut request_payload = serde_json::Map::new();
    request_payload.insert("structure".to_string(), structure.echo());
    request_payload.insert("filters".to_string(), json!(raw_filters));
    match latest_by {
        Some(metric) => {
            request_payload.insert("latestBy".to_string(), json!(metric));
        }
        None => {
            request_payload.insert("page".to_string(), json!(page));
        }
    }

    let mut payload = serde_json::Map::new();
    payload.insert("length".to_string(), json!(length));
    payload.insert("maxPageLimit".to_string(), json!(MAX_ITEMS_PER_RESPONSE));
    payload.insert(
        "totalRecords".to_string(),
        if latest_by.is_some() { json!(length as i64) } else { json!(count) },
    );
    payload.insert("data".to_string(), Value::Array(data));
    payload.insert("requestPayload".to_string(), Value::Object(request_payload));

    if latest_by.is_none() {
        let pages = total_pages(count, n_metrics);
        let url = pagination_url(decoded_query);
        let link = |p: u32| format!("{url}&page={p}");

        payload.insert(
            "pagination".to_string(),
            json!({
                "current": link(page),
                "next": if page < pages { json!(link(page + 1)) } else { Value::Null },
                "previous": if page > 1 { json!(link(page - 1)) } else { Value::Null },
                "first": link(1),
                "last": link(pages),
            }),
        );
    }

    Value::Object(payload)
}

/// The error envelope served for every taxonomy error.
pub fn error_payload(err: &ApiError) -> Value {
    json!({
        "response": err.to_string(),
        "status_code": err.status().as_u16(),
        "status": err.phrase(),
    })
}

fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    if encoder.write_all(data).is_err() {
        return data.to_vec();
    }
    encoder.finish().unwrap_or_else(|_| data.to_vec())
}

/// CSV attachment filename, day-precision of the release timestamp.
pub fn csv_filename(release: NaiveDateTime) -> String {
    format!("data_{}.csv", release.format("%Y-%b-%d"))
}

/// Finish a request: stamp headers, compress, and honour HEAD semantics.
pub fn respond(
    status: StatusCode,
    body: Vec<u8>,
    format: ResponseFormat,
    raw_query: &str,
    release: Option<NaiveDateTime>,
    method: &Method,
    settings: &Settings,
) -> Response {
    let mut builder = Response::builder()
        .header(header::CONTENT_TYPE, format.media_type())
        .header(header::CONTENT_ENCODING, "gzip")
        .header(header::SERVER, SERVER_NAME)
        .header(
            header::STRICT_TRANSPORT_SECURITY,
            "max-age=31536000; includeSubdomains; preload",
        )
        .header("x-frame-options", "deny")
        .header("x-content-type-options", "nosniff")
        .header("x-xss-protection", "1; mode=block")
        .header(
            "referrer-policy",
            "origin-when-cross-origin, strict-origin-when-cross-origin",
        )
        .header(
            "content-security-policy",
            "default-src 'none'; style-src 'self' 'unsafe-inline'",
        )
        .header("x-phe-media-type", "PHE-COVID19.v1")
        .header(
            "PHE-Server-Loc",
            HeaderValue::from_str(&settings.server_location)
                .unwrap_or_else(|_| HeaderValue::from_static("N/A")),
        );

    let success = status.as_u16() < 400;

    if success {
        builder = builder.header(header::CACHE_CONTROL, "public, max-age=90");

        if let Ok(location) = HeaderValue::from_str(&format!("/v1/data?{raw_query}")) {
            builder = builder.header(header::CONTENT_LOCATION, location);
        }

        if let Some(release) = release {
            builder = builder.header(
                header::LAST_MODIFIED,
                release.format("%a, %d %b %Y %H:%M:%S GMT").to_string(),
            );
        }

        if format == ResponseFormat::Csv && !body.is_empty() {
            if let Some(release) = release {
                builder = builder.header(
                    header::CONTENT_DISPOSITION,
                    format!("attachment; filename=\"{}\"", csv_filename(release)),
                );
            }
        }
    }

    if *method == Method::HEAD {
        let head_status = if success { StatusCode::NO_CONTENT } else { status };
        return builder
            .status(head_status)
            .body(Body::empty())
            .unwrap_or_else(|_| fallback_response());
    }

    if status == StatusCode::NO_CONTENT {
        return builder
            .status(status)
            .body(Body::empty())
            .unwrap_or_else(|_| fallback_response());
    }

    builder
        .status(status)
        .body(Body::from(gzip(&body)))
        .unwrap_or_else(|_| fallback_response())
}

/// Finish an error: the envelope is served with the error's canonical
/// status; 204 carries no body at all.
pub fn error_response(
    err: &ApiError,
    format: ResponseFormat,
    raw_query: &str,
    release: Option<NaiveDateTime>,
    method: &Method,
    settings: &Settings,
) -> Response {
    let body = serde_json::to_vec(&error_payload(err)).unwrap_or_default();
    respond(err.status(), body, format, raw_query, release, method, settings)
}

fn fallback_response() -> Response {
    let mut response = Response::new(Body::empty());
    *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Environment;
    use chrono::NaiveDate;
    use flate2::read::GzDecoder;
    use std::io::Read;
    use std::time::Duration;

    const ENV: Environment = Environment::Production;

    fn settings() -> Settings {
        Settings {
            environment: ENV,
            connection_string: "postgres://localhost/covid19".to_string(),
            server_location: "UKS".to_string(),
            port: 8080,
            pool_max_connections: 10,
            pool_acquire_timeout: Duration::from_secs(30),
        }
    }

    fn release() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 5, 4)
            .unwrap()
            .and_hms_opt(16, 48, 9)
            .unwrap()
    }

    fn raw_filters() -> Vec<RawFilter> {
        vec![RawFilter {
            identifier: "areaType".to_string(),
            operator: "=".to_string(),
            value: "nation".to_string(),
        }]
    }

    fn record(date: &str) -> WideRecord {
        let mut record = WideRecord::new();
        record.insert("dt".to_string(), json!(date));
        record
    }

    use serde_json::json;

    #[test]
    fn test_total_pages() {
        assert_eq!(total_pages(7500, 1), 3);
        assert_eq!(total_pages(7501, 1), 4);
        assert_eq!(total_pages(2500, 1), 1);
        assert_eq!(total_pages(0, 1), 0);
        assert_eq!(total_pages(7500, 2), 2);
    }

    #[test]
    fn test_pagination_url_strips_page() {
        assert_eq!(
            pagination_url("filters=areaType=nation&page=3&format=json"),
            "/v1/data?filters=areaType=nation&format=json"
        );
        assert_eq!(
            pagination_url("filters=areaType=nation"),
            "/v1/data?filters=areaType=nation"
        );
    }

    #[test]
    fn test_payload_pagination_links() {
        let structure = Structure::parse(r#"{"dt":"date"}"#, ENV).unwrap();
        let payload = build_json_payload(
            vec![record("2023-05-04")],
            7500,
            2,
            1,
            &structure,
            &raw_filters(),
            None,
            "filters=areaType=nation&page=2",
        );

        assert_eq!(payload["length"], json!(1));
        assert_eq!(payload["maxPageLimit"], json!(2500));
        assert_eq!(payload["totalRecords"], json!(7500));
        assert_eq!(payload["requestPayload"]["page"], json!(2));

        let pagination = &payload["pagination"];
        assert_eq!(
            pagination["current"],
            json!("/v1/data?filters=areaType=nation&page=2")
        );
        assert_eq!(
            pagination["next"],
            json!("/v1/data?filters=areaType=nation&page=3")
        );
        assert_eq!(
            pagination["previous"],
            json!("/v1/data?filters=areaType=nation&page=1")
        );
        assert_eq!(pagination["first"], json!("/v1/data?filters=areaType=nation&page=1"));
        assert_eq!(pagination["last"], json!("/v1/data?filters=areaType=nation&page=3"));
    }

    #[test]
    fn test_payload_link_edges() {
        let structure = Structure::parse(r#"{"dt":"date"}"#, ENV).unwrap();

        let first = build_json_payload(
            vec![record("2023-05-04")],
            5000,
            1,
            1,
            &structure,
            &raw_filters(),
            None,
            "filters=areaType=nation",
        );
        assert_eq!(first["pagination"]["previous"], Value::Null);
        assert!(first["pagination"]["next"].is_string());

        let last = build_json_payload(
            vec![record("2023-05-04")],
            5000,
            2,
            1,
            &structure,
            &raw_filters(),
            None,
            "filters=areaType=nation",
        );
        assert_eq!(last["pagination"]["next"], Value::Null);
        assert!(last["pagination"]["previous"].is_string());
    }

    #[test]
    fn test_payload_latest_by_mode() {
        let structure = Structure::parse(r#"{"dt":"date"}"#, ENV).unwrap();
        let payload = build_json_payload(
            vec![record("2023-05-04"), record("2023-05-04")],
            0,
            1,
            1,
            &structure,
            &raw_filters(),
            Some("hospitalCases"),
            "filters=areaType=nation&latestBy=hospitalCases",
        );

        assert_eq!(payload["totalRecords"], json!(2));
        assert_eq!(payload["requestPayload"]["latestBy"], json!("hospitalCases"));
        assert!(payload.get("pagination").is_none());
        assert!(payload["requestPayload"].get("page").is_none());
    }

    #[test]
    fn test_gzip_round_trip() {
        let compressed = gzip(b"some response body");
        let mut decoder = GzDecoder::new(compressed.as_slice());
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed).unwrap();
        assert_eq!(decompressed, b"some response body");
    }

    #[test]
    fn test_csv_filename() {
        assert_eq!(csv_filename(release()), "data_2023-May-04.csv");
    }

    #[test]
    fn test_respond_headers() {
        let response = respond(
            StatusCode::OK,
            b"{}".to_vec(),
            ResponseFormat::Json,
            "filters=areaType=nation",
            Some(release()),
            &Method::GET,
            &settings(),
        );

        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers();
        assert_eq!(headers["content-encoding"], "gzip");
        assert_eq!(headers["server"], SERVER_NAME);
        assert_eq!(headers["x-frame-options"], "deny");
        assert_eq!(headers["x-phe-media-type"], "PHE-COVID19.v1");
        assert_eq!(headers["PHE-Server-Loc"], "UKS");
        assert_eq!(headers["cache-control"], "public, max-age=90");
        assert_eq!(headers["content-location"], "/v1/data?filters=areaType=nation");
        assert_eq!(headers["last-modified"], "Thu, 04 May 2023 16:48:09 GMT");
    }

    #[test]
    fn test_head_collapses_success_to_204() {
        let response = respond(
            StatusCode::OK,
            b"{}".to_vec(),
            ResponseFormat::Json,
            "filters=areaType=nation",
            Some(release()),
            &Method::HEAD,
            &settings(),
        );
        assert_eq!(response.status(), StatusCode::NO_CONTENT);

        let error = respond(
            StatusCode::BAD_REQUEST,
            b"{}".to_vec(),
            ResponseFormat::Json,
            "",
            None,
            &Method::HEAD,
            &settings(),
        );
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);
    }

    #[test]
    fn test_csv_disposition() {
        let response = respond(
            StatusCode::OK,
            b"dt,vv\n2023-05-04,1\n".to_vec(),
            ResponseFormat::Csv,
            "filters=areaType=nation&format=csv",
            Some(release()),
            &Method::GET,
            &settings(),
        );
        assert_eq!(
            response.headers()["content-disposition"],
            "attachment; filename=\"data_2023-May-04.csv\""
        );
        assert_eq!(response.headers()["content-type"], "text/csv; charset=utf-8");
    }

    #[test]
    fn test_error_response_shape() {
        let err = ApiError::MissingFilter;
        let payload = error_payload(&err);
        assert_eq!(payload["status_code"], json!(400));
        assert_eq!(payload["status"], json!("Bad request"));
        assert!(payload["response"].as_str().unwrap().contains("areaType"));

        let response = error_response(
            &err,
            ResponseFormat::Json,
            "filters=areaName=England",
            None,
            &Method::GET,
            &settings(),
        );
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        // Error responses still carry the universal headers.
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert!(!response.headers().contains_key("cache-control"));
    }

    #[test]
    fn test_no_content_has_no_body() {
        let response = error_response(
            &ApiError::NoContent,
            ResponseFormat::Json,
            "filters=areaType=nation",
            Some(release()),
            &Method::GET,
            &settings(),
        );
        assert_eq!(response.status(), StatusCode::NO_CONTENT);
        // Success headers still apply at 204.
        assert_eq!(response.headers()["cache-control"], "public, max-age=90");
    }
}
