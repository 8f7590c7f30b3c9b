//! URL query parsing.
//!
//! Turns the raw query string into a validated, SQL-ready request: the
//! compiled filter clause with numbered placeholders, the coerced argument
//! list, the response structure, and the ancillary parameters. Each of
//! `structure`, `format`, `latestBy` and `page` is stripped from the query
//! in turn before the residual is handed to the filter tokeniser.

use std::borrow::Cow;
use std::sync::LazyLock;

use regex::Regex;

use crate::catalog::{self, DATE_PARAM_NAME, MAX_DATE_QUERIES, MAX_QUERY_PARAMS, REPORT_DATE_PARAM_NAME};
use crate::config::Environment;
use crate::errors::ApiError;
use crate::models::request::{Connector, FilterOp, RawFilter, ResponseFormat, SqlValue};
use crate::structure::Structure;

static STRUCTURE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(&?structure=([^&]+))&?").unwrap());

static FORMAT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(&?format=(json|csv|xml))&?").unwrap());

static LATEST_BY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(&?latestBy=([a-z2356780]{2,75}))&?").unwrap());

static PAGE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(&?page=(\d+))&?").unwrap());

static FILTERS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"filters=([^&]+)(&|$)").unwrap());

static TOKEN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?i)(?P<name>[a-z]{2,75})(?P<operator><=|>=|!=|=|<|>)(?P<value>[a-z0-9,'.\-()\s]{1,75})(?P<connector>[;|]?)",
    )
    .unwrap()
});

/// A fully parsed and validated request.
#[derive(Debug, Clone)]
pub struct ParsedQuery {
    /// `AND <predicate> [AND|OR <predicate>]*`, placeholders from `$2`.
    pub filters_sql: String,
    /// Positional arguments for `$2..$k`, post-coercion.
    pub arguments: Vec<SqlValue>,
    /// The caller's filter triples, verbatim, for the response payload.
    pub raw_filters: Vec<RawFilter>,
    pub structure: Structure,
    pub format: ResponseFormat,
    pub latest_by: Option<String>,
    pub page: Option<u32>,
    /// Canonical value of the mandatory areaType predicate.
    pub area_type: String,
}

/// Percent-decode a query string, treating `+` as space (form encoding).
pub fn decode_query(query: &str) -> String {
    let plus_decoded = query.replace('+', " ");
    match urlencoding::decode(&plus_decoded) {
        Ok(Cow::Borrowed(_)) => plus_decoded,
        Ok(Cow::Owned(decoded)) => decoded,
        Err(_) => plus_decoded,
    }
}

/// Best-effort format extraction, used to pick the error envelope's media
/// type when parsing fails before the format is reached.
pub fn peek_format(query: &str) -> ResponseFormat {
    FORMAT_RE
        .captures(query)
        .and_then(|caps| ResponseFormat::parse(&caps[2]))
        .unwrap_or_default()
}

pub fn parse(query: &str, env: Environment) -> Result<ParsedQuery, ApiError> {
    let mut residual = decode_query(query);

    let structure = extract_structure(&mut residual, env)?;
    let format = extract_format(&mut residual);
    let latest_by = extract_latest_by(&mut residual, env)?;
    let page = extract_page(&mut residual)?;

    let (filters_sql, arguments, raw_filters, area_type) = extract_filters(&residual, env)?;

    if latest_by.is_some() && page.is_some() {
        return Err(ApiError::BadPagination);
    }

    if latest_by.is_some() && !format.accepts_latest_by() {
        return Err(ApiError::InvalidFormat);
    }

    let Some(area_type) = area_type else {
        return Err(ApiError::MissingFilter);
    };

    Ok(ParsedQuery {
        filters_sql,
        arguments,
        raw_filters,
        structure,
        format,
        latest_by,
        page,
        area_type,
    })
}

/// Remove `pattern`'s first match from `query`, returning its value group.
fn strip_param(query: &mut String, pattern: &Regex) -> Option<String> {
    let caps = pattern.captures(query)?;
    let whole = caps.get(1).map(|m| m.as_str().to_string())?;
    let value = caps.get(2).map(|m| m.as_str().to_string())?;
    *query = query.replacen(&whole, "", 1);
    Some(value)
}

fn extract_structure(query: &mut String, env: Environment) -> Result<Structure, ApiError> {
    match strip_param(query, &STRUCTURE_RE) {
        Some(raw) => Structure::parse(&decode_query(&raw), env),
        None => Ok(Structure::default_structure()),
    }
}

fn extract_format(query: &mut String) -> ResponseFormat {
    strip_param(query, &FORMAT_RE)
        .and_then(|token| ResponseFormat::parse(&token))
        .unwrap_or_default()
}

fn extract_latest_by(query: &mut String, env: Environment) -> Result<Option<String>, ApiError> {
    let Some(param) = strip_param(query, &LATEST_BY_RE) else {
        return Ok(None);
    };

    let is_date_param = param == DATE_PARAM_NAME || param == REPORT_DATE_PARAM_NAME;
    if !is_date_param && !catalog::data_types(env).contains_key(param.as_str()) {
        return Err(ApiError::InvalidQueryParameter {
            name: "latestBy".to_string(),
            operator: "=".to_string(),
            value: param.clone(),
            closest_match: catalog::closest_match(&param, catalog::data_types(env).keys().copied()),
        });
    }

    Ok(Some(param))
}

fn extract_page(query: &mut String) -> Result<Option<u32>, ApiError> {
    let Some(param) = strip_param(query, &PAGE_RE) else {
        return Ok(None);
    };

    match param.parse::<u32>() {
        Ok(page) if (1..=999).contains(&page) => Ok(Some(page)),
        _ => Err(ApiError::InvalidQuery),
    }
}

type CompiledFilters = (String, Vec<SqlValue>, Vec<RawFilter>, Option<String>);

fn extract_filters(query: &str, env: Environment) -> Result<CompiledFilters, ApiError> {
    let filters_value = FILTERS_RE
        .captures(query)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or_default();

    let mut predicates: Vec<(String, Option<Connector>)> = Vec::new();
    let mut arguments = Vec::new();
    let mut raw_filters = Vec::new();
    let mut param_names = Vec::new();
    let mut area_type = None;
    let mut date_queries = 0_usize;

    let restricted = catalog::restricted_values();

    for (index, caps) in TOKEN_RE.captures_iter(filters_value).enumerate() {
        let placeholder = index + 2;
        let name = &caps["name"];
        let op_token = &caps["operator"];
        let value = &caps["value"];

        param_names.push(name.to_string());

        if !catalog::is_permitted(restricted, name, value) {
            return Err(ApiError::UnauthorisedRequest {
                name: name.to_string(),
                operator: op_token.to_string(),
                value: value.to_string(),
            });
        }

        raw_filters.push(RawFilter {
            identifier: name.to_string(),
            operator: op_token.to_string(),
            value: value.to_string(),
        });

        let op = FilterOp::parse(op_token).ok_or(ApiError::InvalidQuery)?;

        if name == DATE_PARAM_NAME && op == FilterOp::Eq {
            date_queries += 1;
            if date_queries > MAX_DATE_QUERIES {
                return Err(ApiError::RequestTooLarge {
                    allowed_max: MAX_DATE_QUERIES,
                    param_name: "date",
                });
            }
        }

        let coerced = catalog::coerce(env, name, op_token, value)?;
        let argument =
            catalog::transform_argument(name, coerced).ok_or(ApiError::IncorrectQueryValueType {
                expression: format!("{name} {op_token} {value}"),
                expectation: "recognised",
                actual: value.to_string(),
            })?;

        if name == "areaType" {
            if let SqlValue::Text(canonical) = &argument {
                area_type = Some(canonical.clone());
            }
        }

        let column = catalog::column_spelling(name);
        predicates.push((
            format!("{column} {} ${placeholder}", op.as_sql()),
            Connector::parse(&caps["connector"]),
        ));

        arguments.push(argument);
    }

    if arguments.len() > MAX_QUERY_PARAMS {
        return Err(ApiError::ExceedsMaxParameters {
            max_params: MAX_QUERY_PARAMS,
            current_total: arguments.len(),
            parameters: format!("{param_names:?}"),
        });
    } else if arguments.is_empty() {
        return Err(ApiError::InvalidQuery);
    }

    let mut clause = String::from("AND ");
    let last = predicates.len() - 1;
    for (i, (predicate, connector)) in predicates.iter().enumerate() {
        clause.push_str(predicate);
        if i < last {
            clause.push_str(connector.unwrap_or(Connector::And).as_sql());
        }
    }

    Ok((clause, arguments, raw_filters, area_type))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENV: Environment = Environment::Production;

    #[test]
    fn test_parse_basic_query() {
        let query = concat!(
            "filters=areaType=nation;areaName=England",
            "&structure={\"date\":\"date\",\"value\":\"hospitalCases\"}",
            "&format=csv"
        );
        let parsed = parse(query, ENV).unwrap();

        assert_eq!(parsed.filters_sql, "AND area_type = $2 AND LOWER(area_name) = $3");
        assert_eq!(
            parsed.arguments,
            vec![SqlValue::Text("nation".into()), SqlValue::Text("england".into())]
        );
        assert_eq!(
            parsed.raw_filters,
            vec![
                RawFilter {
                    identifier: "areaType".into(),
                    operator: "=".into(),
                    value: "nation".into(),
                },
                RawFilter {
                    identifier: "areaName".into(),
                    operator: "=".into(),
                    value: "England".into(),
                },
            ]
        );
        assert_eq!(parsed.format, ResponseFormat::Csv);
        assert_eq!(parsed.area_type, "nation");
        assert_eq!(parsed.page, None);
        assert_eq!(parsed.latest_by, None);
        assert_eq!(parsed.structure.labels(), vec!["date", "value"]);
    }

    #[test]
    fn test_or_connector_and_comparison_ops() {
        let query = "filters=areaType=nation;date>2023-01-01|date<2022-01-01";
        let parsed = parse(query, ENV).unwrap();
        assert_eq!(
            parsed.filters_sql,
            "AND area_type = $2 AND date > $3 OR date < $4"
        );
        assert_eq!(parsed.arguments.len(), 3);
    }

    #[test]
    fn test_url_encoded_structure() {
        let query = "filters=areaType%3Dnation&structure=%7B%22dt%22%3A%22date%22%7D";
        let parsed = parse(query, ENV).unwrap();
        assert_eq!(parsed.structure.labels(), vec!["dt"]);
    }

    #[test]
    fn test_values_may_contain_spaces() {
        let query = "filters=areaType=nation;areaName=united+kingdom";
        let parsed = parse(query, ENV).unwrap();
        assert_eq!(parsed.arguments[1], SqlValue::Text("united kingdom".into()));
        assert_eq!(parsed.raw_filters[1].value, "united kingdom");
    }

    #[test]
    fn test_missing_area_type() {
        let err = parse("filters=areaName=England", ENV).unwrap_err();
        assert!(matches!(err, ApiError::MissingFilter));
    }

    #[test]
    fn test_empty_filters() {
        assert!(matches!(parse("", ENV).unwrap_err(), ApiError::InvalidQuery));
        assert!(matches!(
            parse("format=json", ENV).unwrap_err(),
            ApiError::InvalidQuery
        ));
    }

    #[test]
    fn test_parameter_count_boundary() {
        let five = "filters=areaType=nation;areaName=England;areaCode=E92000001;date>2023-01-01;hospitalCases>100";
        assert!(parse(five, ENV).is_ok());

        let six = format!("{five};newAdmissions>5");
        let err = parse(&six, ENV).unwrap_err();
        assert!(matches!(err, ApiError::ExceedsMaxParameters { current_total: 6, .. }));
    }

    #[test]
    fn test_multiple_date_equalities_rejected() {
        let query = "filters=areaType=nation;date=2023-01-01;date=2023-01-02";
        let err = parse(query, ENV).unwrap_err();
        assert!(matches!(err, ApiError::RequestTooLarge { allowed_max: 1, .. }));
    }

    #[test]
    fn test_latest_by_with_page_is_bad_pagination() {
        let query = "filters=areaType=nation&page=2&latestBy=newAdmissions";
        let err = parse(query, ENV).unwrap_err();
        assert!(matches!(err, ApiError::BadPagination));
    }

    #[test]
    fn test_pagination_guard_precedes_missing_filter() {
        // Both violated: pagination misuse wins over the missing areaType.
        let query = "filters=areaName=England&page=2&latestBy=newAdmissions";
        let err = parse(query, ENV).unwrap_err();
        assert!(matches!(err, ApiError::BadPagination));

        let query = "filters=areaName=England&latestBy=newAdmissions&format=csv";
        let err = parse(query, ENV).unwrap_err();
        assert!(matches!(err, ApiError::InvalidFormat));
    }

    #[test]
    fn test_latest_by_with_csv_is_invalid_format() {
        let query = "filters=areaType=nation&latestBy=newAdmissions&format=csv";
        let err = parse(query, ENV).unwrap_err();
        assert!(matches!(err, ApiError::InvalidFormat));

        let query = "filters=areaType=nation&latestBy=newAdmissions&format=xml";
        assert!(parse(query, ENV).is_ok());
    }

    #[test]
    fn test_latest_by_unknown_metric() {
        let query = "filters=areaType=nation&latestBy=wibbleWobble";
        let err = parse(query, ENV).unwrap_err();
        match err {
            ApiError::InvalidQueryParameter { name, value, .. } => {
                assert_eq!(name, "latestBy");
                assert_eq!(value, "wibbleWobble");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_latest_by_date_identifiers_accepted() {
        for param in ["date", "releaseTimestamp"] {
            let query = format!("filters=areaType=nation&latestBy={param}");
            let parsed = parse(&query, ENV).unwrap();
            assert_eq!(parsed.latest_by.as_deref(), Some(param));
        }
    }

    #[test]
    fn test_page_bounds() {
        let parsed = parse("filters=areaType=nation&page=7", ENV).unwrap();
        assert_eq!(parsed.page, Some(7));

        for bad in ["page=0", "page=1000"] {
            let query = format!("filters=areaType=nation&{bad}");
            let err = parse(&query, ENV).unwrap_err();
            assert!(matches!(err, ApiError::InvalidQuery), "{bad}");
        }
    }

    #[test]
    fn test_unknown_filter_suggests_closest() {
        let query = "filters=areaType=nation;unknownField=1";
        let err = parse(query, ENV).unwrap_err();
        match err {
            ApiError::InvalidQueryParameter { name, closest_match, .. } => {
                assert_eq!(name, "unknownField");
                assert!(!closest_match.is_empty());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_default_structure_when_absent() {
        let parsed = parse("filters=areaType=nation", ENV).unwrap();
        assert!(parsed.structure.labels().contains(&"newCasesByPublishDate"));
    }

    #[test]
    fn test_peek_format() {
        assert_eq!(peek_format("filters=areaType=nation&format=csv"), ResponseFormat::Csv);
        assert_eq!(peek_format("filters=areaType=nation"), ResponseFormat::Json);
    }
}
