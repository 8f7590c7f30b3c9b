//! SQL planning.
//!
//! Builds one of four statements against the partitioned long-format table:
//! existence probe (HEAD), row count, paginated data, and latest-by-metric.
//! The partition id is embedded by substitution (Postgres cannot
//! parameterise identifiers) while every predicate value is bound through a
//! numbered placeholder. `$1` is always the metric-name array; the compiled
//! filters occupy `$2..$k`.

use chrono::NaiveDateTime;

use crate::catalog::MAX_ITEMS_PER_RESPONSE;
use crate::config::Environment;

/// Partition classes with their own physical tables; every other area type
/// collapses into `other`.
const SINGLE_PARTITION_TYPES: [&str; 4] = ["utla", "ltla", "nhstrust", "msoa"];

/// Ordering applied to default data queries.
pub const DEFAULT_ORDERING: &[(&str, bool)] = &[
    ("releaseTimestamp", false),
    ("areaType", true),
    ("areaNameLower", true),
    ("date", false),
];

/// Ordering applied in latest-by mode.
pub const DEFAULT_LATEST_ORDERING: &[(&str, bool)] = &[
    ("releaseTimestamp", false),
    ("date", false),
    ("areaType", true),
    ("areaNameLower", true),
];

/// Partition id for a release timestamp and canonical area type:
/// `YYYY_M_D_<class>`, month and day unpadded.
pub fn partition_id(timestamp: NaiveDateTime, area_type: &str) -> String {
    use chrono::Datelike;

    let lowered = area_type.to_lowercase();
    let class = if SINGLE_PARTITION_TYPES.contains(&lowered.as_str()) {
        lowered.as_str()
    } else {
        "other"
    };

    let date = timestamp.date();
    format!("{}_{}_{}_{class}", date.year(), date.month(), date.day())
}

/// Page window: `LIMIT` covers a full page of wide records across all
/// requested metrics; `OFFSET` skips the preceding pages.
pub fn page_window(n_metrics: usize, page: u32) -> (usize, usize) {
    let limit = MAX_ITEMS_PER_RESPONSE * n_metrics;
    let offset = limit * (page.saturating_sub(1)) as usize;
    (limit, offset)
}

/// Outside development, hide metrics whose release flag is not yet set.
pub fn released_filters(filters: &str, env: Environment) -> String {
    if env.is_development() {
        filters.to_string()
    } else {
        format!("{filters} AND mr.released IS TRUE")
    }
}

/// Render an ordering list as a SQL `ORDER BY` clause.
pub fn format_ordering(ordering: &[(&str, bool)]) -> String {
    let rendered: Vec<String> = ordering
        .iter()
        .map(|(by, ascending)| {
            let column = match *by {
                "releaseTimestamp" => "rr.timestamp",
                "areaType" => "ref.area_type",
                "areaNameLower" => "LOWER(area_name)",
                "areaName" => "area_name",
                "areaCode" => "area_code",
                other => other,
            };
            let direction = if *ascending { "ASC" } else { "DESC" };
            format!("{column} {direction}")
        })
        .collect();

    format!("ORDER BY {}", rendered.join(", "))
}

const SELECT_LONG_ROWS: &str = r#"SELECT
    area_code             AS "areaCode",
    ref.area_type         AS "areaType",
    area_name             AS "areaName",
    date::VARCHAR         AS date,
    metric,
    CASE
        WHEN (payload ? 'value') THEN (payload -> 'value')
        ELSE payload::JSONB
    END AS value"#;

fn from_clause(partition: &str) -> String {
    format!(
        r#"FROM covid19.time_series_p{partition} AS ts
    JOIN covid19.metric_reference  AS mr  ON mr.id = metric_id
    JOIN covid19.release_reference AS rr  ON rr.id = release_id
    JOIN covid19.area_reference    AS ref ON ref.id = area_id"#
    )
}

/// Paginated data projection.
pub fn data_query(partition: &str, filters: &str, limit: usize, offset: usize) -> String {
    format!(
        "{SELECT_LONG_ROWS}\n{}\nWHERE\n      metric = ANY($1::VARCHAR[])\n  AND rr.released IS TRUE\n  {filters}\nORDER BY area_id, date DESC\nLIMIT {limit} OFFSET {offset}",
        from_clause(partition)
    )
}

/// Data restricted to the most recent date for which `latest_by` has a
/// value. `latest_by` is pattern-validated upstream and embedded as a
/// literal; it is a metric name, not caller-controlled SQL.
pub fn latest_query(partition: &str, filters: &str, latest_by: &str) -> String {
    format!(
        "{SELECT_LONG_ROWS}\n{from_clause}\nWHERE\n      metric = ANY($1::VARCHAR[])\n  AND rr.released IS TRUE\n  {filters}\n  AND date = (\n      SELECT MAX(date)\n      {from_clause}\n      WHERE\n            rr.released IS TRUE\n        AND metric = '{latest_by}'\n        {filters}\n  )\n{ordering}",
        from_clause = from_clause(partition),
        ordering = format_ordering(DEFAULT_LATEST_ORDERING),
    )
}

/// Existence probe used for HEAD requests.
pub fn exists_query(partition: &str, filters: &str, offset: usize) -> String {
    format!(
        "SELECT TRUE AS exists\n{}\nWHERE\n      metric = ANY($1::VARCHAR[])\n  AND rr.released IS TRUE\n  {filters}\nOFFSET {offset}\nFETCH FIRST 1 ROW ONLY",
        from_clause(partition)
    )
}

/// Row count for pagination. The expensive statement; memoised by the
/// count cache.
pub fn count_query(partition: &str, filters: &str) -> String {
    format!(
        "SELECT COUNT(*) AS count\n{}\nWHERE\n      metric = ANY($1::VARCHAR[])\n  AND rr.released IS TRUE\n  {filters}",
        from_clause(partition)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn release() -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2023, 5, 4)
            .unwrap()
            .and_hms_opt(16, 48, 9)
            .unwrap()
    }

    #[test]
    fn test_partition_id_unpadded() {
        assert_eq!(partition_id(release(), "nation"), "2023_5_4_other");
        assert_eq!(partition_id(release(), "utla"), "2023_5_4_utla");
        assert_eq!(partition_id(release(), "nhsTrust"), "2023_5_4_nhstrust");
        assert_eq!(partition_id(release(), "nhsRegion"), "2023_5_4_other");
    }

    #[test]
    fn test_partition_id_deterministic() {
        assert_eq!(partition_id(release(), "ltla"), partition_id(release(), "ltla"));
    }

    #[test]
    fn test_page_window() {
        assert_eq!(page_window(2, 1), (5000, 0));
        assert_eq!(page_window(2, 3), (5000, 10000));
        assert_eq!(page_window(1, 1), (2500, 0));
    }

    #[test]
    fn test_released_gating_by_environment() {
        let filters = "AND area_type = $2";
        assert_eq!(released_filters(filters, Environment::Development), filters);
        assert_eq!(
            released_filters(filters, Environment::Production),
            "AND area_type = $2 AND mr.released IS TRUE"
        );
    }

    #[test]
    fn test_ordering_rendering() {
        assert_eq!(
            format_ordering(DEFAULT_ORDERING),
            "ORDER BY rr.timestamp DESC, ref.area_type ASC, LOWER(area_name) ASC, date DESC"
        );
        assert_eq!(
            format_ordering(DEFAULT_LATEST_ORDERING),
            "ORDER BY rr.timestamp DESC, date DESC, ref.area_type ASC, LOWER(area_name) ASC"
        );
    }

    #[test]
    fn test_data_query_shape() {
        let sql = data_query("2023_5_4_other", "AND area_type = $2", 5000, 5000);
        assert!(sql.contains("FROM covid19.time_series_p2023_5_4_other AS ts"));
        assert!(sql.contains("metric = ANY($1::VARCHAR[])"));
        assert!(sql.contains("AND area_type = $2"));
        assert!(sql.contains("ORDER BY area_id, date DESC"));
        assert!(sql.ends_with("LIMIT 5000 OFFSET 5000"));
    }

    #[test]
    fn test_latest_query_correlates_max_date() {
        let sql = latest_query("2023_5_4_other", "AND area_type = $2", "hospitalCases");
        assert!(sql.contains("AND date = ("));
        assert!(sql.contains("SELECT MAX(date)"));
        assert!(sql.contains("AND metric = 'hospitalCases'"));
        // Filters appear both in the outer query and the subquery.
        assert_eq!(sql.matches("AND area_type = $2").count(), 2);
        assert!(sql.contains("ORDER BY rr.timestamp DESC, date DESC"));
    }

    #[test]
    fn test_exists_query_shape() {
        let sql = exists_query("2023_5_4_utla", "AND area_type = $2", 2500);
        assert!(sql.starts_with("SELECT TRUE AS exists"));
        assert!(sql.ends_with("OFFSET 2500\nFETCH FIRST 1 ROW ONLY"));
    }

    #[test]
    fn test_count_query_shape() {
        let sql = count_query("2023_5_4_other", "AND area_type = $2");
        assert!(sql.starts_with("SELECT COUNT(*) AS count"));
        assert!(!sql.contains("LIMIT"));
    }
}
