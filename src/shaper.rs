//! Long→wide assembly.
//!
//! Raw statement output is one row per `(area, date, metric)`. The shaper
//! pivots those into one record per `(area, date)`, coerces each cell
//! according to the catalog, and lays columns out in the order the structure
//! declares. Missing metrics materialise as null rather than being dropped.

use indexmap::IndexMap;
use serde_json::Value;

use crate::catalog::{self, IDENTITY_COLUMNS};
use crate::config::Environment;
use crate::models::record::{LongRow, MetricValue, WideRecord};
use crate::structure::Structure;

type PivotKey = (String, String, String, String);

/// Output columns as `(label, metric)` pairs in declared order. In sequence
/// form the four identity columns are implicit and lead the declared
/// metrics.
pub fn output_columns(structure: &Structure) -> Vec<(String, String)> {
    match structure {
        Structure::Mapping(mapping) => mapping
            .iter()
            .map(|(label, metric)| (label.clone(), metric.clone()))
            .collect(),
        Structure::Sequence(metrics) => {
            let mut columns: Vec<(String, String)> = IDENTITY_COLUMNS
                .iter()
                .map(|column| (column.to_string(), column.to_string()))
                .collect();
            for metric in metrics {
                if !IDENTITY_COLUMNS.contains(&metric.as_str()) {
                    columns.push((metric.clone(), metric.clone()));
                }
            }
            columns
        }
    }
}

/// Pivot long rows into wide records ordered by `(areaCode ASC, date DESC)`.
pub fn shape(rows: Vec<LongRow>, structure: &Structure, env: Environment) -> Vec<WideRecord> {
    let mut pivot: IndexMap<PivotKey, IndexMap<String, Value>> = IndexMap::new();

    for row in rows {
        let key = (row.area_code, row.area_type, row.area_name, row.date);
        let cells = pivot.entry(key).or_default();
        // Duplicate observations should not occur; first one wins.
        cells.entry(row.metric).or_insert(row.value);
    }

    let mut entries: Vec<(PivotKey, IndexMap<String, Value>)> = pivot.into_iter().collect();
    entries.sort_by(|(a, _), (b, _)| a.0.cmp(&b.0).then_with(|| b.3.cmp(&a.3)));

    let columns = output_columns(structure);

    entries
        .into_iter()
        .map(|(key, cells)| {
            let mut record = WideRecord::new();
            for (label, metric) in &columns {
                let value = match metric.as_str() {
                    "areaCode" => Value::from(key.0.clone()),
                    "areaType" => Value::from(key.1.clone()),
                    "areaName" => Value::from(key.2.clone()),
                    "date" => Value::from(key.3.clone()),
                    _ => match (catalog::type_of(env, metric), cells.get(metric)) {
                        (Some(semantic), Some(raw)) => {
                            MetricValue::from_raw(semantic, raw).into_json()
                        }
                        _ => Value::Null,
                    },
                };
                record.insert(label.clone(), value);
            }
            record
        })
        .collect()
}

/// Render records as CSV: declared labels as the header, empty fields for
/// nulls, composite values JSON-encoded.
pub fn to_csv(records: &[WideRecord], structure: &Structure) -> String {
    let columns = output_columns(structure);
    let mut out = String::new();

    let header: Vec<&str> = columns.iter().map(|(label, _)| label.as_str()).collect();
    out.push_str(&header.join(","));
    out.push('\n');

    for record in records {
        let cells: Vec<String> = columns
            .iter()
            .map(|(label, _)| render_csv_cell(record.get(label).unwrap_or(&Value::Null)))
            .collect();
        out.push_str(&cells.join(","));
        out.push('\n');
    }

    out
}

fn render_csv_cell(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => escape_csv(s),
        Value::Number(n) => {
            if let Some(int) = n.as_i64() {
                int.to_string()
            } else if let Some(int) = n.as_u64() {
                int.to_string()
            } else if let Some(float) = n.as_f64() {
                format_g20(float)
            } else {
                n.to_string()
            }
        }
        Value::Bool(b) => b.to_string(),
        composite => escape_csv(&serde_json::to_string(composite).unwrap_or_default()),
    }
}

/// Float formatting for CSV cells, equivalent to C's `printf("%.20g")`:
/// 20 significant digits, trailing zeros trimmed, exponential notation when
/// the decimal exponent falls outside `[-4, 20)`.
fn format_g20(value: f64) -> String {
    const SIGNIFICANT: i32 = 20;

    if value == 0.0 {
        return "0".to_string();
    }

    let digits = (SIGNIFICANT - 1) as usize;
    let scientific = format!("{value:.digits$e}");
    let Some((mantissa, exponent)) = scientific.split_once('e') else {
        // inf/nan; cannot arrive through a JSON payload.
        return scientific;
    };
    let exponent: i32 = match exponent.parse() {
        Ok(exponent) => exponent,
        Err(_) => return scientific,
    };

    if exponent < -4 || exponent >= SIGNIFICANT {
        let mantissa = trim_trailing_zeros(mantissa);
        let sign = if exponent < 0 { '-' } else { '+' };
        format!("{mantissa}e{sign}{:02}", exponent.abs())
    } else {
        let decimals = (SIGNIFICANT - 1 - exponent).max(0) as usize;
        trim_trailing_zeros(&format!("{value:.decimals$}"))
    }
}

fn trim_trailing_zeros(rendered: &str) -> String {
    if rendered.contains('.') {
        rendered.trim_end_matches('0').trim_end_matches('.').to_string()
    } else {
        rendered.to_string()
    }
}

fn escape_csv(field: &str) -> String {
    if field.contains(',') || field.contains('"') || field.contains('\n') || field.contains('\r') {
        format!("\"{}\"", field.replace('"', "\"\""))
    } else {
        field.to_string()
    }
}
