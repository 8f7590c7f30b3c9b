use serde_json::{Map, Value};

use crate::catalog::MetricType;

/// One storage row: a single `(area, date, metric)` observation.
///
/// `value` is whatever the payload column carried, decoded as JSON; the
/// semantic type comes from the catalog, never from the JSON shape.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LongRow {
    #[sqlx(rename = "areaCode")]
    pub area_code: String,
    #[sqlx(rename = "areaType")]
    pub area_type: String,
    #[sqlx(rename = "areaName")]
    pub area_name: String,
    pub date: String,
    pub metric: String,
    pub value: Value,
}

/// A wide response record: one output column per requested metric.
pub type WideRecord = Map<String, Value>;

/// A metric cell after catalog-driven coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum MetricValue {
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<Value>),
    Object(Map<String, Value>),
    Null,
}

impl MetricValue {
    /// Coerce a raw payload value according to the metric's semantic type.
    ///
    /// Integers arrive either as JSON numbers or as textual `"12.0"`
    /// renderings; the trailing zero fraction is stripped before parsing.
    /// Composite columns fall back to the empty array when the payload is
    /// not parseable JSON. The literal token `null` maps to the null marker.
    pub fn from_raw(semantic: MetricType, raw: &Value) -> Self {
        if raw.is_null() || raw.as_str() == Some("null") {
            return Self::Null;
        }

        match semantic {
            MetricType::Int => match raw {
                Value::Number(n) => n
                    .as_i64()
                    .or_else(|| n.as_f64().map(|f| f as i64))
                    .map_or(Self::Null, Self::Int),
                Value::String(s) => {
                    let trimmed = strip_zero_fraction(strip_quotes(s));
                    trimmed.parse::<i64>().map_or(Self::Null, Self::Int)
                }
                _ => Self::Null,
            },
            MetricType::Float => match raw {
                Value::Number(n) => n.as_f64().map_or(Self::Null, Self::Float),
                Value::String(s) => strip_quotes(s).parse::<f64>().map_or(Self::Null, Self::Float),
                _ => Self::Null,
            },
            MetricType::Text | MetricType::Timestamp => match raw {
                Value::String(s) => Self::Text(strip_quotes(s).to_string()),
                other => Self::Text(other.to_string()),
            },
            MetricType::JsonArray | MetricType::JsonObject => match raw {
                Value::Array(items) => Self::Array(items.clone()),
                Value::Object(fields) => Self::Object(fields.clone()),
                Value::String(s) => match serde_json::from_str::<Value>(s) {
                    Ok(Value::Array(items)) => Self::Array(items),
                    Ok(Value::Object(fields)) => Self::Object(fields),
                    Ok(Value::Null) => Self::Null,
                    _ => Self::Array(Vec::new()),
                },
                _ => Self::Array(Vec::new()),
            },
        }
    }

    pub fn into_json(self) -> Value {
        match self {
            Self::Int(i) => Value::from(i),
            Self::Float(f) => Value::from(f),
            Self::Text(s) => Value::from(s),
            Self::Array(items) => Value::Array(items),
            Self::Object(fields) => Value::Object(fields),
            Self::Null => Value::Null,
        }
    }
}

/// Strip the surrounding double quotes a JSON-encoded scalar carries when it
/// has been rendered to text by the database.
fn strip_quotes(s: &str) -> &str {
    s.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .unwrap_or(s)
}

/// Drop a trailing `.0…0` fraction (`"12.0"` → `"12"`, `"12.5"` untouched).
fn strip_zero_fraction(s: &str) -> &str {
    match s.split_once('.') {
        Some((head, tail)) if !tail.is_empty() && tail.bytes().all(|b| b == b'0') => head,
        _ => s,
    }
}
