use chrono::NaiveDate;
use serde::Serialize;

/// Filter comparison operator, as written in the `filters` parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Ne,
    Lt,
    Gt,
    Le,
    Ge,
}

impl FilterOp {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "=" => Some(Self::Eq),
            "!=" => Some(Self::Ne),
            "<" => Some(Self::Lt),
            ">" => Some(Self::Gt),
            "<=" => Some(Self::Le),
            ">=" => Some(Self::Ge),
            _ => None,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Self::Eq => "=",
            Self::Ne => "!=",
            Self::Lt => "<",
            Self::Gt => ">",
            Self::Le => "<=",
            Self::Ge => ">=",
        }
    }
}

/// Predicate connector: `;` is AND, `|` is OR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Connector {
    And,
    Or,
}

impl Connector {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            ";" => Some(Self::And),
            "|" => Some(Self::Or),
            _ => None,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            Self::And => " AND ",
            Self::Or => " OR ",
        }
    }
}

/// Verbatim echo of a caller-supplied filter triple, included in the
/// response payload untouched by coercion or canonicalisation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RawFilter {
    pub identifier: String,
    pub operator: String,
    pub value: String,
}

/// A coerced filter argument, ready to be bound to a SQL placeholder.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Text(String),
    Int(i32),
    Float(f64),
    Date(NaiveDate),
}

impl SqlValue {
    /// Stable textual form, used for count-cache keying and logging.
    pub fn canonical(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Int(i) => i.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Date(d) => d.to_string(),
        }
    }
}

/// Output media type requested via `format=`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    #[default]
    Json,
    Csv,
    Xml,
}

impl ResponseFormat {
    pub fn parse(token: &str) -> Option<Self> {
        match token {
            "json" => Some(Self::Json),
            "csv" => Some(Self::Csv),
            "xml" => Some(Self::Xml),
            _ => None,
        }
    }

    /// The XML flavour serves the JSON envelope under the vendor media type,
    /// matching the service's historical behaviour.
    pub fn media_type(self) -> &'static str {
        match self {
            Self::Json | Self::Xml => "application/vnd.PHE-COVID19.v1+json; charset=utf-8",
            Self::Csv => "text/csv; charset=utf-8",
        }
    }

    pub fn accepts_latest_by(self) -> bool {
        matches!(self, Self::Json | Self::Xml)
    }
}
