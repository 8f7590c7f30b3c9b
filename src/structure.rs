//! Response structure validation.
//!
//! The client declares the output projection either as an ordered mapping
//! `outputLabel -> metric` or as an ordered sequence of metric names. The
//! validated structure drives both the SQL metric selection and the response
//! column ordering, so insertion order is preserved throughout.

use std::sync::LazyLock;

use indexmap::IndexMap;
use regex::Regex;
use serde::Serialize;
use serde_json::Value;

use crate::catalog::{self, IDENTITY_COLUMNS, MAX_STRUCTURE_LENGTH};
use crate::config::Environment;
use crate::errors::ApiError;

static LABEL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new("^[A-Za-z0-9]{2,75}$").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum Structure {
    Mapping(IndexMap<String, String>),
    Sequence(Vec<String>),
}

impl Structure {
    /// Parse and validate a URL-decoded structure document.
    pub fn parse(raw: &str, env: Environment) -> Result<Self, ApiError> {
        let document: Value = serde_json::from_str(raw).map_err(|_| ApiError::InvalidStructure)?;

        match document {
            Value::Array(items) => {
                let mut metrics = Vec::with_capacity(items.len());
                for item in items {
                    let Value::String(metric) = item else {
                        return Err(ApiError::InvalidStructure);
                    };
                    metrics.push(metric);
                }
                let structure = Self::Sequence(metrics);
                structure.validate(env, "list")?;
                Ok(structure)
            }
            Value::Object(fields) => {
                let mut mapping = IndexMap::with_capacity(fields.len());
                for (label, value) in fields {
                    // Nested objects and arrays are not part of this pipeline.
                    let Value::String(metric) = value else {
                        return Err(ApiError::InvalidStructure);
                    };
                    mapping.insert(label, metric);
                }
                let structure = Self::Mapping(mapping);
                structure.validate(env, "dictionary")?;
                Ok(structure)
            }
            _ => Err(ApiError::InvalidStructure),
        }
    }

    /// The fixed structure served when the caller does not supply one:
    /// the identity columns plus the headline case and death metrics.
    pub fn default_structure() -> Self {
        let mapping: IndexMap<String, String> = [
            "areaType",
            "areaCode",
            "areaName",
            "date",
            "newCasesByPublishDate",
            "cumCasesByPublishDate",
            "newDeaths28DaysByPublishDate",
            "cumDeaths28DaysByPublishDate",
        ]
        .into_iter()
        .map(|name| (name.to_string(), name.to_string()))
        .collect();

        Self::Mapping(mapping)
    }

    fn validate(&self, env: Environment, format_name: &'static str) -> Result<(), ApiError> {
        if self.len() > MAX_STRUCTURE_LENGTH {
            return Err(ApiError::StructureTooLarge {
                max_allowed: MAX_STRUCTURE_LENGTH,
                current_count: self.len(),
            });
        }

        let types = catalog::data_types(env);
        for metric in self.metrics() {
            if !types.contains_key(metric) {
                return Err(ApiError::InvalidStructureParameter {
                    name: metric.to_string(),
                    structure_format: format_name,
                    closest_match: catalog::closest_match(metric, types.keys().copied()),
                });
            }
        }

        for label in self.labels() {
            if !LABEL_RE.is_match(label) {
                return Err(ApiError::InvalidStructure);
            }
        }

        Ok(())
    }

    pub fn len(&self) -> usize {
        match self {
            Self::Mapping(mapping) => mapping.len(),
            Self::Sequence(metrics) => metrics.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Referenced metrics, in declared order.
    pub fn metrics(&self) -> Vec<&str> {
        match self {
            Self::Mapping(mapping) => mapping.values().map(String::as_str).collect(),
            Self::Sequence(metrics) => metrics.iter().map(String::as_str).collect(),
        }
    }

    /// Output labels, in declared order. Sequences label columns by metric.
    pub fn labels(&self) -> Vec<&str> {
        match self {
            Self::Mapping(mapping) => mapping.keys().map(String::as_str).collect(),
            Self::Sequence(metrics) => metrics.iter().map(String::as_str).collect(),
        }
    }

    /// Metrics to bind as the query's metric-name array: the declared
    /// metrics minus the identity columns, deduplicated, order preserved.
    pub fn db_metrics(&self) -> Vec<String> {
        let mut seen = Vec::new();
        for metric in self.metrics() {
            if !IDENTITY_COLUMNS.contains(&metric) && !seen.iter().any(|s| s == metric) {
                seen.push(metric.to_string());
            }
        }
        seen
    }

    /// Metric count for the paging window. An identity-only structure still
    /// pages one metric's worth of rows.
    pub fn n_metrics(&self) -> usize {
        self.db_metrics().len().max(1)
    }

    /// The structure as echoed back in `requestPayload`.
    pub fn echo(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}
