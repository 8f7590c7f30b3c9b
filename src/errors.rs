use axum::http::StatusCode;
use thiserror::Error;

/// Closed error taxonomy for the data API.
///
/// Every variant carries a canonical HTTP status and a user-facing message.
/// Anything outside this taxonomy is coerced to [`ApiError::Internal`], whose
/// body is generic: driver and I/O errors may contain connection strings or
/// table names and are logged, never surfaced.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(
        "Query parameter '{name}' ({name} {operator} {value}) is invalid. \
         Did you mean '{closest_match}'?"
    )]
    InvalidQueryParameter {
        name: String,
        operator: String,
        value: String,
        closest_match: String,
    },

    #[error(
        "Invalid parameter '{name}' in the requested {structure_format} structure. \
         Did you mean '{closest_match}'?"
    )]
    InvalidStructureParameter {
        name: String,
        structure_format: &'static str,
        closest_match: String,
    },

    #[error(
        "The value in query expression '{expression}' is invalid. Expected \
         a {expectation} value, got '{actual}' instead. See the API \
         documentations for additional information."
    )]
    IncorrectQueryValueType {
        expression: String,
        expectation: &'static str,
        actual: String,
    },

    #[error(
        "The value in query expression '{expression}' does not match the expected \
         pattern. The value for this '{key}' must match the regular expression \
         pattern '{pattern}'. See the API documentations for additional information."
    )]
    ValueNotAcceptable {
        expression: String,
        key: String,
        pattern: &'static str,
    },

    #[error(
        "Invalid structure. The structure must be a flat (non-nested) JSON object. \
         Make sure you use double quotation marks in the structure."
    )]
    InvalidStructure,

    #[error(
        "Invalid Query: the query is either empty or does not conform to the correct \
         pattern. See the API documentations for additional information."
    )]
    InvalidQuery,

    #[error(
        "Number of query parameters exceed the maximum of {max_params} allowed. \
         Current query includes {current_total} parameters: {parameters}"
    )]
    ExceedsMaxParameters {
        max_params: usize,
        current_total: usize,
        parameters: String,
    },

    #[error(
        "You may only include {allowed_max} {param_name} per request. \
         Please see the API documentations for additional information."
    )]
    RequestTooLarge {
        allowed_max: usize,
        param_name: &'static str,
    },

    #[error(
        "You may only request a maximum number of {max_allowed} metrics per \
         request. Current number of metrics in your structure: {current_count} \
         - please reduce the number of metrics and try again."
    )]
    StructureTooLarge {
        max_allowed: usize,
        current_count: usize,
    },

    #[error("The request was fulfilled. There is currently no data available.")]
    NoContent,

    #[error(
        "Request for unauthorised access to value '{value}' \
         ({name} {operator} {value}) is denied."
    )]
    UnauthorisedRequest {
        name: String,
        operator: String,
        value: String,
    },

    #[error(
        "Invalid format: 'latestBy' parameter can only be used \
         when 'format=json' or 'format=xml'."
    )]
    InvalidFormat,

    #[error(
        "Bad pagination: 'latestBy' parameter cannot be used in conjunction with \
         the 'page' parameter."
    )]
    BadPagination,

    #[error("Missing filter: The 'areaType' filter is mandatory, but not defined.")]
    MissingFilter,

    #[error(
        "An internal error occurred whilst processing your request, please \
         try again. If the problem persists, please report as an issue and \
         include your request."
    )]
    Internal,
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidQueryParameter { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            Self::InvalidStructureParameter { .. } => StatusCode::NOT_FOUND,
            Self::IncorrectQueryValueType { .. } => StatusCode::NOT_ACCEPTABLE,
            Self::ValueNotAcceptable { .. } | Self::InvalidStructure => {
                StatusCode::EXPECTATION_FAILED
            }
            Self::InvalidQuery => StatusCode::PRECONDITION_FAILED,
            Self::ExceedsMaxParameters { .. }
            | Self::RequestTooLarge { .. }
            | Self::StructureTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NoContent => StatusCode::NO_CONTENT,
            Self::UnauthorisedRequest { .. } => StatusCode::UNAUTHORIZED,
            Self::InvalidFormat | Self::BadPagination | Self::MissingFilter => {
                StatusCode::BAD_REQUEST
            }
            Self::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Reason phrase for the error envelope. 400s share the generic phrase.
    pub fn phrase(&self) -> &'static str {
        let status = self.status();
        if status == StatusCode::BAD_REQUEST {
            "Bad request"
        } else {
            status.canonical_reason().unwrap_or("Unknown")
        }
    }
}

impl From<sqlx::Error> for ApiError {
    fn from(err: sqlx::Error) -> Self {
        tracing::error!("database error: {err}");
        Self::Internal
    }
}
