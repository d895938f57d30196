//! # Error Classification
//!
//! Maps raw dependency failures into stable categories and service-scoped
//! error codes used for logging, metrics, and retry decisions.
//!
//! Classification is a pure, deterministic function of the error's declared
//! status, code, and message substrings. It never performs I/O and never
//! fails: anything that matches no category falls through to
//! [`ErrorCategory::ApiError`], and unknown service/category combinations
//! resolve to `"UNKNOWN"` rather than erroring.

use serde::{Deserialize, Serialize};

use crate::error::{codes, ServiceError};

/// Primary failure categories for classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Transport-level failure reaching the dependency
    ConnectionFailure,
    /// The dependency accepted the call but did not answer in time
    QueryTimeout,
    /// Credentials rejected or missing permissions
    AuthenticationError,
    /// The addressed entity does not exist
    ResourceNotFound,
    /// Any other dependency-reported failure
    ApiError,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::ConnectionFailure => "connection_failure",
            ErrorCategory::QueryTimeout => "query_timeout",
            ErrorCategory::AuthenticationError => "authentication_error",
            ErrorCategory::ResourceNotFound => "resource_not_found",
            ErrorCategory::ApiError => "api_error",
        };
        write!(f, "{name}")
    }
}

/// Classify a raw dependency failure into a stable category.
///
/// Rules are checked in a fixed order (authentication, not-found, timeout,
/// connection) so a message like "connection timeout" classifies the same
/// way on every call.
pub fn classify(error: &ServiceError) -> ErrorCategory {
    let message = error.message.to_ascii_lowercase();
    let code = error
        .code
        .as_deref()
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    let mentions = |needle: &str| message.contains(needle) || code.contains(needle);

    if matches!(error.status, Some(401) | Some(403))
        || mentions("unauthorized")
        || mentions("forbidden")
        || mentions("auth")
    {
        return ErrorCategory::AuthenticationError;
    }

    if error.status == Some(404) || mentions("not found") || mentions("no such") {
        return ErrorCategory::ResourceNotFound;
    }

    if matches!(error.status, Some(408) | Some(504))
        || mentions("timed out")
        || mentions("timeout")
    {
        return ErrorCategory::QueryTimeout;
    }

    if matches!(error.status, Some(502) | Some(503))
        || mentions("connection")
        || mentions("refused")
        || mentions("reset")
        || mentions("unreachable")
        || mentions("dns")
    {
        return ErrorCategory::ConnectionFailure;
    }

    ErrorCategory::ApiError
}

/// Resolve the stable error code for a service/category pair.
///
/// The table is static; combinations it does not know resolve to `UNKNOWN`.
pub fn error_code(service: &str, category: ErrorCategory) -> &'static str {
    use ErrorCategory::*;

    match (service, category) {
        ("database", ConnectionFailure) => "DB_CONNECTION_FAILURE",
        ("database", QueryTimeout) => "DB_QUERY_TIMEOUT",
        ("database", AuthenticationError) => "DB_AUTH_ERROR",
        ("database", ResourceNotFound) => "DB_NOT_FOUND",
        ("database", ApiError) => "DB_ERROR",

        ("search", ConnectionFailure) => "SEARCH_CONNECTION_FAILURE",
        ("search", QueryTimeout) => "SEARCH_QUERY_TIMEOUT",
        ("search", AuthenticationError) => "SEARCH_AUTH_ERROR",
        ("search", ResourceNotFound) => "SEARCH_NOT_FOUND",
        ("search", ApiError) => "SEARCH_API_ERROR",

        ("llm", ConnectionFailure) => "LLM_CONNECTION_FAILURE",
        ("llm", QueryTimeout) => "LLM_QUERY_TIMEOUT",
        ("llm", AuthenticationError) => "LLM_AUTH_ERROR",
        ("llm", ResourceNotFound) => "LLM_NOT_FOUND",
        ("llm", ApiError) => "LLM_API_ERROR",

        ("storage", ConnectionFailure) => "STORAGE_CONNECTION_FAILURE",
        ("storage", QueryTimeout) => "STORAGE_QUERY_TIMEOUT",
        ("storage", AuthenticationError) => "STORAGE_AUTH_ERROR",
        ("storage", ResourceNotFound) => "STORAGE_NOT_FOUND",
        ("storage", ApiError) => "STORAGE_API_ERROR",

        _ => codes::UNKNOWN,
    }
}

/// Build the structured failure recorded when a dependency call is surfaced.
pub fn to_task_failure(error: &ServiceError) -> crate::error::TaskFailure {
    let category = classify(error);
    let code = error_code(&error.service, category);
    crate::error::TaskFailure::new(code, error.message.clone()).with_service(error.service.clone())
}
