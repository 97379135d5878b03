use std::str::FromStr;

use serde::Deserialize;
use strum::EnumString;
use thiserror::Error;

use crate::types::Method;

/// Error outputs from `bankid-core`
#[derive(Debug, Error)]
pub enum BankIdError {
    /// The presented input is not valid for the requested operation
    #[error("invalid_input_{attribute}: {reason}")]
    InvalidInput {
        /// The attribute that is invalid
        attribute: String,
        /// The reason the input is invalid
        reason: String,
    },
    /// The client certificate, private key or CA bundle could not be loaded
    #[error("certificate_error: {reason}")]
    Certificate {
        /// What went wrong while loading the TLS material
        reason: String,
    },
    /// Network connection error with details
    #[error("network_error: {url} - {error}")]
    NetworkError {
        /// The URL of the request
        url: String,
        /// The HTTP status code of the response, if one was received
        status: Option<u16>,
        /// The error message
        error: String,
    },
    /// A previous order for the same personal number has not been cancelled.
    ///
    /// The remote service cancels both orders when this happens, so the caller
    /// may simply start a new one.
    #[error("already_in_progress: {details}")]
    AlreadyInProgress {
        /// Details returned by the remote service
        details: String,
    },
    /// The remote service rejected the request with an error code
    #[error("api_error_{status}: {code} {details}")]
    Api {
        /// The HTTP status code of the response
        status: u16,
        /// The `errorCode` returned by the remote service
        code: ErrorCode,
        /// The `details` returned by the remote service
        details: String,
    },
    /// Unexpected error serializing or deserializing information
    #[error("serialization_error: {error}")]
    SerializationError {
        /// The error message
        error: String,
    },
    /// An `auth` or `sign` call succeeded but did not return an order
    #[error("request_failed: {method} request did not return an order")]
    RequestFailed {
        /// The method that was called
        method: Method,
    },
    /// Collect kept failing at the transport level until the retry budget ran out
    #[error("polling_failed for order {order_ref}: {error}")]
    PollingFailed {
        /// The order being polled
        order_ref: String,
        /// The last transport error
        error: Box<BankIdError>,
    },
    /// The order did not reach a terminal state within the configured polling timeout
    #[error("timeout polling order {order_ref}")]
    Timeout {
        /// The order being polled
        order_ref: String,
    },
    /// The flow was aborted by the caller before reaching a terminal state
    #[error("cancelled polling order {order_ref}")]
    Cancelled {
        /// The order being polled
        order_ref: String,
    },
    /// The task running a spawned flow panicked or was shut down with its runtime
    #[error("join_error: {error}")]
    Join {
        /// The error reported by the runtime
        error: String,
    },
}

impl BankIdError {
    /// Whether the failure is transient and the same request may succeed if repeated.
    ///
    /// Covers connection failures and timeouts, HTTP `429`/`5xx` and the remote
    /// `internalError`, `maintenance` and `requestTimeout` codes.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::NetworkError { status: None, .. } => true,
            Self::NetworkError {
                status: Some(status),
                ..
            }
            | Self::Api { status, .. }
                if *status == 429 || (500..600).contains(status) =>
            {
                true
            }
            Self::Api { code, .. } => matches!(
                code,
                ErrorCode::InternalError
                    | ErrorCode::Maintenance
                    | ErrorCode::RequestTimeout
            ),
            _ => false,
        }
    }

    /// Builds the error for a non-2xx response from `body`.
    pub(crate) fn from_response(url: String, status: u16, body: &str) -> Self {
        let Ok(api_error) = serde_json::from_str::<ApiErrorBody>(body) else {
            return Self::NetworkError {
                url,
                status: Some(status),
                error: format!("request failed with status {status}: {body}"),
            };
        };

        let code = ErrorCode::from_str(&api_error.error_code)
            .unwrap_or_else(|_| ErrorCode::Other(api_error.error_code.clone()));
        let details = api_error.details.unwrap_or_default();

        if code == ErrorCode::AlreadyInProgress {
            return Self::AlreadyInProgress { details };
        }

        Self::Api {
            status,
            code,
            details,
        }
    }
}

/// Error body returned by the remote service for non-2xx responses.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ApiErrorBody {
    error_code: String,
    details: Option<String>,
}

/// The `errorCode` values documented for the BankID RP API.
#[derive(Debug, Clone, PartialEq, Eq, EnumString)]
#[strum(serialize_all = "camelCase")]
pub enum ErrorCode {
    /// An order for this personal number is already in progress.
    AlreadyInProgress,
    /// Invalid parameter, e.g. an unknown `orderRef`.
    InvalidParameters,
    /// The RP does not have access to the service.
    Unauthorized,
    /// An erroneous URL path was used.
    NotFound,
    /// Only `POST` is allowed.
    MethodNotAllowed,
    /// The request could not be handled in time.
    RequestTimeout,
    /// The `Content-Type` header was not `application/json`.
    UnsupportedMediaType,
    /// Internal technical error in the BankID system.
    InternalError,
    /// The service is temporarily unavailable.
    Maintenance,
    /// Any code not known to this crate.
    #[strum(default)]
    Other(String),
}

impl ErrorCode {
    /// The wire representation of the code.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::AlreadyInProgress => "alreadyInProgress",
            Self::InvalidParameters => "invalidParameters",
            Self::Unauthorized => "unauthorized",
            Self::NotFound => "notFound",
            Self::MethodNotAllowed => "methodNotAllowed",
            Self::RequestTimeout => "requestTimeout",
            Self::UnsupportedMediaType => "unsupportedMediaType",
            Self::InternalError => "internalError",
            Self::Maintenance => "maintenance",
            Self::Other(code) => code,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
