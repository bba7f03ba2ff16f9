//! Error types for lumeo.
//!
//! Every failure is one variant of [`Error`]. Validation failures are
//! client-caused and carry the limit that was violated; model and inference
//! failures are server-caused and must be reported through [`PublicError`]
//! so internal details stay in the logs.

use serde::Serialize;
use thiserror::Error;

/// Main error type for the lumeo library.
#[derive(Error, Debug)]
pub enum Error {
    /// Upload exceeded the configured size limit.
    #[error("file too large: received at least {received} bytes, maximum is {limit} bytes")]
    PayloadTooLarge { received: usize, limit: usize },

    /// Sniffed (or declared, on the analysis path) type is not allowed.
    #[error("unsupported media type {detected}; allowed types: image/jpeg, image/png")]
    UnsupportedMediaType { detected: String },

    /// Bytes passed the type sniff but could not be decoded.
    #[error("invalid image: {reason}")]
    InvalidImage {
        reason: String,
        #[source]
        source: Option<image::ImageError>,
    },

    /// Decoded width or height exceeds the configured maximum.
    #[error("image dimensions {width}x{height} exceed the maximum of {max}x{max} pixels")]
    DimensionTooLarge { width: u32, height: u32, max: u32 },

    /// Weights could not be loaded, or the model was released.
    #[error("model unavailable: {reason}")]
    ModelUnavailable { reason: String },

    /// Forward pass failed.
    #[error("inference failed: {reason}")]
    InferenceFailure { reason: String },

    /// Reading the upload stream failed.
    #[error("failed to read upload: {source}")]
    UploadRead {
        #[source]
        source: std::io::Error,
    },

    /// Encoding the output raster failed.
    #[error("failed to encode {format} image: {source}")]
    ImageEncode {
        format: &'static str,
        #[source]
        source: image::ImageError,
    },

    /// Shape mismatch in tensor operations.
    #[error("tensor shape mismatch: expected {expected}, got {actual}")]
    ShapeMismatch { expected: String, actual: String },

    /// Invalid parameter value.
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: String, reason: String },

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for lumeo operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Who caused a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// The request was bad; the caller can fix it.
    Client,
    /// Something went wrong on our side.
    Server,
}

impl Error {
    /// Classify the error as client- or server-caused.
    #[must_use]
    pub const fn class(&self) -> ErrorClass {
        match self {
            Self::PayloadTooLarge { .. }
            | Self::UnsupportedMediaType { .. }
            | Self::InvalidImage { .. }
            | Self::DimensionTooLarge { .. }
            | Self::UploadRead { .. } => ErrorClass::Client,
            Self::ModelUnavailable { .. }
            | Self::InferenceFailure { .. }
            | Self::ImageEncode { .. }
            | Self::ShapeMismatch { .. }
            | Self::InvalidParameter { .. }
            | Self::Io(_) => ErrorClass::Server,
        }
    }

    /// Stable machine-readable code for this error.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::PayloadTooLarge { .. } => "PAYLOAD_TOO_LARGE",
            Self::UnsupportedMediaType { .. } => "UNSUPPORTED_MEDIA_TYPE",
            Self::InvalidImage { .. } => "INVALID_IMAGE",
            Self::DimensionTooLarge { .. } => "DIMENSION_TOO_LARGE",
            Self::UploadRead { .. } => "UPLOAD_READ_FAILED",
            Self::ModelUnavailable { .. } => "MODEL_UNAVAILABLE",
            Self::InferenceFailure { .. }
            | Self::ImageEncode { .. }
            | Self::ShapeMismatch { .. } => "INFERENCE_FAILURE",
            Self::InvalidParameter { .. } | Self::Io(_) => "INTERNAL_ERROR",
        }
    }
}

/// Caller-safe view of an [`Error`].
///
/// Client errors keep their reason. Server errors are replaced by a generic
/// message and a correlation id; the full error is logged under that id.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
}

impl PublicError {
    /// Build the caller-facing error, logging server failures.
    #[must_use]
    pub fn from_error(err: &Error) -> Self {
        match err.class() {
            ErrorClass::Client => Self {
                code: err.code(),
                message: err.to_string(),
                correlation_id: None,
            },
            ErrorClass::Server => {
                let correlation_id = uuid::Uuid::new_v4().to_string();
                tracing::error!(correlation_id = %correlation_id, error = %err, "request failed");
                let message = match err {
                    Error::ModelUnavailable { .. } => "enhancement model is unavailable",
                    _ => "image enhancement failed",
                };
                Self {
                    code: err.code(),
                    message: message.to_string(),
                    correlation_id: Some(correlation_id),
                }
            }
        }
    }
}
