use std::error::Error as StdError;
use std::io;
use std::path::PathBuf;

use http::StatusCode;
use thiserror::Error;

/// Every failure the body parser can surface.
///
/// Protocol level failures (ceilings, malformed multipart syntax) reject the whole
/// request body. Per-file validation failures never show up here, they are recorded
/// on the [`MultipartFile`](crate::multipart::MultipartFile) instead. The only
/// exception is [`BodyParserError::StreamValidation`], which is handed to a part
/// consumer mid-stream so it can stop writing.
#[derive(Debug, Error)]
pub enum BodyParserError {
    #[error("request entity too large: {reason}")]
    EntityTooLarge { reason: String },

    #[error("fields limit exceeded: {reason}")]
    FieldsLimitExceeded { reason: String },

    #[error("one or more validations failed")]
    StreamValidation,

    #[error("multipart stream has already been consumed")]
    AlreadyConsumed,

    #[error("property tmp_path must be set on the file before moving it")]
    MissingTmpPath,

    #[error("\"{name}\" already exists at \"{}\", set overwrite = true to overwrite it", .location.display())]
    DestinationExists { name: String, location: PathBuf },

    #[error("invalid multipart body: {reason}")]
    InvalidMultipart { reason: String },

    #[error("invalid body: {reason}")]
    InvalidBody { reason: String },

    #[error("invalid byte size: {value:?}")]
    InvalidSize { value: String },

    #[error("{reason}")]
    ValidatorLocked { reason: String },

    #[error("part consumer failed: {source}")]
    Consumer { source: Box<dyn StdError + Send + Sync> },

    #[error("io error: {source}")]
    Io {
        #[from]
        source: io::Error,
    },
}

impl BodyParserError {
    pub fn entity_too_large<S: ToString>(str: S) -> Self {
        Self::EntityTooLarge { reason: str.to_string() }
    }

    pub fn fields_limit_exceeded<S: ToString>(str: S) -> Self {
        Self::FieldsLimitExceeded { reason: str.to_string() }
    }

    pub fn invalid_multipart<S: ToString>(str: S) -> Self {
        Self::InvalidMultipart { reason: str.to_string() }
    }

    pub fn invalid_body<S: ToString>(str: S) -> Self {
        Self::InvalidBody { reason: str.to_string() }
    }

    pub fn invalid_size<S: ToString>(str: S) -> Self {
        Self::InvalidSize { value: str.to_string() }
    }

    pub fn validator_locked<S: ToString>(str: S) -> Self {
        Self::ValidatorLocked { reason: str.to_string() }
    }

    pub fn destination_exists<S: ToString, P: Into<PathBuf>>(name: S, location: P) -> Self {
        Self::DestinationExists { name: name.to_string(), location: location.into() }
    }

    pub fn consumer<E: Into<Box<dyn StdError + Send + Sync>>>(e: E) -> Self {
        Self::Consumer { source: e.into() }
    }

    /// Stable machine readable code, mirrors the codes exposed over the wire.
    pub fn code(&self) -> &'static str {
        match self {
            Self::EntityTooLarge { .. } => "E_REQUEST_ENTITY_TOO_LARGE",
            Self::FieldsLimitExceeded { .. } => "E_REQUEST_FIELDS_LIMIT_EXCEEDED",
            Self::StreamValidation => "E_STREAM_VALIDATION_FAILURE",
            Self::AlreadyConsumed => "E_RUNTIME_EXCEPTION",
            Self::MissingTmpPath => "E_MISSING_FILE_TMP_PATH",
            Self::DestinationExists { .. } => "E_CANNOT_MOVE_FILE",
            Self::InvalidMultipart { .. } => "E_INVALID_MULTIPART",
            Self::InvalidBody { .. } => "E_INVALID_BODY",
            Self::InvalidSize { .. } => "E_INVALID_SIZE",
            Self::ValidatorLocked { .. } => "E_VALIDATOR_LOCKED",
            Self::Consumer { .. } => "E_CONSUMER",
            Self::Io { .. } => "E_IO",
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::EntityTooLarge { .. } | Self::FieldsLimitExceeded { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            Self::StreamValidation
            | Self::InvalidMultipart { .. }
            | Self::InvalidBody { .. }
            | Self::Io { .. } => StatusCode::BAD_REQUEST,
            Self::AlreadyConsumed
            | Self::MissingTmpPath
            | Self::DestinationExists { .. }
            | Self::InvalidSize { .. }
            | Self::ValidatorLocked { .. }
            | Self::Consumer { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    #[inline]
    pub fn is_stream_validation(&self) -> bool {
        matches!(self, Self::StreamValidation)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_and_status() {
        let error = BodyParserError::entity_too_large("limit 1MB exceeded");
        assert_eq!(error.code(), "E_REQUEST_ENTITY_TOO_LARGE");
        assert_eq!(error.status(), StatusCode::PAYLOAD_TOO_LARGE);
        assert_eq!(error.to_string(), "request entity too large: limit 1MB exceeded");

        let error = BodyParserError::StreamValidation;
        assert!(error.is_stream_validation());
        assert_eq!(error.status(), StatusCode::BAD_REQUEST);

        assert_eq!(BodyParserError::AlreadyConsumed.code(), "E_RUNTIME_EXCEPTION");
    }

    #[test]
    fn test_destination_exists_message() {
        let error = BodyParserError::destination_exists("a.txt", "/uploads");
        assert_eq!(error.to_string(), "\"a.txt\" already exists at \"/uploads\", set overwrite = true to overwrite it");
    }
}
