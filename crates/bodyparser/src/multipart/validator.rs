//! Size and extension validators attached to one uploaded file.
//!
//! Both validators behave differently while a file is still streaming and once
//! it has been consumed:
//!
//! - while streaming, a validator only reaches a verdict when it can be certain
//!   (the size already exceeds the limit, or the extension has been detected)
//!   and otherwise stays open so later chunks are checked again
//! - once consumed, a validator always reaches a verdict
//!
//! A constraint may be set freely until a validation pass has completed with it,
//! after which it is locked.

use crate::error::BodyParserError;
use crate::multipart::file::FileState;
use crate::size::ByteSize;

#[derive(Debug, Default, Clone)]
pub struct SizeValidator {
    validated: bool,
    limit: Option<ByteSize>,
}

impl SizeValidator {
    pub fn new(limit: Option<ByteSize>) -> Self {
        Self { validated: false, limit }
    }

    #[inline]
    pub fn limit(&self) -> Option<ByteSize> {
        self.limit
    }

    #[inline]
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn set_limit(&mut self, limit: ByteSize) -> Result<(), BodyParserError> {
        if self.limit.is_some() && self.validated {
            return Err(BodyParserError::validator_locked("cannot reset size limit after file has been validated"));
        }
        self.limit = Some(limit);
        self.validated = false;
        Ok(())
    }

    /// Runs one validation pass, returns the failure message if the file is too large.
    pub fn validate(&mut self, state: FileState, size: u64) -> Option<String> {
        if self.validated {
            return None;
        }

        let Some(limit) = self.limit else {
            self.validated = true;
            return None;
        };

        let exceeded = size > limit.as_u64();
        if !state.is_final() && !exceeded {
            return None;
        }
        self.validated = true;

        exceeded.then(|| format!("File size should be less than {limit}"))
    }
}

#[derive(Debug, Default, Clone)]
pub struct ExtensionValidator {
    validated: bool,
    allowed: Option<Vec<String>>,
}

impl ExtensionValidator {
    pub fn new<S: AsRef<str>>(allowed: Option<&[S]>) -> Self {
        let allowed = allowed.map(|extnames| extnames.iter().map(|ext| normalize_extname(ext.as_ref())).collect());
        Self { validated: false, allowed }
    }

    #[inline]
    pub fn allowed(&self) -> Option<&[String]> {
        self.allowed.as_deref()
    }

    #[inline]
    pub fn is_validated(&self) -> bool {
        self.validated
    }

    pub fn set_allowed<I, S>(&mut self, extnames: I) -> Result<(), BodyParserError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if self.allowed.is_some() && self.validated {
            return Err(BodyParserError::validator_locked(
                "cannot update allowed extension names after file has been validated",
            ));
        }
        self.allowed = Some(extnames.into_iter().map(|ext| normalize_extname(ext.as_ref())).collect());
        self.validated = false;
        Ok(())
    }

    /// Runs one validation pass, returns the failure message if the extension is not allowed.
    pub fn validate(&mut self, state: FileState, extname: Option<&str>) -> Option<String> {
        if self.validated {
            return None;
        }

        let Some(allowed) = &self.allowed else {
            self.validated = true;
            return None;
        };

        if !state.is_final() && extname.is_none() {
            return None;
        }
        self.validated = true;

        if allowed.is_empty() {
            return None;
        }

        let extname = extname.unwrap_or_default();
        if allowed.iter().any(|ext| ext == extname) {
            return None;
        }

        let verb = if allowed.len() == 1 { "is" } else { "are" };
        Some(format!("Invalid file extension {extname}. Only {} {verb} allowed", allowed.join(", ")))
    }
}

/// Trims, lowercases and strips the leading dot of an extension name.
pub fn normalize_extname(ext: &str) -> String {
    ext.trim().trim_start_matches('.').to_ascii_lowercase()
}
