//! Request level entry point.
//!
//! [`BodyParser::parse`] picks a decoder from the request's content type and
//! returns a [`ParsedBody`]:
//!
//! | content type | result |
//! | --- | --- |
//! | `multipart.types` | fields as the body, files streamed to temp files, or the unprocessed [`Multipart`] |
//! | `form.types` | urlencoded fields as the body, raw text |
//! | `json.types` | the parsed JSON as the body, raw text |
//! | `raw.types` | raw text only |
//!
//! Requests with a method outside `allowed_methods`, without a body or with an
//! unknown content type get an empty body.

use std::error::Error as StdError;

use bytes::Bytes;
use http::header::{CONTENT_LENGTH, TRANSFER_ENCODING};
use http::{HeaderMap, Request};
use http_body::Body;
use serde_json::Value;
use tracing::debug;

use crate::config::BodyParserConfig;
use crate::content_type;
use crate::decode;
use crate::error::BodyParserError;
use crate::form::FormFields;
use crate::multipart::{FileHandle, FileValidationOptions, Multipart, PartOptions, TmpFileConsumer, WILDCARD};
use crate::size::ByteSize;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BodyKind {
    Empty,
    Json,
    Form,
    Raw,
    Multipart,
}

#[derive(Debug, Clone, Default)]
pub struct BodyParser {
    config: BodyParserConfig,
}

impl BodyParser {
    pub fn new(config: BodyParserConfig) -> Self {
        Self { config }
    }

    #[inline]
    pub fn config(&self) -> &BodyParserConfig {
        &self.config
    }

    /// Parses the body of `request`.
    ///
    /// `route` is the matched route pattern, used to decide whether a multipart
    /// body is processed automatically.
    pub async fn parse<B>(&self, request: Request<B>, route: Option<&str>) -> Result<ParsedBody, BodyParserError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        if !self.config.allowed_methods.contains(request.method()) || !has_body(request.headers()) {
            return Ok(ParsedBody::empty());
        }

        let headers = request.headers();
        let parsed = if content_type::matches(headers, &self.config.multipart.types) {
            self.parse_multipart(request, route).await?
        } else if content_type::matches(headers, &self.config.form.types) {
            let config = &self.config.form;
            let raw = self.read_text(request, config.limit).await?;
            let fields = decode::urlencoded(raw.as_bytes(), config.convert_empty_strings_to_null)?;
            ParsedBody { kind: BodyKind::Form, body: fields.to_json(), raw: Some(raw), ..ParsedBody::empty() }
        } else if content_type::matches(headers, &self.config.json.types) {
            let config = &self.config.json;
            let raw = self.read_text(request, config.limit).await?;
            let body = decode::json(raw.as_bytes(), config)?;
            ParsedBody { kind: BodyKind::Json, body, raw: Some(raw), ..ParsedBody::empty() }
        } else if content_type::matches(headers, &self.config.raw.types) {
            let raw = self.read_text(request, self.config.raw.limit).await?;
            ParsedBody { kind: BodyKind::Raw, raw: Some(raw), ..ParsedBody::empty() }
        } else {
            ParsedBody::empty()
        };

        debug!(kind = ?parsed.kind, "parsed request body");
        Ok(parsed)
    }

    async fn read_text<B>(&self, request: Request<B>, limit: ByteSize) -> Result<String, BodyParserError>
    where
        B: Body<Data = Bytes>,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        decode::check_content_length(request.headers(), limit)?;
        let bytes = decode::collect(request.into_body(), limit).await?;
        decode::text(&bytes)
    }

    async fn parse_multipart<B>(&self, request: Request<B>, route: Option<&str>) -> Result<ParsedBody, BodyParserError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let config = &self.config.multipart;
        let mut multipart = Multipart::from_request(request, config.clone())?;

        if !config.should_auto_process(route) {
            debug!(route, "multipart body left for manual processing");
            return Ok(ParsedBody { kind: BodyKind::Multipart, multipart: Some(multipart), ..ParsedBody::empty() });
        }

        let consumer = TmpFileConsumer::new(config.tmp_dir.clone(), config.tmp_file_name.clone());
        multipart.on_file(WILDCARD, PartOptions::default().defer_validations(true), consumer);
        multipart.process().await?;

        let (fields, files) = multipart.into_inner();
        Ok(ParsedBody { kind: BodyKind::Multipart, body: fields.to_json(), files, ..ParsedBody::empty() })
    }
}

/// A request has a body when it declares a non-zero length or a transfer encoding.
fn has_body(headers: &HeaderMap) -> bool {
    if headers.contains_key(TRANSFER_ENCODING) {
        return true;
    }

    headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok())
        .is_some_and(|length| length > 0)
}

#[derive(Debug)]
pub struct ParsedBody {
    kind: BodyKind,
    body: Value,
    raw: Option<String>,
    files: FormFields<FileHandle>,
    multipart: Option<Multipart>,
}

impl ParsedBody {
    fn empty() -> Self {
        Self {
            kind: BodyKind::Empty,
            body: Value::Object(serde_json::Map::new()),
            raw: None,
            files: FormFields::new(),
            multipart: None,
        }
    }

    #[inline]
    pub fn kind(&self) -> BodyKind {
        self.kind
    }

    /// The decoded body, an empty object when there is none.
    #[inline]
    pub fn body(&self) -> &Value {
        &self.body
    }

    /// The body as text, for JSON, urlencoded and raw bodies.
    #[inline]
    pub fn raw(&self) -> Option<&str> {
        self.raw.as_deref()
    }

    #[inline]
    pub fn files(&self) -> &FormFields<FileHandle> {
        &self.files
    }

    /// The unprocessed multipart body of a route that is not auto processed.
    pub fn take_multipart(&mut self) -> Option<Multipart> {
        self.multipart.take()
    }

    /// The file stored under `key`, the first one if there are several.
    ///
    /// Constraints from `options` are applied to the file unless it already has
    /// its own, then the file is validated.
    pub fn file(&self, key: &str, options: &FileValidationOptions) -> Result<Option<FileHandle>, BodyParserError> {
        let Some(file) = self.files.get(key).and_then(|node| node.first_value()) else {
            return Ok(None);
        };
        validate_with(file, options)?;
        Ok(Some(file.clone()))
    }

    /// All files stored under `key`, each validated like [`ParsedBody::file`].
    pub fn files_for(&self, key: &str, options: &FileValidationOptions) -> Result<Vec<FileHandle>, BodyParserError> {
        let Some(node) = self.files.get(key) else {
            return Ok(vec![]);
        };

        node.values()
            .into_iter()
            .map(|file| {
                validate_with(file, options)?;
                Ok(file.clone())
            })
            .collect()
    }
}

fn validate_with(file: &FileHandle, options: &FileValidationOptions) -> Result<(), BodyParserError> {
    let mut file = file.lock();
    if let Some(size) = options.size
        && file.size_limit().is_none()
    {
        file.set_size_limit(size)?;
    }
    if let Some(extnames) = &options.extnames
        && file.allowed_extensions().is_none()
    {
        file.set_allowed_extensions(extnames)?;
    }
    file.validate();
    Ok(())
}
