//! Decoders for bodies that are read into memory as a whole.

use std::error::Error as StdError;

use bytes::Bytes;
use http::HeaderMap;
use http::header::CONTENT_LENGTH;
use http_body::Body;
use http_body_util::{BodyExt, LengthLimitError, Limited};
use serde_json::Value;

use crate::config::JsonConfig;
use crate::error::BodyParserError;
use crate::form::FormFields;
use crate::size::ByteSize;

/// Rejects a request up front when its declared `Content-Length` exceeds `limit`.
pub fn check_content_length(headers: &HeaderMap, limit: ByteSize) -> Result<(), BodyParserError> {
    let length = headers
        .get(CONTENT_LENGTH)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.trim().parse::<u64>().ok());

    match length {
        Some(length) if length > limit.as_u64() => {
            Err(BodyParserError::entity_too_large(format!("content-length {length} exceeds the limit {limit}")))
        }
        _ => Ok(()),
    }
}

/// Reads the whole body, failing as soon as more than `limit` bytes arrive.
pub async fn collect<B>(body: B, limit: ByteSize) -> Result<Bytes, BodyParserError>
where
    B: Body<Data = Bytes>,
    B::Error: Into<Box<dyn StdError + Send + Sync>>,
{
    let max = usize::try_from(limit.as_u64()).unwrap_or(usize::MAX);
    match Limited::new(body, max).collect().await {
        Ok(collected) => Ok(collected.to_bytes()),
        Err(e) if e.downcast_ref::<LengthLimitError>().is_some() => {
            Err(BodyParserError::entity_too_large(format!("body exceeds the limit {limit}")))
        }
        Err(e) => Err(BodyParserError::invalid_body(format!("failed to read body: {e}"))),
    }
}

pub fn text(bytes: &[u8]) -> Result<String, BodyParserError> {
    std::str::from_utf8(bytes)
        .map(str::to_string)
        .map_err(|e| BodyParserError::invalid_body(format!("body is not valid utf-8: {e}")))
}

/// Decodes `application/x-www-form-urlencoded` pairs into nested fields.
pub fn urlencoded(bytes: &[u8], convert_empty_strings_to_null: bool) -> Result<FormFields<String>, BodyParserError> {
    let pairs: Vec<(String, String)> = serde_urlencoded::from_bytes(bytes)
        .map_err(|e| BodyParserError::invalid_body(format!("invalid urlencoded body: {e}")))?;

    let mut fields = FormFields::new();
    for (key, value) in pairs {
        if !key.is_empty() {
            fields.add_text(&key, value, convert_empty_strings_to_null);
        }
    }
    Ok(fields)
}

/// Parses a JSON body, an empty body is an empty object.
pub fn json(bytes: &[u8], config: &JsonConfig) -> Result<Value, BodyParserError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Object(serde_json::Map::new()));
    }

    let mut value: Value =
        serde_json::from_slice(bytes).map_err(|e| BodyParserError::invalid_body(format!("invalid json body: {e}")))?;

    if config.strict && !(value.is_object() || value.is_array()) {
        return Err(BodyParserError::invalid_body("strict mode only accepts objects and arrays"));
    }

    if config.convert_empty_strings_to_null {
        convert_empty_strings(&mut value);
    }
    Ok(value)
}

fn convert_empty_strings(value: &mut Value) {
    match value {
        Value::String(string) if !string.is_empty() => {}
        Value::String(_) => *value = Value::Null,
        Value::Array(items) => items.iter_mut().for_each(convert_empty_strings),
        Value::Object(map) => map.values_mut().for_each(convert_empty_strings),
        _ => {}
    }
}
