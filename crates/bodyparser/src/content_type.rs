//! Content-type inspection for incoming requests.
//!
//! Patterns follow the usual `type-is` conventions: an exact essence such as
//! `application/json`, a wildcard subtype (`text/*`), a structured syntax suffix
//! (`application/*+json`) or `*/*`.

use http::HeaderMap;
use http::header::CONTENT_TYPE;
use mime::Mime;

/// Parses the request's `Content-Type` header, `None` when absent or malformed.
pub fn content_type(headers: &HeaderMap) -> Option<Mime> {
    headers.get(CONTENT_TYPE)?.to_str().ok()?.parse().ok()
}

/// Returns `true` when the request's content type matches one of `patterns`.
pub fn matches<S: AsRef<str>>(headers: &HeaderMap, patterns: &[S]) -> bool {
    match content_type(headers) {
        Some(mime) => patterns.iter().any(|pattern| mime_matches(&mime, pattern.as_ref())),
        None => false,
    }
}

/// Extracts the multipart boundary parameter from the request headers.
pub fn boundary(headers: &HeaderMap) -> Option<String> {
    let mime = content_type(headers)?;
    if mime.type_() != mime::MULTIPART {
        return None;
    }
    mime.get_param(mime::BOUNDARY).map(|boundary| boundary.as_str().trim_matches('"').to_string())
}

fn mime_matches(mime: &Mime, pattern: &str) -> bool {
    let Some((expected_type, expected_subtype)) = pattern.trim().split_once('/') else {
        return false;
    };

    if expected_type != "*" && !expected_type.eq_ignore_ascii_case(mime.type_().as_str()) {
        return false;
    }

    match expected_subtype {
        "*" => true,
        subtype if subtype.starts_with("*+") => {
            mime.suffix().is_some_and(|suffix| suffix.as_str().eq_ignore_ascii_case(&subtype[2..]))
        }
        // `Mime::subtype` leaves out the suffix, the essence keeps it
        subtype => mime
            .essence_str()
            .split_once('/')
            .is_some_and(|(_, actual)| subtype.eq_ignore_ascii_case(actual)),
    }
}
