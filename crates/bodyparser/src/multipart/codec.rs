//! Streaming tokenizer for `multipart/form-data` bodies.
//!
//! [`MultipartDecoder`] implements [`Decoder`], so it can be driven by
//! `FramedRead` over any byte source. It turns the raw body into a sequence of
//! discrete [`MultipartEvent`]s:
//!
//! - a part without a `filename` parameter is buffered and emitted as one
//!   [`MultipartEvent::Field`]
//! - a part with a `filename` parameter (possibly empty) is emitted as
//!   [`MultipartEvent::PartBegin`], any number of [`MultipartEvent::PartData`]
//!   chunks and a final [`MultipartEvent::PartEnd`]
//!
//! File data is never buffered beyond the bytes that could still belong to a
//! delimiter, so memory stays bounded no matter how large an upload is.
//!
//! # State Machine
//!
//! ```text
//! Preamble -> AfterDelimiter -> Headers -> Body -> AfterDelimiter -> ... -> End
//! ```

use bytes::{Buf, Bytes, BytesMut};
use http::header::CONTENT_DISPOSITION;
use http::{HeaderMap, HeaderName, HeaderValue};
use httparse::Status;
use tokio_util::codec::Decoder;
use tracing::trace;

use crate::error::BodyParserError;

/// Maximum number of headers allowed in one part
const MAX_PART_HEADER_NUM: usize = 32;

/// Maximum size in bytes allowed for the header section of one part
const MAX_PART_HEADER_BYTES: usize = 8 * 1024;

/// Maximum bytes of transport padding tolerated after a delimiter
const MAX_PADDING_BYTES: usize = 1024;

/// Ceilings enforced by the tokenizer itself.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MultipartLimits {
    /// Maximum number of non-file fields.
    pub max_fields: usize,
    /// Maximum number of bytes of all non-file field values combined.
    pub fields_limit: u64,
}

impl Default for MultipartLimits {
    fn default() -> Self {
        Self { max_fields: 1000, fields_limit: 20 * 1024 * 1024 }
    }
}

/// Name, client file name and headers of one file part.
#[derive(Debug, Clone)]
pub struct PartHead {
    pub name: String,
    pub file_name: String,
    pub headers: HeaderMap,
}

#[derive(Debug, Clone)]
pub enum MultipartEvent {
    Field { name: String, value: String },
    PartBegin(PartHead),
    PartData(Bytes),
    PartEnd,
}

#[derive(Debug)]
enum State {
    /// Skipping anything before the first delimiter
    Preamble,
    /// Right after a delimiter, expecting `--` or CRLF
    AfterDelimiter,
    Headers,
    Body(BodyKind),
    /// Close delimiter seen, the epilogue is discarded
    End,
}

#[derive(Debug)]
enum BodyKind {
    File,
    Field { name: String, value: BytesMut },
}

#[derive(Debug)]
pub struct MultipartDecoder {
    /// `--boundary`, the first delimiter may appear without a leading CRLF
    dash_boundary: Bytes,
    /// `\r\n--boundary`
    delimiter: Bytes,
    state: State,
    limits: MultipartLimits,
    field_count: usize,
    field_bytes: u64,
}

impl MultipartDecoder {
    pub fn new(boundary: &str, limits: MultipartLimits) -> Self {
        let dash_boundary = Bytes::from(format!("--{boundary}"));
        let delimiter = Bytes::from(format!("\r\n--{boundary}"));
        Self { dash_boundary, delimiter, state: State::Preamble, limits, field_count: 0, field_bytes: 0 }
    }

    /// Whether the close delimiter has been seen.
    #[inline]
    pub fn is_finished(&self) -> bool {
        matches!(self.state, State::End)
    }

    fn decode_preamble(&mut self, src: &mut BytesMut) -> Option<State> {
        match find(src, &self.dash_boundary) {
            Some(index) => {
                src.advance(index + self.dash_boundary.len());
                Some(State::AfterDelimiter)
            }
            None => {
                // keep a tail that could be the start of the delimiter
                let keep = self.dash_boundary.len() - 1;
                if src.len() > keep {
                    src.advance(src.len() - keep);
                }
                None
            }
        }
    }

    fn decode_after_delimiter(src: &mut BytesMut) -> Result<Option<State>, BodyParserError> {
        if src.len() < 2 {
            return Ok(None);
        }

        if src.starts_with(b"--") {
            src.advance(2);
            return Ok(Some(State::End));
        }

        match find(src, b"\r\n") {
            Some(index) => {
                if !src[..index].iter().all(|b| *b == b' ' || *b == b'\t') {
                    return Err(BodyParserError::invalid_multipart("expected CRLF after boundary"));
                }
                src.advance(index + 2);
                Ok(Some(State::Headers))
            }
            None if src.len() > MAX_PADDING_BYTES || !src.iter().all(|b| matches!(b, b' ' | b'\t' | b'\r')) => {
                Err(BodyParserError::invalid_multipart("expected CRLF after boundary"))
            }
            None => Ok(None),
        }
    }

    fn decode_headers(&mut self, src: &mut BytesMut) -> Result<Option<MultipartEvent>, BodyParserError> {
        let mut raw_headers = [httparse::EMPTY_HEADER; MAX_PART_HEADER_NUM];
        let (consumed, headers) = match httparse::parse_headers(src, &mut raw_headers) {
            Ok(Status::Complete((consumed, parsed))) => {
                let mut headers = HeaderMap::with_capacity(parsed.len());
                for header in parsed {
                    let name = HeaderName::from_bytes(header.name.as_bytes())
                        .map_err(|e| BodyParserError::invalid_multipart(format!("invalid part header name: {e}")))?;
                    let value = HeaderValue::from_bytes(header.value)
                        .map_err(|e| BodyParserError::invalid_multipart(format!("invalid part header value: {e}")))?;
                    headers.append(name, value);
                }
                (consumed, headers)
            }
            Ok(Status::Partial) => {
                if src.len() > MAX_PART_HEADER_BYTES {
                    return Err(BodyParserError::invalid_multipart(format!(
                        "part header size exceed the limit {MAX_PART_HEADER_BYTES}"
                    )));
                }
                return Ok(None);
            }
            Err(httparse::Error::TooManyHeaders) => {
                return Err(BodyParserError::invalid_multipart(format!(
                    "part header number exceed the limit {MAX_PART_HEADER_NUM}"
                )));
            }
            Err(e) => return Err(BodyParserError::invalid_multipart(format!("invalid part header: {e}"))),
        };

        if consumed > MAX_PART_HEADER_BYTES {
            return Err(BodyParserError::invalid_multipart(format!(
                "part header size exceed the limit {MAX_PART_HEADER_BYTES}"
            )));
        }
        src.advance(consumed);

        let disposition = headers
            .get(CONTENT_DISPOSITION)
            .and_then(|value| value.to_str().ok())
            .map(ContentDisposition::parse)
            .ok_or_else(|| BodyParserError::invalid_multipart("part is missing the content-disposition header"))?;

        let name = disposition.name.unwrap_or_default();
        match disposition.file_name {
            Some(file_name) => {
                trace!(name = %name, file_name = %file_name, "multipart file part begins");
                self.state = State::Body(BodyKind::File);
                Ok(Some(MultipartEvent::PartBegin(PartHead { name, file_name, headers })))
            }
            None => {
                self.field_count += 1;
                if self.field_count > self.limits.max_fields {
                    return Err(BodyParserError::fields_limit_exceeded(format!(
                        "max fields {} exceeded",
                        self.limits.max_fields
                    )));
                }
                self.state = State::Body(BodyKind::Field { name, value: BytesMut::new() });
                Ok(None)
            }
        }
    }

    fn decode_body(&mut self, src: &mut BytesMut) -> Result<Option<MultipartEvent>, BodyParserError> {
        let found = find(src, &self.delimiter);
        let available = match found {
            Some(index) => index,
            None => src.len().saturating_sub(self.delimiter.len() - 1),
        };

        let State::Body(kind) = &mut self.state else {
            return Ok(None);
        };

        match kind {
            BodyKind::File => {
                if available > 0 {
                    return Ok(Some(MultipartEvent::PartData(src.split_to(available).freeze())));
                }
                if found.is_none() {
                    return Ok(None);
                }
                src.advance(self.delimiter.len());
                self.state = State::AfterDelimiter;
                Ok(Some(MultipartEvent::PartEnd))
            }
            BodyKind::Field { value, .. } => {
                self.field_bytes += available as u64;
                if self.field_bytes > self.limits.fields_limit {
                    return Err(BodyParserError::entity_too_large(format!(
                        "fields limit {} exceeded",
                        self.limits.fields_limit
                    )));
                }
                value.extend_from_slice(&src[..available]);
                src.advance(available);

                if found.is_none() {
                    return Ok(None);
                }
                src.advance(self.delimiter.len());

                let State::Body(BodyKind::Field { name, value }) =
                    std::mem::replace(&mut self.state, State::AfterDelimiter)
                else {
                    return Ok(None);
                };
                let value = String::from_utf8_lossy(&value).into_owned();
                Ok(Some(MultipartEvent::Field { name, value }))
            }
        }
    }
}

impl Decoder for MultipartDecoder {
    type Item = MultipartEvent;
    type Error = BodyParserError;

    /// Decodes the next event from the buffer.
    ///
    /// # Returns
    ///
    /// - `Ok(Some(event))`: a field, the start of a file part, a chunk of file data or the end of a file part
    /// - `Ok(None)`: more bytes are needed, or the close delimiter has been seen
    /// - `Err(_)`: the body is malformed or a field ceiling was exceeded
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Preamble => match self.decode_preamble(src) {
                    Some(state) => self.state = state,
                    None => return Ok(None),
                },
                State::AfterDelimiter => match Self::decode_after_delimiter(src)? {
                    Some(state) => self.state = state,
                    None => return Ok(None),
                },
                State::Headers => {
                    let before = src.len();
                    if let Some(event) = self.decode_headers(src)? {
                        return Ok(Some(event));
                    }
                    // a field part was opened, continue with its body
                    if before == src.len() {
                        return Ok(None);
                    }
                }
                State::Body(_) => {
                    let before = src.len();
                    if let Some(event) = self.decode_body(src)? {
                        return Ok(Some(event));
                    }
                    if before == src.len() || matches!(self.state, State::Body(_)) {
                        return Ok(None);
                    }
                }
                State::End => {
                    src.clear();
                    return Ok(None);
                }
            }
        }
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(event) => Ok(Some(event)),
            None if self.is_finished() => Ok(None),
            None => Err(BodyParserError::invalid_multipart("unexpected end of multipart stream")),
        }
    }
}

/// Parameters of a `Content-Disposition: form-data` header.
#[derive(Debug, Default, PartialEq, Eq)]
struct ContentDisposition {
    name: Option<String>,
    file_name: Option<String>,
}

impl ContentDisposition {
    fn parse(value: &str) -> Self {
        let mut disposition = ContentDisposition::default();
        let mut rest = match value.split_once(';') {
            Some((_, params)) => params,
            None => return disposition,
        };

        loop {
            rest = rest.trim_start_matches([' ', '\t', ';']);
            if rest.is_empty() {
                break;
            }

            let Some(eq) = rest.find('=') else {
                break;
            };
            let key = rest[..eq].trim().to_ascii_lowercase();
            let (param, remaining) = parse_param_value(&rest[eq + 1..]);
            rest = remaining;

            match key.as_str() {
                "name" => disposition.name = Some(param),
                // browsers on some platforms send the full client path
                "filename" => disposition.file_name = Some(basename(&param).to_string()),
                _ => {}
            }
        }

        disposition
    }
}

/// Parses a token or a quoted string, returns the value and the remaining input.
fn parse_param_value(input: &str) -> (String, &str) {
    let input = input.trim_start();
    let Some(quoted) = input.strip_prefix('"') else {
        let end = input.find(';').unwrap_or(input.len());
        return (input[..end].trim().to_string(), &input[end..]);
    };

    let mut value = String::new();
    let mut chars = quoted.char_indices();
    while let Some((index, c)) = chars.next() {
        match c {
            '\\' => {
                if let Some((_, escaped)) = chars.next() {
                    value.push(escaped);
                }
            }
            '"' => return (value, &quoted[index + 1..]),
            c => value.push(c),
        }
    }
    (value, "")
}

fn basename(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BOUNDARY: &str = "X-BOUNDARY";

    fn body() -> String {
        [
            "--X-BOUNDARY\r\n",
            "Content-Disposition: form-data; name=\"name\"\r\n",
            "\r\n",
            "virk\r\n",
            "--X-BOUNDARY\r\n",
            "Content-Disposition: form-data; name=\"package\"; filename=\"package.json\"\r\n",
            "Content-Type: application/json\r\n",
            "\r\n",
            "{\"name\":\"bodyparser\"}\r\n",
            "--X-BOUNDARY--\r\n",
        ]
        .concat()
    }

    fn decode_all(decoder: &mut MultipartDecoder, buffer: &mut BytesMut) -> Vec<MultipartEvent> {
        let mut events = vec![];
        while let Some(event) = decoder.decode(buffer).unwrap() {
            events.push(event);
        }
        events
    }

    /// Collapses consecutive data chunks so assertions do not depend on chunking.
    fn normalize(events: Vec<MultipartEvent>) -> Vec<String> {
        let mut normalized: Vec<String> = vec![];
        for event in events {
            match event {
                MultipartEvent::Field { name, value } => normalized.push(format!("field {name}={value}")),
                MultipartEvent::PartBegin(head) => normalized.push(format!("begin {} {}", head.name, head.file_name)),
                MultipartEvent::PartData(bytes) => {
                    let text = std::str::from_utf8(&bytes).unwrap().to_string();
                    match normalized.last_mut() {
                        Some(last) if last.starts_with("data ") => last.push_str(&text),
                        _ => normalized.push(format!("data {text}")),
                    }
                }
                MultipartEvent::PartEnd => normalized.push("end".to_string()),
            }
        }
        normalized
    }

    #[test]
    fn test_basic() {
        let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits::default());
        let mut buffer = BytesMut::from(body().as_bytes());

        let events = normalize(decode_all(&mut decoder, &mut buffer));
        assert_eq!(
            events,
            vec![
                "field name=virk".to_string(),
                "begin package package.json".to_string(),
                "data {\"name\":\"bodyparser\"}".to_string(),
                "end".to_string(),
            ]
        );
        assert!(decoder.is_finished());
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_part_headers() {
        let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits::default());
        let mut buffer = BytesMut::from(body().as_bytes());

        let events = decode_all(&mut decoder, &mut buffer);
        let head = events
            .into_iter()
            .find_map(|event| match event {
                MultipartEvent::PartBegin(head) => Some(head),
                _ => None,
            })
            .unwrap();
        assert_eq!(head.headers.get(http::header::CONTENT_TYPE).unwrap(), "application/json");
    }

    #[test]
    fn test_split_at_every_offset() {
        let body = body();
        let expected = {
            let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits::default());
            normalize(decode_all(&mut decoder, &mut BytesMut::from(body.as_bytes())))
        };

        for split in 0..body.len() {
            let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits::default());
            let mut buffer = BytesMut::from(&body.as_bytes()[..split]);
            let mut events = decode_all(&mut decoder, &mut buffer);
            buffer.extend_from_slice(&body.as_bytes()[split..]);
            events.extend(decode_all(&mut decoder, &mut buffer));

            assert_eq!(normalize(events), expected, "split at {split}");
        }
    }

    #[test]
    fn test_preamble_and_epilogue() {
        let body = format!("this is a preamble\r\n{}epilogue text", body());
        let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits::default());
        let mut buffer = BytesMut::from(body.as_bytes());

        let events = normalize(decode_all(&mut decoder, &mut buffer));
        assert_eq!(events.len(), 4);
        assert!(decoder.decode_eof(&mut buffer).unwrap().is_none());
    }

    #[test]
    fn test_empty_file_part() {
        let body = [
            "--X-BOUNDARY\r\n",
            "Content-Disposition: form-data; name=\"avatar\"; filename=\"\"\r\n",
            "Content-Type: application/octet-stream\r\n",
            "\r\n",
            "\r\n",
            "--X-BOUNDARY--",
        ]
        .concat();
        let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits::default());
        let mut buffer = BytesMut::from(body.as_bytes());

        let events = normalize(decode_all(&mut decoder, &mut buffer));
        assert_eq!(events, vec!["begin avatar ".to_string(), "end".to_string()]);
    }

    #[test]
    fn test_truncated_body() {
        let body = body();
        let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits::default());
        let mut buffer = BytesMut::from(&body.as_bytes()[..body.len() - 10]);

        decode_all(&mut decoder, &mut buffer);
        let mut result = decoder.decode_eof(&mut buffer);
        while let Ok(Some(_)) = result {
            result = decoder.decode_eof(&mut buffer);
        }
        assert!(matches!(result, Err(BodyParserError::InvalidMultipart { .. })));
    }

    #[test]
    fn test_wrong_boundary() {
        let mut decoder = MultipartDecoder::new("OTHER", MultipartLimits::default());
        let mut buffer = BytesMut::from(body().as_bytes());

        assert!(decode_all(&mut decoder, &mut buffer).is_empty());
        assert!(matches!(decoder.decode_eof(&mut buffer), Err(BodyParserError::InvalidMultipart { .. })));
    }

    #[test]
    fn test_garbage_after_delimiter() {
        let body = "--X-BOUNDARYjunk\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nb\r\n--X-BOUNDARY--";
        let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits::default());
        let mut buffer = BytesMut::from(body.as_bytes());

        assert!(matches!(decoder.decode(&mut buffer), Err(BodyParserError::InvalidMultipart { .. })));
    }

    #[test]
    fn test_missing_content_disposition() {
        let body = "--X-BOUNDARY\r\nContent-Type: text/plain\r\n\r\nb\r\n--X-BOUNDARY--";
        let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits::default());
        let mut buffer = BytesMut::from(body.as_bytes());

        assert!(matches!(decoder.decode(&mut buffer), Err(BodyParserError::InvalidMultipart { .. })));
    }

    #[test]
    fn test_max_fields() {
        let body = [
            "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n1\r\n",
            "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"b\"\r\n\r\n2\r\n",
            "--X-BOUNDARY--",
        ]
        .concat();
        let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits { max_fields: 1, fields_limit: 1024 });
        let mut buffer = BytesMut::from(body.as_bytes());

        assert!(matches!(decoder.decode(&mut buffer), Ok(Some(MultipartEvent::Field { .. }))));
        assert!(matches!(decoder.decode(&mut buffer), Err(BodyParserError::FieldsLimitExceeded { .. })));
    }

    #[test]
    fn test_fields_limit() {
        let body = "--X-BOUNDARY\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\n0123456789\r\n--X-BOUNDARY--";
        let mut decoder = MultipartDecoder::new(BOUNDARY, MultipartLimits { max_fields: 10, fields_limit: 5 });
        let mut buffer = BytesMut::from(body.as_bytes());

        assert!(matches!(decoder.decode(&mut buffer), Err(BodyParserError::EntityTooLarge { .. })));
    }

    #[test]
    fn test_content_disposition() {
        assert_eq!(
            ContentDisposition::parse("form-data; name=\"files[]\"; filename=\"C:\\\\docs\\\\a \\\"b\\\".txt\""),
            ContentDisposition { name: Some("files[]".to_string()), file_name: Some("a \"b\".txt".to_string()) }
        );
        assert_eq!(
            ContentDisposition::parse("form-data; name=title"),
            ContentDisposition { name: Some("title".to_string()), file_name: None }
        );
        assert_eq!(ContentDisposition::parse("form-data"), ContentDisposition::default());
    }
}
