//! Streaming request body ingestion for async HTTP services
//!
//! This crate classifies an incoming request by its content type and decodes
//! the body into structured data. Its core is `multipart/form-data` streaming:
//! parts are parsed straight off the body stream, handed to consumers through
//! bounded channels and validated while they arrive, so whole files are never
//! buffered in memory.
//!
//! # Features
//!
//! - JSON, urlencoded and raw text bodies with configurable size limits
//! - Nested form fields (`user[email]`, `tags[]`, `items[0]`, `a.b`)
//! - Streaming multipart tokenizer built on `tokio_util::codec`
//! - File type detection from content, with a file name fallback
//! - Size and extension validation, while streaming or after the fact
//! - Temp file storage and `move_to` for uploaded files
//! - Backpressure between the request body and slow consumers
//!
//! # Example
//!
//! ```no_run
//! use bytes::Bytes;
//! use http::Request;
//! use http_body_util::Full;
//! use micro_bodyparser::BodyParser;
//! use micro_bodyparser::multipart::{FileValidationOptions, MoveOptions};
//! use micro_bodyparser::size::ByteSize;
//!
//! async fn upload(request: Request<Full<Bytes>>) -> Result<(), micro_bodyparser::BodyParserError> {
//!     let parser = BodyParser::default();
//!     let parsed = parser.parse(request, Some("/avatar")).await?;
//!
//!     let options = FileValidationOptions::default().size(ByteSize::mb(2)).extnames(["jpg", "png"]);
//!     if let Some(avatar) = parsed.file("avatar", &options)? {
//!         if avatar.is_valid() {
//!             avatar.move_to("uploads", MoveOptions::default()).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! # Architecture
//!
//! - [`parser`]: the request level entry point
//! - [`multipart`]: tokenizer, coordinator, file records and consumers
//! - [`decode`]: decoders for bodies read into memory
//! - [`form`]: the nested field collection
//! - [`config`]: serde configuration with defaults

pub mod config;
pub mod content_type;
pub mod decode;
mod error;
pub mod form;
pub mod multipart;
pub mod parser;
pub mod size;

pub use config::BodyParserConfig;
pub use error::BodyParserError;
pub use form::{FormFields, FormNode};
pub use parser::{BodyKind, BodyParser, ParsedBody};
pub use size::ByteSize;
