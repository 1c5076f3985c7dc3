use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures::channel::mpsc;
use futures::{Stream, StreamExt};
use http::HeaderMap;
use http::header::CONTENT_TYPE;
use mime::Mime;

use crate::error::BodyParserError;
use crate::multipart::file::FileHandle;

/// One file part as seen by a [`PartConsumer`](crate::multipart::PartConsumer).
///
/// A `Part` is a [`Stream`] of data chunks. The stream yields
/// `Err(BodyParserError::StreamValidation)` once, in place of the chunk that made
/// the file fail its size or extension validation; consumers should stop
/// writing and return that error. Dropping a `Part` early discards the rest of
/// its data.
pub struct Part {
    name: String,
    file_name: String,
    headers: HeaderMap,
    file: FileHandle,
    receiver: mpsc::Receiver<Result<Bytes, BodyParserError>>,
}

impl Part {
    pub(crate) fn new(
        name: String,
        file_name: String,
        headers: HeaderMap,
        file: FileHandle,
        receiver: mpsc::Receiver<Result<Bytes, BodyParserError>>,
    ) -> Self {
        Self { name, file_name, headers, file, receiver }
    }

    /// The form field name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The file name sent by the client.
    #[inline]
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn content_type(&self) -> Option<Mime> {
        self.headers.get(CONTENT_TYPE)?.to_str().ok()?.parse().ok()
    }

    /// The file record this part streams into.
    #[inline]
    pub fn file(&self) -> &FileHandle {
        &self.file
    }

    /// Buffers the whole part in memory.
    pub async fn bytes(mut self) -> Result<Bytes, BodyParserError> {
        let mut buffer = BytesMut::new();
        while let Some(chunk) = self.next().await {
            buffer.extend_from_slice(&chunk?);
        }
        Ok(buffer.freeze())
    }
}

impl Stream for Part {
    type Item = Result<Bytes, BodyParserError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.receiver.poll_next_unpin(cx)
    }
}

impl fmt::Debug for Part {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Part")
            .field("name", &self.name)
            .field("file_name", &self.file_name)
            .field("headers", &self.headers)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::multipart::file::{FileValidationOptions, MultipartFile};
    use futures::SinkExt;
    use http::HeaderValue;

    fn part(headers: HeaderMap) -> (mpsc::Sender<Result<Bytes, BodyParserError>>, Part) {
        let options = FileValidationOptions::default();
        let file = MultipartFile::new("avatar".into(), "me.png".into(), headers.clone(), &options);
        let (sender, receiver) = mpsc::channel(4);
        (sender, Part::new("avatar".into(), "me.png".into(), headers, FileHandle::new(file), receiver))
    }

    #[tokio::test]
    async fn test_bytes() {
        let (mut sender, part) = part(HeaderMap::new());
        sender.send(Ok(Bytes::from_static(b"abc"))).await.unwrap();
        sender.send(Ok(Bytes::from_static(b"def"))).await.unwrap();
        drop(sender);

        assert_eq!(part.bytes().await.unwrap(), Bytes::from_static(b"abcdef"));
    }

    #[tokio::test]
    async fn test_bytes_stops_at_error() {
        let (mut sender, part) = part(HeaderMap::new());
        sender.send(Ok(Bytes::from_static(b"abc"))).await.unwrap();
        sender.send(Err(BodyParserError::StreamValidation)).await.unwrap();

        assert!(matches!(part.bytes().await, Err(BodyParserError::StreamValidation)));
    }

    #[test]
    fn test_accessors() {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("image/png"));
        let (_sender, part) = part(headers);

        assert_eq!(part.name(), "avatar");
        assert_eq!(part.file_name(), "me.png");
        assert_eq!(part.content_type(), Some(mime::IMAGE_PNG));
        assert_eq!(part.file().client_name(), "me.png");
    }
}
