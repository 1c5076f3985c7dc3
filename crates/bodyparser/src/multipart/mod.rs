//! Streaming `multipart/form-data` processing.
//!
//! [`Multipart`] drives a [`MultipartDecoder`] over the request body and routes
//! every event it produces:
//!
//! - plain fields are collected into [`Multipart::fields`]
//! - file parts are handed, as a [`Part`] stream, to the [`PartConsumer`]
//!   registered for their field name (or for the [`WILDCARD`]), and the
//!   resulting [`MultipartFile`] records are collected into [`Multipart::files`]
//!
//! Consumers run inside the [`Multipart::process`] future, no task is spawned.
//! Every part gets a bounded channel, so a slow consumer slows down reading of
//! the request body instead of buffering it.
//!
//! # Example
//!
//! ```no_run
//! use micro_bodyparser::multipart::{Multipart, PartOptions, TmpFileConsumer};
//! use micro_bodyparser::config::MultipartConfig;
//! # use micro_bodyparser::BodyParserError;
//! # type Request = http::Request<http_body_util::Full<bytes::Bytes>>;
//! # async fn handle(request: Request) -> Result<(), BodyParserError> {
//! let mut multipart = Multipart::from_request(request, MultipartConfig::default())?;
//! multipart.on_file("avatar", PartOptions::default(), TmpFileConsumer::default());
//! multipart.process().await?;
//!
//! for file in multipart.files().values() {
//!     println!("{} is valid: {}", file.client_name(), file.is_valid());
//! }
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod consumer;
pub mod file;
pub mod file_type;
mod part;
mod part_handler;
pub mod validator;

use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::channel::mpsc;
use futures::future::{self, BoxFuture};
use futures::stream::{BoxStream, FuturesUnordered};
use futures::{FutureExt, Stream, StreamExt, TryStreamExt};
use http::Request;
use http_body::Body;
use http_body_util::BodyExt;
use tokio_util::codec::FramedRead;
use tokio_util::io::StreamReader;
use tracing::{debug, trace, warn};

pub use codec::{MultipartDecoder, MultipartEvent, MultipartLimits, PartHead};
pub use consumer::{ConsumerFn, PartConsumer, PartMeta, TmpFileConsumer, consumer_fn};
pub use file::{
    FileHandle, FileState, FileValidationError, FileValidationOptions, MoveOptions, MultipartFile, ValidationErrorKind,
};
pub use file_type::FileType;
pub use part::Part;

use crate::config::MultipartConfig;
use crate::content_type;
use crate::error::BodyParserError;
use crate::form::FormFields;
use crate::size::ByteSize;
use part_handler::PartHandler;

/// Field name that registers a consumer for every file part.
pub const WILDCARD: &str = "*";

/// Number of chunks buffered between the tokenizer and one consumer
const PART_CHANNEL_CAPACITY: usize = 8;

pub type BodyStream = BoxStream<'static, io::Result<Bytes>>;

type Events = FramedRead<StreamReader<BodyStream, Bytes>, MultipartDecoder>;

type PartFuture = BoxFuture<'static, (usize, Result<PartMeta, BodyParserError>)>;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MultipartState {
    Idle,
    Processing,
    Success,
    Error,
}

/// How the parts of one field name are handled.
#[derive(Debug, Default, Clone)]
pub struct PartOptions {
    pub validation: FileValidationOptions,
    /// Skip validation while streaming and after consumption, leaving it to the caller.
    pub defer_validations: bool,
}

impl PartOptions {
    #[must_use]
    pub fn size(mut self, size: ByteSize) -> Self {
        self.validation.size = Some(size);
        self
    }

    #[must_use]
    pub fn extnames<I, S>(mut self, extnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.validation = self.validation.extnames(extnames);
        self
    }

    #[must_use]
    pub fn defer_validations(mut self, defer_validations: bool) -> Self {
        self.defer_validations = defer_validations;
        self
    }
}

struct Registration {
    options: PartOptions,
    consumer: Arc<dyn PartConsumer>,
}

/// Aborts a running [`Multipart::process`] from anywhere, typically a consumer.
#[derive(Debug, Clone)]
pub struct AbortHandle {
    sender: mpsc::UnboundedSender<BodyParserError>,
}

impl AbortHandle {
    pub fn abort(&self, error: BodyParserError) {
        if let Err(e) = self.sender.unbounded_send(error) {
            trace!("multipart already dropped, abort ignored: {}", e.into_inner());
        }
    }
}

pub struct Multipart {
    state: MultipartState,
    source: Option<BodyStream>,
    boundary: String,
    config: MultipartConfig,
    handlers: HashMap<String, Registration>,
    fields: FormFields<String>,
    files: FormFields<FileHandle>,
    abort_sender: mpsc::UnboundedSender<BodyParserError>,
    abort_receiver: mpsc::UnboundedReceiver<BodyParserError>,
}

impl Multipart {
    pub fn new<S, B>(stream: S, boundary: B, config: MultipartConfig) -> Self
    where
        S: Stream<Item = io::Result<Bytes>> + Send + 'static,
        B: Into<String>,
    {
        let (abort_sender, abort_receiver) = mpsc::unbounded();
        Self {
            state: MultipartState::Idle,
            source: Some(stream.boxed()),
            boundary: boundary.into(),
            config,
            handlers: HashMap::new(),
            fields: FormFields::new(),
            files: FormFields::new(),
            abort_sender,
            abort_receiver,
        }
    }

    /// Reads the boundary from the request's content type and streams its body.
    pub fn from_request<B>(request: Request<B>, config: MultipartConfig) -> Result<Self, BodyParserError>
    where
        B: Body<Data = Bytes> + Send + 'static,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let boundary = content_type::boundary(request.headers())
            .ok_or_else(|| BodyParserError::invalid_multipart("missing boundary in content-type"))?;
        let stream = request.into_body().into_data_stream().map_err(io::Error::other);
        Ok(Self::new(stream, boundary, config))
    }

    /// Registers `consumer` for file parts named `name`, replacing any previous one.
    ///
    /// Array notation is ignored when looking a part up, so a consumer registered
    /// for `docs` also receives `docs[]` and `docs[0]`. Parts without a consumer
    /// of their own go to the one registered for [`WILDCARD`], if any.
    pub fn on_file<N, C>(&mut self, name: N, options: PartOptions, consumer: C) -> &mut Self
    where
        N: Into<String>,
        C: PartConsumer + 'static,
    {
        self.handlers.insert(name.into(), Registration { options, consumer: Arc::new(consumer) });
        self
    }

    #[inline]
    pub fn state(&self) -> MultipartState {
        self.state
    }

    #[inline]
    pub fn fields(&self) -> &FormFields<String> {
        &self.fields
    }

    #[inline]
    pub fn files(&self) -> &FormFields<FileHandle> {
        &self.files
    }

    pub fn into_inner(self) -> (FormFields<String>, FormFields<FileHandle>) {
        (self.fields, self.files)
    }

    pub fn abort_handle(&self) -> AbortHandle {
        AbortHandle { sender: self.abort_sender.clone() }
    }

    /// Fails the current or next [`Multipart::process`] call with `error`.
    pub fn abort(&self, error: BodyParserError) {
        self.abort_handle().abort(error);
    }

    /// Reads the whole body, resolving once every part has been consumed.
    ///
    /// Fields and files collected before a failure stay available through
    /// [`Multipart::fields`] and [`Multipart::files`].
    pub async fn process(&mut self) -> Result<(), BodyParserError> {
        if self.state != MultipartState::Idle {
            return Err(BodyParserError::AlreadyConsumed);
        }
        let source = self.source.take().ok_or(BodyParserError::AlreadyConsumed)?;
        self.state = MultipartState::Processing;

        let limits =
            MultipartLimits { max_fields: self.config.max_fields, fields_limit: self.config.fields_limit.as_u64() };
        let events = FramedRead::new(StreamReader::new(source), MultipartDecoder::new(&self.boundary, limits));

        let result = Run::new(self, events).await;
        match &result {
            Ok(()) => {
                self.state = MultipartState::Success;
                debug!(files = self.files.values().len(), "multipart processing finished");
            }
            Err(e) => {
                self.state = MultipartState::Error;
                warn!(code = e.code(), "multipart processing failed, {}", e);
            }
        }
        result
    }

    fn registration(&self, name: &str) -> Option<&Registration> {
        self.handlers.get(strip_array_index(name)).or_else(|| self.handlers.get(WILDCARD))
    }
}

impl fmt::Debug for Multipart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multipart")
            .field("state", &self.state)
            .field("boundary", &self.boundary)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .field("fields", &self.fields)
            .field("files", &self.files)
            .finish_non_exhaustive()
    }
}

/// Strips one trailing `[]` or `[<digits>]`.
fn strip_array_index(name: &str) -> &str {
    if let Some(stripped) = name.strip_suffix(']')
        && let Some(open) = stripped.rfind('[')
        && stripped[open + 1..].bytes().all(|b| b.is_ascii_digit())
    {
        return &name[..open];
    }
    name
}

/// The part currently receiving data from the tokenizer.
struct CurrentPart {
    /// `None` for parts that are discarded
    id: Option<usize>,
    sender: Option<mpsc::Sender<Result<Bytes, BodyParserError>>>,
    /// cancels the consumer if processing fails before the part is complete
    cancel: Option<future::AbortHandle>,
}

impl CurrentPart {
    fn discarded() -> Self {
        Self { id: None, sender: None, cancel: None }
    }
}

/// One run of [`Multipart::process`].
///
/// The run is complete once the tokenizer is drained and no consumer is in
/// flight, both conditions are checked together in [`Run::can_resolve`] after
/// either of them changes.
///
/// On a fatal error the consumer of the part being received is cancelled, while
/// consumers of parts that were received completely still run to completion
/// before the error is returned.
struct Run<'a> {
    multipart: &'a mut Multipart,
    events: Events,
    current: Option<CurrentPart>,
    /// chunk waiting for room in the current part's channel
    pending: Option<Result<Bytes, BodyParserError>>,
    handlers: HashMap<usize, PartHandler>,
    in_flight: FuturesUnordered<PartFuture>,
    next_id: usize,
    streamed_bytes: u64,
    drained: bool,
    failure: Option<BodyParserError>,
}

impl<'a> Run<'a> {
    fn new(multipart: &'a mut Multipart, events: Events) -> Self {
        Self {
            multipart,
            events,
            current: None,
            pending: None,
            handlers: HashMap::new(),
            in_flight: FuturesUnordered::new(),
            next_id: 0,
            streamed_bytes: 0,
            drained: false,
            failure: None,
        }
    }

    #[inline]
    fn can_resolve(&self) -> bool {
        self.drained && self.in_flight.is_empty()
    }

    fn poll_run(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), BodyParserError>> {
        loop {
            while let Poll::Ready(Some((id, result))) = self.in_flight.poll_next_unpin(cx) {
                self.finish_part(id, result);
            }

            // consumers may abort while being polled above
            if self.failure.is_none()
                && let Poll::Ready(Some(error)) = self.multipart.abort_receiver.poll_next_unpin(cx)
            {
                debug!("multipart processing aborted, {}", error);
                self.fail(error);
            }

            if self.failure.is_some() {
                if !self.in_flight.is_empty() {
                    return Poll::Pending;
                }
                if let Some(failure) = self.failure.take() {
                    return Poll::Ready(Err(failure));
                }
            }

            if self.can_resolve() {
                return Poll::Ready(Ok(()));
            }

            if let Some(item) = self.pending.take()
                && self.poll_deliver(item, cx).is_pending()
            {
                return Poll::Pending;
            }

            if self.drained {
                return Poll::Pending;
            }

            match self.events.poll_next_unpin(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if let Err(e) = self.on_event(event) {
                        self.fail(e);
                    }
                }
                Poll::Ready(Some(Err(e))) => self.fail(e),
                Poll::Ready(None) => {
                    trace!("multipart tokenizer drained");
                    self.drained = true;
                    self.current = None;
                }
                Poll::Pending => return Poll::Pending,
            }
        }
    }

    fn fail(&mut self, error: BodyParserError) {
        if let Some(current) = self.current.take()
            && let Some(cancel) = current.cancel
        {
            cancel.abort();
        }
        self.pending = None;
        if self.failure.is_none() {
            self.failure = Some(error);
        }
    }

    /// Hands a chunk to the current part, keeping it pending while the channel is full.
    fn poll_deliver(&mut self, item: Result<Bytes, BodyParserError>, cx: &mut Context<'_>) -> Poll<()> {
        let Some(current) = self.current.as_mut() else {
            return Poll::Ready(());
        };
        let Some(sender) = current.sender.as_mut() else {
            return Poll::Ready(());
        };

        match sender.poll_ready(cx) {
            Poll::Ready(Ok(())) => {
                if sender.start_send(item).is_err() {
                    current.sender = None;
                }
                Poll::Ready(())
            }
            Poll::Ready(Err(_disconnected)) => {
                // the consumer dropped its part, the rest of it is drained
                trace!("part receiver dropped, discarding remaining data");
                current.sender = None;
                Poll::Ready(())
            }
            Poll::Pending => {
                self.pending = Some(item);
                Poll::Pending
            }
        }
    }

    fn on_event(&mut self, event: MultipartEvent) -> Result<(), BodyParserError> {
        match event {
            MultipartEvent::Field { name, value } => {
                if name.is_empty() {
                    return Ok(());
                }
                let convert = self.multipart.config.convert_empty_strings_to_null;
                self.multipart.fields.add_text(&name, value, convert);
            }
            MultipartEvent::PartBegin(head) => self.begin_part(head),
            MultipartEvent::PartData(bytes) => self.part_data(bytes)?,
            MultipartEvent::PartEnd => self.current = None,
        }
        Ok(())
    }

    fn begin_part(&mut self, head: PartHead) {
        let PartHead { name, file_name, headers } = head;

        if name.is_empty() || file_name.is_empty() {
            trace!(name = %name, "discarding part without field name or file name");
            self.current = Some(CurrentPart::discarded());
            return;
        }

        let Some((options, consumer)) = self
            .multipart
            .registration(&name)
            .map(|registration| (registration.options.clone(), Arc::clone(&registration.consumer)))
        else {
            trace!(name = %name, "discarding part without consumer");
            self.current = Some(CurrentPart::discarded());
            return;
        };

        let file = MultipartFile::new(name.clone(), file_name.clone(), headers.clone(), &options.validation);
        let file = FileHandle::new(file);
        let handler = PartHandler::new(file.clone(), options.defer_validations);
        handler.begin();
        self.multipart.files.add(&name, file.clone());

        let id = self.next_id;
        self.next_id += 1;
        self.handlers.insert(id, handler);

        let (sender, receiver) = mpsc::channel(PART_CHANNEL_CAPACITY);
        let part = Part::new(name, file_name, headers, file, receiver);
        let (consume, cancel) = future::abortable(async move { consumer.consume(part).await });
        self.in_flight.push(
            async move {
                let result = consume.await.unwrap_or_else(|_aborted| {
                    Err(BodyParserError::invalid_multipart("processing failed before the part was received"))
                });
                (id, result)
            }
            .boxed(),
        );
        self.current = Some(CurrentPart { id: Some(id), sender: Some(sender), cancel: Some(cancel) });
    }

    fn part_data(&mut self, bytes: Bytes) -> Result<(), BodyParserError> {
        let Some(id) = self.current.as_ref().and_then(|current| current.id) else {
            return Ok(());
        };

        self.streamed_bytes += bytes.len() as u64;
        let limit = self.multipart.config.limit;
        if self.streamed_bytes > limit.as_u64() {
            return Err(BodyParserError::entity_too_large(format!("multipart limit {limit} exceeded")));
        }

        let item = match self.handlers.get_mut(&id) {
            Some(handler) => handler.report_progress(&bytes).map(|()| bytes),
            None => Ok(bytes),
        };
        self.pending = Some(item);
        Ok(())
    }

    fn finish_part(&mut self, id: usize, result: Result<PartMeta, BodyParserError>) {
        let Some(mut handler) = self.handlers.remove(&id) else {
            return;
        };

        match result {
            Ok(meta) => handler.report_success(meta),
            Err(e) => {
                if !e.is_stream_validation() {
                    warn!(field_name = %handler.file().field_name(), "part consumer failed, {}", e);
                }
                handler.report_error(&e);
            }
        }
    }
}

impl Future for Run<'_> {
    type Output = Result<(), BodyParserError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().poll_run(cx)
    }
}
