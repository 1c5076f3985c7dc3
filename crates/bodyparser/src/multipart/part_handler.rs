use bytes::BytesMut;
use tracing::{debug, trace};

use crate::error::BodyParserError;
use crate::multipart::consumer::PartMeta;
use crate::multipart::file::{FileHandle, FileState};
use crate::multipart::file_type::{self, SNIFF_BYTES};

/// Drives one file part from its first byte to the end of its stream.
///
/// Every `report_*` method is a no-op unless the file is streaming, so a
/// terminal event that fires twice cannot change the outcome.
#[derive(Debug)]
pub(crate) struct PartHandler {
    file: FileHandle,
    /// leading bytes kept for type detection, released once a type is known
    buffer: BytesMut,
    emitted_validation_error: bool,
    defer_validations: bool,
}

impl PartHandler {
    pub(crate) fn new(file: FileHandle, defer_validations: bool) -> Self {
        Self { file, buffer: BytesMut::new(), emitted_validation_error: false, defer_validations }
    }

    #[inline]
    pub(crate) fn file(&self) -> &FileHandle {
        &self.file
    }

    pub(crate) fn begin(&self) {
        self.file.lock().begin_streaming();
    }

    /// Accounts for one chunk of file data.
    ///
    /// Returns `Err(BodyParserError::StreamValidation)` the first time a
    /// validator fails, later failures of the same part are not signalled again.
    pub(crate) fn report_progress(&mut self, chunk: &[u8]) -> Result<(), BodyParserError> {
        let mut file = self.file.lock();
        if file.state() != FileState::Streaming {
            return Ok(());
        }

        file.add_size(chunk.len());

        if !file.has_file_type() {
            let take = chunk.len().min(SNIFF_BYTES.saturating_sub(self.buffer.len()));
            self.buffer.extend_from_slice(&chunk[..take]);

            if let Some(detected) = file_type::detect(&self.buffer, file.client_name(), file.headers(), false) {
                trace!(field_name = file.field_name(), ext = %detected.ext, "detected file type");
                file.set_file_type(detected);
                self.buffer = BytesMut::new();
            }
        }

        if self.defer_validations {
            return Ok(());
        }

        let errors = file.errors().len();
        file.validate();
        if file.errors().len() > errors && !self.emitted_validation_error {
            self.emitted_validation_error = true;
            debug!(field_name = file.field_name(), "file failed validation while streaming");
            return Err(BodyParserError::StreamValidation);
        }

        Ok(())
    }

    /// Finalizes the file after its consumer failed.
    pub(crate) fn report_error(&mut self, error: &BodyParserError) {
        let mut file = self.file.lock();
        if file.state() != FileState::Streaming {
            return;
        }

        file.mark_consumed();
        if !(error.is_stream_validation() && self.emitted_validation_error) {
            file.push_fatal(error.to_string());
        }
    }

    /// Finalizes the file after its consumer succeeded.
    pub(crate) fn report_success(&mut self, meta: PartMeta) {
        let mut file = self.file.lock();
        if file.state() != FileState::Streaming {
            return;
        }

        if !file.has_file_type() {
            if let Some(detected) = file_type::detect(&self.buffer, file.client_name(), file.headers(), true) {
                file.set_file_type(detected);
            }
            self.buffer = BytesMut::new();
        }

        file.absorb(meta);
        file.mark_consumed();

        if !self.defer_validations {
            file.validate();
        }
    }
}
