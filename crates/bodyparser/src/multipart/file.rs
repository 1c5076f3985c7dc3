//! The record of one uploaded file.
//!
//! A [`MultipartFile`] is created as soon as its part header has been parsed and
//! is shared through a [`FileHandle`] between the file collection, the part
//! handler that streams into it and the consumer writing it somewhere. It is
//! mutated while bytes arrive and becomes read-mostly once consumed.

use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use http::HeaderMap;
use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize, Serializer};
use serde_json::json;
use tracing::debug;

use crate::error::BodyParserError;
use crate::multipart::consumer::PartMeta;
use crate::multipart::file_type::FileType;
use crate::multipart::validator::{ExtensionValidator, SizeValidator};
use crate::size::ByteSize;

/// Lifecycle of a file, transitions only move forward.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FileState {
    Idle,
    Streaming,
    Consumed,
    Moved,
}

impl FileState {
    /// Whether all bytes of the file have been received.
    #[inline]
    pub fn is_final(self) -> bool {
        matches!(self, FileState::Consumed | FileState::Moved)
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationErrorKind {
    Size,
    Extname,
    Fatal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileValidationError {
    pub field_name: String,
    pub client_name: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: ValidationErrorKind,
}

/// Per-file constraints, both optional.
#[derive(Debug, Default, Clone, Deserialize)]
#[serde(default)]
pub struct FileValidationOptions {
    pub size: Option<ByteSize>,
    pub extnames: Option<Vec<String>>,
}

impl FileValidationOptions {
    #[must_use]
    pub fn size(mut self, size: ByteSize) -> Self {
        self.size = Some(size);
        self
    }

    #[must_use]
    pub fn extnames<I, S>(mut self, extnames: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.extnames = Some(extnames.into_iter().map(Into::into).collect());
        self
    }
}

/// Options of [`FileHandle::move_to`].
#[derive(Debug, Clone)]
pub struct MoveOptions {
    /// File name at the destination, defaults to the client name.
    pub name: Option<String>,
    pub overwrite: bool,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self { name: None, overwrite: true }
    }
}

#[derive(Debug)]
pub struct MultipartFile {
    field_name: String,
    client_name: String,
    headers: HeaderMap,
    size: u64,
    file_type: Option<FileType>,
    errors: Vec<FileValidationError>,
    state: FileState,
    tmp_path: Option<PathBuf>,
    file_path: Option<PathBuf>,
    file_name: Option<String>,
    meta: serde_json::Value,
    size_validator: SizeValidator,
    extension_validator: ExtensionValidator,
}

impl MultipartFile {
    pub fn new(field_name: String, client_name: String, headers: HeaderMap, options: &FileValidationOptions) -> Self {
        Self {
            field_name,
            client_name,
            headers,
            size: 0,
            file_type: None,
            errors: vec![],
            state: FileState::Idle,
            tmp_path: None,
            file_path: None,
            file_name: None,
            meta: serde_json::Value::Null,
            size_validator: SizeValidator::new(options.size),
            extension_validator: ExtensionValidator::new(options.extnames.as_deref()),
        }
    }

    #[inline]
    pub fn field_name(&self) -> &str {
        &self.field_name
    }

    #[inline]
    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    #[inline]
    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    #[inline]
    pub fn size(&self) -> u64 {
        self.size
    }

    #[inline]
    pub fn state(&self) -> FileState {
        self.state
    }

    pub fn extname(&self) -> Option<&str> {
        self.file_type.as_ref().map(|file_type| file_type.ext.as_str())
    }

    pub fn type_(&self) -> Option<&str> {
        self.file_type.as_ref().map(|file_type| file_type.type_.as_str())
    }

    pub fn subtype(&self) -> Option<&str> {
        self.file_type.as_ref().map(|file_type| file_type.subtype.as_str())
    }

    #[inline]
    pub fn errors(&self) -> &[FileValidationError] {
        &self.errors
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Whether both validators have reached a verdict.
    #[inline]
    pub fn is_validated(&self) -> bool {
        self.size_validator.is_validated() && self.extension_validator.is_validated()
    }

    #[inline]
    pub fn tmp_path(&self) -> Option<&Path> {
        self.tmp_path.as_deref()
    }

    #[inline]
    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    #[inline]
    pub fn file_name(&self) -> Option<&str> {
        self.file_name.as_deref()
    }

    /// Metadata returned by the consumer that wrote this file.
    #[inline]
    pub fn meta(&self) -> &serde_json::Value {
        &self.meta
    }

    #[inline]
    pub fn size_limit(&self) -> Option<ByteSize> {
        self.size_validator.limit()
    }

    #[inline]
    pub fn allowed_extensions(&self) -> Option<&[String]> {
        self.extension_validator.allowed()
    }

    pub fn set_size_limit(&mut self, limit: ByteSize) -> Result<(), BodyParserError> {
        self.size_validator.set_limit(limit)
    }

    pub fn set_allowed_extensions<I, S>(&mut self, extnames: I) -> Result<(), BodyParserError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.extension_validator.set_allowed(extnames)
    }

    /// Applies the constraints that are present in `options`.
    pub fn apply_options(&mut self, options: &FileValidationOptions) -> Result<(), BodyParserError> {
        if let Some(size) = options.size {
            self.set_size_limit(size)?;
        }
        if let Some(extnames) = &options.extnames {
            self.set_allowed_extensions(extnames)?;
        }
        Ok(())
    }

    /// Runs both validators, recording any new failure.
    pub fn validate(&mut self) {
        if let Some(message) = self.size_validator.validate(self.state, self.size) {
            self.push_error(message, ValidationErrorKind::Size);
        }

        let extname = self.file_type.as_ref().map(|file_type| file_type.ext.as_str());
        if let Some(message) = self.extension_validator.validate(self.state, extname) {
            self.push_error(message, ValidationErrorKind::Extname);
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        json!({
            "field_name": self.field_name,
            "client_name": self.client_name,
            "size": self.size,
            "file_path": self.file_path,
            "file_name": self.file_name,
            "type": self.type_(),
            "extname": self.extname(),
            "subtype": self.subtype(),
            "state": self.state,
            "is_valid": self.is_valid(),
            "validated": self.is_validated(),
            "errors": self.errors,
            "meta": self.meta,
        })
    }

    pub(crate) fn begin_streaming(&mut self) {
        if self.state == FileState::Idle {
            self.state = FileState::Streaming;
        }
    }

    pub(crate) fn add_size(&mut self, len: usize) {
        self.size += len as u64;
    }

    #[inline]
    pub(crate) fn has_file_type(&self) -> bool {
        self.file_type.is_some()
    }

    pub(crate) fn set_file_type(&mut self, file_type: FileType) {
        if self.file_type.is_none() {
            self.file_type = Some(file_type);
        }
    }

    pub(crate) fn mark_consumed(&mut self) {
        if self.state < FileState::Consumed {
            self.state = FileState::Consumed;
        }
    }

    pub(crate) fn push_fatal(&mut self, message: String) {
        self.push_error(message, ValidationErrorKind::Fatal);
    }

    pub(crate) fn absorb(&mut self, meta: PartMeta) {
        if let Some(tmp_path) = meta.tmp_path {
            self.tmp_path = Some(tmp_path);
        }
        if !meta.meta.is_null() {
            self.meta = meta.meta;
        }
    }

    fn push_error(&mut self, message: String, kind: ValidationErrorKind) {
        self.errors.push(FileValidationError {
            field_name: self.field_name.clone(),
            client_name: self.client_name.clone(),
            message,
            kind,
        });
    }
}

/// Shared handle to a [`MultipartFile`].
///
/// Guards returned by [`FileHandle::lock`] must not be held across an `.await`.
#[derive(Clone)]
pub struct FileHandle(Arc<Mutex<MultipartFile>>);

impl FileHandle {
    pub fn new(file: MultipartFile) -> Self {
        Self(Arc::new(Mutex::new(file)))
    }

    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, MultipartFile> {
        self.0.lock()
    }

    pub fn field_name(&self) -> String {
        self.lock().field_name.clone()
    }

    pub fn client_name(&self) -> String {
        self.lock().client_name.clone()
    }

    pub fn size(&self) -> u64 {
        self.lock().size
    }

    pub fn state(&self) -> FileState {
        self.lock().state
    }

    pub fn extname(&self) -> Option<String> {
        self.lock().extname().map(str::to_string)
    }

    pub fn tmp_path(&self) -> Option<PathBuf> {
        self.lock().tmp_path.clone()
    }

    pub fn file_path(&self) -> Option<PathBuf> {
        self.lock().file_path.clone()
    }

    pub fn errors(&self) -> Vec<FileValidationError> {
        self.lock().errors.clone()
    }

    pub fn is_valid(&self) -> bool {
        self.lock().is_valid()
    }

    pub fn validate(&self) {
        self.lock().validate();
    }

    pub fn set_size_limit(&self, limit: ByteSize) -> Result<(), BodyParserError> {
        self.lock().set_size_limit(limit)
    }

    pub fn set_allowed_extensions<I, S>(&self, extnames: I) -> Result<(), BodyParserError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.lock().set_allowed_extensions(extnames)
    }

    pub fn to_json(&self) -> serde_json::Value {
        self.lock().to_json()
    }

    /// Moves the temp file to `location`, named after `options.name` or the client name.
    ///
    /// Fails with [`BodyParserError::MissingTmpPath`] when no consumer has written
    /// the file to disk, and with [`BodyParserError::DestinationExists`] when the
    /// target exists and `options.overwrite` is off.
    pub async fn move_to<P: AsRef<Path>>(&self, location: P, options: MoveOptions) -> Result<(), BodyParserError> {
        let (tmp_path, file_name) = {
            let file = self.lock();
            let tmp_path = file.tmp_path.clone().ok_or(BodyParserError::MissingTmpPath)?;
            (tmp_path, options.name.unwrap_or_else(|| file.client_name.clone()))
        };

        let location = location.as_ref();
        let destination = location.join(&file_name);

        if !options.overwrite && tokio::fs::try_exists(&destination).await? {
            return Err(BodyParserError::destination_exists(file_name, location));
        }

        tokio::fs::create_dir_all(location).await?;
        if let Err(e) = tokio::fs::rename(&tmp_path, &destination).await {
            if e.kind() != io::ErrorKind::CrossesDevices {
                return Err(e.into());
            }
            debug!(from = %tmp_path.display(), to = %destination.display(), "rename crosses devices, copying instead");
            tokio::fs::copy(&tmp_path, &destination).await?;
            tokio::fs::remove_file(&tmp_path).await?;
        }

        let mut file = self.lock();
        debug!(field_name = %file.field_name, to = %destination.display(), "moved uploaded file");
        file.file_name = Some(file_name);
        file.file_path = Some(destination);
        file.state = FileState::Moved;
        Ok(())
    }
}

impl fmt::Debug for FileHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.lock(), f)
    }
}

impl PartialEq for FileHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl Eq for FileHandle {}

impl Serialize for FileHandle {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_json().serialize(serializer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(options: &FileValidationOptions) -> MultipartFile {
        MultipartFile::new("avatar".into(), "me.png".into(), HeaderMap::new(), options)
    }

    fn png() -> FileType {
        FileType { ext: "png".into(), type_: "image".into(), subtype: "png".into() }
    }

    #[test]
    fn test_validate_consumed_file() {
        let options = FileValidationOptions::default().size(ByteSize::b(10)).extnames(["jpg"]);
        let mut file = file(&options);
        file.begin_streaming();
        file.add_size(20);
        file.set_file_type(png());
        file.mark_consumed();

        file.validate();
        let kinds: Vec<_> = file.errors().iter().map(|error| error.kind).collect();
        assert_eq!(kinds, vec![ValidationErrorKind::Size, ValidationErrorKind::Extname]);
        assert_eq!(file.errors()[0].field_name, "avatar");
        assert_eq!(file.errors()[1].message, "Invalid file extension png. Only jpg is allowed");

        file.validate();
        assert_eq!(file.errors().len(), 2);
        assert!(!file.is_valid());
    }

    #[test]
    fn test_valid_file() {
        let options = FileValidationOptions::default().size(ByteSize::kb(1)).extnames(["PNG"]);
        let mut file = file(&options);
        file.begin_streaming();
        file.add_size(20);
        file.set_file_type(png());
        file.mark_consumed();

        file.validate();
        assert!(file.is_valid());
        assert!(file.is_validated());
    }

    #[test]
    fn test_file_type_is_set_once() {
        let mut file = file(&FileValidationOptions::default());
        file.set_file_type(png());
        file.set_file_type(FileType { ext: "jpg".into(), type_: "image".into(), subtype: "jpeg".into() });
        assert_eq!(file.extname(), Some("png"));
    }

    #[test]
    fn test_state_only_moves_forward() {
        let mut file = file(&FileValidationOptions::default());
        file.mark_consumed();
        file.begin_streaming();
        assert_eq!(file.state(), FileState::Consumed);
    }

    #[test]
    fn test_to_json() {
        let mut file = file(&FileValidationOptions::default());
        file.set_file_type(png());
        let value = file.to_json();
        assert_eq!(value["field_name"], "avatar");
        assert_eq!(value["extname"], "png");
        assert_eq!(value["state"], "idle");
        assert_eq!(value["is_valid"], true);
    }

    #[tokio::test]
    async fn test_move_without_tmp_path() {
        let handle = FileHandle::new(file(&FileValidationOptions::default()));
        let dir = tempfile::tempdir().unwrap();
        let result = handle.move_to(dir.path(), MoveOptions::default()).await;
        assert!(matches!(result, Err(BodyParserError::MissingTmpPath)));
    }

    #[tokio::test]
    async fn test_move_to() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_path = dir.path().join("upload-tmp");
        tokio::fs::write(&tmp_path, b"hello").await.unwrap();

        let mut record = file(&FileValidationOptions::default());
        record.absorb(PartMeta::from_tmp_path(tmp_path.clone()));
        let handle = FileHandle::new(record);

        let destination = dir.path().join("uploads");
        handle.move_to(&destination, MoveOptions::default()).await.unwrap();

        assert_eq!(handle.state(), FileState::Moved);
        assert_eq!(handle.file_path(), Some(destination.join("me.png")));
        assert_eq!(tokio::fs::read(destination.join("me.png")).await.unwrap(), b"hello");
        assert!(!tmp_path.exists());
    }

    #[tokio::test]
    async fn test_move_without_overwrite() {
        let dir = tempfile::tempdir().unwrap();
        let tmp_path = dir.path().join("upload-tmp");
        tokio::fs::write(&tmp_path, b"new").await.unwrap();
        tokio::fs::write(dir.path().join("taken.png"), b"old").await.unwrap();

        let mut record = file(&FileValidationOptions::default());
        record.absorb(PartMeta::from_tmp_path(tmp_path.clone()));
        let handle = FileHandle::new(record);

        let options = MoveOptions { name: Some("taken.png".into()), overwrite: false };
        let result = handle.move_to(dir.path(), options).await;
        assert!(matches!(result, Err(BodyParserError::DestinationExists { .. })));
        assert!(tmp_path.exists());

        let options = MoveOptions { name: Some("taken.png".into()), overwrite: true };
        handle.move_to(dir.path(), options).await.unwrap();
        assert_eq!(tokio::fs::read(dir.path().join("taken.png")).await.unwrap(), b"new");
        assert_eq!(handle.lock().file_name(), Some("taken.png"));
    }
}
