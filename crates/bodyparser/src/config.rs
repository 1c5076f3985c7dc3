//! Body parser configuration.
//!
//! Every struct deserializes with serde and falls back to sensible defaults for
//! missing keys, so a host application can embed a `[bodyparser]` table in its
//! own configuration file. Sizes accept either a byte count or a unit string.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use http::Method;
use serde::Deserialize;

use crate::size::ByteSize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BodyParserConfig {
    /// Methods whose bodies are parsed, bodies of other methods are ignored.
    #[serde(deserialize_with = "deserialize_methods")]
    pub allowed_methods: Vec<Method>,
    pub form: FormConfig,
    pub json: JsonConfig,
    pub raw: RawConfig,
    pub multipart: MultipartConfig,
}

impl Default for BodyParserConfig {
    fn default() -> Self {
        Self {
            allowed_methods: vec![Method::POST, Method::PUT, Method::PATCH, Method::DELETE],
            form: FormConfig::default(),
            json: JsonConfig::default(),
            raw: RawConfig::default(),
            multipart: MultipartConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FormConfig {
    pub types: Vec<String>,
    pub limit: ByteSize,
    pub convert_empty_strings_to_null: bool,
}

impl Default for FormConfig {
    fn default() -> Self {
        Self {
            types: vec![mime::APPLICATION_WWW_FORM_URLENCODED.to_string()],
            limit: ByteSize::mb(1),
            convert_empty_strings_to_null: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct JsonConfig {
    pub types: Vec<String>,
    pub limit: ByteSize,
    /// Only accept objects and arrays at the top level.
    pub strict: bool,
    pub convert_empty_strings_to_null: bool,
}

impl Default for JsonConfig {
    fn default() -> Self {
        Self {
            types: vec![
                mime::APPLICATION_JSON.to_string(),
                "application/json-patch+json".to_string(),
                "application/vnd.api+json".to_string(),
                "application/csp-report".to_string(),
            ],
            limit: ByteSize::mb(1),
            strict: true,
            convert_empty_strings_to_null: true,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RawConfig {
    pub types: Vec<String>,
    pub limit: ByteSize,
}

impl Default for RawConfig {
    fn default() -> Self {
        Self { types: vec!["text/*".to_string()], limit: ByteSize::mb(1) }
    }
}

/// Whether multipart bodies are streamed to temp files automatically.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum AutoProcess {
    Enabled(bool),
    /// Only the listed route patterns are processed automatically.
    Routes(Vec<String>),
}

impl Default for AutoProcess {
    fn default() -> Self {
        AutoProcess::Enabled(true)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MultipartConfig {
    pub types: Vec<String>,
    /// Ceiling for all streamed file bytes of one request combined.
    pub limit: ByteSize,
    /// Ceiling for the bytes of all non-file fields combined.
    pub fields_limit: ByteSize,
    pub max_fields: usize,
    pub auto_process: AutoProcess,
    /// Route patterns that are never auto processed, wins over `auto_process`.
    pub process_manually: Vec<String>,
    pub convert_empty_strings_to_null: bool,
    /// Directory used by the built-in temp file consumer, defaults to the OS temp dir.
    pub tmp_dir: Option<PathBuf>,
    #[serde(skip)]
    pub tmp_file_name: Option<TmpFileName>,
}

impl Default for MultipartConfig {
    fn default() -> Self {
        Self {
            types: vec![mime::MULTIPART_FORM_DATA.to_string()],
            limit: ByteSize::mb(20),
            fields_limit: ByteSize::mb(20),
            max_fields: 1000,
            auto_process: AutoProcess::default(),
            process_manually: vec![],
            convert_empty_strings_to_null: true,
            tmp_dir: None,
            tmp_file_name: None,
        }
    }
}

impl MultipartConfig {
    /// Decides whether a request on `route` is processed automatically.
    pub fn should_auto_process(&self, route: Option<&str>) -> bool {
        if let Some(route) = route {
            if self.process_manually.iter().any(|pattern| pattern == route) {
                return false;
            }
        }

        match &self.auto_process {
            AutoProcess::Enabled(enabled) => *enabled,
            AutoProcess::Routes(routes) => route.is_some_and(|route| routes.iter().any(|pattern| pattern == route)),
        }
    }

    /// Overrides how temp files are named.
    #[must_use]
    pub fn with_tmp_file_name<F>(mut self, f: F) -> Self
    where
        F: Fn() -> String + Send + Sync + 'static,
    {
        self.tmp_file_name = Some(TmpFileName(Arc::new(f)));
        self
    }
}

/// Naming policy for temp files written by the built-in consumer.
#[derive(Clone)]
pub struct TmpFileName(Arc<dyn Fn() -> String + Send + Sync>);

impl TmpFileName {
    pub fn generate(&self) -> String {
        (self.0)()
    }
}

impl fmt::Debug for TmpFileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TmpFileName(..)")
    }
}

fn deserialize_methods<'de, D>(deserializer: D) -> Result<Vec<Method>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let methods = Vec::<String>::deserialize(deserializer)?;
    methods
        .iter()
        .map(|method| method.to_ascii_uppercase().parse::<Method>().map_err(serde::de::Error::custom))
        .collect()
}
