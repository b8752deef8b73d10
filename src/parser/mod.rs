//! Format parsers — raw resource bytes to flat key/value layers
//!
//! Every parser produces a `ConfigMap` whose keys are `:`-delimited paths
//! (`Logging:LogLevel:Default`). A parse either returns the complete map or
//! fails; callers never see a partial key set.

pub mod ini;
pub mod json;

pub use ini::IniParser;
pub use json::JsonParser;

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

/// Separator between path segments in flattened keys
pub const KEY_DELIMITER: &str = ":";

/// Flat, path-delimited key → value mapping
pub type ConfigMap = BTreeMap<String, String>;

/// Parser failure. The whole document is rejected.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// Input is not valid UTF-8
    #[error("input is not valid UTF-8: {0}")]
    InvalidUtf8(#[from] std::str::Utf8Error),

    /// Malformed JSON document
    #[error("invalid JSON: {0}")]
    Json(String),

    /// JSON document whose top-level element is not an object
    #[error("top-level JSON element must be an object")]
    InvalidRoot,

    /// The same key appears twice in one document
    #[error("duplicate key '{0}'")]
    DuplicateKey(String),

    /// INI line that is neither a section, a comment nor a `key=value` pair
    #[error("unrecognized line format at line {line}: '{content}'")]
    UnrecognizedLine { line: usize, content: String },
}

/// Turns the raw bytes of one resource into a flat key/value layer
pub trait ConfigurationParser: Send + Sync {
    /// Parse the complete document
    fn parse(&self, input: &[u8]) -> std::result::Result<ConfigMap, ParseError>;

    /// Registry name of this parser (e.g. "json")
    fn name(&self) -> &str;
}

/// Join a key prefix and a segment with the key delimiter
pub(crate) fn join_key(prefix: &str, segment: &str) -> String {
    if prefix.is_empty() {
        segment.to_string()
    } else {
        format!("{}{}{}", prefix, KEY_DELIMITER, segment)
    }
}

/// Strip a leading UTF-8 byte order mark
pub(crate) fn strip_bom(input: &[u8]) -> &[u8] {
    input.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(input)
}

/// Explicit name → parser table
///
/// Resources pick their parser by name; names are matched case-insensitively.
#[derive(Clone)]
pub struct ParserRegistry {
    parsers: HashMap<String, Arc<dyn ConfigurationParser>>,
}

impl ParserRegistry {
    /// Name of the parser used when a resource does not name one
    pub const DEFAULT: &'static str = "json";

    /// Registry with no parsers
    pub fn empty() -> Self {
        Self {
            parsers: HashMap::new(),
        }
    }

    /// Registry with the built-in `json` and `ini` parsers
    pub fn with_defaults() -> Self {
        let mut registry = Self::empty();
        registry.register(Arc::new(JsonParser));
        registry.register(Arc::new(IniParser));
        registry
    }

    /// Register (or replace) a parser under its own name
    pub fn register(&mut self, parser: Arc<dyn ConfigurationParser>) {
        self.parsers
            .insert(parser.name().to_ascii_lowercase(), parser);
    }

    /// Look up a parser by name
    pub fn get(&self, name: &str) -> Option<Arc<dyn ConfigurationParser>> {
        self.parsers.get(&name.to_ascii_lowercase()).cloned()
    }

    /// Whether a parser is registered under `name`
    pub fn contains(&self, name: &str) -> bool {
        self.parsers.contains_key(&name.to_ascii_lowercase())
    }

    /// Registered parser names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.parsers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::with_defaults()
    }
}

impl std::fmt::Debug for ParserRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParserRegistry")
            .field("parsers", &self.names())
            .finish()
    }
}

/// Parser name implied by a local file's extension: `.ini` → ini, anything else → json
pub fn parser_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .as_deref()
    {
        Some("ini") => "ini",
        _ => ParserRegistry::DEFAULT,
    }
}
