//! Transpilation options and results.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// JSX runtime mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum JsxRuntime {
    /// Classic JSX transform (`React.createElement`).
    Classic,
    /// Automatic JSX transform (`react/jsx-runtime`).
    #[default]
    Automatic,
}

impl JsxRuntime {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Classic => "classic",
            Self::Automatic => "automatic",
        }
    }
}

impl std::fmt::Display for JsxRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Source map generation mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SourceMapKind {
    /// No source map.
    #[default]
    None,
    /// Appended to the code as a base64 data URL.
    Inline,
    /// Returned separately in [`TranspileOutput::source_map`].
    External,
}

/// Diagnostic severity level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticSeverity {
    Warning,
    Error,
}

impl DiagnosticSeverity {
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }
}

/// A compiler diagnostic message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub severity: DiagnosticSeverity,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    /// 1-indexed line.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    /// 1-indexed column.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

impl Diagnostic {
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            severity: DiagnosticSeverity::Error,
            message: message.into(),
            file: None,
            line: None,
            column: None,
        }
    }

    #[must_use]
    pub fn with_location(mut self, file: PathBuf, line: u32, column: u32) -> Self {
        self.file = Some(file);
        self.line = Some(line);
        self.column = Some(column);
        self
    }
}

/// What to compile and how.
///
/// The output is always an ES module; only syntax lowering and map
/// emission vary.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TranspileSpec {
    /// Path of the source file. Its extension selects the syntax and its
    /// file name is recorded in the source map.
    pub input_path: PathBuf,
    #[serde(default)]
    pub jsx_runtime: JsxRuntime,
    #[serde(default)]
    pub sourcemaps: SourceMapKind,
}

impl TranspileSpec {
    #[must_use]
    pub fn new(input_path: impl Into<PathBuf>) -> Self {
        Self {
            input_path: input_path.into(),
            jsx_runtime: JsxRuntime::default(),
            sourcemaps: SourceMapKind::default(),
        }
    }

    #[must_use]
    pub fn with_jsx_runtime(mut self, runtime: JsxRuntime) -> Self {
        self.jsx_runtime = runtime;
        self
    }

    #[must_use]
    pub fn with_sourcemaps(mut self, sourcemaps: SourceMapKind) -> Self {
        self.sourcemaps = sourcemaps;
        self
    }

    /// Lowercased extension of the input, or `""`.
    #[must_use]
    pub fn extension(&self) -> String {
        extension_of(&self.input_path)
    }
}

pub(crate) fn extension_of(path: &Path) -> String {
    path.extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default()
}

/// Output from a successful transpilation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranspileOutput {
    /// Emitted JavaScript. With [`SourceMapKind::Inline`] this already ends in
    /// a `sourceMappingURL` comment.
    pub code: String,
    /// Source map JSON, for [`SourceMapKind::External`].
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_map: Option<String>,
}

impl TranspileOutput {
    #[must_use]
    pub fn new(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            source_map: None,
        }
    }

    #[must_use]
    pub fn with_source_map(mut self, source_map: impl Into<String>) -> Self {
        self.source_map = Some(source_map.into());
        self
    }
}
