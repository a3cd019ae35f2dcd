//! Compiler backend abstraction for transpilation.
//!
//! The dev server never calls SWC directly; it goes through
//! [`CompilerBackend`] so the transform pipeline can be exercised with any
//! backend.
//!
//! ```ignore
//! use swiftdev_core::compiler::{CompilerBackend, SwcBackend, TranspileSpec};
//!
//! let backend = SwcBackend::new();
//! let spec = TranspileSpec::new("App.tsx").with_sourcemaps(SourceMapKind::Inline);
//! let output = backend.transpile(&spec, source)?;
//! ```

pub mod spec;
pub mod swc;

pub use spec::{
    Diagnostic, DiagnosticSeverity, JsxRuntime, SourceMapKind, TranspileOutput, TranspileSpec,
};
pub use swc::SwcBackend;

use std::fmt;

/// Extensions (no dot) of source files lowered by the compiler, in the
/// order extensionless imports try them.
pub const SOURCE_EXTENSIONS: &[&str] = &["js", "jsx", "ts", "tsx", "mjs"];

/// Error during compilation.
#[derive(Debug)]
pub struct CompilerError {
    /// Stable error code.
    pub code: &'static str,
    pub message: String,
    pub diagnostics: Vec<Diagnostic>,
}

impl CompilerError {
    #[must_use]
    pub fn new(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            diagnostics: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_diagnostics(mut self, diagnostics: Vec<Diagnostic>) -> Self {
        self.diagnostics = diagnostics;
        self
    }

    #[must_use]
    pub fn parse_error(message: impl Into<String>) -> Self {
        Self::new("COMPILER_PARSE_ERROR", message)
    }

    #[must_use]
    pub fn transform_error(message: impl Into<String>) -> Self {
        Self::new("COMPILER_TRANSFORM_ERROR", message)
    }

    #[must_use]
    pub fn unsupported_file(message: impl Into<String>) -> Self {
        Self::new("COMPILER_UNSUPPORTED_FILE", message)
    }
}

impl fmt::Display for CompilerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        for diag in &self.diagnostics {
            write!(f, "\n  - {}: {}", diag.severity.as_str(), diag.message)?;
            if let (Some(file), Some(line), Some(col)) = (&diag.file, diag.line, diag.column) {
                write!(f, " at {}:{}:{}", file.display(), line, col)?;
            }
        }
        Ok(())
    }
}

impl std::error::Error for CompilerError {}

/// Lowers JS/TS/JSX source to a browser-ready ES module.
pub trait CompilerBackend: Send + Sync {
    /// Backend name, for logs.
    fn name(&self) -> &'static str;

    /// Transpile `source` according to `spec`.
    fn transpile(&self, spec: &TranspileSpec, source: &str)
        -> Result<TranspileOutput, CompilerError>;

    /// Whether files with this extension (no dot) can be transpiled.
    fn supports_extension(&self, ext: &str) -> bool {
        SOURCE_EXTENSIONS
            .iter()
            .any(|known| known.eq_ignore_ascii_case(ext))
    }
}
