//! Per-request module transformation.
//!
//! Code files go through transpile → import rewrite → pre-bundle wait.
//! Stylesheets and JSON become small JS modules. Results are cached per URL
//! until the watcher invalidates them.

use super::deps::{DepCache, PackageWaiter};
use super::prebundle::{PreBundler, PrebundleError};
use super::request::url_extension;
use super::rewrite::ImportRewriter;
use crate::compiler::{CompilerBackend, CompilerError, JsxRuntime, SourceMapKind, TranspileSpec};
use crate::config::DevConfig;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use thiserror::Error;
use tracing::debug;

/// Content type of every transformed module.
pub const JS_CONTENT_TYPE: &str = "application/javascript";

/// Error from transforming one module.
#[derive(Debug, Error)]
pub enum TransformError {
    #[error("module not found: {path}")]
    NotFound { path: String },

    #[error("failed to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Compile(#[from] CompilerError),

    #[error("invalid JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Prebundle(#[from] PrebundleError),

    #[error("no transform for {path}")]
    Unsupported { path: String },
}

/// A module ready to serve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransformedModule {
    pub code: String,
    pub content_type: &'static str,
    /// The file the module was produced from.
    pub file_path: PathBuf,
}

/// Turns source files into browser-ready ES modules.
pub struct ModuleTransformer {
    root: PathBuf,
    jsx_runtime: JsxRuntime,
    rewriter: ImportRewriter,
    backend: Arc<dyn CompilerBackend>,
    deps: Arc<DepCache>,
    prebundler: Arc<PreBundler>,
    cache: RwLock<HashMap<String, Arc<TransformedModule>>>,
    /// Bumped on every invalidation; a transform that started before the
    /// bump is not cached.
    epoch: AtomicU64,
}

impl ModuleTransformer {
    #[must_use]
    pub fn new(
        root: PathBuf,
        config: &DevConfig,
        backend: Arc<dyn CompilerBackend>,
        deps: Arc<DepCache>,
        prebundler: Arc<PreBundler>,
    ) -> Self {
        Self {
            rewriter: ImportRewriter::new(root.clone(), config),
            root,
            jsx_runtime: config.jsx,
            backend,
            deps,
            prebundler,
            cache: RwLock::new(HashMap::new()),
            epoch: AtomicU64::new(0),
        }
    }

    /// Whether requests with this extension are transformed.
    #[must_use]
    pub fn handles_extension(&self, ext: &str) -> bool {
        matches!(ext, "css" | "json") || self.backend.supports_extension(ext)
    }

    /// Transform the module at `url_path` (normalized, root-relative).
    pub async fn transform(&self, url_path: &str) -> Result<Arc<TransformedModule>, TransformError> {
        if let Some(cached) = self.cached(url_path) {
            return Ok(cached);
        }
        let epoch = self.epoch.load(Ordering::Acquire);

        let ext = url_extension(url_path);
        if !self.handles_extension(&ext) {
            return Err(TransformError::Unsupported {
                path: url_path.to_string(),
            });
        }

        let file_path = self.root.join(url_path.trim_start_matches('/'));
        let source = read_source(url_path, &file_path).await?;

        let code = match ext.as_str() {
            "css" => css_module(url_path, &source),
            "json" => json_module(&source).map_err(|source| TransformError::Json {
                path: url_path.to_string(),
                source,
            })?,
            _ => self.transform_code(url_path, &file_path, &source).await?,
        };

        let module = Arc::new(TransformedModule {
            code,
            content_type: JS_CONTENT_TYPE,
            file_path,
        });

        if self.epoch.load(Ordering::Acquire) == epoch {
            self.cache
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(url_path.to_string(), Arc::clone(&module));
        }
        Ok(module)
    }

    async fn transform_code(
        &self,
        url_path: &str,
        file_path: &Path,
        source: &str,
    ) -> Result<String, TransformError> {
        let spec = TranspileSpec::new(file_path)
            .with_jsx_runtime(self.jsx_runtime)
            .with_sourcemaps(SourceMapKind::Inline);
        let output = self.backend.transpile(&spec, source)?;

        let rewritten = self.rewriter.rewrite(&output.code, url_path, &self.deps);

        if !rewritten.discovered.is_empty() {
            let prebundler = Arc::clone(&self.prebundler);
            let tickets = rewritten.discovered;
            tokio::spawn(async move { prebundler.bundle_batch(tickets).await });
        }
        if !rewritten.waiters.is_empty() {
            debug!(path = url_path, packages = rewritten.waiters.len(), "waiting for pre-bundle");
            futures::future::try_join_all(rewritten.waiters.into_iter().map(PackageWaiter::wait))
                .await?;
        }

        Ok(rewritten.code)
    }

    fn cached(&self, url_path: &str) -> Option<Arc<TransformedModule>> {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(url_path)
            .cloned()
    }

    /// Drop the cached module for `url_path`.
    pub fn invalidate(&self, url_path: &str) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        let removed = self
            .cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url_path);
        if removed.is_some() {
            debug!(path = url_path, "invalidated module");
        }
    }

    /// Drop every cached module.
    ///
    /// Used when files appear or disappear, since extension elision can
    /// change what an unchanged importer resolves to.
    pub fn invalidate_all(&self) {
        self.epoch.fetch_add(1, Ordering::AcqRel);
        self.cache
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
    }

    /// Number of cached modules.
    #[must_use]
    pub fn cached_len(&self) -> usize {
        self.cache
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

async fn read_source(url_path: &str, file_path: &Path) -> Result<String, TransformError> {
    match tokio::fs::read_to_string(file_path).await {
        Ok(source) => Ok(source),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(TransformError::NotFound {
            path: url_path.to_string(),
        }),
        Err(source) => Err(TransformError::Io {
            path: file_path.to_path_buf(),
            source,
        }),
    }
}

/// `s` as a double-quoted JS string literal.
#[must_use]
pub fn js_string(s: &str) -> String {
    serde_json::Value::String(s.to_owned()).to_string()
}

/// A module that injects `css` into the page, replacing any earlier
/// version of the same stylesheet.
#[must_use]
pub fn css_module(url_path: &str, css: &str) -> String {
    format!(
        "const __path = {path};\n\
         const __css = {css};\n\
         for (const el of document.querySelectorAll('style[data-swiftdev-path]')) {{\n  \
           if (el.getAttribute('data-swiftdev-path') === __path) el.remove();\n\
         }}\n\
         const __style = document.createElement('style');\n\
         __style.setAttribute('data-swiftdev-path', __path);\n\
         __style.textContent = __css;\n\
         document.head.appendChild(__style);\n\
         export default __css;\n",
        path = js_string(url_path),
        css = js_string(css),
    )
}

/// `export default <json>;`
pub fn json_module(text: &str) -> Result<String, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(text)?;
    Ok(format!("export default {value};\n"))
}

/// The `?import` stub: the asset's own URL as the default export.
#[must_use]
pub fn asset_module(request_path: &str) -> String {
    format!("export default {};\n", js_string(request_path))
}
