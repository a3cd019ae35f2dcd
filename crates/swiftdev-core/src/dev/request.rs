//! Module requests: mapping browser URLs onto the served root.
//!
//! URLs are root-relative, so `/src/App.jsx` names `<root>/src/App.jsx`.

use percent_encoding::percent_decode_str;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;

/// Request rejected before touching the filesystem.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RequestError {
    #[error("path escapes the served root: {0}")]
    EscapesRoot(String),

    #[error("path is not valid percent-encoded UTF-8: {0}")]
    InvalidEncoding(String),
}

/// A parsed module request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleRequest {
    /// Normalized URL path, always starting with `/`.
    pub url_path: String,
    /// `?import` was present: the caller wants the URL as a string export.
    pub import_only: bool,
}

impl ModuleRequest {
    /// Parse a request path and raw query string.
    ///
    /// Query keys other than `import` (notably the `t` cache-busting token)
    /// do not affect resolution.
    pub fn parse(path: &str, query: Option<&str>) -> Result<Self, RequestError> {
        let decoded = percent_decode_str(path)
            .decode_utf8()
            .map_err(|_| RequestError::InvalidEncoding(path.to_string()))?
            .into_owned();
        let url_path =
            normalize_url_path(&decoded).ok_or_else(|| RequestError::EscapesRoot(decoded))?;
        Ok(Self {
            url_path,
            import_only: query.is_some_and(has_import_flag),
        })
    }

    /// Lowercased extension of the path, or `""`.
    #[must_use]
    pub fn extension(&self) -> String {
        url_extension(&self.url_path)
    }

    /// The file this request names under `root`.
    #[must_use]
    pub fn file_path(&self, root: &Path) -> PathBuf {
        root.join(self.url_path.trim_start_matches('/'))
    }
}

/// Whether a raw query string carries the `import` key.
#[must_use]
pub fn has_import_flag(query: &str) -> bool {
    query
        .split('&')
        .any(|pair| pair.split('=').next() == Some("import"))
}

/// Lowercased extension of the last URL segment, or `""`.
#[must_use]
pub fn url_extension(url_path: &str) -> String {
    let name = url_path.rsplit('/').next().unwrap_or(url_path);
    match name.rfind('.') {
        Some(idx) if idx > 0 => name[idx + 1..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// Collapse `.`, `..` and empty segments of a `/`-separated path.
///
/// Returns `None` when `..` would climb above the root. The result always
/// starts with `/` and never ends with one (except the root itself).
#[must_use]
pub fn normalize_url_path(path: &str) -> Option<String> {
    let mut segments: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop()?;
            }
            s => segments.push(s),
        }
    }
    Some(format!("/{}", segments.join("/")))
}

/// Root-relative URL for a file on disk ("/" + short name).
///
/// Returns `None` for paths outside `root`.
#[must_use]
pub fn url_path_for(root: &Path, file: &Path) -> Option<String> {
    let rel = file.strip_prefix(root).ok()?;
    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(format!("/{}", parts.join("/")))
}
