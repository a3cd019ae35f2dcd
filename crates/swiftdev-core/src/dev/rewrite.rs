//! Import specifier rewriting for browser-native ES modules.
//!
//! Browsers only load URLs, so every specifier in a served module is
//! rewritten to one:
//!
//! ```text
//! import React from 'react'         → import React from '/.cache/react/index.js'
//! import App from './App'           → import App from '/src/App.jsx'
//! import logo from './logo.svg'     → import logo from '/src/logo.svg?import'
//! import './index.css'              → import '/src/index.css'
//! ```

use super::deps::{DepCache, Discovery, PackageTicket, PackageWaiter};
use super::prebundle::{has_url_scheme, is_bare_specifier};
use super::request::{normalize_url_path, url_extension};
use crate::compiler::SOURCE_EXTENSIONS;
use crate::config::DevConfig;
use crate::imports::scan_import_clauses;
use std::collections::HashSet;
use std::path::PathBuf;
use tracing::trace;

/// How a specifier is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecifierKind {
    /// `./x`, `../x`: resolved against the importing module.
    Local,
    /// `/x`: already a root URL.
    Absolute,
    /// `https:`, `data:`, `node:` and other URLs: left alone.
    Opaque,
    /// Package name, served from the pre-bundle cache.
    External,
}

impl SpecifierKind {
    #[must_use]
    pub fn classify(specifier: &str) -> Self {
        if specifier.starts_with("./") || specifier.starts_with("../") {
            Self::Local
        } else if specifier.starts_with("//") || has_url_scheme(specifier) {
            Self::Opaque
        } else if specifier.starts_with('/') {
            Self::Absolute
        } else if is_bare_specifier(specifier) {
            Self::External
        } else {
            Self::Opaque
        }
    }
}

/// Result of one rewrite pass.
#[derive(Debug)]
pub struct RewriteOutput {
    pub code: String,
    /// Packages first seen in this pass; the caller must get them bundled.
    pub discovered: Vec<PackageTicket>,
    /// One waiter per distinct external package referenced.
    pub waiters: Vec<PackageWaiter>,
}

/// Rewrites import specifiers to browser-resolvable URLs.
pub struct ImportRewriter {
    root: PathBuf,
    cache_prefix: String,
    config: DevConfig,
}

impl ImportRewriter {
    #[must_use]
    pub fn new(root: PathBuf, config: &DevConfig) -> Self {
        Self {
            root,
            cache_prefix: config.cache_url_prefix(),
            config: config.clone(),
        }
    }

    /// Rewrite every import/export specifier in `code`, a module served at
    /// `module_url`.
    ///
    /// External packages are marked seen in `deps` before this returns.
    #[must_use]
    pub fn rewrite(&self, code: &str, module_url: &str, deps: &DepCache) -> RewriteOutput {
        let mut result = String::with_capacity(code.len() + 64);
        let mut discovered = Vec::new();
        let mut waiters = Vec::new();
        let mut externals = HashSet::new();
        let mut last = 0;

        for clause in scan_import_clauses(code) {
            if clause.type_only {
                continue;
            }
            let spec = clause.specifier.as_str();
            let replacement = match SpecifierKind::classify(spec) {
                SpecifierKind::Local => self.resolve_local(spec, module_url),
                SpecifierKind::Absolute => self.with_asset_flag(spec),
                SpecifierKind::Opaque => None,
                SpecifierKind::External => {
                    if externals.insert(spec.to_string()) {
                        match deps.discover(spec) {
                            Discovery::New(ticket) => {
                                waiters.push(ticket.waiter());
                                discovered.push(ticket);
                            }
                            Discovery::Known(waiter) => waiters.push(waiter),
                        }
                    }
                    Some(self.external_url(spec))
                }
            };

            if let Some(url) = replacement {
                trace!(module = module_url, from = spec, to = %url, "rewrite specifier");
                result.push_str(&code[last..clause.start]);
                result.push_str(&url);
                last = clause.end;
            }
        }

        result.push_str(&code[last..]);
        RewriteOutput {
            code: result,
            discovered,
            waiters,
        }
    }

    /// URL of the pre-bundled entry for an external specifier.
    #[must_use]
    pub fn external_url(&self, specifier: &str) -> String {
        format!("{}/{}/index.js", self.cache_prefix, specifier)
    }

    /// Resolve `./x` or `../x` against the module's directory.
    ///
    /// Returns `None` (leave unchanged) when the target climbs out of the
    /// root or names no file.
    fn resolve_local(&self, specifier: &str, module_url: &str) -> Option<String> {
        let (path, query) = split_query(specifier);
        let dir = module_url.rsplit_once('/').map_or("", |(d, _)| d);
        let joined = normalize_url_path(&format!("{dir}/{path}"))?;
        let resolved = self.find_file(&joined)?;
        let url = format!("{resolved}{query}");
        Some(self.with_asset_flag(&url).unwrap_or(url))
    }

    /// The URL of an existing file for `url`: as named, with an elided
    /// extension, or as a directory index.
    fn find_file(&self, url: &str) -> Option<String> {
        let disk = self.root.join(url.trim_start_matches('/'));
        if disk.is_file() {
            return Some(url.to_string());
        }
        if let Some(found) = SOURCE_EXTENSIONS
            .iter()
            .map(|ext| format!("{url}.{ext}"))
            .find(|candidate| self.root.join(candidate.trim_start_matches('/')).is_file())
        {
            return Some(found);
        }
        if disk.is_dir() {
            return SOURCE_EXTENSIONS
                .iter()
                .find(|ext| disk.join(format!("index.{ext}")).is_file())
                .map(|ext| format!("{}/index.{ext}", url.trim_end_matches('/')));
        }
        None
    }

    /// `url` with the `import` flag added if it names an asset.
    fn with_asset_flag(&self, url: &str) -> Option<String> {
        let (path, query) = split_query(url);
        let ext = url_extension(path);
        if !self.config.is_asset_extension(&ext) {
            return None;
        }
        if query.split(['?', '&']).any(|k| k == "import") {
            return None;
        }
        Some(if query.is_empty() {
            format!("{path}?import")
        } else {
            format!("{path}{query}&import")
        })
    }
}

/// Split `a/b.svg?raw` into `("a/b.svg", "?raw")`.
fn split_query(specifier: &str) -> (&str, &str) {
    match specifier.find(['?', '#']) {
        Some(idx) => specifier.split_at(idx),
        None => (specifier, ""),
    }
}
