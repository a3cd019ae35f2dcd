//! Configuration for `swiftdev dev`.
//!
//! Loaded from an optional `swiftdev.json` in the served root. Every field has
//! a default, so an empty object (or no file at all) is a valid config.
//!
//! ```json
//! {
//!   "port": 9001,
//!   "host": "127.0.0.1",
//!   "cacheDir": ".cache",
//!   "jsx": "automatic",
//!   "hmr": { "extensions": ["css", "jsx"], "debounceMs": 50 },
//!   "bundler": { "command": "./node_modules/.bin/esbuild" }
//! }
//! ```

use crate::compiler::{JsxRuntime, SOURCE_EXTENSIONS};
use crate::error::Error;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Config file name looked up in the served root.
pub const CONFIG_FILE: &str = "swiftdev.json";

/// Default port.
pub const DEFAULT_PORT: u16 = 9001;

/// Default bind host.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Dev server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DevConfig {
    /// Port to listen on.
    pub port: u16,
    /// Host to bind to.
    pub host: String,
    /// Pre-bundle cache directory, relative to the served root.
    pub cache_dir: String,
    /// Dependency installation directory, relative to the served root.
    pub deps_dir: String,
    /// Extensions imported as URL strings (`?import`) instead of code.
    pub asset_extensions: Vec<String>,
    /// JSX runtime used when lowering `.jsx`/`.tsx`.
    pub jsx: JsxRuntime,
    /// HMR policy.
    pub hmr: HmrConfig,
    /// External bundler settings.
    pub bundler: BundlerConfig,
}

/// Which file changes produce HMR updates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HmrConfig {
    /// Extensions (without the dot) that trigger an update record.
    pub extensions: Vec<String>,
    /// Changes to one path are held until it has been quiet this long, then
    /// sent as a single update. Zero sends every change immediately.
    pub debounce_ms: u64,
}

/// External bundler settings.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct BundlerConfig {
    /// Explicit path to the `esbuild` executable.
    pub command: Option<PathBuf>,
}

const DEFAULT_ASSET_EXTENSIONS: &[&str] = &[
    "svg", "png", "jpg", "jpeg", "gif", "ico", "webp", "avif", "woff", "woff2", "ttf", "otf",
    "mp4", "webm", "mp3", "wav",
];

impl Default for DevConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            host: DEFAULT_HOST.to_string(),
            cache_dir: ".cache".to_string(),
            deps_dir: "node_modules".to_string(),
            asset_extensions: DEFAULT_ASSET_EXTENSIONS
                .iter()
                .map(ToString::to_string)
                .collect(),
            jsx: JsxRuntime::default(),
            hmr: HmrConfig::default(),
            bundler: BundlerConfig::default(),
        }
    }
}

impl Default for HmrConfig {
    fn default() -> Self {
        Self {
            extensions: std::iter::once("css")
                .chain(SOURCE_EXTENSIONS.iter().copied())
                .map(ToString::to_string)
                .collect(),
            debounce_ms: 50,
        }
    }
}

impl DevConfig {
    /// URL prefix under which pre-bundled packages are served (e.g. `/.cache`).
    #[must_use]
    pub fn cache_url_prefix(&self) -> String {
        format!("/{}", self.cache_dir.trim_matches('/'))
    }

    /// Whether `ext` (no dot, any case) is in the asset set.
    #[must_use]
    pub fn is_asset_extension(&self, ext: &str) -> bool {
        self.asset_extensions
            .iter()
            .any(|a| a.eq_ignore_ascii_case(ext))
    }
}

/// Find the config file in the given root directory.
pub fn find_config_file(root: &Path) -> Option<PathBuf> {
    let path = root.join(CONFIG_FILE);
    path.is_file().then_some(path)
}

/// Load configuration for `root`.
///
/// If `config_path` is `Some`, that file must exist. Otherwise the root is
/// searched for `swiftdev.json`; when absent, defaults are returned.
pub fn load_config(
    root: &Path,
    config_path: Option<&Path>,
) -> Result<(Option<PathBuf>, DevConfig), Error> {
    let path = match config_path {
        Some(p) => {
            let abs = if p.is_absolute() {
                p.to_path_buf()
            } else {
                root.join(p)
            };
            if !abs.exists() {
                return Err(Error::ConfigNotFound { path: abs });
            }
            abs
        }
        None => match find_config_file(root) {
            Some(p) => p,
            None => return Ok((None, DevConfig::default())),
        },
    };

    let source = std::fs::read_to_string(&path).map_err(|source| Error::ConfigRead {
        path: path.clone(),
        source,
    })?;
    let config = serde_json::from_str(&source).map_err(|source| Error::ConfigParse {
        path: path.clone(),
        source,
    })?;

    Ok((Some(path), config))
}
