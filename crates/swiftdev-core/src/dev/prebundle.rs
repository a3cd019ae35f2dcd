//! Pre-bundling of external packages.
//!
//! Every external specifier the rewriter discovers is bundled exactly once
//! into `<root>/<cache-dir>/<specifier>/index.js`, which is the URL the
//! rewriter already pointed the browser at. Bundling is delegated to a
//! [`PackageBundler`]; the default drives the `esbuild` executable.

use super::deps::PackageTicket;
use crate::config::DevConfig;
use futures::future::BoxFuture;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Error from resolving or bundling a package.
#[derive(Debug, Error)]
pub enum PrebundleError {
    #[error("package `{package}` is not installed in {deps_dir}")]
    NotInstalled { package: String, deps_dir: PathBuf },

    #[error("cannot find an entry file for `{specifier}`")]
    UnresolvedEntry { specifier: String },

    #[error("esbuild executable not found; install esbuild or set bundler.command")]
    BundlerNotFound,

    #[error("failed to run bundler: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("bundler exited with {status}: {stderr}")]
    BundlerFailed { status: String, stderr: String },

    #[error("bundler produced no output for `{specifier}`")]
    MissingOutput { specifier: String },

    #[error("pre-bundling `{package}` failed: {message}")]
    Failed { package: String, message: Arc<str> },

    #[error("pre-bundling `{package}` was abandoned")]
    Abandoned { package: String },
}

/// One package to bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BundleEntry {
    /// The bare specifier as written in source (`react`, `react/jsx-runtime`).
    pub specifier: String,
    /// Resolved entry file.
    pub entry: PathBuf,
}

/// A batch of packages bundled together, sharing split chunks.
#[derive(Debug, Clone)]
pub struct BundleRequest {
    /// Served root, used as the working directory.
    pub root: PathBuf,
    /// Cache directory; entry `s` must land at `<out_dir>/<s>/index.js`.
    pub out_dir: PathBuf,
    pub entries: Vec<BundleEntry>,
}

impl BundleRequest {
    /// Where the bundle for `specifier` is written.
    #[must_use]
    pub fn output_for(&self, specifier: &str) -> PathBuf {
        self.out_dir.join(specifier).join("index.js")
    }
}

/// Bundles a batch of package entries into ESM files.
pub trait PackageBundler: Send + Sync {
    fn name(&self) -> &'static str;

    fn bundle<'a>(&'a self, request: &'a BundleRequest)
        -> BoxFuture<'a, Result<(), PrebundleError>>;
}

/// [`PackageBundler`] backed by the `esbuild` command-line tool.
#[derive(Debug, Clone, Default)]
pub struct EsbuildBundler {
    command: Option<PathBuf>,
}

impl EsbuildBundler {
    /// `command` overrides executable discovery.
    #[must_use]
    pub fn new(command: Option<PathBuf>) -> Self {
        Self { command }
    }

    /// Locate the executable: configured command, then
    /// `node_modules/.bin/esbuild`, then `PATH`.
    pub fn locate(&self, root: &Path) -> Result<PathBuf, PrebundleError> {
        if let Some(cmd) = &self.command {
            return Ok(if cmd.is_relative() && cmd.components().count() > 1 {
                root.join(cmd)
            } else {
                cmd.clone()
            });
        }

        let local_name = if cfg!(windows) {
            "esbuild.cmd"
        } else {
            "esbuild"
        };
        let local = root.join("node_modules").join(".bin").join(local_name);
        if local.is_file() {
            return Ok(local);
        }

        which::which("esbuild").map_err(|_| PrebundleError::BundlerNotFound)
    }
}

impl PackageBundler for EsbuildBundler {
    fn name(&self) -> &'static str {
        "esbuild"
    }

    fn bundle<'a>(
        &'a self,
        request: &'a BundleRequest,
    ) -> BoxFuture<'a, Result<(), PrebundleError>> {
        Box::pin(async move {
            let program = self.locate(&request.root)?;
            tokio::fs::create_dir_all(&request.out_dir)
                .await
                .map_err(PrebundleError::Spawn)?;

            let args = esbuild_args(request);
            debug!(program = %program.display(), ?args, "running esbuild");

            let output = tokio::process::Command::new(&program)
                .args(&args)
                .current_dir(&request.root)
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .output()
                .await
                .map_err(PrebundleError::Spawn)?;

            if output.status.success() {
                Ok(())
            } else {
                Err(PrebundleError::BundlerFailed {
                    status: output.status.to_string(),
                    stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
                })
            }
        })
    }
}

/// Command-line arguments for one esbuild invocation.
///
/// Each entry is named `<specifier>/index` so the output path mirrors the
/// URL the rewriter emitted. Tree shaking is off because the browser may
/// import any export of the package later.
#[must_use]
pub fn esbuild_args(request: &BundleRequest) -> Vec<String> {
    let mut args: Vec<String> = request
        .entries
        .iter()
        .map(|e| format!("{}/index={}", e.specifier, e.entry.display()))
        .collect();

    args.extend(
        [
            "--bundle",
            "--format=esm",
            "--platform=browser",
            "--splitting",
            "--sourcemap",
            "--tree-shaking=false",
            "--define:process.env.NODE_ENV=\"development\"",
            "--log-level=error",
        ]
        .map(String::from),
    );
    args.push(format!("--outdir={}", request.out_dir.display()));
    args
}

/// Whether a specifier names a package rather than a path or URL.
///
/// Specifiers with `.` or `..` segments or backslashes are rejected, since
/// they are joined onto the cache and dependency directories.
#[must_use]
pub fn is_bare_specifier(specifier: &str) -> bool {
    !specifier.is_empty()
        && !specifier.starts_with('.')
        && !specifier.starts_with('/')
        && !specifier.starts_with('\0')
        && !specifier.contains('\\')
        && !specifier.split('/').any(|seg| seg == "." || seg == "..")
        && !has_url_scheme(specifier)
}

/// `http:`, `https:`, `data:`, `node:` and friends.
#[must_use]
pub fn has_url_scheme(specifier: &str) -> bool {
    match specifier.find(':') {
        Some(idx) if idx > 1 => specifier[..idx]
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'+' | b'-' | b'.')),
        _ => false,
    }
}

/// Package name of a specifier, dropping any subpath.
#[must_use]
pub fn package_name_from_specifier(specifier: &str) -> &str {
    let mut parts = specifier.splitn(3, '/');
    let first = parts.next().unwrap_or(specifier);
    if first.starts_with('@') {
        match parts.next() {
            Some(name) => &specifier[..first.len() + 1 + name.len()],
            None => specifier,
        }
    } else {
        first
    }
}

#[derive(Debug, Deserialize)]
struct PackageManifest {
    module: Option<String>,
    main: Option<String>,
}

/// Find the entry file for `specifier` under `deps_dir`.
///
/// A directory uses its `package.json` `module` field, then `main`, then
/// `index.js`. Otherwise `<specifier>.js`, `<specifier>.mjs`, then the path
/// itself if it is a file.
pub fn resolve_package_entry(deps_dir: &Path, specifier: &str) -> Result<PathBuf, PrebundleError> {
    let package = package_name_from_specifier(specifier);
    if !deps_dir.join(package).exists() {
        return Err(PrebundleError::NotInstalled {
            package: package.to_string(),
            deps_dir: deps_dir.to_path_buf(),
        });
    }

    let base = deps_dir.join(specifier);
    if base.is_dir() {
        if let Some(entry) = manifest_entry(&base) {
            return Ok(entry);
        }
        let index = base.join("index.js");
        if index.is_file() {
            return Ok(index);
        }
    }

    for ext in ["js", "mjs"] {
        let candidate = append_extension(&base, ext);
        if candidate.is_file() {
            return Ok(candidate);
        }
    }

    if base.is_file() {
        return Ok(base);
    }

    Err(PrebundleError::UnresolvedEntry {
        specifier: specifier.to_string(),
    })
}

fn manifest_entry(dir: &Path) -> Option<PathBuf> {
    let text = std::fs::read_to_string(dir.join("package.json")).ok()?;
    let manifest: PackageManifest = match serde_json::from_str(&text) {
        Ok(m) => m,
        Err(e) => {
            warn!(path = %dir.display(), error = %e, "ignoring malformed package.json");
            return None;
        }
    };

    [manifest.module, manifest.main]
        .into_iter()
        .flatten()
        .find_map(|field| {
            let path = dir.join(&field);
            if path.is_file() {
                Some(path)
            } else {
                let with_js = append_extension(&path, "js");
                with_js.is_file().then_some(with_js)
            }
        })
}

fn append_extension(path: &Path, ext: &str) -> PathBuf {
    let mut s = path.as_os_str().to_os_string();
    s.push(".");
    s.push(ext);
    PathBuf::from(s)
}

/// Resolves discovered packages and hands them to a [`PackageBundler`].
pub struct PreBundler {
    root: PathBuf,
    deps_dir: PathBuf,
    out_dir: PathBuf,
    bundler: Arc<dyn PackageBundler>,
}

impl PreBundler {
    #[must_use]
    pub fn new(root: PathBuf, config: &DevConfig, bundler: Arc<dyn PackageBundler>) -> Self {
        Self {
            deps_dir: root.join(&config.deps_dir),
            out_dir: root.join(config.cache_dir.trim_matches('/')),
            root,
            bundler,
        }
    }

    /// Bundle every ticket in one pass and publish each result.
    ///
    /// Packages that cannot be resolved fail on their own; the rest are
    /// bundled together.
    pub async fn bundle_batch(&self, tickets: Vec<PackageTicket>) {
        let mut pending = Vec::with_capacity(tickets.len());
        let mut entries = Vec::with_capacity(tickets.len());

        for ticket in tickets {
            match resolve_package_entry(&self.deps_dir, ticket.specifier()) {
                Ok(entry) => {
                    entries.push(BundleEntry {
                        specifier: ticket.specifier().to_string(),
                        entry,
                    });
                    pending.push(ticket);
                }
                Err(e) => {
                    warn!(package = ticket.specifier(), error = %e, "cannot pre-bundle package");
                    ticket.complete(Err(e.to_string().into()));
                }
            }
        }

        if entries.is_empty() {
            return;
        }

        let request = BundleRequest {
            root: self.root.clone(),
            out_dir: self.out_dir.clone(),
            entries,
        };
        let names: Vec<&str> = request.entries.iter().map(|e| e.specifier.as_str()).collect();
        info!(packages = ?names, bundler = self.bundler.name(), "pre-bundling");

        match self.bundler.bundle(&request).await {
            Ok(()) => {
                for ticket in pending {
                    let output = request.output_for(ticket.specifier());
                    if output.is_file() {
                        ticket.complete(Ok(()));
                    } else {
                        let e = PrebundleError::MissingOutput {
                            specifier: ticket.specifier().to_string(),
                        };
                        error!(error = %e, "pre-bundling failed");
                        ticket.complete(Err(e.to_string().into()));
                    }
                }
            }
            Err(e) => {
                error!(packages = ?names, error = %e, "pre-bundling failed");
                let message: Arc<str> = e.to_string().into();
                for ticket in pending {
                    ticket.complete(Err(message.clone()));
                }
            }
        }
    }
}
