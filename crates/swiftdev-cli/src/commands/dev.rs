//! `swiftdev dev` command implementation.
//!
//! Serves the working directory as unbundled ES modules:
//!
//! ```text
//! Browser requests GET /src/App.jsx
//!   → transpile (SWC: JSX/TS → JS, inline source map)
//!   → rewrite imports (bare → /.cache/<pkg>/index.js, relative → absolute)
//!   → wait for any newly discovered package to be pre-bundled (esbuild)
//!   → serve as application/javascript
//! ```
//!
//! Edits under the root are pushed to connected browsers over the HMR
//! websocket.

use miette::{miette, IntoDiagnostic, Result};
use std::path::PathBuf;
use swiftdev_core::config::{load_config, DevConfig};
use swiftdev_core::DevServer;
use tokio::net::TcpListener;
use tracing::{error, info, warn};

/// Dev server action.
#[derive(Debug, Clone)]
pub struct DevAction {
    /// Served root.
    pub cwd: PathBuf,
    /// Port override.
    pub port: Option<u16>,
    /// Host override.
    pub host: Option<String>,
    /// Explicit config file path (overrides auto-discovery).
    pub config: Option<PathBuf>,
    /// Open browser automatically.
    pub open: bool,
}

impl DevAction {
    /// Apply command-line overrides on top of the file config.
    fn apply(&self, config: &mut DevConfig) {
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(host) = &self.host {
            config.host.clone_from(host);
        }
    }
}

/// Run the dev server until Ctrl-C.
pub async fn run(action: DevAction) -> Result<()> {
    let (config_path, mut config) =
        load_config(&action.cwd, action.config.as_deref()).into_diagnostic()?;
    if let Some(path) = &config_path {
        info!(path = %path.display(), "loaded config");
    }
    action.apply(&mut config);

    let host = config.host.clone();
    let port = config.port;
    let server = DevServer::new(&action.cwd, config).into_diagnostic()?;

    let listener = match TcpListener::bind((host.as_str(), port)).await {
        Ok(listener) => listener,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
            warn!(port, "port is already in use");
            return Err(miette!("port {port} is already in use"));
        }
        Err(e) => {
            error!(host = %host, port, error = %e, "failed to bind");
            return Err(e).into_diagnostic();
        }
    };

    let _watcher = server.start_watching().into_diagnostic()?;

    let url = format!("http://{}:{}", display_host(&host), port);
    println!();
    println!("  swiftdev serving {}", server.root().display());
    println!("  Local: {url}");
    println!();
    println!("  Press Ctrl+C to stop");
    println!();

    if action.open {
        if let Err(e) = open_browser(&url) {
            warn!(error = %e, "failed to open browser");
        }
    }

    server.serve(listener, shutdown_signal()).await.into_diagnostic()?;
    info!("dev server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for Ctrl-C");
        std::future::pending::<()>().await;
    }
}

/// Host to show in the banner; wildcard binds are reachable via localhost.
fn display_host(host: &str) -> &str {
    match host {
        "0.0.0.0" | "::" | "127.0.0.1" => "localhost",
        other => other,
    }
}

/// Open a URL in the default browser.
fn open_browser(url: &str) -> std::io::Result<()> {
    #[cfg(target_os = "macos")]
    {
        std::process::Command::new("open").arg(url).spawn()?;
    }
    #[cfg(target_os = "linux")]
    {
        std::process::Command::new("xdg-open").arg(url).spawn()?;
    }
    #[cfg(target_os = "windows")]
    {
        std::process::Command::new("cmd")
            .args(["/C", "start", url])
            .spawn()?;
    }
    Ok(())
}
