//! Unbundled ES module dev server.
//!
//! Serves individual modules on demand instead of a single bundle. Each
//! request runs transpile → rewrite → pre-bundle wait, with results cached
//! until the watcher reports a change to the backing file.

pub mod deps;
pub mod hmr;
pub mod prebundle;
pub mod request;
pub mod rewrite;
pub mod server;
pub mod transform;
pub mod watch;

pub use deps::{DepCache, DepState, Discovery, PackageTicket, PackageWaiter};
pub use hmr::{
    HmrBroadcaster, HmrCoordinator, HmrPayload, UpdateClock, UpdateKind, UpdateRecord,
    CLIENT_PATH, HMR_PROTOCOL,
};
pub use prebundle::{
    BundleEntry, BundleRequest, EsbuildBundler, PackageBundler, PreBundler, PrebundleError,
};
pub use request::{ModuleRequest, RequestError};
pub use rewrite::{ImportRewriter, RewriteOutput, SpecifierKind};
pub use server::DevServer;
pub use transform::{ModuleTransformer, TransformError, TransformedModule};
pub use watch::{FileChangeKind, FileWatcher, WatchError, WatchedFileEvent};
