//! Process-wide record of external packages and their bundling state.
//!
//! The first request that mentions a package receives a [`PackageTicket`]
//! and becomes responsible for getting it bundled; every other request
//! receives a [`PackageWaiter`] on the same state. Entries are created on
//! first discovery and live until the server stops. A failed bundle stays
//! failed.

use super::prebundle::PrebundleError;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;

/// Bundling state of one external package.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DepState {
    Pending,
    Ready,
    Failed(Arc<str>),
}

/// Outcome of [`DepCache::discover`].
#[derive(Debug)]
pub enum Discovery {
    /// First sighting: the caller owns bundling.
    New(PackageTicket),
    /// Already known: wait for whoever owns it.
    Known(PackageWaiter),
}

/// The dependency cache.
#[derive(Debug, Default)]
pub struct DepCache {
    entries: Mutex<HashMap<String, watch::Receiver<DepState>>>,
}

impl DepCache {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark `specifier` as seen.
    ///
    /// Synchronous: the seen flag is set before the caller can yield, so two
    /// concurrent transforms can never both receive a ticket.
    pub fn discover(&self, specifier: &str) -> Discovery {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(rx) = entries.get(specifier) {
            return Discovery::Known(PackageWaiter {
                specifier: specifier.to_string(),
                rx: rx.clone(),
            });
        }
        let (tx, rx) = watch::channel(DepState::Pending);
        entries.insert(specifier.to_string(), rx);
        Discovery::New(PackageTicket {
            specifier: specifier.to_string(),
            tx,
        })
    }

    /// Current state, or `None` if never discovered.
    #[must_use]
    pub fn state(&self, specifier: &str) -> Option<DepState> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.get(specifier).map(|rx| rx.borrow().clone())
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Obligation to bundle one package and publish the result.
///
/// Dropping a ticket without calling [`complete`](Self::complete) fails all
/// of its waiters.
#[derive(Debug)]
pub struct PackageTicket {
    specifier: String,
    tx: watch::Sender<DepState>,
}

impl PackageTicket {
    #[must_use]
    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    /// A waiter for this ticket's own result.
    #[must_use]
    pub fn waiter(&self) -> PackageWaiter {
        PackageWaiter {
            specifier: self.specifier.clone(),
            rx: self.tx.subscribe(),
        }
    }

    /// Publish the bundling result to every waiter.
    pub fn complete(self, result: Result<(), Arc<str>>) {
        let state = match result {
            Ok(()) => DepState::Ready,
            Err(message) => DepState::Failed(message),
        };
        self.tx.send_replace(state);
    }
}

/// Handle for awaiting one package's bundling result.
#[derive(Debug, Clone)]
pub struct PackageWaiter {
    specifier: String,
    rx: watch::Receiver<DepState>,
}

impl PackageWaiter {
    #[must_use]
    pub fn specifier(&self) -> &str {
        &self.specifier
    }

    /// Wait until the package is no longer pending.
    pub async fn wait(mut self) -> Result<(), PrebundleError> {
        let state = self
            .rx
            .wait_for(|s| !matches!(s, DepState::Pending))
            .await
            .map(|s| s.clone());

        match state {
            Ok(DepState::Failed(message)) => Err(PrebundleError::Failed {
                package: self.specifier,
                message,
            }),
            Ok(_) => Ok(()),
            Err(_) => Err(PrebundleError::Abandoned {
                package: self.specifier,
            }),
        }
    }
}
