//! Hot module replacement: wire protocol, update policy and fan-out.
//!
//! The watcher loop feeds every [`WatchedFileEvent`] to a single
//! [`HmrCoordinator`], which decides whether it becomes an update. Updates
//! are serialized once and fanned out to every open websocket through an
//! [`HmrBroadcaster`].

use super::request::{url_extension, url_path_for};
use super::watch::{FileChangeKind, WatchedFileEvent};
use crate::config::HmrConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

/// Websocket sub-protocol the client must request.
pub const HMR_PROTOCOL: &str = "hmr";

/// URL the client runtime is served at.
pub const CLIENT_PATH: &str = "/@hmr/client";

/// Server → client message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum HmrPayload {
    Connected,
    Update { updates: Vec<UpdateRecord> },
}

impl HmrPayload {
    pub fn encode(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum UpdateKind {
    JsUpdate,
}

/// One module to re-import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateRecord {
    #[serde(rename = "type")]
    pub kind: UpdateKind,
    /// Milliseconds since the epoch; strictly increasing per server.
    pub timestamp: u64,
    pub path: String,
    #[serde(rename = "acceptedPath")]
    pub accepted_path: String,
}

impl UpdateRecord {
    #[must_use]
    pub fn js_update(path: String, timestamp: u64) -> Self {
        Self {
            kind: UpdateKind::JsUpdate,
            timestamp,
            accepted_path: path.clone(),
            path,
        }
    }
}

/// Wall-clock timestamps that never repeat or go backwards.
#[derive(Debug, Default)]
pub struct UpdateClock {
    last: u64,
}

impl UpdateClock {
    pub fn next_from(&mut self, now_ms: u64) -> u64 {
        self.last = now_ms.max(self.last + 1);
        self.last
    }

    pub fn next(&mut self) -> u64 {
        self.next_from(now_ms())
    }
}

fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Turns file events into update payloads.
///
/// With a non-zero debounce, changes are held per path until the path has
/// been quiet for the whole window, then released as one record. The last
/// write of a burst therefore always produces an update.
pub struct HmrCoordinator {
    root: PathBuf,
    extensions: Vec<String>,
    debounce: Duration,
    pending: HashMap<String, Instant>,
    clock: UpdateClock,
}

impl HmrCoordinator {
    #[must_use]
    pub fn new(root: PathBuf, config: &HmrConfig) -> Self {
        Self {
            root,
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            debounce: Duration::from_millis(config.debounce_ms),
            pending: HashMap::new(),
            clock: UpdateClock::default(),
        }
    }

    /// Whether changes to files with this extension trigger updates.
    #[must_use]
    pub fn triggers_update(&self, ext: &str) -> bool {
        self.extensions.iter().any(|e| e == ext)
    }

    /// Record `event`. Returns the update to broadcast right away, which
    /// only happens when debouncing is disabled.
    ///
    /// Removals, files outside the policy set and paths outside the root
    /// produce nothing. A removal also drops any held change for its path.
    pub fn on_change(&mut self, event: &WatchedFileEvent, now: Instant) -> Option<HmrPayload> {
        let url = url_path_for(&self.root, &event.path)?;

        if event.kind == FileChangeKind::Removed {
            self.pending.remove(&url);
            return None;
        }

        let ext = url_extension(&url);
        if !self.triggers_update(&ext) {
            trace!(path = %url, "change outside hmr policy");
            return None;
        }

        if self.debounce.is_zero() {
            return Some(self.update_for(url));
        }
        if self.pending.insert(url.clone(), now + self.debounce).is_some() {
            debug!(path = %url, "coalescing change");
        }
        None
    }

    /// When the earliest held change becomes due.
    #[must_use]
    pub fn next_deadline(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Release every held change whose quiet window has passed at `now`,
    /// one payload per path.
    pub fn flush_due(&mut self, now: Instant) -> Vec<HmrPayload> {
        let mut due: Vec<(Instant, String)> = Vec::new();
        self.pending.retain(|url, deadline| {
            if *deadline <= now {
                due.push((*deadline, url.clone()));
                false
            } else {
                true
            }
        });
        due.sort();
        due.into_iter().map(|(_, url)| self.update_for(url)).collect()
    }

    /// Release every held change regardless of its window.
    pub fn flush_all(&mut self) -> Vec<HmrPayload> {
        match self.pending.values().max().copied() {
            Some(latest) => self.flush_due(latest),
            None => Vec::new(),
        }
    }

    fn update_for(&mut self, url: String) -> HmrPayload {
        let timestamp = self.clock.next();
        HmrPayload::Update {
            updates: vec![UpdateRecord::js_update(url, timestamp)],
        }
    }
}

/// Fan-out of serialized payloads to every open session.
#[derive(Debug, Clone)]
pub struct HmrBroadcaster {
    tx: broadcast::Sender<Arc<str>>,
}

impl HmrBroadcaster {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Arc<str>> {
        self.tx.subscribe()
    }

    /// Send to every subscriber; returns how many received it.
    pub fn send(&self, payload: &HmrPayload) -> usize {
        let text: Arc<str> = match payload.encode() {
            Ok(text) => text.into(),
            Err(e) => {
                warn!(error = %e, "failed to encode hmr payload");
                return 0;
            }
        };
        self.tx.send(text).unwrap_or(0)
    }

    #[must_use]
    pub fn client_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for HmrBroadcaster {
    fn default() -> Self {
        Self::new(64)
    }
}

/// Browser side of the protocol, served at [`CLIENT_PATH`].
pub const CLIENT_RUNTIME: &str = r"
const protocol = location.protocol === 'https:' ? 'wss' : 'ws';
const socket = new WebSocket(`${protocol}://${location.host}/`, 'hmr');
let pingTimer;

socket.addEventListener('message', async ({ data }) => {
  const payload = JSON.parse(data);
  switch (payload.type) {
    case 'connected':
      console.debug('[swiftdev] connected.');
      pingTimer = setInterval(() => socket.send('ping'), 30000);
      break;
    case 'update':
      for (const update of payload.updates) {
        if (update.type !== 'js-update') continue;
        try {
          await import(`${update.path}?t=${update.timestamp}`);
        } catch (err) {
          console.error(`[swiftdev] failed to reload ${update.path}`, err);
        }
      }
      location.reload();
      break;
  }
});

socket.addEventListener('close', () => {
  clearInterval(pingTimer);
  console.log('[swiftdev] server connection lost.');
});
";

#[cfg(test)]
mod tests {
    use super::*;

    fn event(path: &str, kind: FileChangeKind) -> WatchedFileEvent {
        WatchedFileEvent {
            path: PathBuf::from("/project").join(path),
            kind,
        }
    }

    fn coordinator() -> HmrCoordinator {
        HmrCoordinator::new(PathBuf::from("/project"), &HmrConfig::default())
    }

    fn immediate() -> HmrCoordinator {
        let config = HmrConfig {
            debounce_ms: 0,
            ..HmrConfig::default()
        };
        HmrCoordinator::new(PathBuf::from("/project"), &config)
    }

    fn paths(payloads: &[HmrPayload]) -> Vec<&str> {
        payloads
            .iter()
            .flat_map(|p| match p {
                HmrPayload::Update { updates } => {
                    updates.iter().map(|u| u.path.as_str()).collect::<Vec<_>>()
                }
                HmrPayload::Connected => Vec::new(),
            })
            .collect()
    }

    #[test]
    fn test_wire_format() {
        assert_eq!(
            HmrPayload::Connected.encode().unwrap(),
            r#"{"type":"connected"}"#
        );
        let update = HmrPayload::Update {
            updates: vec![UpdateRecord::js_update("/App.jsx".to_string(), 42)],
        };
        assert_eq!(
            update.encode().unwrap(),
            r#"{"type":"update","updates":[{"type":"js-update","timestamp":42,"path":"/App.jsx","acceptedPath":"/App.jsx"}]}"#
        );
    }

    #[test]
    fn test_clock_is_strictly_increasing() {
        let mut clock = UpdateClock::default();
        assert_eq!(clock.next_from(100), 100);
        assert_eq!(clock.next_from(100), 101);
        assert_eq!(clock.next_from(50), 102);
        assert_eq!(clock.next_from(500), 500);
    }

    #[test]
    fn test_change_yields_one_record() {
        let mut hmr = immediate();
        let payload = hmr
            .on_change(&event("App.jsx", FileChangeKind::Changed), Instant::now())
            .unwrap();
        let HmrPayload::Update { updates } = payload else {
            panic!("expected update");
        };
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].path, "/App.jsx");
        assert_eq!(updates[0].accepted_path, "/App.jsx");
        assert_eq!(updates[0].kind, UpdateKind::JsUpdate);
    }

    #[test]
    fn test_timestamps_increase_across_edits() {
        let mut hmr = immediate();
        let start = Instant::now();
        let stamp = |p: Option<HmrPayload>| match p {
            Some(HmrPayload::Update { updates }) => updates[0].timestamp,
            other => panic!("unexpected {other:?}"),
        };
        let first = stamp(hmr.on_change(&event("App.jsx", FileChangeKind::Changed), start));
        let second = stamp(hmr.on_change(
            &event("App.jsx", FileChangeKind::Changed),
            start + Duration::from_secs(1),
        ));
        assert!(second > first);
    }

    #[test]
    fn test_policy_and_kinds() {
        let mut hmr = immediate();
        let now = Instant::now();
        assert!(hmr.on_change(&event("src/index.css", FileChangeKind::Changed), now).is_some());
        assert!(hmr.on_change(&event("src/new.ts", FileChangeKind::Created), now).is_some());
        assert!(hmr.on_change(&event("src/old.ts", FileChangeKind::Removed), now).is_none());
        assert!(hmr.on_change(&event("logo.svg", FileChangeKind::Changed), now).is_none());
        assert!(hmr.on_change(&event("README", FileChangeKind::Changed), now).is_none());

        let outside = WatchedFileEvent {
            path: PathBuf::from("/elsewhere/App.jsx"),
            kind: FileChangeKind::Changed,
        };
        assert!(hmr.on_change(&outside, now).is_none());
    }

    #[test]
    fn test_burst_releases_one_update_after_last_event() {
        let mut hmr = coordinator();
        let start = Instant::now();
        let change = event("App.jsx", FileChangeKind::Changed);

        assert!(hmr.on_change(&change, start).is_none());
        let second = start + Duration::from_millis(20);
        assert!(hmr.on_change(&change, second).is_none());
        assert_eq!(hmr.next_deadline(), Some(second + Duration::from_millis(50)));

        assert!(hmr.flush_due(start + Duration::from_millis(60)).is_empty());
        let released = hmr.flush_due(second + Duration::from_millis(50));
        assert_eq!(paths(&released), vec!["/App.jsx"]);
        assert_eq!(hmr.next_deadline(), None);
    }

    #[test]
    fn test_paths_debounce_independently() {
        let mut hmr = coordinator();
        let start = Instant::now();
        hmr.on_change(&event("App.jsx", FileChangeKind::Changed), start);
        hmr.on_change(
            &event("main.jsx", FileChangeKind::Changed),
            start + Duration::from_millis(30),
        );

        let first = hmr.flush_due(start + Duration::from_millis(55));
        assert_eq!(paths(&first), vec!["/App.jsx"]);
        let rest = hmr.flush_all();
        assert_eq!(paths(&rest), vec!["/main.jsx"]);
    }

    #[test]
    fn test_removal_drops_held_change() {
        let mut hmr = coordinator();
        let start = Instant::now();
        hmr.on_change(&event("App.jsx", FileChangeKind::Changed), start);
        hmr.on_change(&event("App.jsx", FileChangeKind::Removed), start);
        assert!(hmr.flush_all().is_empty());
    }

    #[test]
    fn test_debounce_disabled() {
        let mut hmr = immediate();
        let now = Instant::now();
        let change = event("App.jsx", FileChangeKind::Changed);
        assert!(hmr.on_change(&change, now).is_some());
        assert!(hmr.on_change(&change, now).is_some());
        assert_eq!(hmr.next_deadline(), None);
    }

    #[test]
    fn test_custom_extensions() {
        let config = HmrConfig {
            extensions: vec![".Vue".to_string()],
            ..HmrConfig::default()
        };
        let hmr = HmrCoordinator::new(PathBuf::from("/project"), &config);
        assert!(hmr.triggers_update("vue"));
        assert!(!hmr.triggers_update("js"));
    }

    #[tokio::test]
    async fn test_broadcaster_fans_out() {
        let hmr = HmrBroadcaster::default();
        assert_eq!(hmr.send(&HmrPayload::Connected), 0);

        let mut a = hmr.subscribe();
        let mut b = hmr.subscribe();
        assert_eq!(hmr.client_count(), 2);

        let payload = HmrPayload::Update {
            updates: vec![UpdateRecord::js_update("/a.js".to_string(), 1)],
        };
        assert_eq!(hmr.send(&payload), 2);
        assert_eq!(a.recv().await.unwrap(), b.recv().await.unwrap());

        drop(a);
        assert_eq!(hmr.client_count(), 1);
    }

    #[test]
    fn test_client_runtime_protocol() {
        assert!(CLIENT_RUNTIME.contains("'hmr'"));
        assert!(CLIENT_RUNTIME.contains("socket.send('ping')"));
        assert!(CLIENT_RUNTIME.contains("?t=${update.timestamp}"));
        assert!(CLIENT_RUNTIME.contains("location.reload()"));
    }
}
