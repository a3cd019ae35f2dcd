//! Integration tests for the dev server over real HTTP and websocket
//! connections.

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use swiftdev_core::dev::{
    BundleRequest, DevServer, FileChangeKind, PackageBundler, PrebundleError, WatchedFileEvent,
};
use swiftdev_core::DevConfig;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::{self, client::IntoClientRequest, http::HeaderValue};

/// Writes a stub module for every entry and counts calls.
#[derive(Default)]
struct CountingBundler {
    calls: AtomicUsize,
}

impl PackageBundler for CountingBundler {
    fn name(&self) -> &'static str {
        "counting"
    }

    fn bundle<'a>(&'a self, request: &'a BundleRequest) -> BoxFuture<'a, Result<(), PrebundleError>> {
        Box::pin(async move {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(50)).await;
            for entry in &request.entries {
                let out = request.output_for(&entry.specifier);
                std::fs::create_dir_all(out.parent().unwrap()).unwrap();
                std::fs::write(out, format!("export default {{ name: '{}' }};", entry.specifier))
                    .unwrap();
            }
            Ok(())
        })
    }
}

struct Fixture {
    _dir: tempfile::TempDir,
    server: DevServer,
    addr: SocketAddr,
    bundler: Arc<CountingBundler>,
}

impl Fixture {
    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn get(&self, path: &str) -> reqwest::Response {
        reqwest::get(self.url(path)).await.unwrap()
    }
}

fn write(root: &Path, rel: &str, content: &str) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
}

const ICON: &str = r#"<svg xmlns="http://www.w3.org/2000/svg"><circle r="4"/></svg>"#;

async fn start() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    write(
        root,
        "index.html",
        "<!doctype html>\n<html>\n<head>\n<title>app</title>\n</head>\n<body><script type=\"module\" src=\"/src/main.jsx\"></script></body>\n</html>\n",
    );
    write(
        root,
        "src/main.jsx",
        "import React from 'react';\nimport App from './App';\nimport './index.css';\nimport logo from './components/Icon.svg';\nconsole.log(React, App, logo);\n",
    );
    write(
        root,
        "src/App.jsx",
        "export default function App() {\n  return <h1>hello</h1>;\n}\n",
    );
    write(root, "src/index.css", "body {\n  margin: 0;\n}\n");
    write(root, "src/components/Icon.svg", ICON);
    write(root, "src/broken.js", "export const = ;\n");
    write(root, "notes.xyz", "not served");
    write(root, "node_modules/react/package.json", r#"{ "main": "index.js" }"#);
    write(root, "node_modules/react/index.js", "module.exports = {};");
    write(root, "node_modules/react/jsx-runtime.js", "module.exports = {};");

    let bundler = Arc::new(CountingBundler::default());
    let server = DevServer::with_bundler(root, DevConfig::default(), bundler.clone()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let serving = server.clone();
    tokio::spawn(async move { serving.serve(listener, std::future::pending()).await });

    Fixture {
        _dir: dir,
        server,
        addr,
        bundler,
    }
}

async fn connect_hmr(
    addr: SocketAddr,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let mut request = format!("ws://{addr}/").into_client_request().unwrap();
    request
        .headers_mut()
        .insert("Sec-WebSocket-Protocol", HeaderValue::from_static("hmr"));
    let (ws, response) = tokio_tungstenite::connect_async(request).await.unwrap();
    assert_eq!(
        response.headers().get("sec-websocket-protocol").unwrap(),
        "hmr"
    );
    ws
}

async fn next_json<S>(ws: &mut S) -> serde_json::Value
where
    S: futures::Stream<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
        .await
        .expect("timed out waiting for message")
        .unwrap()
        .unwrap();
    match msg {
        tungstenite::Message::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("unexpected frame {other:?}"),
    }
}

#[tokio::test]
async fn test_index_has_client_script() {
    let fx = start().await;
    let res = fx.get("/").await;
    assert_eq!(res.status(), 200);
    let body = res.text().await.unwrap();
    assert!(
        body.contains("<head>\n    <script type=\"module\" src=\"/@hmr/client\"></script>\n<title>"),
        "{body}"
    );
}

#[tokio::test]
async fn test_client_runtime_is_served() {
    let fx = start().await;
    let res = fx.get("/@hmr/client").await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-type"], "application/javascript");
    let body = res.text().await.unwrap();
    assert!(body.contains("WebSocket"), "{body}");
    assert!(body.contains("location.reload()"), "{body}");
}

#[tokio::test]
async fn test_svg_raw_and_import_stub() {
    let fx = start().await;

    let raw = fx.get("/src/components/Icon.svg").await;
    assert_eq!(raw.status(), 200);
    assert_eq!(raw.headers()["content-type"], "image/svg+xml");
    assert_eq!(raw.text().await.unwrap(), ICON);

    let stub = fx.get("/src/components/Icon.svg?import").await;
    assert_eq!(stub.status(), 200);
    assert_eq!(stub.headers()["content-type"], "application/javascript");
    assert_eq!(
        stub.text().await.unwrap(),
        "export default \"/src/components/Icon.svg\";\n"
    );
}

#[tokio::test]
async fn test_css_module_literal_has_no_raw_newline() {
    let fx = start().await;
    let res = fx.get("/src/index.css").await;
    assert_eq!(res.status(), 200);
    assert_eq!(res.headers()["content-type"], "application/javascript");
    let body = res.text().await.unwrap();
    let literal = body.lines().find(|l| l.starts_with("const __css")).unwrap();
    assert_eq!(literal, r#"const __css = "body {\n  margin: 0;\n}\n";"#);
}

#[tokio::test]
async fn test_entry_is_rewritten_and_dependency_bundled() {
    let fx = start().await;
    let res = fx.get("/src/main.jsx").await;
    assert_eq!(res.status(), 200);
    let body = res.text().await.unwrap();

    assert!(body.contains("/.cache/react/index.js"), "{body}");
    assert!(body.contains("/src/App.jsx"), "{body}");
    assert!(body.contains("/src/index.css"), "{body}");
    assert!(body.contains("/src/components/Icon.svg?import"), "{body}");
    assert!(body.contains("sourceMappingURL=data:application/json;base64,"));

    let dep = fx.get("/.cache/react/index.js").await;
    assert_eq!(dep.status(), 200);
    assert_eq!(dep.headers()["content-type"], "application/javascript");
    assert_eq!(dep.text().await.unwrap(), "export default { name: 'react' };");
}

#[tokio::test]
async fn test_repeat_request_is_identical() {
    let fx = start().await;
    let first = fx.get("/src/App.jsx").await.text().await.unwrap();
    let second = fx.get("/src/App.jsx?t=12345").await.text().await.unwrap();
    assert_eq!(first, second);
    assert!(first.contains("/.cache/react/jsx-runtime/index.js"), "{first}");
}

#[tokio::test]
async fn test_concurrent_first_imports_bundle_once() {
    let fx = start().await;
    for i in 0..10 {
        write(
            fx.server.root(),
            &format!("src/page{i}.js"),
            "import React from 'react';\nexport default React;\n",
        );
    }

    let requests = (0..10).map(|i| fx.get_owned(format!("/src/page{i}.js")));
    let responses = futures::future::join_all(requests).await;
    for res in responses {
        assert_eq!(res.status(), 200);
    }

    assert_eq!(fx.bundler.calls.load(Ordering::SeqCst), 1);
}

impl Fixture {
    fn get_owned(&self, path: String) -> impl std::future::Future<Output = reqwest::Response> {
        let url = self.url(&path);
        async move { reqwest::get(url).await.unwrap() }
    }
}

#[tokio::test]
async fn test_error_statuses() {
    let fx = start().await;

    assert_eq!(fx.get("/notes.xyz").await.status(), 404);
    assert_eq!(fx.get("/src/missing.js").await.status(), 404);
    assert_eq!(
        fx.get("/src/%2E%2E%2F%2E%2E%2Fsecret.txt").await.status(),
        403
    );
    assert_eq!(fx.get("/src/a%FF.js").await.status(), 400);

    let broken = fx.get("/src/broken.js").await;
    assert_eq!(broken.status(), 500);
    let body = broken.text().await.unwrap();
    assert!(body.starts_with("console.error(\""), "{body}");
}

#[tokio::test]
async fn test_websocket_requires_hmr_protocol() {
    let fx = start().await;
    let err = tokio_tungstenite::connect_async(format!("ws://{}/", fx.addr))
        .await
        .unwrap_err();
    match err {
        tungstenite::Error::Http(response) => assert_eq!(response.status(), 400),
        other => panic!("expected http error, got {other}"),
    }
}

#[tokio::test]
async fn test_connected_is_first_message() {
    let fx = start().await;
    let mut ws = connect_hmr(fx.addr).await;
    assert_eq!(next_json(&mut ws).await, serde_json::json!({ "type": "connected" }));

    ws.send(tungstenite::Message::Text("ping".into())).await.unwrap();
    assert_eq!(fx.server.broadcaster().client_count(), 1);
}

#[tokio::test]
async fn test_connected_precedes_in_flight_updates() {
    let fx = start().await;
    let (tx, rx) = mpsc::unbounded_channel();
    fx.server.spawn_hmr_loop(rx);

    let root = fx.server.root().to_path_buf();
    let feeder = tokio::spawn(async move {
        for i in 0..60 {
            let event = WatchedFileEvent {
                path: root.join(format!("src/file{i}.js")),
                kind: FileChangeKind::Changed,
            };
            if tx.send(event).is_err() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut ws = connect_hmr(fx.addr).await;
    assert_eq!(next_json(&mut ws).await, serde_json::json!({ "type": "connected" }));
    assert_eq!(next_json(&mut ws).await["type"], "update");
    feeder.await.unwrap();
}

#[tokio::test]
async fn test_burst_of_saves_yields_one_update_after_last() {
    let fx = start().await;
    let (tx, rx) = mpsc::unbounded_channel();
    fx.server.spawn_hmr_loop(rx);

    let mut ws = connect_hmr(fx.addr).await;
    assert_eq!(next_json(&mut ws).await["type"], "connected");

    let edit = WatchedFileEvent {
        path: fx.server.root().join("src/App.jsx"),
        kind: FileChangeKind::Changed,
    };
    tx.send(edit.clone()).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    let last = std::time::Instant::now();
    tx.send(edit).unwrap();

    let update = next_json(&mut ws).await;
    assert!(last.elapsed() >= Duration::from_millis(40));
    assert_eq!(update["updates"][0]["path"], "/src/App.jsx");

    let extra = tokio::time::timeout(Duration::from_millis(200), ws.next()).await;
    assert!(extra.is_err(), "unexpected second frame: {extra:?}");
}

#[tokio::test]
async fn test_edit_broadcasts_single_update() {
    let fx = start().await;
    let (tx, rx) = mpsc::unbounded_channel();
    fx.server.spawn_hmr_loop(rx);

    let mut ws = connect_hmr(fx.addr).await;
    assert_eq!(next_json(&mut ws).await["type"], "connected");

    let edit = WatchedFileEvent {
        path: fx.server.root().join("App.jsx"),
        kind: FileChangeKind::Changed,
    };
    tx.send(edit.clone()).unwrap();
    let first = next_json(&mut ws).await;
    assert_eq!(first["type"], "update");
    let updates = first["updates"].as_array().unwrap();
    assert_eq!(updates.len(), 1);
    assert_eq!(updates[0]["type"], "js-update");
    assert_eq!(updates[0]["path"], "/App.jsx");
    assert_eq!(updates[0]["acceptedPath"], "/App.jsx");

    tokio::time::sleep(Duration::from_millis(80)).await;
    tx.send(edit).unwrap();
    let second = next_json(&mut ws).await;
    assert!(
        second["updates"][0]["timestamp"].as_u64().unwrap()
            > updates[0]["timestamp"].as_u64().unwrap()
    );
}

#[tokio::test]
async fn test_edit_invalidates_cached_module() {
    let fx = start().await;
    let (tx, rx) = mpsc::unbounded_channel();
    fx.server.spawn_hmr_loop(rx);

    let before = fx.get("/src/index.css").await.text().await.unwrap();
    assert!(before.contains("margin: 0"));

    write(fx.server.root(), "src/index.css", "body { margin: 8px; }");
    tx.send(WatchedFileEvent {
        path: fx.server.root().join("src/index.css"),
        kind: FileChangeKind::Changed,
    })
    .unwrap();

    let after = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let body = fx.get("/src/index.css").await.text().await.unwrap();
            if body.contains("margin: 8px") {
                return body;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("edit never became visible");
    assert!(!after.contains("margin: 0"));
}
