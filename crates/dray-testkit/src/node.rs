//! A stub node answering the heartbeat info probe.

use std::collections::BTreeMap;
use std::sync::Arc;

use bytes::Bytes;
use dray_wire::multipart::{self, MultipartDecoder};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// One task entry: `(endpoint address, route token)`.
#[derive(Clone, Debug)]
pub struct AppSpec {
    pub running: bool,
    pub tasks: BTreeMap<String, (String, String)>,
}

/// What the node reports, app by app. Mutable at runtime so tests can move
/// handles between endpoints mid-flight.
#[derive(Clone, Debug, Default)]
pub struct NodeSpec {
    pub apps: BTreeMap<String, AppSpec>,
}

impl NodeSpec {
    /// A single running app exposing the given tasks.
    pub fn single_app(app: &str, tasks: &[(&str, &str, &str)]) -> NodeSpec {
        let mut map = BTreeMap::new();
        for (task, endpoint, route) in tasks {
            map.insert(
                (*task).to_owned(),
                ((*endpoint).to_owned(), (*route).to_owned()),
            );
        }
        let mut apps = BTreeMap::new();
        apps.insert(
            app.to_owned(),
            AppSpec {
                running: true,
                tasks: map,
            },
        );
        NodeSpec { apps }
    }

    fn to_json(&self) -> String {
        let mut apps = serde_json::Map::new();
        for (name, app) in &self.apps {
            let mut tasks = serde_json::Map::new();
            for (task, (endpoint, route)) in &app.tasks {
                tasks.insert(
                    task.clone(),
                    serde_json::json!({
                        "type": "native-server",
                        "endpoint": endpoint,
                        "route": route,
                    }),
                );
            }
            apps.insert(
                name.clone(),
                serde_json::json!({ "running": app.running, "tasks": tasks }),
            );
        }
        serde_json::json!({ "apps": apps }).to_string()
    }
}

/// Listens for info probes and answers with the current spec.
pub struct StubNode {
    address: String,
    spec: Arc<Mutex<NodeSpec>>,
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl StubNode {
    pub fn spawn(spec: NodeSpec) -> StubNode {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("stub node bind");
        listener.set_nonblocking(true).expect("stub node nonblocking");
        let address = listener.local_addr().expect("stub node addr").to_string();

        let spec = Arc::new(Mutex::new(spec));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let thread = {
            let spec = spec.clone();
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("stub node runtime");
                runtime.block_on(async move {
                    let listener = TcpListener::from_std(listener).expect("stub node listener");
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            accepted = listener.accept() => {
                                let Ok((stream, _)) = accepted else { break };
                                tokio::spawn(serve(stream, spec.clone()));
                            }
                        }
                    }
                });
            })
        };

        StubNode {
            address,
            spec,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Swap the reported view; the next probe sees it.
    pub fn set_spec(&self, spec: NodeSpec) {
        *self.spec.lock() = spec;
    }
}

impl Drop for StubNode {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

async fn serve(stream: tokio::net::TcpStream, spec: Arc<Mutex<NodeSpec>>) {
    let (mut rd, mut wr) = stream.into_split();
    let mut decoder = MultipartDecoder::new();
    let mut buf = [0u8; 4096];

    loop {
        let n = match rd.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        decoder.feed(&buf[..n]);

        loop {
            let parts = match decoder.next() {
                Ok(Some(parts)) => parts,
                Ok(None) => break,
                Err(_) => return,
            };
            let Some(request) = parts.first() else {
                continue;
            };
            let is_info = serde_json::from_slice::<serde_json::Value>(request)
                .ok()
                .and_then(|v| v.get("action").and_then(|a| a.as_str()).map(|a| a == "info"))
                .unwrap_or(false);
            if !is_info {
                continue;
            }

            let body = spec.lock().to_json();
            let Ok(wire) = multipart::encode(&[Bytes::from(body)]) else {
                return;
            };
            if wr.write_all(&wire).await.is_err() {
                return;
            }
        }
    }
}
