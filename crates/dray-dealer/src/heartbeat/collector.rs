//! The heartbeat coordinator.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dray_wire::multipart::{self, MultipartDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::config::ServiceConfig;
use crate::endpoint::Endpoint;
use crate::error::DealerError;
use crate::heartbeat::fetcher::HostsFetcher;
use crate::heartbeat::node_info::NodeInfo;

/// Cadence of the fetch/probe/emit cycle. The first tick runs immediately.
pub const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(2);

/// How long one endpoint gets to answer the info probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

/// Snapshot consumer: `(service alias, handle name -> endpoints)`.
pub type HeartbeatCallback = Arc<dyn Fn(&str, &BTreeMap<String, Vec<Endpoint>>) + Send + Sync>;

struct ServiceSlot {
    alias: String,
    app: String,
    fetcher: HostsFetcher,
}

/// Owns the collector thread. Dropping it stops the cycle.
pub struct HeartbeatCollector {
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl HeartbeatCollector {
    pub fn start(
        services: &BTreeMap<String, ServiceConfig>,
        callback: HeartbeatCallback,
    ) -> Result<HeartbeatCollector, DealerError> {
        let mut slots = Vec::with_capacity(services.len());
        for (alias, service) in services {
            slots.push(ServiceSlot {
                alias: alias.clone(),
                app: service.app.clone(),
                fetcher: HostsFetcher::from_config(&service.autodiscovery)?,
            });
        }

        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        let thread = std::thread::Builder::new()
            .name("dray-heartbeat".into())
            .spawn(move || {
                let runtime = match tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                {
                    Ok(runtime) => runtime,
                    Err(e) => {
                        error!(error = %e, "heartbeat runtime failed to start");
                        return;
                    }
                };
                runtime.block_on(run(slots, callback, shutdown_rx));
            })?;

        Ok(HeartbeatCollector {
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    /// Stop the cycle and join the thread.
    pub fn stop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

impl Drop for HeartbeatCollector {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn run(
    slots: Vec<ServiceSlot>,
    callback: HeartbeatCallback,
    mut shutdown_rx: mpsc::Receiver<()>,
) {
    debug!("heartbeat collector started");
    let mut last_good: BTreeMap<String, Vec<String>> = BTreeMap::new();
    loop {
        tick(&slots, &mut last_good, &callback).await;
        tokio::select! {
            _ = shutdown_rx.recv() => break,
            _ = tokio::time::sleep(HEARTBEAT_INTERVAL) => {}
        }
    }
    debug!("heartbeat collector stopped");
}

async fn tick(
    slots: &[ServiceSlot],
    services_endpoints: &mut BTreeMap<String, Vec<String>>,
    callback: &HeartbeatCallback,
) {
    // Refresh candidate lists; a failed fetch keeps the last good list.
    for slot in slots {
        match slot.fetcher.fetch().await {
            Ok(hosts) => {
                if hosts.is_empty() {
                    warn!(service = %slot.alias, "fetcher returned no hosts");
                }
                services_endpoints.insert(slot.alias.clone(), hosts);
            }
            Err(e) => {
                warn!(service = %slot.alias, error = %e, "host fetch failed, keeping previous list");
            }
        }
    }

    // Probe the union once, not per service.
    let all: BTreeSet<&String> = services_endpoints.values().flatten().collect();
    let mut alive: BTreeMap<String, NodeInfo> = BTreeMap::new();
    for address in all {
        if let Some(info) = probe(address).await {
            alive.insert(address.clone(), info);
        }
    }

    // Project onto each service's app and emit the snapshot.
    for slot in slots {
        let Some(hosts) = services_endpoints.get(&slot.alias) else {
            continue;
        };

        let mut handles: BTreeMap<String, Vec<Endpoint>> = BTreeMap::new();
        for address in hosts {
            let Some(info) = alive.get(address) else {
                continue;
            };
            let Some(app) = info.apps.get(&slot.app) else {
                continue;
            };
            if !app.running || app.tasks.is_empty() {
                continue;
            }
            for (task_name, task) in &app.tasks {
                handles
                    .entry(task_name.clone())
                    .or_default()
                    .push(Endpoint::new(task.endpoint.clone(), task.route.clone()));
            }
        }

        for (handle, endpoints) in &handles {
            debug!(service = %slot.alias, handle = %handle, endpoints = endpoints.len(), "responded endpoints");
        }
        callback(&slot.alias, &handles);
    }
}

/// Probe one endpoint for its node info. No failure escapes; a down or
/// confused endpoint simply yields `None` for this round.
async fn probe(address: &str) -> Option<NodeInfo> {
    match tokio::time::timeout(PROBE_TIMEOUT, probe_inner(address)).await {
        Ok(result) => result,
        Err(_) => {
            debug!(address, "info probe timed out");
            None
        }
    }
}

async fn probe_inner(address: &str) -> Option<NodeInfo> {
    let mut stream = match TcpStream::connect(address).await {
        Ok(stream) => stream,
        Err(e) => {
            debug!(address, error = %e, "info probe connect failed");
            return None;
        }
    };

    let request = serde_json::json!({ "version": 2, "action": "info" }).to_string();
    let wire = multipart::encode(&[Bytes::from(request)]).ok()?;
    stream.write_all(&wire).await.ok()?;

    let mut decoder = MultipartDecoder::new();
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await.ok()?;
        if n == 0 {
            return None;
        }
        decoder.feed(&buf[..n]);
        match decoder.next() {
            Ok(Some(parts)) => {
                let first = parts.into_iter().next()?;
                return NodeInfo::parse(&first, address);
            }
            Ok(None) => continue,
            Err(e) => {
                debug!(address, error = %e, "info reply framing error");
                return None;
            }
        }
    }
}
