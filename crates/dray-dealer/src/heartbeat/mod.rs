//! Endpoint discovery through periodic heartbeats.
//!
//! One collector per dealer. Every tick it fetches candidate hosts per
//! service, probes the deduplicated union with an info request, projects
//! the replies onto each service's configured app and emits a fresh
//! `(service, handle -> endpoints)` snapshot to the registered callback.
//! Callbacks always see the full current view; diffing is the consumer's
//! job.

mod collector;
mod fetcher;
mod node_info;

pub use collector::{HeartbeatCallback, HeartbeatCollector, HEARTBEAT_INTERVAL, PROBE_TIMEOUT};
pub use fetcher::HostsFetcher;
pub use node_info::{AppInfo, NodeInfo, TaskInfo};
