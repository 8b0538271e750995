//! The per-handle worker.
//!
//! Every handle owns one OS thread running a small reactor: it polls the
//! control channel, dispatches new messages in bounded batches, drains
//! worker replies with an adaptive poll, and sweeps the cache for expired
//! work every few milliseconds. The dealer signals state changes through
//! the control channel only; nothing else crosses the thread boundary
//! except the shared message cache.

use std::fmt;
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, trace};
use uuid::Uuid;

use crate::balancer::{Balancer, ReplyKind, WorkerReply};
use crate::cache::{ExpiryReason, MessageCache, RequeueOutcome};
use crate::endpoint::Endpoint;
use crate::error::{code, DealerError};
use crate::message::Message;
use crate::response::Response;

/// Messages dispatched per loop turn.
const SEND_BATCH: usize = 100;
/// Reply poll right after activity.
const FAST_POLL: Duration = Duration::from_micros(10);
/// Reply poll once the socket has been quiet for a while.
const LONG_POLL: Duration = Duration::from_millis(1);
/// Quiet time before switching to the long poll.
const IDLE_AFTER: Duration = Duration::from_millis(500);
/// Cadence of the expiry sweep.
const EXPIRY_INTERVAL: Duration = Duration::from_millis(10);
/// Nap while disconnected.
const DISCONNECTED_NAP: Duration = Duration::from_millis(5);

/// Callback the service installs to receive response events.
pub type ResponseFn = Arc<dyn Fn(Response) + Send + Sync>;

/// Name pair of a handle: `service.name`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HandleInfo {
    pub service: String,
    pub name: String,
}

impl fmt::Display for HandleInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.name)
    }
}

#[derive(Debug)]
enum ControlMessage {
    Connect,
    Update(Vec<Endpoint>),
    Disconnect,
    Kill,
}

/// Dealer-side face of one handle.
pub struct Handle {
    info: HandleInfo,
    cache: Arc<MessageCache>,
    control_tx: Sender<ControlMessage>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl Handle {
    /// Spawn the worker thread and connect it to `endpoints`.
    pub fn start(
        info: HandleInfo,
        cache: Arc<MessageCache>,
        endpoints: Vec<Endpoint>,
        responses: ResponseFn,
    ) -> Result<Handle, DealerError> {
        let (control_tx, control_rx) = std::sync::mpsc::channel();

        let thread = {
            let info = info.clone();
            let cache = cache.clone();
            std::thread::Builder::new()
                .name(format!("dray-handle-{}", info))
                .spawn(move || {
                    let runtime = match tokio::runtime::Builder::new_current_thread()
                        .enable_all()
                        .build()
                    {
                        Ok(runtime) => runtime,
                        Err(e) => {
                            error!(handle = %info, error = %e, "worker runtime failed to start");
                            return;
                        }
                    };
                    runtime.block_on(run(info, cache, responses, control_rx));
                })?
        };

        let handle = Handle {
            info,
            cache,
            control_tx,
            thread: Some(thread),
        };
        handle.send_control(ControlMessage::Update(endpoints));
        handle.send_control(ControlMessage::Connect);
        Ok(handle)
    }

    pub fn info(&self) -> &HandleInfo {
        &self.info
    }

    pub fn cache(&self) -> &Arc<MessageCache> {
        &self.cache
    }

    /// Queue one message for dispatch.
    pub fn enqueue(&self, message: Message) -> Result<(), DealerError> {
        self.cache.enqueue(message)
    }

    pub fn connect(&self) {
        self.send_control(ControlMessage::Connect);
    }

    pub fn update_endpoints(&self, endpoints: Vec<Endpoint>) {
        self.send_control(ControlMessage::Update(endpoints));
    }

    pub fn disconnect(&self) {
        self.send_control(ControlMessage::Disconnect);
    }

    /// Stop the worker and wait for it.
    pub fn kill_join(&mut self) {
        let _ = self.control_tx.send(ControlMessage::Kill);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }

    fn send_control(&self, message: ControlMessage) {
        if self.control_tx.send(message).is_err() {
            debug!(handle = %self.info, "control message after worker exit");
        }
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        self.kill_join();
    }
}

async fn run(
    info: HandleInfo,
    cache: Arc<MessageCache>,
    responses: ResponseFn,
    control_rx: Receiver<ControlMessage>,
) {
    let identity = format!("{}.{}", info, Uuid::new_v4());
    let mut balancer = Balancer::new(identity);
    let mut endpoints: Vec<Endpoint> = Vec::new();
    let mut connected = false;
    let mut running = true;
    let mut last_activity = Instant::now();
    let mut last_expiry = Instant::now();

    debug!(handle = %info, "message dispatch started");

    while running {
        // Control first; a kill beats everything else.
        loop {
            match control_rx.try_recv() {
                Ok(ControlMessage::Kill) | Err(TryRecvError::Disconnected) => {
                    running = false;
                    break;
                }
                Ok(control) => {
                    apply_control(control, &mut balancer, &mut endpoints, &mut connected, &cache)
                        .await;
                }
                Err(TryRecvError::Empty) => break,
            }
        }
        if !running {
            break;
        }

        // Dispatch a bounded batch of new messages.
        if connected {
            for _ in 0..SEND_BATCH {
                let Some(message) = cache.pop_new() else {
                    break;
                };
                match balancer.send(&message).await {
                    Some(endpoint) => {
                        trace!(uuid = %message.uuid(), endpoint = %endpoint, "message sent");
                        cache.move_to_sent(endpoint, message);
                        last_activity = Instant::now();
                    }
                    None => {
                        // Nothing reachable; put it back and wait.
                        cache.enqueue_priority(message);
                        break;
                    }
                }
            }
        }

        // Drain replies. Poll short right after activity, longer once the
        // socket has gone quiet.
        if connected {
            let poll = if last_activity.elapsed() > IDLE_AFTER {
                LONG_POLL
            } else {
                FAST_POLL
            };
            let mut budget = SEND_BATCH;
            while budget > 0 {
                match tokio::time::timeout(poll, balancer.recv()).await {
                    Ok(Some(reply)) => {
                        last_activity = Instant::now();
                        process_reply(reply, &cache, &responses);
                        budget -= 1;
                    }
                    Ok(None) | Err(_) => break,
                }
            }
        } else {
            tokio::time::sleep(DISCONNECTED_NAP).await;
        }

        if last_expiry.elapsed() >= EXPIRY_INTERVAL {
            process_expired(&cache, &responses);
            last_expiry = Instant::now();
        }
    }

    // One last look at the control queue so a trailing kill is consumed.
    while control_rx.try_recv().is_ok() {}
    debug!(handle = %info, "message dispatch finished");
}

async fn apply_control(
    control: ControlMessage,
    balancer: &mut Balancer,
    endpoints: &mut Vec<Endpoint>,
    connected: &mut bool,
    cache: &MessageCache,
) {
    match control {
        ControlMessage::Connect => {
            if !*connected && !endpoints.is_empty() {
                balancer.connect(endpoints.clone()).await;
                *connected = true;
            }
        }
        ControlMessage::Update(fresh) => {
            *endpoints = fresh;
            if *connected {
                let (_, removed) = balancer.update_endpoints(endpoints.clone()).await;
                for endpoint in &removed {
                    let moved = cache.requeue_endpoint(endpoint);
                    if moved > 0 {
                        debug!(endpoint = %endpoint, moved, "in-flight messages requeued after endpoint removal");
                    }
                }
            } else if !endpoints.is_empty() {
                balancer.connect(endpoints.clone()).await;
                *connected = true;
            }
        }
        ControlMessage::Disconnect => {
            balancer.disconnect().await;
            *connected = false;
            cache.make_all_new();
        }
        ControlMessage::Kill => {}
    }
}

fn process_reply(reply: WorkerReply, cache: &MessageCache, responses: &ResponseFn) {
    match reply.kind {
        ReplyKind::Ack => {
            if !cache.on_ack(&reply.uuid) {
                trace!(uuid = %reply.uuid, "ack for unknown message");
            }
        }
        ReplyKind::Chunk(payload) => {
            if let Some(path) = cache.sent_path(&reply.uuid) {
                responses(Response::chunk(reply.uuid, path, reply.route, payload));
            }
        }
        ReplyKind::Error { code: error_code, message } => {
            if error_code == code::RESOURCE {
                // The worker side is briefly out of capacity; retry if the
                // budget allows.
                match cache.try_requeue_priority(&reply.uuid) {
                    RequeueOutcome::Requeued => {
                        debug!(uuid = %reply.uuid, "rescheduled after resource error");
                    }
                    RequeueOutcome::RetriesExhausted(msg) => {
                        responses(Response::error(
                            reply.uuid,
                            msg.path().clone(),
                            reply.route,
                            error_code,
                            message,
                        ));
                    }
                    RequeueOutcome::NotFound => {}
                }
            } else if let Some(msg) = cache.on_terminal(&reply.uuid) {
                responses(Response::error(
                    reply.uuid,
                    msg.path().clone(),
                    reply.route,
                    error_code,
                    message,
                ));
            }
        }
        ReplyKind::Choke => {
            if let Some(msg) = cache.on_terminal(&reply.uuid) {
                responses(Response::choke(reply.uuid, msg.path().clone(), reply.route));
            }
        }
    }
}

fn process_expired(cache: &MessageCache, responses: &ResponseFn) {
    for expired in cache.collect_expired(Instant::now()) {
        match expired.reason {
            ExpiryReason::Deadline => {
                responses(Response::error(
                    expired.message.uuid().to_owned(),
                    expired.message.path().clone(),
                    String::new(),
                    code::DEADLINE,
                    "message expired",
                ));
            }
            ExpiryReason::AckTimeout => {
                let mut message = expired.message;
                if message.can_retry() {
                    message.bump_retries();
                    message.mark_unsent();
                    debug!(uuid = %message.uuid(), retry = message.retry_count(), "no ack, rescheduled");
                    cache.enqueue_priority(message);
                } else {
                    cache.discard(&message);
                    responses(Response::error(
                        message.uuid().to_owned(),
                        message.path().clone(),
                        String::new(),
                        code::REQUEST,
                        "server did not reply with ack in time",
                    ));
                }
            }
        }
    }
}
