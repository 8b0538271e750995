//! Service objects: handle lifecycle, orphan queues and response dispatch.
//!
//! A service owns the handles the heartbeat view reveals for its app.
//! Messages addressed to a handle that does not exist yet wait in a
//! per-name orphan queue and are spliced into the handle's cache when it
//! appears; a retired handle's queues merge back so a later recreation can
//! re-dispatch them. One dispatcher thread per service drains the response
//! queues and invokes user callbacks with every lock released.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::{debug, error, warn};

use crate::cache::MessageCache;
use crate::endpoint::Endpoint;
use crate::error::{code, DealerError};
use crate::handle::{Handle, HandleInfo, ResponseFn};
use crate::message::Message;
use crate::response::{Response, ResponseSink};
use crate::storage::BlobStore;

/// Cadence of the orphan-queue deadline sweep.
const SWEEP_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Clone, Debug)]
pub struct ServiceInfo {
    pub alias: String,
    pub app: String,
    pub description: String,
}

struct State {
    handles: HashMap<String, Handle>,
    orphans: HashMap<String, VecDeque<Message>>,
    callbacks: HashMap<String, Weak<dyn ResponseSink>>,
    responses: HashMap<String, VecDeque<Response>>,
}

struct Inner {
    info: ServiceInfo,
    store: Option<Arc<BlobStore>>,
    state: Mutex<State>,
    cond: Condvar,
    running: AtomicBool,
    dead: AtomicBool,
}

pub struct Service {
    inner: Arc<Inner>,
    dispatcher: Mutex<Option<std::thread::JoinHandle<()>>>,
}

impl Service {
    pub fn start(info: ServiceInfo, store: Option<Arc<BlobStore>>) -> Result<Service, DealerError> {
        let inner = Arc::new(Inner {
            info: info.clone(),
            store,
            state: Mutex::new(State {
                handles: HashMap::new(),
                orphans: HashMap::new(),
                callbacks: HashMap::new(),
                responses: HashMap::new(),
            }),
            cond: Condvar::new(),
            running: AtomicBool::new(true),
            dead: AtomicBool::new(false),
        });

        let dispatcher = {
            let inner = inner.clone();
            std::thread::Builder::new()
                .name(format!("dray-service-{}", info.alias))
                .spawn(move || dispatch_responses(inner))?
        };

        Ok(Service {
            inner,
            dispatcher: Mutex::new(Some(dispatcher)),
        })
    }

    pub fn info(&self) -> &ServiceInfo {
        &self.inner.info
    }

    pub fn is_dead(&self) -> bool {
        self.inner.dead.load(Ordering::Acquire)
    }

    pub fn register_callback(&self, uuid: &str, sink: &Arc<dyn ResponseSink>) {
        let mut state = self.inner.state.lock();
        state.callbacks.insert(uuid.to_owned(), Arc::downgrade(sink));
    }

    pub fn unregister_callback(&self, uuid: &str) {
        let mut state = self.inner.state.lock();
        state.callbacks.remove(uuid);
    }

    /// Route a message to its handle, or park it in the orphan queue when
    /// the handle is not known yet.
    pub fn send_message(&self, message: Message) -> Result<(), DealerError> {
        if self.is_dead() {
            return Err(DealerError::Request {
                message: format!("service '{}' is being killed", self.inner.info.alias),
            });
        }

        // Commit before the message becomes visible anywhere so a crash
        // between routing steps cannot drop accepted work.
        if let Some(store) = &self.inner.store {
            if !store.contains(message.uuid()) {
                store.commit(&message).map_err(|e| {
                    DealerError::Internal(format!("persistent commit failed: {}", e))
                })?;
            }
        }

        let handle_name = message.path().handle().to_owned();
        let urgent = message.policy().urgent;
        let cache = {
            let mut state = self.inner.state.lock();
            match state.handles.get(&handle_name) {
                Some(handle) => handle.cache().clone(),
                None => {
                    let queue = state.orphans.entry(handle_name).or_default();
                    if urgent {
                        queue.push_front(message);
                    } else {
                        queue.push_back(message);
                    }
                    return Ok(());
                }
            }
        };
        if urgent {
            // Urgent messages jump the queue; the blob is already on disk.
            cache.enqueue_priority(message);
            Ok(())
        } else {
            cache.enqueue(message)
        }
    }

    /// Apply one heartbeat snapshot: create handles for new names, update
    /// endpoint sets for existing ones, retire the ones that vanished.
    pub fn refresh(&self, snapshot: &BTreeMap<String, Vec<Endpoint>>) {
        if self.is_dead() {
            return;
        }

        let retired: Vec<(String, Handle)> = {
            let mut state = self.inner.state.lock();
            let names: Vec<String> = state
                .handles
                .keys()
                .filter(|name| !snapshot.contains_key(*name))
                .cloned()
                .collect();
            names
                .into_iter()
                .filter_map(|name| state.handles.remove(&name).map(|h| (name, h)))
                .collect()
        };

        for (name, mut handle) in retired {
            debug!(service = %self.inner.info.alias, handle = %name, "retiring handle");
            handle.kill_join();
            handle.cache().make_all_new();
            let leftovers = handle.cache().drain_new();
            if !leftovers.is_empty() {
                debug!(
                    service = %self.inner.info.alias,
                    handle = %name,
                    messages = leftovers.len(),
                    "messages moved back to the orphan queue"
                );
                let mut state = self.inner.state.lock();
                state.orphans.entry(name).or_default().extend(leftovers);
            }
        }

        for (name, endpoints) in snapshot {
            let exists = {
                let state = self.inner.state.lock();
                if let Some(handle) = state.handles.get(name) {
                    handle.update_endpoints(endpoints.clone());
                    true
                } else {
                    false
                }
            };
            if exists {
                continue;
            }

            let cache = Arc::new(MessageCache::with_store(self.inner.store.clone()));
            let responses: ResponseFn = {
                let inner = Arc::downgrade(&self.inner);
                Arc::new(move |response| {
                    if let Some(inner) = inner.upgrade() {
                        enqueue_response(&inner, response);
                    }
                })
            };
            let info = HandleInfo {
                service: self.inner.info.alias.clone(),
                name: name.clone(),
            };
            match Handle::start(info, cache, endpoints.clone(), responses) {
                Ok(handle) => {
                    let orphaned = {
                        let mut state = self.inner.state.lock();
                        state.orphans.remove(name)
                    };
                    if let Some(queue) = orphaned {
                        debug!(
                            service = %self.inner.info.alias,
                            handle = %name,
                            messages = queue.len(),
                            "orphan queue spliced into the new handle"
                        );
                        handle.cache().append_queue(queue);
                    }
                    self.inner.state.lock().handles.insert(name.clone(), handle);
                }
                Err(e) => {
                    error!(service = %self.inner.info.alias, handle = %name, error = %e, "handle failed to start");
                }
            }
        }
    }

    pub fn has_handle(&self, name: &str) -> bool {
        self.inner.state.lock().handles.contains_key(name)
    }

    /// `(pending, in flight)` counts for one handle's cache.
    pub fn queue_counts(&self, name: &str) -> Option<(usize, usize)> {
        let state = self.inner.state.lock();
        state
            .handles
            .get(name)
            .map(|h| (h.cache().new_count(), h.cache().sent_count()))
    }

    pub fn orphan_count(&self, name: &str) -> usize {
        self.inner
            .state
            .lock()
            .orphans
            .get(name)
            .map_or(0, |q| q.len())
    }

    /// Kill every handle, stop the dispatcher, refuse new work.
    pub fn shutdown(&self) {
        if self.inner.dead.swap(true, Ordering::AcqRel) {
            return;
        }

        let handles: Vec<Handle> = {
            let mut state = self.inner.state.lock();
            state.handles.drain().map(|(_, h)| h).collect()
        };
        for mut handle in handles {
            handle.kill_join();
        }

        self.inner.running.store(false, Ordering::Release);
        self.inner.cond.notify_all();
        if let Some(thread) = self.dispatcher.lock().take() {
            let _ = thread.join();
        }
    }
}

impl Drop for Service {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Handle-thread side: file a response under its handle queue. Responses
/// nobody registered for are dropped here.
fn enqueue_response(inner: &Arc<Inner>, response: Response) {
    {
        let mut state = inner.state.lock();
        if !state.callbacks.contains_key(&response.uuid) {
            return;
        }
        state
            .responses
            .entry(response.path.handle().to_owned())
            .or_default()
            .push_back(response);
    }
    inner.cond.notify_one();
}

fn dispatch_responses(inner: Arc<Inner>) {
    loop {
        let batch: Vec<Response> = {
            let mut state = inner.state.lock();
            loop {
                if !inner.running.load(Ordering::Acquire) {
                    return;
                }
                let batch = drain_responses(&mut state);
                if !batch.is_empty() {
                    break batch;
                }
                let result = inner.cond.wait_for(&mut state, SWEEP_INTERVAL);
                if result.timed_out() {
                    sweep_orphans(&inner, &mut state);
                }
            }
        };

        for response in batch {
            let callback = {
                let state = inner.state.lock();
                state.callbacks.get(&response.uuid).cloned()
            };
            if let Some(weak) = callback {
                match weak.upgrade() {
                    Some(sink) => sink.on_response(&response),
                    None => {
                        // The caller dropped its sink; nothing left to tell.
                        inner.state.lock().callbacks.remove(&response.uuid);
                    }
                }
            }
            if response.is_terminal() {
                inner.state.lock().callbacks.remove(&response.uuid);
            }
        }
    }
}

fn drain_responses(state: &mut State) -> Vec<Response> {
    let mut batch = Vec::new();
    for (_, queue) in state.responses.iter_mut() {
        batch.extend(queue.drain(..));
    }
    batch
}

/// Expire orphaned messages that can no longer make their deadline. Their
/// synthetic responses go through the regular queues.
fn sweep_orphans(inner: &Arc<Inner>, state: &mut State) {
    let now = Instant::now();
    let mut expired = Vec::new();

    for (handle_name, queue) in state.orphans.iter_mut() {
        let mut keep = VecDeque::with_capacity(queue.len());
        for message in queue.drain(..) {
            if message.is_expired(now) {
                expired.push((handle_name.clone(), message));
            } else {
                keep.push_back(message);
            }
        }
        *queue = keep;
    }
    state.orphans.retain(|_, q| !q.is_empty());

    for (handle_name, message) in expired {
        warn!(
            service = %inner.info.alias,
            handle = %handle_name,
            uuid = %message.uuid(),
            "orphaned message expired"
        );
        if let Some(store) = &inner.store {
            if let Err(e) = store.remove(message.uuid()) {
                warn!(uuid = %message.uuid(), error = %e, "blob removal failed");
            }
        }
        if state.callbacks.contains_key(message.uuid()) {
            let response = Response::error(
                message.uuid().to_owned(),
                message.path().clone(),
                String::new(),
                code::DEADLINE,
                "message expired",
            );
            state
                .responses
                .entry(handle_name)
                .or_default()
                .push_back(response);
        }
    }
}
