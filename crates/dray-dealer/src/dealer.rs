//! The user-facing dealer object.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::config::CacheKind;
use crate::context::Context;
use crate::error::DealerError;
use crate::heartbeat::{HeartbeatCallback, HeartbeatCollector};
use crate::message::{Message, MessagePath, MessagePolicy};
use crate::response::ResponseSink;
use crate::service::{Service, ServiceInfo};
use crate::storage::BlobStore;

/// Binds user code to remote workers.
///
/// Construction loads the configuration, starts one service object per
/// configured alias (restoring persisted messages when the cache is
/// persistent) and launches the heartbeat collector that feeds endpoint
/// snapshots to the services. Dropping the dealer stops the collector,
/// kills every handle worker and joins all threads.
pub struct Dealer {
    context: Arc<Context>,
    services: HashMap<String, Arc<Service>>,
    heartbeat: Mutex<Option<HeartbeatCollector>>,
}

impl Dealer {
    pub fn new(config_path: &Path) -> Result<Dealer, DealerError> {
        let context = Arc::new(Context::new(config_path)?);
        Self::with_context(context)
    }

    pub fn with_context(context: Arc<Context>) -> Result<Dealer, DealerError> {
        let config = context.config();
        let persistent = config.message_cache.kind == CacheKind::Persistent;

        let mut services = HashMap::new();
        for (alias, service_config) in &config.services {
            let store = if persistent {
                Some(Arc::new(BlobStore::open(
                    config.persistent_storage.eblob_path.join(alias),
                    config.persistent_storage.eblob_sync_interval,
                )?))
            } else {
                None
            };

            let info = ServiceInfo {
                alias: alias.clone(),
                app: service_config.app.clone(),
                description: service_config.description.clone(),
            };
            debug!(service = %alias, app = %info.app, "starting service");
            let service = Arc::new(Service::start(info, store.clone())?);

            if let Some(store) = &store {
                restore_messages(store, &service, alias)?;
            }
            services.insert(alias.clone(), service);
        }

        let callback: HeartbeatCallback = {
            let services = services.clone();
            Arc::new(move |alias: &str, handles| match services.get(alias) {
                Some(service) => service.refresh(handles),
                None => warn!(service = %alias, "snapshot for an unknown service"),
            })
        };
        let heartbeat = HeartbeatCollector::start(&config.services, callback)?;

        debug!("dealer created");
        Ok(Dealer {
            context,
            services,
            heartbeat: Mutex::new(Some(heartbeat)),
        })
    }

    pub fn context(&self) -> &Arc<Context> {
        &self.context
    }

    /// The default policy: everything from `MessagePolicy::default` plus
    /// the configured default deadline.
    pub fn default_policy(&self) -> MessagePolicy {
        MessagePolicy {
            deadline: self.context.config().default_deadline(),
            ..Default::default()
        }
    }

    pub fn create_message(
        &self,
        path: MessagePath,
        policy: MessagePolicy,
        payload: Bytes,
    ) -> Result<Message, DealerError> {
        Message::new(path, policy, payload)
    }

    /// Register the sink for the message's uuid and queue the message for
    /// dispatch. Returns the uuid.
    pub fn send_message(
        &self,
        message: Message,
        sink: &Arc<dyn ResponseSink>,
    ) -> Result<String, DealerError> {
        let service =
            self.services
                .get(message.path().service())
                .ok_or_else(|| DealerError::Location {
                    path: message.path().service().to_owned(),
                })?;

        let uuid = message.uuid().to_owned();
        service.register_callback(&uuid, sink);
        if let Err(e) = service.send_message(message) {
            service.unregister_callback(&uuid);
            return Err(e);
        }
        debug!(uuid = %uuid, "message enqueued");
        Ok(uuid)
    }

    pub fn unset_response_callback(&self, uuid: &str, path: &MessagePath) {
        if let Some(service) = self.services.get(path.service()) {
            service.unregister_callback(uuid);
        }
    }

    /// Whether the handle named by `path` currently exists.
    pub fn has_handle(&self, path: &MessagePath) -> bool {
        self.services
            .get(path.service())
            .is_some_and(|s| s.has_handle(path.handle()))
    }

    /// `(pending, in flight)` for the handle named by `path`.
    pub fn queue_counts(&self, path: &MessagePath) -> Option<(usize, usize)> {
        self.services
            .get(path.service())?
            .queue_counts(path.handle())
    }

    /// Messages parked for a handle that does not exist yet.
    pub fn orphan_count(&self, path: &MessagePath) -> usize {
        self.services
            .get(path.service())
            .map_or(0, |s| s.orphan_count(path.handle()))
    }

    /// Graceful teardown: stop discovery, kill handles, join threads.
    pub fn shutdown(&self) {
        if let Some(mut heartbeat) = self.heartbeat.lock().take() {
            heartbeat.stop();
        }
        for service in self.services.values() {
            service.shutdown();
        }
        debug!("dealer destroyed");
    }
}

impl Drop for Dealer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn restore_messages(
    store: &Arc<BlobStore>,
    service: &Arc<Service>,
    alias: &str,
) -> Result<(), DealerError> {
    let stored = store.iterate()?;
    if stored.is_empty() {
        return Ok(());
    }
    debug!(service = %alias, count = stored.len(), "restoring messages from the persistent cache");
    for item in stored {
        let message = item.into_message();
        if let Err(e) = service.send_message(message) {
            warn!(service = %alias, error = %e, "restored message could not be enqueued");
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::response::Response;

    struct NullSink;
    impl ResponseSink for NullSink {
        fn on_response(&self, _response: &Response) {}
    }

    #[test]
    fn unknown_service_is_a_location_error() {
        let config = Config::parse(r#"{ "version": 1 }"#).unwrap();
        let dealer = Dealer::with_context(Arc::new(Context::from_config(config))).unwrap();

        let message = dealer
            .create_message(
                MessagePath::new("ghost", "h"),
                MessagePolicy::default(),
                Bytes::from_static(b"x"),
            )
            .unwrap();
        let sink: Arc<dyn ResponseSink> = Arc::new(NullSink);
        let err = dealer.send_message(message, &sink).unwrap_err();
        assert_eq!(err.code(), crate::error::code::LOCATION);
    }

    #[test]
    fn default_policy_carries_the_configured_deadline() {
        let config =
            Config::parse(r#"{ "version": 1, "default_message_deadline": 2.5 }"#).unwrap();
        let dealer = Dealer::with_context(Arc::new(Context::from_config(config))).unwrap();
        assert_eq!(
            dealer.default_policy().deadline,
            std::time::Duration::from_secs_f64(2.5)
        );
    }
}
