//! The dealer: a client library that finds, load-balances across, and talks
//! to remote worker endpoints discovered through heartbeats.
//!
//! A [`Dealer`] is constructed from a JSON configuration naming services.
//! Each service lazily grows [`handle`] workers as the heartbeat collector
//! reveals handle names; every handle owns a worker thread, a router-style
//! socket over the live endpoints and a [`cache::MessageCache`] giving
//! at-least-once delivery with acknowledgements, bounded retries and
//! deadline expiry. Responses flow back through a per-service dispatcher
//! thread into the callback registered per message uuid.

pub mod balancer;
pub mod cache;
pub mod config;
pub mod context;
pub mod dealer;
pub mod endpoint;
pub mod error;
pub mod handle;
pub mod heartbeat;
pub mod logging;
pub mod message;
pub mod response;
pub mod service;
pub mod socket;
pub mod storage;

pub use cache::MessageCache;
pub use config::Config;
pub use context::Context;
pub use dealer::Dealer;
pub use endpoint::Endpoint;
pub use error::{code, DealerError, ErrorCategory};
pub use message::{Message, MessagePath, MessagePolicy};
pub use response::{Response, ResponseCode, ResponseSink};
