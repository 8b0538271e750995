//! Test doubles for exercising the dealer end to end: a scriptable stub
//! worker speaking the worker wire, a stub node answering the heartbeat
//! info probe, and a response sink that collects callback events.

pub mod node;
pub mod sink;
pub mod worker;

pub use node::{AppSpec, NodeSpec, StubNode};
pub use sink::CollectingSink;
pub use worker::{ReplyScript, StubWorker};
