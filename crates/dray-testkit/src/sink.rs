//! A response sink that collects callback events for assertions.

use std::sync::mpsc::{Receiver, Sender};
use std::sync::Arc;

use dray_dealer::{Response, ResponseSink};

pub struct CollectingSink {
    tx: Sender<Response>,
}

impl CollectingSink {
    /// Returns the sink (to hand to `send_message`) and the receiver the
    /// test drains.
    pub fn channel() -> (Arc<CollectingSink>, Receiver<Response>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Arc::new(CollectingSink { tx }), rx)
    }
}

impl ResponseSink for CollectingSink {
    fn on_response(&self, response: &Response) {
        let _ = self.tx.send(response.clone());
    }
}
