//! A scriptable worker on the other end of the dealer wire.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use dray_protocol::worker;
use dray_wire::multipart::{self, MultipartDecoder};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::debug;

/// What the worker does with each request it actually processes.
#[derive(Clone, Debug)]
pub enum ReplyScript {
    /// ACK, one chunk with the payload reversed, CHOKE.
    EchoReversed,
    /// ACK, the given chunks in order, CHOKE.
    Chunks(Vec<Vec<u8>>),
    /// ACK, then a terminal error.
    ErrorAfterAck { code: i32, message: String },
    /// ACK and nothing else.
    AckOnly,
    /// No reply at all.
    Silent,
}

/// One stub worker listening on a local port.
pub struct StubWorker {
    address: String,
    route: String,
    requests: Arc<Mutex<Vec<String>>>,
    dropped: Arc<AtomicUsize>,
    shutdown: Option<mpsc::Sender<()>>,
    thread: Option<std::thread::JoinHandle<()>>,
}

impl StubWorker {
    /// Spawn a worker with the given reply script. The first `drop_first`
    /// requests are swallowed without any reply.
    pub fn spawn(route: &str, script: ReplyScript, drop_first: usize) -> StubWorker {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("stub worker bind");
        listener.set_nonblocking(true).expect("stub worker nonblocking");
        let address = listener.local_addr().expect("stub worker addr").to_string();

        let requests = Arc::new(Mutex::new(Vec::new()));
        let dropped = Arc::new(AtomicUsize::new(0));
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let thread = {
            let route = route.to_owned();
            let requests = requests.clone();
            let dropped = dropped.clone();
            std::thread::spawn(move || {
                let runtime = tokio::runtime::Builder::new_current_thread()
                    .enable_all()
                    .build()
                    .expect("stub worker runtime");
                runtime.block_on(async move {
                    let listener = TcpListener::from_std(listener).expect("stub worker listener");
                    let seen = Arc::new(AtomicUsize::new(0));
                    loop {
                        tokio::select! {
                            _ = shutdown_rx.recv() => break,
                            accepted = listener.accept() => {
                                let Ok((stream, peer)) = accepted else { break };
                                debug!(%peer, "stub worker accepted");
                                tokio::spawn(serve(
                                    stream,
                                    route.clone(),
                                    script.clone(),
                                    drop_first,
                                    seen.clone(),
                                    requests.clone(),
                                    dropped.clone(),
                                ));
                            }
                        }
                    }
                });
            })
        };

        StubWorker {
            address,
            route: route.to_owned(),
            requests,
            dropped,
            shutdown: Some(shutdown_tx),
            thread: Some(thread),
        }
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn route(&self) -> &str {
        &self.route
    }

    /// Uuids of processed requests, in arrival order.
    pub fn received(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    pub fn received_count(&self) -> usize {
        self.requests.lock().len()
    }

    pub fn dropped_count(&self) -> usize {
        self.dropped.load(Ordering::SeqCst)
    }
}

impl Drop for StubWorker {
    fn drop(&mut self) {
        drop(self.shutdown.take());
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    stream: tokio::net::TcpStream,
    route: String,
    script: ReplyScript,
    drop_first: usize,
    seen: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<String>>>,
    dropped: Arc<AtomicUsize>,
) {
    let (mut rd, mut wr) = stream.into_split();
    let mut decoder = MultipartDecoder::new();
    let mut buf = [0u8; 8192];

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
            // Request wire: [route, empty, uuid, policy, payload].
            if parts.len() != 5 {
                continue;
            }
            let Ok(uuid) = dray_wire::unpack::<String>(&parts[2]) else {
                continue;
            };
            let payload = parts[4].clone();

            let order = seen.fetch_add(1, Ordering::SeqCst);
            if order < drop_first {
                dropped.fetch_add(1, Ordering::SeqCst);
                continue;
            }
            requests.lock().push(uuid.clone());

            let replies = build_replies(&route, &uuid, &payload, &script);
            for reply in replies {
                let Ok(wire) = multipart::encode(&reply) else {
                    return;
                };
                if wr.write_all(&wire).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn build_replies(
    route: &str,
    uuid: &str,
    payload: &Bytes,
    script: &ReplyScript,
) -> Vec<Vec<Bytes>> {
    let head = |code: u32| -> Vec<Bytes> {
        vec![
            Bytes::copy_from_slice(route.as_bytes()),
            Bytes::new(),
            Bytes::from(dray_wire::pack(&uuid).expect("pack uuid")),
            Bytes::from(dray_wire::pack(&code).expect("pack code")),
        ]
    };

    match script {
        ReplyScript::Silent => Vec::new(),
        ReplyScript::AckOnly => vec![head(worker::ACK)],
        ReplyScript::EchoReversed => {
            let reversed: Vec<u8> = payload.iter().rev().copied().collect();
            let mut chunk = head(worker::CHUNK);
            chunk.push(Bytes::from(reversed));
            vec![head(worker::ACK), chunk, head(worker::CHOKE)]
        }
        ReplyScript::Chunks(chunks) => {
            let mut replies = vec![head(worker::ACK)];
            for body in chunks {
                let mut chunk = head(worker::CHUNK);
                chunk.push(Bytes::from(body.clone()));
                replies.push(chunk);
            }
            replies.push(head(worker::CHOKE));
            replies
        }
        ReplyScript::ErrorAfterAck { code, message } => {
            let mut error = head(worker::ERROR);
            error.push(Bytes::from(dray_wire::pack(code).expect("pack error code")));
            error.push(Bytes::from(
                dray_wire::pack(message).expect("pack error message"),
            ));
            vec![head(worker::ACK), error]
        }
    }
}
