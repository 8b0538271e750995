//! Router-style socket over per-endpoint TCP connections.
//!
//! The dealer side of the worker wire needs to address specific workers
//! and receive from any of them. This socket keeps one TCP connection per
//! transport address; sends pick a connection explicitly, receives are
//! funneled from all connection readers into one queue tagged with the
//! source address.

use std::collections::HashMap;

use bytes::Bytes;
use dray_wire::multipart::{self, Multipart, MultipartDecoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

const RECV_QUEUE: usize = 256;

struct Conn {
    tx: mpsc::UnboundedSender<Bytes>,
    reader: JoinHandle<()>,
}

pub struct RouterSocket {
    conns: HashMap<String, Conn>,
    recv_tx: mpsc::Sender<(String, Multipart)>,
    recv_rx: mpsc::Receiver<(String, Multipart)>,
}

impl RouterSocket {
    pub fn new() -> Self {
        let (recv_tx, recv_rx) = mpsc::channel(RECV_QUEUE);
        RouterSocket {
            conns: HashMap::new(),
            recv_tx,
            recv_rx,
        }
    }

    /// Open a connection to `address` if none exists. Returns whether a
    /// live connection is available afterwards.
    pub async fn connect(&mut self, address: &str) -> bool {
        if let Some(conn) = self.conns.get(address) {
            if !conn.tx.is_closed() {
                return true;
            }
            self.drop_conn(address);
        }

        let stream = match TcpStream::connect(address).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(address, error = %e, "endpoint connect failed");
                return false;
            }
        };
        let (mut rd, mut wr) = stream.into_split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Bytes>();
        tokio::spawn(async move {
            while let Some(bytes) = out_rx.recv().await {
                if wr.write_all(&bytes).await.is_err() {
                    break;
                }
            }
        });

        let recv_tx = self.recv_tx.clone();
        let tag = address.to_owned();
        let reader = tokio::spawn(async move {
            let mut decoder = MultipartDecoder::new();
            let mut buf = [0u8; 8192];
            loop {
                let n = match rd.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => n,
                };
                decoder.feed(&buf[..n]);
                loop {
                    match decoder.next() {
                        Ok(Some(parts)) => {
                            if recv_tx.send((tag.clone(), parts)).await.is_err() {
                                return;
                            }
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(address = %tag, error = %e, "reply framing error, dropping connection");
                            return;
                        }
                    }
                }
            }
        });

        debug!(address, "endpoint connected");
        self.conns.insert(
            address.to_owned(),
            Conn {
                tx: out_tx,
                reader,
            },
        );
        true
    }

    /// Queue one multipart message for `address`. False when there is no
    /// live connection or the message cannot be framed.
    pub fn send_to(&mut self, address: &str, parts: &[Bytes]) -> bool {
        let Some(conn) = self.conns.get(address) else {
            return false;
        };
        if conn.tx.is_closed() {
            self.drop_conn(address);
            return false;
        }
        match multipart::encode(parts) {
            Ok(bytes) => conn.tx.send(bytes).is_ok(),
            Err(e) => {
                warn!(address, error = %e, "outbound message dropped");
                false
            }
        }
    }

    /// Wait for the next inbound message from any connection.
    pub async fn recv(&mut self) -> Option<(String, Multipart)> {
        self.recv_rx.recv().await
    }

    pub fn is_connected(&self, address: &str) -> bool {
        self.conns
            .get(address)
            .is_some_and(|conn| !conn.tx.is_closed())
    }

    pub fn connected_count(&self) -> usize {
        self.conns.values().filter(|c| !c.tx.is_closed()).count()
    }

    /// Tear down every connection.
    pub fn disconnect_all(&mut self) {
        for (_, conn) in self.conns.drain() {
            conn.reader.abort();
        }
    }

    fn drop_conn(&mut self, address: &str) {
        if let Some(conn) = self.conns.remove(address) {
            conn.reader.abort();
        }
    }
}

impl Default for RouterSocket {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for RouterSocket {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}
