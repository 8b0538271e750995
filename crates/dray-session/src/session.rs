//! One session per transport connection.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use dray_protocol::{Graph, Tag, Transition};
use dray_wire::frame::{self, Frame, FrameDecoder};
use parking_lot::Mutex;
use rmpv::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::dispatch::{Dispatch, Flow};
use crate::error::SessionError;
use crate::upstream::Upstream;

/// Lifecycle of one multiplexed channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelState {
    /// Both directions live.
    Open,
    /// The local upstream reached a terminal event; inbound continues.
    HalfClosedUp,
    /// Inbound reached a terminal event; the id is revoked.
    HalfClosedDown,
    /// Both directions done.
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Open => "open",
            ChannelState::HalfClosedUp => "half-closed-up",
            ChannelState::HalfClosedDown => "half-closed-down",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

struct ChannelRecord {
    dispatch: Arc<dyn Dispatch>,
    state: ChannelState,
}

struct State {
    channels: HashMap<u64, ChannelRecord>,
    // The highest channel id this session has handed out or seen. Checking
    // that fresh inbound ids are always higher works like an infinite
    // TIME_WAIT: with 2^64 ids available, never reusing one is cheap.
    max_channel: u64,
    detached: Option<SessionError>,
}

/// A session owns one transport connection and multiplexes channels on it.
///
/// All mutating operations synchronize on an internal lock. One reader task
/// routes inbound frames to channel dispatches; one writer task drains the
/// outbound queue, so frames pushed through the same upstream keep their
/// order. Frames on different channels have no ordering relation.
pub struct Session {
    prototype: Arc<dyn Dispatch>,
    state: Mutex<State>,
    writer_tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Attach a session to a transport and start its reactor tasks.
    ///
    /// Channels initiated by the peer start from `prototype`. Must be
    /// called from within a tokio runtime.
    pub fn bind<T>(transport: T, prototype: Arc<dyn Dispatch>) -> Arc<Session>
    where
        T: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (mut rd, mut wr) = tokio::io::split(transport);
        let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();

        let session = Arc::new(Session {
            prototype,
            state: Mutex::new(State {
                channels: HashMap::new(),
                max_channel: 0,
                detached: None,
            }),
            writer_tx: Mutex::new(Some(tx)),
            reader: Mutex::new(None),
        });

        let weak = Arc::downgrade(&session);
        tokio::spawn(async move {
            while let Some(bytes) = rx.recv().await {
                if let Err(e) = wr.write_all(&bytes).await {
                    if let Some(session) = weak.upgrade() {
                        session.detach(SessionError::Transport(e.to_string()));
                    }
                    break;
                }
            }
        });

        let weak = Arc::downgrade(&session);
        let reader = tokio::spawn(async move {
            let mut decoder = FrameDecoder::new();
            let mut buf = [0u8; 8192];
            'io: loop {
                let n = match rd.read(&mut buf).await {
                    Ok(0) => {
                        if let Some(session) = weak.upgrade() {
                            session.detach(SessionError::Transport("closed by peer".into()));
                        }
                        break;
                    }
                    Ok(n) => n,
                    Err(e) => {
                        if let Some(session) = weak.upgrade() {
                            session.detach(SessionError::Transport(e.to_string()));
                        }
                        break;
                    }
                };

                decoder.feed(&buf[..n]);
                loop {
                    match decoder.next() {
                        Ok(Some(frame)) => {
                            let Some(session) = weak.upgrade() else {
                                break 'io;
                            };
                            session.invoke(frame);
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(error = %e, "frame decode failed, detaching session");
                            if let Some(session) = weak.upgrade() {
                                session.detach(SessionError::Parse(e));
                            }
                            break 'io;
                        }
                    }
                }
            }
        });
        *session.reader.lock() = Some(reader);

        session
    }

    /// Allocate the next channel, install `dispatch` for its inbound
    /// frames, and return an upstream typed by `tag` for the outbound side.
    pub fn fork(
        self: &Arc<Self>,
        dispatch: Arc<dyn Dispatch>,
        tag: Tag,
    ) -> Result<Upstream, SessionError> {
        let id = {
            let mut st = self.state.lock();
            if let Some(reason) = &st.detached {
                return Err(reason.clone());
            }
            st.max_channel += 1;
            let id = st.max_channel;
            st.channels.insert(
                id,
                ChannelRecord {
                    dispatch,
                    state: ChannelState::Open,
                },
            );
            id
        };

        trace!(channel = id, "forked channel");
        Ok(Upstream::new(Arc::downgrade(self), id, Some(tag.graph())))
    }

    /// Enqueue one outbound frame. The writer task drains in order.
    pub fn push(&self, frame: Frame) -> Result<(), SessionError> {
        {
            let st = self.state.lock();
            if let Some(reason) = &st.detached {
                return Err(reason.clone());
            }
        }

        let bytes = frame::encode(frame.channel, frame.message, &frame.args)
            .map_err(|e| SessionError::Encode(e.to_string()))?;

        let guard = self.writer_tx.lock();
        match guard.as_ref() {
            Some(tx) => tx.send(bytes).map_err(|_| SessionError::NotConnected),
            None => Err(SessionError::NotConnected),
        }
    }

    pub(crate) fn push_on(
        &self,
        channel: u64,
        slot: u32,
        args: Vec<Value>,
    ) -> Result<(), SessionError> {
        self.push(Frame::new(channel, slot, args))
    }

    /// Route one inbound frame to its channel dispatch.
    ///
    /// Fresh channel ids start from the session prototype; ids at or below
    /// the watermark that have no record were revoked and are ignored.
    pub fn invoke(self: &Arc<Self>, frame: Frame) {
        let dispatch = {
            let mut st = self.state.lock();
            if st.detached.is_some() {
                return;
            }
            match st.channels.get(&frame.channel) {
                Some(record) => record.dispatch.clone(),
                None => {
                    if frame.channel > st.max_channel {
                        st.max_channel = frame.channel;
                        st.channels.insert(
                            frame.channel,
                            ChannelRecord {
                                dispatch: self.prototype.clone(),
                                state: ChannelState::Open,
                            },
                        );
                        self.prototype.clone()
                    } else {
                        trace!(channel = frame.channel, "frame for revoked channel dropped");
                        return;
                    }
                }
            }
        };

        let graph = dispatch.graph();
        let event = match graph.get(frame.message) {
            Some(event) => *event,
            None => {
                debug!(
                    channel = frame.channel,
                    slot = frame.message,
                    protocol = %graph.tag(),
                    "unknown slot"
                );
                self.reply_error(
                    frame.channel,
                    graph,
                    SessionError::Protocol { slot: frame.message },
                );
                return;
            }
        };

        let upstream_graph = event.upstream.map(|t| resolve(t, graph));
        let upstream = Upstream::new(Arc::downgrade(self), frame.channel, upstream_graph);

        match dispatch.invoke(&event, frame.args, upstream) {
            Ok(flow) => {
                let mut st = self.state.lock();
                if event.dispatch.is_none() || matches!(flow, Flow::Terminal) {
                    revoke(&mut st, frame.channel);
                } else if let Flow::Become(next) = flow {
                    if let Some(record) = st.channels.get_mut(&frame.channel) {
                        record.dispatch = next;
                    }
                }
            }
            Err(e) => {
                warn!(channel = frame.channel, error = %e, "dispatch failed, revoking channel");
                let reply_graph = event.upstream.map(|t| resolve(t, graph)).unwrap_or(graph);
                self.reply_error(frame.channel, reply_graph, e);
                let mut st = self.state.lock();
                revoke(&mut st, frame.channel);
            }
        }
    }

    /// Close the transport and fail every live channel.
    ///
    /// Each channel dispatch is discarded exactly once; all further
    /// operations fail with `NotConnected`.
    pub fn detach(&self, error: SessionError) {
        let victims: Vec<Arc<dyn Dispatch>> = {
            let mut st = self.state.lock();
            if st.detached.is_some() {
                return;
            }
            st.detached = Some(error.clone());
            st.channels.drain().map(|(_, r)| r.dispatch).collect()
        };

        debug!(reason = %error, channels = victims.len(), "session detached");

        // Dropping the sender lets the writer task drain and exit.
        *self.writer_tx.lock() = None;
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }

        for dispatch in victims {
            dispatch.discard(&error);
        }
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached.is_some()
    }

    /// Channel listing for diagnostics.
    pub fn active_channels(&self) -> Vec<(u64, String, ChannelState)> {
        let st = self.state.lock();
        let mut list: Vec<_> = st
            .channels
            .iter()
            .map(|(id, r)| (*id, r.dispatch.name().to_owned(), r.state))
            .collect();
        list.sort_by_key(|(id, _, _)| *id);
        list
    }

    pub(crate) fn on_upstream_terminal(&self, channel: u64) {
        let mut st = self.state.lock();
        if let Some(record) = st.channels.get_mut(&channel) {
            if record.state == ChannelState::Open {
                record.state = ChannelState::HalfClosedUp;
            }
        }
    }

    fn reply_error(&self, channel: u64, graph: &'static Graph, error: SessionError) {
        let Some(event) = graph.event_named("error") else {
            return;
        };
        let args = vec![
            Value::from(error_code(&error)),
            Value::from(error.to_string()),
        ];
        if let Err(e) = self.push_on(channel, event.id, args) {
            debug!(channel, error = %e, "error reply dropped");
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.lock().take() {
            reader.abort();
        }
    }
}

fn resolve(transition: Transition, current: &'static Graph) -> &'static Graph {
    match transition {
        Transition::Recursive => current,
        Transition::To(tag) => tag.graph(),
    }
}

fn revoke(st: &mut State, channel: u64) {
    if let Some(mut record) = st.channels.remove(&channel) {
        record.state = match record.state {
            ChannelState::HalfClosedUp => ChannelState::Closed,
            _ => ChannelState::HalfClosedDown,
        };
        trace!(channel, state = %record.state, "channel revoked");
    }
}

fn error_code(error: &SessionError) -> i64 {
    match error {
        SessionError::Protocol { .. } => 404,
        _ => 500,
    }
}
