//! Static protocol graphs.
//!
//! Every RPC event carries four attributes fixed at compile time: a numeric
//! slot id, an argument tuple, a *dispatch* transition (what the callee may
//! receive next on the channel once this event lands, or terminal) and an
//! *upstream* transition (what the caller may send next). A protocol is the
//! set of events reachable under one tag; a [`Graph`] is its runtime
//! description, an immutable map from slot id to event description.
//!
//! Graphs are values. The locator hands them to remote peers so both sides
//! can validate that they agree on a tag before traffic flows.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::OnceLock;

pub mod worker;

/// Version of the RPC protocol described by these graphs.
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifies one protocol within the fixed family shipped by the runtime.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tag {
    /// Streamed replies: any number of chunks, then a terminal error or
    /// choke.
    Streaming,
    /// Single-shot replies: one value or one error.
    Primitive,
    /// Worker control channel: heartbeats until terminate.
    Control,
    /// Invocation entry point.
    Rpc,
}

impl Tag {
    /// The graph this tag describes.
    pub fn graph(self) -> &'static Graph {
        match self {
            Tag::Streaming => streaming(),
            Tag::Primitive => primitive(),
            Tag::Control => control(),
            Tag::Rpc => rpc(),
        }
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Tag::Streaming => "streaming",
            Tag::Primitive => "primitive",
            Tag::Control => "control",
            Tag::Rpc => "rpc",
        };
        f.write_str(name)
    }
}

/// Where a channel side goes after an event. Absence of a transition (the
/// `Option` wrapping this) marks the event terminal for that side.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transition {
    /// The protocol stays where it is; more events of the same set follow.
    Recursive,
    /// The protocol switches to another tag.
    To(Tag),
}

/// Static description of one RPC event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventDescription {
    /// Slot id, the `message_id` on the wire.
    pub id: u32,
    pub name: &'static str,
    /// Callee-side transition after this event is processed.
    pub dispatch: Option<Transition>,
    /// Caller-side transition after this event is sent.
    pub upstream: Option<Transition>,
}

impl EventDescription {
    pub fn is_terminal(&self) -> bool {
        self.dispatch.is_none()
    }
}

/// An immutable protocol graph: slot id to event description.
#[derive(Clone, Debug)]
pub struct Graph {
    tag: Tag,
    events: BTreeMap<u32, EventDescription>,
}

impl Graph {
    fn build(tag: Tag, events: &[EventDescription]) -> Self {
        let mut map = BTreeMap::new();
        for event in events {
            let clash = map.insert(event.id, *event);
            assert!(clash.is_none(), "duplicate slot id in protocol graph");
        }
        Graph { tag, events: map }
    }

    pub fn tag(&self) -> Tag {
        self.tag
    }

    pub fn get(&self, slot: u32) -> Option<&EventDescription> {
        self.events.get(&slot)
    }

    pub fn contains(&self, slot: u32) -> bool {
        self.events.contains_key(&slot)
    }

    pub fn events(&self) -> impl Iterator<Item = &EventDescription> {
        self.events.values()
    }

    pub fn event_named(&self, name: &str) -> Option<&EventDescription> {
        self.events.values().find(|e| e.name == name)
    }

    /// Two graphs are compatible iff their message sequences match
    /// pairwise: same slots in the same order, same names, and transitions
    /// of the same shape leading to compatible graphs.
    pub fn compatible(&self, other: &Graph) -> bool {
        let mut seen = Vec::new();
        compatible_inner(self, other, &mut seen)
    }
}

fn compatible_inner(a: &Graph, b: &Graph, seen: &mut Vec<(Tag, Tag)>) -> bool {
    if seen.contains(&(a.tag, b.tag)) {
        return true;
    }
    seen.push((a.tag, b.tag));

    if a.events.len() != b.events.len() {
        return false;
    }

    a.events.values().zip(b.events.values()).all(|(ea, eb)| {
        ea.id == eb.id
            && ea.name == eb.name
            && transitions_match(ea.dispatch, eb.dispatch, seen)
            && transitions_match(ea.upstream, eb.upstream, seen)
    })
}

fn transitions_match(
    a: Option<Transition>,
    b: Option<Transition>,
    seen: &mut Vec<(Tag, Tag)>,
) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(Transition::Recursive), Some(Transition::Recursive)) => true,
        (Some(Transition::To(ta)), Some(Transition::To(tb))) => {
            compatible_inner(ta.graph(), tb.graph(), seen)
        }
        _ => false,
    }
}

fn streaming() -> &'static Graph {
    static GRAPH: OnceLock<Graph> = OnceLock::new();
    GRAPH.get_or_init(|| {
        Graph::build(
            Tag::Streaming,
            &[
                EventDescription {
                    id: 0,
                    name: "chunk",
                    dispatch: Some(Transition::Recursive),
                    upstream: None,
                },
                EventDescription {
                    id: 1,
                    name: "error",
                    dispatch: None,
                    upstream: None,
                },
                EventDescription {
                    id: 2,
                    name: "choke",
                    dispatch: None,
                    upstream: None,
                },
            ],
        )
    })
}

fn primitive() -> &'static Graph {
    static GRAPH: OnceLock<Graph> = OnceLock::new();
    GRAPH.get_or_init(|| {
        Graph::build(
            Tag::Primitive,
            &[
                EventDescription {
                    id: 0,
                    name: "value",
                    dispatch: None,
                    upstream: None,
                },
                EventDescription {
                    id: 1,
                    name: "error",
                    dispatch: None,
                    upstream: None,
                },
            ],
        )
    })
}

fn control() -> &'static Graph {
    static GRAPH: OnceLock<Graph> = OnceLock::new();
    GRAPH.get_or_init(|| {
        Graph::build(
            Tag::Control,
            &[
                EventDescription {
                    id: 0,
                    name: "heartbeat",
                    dispatch: Some(Transition::Recursive),
                    upstream: Some(Transition::Recursive),
                },
                EventDescription {
                    id: 1,
                    name: "terminate",
                    dispatch: None,
                    upstream: None,
                },
            ],
        )
    })
}

fn rpc() -> &'static Graph {
    static GRAPH: OnceLock<Graph> = OnceLock::new();
    GRAPH.get_or_init(|| {
        Graph::build(
            Tag::Rpc,
            &[EventDescription {
                id: 0,
                name: "invoke",
                dispatch: Some(Transition::To(Tag::Streaming)),
                upstream: Some(Transition::To(Tag::Streaming)),
            }],
        )
    })
}
