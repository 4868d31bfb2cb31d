//! Peer-peer message envelope.

use std::fmt;

use crate::protocol::{NodeId, Timestamp};

use serde::{Deserialize, Serialize};

/// Protocol phase carried by an envelope.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub enum MsgKind {
    /// Ask every quorum member for its grant; multicast to the quorum.
    Request,

    /// Grant to one specific requester; unicast.
    Reply { dest: NodeId },

    /// Free the grant held for the sender; multicast to the quorum.
    Release,

    /// Sender has finished all its CS-entry cycles; sent to every node.
    Done { cycles: u32 },
}

/// Message exchanged between nodes: a protocol phase plus the shared
/// `(timestamp, sender)` payload.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Serialize, Deserialize)]
pub struct Envelope {
    pub kind: MsgKind,

    /// Sender's Lamport clock at send time.
    pub ts: Timestamp,

    /// Originating node.
    pub src: NodeId,
}

impl Envelope {
    #[inline]
    pub fn request(ts: Timestamp, src: NodeId) -> Self {
        Envelope {
            kind: MsgKind::Request,
            ts,
            src,
        }
    }

    #[inline]
    pub fn reply(ts: Timestamp, src: NodeId, dest: NodeId) -> Self {
        Envelope {
            kind: MsgKind::Reply { dest },
            ts,
            src,
        }
    }

    #[inline]
    pub fn release(ts: Timestamp, src: NodeId) -> Self {
        Envelope {
            kind: MsgKind::Release,
            ts,
            src,
        }
    }

    #[inline]
    pub fn done(ts: Timestamp, src: NodeId, cycles: u32) -> Self {
        Envelope {
            kind: MsgKind::Done { cycles },
            ts,
            src,
        }
    }
}

impl fmt::Display for Envelope {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.kind {
            MsgKind::Request => write!(f, "REQUEST({}, {})", self.ts, self.src),
            MsgKind::Reply { dest } => {
                write!(f, "REPLY({}, {} -> {})", self.ts, self.src, dest)
            }
            MsgKind::Release => write!(f, "RELEASE({}, {})", self.ts, self.src),
            MsgKind::Done { cycles } => {
                write!(f, "DONE({}, {}, cycles {})", self.ts, self.src, cycles)
            }
        }
    }
}

/// A single point-to-point send produced by the state machine. Multicasts
/// are expanded into one `Outgoing` per recipient.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct Outgoing {
    pub to: NodeId,
    pub msg: Envelope,
}
