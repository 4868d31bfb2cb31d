//! Per-node Maekawa state machine. Pure: no I/O, no async; handlers return
//! the point-to-point sends they want performed.

use std::fmt;

use crate::protocol::{
    Envelope, LamportClock, MsgKind, NodeId, Outgoing, QuorumTable,
    RequestQueue, Timestamp,
};
use crate::utils::{Bitmap, MaekawaError};

/// Contention state of a node.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum NodeState {
    /// Not contending for the critical section.
    Idle,

    /// REQUEST multicast, waiting for the quorum's replies.
    Requesting,

    /// Holding every quorum member's grant; executing the CS body.
    InCs,

    /// Quota reached; no more requests, but still answering peers.
    Finished,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Result of a state machine step.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Effects {
    /// Point-to-point sends to perform, in order.
    pub sends: Vec<Outgoing>,

    /// Set when this step moved the node into the critical section.
    pub entered_cs: bool,

    /// Set when this step made the node reach its quota.
    pub finished: bool,
}

/// Maekawa mutual exclusion state of one node.
#[derive(Debug, Clone)]
pub struct MaekawaNode {
    /// My node ID.
    id: NodeId,

    /// Total number of nodes.
    population: u8,

    /// My fixed request quorum, including myself.
    quorum: Bitmap,

    /// Number of CS entries after which I stop requesting.
    quota: u32,

    /// Lamport logical clock.
    clock: LamportClock,

    /// Current contention state.
    state: NodeState,

    /// The single `(timestamp, requester)` I currently hold a grant for.
    granted_to: Option<(Timestamp, NodeId)>,

    /// Requests deferred while my grant is held by someone else.
    queue: RequestQueue,

    /// Quorum members whose REPLY is still awaited; meaningful only while
    /// `Requesting`.
    outstanding: Bitmap,

    /// Timestamp of my in-flight request, if any.
    request_ts: Option<Timestamp>,

    /// Number of CS entries completed.
    completed: u32,
}

// MaekawaNode construction & accessors
impl MaekawaNode {
    /// Creates a node in `Idle` state with a zero clock.
    pub fn new(
        id: NodeId,
        table: &QuorumTable,
        quota: u32,
    ) -> Result<Self, MaekawaError> {
        let population = table.population();
        if id >= population {
            return Err(MaekawaError::config(format!(
                "node ID {} out of population {}",
                id, population
            )));
        }
        if quota == 0 {
            return Err(MaekawaError::config("quota must be positive"));
        }

        Ok(MaekawaNode {
            id,
            population,
            quorum: table.quorum_of(id).clone(),
            quota,
            clock: LamportClock::new(),
            state: NodeState::Idle,
            granted_to: None,
            queue: RequestQueue::new(),
            outstanding: Bitmap::new(population, false),
            request_ts: None,
            completed: 0,
        })
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn state(&self) -> NodeState {
        self.state
    }

    #[inline]
    pub fn clock(&self) -> Timestamp {
        self.clock.now()
    }

    #[inline]
    pub fn quorum(&self) -> &Bitmap {
        &self.quorum
    }

    #[inline]
    pub fn granted_to(&self) -> Option<(Timestamp, NodeId)> {
        self.granted_to
    }

    #[inline]
    pub fn pending(&self) -> &RequestQueue {
        &self.queue
    }

    #[inline]
    pub fn outstanding(&self) -> &Bitmap {
        &self.outstanding
    }

    #[inline]
    pub fn request_ts(&self) -> Option<Timestamp> {
        self.request_ts
    }

    #[inline]
    pub fn completed(&self) -> u32 {
        self.completed
    }

    #[inline]
    pub fn quota(&self) -> u32 {
        self.quota
    }

    /// Expands a multicast into one unicast per quorum member.
    fn to_quorum(&self, msg: Envelope) -> Vec<Outgoing> {
        self.quorum.ones().map(|to| Outgoing { to, msg }).collect()
    }

    /// Grants `requester` and produces the REPLY to it.
    fn grant(&mut self, ts: Timestamp, requester: NodeId) -> Outgoing {
        debug_assert!(self.granted_to.is_none());
        self.granted_to = Some((ts, requester));
        let reply_ts = self.clock.tick();
        pf_trace!(self.id; "granted {} (req ts {}), reply ts {}",
                           requester, ts, reply_ts);
        Outgoing {
            to: requester,
            msg: Envelope::reply(reply_ts, self.id, requester),
        }
    }
}

// MaekawaNode requester role
impl MaekawaNode {
    /// Starts contending for the critical section: bumps the clock and
    /// multicasts REQUEST to my quorum (myself included). The caller must
    /// wait until a later step reports `entered_cs`.
    pub fn request_cs(&mut self) -> Result<Effects, MaekawaError> {
        if self.state != NodeState::Idle {
            return Err(MaekawaError::anomaly(format!(
                "request_cs called in state {}",
                self.state
            )));
        }

        let ts = self.clock.tick();
        self.state = NodeState::Requesting;
        self.request_ts = Some(ts);
        self.outstanding = self.quorum.clone();
        pf_debug!(self.id; "requesting CS at ts {} from {:?}", ts, self.quorum);

        Ok(Effects {
            sends: self.to_quorum(Envelope::request(ts, self.id)),
            ..Default::default()
        })
    }

    /// Leaves the critical section: multicasts RELEASE to my quorum and
    /// counts the cycle. On reaching the quota, becomes `Finished` and
    /// announces DONE to every other node.
    pub fn exit_cs(&mut self) -> Result<Effects, MaekawaError> {
        if self.state != NodeState::InCs {
            return Err(MaekawaError::anomaly(format!(
                "exit_cs called in state {}",
                self.state
            )));
        }

        let ts = self.clock.tick();
        let mut sends = self.to_quorum(Envelope::release(ts, self.id));
        self.request_ts = None;
        self.completed += 1;
        self.state = NodeState::Idle;
        pf_debug!(self.id; "released CS at ts {}, cycle {}/{}",
                           ts, self.completed, self.quota);

        let finished = self.completed >= self.quota;
        if finished {
            self.state = NodeState::Finished;
            let done_ts = self.clock.tick();
            let done = Envelope::done(done_ts, self.id, self.completed);
            sends.extend(
                (0..self.population)
                    .filter(|&to| to != self.id)
                    .map(|to| Outgoing { to, msg: done }),
            );
        }

        Ok(Effects {
            sends,
            entered_cs: false,
            finished,
        })
    }
}

// MaekawaNode responder role
impl MaekawaNode {
    /// Dispatches an inbound message. The clock observes the message first;
    /// a protocol anomaly then leaves grant, queue and reply state unchanged.
    pub fn handle_msg(
        &mut self,
        msg: Envelope,
    ) -> Result<Effects, MaekawaError> {
        if msg.src >= self.population {
            return Err(MaekawaError::anomaly(format!(
                "message from unknown node {}: {}",
                msg.src, msg
            )));
        }
        self.clock.observe(msg.ts);

        match msg.kind {
            MsgKind::Request => self.on_request(msg.ts, msg.src),
            MsgKind::Reply { dest } => self.on_reply(msg.src, dest),
            MsgKind::Release => self.on_release(msg.src),
            MsgKind::Done { .. } => Ok(Effects::default()),
        }
    }

    /// Handler of REQUEST: grant immediately if my grant is free, otherwise
    /// defer in priority order.
    fn on_request(
        &mut self,
        ts: Timestamp,
        src: NodeId,
    ) -> Result<Effects, MaekawaError> {
        if self.queue.contains(src)
            || self.granted_to.map(|(_, holder)| holder) == Some(src)
        {
            return Err(MaekawaError::anomaly(format!(
                "duplicate REQUEST from {} ts {} while previous one unserviced",
                src, ts
            )));
        }

        match self.granted_to {
            None => Ok(Effects {
                sends: vec![self.grant(ts, src)],
                ..Default::default()
            }),
            Some(held) => {
                if (ts, src) < held {
                    // no inquire/yield: higher priority request still waits
                    // for the current holder's RELEASE
                    pf_debug!(self.id; "REQUEST ({}, {}) outranks grant {:?}, deferred",
                                       ts, src, held);
                }
                self.queue.enqueue(src, ts)?;
                pf_trace!(self.id; "queued REQUEST ({}, {}), {} pending",
                                   ts, src, self.queue.len());
                Ok(Effects::default())
            }
        }
    }

    /// Handler of REPLY: collect the grant; enter the CS once the whole
    /// quorum has replied.
    fn on_reply(
        &mut self,
        src: NodeId,
        dest: NodeId,
    ) -> Result<Effects, MaekawaError> {
        if dest != self.id {
            return Err(MaekawaError::anomaly(format!(
                "REPLY from {} addressed to {}",
                src, dest
            )));
        }
        if self.state != NodeState::Requesting || !self.outstanding.contains(src)
        {
            return Err(MaekawaError::anomaly(format!(
                "unexpected REPLY from {} in state {}",
                src, self.state
            )));
        }

        self.outstanding.set(src, false)?;
        if !self.outstanding.is_empty() {
            return Ok(Effects::default());
        }

        self.state = NodeState::InCs;
        pf_debug!(self.id; "entered CS with request ts {:?}", self.request_ts);
        Ok(Effects {
            entered_cs: true,
            ..Default::default()
        })
    }

    /// Handler of RELEASE: free my grant and pass it to the next queued
    /// requester, if any.
    fn on_release(&mut self, src: NodeId) -> Result<Effects, MaekawaError> {
        match self.granted_to {
            Some((_, holder)) if holder == src => {}
            _ => {
                return Err(MaekawaError::anomaly(format!(
                    "RELEASE from {} but grant held by {:?}",
                    src, self.granted_to
                )));
            }
        }

        self.granted_to = None;
        let sends = match self.queue.pop_next() {
            Some((ts, next)) => vec![self.grant(ts, next)],
            None => vec![],
        };
        Ok(Effects {
            sends,
            ..Default::default()
        })
    }
}
