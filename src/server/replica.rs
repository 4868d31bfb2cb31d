//! Maekawa replica: owns one node's state machine and drives it from peer
//! messages, handle commands, and the termination signal.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::net::SocketAddr;

use crate::protocol::{
    Effects, Envelope, MaekawaNode, MsgKind, NodeId, Outgoing, QuorumScheme,
    QuorumTable, TerminationTracker, Timestamp,
};
use crate::server::handle::{HandleCmd, MutexHandle};
use crate::server::transport::{PeerEvent, TransportHub};
use crate::utils::{Bitmap, MaekawaError};

use serde::Deserialize;

use tokio::sync::{mpsc, oneshot, watch};

/// Configuration parameters struct.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ReplicaConfigMaekawa {
    /// Number of CS entries each node performs before finishing.
    pub quota: u32,

    /// Name of the quorum construction scheme (`grid` or `majority`).
    pub quorum_scheme: String,

    /// Lower bound of the random think time before each request, in millisecs.
    pub think_min_ms: u64,

    /// Upper bound of the random think time before each request, in millisecs.
    pub think_max_ms: u64,

    /// Time spent inside the critical section, in millisecs.
    pub hold_ms: u64,

    /// Explicit request quorum of every node, indexed by node ID. Overrides
    /// `quorum_scheme` when non-empty.
    pub quorums: Vec<Vec<NodeId>>,

    /// Capacity of each per-peer send channel.
    pub chan_send_cap: usize,

    /// Capacity of the shared recv channel.
    pub chan_recv_cap: usize,
}

#[allow(clippy::derivable_impls)]
impl Default for ReplicaConfigMaekawa {
    fn default() -> Self {
        ReplicaConfigMaekawa {
            quota: 3,
            quorum_scheme: "grid".into(),
            think_min_ms: 2000,
            think_max_ms: 8000,
            hold_ms: 1000,
            quorums: vec![],
            chan_send_cap: 1000,
            chan_recv_cap: 1000,
        }
    }
}

impl ReplicaConfigMaekawa {
    /// Parses config from an optional TOML string over the defaults and
    /// validates it.
    pub fn parse(config_str: Option<&str>) -> Result<Self, MaekawaError> {
        let config = parsed_config!(config_str => ReplicaConfigMaekawa;
                                    quota, quorum_scheme,
                                    think_min_ms, think_max_ms, hold_ms,
                                    quorums, chan_send_cap, chan_recv_cap)?;
        config.scheme()?;
        Ok(config)
    }

    /// Validates field values, returning the parsed quorum scheme.
    pub fn scheme(&self) -> Result<QuorumScheme, MaekawaError> {
        if self.quota == 0 {
            return Err(MaekawaError::config("invalid quota 0"));
        }
        if self.think_min_ms > self.think_max_ms {
            return Err(MaekawaError::config(format!(
                "think_min_ms {} > think_max_ms {}",
                self.think_min_ms, self.think_max_ms
            )));
        }
        if self.chan_send_cap == 0 || self.chan_recv_cap == 0 {
            return Err(MaekawaError::config(format!(
                "invalid channel capacities {} / {}",
                self.chan_send_cap, self.chan_recv_cap
            )));
        }
        QuorumScheme::parse_name(&self.quorum_scheme).ok_or_else(|| {
            MaekawaError::config(format!(
                "quorum scheme '{}' unrecognized",
                self.quorum_scheme
            ))
        })
    }

    /// Builds the validated quorum table for `population` nodes, from the
    /// explicit `quorums` if given, else from the configured scheme.
    pub fn quorum_table(
        &self,
        population: u8,
    ) -> Result<QuorumTable, MaekawaError> {
        let scheme = self.scheme()?;
        if self.quorums.is_empty() {
            QuorumTable::new(population, scheme)
        } else {
            QuorumTable::from_quorums(population, self.quorums.clone())
        }
    }
}

/// Outcome of a replica's run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// The node's ID.
    pub id: NodeId,

    /// CS entries this node completed.
    pub completed: u32,

    /// Sum of CS entries reported by all finished nodes.
    pub total_entries: u64,

    /// Lamport clock value when the loop returned.
    pub final_clock: Timestamp,

    /// True if every node reported completion; false if the loop was
    /// interrupted by the termination signal.
    pub all_done: bool,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "node {} completed {} cycles, {} entries system-wide, clock {}{}",
            self.id,
            self.completed,
            self.total_entries,
            self.final_clock,
            if self.all_done { "" } else { " (interrupted)" }
        )
    }
}

/// Maekawa mutual exclusion server replica module.
pub struct MaekawaReplica {
    /// My node ID.
    id: NodeId,

    /// Total number of nodes.
    population: u8,

    /// Configuration parameters struct.
    config: ReplicaConfigMaekawa,

    /// Protocol state machine.
    node: MaekawaNode,

    /// Whole-system completion tracker.
    tracker: TerminationTracker,

    /// TransportHub module.
    transport_hub: TransportHub<Envelope>,

    /// Receiver side of the handle command channel.
    rx_cmd: mpsc::Receiver<HandleCmd>,

    /// Set once every `MutexHandle` has been dropped.
    cmd_closed: bool,

    /// Messages I addressed to myself, delivered before the next event.
    loopback: VecDeque<Envelope>,

    /// Pending `acquire()` caller, answered on CS entry.
    acquire_waiter: Option<oneshot::Sender<Result<(), MaekawaError>>>,
}

// MaekawaReplica setup & public API
impl MaekawaReplica {
    /// Parses config, builds the quorum table and state machine, and
    /// connects to every peer. `peer_addrs` maps each node ID in
    /// `0..population` (myself included) to its peer-facing address; the
    /// population is its length. Returns the replica together with the
    /// handle that drives it.
    pub async fn new_and_setup(
        id: NodeId,
        p2p_addr: SocketAddr,
        peer_addrs: HashMap<NodeId, SocketAddr>,
        config_str: Option<&str>,
    ) -> Result<(Self, MutexHandle), MaekawaError> {
        let config = ReplicaConfigMaekawa::parse(config_str)?;

        if peer_addrs.is_empty() || peer_addrs.len() > u8::MAX as usize {
            return Err(MaekawaError::config(format!(
                "invalid number of nodes {}",
                peer_addrs.len()
            )));
        }
        let population = peer_addrs.len() as u8;
        if (0..population).any(|n| !peer_addrs.contains_key(&n)) {
            return Err(MaekawaError::config(format!(
                "peer IDs {:?} not dense in 0..{}",
                peer_addrs.keys().collect::<Vec<_>>(),
                population
            )));
        }

        let table = config.quorum_table(population)?;
        let node = MaekawaNode::new(id, &table, config.quota)?;
        if config.quorums.is_empty() {
            pf_info!(id; "quorum {:?} ({} scheme, population {})",
                         node.quorum(), config.quorum_scheme, population);
        } else {
            pf_info!(id; "quorum {:?} (explicit table, population {})",
                         node.quorum(), population);
        }

        // setup transport hub module, then connect the whole group
        let mut transport_hub = TransportHub::new_and_setup(
            id,
            population,
            p2p_addr,
            config.chan_send_cap,
            config.chan_recv_cap,
        )
        .await?;
        let peers = transport_hub.group_connect(&peer_addrs).await?;
        debug_assert_eq!(peers.len(), transport_hub.num_connected());

        let (tx_cmd, rx_cmd) = mpsc::channel(16);
        let replica = MaekawaReplica {
            id,
            population,
            config,
            node,
            tracker: TerminationTracker::new(population),
            transport_hub,
            rx_cmd,
            cmd_closed: false,
            loopback: VecDeque::new(),
            acquire_waiter: None,
        };
        Ok((replica, MutexHandle::new(id, tx_cmd)))
    }

    #[inline]
    pub fn id(&self) -> NodeId {
        self.id
    }

    #[inline]
    pub fn population(&self) -> u8 {
        self.population
    }

    #[inline]
    pub fn config(&self) -> &ReplicaConfigMaekawa {
        &self.config
    }

    /// Main event loop. Returns once every node has reported completion, or
    /// early when the termination signal fires. A broken link to a peer that
    /// has not announced completion is fatal.
    pub async fn run(
        &mut self,
        mut rx_term: watch::Receiver<bool>,
    ) -> Result<RunSummary, MaekawaError> {
        loop {
            // self-addressed messages go first, in send order
            while let Some(msg) = self.loopback.pop_front() {
                let res = self.handle_msg_recv(self.id, msg).await;
                self.absorb(res)?;
            }

            if self.tracker.all_done() {
                pf_info!(self.id; "all {} nodes done, {} entries total",
                                  self.population, self.tracker.total_entries());
                // peers may still be waiting on my DONE
                self.transport_hub.shutdown().await;
                return Ok(self.summary());
            }

            tokio::select! {
                // command from the mutex handle
                cmd = self.rx_cmd.recv(), if !self.cmd_closed => {
                    match cmd {
                        Some(cmd) => {
                            let res = self.handle_cmd(cmd).await;
                            self.absorb(res)?;
                        }
                        None => {
                            pf_debug!(self.id; "all handles dropped");
                            self.cmd_closed = true;
                        }
                    }
                },

                // message from peer
                event = self.transport_hub.recv_msg() => {
                    match event? {
                        (peer, PeerEvent::Recv(msg)) => {
                            let res = self.handle_msg_recv(peer, msg).await;
                            self.absorb(res)?;
                        }
                        (peer, PeerEvent::Broken(e)) => {
                            if self.tracker.is_done(peer) {
                                pf_debug!(self.id; "link to finished peer {} closed", peer);
                            } else {
                                pf_error!(self.id; "link to peer {} broken: {}", peer, e);
                                return Err(e);
                            }
                        }
                    }
                },

                // receiving termination signal
                _ = rx_term.changed() => {
                    pf_warn!(self.id; "replica caught termination signal");
                    return Ok(self.summary());
                }
            }
        }
    }
}

// MaekawaReplica event handlers
impl MaekawaReplica {
    /// Anomalies are logged and the offending input dropped; anything else
    /// stops the loop.
    fn absorb(&self, res: Result<(), MaekawaError>) -> Result<(), MaekawaError> {
        match res {
            Err(e) if e.is_anomaly() => {
                pf_warn!(self.id; "{}", e);
                Ok(())
            }
            res => res,
        }
    }

    fn summary(&self) -> RunSummary {
        RunSummary {
            id: self.id,
            completed: self.node.completed(),
            total_entries: self.tracker.total_entries(),
            final_clock: self.node.clock(),
            all_done: self.tracker.all_done(),
        }
    }

    /// Handler of a message from a peer (or from myself via loopback).
    async fn handle_msg_recv(
        &mut self,
        peer: NodeId,
        msg: Envelope,
    ) -> Result<(), MaekawaError> {
        if msg.src != peer {
            return Err(MaekawaError::anomaly(format!(
                "{} arrived on link from {}",
                msg, peer
            )));
        }

        let effects = self.node.handle_msg(msg)?;
        match msg.kind {
            MsgKind::Done { cycles } => {
                pf_debug!(self.id; "peer {} done after {} cycles", peer, cycles);
                self.tracker.report(peer, cycles)?;
            }
            MsgKind::Request | MsgKind::Reply { .. } | MsgKind::Release => {}
        }
        self.apply_effects(effects).await
    }

    /// Handler of a command from the mutex handle.
    async fn handle_cmd(&mut self, cmd: HandleCmd) -> Result<(), MaekawaError> {
        match cmd {
            HandleCmd::Acquire { tx_done } => match self.node.request_cs() {
                Ok(effects) => {
                    self.acquire_waiter = Some(tx_done);
                    self.apply_effects(effects).await
                }
                Err(e) => {
                    pf_warn!(self.id; "acquire rejected: {}", e);
                    let _ = tx_done.send(Err(e));
                    Ok(())
                }
            },

            HandleCmd::Release { tx_done } => match self.node.exit_cs() {
                Ok(effects) => {
                    pf_info!(self.id; "left critical section ({}/{})",
                                      self.node.completed(), self.node.quota());
                    let res = self.apply_effects(effects).await;
                    let _ = tx_done.send(res.clone());
                    res
                }
                Err(e) => {
                    pf_warn!(self.id; "release rejected: {}", e);
                    let _ = tx_done.send(Err(e));
                    Ok(())
                }
            },
        }
    }

    /// Performs the sends a state machine step asked for and reacts to its
    /// CS entry or completion. Consecutive sends of the same envelope are
    /// one multicast.
    async fn apply_effects(&mut self, effects: Effects) -> Result<(), MaekawaError> {
        let mut sends = effects.sends.into_iter().peekable();
        while let Some(Outgoing { to, msg }) = sends.next() {
            let mut targets = Bitmap::new(self.population, false);
            targets.set(to, true)?;
            while let Some(next) = sends.next_if(|o| o.msg == msg) {
                targets.set(next.to, true)?;
            }

            if targets.contains(self.id) {
                self.loopback.push_back(msg);
            }
            self.transport_hub.bcast_msg(msg, &targets).await?;
        }

        if effects.entered_cs {
            pf_info!(self.id; "in critical section");
            match self.acquire_waiter.take() {
                Some(tx_done) => {
                    let _ = tx_done.send(Ok(()));
                }
                None => pf_warn!(self.id; "entered CS with no acquire waiter"),
            }
        }

        if effects.finished {
            pf_info!(self.id; "finished all {} cycles", self.node.completed());
            self.tracker.report(self.id, self.node.completed())?;
        }
        Ok(())
    }
}
