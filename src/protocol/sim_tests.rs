//! Deterministic in-memory simulation of a whole cluster of state machines
//! over per-link FIFO queues, driven by seeded random schedules.

use std::collections::{BTreeMap, VecDeque};

use super::*;
use crate::utils::MaekawaError;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Debug, Clone, Copy)]
enum Action {
    Request(NodeId),
    Exit(NodeId),
    Deliver(NodeId, NodeId),
}

#[derive(Debug, PartialEq, Eq)]
enum Outcome {
    Completed,
    Stalled,
}

struct Sim {
    nodes: Vec<MaekawaNode>,
    trackers: Vec<TerminationTracker>,
    links: BTreeMap<(NodeId, NodeId), VecDeque<Envelope>>,
    entries: Vec<NodeId>,
}

impl Sim {
    fn new(
        population: u8,
        scheme: QuorumScheme,
        quota: u32,
    ) -> Result<Self, MaekawaError> {
        let table = QuorumTable::new(population, scheme)?;
        Ok(Sim {
            nodes: (0..population)
                .map(|id| MaekawaNode::new(id, &table, quota))
                .collect::<Result<_, _>>()?,
            trackers: (0..population)
                .map(|_| TerminationTracker::new(population))
                .collect(),
            links: BTreeMap::new(),
            entries: vec![],
        })
    }

    fn push(&mut self, from: NodeId, effects: Effects) {
        for Outgoing { to, msg } in effects.sends {
            assert_eq!(msg.src, from);
            self.links.entry((from, to)).or_default().push_back(msg);
        }
    }

    fn in_cs_count(&self) -> usize {
        self.nodes
            .iter()
            .filter(|n| n.state() == NodeState::InCs)
            .count()
    }

    fn in_flight(&self) -> usize {
        self.links.values().map(|q| q.len()).sum()
    }

    fn enabled(&self) -> Vec<Action> {
        let mut actions = vec![];
        for node in &self.nodes {
            match node.state() {
                NodeState::Idle => actions.push(Action::Request(node.id())),
                NodeState::InCs => actions.push(Action::Exit(node.id())),
                _ => {}
            }
        }
        for (&(from, to), queue) in &self.links {
            if !queue.is_empty() {
                actions.push(Action::Deliver(from, to));
            }
        }
        actions
    }

    fn apply(&mut self, action: Action) -> Result<(), MaekawaError> {
        match action {
            Action::Request(id) => {
                let before = self.nodes[id as usize].clock();
                let effects = self.nodes[id as usize].request_cs()?;
                assert!(self.nodes[id as usize].clock() > before);
                self.push(id, effects);
            }

            Action::Exit(id) => {
                let node = &mut self.nodes[id as usize];
                let before = node.clock();
                let effects = node.exit_cs()?;
                assert!(node.clock() > before);
                if effects.finished {
                    let completed = node.completed();
                    self.trackers[id as usize].report(id, completed)?;
                }
                self.push(id, effects);
            }

            Action::Deliver(from, to) => {
                let msg = match self
                    .links
                    .get_mut(&(from, to))
                    .and_then(|q| q.pop_front())
                {
                    Some(msg) => msg,
                    None => return Err(MaekawaError::msg("empty link")),
                };
                let node = &mut self.nodes[to as usize];
                let before = node.clock();
                let next_in_line = node.pending().peek().copied();

                let effects = node.handle_msg(msg)?;
                assert!(node.clock() > before);
                assert!(node.clock() > msg.ts);

                match msg.kind {
                    MsgKind::Release => {
                        // grant passes to the head of the queue, or nobody
                        assert_eq!(node.granted_to(), next_in_line);
                    }
                    MsgKind::Done { cycles } => {
                        self.trackers[to as usize].report(from, cycles)?;
                    }
                    _ => {}
                }
                if effects.entered_cs {
                    self.entries.push(to);
                }
                self.push(to, effects);
            }
        }

        // mutual exclusion must hold after every single step
        assert!(self.in_cs_count() <= 1, "safety violated: {:?}", action);
        Ok(())
    }

    /// Final-state checks; returns whether the run completed or stalled in a
    /// cyclic wait.
    fn conclude(&self, quota: u32) -> Outcome {
        assert_eq!(self.in_flight(), 0);
        let population = self.nodes.len();

        if self.nodes.iter().all(|n| n.state() == NodeState::Finished) {
            assert_eq!(self.entries.len(), population * quota as usize);
            for (node, tracker) in self.nodes.iter().zip(&self.trackers) {
                assert_eq!(node.completed(), quota);
                assert_eq!(node.granted_to(), None);
                assert!(node.pending().is_empty());
                assert!(tracker.all_done());
                assert_eq!(
                    tracker.total_entries(),
                    (population as u64) * (quota as u64)
                );
            }
            return Outcome::Completed;
        }

        // otherwise every unfinished node must be waiting on a grant that is
        // held by another waiting node
        for node in &self.nodes {
            if node.state() == NodeState::Finished {
                continue;
            }
            assert_eq!(node.state(), NodeState::Requesting);
            assert!(!node.outstanding().is_empty());
            for member in node.outstanding().ones() {
                let holder = self.nodes[member as usize].granted_to();
                match holder {
                    Some((_, h)) => {
                        assert_ne!(h, node.id());
                        assert_eq!(
                            self.nodes[h as usize].state(),
                            NodeState::Requesting
                        );
                    }
                    None => panic!("{} waits on free member {}", node.id(), member),
                }
            }
        }
        Outcome::Stalled
    }
}

fn run_random(
    population: u8,
    scheme: QuorumScheme,
    quota: u32,
    seed: u64,
) -> Result<Outcome, MaekawaError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut sim = Sim::new(population, scheme, quota)?;
    loop {
        let actions = sim.enabled();
        if actions.is_empty() {
            break;
        }
        let action = actions[rng.gen_range(0..actions.len())];
        sim.apply(action)?;
    }
    Ok(sim.conclude(quota))
}

#[test]
fn random_interleavings_are_safe() -> Result<(), MaekawaError> {
    for (population, scheme) in [
        (2, QuorumScheme::Grid),
        (3, QuorumScheme::Majority),
        (4, QuorumScheme::Grid),
        (5, QuorumScheme::Grid),
        (7, QuorumScheme::Majority),
        (9, QuorumScheme::Grid),
    ] {
        for seed in 0..60 {
            run_random(population, scheme, 3, seed)?;
        }
    }
    Ok(())
}

#[test]
fn one_contender_at_a_time_completes() -> Result<(), MaekawaError> {
    for population in [1, 3, 4, 6, 10] {
        let quota = 4;
        let mut rng = StdRng::seed_from_u64(population as u64);
        let mut sim = Sim::new(population, QuorumScheme::Grid, quota)?;
        loop {
            let actions = sim.enabled();
            let exit = actions.iter().find(|a| matches!(a, Action::Exit(_)));
            let delivers: Vec<Action> = actions
                .iter()
                .filter(|a| matches!(a, Action::Deliver(..)))
                .copied()
                .collect();
            let contending = sim
                .nodes
                .iter()
                .any(|n| n.state() == NodeState::Requesting);

            let action = if let Some(&exit) = exit {
                exit
            } else if !delivers.is_empty() {
                delivers[rng.gen_range(0..delivers.len())]
            } else if !contending && !actions.is_empty() {
                actions[rng.gen_range(0..actions.len())]
            } else {
                break;
            };
            sim.apply(action)?;
        }
        assert_eq!(sim.conclude(quota), Outcome::Completed);
        assert_eq!(sim.entries.len(), population as usize * quota as usize);
    }
    Ok(())
}

#[test]
fn four_nodes_enter_in_timestamp_order() -> Result<(), MaekawaError> {
    let mut sim = Sim::new(4, QuorumScheme::Grid, 1)?;
    for id in 0..4 {
        sim.apply(Action::Request(id))?;
    }
    // every request carries ts 1, so priority falls back to node ID
    for node in &sim.nodes {
        assert_eq!(node.request_ts(), Some(1));
    }

    // always exit right away; otherwise deliver on the lowest-numbered link
    loop {
        let actions = sim.enabled();
        let next = actions
            .iter()
            .find(|a| matches!(a, Action::Exit(_)))
            .or_else(|| actions.iter().find(|a| matches!(a, Action::Deliver(..))))
            .copied();
        match next {
            Some(action) => sim.apply(action)?,
            None => break,
        }
    }

    assert_eq!(sim.conclude(1), Outcome::Completed);
    assert_eq!(sim.entries, vec![0, 1, 2, 3]);
    for node in &sim.nodes {
        assert_eq!(node.completed(), 1);
    }
    Ok(())
}

#[test]
fn crossed_grants_stall_without_preemption() -> Result<(), MaekawaError> {
    // 0 and 1 share members 0 and 1; let member 0 grant 1 first and member 1
    // grant 0 first, which no RELEASE can ever untangle
    let mut sim = Sim::new(4, QuorumScheme::Grid, 1)?;
    sim.apply(Action::Request(0))?;
    sim.apply(Action::Request(1))?;
    sim.apply(Action::Deliver(1, 0))?;
    sim.apply(Action::Deliver(0, 1))?;
    sim.apply(Action::Deliver(0, 0))?;
    sim.apply(Action::Deliver(1, 1))?;
    assert_eq!(sim.nodes[0].granted_to(), Some((1, 1)));
    assert_eq!(sim.nodes[1].granted_to(), Some((1, 0)));

    // let everything else drain; 2 and 3 never request
    loop {
        let delivers: Vec<Action> = sim
            .enabled()
            .into_iter()
            .filter(|a| matches!(a, Action::Deliver(..)))
            .collect();
        match delivers.first() {
            Some(&action) => sim.apply(action)?,
            None => break,
        }
    }
    assert_eq!(sim.in_cs_count(), 0);
    assert_eq!(sim.nodes[0].state(), NodeState::Requesting);
    assert_eq!(sim.nodes[1].state(), NodeState::Requesting);
    assert!(sim.nodes[0].outstanding().contains(0));
    assert!(sim.nodes[1].outstanding().contains(1));
    Ok(())
}
