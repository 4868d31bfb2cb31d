//! Static request quorum table.

use std::fmt;

use crate::protocol::NodeId;
use crate::utils::{Bitmap, MaekawaError};

/// Supported quorum construction schemes.
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub enum QuorumScheme {
    /// Row-plus-column quorums over a `ceil(sqrt(N))`-wide grid; quorum size
    /// is O(sqrt(N)).
    Grid,

    /// Each node plus the next `floor(N/2)` nodes in ring order.
    Majority,
}

impl QuorumScheme {
    /// Parse config string into `QuorumScheme` enum.
    pub fn parse_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "grid" => Some(Self::Grid),
            "majority" => Some(Self::Majority),
            _ => None,
        }
    }
}

impl fmt::Display for QuorumScheme {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Immutable mapping from node ID to its request quorum.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuorumTable {
    population: u8,
    quorums: Vec<Bitmap>,
}

impl QuorumTable {
    /// Builds the quorum table of given scheme for `population` nodes and
    /// validates it.
    pub fn new(
        population: u8,
        scheme: QuorumScheme,
    ) -> Result<Self, MaekawaError> {
        if population == 0 {
            return Err(MaekawaError::config("population must be positive"));
        }
        let quorums = match scheme {
            QuorumScheme::Grid => Self::grid_quorums(population),
            QuorumScheme::Majority => Self::majority_quorums(population),
        };
        let table = QuorumTable {
            population,
            quorums,
        };
        table.validate()?;
        Ok(table)
    }

    /// Builds a quorum table from explicit member lists, one per node in ID
    /// order, and validates it.
    pub fn from_quorums(
        population: u8,
        members: Vec<Vec<NodeId>>,
    ) -> Result<Self, MaekawaError> {
        if population == 0 {
            return Err(MaekawaError::config("population must be positive"));
        }
        if members.len() != population as usize {
            return Err(MaekawaError::config(format!(
                "expected {} quorums, got {}",
                population,
                members.len()
            )));
        }

        let mut quorums = Vec::with_capacity(members.len());
        for (owner, ids) in members.into_iter().enumerate() {
            let mut quorum = Bitmap::new(population, false);
            for id in ids {
                if id >= population {
                    return Err(MaekawaError::config(format!(
                        "quorum of {} names unknown node {}",
                        owner, id
                    )));
                }
                quorum.set(id, true)?;
            }
            quorums.push(quorum);
        }

        let table = QuorumTable {
            population,
            quorums,
        };
        table.validate()?;
        Ok(table)
    }

    fn grid_quorums(population: u8) -> Vec<Bitmap> {
        let n = population as usize;
        let mut width = 1;
        while width * width < n {
            width += 1;
        }

        (0..n)
            .map(|i| {
                let (row, col) = (i / width, i % width);
                let ids = (0..n)
                    .filter(|j| j / width == row || j % width == col)
                    .map(|j| j as NodeId)
                    .collect();
                Bitmap::from(population, ids)
            })
            .collect()
    }

    fn majority_quorums(population: u8) -> Vec<Bitmap> {
        let n = population as usize;
        (0..n)
            .map(|i| {
                let ids =
                    (0..=(n / 2)).map(|d| ((i + d) % n) as NodeId).collect();
                Bitmap::from(population, ids)
            })
            .collect()
    }

    /// Checks the configuration-time invariants: every quorum is non-empty
    /// and contains its owner, and every pair of quorums intersects.
    pub fn validate(&self) -> Result<(), MaekawaError> {
        if self.quorums.len() != self.population as usize {
            return Err(MaekawaError::config(format!(
                "quorum table has {} entries for population {}",
                self.quorums.len(),
                self.population
            )));
        }

        for (i, quorum) in self.quorums.iter().enumerate() {
            if quorum.size() != self.population {
                return Err(MaekawaError::config(format!(
                    "quorum of {} sized for {} nodes",
                    i,
                    quorum.size()
                )));
            }
            if quorum.is_empty() {
                return Err(MaekawaError::config(format!(
                    "quorum of {} is empty",
                    i
                )));
            }
            if !quorum.contains(i as NodeId) {
                return Err(MaekawaError::config(format!(
                    "quorum of {} does not include itself",
                    i
                )));
            }
        }

        for i in 0..self.quorums.len() {
            for j in (i + 1)..self.quorums.len() {
                if !self.quorums[i].intersects(&self.quorums[j]) {
                    return Err(MaekawaError::config(format!(
                        "quorums of {} {:?} and {} {:?} do not intersect",
                        i, self.quorums[i], j, self.quorums[j]
                    )));
                }
            }
        }

        Ok(())
    }

    /// Total number of nodes.
    #[inline]
    pub fn population(&self) -> u8 {
        self.population
    }

    /// Fixed quorum of given node. `node` must be below population.
    #[inline]
    pub fn quorum_of(&self, node: NodeId) -> &Bitmap {
        debug_assert!(node < self.population);
        &self.quorums[node as usize]
    }
}
