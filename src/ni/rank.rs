//! Logical rank table.
//!
//! Maps every rank of a logical NI to its node, process and address, and
//! records which rank is the elected main on each node. Loadable from a
//! TOML file or built programmatically.

use std::io::prelude::*;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::PeerAddr;

/// Rank map loading/validation error type.
#[derive(Debug, Error)]
pub enum RankMapError {
    /// The map file could not be read.
    #[error("I/O error reading rank map")]
    Io(#[from] std::io::Error),

    /// The map file is not valid TOML of the expected shape.
    #[error("malformed rank map")]
    Parse(#[from] toml::de::Error),

    /// The map contents are inconsistent.
    #[error("invalid rank map: {0}")]
    Invalid(&'static str),
}

/// One rank's entry in the table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankEntry {
    pub rank: u32,
    /// The elected main rank on this entry's node.
    pub main_rank: u32,
    /// Node id.
    pub nid: u32,
    /// Process id.
    pub pid: u32,
    /// Node address of this rank's process.
    pub addr: PeerAddr,
}

/// The full rank table of a logical NI.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RankMap {
    peers: Vec<RankEntry>,
}

impl RankMap {
    /// Build a map from entries. Entries are sorted by rank and validated.
    pub fn new(mut peers: Vec<RankEntry>) -> Result<Self, RankMapError> {
        peers.sort_by_key(|e| e.rank);
        let map = RankMap { peers };
        map.validate()?;
        Ok(map)
    }

    /// Load a map from a TOML file of `[[peers]]` entries.
    pub fn load_toml(path: impl AsRef<Path>) -> Result<Self, RankMapError> {
        let mut file = std::fs::File::open(path)?;
        let mut toml_str = String::new();
        file.read_to_string(&mut toml_str)?;

        let mut map: RankMap = toml::from_str(&toml_str)?;
        map.peers.sort_by_key(|e| e.rank);
        map.validate()?;
        Ok(map)
    }

    fn validate(&self) -> Result<(), RankMapError> {
        if self.peers.is_empty() {
            return Err(RankMapError::Invalid("no peers"));
        }
        for (i, entry) in self.peers.iter().enumerate() {
            if entry.rank != i as u32 {
                return Err(RankMapError::Invalid("ranks are not dense from 0"));
            }
        }
        for entry in &self.peers {
            let main = self
                .get(entry.main_rank)
                .ok_or(RankMapError::Invalid("main rank out of range"))?;
            if main.nid != entry.nid {
                return Err(RankMapError::Invalid("main rank on a different node"));
            }
            if main.main_rank != main.rank {
                return Err(RankMapError::Invalid("main rank is not its own main"));
            }
        }
        Ok(())
    }

    /// Number of ranks.
    #[inline]
    pub fn size(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn get(&self, rank: u32) -> Option<&RankEntry> {
        self.peers.get(rank as usize)
    }

    pub fn entries(&self) -> &[RankEntry] {
        &self.peers
    }

    /// Ranks sharing a node with `rank`, including itself.
    pub fn node_ranks(&self, rank: u32) -> Vec<u32> {
        match self.get(rank) {
            Some(entry) => self
                .peers
                .iter()
                .filter(|e| e.nid == entry.nid)
                .map(|e| e.rank)
                .collect(),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn entry(rank: u32, main_rank: u32, nid: u32) -> RankEntry {
        RankEntry {
            rank,
            main_rank,
            nid,
            pid: 100 + rank,
            addr: PeerAddr::new(Ipv4Addr::new(10, 77, 0, nid as u8 + 1), 7710),
        }
    }

    #[test]
    fn two_nodes_two_ranks_each() {
        let map = RankMap::new(vec![
            entry(1, 0, 0),
            entry(0, 0, 0),
            entry(2, 2, 1),
            entry(3, 2, 1),
        ])
        .unwrap();
        assert_eq!(map.size(), 4);
        assert_eq!(map.get(1).unwrap().main_rank, 0);
        assert_eq!(map.node_ranks(3), vec![2, 3]);
    }

    #[test]
    fn sparse_ranks_rejected() {
        let err = RankMap::new(vec![entry(0, 0, 0), entry(2, 2, 1)]).unwrap_err();
        assert!(matches!(err, RankMapError::Invalid(_)));
    }

    #[test]
    fn cross_node_main_rejected() {
        let err = RankMap::new(vec![entry(0, 0, 0), entry(1, 0, 1)]).unwrap_err();
        assert!(matches!(err, RankMapError::Invalid(_)));
    }

    #[test]
    fn parses_toml() {
        let toml_str = r#"
            [[peers]]
            rank = 0
            main_rank = 0
            nid = 0
            pid = 100
            addr = "10.77.0.1:7710"

            [[peers]]
            rank = 1
            main_rank = 0
            nid = 0
            pid = 101
            addr = "10.77.0.1:7710"
        "#;
        let map: RankMap = toml::from_str(toml_str).unwrap();
        map.validate().unwrap();
        assert_eq!(map.size(), 2);
    }
}
