//! Transport interface discovery.

use std::io::Error as IoError;
use std::sync::Arc;

use regex::Regex;
use thiserror::Error;

use super::{Interface, PeerAddr, TransportProvider};

/// Metadata of a discoverable transport interface.
#[derive(Debug, Clone)]
pub struct IfaceInfo {
    /// Interface name, e.g. `sim0`.
    pub name: String,
    /// Node address the interface is reachable at.
    pub addr: PeerAddr,
    /// Provider-local ordinal.
    pub index: u32,
}

/// Interface probe error type.
#[derive(Debug, Error)]
pub enum IfaceProbeError {
    /// The provider failed to open the interface.
    #[error("I/O error from transport provider")]
    IoError(#[from] IoError),

    /// No eligible interface found.
    #[error("no eligible transport interface found")]
    NotFound,
}

/// Transport interface finder.
///
/// Filters the interfaces enumerated by a [`TransportProvider`] and opens
/// the first (or `n`-th) eligible one.
pub struct IfaceFinder {
    /// Interface name filters (match any).
    names: Vec<Regex>,
}

impl IfaceFinder {
    /// Create a finder that matches any interface.
    pub fn new() -> Self {
        Self { names: Vec::new() }
    }

    /// Set an interface name filter.
    /// Permit only interfaces whose name matches *any* of the filters.
    ///
    /// Regular expressions are supported.
    #[inline]
    pub fn name(mut self, pattern: impl AsRef<str>) -> Self {
        self.names
            .push(Regex::new(pattern.as_ref()).expect("invalid regex pattern"));
        self
    }

    fn is_eligible(&self, info: &IfaceInfo) -> bool {
        self.names.is_empty() || self.names.iter().any(|re| re.is_match(&info.name))
    }

    /// Open the first eligible interface.
    #[inline]
    pub fn probe(
        self,
        provider: &dyn TransportProvider,
    ) -> Result<Arc<dyn Interface>, IfaceProbeError> {
        self.probe_nth(provider, 0)
    }

    /// Open the `n`-th eligible interface, counting from 0.
    pub fn probe_nth(
        self,
        provider: &dyn TransportProvider,
        mut n: usize,
    ) -> Result<Arc<dyn Interface>, IfaceProbeError> {
        for info in provider.list() {
            if self.is_eligible(&info) {
                if n == 0 {
                    return Ok(provider.open(&info)?);
                }
                n -= 1;
            }
        }
        Err(IfaceProbeError::NotFound)
    }
}

impl Default for IfaceFinder {
    #[inline]
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::sim::SimNet;

    #[test]
    fn name_filter_selects_interface() {
        let net = SimNet::new();
        net.add_iface("sim0");
        net.add_iface("sim1");

        let iface = IfaceFinder::new().name("sim1").probe(&*net).unwrap();
        assert_eq!(iface.name(), "sim1");
    }

    #[test]
    fn no_match_is_not_found() {
        let net = SimNet::new();
        net.add_iface("sim0");
        let err = IfaceFinder::new().name("^mlx").probe(&*net).err().unwrap();
        assert!(matches!(err, IfaceProbeError::NotFound));
    }
}
